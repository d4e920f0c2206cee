pub mod fmt;
pub use fmt::*;

mod impls;

pub mod name;
pub use name::*;

use derive_more::From;
use std::collections::BTreeMap;

/* --------------------------------- Labels --------------------------------- */

/// A record field accessor, either positional or named.
#[derive(From, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Field {
    Name(String),
    Idx(usize),
}

/// A record of labeled items, either a positional tuple or a named row.
/// Named rows iterate in label order, so traversal is deterministic.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum Record<T> {
    Tup(Vec<T>),
    Named(BTreeMap<String, T>),
}

/* -------------------------------- Literals -------------------------------- */

/// Scalar literals. `Real` carries an `f64`, so literals are `PartialEq`
/// but deliberately not `Eq`.
#[derive(From, Copy, Clone, Debug, PartialEq)]
pub enum Literal {
    Int(i64),
    Real(f64),
    Bool(bool),
    Char(char),
}

/// The base types scalar values inhabit.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum BaseTy {
    Int,
    Real,
    Bool,
    Char,
}

impl Literal {
    pub fn base_ty(&self) -> BaseTy {
        match self {
            | Literal::Int(_) => BaseTy::Int,
            | Literal::Real(_) => BaseTy::Real,
            | Literal::Bool(_) => BaseTy::Bool,
            | Literal::Char(_) => BaseTy::Char,
        }
    }
}

/* ------------------------------- Directions ------------------------------- */

/// Iteration direction of a `for` loop.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum Direction {
    Fwd,
    Rev,
}

impl Direction {
    pub fn flipped(self) -> Self {
        match self {
            | Direction::Fwd => Direction::Rev,
            | Direction::Rev => Direction::Fwd,
        }
    }
}
