use crate::*;
use tabula_utils::prelude::*;

impl<T> Record<T> {
    pub fn len(&self) -> usize {
        match self {
            | Record::Tup(items) => items.len(),
            | Record::Named(items) => items.len(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, field: &Field) -> Option<&T> {
        match (self, field) {
            | (Record::Tup(items), Field::Idx(i)) => items.get(*i),
            | (Record::Named(items), Field::Name(l)) => items.get(l),
            | _ => None,
        }
    }

    /// Iterate items with their fields, positional or named, in label order.
    pub fn iter(&self) -> Box<dyn Iterator<Item = (Field, &T)> + '_> {
        match self {
            | Record::Tup(items) => {
                Box::new(items.iter().enumerate().map(|(i, t)| (Field::Idx(i), t)))
            }
            | Record::Named(items) => {
                Box::new(items.iter().map(|(l, t)| (Field::Name(l.clone()), t)))
            }
        }
    }

    pub fn map<B>(&self, mut f: impl FnMut(&T) -> B) -> Record<B> {
        match self {
            | Record::Tup(items) => Record::Tup(items.iter().map(&mut f).collect()),
            | Record::Named(items) => {
                Record::Named(items.iter().map(|(l, t)| (l.clone(), f(t))).collect())
            }
        }
    }

    pub fn try_map<B, E>(
        &self, mut f: impl FnMut(&T) -> std::result::Result<B, E>,
    ) -> std::result::Result<Record<B>, E> {
        match self {
            | Record::Tup(items) => {
                Ok(Record::Tup(items.iter().map(&mut f).collect::<std::result::Result<_, E>>()?))
            }
            | Record::Named(items) => Ok(Record::Named(
                items
                    .iter()
                    .map(|(l, t)| Ok((l.clone(), f(t)?)))
                    .collect::<std::result::Result<_, E>>()?,
            )),
        }
    }

    /// Zip two records field by field. Shape mismatch is a compiler bug.
    pub fn zip_with<S, B>(
        &self, other: &Record<S>, mut f: impl FnMut(&T, &S) -> Result<B>,
    ) -> Result<Record<B>> {
        match (self, other) {
            | (Record::Tup(xs), Record::Tup(ys)) if xs.len() == ys.len() => {
                Ok(Record::Tup(xs.iter().zip(ys).map(|(x, y)| f(x, y)).collect::<Result<_>>()?))
            }
            | (Record::Named(xs), Record::Named(ys))
                if xs.len() == ys.len() && xs.keys().eq(ys.keys()) =>
            {
                Ok(Record::Named(
                    xs.iter()
                        .map(|(l, x)| Ok((l.clone(), f(x, &ys[l])?)))
                        .collect::<Result<_>>()?,
                ))
            }
            | _ => Err(Error::compiler("record shape mismatch in zip")),
        }
    }
}

mod fmt_impls {
    use super::*;
    use std::fmt::{self, Display};

    impl Display for Field {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                | Field::Name(s) => write!(f, "{}", s),
                | Field::Idx(i) => write!(f, "{}", i),
            }
        }
    }

    impl Display for Literal {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                | Literal::Int(i) => write!(f, "{}", i),
                | Literal::Real(r) => write!(f, "{:?}", r),
                | Literal::Bool(b) => write!(f, "{}", b),
                | Literal::Char(c) => write!(f, "{:?}", c),
            }
        }
    }

    impl Display for BaseTy {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                | BaseTy::Int => write!(f, "Int"),
                | BaseTy::Real => write!(f, "Real"),
                | BaseTy::Bool => write!(f, "Bool"),
                | BaseTy::Char => write!(f, "Char"),
            }
        }
    }
}
