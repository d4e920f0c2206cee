//! The typed core IR of tabula: the term model, capture-avoiding
//! substitution, the embedding builder that accumulates let-bound
//! declarations, and the simplifier.

pub mod syntax;

pub mod env;
pub mod free;
pub mod subst;
pub mod eq;
pub mod ty;
pub mod builder;
pub mod simplify;
pub mod fmt;

pub use env::*;
pub use syntax::*;

pub use tabula_utils::prelude::*;
