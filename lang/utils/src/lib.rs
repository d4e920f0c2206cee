#![allow(clippy::style)]

pub mod err;
pub mod monoid;
pub mod span;

pub mod prelude {
    /// Source code location.
    pub use crate::span::{Cursor, FileInfo, Span};
    /// The unified error surface.
    pub use crate::err::{Error, ErrKind, Result};
    pub use crate::monoid::Monoid;
}
