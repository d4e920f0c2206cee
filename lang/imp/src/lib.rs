//! Imp: the imperative IR. Lowering turns core blocks into typed
//! instructions over explicit allocations, pointer offsets and scalar
//! loops; the interpreter executes Imp modules directly (the `Interp`
//! backend) and is what the scenario tests run against.

pub mod syntax;

pub mod algebra;
pub mod dest;
pub mod lower;
pub mod interp;
pub mod fmt;

pub use dest::*;
pub use lower::*;
pub use syntax::*;
