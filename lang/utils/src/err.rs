use crate::span::Span;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The kind of a toplevel error. `CompilerErr` is a bug in the compiler;
/// every other kind is a user-facing condition.
#[derive(Error, Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrKind {
    #[error("")]
    NoErr,
    #[error("Parse error:")]
    ParseErr,
    #[error("Type error:")]
    TypeErr,
    #[error("Kind error:")]
    KindErr,
    #[error("Linearity error:")]
    LinErr,
    #[error("Error: variable not in scope:")]
    UnboundVarErr,
    #[error("Error: variable already defined:")]
    RepeatedVarErr,
    #[error("Compiler bug!")]
    CompilerErr,
    #[error("Not implemented:")]
    NotImplementedErr,
    #[error("IO error:")]
    DataIOErr,
    #[error("Error:")]
    MiscErr,
}

/// An error with its kind, an optional source position, and a message.
#[derive(Error, Clone, Debug, PartialEq)]
#[error("{kind} {msg}")]
pub struct Error {
    pub kind: ErrKind,
    pub pos: Option<Span>,
    pub msg: String,
}

impl Error {
    pub fn new(kind: ErrKind, msg: impl Into<String>) -> Self {
        Error { kind, pos: None, msg: msg.into() }
    }
    pub fn at(self, pos: Span) -> Self {
        Error { pos: Some(pos), ..self }
    }

    pub fn compiler(msg: impl Into<String>) -> Self {
        Error::new(ErrKind::CompilerErr, msg)
    }
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Error::new(ErrKind::NotImplementedErr, msg)
    }
    pub fn linearity(msg: impl Into<String>) -> Self {
        Error::new(ErrKind::LinErr, msg)
    }
    pub fn unbound(msg: impl Into<String>) -> Self {
        Error::new(ErrKind::UnboundVarErr, msg)
    }
    pub fn ty(msg: impl Into<String>) -> Self {
        Error::new(ErrKind::TypeErr, msg)
    }
}
