//! What a toplevel evaluation hands back: a list of outputs plus the
//! final outcome.

use tabula_utils::prelude::*;

#[derive(Clone, Debug, PartialEq)]
pub enum Output {
    TextOut(String),
    PassInfo(PassName, String),
    HeatmapOut(usize, usize, Vec<f64>),
    ScatterOut(Vec<f64>, Vec<f64>),
    MiscLog(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PassName {
    Simplify,
    Imp,
}

impl std::fmt::Display for PassName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            | PassName::Simplify => write!(f, "simplify"),
            | PassName::Imp => write!(f, "imp"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TopResult {
    pub outputs: Vec<Output>,
    pub outcome: Result<()>,
}

impl TopResult {
    pub fn ok(outputs: Vec<Output>) -> Self {
        TopResult { outputs, outcome: Ok(()) }
    }
    pub fn err(outputs: Vec<Output>, e: Error) -> Self {
        TopResult { outputs, outcome: Err(e) }
    }
}
