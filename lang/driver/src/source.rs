//! Top-level source blocks, as handed over by the parser. The driver
//! consumes `RunModule` and `Command`; everything else passes through.

use tabula_core::syntax::*;

#[derive(Clone, Debug, PartialEq)]
pub struct SourceBlock {
    pub line: usize,
    pub offset: usize,
    pub raw_text: String,
    pub contents: SourceContents,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SourceContents {
    RunModule(Module),
    Command(CmdName, Module),
    GetNameType(Name),
    IncludeSourceFile(String),
    LoadData(String),
    ProseBlock(String),
    CommentLine,
    EmptyLines,
    UnParseable(String),
}

/// Commands operate on a module whose last export is the subject.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CmdName {
    EvalExpr,
    ShowSimp,
    ShowImp,
}

impl SourceBlock {
    pub fn run(module: Module) -> Self {
        SourceBlock {
            line: 0,
            offset: 0,
            raw_text: String::new(),
            contents: SourceContents::RunModule(module),
        }
    }
    pub fn command(cmd: CmdName, module: Module) -> Self {
        SourceBlock {
            line: 0,
            offset: 0,
            raw_text: String::new(),
            contents: SourceContents::Command(cmd, module),
        }
    }
}
