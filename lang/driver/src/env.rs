//! The top-level environment: a flat name-to-atom map for definitions and
//! a second one for derivative rules. Passes read it; only completed
//! evaluations replace it.

use tabula_core::env::SubstEnv;
use tabula_core::simplify::top_scope;
use tabula_core::syntax::*;
use tabula_utils::prelude::*;

#[derive(Clone, Default)]
pub struct TopEnv {
    pub atoms: SubstEnv,
    pub rules: SubstEnv,
}

impl TopEnv {
    pub fn new() -> Self {
        TopEnv::default()
    }

    pub fn define(&mut self, name: Name, atom: RcAtom) {
        self.atoms.insert(name, atom);
    }

    pub fn define_rule(&mut self, name: Name, rule: RcAtom) {
        self.rules.insert(name, rule);
    }

    pub fn lookup(&self, name: &Name) -> Option<&RcAtom> {
        self.atoms.lookup(name)
    }

    pub fn scope(&self) -> Result<tabula_core::env::Scope> {
        top_scope(&self.atoms)
    }
}
