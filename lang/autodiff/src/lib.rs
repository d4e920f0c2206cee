//! Automatic differentiation over the core IR: forward-mode linearization
//! produces a primal/tangent pair, reverse-mode transposition routes
//! cotangents back through Writer references. Both are entered from the
//! simplifier through the [`DiffEngine`] seam.

pub mod linearize;
pub mod transpose;

use tabula_core::builder::Builder;
use tabula_core::env::SubstEnv;
use tabula_core::simplify::DiffEngine;
use tabula_core::syntax::*;
use tabula_utils::prelude::*;

/// The autodiff engine: holds the derivative-rules environment (names of
/// user-supplied derivative rules, preserved by the first simplifier pass).
pub struct Ad {
    pub rules: SubstEnv,
}

impl Ad {
    pub fn new(rules: SubstEnv) -> Self {
        Ad { rules }
    }
}

impl DiffEngine for Ad {
    fn linearize(&self, bld: &mut Builder, lam: &RcAtom) -> Result<RcAtom> {
        log::trace!("linearizing {}", lam.show());
        linearize::linearize_lam(self, bld, lam)
    }
    fn transpose(&self, bld: &mut Builder, lam: &RcAtom) -> Result<RcAtom> {
        log::trace!("transposing {}", lam.show());
        transpose::transpose_lam(bld, lam)
    }
}
