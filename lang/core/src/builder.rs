//! The embedding builder: every pass constructs core blocks through one of
//! these, which tracks the fresh-name scope, the ordered declarations, a
//! name hint, and the effect row the current scope may perform. One
//! builder per pass invocation; builders are never shared across passes.

use crate::env::{Scope, ScopeEntry, SubstEnv};
use crate::subst::subst_atom;
use crate::syntax::*;
use crate::ty::{expr_effect, singleton_value, type_of_expr};
use tabula_utils::prelude::*;

pub struct Builder {
    scope: Scope,
    decls: Vec<Decl>,
    hint: String,
    eff: EffectRow,
}

impl Builder {
    pub fn new(scope: Scope) -> Self {
        Builder { scope, decls: Vec::new(), hint: "v".to_string(), eff: EffectRow::pure() }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }
    pub fn allowed_eff(&self) -> &EffectRow {
        &self.eff
    }
    pub fn set_hint(&mut self, hint: impl Into<String>) {
        self.hint = hint.into();
    }
    pub fn set_allowed_eff(&mut self, eff: EffectRow) {
        self.eff = eff;
    }

    /// A binder fresh with respect to the scope, entered into it.
    pub fn fresh_var(&mut self, hint: &str, ty: RcTy) -> Var {
        let name = Name::gen(hint).freshen(|n| self.scope.knows(n));
        let var = Var::new(name, ty);
        self.scope.insert(var.name.clone(), ScopeEntry { ty: var.ty.clone(), bound: None });
        var
    }

    /// Bring an externally introduced binder into scope (e.g. a module
    /// declaration binder that is already known fresh).
    pub fn declare(&mut self, var: &Var, bound: Option<Expr>) {
        self.scope.insert(var.name.clone(), ScopeEntry { ty: var.ty.clone(), bound });
    }

    /// Emit an expression as a let-bound declaration and return the bound
    /// variable. Pure expressions of singleton type are not emitted at
    /// all; atoms pass through unchanged.
    pub fn emit(&mut self, expr: Expr) -> Result<RcAtom> {
        if let Expr::Atom(a) = &expr {
            return Ok(a.clone());
        }
        let ty = type_of_expr(&expr)?;
        let eff = expr_effect(&expr)?;
        self.check_allowed(&eff)?;
        if eff.is_pure() {
            if let Some(v) = singleton_value(&ty) {
                return Ok(v);
            }
        }
        let hint = self.hint.clone();
        let var = self.fresh_var(&hint, ty);
        self.scope.insert(
            var.name.clone(),
            ScopeEntry { ty: var.ty.clone(), bound: Some(expr.clone()) },
        );
        self.decls.push(Decl::Let(LetAnn::Plain, var.clone(), expr));
        Ok(var.to_atom())
    }

    pub fn emit_op(&mut self, op: PrimOp<RcAtom>) -> Result<RcAtom> {
        self.emit(Expr::Op(op))
    }

    /// Destructure an expression into fresh binders of the given types.
    pub fn emit_unpack(&mut self, tys: &[RcTy], expr: Expr) -> Result<Vec<Var>> {
        let eff = expr_effect(&expr)?;
        self.check_allowed(&eff)?;
        let binders: Vec<Var> = tys
            .iter()
            .map(|ty| {
                let hint = self.hint.clone();
                self.fresh_var(&hint, ty.clone())
            })
            .collect();
        self.decls.push(Decl::Unpack(binders.clone(), expr));
        Ok(binders)
    }

    fn check_allowed(&self, eff: &EffectRow) -> Result<()> {
        for region in eff.row.keys() {
            if !self.eff.row.contains_key(region) && self.eff.tail.is_none() {
                return Err(Error::compiler(format!(
                    "effect region {} not allowed in this scope",
                    region
                )));
            }
        }
        Ok(())
    }

    /// Run `body` in a sub-scope and wrap its declarations into a block.
    /// When the result is exactly the last let's variable, the let is
    /// elided and the block returns its expression directly.
    pub fn build_scoped(
        &mut self, body: impl FnOnce(&mut Builder) -> Result<RcAtom>,
    ) -> Result<Block> {
        let (block, ()) = self.scoped(|bld| body(bld).map(|a| (a, ())))?;
        Ok(block)
    }

    /// `build_scoped` with an extra value passed through.
    pub fn scoped<T>(
        &mut self, body: impl FnOnce(&mut Builder) -> Result<(RcAtom, T)>,
    ) -> Result<(Block, T)> {
        let mut sub = Builder {
            scope: self.scope.clone(),
            decls: Vec::new(),
            hint: self.hint.clone(),
            eff: self.eff.clone(),
        };
        let (result, t) = body(&mut sub)?;
        Ok((Builder::wrap_decls(sub.decls, result)?, t))
    }

    fn wrap_decls(mut decls: Vec<Decl>, result: RcAtom) -> Result<Block> {
        // Elide `let v = e in v`.
        let result = match (decls.last(), result.as_ref()) {
            | (Some(Decl::Let(LetAnn::Plain, b, _)), Atom::Var(v)) if b.name == v.name => {
                let Some(Decl::Let(_, _, expr)) = decls.pop() else { unreachable!() };
                expr
            }
            | _ => Expr::Atom(result),
        };
        let eff = EffectRow::concat(
            decls
                .iter()
                .map(|d| expr_effect(d.expr()))
                .chain([expr_effect(&result)])
                .collect::<Result<Vec<_>>>()?,
        );
        Ok(Block { decls, result, eff })
    }

    /// Run `body` in a sub-scope under a fresh binder; the body sees the
    /// arrow's effect row, not the outer one.
    pub fn build_lam(
        &mut self, hint: &str, ty: RcTy, arr: ArrowKind,
        body: impl FnOnce(&mut Builder, RcAtom) -> Result<RcAtom>,
    ) -> Result<RcAtom> {
        self.build_dep_eff_lam(hint, ty, |_| arr, body)
    }

    /// The dependent generalization: the arrow may mention the binder.
    pub fn build_dep_eff_lam(
        &mut self, hint: &str, ty: RcTy, arr: impl FnOnce(&Var) -> ArrowKind,
        body: impl FnOnce(&mut Builder, RcAtom) -> Result<RcAtom>,
    ) -> Result<RcAtom> {
        let mut sub = Builder {
            scope: self.scope.clone(),
            decls: Vec::new(),
            hint: self.hint.clone(),
            eff: EffectRow::pure(),
        };
        let binder = sub.fresh_var(hint, ty);
        let arr = arr(&binder);
        sub.eff = arr.eff();
        let result = body(&mut sub, binder.to_atom())?;
        let block = Builder::wrap_decls(sub.decls, result)?;
        Ok(Atom::Lam(Lam { arr, binder, body: block }).rc())
    }

    /// Emit a `for` over an index set; the loop body may perform the
    /// surrounding effects.
    pub fn build_for(
        &mut self, dir: Direction, hint: &str, ix_ty: RcTy,
        body: impl FnOnce(&mut Builder, RcAtom) -> Result<RcAtom>,
    ) -> Result<RcAtom> {
        let outer_eff = self.eff.clone();
        let lam = self.build_lam(hint, ix_ty, ArrowKind::Plain(outer_eff), body)?;
        self.emit(Expr::Hof(PrimHof::For(dir, lam)))
    }

    /// Build an abstraction whose body must reduce to an atom without
    /// emitting declarations; emitting any is a compiler bug.
    pub fn build_abs(
        &mut self, hint: &str, ty: RcTy,
        body: impl FnOnce(&mut Builder, RcAtom) -> Result<RcAtom>,
    ) -> Result<(Var, RcAtom)> {
        let mut sub = Builder {
            scope: self.scope.clone(),
            decls: Vec::new(),
            hint: self.hint.clone(),
            eff: EffectRow::pure(),
        };
        let binder = sub.fresh_var(hint, ty);
        let result = body(&mut sub, binder.to_atom())?;
        if !sub.decls.is_empty() {
            return Err(Error::compiler("build_abs body emitted declarations"));
        }
        Ok((binder, result))
    }

    /// Run `body` in a sub-scope; if the resulting block reduces to a
    /// single atom under its own let-bindings, return it.
    pub fn reduce_scoped(
        &mut self, body: impl FnOnce(&mut Builder) -> Result<RcAtom>,
    ) -> Result<Option<RcAtom>> {
        let block = self.build_scoped(body)?;
        Ok(reduce_block(&self.scope, &block))
    }

    /// Apply an atom, reading the arrow off its Pi type.
    pub fn app(&mut self, f: RcAtom, x: RcAtom) -> Result<RcAtom> {
        let f_ty = crate::ty::type_of_atom(&f)?;
        let Atom::Pi(pi) = f_ty.as_ref() else {
            return Err(Error::compiler("applying a non-function"));
        };
        self.emit(Expr::App(pi.arr.clone(), f, x))
    }

    /// Index a table.
    pub fn tab_get(&mut self, tab: RcAtom, i: RcAtom) -> Result<RcAtom> {
        self.emit(Expr::App(ArrowKind::Tab, tab, i))
    }

    /// Take the builder's declarations, leaving it empty; used when a pass
    /// finishes a top-level module.
    pub fn take_decls(&mut self) -> Vec<Decl> {
        std::mem::take(&mut self.decls)
    }

    /* ------------------------- effect scaffolding ------------------------- */

    /// Build the `\region. \ref. body` lambda every `run*` primitive takes.
    pub fn build_run_lam(
        &mut self, eff_name: EffectName, val_ty: RcTy,
        body: impl FnOnce(&mut Builder, RcAtom) -> Result<RcAtom>,
    ) -> Result<RcAtom> {
        self.build_lam("h", Atom::ty_kind(), ArrowKind::pure(), |bld, region| {
            let eff = {
                let Atom::Var(region_var) = region.as_ref() else { unreachable!() };
                bld.eff.clone().union(&EffectRow::single(
                    region_var.name.clone(),
                    eff_name,
                    val_ty.clone(),
                ))
            };
            bld.build_lam(
                "ref",
                Atom::ref_ty(region.clone(), val_ty.clone()),
                ArrowKind::Plain(eff),
                body,
            )
        })
    }

    pub fn build_run_writer(
        &mut self, w_ty: RcTy, body: impl FnOnce(&mut Builder, RcAtom) -> Result<RcAtom>,
    ) -> Result<RcAtom> {
        let lam = self.build_run_lam(EffectName::Writer, w_ty, body)?;
        self.emit(Expr::Hof(PrimHof::RunWriter(lam)))
    }

    pub fn build_run_reader(
        &mut self, r: RcAtom, body: impl FnOnce(&mut Builder, RcAtom) -> Result<RcAtom>,
    ) -> Result<RcAtom> {
        let r_ty = crate::ty::type_of_atom(&r)?;
        let lam = self.build_run_lam(EffectName::Reader, r_ty, body)?;
        self.emit(Expr::Hof(PrimHof::RunReader(r, lam)))
    }
}

/// Reduce a block to an atom when every declaration is an atom binding
/// (or beta-reducible application of one); `None` otherwise.
pub fn reduce_block(scope: &Scope, block: &Block) -> Option<RcAtom> {
    let mut env = SubstEnv::new();
    let scope = scope.clone();
    for decl in &block.decls {
        match decl {
            | Decl::Let(_, b, Expr::Atom(a)) => {
                let a = subst_atom(&env, &scope, a);
                env.insert(b.name.clone(), a);
            }
            | _ => return None,
        }
    }
    match &block.result {
        | Expr::Atom(a) => Some(subst_atom(&env, &scope, a)),
        | _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn emit_names_are_fresh_and_ordered() {
        let mut bld = Builder::new(Scope::new());
        let block = bld
            .build_scoped(|bld| {
                let a = bld.emit_op(PrimOp::ScalarBinOp(BinOp::IAdd, Atom::lit(1), Atom::lit(2)))?;
                let b = bld.emit_op(PrimOp::ScalarBinOp(BinOp::IMul, a.clone(), a))?;
                Ok(b)
            })
            .unwrap();
        // Two decls, second elided into the result.
        assert_eq!(block.decls.len(), 1);
        let Decl::Let(_, v0, _) = &block.decls[0] else { panic!() };
        let Expr::Op(PrimOp::ScalarBinOp(BinOp::IMul, x, _)) = &block.result else {
            panic!("result should be the elided multiply")
        };
        assert_eq!(x.as_ref(), &Atom::Var(v0.clone()));
    }

    #[test]
    fn singleton_results_are_not_emitted() {
        let mut bld = Builder::new(Scope::new());
        let block = bld
            .build_scoped(|bld| {
                // A table of units is a singleton: no decl should be emitted.
                let tab = Atom::Con(PrimCon::AFor(Atom::int_range(0, 3), Atom::unit())).rc();
                let i = Atom::Con(PrimCon::IntRangeVal(
                    Atom::lit(0),
                    Atom::lit(3),
                    Atom::lit(1),
                ))
                .rc();
                bld.emit(Expr::App(ArrowKind::Tab, tab, i))
            })
            .unwrap();
        assert_eq!(block.decls.len(), 0);
        assert_eq!(block.result, Expr::Atom(Atom::unit()));
    }

    #[test]
    fn build_lam_scopes_effects() {
        let mut bld = Builder::new(Scope::new());
        let region = Name::gen("h");
        let eff = EffectRow::single(region.clone(), EffectName::Writer, Atom::real_ty());
        let lam = bld
            .build_lam("x", Atom::real_ty(), ArrowKind::Plain(eff.clone()), |bld, x| {
                assert_eq!(bld.allowed_eff(), &eff);
                Ok(x)
            })
            .unwrap();
        let Atom::Lam(Lam { arr, .. }) = lam.as_ref() else { panic!() };
        assert_eq!(arr.eff(), eff);
    }

    #[test]
    fn build_abs_rejects_emission() {
        let mut bld = Builder::new(Scope::new());
        let res = bld.build_abs("x", Atom::int_ty(), |bld, x| {
            bld.emit_op(PrimOp::ScalarBinOp(BinOp::IAdd, x.clone(), x))
        });
        assert!(res.is_err());
    }

    #[test]
    fn reduce_scoped_sees_through_lets() {
        let mut bld = Builder::new(Scope::new());
        let reduced = bld
            .reduce_scoped(|bld| {
                let a = bld.emit(Expr::Atom(Atom::lit(5)))?;
                Ok(a)
            })
            .unwrap();
        assert_eq!(reduced, Some(Atom::lit(5)));
    }
}
