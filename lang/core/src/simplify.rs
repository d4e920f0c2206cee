//! The simplifier: walks blocks under a substitution environment,
//! beta-reduces applications, inlines top-level atoms, specializes
//! type-directed operations, and separates data from function components
//! behind reconstruction closures.
//!
//! The pass runs twice per module: first preserving derivative-rule names
//! so the autodiff transforms can see them, then once more with
//! `preserve_deriv_rules = false` to eliminate them.

use crate::builder::Builder;
use crate::env::{Scope, ScopeEntry, SubstEnv};
use crate::free::free_vars_atom;
use crate::subst::{de_shadow, subst_atom, subst_block, subst_eff};
use crate::syntax::*;
use crate::ty::{is_data, type_of_atom, type_of_block};
use tabula_utils::prelude::*;

/// The seam to the autodiff crate: `Linearize`/`Transpose` higher-order
/// primitives are dispatched through this trait, which the autodiff crate
/// implements.
pub trait DiffEngine {
    fn linearize(&self, bld: &mut Builder, lam: &RcAtom) -> Result<RcAtom>;
    fn transpose(&self, bld: &mut Builder, lam: &RcAtom) -> Result<RcAtom>;
}

/// A stand-in engine for contexts that must not encounter AD primitives.
pub struct NoDiff;

impl DiffEngine for NoDiff {
    fn linearize(&self, _: &mut Builder, _: &RcAtom) -> Result<RcAtom> {
        Err(Error::compiler("linearize encountered without a diff engine"))
    }
    fn transpose(&self, _: &mut Builder, _: &RcAtom) -> Result<RcAtom> {
        Err(Error::compiler("transpose encountered without a diff engine"))
    }
}

pub struct Simplifier<'a> {
    top: &'a SubstEnv,
    rules: &'a SubstEnv,
    diff: &'a dyn DiffEngine,
    preserve_deriv_rules: bool,
}

/// A reconstruction closure: the non-data skeleton of a lambda result,
/// abstracted over the data components that were separated out.
pub struct Recon {
    pub binders: Vec<Var>,
    pub lam_binder: Var,
    pub skeleton: RcAtom,
}

impl Recon {
    /// Substitute projections of `tuple` for the separated binders, and
    /// `index` for the lambda binder, rebuilding the original result.
    pub fn apply(&self, bld: &mut Builder, tuple: RcAtom, index: RcAtom) -> Result<RcAtom> {
        let mut env = SubstEnv::singleton(self.lam_binder.name.clone(), index);
        for (i, b) in self.binders.iter().enumerate() {
            let comp = bld.emit_op(PrimOp::RecGet(tuple.clone(), Field::Idx(i)))?;
            env.insert(b.name.clone(), comp);
        }
        Ok(subst_atom(&env, bld.scope(), &self.skeleton))
    }
}

impl<'a> Simplifier<'a> {
    pub fn new(
        top: &'a SubstEnv, rules: &'a SubstEnv, diff: &'a dyn DiffEngine,
        preserve_deriv_rules: bool,
    ) -> Self {
        Simplifier { top, rules, diff, preserve_deriv_rules }
    }

    /// Simplify a module's declarations; returns the simplified module and
    /// the environment of its exports.
    pub fn simplify_module(&self, scope: Scope, module: &Module) -> Result<(Module, SubstEnv)> {
        log::trace!(
            "simplify: {} decls, preserve rules = {}",
            module.decls.len(),
            self.preserve_deriv_rules
        );
        let mut bld = Builder::new(scope);
        let mut env = SubstEnv::new();
        for decl in &module.decls {
            match decl {
                | Decl::Let(_, b, e) => {
                    bld.set_hint(&b.name.hint);
                    let atom = self.simplify_expr(&mut bld, &env, e)?;
                    env.insert(b.name.clone(), atom);
                }
                | Decl::Unpack(bs, e) => {
                    bld.set_hint("unpacked");
                    let atom = self.simplify_expr(&mut bld, &env, e)?;
                    let parts = self.unpack_atom(&mut bld, &atom, bs.len())?;
                    for (b, part) in bs.iter().zip(parts) {
                        env.insert(b.name.clone(), part);
                    }
                }
            }
        }
        let mut post = SubstEnv::new();
        let mut exports = Vec::with_capacity(module.exports.len());
        let mut decls = bld.take_decls();
        for export in &module.exports {
            let atom = env
                .lookup(&export.name)
                .cloned()
                .ok_or_else(|| Error::unbound(export.name.to_string()))?;
            let ty = type_of_atom(&atom)?;
            let binder = Var::new(export.name.clone(), ty);
            // Rebind the export so a later pass sees the mapping too.
            decls.push(Decl::Let(LetAnn::Plain, binder.clone(), Expr::Atom(atom.clone())));
            exports.push(binder);
            post.insert(export.name.clone(), atom);
        }
        Ok((Module { decls, exports }, post))
    }

    pub fn simplify_atom(
        &self, bld: &mut Builder, env: &SubstEnv, atom: &RcAtom,
    ) -> Result<RcAtom> {
        match atom.as_ref() {
            | Atom::Var(v) => match env.lookup(&v.name) {
                | Some(x) => Ok(de_shadow(x, bld.scope())),
                | None if v.name.tag == NameTag::Top => {
                    if self.preserve_deriv_rules && self.rules.lookup(&v.name).is_some() {
                        // Leave the reference so the AD pass can see it.
                        return Ok(atom.clone());
                    }
                    match self.top.lookup(&v.name) {
                        | Some(top_atom) => {
                            // Top-level atoms are inlined fully, under an
                            // empty local environment.
                            let top_atom = top_atom.clone();
                            self.simplify_atom(bld, &SubstEnv::new(), &top_atom)
                        }
                        | None => Err(Error::unbound(v.name.to_string())),
                    }
                }
                | None => Ok(subst_atom(env, bld.scope(), atom)),
            },
            // Lambdas are substituted without entering the body; the next
            // application beta-reduces them.
            | Atom::Lam(_) | Atom::Pi(_) => Ok(subst_atom(env, bld.scope(), atom)),
            | Atom::Con(PrimCon::AnyValue(ty)) => {
                let ty = self.simplify_atom(bld, env, ty)?;
                self.any_value(&ty)
            }
            | Atom::Con(con) => {
                Ok(Atom::Con(con.try_map(|a| self.simplify_atom(bld, env, a))?).rc())
            }
            | Atom::TC(tc) => {
                Ok(Atom::TC(tc.try_map(|a| self.simplify_atom(bld, env, a))?).rc())
            }
            | Atom::Eff(eff) => Ok(Atom::Eff(subst_eff(env, bld.scope(), eff)).rc()),
        }
    }

    pub fn simplify_block(
        &self, bld: &mut Builder, env: &SubstEnv, block: &Block,
    ) -> Result<RcAtom> {
        let mut env = env.clone();
        for decl in &block.decls {
            match decl {
                | Decl::Let(_, b, e) => {
                    bld.set_hint(&b.name.hint);
                    let atom = self.simplify_expr(bld, &env, e)?;
                    env.insert(b.name.clone(), atom);
                }
                | Decl::Unpack(bs, e) => {
                    bld.set_hint("unpacked");
                    let atom = self.simplify_expr(bld, &env, e)?;
                    let parts = self.unpack_atom(bld, &atom, bs.len())?;
                    for (b, part) in bs.iter().zip(parts) {
                        env.insert(b.name.clone(), part);
                    }
                }
            }
        }
        self.simplify_expr(bld, &env, &block.result)
    }

    pub fn simplify_expr(
        &self, bld: &mut Builder, env: &SubstEnv, expr: &Expr,
    ) -> Result<RcAtom> {
        match expr {
            | Expr::App(arr, f, x) => {
                let f = self.simplify_atom(bld, env, f)?;
                let x = self.simplify_atom(bld, env, x)?;
                match f.as_ref() {
                    | Atom::Lam(Lam { binder, body, .. }) => {
                        // Beta-reduce: drop the local env entirely.
                        let env = SubstEnv::singleton(binder.name.clone(), x);
                        self.simplify_block(bld, &env, body)
                    }
                    | Atom::Con(PrimCon::AFor(_, body)) => Ok(body.clone()),
                    | _ => bld.emit(Expr::App(arr.clone(), f, x)),
                }
            }
            | Expr::Atom(a) => self.simplify_atom(bld, env, a),
            | Expr::Op(op) => {
                let op = op.try_map(|a| self.simplify_atom(bld, env, a))?;
                self.simplify_op(bld, op)
            }
            | Expr::Hof(hof) => self.simplify_hof(bld, env, hof),
            | Expr::Case(scrut, alts, ty) => {
                let scrut = self.simplify_atom(bld, env, scrut)?;
                let ty = self.simplify_atom(bld, env, ty)?;
                if let Atom::Con(PrimCon::DataCon(_, _, i, args)) = scrut.as_ref() {
                    // Known constructor: choose the alternative statically.
                    let alt = alts.get(*i).ok_or_else(|| {
                        Error::compiler("case alternative index out of range")
                    })?;
                    let mut env = env.clone();
                    for (b, arg) in alt.binders.iter().zip(args) {
                        env.insert(b.name.clone(), arg.clone());
                    }
                    return self.simplify_block(bld, &env, &alt.body);
                }
                let alts = alts
                    .iter()
                    .map(|alt| self.simplify_alt(bld, env, alt))
                    .collect::<Result<Vec<_>>>()?;
                bld.emit(Expr::Case(scrut, alts, ty))
            }
        }
    }

    fn simplify_alt(&self, bld: &mut Builder, env: &SubstEnv, alt: &Alt) -> Result<Alt> {
        let mut env = env.clone();
        let mut sub_binders = Vec::with_capacity(alt.binders.len());
        let mut scope = bld.scope().clone();
        for b in &alt.binders {
            let ty = self.simplify_atom(bld, &env, &b.ty)?;
            let name = b.name.freshen(|n| scope.knows(n));
            let fresh = Var::new(name, ty);
            scope = scope.binder(&fresh);
            env.insert(b.name.clone(), fresh.to_atom());
            sub_binders.push(fresh);
        }
        // Each alternative simplifies in its own scope; decls stay inside.
        let mut inner = Builder::new(scope);
        inner.set_allowed_eff(bld.allowed_eff().clone());
        let result = self.simplify_block(&mut inner, &env, &alt.body)?;
        let decls = inner.take_decls();
        let eff = EffectRow::concat(
            decls
                .iter()
                .map(|d| crate::ty::expr_effect(d.expr()))
                .collect::<Result<Vec<_>>>()?,
        );
        Ok(Alt {
            binders: sub_binders,
            body: Block { decls, result: Expr::Atom(result), eff },
        })
    }

    /* ------------------------------ operations ----------------------------- */

    fn simplify_op(&self, bld: &mut Builder, op: PrimOp<RcAtom>) -> Result<RcAtom> {
        use PrimOp::*;
        match op {
            | Cmp(CmpOp::Equal, t, a, b) => self.eq_at(bld, &t, a, b),
            | Cmp(cmp, t, a, b) => match t.as_ref() {
                | Atom::TC(PrimTC::Base(BaseTy::Int)) => {
                    bld.emit_op(ScalarBinOp(BinOp::ICmp(cmp), a, b))
                }
                | Atom::TC(PrimTC::Base(BaseTy::Real)) => {
                    bld.emit_op(ScalarBinOp(BinOp::FCmp(cmp), a, b))
                }
                | _ => {
                    let ia = bld.emit_op(IndexAsInt(a))?;
                    let ib = bld.emit_op(IndexAsInt(b))?;
                    bld.emit_op(ScalarBinOp(BinOp::ICmp(cmp), ia, ib))
                }
            },
            | RecGet(x, field) => match x.as_ref() {
                | Atom::Con(PrimCon::RecCon(r)) => r
                    .get(&field)
                    .cloned()
                    .ok_or_else(|| Error::compiler(format!("missing record field {}", field))),
                | _ => bld.emit_op(RecGet(x, field)),
            },
            | SumGet(x, left) => match x.as_ref() {
                | Atom::Con(PrimCon::SumCon(_, l, r)) => {
                    Ok(if left { l.clone() } else { r.clone() })
                }
                | _ => bld.emit_op(SumGet(x, left)),
            },
            | SumTag(x) => match x.as_ref() {
                | Atom::Con(PrimCon::SumCon(tag, _, _)) => Ok(tag.clone()),
                | _ => bld.emit_op(SumTag(x)),
            },
            | Fst(x) => match x.as_ref() {
                | Atom::Con(PrimCon::PairCon(a, _)) => Ok(a.clone()),
                | _ => bld.emit_op(Fst(x)),
            },
            | Snd(x) => match x.as_ref() {
                | Atom::Con(PrimCon::PairCon(_, b)) => Ok(b.clone()),
                | _ => bld.emit_op(Snd(x)),
            },
            | Select(p, x, y) => {
                let ty = type_of_atom(&x)?;
                self.select_at(bld, &ty, p, x, y)
            }
            | IndexAsInt(x) => match x.as_ref() {
                | Atom::Con(PrimCon::IntRangeVal(_, _, i)) => Ok(i.clone()),
                | Atom::Con(PrimCon::IndexRangeVal(_, _, _, i)) => Ok(i.clone()),
                | _ => bld.emit_op(IndexAsInt(x)),
            },
            | other => bld.emit_op(other),
        }
    }

    /// Structural equality: unfold per type down to scalar comparisons.
    fn eq_at(&self, bld: &mut Builder, ty: &RcTy, a: RcAtom, b: RcAtom) -> Result<RcAtom> {
        use PrimOp::*;
        match ty.as_ref() {
            | Atom::TC(PrimTC::Base(BaseTy::Int)) => {
                bld.emit_op(ScalarBinOp(BinOp::ICmp(CmpOp::Equal), a, b))
            }
            | Atom::TC(PrimTC::Base(BaseTy::Real)) => {
                bld.emit_op(ScalarBinOp(BinOp::FCmp(CmpOp::Equal), a, b))
            }
            | Atom::TC(PrimTC::Base(BaseTy::Bool))
            | Atom::TC(PrimTC::IntRange(_, _))
            | Atom::TC(PrimTC::IndexRange(_, _, _))
            | Atom::TC(PrimTC::CharTy) => {
                let ia = bld.emit_op(IndexAsInt(a))?;
                let ib = bld.emit_op(IndexAsInt(b))?;
                bld.emit_op(ScalarBinOp(BinOp::ICmp(CmpOp::Equal), ia, ib))
            }
            | Atom::TC(PrimTC::RecordTy(r)) => {
                let mut acc: Option<RcAtom> = None;
                for (field, field_ty) in r.iter() {
                    let fa = self.simplify_op(bld, RecGet(a.clone(), field.clone()))?;
                    let fb = self.simplify_op(bld, RecGet(b.clone(), field.clone()))?;
                    let eq = self.eq_at(bld, field_ty, fa, fb)?;
                    acc = Some(match acc {
                        | None => eq,
                        | Some(prev) => bld.emit_op(ScalarBinOp(BinOp::And, prev, eq))?,
                    });
                }
                Ok(acc.unwrap_or_else(|| Atom::lit(true)))
            }
            | Atom::TC(PrimTC::PairTy(lt, rt)) => {
                let fa = self.simplify_op(bld, Fst(a.clone()))?;
                let fb = self.simplify_op(bld, Fst(b.clone()))?;
                let left = self.eq_at(bld, lt, fa, fb)?;
                let sa = self.simplify_op(bld, Snd(a))?;
                let sb = self.simplify_op(bld, Snd(b))?;
                let right = self.eq_at(bld, rt, sa, sb)?;
                bld.emit_op(ScalarBinOp(BinOp::And, left, right))
            }
            | Atom::TC(PrimTC::SumTy(lt, rt)) => {
                let ta = self.simplify_op(bld, SumTag(a.clone()))?;
                let tb = self.simplify_op(bld, SumTag(b.clone()))?;
                let ia = bld.emit_op(IndexAsInt(ta.clone()))?;
                let ib = bld.emit_op(IndexAsInt(tb))?;
                let tags_eq = bld.emit_op(ScalarBinOp(BinOp::ICmp(CmpOp::Equal), ia, ib))?;
                let la = self.simplify_op(bld, SumGet(a.clone(), true))?;
                let lb = self.simplify_op(bld, SumGet(b.clone(), true))?;
                let left_eq = self.eq_at(bld, lt, la, lb)?;
                let ra = self.simplify_op(bld, SumGet(a, false))?;
                let rb = self.simplify_op(bld, SumGet(b, false))?;
                let right_eq = self.eq_at(bld, rt, ra, rb)?;
                let side_eq = bld.emit_op(Select(ta, left_eq, right_eq))?;
                bld.emit_op(ScalarBinOp(BinOp::And, tags_eq, side_eq))
            }
            | other => Err(Error::not_implemented(format!(
                "structural equality at type {:?}",
                other
            ))),
        }
    }

    /// Distribute `Select` over structure down to base-type selects.
    fn select_at(
        &self, bld: &mut Builder, ty: &RcTy, p: RcAtom, x: RcAtom, y: RcAtom,
    ) -> Result<RcAtom> {
        use PrimOp::*;
        match ty.as_ref() {
            | Atom::TC(PrimTC::RecordTy(r)) => {
                let items = r.iter().map(|(field, field_ty)| {
                    let fx = self.simplify_op(bld, RecGet(x.clone(), field.clone()))?;
                    let fy = self.simplify_op(bld, RecGet(y.clone(), field.clone()))?;
                    self.select_at(bld, field_ty, p.clone(), fx, fy)
                });
                let items = items.collect::<Result<Vec<_>>>()?;
                let rec = match r {
                    | Record::Tup(_) => Record::Tup(items),
                    | Record::Named(named) => Record::Named(
                        named.keys().cloned().zip(items).collect(),
                    ),
                };
                Ok(Atom::Con(PrimCon::RecCon(rec)).rc())
            }
            | Atom::TC(PrimTC::PairTy(lt, rt)) => {
                let fx = self.simplify_op(bld, Fst(x.clone()))?;
                let fy = self.simplify_op(bld, Fst(y.clone()))?;
                let l = self.select_at(bld, lt, p.clone(), fx, fy)?;
                let sx = self.simplify_op(bld, Snd(x))?;
                let sy = self.simplify_op(bld, Snd(y))?;
                let r = self.select_at(bld, rt, p, sx, sy)?;
                Ok(Atom::pair(l, r))
            }
            | Atom::Pi(pi) if matches!(pi.arr, ArrowKind::Tab) => {
                let ix = pi.binder.ty.clone();
                let body_ty = pi.body.clone();
                bld.build_for(Direction::Fwd, "i", ix, |sub, i| {
                    let xi = sub.tab_get(x.clone(), i.clone())?;
                    let yi = sub.tab_get(y.clone(), i.clone())?;
                    self.select_at(sub, &body_ty, p.clone(), xi, yi)
                })
            }
            | _ => bld.emit_op(Select(p, x, y)),
        }
    }

    /// Fabricate an arbitrary value of a type.
    fn any_value(&self, ty: &RcTy) -> Result<RcAtom> {
        match ty.as_ref() {
            | Atom::TC(PrimTC::Base(BaseTy::Int)) => Ok(Atom::lit(0)),
            | Atom::TC(PrimTC::Base(BaseTy::Real)) => Ok(Atom::lit(0.0)),
            | Atom::TC(PrimTC::Base(BaseTy::Bool)) => Ok(Atom::lit(false)),
            | Atom::TC(PrimTC::Base(BaseTy::Char)) => Ok(Atom::lit(' ')),
            | Atom::TC(PrimTC::UnitTy) => Ok(Atom::unit()),
            | Atom::TC(PrimTC::CharTy) => {
                Ok(Atom::Con(PrimCon::CharCon(Atom::lit(32))).rc())
            }
            | Atom::TC(PrimTC::IntRange(l, h)) => {
                Ok(Atom::Con(PrimCon::IntRangeVal(l.clone(), h.clone(), Atom::lit(0))).rc())
            }
            | Atom::TC(PrimTC::IndexRange(t, l, h)) => Ok(Atom::Con(PrimCon::IndexRangeVal(
                t.clone(),
                l.clone(),
                h.clone(),
                Atom::lit(0),
            ))
            .rc()),
            | Atom::TC(PrimTC::PairTy(a, b)) => {
                Ok(Atom::pair(self.any_value(a)?, self.any_value(b)?))
            }
            | Atom::TC(PrimTC::RecordTy(r)) => {
                Ok(Atom::Con(PrimCon::RecCon(r.try_map(|t| self.any_value(t))?)).rc())
            }
            | Atom::TC(PrimTC::SumTy(l, r)) => Ok(Atom::Con(PrimCon::SumCon(
                Atom::lit(true),
                self.any_value(l)?,
                self.any_value(r)?,
            ))
            .rc()),
            | Atom::Pi(pi) if matches!(pi.arr, ArrowKind::Tab) => Ok(Atom::Con(
                PrimCon::AFor(pi.binder.ty.clone(), self.any_value(&pi.body)?),
            )
            .rc()),
            | other => Err(Error::compiler(format!("any value at type {:?}", other))),
        }
    }

    /* --------------------------------- hofs -------------------------------- */

    fn simplify_hof(
        &self, bld: &mut Builder, env: &SubstEnv, hof: &PrimHof<RcAtom>,
    ) -> Result<RcAtom> {
        use PrimHof::*;
        match hof {
            | For(d, lam) => {
                let (lam, recon) = self.simplify_lam(bld, env, lam)?;
                let table = bld.emit(Expr::Hof(For(*d, lam)))?;
                match recon {
                    | None => Ok(table),
                    | Some(recon) => {
                        // Rebuild the non-data components around the stored
                        // table of data tuples.
                        let tab_ty = type_of_atom(&table)?;
                        let Atom::Pi(pi) = tab_ty.as_ref() else {
                            return Err(Error::compiler("for did not produce a table"));
                        };
                        let ix = pi.binder.ty.clone();
                        bld.build_lam("i", ix, ArrowKind::Tab, |sub, i| {
                            let tup = sub.tab_get(table.clone(), i.clone())?;
                            recon.apply(sub, tup, i)
                        })
                    }
                }
            }
            | While(cond, body) => {
                let (cond, c_recon) = self.simplify_lam(bld, env, cond)?;
                let (body, b_recon) = self.simplify_lam(bld, env, body)?;
                if c_recon.is_some() || b_recon.is_some() {
                    return Err(Error::compiler("while lambdas must return data"));
                }
                bld.emit(Expr::Hof(While(cond, body)))
            }
            | RunReader(r, lam) => {
                let r = self.simplify_atom(bld, env, r)?;
                let lam = self.simplify_run_lam(bld, env, lam)?;
                bld.emit(Expr::Hof(RunReader(r, lam)))
            }
            | RunWriter(lam) => {
                let lam = self.simplify_run_lam(bld, env, lam)?;
                bld.emit(Expr::Hof(RunWriter(lam)))
            }
            | RunState(s, lam) => {
                let s = self.simplify_atom(bld, env, s)?;
                let lam = self.simplify_run_lam(bld, env, lam)?;
                bld.emit(Expr::Hof(RunState(s, lam)))
            }
            | Linearize(lam) => {
                let (lam, recon) = self.simplify_lam(bld, env, lam)?;
                if recon.is_some() {
                    return Err(Error::compiler("linearized function must return data"));
                }
                self.diff.linearize(bld, &lam)
            }
            | Transpose(lam) => {
                let (lam, recon) = self.simplify_lam(bld, env, lam)?;
                if recon.is_some() {
                    return Err(Error::compiler("transposed function must return data"));
                }
                self.diff.transpose(bld, &lam)
            }
        }
    }

    /// Simplify a lambda. Data-typed bodies come back plain; otherwise the
    /// body's data components are emitted as a tuple and a reconstruction
    /// closure rebuilds the rest (see `separate_data_component`).
    pub fn simplify_lam(
        &self, bld: &mut Builder, env: &SubstEnv, lam: &RcAtom,
    ) -> Result<(RcAtom, Option<Recon>)> {
        let Atom::Lam(Lam { arr, binder, body }) = lam.as_ref() else {
            // A variable standing for a function: substitute, then retry.
            let lam2 = self.simplify_atom(bld, env, lam)?;
            if !matches!(lam2.as_ref(), Atom::Lam(_)) {
                return Err(Error::compiler("simplify_lam on a non-lambda"));
            }
            return self.simplify_lam(bld, &SubstEnv::new(), &lam2);
        };
        let binder_ty = self.simplify_atom(bld, env, &binder.ty)?;
        let arr = match arr {
            | ArrowKind::Plain(eff) => ArrowKind::Plain(subst_eff(env, bld.scope(), eff)),
            | other => other.clone(),
        };

        let body_ty_data = {
            // The declared body type, under the current substitution.
            let sub_env = env.clone() + [(binder.name.clone(), binder.to_atom())];
            let body2 = subst_block(&sub_env, &bld.scope().clone().binder(binder), body);
            is_data(type_of_block(&body2)?.as_ref())
        };

        let mut recon_out = None;
        let hint = binder.name.hint.clone();
        let outer_scope = bld.scope().clone();
        let lam = {
            let env = env.clone();
            let body_block = body.clone();
            let old_binder = binder.clone();
            let outer_scope = &outer_scope;
            bld.build_lam(&hint, binder_ty, arr, |sub, x| {
                let env = env + [(old_binder.name.clone(), x.clone())];
                let result = self.simplify_block(sub, &env, &body_block)?;
                if body_ty_data {
                    Ok(result)
                } else {
                    let Atom::Var(x_var) = x.as_ref() else { unreachable!() };
                    let (tuple, recon) =
                        separate_data_component(sub, outer_scope, x_var.clone(), &result)?;
                    recon_out = Some(recon);
                    Ok(tuple)
                }
            })?
        };
        Ok((lam, recon_out))
    }

    /// Rebuild a `\region. \ref. body` lambda, pushing substitutions
    /// through the region binder then the ref binder.
    fn simplify_run_lam(
        &self, bld: &mut Builder, env: &SubstEnv, lam: &RcAtom,
    ) -> Result<RcAtom> {
        let Atom::Lam(Lam { binder: region, body: outer, .. }) = lam.as_ref() else {
            return Err(Error::compiler("run* of a non-lambda"));
        };
        let Expr::Atom(inner) = &outer.result else {
            return Err(Error::compiler("run* lambda body must be an inner lambda"));
        };
        let Atom::Lam(Lam { arr: inner_arr, binder: ref_binder, body }) = inner.as_ref()
        else {
            return Err(Error::compiler("run* lambda body must be an inner lambda"));
        };
        let env = env.clone();
        let region_old = region.clone();
        let ref_old = ref_binder.clone();
        let inner_arr = inner_arr.clone();
        let body = body.clone();
        bld.build_lam("h", Atom::ty_kind(), ArrowKind::pure(), |mid, h| {
            let env = env.clone() + [(region_old.name.clone(), h.clone())];
            let ref_ty = self.simplify_atom(mid, &env, &ref_old.ty)?;
            let arr = match &inner_arr {
                | ArrowKind::Plain(eff) => {
                    ArrowKind::Plain(subst_eff(&env, mid.scope(), eff))
                }
                | other => other.clone(),
            };
            mid.build_lam("ref", ref_ty, arr, |sub, r| {
                let env = env.clone() + [(ref_old.name.clone(), r)];
                self.simplify_block(sub, &env, &body)
            })
        })
    }

    /// Project the components of an unpacked atom, or emit an `Unpack`
    /// declaration when the structure is opaque.
    fn unpack_atom(
        &self, bld: &mut Builder, atom: &RcAtom, arity: usize,
    ) -> Result<Vec<RcAtom>> {
        match atom.as_ref() {
            | Atom::Con(PrimCon::DataCon(_, _, _, args)) if args.len() == arity => {
                Ok(args.clone())
            }
            | Atom::Con(PrimCon::RecCon(Record::Tup(items))) if items.len() == arity => {
                Ok(items.clone())
            }
            | _ => {
                let ty = type_of_atom(atom)?;
                let tys = unpacked_field_tys(&ty, arity)?;
                let binders = bld.emit_unpack(&tys, Expr::Atom(atom.clone()))?;
                Ok(binders.iter().map(|b| b.to_atom()).collect())
            }
        }
    }
}

/// The field types an `Unpack` of this type binds.
fn unpacked_field_tys(ty: &RcTy, arity: usize) -> Result<Vec<RcTy>> {
    match ty.as_ref() {
        | Atom::TC(PrimTC::RecordTy(Record::Tup(items))) if items.len() == arity => {
            Ok(items.clone())
        }
        | Atom::TC(PrimTC::TypeCon(def, params)) if def.cons.len() == 1 => {
            let con = &def.cons[0];
            if con.binders.len() != arity {
                return Err(Error::compiler("unpack arity mismatch"));
            }
            let env: SubstEnv = def
                .params
                .iter()
                .zip(params)
                .map(|(p, arg)| (p.name.clone(), arg.clone()))
                .collect();
            Ok(con
                .binders
                .iter()
                .map(|b| subst_atom(&env, &Scope::new(), &b.ty))
                .collect())
        }
        | other => Err(Error::compiler(format!("cannot unpack type {:?}", other))),
    }
}

/// Walk the local scope's intersection with the result's free variables,
/// emit a tuple of those data components as the block's public result, and
/// return a closure that substitutes replacements back into the original
/// result skeleton. Variables already known outside the lambda stay free:
/// the reconstruction site sees them too.
pub fn separate_data_component(
    bld: &mut Builder, outer_scope: &Scope, lam_binder: Var, result: &RcAtom,
) -> Result<(RcAtom, Recon)> {
    let free = free_vars_atom(result);
    let mut binders = Vec::new();
    for (name, ty) in free {
        if name == lam_binder.name || outer_scope.knows(&name) {
            continue;
        }
        if bld.scope().knows(&name) {
            if !is_data(&ty) {
                return Err(Error::compiler(
                    "separated component is not data; cannot store it in a table",
                ));
            }
            binders.push(Var::new(name, ty));
        }
    }
    // Deterministic order for the tuple.
    binders.sort_by(|a, b| a.name.cmp(&b.name));
    let tuple = Atom::Con(PrimCon::RecCon(Record::Tup(
        binders.iter().map(|b| b.to_atom()).collect(),
    )))
    .rc();
    let recon = Recon { binders, lam_binder, skeleton: result.clone() };
    Ok((tuple, recon))
}

/// Scope seeded from a top environment, for starting a pass.
pub fn top_scope(top: &SubstEnv) -> Result<Scope> {
    let mut scope = Scope::new();
    for (name, atom) in top.clone() {
        scope.insert(name, ScopeEntry { ty: type_of_atom(&atom)?, bound: None });
    }
    Ok(scope)
}
