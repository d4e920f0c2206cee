//! Reverse-mode transposition: run a linear function backwards, routing
//! the cotangent of the output into Writer references that accumulate the
//! cotangents of the inputs.

use tabula_core::builder::Builder;
use tabula_core::env::SubstEnv;
use tabula_core::free::{free_vars_atom, free_vars_expr};
use tabula_core::subst::subst_atom;
use tabula_core::syntax::*;
use tabula_core::ty::{tangent_type, type_of_atom, type_of_block, zero_at};
use tabula_utils::prelude::*;

/// Transpose `\x. body : a -o b` into `\ct. a`: a linear map sending a
/// cotangent of `b` to the accumulated cotangent of `a`.
pub fn transpose_lam(bld: &mut Builder, lam: &RcAtom) -> Result<RcAtom> {
    let Atom::Lam(Lam { binder, body, .. }) = lam.as_ref() else {
        return Err(Error::compiler("transpose of a non-lambda"));
    };
    let ct_ty = tangent_type(type_of_block(body)?.as_ref())?;
    let binder = binder.clone();
    let body = body.clone();
    bld.build_lam("ct", ct_ty, ArrowKind::Lin, move |sub, ct| {
        let in_ty = tangent_type(&binder.ty)?;
        let pair = sub.build_run_writer(in_ty, |inner, r| {
            let tr = Transposer {
                lin_refs: im::HashMap::unit(binder.name.clone(), r),
                ref_map: im::HashMap::new(),
                env: SubstEnv::new(),
            };
            tr.transpose_block(inner, &body, ct)?;
            Ok(Atom::unit())
        })?;
        sub.emit_op(PrimOp::Snd(pair))
    })
}

/// Transposition state: `lin_refs` maps linear source variables to the
/// Writer references accumulating their cotangents; `ref_map` maps the
/// source program's reference variables to their transposed counterparts;
/// `env` substitutes the non-linear parts.
#[derive(Clone)]
pub struct Transposer {
    lin_refs: im::HashMap<Name, RcAtom>,
    ref_map: im::HashMap<Name, RcAtom>,
    env: SubstEnv,
}

impl Transposer {
    fn is_lin_atom(&self, a: &RcAtom) -> bool {
        free_vars_atom(a).into_iter().any(|(n, _)| self.lin_refs.contains_key(&n))
    }

    fn is_lin_expr(&self, e: &Expr) -> bool {
        free_vars_expr(e)
            .into_iter()
            .any(|(n, _)| self.lin_refs.contains_key(&n) || self.ref_map.contains_key(&n))
    }

    fn subst(&self, bld: &Builder, a: &RcAtom) -> RcAtom {
        subst_atom(&self.env, bld.scope(), a)
    }

    /// Process declarations per contribution: linear bindings get a Writer
    /// reference scoping over the rest, whose accumulated cotangent is then
    /// pushed through the bound expression; non-linear bindings substitute.
    pub fn transpose_block(&self, bld: &mut Builder, block: &Block, ct: RcAtom) -> Result<()> {
        self.transpose_decls(bld, &block.decls, &block.result, ct)
    }

    fn transpose_decls(
        &self, bld: &mut Builder, decls: &[Decl], result: &Expr, ct: RcAtom,
    ) -> Result<()> {
        let Some((decl, rest)) = decls.split_first() else {
            return self.transpose_expr(bld, result, ct);
        };
        let Decl::Let(_, b, bound) = decl else {
            return Err(Error::not_implemented("transposition of unpack declarations"));
        };
        if self.is_lin_expr(bound) {
            let b_tan = tangent_type(&self.subst(bld, &b.ty))?;
            let mut tr = self.clone();
            let b_name = b.name.clone();
            let pair = bld.build_run_writer(b_tan, |sub, r| {
                tr.lin_refs.insert(b_name, r);
                tr.transpose_decls(sub, rest, result, ct)?;
                Ok(Atom::unit())
            })?;
            let ct_b = bld.emit_op(PrimOp::Snd(pair))?;
            self.transpose_expr(bld, bound, ct_b)
        } else {
            let bound = subst_expr_via(&self.env, bld, bound);
            let val = bld.emit(bound)?;
            let mut tr = self.clone();
            tr.env.insert(b.name.clone(), val);
            tr.transpose_decls(bld, rest, result, ct)
        }
    }

    fn transpose_expr(&self, bld: &mut Builder, expr: &Expr, ct: RcAtom) -> Result<()> {
        use BinOp::*;
        use PrimOp::*;
        match expr {
            | Expr::Atom(a) => self.transpose_atom(bld, a, ct),
            | Expr::Op(op) => match op {
                | ScalarBinOp(FAdd, x, y) => {
                    self.transpose_atom(bld, x, ct.clone())?;
                    self.transpose_atom(bld, y, ct)
                }
                | ScalarBinOp(FSub, x, y) => {
                    self.transpose_atom(bld, x, ct.clone())?;
                    let neg = bld.emit_op(ScalarUnOp(UnOp::FNeg, ct))?;
                    self.transpose_atom(bld, y, neg)
                }
                | ScalarBinOp(FMul, x, y) => {
                    match (self.is_lin_atom(x), self.is_lin_atom(y)) {
                        | (true, true) => Err(Error::linearity(
                            "multiplication of two linear values is not linear",
                        )),
                        | (true, false) => {
                            let y = self.subst(bld, y);
                            let ct = bld.emit_op(ScalarBinOp(FMul, ct, y))?;
                            self.transpose_atom(bld, x, ct)
                        }
                        | (false, true) => {
                            let x = self.subst(bld, x);
                            let ct = bld.emit_op(ScalarBinOp(FMul, x, ct))?;
                            self.transpose_atom(bld, y, ct)
                        }
                        | (false, false) => Err(Error::compiler(
                            "transposing a multiplication with no linear operand",
                        )),
                    }
                }
                | ScalarBinOp(FDiv, x, y) => {
                    if self.is_lin_atom(y) {
                        return Err(Error::linearity(
                            "division by a linear value is not linear",
                        ));
                    }
                    let y = self.subst(bld, y);
                    let ct = bld.emit_op(ScalarBinOp(FDiv, ct, y))?;
                    self.transpose_atom(bld, x, ct)
                }
                | ScalarUnOp(UnOp::FNeg, x) => {
                    let neg = bld.emit_op(ScalarUnOp(UnOp::FNeg, ct))?;
                    self.transpose_atom(bld, x, neg)
                }
                | Fst(x) => {
                    let snd_zero = self.pair_partner_zero(bld, x, true)?;
                    self.transpose_atom(bld, x, Atom::pair(ct, snd_zero))
                }
                | Snd(x) => {
                    let fst_zero = self.pair_partner_zero(bld, x, false)?;
                    self.transpose_atom(bld, x, Atom::pair(fst_zero, ct))
                }
                | PrimEffect(r, EffectOp::Ask) => {
                    let r = self.transposed_ref(r)?;
                    bld.emit_op(PrimEffect(r, EffectOp::Tell(ct)))?;
                    Ok(())
                }
                | PrimEffect(r, EffectOp::Tell(x)) => {
                    let r = self.transposed_ref(r)?;
                    let ct_x = bld.emit_op(PrimEffect(r, EffectOp::Ask))?;
                    // The cotangent of a tell's unit result carries nothing.
                    let _ = ct;
                    self.transpose_atom(bld, x, ct_x)
                }
                | PrimEffect(r, EffectOp::Get) => {
                    let r = self.transposed_ref(r)?;
                    let cur = bld.emit_op(PrimEffect(r.clone(), EffectOp::Get))?;
                    let sum = add_atoms(bld, cur, ct)?;
                    bld.emit_op(PrimEffect(r, EffectOp::Put(sum)))?;
                    Ok(())
                }
                | PrimEffect(r, EffectOp::Put(x)) => {
                    let r = self.transposed_ref(r)?;
                    let ct_x = bld.emit_op(PrimEffect(r.clone(), EffectOp::Get))?;
                    let x_ty = type_of_atom(&ct_x)?;
                    let zero = zero_at(&x_ty)?;
                    bld.emit_op(PrimEffect(r, EffectOp::Put(zero)))?;
                    self.transpose_atom(bld, x, ct_x)
                }
                | _ => Err(Error::not_implemented(format!(
                    "transposition of operation {:?}",
                    op
                ))),
            },
            | Expr::App(ArrowKind::Tab, tab, i) => {
                let Atom::Var(x) = tab.as_ref() else {
                    return Err(Error::linearity("indexed table is not a linear variable"));
                };
                let r = self
                    .lin_refs
                    .get(&x.name)
                    .cloned()
                    .ok_or_else(|| Error::linearity("indexed table is not linear"))?;
                let i = self.subst(bld, i);
                let sub_ref = bld.emit_op(IndexRef(r, i))?;
                bld.emit_op(PrimEffect(sub_ref, EffectOp::Tell(ct)))?;
                Ok(())
            }
            | Expr::App(_, _, _) => {
                Err(Error::not_implemented("transposition of this application"))
            }
            | Expr::Hof(hof) => self.transpose_hof(bld, hof, ct),
            | Expr::Case(_, _, _) => {
                Err(Error::not_implemented("transposition of case expressions"))
            }
        }
    }

    fn transpose_hof(
        &self, bld: &mut Builder, hof: &PrimHof<RcAtom>, ct: RcAtom,
    ) -> Result<()> {
        use PrimHof::*;
        match hof {
            | For(d, lam) => {
                // Flip the direction; each iteration takes its cotangent
                // slice from the output cotangent.
                let Atom::Lam(Lam { binder, body, .. }) = lam.as_ref() else {
                    return Err(Error::compiler("for of a non-lambda"));
                };
                let ix_ty = self.subst(bld, &binder.ty);
                let binder = binder.clone();
                let body = body.clone();
                let tr = self.clone();
                let hint = binder.name.hint.clone();
                bld.build_for(d.flipped(), &hint, ix_ty, move |sub, i| {
                    let ct_i = sub.tab_get(ct, i.clone())?;
                    let mut tr = tr;
                    tr.env.insert(binder.name.clone(), i);
                    tr.transpose_block(sub, &body, ct_i)?;
                    Ok(Atom::unit())
                })?;
                Ok(())
            }
            | RunReader(r, lam) => {
                // Reading a linear value transposes to accumulating its
                // cotangent: RunReader becomes RunWriter.
                let (val_ty, body, ref_name) = self.open_run_lam(bld, lam)?;
                let tr = self.clone();
                let pair = bld.build_run_writer(tangent_type(&val_ty)?, |sub, new_ref| {
                    let mut tr = tr;
                    tr.ref_map.insert(ref_name, new_ref);
                    tr.transpose_block(sub, &body, ct)?;
                    Ok(Atom::unit())
                })?;
                let ct_r = bld.emit_op(PrimOp::Snd(pair))?;
                self.transpose_atom(bld, r, ct_r)
            }
            | RunWriter(lam) => {
                // Accumulation transposes to reading the cotangent of the
                // accumulated output.
                let (_, body, ref_name) = self.open_run_lam(bld, lam)?;
                let ct_ans = bld.emit_op(PrimOp::Fst(ct.clone()))?;
                let ct_w = bld.emit_op(PrimOp::Snd(ct))?;
                let tr = self.clone();
                bld.build_run_reader(ct_w, |sub, new_ref| {
                    let mut tr = tr;
                    tr.ref_map.insert(ref_name, new_ref);
                    tr.transpose_block(sub, &body, ct_ans)?;
                    Ok(Atom::unit())
                })?;
                Ok(())
            }
            | RunState(s, lam) => {
                // State transposition mirrors reader/writer: run backwards
                // with the final-state cotangent as the initial state.
                let (val_ty, body, ref_name) = self.open_run_lam(bld, lam)?;
                let ct_ans = bld.emit_op(PrimOp::Fst(ct.clone()))?;
                let ct_s_final = bld.emit_op(PrimOp::Snd(ct))?;
                let tr = self.clone();
                let st_lam = bld.build_run_lam(
                    EffectName::State,
                    tangent_type(&val_ty)?,
                    move |sub, new_ref| {
                        let mut tr = tr;
                        tr.ref_map.insert(ref_name, new_ref);
                        tr.transpose_block(sub, &body, ct_ans)?;
                        Ok(Atom::unit())
                    },
                )?;
                let pair = bld.emit(Expr::Hof(RunState(ct_s_final, st_lam)))?;
                let ct_s0 = bld.emit_op(PrimOp::Snd(pair))?;
                self.transpose_atom(bld, s, ct_s0)
            }
            | _ => Err(Error::not_implemented("transposition of this primitive")),
        }
    }

    fn transpose_atom(&self, bld: &mut Builder, atom: &RcAtom, ct: RcAtom) -> Result<()> {
        use PrimCon::*;
        match atom.as_ref() {
            | Atom::Var(v) => match self.lin_refs.get(&v.name) {
                | Some(r) => {
                    bld.emit_op(PrimOp::PrimEffect(r.clone(), EffectOp::Tell(ct)))?;
                    Ok(())
                }
                | None => Err(Error::linearity(format!(
                    "cotangent routed to non-linear variable {}",
                    v.name
                ))),
            },
            | Atom::Con(PairCon(a, b)) => {
                let ct_a = bld.emit_op(PrimOp::Fst(ct.clone()))?;
                let ct_b = bld.emit_op(PrimOp::Snd(ct))?;
                self.transpose_atom(bld, a, ct_a)?;
                self.transpose_atom(bld, b, ct_b)
            }
            | Atom::Con(RecCon(r)) => {
                for (field, item) in r.iter() {
                    let ct_f = bld.emit_op(PrimOp::RecGet(ct.clone(), field))?;
                    self.transpose_atom(bld, item, ct_f)?;
                }
                Ok(())
            }
            | Atom::Con(UnitCon) | Atom::Con(Lit(_)) => {
                Err(Error::linearity("cotangent routed to a constant"))
            }
            | _ => Err(Error::not_implemented(format!(
                "transposition of atom {:?}",
                atom
            ))),
        }
    }

    fn transposed_ref(&self, r: &RcAtom) -> Result<RcAtom> {
        let Atom::Var(v) = r.as_ref() else {
            return Err(Error::compiler("reference is not a variable"));
        };
        self.ref_map
            .get(&v.name)
            .cloned()
            .ok_or_else(|| Error::linearity(format!("reference {} is not linear", v.name)))
    }

    /// Open `\region. \ref. body`, returning the carried value type, the
    /// body, and the ref binder name.
    fn open_run_lam(&self, bld: &Builder, lam: &RcAtom) -> Result<(RcTy, Block, Name)> {
        let Atom::Lam(Lam { body: outer, .. }) = lam.as_ref() else {
            return Err(Error::compiler("run* of a non-lambda"));
        };
        let Expr::Atom(inner) = &outer.result else {
            return Err(Error::compiler("run* lambda body must be an inner lambda"));
        };
        let Atom::Lam(Lam { binder: ref_binder, body, .. }) = inner.as_ref() else {
            return Err(Error::compiler("run* lambda body must be an inner lambda"));
        };
        let val_ty = match ref_binder.ty.as_ref() {
            | Atom::TC(PrimTC::Ref(_, a)) => self.subst(bld, a),
            | _ => return Err(Error::compiler("run* inner binder is not a reference")),
        };
        Ok((val_ty, body.clone(), ref_binder.name.clone()))
    }

    /// The zero cotangent for the other half of a projected pair.
    fn pair_partner_zero(&self, bld: &mut Builder, x: &RcAtom, fst: bool) -> Result<RcAtom> {
        let ty = match x.as_ref() {
            | Atom::Var(v) => v.ty.clone(),
            | _ => type_of_atom(&self.subst(bld, x))?,
        };
        match ty.as_ref() {
            | Atom::TC(PrimTC::PairTy(a, b)) => {
                let partner = if fst { b } else { a };
                zero_at(tangent_type(partner)?.as_ref())
            }
            | _ => Err(Error::compiler("projection from a non-pair")),
        }
    }
}

/// Substitute the non-linear environment through an expression.
fn subst_expr_via(env: &SubstEnv, bld: &Builder, e: &Expr) -> Expr {
    tabula_core::subst::subst_expr(env, bld.scope(), e)
}

/// Pointwise addition of two tangents of the same type.
fn add_atoms(bld: &mut Builder, a: RcAtom, b: RcAtom) -> Result<RcAtom> {
    let ty = type_of_atom(&a)?;
    match ty.as_ref() {
        | Atom::TC(PrimTC::Base(BaseTy::Real)) => {
            bld.emit_op(PrimOp::ScalarBinOp(BinOp::FAdd, a, b))
        }
        | Atom::TC(PrimTC::UnitTy) => Ok(Atom::unit()),
        | Atom::TC(PrimTC::PairTy(_, _)) => {
            let fa = bld.emit_op(PrimOp::Fst(a.clone()))?;
            let fb = bld.emit_op(PrimOp::Fst(b.clone()))?;
            let l = add_atoms(bld, fa, fb)?;
            let sa = bld.emit_op(PrimOp::Snd(a))?;
            let sb = bld.emit_op(PrimOp::Snd(b))?;
            let r = add_atoms(bld, sa, sb)?;
            Ok(Atom::pair(l, r))
        }
        | Atom::Pi(pi) if matches!(pi.arr, ArrowKind::Tab) => {
            let ix = pi.binder.ty.clone();
            bld.build_for(Direction::Fwd, "i", ix, move |sub, i| {
                let ai = sub.tab_get(a, i.clone())?;
                let bi = sub.tab_get(b, i)?;
                add_atoms(sub, ai, bi)
            })
        }
        | other => Err(Error::not_implemented(format!("tangent addition at {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tabula_core::env::Scope;
    use tabula_core::simplify::{NoDiff, Simplifier};
    use tabula_imp::interp::{evaluate_block, CoreValue};

    /// Transpose `lam` and run it against the cotangent `ct`.
    fn run_transposed(lam: RcAtom, ct: RcAtom) -> CoreValue {
        let top = SubstEnv::new();
        let rules = SubstEnv::new();
        let nodiff = NoDiff;
        let simp = Simplifier::new(&top, &rules, &nodiff, false);
        let env = SubstEnv::new();

        let mut bld = Builder::new(Scope::new());
        let g = transpose_lam(&mut bld, &lam).unwrap();
        let out =
            simp.simplify_expr(&mut bld, &env, &Expr::App(ArrowKind::Lin, g, ct)).unwrap();
        let block = Block {
            decls: bld.take_decls(),
            result: Expr::Atom(out),
            eff: EffectRow::pure(),
        };
        evaluate_block(&block).unwrap()
    }

    fn lin_lam(binder: Var, decls: Vec<Decl>, result: Expr) -> RcAtom {
        Atom::Lam(Lam {
            arr: ArrowKind::Lin,
            binder,
            body: Block { decls, result, eff: EffectRow::pure() },
        })
        .rc()
    }

    #[test]
    fn doubling_accumulates_both_uses() {
        // transpose (\x. x + x) at cotangent 1.0 = 2.0.
        let x = Var::new(Name::free("x"), Atom::real_ty());
        let f = lin_lam(
            x.clone(),
            Vec::new(),
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FAdd, x.to_atom(), x.to_atom())),
        );
        let v = run_transposed(f, Atom::lit(1.0));
        assert_eq!(v.as_real().unwrap(), 2.0);
    }

    #[test]
    fn scaling_transposes_to_scaling() {
        // transpose (\x. 3.0 * x) applied to y = 3.0 * y.
        let x = Var::new(Name::free("x"), Atom::real_ty());
        let f = lin_lam(
            x.clone(),
            Vec::new(),
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FMul, Atom::lit(3.0), x.to_atom())),
        );
        let v = run_transposed(f, Atom::lit(2.0));
        assert_eq!(v.as_real().unwrap(), 6.0);
    }

    #[test]
    fn pair_sum_routes_the_cotangent_to_both_components() {
        // transpose (\(x, y). x + y) at cotangent c = (c, c).
        let p = Var::new(
            Name::free("p"),
            Atom::pair_ty(Atom::real_ty(), Atom::real_ty()),
        );
        let a = Var::new(Name::free("a"), Atom::real_ty());
        let b = Var::new(Name::free("b"), Atom::real_ty());
        let f = lin_lam(
            p.clone(),
            vec![
                Decl::Let(LetAnn::Plain, a.clone(), Expr::Op(PrimOp::Fst(p.to_atom()))),
                Decl::Let(LetAnn::Plain, b.clone(), Expr::Op(PrimOp::Snd(p.to_atom()))),
            ],
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FAdd, a.to_atom(), b.to_atom())),
        );
        let v = run_transposed(f, Atom::lit(1.5));
        assert_eq!(
            v,
            CoreValue::Pair(
                Box::new(CoreValue::Lit(Literal::Real(1.5))),
                Box::new(CoreValue::Lit(Literal::Real(1.5))),
            )
        );
    }

    #[test]
    fn multiplying_two_linear_values_is_a_linearity_error() {
        let x = Var::new(Name::free("x"), Atom::real_ty());
        let f = lin_lam(
            x.clone(),
            Vec::new(),
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FMul, x.to_atom(), x.to_atom())),
        );
        let mut bld = Builder::new(Scope::new());
        let err = transpose_lam(&mut bld, &f).unwrap_err();
        assert_eq!(err.kind, ErrKind::LinErr);
    }
}
