//! Types of atoms and expressions. Types are intrinsic: every variable
//! carries its annotation, so no environment is needed — only structural
//! synthesis. Failures here are compiler bugs: elaborated input is typed.

use crate::subst::apply_pi;
use crate::syntax::*;
use tabula_utils::prelude::*;

pub fn type_of_atom(atom: &Atom) -> Result<RcTy> {
    match atom {
        | Atom::Var(v) => Ok(v.ty.clone()),
        | Atom::Lam(Lam { arr, binder, body }) => {
            let body_ty = type_of_block(body)?;
            Ok(Atom::Pi(PiTy { arr: arr.clone(), binder: binder.clone(), body: body_ty }).rc())
        }
        | Atom::Pi(_) => Ok(Atom::ty_kind()),
        | Atom::Con(con) => con_type(con),
        | Atom::TC(_) => Ok(Atom::ty_kind()),
        | Atom::Eff(_) => Ok(Atom::TC(PrimTC::EffectKind).rc()),
    }
}

fn con_type(con: &PrimCon<RcAtom>) -> Result<RcTy> {
    use PrimCon::*;
    match con {
        | Lit(l) => Ok(Atom::base(l.base_ty())),
        | PairCon(a, b) => Ok(Atom::pair_ty(type_of_atom(a)?, type_of_atom(b)?)),
        | UnitCon => Ok(Atom::unit_ty()),
        | RecCon(r) => {
            Ok(Atom::TC(PrimTC::RecordTy(r.try_map(|a| type_of_atom(a))?)).rc())
        }
        | DataCon(def, params, _, _) => {
            Ok(Atom::TC(PrimTC::TypeCon(def.clone(), params.clone())).rc())
        }
        | AnyValue(t) => Ok(t.clone()),
        | IntRangeVal(l, h, _) => Ok(Atom::TC(PrimTC::IntRange(l.clone(), h.clone())).rc()),
        | IndexRangeVal(t, l, h, _) => {
            Ok(Atom::TC(PrimTC::IndexRange(t.clone(), l.clone(), h.clone())).rc())
        }
        | SumCon(_, l, r) => {
            Ok(Atom::TC(PrimTC::SumTy(type_of_atom(l)?, type_of_atom(r)?)).rc())
        }
        | SumAsProd(ty, _, _) => Ok(ty.clone()),
        | AFor(n, body) => Ok(Atom::tab_ty(n.clone(), type_of_atom(body)?)),
        | CharCon(_) => Ok(Atom::TC(PrimTC::CharTy).rc()),
        | ArrayLit(t, _) => Ok(t.clone()),
    }
}

pub fn type_of_expr(expr: &Expr) -> Result<RcTy> {
    match expr {
        | Expr::App(_, f, x) => match type_of_atom(f)?.as_ref() {
            | Atom::Pi(pi) => Ok(apply_pi(pi, x)),
            | other => Err(Error::compiler(format!(
                "application head is not a Pi type: {:?}",
                other
            ))),
        },
        | Expr::Atom(a) => type_of_atom(a),
        | Expr::Op(op) => op_type(op),
        | Expr::Hof(hof) => hof_type(hof),
        | Expr::Case(_, _, ty) => Ok(ty.clone()),
    }
}

pub fn type_of_block(block: &Block) -> Result<RcTy> {
    type_of_expr(&block.result)
}

/// Argument and result base types of a scalar binary op.
pub fn bin_op_types(op: BinOp) -> (BaseTy, BaseTy) {
    use BaseTy::*;
    use BinOp::*;
    match op {
        | IAdd | ISub | IMul | IDiv | IRem => (Int, Int),
        | And | Or => (Bool, Bool),
        | ICmp(_) => (Int, Bool),
        | FAdd | FSub | FMul | FDiv => (Real, Real),
        | FCmp(_) => (Real, Bool),
    }
}

pub fn un_op_types(op: UnOp) -> (BaseTy, BaseTy) {
    use BaseTy::*;
    use UnOp::*;
    match op {
        | FNeg => (Real, Real),
        | INeg => (Int, Int),
        | Not => (Bool, Bool),
        | IntToReal => (Int, Real),
    }
}

fn op_type(op: &PrimOp<RcAtom>) -> Result<RcTy> {
    use PrimOp::*;
    match op {
        | ScalarBinOp(op, _, _) => Ok(Atom::base(bin_op_types(*op).1)),
        | ScalarUnOp(op, _) => Ok(Atom::base(un_op_types(*op).1)),
        | Cmp(_, _, _, _) => Ok(Atom::bool_ty()),
        | Select(_, x, _) => type_of_atom(x),
        | RecGet(x, field) => match type_of_atom(x)?.as_ref() {
            | Atom::TC(PrimTC::RecordTy(r)) => r
                .get(field)
                .cloned()
                .ok_or_else(|| Error::compiler(format!("no record field {}", field))),
            | _ => Err(Error::compiler("RecGet on non-record")),
        },
        | SumGet(x, left) => match type_of_atom(x)?.as_ref() {
            | Atom::TC(PrimTC::SumTy(l, r)) => {
                Ok(if *left { l.clone() } else { r.clone() })
            }
            | _ => Err(Error::compiler("SumGet on non-sum")),
        },
        | SumTag(_) => Ok(Atom::bool_ty()),
        | Fst(x) => match type_of_atom(x)?.as_ref() {
            | Atom::TC(PrimTC::PairTy(a, _)) => Ok(a.clone()),
            | _ => Err(Error::compiler("Fst on non-pair")),
        },
        | Snd(x) => match type_of_atom(x)?.as_ref() {
            | Atom::TC(PrimTC::PairTy(_, b)) => Ok(b.clone()),
            | _ => Err(Error::compiler("Snd on non-pair")),
        },
        | IndexAsInt(_) => Ok(Atom::int_ty()),
        | IntAsIndex(t, _) => Ok(t.clone()),
        | IdxSetSize(_) => Ok(Atom::int_ty()),
        | PrimEffect(r, op) => match type_of_atom(r)?.as_ref() {
            | Atom::TC(PrimTC::Ref(_, a)) => Ok(match op {
                | EffectOp::Ask | EffectOp::Get => a.clone(),
                | EffectOp::Tell(_) | EffectOp::Put(_) => Atom::unit_ty(),
            }),
            | _ => Err(Error::compiler("effect op on non-reference")),
        },
        | IndexRef(r, i) => match type_of_atom(r)?.as_ref() {
            | Atom::TC(PrimTC::Ref(h, tab)) => match tab.as_ref() {
                | Atom::Pi(pi) if matches!(pi.arr, ArrowKind::Tab) => {
                    Ok(Atom::ref_ty(h.clone(), apply_pi(pi, i)))
                }
                | _ => Err(Error::compiler("IndexRef on non-table reference")),
            },
            | _ => Err(Error::compiler("IndexRef on non-reference")),
        },
        | PtrOffset(_, _) | PtrLoad(_) => {
            Err(Error::compiler("pointer ops have no core type"))
        }
    }
}

fn hof_type(hof: &PrimHof<RcAtom>) -> Result<RcTy> {
    use PrimHof::*;
    match hof {
        | For(_, lam) => match lam.as_ref() {
            | Atom::Lam(Lam { binder, body, .. }) => {
                Ok(Atom::Pi(PiTy {
                    arr: ArrowKind::Tab,
                    binder: binder.clone(),
                    body: type_of_block(body)?,
                })
                .rc())
            }
            | _ => Err(Error::compiler("For of a non-lambda")),
        },
        | While(_, _) => Ok(Atom::unit_ty()),
        | RunReader(_, lam) => Ok(run_body_ty(lam)?.0),
        | RunWriter(lam) => {
            let (body, ref_val) = run_body_ty(lam)?;
            Ok(Atom::pair_ty(body, ref_val))
        }
        | RunState(s, lam) => {
            let (body, _) = run_body_ty(lam)?;
            Ok(Atom::pair_ty(body, type_of_atom(s)?))
        }
        | Linearize(lam) => match type_of_atom(lam)?.as_ref() {
            | Atom::Pi(pi) => {
                let a = pi.binder.ty.clone();
                let b = pi.body.clone();
                let ta = tangent_type(&a)?;
                let tb = tangent_type(&b)?;
                let lin = Atom::Pi(PiTy {
                    arr: ArrowKind::Lin,
                    binder: Var::new(Name::gen("t"), ta),
                    body: tb,
                })
                .rc();
                Ok(Atom::Pi(PiTy {
                    arr: ArrowKind::pure(),
                    binder: pi.binder.clone(),
                    body: Atom::pair_ty(b, lin),
                })
                .rc())
            }
            | _ => Err(Error::compiler("Linearize of a non-function")),
        },
        | Transpose(lam) => match type_of_atom(lam)?.as_ref() {
            | Atom::Pi(pi) => Ok(Atom::Pi(PiTy {
                arr: ArrowKind::Lin,
                binder: Var::new(Name::gen("ct"), pi.body.clone()),
                body: pi.binder.ty.clone(),
            })
            .rc()),
            | _ => Err(Error::compiler("Transpose of a non-function")),
        },
    }
}

/// The body and reference-value types of a `\region. \ref. body` lambda.
fn run_body_ty(lam: &RcAtom) -> Result<(RcTy, RcTy)> {
    let Atom::Lam(Lam { body: outer, .. }) = lam.as_ref() else {
        return Err(Error::compiler("run* of a non-lambda"));
    };
    let Expr::Atom(inner) = &outer.result else {
        return Err(Error::compiler("run* lambda body must be an inner lambda"));
    };
    let Atom::Lam(Lam { binder: ref_binder, body, .. }) = inner.as_ref() else {
        return Err(Error::compiler("run* lambda body must be an inner lambda"));
    };
    let ref_val = match ref_binder.ty.as_ref() {
        | Atom::TC(PrimTC::Ref(_, a)) => a.clone(),
        | _ => return Err(Error::compiler("run* inner binder is not a reference")),
    };
    Ok((type_of_block(body)?, ref_val))
}

/* --------------------------------- Effects --------------------------------- */

/// The effect row an expression performs, used to label blocks: the least
/// upper bound over declarations and result is taken by the builder.
pub fn expr_effect(expr: &Expr) -> Result<EffectRow> {
    match expr {
        | Expr::App(arr, _, _) => Ok(arr.eff()),
        | Expr::Atom(_) => Ok(EffectRow::pure()),
        | Expr::Op(PrimOp::PrimEffect(r, op)) => match type_of_atom(r)?.as_ref() {
            | Atom::TC(PrimTC::Ref(region, a)) => {
                let Atom::Var(region) = region.as_ref() else {
                    return Err(Error::compiler("reference region is not a variable"));
                };
                let name = match op {
                    | EffectOp::Ask => EffectName::Reader,
                    | EffectOp::Tell(_) => EffectName::Writer,
                    | EffectOp::Get | EffectOp::Put(_) => EffectName::State,
                };
                Ok(EffectRow::single(region.name.clone(), name, a.clone()))
            }
            | _ => Err(Error::compiler("effect op on non-reference")),
        },
        | Expr::Op(_) => Ok(EffectRow::pure()),
        | Expr::Hof(hof) => hof_effect(hof),
        | Expr::Case(_, alts, _) => Ok(EffectRow::concat(
            alts.iter().map(|alt| alt.body.eff.clone()),
        )),
    }
}

fn hof_effect(hof: &PrimHof<RcAtom>) -> Result<EffectRow> {
    use PrimHof::*;
    match hof {
        | For(_, lam) | While(_, lam) => lam_eff(lam),
        | RunReader(_, lam) | RunWriter(lam) | RunState(_, lam) => {
            let (region, inner_eff) = run_region_eff(lam)?;
            Ok(inner_eff.removing(&region))
        }
        | Linearize(_) | Transpose(_) => Ok(EffectRow::pure()),
    }
}

fn lam_eff(lam: &RcAtom) -> Result<EffectRow> {
    match lam.as_ref() {
        | Atom::Lam(Lam { arr, .. }) => Ok(arr.eff()),
        | _ => Err(Error::compiler("expected a lambda")),
    }
}

/// The region bound by a `\region. \ref. body` lambda and the effect row
/// of its body.
fn run_region_eff(lam: &RcAtom) -> Result<(Name, EffectRow)> {
    let Atom::Lam(Lam { binder, body, .. }) = lam.as_ref() else {
        return Err(Error::compiler("run* of a non-lambda"));
    };
    let Expr::Atom(inner) = &body.result else {
        return Err(Error::compiler("run* lambda body must be an inner lambda"));
    };
    let Atom::Lam(Lam { arr, .. }) = inner.as_ref() else {
        return Err(Error::compiler("run* lambda body must be an inner lambda"));
    };
    Ok((binder.name.clone(), arr.eff()))
}

impl Monoid for EffectRow {
    fn unit() -> Self {
        EffectRow::pure()
    }
    fn append(self, other: Self) -> Self {
        self.union(&other)
    }
}

/* ------------------------------ Classification ----------------------------- */

/// Data types are those whose values lower to memory without residual
/// functions: base scalars, index sets, references, and tables, records,
/// pairs and sums thereof.
pub fn is_data(ty: &Ty) -> bool {
    match ty {
        | Atom::TC(tc) => match tc {
            | PrimTC::Base(_)
            | PrimTC::IntRange(_, _)
            | PrimTC::IndexRange(_, _, _)
            | PrimTC::Array(_, _)
            | PrimTC::UnitTy
            | PrimTC::CharTy => true,
            | PrimTC::RecordTy(r) => r.iter().all(|(_, t)| is_data(t)),
            | PrimTC::PairTy(a, b) => is_data(a) && is_data(b),
            | PrimTC::SumTy(l, r) => is_data(l) && is_data(r),
            | PrimTC::Ref(_, a) => is_data(a),
            | PrimTC::TypeCon(def, _) => def
                .cons
                .iter()
                .all(|c| c.binders.iter().all(|b| is_data(&b.ty))),
            | PrimTC::TyKind | PrimTC::EffectKind => false,
        },
        | Atom::Pi(pi) => matches!(pi.arr, ArrowKind::Tab) && is_data(&pi.body),
        | _ => false,
    }
}

/// Index-set types: those a `for` can iterate and tables can be keyed by.
pub fn is_index_set(ty: &Ty) -> bool {
    matches!(
        ty,
        Atom::TC(PrimTC::IntRange(_, _))
            | Atom::TC(PrimTC::IndexRange(_, _, _))
            | Atom::TC(PrimTC::Base(BaseTy::Bool))
            | Atom::TC(PrimTC::CharTy)
    )
}

/// The unique inhabitant of a singleton type, if the type is one: unit,
/// products of singletons, and tables of singletons.
pub fn singleton_value(ty: &Ty) -> Option<RcAtom> {
    match ty {
        | Atom::TC(PrimTC::UnitTy) => Some(Atom::unit()),
        | Atom::TC(PrimTC::PairTy(a, b)) => {
            Some(Atom::pair(singleton_value(a)?, singleton_value(b)?))
        }
        | Atom::TC(PrimTC::RecordTy(r)) => {
            let items = r.try_map(|t| singleton_value(t).ok_or(())).ok()?;
            Some(Atom::Con(PrimCon::RecCon(items)).rc())
        }
        | Atom::Pi(pi) if matches!(pi.arr, ArrowKind::Tab) => {
            let body = singleton_value(&pi.body)?;
            Some(Atom::Con(PrimCon::AFor(pi.binder.ty.clone(), body)).rc())
        }
        | _ => None,
    }
}

/* -------------------------------- Tangents --------------------------------- */

/// The type of tangents at `ty`. `Real` is its own tangent space, other
/// base types have trivial tangents, and structures go pointwise.
pub fn tangent_type(ty: &Ty) -> Result<RcTy> {
    match ty {
        | Atom::TC(PrimTC::Base(BaseTy::Real)) => Ok(Atom::real_ty()),
        | Atom::TC(PrimTC::Base(_))
        | Atom::TC(PrimTC::IntRange(_, _))
        | Atom::TC(PrimTC::IndexRange(_, _, _))
        | Atom::TC(PrimTC::UnitTy)
        | Atom::TC(PrimTC::CharTy) => Ok(Atom::unit_ty()),
        | Atom::TC(PrimTC::PairTy(a, b)) => {
            Ok(Atom::pair_ty(tangent_type(a)?, tangent_type(b)?))
        }
        | Atom::TC(PrimTC::RecordTy(r)) => {
            Ok(Atom::TC(PrimTC::RecordTy(r.try_map(|t| tangent_type(t))?)).rc())
        }
        | Atom::TC(PrimTC::SumTy(_, _)) => Ok(Atom::unit_ty()),
        | Atom::Pi(pi) if matches!(pi.arr, ArrowKind::Tab) => Ok(Atom::Pi(PiTy {
            arr: ArrowKind::Tab,
            binder: pi.binder.clone(),
            body: tangent_type(&pi.body)?,
        })
        .rc()),
        | other => Err(Error::not_implemented(format!(
            "differentiation of type {:?}",
            other
        ))),
    }
}

/// The zero of a tangent type.
pub fn zero_at(ty: &Ty) -> Result<RcAtom> {
    match ty {
        | Atom::TC(PrimTC::Base(BaseTy::Real)) => Ok(Atom::lit(0.0)),
        | Atom::TC(PrimTC::UnitTy) => Ok(Atom::unit()),
        | Atom::TC(PrimTC::PairTy(a, b)) => Ok(Atom::pair(zero_at(a)?, zero_at(b)?)),
        | Atom::TC(PrimTC::RecordTy(r)) => {
            Ok(Atom::Con(PrimCon::RecCon(r.try_map(|t| zero_at(t))?)).rc())
        }
        | Atom::Pi(pi) if matches!(pi.arr, ArrowKind::Tab) => {
            Ok(Atom::Con(PrimCon::AFor(pi.binder.ty.clone(), zero_at(&pi.body)?)).rc())
        }
        | other => Err(Error::not_implemented(format!("zero at type {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn table_of_reals_is_data() {
        let tab = Atom::tab_ty(Atom::int_range(0, 4), Atom::real_ty());
        assert!(is_data(&tab));
        assert!(!is_data(&Atom::Pi(PiTy {
            arr: ArrowKind::pure(),
            binder: Var::new(Name::gen("x"), Atom::int_ty()),
            body: Atom::int_ty(),
        })));
    }

    #[test]
    fn tangents_of_structures() {
        let ty = Atom::pair_ty(Atom::real_ty(), Atom::int_ty());
        let tan = tangent_type(&ty).unwrap();
        assert_eq!(tan, Atom::pair_ty(Atom::real_ty(), Atom::unit_ty()));
    }

    #[test]
    fn singleton_of_unit_table() {
        let tab = Atom::tab_ty(Atom::int_range(0, 3), Atom::unit_ty());
        let v = singleton_value(&tab).unwrap();
        assert!(matches!(v.as_ref(), Atom::Con(PrimCon::AFor(_, _))));
        assert!(singleton_value(&Atom::real_ty()).is_none());
    }

    #[test]
    fn pair_projection_types() {
        let p = Atom::pair(Atom::lit(1), Atom::lit(2.0));
        let fst = op_type(&PrimOp::Fst(p.clone())).unwrap();
        let snd = op_type(&PrimOp::Snd(p)).unwrap();
        assert_eq!(fst, Atom::int_ty());
        assert_eq!(snd, Atom::real_ty());
    }
}
