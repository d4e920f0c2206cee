//! Alpha-equivalence. Binders on both sides are replaced by a shared
//! skolem variable of the binder type, so dependent bodies compare
//! structurally without committing to either name.

use crate::env::{Scope, SubstEnv};
use crate::subst::{subst_atom, subst_block};
use crate::syntax::*;

pub fn alpha_eq(a: &RcAtom, b: &RcAtom) -> bool {
    atom_eq(a, b, 0)
}

fn skolem(depth: usize, ty: &RcTy) -> Var {
    Var::new(Name::new(NameTag::Skolem, "skol", depth), ty.clone())
}

fn atom_eq(a: &RcAtom, b: &RcAtom, depth: usize) -> bool {
    match (a.as_ref(), b.as_ref()) {
        | (Atom::Var(va), Atom::Var(vb)) => va.name == vb.name,
        | (Atom::Lam(la), Atom::Lam(lb)) => {
            arrow_eq(&la.arr, &lb.arr, depth)
                && atom_eq(&la.binder.ty, &lb.binder.ty, depth)
                && {
                    let sk = skolem(depth, &la.binder.ty);
                    let ba = open_block(&la.binder, &sk, &la.body);
                    let bb = open_block(&lb.binder, &sk, &lb.body);
                    block_eq(&ba, &bb, depth + 1)
                }
        }
        | (Atom::Pi(pa), Atom::Pi(pb)) => {
            arrow_eq(&pa.arr, &pb.arr, depth)
                && atom_eq(&pa.binder.ty, &pb.binder.ty, depth)
                && {
                    let sk = skolem(depth, &pa.binder.ty);
                    let ba = open_atom(&pa.binder, &sk, &pa.body);
                    let bb = open_atom(&pb.binder, &sk, &pb.body);
                    atom_eq(&ba, &bb, depth + 1)
                }
        }
        | (Atom::Con(ca), Atom::Con(cb)) => prim_con_eq(ca, cb, depth),
        | (Atom::TC(ta), Atom::TC(tb)) => prim_tc_eq(ta, tb, depth),
        | (Atom::Eff(ea), Atom::Eff(eb)) => eff_eq(ea, eb, depth),
        | _ => false,
    }
}

fn open_atom(binder: &Var, sk: &Var, body: &RcAtom) -> RcAtom {
    let env = SubstEnv::singleton(binder.name.clone(), sk.to_atom());
    subst_atom(&env, &Scope::new().binder(sk), body)
}

fn open_block(binder: &Var, sk: &Var, body: &Block) -> Block {
    let env = SubstEnv::singleton(binder.name.clone(), sk.to_atom());
    subst_block(&env, &Scope::new().binder(sk), body)
}

fn block_eq(a: &Block, b: &Block, depth: usize) -> bool {
    if a.decls.len() != b.decls.len() || !eff_eq(&a.eff, &b.eff, depth) {
        return false;
    }
    // Rather than opening declaration binders pairwise, compare blocks by
    // sequentially renaming both sides' binders to shared skolems.
    let mut a = a.clone();
    let mut b = b.clone();
    for i in 0..a.decls.len() {
        let (ba, bb) = (a.decls[i].binders(), b.decls[i].binders());
        if ba.len() != bb.len() {
            return false;
        }
        let pairs: Vec<(Var, Var)> =
            ba.into_iter().cloned().zip(bb.into_iter().cloned()).collect();
        for (j, (va, vb)) in pairs.into_iter().enumerate() {
            if !atom_eq(&va.ty, &vb.ty, depth) {
                return false;
            }
            let sk = Var::new(
                Name::new(NameTag::Skolem, "skol", depth * 97 + i * 13 + j),
                va.ty.clone(),
            );
            a = open_block(&va, &sk, &a);
            b = open_block(&vb, &sk, &b);
        }
    }
    a.decls
        .iter()
        .zip(&b.decls)
        .all(|(da, db)| expr_eq(da.expr(), db.expr(), depth))
        && expr_eq(&a.result, &b.result, depth)
}

fn expr_eq(a: &Expr, b: &Expr, depth: usize) -> bool {
    match (a, b) {
        | (Expr::App(ka, fa, xa), Expr::App(kb, fb, xb)) => {
            arrow_eq(ka, kb, depth) && atom_eq(fa, fb, depth) && atom_eq(xa, xb, depth)
        }
        | (Expr::Atom(x), Expr::Atom(y)) => atom_eq(x, y, depth),
        | (Expr::Op(oa), Expr::Op(ob)) => prim_op_eq(oa, ob, depth),
        | (Expr::Hof(ha), Expr::Hof(hb)) => prim_hof_eq(ha, hb, depth),
        | (Expr::Case(sa, aa, ta), Expr::Case(sb, ab, tb)) => {
            atom_eq(sa, sb, depth)
                && atom_eq(ta, tb, depth)
                && aa.len() == ab.len()
                && aa.iter().zip(ab).all(|(x, y)| alt_eq(x, y, depth))
        }
        | _ => false,
    }
}

fn alt_eq(a: &Alt, b: &Alt, depth: usize) -> bool {
    if a.binders.len() != b.binders.len() {
        return false;
    }
    let mut ba = a.body.clone();
    let mut bb = b.body.clone();
    for (j, (va, vb)) in a.binders.iter().zip(&b.binders).enumerate() {
        if !atom_eq(&va.ty, &vb.ty, depth) {
            return false;
        }
        let sk = Var::new(Name::new(NameTag::Skolem, "skol", depth * 31 + j), va.ty.clone());
        ba = open_block(va, &sk, &ba);
        bb = open_block(vb, &sk, &bb);
    }
    block_eq(&ba, &bb, depth + 1)
}

fn arrow_eq(a: &ArrowKind, b: &ArrowKind, depth: usize) -> bool {
    match (a, b) {
        | (ArrowKind::Plain(ea), ArrowKind::Plain(eb)) => eff_eq(ea, eb, depth),
        | (ArrowKind::Implicit, ArrowKind::Implicit) => true,
        | (ArrowKind::Tab, ArrowKind::Tab) => true,
        | (ArrowKind::Lin, ArrowKind::Lin) => true,
        | _ => false,
    }
}

fn eff_eq(a: &EffectRow, b: &EffectRow, depth: usize) -> bool {
    a.tail == b.tail
        && a.row.len() == b.row.len()
        && a.row.iter().zip(&b.row).all(|((ra, (na, ta)), (rb, (nb, tb)))| {
            ra == rb && na == nb && atom_eq(ta, tb, depth)
        })
}

fn limit_eq(a: &Limit<RcAtom>, b: &Limit<RcAtom>, depth: usize) -> bool {
    match (a, b) {
        | (Limit::Inclusive(x), Limit::Inclusive(y)) => atom_eq(x, y, depth),
        | (Limit::Exclusive(x), Limit::Exclusive(y)) => atom_eq(x, y, depth),
        | (Limit::Unlimited, Limit::Unlimited) => true,
        | _ => false,
    }
}

fn all_eq(xs: &[RcAtom], ys: &[RcAtom], depth: usize) -> bool {
    xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| atom_eq(x, y, depth))
}

fn record_eq(a: &Record<RcAtom>, b: &Record<RcAtom>, depth: usize) -> bool {
    match (a, b) {
        | (Record::Tup(xs), Record::Tup(ys)) => all_eq(xs, ys, depth),
        | (Record::Named(xs), Record::Named(ys)) => {
            xs.len() == ys.len()
                && xs.iter().zip(ys).all(|((la, x), (lb, y))| la == lb && atom_eq(x, y, depth))
        }
        | _ => false,
    }
}

fn prim_con_eq(a: &PrimCon<RcAtom>, b: &PrimCon<RcAtom>, depth: usize) -> bool {
    use PrimCon::*;
    match (a, b) {
        | (Lit(x), Lit(y)) => x == y,
        | (PairCon(xa, ya), PairCon(xb, yb)) => atom_eq(xa, xb, depth) && atom_eq(ya, yb, depth),
        | (UnitCon, UnitCon) => true,
        | (RecCon(ra), RecCon(rb)) => record_eq(ra, rb, depth),
        | (DataCon(da, pa, ia, aa), DataCon(db, pb, ib, ab)) => {
            da.name == db.name && ia == ib && all_eq(pa, pb, depth) && all_eq(aa, ab, depth)
        }
        | (AnyValue(x), AnyValue(y)) => atom_eq(x, y, depth),
        | (IntRangeVal(la, ha, ia), IntRangeVal(lb, hb, ib)) => {
            atom_eq(la, lb, depth) && atom_eq(ha, hb, depth) && atom_eq(ia, ib, depth)
        }
        | (IndexRangeVal(ta, la, ha, ia), IndexRangeVal(tb, lb, hb, ib)) => {
            atom_eq(ta, tb, depth)
                && limit_eq(la, lb, depth)
                && limit_eq(ha, hb, depth)
                && atom_eq(ia, ib, depth)
        }
        | (SumCon(ta, la, ra), SumCon(tb, lb, rb)) => {
            atom_eq(ta, tb, depth) && atom_eq(la, lb, depth) && atom_eq(ra, rb, depth)
        }
        | (SumAsProd(ta, ga, pa), SumAsProd(tb, gb, pb)) => {
            atom_eq(ta, tb, depth)
                && atom_eq(ga, gb, depth)
                && pa.len() == pb.len()
                && pa.iter().zip(pb).all(|(xs, ys)| all_eq(xs, ys, depth))
        }
        | (AFor(na, xa), AFor(nb, xb)) => atom_eq(na, nb, depth) && atom_eq(xa, xb, depth),
        | (CharCon(x), CharCon(y)) => atom_eq(x, y, depth),
        | (ArrayLit(ta, la), ArrayLit(tb, lb)) => atom_eq(ta, tb, depth) && la == lb,
        | _ => false,
    }
}

fn prim_tc_eq(a: &PrimTC<RcAtom>, b: &PrimTC<RcAtom>, depth: usize) -> bool {
    use PrimTC::*;
    match (a, b) {
        | (Base(x), Base(y)) => x == y,
        | (IntRange(la, ha), IntRange(lb, hb)) => {
            atom_eq(la, lb, depth) && atom_eq(ha, hb, depth)
        }
        | (IndexRange(ta, la, ha), IndexRange(tb, lb, hb)) => {
            atom_eq(ta, tb, depth) && limit_eq(la, lb, depth) && limit_eq(ha, hb, depth)
        }
        | (Array(na, ba), Array(nb, bb)) => na == nb && ba == bb,
        | (RecordTy(ra), RecordTy(rb)) => record_eq(ra, rb, depth),
        | (SumTy(la, ra), SumTy(lb, rb)) => atom_eq(la, lb, depth) && atom_eq(ra, rb, depth),
        | (Ref(ra, aa), Ref(rb, ab)) => atom_eq(ra, rb, depth) && atom_eq(aa, ab, depth),
        | (TyKind, TyKind) => true,
        | (EffectKind, EffectKind) => true,
        | (PairTy(xa, ya), PairTy(xb, yb)) => atom_eq(xa, xb, depth) && atom_eq(ya, yb, depth),
        | (UnitTy, UnitTy) => true,
        | (CharTy, CharTy) => true,
        | (TypeCon(da, pa), TypeCon(db, pb)) => da.name == db.name && all_eq(pa, pb, depth),
        | _ => false,
    }
}

fn prim_op_eq(a: &PrimOp<RcAtom>, b: &PrimOp<RcAtom>, depth: usize) -> bool {
    use PrimOp::*;
    match (a, b) {
        | (ScalarBinOp(oa, xa, ya), ScalarBinOp(ob, xb, yb)) => {
            oa == ob && atom_eq(xa, xb, depth) && atom_eq(ya, yb, depth)
        }
        | (ScalarUnOp(oa, xa), ScalarUnOp(ob, xb)) => oa == ob && atom_eq(xa, xb, depth),
        | (Cmp(oa, ta, xa, ya), Cmp(ob, tb, xb, yb)) => {
            oa == ob && atom_eq(ta, tb, depth) && atom_eq(xa, xb, depth) && atom_eq(ya, yb, depth)
        }
        | (Select(pa, xa, ya), Select(pb, xb, yb)) => {
            atom_eq(pa, pb, depth) && atom_eq(xa, xb, depth) && atom_eq(ya, yb, depth)
        }
        | (RecGet(xa, fa), RecGet(xb, fb)) => fa == fb && atom_eq(xa, xb, depth),
        | (SumGet(xa, la), SumGet(xb, lb)) => la == lb && atom_eq(xa, xb, depth),
        | (SumTag(xa), SumTag(xb)) => atom_eq(xa, xb, depth),
        | (Fst(xa), Fst(xb)) | (Snd(xa), Snd(xb)) => atom_eq(xa, xb, depth),
        | (IndexAsInt(xa), IndexAsInt(xb)) => atom_eq(xa, xb, depth),
        | (IntAsIndex(ta, xa), IntAsIndex(tb, xb)) => {
            atom_eq(ta, tb, depth) && atom_eq(xa, xb, depth)
        }
        | (IdxSetSize(ta), IdxSetSize(tb)) => atom_eq(ta, tb, depth),
        | (PrimEffect(ra, oa), PrimEffect(rb, ob)) => {
            atom_eq(ra, rb, depth)
                && match (oa, ob) {
                    | (EffectOp::Ask, EffectOp::Ask) => true,
                    | (EffectOp::Tell(x), EffectOp::Tell(y)) => atom_eq(x, y, depth),
                    | (EffectOp::Get, EffectOp::Get) => true,
                    | (EffectOp::Put(x), EffectOp::Put(y)) => atom_eq(x, y, depth),
                    | _ => false,
                }
        }
        | (IndexRef(ra, ia), IndexRef(rb, ib)) => {
            atom_eq(ra, rb, depth) && atom_eq(ia, ib, depth)
        }
        | (PtrOffset(pa, oa), PtrOffset(pb, ob)) => {
            atom_eq(pa, pb, depth) && atom_eq(oa, ob, depth)
        }
        | (PtrLoad(pa), PtrLoad(pb)) => atom_eq(pa, pb, depth),
        | _ => false,
    }
}

fn prim_hof_eq(a: &PrimHof<RcAtom>, b: &PrimHof<RcAtom>, depth: usize) -> bool {
    use PrimHof::*;
    match (a, b) {
        | (For(da, xa), For(db, xb)) => da == db && atom_eq(xa, xb, depth),
        | (While(ca, ba), While(cb, bb)) => atom_eq(ca, cb, depth) && atom_eq(ba, bb, depth),
        | (RunReader(ra, la), RunReader(rb, lb)) => {
            atom_eq(ra, rb, depth) && atom_eq(la, lb, depth)
        }
        | (RunWriter(la), RunWriter(lb)) => atom_eq(la, lb, depth),
        | (RunState(sa, la), RunState(sb, lb)) => {
            atom_eq(sa, sb, depth) && atom_eq(la, lb, depth)
        }
        | (Linearize(la), Linearize(lb)) | (Transpose(la), Transpose(lb)) => {
            atom_eq(la, lb, depth)
        }
        | _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pi(hint: &str, body: impl FnOnce(&Var) -> RcTy) -> RcAtom {
        let binder = Var::new(Name::free(hint), Atom::int_ty());
        let body = body(&binder);
        Atom::Pi(PiTy { arr: ArrowKind::pure(), binder, body }).rc()
    }

    #[test]
    fn pi_alpha_equivalence() {
        let p1 = pi("n", |n| Atom::TC(PrimTC::IntRange(Atom::lit(0), n.to_atom())).rc());
        let p2 = pi("m", |m| Atom::TC(PrimTC::IntRange(Atom::lit(0), m.to_atom())).rc());
        assert!(alpha_eq(&p1, &p2));
    }

    #[test]
    fn pi_body_difference_detected() {
        let p1 = pi("n", |n| Atom::TC(PrimTC::IntRange(Atom::lit(0), n.to_atom())).rc());
        let p3 = pi("n", |_| Atom::TC(PrimTC::IntRange(Atom::lit(1), Atom::lit(2))).rc());
        assert!(!alpha_eq(&p1, &p3));
    }

    #[test]
    fn distinct_free_vars_differ() {
        let a = Var::new(Name::free("a"), Atom::int_ty());
        let b = Var::new(Name::free("b"), Atom::int_ty());
        assert!(!alpha_eq(&a.to_atom(), &b.to_atom()));
        assert!(alpha_eq(&a.to_atom(), &a.to_atom()));
    }
}
