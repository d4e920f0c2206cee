//! Free variables, with their types. Rebinding a name removes it from the
//! body's contribution; annotation types contribute their own free vars.

use crate::env::Env;
use crate::syntax::*;

/// A free-variable set: names mapped to their types.
pub type FreeVars = Env<RcTy>;

pub fn free_vars_atom(atom: &Atom) -> FreeVars {
    let mut acc = FreeVars::new();
    collect_atom(atom, &mut acc);
    acc
}

pub fn free_vars_expr(expr: &Expr) -> FreeVars {
    let mut acc = FreeVars::new();
    collect_expr(expr, &mut acc);
    acc
}

pub fn free_vars_block(block: &Block) -> FreeVars {
    let mut acc = FreeVars::new();
    collect_block(block, &mut acc);
    acc
}

fn collect_atom(atom: &Atom, acc: &mut FreeVars) {
    match atom {
        | Atom::Var(v) => {
            collect_atom(&v.ty, acc);
            acc.insert(v.name.clone(), v.ty.clone());
        }
        | Atom::Lam(Lam { arr, binder, body }) => {
            collect_arrow(arr, acc);
            collect_abs(binder, |acc| collect_block(body, acc), acc);
        }
        | Atom::Pi(PiTy { arr, binder, body }) => {
            collect_arrow(arr, acc);
            collect_abs(binder, |acc| collect_atom(body, acc), acc);
        }
        | Atom::Con(con) => {
            let _ = con.map(|a| collect_atom(a, acc));
        }
        | Atom::TC(tc) => {
            let _ = tc.map(|a| collect_atom(a, acc));
        }
        | Atom::Eff(eff) => collect_eff(eff, acc),
    }
}

fn collect_expr(expr: &Expr, acc: &mut FreeVars) {
    match expr {
        | Expr::App(arr, f, x) => {
            collect_arrow(arr, acc);
            collect_atom(f, acc);
            collect_atom(x, acc);
        }
        | Expr::Atom(a) => collect_atom(a, acc),
        | Expr::Op(op) => {
            let _ = op.map(|a| collect_atom(a, acc));
        }
        | Expr::Hof(hof) => {
            let _ = hof.map(|a| collect_atom(a, acc));
        }
        | Expr::Case(scrut, alts, ty) => {
            collect_atom(scrut, acc);
            collect_atom(ty, acc);
            for alt in alts {
                let mut inner = FreeVars::new();
                collect_block(&alt.body, &mut inner);
                for b in &alt.binders {
                    inner.remove(&b.name);
                }
                *acc += inner;
                for b in &alt.binders {
                    collect_atom(&b.ty, acc);
                }
            }
        }
    }
}

fn collect_block(block: &Block, acc: &mut FreeVars) {
    collect_eff(&block.eff, acc);
    // Result first, then peel binders back to front.
    let mut inner = FreeVars::new();
    collect_expr(&block.result, &mut inner);
    for decl in block.decls.iter().rev() {
        for b in decl.binders() {
            inner.remove(&b.name);
        }
        for b in decl.binders() {
            collect_atom(&b.ty, &mut inner);
        }
        collect_expr(decl.expr(), &mut inner);
    }
    *acc += inner;
}

fn collect_abs(binder: &Var, body: impl FnOnce(&mut FreeVars), acc: &mut FreeVars) {
    collect_atom(&binder.ty, acc);
    let mut inner = FreeVars::new();
    body(&mut inner);
    inner.remove(&binder.name);
    *acc += inner;
}

fn collect_arrow(arr: &ArrowKind, acc: &mut FreeVars) {
    if let ArrowKind::Plain(eff) = arr {
        collect_eff(eff, acc);
    }
}

fn collect_eff(eff: &EffectRow, acc: &mut FreeVars) {
    for (region, (_, ty)) in &eff.row {
        acc.insert(region.clone(), Atom::ty_kind());
        collect_atom(ty, acc);
    }
    if let Some(tail) = &eff.tail {
        acc.insert(tail.clone(), Atom::TC(PrimTC::EffectKind).rc());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn var(hint: &str, ty: RcTy) -> Var {
        Var::new(Name::free(hint), ty)
    }

    #[test]
    fn lam_binder_is_not_free() {
        let x = var("x", Atom::int_ty());
        let body = Block::pure_result(x.to_atom());
        let lam = Atom::Lam(Lam { arr: ArrowKind::pure(), binder: x.clone(), body });
        assert!(free_vars_atom(&lam).lookup(&x.name).is_none());
    }

    #[test]
    fn decl_binders_scope_over_the_rest() {
        let x = var("x", Atom::int_ty());
        let y = var("y", Atom::int_ty());
        let block = Block {
            decls: vec![Decl::Let(
                LetAnn::Plain,
                x.clone(),
                Expr::Atom(y.to_atom()),
            )],
            result: Expr::Atom(x.to_atom()),
            eff: EffectRow::pure(),
        };
        let free = free_vars_block(&block);
        assert!(free.lookup(&x.name).is_none());
        assert!(free.lookup(&y.name).is_some());
    }

    #[test]
    fn dependent_annotation_contributes() {
        let n = var("n", Atom::int_ty());
        let ix = Rc::new(Atom::TC(PrimTC::IntRange(Atom::lit(0), n.to_atom())));
        let i = var("i", ix);
        let free = free_vars_atom(&i.to_atom());
        assert!(free.lookup(&n.name).is_some());
        assert!(free.lookup(&i.name).is_some());
    }
}
