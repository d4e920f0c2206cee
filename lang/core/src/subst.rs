//! Capture-avoiding substitution. The environment maps names to the atoms
//! that replace them; the scope lists every name live around the node.
//! Crossing a binder renames it fresh with respect to `scope + dom(env)`
//! and extends the environment with the rename, so free variables of the
//! substituted range are never captured.

use crate::env::{Scope, ScopeEntry, SubstEnv};
use crate::free::free_vars_atom;
use crate::syntax::*;
use std::rc::Rc;

pub fn subst_atom(env: &SubstEnv, scope: &Scope, atom: &RcAtom) -> RcAtom {
    match atom.as_ref() {
        | Atom::Var(v) => match env.lookup(&v.name) {
            | Some(x) => de_shadow(x, scope),
            | None => {
                let ty = subst_atom(env, scope, &v.ty);
                if Rc::ptr_eq(&ty, &v.ty) {
                    atom.clone()
                } else {
                    Atom::Var(Var::new(v.name.clone(), ty)).rc()
                }
            }
        },
        | Atom::Lam(Lam { arr, binder, body }) => {
            let arr = subst_arrow(env, scope, arr);
            let (binder, env, scope) = subst_binder(env, scope, binder);
            let body = subst_block(&env, &scope, body);
            Atom::Lam(Lam { arr, binder, body }).rc()
        }
        | Atom::Pi(PiTy { arr, binder, body }) => {
            let arr = subst_arrow(env, scope, arr);
            let (binder, env, scope) = subst_binder(env, scope, binder);
            let body = subst_atom(&env, &scope, body);
            Atom::Pi(PiTy { arr, binder, body }).rc()
        }
        | Atom::Con(con) => Atom::Con(con.map(|a| subst_atom(env, scope, a))).rc(),
        | Atom::TC(tc) => Atom::TC(tc.map(|a| subst_atom(env, scope, a))).rc(),
        | Atom::Eff(eff) => Atom::Eff(subst_eff(env, scope, eff)).rc(),
    }
}

pub fn subst_expr(env: &SubstEnv, scope: &Scope, expr: &Expr) -> Expr {
    match expr {
        | Expr::App(arr, f, x) => Expr::App(
            subst_arrow(env, scope, arr),
            subst_atom(env, scope, f),
            subst_atom(env, scope, x),
        ),
        | Expr::Atom(a) => Expr::Atom(subst_atom(env, scope, a)),
        | Expr::Op(op) => Expr::Op(op.map(|a| subst_atom(env, scope, a))),
        | Expr::Hof(hof) => Expr::Hof(hof.map(|a| subst_atom(env, scope, a))),
        | Expr::Case(scrut, alts, ty) => {
            let scrut = subst_atom(env, scope, scrut);
            let ty = subst_atom(env, scope, ty);
            let alts = alts
                .iter()
                .map(|alt| {
                    let mut env = env.clone();
                    let mut scope = scope.clone();
                    let mut binders = Vec::with_capacity(alt.binders.len());
                    for b in &alt.binders {
                        let (b, env2, scope2) = subst_binder(&env, &scope, b);
                        env = env2;
                        scope = scope2;
                        binders.push(b);
                    }
                    Alt { binders, body: subst_block(&env, &scope, &alt.body) }
                })
                .collect();
            Expr::Case(scrut, alts, ty)
        }
    }
}

pub fn subst_block(env: &SubstEnv, scope: &Scope, block: &Block) -> Block {
    let mut env = env.clone();
    let mut scope = scope.clone();
    let mut decls = Vec::with_capacity(block.decls.len());
    for decl in &block.decls {
        match decl {
            | Decl::Let(ann, binder, expr) => {
                let expr = subst_expr(&env, &scope, expr);
                let (binder, env2, scope2) = subst_binder(&env, &scope, binder);
                env = env2;
                scope = scope2;
                decls.push(Decl::Let(*ann, binder, expr));
            }
            | Decl::Unpack(binders, expr) => {
                let expr = subst_expr(&env, &scope, expr);
                let mut bs = Vec::with_capacity(binders.len());
                for b in binders {
                    let (b, env2, scope2) = subst_binder(&env, &scope, b);
                    env = env2;
                    scope = scope2;
                    bs.push(b);
                }
                decls.push(Decl::Unpack(bs, expr));
            }
        }
    }
    let result = subst_expr(&env, &scope, &block.result);
    let eff = subst_eff(&env, &scope, &block.eff);
    Block { decls, result, eff }
}

/// Rename bound variables of `x` apart from an external scope.
pub fn de_shadow(x: &RcAtom, scope: &Scope) -> RcAtom {
    subst_atom(&SubstEnv::new(), scope, x)
}

/// The effective type of applying a Pi type to an argument atom.
pub fn apply_pi(pi: &PiTy, x: &RcAtom) -> RcTy {
    let scope: Scope = free_vars_atom(x)
        .into_iter()
        .map(|(name, ty)| (name, ScopeEntry { ty, bound: None }))
        .collect();
    let env = SubstEnv::singleton(pi.binder.name.clone(), x.clone());
    subst_atom(&env, &scope, &pi.body)
}

/// Freshen a binder against `scope + dom(env)`, returning the renamed
/// binder and the environment/scope extended for the body.
fn subst_binder(env: &SubstEnv, scope: &Scope, binder: &Var) -> (Var, SubstEnv, Scope) {
    let ty = subst_atom(env, scope, &binder.ty);
    let name =
        binder.name.freshen(|n| scope.knows(n) || env.lookup(n).is_some());
    let binder_new = Var::new(name, ty);
    let mut env = env.clone();
    // Even an unchanged name re-enters the env so inner occurrences pick up
    // the substituted annotation.
    env.insert(binder.name.clone(), binder_new.to_atom());
    let scope = scope.clone().binder(&binder_new);
    (binder_new, env, scope)
}

fn subst_arrow(env: &SubstEnv, scope: &Scope, arr: &ArrowKind) -> ArrowKind {
    match arr {
        | ArrowKind::Plain(eff) => ArrowKind::Plain(subst_eff(env, scope, eff)),
        | ArrowKind::Implicit => ArrowKind::Implicit,
        | ArrowKind::Tab => ArrowKind::Tab,
        | ArrowKind::Lin => ArrowKind::Lin,
    }
}

/// Effect rows substitute pointwise; region keys follow the environment's
/// renamings, and a tail mapped to a row atom splices in.
pub fn subst_eff(env: &SubstEnv, scope: &Scope, eff: &EffectRow) -> EffectRow {
    let mut out = EffectRow::pure();
    for (region, (name, ty)) in &eff.row {
        let ty = subst_atom(env, scope, ty);
        let region = match env.lookup(region).map(Rc::as_ref) {
            | Some(Atom::Var(v)) => v.name.clone(),
            | Some(_) | None => region.clone(),
        };
        out.row.insert(region, (*name, ty));
    }
    match &eff.tail {
        | None => {}
        | Some(tail) => match env.lookup(tail).map(Rc::as_ref) {
            | Some(Atom::Var(v)) => out.tail = Some(v.name.clone()),
            | Some(Atom::Eff(row)) => {
                let row = row.clone();
                for (k, v) in row.row {
                    out.row.entry(k).or_insert(v);
                }
                out.tail = row.tail;
            }
            | Some(_) | None => out.tail = Some(tail.clone()),
        },
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::free::{free_vars_atom, free_vars_block};
    use pretty_assertions::assert_eq;

    fn var(hint: &str, ty: RcTy) -> Var {
        Var::new(Name::free(hint), ty)
    }

    #[test]
    fn simple_replacement() {
        let x = var("x", Atom::int_ty());
        let env = SubstEnv::singleton(x.name.clone(), Atom::lit(7));
        let out = subst_atom(&env, &Scope::new(), &x.to_atom());
        assert_eq!(out, Atom::lit(7));
    }

    #[test]
    fn binder_shadows_env() {
        // (\x. x) under {x -> 7} keeps the bound occurrence.
        let x = var("x", Atom::int_ty());
        let lam = Atom::Lam(Lam {
            arr: ArrowKind::pure(),
            binder: x.clone(),
            body: Block::pure_result(x.to_atom()),
        })
        .rc();
        let env = SubstEnv::singleton(x.name.clone(), Atom::lit(7));
        let out = subst_atom(&env, &Scope::new(), &lam);
        let Atom::Lam(Lam { binder, body, .. }) = out.as_ref() else {
            panic!("expected a lambda")
        };
        assert_eq!(body.result, Expr::Atom(binder.to_atom()));
    }

    #[test]
    fn capture_is_avoided() {
        // (\y. x) under {x -> y_free}: the binder must move aside.
        let ity = Atom::int_ty();
        let x = var("x", ity.clone());
        let y = var("y", ity.clone());
        let lam = Atom::Lam(Lam {
            arr: ArrowKind::pure(),
            binder: y.clone(),
            body: Block::pure_result(x.to_atom()),
        })
        .rc();
        let env = SubstEnv::singleton(x.name.clone(), y.to_atom());
        let scope = Scope::new().binder(&y);
        let out = subst_atom(&env, &scope, &lam);
        let Atom::Lam(Lam { binder, body, .. }) = out.as_ref() else {
            panic!("expected a lambda")
        };
        assert!(binder.name != y.name);
        // The free y flowed in; the binder did not capture it.
        assert_eq!(body.result, Expr::Atom(y.to_atom()));
        let free = free_vars_block(body);
        assert!(free.lookup(&y.name).is_some());
    }

    #[test]
    fn free_vars_shrink_under_subst() {
        // freeVars(subst({b -> x}, t)) is contained in
        // freeVars(t) - {b} + freeVars(x).
        let ity = Atom::int_ty();
        let b = var("b", ity.clone());
        let z = var("z", ity.clone());
        let x = var("x", ity.clone());
        let t = Atom::pair(b.to_atom(), z.to_atom());
        let env = SubstEnv::singleton(b.name.clone(), x.to_atom());
        let scope = Scope::new().binder(&z).binder(&x);
        let out = subst_atom(&env, &scope, &t);
        let free = free_vars_atom(&out);
        assert!(free.lookup(&b.name).is_none());
        for (name, _) in free {
            assert!(name == z.name || name == x.name);
        }
    }

    #[test]
    fn apply_pi_substitutes_dependent_body() {
        // applyPi ((n: Int) -> range(0, n)) 4 = range(0, 4)
        let n = var("n", Atom::int_ty());
        let body = Atom::TC(PrimTC::IntRange(Atom::lit(0), n.to_atom())).rc();
        let pi = PiTy { arr: ArrowKind::pure(), binder: n, body };
        let out = apply_pi(&pi, &Atom::lit(4));
        assert_eq!(out, Atom::TC(PrimTC::IntRange(Atom::lit(0), Atom::lit(4))).rc());
    }
}
