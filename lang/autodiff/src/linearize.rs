//! Forward-mode linearization. Every rule produces the primal value now
//! and a delayed tangent computation to run later under a supplied
//! tangent environment — the `(a, tangent-of-a)` pair discipline.

use crate::Ad;
use tabula_core::builder::Builder;
use tabula_core::env::SubstEnv;
use tabula_core::subst::subst_atom;
use tabula_core::syntax::*;
use tabula_core::ty::{tangent_type, type_of_atom, zero_at};
use tabula_utils::prelude::*;

/// A delayed tangent computation: run in the embedding builder under the
/// tangents supplied for the active variables and effect regions.
type TanFn = Box<dyn FnOnce(&mut Builder, &TangentEnv) -> Result<RcAtom>>;

/// Tangent values for active variables (keyed by their source names) and
/// tangent references for active effect regions.
#[derive(Clone, Default)]
pub struct TangentEnv {
    pub vars: im::HashMap<Name, RcAtom>,
    pub regions: im::HashMap<Name, RcAtom>,
}

/// What we are differentiating with respect to: the active variables (with
/// their primal types, in binding order) and the active effect regions.
#[derive(Clone)]
struct LinCtx {
    active: Vec<Var>,
    regions: Vec<(Name, EffectName, RcTy)>,
    env: SubstEnv,
}

impl LinCtx {
    fn is_active(&self, name: &Name) -> bool {
        self.active.iter().any(|v| &v.name == name)
    }
    fn with_var(&self, var: Var, primal: RcAtom) -> LinCtx {
        let mut ctx = self.clone();
        ctx.env.insert(var.name.clone(), primal);
        ctx.active.push(var);
        ctx
    }
    fn subst(&self, bld: &Builder, a: &RcAtom) -> RcAtom {
        subst_atom(&self.env, bld.scope(), a)
    }
}

/// Linearize `\b. block` into `\b. (primal, linear tangent map)`.
pub fn linearize_lam(ad: &Ad, bld: &mut Builder, lam: &RcAtom) -> Result<RcAtom> {
    let Atom::Lam(Lam { binder, body, .. }) = lam.as_ref() else {
        return Err(Error::compiler("linearize of a non-lambda"));
    };
    let hint = binder.name.hint.clone();
    let binder = binder.clone();
    let body = body.clone();
    bld.build_lam(&hint, binder.ty.clone(), ArrowKind::pure(), |sub, x| {
        let ctx = LinCtx {
            active: Vec::new(),
            regions: Vec::new(),
            env: SubstEnv::new(),
        };
        let active_var = Var::new(binder.name.clone(), binder.ty.clone());
        let ctx = ctx.with_var(active_var, x);
        let (primal, tan) = lin_block(ad, sub, &ctx, &body)?;
        // The surfaced tangent map is a plain linear lambda.
        let tan_ty = tangent_type(&binder.ty)?;
        let binder_name = binder.name.clone();
        let lin = sub.build_lam("t", tan_ty, ArrowKind::Lin, move |inner, t| {
            let tenv = TangentEnv {
                vars: im::HashMap::unit(binder_name, t),
                regions: im::HashMap::new(),
            };
            tan(inner, &tenv)
        })?;
        Ok(Atom::pair(primal, lin))
    })
}

fn lin_block(
    ad: &Ad, bld: &mut Builder, ctx: &LinCtx, block: &Block,
) -> Result<(RcAtom, TanFn)> {
    let mut ctx = ctx.clone();
    let mut steps: Vec<(Name, TanFn)> = Vec::new();
    for decl in &block.decls {
        let Decl::Let(_, b, e) = decl else {
            return Err(Error::not_implemented("linearization of unpack declarations"));
        };
        bld.set_hint(&b.name.hint);
        let (p, t) = lin_expr(ad, bld, &ctx, e)?;
        let primal_ty = type_of_atom(&p)?;
        ctx = ctx.with_var(Var::new(b.name.clone(), primal_ty), p);
        steps.push((b.name.clone(), t));
    }
    let (result, result_tan) = lin_expr(ad, bld, &ctx, &block.result)?;
    let tan: TanFn = Box::new(move |bld, tenv| {
        let mut tenv = tenv.clone();
        for (name, step) in steps {
            let t = step(bld, &tenv)?;
            tenv.vars.insert(name, t);
        }
        result_tan(bld, &tenv)
    });
    Ok((result, tan))
}

fn lin_expr(
    ad: &Ad, bld: &mut Builder, ctx: &LinCtx, expr: &Expr,
) -> Result<(RcAtom, TanFn)> {
    match expr {
        | Expr::Atom(a) => lin_atom(bld, ctx, a),
        | Expr::Op(op) => lin_op(bld, ctx, op),
        | Expr::Hof(hof) => lin_hof(ad, bld, ctx, hof),
        | Expr::App(ArrowKind::Tab, tab, i) => {
            // Indexing is linear in the table; the index has no tangent.
            let pi = ctx.subst(bld, i);
            let (pt, tt) = lin_atom(bld, ctx, tab)?;
            let primal = bld.tab_get(pt, pi.clone())?;
            let tan: TanFn = Box::new(move |bld, tenv| {
                let t = tt(bld, tenv)?;
                bld.tab_get(t, pi)
            });
            Ok((primal, tan))
        }
        | Expr::App(arr, f, x) => {
            // Post-simplification, only rule-annotated heads remain.
            let Atom::Var(fv) = f.as_ref() else {
                return Err(Error::not_implemented("linearization of this application"));
            };
            let Some(rule) = ad.rules.lookup(&fv.name).cloned() else {
                return Err(Error::not_implemented(format!(
                    "no derivative rule for {}",
                    fv.name
                )));
            };
            let (px, tx) = lin_atom(bld, ctx, x)?;
            // A rule maps the argument to a (primal, tangent map) pair.
            let pair = bld.emit(Expr::App(arr.clone(), rule, px))?;
            let primal = bld.emit_op(PrimOp::Fst(pair.clone()))?;
            let tan: TanFn = Box::new(move |bld, tenv| {
                let t = tx(bld, tenv)?;
                let lin = bld.emit_op(PrimOp::Snd(pair))?;
                bld.app(lin, t)
            });
            Ok((primal, tan))
        }
        | Expr::Case(_, _, _) => {
            Err(Error::not_implemented("linearization of case expressions"))
        }
    }
}

fn lin_atom(bld: &mut Builder, ctx: &LinCtx, atom: &RcAtom) -> Result<(RcAtom, TanFn)> {
    match atom.as_ref() {
        | Atom::Var(v) => {
            let primal = ctx.subst(bld, atom);
            if ctx.is_active(&v.name) {
                let name = v.name.clone();
                let ty = type_of_atom(&primal)?;
                let tan: TanFn = Box::new(move |_, tenv| {
                    match tenv.vars.get(&name) {
                        | Some(t) => Ok(t.clone()),
                        // Active but not supplied: differentiated elsewhere.
                        | None => zero_at(tangent_type(&ty)?.as_ref()),
                    }
                });
                Ok((primal, tan))
            } else {
                Ok((primal.clone(), zero_tan(primal)?))
            }
        }
        | Atom::Con(PrimCon::Lit(_)) => Ok((atom.clone(), zero_tan(atom.clone())?)),
        | Atom::Con(PrimCon::PairCon(a, b)) => {
            let (pa, ta) = lin_atom(bld, ctx, a)?;
            let (pb, tb) = lin_atom(bld, ctx, b)?;
            let primal = Atom::pair(pa, pb);
            let tan: TanFn = Box::new(move |bld, tenv| {
                let ta = ta(bld, tenv)?;
                let tb = tb(bld, tenv)?;
                Ok(Atom::pair(ta, tb))
            });
            Ok((primal, tan))
        }
        | _ => {
            let primal = ctx.subst(bld, atom);
            Ok((primal.clone(), zero_tan(primal)?))
        }
    }
}

fn zero_tan(primal: RcAtom) -> Result<TanFn> {
    Ok(Box::new(move |_, _| {
        let ty = type_of_atom(&primal)?;
        zero_at(tangent_type(&ty)?.as_ref())
    }))
}

fn lin_op(bld: &mut Builder, ctx: &LinCtx, op: &PrimOp<RcAtom>) -> Result<(RcAtom, TanFn)> {
    use BinOp::*;
    use PrimOp::*;
    match op {
        | ScalarBinOp(FAdd, x, y) => {
            let (px, tx) = lin_atom(bld, ctx, x)?;
            let (py, ty) = lin_atom(bld, ctx, y)?;
            let primal = bld.emit_op(ScalarBinOp(FAdd, px, py))?;
            let tan: TanFn = Box::new(move |bld, tenv| {
                let tx = tx(bld, tenv)?;
                let ty = ty(bld, tenv)?;
                bld.emit_op(ScalarBinOp(FAdd, tx, ty))
            });
            Ok((primal, tan))
        }
        | ScalarBinOp(FSub, x, y) => {
            let (px, tx) = lin_atom(bld, ctx, x)?;
            let (py, ty) = lin_atom(bld, ctx, y)?;
            let primal = bld.emit_op(ScalarBinOp(FSub, px, py))?;
            let tan: TanFn = Box::new(move |bld, tenv| {
                let tx = tx(bld, tenv)?;
                let ty = ty(bld, tenv)?;
                bld.emit_op(ScalarBinOp(FSub, tx, ty))
            });
            Ok((primal, tan))
        }
        | ScalarBinOp(FMul, x, y) => {
            // Bilinear: d(x*y) = x*dy + dx*y.
            let (px, tx) = lin_atom(bld, ctx, x)?;
            let (py, ty) = lin_atom(bld, ctx, y)?;
            let primal = bld.emit_op(ScalarBinOp(FMul, px.clone(), py.clone()))?;
            let tan: TanFn = Box::new(move |bld, tenv| {
                let tx = tx(bld, tenv)?;
                let ty = ty(bld, tenv)?;
                let l = bld.emit_op(ScalarBinOp(FMul, px, ty))?;
                let r = bld.emit_op(ScalarBinOp(FMul, tx, py))?;
                bld.emit_op(ScalarBinOp(FAdd, l, r))
            });
            Ok((primal, tan))
        }
        | ScalarBinOp(FDiv, x, y) => {
            // d(x/y) = dx/y - x*dy/y^2.
            let (px, tx) = lin_atom(bld, ctx, x)?;
            let (py, ty) = lin_atom(bld, ctx, y)?;
            let primal = bld.emit_op(ScalarBinOp(FDiv, px.clone(), py.clone()))?;
            let tan: TanFn = Box::new(move |bld, tenv| {
                let tx = tx(bld, tenv)?;
                let ty = ty(bld, tenv)?;
                let l = bld.emit_op(ScalarBinOp(FDiv, tx, py.clone()))?;
                let num = bld.emit_op(ScalarBinOp(FMul, px, ty))?;
                let den = bld.emit_op(ScalarBinOp(FMul, py.clone(), py))?;
                let r = bld.emit_op(ScalarBinOp(FDiv, num, den))?;
                bld.emit_op(ScalarBinOp(FSub, l, r))
            });
            Ok((primal, tan))
        }
        | ScalarUnOp(UnOp::FNeg, x) => {
            let (px, tx) = lin_atom(bld, ctx, x)?;
            let primal = bld.emit_op(ScalarUnOp(UnOp::FNeg, px))?;
            let tan: TanFn = Box::new(move |bld, tenv| {
                let tx = tx(bld, tenv)?;
                bld.emit_op(ScalarUnOp(UnOp::FNeg, tx))
            });
            Ok((primal, tan))
        }
        | Fst(x) => {
            let (px, tx) = lin_atom(bld, ctx, x)?;
            let primal = bld.emit_op(Fst(px))?;
            let tan: TanFn = Box::new(move |bld, tenv| {
                let t = tx(bld, tenv)?;
                bld.emit_op(Fst(t))
            });
            Ok((primal, tan))
        }
        | Snd(x) => {
            let (px, tx) = lin_atom(bld, ctx, x)?;
            let primal = bld.emit_op(Snd(px))?;
            let tan: TanFn = Box::new(move |bld, tenv| {
                let t = tx(bld, tenv)?;
                bld.emit_op(Snd(t))
            });
            Ok((primal, tan))
        }
        | PrimEffect(r, EffectOp::Tell(x)) => {
            let (pr, region) = lin_ref(bld, ctx, r)?;
            let (px, tx) = lin_atom(bld, ctx, x)?;
            let primal = bld.emit_op(PrimEffect(pr, EffectOp::Tell(px)))?;
            let tan: TanFn = Box::new(move |bld, tenv| {
                let tref = tangent_ref(tenv, &region)?;
                let t = tx(bld, tenv)?;
                bld.emit_op(PrimEffect(tref, EffectOp::Tell(t)))
            });
            Ok((primal, tan))
        }
        | PrimEffect(r, EffectOp::Ask) => {
            let (pr, region) = lin_ref(bld, ctx, r)?;
            let primal = bld.emit_op(PrimEffect(pr, EffectOp::Ask))?;
            let tan: TanFn = Box::new(move |bld, tenv| {
                let tref = tangent_ref(tenv, &region)?;
                bld.emit_op(PrimEffect(tref, EffectOp::Ask))
            });
            Ok((primal, tan))
        }
        | PrimEffect(_, _) => {
            Err(Error::not_implemented("linearization of State effects"))
        }
        | other => {
            // Derivative-free ops: primal through, zero tangent.
            let other = other.try_map(|a| Ok::<_, Error>(ctx.subst(bld, a)))?;
            let primal = bld.emit_op(other)?;
            Ok((primal.clone(), zero_tan(primal)?))
        }
    }
}

/// The primal reference atom and its region name.
fn lin_ref(bld: &mut Builder, ctx: &LinCtx, r: &RcAtom) -> Result<(RcAtom, Name)> {
    let pr = ctx.subst(bld, r);
    match type_of_atom(&pr)?.as_ref() {
        | Atom::TC(PrimTC::Ref(region, _)) => match region.as_ref() {
            | Atom::Var(v) => Ok((pr.clone(), v.name.clone())),
            | _ => Err(Error::compiler("reference region is not a variable")),
        },
        | _ => Err(Error::compiler("effect op on non-reference")),
    }
}

fn tangent_ref(tenv: &TangentEnv, region: &Name) -> Result<RcAtom> {
    tenv.regions
        .get(region)
        .cloned()
        .ok_or_else(|| Error::compiler(format!("no tangent region for {}", region)))
}

fn lin_hof(
    ad: &Ad, bld: &mut Builder, ctx: &LinCtx, hof: &PrimHof<RcAtom>,
) -> Result<(RcAtom, TanFn)> {
    use PrimHof::*;
    match hof {
        | For(d, lam) => {
            let Atom::Lam(Lam { arr, binder, body }) = lam.as_ref() else {
                return Err(Error::compiler("for of a non-lambda"));
            };
            let d = *d;
            let ix_ty = ctx.subst(bld, &binder.ty);
            let arr = match arr {
                | ArrowKind::Plain(_) => ArrowKind::Plain(bld.allowed_eff().clone()),
                | other => other.clone(),
            };
            // Per index: the primal paired with its reified tangent map.
            let hint = binder.name.hint.clone();
            let lin_lam = {
                let ctx = ctx.clone();
                let binder = binder.clone();
                let body = body.clone();
                bld.build_lam(&hint, ix_ty.clone(), arr, move |sub, i| {
                    let mut ctx = ctx.clone();
                    ctx.env.insert(binder.name.clone(), i);
                    let (p, t) = lin_block(ad, sub, &ctx, &body)?;
                    let tan_lam = tangent_fun_as_lambda(sub, &ctx, t)?;
                    Ok(Atom::pair(p, tan_lam))
                })?
            };
            let pairs = bld.emit(Expr::Hof(For(d, lin_lam)))?;
            let primal = {
                let pairs = pairs.clone();
                bld.build_for(d, "i", ix_ty.clone(), move |sub, i| {
                    let pair = sub.tab_get(pairs, i)?;
                    sub.emit_op(PrimOp::Fst(pair))
                })?
            };
            let ctx_tan = ctx.clone();
            let tan: TanFn = Box::new(move |bld, tenv| {
                let tenv = tenv.clone();
                bld.build_for(d, "i", ix_ty, move |sub, i| {
                    let pair = sub.tab_get(pairs, i)?;
                    let lin = sub.emit_op(PrimOp::Snd(pair))?;
                    apply_lin_to_tangents(sub, &ctx_tan, &tenv, lin)
                })
            });
            Ok((primal, tan))
        }
        | RunWriter(lam) => {
            let (region_name, val_ty, body, ref_name) = open_run_lam(ctx, bld, lam)?;
            let mut tan_slot: Option<TanFn> = None;
            let mut region_slot: Option<Name> = None;
            let primal = {
                let ctx = ctx.clone();
                let tan_slot = &mut tan_slot;
                let region_slot = &mut region_slot;
                bld.build_run_writer(val_ty.clone(), |sub, r| {
                    let mut ctx = ctx.clone();
                    ctx.env.insert(ref_name.clone(), r.clone());
                    let region = ref_region(&r)?;
                    // The region becomes active for the body.
                    ctx.env.insert(region_name.clone(), region_atom(&r)?);
                    ctx.regions.push((
                        region.clone(),
                        EffectName::Writer,
                        val_ty.clone(),
                    ));
                    *region_slot = Some(region);
                    let (p, t) = lin_block(ad, sub, &ctx, &body)?;
                    *tan_slot = Some(t);
                    Ok(p)
                })?
            };
            let tan_inner = tan_slot
                .ok_or_else(|| Error::compiler("runWriter body was not linearized"))?;
            let primal_region = region_slot
                .ok_or_else(|| Error::compiler("runWriter region missing"))?;
            let val_ty_tan = tangent_type(&val_ty)?;
            let tan: TanFn = Box::new(move |bld, tenv| {
                let tenv = tenv.clone();
                bld.build_run_writer(val_ty_tan, move |sub, r| {
                    let mut tenv = tenv;
                    tenv.regions.insert(primal_region, r);
                    tan_inner(sub, &tenv)
                })
            });
            Ok((primal, tan))
        }
        | RunReader(r, lam) => {
            let (region_name, val_ty, body, ref_name) = open_run_lam(ctx, bld, lam)?;
            let (pr, tr) = lin_atom(bld, ctx, r)?;
            let mut tan_slot: Option<TanFn> = None;
            let mut region_slot: Option<Name> = None;
            let primal = {
                let ctx = ctx.clone();
                let tan_slot = &mut tan_slot;
                let region_slot = &mut region_slot;
                bld.build_run_reader(pr, |sub, rref| {
                    let mut ctx = ctx.clone();
                    ctx.env.insert(ref_name.clone(), rref.clone());
                    let region = ref_region(&rref)?;
                    ctx.env.insert(region_name.clone(), region_atom(&rref)?);
                    ctx.regions
                        .push((region.clone(), EffectName::Reader, val_ty.clone()));
                    *region_slot = Some(region);
                    let (p, t) = lin_block(ad, sub, &ctx, &body)?;
                    *tan_slot = Some(t);
                    Ok(p)
                })?
            };
            let tan_inner = tan_slot
                .ok_or_else(|| Error::compiler("runReader body was not linearized"))?;
            let region =
                region_slot.ok_or_else(|| Error::compiler("runReader region missing"))?;
            let tan: TanFn = Box::new(move |bld, tenv| {
                let t_in = tr(bld, tenv)?;
                let tenv = tenv.clone();
                bld.build_run_reader(t_in, move |sub, rref| {
                    let mut tenv = tenv;
                    tenv.regions.insert(region, rref);
                    tan_inner(sub, &tenv)
                })
            });
            Ok((primal, tan))
        }
        | _ => Err(Error::not_implemented("linearization of this primitive")),
    }
}

/// Reify a delayed tangent computation as a lambda value: nested binders
/// for each active effect region's tangent reference, one binder per
/// active variable's tangent, then a trailing unit arrow carrying the
/// tangent effect row whose body runs the computation.
fn tangent_fun_as_lambda(bld: &mut Builder, ctx: &LinCtx, tan: TanFn) -> Result<RcAtom> {
    // Regions first.
    fn go_regions(
        bld: &mut Builder, ctx: &LinCtx, idx: usize, tenv: TangentEnv, tan: TanFn,
    ) -> Result<RcAtom> {
        if let Some((region, _, val_ty)) = ctx.regions.get(idx).cloned() {
            let tan_val = tangent_type(&val_ty)?;
            bld.build_lam("th", Atom::ty_kind(), ArrowKind::Implicit, move |sub, h| {
                sub.build_lam(
                    "tref",
                    Atom::ref_ty(h, tan_val),
                    ArrowKind::Implicit,
                    move |sub, r| {
                        let mut tenv = tenv;
                        tenv.regions.insert(region, r);
                        go_regions(sub, ctx, idx + 1, tenv, tan)
                    },
                )
            })
        } else {
            go_vars(bld, ctx, 0, tenv, tan)
        }
    }
    // Then one binder per active variable.
    fn go_vars(
        bld: &mut Builder, ctx: &LinCtx, idx: usize, tenv: TangentEnv, tan: TanFn,
    ) -> Result<RcAtom> {
        if let Some(var) = ctx.active.get(idx).cloned() {
            let tan_ty = tangent_type(&var.ty)?;
            bld.build_lam("t", tan_ty, ArrowKind::Lin, move |sub, t| {
                let mut tenv = tenv;
                tenv.vars.insert(var.name, t);
                go_vars(sub, ctx, idx + 1, tenv, tan)
            })
        } else {
            // Trailing unit arrow carrying the tangent effect row.
            let eff = EffectRow::concat(ctx.regions.iter().filter_map(|(region, name, ty)| {
                let tan_ty = tangent_type(ty).ok()?;
                let tref = tenv.regions.get(region)?;
                let Atom::TC(PrimTC::Ref(h, _)) = type_of_atom(tref).ok()?.as_ref().clone()
                else {
                    return None;
                };
                let Atom::Var(hv) = h.as_ref() else { return None };
                Some(EffectRow::single(hv.name.clone(), *name, tan_ty))
            }));
            bld.build_lam("u", Atom::unit_ty(), ArrowKind::Plain(eff), move |sub, _| {
                tan(sub, &tenv)
            })
        }
    }
    go_regions(bld, ctx, 0, TangentEnv::default(), tan)
}

/// Apply a lambda reified by [`tangent_fun_as_lambda`] to the tangents in
/// scope: the region references, the active variables' tangents, then unit.
fn apply_lin_to_tangents(
    bld: &mut Builder, ctx: &LinCtx, tenv: &TangentEnv, mut f: RcAtom,
) -> Result<RcAtom> {
    for (region, _, _) in &ctx.regions {
        let tref = tangent_ref(tenv, region)?;
        let h = region_atom(&tref)?;
        f = bld.emit(Expr::App(ArrowKind::Implicit, f, h))?;
        f = bld.emit(Expr::App(ArrowKind::Implicit, f, tref))?;
    }
    for var in &ctx.active {
        let t = match tenv.vars.get(&var.name) {
            | Some(t) => t.clone(),
            | None => zero_at(tangent_type(&var.ty)?.as_ref())?,
        };
        f = bld.emit(Expr::App(ArrowKind::Lin, f, t))?;
    }
    bld.app(f, Atom::unit())
}

/* --------------------------------- helpers --------------------------------- */

/// Open `\region. \ref. body`, returning the region binder name, the
/// carried value type, the body, and the ref binder name.
fn open_run_lam(
    ctx: &LinCtx, bld: &Builder, lam: &RcAtom,
) -> Result<(Name, RcTy, Block, Name)> {
    let Atom::Lam(Lam { binder: region, body: outer, .. }) = lam.as_ref() else {
        return Err(Error::compiler("run* of a non-lambda"));
    };
    let Expr::Atom(inner) = &outer.result else {
        return Err(Error::compiler("run* lambda body must be an inner lambda"));
    };
    let Atom::Lam(Lam { binder: ref_binder, body, .. }) = inner.as_ref() else {
        return Err(Error::compiler("run* lambda body must be an inner lambda"));
    };
    let val_ty = match ref_binder.ty.as_ref() {
        | Atom::TC(PrimTC::Ref(_, a)) => ctx.subst(bld, a),
        | _ => return Err(Error::compiler("run* inner binder is not a reference")),
    };
    Ok((region.name.clone(), val_ty, body.clone(), ref_binder.name.clone()))
}

fn ref_region(r: &RcAtom) -> Result<Name> {
    match type_of_atom(r)?.as_ref() {
        | Atom::TC(PrimTC::Ref(region, _)) => match region.as_ref() {
            | Atom::Var(v) => Ok(v.name.clone()),
            | _ => Err(Error::compiler("reference region is not a variable")),
        },
        | _ => Err(Error::compiler("not a reference")),
    }
}

fn region_atom(r: &RcAtom) -> Result<RcAtom> {
    match type_of_atom(r)?.as_ref() {
        | Atom::TC(PrimTC::Ref(region, _)) => Ok(region.clone()),
        | _ => Err(Error::compiler("not a reference")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Ad;
    use pretty_assertions::assert_eq;
    use tabula_core::env::Scope;
    use tabula_core::simplify::{NoDiff, Simplifier};
    use tabula_imp::interp::{evaluate_block, CoreValue};

    fn real_lam(body: impl FnOnce(&RcAtom) -> Expr) -> RcAtom {
        let binder = Var::new(Name::free("x"), Atom::real_ty());
        let result = body(&binder.to_atom());
        Atom::Lam(Lam {
            arr: ArrowKind::pure(),
            binder,
            body: Block { decls: Vec::new(), result, eff: EffectRow::pure() },
        })
        .rc()
    }

    /// Linearize `lam`, apply the pair at `x0`, feed the linear map the
    /// tangent `t0`, and run the lot on the interpreter.
    fn run_linearized(lam: RcAtom, x0: f64, t0: f64) -> (f64, f64) {
        let ad = Ad::new(SubstEnv::new());
        let top = SubstEnv::new();
        let rules = SubstEnv::new();
        let nodiff = NoDiff;
        let simp = Simplifier::new(&top, &rules, &nodiff, false);
        let env = SubstEnv::new();

        let mut bld = Builder::new(Scope::new());
        let g = linearize_lam(&ad, &mut bld, &lam).unwrap();
        let pair = simp
            .simplify_expr(&mut bld, &env, &Expr::App(ArrowKind::pure(), g, Atom::lit(x0)))
            .unwrap();
        let p = simp.simplify_expr(&mut bld, &env, &Expr::Op(PrimOp::Fst(pair.clone()))).unwrap();
        let lf = simp.simplify_expr(&mut bld, &env, &Expr::Op(PrimOp::Snd(pair))).unwrap();
        let t = simp
            .simplify_expr(&mut bld, &env, &Expr::App(ArrowKind::Lin, lf, Atom::lit(t0)))
            .unwrap();

        let block = Block {
            decls: bld.take_decls(),
            result: Expr::Atom(Atom::pair(p, t)),
            eff: EffectRow::pure(),
        };
        let v = evaluate_block(&block).unwrap();
        let CoreValue::Pair(p, t) = v else { panic!("expected a pair, got {:?}", v) };
        (p.as_real().unwrap(), t.as_real().unwrap())
    }

    #[test]
    fn scaling_has_a_constant_tangent_map() {
        // linearize (\x. 3.0 * x) at 4.0: primal 12.0, tangent map t -> 3.0*t.
        let f = real_lam(|x| {
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FMul, Atom::lit(3.0), x.clone()))
        });
        assert_eq!(run_linearized(f, 4.0, 1.0), (12.0, 3.0));
    }

    #[test]
    fn square_rule() {
        // linearize (\x. x * x) at x0: primal x0^2, tangent map t -> 2*x0*t.
        let f = real_lam(|x| {
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FMul, x.clone(), x.clone()))
        });
        assert_eq!(run_linearized(f, 3.0, 1.0), (9.0, 6.0));
    }

    #[test]
    fn literals_have_zero_tangents() {
        // linearize (\x. x + 1.0): the constant contributes nothing.
        let f = real_lam(|x| {
            Expr::Op(PrimOp::ScalarBinOp(BinOp::FAdd, x.clone(), Atom::lit(1.0)))
        });
        assert_eq!(run_linearized(f, 5.0, 2.0), (6.0, 2.0));
    }
}
