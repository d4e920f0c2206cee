//! Lowering from simplified core blocks to Imp. Destinations are
//! allocated to mirror the result type; structured values decompose
//! recursively; `for` over finite index sets compiles to pointer-indexed
//! scalar loops, and pure top-level loops become kernel launches on the
//! parallel backends.

use crate::algebra;
use crate::dest::{dest_type, Dest};
use crate::syntax::*;
use tabula_core::env::{Scope, ScopeEntry, SubstEnv};
use tabula_core::eq::alpha_eq;
use tabula_core::subst::{subst_atom, subst_block};
use tabula_core::ty::{type_of_atom, type_of_block};
use tabula_utils::prelude::*;

/// Whether an allocation is freed at the end of the enclosing scope.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocKind {
    Managed,
    Unmanaged,
}

pub struct Lowerer {
    backend: Backend,
    cur_dev: Device,
    /// True until the first loop is entered; gates kernel extraction.
    parallel_top: bool,
    names: im::HashSet<Name>,
    env: SubstEnv,
    dest_env: im::HashMap<Name, Dest>,
    stmts: Vec<ImpStmt>,
    functions: Vec<ImpFunction>,
    ptr_lits: Vec<(PtrLit, Vec<Literal>)>,
    frees: Vec<IExpr>,
}

/// Lower a core block to an Imp module: the module, the reconstruction of
/// the high-level result from the low-level returns, and the pointer
/// literals captured during lowering, in allocation order.
pub fn to_imp_module(
    backend: Backend, block: &Block,
) -> Result<(ImpModule, AtomRecon, Vec<ILit>)> {
    let (module, recon, backings) = to_imp_module_with_backings(backend, block)?;
    Ok((module, recon, backings.iter().map(|(p, _)| ILit::Ptr(*p)).collect()))
}

/// Lowering plus the literal buffer backings, for interpreter consumers.
pub fn to_imp_module_with_backings(
    backend: Backend, block: &Block,
) -> Result<(ImpModule, AtomRecon, Vec<(PtrLit, Vec<Literal>)>)> {
    let mut lo = Lowerer::new(backend);
    let ty = type_of_block(block)?;
    log::trace!("lowering block of type {} for {:?}", ty.show(), backend);
    let dest = lo.make_alloc_dest(AllocKind::Unmanaged, "out", &ty)?;
    lo.translate_block(Some(&dest), block)?;
    let mut binders = Vec::new();
    let mut results = Vec::new();
    let mut decls = Vec::new();
    let atom = lo.dest_result(&dest, &[], &mut binders, &mut results, &mut decls)?;
    debug_assert!(decls.is_empty(), "top-level reconstruction emits no decls");
    for ptr in std::mem::take(&mut lo.frees) {
        lo.push(None, ImpInstr::Free(ptr));
    }
    let main = ImpFunction {
        name: imp_main_name(),
        cc: CallingConv::EntryFun,
        args: Vec::new(),
        body: ImpBlock { stmts: std::mem::take(&mut lo.stmts), results },
    };
    let mut functions = lo.functions;
    functions.push(main);
    let module = ImpModule { functions, main: imp_main_name() };
    Ok((module, AtomRecon { binders, atom }, lo.ptr_lits))
}

impl Lowerer {
    pub(crate) fn new(backend: Backend) -> Lowerer {
        Lowerer {
            backend,
            cur_dev: backend.main_device(),
            parallel_top: true,
            names: im::HashSet::new(),
            env: SubstEnv::new(),
            dest_env: im::HashMap::new(),
            stmts: Vec::new(),
            functions: Vec::new(),
            ptr_lits: Vec::new(),
            frees: Vec::new(),
        }
    }

    /* ------------------------------ plumbing ------------------------------ */

    fn fresh_name(&mut self, hint: &str) -> Name {
        let names = self.names.clone();
        let name = Name::gen(hint).freshen(|n| names.contains(n));
        self.names.insert(name.clone());
        name
    }

    fn fresh_ivar(&mut self, hint: &str, ty: IType) -> IVar {
        IVar { name: self.fresh_name(hint), ty }
    }

    fn push(&mut self, binder: Option<IVar>, instr: ImpInstr) {
        self.stmts.push(ImpStmt { binder, instr });
    }

    /// Emit an instruction, binding its result when it has one.
    fn emit_instr(&mut self, instr: ImpInstr) -> Result<Option<IExpr>> {
        match instr_result_ty(&instr)? {
            | Some(ty) => {
                let v = self.fresh_ivar("v", ty);
                self.push(Some(v.clone()), instr);
                Ok(Some(IExpr::Var(v)))
            }
            | None => {
                self.push(None, instr);
                Ok(None)
            }
        }
    }

    pub(crate) fn emit_op_ie(&mut self, op: PrimOp<IExpr>) -> Result<IExpr> {
        self.emit_instr(ImpInstr::IPrimOp(op))?
            .ok_or_else(|| Error::compiler("operation produced no value"))
    }

    fn scoped<T>(
        &mut self, f: impl FnOnce(&mut Lowerer) -> Result<T>,
    ) -> Result<(Vec<ImpStmt>, T)> {
        let saved_stmts = std::mem::take(&mut self.stmts);
        let saved_frees = std::mem::take(&mut self.frees);
        let out = f(self);
        let stmts = std::mem::replace(&mut self.stmts, saved_stmts);
        let frees = std::mem::replace(&mut self.frees, saved_frees);
        let t = out?;
        let mut stmts = stmts;
        for ptr in frees {
            stmts.push(ImpStmt { binder: None, instr: ImpInstr::Free(ptr) });
        }
        Ok((stmts, t))
    }

    /* ----------------------------- conversions ---------------------------- */

    /// A scalar-representable atom as an Imp expression.
    pub(crate) fn atom_to_iexpr(&mut self, atom: &RcAtom) -> Result<IExpr> {
        match atom.as_ref() {
            | Atom::Con(PrimCon::Lit(l)) => Ok(IExpr::Lit(ILit::Scalar(*l))),
            | Atom::Var(v) => match v.ty.as_ref() {
                | Atom::TC(PrimTC::Base(b)) => {
                    Ok(IExpr::Var(IVar { name: v.name.clone(), ty: IType::Scalar(*b) }))
                }
                | _ => Err(Error::compiler(format!(
                    "variable {} is not scalar at the Imp level",
                    v.name
                ))),
            },
            | Atom::Con(PrimCon::IntRangeVal(_, _, i))
            | Atom::Con(PrimCon::IndexRangeVal(_, _, _, i))
            | Atom::Con(PrimCon::CharCon(i)) => self.atom_to_iexpr(i),
            | other => Err(Error::compiler(format!(
                "atom is not scalar at the Imp level: {:?}",
                other
            ))),
        }
    }

    fn iexpr_atom(&self, e: &IExpr) -> Result<RcAtom> {
        match e {
            | IExpr::Lit(ILit::Scalar(l)) => Ok(Atom::lit(*l)),
            | IExpr::Lit(ILit::Ptr(_)) => Err(Error::compiler("pointer literal as atom")),
            | IExpr::Var(v) => match v.ty {
                | IType::Scalar(b) => {
                    Ok(Atom::Var(Var::new(v.name.clone(), Atom::base(b))).rc())
                }
                | IType::Ptr(_) => Err(Error::compiler("pointer variable as atom")),
            },
        }
    }

    /// The integer representation of an index value.
    pub(crate) fn index_to_int(&mut self, atom: &RcAtom) -> Result<IExpr> {
        match atom.as_ref() {
            | Atom::Con(PrimCon::IntRangeVal(_, _, i))
            | Atom::Con(PrimCon::IndexRangeVal(_, _, _, i))
            | Atom::Con(PrimCon::CharCon(i)) => self.atom_to_iexpr(i),
            | Atom::Con(PrimCon::Lit(Literal::Bool(b))) => {
                Ok(IExpr::int(if *b { 1 } else { 0 }))
            }
            | Atom::Var(v) if matches!(v.ty.as_ref(), Atom::TC(PrimTC::Base(BaseTy::Bool))) => {
                let b = self.atom_to_iexpr(atom)?;
                self.emit_op_ie(PrimOp::Select(b, IExpr::int(1), IExpr::int(0)))
            }
            | _ => Err(Error::compiler(format!("not an index value: {:?}", atom))),
        }
    }

    /// Rebuild an index value of the set `ty` from its integer ordinal.
    fn int_to_index(&mut self, ty: &RcTy, ord: IExpr) -> Result<RcAtom> {
        let i = self.iexpr_atom(&ord)?;
        match ty.as_ref() {
            | Atom::TC(PrimTC::IntRange(l, h)) => {
                Ok(Atom::Con(PrimCon::IntRangeVal(l.clone(), h.clone(), i)).rc())
            }
            | Atom::TC(PrimTC::IndexRange(t, l, h)) => Ok(Atom::Con(
                PrimCon::IndexRangeVal(t.clone(), l.clone(), h.clone(), i),
            )
            .rc()),
            | Atom::TC(PrimTC::CharTy) => Ok(Atom::Con(PrimCon::CharCon(i)).rc()),
            | other => Err(Error::not_implemented(format!(
                "indices of set {:?}",
                other
            ))),
        }
    }

    /* ---------------------------- device staging --------------------------- */

    /// Load from a pointer that may live on another device: foreign
    /// addresses stage through a one-element local buffer.
    fn load_anywhere(&mut self, ptr: &IExpr) -> Result<IExpr> {
        let IType::Ptr(pt) = ptr.ty() else {
            return Err(Error::compiler("load from a non-pointer"));
        };
        let ptr = if pt.addr.dev == self.cur_dev {
            ptr.clone()
        } else {
            let local = self.alloc_buffer(AllocKind::Managed, pt.elem, IExpr::int(1))?;
            self.push(
                None,
                ImpInstr::MemCopy { dest: local.clone(), src: ptr.clone(), numel: IExpr::int(1) },
            );
            local
        };
        self.emit_instr(ImpInstr::Load(ptr))?
            .ok_or_else(|| Error::compiler("load produced no value"))
    }

    /// Store to a pointer that may live on another device.
    fn store_anywhere(&mut self, ptr: &IExpr, value: IExpr) -> Result<()> {
        let IType::Ptr(pt) = ptr.ty() else {
            return Err(Error::compiler("store to a non-pointer"));
        };
        if pt.addr.dev == self.cur_dev {
            self.push(None, ImpInstr::Store { dest: ptr.clone(), value });
        } else {
            let local = self.alloc_buffer(AllocKind::Managed, pt.elem, IExpr::int(1))?;
            self.push(None, ImpInstr::Store { dest: local.clone(), value });
            self.push(
                None,
                ImpInstr::MemCopy { dest: ptr.clone(), src: local, numel: IExpr::int(1) },
            );
        }
        Ok(())
    }

    /* ----------------------------- allocation ----------------------------- */

    /// Build a destination mirroring `ty`, allocating backing buffers for
    /// every scalar leaf.
    pub fn make_alloc_dest(
        &mut self, kind: AllocKind, hint: &str, ty: &RcTy,
    ) -> Result<Dest> {
        self.alloc_dest_rec(kind, hint, ty, &mut Vec::new())
    }

    fn alloc_dest_rec(
        &mut self, kind: AllocKind, hint: &str, ty: &RcTy, idxs: &mut Vec<Var>,
    ) -> Result<Dest> {
        match ty.as_ref() {
            | Atom::Pi(pi) if matches!(pi.arr, ArrowKind::Tab) => {
                let name = self.fresh_name(&pi.binder.name.hint);
                let binder = Var::new(name, pi.binder.ty.clone());
                let body = subst_atom(
                    &SubstEnv::singleton(pi.binder.name.clone(), binder.to_atom()),
                    &Scope::new().binder(&binder),
                    &pi.body,
                );
                idxs.push(binder.clone());
                let inner = self.alloc_dest_rec(kind, hint, &body, idxs)?;
                idxs.pop();
                Ok(Dest::Tab(binder, Box::new(inner)))
            }
            | Atom::TC(PrimTC::Base(b)) => {
                let numel = algebra::elem_count(self, idxs)?;
                let ptr = self.alloc_buffer(kind, *b, numel)?;
                Ok(Dest::Base(ptr))
            }
            | Atom::TC(PrimTC::PairTy(a, b)) => Ok(Dest::Pair(
                Box::new(self.alloc_dest_rec(kind, hint, a, idxs)?),
                Box::new(self.alloc_dest_rec(kind, hint, b, idxs)?),
            )),
            | Atom::TC(PrimTC::UnitTy) => Ok(Dest::Unit),
            | Atom::TC(PrimTC::RecordTy(r)) => Ok(Dest::RecordD(
                r.try_map(|t| self.alloc_dest_rec(kind, hint, t, idxs))?,
            )),
            | Atom::TC(PrimTC::SumTy(l, rr)) => {
                let tag = self.alloc_dest_rec(kind, hint, &Atom::bool_ty(), idxs)?;
                let payload = vec![
                    vec![self.alloc_dest_rec(kind, hint, l, idxs)?],
                    vec![self.alloc_dest_rec(kind, hint, rr, idxs)?],
                ];
                Ok(Dest::SumAsProdD { ty: ty.clone(), tag: Box::new(tag), payload })
            }
            | Atom::TC(PrimTC::TypeCon(def, params)) => {
                let env: SubstEnv = def
                    .params
                    .iter()
                    .zip(params)
                    .map(|(p, a)| (p.name.clone(), a.clone()))
                    .collect();
                if def.cons.len() == 1 {
                    let fields = def.cons[0]
                        .binders
                        .iter()
                        .map(|b| {
                            let fty = subst_atom(&env, &Scope::new(), &b.ty);
                            self.alloc_dest_rec(kind, hint, &fty, idxs)
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Ok(Dest::DataConD(def.clone(), params.clone(), fields))
                } else {
                    let tag = self.alloc_dest_rec(kind, hint, &Atom::int_ty(), idxs)?;
                    let payload = def
                        .cons
                        .iter()
                        .map(|c| {
                            c.binders
                                .iter()
                                .map(|b| {
                                    let fty = subst_atom(&env, &Scope::new(), &b.ty);
                                    self.alloc_dest_rec(kind, hint, &fty, idxs)
                                })
                                .collect::<Result<Vec<_>>>()
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Ok(Dest::SumAsProdD { ty: ty.clone(), tag: Box::new(tag), payload })
                }
            }
            | Atom::TC(PrimTC::IntRange(_, _))
            | Atom::TC(PrimTC::IndexRange(_, _, _))
            | Atom::TC(PrimTC::CharTy) => {
                let repr = self.alloc_dest_rec(kind, hint, &Atom::int_ty(), idxs)?;
                Ok(Dest::IndexD { ty: ty.clone(), repr: Box::new(repr) })
            }
            | Atom::TC(PrimTC::TyKind) | Atom::TC(PrimTC::EffectKind) => {
                Ok(Dest::ConstD(ty.clone()))
            }
            | other => Err(Error::not_implemented(format!(
                "allocation for type {:?}",
                other
            ))),
        }
    }

    /// Emit the `Alloc`. Literal sizes of at most 256 cells go on the
    /// stack of the main device and are never freed; larger or unknown
    /// sizes go on the heap, freed at scope exit when managed.
    fn alloc_buffer(&mut self, kind: AllocKind, b: BaseTy, numel: IExpr) -> Result<IExpr> {
        let small = matches!(numel.as_lit_int(), Some(n) if n <= 256);
        let space = if small && self.cur_dev == self.backend.main_device() {
            MemSpace::Stack
        } else {
            MemSpace::Heap
        };
        let addr = AddrSpace { dev: self.cur_dev, space };
        let ptr = self
            .emit_instr(ImpInstr::Alloc(addr, b, numel))?
            .ok_or_else(|| Error::compiler("alloc produced no pointer"))?;
        if kind == AllocKind::Managed && space == MemSpace::Heap {
            self.frees.push(ptr.clone());
        }
        Ok(ptr)
    }

    /* ------------------------------ indexing ------------------------------ */

    /// Apply one table index to a destination: substitute the binder and
    /// offset every leaf by the index's contribution.
    pub fn index_dest(&mut self, dest: &Dest, i: &RcAtom) -> Result<Dest> {
        let Dest::Tab(binder, inner) = dest else {
            return Err(Error::compiler("indexing a non-table destination"));
        };
        let ord = self.index_to_int(i)?;
        let env = SubstEnv::singleton(binder.name.clone(), i.clone());
        let scope: Scope = tabula_core::free::free_vars_atom(i)
            .into_iter()
            .map(|(name, ty)| (name, ScopeEntry { ty, bound: None }))
            .collect();
        self.offset_dest(inner, binder, &env, &scope, ord, &mut Vec::new())
    }

    fn offset_dest(
        &mut self, dest: &Dest, binder: &Var, env: &SubstEnv, scope: &Scope, ord: IExpr,
        inner_dims: &mut Vec<Var>,
    ) -> Result<Dest> {
        match dest {
            | Dest::Base(ptr) => {
                let off = algebra::index_offset(self, binder, inner_dims, ord)?;
                let ptr = if matches!(off.as_lit_int(), Some(0)) {
                    ptr.clone()
                } else {
                    self.emit_op_ie(PrimOp::PtrOffset(ptr.clone(), off))?
                };
                Ok(Dest::Base(ptr))
            }
            | Dest::Tab(b, d) => {
                let b2 = Var::new(b.name.clone(), subst_atom(env, scope, &b.ty));
                inner_dims.push(b.clone());
                let inner = self.offset_dest(d, binder, env, scope, ord, inner_dims)?;
                inner_dims.pop();
                Ok(Dest::Tab(b2, Box::new(inner)))
            }
            | Dest::Pair(a, b) => Ok(Dest::Pair(
                Box::new(self.offset_dest(a, binder, env, scope, ord.clone(), inner_dims)?),
                Box::new(self.offset_dest(b, binder, env, scope, ord, inner_dims)?),
            )),
            | Dest::Unit => Ok(Dest::Unit),
            | Dest::RecordD(r) => Ok(Dest::RecordD(r.try_map(|d| {
                self.offset_dest(d, binder, env, scope, ord.clone(), inner_dims)
            })?)),
            | Dest::SumAsProdD { ty, tag, payload } => Ok(Dest::SumAsProdD {
                ty: subst_atom(env, scope, ty),
                tag: Box::new(self.offset_dest(
                    tag,
                    binder,
                    env,
                    scope,
                    ord.clone(),
                    inner_dims,
                )?),
                payload: payload
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|d| {
                                self.offset_dest(
                                    d,
                                    binder,
                                    env,
                                    scope,
                                    ord.clone(),
                                    inner_dims,
                                )
                            })
                            .collect::<Result<Vec<_>>>()
                    })
                    .collect::<Result<Vec<_>>>()?,
            }),
            | Dest::DataConD(def, params, fields) => Ok(Dest::DataConD(
                def.clone(),
                params.iter().map(|p| subst_atom(env, scope, p)).collect(),
                fields
                    .iter()
                    .map(|d| self.offset_dest(d, binder, env, scope, ord.clone(), inner_dims))
                    .collect::<Result<Vec<_>>>()?,
            )),
            | Dest::IndexD { ty, repr } => Ok(Dest::IndexD {
                ty: subst_atom(env, scope, ty),
                repr: Box::new(self.offset_dest(repr, binder, env, scope, ord, inner_dims)?),
            }),
            | Dest::ConstD(a) => Ok(Dest::ConstD(subst_atom(env, scope, a))),
        }
    }

    /// The value an already-filled destination holds, loading scalar
    /// leaves and leaving tables memory-backed behind fresh names.
    pub fn dest_to_atom(&mut self, dest: &Dest) -> Result<RcAtom> {
        match dest {
            | Dest::Base(ptr) => {
                let ptr = ptr.clone();
                let v = self.load_anywhere(&ptr)?;
                self.iexpr_atom(&v)
            }
            | Dest::Tab(_, _) => {
                let ty = dest_type(dest)?;
                let name = self.fresh_name("tab");
                self.dest_env.insert(name.clone(), dest.clone());
                Ok(Atom::Var(Var::new(name, ty)).rc())
            }
            | Dest::Pair(a, b) => {
                Ok(Atom::pair(self.dest_to_atom(a)?, self.dest_to_atom(b)?))
            }
            | Dest::Unit => Ok(Atom::unit()),
            | Dest::RecordD(r) => Ok(Atom::Con(PrimCon::RecCon(
                r.try_map(|d| self.dest_to_atom(d))?,
            ))
            .rc()),
            | Dest::SumAsProdD { ty, tag, payload } => {
                let tag = self.dest_to_atom(tag)?;
                let payload = payload
                    .iter()
                    .map(|row| row.iter().map(|d| self.dest_to_atom(d)).collect())
                    .collect::<Result<Vec<Vec<_>>>>()?;
                Ok(Atom::Con(PrimCon::SumAsProd(ty.clone(), tag, payload)).rc())
            }
            | Dest::DataConD(def, params, fields) => {
                let args = fields
                    .iter()
                    .map(|d| self.dest_to_atom(d))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Atom::Con(PrimCon::DataCon(def.clone(), params.clone(), 0, args)).rc())
            }
            | Dest::IndexD { ty, repr } => {
                let Dest::Base(_) = repr.as_ref() else {
                    return Err(Error::compiler("index destination repr is not scalar"));
                };
                let ord = self.dest_to_atom(repr)?;
                let ord = self.atom_to_iexpr(&ord)?;
                self.int_to_index(ty, ord)
            }
            | Dest::ConstD(a) => Ok(a.clone()),
        }
    }

    /* ------------------------------- copying ------------------------------- */

    /// Copy a value into a destination. Destination and source types must
    /// agree exactly.
    pub fn copy_atom(&mut self, dest: &Dest, src: &RcAtom) -> Result<()> {
        let dt = dest_type(dest)?;
        let st = type_of_atom(src)?;
        if !alpha_eq(&dt, &st) {
            return Err(Error::compiler(format!(
                "copy type mismatch: destination {:?} vs source {:?}",
                dt, st
            )));
        }
        self.copy_unchecked(dest, src)
    }

    fn copy_unchecked(&mut self, dest: &Dest, src: &RcAtom) -> Result<()> {
        match dest {
            | Dest::Base(ptr) => {
                let value = self.atom_to_iexpr(src)?;
                let ptr = ptr.clone();
                self.store_anywhere(&ptr, value)
            }
            | Dest::Tab(b, _) => {
                let ix_ty = b.ty.clone();
                let dest = dest.clone();
                let src = src.clone();
                self.emit_ix_loop(Direction::Fwd, &ix_ty, |lo, idx| {
                    let d_i = lo.index_dest(&dest, &idx)?;
                    let s_i = lo.table_get(&src, &idx)?;
                    lo.copy_unchecked(&d_i, &s_i)
                })
            }
            | Dest::Pair(da, db) => match src.as_ref() {
                | Atom::Con(PrimCon::PairCon(a, b)) => {
                    self.copy_unchecked(da, a)?;
                    self.copy_unchecked(db, b)
                }
                | _ => Err(Error::compiler("copying a non-pair into a pair destination")),
            },
            | Dest::Unit => Ok(()),
            | Dest::RecordD(r) => match src.as_ref() {
                | Atom::Con(PrimCon::RecCon(items)) => {
                    r.zip_with(items, |d, a| self.copy_unchecked(d, a)).map(|_| ())
                }
                | _ => Err(Error::compiler("copying a non-record into a record destination")),
            },
            | Dest::SumAsProdD { tag, payload, .. } => match src.as_ref() {
                | Atom::Con(PrimCon::SumCon(t, l, r)) => {
                    self.copy_unchecked(tag, t)?;
                    self.copy_unchecked(&payload[0][0], l)?;
                    self.copy_unchecked(&payload[1][0], r)
                }
                | Atom::Con(PrimCon::SumAsProd(_, t, rows)) => {
                    self.copy_unchecked(tag, t)?;
                    for (drow, srow) in payload.iter().zip(rows) {
                        for (d, s) in drow.iter().zip(srow) {
                            self.copy_unchecked(d, s)?;
                        }
                    }
                    Ok(())
                }
                | Atom::Con(PrimCon::DataCon(_, _, i, args)) => {
                    let t = Atom::lit(*i as i64);
                    self.copy_unchecked(tag, &t)?;
                    for (d, s) in payload[*i].iter().zip(args) {
                        self.copy_unchecked(d, s)?;
                    }
                    Ok(())
                }
                | _ => Err(Error::compiler("copying a non-sum into a sum destination")),
            },
            | Dest::DataConD(_, _, fields) => match src.as_ref() {
                | Atom::Con(PrimCon::DataCon(_, _, 0, args)) => {
                    for (d, s) in fields.iter().zip(args) {
                        self.copy_unchecked(d, s)?;
                    }
                    Ok(())
                }
                | _ => Err(Error::compiler("copying a non-constructor into a data destination")),
            },
            | Dest::IndexD { repr, .. } => {
                let ord = self.index_to_int(src)?;
                let Dest::Base(ptr) = repr.as_ref() else {
                    return Err(Error::compiler("index destination repr is not scalar"));
                };
                self.push(None, ImpInstr::Store { dest: ptr.clone(), value: ord });
                Ok(())
            }
            | Dest::ConstD(_) => Ok(()),
        }
    }

    /// Accumulate a value into a destination: load-add-store at the leaves,
    /// the same shape as `copy_atom` otherwise.
    pub fn add_to_atom(&mut self, dest: &Dest, src: &RcAtom) -> Result<()> {
        match dest {
            | Dest::Base(ptr) => {
                let value = self.atom_to_iexpr(src)?;
                let ptr = ptr.clone();
                let old = self.load_anywhere(&ptr)?;
                let op = match value.ty() {
                    | IType::Scalar(BaseTy::Real) => BinOp::FAdd,
                    | IType::Scalar(BaseTy::Int) => BinOp::IAdd,
                    | _ => return Err(Error::compiler("accumulation at non-numeric leaf")),
                };
                let sum = self.emit_op_ie(PrimOp::ScalarBinOp(op, old, value))?;
                self.store_anywhere(&ptr, sum)
            }
            | Dest::Tab(b, _) => {
                let ix_ty = b.ty.clone();
                let dest = dest.clone();
                let src = src.clone();
                self.emit_ix_loop(Direction::Fwd, &ix_ty, |lo, idx| {
                    let d_i = lo.index_dest(&dest, &idx)?;
                    let s_i = lo.table_get(&src, &idx)?;
                    lo.add_to_atom(&d_i, &s_i)
                })
            }
            | Dest::Pair(da, db) => match src.as_ref() {
                | Atom::Con(PrimCon::PairCon(a, b)) => {
                    self.add_to_atom(da, a)?;
                    self.add_to_atom(db, b)
                }
                | _ => Err(Error::compiler("accumulating a non-pair")),
            },
            | Dest::Unit => Ok(()),
            | Dest::RecordD(r) => match src.as_ref() {
                | Atom::Con(PrimCon::RecCon(items)) => {
                    r.zip_with(items, |d, a| self.add_to_atom(d, a)).map(|_| ())
                }
                | _ => Err(Error::compiler("accumulating a non-record")),
            },
            | _ => Err(Error::compiler("accumulation into this destination shape")),
        }
    }

    /// Zero-initialize an accumulator destination.
    pub fn zero_dest(&mut self, dest: &Dest) -> Result<()> {
        let ty = dest_type(dest)?;
        let zero = tabula_core::ty::zero_at(&ty)?;
        self.copy_unchecked(dest, &zero)
    }

    /// Index a table value: a memory-backed variable, a lambda, or a
    /// constant table.
    fn table_get(&mut self, tab: &RcAtom, i: &RcAtom) -> Result<RcAtom> {
        match tab.as_ref() {
            | Atom::Var(v) => {
                let d = self
                    .dest_env
                    .get(&v.name)
                    .cloned()
                    .ok_or_else(|| Error::compiler(format!("unbacked table {}", v.name)))?;
                let d_i = self.index_dest(&d, i)?;
                self.dest_to_atom(&d_i)
            }
            | Atom::Lam(Lam { binder, body, .. }) => {
                let env = SubstEnv::singleton(binder.name.clone(), i.clone());
                let body = subst_block(&env, &Scope::new(), body);
                self.translate_block(None, &body)
            }
            | Atom::Con(PrimCon::AFor(_, body)) => Ok(body.clone()),
            | Atom::Con(PrimCon::ArrayLit(tab_ty, lits)) => {
                // Stage the literal buffer once, then index into it.
                let Atom::Pi(pi) = tab_ty.as_ref() else {
                    return Err(Error::compiler("array literal with non-table type"));
                };
                let inner = pi.body.clone();
                let (b, stride) = self.flat_elem(&inner)?;
                let ptr = self.capture_ptr_lit(b, lits.clone());
                let ord = self.index_to_int(i)?;
                let off = algebra::emit_imul(self, ord, stride)?;
                let at = self.emit_op_ie(PrimOp::PtrOffset(ptr, off))?;
                match inner.as_ref() {
                    | Atom::TC(PrimTC::Base(_)) => {
                        let v = self
                            .emit_instr(ImpInstr::Load(at))?
                            .ok_or_else(|| Error::compiler("load produced no value"))?;
                        self.iexpr_atom(&v)
                    }
                    | _ => Err(Error::not_implemented(
                        "partial indexing of nested array literals",
                    )),
                }
            }
            | other => Err(Error::compiler(format!("indexing a non-table: {:?}", other))),
        }
    }

    /// The scalar element type of a table type and the flat element count
    /// of one slice below the outermost dimension.
    fn flat_elem(&mut self, inner: &RcTy) -> Result<(BaseTy, IExpr)> {
        match inner.as_ref() {
            | Atom::TC(PrimTC::Base(b)) => Ok((*b, IExpr::int(1))),
            | Atom::Pi(pi) if matches!(pi.arr, ArrowKind::Tab) => {
                let n = algebra::size_of_ix(self, &pi.binder.ty)?;
                let (b, rest) = self.flat_elem(&pi.body)?;
                let total = algebra::emit_imul(self, n, rest)?;
                Ok((b, total))
            }
            | other => Err(Error::not_implemented(format!(
                "array literals of element type {:?}",
                other
            ))),
        }
    }

    fn capture_ptr_lit(&mut self, elem: BaseTy, lits: Vec<Literal>) -> IExpr {
        if let Some((p, _)) = self.ptr_lits.iter().find(|(_, ls)| ls == &lits) {
            return IExpr::Lit(ILit::Ptr(*p));
        }
        let p = PtrLit { id: self.ptr_lits.len(), elem };
        self.ptr_lits.push((p, lits));
        IExpr::Lit(ILit::Ptr(p))
    }

    /* ----------------------------- translation ----------------------------- */

    pub fn translate_block(&mut self, dest: Option<&Dest>, block: &Block) -> Result<RcAtom> {
        let saved_env = self.env.clone();
        let let_names: im::HashSet<Name> = block
            .decls
            .iter()
            .flat_map(|d| d.binders().into_iter().map(|b| b.name.clone()))
            .collect();
        // Route result components to their defining declarations where the
        // result is a pure atom; anything else is copied at the end.
        let (mut routes, copies) = match (&block.result, dest) {
            | (Expr::Atom(v), Some(d)) => {
                let mut routes = im::HashMap::new();
                let mut copies = Vec::new();
                self.split_dest(v, d, &let_names, &mut routes, &mut copies)?;
                (routes, copies)
            }
            | _ => (im::HashMap::new(), Vec::new()),
        };
        for decl in &block.decls {
            match decl {
                | Decl::Let(_, b, e) => {
                    let d = routes.remove(&b.name);
                    let atom = self.translate_expr(d.as_ref(), e)?;
                    self.env.insert(b.name.clone(), atom);
                }
                | Decl::Unpack(bs, e) => {
                    let atom = self.translate_expr(None, e)?;
                    let parts = self.unpack_parts(&atom, bs.len())?;
                    for (b, p) in bs.iter().zip(parts) {
                        self.env.insert(b.name.clone(), p);
                    }
                }
            }
        }
        for (d, atom) in copies {
            let atom = subst_atom(&self.env, &Scope::new(), &atom);
            self.copy_atom(&d, &atom)?;
        }
        let out = match (&block.result, dest) {
            | (Expr::Atom(v), Some(_)) => Ok(subst_atom(&self.env, &Scope::new(), v)),
            | (result, d) => self.translate_expr(d, result),
        };
        self.env = saved_env;
        out
    }

    fn split_dest(
        &mut self, result: &RcAtom, dest: &Dest, let_names: &im::HashSet<Name>,
        routes: &mut im::HashMap<Name, Dest>, copies: &mut Vec<(Dest, RcAtom)>,
    ) -> Result<()> {
        match (result.as_ref(), dest) {
            | (Atom::Var(v), _) if let_names.contains(&v.name) => {
                if routes.contains_key(&v.name) {
                    copies.push((dest.clone(), result.clone()));
                } else {
                    routes.insert(v.name.clone(), dest.clone());
                }
                Ok(())
            }
            | (Atom::Con(PrimCon::PairCon(a, b)), Dest::Pair(da, db)) => {
                self.split_dest(a, da, let_names, routes, copies)?;
                self.split_dest(b, db, let_names, routes, copies)
            }
            | (Atom::Con(PrimCon::RecCon(items)), Dest::RecordD(r)) => {
                r.zip_with(items, |d, a| {
                    self.split_dest(a, d, let_names, routes, copies)
                })?;
                Ok(())
            }
            | _ => {
                copies.push((dest.clone(), result.clone()));
                Ok(())
            }
        }
    }

    fn unpack_parts(&mut self, atom: &RcAtom, arity: usize) -> Result<Vec<RcAtom>> {
        match atom.as_ref() {
            | Atom::Con(PrimCon::DataCon(_, _, _, args)) if args.len() == arity => {
                Ok(args.clone())
            }
            | Atom::Con(PrimCon::RecCon(Record::Tup(items))) if items.len() == arity => {
                Ok(items.clone())
            }
            | other => Err(Error::compiler(format!("cannot unpack value {:?}", other))),
        }
    }

    pub fn translate_expr(&mut self, dest: Option<&Dest>, expr: &Expr) -> Result<RcAtom> {
        match expr {
            | Expr::Atom(a) => {
                let a = subst_atom(&self.env, &Scope::new(), a);
                match dest {
                    | Some(d) => {
                        self.copy_atom(d, &a)?;
                        Ok(a)
                    }
                    | None => Ok(a),
                }
            }
            | Expr::App(_, f, x) => {
                let f = subst_atom(&self.env, &Scope::new(), f);
                let x = subst_atom(&self.env, &Scope::new(), x);
                let v = self.table_get(&f, &x)?;
                if let Some(d) = dest {
                    self.copy_atom(d, &v)?;
                }
                Ok(v)
            }
            | Expr::Op(op) => {
                let op = op.try_map(|a| Ok::<_, Error>(subst_atom(&self.env, &Scope::new(), a)))?;
                let v = self.to_imp_op(op)?;
                if let Some(d) = dest {
                    self.copy_atom(d, &v)?;
                }
                Ok(v)
            }
            | Expr::Hof(hof) => self.to_imp_hof(dest, hof),
            | Expr::Case(scrut, alts, ty) => {
                let scrut = subst_atom(&self.env, &Scope::new(), scrut);
                self.translate_case(dest, &scrut, alts, ty)
            }
        }
    }

    fn translate_case(
        &mut self, dest: Option<&Dest>, scrut: &RcAtom, alts: &[Alt], ty: &RcTy,
    ) -> Result<RcAtom> {
        match scrut.as_ref() {
            | Atom::Con(PrimCon::DataCon(_, _, i, args)) => {
                let alt = alts
                    .get(*i)
                    .ok_or_else(|| Error::compiler("case alternative out of range"))?;
                let env: SubstEnv = alt
                    .binders
                    .iter()
                    .zip(args)
                    .map(|(b, a)| (b.name.clone(), a.clone()))
                    .collect();
                let body = subst_block(&env, &Scope::new(), &alt.body);
                self.translate_block(dest, &body)
            }
            | Atom::Con(PrimCon::SumAsProd(_, tag, payload)) => {
                let owned;
                let dest = match dest {
                    | Some(d) => d,
                    | None => {
                        owned = self.make_alloc_dest(AllocKind::Managed, "case", ty)?;
                        &owned
                    }
                };
                let tag_ie = self.atom_to_iexpr(tag)?;
                let cases: Vec<(Block, SubstEnv)> = alts
                    .iter()
                    .enumerate()
                    .map(|(i, alt)| {
                        let env: SubstEnv = alt
                            .binders
                            .iter()
                            .zip(payload.get(i).cloned().unwrap_or_default())
                            .map(|(b, a)| (b.name.clone(), a))
                            .collect();
                        (alt.body.clone(), env)
                    })
                    .collect();
                self.emit_switch(tag_ie, cases, dest)?;
                self.dest_to_atom(dest)
            }
            | other => Err(Error::compiler(format!(
                "case scrutinee is not a constructor: {:?}",
                other
            ))),
        }
    }

    /// A chain of conditionals comparing the tag against 0, 1, 2, ...
    fn emit_switch(
        &mut self, tag: IExpr, cases: Vec<(Block, SubstEnv)>, dest: &Dest,
    ) -> Result<()> {
        let n = cases.len();
        let mut rev_chain: Vec<(usize, Vec<ImpStmt>)> = Vec::new();
        for (i, (body, env)) in cases.into_iter().enumerate() {
            let (stmts, ()) = self.scoped(|lo| {
                let body = subst_block(&env, &Scope::new(), &body);
                lo.translate_block(Some(dest), &body)?;
                Ok(())
            })?;
            rev_chain.push((i, stmts));
        }
        let mut else_case = ImpBlock::default();
        for (i, stmts) in rev_chain.into_iter().rev() {
            if i == n - 1 {
                else_case = ImpBlock { stmts, results: Vec::new() };
                continue;
            }
            let pred = self.emit_op_ie(PrimOp::ScalarBinOp(
                BinOp::ICmp(CmpOp::Equal),
                tag.clone(),
                IExpr::int(i as i64),
            ))?;
            let cond = ImpInstr::ICond {
                pred,
                then_case: ImpBlock { stmts, results: Vec::new() },
                else_case,
            };
            else_case = ImpBlock {
                stmts: vec![ImpStmt { binder: None, instr: cond }],
                results: Vec::new(),
            };
        }
        for stmt in else_case.stmts {
            self.stmts.push(stmt);
        }
        Ok(())
    }

    /* ------------------------------ operations ----------------------------- */

    fn to_imp_op(&mut self, op: PrimOp<RcAtom>) -> Result<RcAtom> {
        use PrimOp::*;
        match op {
            | ScalarBinOp(b, x, y) => {
                let x = self.atom_to_iexpr(&x)?;
                let y = self.atom_to_iexpr(&y)?;
                let v = self.emit_op_ie(ScalarBinOp(b, x, y))?;
                self.iexpr_atom(&v)
            }
            | ScalarUnOp(u, x) => {
                let x = self.atom_to_iexpr(&x)?;
                let v = self.emit_op_ie(ScalarUnOp(u, x))?;
                self.iexpr_atom(&v)
            }
            | Select(p, x, y) => {
                let p = self.atom_to_iexpr(&p)?;
                let x = self.atom_to_iexpr(&x)?;
                let y = self.atom_to_iexpr(&y)?;
                let v = self.emit_op_ie(Select(p, x, y))?;
                self.iexpr_atom(&v)
            }
            | Fst(x) => match x.as_ref() {
                | Atom::Con(PrimCon::PairCon(a, _)) => Ok(a.clone()),
                | _ => Err(Error::compiler("Fst of a non-pair at the Imp level")),
            },
            | Snd(x) => match x.as_ref() {
                | Atom::Con(PrimCon::PairCon(_, b)) => Ok(b.clone()),
                | _ => Err(Error::compiler("Snd of a non-pair at the Imp level")),
            },
            | RecGet(x, field) => match x.as_ref() {
                | Atom::Con(PrimCon::RecCon(r)) => r
                    .get(&field)
                    .cloned()
                    .ok_or_else(|| Error::compiler("missing record field")),
                | _ => Err(Error::compiler("RecGet of a non-record at the Imp level")),
            },
            | SumGet(x, left) => match x.as_ref() {
                | Atom::Con(PrimCon::SumCon(_, l, r)) => {
                    Ok(if left { l.clone() } else { r.clone() })
                }
                | Atom::Con(PrimCon::SumAsProd(_, _, rows)) => {
                    let row = if left { &rows[0] } else { &rows[1] };
                    row.first()
                        .cloned()
                        .ok_or_else(|| Error::compiler("empty sum payload"))
                }
                | _ => Err(Error::compiler("SumGet of a non-sum at the Imp level")),
            },
            | SumTag(x) => match x.as_ref() {
                | Atom::Con(PrimCon::SumCon(t, _, _)) => Ok(t.clone()),
                | Atom::Con(PrimCon::SumAsProd(_, t, _)) => Ok(t.clone()),
                | _ => Err(Error::compiler("SumTag of a non-sum at the Imp level")),
            },
            | IndexAsInt(x) => {
                let v = self.index_to_int(&x)?;
                self.iexpr_atom(&v)
            }
            | IntAsIndex(ty, x) => {
                let i = self.atom_to_iexpr(&x)?;
                let n = algebra::size_of_ix(self, &ty)?;
                // Trap out-of-range ordinals.
                let lt = self.emit_op_ie(ScalarBinOp(
                    BinOp::ICmp(CmpOp::Less),
                    i.clone(),
                    IExpr::int(0),
                ))?;
                let ge = self.emit_op_ie(ScalarBinOp(
                    BinOp::ICmp(CmpOp::GreaterEqual),
                    i.clone(),
                    n,
                ))?;
                let bad = self.emit_op_ie(ScalarBinOp(BinOp::Or, lt, ge))?;
                self.push(
                    None,
                    ImpInstr::ICond {
                        pred: bad,
                        then_case: ImpBlock {
                            stmts: vec![ImpStmt {
                                binder: None,
                                instr: ImpInstr::IThrowError,
                            }],
                            results: Vec::new(),
                        },
                        else_case: ImpBlock::default(),
                    },
                );
                self.int_to_index(&ty, i)
            }
            | IdxSetSize(ty) => {
                let n = algebra::size_of_ix(self, &ty)?;
                self.iexpr_atom(&n)
            }
            | PrimEffect(r, eop) => self.to_imp_effect(&r, eop),
            | IndexRef(r, i) => {
                let d = self.ref_dest(&r)?;
                let d_i = self.index_dest(&d, &i)?;
                let ty = match type_of_atom(&r)?.as_ref() {
                    | Atom::TC(PrimTC::Ref(h, tab)) => match tab.as_ref() {
                        | Atom::Pi(pi) => Atom::ref_ty(
                            h.clone(),
                            tabula_core::subst::apply_pi(pi, &i),
                        ),
                        | _ => return Err(Error::compiler("IndexRef of non-table ref")),
                    },
                    | _ => return Err(Error::compiler("IndexRef of non-ref")),
                };
                let name = self.fresh_name("ref");
                self.dest_env.insert(name.clone(), d_i);
                Ok(Atom::Var(Var::new(name, ty)).rc())
            }
            | PtrOffset(p, o) => {
                let p = self.atom_to_iexpr(&p)?;
                let o = self.atom_to_iexpr(&o)?;
                let v = self.emit_op_ie(PtrOffset(p, o))?;
                self.iexpr_atom(&v)
            }
            | PtrLoad(p) => {
                let p = self.atom_to_iexpr(&p)?;
                let v = self.emit_op_ie(PtrLoad(p))?;
                self.iexpr_atom(&v)
            }
            | Cmp(_, _, _, _) => {
                Err(Error::compiler("type-directed compare survived simplification"))
            }
        }
    }

    fn ref_dest(&mut self, r: &RcAtom) -> Result<Dest> {
        let Atom::Var(v) = r.as_ref() else {
            return Err(Error::compiler("reference is not a variable"));
        };
        self.dest_env
            .get(&v.name)
            .cloned()
            .ok_or_else(|| Error::compiler(format!("unbound reference {}", v.name)))
    }

    fn to_imp_effect(&mut self, r: &RcAtom, eop: EffectOp<RcAtom>) -> Result<RcAtom> {
        let d = self.ref_dest(r)?;
        match eop {
            | EffectOp::Ask | EffectOp::Get => self.dest_to_atom(&d),
            | EffectOp::Tell(x) => {
                self.add_to_atom(&d, &x)?;
                Ok(Atom::unit())
            }
            | EffectOp::Put(x) => {
                self.copy_atom(&d, &x)?;
                Ok(Atom::unit())
            }
        }
    }

    /* --------------------------------- hofs -------------------------------- */

    fn to_imp_hof(&mut self, dest: Option<&Dest>, hof: &PrimHof<RcAtom>) -> Result<RcAtom> {
        use PrimHof::*;
        match hof {
            | For(dir, lam) => {
                let lam = subst_atom(&self.env, &Scope::new(), lam);
                let Atom::Lam(Lam { binder, body, arr }) = lam.as_ref() else {
                    return Err(Error::compiler("for of a non-lambda"));
                };
                let owned;
                let dest = match dest {
                    | Some(d) => d,
                    | None => {
                        let tab_ty = Atom::Pi(PiTy {
                            arr: ArrowKind::Tab,
                            binder: binder.clone(),
                            body: type_of_block(body)?,
                        })
                        .rc();
                        owned = self.make_alloc_dest(AllocKind::Managed, "for", &tab_ty)?;
                        &owned
                    }
                };
                let pure = arr.eff().is_pure();
                if pure && self.parallel_top && self.backend.kernel_cc().is_some() {
                    self.emit_kernel(binder, body, dest)?;
                } else {
                    let was_top = std::mem::replace(&mut self.parallel_top, false);
                    let ix_ty = binder.ty.clone();
                    let binder = binder.clone();
                    let body = body.clone();
                    let dest_c = dest.clone();
                    self.emit_ix_loop(*dir, &ix_ty, |lo, idx| {
                        let d_i = lo.index_dest(&dest_c, &idx)?;
                        let env = SubstEnv::singleton(binder.name.clone(), idx);
                        let body = subst_block(&env, &Scope::new(), &body);
                        lo.translate_block(Some(&d_i), &body)?;
                        Ok(())
                    })?;
                    self.parallel_top = was_top;
                }
                self.dest_to_atom(dest)
            }
            | While(cond, body) => {
                let cond = subst_atom(&self.env, &Scope::new(), cond);
                let body = subst_atom(&self.env, &Scope::new(), body);
                let (cond_stmts, cond_res) = self.scoped(|lo| {
                    let c = lo.apply_nullary(&cond)?;
                    lo.atom_to_iexpr(&c)
                })?;
                let (body_stmts, ()) = self.scoped(|lo| {
                    lo.apply_nullary(&body)?;
                    Ok(())
                })?;
                self.push(
                    None,
                    ImpInstr::IWhile {
                        cond: ImpBlock { stmts: cond_stmts, results: vec![cond_res] },
                        body: ImpBlock { stmts: body_stmts, results: Vec::new() },
                    },
                );
                Ok(Atom::unit())
            }
            | RunReader(r, lam) => {
                let r = subst_atom(&self.env, &Scope::new(), r);
                let r_ty = type_of_atom(&r)?;
                let d = self.make_alloc_dest(AllocKind::Managed, "rdr", &r_ty)?;
                self.copy_atom(&d, &r)?;
                let ans = self.run_with_ref(lam, d, dest)?;
                Ok(ans)
            }
            | RunWriter(lam) => {
                let (ans_dest, acc_dest) = match dest {
                    | Some(Dest::Pair(a, w)) => (a.as_ref().clone(), w.as_ref().clone()),
                    | Some(_) => {
                        return Err(Error::compiler("runWriter needs a pair destination"))
                    }
                    | None => {
                        let (a_ty, w_ty) = self.run_result_tys(lam)?;
                        let a = self.make_alloc_dest(AllocKind::Managed, "ans", &a_ty)?;
                        let w = self.make_alloc_dest(AllocKind::Managed, "acc", &w_ty)?;
                        (a, w)
                    }
                };
                self.zero_dest(&acc_dest)?;
                let ans = self.run_with_ref(lam, acc_dest.clone(), Some(&ans_dest))?;
                let acc = self.dest_to_atom(&acc_dest)?;
                Ok(Atom::pair(ans, acc))
            }
            | RunState(s, lam) => {
                let s = subst_atom(&self.env, &Scope::new(), s);
                let s_ty = type_of_atom(&s)?;
                let (st_dest, ans_dest): (Dest, Option<Dest>) = match dest {
                    | Some(Dest::Pair(a, st)) => {
                        (st.as_ref().clone(), Some(a.as_ref().clone()))
                    }
                    | Some(_) => return Err(Error::compiler("runState needs a pair destination")),
                    | None => {
                        let d = self.make_alloc_dest(AllocKind::Managed, "st", &s_ty)?;
                        (d, None)
                    }
                };
                self.copy_atom(&st_dest, &s)?;
                let ans = self.run_with_ref(lam, st_dest.clone(), ans_dest.as_ref())?;
                let final_state = self.dest_to_atom(&st_dest)?;
                Ok(Atom::pair(ans, final_state))
            }
            | Linearize(_) | Transpose(_) => {
                Err(Error::compiler("autodiff primitive survived simplification"))
            }
        }
    }

    /// Open `\region. \ref. body`, bind the reference to the destination,
    /// and translate the body. Effect regions are erased at this level.
    fn run_with_ref(
        &mut self, lam: &RcAtom, ref_dest: Dest, dest: Option<&Dest>,
    ) -> Result<RcAtom> {
        let lam = subst_atom(&self.env, &Scope::new(), lam);
        let Atom::Lam(Lam { binder: region, body: outer, .. }) = lam.as_ref() else {
            return Err(Error::compiler("run* of a non-lambda"));
        };
        let Expr::Atom(inner) = &outer.result else {
            return Err(Error::compiler("run* lambda body must be an inner lambda"));
        };
        let Atom::Lam(Lam { binder: ref_binder, body, .. }) = inner.as_ref() else {
            return Err(Error::compiler("run* lambda body must be an inner lambda"));
        };
        let region_env = SubstEnv::singleton(region.name.clone(), Atom::unit_ty());
        let ref_ty = subst_atom(&region_env, &Scope::new(), &ref_binder.ty);
        let ref_name = self.fresh_name(&ref_binder.name.hint);
        self.dest_env.insert(ref_name.clone(), ref_dest);
        let ref_var = Atom::Var(Var::new(ref_name, ref_ty)).rc();
        let env = region_env + [(ref_binder.name.clone(), ref_var)];
        let body = subst_block(&env, &Scope::new(), body);
        self.translate_block(dest, &body)
    }

    /// The `(answer, carried value)` types of a `run*` lambda.
    fn run_result_tys(&mut self, lam: &RcAtom) -> Result<(RcTy, RcTy)> {
        let lam = subst_atom(&self.env, &Scope::new(), lam);
        let Atom::Lam(Lam { binder: region, body: outer, .. }) = lam.as_ref() else {
            return Err(Error::compiler("run* of a non-lambda"));
        };
        let Expr::Atom(inner) = &outer.result else {
            return Err(Error::compiler("run* lambda body must be an inner lambda"));
        };
        let Atom::Lam(Lam { binder: ref_binder, body, .. }) = inner.as_ref() else {
            return Err(Error::compiler("run* lambda body must be an inner lambda"));
        };
        let region_env = SubstEnv::singleton(region.name.clone(), Atom::unit_ty());
        let val_ty = match ref_binder.ty.as_ref() {
            | Atom::TC(PrimTC::Ref(_, a)) => subst_atom(&region_env, &Scope::new(), a),
            | _ => return Err(Error::compiler("run* inner binder is not a reference")),
        };
        let ans_ty = subst_atom(&region_env, &Scope::new(), &type_of_block(body)?);
        Ok((ans_ty, val_ty))
    }

    fn apply_nullary(&mut self, lam: &RcAtom) -> Result<RcAtom> {
        match lam.as_ref() {
            | Atom::Lam(Lam { binder, body, .. }) => {
                let env = SubstEnv::singleton(binder.name.clone(), Atom::unit());
                let body = subst_block(&env, &Scope::new(), body);
                self.translate_block(None, &body)
            }
            | _ => Err(Error::compiler("expected a lambda")),
        }
    }

    /* -------------------------------- loops -------------------------------- */

    /// Loop over the ordinals of an index set, rebuilding the index value
    /// per iteration.
    fn emit_ix_loop(
        &mut self, dir: Direction, ix_ty: &RcTy,
        body: impl FnOnce(&mut Lowerer, RcAtom) -> Result<()>,
    ) -> Result<()> {
        let n = algebra::size_of_ix(self, ix_ty)?;
        let i = self.fresh_ivar("i", IType::Scalar(BaseTy::Int));
        let ix_ty = ix_ty.clone();
        let (stmts, ()) = self.scoped(|lo| {
            let idx = lo.int_to_index(&ix_ty, IExpr::Var(i.clone()))?;
            body(lo, idx)
        })?;
        self.push(
            None,
            ImpInstr::IFor {
                dir,
                binder: i,
                n,
                body: ImpBlock { stmts, results: Vec::new() },
            },
        );
        Ok(())
    }

    /* ------------------------------- kernels -------------------------------- */

    /// Extract a pure top-level `for` into its own function and launch it.
    /// Iteration order is free for pure loops, so no direction is carried.
    fn emit_kernel(&mut self, binder: &Var, body: &Block, dest: &Dest) -> Result<()> {
        let (cc, dev) = self
            .backend
            .kernel_cc()
            .ok_or_else(|| Error::compiler("backend does not launch kernels"))?;
        let n = algebra::size_of_ix(self, &binder.ty)?;
        let i = self.fresh_ivar("tid", IType::Scalar(BaseTy::Int));
        let saved_dev = std::mem::replace(&mut self.cur_dev, dev);
        let was_top = std::mem::replace(&mut self.parallel_top, false);
        let (stmts, ()) = self.scoped(|lo| {
            let idx = lo.int_to_index(&binder.ty, IExpr::Var(i.clone()))?;
            let d_i = lo.index_dest(dest, &idx)?;
            let env = SubstEnv::singleton(binder.name.clone(), idx);
            let body = subst_block(&env, &Scope::new(), body);
            lo.translate_block(Some(&d_i), &body)?;
            Ok(())
        })?;
        self.parallel_top = was_top;
        self.cur_dev = saved_dev;
        let kernel_body = ImpBlock { stmts, results: Vec::new() };
        // The kernel closes over exactly its free variables plus the
        // thread index.
        let mut args = vec![i.clone()];
        for v in free_ivars(&kernel_body) {
            if v.name != i.name && !args.iter().any(|a| a.name == v.name) {
                args.push(v);
            }
        }
        let fun_name = {
            let name = self.fresh_name("kernel");
            Name::new(NameTag::TopFun, name.hint, name.num)
        };
        self.functions.push(ImpFunction {
            name: fun_name.clone(),
            cc,
            args: args.clone(),
            body: kernel_body,
        });
        let call_args = args[1..].iter().map(|v| IExpr::Var(v.clone())).collect();
        self.push(None, ImpInstr::ILaunch { fun: fun_name, size: n, args: call_args });
        Ok(())
    }

    /* ------------------------------- results -------------------------------- */

    /// Flatten a destination into the entry function's results and the
    /// reconstruction: scalar leaves load now; leaves under tables become
    /// column binders applied index by index in the recon atom.
    fn dest_result(
        &mut self, dest: &Dest, tab_ctx: &[Var], binders: &mut Vec<Var>,
        results: &mut Vec<IExpr>, decls: &mut Vec<Decl>,
    ) -> Result<RcAtom> {
        match dest {
            | Dest::Base(ptr) => {
                let elem = match ptr.ty() {
                    | IType::Ptr(p) => p.elem,
                    | _ => return Err(Error::compiler("base destination with scalar pointer")),
                };
                if tab_ctx.is_empty() {
                    let v = self
                        .emit_instr(ImpInstr::Load(ptr.clone()))?
                        .ok_or_else(|| Error::compiler("load produced no value"))?;
                    let name = self.fresh_name("res");
                    let var = Var::new(name, Atom::base(elem));
                    binders.push(var.clone());
                    results.push(v);
                    Ok(var.to_atom())
                } else {
                    // Column type: the enclosing tables over the element.
                    let col_ty = tab_ctx.iter().rev().fold(Atom::base(elem), |acc, b| {
                        Atom::Pi(PiTy {
                            arr: ArrowKind::Tab,
                            binder: b.clone(),
                            body: acc,
                        })
                        .rc()
                    });
                    let name = self.fresh_name("col");
                    let col = Var::new(name, col_ty);
                    binders.push(col.clone());
                    results.push(ptr.clone());
                    let mut cur = col.to_atom();
                    for b in tab_ctx {
                        let v = Var::new(
                            self.fresh_name("elt"),
                            tabula_core::ty::type_of_expr(&Expr::App(
                                ArrowKind::Tab,
                                cur.clone(),
                                b.to_atom(),
                            ))?,
                        );
                        decls.push(Decl::Let(
                            LetAnn::Plain,
                            v.clone(),
                            Expr::App(ArrowKind::Tab, cur, b.to_atom()),
                        ));
                        cur = v.to_atom();
                    }
                    Ok(cur)
                }
            }
            | Dest::Tab(b, inner) => {
                let mut ctx = tab_ctx.to_vec();
                ctx.push(b.clone());
                let mut inner_decls = Vec::new();
                let body =
                    self.dest_result(inner, &ctx, binders, results, &mut inner_decls)?;
                Ok(Atom::Lam(Lam {
                    arr: ArrowKind::Tab,
                    binder: b.clone(),
                    body: Block {
                        decls: inner_decls,
                        result: Expr::Atom(body),
                        eff: EffectRow::pure(),
                    },
                })
                .rc())
            }
            | Dest::Pair(a, b) => {
                let a = self.dest_result(a, tab_ctx, binders, results, decls)?;
                let b = self.dest_result(b, tab_ctx, binders, results, decls)?;
                Ok(Atom::pair(a, b))
            }
            | Dest::Unit => Ok(Atom::unit()),
            | Dest::RecordD(r) => Ok(Atom::Con(PrimCon::RecCon(
                r.try_map(|d| self.dest_result(d, tab_ctx, binders, results, decls))?,
            ))
            .rc()),
            | Dest::SumAsProdD { ty, tag, payload } => {
                let tag = self.dest_result(tag, tab_ctx, binders, results, decls)?;
                let payload = payload
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|d| self.dest_result(d, tab_ctx, binders, results, decls))
                            .collect::<Result<Vec<_>>>()
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Atom::Con(PrimCon::SumAsProd(ty.clone(), tag, payload)).rc())
            }
            | Dest::DataConD(def, params, fields) => {
                let args = fields
                    .iter()
                    .map(|d| self.dest_result(d, tab_ctx, binders, results, decls))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Atom::Con(PrimCon::DataCon(def.clone(), params.clone(), 0, args)).rc())
            }
            | Dest::IndexD { ty, repr } => {
                let ord = self.dest_result(repr, tab_ctx, binders, results, decls)?;
                match ty.as_ref() {
                    | Atom::TC(PrimTC::IntRange(l, h)) => {
                        Ok(Atom::Con(PrimCon::IntRangeVal(l.clone(), h.clone(), ord)).rc())
                    }
                    | Atom::TC(PrimTC::IndexRange(t, l, h)) => Ok(Atom::Con(
                        PrimCon::IndexRangeVal(t.clone(), l.clone(), h.clone(), ord),
                    )
                    .rc()),
                    | Atom::TC(PrimTC::CharTy) => {
                        Ok(Atom::Con(PrimCon::CharCon(ord)).rc())
                    }
                    | _ => Err(Error::compiler("bad index destination type")),
                }
            }
            | Dest::ConstD(a) => Ok(a.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{Interpreter, RtVal};
    use pretty_assertions::assert_eq;

    fn ix(n: i64) -> RcTy {
        Atom::int_range(0, n)
    }

    #[test]
    fn indices_round_trip_through_their_representation() {
        let mut lo = Lowerer::new(Backend::Interp);
        let idx = lo.int_to_index(&ix(5), IExpr::int(3)).unwrap();
        assert!(matches!(idx.as_ref(), Atom::Con(PrimCon::IntRangeVal(_, _, _))));
        assert_eq!(lo.index_to_int(&idx).unwrap(), IExpr::int(3));
    }

    #[test]
    fn dest_result_decomposes_tables_into_columns() {
        // A (table, scalar) pair: the table leaf comes back as a pointer
        // column rebuilt by a table lambda, the scalar as a direct load.
        let mut lo = Lowerer::new(Backend::Interp);
        let ty = Atom::pair_ty(Atom::tab_ty(ix(2), Atom::real_ty()), Atom::int_ty());
        let dest = lo.make_alloc_dest(AllocKind::Unmanaged, "out", &ty).unwrap();
        let mut binders = Vec::new();
        let mut results = Vec::new();
        let mut decls = Vec::new();
        let atom = lo.dest_result(&dest, &[], &mut binders, &mut results, &mut decls).unwrap();

        assert!(decls.is_empty());
        assert_eq!(binders.len(), 2);
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0].ty(), IType::Ptr(_)));
        assert_eq!(results[1].ty(), IType::Scalar(BaseTy::Int));
        assert!(matches!(binders[0].ty.as_ref(), Atom::Pi(pi) if matches!(pi.arr, ArrowKind::Tab)));

        let Atom::Con(PrimCon::PairCon(tab, scalar)) = atom.as_ref() else {
            panic!("expected a pair reconstruction, got {:?}", atom)
        };
        assert!(matches!(scalar.as_ref(), Atom::Var(_)));
        let Atom::Lam(Lam { arr: ArrowKind::Tab, body, .. }) = tab.as_ref() else {
            panic!("expected a table lambda, got {:?}", tab)
        };
        // One indexing step rebuilds the element from the column.
        assert_eq!(body.decls.len(), 1);
        assert!(matches!(
            &body.decls[0],
            Decl::Let(_, _, Expr::App(ArrowKind::Tab, _, _))
        ));
    }

    #[test]
    fn three_level_tables_lay_out_row_major() {
        // for i<2. for j<3. for k<4. i*12 + j*4 + k writes the flat
        // ordinals 0..24 in order, so every level's stride is exact.
        let int = Atom::int_ty();
        let i = Var::new(Name::free("i"), ix(2));
        let j = Var::new(Name::free("j"), ix(3));
        let k = Var::new(Name::free("k"), ix(4));
        let oi = Var::new(Name::free("oi"), int.clone());
        let oj = Var::new(Name::free("oj"), int.clone());
        let ok = Var::new(Name::free("ok"), int.clone());
        let a = Var::new(Name::free("a"), int.clone());
        let b = Var::new(Name::free("b"), int.clone());
        let c = Var::new(Name::free("c"), int.clone());

        let inner_body = Block {
            decls: vec![
                Decl::Let(LetAnn::Plain, oi.clone(), Expr::Op(PrimOp::IndexAsInt(i.to_atom()))),
                Decl::Let(LetAnn::Plain, oj.clone(), Expr::Op(PrimOp::IndexAsInt(j.to_atom()))),
                Decl::Let(LetAnn::Plain, ok.clone(), Expr::Op(PrimOp::IndexAsInt(k.to_atom()))),
                Decl::Let(
                    LetAnn::Plain,
                    a.clone(),
                    Expr::Op(PrimOp::ScalarBinOp(BinOp::IMul, oi.to_atom(), Atom::lit(12))),
                ),
                Decl::Let(
                    LetAnn::Plain,
                    b.clone(),
                    Expr::Op(PrimOp::ScalarBinOp(BinOp::IMul, oj.to_atom(), Atom::lit(4))),
                ),
                Decl::Let(
                    LetAnn::Plain,
                    c.clone(),
                    Expr::Op(PrimOp::ScalarBinOp(BinOp::IAdd, a.to_atom(), b.to_atom())),
                ),
            ],
            result: Expr::Op(PrimOp::ScalarBinOp(BinOp::IAdd, c.to_atom(), ok.to_atom())),
            eff: EffectRow::pure(),
        };
        let k_lam = Atom::Lam(Lam { arr: ArrowKind::pure(), binder: k, body: inner_body }).rc();
        let row = Var::new(Name::free("row"), Atom::tab_ty(ix(4), int.clone()));
        let j_body = Block {
            decls: vec![Decl::Let(
                LetAnn::Plain,
                row.clone(),
                Expr::Hof(PrimHof::For(Direction::Fwd, k_lam)),
            )],
            result: Expr::Atom(row.to_atom()),
            eff: EffectRow::pure(),
        };
        let j_lam = Atom::Lam(Lam { arr: ArrowKind::pure(), binder: j, body: j_body }).rc();
        let plane = Var::new(
            Name::free("plane"),
            Atom::tab_ty(ix(3), Atom::tab_ty(ix(4), int)),
        );
        let i_body = Block {
            decls: vec![Decl::Let(
                LetAnn::Plain,
                plane.clone(),
                Expr::Hof(PrimHof::For(Direction::Fwd, j_lam)),
            )],
            result: Expr::Atom(plane.to_atom()),
            eff: EffectRow::pure(),
        };
        let i_lam = Atom::Lam(Lam { arr: ArrowKind::pure(), binder: i, body: i_body }).rc();
        let block = Block {
            decls: Vec::new(),
            result: Expr::Hof(PrimHof::For(Direction::Fwd, i_lam)),
            eff: EffectRow::pure(),
        };

        let (module, _, backings) =
            to_imp_module_with_backings(Backend::Llvm, &block).unwrap();
        let mut interp = Interpreter::with_backings(&module, &backings);
        let results = interp.run_main().unwrap();
        let Some(RtVal::Ptr { buf, offset: 0 }) = results.first().copied() else {
            panic!("expected the table's base pointer, got {:?}", results)
        };
        let cells: Vec<i64> =
            interp.buffer(buf).unwrap().iter().map(|s| s.as_int().unwrap()).collect();
        assert_eq!(cells, (0..24).collect::<Vec<i64>>());
    }
}
