//! Destinations: structured pointer-holders mirroring a core type. Leaves
//! are raw pointers; every enclosing table index is applied to a leaf by
//! offsetting it (see `Lowerer::index_dest`).

use crate::syntax::*;
use std::rc::Rc;
use tabula_utils::prelude::*;

#[derive(Clone, Debug)]
pub enum Dest {
    /// A pointer to scalar storage.
    Base(IExpr),
    /// A destination indexed by a table index; the binder scopes over the
    /// inner destination's embedded atoms.
    Tab(Var, Box<Dest>),
    Pair(Box<Dest>, Box<Dest>),
    Unit,
    RecordD(Record<Dest>),
    /// A tagged product covering every constructor's payload.
    SumAsProdD { ty: RcTy, tag: Box<Dest>, payload: Vec<Vec<Dest>> },
    /// A single-constructor data type, field by field.
    DataConD(Rc<DataDef>, Vec<RcAtom>, Vec<Dest>),
    /// Index-set values stored through their integer representation; the
    /// bounds stay as embedded constants.
    IndexD { ty: RcTy, repr: Box<Dest> },
    /// A type-level constant re-displayed as is.
    ConstD(RcAtom),
}

/// The core type a destination mirrors.
pub fn dest_type(dest: &Dest) -> Result<RcTy> {
    match dest {
        | Dest::Base(ptr) => match ptr.ty() {
            | IType::Ptr(p) => Ok(Atom::base(p.elem)),
            | IType::Scalar(_) => Err(Error::compiler("base destination with scalar pointer")),
        },
        | Dest::Tab(b, inner) => Ok(Atom::Pi(PiTy {
            arr: ArrowKind::Tab,
            binder: b.clone(),
            body: dest_type(inner)?,
        })
        .rc()),
        | Dest::Pair(a, b) => Ok(Atom::pair_ty(dest_type(a)?, dest_type(b)?)),
        | Dest::Unit => Ok(Atom::unit_ty()),
        | Dest::RecordD(r) => {
            Ok(Atom::TC(PrimTC::RecordTy(r.try_map(|d| dest_type(d))?)).rc())
        }
        | Dest::SumAsProdD { ty, .. } => Ok(ty.clone()),
        | Dest::DataConD(def, params, _) => {
            Ok(Atom::TC(PrimTC::TypeCon(def.clone(), params.clone())).rc())
        }
        | Dest::IndexD { ty, .. } => Ok(ty.clone()),
        | Dest::ConstD(a) => tabula_core::ty::type_of_atom(a),
    }
}
