//! Integer index arithmetic for offsets and element counts. Sizes and
//! offsets are exact integer polynomials over index-set sizes; literal
//! operands fold at lowering time so small allocations are recognized, and
//! the one dependent-shape family with a closed form (an index ranging
//! over the ordinals below an enclosing binder) uses the clamped
//! triangular sum rather than a runtime loop.

use crate::lower::Lowerer;
use crate::syntax::*;
use tabula_utils::prelude::*;

/// The number of elements of an index set, as an Imp expression.
pub fn size_of_ix(lo: &mut Lowerer, ty: &RcTy) -> Result<IExpr> {
    match ty.as_ref() {
        | Atom::TC(PrimTC::IntRange(l, h)) => {
            let l = lo.atom_to_iexpr(l)?;
            let h = lo.atom_to_iexpr(h)?;
            let d = emit_isub(lo, h, l)?;
            clamp_non_negative(lo, d)
        }
        | Atom::TC(PrimTC::IndexRange(t, low, high)) => {
            let base = size_of_ix(lo, t)?;
            let low = match low {
                | Limit::Unlimited => IExpr::int(0),
                | Limit::Inclusive(x) => lo.index_to_int(x)?,
                | Limit::Exclusive(x) => {
                    let o = lo.index_to_int(x)?;
                    emit_iadd(lo, o, IExpr::int(1))?
                }
            };
            let high = match high {
                | Limit::Unlimited => base,
                | Limit::Exclusive(x) => lo.index_to_int(x)?,
                | Limit::Inclusive(x) => {
                    let o = lo.index_to_int(x)?;
                    emit_iadd(lo, o, IExpr::int(1))?
                }
            };
            let d = emit_isub(lo, high, low)?;
            clamp_non_negative(lo, d)
        }
        | Atom::TC(PrimTC::Base(BaseTy::Bool)) => Ok(IExpr::int(2)),
        | Atom::TC(PrimTC::CharTy) => Ok(IExpr::int(256)),
        | other => Err(Error::not_implemented(format!(
            "size of index set {:?}",
            other
        ))),
    }
}

/// The element count of a buffer indexed by the given binders, innermost
/// last. Independent dimensions multiply; a dimension ranging below an
/// enclosing binder contributes the triangular sum.
pub fn elem_count(lo: &mut Lowerer, dims: &[Var]) -> Result<IExpr> {
    let mut total = IExpr::int(1);
    let mut i = 0;
    while i < dims.len() {
        let dim = &dims[i];
        if let Some(j) = dependent_dim(dims, i) {
            // dims[j] ranges over the ordinals below dims[i]: together the
            // pair contributes the clamped sum of 0..n, i.e. n*(n-1)/2.
            let n = size_of_ix(lo, &dim.ty)?;
            let tri = triangle(lo, n)?;
            total = emit_imul(lo, total, tri)?;
            i = j + 1;
            continue;
        }
        let n = size_of_ix(lo, &dim.ty)?;
        total = emit_imul(lo, total, n)?;
        i += 1;
    }
    Ok(total)
}

/// The flat offset contributed by indexing the outermost dimension at
/// ordinal `ord`, with `inner` the dimensions enclosing the leaf below it.
pub fn index_offset(
    lo: &mut Lowerer, binder: &Var, inner: &[Var], ord: IExpr,
) -> Result<IExpr> {
    if let Some(j) = inner.iter().position(|d| depends_on(&d.ty, &binder.name)) {
        // Only the triangular family has a closed form here.
        if !is_prefix_range(&inner[j].ty, &binder.name) {
            return Err(Error::not_implemented(
                "offsets for this dependent table shape",
            ));
        }
        let rest: Vec<Var> =
            inner.iter().enumerate().filter(|(k, _)| *k != j).map(|(_, d)| d.clone()).collect();
        for d in &rest {
            if depends_on(&d.ty, &binder.name) {
                return Err(Error::not_implemented(
                    "offsets for multiply-dependent table shapes",
                ));
            }
        }
        let tri = triangle(lo, ord)?;
        let per = elem_count(lo, &rest)?;
        return emit_imul(lo, tri, per);
    }
    let per = elem_count(lo, inner)?;
    emit_imul(lo, ord, per)
}

/// `n * (n - 1) / 2`, the sum of the ordinals below `n`.
fn triangle(lo: &mut Lowerer, n: IExpr) -> Result<IExpr> {
    let n1 = emit_isub(lo, n.clone(), IExpr::int(1))?;
    let prod = emit_imul(lo, n, n1)?;
    emit_idiv(lo, prod, IExpr::int(2))
}

fn dependent_dim(dims: &[Var], i: usize) -> Option<usize> {
    dims.iter()
        .enumerate()
        .skip(i + 1)
        .find(|(_, d)| is_prefix_range(&d.ty, &dims[i].name))
        .map(|(j, _)| j)
}

/// `IndexRange(_, unlimited, exclusive(b))` — the ordinals below `b`.
fn is_prefix_range(ty: &RcTy, binder: &Name) -> bool {
    match ty.as_ref() {
        | Atom::TC(PrimTC::IndexRange(_, Limit::Unlimited, Limit::Exclusive(hi))) => {
            matches!(hi.as_ref(), Atom::Var(v) if &v.name == binder)
        }
        | _ => false,
    }
}

fn depends_on(ty: &RcTy, name: &Name) -> bool {
    tabula_core::free::free_vars_atom(ty).lookup(name).is_some()
}

/* --------------------------- folding arithmetic ---------------------------- */

pub fn emit_iadd(lo: &mut Lowerer, a: IExpr, b: IExpr) -> Result<IExpr> {
    match (a.as_lit_int(), b.as_lit_int()) {
        | (Some(0), _) => Ok(b),
        | (_, Some(0)) => Ok(a),
        | (Some(x), Some(y)) => Ok(IExpr::int(x + y)),
        | _ => emit_bin(lo, BinOp::IAdd, a, b),
    }
}

pub fn emit_isub(lo: &mut Lowerer, a: IExpr, b: IExpr) -> Result<IExpr> {
    match (a.as_lit_int(), b.as_lit_int()) {
        | (_, Some(0)) => Ok(a),
        | (Some(x), Some(y)) => Ok(IExpr::int(x - y)),
        | _ => emit_bin(lo, BinOp::ISub, a, b),
    }
}

pub fn emit_imul(lo: &mut Lowerer, a: IExpr, b: IExpr) -> Result<IExpr> {
    match (a.as_lit_int(), b.as_lit_int()) {
        | (Some(1), _) => Ok(b),
        | (_, Some(1)) => Ok(a),
        | (Some(0), _) | (_, Some(0)) => Ok(IExpr::int(0)),
        | (Some(x), Some(y)) => Ok(IExpr::int(x * y)),
        | _ => emit_bin(lo, BinOp::IMul, a, b),
    }
}

fn emit_idiv(lo: &mut Lowerer, a: IExpr, b: IExpr) -> Result<IExpr> {
    match (a.as_lit_int(), b.as_lit_int()) {
        | (_, Some(1)) => Ok(a),
        | (Some(x), Some(y)) if y != 0 => Ok(IExpr::int(x / y)),
        | _ => emit_bin(lo, BinOp::IDiv, a, b),
    }
}

fn clamp_non_negative(lo: &mut Lowerer, d: IExpr) -> Result<IExpr> {
    if let Some(x) = d.as_lit_int() {
        return Ok(IExpr::int(x.max(0)));
    }
    let neg = lo.emit_op_ie(PrimOp::ScalarBinOp(
        BinOp::ICmp(CmpOp::Less),
        d.clone(),
        IExpr::int(0),
    ))?;
    lo.emit_op_ie(PrimOp::Select(neg, IExpr::int(0), d))
}

fn emit_bin(lo: &mut Lowerer, op: BinOp, a: IExpr, b: IExpr) -> Result<IExpr> {
    lo.emit_op_ie(PrimOp::ScalarBinOp(op, a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn dim(hint: &str, ty: RcTy) -> Var {
        Var::new(Name::free(hint), ty)
    }

    fn prefix_of(binder: &Var) -> RcTy {
        Atom::TC(PrimTC::IndexRange(
            binder.ty.clone(),
            Limit::Unlimited,
            Limit::Exclusive(binder.to_atom()),
        ))
        .rc()
    }

    #[test]
    fn literal_sizes_fold_to_constants() {
        let mut lo = Lowerer::new(Backend::Interp);
        let n = size_of_ix(&mut lo, &Atom::int_range(1, 5)).unwrap();
        assert_eq!(n, IExpr::int(4));
        let empty = size_of_ix(&mut lo, &Atom::int_range(5, 1)).unwrap();
        assert_eq!(empty, IExpr::int(0));
    }

    #[test]
    fn element_counts_multiply_independent_dimensions() {
        let mut lo = Lowerer::new(Backend::Interp);
        let dims = [
            dim("i", Atom::int_range(0, 2)),
            dim("j", Atom::int_range(0, 3)),
            dim("k", Atom::int_range(0, 4)),
        ];
        assert_eq!(elem_count(&mut lo, &dims).unwrap(), IExpr::int(24));
    }

    #[test]
    fn nested_offset_is_ordinal_times_inner_count() {
        // For [2, 3, 4] tables, stepping the outer index moves 12 cells.
        let mut lo = Lowerer::new(Backend::Interp);
        let i = dim("i", Atom::int_range(0, 2));
        let inner = [dim("j", Atom::int_range(0, 3)), dim("k", Atom::int_range(0, 4))];
        let off = index_offset(&mut lo, &i, &inner, IExpr::int(1)).unwrap();
        assert_eq!(off, IExpr::int(12));
        let off = index_offset(&mut lo, &inner[0], &inner[1..], IExpr::int(1)).unwrap();
        assert_eq!(off, IExpr::int(4));
    }

    #[test]
    fn prefix_ranges_use_the_triangular_sum() {
        let mut lo = Lowerer::new(Backend::Interp);
        let n = dim("n", Atom::int_range(0, 4));
        let m = dim("m", prefix_of(&n));
        // 0 + 1 + 2 + 3 ordinals below each n.
        assert_eq!(elem_count(&mut lo, &[n.clone(), m.clone()]).unwrap(), IExpr::int(6));
        // Rows of lengths 0, 1, 2 sit below ordinal 3.
        let off = index_offset(&mut lo, &n, &[m], IExpr::int(3)).unwrap();
        assert_eq!(off, IExpr::int(3));
    }
}
