//! A direct interpreter for Imp modules — the `Interp` backend. Buffers
//! are flat vectors of scalars, pointers are buffer handles with offsets,
//! and kernel launches run as sequential loops. After the entry function
//! returns, the module's reconstruction abstraction is evaluated to give
//! back a structured core-level value.

use crate::syntax::*;
use std::collections::HashMap;
use tabula_utils::prelude::*;

/* --------------------------------- Values ---------------------------------- */

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Scalar {
    Int(i64),
    Real(f64),
    Bool(bool),
    Char(char),
}

impl Scalar {
    fn from_lit(l: Literal) -> Scalar {
        match l {
            | Literal::Int(i) => Scalar::Int(i),
            | Literal::Real(r) => Scalar::Real(r),
            | Literal::Bool(b) => Scalar::Bool(b),
            | Literal::Char(c) => Scalar::Char(c),
        }
    }
    fn to_lit(self) -> Literal {
        match self {
            | Scalar::Int(i) => Literal::Int(i),
            | Scalar::Real(r) => Literal::Real(r),
            | Scalar::Bool(b) => Literal::Bool(b),
            | Scalar::Char(c) => Literal::Char(c),
        }
    }
    pub fn as_int(self) -> Result<i64> {
        match self {
            | Scalar::Int(i) => Ok(i),
            | other => Err(Error::compiler(format!("expected an int, got {:?}", other))),
        }
    }
    pub fn as_real(self) -> Result<f64> {
        match self {
            | Scalar::Real(r) => Ok(r),
            | other => Err(Error::compiler(format!("expected a real, got {:?}", other))),
        }
    }
    fn as_bool(self) -> Result<bool> {
        match self {
            | Scalar::Bool(b) => Ok(b),
            | other => Err(Error::compiler(format!("expected a bool, got {:?}", other))),
        }
    }
}

/// A runtime value: a scalar or a pointer into a buffer.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RtVal {
    Scalar(Scalar),
    Ptr { buf: usize, offset: i64 },
}

impl RtVal {
    fn scalar(self) -> Result<Scalar> {
        match self {
            | RtVal::Scalar(s) => Ok(s),
            | RtVal::Ptr { .. } => Err(Error::compiler("expected a scalar, got a pointer")),
        }
    }
}

/// The structured result the reconstruction produces for the driver.
#[derive(Clone, Debug, PartialEq)]
pub enum CoreValue {
    Lit(Literal),
    Unit,
    Pair(Box<CoreValue>, Box<CoreValue>),
    Rec(Vec<CoreValue>),
    Table(Vec<CoreValue>),
    Sum { tag: i64, payload: Vec<CoreValue> },
}

impl CoreValue {
    pub fn as_int(&self) -> Result<i64> {
        match self {
            | CoreValue::Lit(Literal::Int(i)) => Ok(*i),
            | other => Err(Error::compiler(format!("expected an int, got {:?}", other))),
        }
    }
    pub fn as_real(&self) -> Result<f64> {
        match self {
            | CoreValue::Lit(Literal::Real(r)) => Ok(*r),
            | other => Err(Error::compiler(format!("expected a real, got {:?}", other))),
        }
    }
}

/* -------------------------------- Machine ---------------------------------- */

pub struct Interpreter<'m> {
    module: &'m ImpModule,
    buffers: Vec<Vec<Scalar>>,
}

impl<'m> Interpreter<'m> {
    pub fn new(module: &'m ImpModule) -> Self {
        Interpreter { module, buffers: Vec::new() }
    }

    /// Pre-populate the buffers captured as pointer literals, in id order.
    pub fn with_backings(module: &'m ImpModule, backings: &[(PtrLit, Vec<Literal>)]) -> Self {
        let mut interp = Interpreter::new(module);
        for (_, lits) in backings {
            let buf = lits.iter().map(|l| Scalar::from_lit(*l)).collect();
            interp.buffers.push(buf);
        }
        interp
    }

    /// Run the entry function and return its raw results.
    pub fn run_main(&mut self) -> Result<Vec<RtVal>> {
        let main = self.module.main_fn()?.clone();
        let mut env = HashMap::new();
        self.run_block(&mut env, &main.body)
    }

    pub fn buffer(&self, buf: usize) -> Result<&[Scalar]> {
        self.buffers
            .get(buf)
            .map(|b| b.as_slice())
            .ok_or_else(|| Error::compiler("dangling buffer handle"))
    }

    fn eval(&self, env: &HashMap<Name, RtVal>, e: &IExpr) -> Result<RtVal> {
        match e {
            | IExpr::Lit(ILit::Scalar(l)) => Ok(RtVal::Scalar(Scalar::from_lit(*l))),
            | IExpr::Lit(ILit::Ptr(p)) => Ok(RtVal::Ptr { buf: p.id, offset: 0 }),
            | IExpr::Var(v) => env
                .get(&v.name)
                .copied()
                .ok_or_else(|| Error::compiler(format!("unbound imp variable {}", v.name))),
        }
    }

    fn run_block(
        &mut self, env: &mut HashMap<Name, RtVal>, block: &ImpBlock,
    ) -> Result<Vec<RtVal>> {
        for stmt in &block.stmts {
            let out = self.run_instr(env, &stmt.instr)?;
            if let Some(b) = &stmt.binder {
                let v = out.ok_or_else(|| {
                    Error::compiler("statement binder with no instruction result")
                })?;
                env.insert(b.name.clone(), v);
            }
        }
        block.results.iter().map(|r| self.eval(env, r)).collect()
    }

    fn run_instr(
        &mut self, env: &mut HashMap<Name, RtVal>, instr: &ImpInstr,
    ) -> Result<Option<RtVal>> {
        use ImpInstr::*;
        match instr {
            | IPrimOp(op) => {
                let v = self.run_op(env, op)?;
                Ok(Some(v))
            }
            | ICastOp(b, e) => {
                let v = self.eval(env, e)?.scalar()?;
                let out = match (b, v) {
                    | (BaseTy::Real, Scalar::Int(i)) => Scalar::Real(i as f64),
                    | (BaseTy::Int, Scalar::Real(r)) => Scalar::Int(r as i64),
                    | (_, v) => v,
                };
                Ok(Some(RtVal::Scalar(out)))
            }
            | Alloc(_, b, n) => {
                let n = self.eval(env, n)?.scalar()?.as_int()?;
                let fill = match b {
                    | BaseTy::Int => Scalar::Int(0),
                    | BaseTy::Real => Scalar::Real(0.0),
                    | BaseTy::Bool => Scalar::Bool(false),
                    | BaseTy::Char => Scalar::Char('\0'),
                };
                let id = self.buffers.len();
                self.buffers.push(vec![fill; n.max(0) as usize]);
                Ok(Some(RtVal::Ptr { buf: id, offset: 0 }))
            }
            | Free(_) => Ok(None),
            | MemCopy { dest, src, numel } => {
                let RtVal::Ptr { buf: db, offset: doff } = self.eval(env, dest)? else {
                    return Err(Error::compiler("memcopy to a non-pointer"));
                };
                let RtVal::Ptr { buf: sb, offset: soff } = self.eval(env, src)? else {
                    return Err(Error::compiler("memcopy from a non-pointer"));
                };
                let n = self.eval(env, numel)?.scalar()?.as_int()? as usize;
                for k in 0..n {
                    let v = self.read(sb, soff + k as i64)?;
                    self.write(db, doff + k as i64, v)?;
                }
                Ok(None)
            }
            | Store { dest, value } => {
                let RtVal::Ptr { buf, offset } = self.eval(env, dest)? else {
                    return Err(Error::compiler("store to a non-pointer"));
                };
                let v = self.eval(env, value)?.scalar()?;
                self.write(buf, offset, v)?;
                Ok(None)
            }
            | Load(ptr) => {
                let RtVal::Ptr { buf, offset } = self.eval(env, ptr)? else {
                    return Err(Error::compiler("load from a non-pointer"));
                };
                Ok(Some(RtVal::Scalar(self.read(buf, offset)?)))
            }
            | IThrowError => Err(Error::new(ErrKind::MiscErr, "runtime error")),
            | IFor { dir, binder, n, body } => {
                let n = self.eval(env, n)?.scalar()?.as_int()?;
                let ords: Vec<i64> = match dir {
                    | Direction::Fwd => (0..n).collect(),
                    | Direction::Rev => (0..n).rev().collect(),
                };
                for i in ords {
                    env.insert(binder.name.clone(), RtVal::Scalar(Scalar::Int(i)));
                    self.run_block(env, body)?;
                }
                Ok(None)
            }
            | IWhile { cond, body } => {
                loop {
                    let c = self.run_block(env, cond)?;
                    let go = c
                        .first()
                        .ok_or_else(|| Error::compiler("while condition has no result"))?
                        .scalar()?
                        .as_bool()?;
                    if !go {
                        break;
                    }
                    self.run_block(env, body)?;
                }
                Ok(None)
            }
            | ICond { pred, then_case, else_case } => {
                let p = self.eval(env, pred)?.scalar()?.as_bool()?;
                if p {
                    self.run_block(env, then_case)?;
                } else {
                    self.run_block(env, else_case)?;
                }
                Ok(None)
            }
            | ILaunch { fun, size, args } => {
                // Kernels execute as a sequential loop over the thread id.
                let f = self.module.get_fn(fun)?.clone();
                let n = self.eval(env, size)?.scalar()?.as_int()?;
                let arg_vals: Vec<RtVal> =
                    args.iter().map(|a| self.eval(env, a)).collect::<Result<_>>()?;
                for tid in 0..n {
                    let mut kenv = HashMap::new();
                    let mut formals = f.args.iter();
                    let tid_var = formals
                        .next()
                        .ok_or_else(|| Error::compiler("kernel without thread index"))?;
                    kenv.insert(tid_var.name.clone(), RtVal::Scalar(Scalar::Int(tid)));
                    for (formal, actual) in formals.zip(&arg_vals) {
                        kenv.insert(formal.name.clone(), *actual);
                    }
                    self.run_block(&mut kenv, &f.body)?;
                }
                Ok(None)
            }
        }
    }

    fn run_op(&mut self, env: &HashMap<Name, RtVal>, op: &PrimOp<IExpr>) -> Result<RtVal> {
        use PrimOp::*;
        match op {
            | ScalarBinOp(b, x, y) => {
                let x = self.eval(env, x)?.scalar()?;
                let y = self.eval(env, y)?.scalar()?;
                Ok(RtVal::Scalar(bin_op(*b, x, y)?))
            }
            | ScalarUnOp(u, x) => {
                let x = self.eval(env, x)?.scalar()?;
                let v = match u {
                    | UnOp::FNeg => Scalar::Real(-x.as_real()?),
                    | UnOp::INeg => Scalar::Int(-x.as_int()?),
                    | UnOp::Not => Scalar::Bool(!x.as_bool()?),
                    | UnOp::IntToReal => Scalar::Real(x.as_int()? as f64),
                };
                Ok(RtVal::Scalar(v))
            }
            | Select(p, x, y) => {
                let p = self.eval(env, p)?.scalar()?.as_bool()?;
                if p {
                    self.eval(env, x)
                } else {
                    self.eval(env, y)
                }
            }
            | PtrOffset(p, o) => {
                let RtVal::Ptr { buf, offset } = self.eval(env, p)? else {
                    return Err(Error::compiler("offset of a non-pointer"));
                };
                let o = self.eval(env, o)?.scalar()?.as_int()?;
                Ok(RtVal::Ptr { buf, offset: offset + o })
            }
            | PtrLoad(p) => {
                let RtVal::Ptr { buf, offset } = self.eval(env, p)? else {
                    return Err(Error::compiler("load of a non-pointer"));
                };
                Ok(RtVal::Scalar(self.read(buf, offset)?))
            }
            | other => Err(Error::compiler(format!(
                "operation not valid at the Imp level: {:?}",
                other.map(|_| ())
            ))),
        }
    }

    fn read(&self, buf: usize, offset: i64) -> Result<Scalar> {
        self.buffers
            .get(buf)
            .and_then(|b| b.get(offset as usize))
            .copied()
            .ok_or_else(|| Error::compiler("out-of-bounds read"))
    }

    fn write(&mut self, buf: usize, offset: i64, v: Scalar) -> Result<()> {
        let cell = self
            .buffers
            .get_mut(buf)
            .and_then(|b| b.get_mut(offset as usize))
            .ok_or_else(|| Error::compiler("out-of-bounds write"))?;
        *cell = v;
        Ok(())
    }
}

fn bin_op(b: BinOp, x: Scalar, y: Scalar) -> Result<Scalar> {
    use BinOp::*;
    Ok(match b {
        | IAdd => Scalar::Int(x.as_int()? + y.as_int()?),
        | ISub => Scalar::Int(x.as_int()? - y.as_int()?),
        | IMul => Scalar::Int(x.as_int()? * y.as_int()?),
        | IDiv => {
            let d = y.as_int()?;
            if d == 0 {
                return Err(Error::new(ErrKind::MiscErr, "integer division by zero"));
            }
            Scalar::Int(x.as_int()? / d)
        }
        | IRem => Scalar::Int(x.as_int()? % y.as_int()?),
        | And => Scalar::Bool(x.as_bool()? && y.as_bool()?),
        | Or => Scalar::Bool(x.as_bool()? || y.as_bool()?),
        | ICmp(c) => Scalar::Bool(cmp(c, x.as_int()?, y.as_int()?)),
        | FAdd => Scalar::Real(x.as_real()? + y.as_real()?),
        | FSub => Scalar::Real(x.as_real()? - y.as_real()?),
        | FMul => Scalar::Real(x.as_real()? * y.as_real()?),
        | FDiv => Scalar::Real(x.as_real()? / y.as_real()?),
        | FCmp(c) => Scalar::Bool(fcmp(c, x.as_real()?, y.as_real()?)),
    })
}

fn cmp<T: PartialOrd>(c: CmpOp, x: T, y: T) -> bool {
    match c {
        | CmpOp::Equal => x == y,
        | CmpOp::Less => x < y,
        | CmpOp::LessEqual => x <= y,
        | CmpOp::Greater => x > y,
        | CmpOp::GreaterEqual => x >= y,
    }
}

fn fcmp(c: CmpOp, x: f64, y: f64) -> bool {
    cmp(c, x, y)
}

/* ----------------------------- Reconstruction ------------------------------ */

/// Evaluate the reconstruction abstraction against the entry function's
/// results, decoding memory-backed tables through their types.
pub fn reconstruct(
    interp: &Interpreter, recon: &AtomRecon, results: &[RtVal],
) -> Result<CoreValue> {
    if recon.binders.len() != results.len() {
        return Err(Error::compiler("reconstruction arity mismatch"));
    }
    let mut env: HashMap<Name, ReconVal> = HashMap::new();
    for (b, r) in recon.binders.iter().zip(results) {
        env.insert(b.name.clone(), ReconVal::Rt(*r));
    }
    let v = eval_recon_atom(interp, &env, &recon.atom)?;
    finish(interp, v)
}

#[derive(Clone, Debug)]
enum ReconVal {
    Rt(RtVal),
    Done(CoreValue),
    /// A memory-backed table awaiting its indices.
    Closure { ptr: RtVal, dims: Vec<i64> },
    Lam { binder: Name, ix_size: i64, body: Block, env: HashMap<Name, ReconVal> },
}

fn finish(interp: &Interpreter, v: ReconVal) -> Result<CoreValue> {
    match v {
        | ReconVal::Done(v) => Ok(v),
        | ReconVal::Rt(RtVal::Scalar(s)) => Ok(CoreValue::Lit(s.to_lit())),
        | ReconVal::Rt(RtVal::Ptr { .. }) => {
            Err(Error::compiler("raw pointer left in reconstruction"))
        }
        | ReconVal::Closure { ptr, dims } => decode_table(interp, ptr, &dims),
        | ReconVal::Lam { binder, ix_size, body, env } => {
            let mut items = Vec::with_capacity(ix_size.max(0) as usize);
            for ord in 0..ix_size {
                let mut env = env.clone();
                env.insert(
                    binder.clone(),
                    ReconVal::Done(CoreValue::Lit(Literal::Int(ord))),
                );
                let v = eval_recon_block(interp, &env, &body)?;
                items.push(finish(interp, v)?);
            }
            Ok(CoreValue::Table(items))
        }
    }
}

fn decode_table(interp: &Interpreter, ptr: RtVal, dims: &[i64]) -> Result<CoreValue> {
    let RtVal::Ptr { buf, offset } = ptr else {
        return Err(Error::compiler("table backed by a non-pointer"));
    };
    fn go(
        interp: &Interpreter, buf: usize, offset: i64, dims: &[i64],
    ) -> Result<CoreValue> {
        match dims.split_first() {
            | None => Ok(CoreValue::Lit(interp.read_pub(buf, offset)?.to_lit())),
            | Some((n, rest)) => {
                let stride: i64 = rest.iter().product();
                let mut items = Vec::with_capacity((*n).max(0) as usize);
                for i in 0..*n {
                    items.push(go(interp, buf, offset + i * stride, rest)?);
                }
                Ok(CoreValue::Table(items))
            }
        }
    }
    go(interp, buf, offset, dims)
}

impl<'m> Interpreter<'m> {
    fn read_pub(&self, buf: usize, offset: i64) -> Result<Scalar> {
        self.read(buf, offset)
    }
}

/// Sizes of a nested table type with closed bounds.
fn static_dims(ty: &RcTy) -> Result<Vec<i64>> {
    match ty.as_ref() {
        | Atom::Pi(pi) if matches!(pi.arr, ArrowKind::Tab) => {
            let n = static_ix_size(&pi.binder.ty)?;
            let mut dims = vec![n];
            dims.extend(static_dims(&pi.body)?);
            Ok(dims)
        }
        | _ => Ok(Vec::new()),
    }
}

fn static_ix_size(ty: &RcTy) -> Result<i64> {
    match ty.as_ref() {
        | Atom::TC(PrimTC::IntRange(l, h)) => {
            let l = lit_int(l)?;
            let h = lit_int(h)?;
            Ok((h - l).max(0))
        }
        | Atom::TC(PrimTC::Base(BaseTy::Bool)) => Ok(2),
        | other => Err(Error::compiler(format!(
            "index set size is not static: {:?}",
            other
        ))),
    }
}

fn lit_int(a: &RcAtom) -> Result<i64> {
    match a.as_ref() {
        | Atom::Con(PrimCon::Lit(Literal::Int(i))) => Ok(*i),
        | _ => Err(Error::compiler("expected a literal bound")),
    }
}

fn eval_recon_atom(
    interp: &Interpreter, env: &HashMap<Name, ReconVal>, atom: &RcAtom,
) -> Result<ReconVal> {
    match atom.as_ref() {
        | Atom::Var(v) => match env.get(&v.name) {
            | Some(ReconVal::Rt(RtVal::Ptr { buf, offset })) => {
                // A column binder: decode through its table type.
                let dims = static_dims(&v.ty)?;
                Ok(ReconVal::Closure { ptr: RtVal::Ptr { buf: *buf, offset: *offset }, dims })
            }
            | Some(other) => Ok(other.clone()),
            | None => Err(Error::compiler(format!("unbound recon variable {}", v.name))),
        },
        | Atom::Con(PrimCon::Lit(l)) => Ok(ReconVal::Done(CoreValue::Lit(*l))),
        | Atom::Con(PrimCon::UnitCon) => Ok(ReconVal::Done(CoreValue::Unit)),
        | Atom::Con(PrimCon::PairCon(a, b)) => {
            let a = eval_recon_atom(interp, env, a)?;
            let b = eval_recon_atom(interp, env, b)?;
            Ok(ReconVal::Done(CoreValue::Pair(
                Box::new(finish(interp, a)?),
                Box::new(finish(interp, b)?),
            )))
        }
        | Atom::Con(PrimCon::RecCon(r)) => {
            let mut items = Vec::new();
            for (_, a) in r.iter() {
                let v = eval_recon_atom(interp, env, a)?;
                items.push(finish(interp, v)?);
            }
            Ok(ReconVal::Done(CoreValue::Rec(items)))
        }
        | Atom::Con(PrimCon::IntRangeVal(_, _, i))
        | Atom::Con(PrimCon::IndexRangeVal(_, _, _, i))
        | Atom::Con(PrimCon::CharCon(i)) => eval_recon_atom(interp, env, i),
        | Atom::Con(PrimCon::SumAsProd(_, tag, payload)) => {
            let tag = match finish(interp, eval_recon_atom(interp, env, tag)?)? {
                | CoreValue::Lit(Literal::Int(i)) => i,
                | CoreValue::Lit(Literal::Bool(b)) => b as i64,
                | other => {
                    return Err(Error::compiler(format!("bad sum tag {:?}", other)))
                }
            };
            let row = payload
                .get(tag as usize)
                .ok_or_else(|| Error::compiler("sum tag out of range"))?;
            let mut items = Vec::new();
            for a in row {
                let v = eval_recon_atom(interp, env, a)?;
                items.push(finish(interp, v)?);
            }
            Ok(ReconVal::Done(CoreValue::Sum { tag, payload: items }))
        }
        | Atom::Lam(Lam { arr: ArrowKind::Tab, binder, body }) => {
            Ok(ReconVal::Lam {
                binder: binder.name.clone(),
                ix_size: static_ix_size(&binder.ty)?,
                body: body.clone(),
                env: env.clone(),
            })
        }
        | other => Err(Error::compiler(format!(
            "reconstruction cannot evaluate {:?}",
            other
        ))),
    }
}

fn eval_recon_block(
    interp: &Interpreter, env: &HashMap<Name, ReconVal>, block: &Block,
) -> Result<ReconVal> {
    let mut env = env.clone();
    for decl in &block.decls {
        let Decl::Let(_, b, e) = decl else {
            return Err(Error::compiler("reconstruction blocks only bind lets"));
        };
        let v = eval_recon_expr(interp, &env, e)?;
        env.insert(b.name.clone(), v);
    }
    match &block.result {
        | Expr::Atom(a) => eval_recon_atom(interp, &env, a),
        | e => eval_recon_expr(interp, &env, e),
    }
}

fn eval_recon_expr(
    interp: &Interpreter, env: &HashMap<Name, ReconVal>, e: &Expr,
) -> Result<ReconVal> {
    match e {
        | Expr::Atom(a) => eval_recon_atom(interp, env, a),
        | Expr::App(ArrowKind::Tab, f, i) => {
            let f = eval_recon_atom(interp, env, f)?;
            let ord = match finish(interp, eval_recon_atom(interp, env, i)?)? {
                | CoreValue::Lit(Literal::Int(o)) => o,
                | other => {
                    return Err(Error::compiler(format!("bad recon index {:?}", other)))
                }
            };
            match f {
                | ReconVal::Closure { ptr, dims } => {
                    let Some((_, rest)) = dims.split_first() else {
                        return Err(Error::compiler("indexing a scalar column"));
                    };
                    let stride: i64 = rest.iter().product();
                    let RtVal::Ptr { buf, offset } = ptr else {
                        return Err(Error::compiler("table backed by a non-pointer"));
                    };
                    let at = RtVal::Ptr { buf, offset: offset + ord * stride };
                    if rest.is_empty() {
                        let RtVal::Ptr { buf, offset } = at else { unreachable!() };
                        Ok(ReconVal::Done(CoreValue::Lit(
                            interp.read_pub(buf, offset)?.to_lit(),
                        )))
                    } else {
                        Ok(ReconVal::Closure { ptr: at, dims: rest.to_vec() })
                    }
                }
                | ReconVal::Lam { binder, body, env: lam_env, .. } => {
                    let mut env = lam_env;
                    env.insert(binder, ReconVal::Done(CoreValue::Lit(Literal::Int(ord))));
                    eval_recon_block(interp, &env, &body)
                }
                | other => Err(Error::compiler(format!(
                    "recon application of {:?}",
                    other
                ))),
            }
        }
        | other => Err(Error::compiler(format!(
            "reconstruction cannot evaluate expression {:?}",
            other
        ))),
    }
}

/// Lower, run and reconstruct in one step — the Interp backend's surface.
pub fn evaluate_block(block: &Block) -> Result<CoreValue> {
    let (module, recon, backings) =
        crate::lower::to_imp_module_with_backings(Backend::Interp, block)?;
    let mut interp = Interpreter::with_backings(&module, &backings);
    let results = interp.run_main()?;
    reconstruct(&interp, &recon, &results)
}
