pub use tabula_core::syntax::*;

use tabula_utils::prelude::*;

/* -------------------------------- Backends -------------------------------- */

/// Code generation targets. Only the tags matter to lowering: they decide
/// the device and whether parallel loops become kernel launches.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum Backend {
    Llvm,
    LlvmMc,
    LlvmCuda,
    Interp,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Device {
    Cpu,
    Gpu,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum MemSpace {
    Stack,
    Heap,
}

/// Where an allocation lives: which device, and stack or heap on it.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct AddrSpace {
    pub dev: Device,
    pub space: MemSpace,
}

impl Backend {
    pub fn main_device(self) -> Device {
        Device::Cpu
    }
    /// The kernel calling convention, if this backend launches kernels.
    pub fn kernel_cc(self) -> Option<(CallingConv, Device)> {
        match self {
            | Backend::LlvmMc => Some((CallingConv::MCThreadLaunch, Device::Cpu)),
            | Backend::LlvmCuda => Some((CallingConv::CUDAKernelLaunch, Device::Gpu)),
            | Backend::Llvm | Backend::Interp => None,
        }
    }
}

/* -------------------------------- Literals --------------------------------- */

/// A pointer literal: a handle to a buffer captured during lowering,
/// resolved by the code generator or the interpreter.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PtrLit {
    pub id: usize,
    pub elem: BaseTy,
}

/// Imp-level literal values: the scalar literals of the core plus pointers.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ILit {
    Scalar(Literal),
    Ptr(PtrLit),
}

/* ---------------------------------- Types ---------------------------------- */

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PtrType {
    pub addr: AddrSpace,
    pub elem: BaseTy,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IType {
    Scalar(BaseTy),
    Ptr(PtrType),
}

/* ------------------------------- Expressions ------------------------------- */

#[derive(Clone, Debug, PartialEq)]
pub struct IVar {
    pub name: Name,
    pub ty: IType,
}

/// Imp expressions are atomic: a literal or a variable.
#[derive(Clone, Debug, PartialEq)]
pub enum IExpr {
    Lit(ILit),
    Var(IVar),
}

impl IExpr {
    pub fn ty(&self) -> IType {
        match self {
            | IExpr::Lit(ILit::Scalar(l)) => IType::Scalar(l.base_ty()),
            | IExpr::Lit(ILit::Ptr(p)) => IType::Ptr(PtrType {
                addr: AddrSpace { dev: Device::Cpu, space: MemSpace::Heap },
                elem: p.elem,
            }),
            | IExpr::Var(v) => v.ty,
        }
    }
    pub fn int(i: i64) -> IExpr {
        IExpr::Lit(ILit::Scalar(Literal::Int(i)))
    }
    pub fn as_lit_int(&self) -> Option<i64> {
        match self {
            | IExpr::Lit(ILit::Scalar(Literal::Int(i))) => Some(*i),
            | _ => None,
        }
    }
}

/* ------------------------------ Instructions ------------------------------- */

#[derive(Clone, Debug, PartialEq)]
pub enum ImpInstr {
    IPrimOp(PrimOp<IExpr>),
    ICastOp(BaseTy, IExpr),
    Alloc(AddrSpace, BaseTy, IExpr),
    Free(IExpr),
    MemCopy { dest: IExpr, src: IExpr, numel: IExpr },
    Store { dest: IExpr, value: IExpr },
    Load(IExpr),
    IThrowError,
    IFor { dir: Direction, binder: IVar, n: IExpr, body: ImpBlock },
    IWhile { cond: ImpBlock, body: ImpBlock },
    ICond { pred: IExpr, then_case: ImpBlock, else_case: ImpBlock },
    ILaunch { fun: Name, size: IExpr, args: Vec<IExpr> },
}

/// A statement binds the instruction's result, when it has one.
#[derive(Clone, Debug, PartialEq)]
pub struct ImpStmt {
    pub binder: Option<IVar>,
    pub instr: ImpInstr,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct ImpBlock {
    pub stmts: Vec<ImpStmt>,
    pub results: Vec<IExpr>,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum CallingConv {
    OrdinaryFun,
    EntryFun,
    MCThreadLaunch,
    CUDAKernelLaunch,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImpFunction {
    pub name: Name,
    pub cc: CallingConv,
    pub args: Vec<IVar>,
    pub body: ImpBlock,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImpModule {
    pub functions: Vec<ImpFunction>,
    pub main: Name,
}

impl ImpModule {
    pub fn main_fn(&self) -> Result<&ImpFunction> {
        self.functions
            .iter()
            .find(|f| f.name == self.main)
            .ok_or_else(|| Error::compiler("module has no main function"))
    }
    pub fn get_fn(&self, name: &Name) -> Result<&ImpFunction> {
        self.functions
            .iter()
            .find(|f| &f.name == name)
            .ok_or_else(|| Error::compiler(format!("unknown imp function {}", name)))
    }
}

/// The designated entry point name of every lowered module.
pub fn imp_main_name() -> Name {
    Name::new(NameTag::TopFun, "impMain", 0)
}

/* ------------------------------- Result types ------------------------------ */

/// The result type of an instruction, `None` for statements executed only
/// for effect. Pointer offsets stay in the pointee's space.
pub fn instr_result_ty(instr: &ImpInstr) -> Result<Option<IType>> {
    use ImpInstr::*;
    Ok(match instr {
        | IPrimOp(op) => Some(prim_op_ty(op)?),
        | ICastOp(b, _) => Some(IType::Scalar(*b)),
        | Alloc(addr, b, _) => Some(IType::Ptr(PtrType { addr: *addr, elem: *b })),
        | Load(ptr) => match ptr.ty() {
            | IType::Ptr(p) => Some(IType::Scalar(p.elem)),
            | IType::Scalar(_) => return Err(Error::compiler("load from a non-pointer")),
        },
        | Free(_) | MemCopy { .. } | Store { .. } | IThrowError => None,
        | IFor { .. } | IWhile { .. } | ICond { .. } | ILaunch { .. } => None,
    })
}

fn prim_op_ty(op: &PrimOp<IExpr>) -> Result<IType> {
    use PrimOp::*;
    match op {
        | ScalarBinOp(b, _, _) => Ok(IType::Scalar(tabula_core::ty::bin_op_types(*b).1)),
        | ScalarUnOp(u, _) => Ok(IType::Scalar(tabula_core::ty::un_op_types(*u).1)),
        | Select(_, x, _) => Ok(x.ty()),
        | PtrOffset(p, _) => match p.ty() {
            | IType::Ptr(_) => Ok(p.ty()),
            | _ => Err(Error::compiler("pointer offset of a non-pointer")),
        },
        | PtrLoad(p) => match p.ty() {
            | IType::Ptr(pt) => Ok(IType::Scalar(pt.elem)),
            | _ => Err(Error::compiler("pointer load of a non-pointer")),
        },
        | other => Err(Error::compiler(format!(
            "operation not valid at the Imp level: {:?}",
            other.map(|_| ())
        ))),
    }
}

/* -------------------------------- Free vars -------------------------------- */

/// The free Imp variables of a block: everything read before being bound.
/// Kernel bodies must close over exactly these.
pub fn free_ivars(block: &ImpBlock) -> Vec<IVar> {
    let mut bound = im::HashSet::new();
    let mut free: Vec<IVar> = Vec::new();
    collect_block(block, &mut bound, &mut free);
    free
}

fn note(e: &IExpr, bound: &im::HashSet<Name>, free: &mut Vec<IVar>) {
    if let IExpr::Var(v) = e {
        if !bound.contains(&v.name) && !free.iter().any(|f| f.name == v.name) {
            free.push(v.clone());
        }
    }
}

fn collect_block(block: &ImpBlock, bound: &mut im::HashSet<Name>, free: &mut Vec<IVar>) {
    for stmt in &block.stmts {
        collect_instr(&stmt.instr, bound, free);
        if let Some(b) = &stmt.binder {
            bound.insert(b.name.clone());
        }
    }
    for r in &block.results {
        note(r, bound, free);
    }
}

fn collect_instr(instr: &ImpInstr, bound: &mut im::HashSet<Name>, free: &mut Vec<IVar>) {
    use ImpInstr::*;
    match instr {
        | IPrimOp(op) => {
            let _ = op.map(|e| note(e, bound, free));
        }
        | ICastOp(_, e) | Free(e) | Load(e) => note(e, bound, free),
        | Alloc(_, _, n) => note(n, bound, free),
        | MemCopy { dest, src, numel } => {
            note(dest, bound, free);
            note(src, bound, free);
            note(numel, bound, free);
        }
        | Store { dest, value } => {
            note(dest, bound, free);
            note(value, bound, free);
        }
        | IThrowError => {}
        | IFor { binder, n, body, .. } => {
            note(n, bound, free);
            let mut inner = bound.clone();
            inner.insert(binder.name.clone());
            collect_block(body, &mut inner, free);
        }
        | IWhile { cond, body } => {
            collect_block(cond, &mut bound.clone(), free);
            collect_block(body, &mut bound.clone(), free);
        }
        | ICond { pred, then_case, else_case } => {
            note(pred, bound, free);
            collect_block(then_case, &mut bound.clone(), free);
            collect_block(else_case, &mut bound.clone(), free);
        }
        | ILaunch { size, args, .. } => {
            note(size, bound, free);
            for a in args {
                note(a, bound, free);
            }
        }
    }
}
