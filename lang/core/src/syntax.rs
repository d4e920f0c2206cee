pub use tabula_syntax::*;

use derive_more::From;
use std::collections::BTreeMap;
use std::rc::Rc;

pub type RcAtom = Rc<Atom>;
/// Types are atoms of kind `TyKind`; passes check the kind dynamically at
/// their boundaries rather than in the type system.
pub type Ty = Atom;
pub type RcTy = Rc<Atom>;

/* --------------------------------- Binder --------------------------------- */

/// A variable occurrence: a name together with its annotation (a type).
/// The same shape introduces a scope when used binding-side.
#[derive(Clone, Debug, PartialEq)]
pub struct Var {
    pub name: Name,
    pub ty: RcTy,
}

impl Var {
    pub fn new(name: Name, ty: RcTy) -> Self {
        Var { name, ty }
    }
    pub fn to_atom(&self) -> RcAtom {
        Rc::new(Atom::Var(self.clone()))
    }
}

/* --------------------------------- Arrows --------------------------------- */

/// The kind of a function arrow. `Plain` carries the effect row its
/// application may perform; `Tab` is table indexing; `Lin` is linear.
#[derive(Clone, Debug, PartialEq)]
pub enum ArrowKind {
    Plain(EffectRow),
    Implicit,
    Tab,
    Lin,
}

impl ArrowKind {
    pub fn pure() -> Self {
        ArrowKind::Plain(EffectRow::pure())
    }
    /// The effect row an application through this arrow performs.
    pub fn eff(&self) -> EffectRow {
        match self {
            | ArrowKind::Plain(eff) => eff.clone(),
            | ArrowKind::Implicit | ArrowKind::Tab | ArrowKind::Lin => EffectRow::pure(),
        }
    }
}

/* --------------------------------- Effects -------------------------------- */

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum EffectName {
    Reader,
    Writer,
    State,
}

/// An effect row maps region names to the effect performed there and the
/// type of the value carried. The optional tail is a row-polymorphism
/// variable; equality is structural and no unification is performed.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct EffectRow {
    pub row: BTreeMap<Name, (EffectName, RcTy)>,
    pub tail: Option<Name>,
}

impl EffectRow {
    pub fn pure() -> Self {
        EffectRow::default()
    }
    pub fn is_pure(&self) -> bool {
        self.row.is_empty() && self.tail.is_none()
    }
    pub fn single(region: Name, eff: EffectName, ty: RcTy) -> Self {
        EffectRow { row: BTreeMap::from([(region, (eff, ty))]), tail: None }
    }
    /// Least upper bound of two rows. Conflicting entries for one region
    /// cannot arise in elaborated input, so the left entry wins.
    pub fn union(&self, other: &EffectRow) -> EffectRow {
        let mut row = self.row.clone();
        for (k, v) in &other.row {
            row.entry(k.clone()).or_insert_with(|| v.clone());
        }
        EffectRow { row, tail: self.tail.clone().or_else(|| other.tail.clone()) }
    }
    /// Remove a region, e.g. when leaving its `run*` scope.
    pub fn removing(&self, region: &Name) -> EffectRow {
        let mut row = self.row.clone();
        row.remove(region);
        EffectRow { row, tail: self.tail.clone() }
    }
}

/* ---------------------------------- Atoms ---------------------------------- */

/// A lambda with its arrow kind; the body is a block evaluated under the
/// arrow's effect row.
#[derive(Clone, Debug, PartialEq)]
pub struct Lam {
    pub arr: ArrowKind,
    pub binder: Var,
    pub body: Block,
}

/// A dependent function type `(b : T) -> eff U`; the effect row lives on
/// the arrow. Equality of Pi types is alpha-equivalence (see `eq`).
#[derive(Clone, Debug, PartialEq)]
pub struct PiTy {
    pub arr: ArrowKind,
    pub binder: Var,
    pub body: RcTy,
}

impl PiTy {
    /// The `(effect row, result type)` pair exposed at application sites.
    pub fn effective_ty(&self) -> (EffectRow, RcTy) {
        (self.arr.eff(), self.body.clone())
    }
}

/// Values in normal-ish form.
#[derive(From, Clone, Debug, PartialEq)]
pub enum Atom {
    Var(Var),
    Lam(Lam),
    Pi(PiTy),
    Con(PrimCon<RcAtom>),
    TC(PrimTC<RcAtom>),
    Eff(EffectRow),
}

impl Atom {
    pub fn rc(self) -> RcAtom {
        Rc::new(self)
    }
    pub fn lit(l: impl Into<Literal>) -> RcAtom {
        Atom::Con(PrimCon::Lit(l.into())).rc()
    }
    pub fn unit() -> RcAtom {
        Atom::Con(PrimCon::UnitCon).rc()
    }
    pub fn unit_ty() -> RcTy {
        Atom::TC(PrimTC::UnitTy).rc()
    }
    pub fn base(b: BaseTy) -> RcTy {
        Atom::TC(PrimTC::Base(b)).rc()
    }
    pub fn int_ty() -> RcTy {
        Atom::base(BaseTy::Int)
    }
    pub fn real_ty() -> RcTy {
        Atom::base(BaseTy::Real)
    }
    pub fn bool_ty() -> RcTy {
        Atom::base(BaseTy::Bool)
    }
    pub fn ty_kind() -> RcTy {
        Atom::TC(PrimTC::TyKind).rc()
    }
    pub fn pair(a: RcAtom, b: RcAtom) -> RcAtom {
        Atom::Con(PrimCon::PairCon(a, b)).rc()
    }
    pub fn pair_ty(a: RcTy, b: RcTy) -> RcTy {
        Atom::TC(PrimTC::PairTy(a, b)).rc()
    }
    /// A table type `n => a` is a Pi with a `Tab` arrow whose binder is
    /// usually unused in the body.
    pub fn tab_ty(ix: RcTy, body: RcTy) -> RcTy {
        let binder = Var::new(Name::gen("i"), ix);
        Atom::Pi(PiTy { arr: ArrowKind::Tab, binder, body }).rc()
    }
    /// A closed integer index set `range(low, high)`.
    pub fn int_range(low: i64, high: i64) -> RcTy {
        Atom::TC(PrimTC::IntRange(Atom::lit(low), Atom::lit(high))).rc()
    }
    pub fn ref_ty(region: RcAtom, val: RcTy) -> RcTy {
        Atom::TC(PrimTC::Ref(region, val)).rc()
    }
}

/* ---------------------------- Primitive families --------------------------- */

/// One end of an index range, possibly unbounded.
#[derive(Clone, Debug, PartialEq)]
pub enum Limit<T> {
    Inclusive(T),
    Exclusive(T),
    Unlimited,
}

impl<T> Limit<T> {
    pub fn map<B>(&self, mut f: impl FnMut(&T) -> B) -> Limit<B> {
        match self {
            | Limit::Inclusive(x) => Limit::Inclusive(f(x)),
            | Limit::Exclusive(x) => Limit::Exclusive(f(x)),
            | Limit::Unlimited => Limit::Unlimited,
        }
    }
    pub fn try_map<B, E>(
        &self, mut f: impl FnMut(&T) -> std::result::Result<B, E>,
    ) -> std::result::Result<Limit<B>, E> {
        Ok(match self {
            | Limit::Inclusive(x) => Limit::Inclusive(f(x)?),
            | Limit::Exclusive(x) => Limit::Exclusive(f(x)?),
            | Limit::Unlimited => Limit::Unlimited,
        })
    }
}

/// A user algebraic data type definition. Definitions are closed at top
/// level; constructor binder types may mention the parameter binders.
#[derive(Clone, Debug, PartialEq)]
pub struct DataDef {
    pub name: Name,
    pub params: Vec<Var>,
    pub cons: Vec<DataConDef>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataConDef {
    pub name: Name,
    pub binders: Vec<Var>,
}

/// Primitive value constructors, generic over the payload so the same
/// family serves core atoms and Imp scalars.
#[derive(Clone, Debug, PartialEq)]
pub enum PrimCon<T> {
    Lit(Literal),
    PairCon(T, T),
    UnitCon,
    RecCon(Record<T>),
    DataCon(Rc<DataDef>, Vec<T>, usize, Vec<T>),
    /// An arbitrary inhabitant of the type, fabricated structurally by the
    /// simplifier.
    AnyValue(T),
    /// `(low, high, i)` — a value of `IntRange low high`.
    IntRangeVal(T, T, T),
    /// `(ty, low, high, i)` — a value of `IndexRange ty low high`.
    IndexRangeVal(T, Limit<T>, Limit<T>, T),
    /// Binary sum value: `(tag, left, right)` with a boolean tag; only the
    /// side selected by the tag is meaningful.
    SumCon(T, T, T),
    /// N-ary sum in product form: `(ty, tag, payloads)`; the lowering form
    /// of data constructors and variants.
    SumAsProd(T, T, Vec<Vec<T>>),
    /// A stored table constant: every index of the set maps to `body`.
    AFor(T, T),
    /// A character wrapping its integer representation.
    CharCon(T),
    /// A literal array backing a table: the table type plus the raw
    /// values in row-major order.
    ArrayLit(T, Vec<Literal>),
}

/// Primitive type constructors.
#[derive(Clone, Debug, PartialEq)]
pub enum PrimTC<T> {
    Base(BaseTy),
    IntRange(T, T),
    IndexRange(T, Limit<T>, Limit<T>),
    Array(usize, BaseTy),
    RecordTy(Record<T>),
    SumTy(T, T),
    Ref(T, T),
    TyKind,
    EffectKind,
    PairTy(T, T),
    UnitTy,
    CharTy,
    /// A fully applied user type constructor.
    TypeCon(Rc<DataDef>, Vec<T>),
}

/* ----------------------------------- Ops ----------------------------------- */

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum CmpOp {
    Equal,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum BinOp {
    IAdd,
    ISub,
    IMul,
    IDiv,
    IRem,
    And,
    Or,
    ICmp(CmpOp),
    FAdd,
    FSub,
    FMul,
    FDiv,
    FCmp(CmpOp),
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum UnOp {
    FNeg,
    INeg,
    Not,
    IntToReal,
}

/// Operations on mutable references, each tied to the region the ref
/// names: `Ask` under Reader, `Tell` under Writer, `Get`/`Put` under State.
#[derive(Clone, Debug, PartialEq)]
pub enum EffectOp<T> {
    Ask,
    Tell(T),
    Get,
    Put(T),
}

impl<T> EffectOp<T> {
    pub fn map<B>(&self, mut f: impl FnMut(&T) -> B) -> EffectOp<B> {
        match self {
            | EffectOp::Ask => EffectOp::Ask,
            | EffectOp::Tell(x) => EffectOp::Tell(f(x)),
            | EffectOp::Get => EffectOp::Get,
            | EffectOp::Put(x) => EffectOp::Put(f(x)),
        }
    }
}

/// Primitive operations, generic over the payload. `PtrOffset`/`PtrLoad`
/// only occur inside Imp instructions.
#[derive(Clone, Debug, PartialEq)]
pub enum PrimOp<T> {
    ScalarBinOp(BinOp, T, T),
    ScalarUnOp(UnOp, T),
    /// Type-directed comparison, specialized by the simplifier.
    Cmp(CmpOp, T, T, T),
    Select(T, T, T),
    RecGet(T, Field),
    SumGet(T, bool),
    SumTag(T),
    Fst(T),
    Snd(T),
    IndexAsInt(T),
    IntAsIndex(T, T),
    IdxSetSize(T),
    PrimEffect(T, EffectOp<T>),
    IndexRef(T, T),
    PtrOffset(T, T),
    PtrLoad(T),
}

/// Higher-order primitives. The lambda payloads follow fixed shapes:
/// `RunReader`/`RunWriter`/`RunState` take `\region. \ref. body`.
#[derive(Clone, Debug, PartialEq)]
pub enum PrimHof<T> {
    For(Direction, T),
    While(T, T),
    RunReader(T, T),
    RunWriter(T),
    RunState(T, T),
    Linearize(T),
    Transpose(T),
}

/* ------------------------------- Expressions ------------------------------- */

/// Non-normalized computation nodes; the right-hand sides of declarations.
#[derive(From, Clone, Debug, PartialEq)]
pub enum Expr {
    #[from(ignore)]
    App(ArrowKind, RcAtom, RcAtom),
    Atom(RcAtom),
    Op(PrimOp<RcAtom>),
    Hof(PrimHof<RcAtom>),
    #[from(ignore)]
    Case(RcAtom, Vec<Alt>, RcTy),
}

/// One branch of a case: payload binders and the branch body.
#[derive(Clone, Debug, PartialEq)]
pub struct Alt {
    pub binders: Vec<Var>,
    pub body: Block,
}

/* ------------------------------- Declarations ------------------------------ */

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum LetAnn {
    Plain,
    /// Marks a binding exported to the derivative-rules environment.
    DerivRule,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Decl {
    Let(LetAnn, Var, Expr),
    /// Destructures algebraic data or records into its binders.
    Unpack(Vec<Var>, Expr),
}

impl Decl {
    pub fn binders(&self) -> Vec<&Var> {
        match self {
            | Decl::Let(_, b, _) => vec![b],
            | Decl::Unpack(bs, _) => bs.iter().collect(),
        }
    }
    pub fn expr(&self) -> &Expr {
        match self {
            | Decl::Let(_, _, e) | Decl::Unpack(_, e) => e,
        }
    }
}

/// An ordered run of declarations ending in a result expression, labeled
/// with the effect row of the whole run.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub decls: Vec<Decl>,
    pub result: Expr,
    pub eff: EffectRow,
}

impl Block {
    pub fn pure_result(atom: RcAtom) -> Block {
        Block { decls: Vec::new(), result: Expr::Atom(atom), eff: EffectRow::pure() }
    }
}

/* --------------------------------- Modules --------------------------------- */

/// A top-level unit: declarations plus the binders it exports into the
/// top environment.
#[derive(Clone, Debug, PartialEq)]
pub struct Module {
    pub decls: Vec<Decl>,
    pub exports: Vec<Var>,
}

/// How to rebuild a high-level atom from low-level values: an abstraction
/// whose binders are filled in positionally.
#[derive(Clone, Debug, PartialEq)]
pub struct AtomRecon {
    pub binders: Vec<Var>,
    pub atom: RcAtom,
}

/* ------------------------------- Family maps ------------------------------- */

impl<T> PrimCon<T> {
    pub fn map<B>(&self, mut f: impl FnMut(&T) -> B) -> PrimCon<B> {
        self.try_map::<B, std::convert::Infallible>(|x| Ok(f(x))).unwrap_or_else(|e| match e {})
    }

    pub fn try_map<B, E>(
        &self, mut f: impl FnMut(&T) -> std::result::Result<B, E>,
    ) -> std::result::Result<PrimCon<B>, E> {
        use PrimCon::*;
        Ok(match self {
            | Lit(l) => Lit(*l),
            | PairCon(a, b) => PairCon(f(a)?, f(b)?),
            | UnitCon => UnitCon,
            | RecCon(r) => RecCon(r.try_map(&mut f)?),
            | DataCon(def, params, i, args) => DataCon(
                def.clone(),
                params.iter().map(&mut f).collect::<std::result::Result<_, E>>()?,
                *i,
                args.iter().map(&mut f).collect::<std::result::Result<_, E>>()?,
            ),
            | AnyValue(t) => AnyValue(f(t)?),
            | IntRangeVal(l, h, i) => IntRangeVal(f(l)?, f(h)?, f(i)?),
            | IndexRangeVal(t, l, h, i) => {
                IndexRangeVal(f(t)?, l.try_map(&mut f)?, h.try_map(&mut f)?, f(i)?)
            }
            | SumCon(tag, l, r) => SumCon(f(tag)?, f(l)?, f(r)?),
            | SumAsProd(ty, tag, payload) => SumAsProd(
                f(ty)?,
                f(tag)?,
                payload
                    .iter()
                    .map(|row| row.iter().map(&mut f).collect())
                    .collect::<std::result::Result<_, E>>()?,
            ),
            | AFor(n, body) => AFor(f(n)?, f(body)?),
            | CharCon(c) => CharCon(f(c)?),
            | ArrayLit(t, lits) => ArrayLit(f(t)?, lits.clone()),
        })
    }
}

impl<T> PrimTC<T> {
    pub fn map<B>(&self, mut f: impl FnMut(&T) -> B) -> PrimTC<B> {
        self.try_map::<B, std::convert::Infallible>(|x| Ok(f(x))).unwrap_or_else(|e| match e {})
    }

    pub fn try_map<B, E>(
        &self, mut f: impl FnMut(&T) -> std::result::Result<B, E>,
    ) -> std::result::Result<PrimTC<B>, E> {
        use PrimTC::*;
        Ok(match self {
            | Base(b) => Base(*b),
            | IntRange(l, h) => IntRange(f(l)?, f(h)?),
            | IndexRange(t, l, h) => IndexRange(f(t)?, l.try_map(&mut f)?, h.try_map(&mut f)?),
            | Array(n, b) => Array(*n, *b),
            | RecordTy(r) => RecordTy(r.try_map(&mut f)?),
            | SumTy(l, r) => SumTy(f(l)?, f(r)?),
            | Ref(r, a) => Ref(f(r)?, f(a)?),
            | TyKind => TyKind,
            | EffectKind => EffectKind,
            | PairTy(a, b) => PairTy(f(a)?, f(b)?),
            | UnitTy => UnitTy,
            | CharTy => CharTy,
            | TypeCon(def, params) => TypeCon(
                def.clone(),
                params.iter().map(&mut f).collect::<std::result::Result<_, E>>()?,
            ),
        })
    }
}

impl<T> PrimOp<T> {
    pub fn map<B>(&self, mut f: impl FnMut(&T) -> B) -> PrimOp<B> {
        self.try_map::<B, std::convert::Infallible>(|x| Ok(f(x))).unwrap_or_else(|e| match e {})
    }

    pub fn try_map<B, E>(
        &self, mut f: impl FnMut(&T) -> std::result::Result<B, E>,
    ) -> std::result::Result<PrimOp<B>, E> {
        use PrimOp::*;
        Ok(match self {
            | ScalarBinOp(op, x, y) => ScalarBinOp(*op, f(x)?, f(y)?),
            | ScalarUnOp(op, x) => ScalarUnOp(*op, f(x)?),
            | Cmp(op, t, x, y) => Cmp(*op, f(t)?, f(x)?, f(y)?),
            | Select(p, x, y) => Select(f(p)?, f(x)?, f(y)?),
            | RecGet(x, field) => RecGet(f(x)?, field.clone()),
            | SumGet(x, left) => SumGet(f(x)?, *left),
            | SumTag(x) => SumTag(f(x)?),
            | Fst(x) => Fst(f(x)?),
            | Snd(x) => Snd(f(x)?),
            | IndexAsInt(x) => IndexAsInt(f(x)?),
            | IntAsIndex(t, x) => IntAsIndex(f(t)?, f(x)?),
            | IdxSetSize(t) => IdxSetSize(f(t)?),
            | PrimEffect(r, op) => {
                let op = match op {
                    | EffectOp::Ask => EffectOp::Ask,
                    | EffectOp::Tell(x) => EffectOp::Tell(f(x)?),
                    | EffectOp::Get => EffectOp::Get,
                    | EffectOp::Put(x) => EffectOp::Put(f(x)?),
                };
                PrimEffect(f(r)?, op)
            }
            | IndexRef(r, i) => IndexRef(f(r)?, f(i)?),
            | PtrOffset(p, o) => PtrOffset(f(p)?, f(o)?),
            | PtrLoad(p) => PtrLoad(f(p)?),
        })
    }
}

impl<T> PrimHof<T> {
    pub fn map<B>(&self, mut f: impl FnMut(&T) -> B) -> PrimHof<B> {
        use PrimHof::*;
        match self {
            | For(d, lam) => For(*d, f(lam)),
            | While(c, b) => While(f(c), f(b)),
            | RunReader(r, lam) => RunReader(f(r), f(lam)),
            | RunWriter(lam) => RunWriter(f(lam)),
            | RunState(s, lam) => RunState(f(s), f(lam)),
            | Linearize(lam) => Linearize(f(lam)),
            | Transpose(lam) => Transpose(f(lam)),
        }
    }
}
