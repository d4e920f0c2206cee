/* --------------------------------- Pretty --------------------------------- */

use crate::dest::Dest;
use crate::syntax::*;
use pretty::RcDoc;

impl Pretty for IVar {
    fn pretty(&self) -> RcDoc<'static> {
        self.name.pretty()
    }
}

impl Pretty for IType {
    fn pretty(&self) -> RcDoc<'static> {
        match self {
            | IType::Scalar(b) => b.pretty(),
            | IType::Ptr(p) => RcDoc::text(format!(
                "{:?}:{:?}*",
                p.addr.dev, p.addr.space
            ))
            .append(p.elem.pretty()),
        }
    }
}

impl Pretty for IExpr {
    fn pretty(&self) -> RcDoc<'static> {
        match self {
            | IExpr::Lit(ILit::Scalar(l)) => l.pretty(),
            | IExpr::Lit(ILit::Ptr(p)) => RcDoc::text(format!("ptr#{}", p.id)),
            | IExpr::Var(v) => v.pretty(),
        }
    }
}

fn args_doc<'a>(args: impl IntoIterator<Item = RcDoc<'a>>) -> RcDoc<'a> {
    tupled(args, "(", ")")
}

impl Pretty for ImpInstr {
    fn pretty(&self) -> RcDoc<'static> {
        use ImpInstr::*;
        match self {
            | IPrimOp(op) => prim_op_doc(op),
            | ICastOp(b, e) => RcDoc::text("cast ")
                .append(b.pretty())
                .append(RcDoc::space())
                .append(e.pretty()),
            | Alloc(addr, b, n) => RcDoc::text(format!(
                "alloc {:?}/{:?} ",
                addr.dev, addr.space
            ))
            .append(b.pretty())
            .append(RcDoc::text("["))
            .append(n.pretty())
            .append(RcDoc::text("]")),
            | Free(p) => RcDoc::text("free ").append(p.pretty()),
            | MemCopy { dest, src, numel } => RcDoc::text("memcopy ")
                .append(args_doc([dest.pretty(), src.pretty(), numel.pretty()])),
            | Store { dest, value } => dest
                .pretty()
                .append(RcDoc::text(" := "))
                .append(value.pretty()),
            | Load(p) => RcDoc::text("load ").append(p.pretty()),
            | IThrowError => RcDoc::text("throwError"),
            | IFor { dir, binder, n, body } => RcDoc::text(match dir {
                | Direction::Fwd => "for ",
                | Direction::Rev => "rof ",
            })
            .append(binder.pretty())
            .append(RcDoc::text(" < "))
            .append(n.pretty())
            .append(RcDoc::text(" {"))
            .append(RcDoc::line().append(body.pretty()).nest(2))
            .append(RcDoc::line())
            .append(RcDoc::text("}")),
            | IWhile { cond, body } => RcDoc::text("while {")
                .append(RcDoc::line().append(cond.pretty()).nest(2))
                .append(RcDoc::line())
                .append(RcDoc::text("} {"))
                .append(RcDoc::line().append(body.pretty()).nest(2))
                .append(RcDoc::line())
                .append(RcDoc::text("}")),
            | ICond { pred, then_case, else_case } => RcDoc::text("if ")
                .append(pred.pretty())
                .append(RcDoc::text(" {"))
                .append(RcDoc::line().append(then_case.pretty()).nest(2))
                .append(RcDoc::line())
                .append(RcDoc::text("} else {"))
                .append(RcDoc::line().append(else_case.pretty()).nest(2))
                .append(RcDoc::line())
                .append(RcDoc::text("}")),
            | ILaunch { fun, size, args } => RcDoc::text("launch ")
                .append(fun.pretty())
                .append(RcDoc::text("["))
                .append(size.pretty())
                .append(RcDoc::text("]"))
                .append(args_doc(args.iter().map(|a| a.pretty()))),
        }
    }
}

fn prim_op_doc(op: &PrimOp<IExpr>) -> RcDoc<'static> {
    use PrimOp::*;
    match op {
        | ScalarBinOp(b, x, y) => RcDoc::text(format!("{:?} ", b))
            .append(x.pretty())
            .append(RcDoc::space())
            .append(y.pretty()),
        | ScalarUnOp(u, x) => RcDoc::text(format!("{:?} ", u)).append(x.pretty()),
        | Select(p, x, y) => RcDoc::text("select ")
            .append(p.pretty())
            .append(RcDoc::space())
            .append(x.pretty())
            .append(RcDoc::space())
            .append(y.pretty()),
        | PtrOffset(p, o) => p.pretty().append(RcDoc::text(" +> ")).append(o.pretty()),
        | PtrLoad(p) => RcDoc::text("load ").append(p.pretty()),
        | other => RcDoc::text(format!("{:?}", other.map(|_| ()))),
    }
}

impl Pretty for ImpStmt {
    fn pretty(&self) -> RcDoc<'static> {
        match &self.binder {
            | Some(b) => b
                .pretty()
                .append(RcDoc::text(":"))
                .append(b.ty.pretty())
                .append(RcDoc::text(" = "))
                .append(self.instr.pretty()),
            | None => self.instr.pretty(),
        }
    }
}

impl Pretty for ImpBlock {
    fn pretty(&self) -> RcDoc<'static> {
        let stmts = RcDoc::intersperse(self.stmts.iter().map(|s| s.pretty()), RcDoc::line());
        if self.results.is_empty() {
            stmts
        } else {
            stmts
                .append(RcDoc::line())
                .append(RcDoc::text("return "))
                .append(tupled(self.results.iter().map(|r| r.pretty()), "(", ")"))
        }
    }
}

impl Pretty for ImpFunction {
    fn pretty(&self) -> RcDoc<'static> {
        RcDoc::text(format!("{:?} ", self.cc))
            .append(self.name.pretty())
            .append(args_doc(self.args.iter().map(|a| {
                a.pretty().append(RcDoc::text(":")).append(a.ty.pretty())
            })))
            .append(RcDoc::text(" {"))
            .append(RcDoc::line().append(self.body.pretty()).nest(2))
            .append(RcDoc::line())
            .append(RcDoc::text("}"))
    }
}

impl Pretty for ImpModule {
    fn pretty(&self) -> RcDoc<'static> {
        RcDoc::intersperse(
            self.functions.iter().map(|f| f.pretty()),
            RcDoc::line().append(RcDoc::line()),
        )
    }
}

impl Pretty for Dest {
    fn pretty(&self) -> RcDoc<'static> {
        match self {
            | Dest::Base(p) => RcDoc::text("*").append(p.pretty()),
            | Dest::Tab(b, d) => RcDoc::text("tab ")
                .append(b.name.pretty())
                .append(RcDoc::text(". "))
                .append(d.pretty()),
            | Dest::Pair(a, b) => tupled([a.pretty(), b.pretty()], "(", ")"),
            | Dest::Unit => RcDoc::text("()"),
            | Dest::RecordD(r) => tupled(r.iter().map(|(_, d)| d.pretty()), "{", "}"),
            | Dest::SumAsProdD { tag, payload, .. } => RcDoc::text("sum ")
                .append(tag.pretty())
                .append(RcDoc::space())
                .append(tupled(
                    payload
                        .iter()
                        .map(|row| tupled(row.iter().map(|d| d.pretty()), "[", "]")),
                    "(",
                    ")",
                )),
            | Dest::DataConD(def, _, fields) => def
                .name
                .pretty()
                .append(tupled(fields.iter().map(|d| d.pretty()), "(", ")")),
            | Dest::IndexD { repr, .. } => RcDoc::text("ix ").append(repr.pretty()),
            | Dest::ConstD(a) => a.pretty(),
        }
    }
}
