/* --------------------------------- Pretty --------------------------------- */

use crate::syntax::*;
use pretty::RcDoc;

impl Pretty for Var {
    fn pretty(&self) -> RcDoc<'static> {
        self.name.pretty()
    }
}

fn binder_doc(v: &Var) -> RcDoc<'static> {
    v.name
        .pretty()
        .append(RcDoc::text(":"))
        .append(v.ty.pretty())
}

impl Pretty for ArrowKind {
    fn pretty(&self) -> RcDoc<'static> {
        match self {
            | ArrowKind::Plain(eff) if eff.is_pure() => RcDoc::text("->"),
            | ArrowKind::Plain(eff) => RcDoc::text("->{").append(eff.pretty()).append(RcDoc::text("}")),
            | ArrowKind::Implicit => RcDoc::text("?->"),
            | ArrowKind::Tab => RcDoc::text("=>"),
            | ArrowKind::Lin => RcDoc::text("--o"),
        }
    }
}

impl Pretty for EffectRow {
    fn pretty(&self) -> RcDoc<'static> {
        let items = self.row.iter().map(|(region, (name, _))| {
            let eff = match name {
                | EffectName::Reader => "Read",
                | EffectName::Writer => "Accum",
                | EffectName::State => "State",
            };
            RcDoc::text(eff).append(RcDoc::space()).append(region.pretty())
        });
        let tail = self.tail.iter().map(|t| RcDoc::text("|").append(t.pretty()));
        RcDoc::intersperse(items.chain(tail), RcDoc::text(", "))
    }
}

impl Pretty for Atom {
    fn pretty(&self) -> RcDoc<'static> {
        match self {
            | Atom::Var(v) => v.pretty(),
            | Atom::Lam(Lam { arr, binder, body }) => RcDoc::text("\\")
                .append(binder_doc(binder))
                .append(RcDoc::space())
                .append(arr.pretty())
                .append(RcDoc::space())
                .append(body.pretty())
                .nest(2),
            | Atom::Pi(PiTy { arr, binder, body }) => RcDoc::text("(")
                .append(binder_doc(binder))
                .append(RcDoc::text(")"))
                .append(arr.pretty())
                .append(body.pretty()),
            | Atom::Con(con) => con.pretty(),
            | Atom::TC(tc) => tc.pretty(),
            | Atom::Eff(eff) => RcDoc::text("{").append(eff.pretty()).append(RcDoc::text("}")),
        }
    }
}

impl Pretty for PrimCon<RcAtom> {
    fn pretty(&self) -> RcDoc<'static> {
        use PrimCon::*;
        match self {
            | Lit(l) => l.pretty(),
            | PairCon(a, b) => tupled([a.pretty(), b.pretty()], "(", ")"),
            | UnitCon => RcDoc::text("()"),
            | RecCon(r) => tupled(r.iter().map(|(_, a)| a.pretty()), "{", "}"),
            | DataCon(def, _, i, args) => {
                let name = def.cons.get(*i).map(|c| c.name.to_string()).unwrap_or_default();
                RcDoc::text(name).append(tupled(args.iter().map(|a| a.pretty()), "(", ")"))
            }
            | AnyValue(t) => RcDoc::text("any@").append(t.pretty()),
            | IntRangeVal(_, _, i) | IndexRangeVal(_, _, _, i) => {
                RcDoc::text("ix:").append(i.pretty())
            }
            | SumCon(tag, l, r) => {
                tupled([tag.pretty(), l.pretty(), r.pretty()], "(sum ", ")")
            }
            | SumAsProd(_, tag, payload) => RcDoc::text("(tag ")
                .append(tag.pretty())
                .append(RcDoc::space())
                .append(tupled(
                    payload.iter().map(|row| tupled(row.iter().map(|a| a.pretty()), "[", "]")),
                    "(",
                    ")",
                ))
                .append(RcDoc::text(")")),
            | AFor(n, body) => RcDoc::text("afor ")
                .append(n.pretty())
                .append(RcDoc::text(". "))
                .append(body.pretty()),
            | CharCon(c) => RcDoc::text("char ").append(c.pretty()),
            | ArrayLit(_, lits) => tupled(lits.iter().map(|l| l.pretty()), "[", "]"),
        }
    }
}

impl Pretty for PrimTC<RcAtom> {
    fn pretty(&self) -> RcDoc<'static> {
        use PrimTC::*;
        match self {
            | Base(b) => b.pretty(),
            | IntRange(l, h) => RcDoc::text("range(")
                .append(l.pretty())
                .append(RcDoc::text(", "))
                .append(h.pretty())
                .append(RcDoc::text(")")),
            | IndexRange(t, _, _) => RcDoc::text("slice of ").append(t.pretty()),
            | Array(n, b) => {
                RcDoc::text(format!("arr[{}]", n)).append(b.pretty())
            }
            | RecordTy(r) => tupled(r.iter().map(|(_, t)| t.pretty()), "{", "}"),
            | SumTy(l, r) => l.pretty().append(RcDoc::text(" | ")).append(r.pretty()),
            | Ref(region, a) => RcDoc::text("Ref ")
                .append(region.pretty())
                .append(RcDoc::space())
                .append(a.pretty()),
            | TyKind => RcDoc::text("Type"),
            | EffectKind => RcDoc::text("Effects"),
            | PairTy(a, b) => tupled([a.pretty(), b.pretty()], "(", ")"),
            | UnitTy => RcDoc::text("Unit"),
            | CharTy => RcDoc::text("Char"),
            | TypeCon(def, params) => def
                .name
                .pretty()
                .append(tupled(params.iter().map(|p| p.pretty()), "(", ")")),
        }
    }
}

impl Pretty for Expr {
    fn pretty(&self) -> RcDoc<'static> {
        match self {
            | Expr::App(_, f, x) => f
                .pretty()
                .append(RcDoc::space())
                .append(x.pretty()),
            | Expr::Atom(a) => a.pretty(),
            | Expr::Op(op) => op.pretty(),
            | Expr::Hof(hof) => hof.pretty(),
            | Expr::Case(scrut, alts, _) => RcDoc::text("case ")
                .append(scrut.pretty())
                .append(RcDoc::concat(alts.iter().map(|alt| {
                    RcDoc::line()
                        .append(RcDoc::text("of "))
                        .append(RcDoc::intersperse(
                            alt.binders.iter().map(binder_doc),
                            RcDoc::space(),
                        ))
                        .append(RcDoc::text(". "))
                        .append(alt.body.pretty())
                })))
                .nest(2),
        }
    }
}

impl Pretty for PrimOp<RcAtom> {
    fn pretty(&self) -> RcDoc<'static> {
        use PrimOp::*;
        match self {
            | ScalarBinOp(op, x, y) => RcDoc::text(format!("{:?} ", op))
                .append(x.pretty())
                .append(RcDoc::space())
                .append(y.pretty()),
            | ScalarUnOp(op, x) => RcDoc::text(format!("{:?} ", op)).append(x.pretty()),
            | Cmp(op, _, x, y) => RcDoc::text(format!("cmp {:?} ", op))
                .append(x.pretty())
                .append(RcDoc::space())
                .append(y.pretty()),
            | Select(p, x, y) => RcDoc::text("select ")
                .append(p.pretty())
                .append(RcDoc::space())
                .append(x.pretty())
                .append(RcDoc::space())
                .append(y.pretty()),
            | RecGet(x, f) => x.pretty().append(RcDoc::text(format!(".{}", f))),
            | SumGet(x, left) => {
                x.pretty().append(RcDoc::text(if *left { ".left" } else { ".right" }))
            }
            | SumTag(x) => x.pretty().append(RcDoc::text(".tag")),
            | Fst(x) => x.pretty().append(RcDoc::text(".0")),
            | Snd(x) => x.pretty().append(RcDoc::text(".1")),
            | IndexAsInt(x) => RcDoc::text("ord ").append(x.pretty()),
            | IntAsIndex(t, x) => RcDoc::text("ix@")
                .append(t.pretty())
                .append(RcDoc::space())
                .append(x.pretty()),
            | IdxSetSize(t) => RcDoc::text("size ").append(t.pretty()),
            | PrimEffect(r, op) => match op {
                | EffectOp::Ask => RcDoc::text("ask ").append(r.pretty()),
                | EffectOp::Tell(x) => RcDoc::text("tell ")
                    .append(r.pretty())
                    .append(RcDoc::space())
                    .append(x.pretty()),
                | EffectOp::Get => RcDoc::text("get ").append(r.pretty()),
                | EffectOp::Put(x) => RcDoc::text("put ")
                    .append(r.pretty())
                    .append(RcDoc::space())
                    .append(x.pretty()),
            },
            | IndexRef(r, i) => r.pretty().append(RcDoc::text("!")).append(i.pretty()),
            | PtrOffset(p, o) => p.pretty().append(RcDoc::text(" +p ")).append(o.pretty()),
            | PtrLoad(p) => RcDoc::text("load ").append(p.pretty()),
        }
    }
}

impl Pretty for PrimHof<RcAtom> {
    fn pretty(&self) -> RcDoc<'static> {
        use PrimHof::*;
        match self {
            | For(Direction::Fwd, lam) => RcDoc::text("for ").append(lam.pretty()),
            | For(Direction::Rev, lam) => RcDoc::text("rof ").append(lam.pretty()),
            | While(c, b) => RcDoc::text("while ")
                .append(c.pretty())
                .append(RcDoc::space())
                .append(b.pretty()),
            | RunReader(r, lam) => RcDoc::text("runReader ")
                .append(r.pretty())
                .append(RcDoc::space())
                .append(lam.pretty()),
            | RunWriter(lam) => RcDoc::text("runWriter ").append(lam.pretty()),
            | RunState(s, lam) => RcDoc::text("runState ")
                .append(s.pretty())
                .append(RcDoc::space())
                .append(lam.pretty()),
            | Linearize(lam) => RcDoc::text("linearize ").append(lam.pretty()),
            | Transpose(lam) => RcDoc::text("transpose ").append(lam.pretty()),
        }
    }
}

impl Pretty for Decl {
    fn pretty(&self) -> RcDoc<'static> {
        match self {
            | Decl::Let(_, b, e) => binder_doc(b)
                .append(RcDoc::text(" = "))
                .append(e.pretty()),
            | Decl::Unpack(bs, e) => tupled(bs.iter().map(binder_doc), "(", ")")
                .append(RcDoc::text(" = "))
                .append(e.pretty()),
        }
    }
}

impl Pretty for Block {
    fn pretty(&self) -> RcDoc<'static> {
        let body = RcDoc::concat(
            self.decls.iter().map(|d| d.pretty().append(RcDoc::text(";")).append(RcDoc::line())),
        )
        .append(self.result.pretty());
        if self.decls.is_empty() {
            body
        } else {
            RcDoc::text("(").append(RcDoc::line_()).append(body).append(RcDoc::text(")")).nest(2).group()
        }
    }
}

impl Pretty for Module {
    fn pretty(&self) -> RcDoc<'static> {
        RcDoc::intersperse(self.decls.iter().map(|d| d.pretty()), RcDoc::line())
    }
}
