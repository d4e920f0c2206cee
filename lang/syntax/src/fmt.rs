use crate::*;
use pretty::RcDoc;

/// Pretty-printing to an [`RcDoc`]. Each IR crate implements this for its
/// own nodes; `show` renders at a default width for logs and pass output.
pub trait Pretty {
    fn pretty(&self) -> RcDoc<'static>;

    fn show(&self) -> String {
        let mut out = Vec::new();
        self.pretty().render(80, &mut out).expect("render to Vec cannot fail");
        String::from_utf8(out).expect("RcDoc renders utf8")
    }
}

impl Pretty for Name {
    fn pretty(&self) -> RcDoc<'static> {
        RcDoc::text(self.to_string())
    }
}

impl Pretty for Literal {
    fn pretty(&self) -> RcDoc<'static> {
        RcDoc::text(self.to_string())
    }
}

impl Pretty for BaseTy {
    fn pretty(&self) -> RcDoc<'static> {
        RcDoc::text(self.to_string())
    }
}

impl Pretty for Field {
    fn pretty(&self) -> RcDoc<'static> {
        RcDoc::text(self.to_string())
    }
}

/// `(a, b, c)` with the given bracket pair.
pub fn tupled<'a>(
    items: impl IntoIterator<Item = RcDoc<'a>>, open: &'static str, close: &'static str,
) -> RcDoc<'a> {
    RcDoc::text(open)
        .append(RcDoc::intersperse(items, RcDoc::text(",").append(RcDoc::space())))
        .append(RcDoc::text(close))
}
