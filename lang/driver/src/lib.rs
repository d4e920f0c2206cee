//! The toplevel driver. Each source block runs through the pass pipeline
//! — simplify (preserving derivative rules), simplify again (eliminating
//! them), lower to Imp — and returns the updated top environment plus the
//! outputs produced along the way.

pub mod conf;
pub mod env;
pub mod output;
pub mod source;

pub use conf::Conf;
pub use env::TopEnv;
pub use output::{Output, PassName, TopResult};
pub use source::{CmdName, SourceBlock, SourceContents};

pub use tabula_core::syntax::*;
pub use tabula_utils::prelude::*;

use tabula_autodiff::Ad;
use tabula_core::env::SubstEnv;
use tabula_core::free::free_vars_atom;
use tabula_core::simplify::Simplifier;
use tabula_core::ty::type_of_atom;
use tabula_imp::interp::{evaluate_block, CoreValue};
use tabula_imp::to_imp_module;

#[cfg(test)]
mod tests;

/// Evaluate one source block against the current top environment.
pub fn eval_source_block(
    conf: &Conf, env: &TopEnv, block: &SourceBlock,
) -> (TopEnv, TopResult) {
    match &block.contents {
        | SourceContents::RunModule(m) => match run_module(conf, env, m) {
            | Ok((env, outputs)) => (env, TopResult::ok(outputs)),
            | Err(e) => (env.clone(), TopResult::err(Vec::new(), e)),
        },
        | SourceContents::Command(cmd, m) => match run_command(conf, env, *cmd, m) {
            | Ok(outputs) => (env.clone(), TopResult::ok(outputs)),
            | Err(e) => (env.clone(), TopResult::err(Vec::new(), e)),
        },
        | SourceContents::GetNameType(name) => {
            let res = match env.lookup(name) {
                | Some(atom) => match type_of_atom(atom) {
                    | Ok(ty) => TopResult::ok(vec![Output::TextOut(ty.show())]),
                    | Err(e) => TopResult::err(Vec::new(), e),
                },
                | None => TopResult::err(Vec::new(), Error::unbound(name.to_string())),
            };
            (env.clone(), res)
        }
        // The remaining block kinds belong to other collaborators and
        // pass through unchanged.
        | SourceContents::IncludeSourceFile(_)
        | SourceContents::LoadData(_)
        | SourceContents::ProseBlock(_)
        | SourceContents::CommentLine
        | SourceContents::EmptyLines => (env.clone(), TopResult::ok(Vec::new())),
        | SourceContents::UnParseable(msg) => (
            env.clone(),
            TopResult::err(Vec::new(), Error::new(ErrKind::ParseErr, msg.clone())),
        ),
    }
}

/// The two simplification passes: first preserving derivative rules for
/// the AD transforms, then eliminating them.
pub fn simplify_twice(env: &TopEnv, module: &Module) -> Result<(Module, SubstEnv)> {
    let ad = Ad::new(env.rules.clone());
    let scope = env.scope()?;

    let pass1 = Simplifier::new(&env.atoms, &env.rules, &ad, true);
    let (m1, _) = pass1.simplify_module(scope.clone(), module)?;
    log::debug!("simplify pass one:\n{}", m1.show());

    let pass2 = Simplifier::new(&env.atoms, &env.rules, &ad, false);
    let (m2, post) = pass2.simplify_module(scope, &m1)?;
    log::debug!("simplify pass two:\n{}", m2.show());
    Ok((m2, post))
}

fn run_module(
    conf: &Conf, env: &TopEnv, module: &Module,
) -> Result<(TopEnv, Vec<Output>)> {
    let mut outputs = Vec::new();
    let mut new_env = env.clone();

    // Derivative-rule declarations extend the rules environment keyed by
    // the name whose derivative they define.
    let value_module = register_rules(env, module, &mut new_env)?;

    let (m2, post) = simplify_twice(&new_env, &value_module)?;
    if conf.log_passes {
        outputs.push(Output::PassInfo(PassName::Simplify, m2.show()));
    }

    let decl_names: im::HashSet<Name> = m2
        .decls
        .iter()
        .flat_map(|d| d.binders().into_iter().map(|b| b.name.clone()))
        .collect();

    // Closed exports go straight into the environment; computed ones are
    // evaluated through Imp and read back.
    let mut open_exports = Vec::new();
    for export in &m2.exports {
        let atom = post
            .lookup(&export.name)
            .cloned()
            .ok_or_else(|| Error::unbound(export.name.to_string()))?;
        let closed =
            !free_vars_atom(&atom).into_iter().any(|(n, _)| decl_names.contains(&n));
        if closed {
            new_env.define(export.name.clone(), atom);
        } else {
            open_exports.push((export.clone(), atom));
        }
    }
    if !open_exports.is_empty() {
        let tuple = Atom::Con(PrimCon::RecCon(Record::Tup(
            open_exports.iter().map(|(_, a)| a.clone()).collect(),
        )))
        .rc();
        let block = Block {
            decls: m2.decls.clone(),
            result: Expr::Atom(tuple),
            eff: EffectRow::pure(),
        };
        let value = evaluate_block(&block)?;
        let CoreValue::Rec(items) = value else {
            return Err(Error::compiler("module evaluation did not return a tuple"));
        };
        for ((export, atom), value) in open_exports.into_iter().zip(items) {
            let ty = type_of_atom(&atom)?;
            let atom = core_value_to_atom(&value, &ty)?;
            new_env.define(export.name.clone(), atom);
        }
    }
    Ok((new_env, outputs))
}

fn register_rules(env: &TopEnv, module: &Module, new_env: &mut TopEnv) -> Result<Module> {
    let mut decls = Vec::new();
    for decl in &module.decls {
        match decl {
            | Decl::Let(LetAnn::DerivRule, b, e) => {
                let ad = Ad::new(env.rules.clone());
                let simp = Simplifier::new(&env.atoms, &env.rules, &ad, true);
                let mut bld = tabula_core::builder::Builder::new(env.scope()?);
                let rule = simp.simplify_expr(&mut bld, &SubstEnv::new(), e)?;
                new_env.define_rule(b.name.clone(), rule);
            }
            | other => decls.push(other.clone()),
        }
    }
    Ok(Module { decls, exports: module.exports.clone() })
}

fn run_command(
    conf: &Conf, env: &TopEnv, cmd: CmdName, module: &Module,
) -> Result<Vec<Output>> {
    let (m2, post) = simplify_twice(env, module)?;
    let subject = module
        .exports
        .last()
        .ok_or_else(|| Error::compiler("command module has no subject"))?;
    let atom = post
        .lookup(&subject.name)
        .cloned()
        .ok_or_else(|| Error::unbound(subject.name.to_string()))?;
    let block =
        Block { decls: m2.decls.clone(), result: Expr::Atom(atom), eff: EffectRow::pure() };
    match cmd {
        | CmdName::ShowSimp => Ok(vec![Output::PassInfo(PassName::Simplify, block.show())]),
        | CmdName::ShowImp => {
            let backend = conf.backend()?;
            let (imp, _, _) = to_imp_module(backend, &block)?;
            Ok(vec![Output::PassInfo(PassName::Imp, imp.show())])
        }
        | CmdName::EvalExpr => {
            let value = evaluate_block(&block)?;
            Ok(vec![Output::TextOut(show_value(&value))])
        }
    }
}

/// Evaluate a block to a structured value, straight through the Interp
/// backend. The pipeline entry the scenario tests use.
pub fn evaluate_module_block(env: &TopEnv, module: &Module) -> Result<CoreValue> {
    let (m2, post) = simplify_twice(env, module)?;
    let subject = module
        .exports
        .last()
        .ok_or_else(|| Error::compiler("module has no subject"))?;
    let atom = post
        .lookup(&subject.name)
        .cloned()
        .ok_or_else(|| Error::unbound(subject.name.to_string()))?;
    let block =
        Block { decls: m2.decls.clone(), result: Expr::Atom(atom), eff: EffectRow::pure() };
    evaluate_block(&block)
}

/* ------------------------------ value readback ----------------------------- */

/// Convert an interpreter value back into an atom of the given type, for
/// storage in the top environment.
pub fn core_value_to_atom(value: &CoreValue, ty: &RcTy) -> Result<RcAtom> {
    match (value, ty.as_ref()) {
        | (CoreValue::Lit(l), _) => Ok(Atom::lit(*l)),
        | (CoreValue::Unit, _) => Ok(Atom::unit()),
        | (CoreValue::Pair(a, b), Atom::TC(PrimTC::PairTy(ta, tb))) => {
            Ok(Atom::pair(core_value_to_atom(a, ta)?, core_value_to_atom(b, tb)?))
        }
        | (CoreValue::Rec(items), Atom::TC(PrimTC::RecordTy(r))) => {
            let fields: Vec<&RcTy> = r.iter().map(|(_, t)| t).collect();
            if fields.len() != items.len() {
                return Err(Error::compiler("record readback arity mismatch"));
            }
            let items = items
                .iter()
                .zip(fields)
                .map(|(v, t)| core_value_to_atom(v, t))
                .collect::<Result<Vec<_>>>()?;
            Ok(Atom::Con(PrimCon::RecCon(match r {
                | Record::Tup(_) => Record::Tup(items),
                | Record::Named(named) => {
                    Record::Named(named.keys().cloned().zip(items).collect())
                }
            }))
            .rc())
        }
        | (CoreValue::Table(_), Atom::Pi(pi)) if matches!(pi.arr, ArrowKind::Tab) => {
            let mut flat = Vec::new();
            flatten_scalars(value, &mut flat)?;
            Ok(Atom::Con(PrimCon::ArrayLit(ty.clone(), flat)).rc())
        }
        | (CoreValue::Sum { tag, payload }, Atom::TC(PrimTC::SumTy(l, r))) => {
            let left = *tag == 0;
            let inner = payload
                .first()
                .ok_or_else(|| Error::compiler("empty sum payload in readback"))?;
            let (lv, rv) = if left {
                (core_value_to_atom(inner, l)?, Atom::Con(PrimCon::AnyValue(r.clone())).rc())
            } else {
                (Atom::Con(PrimCon::AnyValue(l.clone())).rc(), core_value_to_atom(inner, r)?)
            };
            Ok(Atom::Con(PrimCon::SumCon(Atom::lit(left), lv, rv)).rc())
        }
        | (v, t) => Err(Error::not_implemented(format!(
            "reading back value {:?} at type {:?}",
            v, t
        ))),
    }
}

fn flatten_scalars(value: &CoreValue, out: &mut Vec<Literal>) -> Result<()> {
    match value {
        | CoreValue::Lit(l) => {
            out.push(*l);
            Ok(())
        }
        | CoreValue::Table(items) => {
            for item in items {
                flatten_scalars(item, out)?;
            }
            Ok(())
        }
        | other => Err(Error::not_implemented(format!(
            "storing evaluated value {:?} in the environment",
            other
        ))),
    }
}

/// Render a value the way the `EvalExpr` command prints it.
pub fn show_value(value: &CoreValue) -> String {
    match value {
        | CoreValue::Lit(l) => l.to_string(),
        | CoreValue::Unit => "()".to_string(),
        | CoreValue::Pair(a, b) => format!("({}, {})", show_value(a), show_value(b)),
        | CoreValue::Rec(items) => {
            let inner: Vec<String> = items.iter().map(show_value).collect();
            format!("{{{}}}", inner.join(", "))
        }
        | CoreValue::Table(items) => {
            let inner: Vec<String> = items.iter().map(show_value).collect();
            format!("[{}]", inner.join(", "))
        }
        | CoreValue::Sum { tag, payload } => {
            let inner: Vec<String> = payload.iter().map(show_value).collect();
            format!("(tag {} {})", tag, inner.join(" "))
        }
    }
}
