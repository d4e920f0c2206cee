//! Scenario tests: each drives a module through both simplifier passes,
//! lowers it to Imp and executes it on the interpreter.

use crate::*;
use pretty_assertions::assert_eq;
use tabula_imp::interp::CoreValue;
use tabula_imp::{free_ivars, to_imp_module, Backend, ImpInstr};

fn var(hint: &str, ty: RcTy) -> Var {
    Var::new(Name::free(hint), ty)
}

fn lam(arr: ArrowKind, binder: Var, body: Block) -> RcAtom {
    Atom::Lam(Lam { arr, binder, body }).rc()
}

fn block(decls: Vec<Decl>, result: Expr, eff: EffectRow) -> Block {
    Block { decls, result, eff }
}

fn let_(b: &Var, e: Expr) -> Decl {
    Decl::Let(LetAnn::Plain, b.clone(), e)
}

fn int_lit(i: i64) -> RcAtom {
    Atom::lit(i)
}

fn real_lit(r: f64) -> RcAtom {
    Atom::lit(r)
}

fn eval(module: &Module) -> CoreValue {
    let env = TopEnv::new();
    match evaluate_module_block(&env, module) {
        | Ok(v) => v,
        | Err(e) => panic!("evaluation failed: {}", e),
    }
}

fn contains_lam_app(block: &Block) -> bool {
    fn expr_has(e: &Expr) -> bool {
        match e {
            | Expr::App(_, f, _) => matches!(f.as_ref(), Atom::Lam(_)),
            | Expr::Hof(hof) => {
                let mut found = false;
                let _ = hof.map(|a| {
                    if let Atom::Lam(l) = a.as_ref() {
                        found = found || block_has(&l.body);
                    }
                });
                found
            }
            | _ => false,
        }
    }
    fn block_has(b: &Block) -> bool {
        b.decls.iter().any(|d| expr_has(d.expr())) || expr_has(&b.result)
    }
    block_has(block)
}

/* ------------------------------- simplifier -------------------------------- */

#[test]
fn s1_beta_reduction_leaves_no_lambda_applications() {
    // let f = \x. x + 1 in f 2
    let x = var("x", Atom::int_ty());
    let body = {
        let add = Expr::Op(PrimOp::ScalarBinOp(BinOp::IAdd, x.to_atom(), int_lit(1)));
        block(Vec::new(), add, EffectRow::pure())
    };
    let f_lam = lam(ArrowKind::pure(), x, body);
    let f_ty = tabula_core::ty::type_of_atom(&f_lam).unwrap();
    let f = var("f", f_ty);
    let y = var("y", Atom::int_ty());
    let module = Module {
        decls: vec![
            let_(&f, Expr::Atom(f_lam)),
            let_(&y, Expr::App(ArrowKind::pure(), f.to_atom(), int_lit(2))),
        ],
        exports: vec![y],
    };

    let env = TopEnv::new();
    let (m2, _) = simplify_twice(&env, &module).unwrap();
    let as_block = Block {
        decls: m2.decls.clone(),
        result: Expr::Atom(Atom::unit()),
        eff: EffectRow::pure(),
    };
    assert!(!contains_lam_app(&as_block), "a lambda application survived:\n{}", m2.show());

    assert_eq!(eval(&module).as_int().unwrap(), 3);
}

#[test]
fn simplifier_is_idempotent_on_data_modules() {
    let x = var("x", Atom::int_ty());
    let module = Module {
        decls: vec![let_(
            &x,
            Expr::Op(PrimOp::ScalarBinOp(BinOp::IMul, int_lit(6), int_lit(7))),
        )],
        exports: vec![x],
    };
    let env = TopEnv::new();
    let (m2, _) = simplify_twice(&env, &module).unwrap();
    let (m3, _) = simplify_twice(&env, &m2).unwrap();
    assert_eq!(m3.decls.len(), m2.decls.len());
    assert_eq!(eval(&m2).as_int().unwrap(), 42);
    assert_eq!(eval(&m3).as_int().unwrap(), 42);
}

#[test]
fn structural_equality_unfolds_pairs() {
    // (1, 2.0) == (1, 3.0) ~> false
    let a = Atom::pair(int_lit(1), real_lit(2.0));
    let b = Atom::pair(int_lit(1), real_lit(3.0));
    let ty = Atom::pair_ty(Atom::int_ty(), Atom::real_ty());
    let r = var("r", Atom::bool_ty());
    let module = Module {
        decls: vec![let_(&r, Expr::Op(PrimOp::Cmp(CmpOp::Equal, ty, a, b)))],
        exports: vec![r],
    };
    assert_eq!(eval(&module), CoreValue::Lit(Literal::Bool(false)));
}

/* --------------------------------- autodiff -------------------------------- */

#[test]
fn s2_linearize_scaling() {
    // linearize (\x. 3.0 * x) at 4.0 with tangent 1.0 = (12.0, 3.0)
    let x = var("x", Atom::real_ty());
    let body = block(
        Vec::new(),
        Expr::Op(PrimOp::ScalarBinOp(BinOp::FMul, real_lit(3.0), x.to_atom())),
        EffectRow::pure(),
    );
    let f_lam = lam(ArrowKind::pure(), x, body);
    let f_ty = tabula_core::ty::type_of_atom(&f_lam).unwrap();
    let f = var("f", f_ty);

    let lin = Expr::Hof(PrimHof::Linearize(f.to_atom()));
    let g = var("g", tabula_core::ty::type_of_expr(&lin).unwrap());
    let pr_ty = Atom::pair_ty(
        Atom::real_ty(),
        Atom::Pi(PiTy {
            arr: ArrowKind::Lin,
            binder: var("t", Atom::real_ty()),
            body: Atom::real_ty(),
        })
        .rc(),
    );
    let pr = var("pr", pr_ty.clone());
    let p = var("p", Atom::real_ty());
    let lf = var("lf", match pr_ty.as_ref() {
        | Atom::TC(PrimTC::PairTy(_, l)) => l.clone(),
        | _ => unreachable!(),
    });
    let t = var("t", Atom::real_ty());
    let res = var("res", Atom::pair_ty(Atom::real_ty(), Atom::real_ty()));
    let module = Module {
        decls: vec![
            let_(&f, Expr::Atom(f_lam)),
            let_(&g, lin),
            let_(&pr, Expr::App(ArrowKind::pure(), g.to_atom(), real_lit(4.0))),
            let_(&p, Expr::Op(PrimOp::Fst(pr.to_atom()))),
            let_(&lf, Expr::Op(PrimOp::Snd(pr.to_atom()))),
            let_(&t, Expr::App(ArrowKind::Lin, lf.to_atom(), real_lit(1.0))),
            let_(&res, Expr::Atom(Atom::pair(p.to_atom(), t.to_atom()))),
        ],
        exports: vec![res],
    };
    let v = eval(&module);
    let CoreValue::Pair(primal, tangent) = v else { panic!("expected a pair, got {:?}", v) };
    assert_eq!(primal.as_real().unwrap(), 12.0);
    assert_eq!(tangent.as_real().unwrap(), 3.0);
}

#[test]
fn s2_linearize_square_rule() {
    // For \x. x*x at x0, the linear map is t -> 2*x0*t.
    let x = var("x", Atom::real_ty());
    let body = block(
        Vec::new(),
        Expr::Op(PrimOp::ScalarBinOp(BinOp::FMul, x.to_atom(), x.to_atom())),
        EffectRow::pure(),
    );
    let f_lam = lam(ArrowKind::pure(), x, body);
    let f_ty = tabula_core::ty::type_of_atom(&f_lam).unwrap();
    let f = var("f", f_ty);

    let lin = Expr::Hof(PrimHof::Linearize(f.to_atom()));
    let g = var("g", tabula_core::ty::type_of_expr(&lin).unwrap());
    let pr_ty = Atom::pair_ty(
        Atom::real_ty(),
        Atom::Pi(PiTy {
            arr: ArrowKind::Lin,
            binder: var("t", Atom::real_ty()),
            body: Atom::real_ty(),
        })
        .rc(),
    );
    let pr = var("pr", pr_ty.clone());
    let p = var("p", Atom::real_ty());
    let lf = var("lf", match pr_ty.as_ref() {
        | Atom::TC(PrimTC::PairTy(_, l)) => l.clone(),
        | _ => unreachable!(),
    });
    let t = var("t", Atom::real_ty());
    let res = var("res", Atom::pair_ty(Atom::real_ty(), Atom::real_ty()));
    let module = Module {
        decls: vec![
            let_(&f, Expr::Atom(f_lam)),
            let_(&g, lin),
            let_(&pr, Expr::App(ArrowKind::pure(), g.to_atom(), real_lit(3.0))),
            let_(&p, Expr::Op(PrimOp::Fst(pr.to_atom()))),
            let_(&lf, Expr::Op(PrimOp::Snd(pr.to_atom()))),
            let_(&t, Expr::App(ArrowKind::Lin, lf.to_atom(), real_lit(1.0))),
            let_(&res, Expr::Atom(Atom::pair(p.to_atom(), t.to_atom()))),
        ],
        exports: vec![res],
    };
    let v = eval(&module);
    let CoreValue::Pair(primal, tangent) = v else { panic!("expected a pair, got {:?}", v) };
    assert_eq!(primal.as_real().unwrap(), 9.0);
    assert_eq!(tangent.as_real().unwrap(), 6.0);
}

#[test]
fn s3_transpose_doubling() {
    // transpose (\x. x + x) applied to cotangent 1.0 = 2.0
    let x = var("x", Atom::real_ty());
    let body = block(
        Vec::new(),
        Expr::Op(PrimOp::ScalarBinOp(BinOp::FAdd, x.to_atom(), x.to_atom())),
        EffectRow::pure(),
    );
    let f_lam = lam(ArrowKind::Lin, x, body);
    let f_ty = tabula_core::ty::type_of_atom(&f_lam).unwrap();
    let f = var("f", f_ty);

    let tr = Expr::Hof(PrimHof::Transpose(f.to_atom()));
    let g = var("g", tabula_core::ty::type_of_expr(&tr).unwrap());
    let ct = var("ct", Atom::real_ty());
    let module = Module {
        decls: vec![
            let_(&f, Expr::Atom(f_lam)),
            let_(&g, tr),
            let_(&ct, Expr::App(ArrowKind::Lin, g.to_atom(), real_lit(1.0))),
        ],
        exports: vec![ct],
    };
    assert_eq!(eval(&module).as_real().unwrap(), 2.0);
}

#[test]
fn transpose_of_scaling_matches_linearization() {
    // transpose (\x. 3.0 * x) at cotangent 2.0 = 6.0
    let x = var("x", Atom::real_ty());
    let body = block(
        Vec::new(),
        Expr::Op(PrimOp::ScalarBinOp(BinOp::FMul, real_lit(3.0), x.to_atom())),
        EffectRow::pure(),
    );
    let f_lam = lam(ArrowKind::Lin, x, body);
    let f_ty = tabula_core::ty::type_of_atom(&f_lam).unwrap();
    let f = var("f", f_ty);
    let tr = Expr::Hof(PrimHof::Transpose(f.to_atom()));
    let g = var("g", tabula_core::ty::type_of_expr(&tr).unwrap());
    let ct = var("ct", Atom::real_ty());
    let module = Module {
        decls: vec![
            let_(&f, Expr::Atom(f_lam)),
            let_(&g, tr),
            let_(&ct, Expr::App(ArrowKind::Lin, g.to_atom(), real_lit(2.0))),
        ],
        exports: vec![ct],
    };
    assert_eq!(eval(&module).as_real().unwrap(), 6.0);
}

/* --------------------------------- effects --------------------------------- */

/// `runWriter \ref. for i in range(0,3). tell ref 1.0` = ((), 3.0)
fn s4_module() -> Module {
    let region = var("h", Atom::ty_kind());
    let ref_ty = Atom::ref_ty(region.to_atom(), Atom::real_ty());
    let refv = var("ref", ref_ty);
    let eff = EffectRow::single(region.name.clone(), EffectName::Writer, Atom::real_ty());

    let i = var("i", Atom::int_range(0, 3));
    let tell = Expr::Op(PrimOp::PrimEffect(
        refv.to_atom(),
        EffectOp::Tell(real_lit(1.0)),
    ));
    let for_lam = lam(
        ArrowKind::Plain(eff.clone()),
        i,
        block(Vec::new(), tell, eff.clone()),
    );
    let u = var("u", Atom::tab_ty(Atom::int_range(0, 3), Atom::unit_ty()));
    let inner_body = block(
        vec![let_(&u, Expr::Hof(PrimHof::For(Direction::Fwd, for_lam)))],
        Expr::Atom(Atom::unit()),
        eff.clone(),
    );
    let inner_lam = lam(ArrowKind::Plain(eff), refv, inner_body);
    let run_lam = lam(
        ArrowKind::pure(),
        region,
        block(Vec::new(), Expr::Atom(inner_lam), EffectRow::pure()),
    );

    let w = var("w", Atom::pair_ty(Atom::unit_ty(), Atom::real_ty()));
    Module {
        decls: vec![let_(&w, Expr::Hof(PrimHof::RunWriter(run_lam)))],
        exports: vec![w],
    }
}

#[test]
fn s4_run_writer_accumulates() {
    let v = eval(&s4_module());
    let CoreValue::Pair(ans, acc) = v else { panic!("expected a pair, got {:?}", v) };
    assert_eq!(*ans, CoreValue::Unit);
    assert_eq!(acc.as_real().unwrap(), 3.0);
}

/* -------------------------------- imp lowering ------------------------------ */

/// `for i in range(0,4). ord(i) * ord(i)`
fn s5_module() -> Module {
    let i = var("i", Atom::int_range(0, 4));
    let o = var("o", Atom::int_ty());
    let body = block(
        vec![let_(&o, Expr::Op(PrimOp::IndexAsInt(i.to_atom())))],
        Expr::Op(PrimOp::ScalarBinOp(BinOp::IMul, o.to_atom(), o.to_atom())),
        EffectRow::pure(),
    );
    let for_lam = lam(ArrowKind::pure(), i, body);
    let t = var("t", Atom::tab_ty(Atom::int_range(0, 4), Atom::int_ty()));
    Module {
        decls: vec![let_(&t, Expr::Hof(PrimHof::For(Direction::Fwd, for_lam)))],
        exports: vec![t],
    }
}

#[test]
fn s5_for_lowers_to_alloc_loop_store() {
    let env = TopEnv::new();
    let module = s5_module();
    let (m2, post) = simplify_twice(&env, &module).unwrap();
    let subject = post.lookup(&module.exports[0].name).cloned().unwrap();
    let blk = Block { decls: m2.decls, result: Expr::Atom(subject), eff: EffectRow::pure() };
    let (imp, recon, _) = to_imp_module(Backend::Llvm, &blk).unwrap();

    let main = imp.main_fn().unwrap();
    let allocs: Vec<_> = main
        .body
        .stmts
        .iter()
        .filter_map(|s| match &s.instr {
            | ImpInstr::Alloc(_, b, n) => Some((*b, n.as_lit_int())),
            | _ => None,
        })
        .collect();
    assert_eq!(allocs, vec![(BaseTy::Int, Some(4))]);

    let fors: Vec<_> = main
        .body
        .stmts
        .iter()
        .filter_map(|s| match &s.instr {
            | ImpInstr::IFor { n, body, .. } => Some((n.as_lit_int(), body)),
            | _ => None,
        })
        .collect();
    assert_eq!(fors.len(), 1);
    let (n, loop_body) = &fors[0];
    assert_eq!(*n, Some(4));
    assert!(loop_body
        .stmts
        .iter()
        .any(|s| matches!(s.instr, ImpInstr::Store { .. })));
    assert_eq!(recon.binders.len(), 1);

    assert_eq!(
        eval(&module),
        CoreValue::Table(vec![
            CoreValue::Lit(Literal::Int(0)),
            CoreValue::Lit(Literal::Int(1)),
            CoreValue::Lit(Literal::Int(4)),
            CoreValue::Lit(Literal::Int(9)),
        ])
    );
}

/// `for i in range(0,2). for j in range(0,3). ord(i) + ord(j)`
fn s6_module() -> Module {
    let i = var("i", Atom::int_range(0, 2));
    let j = var("j", Atom::int_range(0, 3));
    let oi = var("oi", Atom::int_ty());
    let oj = var("oj", Atom::int_ty());
    let inner_body = block(
        vec![
            let_(&oi, Expr::Op(PrimOp::IndexAsInt(i.to_atom()))),
            let_(&oj, Expr::Op(PrimOp::IndexAsInt(j.to_atom()))),
        ],
        Expr::Op(PrimOp::ScalarBinOp(BinOp::IAdd, oi.to_atom(), oj.to_atom())),
        EffectRow::pure(),
    );
    let inner_lam = lam(ArrowKind::pure(), j, inner_body);
    let row = var("row", Atom::tab_ty(Atom::int_range(0, 3), Atom::int_ty()));
    let outer_body = block(
        vec![let_(&row, Expr::Hof(PrimHof::For(Direction::Fwd, inner_lam)))],
        Expr::Atom(row.to_atom()),
        EffectRow::pure(),
    );
    let outer_lam = lam(ArrowKind::pure(), i, outer_body);
    let t = var(
        "t",
        Atom::tab_ty(
            Atom::int_range(0, 2),
            Atom::tab_ty(Atom::int_range(0, 3), Atom::int_ty()),
        ),
    );
    Module {
        decls: vec![let_(&t, Expr::Hof(PrimHof::For(Direction::Fwd, outer_lam)))],
        exports: vec![t],
    }
}

#[test]
fn s6_nested_tables_are_row_major() {
    // The value is right, and the backing buffer is laid out i*3 + j.
    assert_eq!(
        eval(&s6_module()),
        CoreValue::Table(vec![
            CoreValue::Table(vec![
                CoreValue::Lit(Literal::Int(0)),
                CoreValue::Lit(Literal::Int(1)),
                CoreValue::Lit(Literal::Int(2)),
            ]),
            CoreValue::Table(vec![
                CoreValue::Lit(Literal::Int(1)),
                CoreValue::Lit(Literal::Int(2)),
                CoreValue::Lit(Literal::Int(3)),
            ]),
        ])
    );

    let env = TopEnv::new();
    let module = s6_module();
    let (m2, post) = simplify_twice(&env, &module).unwrap();
    let subject = post.lookup(&module.exports[0].name).cloned().unwrap();
    let blk = Block { decls: m2.decls, result: Expr::Atom(subject), eff: EffectRow::pure() };
    let (imp, _, backings) =
        tabula_imp::to_imp_module_with_backings(Backend::Interp, &blk).unwrap();
    let mut interp = tabula_imp::interp::Interpreter::with_backings(&imp, &backings);
    let results = interp.run_main().unwrap();
    let Some(tabula_imp::interp::RtVal::Ptr { buf, offset }) = results.first().copied()
    else {
        panic!("expected a pointer result");
    };
    assert_eq!(offset, 0);
    let cells: Vec<i64> = interp
        .buffer(buf)
        .unwrap()
        .iter()
        .map(|s| s.as_int().unwrap())
        .collect();
    assert_eq!(cells, vec![0, 1, 2, 1, 2, 3]);
}

#[test]
fn kernels_close_over_their_arguments() {
    let env = TopEnv::new();
    let module = s5_module();
    let (m2, post) = simplify_twice(&env, &module).unwrap();
    let subject = post.lookup(&module.exports[0].name).cloned().unwrap();
    let blk = Block { decls: m2.decls, result: Expr::Atom(subject), eff: EffectRow::pure() };
    let (imp, _, _) = to_imp_module(Backend::LlvmMc, &blk).unwrap();

    let kernels: Vec<_> = imp
        .functions
        .iter()
        .filter(|f| f.cc == tabula_imp::CallingConv::MCThreadLaunch)
        .collect();
    assert_eq!(kernels.len(), 1);
    let kernel = kernels[0];
    for v in free_ivars(&kernel.body) {
        assert!(
            kernel.args.iter().any(|a| a.name == v.name),
            "kernel reads {} outside its closure",
            v.name
        );
    }
    let launches = imp
        .main_fn()
        .unwrap()
        .body
        .stmts
        .iter()
        .filter(|s| matches!(s.instr, ImpInstr::ILaunch { .. }))
        .count();
    assert_eq!(launches, 1);
}

/* ------------------------------ driver surface ------------------------------ */

#[test]
fn source_blocks_thread_the_environment() {
    let conf = Conf::default();
    let env = TopEnv::new();

    // c := 21 * 2 enters the environment...
    let c = Var::new(Name::top("c"), Atom::int_ty());
    let def = Module {
        decls: vec![let_(
            &c,
            Expr::Op(PrimOp::ScalarBinOp(BinOp::IMul, int_lit(21), int_lit(2))),
        )],
        exports: vec![c.clone()],
    };
    let (env, res) = eval_source_block(&conf, &env, &SourceBlock::run(def));
    assert!(res.outcome.is_ok(), "definition failed: {:?}", res.outcome);
    assert!(env.lookup(&c.name).is_some());

    // ... and a later expression can use it.
    let r = var("r", Atom::int_ty());
    let use_c = Module {
        decls: vec![let_(
            &r,
            Expr::Op(PrimOp::ScalarBinOp(BinOp::IAdd, c.to_atom(), int_lit(1))),
        )],
        exports: vec![r],
    };
    let (_, res) =
        eval_source_block(&conf, &env, &SourceBlock::command(CmdName::EvalExpr, use_c));
    assert!(res.outcome.is_ok(), "command failed: {:?}", res.outcome);
    assert_eq!(res.outputs, vec![Output::TextOut("43".to_string())]);
}

#[test]
fn prose_and_comments_pass_through() {
    let conf = Conf::default();
    let env = TopEnv::new();
    let block = SourceBlock {
        line: 3,
        offset: 10,
        raw_text: "-- a comment".to_string(),
        contents: SourceContents::CommentLine,
    };
    let (_, res) = eval_source_block(&conf, &env, &block);
    assert!(res.outcome.is_ok());
    assert!(res.outputs.is_empty());
}

#[test]
fn unparseable_blocks_report_parse_errors() {
    let conf = Conf::default();
    let env = TopEnv::new();
    let block = SourceBlock {
        line: 1,
        offset: 0,
        raw_text: "@#!".to_string(),
        contents: SourceContents::UnParseable("unexpected token".to_string()),
    };
    let (_, res) = eval_source_block(&conf, &env, &block);
    match res.outcome {
        | Err(e) => assert_eq!(e.kind, ErrKind::ParseErr),
        | Ok(()) => panic!("expected a parse error"),
    }
}
