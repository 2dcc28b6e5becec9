use criterion::{Criterion, black_box, criterion_group, criterion_main};

use veld::ast::{BinOp, Expr, FunctionDef, Stmt};
use veld::{Item, Runtime, RuntimeOptions};

fn bench_step_loop(c: &mut Criterion) {
    let mut rt = Runtime::new();
    let fact = FunctionDef::new("fact")
        .params(&["n"])
        .body(vec![
            Stmt::let_("acc", Expr::int(1)),
            Stmt::While {
                cond: Expr::binary(BinOp::Gt, Expr::sym("n"), Expr::int(1)),
                body: vec![
                    Stmt::Expr(Expr::assign_sym(
                        "acc",
                        Expr::binary(BinOp::Mul, Expr::sym("acc"), Expr::sym("n")),
                    )),
                    Stmt::Expr(Expr::assign_sym(
                        "n",
                        Expr::binary(BinOp::Sub, Expr::sym("n"), Expr::int(1)),
                    )),
                ],
            },
            Stmt::ret(Expr::sym("acc")),
        ])
        .compile()
        .expect("compile");
    let fact = Item::Func(fact);

    c.bench_function("factorial_20_stepwise", |b| {
        b.iter(|| {
            let result = rt
                .call_function(black_box(&fact), &[Item::Int(20)])
                .expect("run");
            black_box(result)
        })
    });
}

fn bench_call_overhead(c: &mut Criterion) {
    let mut rt = Runtime::new();
    let identity = FunctionDef::new("id")
        .params(&["x"])
        .body(vec![Stmt::ret(Expr::sym("x"))])
        .compile()
        .expect("compile");
    let identity = Item::Func(identity);

    c.bench_function("call_return_roundtrip", |b| {
        b.iter(|| {
            rt.call_function(black_box(&identity), &[Item::Int(1)])
                .expect("run")
        })
    });
}

fn bench_collection_cycle(c: &mut Criterion) {
    let mut rt = Runtime::with_options(RuntimeOptions {
        gc_threshold: 0,
        ..RuntimeOptions::default()
    });

    // a few thousand live strings reachable from one global array
    let items: Vec<Item> = (0..4096).map(|i| rt.new_string(&i.to_string())).collect();
    let root = rt.new_array(items);
    rt.set_global("root", root);
    rt.collect();

    c.bench_function("collect_4k_live", |b| {
        b.iter(|| black_box(rt.collect()))
    });
}

criterion_group!(
    benches,
    bench_step_loop,
    bench_call_overhead,
    bench_collection_cycle
);
criterion_main!(benches);
