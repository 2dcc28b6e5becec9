//! End-to-end execution tests: precompiled trees and raw step sequences
//! running on the stepwise engine.

use std::rc::Rc;

use veld::ast::{BinOp, Expr, FunctionDef, Stmt, Target};
use veld::{Const, Fault, Item, Name, Runtime, Step, StepSeq};

fn compile(def: FunctionDef) -> Item {
    Item::Func(def.compile().unwrap_or_else(|e| panic!("compile failed: {e}")))
}

fn call(rt: &mut Runtime, f: &Item, args: &[Item]) -> Item {
    rt.call_function(f, args).unwrap_or_else(|e| panic!("call failed: {e}"))
}

// ═══════════════════════════════════════════════════════════════════════════
// Raw step sequences
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_raw_sequence_yields_single_integer() {
    // [push 3, push 4, mul, push 2, add] from an empty data stack -> 14
    let mut rt = Runtime::new();
    let seq: Rc<StepSeq> = vec![
        Step::PushConst(Const::Int(3)),
        Step::PushConst(Const::Int(4)),
        Step::Mul,
        Step::PushConst(Const::Int(2)),
        Step::Add,
    ]
    .into();
    let result = rt.run_steps(seq).unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(result, Item::Int(14));
}

#[test]
fn test_short_circuit_skips_poisoned_operand() {
    // (false and <faulting load>) or true
    // The right operand of `and` is a global that does not exist; if the
    // gate failed to short-circuit, the load would raise an access fault.
    let mut rt = Runtime::new();
    let seq: Rc<StepSeq> = vec![
        Step::PushConst(Const::Bool(false)),
        Step::AndGate { exit: 4 },
        Step::LoadGlobal(Name::from("never_defined")),
        Step::Booleanize,
        Step::OrGate { exit: 7 },
        Step::PushConst(Const::Bool(true)),
        Step::Booleanize,
    ]
    .into();
    let result = rt.run_steps(seq).unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(result, Item::Bool(true));
}

#[test]
fn test_step_tracing_smoke() {
    // installing a subscriber must not disturb execution
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let mut rt = Runtime::new();
    let seq: Rc<StepSeq> = vec![
        Step::PushConst(Const::Int(1)),
        Step::PushConst(Const::Int(2)),
        Step::Add,
    ]
    .into();
    let result = rt.run_steps(seq).unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(result, Item::Int(3));
}

// ═══════════════════════════════════════════════════════════════════════════
// Numeric semantics
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_integer_addition_stays_integer() {
    let mut rt = Runtime::new();
    let f = compile(FunctionDef::new("f").params(&["a", "b"]).body(vec![Stmt::ret(
        Expr::binary(BinOp::Add, Expr::sym("a"), Expr::sym("b")),
    )]));
    assert_eq!(call(&mut rt, &f, &[Item::Int(2), Item::Int(3)]), Item::Int(5));
    // mixed operands promote to real
    assert_eq!(
        call(&mut rt, &f, &[Item::Int(1), Item::Real(2.5)]),
        Item::Real(3.5)
    );
    assert_eq!(
        call(&mut rt, &f, &[Item::Real(0.5), Item::Real(0.25)]),
        Item::Real(0.75)
    );
}

#[test]
fn test_comparison_promotes_integer_operand() {
    let mut rt = Runtime::new();
    let f = compile(FunctionDef::new("f").params(&["a", "b"]).body(vec![Stmt::ret(
        Expr::binary(BinOp::Lt, Expr::sym("a"), Expr::sym("b")),
    )]));
    assert_eq!(
        call(&mut rt, &f, &[Item::Int(2), Item::Real(2.5)]),
        Item::Bool(true)
    );
    assert_eq!(
        call(&mut rt, &f, &[Item::Real(3.5), Item::Int(3)]),
        Item::Bool(false)
    );
}

#[test]
fn test_mismatched_scalar_equality_is_false_not_error() {
    let mut rt = Runtime::new();
    let f = compile(FunctionDef::new("f").params(&["a", "b"]).body(vec![Stmt::ret(
        Expr::binary(BinOp::Eq, Expr::sym("a"), Expr::sym("b")),
    )]));
    assert_eq!(
        call(&mut rt, &f, &[Item::Nil, Item::Int(0)]),
        Item::Bool(false)
    );
    assert_eq!(
        call(&mut rt, &f, &[Item::Bool(false), Item::Int(0)]),
        Item::Bool(false)
    );
    // promotion applies inside the numeric domain
    assert_eq!(
        call(&mut rt, &f, &[Item::Int(3), Item::Real(3.0)]),
        Item::Bool(true)
    );
}

#[test]
fn test_division_by_zero_is_catchable() {
    let mut rt = Runtime::new();
    let f = compile(FunctionDef::new("f").body(vec![
        Stmt::let_("out", Expr::nil()),
        Stmt::Try {
            body: vec![Stmt::Expr(Expr::binary(
                BinOp::Div,
                Expr::int(1),
                Expr::int(0),
            ))],
            catch_name: Name::from("e"),
            handler: vec![Stmt::Expr(Expr::assign_sym("out", Expr::str("caught")))],
        },
        Stmt::ret(Expr::sym("out")),
    ]));
    let result = call(&mut rt, &f, &[]);
    assert_eq!(rt.string_of(&result).as_deref(), Some("caught"));
}

// ═══════════════════════════════════════════════════════════════════════════
// Short-circuit evaluation through compiled trees
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_and_or_short_circuit_with_side_effects() {
    fn bump_b(rt: &mut Runtime, _this: Item, _args: &[Item]) -> Result<Item, Fault> {
        let n = rt.get_global("b_calls").and_then(|i| i.as_int()).unwrap_or(0);
        rt.set_global("b_calls", Item::Int(n + 1));
        Ok(Item::Bool(true))
    }
    fn bump_c(rt: &mut Runtime, _this: Item, _args: &[Item]) -> Result<Item, Fault> {
        let n = rt.get_global("c_calls").and_then(|i| i.as_int()).unwrap_or(0);
        rt.set_global("c_calls", Item::Int(n + 1));
        Ok(Item::Bool(true))
    }

    let mut rt = Runtime::new();
    rt.set_global("b_calls", Item::Int(0));
    rt.set_global("c_calls", Item::Int(0));
    rt.register_native("b", &[], bump_b);
    rt.register_native("c", &[], bump_c);

    // (a and b()) or c()
    let f = compile(FunctionDef::new("f").params(&["a"]).body(vec![Stmt::ret(
        Expr::or(
            Expr::and(Expr::sym("a"), Expr::call_sym("b", vec![])),
            Expr::call_sym("c", vec![]),
        ),
    )]));

    // a = false: b must never run, c runs once
    let result = call(&mut rt, &f, &[Item::Bool(false)]);
    assert_eq!(result, Item::Bool(true));
    assert_eq!(rt.get_global("b_calls"), Some(Item::Int(0)));
    assert_eq!(rt.get_global("c_calls"), Some(Item::Int(1)));

    // a = true: b runs, c must not
    let result = call(&mut rt, &f, &[Item::Bool(true)]);
    assert_eq!(result, Item::Bool(true));
    assert_eq!(rt.get_global("b_calls"), Some(Item::Int(1)));
    assert_eq!(rt.get_global("c_calls"), Some(Item::Int(1)));
}

#[test]
fn test_ternary_evaluates_single_branch() {
    let mut rt = Runtime::new();
    let f = compile(FunctionDef::new("f").params(&["flag"]).body(vec![Stmt::ret(
        Expr::ternary(Expr::sym("flag"), Expr::int(1), Expr::int(2)),
    )]));
    assert_eq!(call(&mut rt, &f, &[Item::Bool(true)]), Item::Int(1));
    assert_eq!(call(&mut rt, &f, &[Item::Bool(false)]), Item::Int(2));
}

// ═══════════════════════════════════════════════════════════════════════════
// Control flow and locals
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_while_loop_factorial() {
    let mut rt = Runtime::new();
    let f = compile(FunctionDef::new("fact").params(&["n"]).body(vec![
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
    ]));
    assert_eq!(call(&mut rt, &f, &[Item::Int(10)]), Item::Int(3_628_800));
}

#[test]
fn test_prefix_and_postfix_increment() {
    let mut rt = Runtime::new();
    // pre: returns the new value; post: returns the old one
    let pre = compile(FunctionDef::new("pre").params(&["x"]).body(vec![Stmt::ret(
        Expr::PreInc(Target::Sym(Name::from("x"))),
    )]));
    let post = compile(FunctionDef::new("post").params(&["x"]).body(vec![
        Stmt::let_("old", Expr::PostInc(Target::Sym(Name::from("x")))),
        Stmt::ret(Expr::Array(vec![Expr::sym("old"), Expr::sym("x")])),
    ]));

    assert_eq!(call(&mut rt, &pre, &[Item::Int(7)]), Item::Int(8));

    let pair = call(&mut rt, &post, &[Item::Int(7)]);
    let inst = pair.as_instance().cloned().unwrap_or_else(|| panic!("array"));
    let items = inst
        .token
        .data::<veld::classes::ArrayData>()
        .map(|d| d.items.clone())
        .unwrap_or_default();
    assert_eq!(items, vec![Item::Int(7), Item::Int(8)]);
}

#[test]
fn test_increment_on_real_and_instance_dispatch() {
    let mut rt = Runtime::new();
    let f = compile(FunctionDef::new("f").params(&["x"]).body(vec![Stmt::ret(
        Expr::PreInc(Target::Sym(Name::from("x"))),
    )]));
    assert_eq!(call(&mut rt, &f, &[Item::Real(1.5)]), Item::Real(2.5));

    // strings have no ++: the operand fault is catchable
    let g = compile(FunctionDef::new("g").params(&["x"]).body(vec![
        Stmt::let_("out", Expr::nil()),
        Stmt::Try {
            body: vec![Stmt::Expr(Expr::PreInc(Target::Sym(Name::from("x"))))],
            catch_name: Name::from("e"),
            handler: vec![Stmt::Expr(Expr::assign_sym("out", Expr::sym("e")))],
        },
        Stmt::ret(Expr::sym("out")),
    ]));
    let s = rt.new_string("abc");
    let caught = call(&mut rt, &g, &[s]);
    let text = rt.string_of(&caught).unwrap_or_default();
    assert!(text.contains("++"), "fault should name the operator: {text}");
}

#[test]
fn test_global_declaration_rebinds_to_module_table() {
    let mut rt = Runtime::new();
    rt.set_global("hits", Item::Int(0));
    // `hits` is also a parameter; the global declaration must win
    let f = compile(FunctionDef::new("f").params(&["hits"]).body(vec![
        Stmt::global(&["hits"]),
        Stmt::Expr(Expr::assign_sym("hits", Expr::int(99))),
        Stmt::ret(Expr::sym("hits")),
    ]));
    let result = call(&mut rt, &f, &[Item::Int(5)]);
    assert_eq!(result, Item::Int(99));
    assert_eq!(rt.get_global("hits"), Some(Item::Int(99)));
}

// ═══════════════════════════════════════════════════════════════════════════
// Calls, parameters, closures
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_parameter_mismatch_names_signature_and_preserves_caller() {
    let mut rt = Runtime::new();
    let pair = compile(
        FunctionDef::new("pair")
            .params(&["a", "b"])
            .body(vec![Stmt::ret(Expr::int(0))]),
    );
    rt.set_global("pair", pair);

    // the caller catches the parameter fault and keeps running with its
    // own locals intact
    let caller = compile(FunctionDef::new("caller").body(vec![
        Stmt::let_("sentinel", Expr::int(77)),
        Stmt::let_("msg", Expr::nil()),
        Stmt::Try {
            body: vec![Stmt::Expr(Expr::call_sym("pair", vec![Expr::int(1)]))],
            catch_name: Name::from("e"),
            handler: vec![Stmt::Expr(Expr::assign_sym("msg", Expr::sym("e")))],
        },
        Stmt::ret(Expr::Array(vec![Expr::sym("sentinel"), Expr::sym("msg")])),
    ]));

    let result = call(&mut rt, &caller, &[]);
    let inst = result.as_instance().cloned().unwrap_or_else(|| panic!("array"));
    let items = inst
        .token
        .data::<veld::classes::ArrayData>()
        .map(|d| d.items.clone())
        .unwrap_or_default();
    assert_eq!(items[0], Item::Int(77), "caller locals survived the fault");
    let msg = rt.string_of(&items[1]).unwrap_or_default();
    assert!(msg.contains("pair(a,b)"), "condition names the signature: {msg}");
}

#[test]
fn test_uncaught_parameter_fault_surfaces_to_host() {
    let mut rt = Runtime::new();
    let pair = compile(
        FunctionDef::new("pair")
            .params(&["a", "b"])
            .body(vec![Stmt::ret(Expr::int(0))]),
    );
    let err = rt.call_function(&pair, &[Item::Int(1)]);
    match err {
        Err(Fault::Param { signature }) => assert_eq!(signature, "pair(a,b)"),
        other => panic!("expected parameter fault, got {other:?}"),
    }
}

#[test]
fn test_interpreted_calls_nest_without_native_recursion() {
    // deep self-recursion through the code stack; native recursion would
    // overflow long before 50k frames
    let mut rt = Runtime::new();
    let f = compile(FunctionDef::new("down").params(&["n"]).body(vec![Stmt::ret(
        Expr::ternary(
            Expr::binary(BinOp::Gt, Expr::sym("n"), Expr::int(0)),
            Expr::call_sym(
                "down",
                vec![Expr::binary(BinOp::Sub, Expr::sym("n"), Expr::int(1))],
            ),
            Expr::int(0),
        ),
    )]));
    rt.set_global("down", f.clone());
    assert_eq!(call(&mut rt, &f, &[Item::Int(50_000)]), Item::Int(0));
}

#[test]
fn test_closure_captures_value_at_creation() {
    let mut rt = Runtime::new();
    let adder = FunctionDef::new("adder")
        .params(&["x"])
        .captures(&["base"])
        .body(vec![Stmt::ret(Expr::binary(
            BinOp::Add,
            Expr::sym("base"),
            Expr::sym("x"),
        ))])
        .compile()
        .unwrap_or_else(|e| panic!("{e}"));

    let maker = compile(FunctionDef::new("maker").params(&["base"]).body(vec![
        Stmt::let_("f", Expr::Closure(adder)),
        // mutating the local afterwards must not affect the closure
        Stmt::Expr(Expr::assign_sym("base", Expr::int(0))),
        Stmt::ret(Expr::sym("f")),
    ]));

    let closure = call(&mut rt, &maker, &[Item::Int(100)]);
    assert!(closure.is_callable());
    assert_eq!(call(&mut rt, &closure, &[Item::Int(7)]), Item::Int(107));
}

#[test]
fn test_raise_and_catch_user_condition() {
    let mut rt = Runtime::new();
    let f = compile(FunctionDef::new("f").body(vec![
        Stmt::let_("got", Expr::nil()),
        Stmt::Try {
            body: vec![Stmt::Raise(Expr::int(42))],
            catch_name: Name::from("e"),
            handler: vec![Stmt::Expr(Expr::assign_sym("got", Expr::sym("e")))],
        },
        Stmt::ret(Expr::sym("got")),
    ]));
    // the raised value arrives in the handler unchanged
    assert_eq!(call(&mut rt, &f, &[]), Item::Int(42));
}

#[test]
fn test_uncaught_raise_terminates_context() {
    let mut rt = Runtime::new();
    let f = compile(FunctionDef::new("f").body(vec![Stmt::Raise(Expr::int(7))]));
    match rt.call_function(&f, &[]) {
        Err(Fault::Raised(value)) => assert_eq!(value, Item::Int(7)),
        other => panic!("expected raised condition, got {other:?}"),
    }
}

#[test]
fn test_condition_crosses_call_frames_to_nearest_handler() {
    let mut rt = Runtime::new();
    let thrower = compile(FunctionDef::new("thrower").body(vec![Stmt::Raise(Expr::str(
        "boom",
    ))]));
    rt.set_global("thrower", thrower);

    let middle = compile(FunctionDef::new("middle").body(vec![
        Stmt::Expr(Expr::call_sym("thrower", vec![])),
        Stmt::ret(Expr::str("unreachable")),
    ]));
    rt.set_global("middle", middle);

    let outer = compile(FunctionDef::new("outer").body(vec![
        Stmt::let_("got", Expr::nil()),
        Stmt::Try {
            body: vec![Stmt::Expr(Expr::call_sym("middle", vec![]))],
            catch_name: Name::from("e"),
            handler: vec![Stmt::Expr(Expr::assign_sym("got", Expr::sym("e")))],
        },
        Stmt::ret(Expr::sym("got")),
    ]));

    let result = call(&mut rt, &outer, &[]);
    assert_eq!(rt.string_of(&result).as_deref(), Some("boom"));
}

#[test]
fn test_string_concat_through_add_step() {
    let mut rt = Runtime::new();
    let f = compile(FunctionDef::new("f").params(&["a", "b"]).body(vec![Stmt::ret(
        Expr::binary(BinOp::Add, Expr::sym("a"), Expr::sym("b")),
    )]));
    let a = rt.new_string("step");
    let b = rt.new_string("wise");
    let joined = call(&mut rt, &f, &[a, b]);
    assert_eq!(rt.string_of(&joined).as_deref(), Some("stepwise"));
}

#[test]
fn test_exact_equality_on_instances_is_identity() {
    let mut rt = Runtime::new();
    let f = compile(FunctionDef::new("f").params(&["a", "b"]).body(vec![Stmt::ret(
        Expr::binary(BinOp::ExactEq, Expr::sym("a"), Expr::sym("b")),
    )]));
    let s1 = rt.new_string("same");
    let s2 = rt.new_string("same");
    assert_eq!(
        call(&mut rt, &f, &[s1.clone(), s2]),
        Item::Bool(false),
        "distinct instances are not exactly equal"
    );
    assert_eq!(call(&mut rt, &f, &[s1.clone(), s1]), Item::Bool(true));
}
