//! Tests against a live V8. None of these may shut the process-wide engine down.

use std::thread;
use std::time::{Duration, Instant};

use futures::executor::block_on;
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;

use crate::config::ContextConfig;
use crate::context::Context;
use crate::error::ErrorKind;
use crate::value::{ScriptException, Value};

use super::marshal::{MAX_DEPTH, MAX_ELEMENTS};
use super::testlib::{self, context, eval, expect_kind, function, identity, TIMEOUT};

#[test]
fn one_plus_one() {
    let ctx = context();
    assert_eq!(ctx.eval("1+1", Duration::from_millis(1000)).unwrap(), Value::Int(2));
    assert_eq!(crate::eval(&ctx, "1+1", 1000).unwrap(), Value::Int(2));
}

#[test]
fn runaway_script_times_out_and_context_survives() {
    let ctx = context();
    let start = Instant::now();
    let e = expect_kind(ctx.eval("while(true){}", Duration::from_millis(50)), ErrorKind::Timeout);
    assert!(start.elapsed() < Duration::from_millis(500), "took {:?}", start.elapsed());
    assert!(e.message().contains("50 ms"));

    assert_eq!(ctx.eval("1+1", Duration::from_millis(1000)).unwrap(), Value::Int(2));
}

#[test]
fn runaway_call_times_out() {
    let ctx = context();
    let spin = function(&ctx, "(function spin() { for (;;) {} })");
    expect_kind(ctx.call(&spin, &[], Duration::from_millis(50)), ErrorKind::Timeout);
    assert_eq!(eval(&ctx, "'still here'"), Value::from("still here"));
}

#[test]
fn partial_effects_survive_a_timeout() {
    let ctx = context();
    expect_kind(ctx.eval("globalThis.n = 0; while(true) { n++ }", Duration::from_millis(30)), ErrorKind::Timeout);
    match eval(&ctx, "n") {
        Value::Int(n) => assert!(n > 0),
        v => panic!("expected a count, got {:?}", v),
    }
}

#[test]
fn thrown_error_is_script_error() {
    let ctx = context();
    let e = expect_kind(ctx.eval("throw new Error('x')", TIMEOUT), ErrorKind::ScriptError);
    assert!(e.message().contains('x'));
    assert!(e.stack().is_some());

    let e = expect_kind(ctx.eval("throw 'plain'", TIMEOUT), ErrorKind::ScriptError);
    assert!(e.message().contains("plain"));
}

#[test]
fn compile_errors_are_script_errors() {
    let ctx = context();
    let e = expect_kind(ctx.eval("function (", TIMEOUT), ErrorKind::ScriptError);
    assert!(e.message().contains("SyntaxError"), "{}", e);
}

#[test]
fn handles_die_with_their_context() {
    let ctx = context();
    let f = identity(&ctx);
    assert!(f.is_alive());

    crate::destroy_context(&ctx).unwrap();
    assert!(!f.is_alive());
    expect_kind(ctx.call(&f, &[Value::Int(1)], TIMEOUT), ErrorKind::ContextDestroyed);
    expect_kind(ctx.eval("1", TIMEOUT), ErrorKind::ContextDestroyed);
    assert_eq!(ctx.heap_stats().unwrap_err().kind(), ErrorKind::ContextDestroyed);
}

#[test]
fn destroying_twice_is_double_free() {
    let ctx = context();
    let clone = ctx.clone();
    ctx.destroy().unwrap();
    assert_eq!(clone.destroy().unwrap_err().kind(), ErrorKind::DoubleFree);
}

#[test]
fn dropping_the_last_clone_destroys() {
    let ctx = context();
    let f = identity(&ctx);
    let clone = ctx.clone();
    drop(ctx);
    assert!(f.is_alive());
    drop(clone);
    assert!(!f.is_alive());
}

#[test]
fn destroy_aborts_a_job_in_flight() {
    let ctx = context();
    let ctx2 = ctx.clone();
    let t = thread::spawn(move || ctx2.eval("while(true){}", Duration::ZERO));

    thread::sleep(Duration::from_millis(50));
    ctx.destroy().unwrap();
    expect_kind(t.join().unwrap(), ErrorKind::ContextDestroyed);
}

#[test]
fn shutdown_refuses_while_a_context_lives() {
    let ctx = context();
    assert_eq!(crate::shutdown().unwrap_err().kind(), ErrorKind::ContextsStillAlive);
    // Still fully usable.
    assert_eq!(eval(&ctx, "2*3"), Value::Int(6));
}

#[test]
fn concurrent_initialization() {
    let threads: Vec<_> = (0..8).map(|_| thread::spawn(crate::ensure_initialized)).collect();
    for t in threads {
        t.join().unwrap().unwrap();
    }
    assert!(!crate::engine_version().is_empty());
}

#[test]
fn configure_after_init_fails() {
    crate::ensure_initialized().unwrap();
    let e = crate::configure(crate::PlatformConfig::default()).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InitializationFailed);
}

#[test]
fn random_values_round_trip() {
    let ctx = context();
    let id = identity(&ctx);
    let mut rng = StdRng::seed_from_u64(0x6a73);

    for _ in 0..200 {
        let v = testlib::random_value(&mut rng, 4);
        assert_eq!(ctx.call(&id, &[v.clone()], TIMEOUT).unwrap(), v);
    }
}

#[test]
fn numbers_follow_the_folding_rule() {
    let ctx = context();
    assert_eq!(eval(&ctx, "1e3"), Value::Int(1000));
    assert_eq!(eval(&ctx, "0.5"), Value::Double(0.5));
    assert_eq!(eval(&ctx, "2**53"), Value::Double(9007199254740992.0));
    assert_eq!(eval(&ctx, "-(2**53 - 1)"), Value::Int(-9007199254740991));
    assert_eq!(eval(&ctx, "Infinity"), Value::Double(f64::INFINITY));
    match eval(&ctx, "-0") {
        Value::Double(d) => assert!(d == 0.0 && d.is_sign_negative()),
        v => panic!("expected -0, got {:?}", v),
    }
    match eval(&ctx, "NaN") {
        Value::Double(d) => assert!(d.is_nan()),
        v => panic!("expected NaN, got {:?}", v),
    }

    // Integral doubles come back as integers.
    let id = identity(&ctx);
    assert_eq!(ctx.call(&id, &[Value::Double(3.0)], TIMEOUT).unwrap(), Value::Int(3));
}

#[test]
fn large_integers_travel_as_bigints() {
    let ctx = context();
    let typeof_ = function(&ctx, "(x) => typeof x");
    assert_eq!(ctx.call(&typeof_, &[Value::Int(i64::MAX)], TIMEOUT).unwrap(), Value::from("bigint"));
    assert_eq!(ctx.call(&typeof_, &[Value::Int(42)], TIMEOUT).unwrap(), Value::from("number"));

    let id = identity(&ctx);
    assert_eq!(ctx.call(&id, &[Value::Int(i64::MIN)], TIMEOUT).unwrap(), Value::Int(i64::MIN));
    assert_eq!(eval(&ctx, "10n"), Value::Int(10));
    expect_kind(ctx.eval("2n ** 64n", TIMEOUT), ErrorKind::UnsupportedType);
}

#[test]
fn undefined_is_null() {
    let ctx = context();
    assert_eq!(eval(&ctx, "undefined"), Value::Null);
    assert_eq!(eval(&ctx, "[undefined, null]"), Value::Array(vec![Value::Null, Value::Null]));
}

#[test]
fn unrepresentable_values_are_refused() {
    let ctx = context();
    expect_kind(ctx.eval("Symbol('s')", TIMEOUT), ErrorKind::UnsupportedType);
    expect_kind(ctx.eval("Promise.resolve(1)", TIMEOUT), ErrorKind::UnsupportedType);
    expect_kind(ctx.eval("var a = {}; a.self = a; a", TIMEOUT), ErrorKind::UnsupportedType);
    expect_kind(ctx.eval("var b = []; b.push(b); b", TIMEOUT), ErrorKind::UnsupportedType);
    // The context is unharmed.
    assert_eq!(eval(&ctx, "1"), Value::Int(1));
}

#[test]
fn shared_references_are_not_cycles() {
    let ctx = context();
    let o = Value::Object(IndexMap::new());
    assert_eq!(eval(&ctx, "var o = {}; [o, o]"), Value::Array(vec![o.clone(), o]));
}

fn nested(levels: usize) -> Value {
    let mut v = Value::Null;
    for _ in 0..levels {
        v = Value::Array(vec![v]);
    }
    v
}

fn nested_source(levels: usize) -> String {
    format!("var d = null; for (let i = 0; i < {}; i++) d = [d]; d", levels)
}

#[test]
fn nesting_limit_is_the_same_both_ways() {
    let ctx = context();
    let id = identity(&ctx);

    assert_eq!(eval(&ctx, &nested_source(MAX_DEPTH)), nested(MAX_DEPTH));
    assert_eq!(ctx.call(&id, &[nested(MAX_DEPTH)], TIMEOUT).unwrap(), nested(MAX_DEPTH));

    expect_kind(ctx.eval(&nested_source(MAX_DEPTH + 1), TIMEOUT), ErrorKind::UnsupportedType);
    expect_kind(ctx.call(&id, &[nested(MAX_DEPTH + 1)], TIMEOUT), ErrorKind::UnsupportedType);
    assert_eq!(eval(&ctx, "1"), Value::Int(1));
}

#[test]
fn oversized_values_are_refused() {
    let ctx = context();
    expect_kind(ctx.eval("new Array(2**32 - 1)", TIMEOUT), ErrorKind::UnsupportedType);
    expect_kind(ctx.eval("new Array(1e7)", TIMEOUT), ErrorKind::UnsupportedType);
    // The budget covers the whole value, not each array.
    expect_kind(ctx.eval(&format!("new Array(2).fill(new Array({}))", MAX_ELEMENTS / 2), TIMEOUT),
        ErrorKind::UnsupportedType);
    assert_eq!(eval(&ctx, "new Array(3).length"), Value::Int(3));
    assert_eq!(eval(&ctx, "new Array(2)"), Value::Array(vec![Value::Null, Value::Null]));
}

#[test]
fn dates_are_milliseconds() {
    let ctx = context();
    assert_eq!(eval(&ctx, "new Date(1500)"), Value::Int(1500));
}

#[test]
fn error_objects_become_values() {
    let ctx = context();
    match eval(&ctx, "new TypeError('bad')") {
        Value::Error(e) => {
            assert_eq!(e.name, "TypeError");
            assert_eq!(e.message, "bad");
            assert!(e.stack.is_some());
        }
        v => panic!("expected an error, got {:?}", v),
    }

    let id = identity(&ctx);
    match ctx.call(&id, &[Value::Error(ScriptException::new("RangeError", "r"))], TIMEOUT).unwrap() {
        Value::Error(e) => {
            assert_eq!(e.name, "RangeError");
            assert_eq!(e.message, "r");
        }
        v => panic!("expected an error, got {:?}", v),
    }
}

#[test]
fn methods_keep_their_receiver() {
    let ctx = context();
    let obj = eval(&ctx, "({n: 41, inc() { return this.n + 1 }})");
    let inc = match obj {
        Value::Object(ref props) => props["inc"].as_function().unwrap().clone(),
        ref v => panic!("expected an object, got {:?}", v),
    };
    assert_eq!(ctx.call(&inc, &[], TIMEOUT).unwrap(), Value::Int(42));
}

#[test]
fn functions_can_be_passed_back_in() {
    let ctx = context();
    let apply = function(&ctx, "(f, x) => f(x)");
    let double = function(&ctx, "(x) => x * 2");
    assert_eq!(ctx.call(&apply, &[double.into(), 21.into()], TIMEOUT).unwrap(), Value::Int(42));
}

#[test]
fn call_named_resolves_dotted_paths() {
    let ctx = context();
    let arg = Value::from(json!({"a": 1}));
    assert_eq!(ctx.call_named("JSON.stringify", &[arg], TIMEOUT).unwrap(), Value::from(r#"{"a":1}"#));
    assert_eq!(ctx.call_named("Math.max", &[1.into(), 7.into(), 3.into()], TIMEOUT).unwrap(), Value::Int(7));

    eval(&ctx, "globalThis.counter = { n: 1, bump() { return ++this.n } }");
    assert_eq!(ctx.call_named("counter.bump", &[], TIMEOUT).unwrap(), Value::Int(2));

    expect_kind(ctx.call_named("Math.PI", &[], TIMEOUT), ErrorKind::InvalidHandle);
    expect_kind(ctx.call_named("no.such.thing", &[], TIMEOUT), ErrorKind::InvalidHandle);
    expect_kind(ctx.call_named("", &[], TIMEOUT), ErrorKind::InvalidHandle);
}

#[test]
fn handles_are_bound_to_their_context() {
    let a = context();
    let b = context();
    let f = identity(&a);

    expect_kind(b.call(&f, &[], TIMEOUT), ErrorKind::InvalidHandle);
    let id_b = identity(&b);
    expect_kind(b.call(&id_b, &[Value::Function(f.clone())], TIMEOUT), ErrorKind::InvalidHandle);
    assert_eq!(a.call(&f, &[1.into()], TIMEOUT).unwrap(), Value::Int(1));
}

#[test]
fn reading_a_function_again_reuses_its_handle() {
    let ctx = context();
    eval(&ctx, "globalThis.counter = { n: 0, bump() { return ++this.n } }");
    let bump = |v: Value| match v {
        Value::Object(ref props) => props["bump"].as_function().unwrap().clone(),
        v => panic!("expected an object, got {:?}", v),
    };

    let first = bump(eval(&ctx, "counter"));
    let second = bump(eval(&ctx, "counter"));
    assert_eq!(first, second);
    assert_eq!(function(&ctx, "Math.max"), function(&ctx, "Math.max"));

    // Without the receiver it's a different handle.
    let unbound = function(&ctx, "counter.bump");
    assert_ne!(unbound, first);

    ctx.release(&first).unwrap();
    expect_kind(ctx.call(&second, &[], TIMEOUT), ErrorKind::InvalidHandle);
    let third = bump(eval(&ctx, "counter"));
    assert_eq!(ctx.call(&third, &[], TIMEOUT).unwrap(), Value::Int(1));
}

#[test]
fn released_handles_are_invalid() {
    let ctx = context();
    let f = identity(&ctx);
    ctx.release(&f).unwrap();
    expect_kind(ctx.call(&f, &[], TIMEOUT), ErrorKind::InvalidHandle);
}

#[test]
fn contexts_are_isolated() {
    let a = context();
    let b = context();
    eval(&a, "globalThis.secret = 1");
    assert_eq!(eval(&b, "typeof secret"), Value::from("undefined"));
}

#[test]
fn contexts_run_concurrently() {
    let threads: Vec<_> = (0..4).map(|i| {
        thread::spawn(move || {
            let ctx = context();
            let r = eval(&ctx, &format!("let s = 0; for (let j = 0; j <= {}; j++) s += j; s", i * 100));
            ctx.destroy().unwrap();
            r
        })
    }).collect();

    for (i, t) in threads.into_iter().enumerate() {
        let n = (i * 100) as i64;
        assert_eq!(t.join().unwrap(), Value::Int(n * (n + 1) / 2));
    }
}

#[test]
fn calls_into_one_context_are_serialized() {
    let ctx = context();
    eval(&ctx, "globalThis.log = []");

    let threads: Vec<_> = (0..4).map(|i| {
        let ctx = ctx.clone();
        thread::spawn(move || {
            let src = format!("log.push({}); for (let k = 0; k < 1e5; k++) {{}} log.push({}); 0", i, i);
            ctx.eval(&src, TIMEOUT).unwrap();
        })
    }).collect();
    for t in threads {
        t.join().unwrap();
    }

    // Each job's pair of pushes is adjacent.
    match eval(&ctx, "log") {
        Value::Array(items) => {
            assert_eq!(items.len(), 8);
            for pair in items.chunks(2) {
                assert_eq!(pair[0], pair[1]);
            }
        }
        v => panic!("expected an array, got {:?}", v),
    }
}

#[test]
fn async_api() {
    let ctx = context();
    assert_eq!(block_on(ctx.eval_async("6*7", TIMEOUT)).unwrap(), Value::Int(42));
    let neg = function(&ctx, "(x) => -x");
    assert_eq!(block_on(ctx.call_async(&neg, &[5.into()], TIMEOUT)).unwrap(), Value::Int(-5));
}

#[test]
fn heap_exhaustion_is_fatal() {
    let ctx = Context::new(ContextConfig::default().with_heap_size_limit(16 << 20)).unwrap();
    let e = expect_kind(ctx.eval("let a = []; while (true) a.push(new Array(1e5).fill(1.5))", TIMEOUT),
        ErrorKind::EngineFatal);
    assert!(!e.kind().is_recoverable());
    expect_kind(ctx.eval("1", TIMEOUT), ErrorKind::EngineFatal);
    ctx.destroy().unwrap();
}

#[test]
fn fatal_errors_stay_in_their_context() {
    let bystander = context();
    eval(&bystander, "globalThis.kept = 7");

    let ctx = Context::new(ContextConfig::default().with_heap_size_limit(16 << 20)).unwrap();
    expect_kind(ctx.eval("let a = []; while (true) a.push(new Array(1e5).fill(1.5))", TIMEOUT),
        ErrorKind::EngineFatal);

    assert_eq!(eval(&bystander, "1+1"), Value::Int(2));
    assert_eq!(eval(&bystander, "kept"), Value::Int(7));
    ctx.destroy().unwrap();
    assert_eq!(eval(&bystander, "kept"), Value::Int(7));
}

#[test]
fn heap_stats_and_gc_hint() {
    let ctx = Context::new(ContextConfig::default().with_heap_size_limit(64 << 20)).unwrap();
    let stats = ctx.heap_stats().unwrap();
    assert!(stats.used_heap_size > 0);
    assert!(stats.total_heap_size >= stats.used_heap_size);
    assert!(stats.heap_size_limit >= 32 << 20);
    ctx.low_memory_notification().unwrap();
    assert_eq!(eval(&ctx, "1"), Value::Int(1));
}

#[test]
fn snapshots_seed_new_contexts() {
    let ctx = Context::new(ContextConfig::default().with_snapshot_enabled(true)).unwrap();
    eval(&ctx, "globalThis.answer = 42; function greet(n) { return 'hi ' + n }");
    let snapshot = ctx.snapshot().unwrap();
    assert_eq!(snapshot.engine_version(), crate::engine_version());
    assert!(!ctx.is_alive());
    expect_kind(ctx.eval("1", TIMEOUT), ErrorKind::ContextDestroyed);

    let bytes = snapshot.to_bytes();
    let restored = crate::Snapshot::from_bytes(&bytes).unwrap();

    let seeded = Context::new(ContextConfig::default().with_startup_snapshot(restored)).unwrap();
    assert_eq!(eval(&seeded, "answer"), Value::Int(42));
    assert_eq!(seeded.call_named("greet", &["you".into()], TIMEOUT).unwrap(), Value::from("hi you"));
}

#[test]
fn snapshot_contexts_can_be_discarded() {
    let ctx = Context::new(ContextConfig::default().with_snapshot_enabled(true)).unwrap();
    eval(&ctx, "globalThis.f = () => 1");
    let _f = function(&ctx, "f");
    ctx.destroy().unwrap();

    // Dropped without a destroy.
    let dropped = Context::new(ContextConfig::default().with_snapshot_enabled(true)).unwrap();
    eval(&dropped, "globalThis.x = 1");
    drop(dropped);

    let fatal = Context::new(ContextConfig::default().with_snapshot_enabled(true).with_heap_size_limit(16 << 20))
        .unwrap();
    expect_kind(fatal.eval("let a = []; while (true) a.push(new Array(1e5).fill(1.5))", TIMEOUT),
        ErrorKind::EngineFatal);
    fatal.destroy().unwrap();

    let next = context();
    assert_eq!(eval(&next, "1+1"), Value::Int(2));
}

#[test]
fn snapshot_requires_opt_in() {
    let ctx = context();
    assert_eq!(ctx.snapshot().unwrap_err().kind(), ErrorKind::SnapshotFailed);
    assert_eq!(eval(&ctx, "1"), Value::Int(1));
}

#[test]
fn foreign_snapshots_are_refused() {
    let foreign = crate::Snapshot::new("0.0.0-not-v8", b"not a heap");
    let e = Context::new(ContextConfig::default().with_startup_snapshot(foreign)).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::SnapshotFailed);
}
