use std::time::Duration;

use indexmap::IndexMap;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::config::ContextConfig;
use crate::context::Context;
use crate::error::{Error, ErrorKind};
use crate::value::{FunctionHandle, Value, MAX_SAFE_INTEGER};
use crate::ExecutionResult;

/// Generous, so only the tests that mean to time out do.
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn context() -> Context {
    Context::new(ContextConfig::default()).unwrap()
}

pub fn eval(ctx: &Context, source: &str) -> Value {
    match ctx.eval(source, TIMEOUT) {
        Ok(v) => v,
        Err(e) => panic!("eval of {:?} failed: {}", source, e),
    }
}

pub fn expect_kind(r: ExecutionResult, kind: ErrorKind) -> Error {
    match r {
        Ok(v) => panic!("expected {}, got {:?}", kind, v),
        Err(e) => {
            assert_eq!(e.kind(), kind, "unexpected error: {}", e);
            e
        }
    }
}

pub fn function(ctx: &Context, source: &str) -> FunctionHandle {
    match eval(ctx, source) {
        Value::Function(f) => f,
        v => panic!("{:?} evaluated to {:?}, not a function", source, v),
    }
}

/// `x => x`, for round trips.
pub fn identity(ctx: &Context) -> FunctionHandle {
    function(ctx, "(x) => x")
}

fn random_string<R: Rng>(rng: &mut R) -> String {
    let len = rng.gen_range(0..12);
    let mut s: String = (0..len).map(|_| rng.sample(Alphanumeric) as char).collect();
    if rng.gen_bool(0.2) {
        s.push_str("é☃😀");
    }
    s
}

/// A random JSON-shaped value, as the engine would hand it back.
pub fn random_value<R: Rng>(rng: &mut R, depth: usize) -> Value {
    let pick = if depth == 0 { rng.gen_range(0..5) } else { rng.gen_range(0..7) };
    match pick {
        0 => Value::Null,
        1 => Value::Bool(rng.gen()),
        2 => Value::Int(rng.gen_range(-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER)),
        // Never integral, so it stays a double.
        3 => Value::Double(rng.gen_range(-1_000_000i64..1_000_000) as f64 + 0.25),
        4 => Value::String(random_string(rng)),
        5 => {
            let len = rng.gen_range(0..5);
            Value::Array((0..len).map(|_| random_value(rng, depth - 1)).collect())
        }
        _ => {
            let len = rng.gen_range(0..5);
            let mut props = IndexMap::new();
            for _ in 0..len {
                props.insert(random_string(rng), random_value(rng, depth - 1));
            }
            Value::Object(props)
        }
    }
}
