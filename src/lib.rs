//! An execution bridge to an embedded JavaScript engine (V8).
//!
//! The host creates isolated contexts, evaluates source text and calls engine functions in them,
//! and gets back plain `Value`s or a structured `Error`. Every call can carry a timeout, after
//! which the script is terminated and the context stays usable.
//!
//! ```no_run
//! use jsbridge::{ContextConfig, Value};
//!
//! let ctx = jsbridge::create_context(ContextConfig::default())?;
//! assert_eq!(jsbridge::eval(&ctx, "1 + 1", 1000)?, Value::Int(2));
//!
//! let add = jsbridge::eval(&ctx, "(a, b) => a + b", 1000)?;
//! let add = add.as_function().expect("a function");
//! assert_eq!(jsbridge::call(&ctx, add, &[2.into(), 3.into()], 1000)?, Value::Int(5));
//!
//! jsbridge::destroy_context(&ctx)?;
//! # Ok::<(), jsbridge::Error>(())
//! ```
//!
//! The engine platform comes up on first use and is torn down only by an explicit `shutdown`,
//! which refuses while any context is alive.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod snapshot;
pub mod value;
mod watchdog;

use std::time::Duration;

pub use crate::config::{ContextConfig, PlatformConfig};
pub use crate::context::{Context, ContextId};
pub use crate::engine::HeapStats;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::snapshot::Snapshot;
pub use crate::value::{FunctionHandle, ScriptException, Value};

/// What a script evaluation or function call produced.
pub type ExecutionResult = Result<Value>;

/// Sets platform options. Must happen before the first context or `ensure_initialized`.
pub fn configure(config: PlatformConfig) -> Result<()> {
    lifecycle::engine().configure(config)
}

pub fn ensure_initialized() -> Result<()> {
    lifecycle::engine().ensure_initialized()
}

/// Disposes the engine platform for the rest of the process.
pub fn shutdown() -> Result<()> {
    lifecycle::engine().shutdown()
}

pub fn engine_version() -> String {
    engine::engine_version()
}

pub fn create_context(config: ContextConfig) -> Result<Context> {
    Context::new(config)
}

pub fn destroy_context(ctx: &Context) -> Result<()> {
    ctx.destroy()
}

/// Evaluates `source` in `ctx`. A `timeout_ms` of zero means no limit.
pub fn eval(ctx: &Context, source: &str, timeout_ms: u64) -> ExecutionResult {
    ctx.eval(source, Duration::from_millis(timeout_ms))
}

/// Calls `function` in `ctx`. A `timeout_ms` of zero means no limit.
pub fn call(ctx: &Context, function: &FunctionHandle, args: &[Value], timeout_ms: u64) -> ExecutionResult {
    ctx.call(function, args, Duration::from_millis(timeout_ms))
}
