//! Running one unit of host-requested work inside an entered context, and classifying how it ended.

use std::sync::Arc;

use crate::context::Liveness;
use crate::error::{Error, ErrorKind, Result};
use crate::value::Value;

use super::marshal::{self, Registry};

/// Work submitted by the host.
#[derive(Debug)]
pub enum Job {
    Eval(String),
    Call {
        function: u32,
        args: Vec<Value>,
    },
    /// Call a function found by a dotted path from the global object, e.g. `"JSON.stringify"`.
    CallNamed {
        path: String,
        args: Vec<Value>,
    },
}

impl Job {
    pub fn describe(&self) -> &str {
        match *self {
            Job::Eval(_) => "eval",
            Job::Call { .. } => "call",
            Job::CallNamed { ref path, .. } => path,
        }
    }
}

/// How the engine left a job, before timeouts and heap exhaustion are accounted for.
#[derive(Debug)]
pub enum Outcome {
    Completed(Value),
    /// The script threw. Always a `ScriptError`.
    Threw(Error),
    /// Execution was terminated from outside.
    Terminated,
    /// Rejected on the host side, e.g. by marshalling, before or after the engine ran.
    Failed(Error),
}

/// Runs `job`. The caller owns the scopes; `tc` must be inside the context.
pub fn run(tc: &mut v8::TryCatch<v8::HandleScope>, job: Job, registry: &mut Registry, owner: &Arc<Liveness>) -> Outcome {
    let result = match job {
        Job::Eval(ref source) => eval(tc, source),
        Job::Call { function, ref args } => {
            registry.get(tc, function).and_then(|(f, recv)| call(tc, f, recv, args, registry, owner))
        }
        Job::CallNamed { ref path, ref args } => {
            resolve_path(tc, path).and_then(|(f, recv)| call(tc, f, recv, args, registry, owner))
        }
    };

    let returned = match result {
        Err(e) => {
            return if tc.has_terminated() { Outcome::Terminated } else { Outcome::Failed(e) };
        }
        Ok(r) => r,
    };

    match returned {
        Some(v) => match marshal::from_engine(tc, v, registry, owner) {
            Ok(v) => Outcome::Completed(v),
            Err(_) if tc.has_terminated() => Outcome::Terminated,
            Err(e) => Outcome::Failed(e),
        },
        None if tc.has_terminated() => Outcome::Terminated,
        None => match tc.exception() {
            Some(exception) => Outcome::Threw(thrown(tc, exception)),
            None => Outcome::Failed(Error::fatal("engine returned neither a value nor an exception")),
        },
    }
}

fn eval<'s>(scope: &mut v8::HandleScope<'s>, source: &str) -> Result<Option<v8::Local<'s, v8::Value>>> {
    let code = v8::String::new(scope, source)
        .ok_or_else(|| Error::unsupported(format!("script of {} bytes exceeds the engine's limit", source.len())))?;

    // Compile errors surface as a caught SyntaxError, same as a throw.
    Ok(v8::Script::compile(scope, code, None).and_then(|script| script.run(scope)))
}

fn call<'s>(scope: &mut v8::HandleScope<'s>, function: v8::Local<'s, v8::Function>, receiver: v8::Local<'s, v8::Value>,
            args: &[Value], registry: &mut Registry, owner: &Arc<Liveness>) -> Result<Option<v8::Local<'s, v8::Value>>> {
    let mut argv = Vec::with_capacity(args.len());
    for arg in args {
        argv.push(marshal::to_engine(scope, arg, registry, owner.id())?);
    }

    Ok(function.call(scope, receiver, &argv))
}

/// Finds `a.b.c` starting from the global object. The function's receiver is its owner.
fn resolve_path<'s>(scope: &mut v8::HandleScope<'s>, path: &str)
    -> Result<(v8::Local<'s, v8::Function>, v8::Local<'s, v8::Value>)> {
    let context = scope.get_current_context();
    let mut owner: v8::Local<v8::Value> = context.global(scope).into();
    let mut current = owner;

    for segment in path.split('.') {
        if segment.is_empty() {
            return Err(Error::new(ErrorKind::InvalidHandle, format!("malformed function path {:?}", path)));
        }

        let obj = v8::Local::<v8::Object>::try_from(current)
            .map_err(|_| Error::new(ErrorKind::InvalidHandle, format!("{:?}: {} is not an object", path, segment)))?;
        let key = v8::String::new(scope, segment)
            .ok_or_else(|| Error::unsupported(format!("path segment {:?} is too long", segment)))?;
        // A throwing getter leaves `None` and a caught exception.
        let next = obj.get(scope, key.into())
            .ok_or_else(|| Error::script(format!("reading {:?} threw", segment), None))?;

        owner = current;
        current = next;
    }

    let function = v8::Local::<v8::Function>::try_from(current)
        .map_err(|_| Error::new(ErrorKind::InvalidHandle, format!("{:?} is not a function", path)))?;
    Ok((function, owner))
}

/// Converts a caught exception into a `ScriptError`.
pub fn thrown(scope: &mut v8::HandleScope, exception: v8::Local<v8::Value>) -> Error {
    if exception.is_native_error() {
        if let Ok(obj) = v8::Local::<v8::Object>::try_from(exception) {
            let e = marshal::exception_of(scope, obj);
            return Error::script(e.to_string(), e.stack);
        }
    }

    Error::script(format!("Uncaught {}", marshal::describe(scope, exception)), None)
}

/// Applies what happened outside the engine to an outcome: whether the watchdog fired, and
/// whether the heap ran out. Returns the result and, if the context is now unusable, why.
pub fn settle(outcome: Outcome, timed_out: bool, heap_exhausted: bool, timeout_ms: u128) -> (Result<Value>, Option<String>) {
    if heap_exhausted {
        let reason = "heap limit reached".to_owned();
        return (Err(Error::fatal(format!("{}; the context must be destroyed", reason))), Some(reason));
    }

    match outcome {
        Outcome::Completed(v) => (Ok(v), None),
        Outcome::Threw(e) | Outcome::Failed(e) => (Err(e), None),
        Outcome::Terminated if timed_out => {
            (Err(Error::new(ErrorKind::Timeout, format!("execution exceeded {} ms", timeout_ms))), None)
        }
        Outcome::Terminated => (Err(Error::new(ErrorKind::Timeout, "execution was terminated")), None),
    }
}
