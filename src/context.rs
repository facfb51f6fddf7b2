//! Host-side handles to engine contexts.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use futures::channel::oneshot;
use futures::executor::block_on;
use parking_lot::Mutex;

use crate::config::ContextConfig;
use crate::engine::{self, Command, HeapStats, Job, Terminate};
use crate::error::{Error, ErrorKind, Result};
use crate::lifecycle::{self, ContextPermit};
use crate::snapshot::Snapshot;
use crate::value::{FunctionHandle, Value};
use crate::ExecutionResult;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique context identity. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Whether a context is still alive. Shared with every handle the context gave out.
#[derive(Debug)]
pub struct Liveness {
    id: ContextId,
    alive: AtomicBool,
}

impl Liveness {
    fn new(id: ContextId) -> Self {
        Liveness {
            id: id,
            alive: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Marks the context dead. Only the first caller gets `true`.
    fn kill(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }
}

struct Inner {
    liveness: Arc<Liveness>,
    snapshot_enabled: bool,
    commands: Mutex<Option<Sender<Command>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    isolate: v8::IsolateHandle,
    // Last to go: the engine may shut down once this drops.
    permit: Mutex<Option<ContextPermit>>,
}

impl Inner {
    /// Stops the worker and waits for its isolate to be disposed.
    ///
    /// Fails with `EngineFatal` if the worker panicked on the way out. The context is gone either way.
    fn teardown(&self) -> Result<()> {
        // Closing the queue ends the worker loop; terminating unblocks a job in flight.
        drop(self.commands.lock().take());
        self.isolate.terminate();

        let mut r = Ok(());
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::error!(context = %self.liveness.id(), "context thread panicked");
                r = Err(Error::fatal(format!("context {} thread panicked while shutting down", self.liveness.id())));
            }
        }

        drop(self.permit.lock().take());
        tracing::debug!(context = %self.liveness.id(), "context destroyed");
        r
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.liveness.kill() {
            let _ = self.teardown();
        }
    }
}

/// An isolated engine context with its own global scope and heap.
///
/// Clones share the same context. Calls are serialized: each runs to completion, or to its
/// timeout, before the next one starts. The context goes away on `destroy`, or when the last
/// clone is dropped.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Context {
    /// Creates a context, bringing the engine up first if needed.
    pub fn new(config: ContextConfig) -> Result<Context> {
        let permit = lifecycle::engine().acquire()?;
        let id = ContextId::next();
        let liveness = Arc::new(Liveness::new(id));

        let startup_snapshot = permit.startup_snapshot().cloned();
        let worker = engine::spawn(id, &config, startup_snapshot, liveness.clone())?;

        tracing::debug!(context = %id, "context created");

        Ok(Context {
            inner: Arc::new(Inner {
                liveness: liveness,
                snapshot_enabled: config.enable_snapshot,
                commands: Mutex::new(Some(worker.commands)),
                thread: Mutex::new(Some(worker.thread)),
                isolate: worker.isolate,
                permit: Mutex::new(Some(permit)),
            }),
        })
    }

    pub fn id(&self) -> ContextId {
        self.inner.liveness.id()
    }

    pub fn is_alive(&self) -> bool {
        self.inner.liveness.is_alive()
    }

    /// Destroys the context, aborting any job in flight. Handles from it stop working.
    pub fn destroy(&self) -> Result<()> {
        if !self.inner.liveness.kill() {
            return Err(Error::new(ErrorKind::DoubleFree, format!("context {} was already destroyed", self.id())));
        }
        self.inner.teardown()
    }

    fn send(&self, command: Command) -> Result<()> {
        if !self.is_alive() {
            return Err(self.destroyed());
        }

        let commands = self.inner.commands.lock();
        match *commands {
            Some(ref tx) => tx.send(command)
                .map_err(|_| Error::fatal(format!("context {} thread has exited", self.id()))),
            None => Err(self.destroyed()),
        }
    }

    fn request<T, F>(&self, make: F) -> Result<oneshot::Receiver<Result<T>>>
        where F: FnOnce(oneshot::Sender<Result<T>>) -> Command {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        Ok(rx)
    }

    fn destroyed(&self) -> Error {
        Error::new(ErrorKind::ContextDestroyed, format!("context {} has been destroyed", self.id()))
    }

    async fn execute(&self, job: Job, timeout: Duration) -> ExecutionResult {
        let rx = self.request(|reply| Command::Execute {
            job: job,
            timeout: timeout,
            reply: reply,
        })?;

        match rx.await {
            Ok(r) => r,
            // The worker dropped the reply: destroyed while queued, or gone.
            Err(_) if !self.is_alive() => Err(self.destroyed()),
            Err(_) => Err(Error::fatal(format!("context {} stopped before replying", self.id()))),
        }
    }

    fn check_args(&self, args: &[Value]) -> Result<()> {
        fn check(id: ContextId, v: &Value) -> Result<()> {
            match *v {
                Value::Function(ref f) => f.check_owner(id),
                Value::Array(ref items) => items.iter().try_for_each(|v| check(id, v)),
                Value::Object(ref props) => props.values().try_for_each(|v| check(id, v)),
                _ => Ok(()),
            }
        }

        args.iter().try_for_each(|v| check(self.id(), v))
    }

    /// Evaluates `source` as a classic script. A zero timeout means no limit.
    pub fn eval(&self, source: &str, timeout: Duration) -> ExecutionResult {
        block_on(self.eval_async(source, timeout))
    }

    pub async fn eval_async(&self, source: &str, timeout: Duration) -> ExecutionResult {
        self.execute(Job::Eval(source.to_owned()), timeout).await
    }

    /// Calls a function this context handed out. A zero timeout means no limit.
    pub fn call(&self, function: &FunctionHandle, args: &[Value], timeout: Duration) -> ExecutionResult {
        block_on(self.call_async(function, args, timeout))
    }

    pub async fn call_async(&self, function: &FunctionHandle, args: &[Value], timeout: Duration) -> ExecutionResult {
        function.check_owner(self.id())?;
        self.check_args(args)?;
        self.execute(Job::Call {
            function: function.id(),
            args: args.to_vec(),
        }, timeout).await
    }

    /// Calls the function at a dotted path from the global object, like `"JSON.stringify"`,
    /// with its owning object as `this`.
    pub fn call_named(&self, path: &str, args: &[Value], timeout: Duration) -> ExecutionResult {
        block_on(self.call_named_async(path, args, timeout))
    }

    pub async fn call_named_async(&self, path: &str, args: &[Value], timeout: Duration) -> ExecutionResult {
        self.check_args(args)?;
        self.execute(Job::CallNamed {
            path: path.to_owned(),
            args: args.to_vec(),
        }, timeout).await
    }

    /// Lets the engine collect a function. The handle and its clones become invalid.
    ///
    /// Reading the same function through the same object again yields an equal handle, so this
    /// also invalidates handles from earlier reads of it.
    pub fn release(&self, function: &FunctionHandle) -> Result<()> {
        function.check_owner(self.id())?;
        self.send(Command::Release {
            function: function.id(),
        })
    }

    pub fn heap_stats(&self) -> Result<HeapStats> {
        let rx = self.request(|reply| Command::HeapStats { reply: reply })?;
        block_on(rx).unwrap_or_else(|_| Err(self.destroyed()))
    }

    /// Hints that the engine should collect garbage aggressively.
    pub fn low_memory_notification(&self) -> Result<()> {
        self.send(Command::LowMemoryNotification)
    }

    /// Serializes the context's heap and destroys the context.
    ///
    /// Requires `ContextConfig::enable_snapshot`. The result can seed new contexts through
    /// `ContextConfig::with_startup_snapshot`, or be written out as a startup snapshot.
    pub fn snapshot(&self) -> Result<Snapshot> {
        if !self.inner.snapshot_enabled {
            return Err(Error::new(ErrorKind::SnapshotFailed,
                format!("context {} was not created with snapshots enabled", self.id())));
        }

        let rx = self.request(|reply| Command::Snapshot { reply: reply })?;
        let snapshot = block_on(rx).unwrap_or_else(|_| Err(self.destroyed()))?;

        if self.inner.liveness.kill() {
            self.inner.teardown()?;
        }
        Ok(snapshot)
    }
}
