//! The thread that owns an isolate.
//!
//! V8 isolates are bound to the thread that entered them, so each context gets one of these.
//! The host side talks to it only through `Command`s, which also serializes all use of the context.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use futures::channel::oneshot;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config::ContextConfig;
use crate::context::{ContextId, Liveness};
use crate::error::{Error, ErrorKind, Result};
use crate::snapshot::Snapshot;
use crate::value::Value;
use crate::watchdog::Watchdog;

use super::dispatch::{self, Job};
use super::heap::{HeapGuard, HeapStats};
use super::marshal::Registry;

/// Serializes `create_blob`, which is not safe to run concurrently across snapshot creators.
static SNAPSHOT_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub enum Command {
    Execute {
        job: Job,
        timeout: Duration,
        reply: oneshot::Sender<Result<Value>>,
    },
    Release {
        function: u32,
    },
    HeapStats {
        reply: oneshot::Sender<Result<HeapStats>>,
    },
    LowMemoryNotification,
    Snapshot {
        reply: oneshot::Sender<Result<Snapshot>>,
    },
}

/// A running context thread, as seen from the host.
pub struct Worker {
    pub commands: Sender<Command>,
    pub thread: JoinHandle<()>,
    /// Terminates whatever the worker is running. Valid after the isolate is gone.
    pub isolate: v8::IsolateHandle,
}

/// Starts the thread for a new context and waits for its isolate to come up.
pub fn spawn(id: ContextId, config: &ContextConfig, startup_snapshot: Option<Snapshot>, owner: Arc<Liveness>)
    -> Result<Worker> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
    let config = config.clone();

    let thread = thread::Builder::new()
        .name(format!("jsbridge-{}", id))
        .spawn(move || {
            let mut runner = match Runner::new(&config, startup_snapshot, owner) {
                Ok(r) => r,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(runner.heap_guard.handle().clone()));
            runner.serve(rx);
        })
        .map_err(|e| Error::new(ErrorKind::InitializationFailed, format!("could not start context thread: {}", e)))?;

    match ready_rx.recv() {
        Ok(Ok(isolate)) => Ok(Worker {
            commands: tx,
            thread: thread,
            isolate: isolate,
        }),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            let _ = thread.join();
            Err(Error::new(ErrorKind::InitializationFailed, format!("context {} died while starting", id)))
        }
    }
}

struct Runner {
    owner: Arc<Liveness>,
    // Field order is drop order: handles before the isolate, the isolate before its heap guard.
    // `Drop` below takes the first three out early.
    registry: Registry,
    context: Option<v8::Global<v8::Context>>,
    isolate: Option<v8::OwnedIsolate>,
    heap_guard: Box<HeapGuard>,
    snapshot_enabled: bool,
    /// Set once the context can no longer run code.
    fatal: Option<String>,
}

impl Runner {
    fn new(config: &ContextConfig, startup_snapshot: Option<Snapshot>, owner: Arc<Liveness>) -> Result<Runner> {
        let mut params = v8::CreateParams::default();
        if let Some(limit) = config.effective_heap_limit() {
            params = params.heap_limits(0, limit);
        }

        let startup_snapshot = config.startup_snapshot.clone().or(startup_snapshot);
        if let Some(ref s) = startup_snapshot {
            s.check_engine(&super::engine_version())?;
        }

        let mut isolate = match (config.enable_snapshot, startup_snapshot) {
            (true, Some(s)) => v8::Isolate::snapshot_creator_from_existing_snapshot(s.payload().to_vec(), None, Some(params)),
            (true, None) => v8::Isolate::snapshot_creator(None, Some(params)),
            (false, Some(s)) => v8::Isolate::new(params.snapshot_blob(s.payload().to_vec())),
            (false, None) => v8::Isolate::new(params),
        };

        let heap_guard = HeapGuard::new(isolate.thread_safe_handle());
        heap_guard.install(&mut isolate);

        let context = {
            let scope = &mut v8::HandleScope::new(&mut isolate);
            let context = v8::Context::new(scope, Default::default());
            v8::Global::new(scope, context)
        };

        tracing::debug!(context = %owner.id(), heap_limit = ?config.effective_heap_limit(),
            snapshot = config.enable_snapshot, "isolate created");

        Ok(Runner {
            owner: owner,
            registry: Registry::default(),
            context: Some(context),
            isolate: Some(isolate),
            heap_guard: heap_guard,
            snapshot_enabled: config.enable_snapshot,
            fatal: None,
        })
    }

    fn serve(&mut self, commands: Receiver<Command>) {
        for command in commands.iter() {
            // Commands queued before a destroy are answered, not run.
            if !self.owner.is_alive() {
                reject(command, destroyed(self.owner.id()));
                continue;
            }

            match command {
                Command::Execute { job, timeout, reply } => {
                    let r = match panic::catch_unwind(AssertUnwindSafe(|| self.execute(job, timeout))) {
                        Ok(r) => r,
                        Err(_) => {
                            tracing::error!(context = %self.owner.id(), "panic while executing; context is unusable");
                            self.fatal = Some("a panic unwound through the engine".to_owned());
                            Err(Error::fatal("a panic unwound through the engine; the context must be destroyed"))
                        }
                    };
                    let _ = reply.send(r);
                }
                Command::Release { function } => {
                    if !self.registry.release(function) {
                        tracing::debug!(context = %self.owner.id(), function, "released an unknown function handle");
                    }
                }
                Command::HeapStats { reply } => {
                    let r = self.isolate().map(|isolate| HeapStats::of(isolate));
                    let _ = reply.send(r);
                }
                Command::LowMemoryNotification => {
                    if let Ok(isolate) = self.isolate() {
                        isolate.low_memory_notification();
                    }
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
            }
        }

        tracing::debug!(context = %self.owner.id(), functions = self.registry.len(), "context thread exiting");
    }

    fn isolate(&mut self) -> Result<&mut v8::OwnedIsolate> {
        let id = self.owner.id();
        self.isolate.as_mut().ok_or_else(|| destroyed(id))
    }

    fn execute(&mut self, job: Job, timeout: Duration) -> Result<Value> {
        if let Some(ref reason) = self.fatal {
            return Err(Error::fatal(format!("context {} is unusable: {}", self.owner.id(), reason)));
        }

        let id = self.owner.id();
        let what = job.describe().to_owned();
        let Runner { ref owner, ref mut registry, ref context, ref mut isolate, ref heap_guard, .. } = *self;
        let (isolate, context) = match (isolate.as_mut(), context.as_ref()) {
            (Some(i), Some(c)) => (i, c),
            _ => return Err(destroyed(id)),
        };

        let watchdog = Watchdog::arm_for(heap_guard.handle().clone(), timeout)?;

        let outcome = {
            let scope = &mut v8::HandleScope::new(isolate);
            let local = v8::Local::new(scope, context);
            let scope = &mut v8::ContextScope::new(scope, local);
            let tc = &mut v8::TryCatch::new(scope);
            dispatch::run(tc, job, registry, owner)
        };

        let timed_out = watchdog.map(|w| w.disarm()).unwrap_or(false);
        let terminated = matches!(outcome, dispatch::Outcome::Terminated);
        // A watchdog that fired late leaves termination pending for the next job.
        if timed_out || terminated {
            isolate.cancel_terminate_execution();
        }
        if terminated && !owner.is_alive() {
            return Err(destroyed(id));
        }

        let (r, fatal) = dispatch::settle(outcome, timed_out, heap_guard.is_exhausted(), timeout.as_millis());
        if let Some(reason) = fatal {
            tracing::error!(context = %id, job = %what, reason = %reason, "context is unusable");
            self.fatal = Some(reason);
        } else if let Err(ref e) = r {
            tracing::debug!(context = %id, job = %what, error = %e, "job failed");
        }

        r
    }

    /// Serializes the heap. Consumes the isolate, so the context is finished afterwards.
    fn snapshot(&mut self) -> Result<Snapshot> {
        if !self.snapshot_enabled {
            return Err(Error::new(ErrorKind::SnapshotFailed, "context was not created with snapshots enabled"));
        }
        if let Some(ref reason) = self.fatal {
            return Err(Error::new(ErrorKind::SnapshotFailed, format!("context is unusable: {}", reason)));
        }

        let id = self.owner.id();
        let (mut isolate, context) = match (self.isolate.take(), self.context.take()) {
            (Some(i), Some(c)) => (i, c),
            _ => return Err(destroyed(id)),
        };

        // The blob can't be created while the host holds handles into the heap.
        self.registry.clear();
        HeapGuard::uninstall(&mut isolate);
        {
            let scope = &mut v8::HandleScope::new(&mut isolate);
            let local = v8::Local::new(scope, &context);
            drop(context);
            scope.set_default_context(local);
        }

        let blob = {
            let _lock = SNAPSHOT_LOCK.lock();
            isolate.create_blob(v8::FunctionCodeHandling::Keep)
        };

        match blob {
            Some(blob) => {
                let snapshot = Snapshot::new(&super::engine_version(), &*blob);
                tracing::info!(context = %id, bytes = snapshot.payload().len(), "snapshot created");
                Ok(snapshot)
            }
            None => Err(Error::new(ErrorKind::SnapshotFailed, "the engine could not serialize the heap")),
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.registry.clear();
        let context = self.context.take();
        let mut isolate = match self.isolate.take() {
            Some(i) => i,
            None => return,
        };
        if !self.snapshot_enabled {
            drop(context);
            return;
        }

        // A snapshot creator can only be disposed through `create_blob`. The blob is thrown away.
        isolate.cancel_terminate_execution();
        if let Some(context) = context {
            let scope = &mut v8::HandleScope::new(&mut isolate);
            let local = v8::Local::new(scope, &context);
            drop(context);
            scope.set_default_context(local);
        }
        let _lock = SNAPSHOT_LOCK.lock();
        if isolate.create_blob(v8::FunctionCodeHandling::Clear).is_none() {
            tracing::debug!(context = %self.owner.id(), "discarded snapshot creator without a blob");
        }
    }
}

fn destroyed(id: ContextId) -> Error {
    Error::new(ErrorKind::ContextDestroyed, format!("context {} has been destroyed", id))
}

fn reject(command: Command, e: Error) {
    match command {
        Command::Execute { reply, .. } => {
            let _ = reply.send(Err(e));
        }
        Command::HeapStats { reply } => {
            let _ = reply.send(Err(e));
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(Err(e));
        }
        Command::Release { .. } | Command::LowMemoryNotification => (),
    }
}
