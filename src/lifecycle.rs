//! The process-wide engine guard.
//!
//! Embedded engines allow one platform initialization per process, and must not be torn down
//! while any isolate still exists. `Lifecycle` is the only thing that touches the platform, and
//! counts live contexts through `ContextPermit`s, much like a factory that refuses to die while
//! handles to it are extant.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config::PlatformConfig;
use crate::engine::{Platform, V8Platform};
use crate::error::{Error, ErrorKind, Result};
use crate::snapshot::Snapshot;

enum State {
    Uninitialized(PlatformConfig),
    Running {
        startup_snapshot: Option<Snapshot>,
    },
    /// Initialization failed; the platform may be half up and cannot be retried.
    Failed(String),
    ShutDown,
}

pub struct Lifecycle<P: Platform> {
    platform: P,
    /// Fast path for `ensure_initialized`. Only ever set while holding `state`.
    running: AtomicBool,
    state: Mutex<State>,
    live: Arc<AtomicUsize>,
}

/// Proof that a context is alive. The engine cannot shut down while any permit exists.
pub struct ContextPermit {
    live: Arc<AtomicUsize>,
    startup_snapshot: Option<Snapshot>,
}

impl ContextPermit {
    /// The platform-wide startup snapshot, if one was configured.
    pub fn startup_snapshot(&self) -> Option<&Snapshot> {
        self.startup_snapshot.as_ref()
    }
}

impl Drop for ContextPermit {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<P: Platform> Lifecycle<P> {
    pub fn new(platform: P, config: PlatformConfig) -> Self {
        Lifecycle {
            platform: platform,
            running: AtomicBool::new(false),
            state: Mutex::new(State::Uninitialized(config)),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Replaces the platform configuration. Only possible before the first initialization.
    pub fn configure(&self, config: PlatformConfig) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            State::Uninitialized(ref mut c) => {
                *c = config;
                Ok(())
            }
            State::ShutDown => Err(already_shutdown()),
            _ => Err(Error::new(ErrorKind::InitializationFailed,
                "the engine platform is already initialized; configure it before first use")),
        }
    }

    /// Brings the platform up if it isn't already. Idempotent and thread-safe.
    pub fn ensure_initialized(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut state = self.state.lock();
        self.initialize_locked(&mut state)
    }

    fn initialize_locked(&self, state: &mut State) -> Result<()> {
        let config = match *state {
            State::Running { .. } => return Ok(()),
            State::Failed(ref message) => return Err(Error::new(ErrorKind::InitializationFailed, message.clone())),
            State::ShutDown => return Err(already_shutdown()),
            State::Uninitialized(ref config) => config.clone(),
        };

        // A missing artifact is reported before anything in the engine is touched,
        // so fixing the deployment and retrying is allowed.
        let startup_snapshot = match config.startup_snapshot {
            Some(ref path) if !path.is_file() => {
                return Err(Error::new(ErrorKind::EngineNotBuilt,
                    format!("startup snapshot {} does not exist; build it with jsbridge-snapshot", path.display())));
            }
            Some(ref path) => {
                let loaded = Snapshot::read_from(path)
                    .and_then(|s| s.check_engine(&self.platform.version()).map(|_| s));
                match loaded {
                    Ok(s) => Some(s),
                    Err(e) => {
                        return Err(Error::new(ErrorKind::InitializationFailed,
                            format!("startup snapshot {}: {}", path.display(), e.message())));
                    }
                }
            }
            None => None,
        };

        match self.platform.initialize(&config) {
            Ok(()) => {
                tracing::info!(version = %self.platform.version(), "engine platform initialized");
                *state = State::Running {
                    startup_snapshot: startup_snapshot,
                };
                self.running.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "engine platform initialization failed");
                *state = State::Failed(e.message().to_owned());
                Err(Error::new(ErrorKind::InitializationFailed, e.message()))
            }
        }
    }

    /// Registers a new live context, initializing the platform first if needed.
    pub fn acquire(&self) -> Result<ContextPermit> {
        let mut state = self.state.lock();
        self.initialize_locked(&mut state)?;

        match *state {
            State::Running { ref startup_snapshot } => {
                self.live.fetch_add(1, Ordering::SeqCst);
                Ok(ContextPermit {
                    live: self.live.clone(),
                    startup_snapshot: startup_snapshot.clone(),
                })
            }
            // initialize_locked only succeeds in the running state
            _ => Err(Error::new(ErrorKind::InitializationFailed, "engine platform is not running")),
        }
    }

    pub fn live_contexts(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        matches!(*self.state.lock(), State::ShutDown)
    }

    /// Tears the platform down for good. Fails while any context is alive, and on a second call.
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock();

        if let State::ShutDown = *state {
            return Err(already_shutdown());
        }

        let live = self.live.load(Ordering::SeqCst);
        if live > 0 {
            return Err(Error::new(ErrorKind::ContextsStillAlive,
                format!("{} context(s) must be destroyed before shutdown", live)));
        }

        if let State::Running { .. } = *state {
            self.running.store(false, Ordering::Release);
            self.platform.dispose();
            tracing::info!("engine platform disposed");
        }

        *state = State::ShutDown;
        Ok(())
    }
}

fn already_shutdown() -> Error {
    Error::new(ErrorKind::AlreadyShutdown, "the engine platform has been shut down")
}

static ENGINE: Lazy<Lifecycle<V8Platform>> = Lazy::new(|| Lifecycle::new(V8Platform, PlatformConfig::from_env()));

/// The process-wide guard for the V8 platform.
pub fn engine() -> &'static Lifecycle<V8Platform> {
    &ENGINE
}
