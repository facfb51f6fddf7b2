use std::env;
use std::path::PathBuf;

use serde::Deserialize;

use crate::snapshot::Snapshot;

/// V8 aborts the process (instead of calling the near-heap-limit callback) below roughly this.
pub const MIN_HEAP_SIZE_LIMIT: usize = 4 * 1024 * 1024;

/// Worker threads for V8's default platform. Zero lets V8 pick.
pub const DEFAULT_THREAD_POOL_SIZE: u32 = 0;

const ENV_V8_FLAGS: &str = "JSBRIDGE_V8_FLAGS";
const ENV_THREAD_POOL_SIZE: &str = "JSBRIDGE_THREAD_POOL_SIZE";
const ENV_STARTUP_SNAPSHOT: &str = "JSBRIDGE_STARTUP_SNAPSHOT";

/// Process-wide engine settings. Only read once, by the first initialization.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlatformConfig {
    /// Passed verbatim to `V8::set_flags_from_string`, e.g. `"--max-lazy"`.
    pub v8_flags: Option<String>,
    pub thread_pool_size: u32,
    /// A base heap snapshot produced by `jsbridge-snapshot`. When set, the file must exist.
    pub startup_snapshot: Option<PathBuf>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            v8_flags: None,
            thread_pool_size: DEFAULT_THREAD_POOL_SIZE,
            startup_snapshot: None,
        }
    }
}

impl PlatformConfig {
    /// Defaults, overridden by `JSBRIDGE_*` environment variables where present.
    pub fn from_env() -> Self {
        let mut config = PlatformConfig::default();

        if let Ok(flags) = env::var(ENV_V8_FLAGS) {
            if !flags.trim().is_empty() {
                config.v8_flags = Some(flags);
            }
        }

        if let Ok(size) = env::var(ENV_THREAD_POOL_SIZE) {
            match size.trim().parse() {
                Ok(n) => config.thread_pool_size = n,
                Err(_) => tracing::warn!(value = %size, "ignoring unparseable {}", ENV_THREAD_POOL_SIZE),
            }
        }

        if let Some(path) = env::var_os(ENV_STARTUP_SNAPSHOT) {
            config.startup_snapshot = Some(PathBuf::from(path));
        }

        config
    }
}

/// Per-context settings.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Maximum heap size in bytes. Zero keeps the engine default.
    pub heap_size_limit: usize,
    /// Create the isolate as a snapshot creator so `Context::snapshot` works.
    pub enable_snapshot: bool,
    /// Heap image to start from instead of the platform's startup snapshot.
    #[serde(skip)]
    pub startup_snapshot: Option<Snapshot>,
}

impl ContextConfig {
    pub fn with_heap_size_limit(mut self, bytes: usize) -> Self {
        self.heap_size_limit = bytes;
        self
    }

    pub fn with_snapshot_enabled(mut self, enabled: bool) -> Self {
        self.enable_snapshot = enabled;
        self
    }

    pub fn with_startup_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.startup_snapshot = Some(snapshot);
        self
    }

    /// The heap limit actually handed to the engine, if any.
    pub fn effective_heap_limit(&self) -> Option<usize> {
        match self.heap_size_limit {
            0 => None,
            n => Some(n.max(MIN_HEAP_SIZE_LIMIT)),
        }
    }
}
