use crate::config::PlatformConfig;
use crate::error::Result;

/// The process-level half of an engine: something that must be brought up once before any
/// context exists, and torn down at most once after the last one is gone.
///
/// Implementations need not be idempotent; `Lifecycle` guarantees each method runs at most once.
pub trait Platform: Send + Sync + 'static {
    /// Identifies the engine build. Snapshots are only portable between equal versions.
    fn version(&self) -> String;

    fn initialize(&self, config: &PlatformConfig) -> Result<()>;

    fn dispose(&self);
}

/// Asks a running engine to abandon the script it is executing. Must be callable from any thread.
pub trait Terminate: Send + 'static {
    fn terminate(&self);
}
