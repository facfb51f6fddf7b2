//! The V8 backend.

mod dispatch;
mod heap;
mod marshal;
mod platform;
mod runner;
mod traits;

#[cfg(test)]
mod testlib;
#[cfg(test)]
mod test;

pub use self::heap::HeapStats;
pub use self::platform::V8Platform;
pub use self::traits::{Platform, Terminate};

pub(crate) use self::dispatch::Job;
pub(crate) use self::runner::{spawn, Command};

/// The V8 build this crate runs on. Snapshots only load into the same version.
pub fn engine_version() -> String {
    v8::V8::get_version().to_owned()
}
