use std::panic::{self, AssertUnwindSafe};

use crate::config::PlatformConfig;
use crate::error::{Error, ErrorKind, Result};

use super::traits::{Platform, Terminate};

/// The V8 platform. Only `lifecycle::Lifecycle` should drive this.
pub struct V8Platform;

impl Platform for V8Platform {
    fn version(&self) -> String {
        super::engine_version()
    }

    fn initialize(&self, config: &PlatformConfig) -> Result<()> {
        // V8 reports misuse by panicking through the bindings; don't let that cross into the host.
        panic::catch_unwind(AssertUnwindSafe(|| {
            if let Some(ref flags) = config.v8_flags {
                v8::V8::set_flags_from_string(flags);
            }

            let platform = v8::new_default_platform(config.thread_pool_size, false).make_shared();
            v8::V8::initialize_platform(platform);
            v8::V8::initialize();
        })).map_err(|_| Error::new(ErrorKind::InitializationFailed, "V8 platform initialization panicked"))
    }

    fn dispose(&self) {
        // Safe because Lifecycle only disposes once, with no isolates alive.
        unsafe {
            v8::V8::dispose();
        }
        v8::V8::dispose_platform();
    }
}

impl Terminate for v8::IsolateHandle {
    fn terminate(&self) {
        self.terminate_execution();
    }
}
