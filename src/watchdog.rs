//! Wall-clock limits for script execution.
//!
//! A `Watchdog` is armed right before control passes to the engine and disarmed right after.
//! If the deadline passes first, it terminates the engine from its own thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::engine::Terminate;
use crate::error::{Error, ErrorKind, Result};

/// Cancels a pending deadline. Dropping the token cancels too.
pub struct CancellationToken {
    tx: Sender<()>,
}

impl CancellationToken {
    pub fn new() -> (CancellationToken, Receiver<()>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (CancellationToken { tx: tx }, rx)
    }

    pub fn cancel(self) {
        // The receiver disconnecting means the deadline already passed.
        let _ = self.tx.send(());
    }
}

pub struct Watchdog {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Watchdog {
    /// Terminates `target` after `timeout` unless disarmed first.
    pub fn arm<T: Terminate>(target: T, timeout: Duration) -> Result<Watchdog> {
        let (token, cancelled) = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();

        let thread = thread::Builder::new()
            .name("jsbridge-watchdog".into())
            .spawn(move || {
                match cancelled.recv_timeout(timeout) {
                    Err(RecvTimeoutError::Timeout) => {
                        fired2.store(true, Ordering::SeqCst);
                        target.terminate();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => (),
                }
            })
            .map_err(|e| Error::new(ErrorKind::EngineFatal, format!("could not start watchdog: {}", e)))?;

        Ok(Watchdog {
            token: token,
            fired: fired,
            thread: thread,
        })
    }

    /// Arms a watchdog for a non-zero timeout. Zero means no limit.
    pub fn arm_for<T: Terminate>(target: T, timeout: Duration) -> Result<Option<Watchdog>> {
        if timeout.is_zero() {
            Ok(None)
        } else {
            Watchdog::arm(target, timeout).map(Some)
        }
    }

    /// Stops the watchdog. Returns whether it fired. Once this returns, it will not fire.
    pub fn disarm(self) -> bool {
        self.token.cancel();
        if self.thread.join().is_err() {
            tracing::warn!("watchdog thread panicked");
        }
        self.fired.load(Ordering::SeqCst)
    }
}
