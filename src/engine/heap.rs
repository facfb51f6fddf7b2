use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

/// Heap usage of one context, as reported by the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    pub total_heap_size: usize,
    pub used_heap_size: usize,
    pub heap_size_limit: usize,
    pub total_physical_size: usize,
    pub external_memory: usize,
}

impl HeapStats {
    pub(crate) fn of(isolate: &mut v8::Isolate) -> Self {
        let mut s = v8::HeapStatistics::default();
        isolate.get_heap_statistics(&mut s);

        HeapStats {
            total_heap_size: s.total_heap_size(),
            used_heap_size: s.used_heap_size(),
            heap_size_limit: s.heap_size_limit(),
            total_physical_size: s.total_physical_size(),
            external_memory: s.external_memory(),
        }
    }
}

/// State shared with the near-heap-limit callback. Must outlive the isolate it is registered on.
pub(crate) struct HeapGuard {
    exhausted: AtomicBool,
    handle: v8::IsolateHandle,
}

impl HeapGuard {
    pub fn new(handle: v8::IsolateHandle) -> Box<Self> {
        Box::new(HeapGuard {
            exhausted: AtomicBool::new(false),
            handle: handle,
        })
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    pub fn handle(&self) -> &v8::IsolateHandle {
        &self.handle
    }

    /// The guard must be boxed and stay put until `uninstall` or the isolate is gone.
    pub fn install(&self, isolate: &mut v8::Isolate) {
        let data = self as *const HeapGuard as *mut c_void;
        isolate.add_near_heap_limit_callback(near_heap_limit, data);
    }

    pub fn uninstall(isolate: &mut v8::Isolate) {
        isolate.remove_near_heap_limit_callback(near_heap_limit, 0);
    }
}

/// Runs on the isolate's thread when the heap is about to hit its limit. Stops the script
/// and grants enough headroom for the termination to unwind; the context is then fatal.
extern "C" fn near_heap_limit(data: *mut c_void, current_heap_limit: usize, _initial_heap_limit: usize) -> usize {
    let guard = unsafe { &*(data as *const HeapGuard) };
    guard.exhausted.store(true, Ordering::SeqCst);
    guard.handle.terminate_execution();
    current_heap_limit.saturating_mul(2)
}
