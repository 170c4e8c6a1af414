//! Cooperative cancellation (§4.9).
//!
//! A run is never interrupted mid-stage; a flag is checked at suspension
//! points (between stages, and inside long-running stages at their own
//! discretion) and a canceled run unwinds into `Canceled` the next time it
//! is observed. Grounded on `orchestration.rs`'s cancellation-token style
//! fan-out/join loop, re-expressed as a standalone registry rather than a
//! per-orchestrator field.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

/// A cheap, cloneable handle a scheduler or stage can poll or flip.
#[derive(Clone)]
pub struct CancellationHandle {
    flag: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// Process-wide table of per-run cancellation flags. A run registers itself
/// at start and deregisters at completion; `request_cancel` is a no-op for
/// an unknown or already-finished run id.
#[derive(Default)]
pub struct CancellationRegistry {
    handles: Mutex<HashMap<Uuid, CancellationHandle>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, run_id: Uuid) -> CancellationHandle {
        let handle = CancellationHandle {
            flag: Arc::new(AtomicBool::new(false)),
        };
        self.handles.lock().unwrap().insert(run_id, handle.clone());
        handle
    }

    pub fn deregister(&self, run_id: Uuid) {
        self.handles.lock().unwrap().remove(&run_id);
    }

    /// Returns `true` if a live run matching `run_id` was found and flagged.
    pub fn request_cancel(&self, run_id: Uuid) -> bool {
        match self.handles.lock().unwrap().get(&run_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn handle_for(&self, run_id: Uuid) -> Option<CancellationHandle> {
        self.handles.lock().unwrap().get(&run_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_cancel_on_unknown_run_is_a_harmless_no_op() {
        let registry = CancellationRegistry::new();
        assert!(!registry.request_cancel(Uuid::new_v4()));
    }

    #[test]
    fn cancel_is_visible_through_every_cloned_handle() {
        let registry = CancellationRegistry::new();
        let run_id = Uuid::new_v4();
        let handle = registry.register(run_id);
        assert!(!handle.is_canceled());
        assert!(registry.request_cancel(run_id));
        assert!(handle.is_canceled());
    }

    #[test]
    fn deregister_drops_the_run_from_the_table() {
        let registry = CancellationRegistry::new();
        let run_id = Uuid::new_v4();
        registry.register(run_id);
        registry.deregister(run_id);
        assert!(!registry.request_cancel(run_id));
    }
}
