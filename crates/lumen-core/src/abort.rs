//! Cooperative abort signal shared between the controlling thread and render workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Abort switch polled by render devices at tile boundaries.
///
/// Cloning is cheap and every clone observes the same flag.
#[derive(Debug, Clone, Default)]
pub struct AbortSwitch {
    aborted: Arc<AtomicBool>,
}

impl AbortSwitch {
    /// Create a switch in the non-aborted state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the current frame stops as soon as possible.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    /// Clear a previous abort request.
    pub fn clear(&self) {
        self.aborted.store(false, Ordering::Release);
    }

    /// Check whether an abort was requested.
    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}
