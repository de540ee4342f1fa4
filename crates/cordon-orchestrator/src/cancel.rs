//! Cooperative cancellation.
//!
//! Long-running lifecycle operations take a [`CancellationToken`] and call
//! [`CancellationToken::checkpoint`] between phases. Cancellation is never
//! preemptive: a phase that has started runs to completion, and resources
//! created before the checkpoint stay behind for a later cleanup to remove.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{OrchestratorError, Result};

/// A cheaply cloneable cancellation flag shared between the signal handler
/// and the lifecycle operations.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with [`OrchestratorError::Cancelled`] if cancellation was
    /// requested, otherwise continue.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(OrchestratorError::Cancelled)
        } else {
            Ok(())
        }
    }
}
