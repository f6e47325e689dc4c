//! Cooperative cancellation shared between the interrupt handler and a session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{Error, Result};

/// A cloneable flag that is set once and observed by polling.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call repeatedly and from any thread.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Route Ctrl-C to this token instead of terminating the process.
    ///
    /// Can only be installed once per process.
    pub fn install_interrupt_handler(&self) -> Result<()> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            if token.is_cancelled() {
                eprintln!("Cancellation already in progress...");
            }
            token.cancel();
        })
        .map_err(|e| Error::Other(format!("Failed to install interrupt handler: {}", e)))
    }
}
