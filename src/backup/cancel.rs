//! Cooperative abort signal shared between the dump workers and the archive manager.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Clonable abort flag. Clones observe the same state.
///
/// Workers poll it between blocks and the archive manager polls it before
/// opening a generation; nothing is interrupted mid-transform.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            tracing::warn!("Abort requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Error::Aborted` once the token has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }
}
