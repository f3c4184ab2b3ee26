//! Cooperative cancellation context.
//!
//! A `Cx` is threaded through every long-running operation. Scans call
//! [`Cx::checkpoint`] at their polling cadence; once the host has called
//! [`Cx::cancel`] on any clone, every checkpoint fails with
//! [`VerifyError::Cancelled`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fverify_error::{Result, VerifyError};

#[derive(Debug, Clone, Default)]
pub struct Cx {
    cancelled: Arc<AtomicBool>,
}

impl Cx {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Visible to all clones.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(VerifyError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_passes_until_cancelled() {
        let cx = Cx::new();
        assert!(cx.checkpoint().is_ok());
        let clone = cx.clone();
        clone.cancel();
        assert!(cx.is_cancelled());
        assert!(matches!(cx.checkpoint(), Err(VerifyError::Cancelled)));
    }
}
