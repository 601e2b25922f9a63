//! Cooperative cancellation for long-running operations.
//!
//! The multi-index query path and the storage layer poll a [`CancelToken`]
//! between sub-tree loads and after serialization steps. A host application
//! typically flips the token from a signal handler; the library itself never
//! installs handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::{IndexError, IndexResult};

/// Cloneable cancellation flag shared between a host and running operations.
///
/// All clones observe the same flag. The default token is never canceled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every operation polling this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Surfaces a pending cancellation request as an error.
    pub fn check(&self) -> IndexResult<()> {
        if self.is_canceled() {
            Err(IndexError::Canceled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_not_canceled() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_cancel_is_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_canceled());
        assert!(matches!(clone.check(), Err(IndexError::Canceled)));
    }
}
