//! Cooperative cancellation shared by all session tasks
//!
//! A token wraps a single shared flag. Blocking calls carry bounded timeouts
//! so every task observes the flag at least once per timeout interval; the
//! session additionally shuts sockets down to unblock reads past the grace
//! period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag, cloned into every task of a session.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, un-cancelled token.
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation. Idempotent; visible to all clones immediately.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation has been requested.
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_starts_clear() {
        let token = CancelToken::new();
        assert!(!token.is_requested());
    }

    #[test]
    fn test_cancel_visible_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.request();
        assert!(clone.is_requested());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancelToken::new();
        token.request();
        token.request();
        assert!(token.is_requested());
    }
}
