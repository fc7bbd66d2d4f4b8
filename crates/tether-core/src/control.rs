//! Deadlines and cancellation for network-facing operations.
//!
//! Every operation that talks to a worker socket takes [`CallOptions`]. The
//! timeout bounds each connect, read and write; the abort handle lets another
//! thread give up on a call that is waiting on a slow remote host.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default bound for a single connect/read/write against a worker.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle for cooperative cancellation of a control call.
///
/// Clones share the flag: aborting any clone is visible to all of them.
///
/// # Example
///
/// ```
/// use tether_core::control::AbortHandle;
///
/// let handle = AbortHandle::new();
/// let handle_clone = handle.clone();
///
/// assert!(!handle.is_aborted());
/// handle_clone.abort();
/// assert!(handle.is_aborted());
/// ```
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Create a new abort handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if abort has been requested.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Request abort of the pending call.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    /// Reset the abort flag.
    pub fn reset(&self) {
        self.aborted.store(false, Ordering::Relaxed);
    }
}

/// Per-call policy for socket operations.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Bound for each connect, read and write. `None` blocks indefinitely.
    pub timeout: Option<Duration>,
    /// Cancellation checked before connecting and before waiting for a reply.
    pub abort: Option<AbortHandle>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_TIMEOUT),
            abort: None,
        }
    }
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn abort_handle(mut self, handle: AbortHandle) -> Self {
        self.abort = Some(handle);
        self
    }

    /// Whether the caller gave up.
    pub fn is_aborted(&self) -> bool {
        self.abort.as_ref().is_some_and(|h| h.is_aborted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = CallOptions::default();
        assert_eq!(opts.timeout, Some(DEFAULT_TIMEOUT));
        assert!(!opts.is_aborted());
    }

    #[test]
    fn test_abort_is_shared() {
        let handle = AbortHandle::new();
        let opts = CallOptions::with_timeout(Duration::from_millis(10)).abort_handle(handle.clone());

        handle.abort();
        assert!(opts.is_aborted());

        handle.reset();
        assert!(!opts.is_aborted());
    }
}
