use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::Error;

/// Cooperative cancellation for long-running scans.
///
/// Clones share the same flag, so a caller keeps one handle and passes
/// another into the backfill engine. A deadline, when set, is checked
/// alongside the flag.
///
/// # Examples
///
/// ```
/// use activity_trail::Cancellation;
///
/// let token = Cancellation::new();
/// let handle = token.clone();
/// assert!(token.check().is_ok());
///
/// handle.cancel();
/// assert!(token.check().is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cancellation {
    /// Creates a token that is never cancelled until [`cancel`](Self::cancel).
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that expires at the given instant.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// Cancels this token and every clone of it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancelled or past the deadline.
    pub fn is_cancelled(&self) -> bool {
        self.check().is_err()
    }

    /// Returns an error once cancelled or past the deadline.
    ///
    /// # Errors
    ///
    /// `Error::Cancelled` after [`cancel`](Self::cancel), otherwise
    /// `Error::DeadlineExceeded` once the deadline has passed.
    pub fn check(&self) -> Result<(), Error> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn clones_share_the_flag() {
        let token = Cancellation::new();
        let clone = token.clone();
        clone.cancel();
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn expired_deadline_is_reported() {
        let token = Cancellation::with_deadline(Instant::now());
        assert!(matches!(token.check(), Err(Error::DeadlineExceeded)));
    }

    #[test]
    fn future_deadline_passes() {
        let token = Cancellation::with_deadline(Instant::now() + Duration::from_secs(3600));
        assert!(token.check().is_ok());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn explicit_cancel_wins_over_deadline() {
        let token = Cancellation::with_deadline(Instant::now());
        token.cancel();
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }
}
