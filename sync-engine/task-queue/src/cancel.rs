use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
/// A cooperative cancellation flag shared between the party requesting
/// the cancellation and the work checking for it.
///
/// Nothing is interrupted forcefully, long running work is expected to
/// check the token at safe points and exit early.
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    #[inline]
    /// Creates a new token which has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    /// Set the cancellation flag, every clone of this token observes it.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release)
    }

    #[inline]
    /// Returns if the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
