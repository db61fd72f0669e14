//! Per-axis operation lock.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

/// Binary lock enforcing at most one motion operation in flight.
///
/// Unlike a mutex this is never held across an await; acquisition happens in
/// the command call and release happens in the watchdog, so the two ends are
/// different tasks by design of the protocol.
#[derive(Debug, Default)]
pub struct OpGuard {
    held: AtomicBool,
}

impl OpGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock. Returns false if an operation is already in flight.
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the lock. Releasing an already-free guard is harmless but
    /// indicates a protocol slip, so it is logged.
    pub fn release(&self) {
        if self.held.swap(false, Ordering::AcqRel) {
            return;
        }
        warn!("operation guard released while already unlocked");
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_cycle() {
        let guard = OpGuard::new();
        assert!(guard.try_acquire());
        assert!(guard.is_held());
        assert!(!guard.try_acquire());
        guard.release();
        assert!(!guard.is_held());
        assert!(guard.try_acquire());
    }

    #[test]
    fn test_double_release_is_harmless() {
        let guard = OpGuard::new();
        assert!(guard.try_acquire());
        guard.release();
        guard.release();
        assert!(guard.try_acquire());
    }
}
