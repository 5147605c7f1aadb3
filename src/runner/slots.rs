/// Concurrency slots for running external processes.
///
/// A shared counter with an indivisible check-and-increment. A denied
/// acquisition leaves the counter untouched and is never queued: the caller
/// gets an immediate rejection and decides whether to retry.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::GatewayError;

#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGuard {
    running: Arc<AtomicUsize>,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a slot if fewer than `max` are held.
    ///
    /// The returned permit gives the slot back when dropped.
    pub fn try_acquire(&self, max: usize) -> Result<SlotPermit, GatewayError> {
        match self
            .running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            }) {
            Ok(previous) => {
                debug!("Slot acquired ({}/{max})", previous + 1);
                Ok(SlotPermit {
                    guard: self.clone(),
                })
            }
            Err(current) => {
                warn!("Concurrency limit reached ({current}/{max})");
                Err(GatewayError::ConcurrencyLimit { max })
            }
        }
    }

    /// Gives one slot back. Never drops below zero.
    pub fn release(&self) {
        if self
            .running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            warn!("Slot released while none were held");
        }
    }

    /// Number of slots currently held.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }
}

/// One held slot. Released exactly once, on drop.
#[derive(Debug)]
pub struct SlotPermit {
    guard: ConcurrencyGuard,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.guard.release();
        debug!("Slot released ({} running)", self.guard.running());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_up_to_limit() {
        let guard = ConcurrencyGuard::new();
        let _a = guard.try_acquire(2).unwrap();
        let _b = guard.try_acquire(2).unwrap();
        assert_eq!(guard.running(), 2);
    }

    #[test]
    fn test_rejects_when_limit_reached() {
        let guard = ConcurrencyGuard::new();
        let _a = guard.try_acquire(2).unwrap();
        let _b = guard.try_acquire(2).unwrap();
        let err = guard.try_acquire(2).unwrap_err();
        assert!(err.to_string().contains("concurrency limit reached"));
        assert_eq!(guard.running(), 2);
    }

    #[test]
    fn test_acquire_after_release() {
        let guard = ConcurrencyGuard::new();
        let a = guard.try_acquire(2).unwrap();
        let _b = guard.try_acquire(2).unwrap();
        drop(a);
        assert_eq!(guard.running(), 1);
        let _c = guard.try_acquire(2).unwrap();
        assert!(guard.try_acquire(2).is_err());
    }

    #[test]
    fn test_over_release_floors_at_zero() {
        let guard = ConcurrencyGuard::new();
        guard.release();
        guard.release();
        guard.release();
        assert_eq!(guard.running(), 0);

        let _a = guard.try_acquire(1).unwrap();
        assert!(guard.try_acquire(1).is_err());
    }

    #[test]
    fn test_clones_share_the_counter() {
        let guard = ConcurrencyGuard::new();
        let other = guard.clone();
        let _a = guard.try_acquire(1).unwrap();
        assert!(other.try_acquire(1).is_err());
    }

    #[test]
    fn test_lowered_limit_denies_until_drained() {
        let guard = ConcurrencyGuard::new();
        let a = guard.try_acquire(3).unwrap();
        let b = guard.try_acquire(3).unwrap();
        assert!(guard.try_acquire(1).is_err());
        drop(a);
        assert!(guard.try_acquire(1).is_err());
        drop(b);
        assert!(guard.try_acquire(1).is_ok());
    }

    #[test]
    fn test_parallel_acquire_never_exceeds_limit() {
        let guard = ConcurrencyGuard::new();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = guard.clone();
                std::thread::spawn(move || guard.try_acquire(4).ok())
            })
            .collect();
        let permits: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(permits.len(), 4);
        assert_eq!(guard.running(), 4);
        drop(permits);
        assert_eq!(guard.running(), 0);
    }
}
