//! Counting semaphore for admission control

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use super::lock;

/// Limits how many callers hold a permit at the same time
///
/// Callers over the limit block until a permit is released; there is no
/// polling.
pub struct Semaphore {
    active: Mutex<usize>,
    released: Condvar,
    max: usize,
}

/// A held permit; released on drop
pub struct Permit<'a> {
    semaphore: &'a Semaphore,
}

impl Semaphore {
    /// Create a semaphore admitting `max` holders (at least one)
    pub fn new(max: usize) -> Self {
        Self {
            active: Mutex::new(0),
            released: Condvar::new(),
            max: max.max(1),
        }
    }

    /// Block until a permit is available
    pub fn acquire(&self) -> Permit<'_> {
        let mut active = lock(&self.active);
        while *active >= self.max {
            active = self
                .released
                .wait(active)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *active += 1;
        Permit { semaphore: self }
    }

    /// Take a permit only if one is free right now
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut active = lock(&self.active);
        if *active >= self.max {
            return None;
        }
        *active += 1;
        Some(Permit { semaphore: self })
    }

    /// Wait up to `timeout` for a permit
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<Permit<'_>> {
        let active = lock(&self.active);
        let (mut active, result) = self
            .released
            .wait_timeout_while(active, timeout, |active| *active >= self.max)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if result.timed_out() && *active >= self.max {
            return None;
        }
        *active += 1;
        Some(Permit { semaphore: self })
    }

    /// Number of permits currently held
    pub fn active(&self) -> usize {
        *lock(&self.active)
    }

    /// Maximum number of simultaneous holders
    pub fn capacity(&self) -> usize {
        self.max
    }

    fn release(&self) {
        let mut active = lock(&self.active);
        *active = active.saturating_sub(1);
        drop(active);
        self.released.notify_one();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_permits_are_released_on_drop() {
        let semaphore = Semaphore::new(2);
        let a = semaphore.acquire();
        let b = semaphore.acquire();
        assert_eq!(semaphore.active(), 2);
        assert!(semaphore.try_acquire().is_none());

        drop(a);
        assert_eq!(semaphore.active(), 1);
        assert!(semaphore.try_acquire().is_some());
        drop(b);
        assert_eq!(semaphore.active(), 0);
    }

    #[test]
    fn test_acquire_timeout_when_full() {
        let semaphore = Semaphore::new(1);
        let _held = semaphore.acquire();
        assert!(semaphore.acquire_timeout(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let semaphore = Semaphore::new(3);
        let current = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..10 {
                s.spawn(|| {
                    let _permit = semaphore.acquire();
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    current.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(semaphore.active(), 0);
    }

    #[test]
    fn test_zero_capacity_admits_one() {
        let semaphore = Semaphore::new(0);
        assert_eq!(semaphore.capacity(), 1);
        assert!(semaphore.try_acquire().is_some());
    }
}
