//! Process-wide hardware encode slots.
//!
//! A counting semaphore built on `parking_lot`. Acquiring blocks until a slot
//! frees up; exhaustion is backpressure and never an error. Slots are
//! released when the [`EncodePermit`] drops, including on panic unwinding.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Default number of concurrent hardware encodes
pub const DEFAULT_HARDWARE_SLOTS: usize = 2;

struct PoolInner {
    capacity: usize,
    active: Mutex<usize>,
    freed: Condvar,

    /// Highest number of simultaneously held permits
    peak: AtomicUsize,
}

/// Bounded set of hardware encode slots shared by every renderer.
///
/// Cloning is cheap; clones share the same slots.
#[derive(Clone)]
pub struct EncodePool {
    inner: Arc<PoolInner>,
}

impl EncodePool {
    /// Create a pool with `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        EncodePool {
            inner: Arc::new(PoolInner {
                capacity: capacity.max(1),
                active: Mutex::new(0),
                freed: Condvar::new(),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Permits currently held
    pub fn active(&self) -> usize {
        *self.inner.active.lock()
    }

    /// Highest `active()` value observed since creation
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::Acquire)
    }

    /// Wait for a free slot.
    pub fn acquire(&self) -> EncodePermit {
        let mut active = self.inner.active.lock();
        while *active >= self.inner.capacity {
            trace!(active = *active, "Waiting for a hardware encode slot");
            self.inner.freed.wait(&mut active);
        }
        self.grant(&mut active)
    }

    fn grant(&self, active: &mut usize) -> EncodePermit {
        *active += 1;
        self.inner.peak.fetch_max(*active, Ordering::AcqRel);
        EncodePermit {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for EncodePool {
    fn default() -> Self {
        EncodePool::new(DEFAULT_HARDWARE_SLOTS)
    }
}

impl std::fmt::Debug for EncodePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodePool")
            .field("capacity", &self.capacity())
            .field("active", &self.active())
            .finish()
    }
}

/// A held hardware encode slot; released on drop.
pub struct EncodePermit {
    inner: Arc<PoolInner>,
}

impl Drop for EncodePermit {
    fn drop(&mut self) {
        let mut active = self.inner.active.lock();
        *active = active.saturating_sub(1);
        drop(active);
        self.inner.freed.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_permit_released_on_drop() {
        let pool = EncodePool::new(1);
        let permit = pool.acquire();
        assert_eq!(pool.active(), 1);
        drop(permit);
        assert_eq!(pool.active(), 0);
        let _again = pool.acquire();
        assert_eq!(pool.active(), 1);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let pool = EncodePool::new(1);
        let held = pool.acquire();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let _permit = pool.acquire();
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        drop(held);
        waiter.join().unwrap();
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.peak(), 1);
    }

    #[test]
    fn test_concurrency_never_exceeds_capacity() {
        let pool = EncodePool::new(3);
        let handles: Vec<_> = (0..12)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let _permit = pool.acquire();
                    assert!(pool.active() <= 3);
                    thread::sleep(Duration::from_millis(30));
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.peak(), 3);
        assert_eq!(pool.active(), 0);
    }
}
