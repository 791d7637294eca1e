// SPDX-License-Identifier: MIT

//! Bounded-concurrency dispatch keyed by step class, implemented as a
//! per-class semaphore rather than one global dispatcher.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct ClassSlot {
    semaphore: Arc<Semaphore>,
    cap: usize,
    in_flight: Arc<AtomicUsize>,
}

/// One semaphore per step class, plus a live in-flight counter for a
/// utilization metric. Classes not configured up front are created
/// lazily on first `acquire` with `default_cap`, so `&self` suffices and
/// the pool can be shared via `Arc` across every concurrently-dispatched
/// step.
pub struct WorkerPool {
    classes: Mutex<HashMap<String, ClassSlot>>,
    default_cap: usize,
}

/// Held for the lifetime of a dispatched step run; releases the class slot
/// on drop.
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    /// `caps` gives the per-class concurrency cap (defaults: filesystem=1,
    /// ast=1, summarizer=N, docgrapher=1); `default_cap` covers step
    /// classes not named explicitly.
    pub fn new(caps: HashMap<String, usize>, default_cap: usize) -> Self {
        let classes = caps
            .into_iter()
            .map(|(name, cap)| {
                let cap = cap.max(1);
                (
                    name,
                    ClassSlot {
                        semaphore: Arc::new(Semaphore::new(cap)),
                        cap,
                        in_flight: Arc::new(AtomicUsize::new(0)),
                    },
                )
            })
            .collect();
        Self {
            classes: Mutex::new(classes),
            default_cap,
        }
    }

    fn slot_handles(&self, class: &str) -> (Arc<Semaphore>, Arc<AtomicUsize>, usize) {
        let mut classes = self.classes.lock();
        let slot = classes.entry(class.to_string()).or_insert_with(|| {
            let cap = self.default_cap.max(1);
            ClassSlot {
                semaphore: Arc::new(Semaphore::new(cap)),
                cap,
                in_flight: Arc::new(AtomicUsize::new(0)),
            }
        });
        (slot.semaphore.clone(), slot.in_flight.clone(), slot.cap)
    }

    /// Acquire a slot for `class`, waiting (FIFO per `tokio::sync::Semaphore`
    /// ordering) if the class is at capacity.
    // Allow expect here: this pool never calls `Semaphore::close`, so
    // `acquire_owned` cannot observe a closed semaphore.
    #[allow(clippy::expect_used)]
    pub async fn acquire(&self, class: &str) -> WorkerPermit {
        let (semaphore, in_flight, _cap) = self.slot_handles(class);
        let permit = semaphore
            .acquire_owned()
            .await
            .expect("worker pool semaphore is never closed");
        in_flight.fetch_add(1, Ordering::SeqCst);
        WorkerPermit { _permit: permit, in_flight }
    }

    /// Current utilization for `class` as `(in_flight, cap)`.
    pub fn utilization(&self, class: &str) -> (usize, usize) {
        match self.classes.lock().get(class) {
            Some(slot) => (slot.in_flight.load(Ordering::SeqCst), slot.cap),
            None => (0, self.default_cap),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_blocks_beyond_class_capacity() {
        let mut caps = HashMap::new();
        caps.insert("filesystem".to_string(), 1);
        let pool = Arc::new(WorkerPool::new(caps, 4));

        let first = pool.acquire("filesystem").await;
        assert_eq!(pool.utilization("filesystem"), (1, 1));

        let acquire_second =
            tokio::time::timeout(Duration::from_millis(50), pool.acquire("filesystem")).await;
        assert!(acquire_second.is_err(), "second acquire should block while first permit is held");

        drop(first);
        let second = pool.acquire("filesystem").await;
        assert_eq!(pool.utilization("filesystem"), (1, 1));
        drop(second);
    }

    #[tokio::test]
    async fn unconfigured_class_falls_back_to_default_cap() {
        let pool = WorkerPool::new(HashMap::new(), 2);
        let permit = pool.acquire("docgrapher").await;
        assert_eq!(pool.utilization("docgrapher"), (1, 2));
        drop(permit);
    }

    #[tokio::test]
    async fn distinct_classes_do_not_share_capacity() {
        let mut caps = HashMap::new();
        caps.insert("filesystem".to_string(), 1);
        caps.insert("ast".to_string(), 1);
        let pool = WorkerPool::new(caps, 4);
        let fs_permit = pool.acquire("filesystem").await;
        let ast_permit = pool.acquire("ast").await;
        assert_eq!(pool.utilization("filesystem"), (1, 1));
        assert_eq!(pool.utilization("ast"), (1, 1));
        drop(fs_permit);
        drop(ast_permit);
    }
}
