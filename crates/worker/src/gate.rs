//! Admission control for generation
//!
//! A fixed number of slots backed by a FIFO-fair tokio semaphore. A slot is
//! an RAII token: dropping it (on success, failure, panic or a cancelled
//! stream) returns the permit, so the number of releases always equals the
//! number of acquisitions.

use chatserve_common::{Result, ServeError, METRICS};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::trace;

/// Relative throughput hint reported to the controller
pub const DEFAULT_SPEED: f64 = 1.0;

/// Load figures derived from the gate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerLoadSnapshot {
    /// Slots currently held
    pub queue_length: usize,
    pub speed: f64,
}

#[derive(Debug)]
struct GateInner {
    semaphore: Arc<Semaphore>,
    limit: usize,
    waiting: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl GateInner {
    fn in_use(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    fn publish(&self) {
        METRICS.worker.slots_in_use.set(self.in_use() as i64);
        METRICS.worker.slots_waiting.set(self.waiting.load(Ordering::Relaxed) as i64);
    }
}

/// Bounded-slot admission controller; cheap to clone, clones share slots
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    inner: Arc<GateInner>,
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                semaphore: Arc::new(Semaphore::new(limit)),
                limit,
                waiting: AtomicUsize::new(0),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    /// Wait for a free slot. Waiters are served in arrival order.
    ///
    /// Cancel-safe: dropping the future while queued takes no slot.
    pub async fn acquire(&self) -> Result<ConcurrencySlot> {
        let waiting = WaitingGuard::enter(&self.inner);
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ServeError::internal("concurrency gate closed"))?;
        drop(waiting);

        Ok(self.admit(permit))
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<ConcurrencySlot> {
        match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => Some(self.admit(permit)),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> ConcurrencySlot {
        self.inner.acquired.fetch_add(1, Ordering::SeqCst);
        self.inner.publish();
        trace!("Slot acquired, {} of {} in use", self.inner.in_use(), self.inner.limit);

        ConcurrencySlot {
            permit: Some(permit),
            inner: Arc::clone(&self.inner),
            acquired_at: Instant::now(),
        }
    }

    /// Slots currently held. Never blocks.
    pub fn queue_length(&self) -> usize {
        self.inner.in_use()
    }

    /// Callers suspended in `acquire`
    pub fn waiting(&self) -> usize {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Total successful acquisitions
    pub fn acquired_total(&self) -> u64 {
        self.inner.acquired.load(Ordering::SeqCst)
    }

    /// Total releases
    pub fn released_total(&self) -> u64 {
        self.inner.released.load(Ordering::SeqCst)
    }

    pub fn load_snapshot(&self) -> WorkerLoadSnapshot {
        WorkerLoadSnapshot {
            queue_length: self.queue_length(),
            speed: DEFAULT_SPEED,
        }
    }
}

/// Counts a caller as waiting until it gets a permit or gives up
struct WaitingGuard<'a> {
    inner: &'a GateInner,
}

impl<'a> WaitingGuard<'a> {
    fn enter(inner: &'a GateInner) -> Self {
        inner.waiting.fetch_add(1, Ordering::SeqCst);
        inner.publish();
        Self { inner }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.inner.waiting.fetch_sub(1, Ordering::SeqCst);
        self.inner.publish();
    }
}

/// One held slot. Released exactly once: explicitly or on drop.
#[derive(Debug)]
pub struct ConcurrencySlot {
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<GateInner>,
    acquired_at: Instant,
}

impl ConcurrencySlot {
    /// How long this slot has been held
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Give the slot back now
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(permit) = self.permit.take() {
            drop(permit);
            self.inner.released.fetch_add(1, Ordering::SeqCst);
            self.inner.publish();
            trace!("Slot released after {:?}", self.acquired_at.elapsed());
        }
    }
}

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let gate = ConcurrencyGate::new(2);
        assert_eq!(gate.queue_length(), 0);

        let a = gate.acquire().await.unwrap();
        let b = gate.acquire().await.unwrap();
        assert_eq!(gate.queue_length(), 2);
        assert!(gate.try_acquire().is_none());

        a.release();
        assert_eq!(gate.queue_length(), 1);
        drop(b);
        assert_eq!(gate.queue_length(), 0);
        assert_eq!(gate.acquired_total(), 2);
        assert_eq!(gate.released_total(), 2);
    }

    #[tokio::test]
    async fn test_waiter_resumes_when_slot_freed() {
        let gate = ConcurrencyGate::new(1);
        let held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|slot| slot.held_for()) })
        };

        tokio::task::yield_now().await;
        assert_eq!(gate.waiting(), 1);

        drop(held);
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(gate.waiting(), 0);
        assert_eq!(gate.queue_length(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_wait_takes_no_slot() {
        let gate = ConcurrencyGate::new(1);
        let held = gate.acquire().await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(10), gate.acquire()).await;
        assert!(result.is_err());
        assert_eq!(gate.waiting(), 0);

        drop(held);
        assert_eq!(gate.available(), 1);
        assert_eq!(gate.acquired_total(), gate.released_total());
    }

    #[tokio::test]
    async fn test_queue_length_is_stable_when_idle() {
        let gate = ConcurrencyGate::new(5);
        let _slot = gate.acquire().await.unwrap();
        let readings: Vec<_> = (0..10).map(|_| gate.load_snapshot()).collect();
        assert!(readings.iter().all(|r| r.queue_length == 1 && r.speed == DEFAULT_SPEED));
    }

    #[tokio::test]
    async fn test_burst_never_exceeds_limit() {
        let gate = ConcurrencyGate::new(3);
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let gate = gate.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let slot = gate.acquire().await.unwrap();
                peak.fetch_max(gate.queue_length(), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                drop(slot);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(gate.acquired_total(), 12);
        assert_eq!(gate.released_total(), 12);
        assert_eq!(gate.queue_length(), 0);
    }
}
