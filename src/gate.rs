use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Bounds how many heavy audit runs execute at once.
///
/// Backed by a fair `tokio::sync::Semaphore`: waiters queue in arrival order
/// and a released slot is handed to the head of the queue directly.
#[derive(Clone)]
pub struct ConcurrencyGate {
    max: usize,
    slots: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
}

/// One admitted slot. Dropping it releases the slot exactly once, including
/// on early return and unwinding.
pub struct GatePermit {
    permit: Option<OwnedSemaphorePermit>,
    gate: ConcurrencyGate,
}

/// Counts a waiter for as long as it is alive, so a cancelled acquire
/// leaves the queue depth correct.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("timed out waiting for a concurrency slot after {0:?}")]
    Timeout(Duration),
    #[error("concurrency gate closed")]
    Closed,
}

impl ConcurrencyGate {
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            max,
            slots: Arc::new(Semaphore::new(max)),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn in_flight(&self) -> usize {
        self.max - self.slots.available_permits()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Waits indefinitely for a slot.
    pub async fn acquire(&self) -> Result<GatePermit, GateError> {
        let acquired = {
            let _waiting = WaitingGuard::enter(&self.waiting);
            self.slots.clone().acquire_owned().await
        };
        let permit = acquired.map_err(|_| GateError::Closed)?;
        Ok(self.admitted(permit))
    }

    /// Like [`acquire`](Self::acquire) but gives up after `limit`; the
    /// abandoned waiter leaves the queue without consuming a slot.
    pub async fn acquire_timeout(&self, limit: Duration) -> Result<GatePermit, GateError> {
        let acquired = {
            let _waiting = WaitingGuard::enter(&self.waiting);
            tokio::time::timeout(limit, self.slots.clone().acquire_owned()).await
        };
        let permit = acquired
            .map_err(|_| GateError::Timeout(limit))?
            .map_err(|_| GateError::Closed)?;
        Ok(self.admitted(permit))
    }

    fn admitted(&self, permit: OwnedSemaphorePermit) -> GatePermit {
        let in_flight = self.in_flight();
        crate::metrics::gate_in_flight(in_flight);
        debug!(target = "audit.gate", in_flight, waiting = self.waiting(), "slot acquired");
        GatePermit {
            permit: Some(permit),
            gate: self.clone(),
        }
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        drop(self.permit.take());
        crate::metrics::gate_in_flight(self.gate.in_flight());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_in_flight() {
        let gate = ConcurrencyGate::new(3);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let gate = gate.clone();
            let current = current.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire().await.expect("acquire");
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                assert!(gate.in_flight() <= 3);
                tokio::time::sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.expect("task");
        }

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn waiters_are_granted_in_arrival_order() {
        let gate = ConcurrencyGate::new(2);
        let mut held = VecDeque::new();
        held.push_back(gate.acquire().await.expect("first"));
        held.push_back(gate.acquire().await.expect("second"));

        let (tx, mut rx) = mpsc::channel(8);
        for id in 0..4usize {
            let gate_for_task = gate.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let permit = gate_for_task.acquire().await.expect("queued acquire");
                let _ = tx.send((id, permit)).await;
            });
            while gate.waiting() < id + 1 {
                tokio::task::yield_now().await;
            }
        }

        let mut granted = Vec::new();
        for _ in 0..4 {
            drop(held.pop_front());
            let (id, permit) = rx.recv().await.expect("grant");
            granted.push(id);
            held.push_back(permit);
            assert_eq!(gate.in_flight(), 2);
        }
        assert_eq!(granted, vec![0, 1, 2, 3]);
    }

    async fn scrape_under_gate(gate: &ConcurrencyGate) -> Result<(), String> {
        let _permit = gate.acquire().await.map_err(|e| e.to_string())?;
        Err("scrape failed".to_string())
    }

    #[tokio::test]
    async fn failing_work_still_releases() {
        let gate = ConcurrencyGate::new(1);
        let before = gate.in_flight();
        assert!(scrape_under_gate(&gate).await.is_err());
        assert_eq!(gate.in_flight(), before);
    }

    #[tokio::test]
    async fn cancelled_waiter_is_not_counted() {
        let gate = ConcurrencyGate::new(1);
        let held = gate.acquire().await.expect("acquire");
        let task_gate = gate.clone();
        let waiter = tokio::spawn(async move {
            let _permit = task_gate.acquire().await;
        });
        while gate.waiting() < 1 {
            tokio::task::yield_now().await;
        }

        waiter.abort();
        assert!(waiter.await.is_err_and(|e| e.is_cancelled()));
        assert_eq!(gate.waiting(), 0);
        drop(held);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn panicking_work_still_releases() {
        let gate = ConcurrencyGate::new(1);
        let task_gate = gate.clone();
        let handle = tokio::spawn(async move {
            let _permit = task_gate.acquire().await.expect("acquire");
            panic!("grader exploded");
        });
        assert!(handle.await.is_err());
        assert_eq!(gate.in_flight(), 0);
        let _again = gate.acquire().await.expect("slot reusable");
        assert_eq!(gate.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_timeout_gives_up_without_leaking() {
        let gate = ConcurrencyGate::new(1);
        let held = gate.acquire().await.expect("acquire");
        let err = gate
            .acquire_timeout(Duration::from_secs(5))
            .await
            .err()
            .expect("should time out");
        assert_eq!(err, GateError::Timeout(Duration::from_secs(5)));
        assert_eq!(gate.waiting(), 0);
        drop(held);
        assert_eq!(gate.in_flight(), 0);
    }
}
