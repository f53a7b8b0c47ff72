//! Bounded FIFO of requests waiting for an eligible context.
//!
//! Wake-ups are edge-triggered and pair a freshly idle context with the
//! first waiter whose tag constraints it satisfies. This is not strict FIFO
//! across tag partitions, but it is FIFO within any single tag set.
//!
//! A wake delivers the armed [`Lease`] itself: the context is assigned
//! (busy) on the waiter's behalf at pairing time, and the lease's drop
//! guard releases it if the waiter has vanished by the time the message
//! would be read.

use std::collections::{BTreeSet, VecDeque};

use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use scraper_pool_common::PoolError;

use crate::pool::Lease;

pub(crate) struct Waiter {
    pub id: Uuid,
    pub required_tags: BTreeSet<String>,
    pub enqueued_at: Instant,
    pub deadline: Instant,
    pub tx: oneshot::Sender<Result<Lease, PoolError>>,
}

#[derive(Default)]
pub(crate) struct RequestQueue {
    waiters: VecDeque<Waiter>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn push(&mut self, waiter: Waiter) {
        self.waiters.push_back(waiter);
    }

    /// Remove a waiter by id. Idempotent: returns false when the waiter is
    /// no longer queued.
    pub fn cancel(&mut self, id: Uuid) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.id != id);
        self.waiters.len() != before
    }

    /// Remove and take the first waiter whose tag constraints `tags`
    /// satisfy. Later waiters stay queued untouched.
    pub fn take_match(&mut self, tags: &BTreeSet<String>) -> Option<Waiter> {
        let pos = self
            .waiters
            .iter()
            .position(|w| w.required_tags.iter().all(|t| tags.contains(t)))?;
        self.waiters.remove(pos)
    }

    /// Fail and remove every waiter past its deadline. Returns how many
    /// expired.
    pub fn expire_due(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        let mut keep = VecDeque::with_capacity(self.waiters.len());

        for waiter in self.waiters.drain(..) {
            if waiter.deadline <= now {
                let waited = waiter.deadline.saturating_duration_since(waiter.enqueued_at);
                let _ = waiter.tx.send(Err(PoolError::QueueTimeout(waited)));
                expired += 1;
            } else {
                keep.push_back(waiter);
            }
        }

        self.waiters = keep;
        expired
    }

    /// Fail and remove every waiter, e.g. on shutdown or when the pool goes
    /// degraded.
    pub fn fail_all<F>(&mut self, mut make_error: F) -> usize
    where
        F: FnMut() -> PoolError,
    {
        let mut failed = 0;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.tx.send(Err(make_error()));
            failed += 1;
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn waiter(
        tags: &[&str],
        max_wait: Duration,
    ) -> (Waiter, oneshot::Receiver<Result<Lease, PoolError>>) {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        (
            Waiter {
                id: Uuid::new_v4(),
                required_tags: tags.iter().map(|t| t.to_string()).collect(),
                enqueued_at: now,
                deadline: now + max_wait,
                tx,
            },
            rx,
        )
    }

    fn tagset(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn take_match_is_fifo_within_a_tag_set() {
        let mut queue = RequestQueue::new();
        let (first, _rx1) = waiter(&["premium"], Duration::from_secs(10));
        let (second, _rx2) = waiter(&["premium"], Duration::from_secs(10));
        let first_id = first.id;
        queue.push(first);
        queue.push(second);

        let taken = queue.take_match(&tagset(&["premium", "eu"])).unwrap();
        assert_eq!(taken.id, first_id);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn take_match_skips_unsatisfied_waiters() {
        let mut queue = RequestQueue::new();
        let (premium, _rx1) = waiter(&["premium"], Duration::from_secs(10));
        let (basic, _rx2) = waiter(&["basic"], Duration::from_secs(10));
        let basic_id = basic.id;
        queue.push(premium);
        queue.push(basic);

        // A basic context must not serve the older premium waiter.
        let taken = queue.take_match(&tagset(&["basic"])).unwrap();
        assert_eq!(taken.id, basic_id);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn take_match_returns_none_without_candidates() {
        let mut queue = RequestQueue::new();
        let (premium, _rx) = waiter(&["premium"], Duration::from_secs(10));
        queue.push(premium);

        assert!(queue.take_match(&tagset(&[])).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn expire_due_fails_overdue_waiters() {
        let mut queue = RequestQueue::new();
        let (due, rx) = waiter(&[], Duration::from_millis(0));
        let (fresh, _rx2) = waiter(&[], Duration::from_secs(60));
        queue.push(due);
        queue.push(fresh);

        let expired = queue.expire_due(Instant::now() + Duration::from_millis(1));
        assert_eq!(expired, 1);
        assert_eq!(queue.len(), 1);
        assert!(matches!(rx.await, Ok(Err(PoolError::QueueTimeout(_)))));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let mut queue = RequestQueue::new();
        let (w, _rx) = waiter(&[], Duration::from_secs(10));
        let id = w.id;
        queue.push(w);

        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));
    }

    #[tokio::test]
    async fn fail_all_drains_the_queue() {
        let mut queue = RequestQueue::new();
        let (a, rx_a) = waiter(&[], Duration::from_secs(10));
        let (b, rx_b) = waiter(&["premium"], Duration::from_secs(10));
        queue.push(a);
        queue.push(b);

        assert_eq!(queue.fail_all(|| PoolError::Shutdown), 2);
        assert_eq!(queue.len(), 0);
        assert!(matches!(rx_a.await, Ok(Err(PoolError::Shutdown))));
        assert!(matches!(rx_b.await, Ok(Err(PoolError::Shutdown))));
    }
}
