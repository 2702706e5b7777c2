//! Priority delivery queue
//!
//! Ready messages pop in priority order (most urgent first), ties broken by
//! original enqueue time. Messages deferred by the rate limiter or waiting
//! out a retry backoff sit in a delay heap and move to the ready heap once
//! due; they keep their original enqueue time so a retried message does not
//! lose its place to newer messages of the same priority.
//!
//! Messages of cancelled incident runs are discarded at pop time. A cancel
//! mark covers a run generation and every earlier one, so a later run of
//! the same incident is unaffected.

use dashmap::DashMap;
use iris_core::{IncidentId, Message, QueueError};
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct Queued {
    urgency: u8,
    enqueued_at: std::time::Instant,
    seq: u64,
    message: Message,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // max-heap: higher urgency first, then older first
    fn cmp(&self, other: &Self) -> Ordering {
        self.urgency
            .cmp(&other.urgency)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Delayed {
    ready_at: Instant,
    seq: u64,
    entry: Queued,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ready_at
            .cmp(&other.ready_at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct Inner {
    ready: BinaryHeap<Queued>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    next_seq: u64,
    closed: bool,
}

impl Inner {
    fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    fn entry(&mut self, message: Message) -> Queued {
        let seq = self.next_seq;
        self.next_seq += 1;
        Queued {
            urgency: message.priority.urgency(),
            enqueued_at: message.enqueued_at,
            seq,
            message,
        }
    }

    fn promote_due(&mut self, now: Instant) {
        while self
            .delayed
            .peek()
            .is_some_and(|Reverse(d)| d.ready_at <= now)
        {
            if let Some(Reverse(delayed)) = self.delayed.pop() {
                self.ready.push(delayed.entry);
            }
        }
    }
}

/// Bounded priority queue shared by the engine and the worker pool
pub struct DeliveryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    /// Latest cancelled run generation per incident
    cancelled: DashMap<IncidentId, u64>,
    discarded: AtomicU64,
}

impl DeliveryQueue {
    /// Create queue
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity,
            cancelled: DashMap::new(),
            discarded: AtomicU64::new(0),
        }
    }

    /// Enqueue for immediate delivery
    ///
    /// # Errors
    /// - `QueueError::Saturated` when the queue is full
    /// - `QueueError::Closed` after shutdown
    pub fn push(&self, message: Message) -> Result<(), QueueError> {
        self.push_delayed(message, Duration::ZERO)
    }

    /// Enqueue for delivery after a delay
    ///
    /// # Errors
    /// - `QueueError::Saturated` when the queue is full
    /// - `QueueError::Closed` after shutdown
    pub fn push_delayed(&self, message: Message, delay: Duration) -> Result<(), QueueError> {
        self.insert(message, delay, true)
    }

    /// Put back an in-flight message, bypassing the capacity check
    ///
    /// # Errors
    /// `QueueError::Closed` after shutdown
    pub fn requeue(&self, message: Message, delay: Duration) -> Result<(), QueueError> {
        self.insert(message, delay, false)
    }

    fn insert(&self, message: Message, delay: Duration, bounded: bool) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        if bounded && inner.len() >= self.capacity {
            return Err(QueueError::Saturated {
                capacity: self.capacity,
            });
        }
        let entry = inner.entry(message);
        if delay.is_zero() {
            inner.ready.push(entry);
        } else {
            let seq = entry.seq;
            inner.delayed.push(Reverse(Delayed {
                ready_at: Instant::now() + delay,
                seq,
                entry,
            }));
        }
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Next message, waiting until one is ready
    ///
    /// Returns `None` once the queue is closed and no ready message remains.
    pub async fn pop(&self) -> Option<Message> {
        loop {
            // registered before checking so a close or push in between is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut inner = self.inner.lock();
                inner.promote_due(Instant::now());
                while let Some(entry) = inner.ready.pop() {
                    if self.is_stale(&entry.message) {
                        self.discard(&entry.message);
                        continue;
                    }
                    return Some(entry.message);
                }
                if inner.closed {
                    return None;
                }
                inner.delayed.peek().map(|Reverse(d)| d.ready_at)
            };

            match next_due {
                Some(at) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Next ready message without waiting
    pub fn try_pop(&self) -> Option<Message> {
        let mut inner = self.inner.lock();
        inner.promote_due(Instant::now());
        while let Some(entry) = inner.ready.pop() {
            if self.is_stale(&entry.message) {
                self.discard(&entry.message);
                continue;
            }
            return Some(entry.message);
        }
        None
    }

    /// Discard queued and future messages of a run and its predecessors
    pub fn cancel_run(&self, incident_id: IncidentId, run: u64) {
        self.cancelled
            .entry(incident_id)
            .and_modify(|latest| *latest = (*latest).max(run))
            .or_insert(run);
    }

    /// Whether a run of an incident was cancelled
    #[must_use]
    pub fn is_cancelled(&self, incident_id: &IncidentId, run: u64) -> bool {
        self.cancelled
            .get(incident_id)
            .is_some_and(|latest| run <= *latest)
    }

    /// Stop tracking a cancelled incident
    pub fn forget_incident(&self, incident_id: &IncidentId) {
        self.cancelled.remove(incident_id);
    }

    /// Whether a message belongs only to cancelled runs
    #[must_use]
    pub fn is_stale(&self, message: &Message) -> bool {
        if let Some(batch) = &message.batch {
            return !batch.runs.is_empty()
                && batch
                    .runs
                    .iter()
                    .all(|(id, run)| self.is_cancelled(id, *run));
        }
        message
            .origin
            .run()
            .is_some_and(|(id, run)| self.is_cancelled(&id, run))
    }

    fn discard(&self, message: &Message) {
        self.discarded.fetch_add(1, AtomicOrdering::Relaxed);
        tracing::debug!(message_id = %message.id, "discarded message of cancelled incident");
    }

    /// Stop accepting messages and wake every waiter
    ///
    /// Ready messages still drain; delayed messages are dropped.
    pub fn close(&self) {
        let dropped = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            let dropped = inner.delayed.len();
            inner.delayed.clear();
            dropped
        };
        if dropped > 0 {
            tracing::warn!(dropped, "dropped delayed messages on close");
        }
        self.notify.notify_waiters();
    }

    /// Whether the queue is closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Messages queued, ready or delayed
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages discarded because their incident was cancelled
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.discarded.load(AtomicOrdering::Relaxed)
    }
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DeliveryQueue")
            .field("ready", &inner.ready.len())
            .field("delayed", &inner.delayed.len())
            .field("capacity", &self.capacity)
            .field("closed", &inner.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iris_core::{Contact, MessageOrigin, Mode, Priority};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn message(priority: Priority, target: &str) -> Message {
        Message::new(
            MessageOrigin::OutOfBand,
            "app",
            target,
            priority,
            vec![Contact::new(Mode::email(), "x@example.com")],
        )
    }

    fn incident_message(incident_id: IncidentId, run: u64) -> Message {
        Message::new(
            MessageOrigin::Escalation {
                incident_id,
                run,
                plan: "db".into(),
                step: 0,
            },
            "app",
            "alice",
            Priority::High,
            vec![Contact::new(Mode::email(), "x@example.com")],
        )
    }

    #[tokio::test]
    async fn urgent_pops_first_then_fifo() {
        let queue = DeliveryQueue::new(10);
        queue.push(message(Priority::Low, "a")).unwrap();
        queue.push(message(Priority::Urgent, "b")).unwrap();
        queue.push(message(Priority::Low, "c")).unwrap();
        queue.push(message(Priority::Urgent, "d")).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| queue.try_pop())
            .map(|m| m.target)
            .collect();
        assert_eq!(order, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn saturation_rejected() {
        let queue = DeliveryQueue::new(1);
        queue.push(message(Priority::Low, "a")).unwrap();
        assert_eq!(
            queue.push(message(Priority::Low, "b")),
            Err(QueueError::Saturated { capacity: 1 })
        );
        // in-flight retries are never rejected for capacity
        assert!(queue
            .requeue(message(Priority::Low, "c"), Duration::ZERO)
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_message_waits() {
        let queue = Arc::new(DeliveryQueue::new(10));
        queue
            .push_delayed(message(Priority::High, "a"), Duration::from_secs(5))
            .unwrap();
        assert!(queue.try_pop().is_none());

        let started = Instant::now();
        let popped = queue.pop().await.unwrap();
        assert_eq!(popped.target, "a");
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = Arc::new(DeliveryQueue::new(10));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(message(Priority::Low, "late")).unwrap();
        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped.target, "late");
    }

    #[tokio::test]
    async fn cancelled_incident_discarded() {
        let queue = DeliveryQueue::new(10);
        let incident = IncidentId::new();
        queue.push(incident_message(incident, 1)).unwrap();
        queue.push(message(Priority::Low, "other")).unwrap();
        queue.cancel_run(incident, 1);

        assert_eq!(queue.try_pop().map(|m| m.target), Some("other".into()));
        assert!(queue.try_pop().is_none());
        assert_eq!(queue.discarded(), 1);
    }

    #[tokio::test]
    async fn close_ends_pop() {
        let queue = Arc::new(DeliveryQueue::new(10));
        queue.push(message(Priority::Low, "a")).unwrap();
        queue.close();
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
        assert_eq!(
            queue.push(message(Priority::Low, "b")),
            Err(QueueError::Closed)
        );
    }

    #[test]
    fn later_run_survives_earlier_cancel() {
        let queue = DeliveryQueue::new(10);
        let incident = IncidentId::new();
        queue
            .requeue(incident_message(incident, 1), Duration::ZERO)
            .unwrap();
        queue.cancel_run(incident, 1);
        queue.push(incident_message(incident, 2)).unwrap();

        let popped = queue.try_pop().unwrap();
        assert_eq!(popped.origin.run(), Some((incident, 2)));
        assert!(queue.try_pop().is_none());
        assert_eq!(queue.discarded(), 1);

        // an older mark never lowers a newer one
        queue.cancel_run(incident, 2);
        queue.cancel_run(incident, 1);
        assert!(queue.is_cancelled(&incident, 2));
        assert!(!queue.is_cancelled(&incident, 3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pushes_respect_capacity() {
        let queue = Arc::new(DeliveryQueue::new(16));
        let pushers: Vec<_> = (0..8)
            .map(|task| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    (0..10)
                        .filter(|i| {
                            queue
                                .push(message(Priority::Low, &format!("{task}-{i}")))
                                .is_ok()
                        })
                        .count()
                })
            })
            .collect();

        let mut accepted = 0;
        for pusher in pushers {
            accepted += pusher.await.unwrap();
        }
        assert_eq!(accepted, 16);
        assert_eq!(queue.len(), 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_poppers_take_each_message_once() {
        let queue = Arc::new(DeliveryQueue::new(200));
        for i in 0..100 {
            let priority = if i % 2 == 0 { Priority::Urgent } else { Priority::Low };
            queue.push(message(priority, &i.to_string())).unwrap();
        }
        queue.close();

        let poppers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut taken = Vec::new();
                    while let Some(message) = queue.pop().await {
                        taken.push(message);
                    }
                    taken
                })
            })
            .collect();

        let mut seen = std::collections::HashSet::new();
        for popper in poppers {
            let taken = popper.await.unwrap();
            // each popper sees urgent messages before low ones
            let first_low = taken
                .iter()
                .position(|m| m.priority == Priority::Low)
                .unwrap_or(taken.len());
            assert!(taken[first_low..].iter().all(|m| m.priority == Priority::Low));
            for message in taken {
                assert!(seen.insert(message.target));
            }
        }
        assert_eq!(seen.len(), 100);
    }

    fn priority() -> impl Strategy<Value = Priority> {
        proptest::sample::select(Priority::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_pop_order_is_priority_then_fifo(
            priorities in proptest::collection::vec(priority(), 1..40)
        ) {
            let queue = DeliveryQueue::new(priorities.len());
            for (i, priority) in priorities.iter().enumerate() {
                queue.push(message(*priority, &i.to_string())).unwrap();
            }

            let mut expected: Vec<(u8, usize)> = priorities
                .iter()
                .enumerate()
                .map(|(i, p)| (p.urgency(), i))
                .collect();
            expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

            let popped: Vec<String> = std::iter::from_fn(|| queue.try_pop())
                .map(|m| m.target)
                .collect();
            let expected: Vec<String> = expected.iter().map(|(_, i)| i.to_string()).collect();
            prop_assert_eq!(popped, expected);
        }
    }
}
