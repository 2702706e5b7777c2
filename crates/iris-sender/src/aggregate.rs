//! Message aggregation
//!
//! When more than `threshold_count` messages for the same plan,
//! application, priority and target arrive within `threshold_window`, the
//! key starts aggregating: further messages are held and flushed every
//! `aggregation_window` as one batch. Aggregation ends once the key has
//! been quiet for `aggregation_reset`.

use dashmap::DashMap;
use iris_core::{AggregationPolicy, BatchId, BatchInfo, IncidentId, Message, MessageId, Priority};
use std::collections::VecDeque;
use tokio::time::Instant;

/// Grouping key for aggregation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregationKey {
    /// Plan name
    pub plan: String,
    /// Application
    pub application: String,
    /// Priority
    pub priority: Priority,
    /// Target user
    pub target: String,
}

impl AggregationKey {
    /// Key for a message; out-of-band messages are never aggregated
    #[must_use]
    pub fn of(message: &Message) -> Option<Self> {
        Some(Self {
            plan: message.origin.plan()?.to_owned(),
            application: message.application.clone(),
            priority: message.priority,
            target: message.target.clone(),
        })
    }
}

/// Result of admitting a message
#[derive(Debug)]
pub enum AggregateDecision {
    /// Send now
    Send(Box<Message>),
    /// Held for the next batch
    Held,
}

#[derive(Debug)]
struct KeyState {
    policy: AggregationPolicy,
    arrivals: VecDeque<Instant>,
    aggregating: bool,
    last_arrival: Instant,
    last_flush: Instant,
    held: Vec<Message>,
}

/// Aggregation state for every key
#[derive(Debug, Default)]
pub struct Aggregator {
    keys: DashMap<AggregationKey, KeyState>,
}

impl Aggregator {
    /// Create empty aggregator
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a message under a policy
    pub fn admit(&self, message: Message, policy: &AggregationPolicy) -> AggregateDecision {
        let Some(key) = AggregationKey::of(&message) else {
            return AggregateDecision::Send(Box::new(message));
        };
        let now = Instant::now();
        let mut state = self.keys.entry(key).or_insert_with(|| KeyState {
            policy: *policy,
            arrivals: VecDeque::new(),
            aggregating: false,
            last_arrival: now,
            last_flush: now,
            held: Vec::new(),
        });
        state.policy = *policy;

        if state.aggregating {
            if now.duration_since(state.last_arrival) > policy.aggregation_reset() {
                tracing::info!(target_user = %message.target, "aggregation ended");
                state.aggregating = false;
                state.arrivals.clear();
            } else {
                state.last_arrival = now;
                state.held.push(message);
                return AggregateDecision::Held;
            }
        }

        state.last_arrival = now;
        let window = policy.threshold_window();
        while state
            .arrivals
            .front()
            .is_some_and(|at| now.duration_since(*at) > window)
        {
            state.arrivals.pop_front();
        }
        state.arrivals.push_back(now);

        if state.arrivals.len() > policy.threshold_count as usize {
            tracing::info!(
                target_user = %message.target,
                arrivals = state.arrivals.len(),
                "aggregation started"
            );
            state.aggregating = true;
            state.last_flush = now;
            state.held.push(message);
            return AggregateDecision::Held;
        }
        AggregateDecision::Send(Box::new(message))
    }

    /// Flush keys whose aggregation window has elapsed
    ///
    /// Held messages that `is_stale` are dropped. A key with a single
    /// remaining message flushes it unchanged; several become one batch
    /// message. Keys quiet for `aggregation_reset` with nothing held stop
    /// aggregating and are forgotten.
    pub fn flush_due(&self, is_stale: impl Fn(&Message) -> bool) -> Vec<Message> {
        let now = Instant::now();
        let mut flushed = Vec::new();

        self.keys.retain(|key, state| {
            if !state.held.is_empty()
                && now.duration_since(state.last_flush) >= state.policy.aggregation_window()
            {
                state.last_flush = now;
                let held = std::mem::take(&mut state.held);
                let live: Vec<Message> = held
                    .into_iter()
                    .filter(|m| !is_stale(m))
                    .collect();
                if let Some(batch) = into_batch(live) {
                    flushed.push(batch);
                }
            }
            let quiet = now.duration_since(state.last_arrival);
            if state.aggregating
                && state.held.is_empty()
                && quiet > state.policy.aggregation_reset()
            {
                tracing::info!(target_user = %key.target, "aggregation ended");
                state.aggregating = false;
                state.arrivals.clear();
            }
            // keep keys that may still aggregate or count arrivals
            state.aggregating
                || !state.held.is_empty()
                || quiet <= state.policy.threshold_window()
        });

        flushed
    }

    /// Whether a key is aggregating
    #[must_use]
    pub fn is_aggregating(&self, key: &AggregationKey) -> bool {
        self.keys.get(key).is_some_and(|s| s.aggregating)
    }

    /// Keys being tracked
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }

    /// Messages held across all keys
    #[must_use]
    pub fn held(&self) -> usize {
        self.keys.iter().map(|s| s.held.len()).sum()
    }
}

fn into_batch(mut messages: Vec<Message>) -> Option<Message> {
    match messages.len() {
        0 => None,
        1 => messages.pop(),
        _ => {
            let message_ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
            let mut incident_ids: Vec<IncidentId> = Vec::new();
            let mut runs: Vec<(IncidentId, u64)> = Vec::new();
            for (id, run) in messages.iter().filter_map(|m| m.origin.run()) {
                if !incident_ids.contains(&id) {
                    incident_ids.push(id);
                }
                if !runs.contains(&(id, run)) {
                    runs.push((id, run));
                }
            }
            let mut batch = messages.swap_remove(0);
            batch.id = MessageId::new();
            batch.fingerprint = None;
            batch.batch = Some(BatchInfo {
                id: BatchId::new(),
                message_ids,
                incident_ids,
                runs,
            });
            Some(batch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iris_core::{Contact, MessageOrigin, Mode};
    use std::time::Duration;

    fn policy() -> AggregationPolicy {
        AggregationPolicy {
            threshold_window_secs: 60,
            threshold_count: 2,
            aggregation_window_secs: 30,
            aggregation_reset_secs: 120,
        }
    }

    fn message(incident_id: IncidentId) -> Message {
        Message::new(
            MessageOrigin::Escalation {
                incident_id,
                run: 1,
                plan: "noisy".into(),
                step: 0,
            },
            "api",
            "alice",
            Priority::High,
            vec![Contact::new(Mode::email(), "alice@example.com")],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn aggregates_after_threshold_and_flushes_batch() {
        let aggregator = Aggregator::new();
        let policy = policy();

        for _ in 0..2 {
            assert!(matches!(
                aggregator.admit(message(IncidentId::new()), &policy),
                AggregateDecision::Send(_)
            ));
        }
        for _ in 0..3 {
            assert!(matches!(
                aggregator.admit(message(IncidentId::new()), &policy),
                AggregateDecision::Held
            ));
        }
        assert_eq!(aggregator.held(), 3);
        assert!(aggregator.flush_due(|_| false).is_empty());

        tokio::time::advance(Duration::from_secs(30)).await;
        let flushed = aggregator.flush_due(|_| false);
        assert_eq!(flushed.len(), 1);
        let batch = flushed[0].batch.as_ref().unwrap();
        assert_eq!(batch.message_ids.len(), 3);
        assert_eq!(batch.incident_ids.len(), 3);
        assert_eq!(aggregator.held(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_messages_dropped_at_flush() {
        let aggregator = Aggregator::new();
        let policy = policy();
        let resolved = IncidentId::new();
        for _ in 0..2 {
            aggregator.admit(message(IncidentId::new()), &policy);
        }
        aggregator.admit(message(resolved), &policy);
        let live = IncidentId::new();
        aggregator.admit(message(live), &policy);

        tokio::time::advance(Duration::from_secs(30)).await;
        let flushed = aggregator.flush_due(|m| m.incident_id() == Some(resolved));
        assert_eq!(flushed.len(), 1);
        assert!(flushed[0].batch.is_none());
        assert_eq!(flushed[0].incident_id(), Some(live));
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_period_ends_aggregation() {
        let aggregator = Aggregator::new();
        let policy = policy();
        for _ in 0..3 {
            aggregator.admit(message(IncidentId::new()), &policy);
        }
        let key = AggregationKey::of(&message(IncidentId::new())).unwrap();
        assert!(aggregator.is_aggregating(&key));

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(matches!(
            aggregator.admit(message(IncidentId::new()), &policy),
            AggregateDecision::Send(_)
        ));
        assert!(!aggregator.is_aggregating(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_key_is_forgotten_after_reset() {
        let aggregator = Aggregator::new();
        let policy = policy();
        for _ in 0..3 {
            aggregator.admit(message(IncidentId::new()), &policy);
        }
        let key = AggregationKey::of(&message(IncidentId::new())).unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(aggregator.flush_due(|_| false).len(), 1);
        assert!(aggregator.is_aggregating(&key));
        assert_eq!(aggregator.tracked_keys(), 1);

        // still inside the reset period
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(aggregator.flush_due(|_| false).is_empty());
        assert_eq!(aggregator.tracked_keys(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(aggregator.flush_due(|_| false).is_empty());
        assert!(!aggregator.is_aggregating(&key));
        assert_eq!(aggregator.tracked_keys(), 0);
    }

    #[test]
    fn out_of_band_never_aggregated() {
        let message = Message::new(MessageOrigin::OutOfBand, "api", "alice", Priority::Low, vec![]);
        assert!(AggregationKey::of(&message).is_none());
    }
}
