//! Step timers
//!
//! One shared facility keyed by incident. Arming a timer for an incident
//! replaces (and aborts) whatever was armed before, so at most one timer
//! per incident exists at any instant. Expiry is delivered as a
//! [`TimerFired`] event on a channel; each event carries the generation
//! it was armed with so a late event from a replaced timer can be told
//! apart from the current one.

use dashmap::DashMap;
use iris_core::IncidentId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Timer expiry event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    /// Incident whose step timed out
    pub incident_id: IncidentId,
    /// Generation the timer was armed with
    pub generation: u64,
}

#[derive(Debug)]
struct TimerEntry {
    generation: u64,
    deadline: Instant,
    task: AbortHandle,
}

/// Per-incident step timers
#[derive(Debug)]
pub struct StepTimers {
    entries: DashMap<IncidentId, TimerEntry>,
    next_generation: AtomicU64,
    fired: mpsc::UnboundedSender<TimerFired>,
}

impl StepTimers {
    /// Create timers and the channel their expiries are delivered on
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (fired, rx) = mpsc::unbounded_channel();
        (
            Self {
                entries: DashMap::new(),
                next_generation: AtomicU64::new(1),
                fired,
            },
            rx,
        )
    }

    /// Arm the timer of an incident, replacing any armed one
    ///
    /// Must be called from within a tokio runtime. Returns the generation
    /// carried by the eventual [`TimerFired`].
    pub fn arm(&self, incident_id: IncidentId, after: Duration) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + after;
        let fired = self.fired.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // receiver gone means the engine shut down
            let _ = fired.send(TimerFired {
                incident_id,
                generation,
            });
        })
        .abort_handle();

        let previous = self.entries.insert(
            incident_id,
            TimerEntry {
                generation,
                deadline,
                task,
            },
        );
        if let Some(previous) = previous {
            previous.task.abort();
            tracing::debug!(
                incident_id = %incident_id,
                replaced = previous.generation,
                generation,
                "replaced armed step timer"
            );
        }
        generation
    }

    /// Disarm the timer of an incident; returns whether one was armed
    pub fn cancel(&self, incident_id: &IncidentId) -> bool {
        match self.entries.remove(incident_id) {
            Some((_, entry)) => {
                entry.task.abort();
                true
            }
            None => false,
        }
    }

    /// Consume an expiry event
    ///
    /// Returns `true` and disarms the incident when `generation` is the
    /// one currently armed. A stale event returns `false` and leaves the
    /// current timer alone.
    pub fn take_if_current(&self, incident_id: &IncidentId, generation: u64) -> bool {
        self.entries
            .remove_if(incident_id, |_, entry| entry.generation == generation)
            .is_some()
    }

    /// Whether a timer is armed for an incident
    #[must_use]
    pub fn is_armed(&self, incident_id: &IncidentId) -> bool {
        self.entries.contains_key(incident_id)
    }

    /// Deadline of the armed timer
    #[must_use]
    pub fn deadline(&self, incident_id: &IncidentId) -> Option<Instant> {
        self.entries.get(incident_id).map(|e| e.deadline)
    }

    /// Number of armed timers
    #[must_use]
    pub fn armed(&self) -> usize {
        self.entries.len()
    }

    /// Disarm every timer
    pub fn cancel_all(&self) {
        self.entries.retain(|_, entry| {
            entry.task.abort();
            false
        });
    }
}

impl Drop for StepTimers {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            entry.task.abort();
        }
    }
}
