//! Duplicate suppression
//!
//! A message whose fingerprint was first seen less than one window ago is
//! suppressed. The window is anchored at the first delivery: later
//! duplicates do not extend it. Entries expire lazily on lookup and an
//! optional sweeper task bounds memory for fingerprints never seen again.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use iris_core::Fingerprint;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Result of a quench check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuenchDecision {
    /// First occurrence within the window
    Deliver,
    /// Duplicate; carries the number suppressed so far in this window
    Suppressed {
        /// Suppressed count including this one
        suppressed: u64,
    },
}

impl QuenchDecision {
    /// Whether the message should be dropped
    #[inline]
    #[must_use]
    pub fn is_suppressed(self) -> bool {
        matches!(self, Self::Suppressed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct QuenchEntry {
    first_seen: Instant,
    suppressed: u64,
}

/// Fingerprint window filter
#[derive(Debug)]
pub struct QuenchFilter {
    window: Duration,
    entries: DashMap<Fingerprint, QuenchEntry>,
}

impl QuenchFilter {
    /// Create filter; a zero window disables suppression
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: DashMap::new(),
        }
    }

    /// Configured window
    #[inline]
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check and record a fingerprint
    pub fn check(&self, fingerprint: Fingerprint) -> QuenchDecision {
        if self.window.is_zero() {
            return QuenchDecision::Deliver;
        }
        let now = Instant::now();
        match self.entries.entry(fingerprint) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if now.duration_since(entry.first_seen) < self.window {
                    entry.suppressed += 1;
                    metrics::counter!("iris_messages_quenched_total").increment(1);
                    tracing::debug!(
                        fingerprint = %fingerprint,
                        suppressed = entry.suppressed,
                        "suppressed duplicate message"
                    );
                    QuenchDecision::Suppressed {
                        suppressed: entry.suppressed,
                    }
                } else {
                    *entry = QuenchEntry {
                        first_seen: now,
                        suppressed: 0,
                    };
                    QuenchDecision::Deliver
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(QuenchEntry {
                    first_seen: now,
                    suppressed: 0,
                });
                QuenchDecision::Deliver
            }
        }
    }

    /// Duplicates suppressed in the current window
    #[must_use]
    pub fn suppressed_count(&self, fingerprint: &Fingerprint) -> u64 {
        let now = Instant::now();
        self.entries
            .get(fingerprint)
            .filter(|entry| now.duration_since(entry.first_seen) < self.window)
            .map_or(0, |entry| entry.suppressed)
    }

    /// Forget a fingerprint so the next occurrence is delivered
    pub fn forget(&self, fingerprint: &Fingerprint) {
        self.entries.remove(fingerprint);
    }

    /// Remove expired entries; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.first_seen) < self.window);
        before.saturating_sub(self.entries.len())
    }

    /// Tracked fingerprints, expired or not
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sweep periodically until the task is aborted
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = self.sweep();
                if removed > 0 {
                    tracing::trace!(removed, "swept quench entries");
                }
            }
        })
    }
}
