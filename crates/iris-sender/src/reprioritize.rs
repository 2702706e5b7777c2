//! Per-user channel reprioritization
//!
//! A user may ask that once a mode has carried `count` messages within
//! `duration`, a different mode is tried first. Successful sends are
//! recorded here and the rules are applied when contact chains are built.

use dashmap::DashMap;
use iris_core::{Contact, Mode, ReprioritizationRule, User};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// History older than this is never consulted
const MAX_RULE_WINDOW: Duration = Duration::from_secs(3600);

/// Recent successful sends per (user, mode)
#[derive(Debug, Default)]
pub struct Reprioritizer {
    history: DashMap<(String, Mode), VecDeque<Instant>>,
}

impl Reprioritizer {
    /// Create empty tracker
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_sent(&self, user: &str, mode: &Mode) {
        let now = Instant::now();
        let mut sends = self
            .history
            .entry((user.to_owned(), mode.clone()))
            .or_default();
        while sends
            .front()
            .is_some_and(|at| now.duration_since(*at) > MAX_RULE_WINDOW)
        {
            sends.pop_front();
        }
        sends.push_back(now);
    }

    /// Sends on a mode within a window
    #[must_use]
    pub fn recent(&self, user: &str, mode: &Mode, window: Duration) -> usize {
        let now = Instant::now();
        self.history
            .get(&(user.to_owned(), mode.clone()))
            .map_or(0, |sends| {
                sends
                    .iter()
                    .filter(|at| now.duration_since(**at) <= window)
                    .count()
            })
    }

    /// Apply the user's rules to a chain
    ///
    /// The first triggered rule whose destination mode the user can be
    /// reached on moves that mode to the front. Returns the rule applied.
    pub fn apply<'u>(
        &self,
        user: &'u User,
        chain: &mut Vec<Contact>,
    ) -> Option<&'u ReprioritizationRule> {
        for rule in &user.reprioritization {
            if chain.first().is_some_and(|c| c.mode == rule.dst_mode) {
                continue;
            }
            let count = self.recent(&user.name, &rule.src_mode, rule.duration());
            if count < rule.count as usize {
                continue;
            }
            let Some(contact) = user.contact(&rule.dst_mode) else {
                continue;
            };
            chain.retain(|c| c.mode != rule.dst_mode);
            chain.insert(0, contact);
            tracing::debug!(
                user = %user.name,
                src = %rule.src_mode,
                dst = %rule.dst_mode,
                count,
                "reprioritized contact chain"
            );
            return Some(rule);
        }
        None
    }

    /// Drop history that no rule can see any more
    pub fn sweep(&self) {
        let now = Instant::now();
        self.history.retain(|_, sends| {
            sends.retain(|at| now.duration_since(*at) <= MAX_RULE_WINDOW);
            !sends.is_empty()
        });
    }
}
