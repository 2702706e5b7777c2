//! Escalation plans
//!
//! A [`Plan`] is an ordered sequence of [`Step`]s. A running incident
//! holds an immutable snapshot of its plan, so edits to the stored plan
//! never affect runs already in flight.

use crate::error::PlanError;
use crate::types::{Mode, Priority};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Reference to a notification target
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "lowercase")]
pub enum TargetRef {
    /// Single user
    User(String),
    /// Team; expands to its members in configured order
    Team(String),
    /// On-call schedule; expands to whoever is on call
    Schedule(String),
}

impl TargetRef {
    /// User reference
    #[must_use]
    pub fn user(name: impl Into<String>) -> Self {
        TargetRef::User(name.into())
    }

    /// Team reference
    #[must_use]
    pub fn team(name: impl Into<String>) -> Self {
        TargetRef::Team(name.into())
    }

    /// Schedule reference
    #[must_use]
    pub fn schedule(name: impl Into<String>) -> Self {
        TargetRef::Schedule(name.into())
    }

    /// Referenced name
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            TargetRef::User(n) | TargetRef::Team(n) | TargetRef::Schedule(n) => n,
        }
    }

    /// Kind label
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            TargetRef::User(_) => "user",
            TargetRef::Team(_) => "team",
            TargetRef::Schedule(_) => "schedule",
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.name())
    }
}

/// One target entry of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTarget {
    /// Who to notify
    pub target: TargetRef,
    /// Notification priority; drives mode selection
    #[serde(default)]
    pub priority: Priority,
    /// Template name used to render the message
    pub template: String,
}

impl StepTarget {
    /// Create step target
    #[must_use]
    pub fn new(target: TargetRef, priority: Priority, template: impl Into<String>) -> Self {
        Self {
            target,
            priority,
            template: template.into(),
        }
    }
}

/// One escalation tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Position in the plan; strictly increasing
    pub ordinal: u32,
    /// Targets notified when the step is dispatched
    pub targets: Vec<StepTarget>,
    /// Wait before escalating, in seconds
    pub timeout_secs: u64,
    /// Extra rounds of this step before advancing
    #[serde(default)]
    pub repeat: u32,
}

impl Step {
    /// Create step
    #[must_use]
    pub fn new(ordinal: u32, timeout: Duration) -> Self {
        Self {
            ordinal,
            targets: Vec::new(),
            timeout_secs: timeout.as_secs(),
            repeat: 0,
        }
    }

    /// With target
    #[must_use]
    pub fn with_target(mut self, target: StepTarget) -> Self {
        self.targets.push(target);
        self
    }

    /// With repeat count
    #[inline]
    #[must_use]
    pub fn with_repeat(mut self, repeat: u32) -> Self {
        self.repeat = repeat;
        self
    }

    /// Step timeout
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Batching policy for noisy plans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationPolicy {
    /// Window for counting arrivals, in seconds
    pub threshold_window_secs: u64,
    /// Arrivals within the window above which aggregation starts
    pub threshold_count: u32,
    /// Interval between batch flushes, in seconds
    pub aggregation_window_secs: u64,
    /// Quiet period after which aggregation ends, in seconds
    pub aggregation_reset_secs: u64,
}

impl AggregationPolicy {
    /// Counting window
    #[must_use]
    pub fn threshold_window(&self) -> Duration {
        Duration::from_secs(self.threshold_window_secs)
    }

    /// Flush interval
    #[must_use]
    pub fn aggregation_window(&self) -> Duration {
        Duration::from_secs(self.aggregation_window_secs)
    }

    /// Quiet period
    #[must_use]
    pub fn aggregation_reset(&self) -> Duration {
        Duration::from_secs(self.aggregation_reset_secs)
    }
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self {
            threshold_window_secs: 60,
            threshold_count: 10,
            aggregation_window_secs: 300,
            aggregation_reset_secs: 300,
        }
    }
}

/// Tracking notification sent once when a run starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingSpec {
    /// Mode to send on
    pub mode: Mode,
    /// Fixed destination (e.g. a mailing list)
    pub destination: String,
    /// Template name
    pub template: String,
}

/// Named escalation plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan name
    pub name: String,
    /// Ordered steps
    pub steps: Vec<Step>,
    /// Plan author, notified when a target cannot be resolved
    #[serde(default)]
    pub creator: Option<String>,
    /// Optional batching policy
    #[serde(default)]
    pub aggregation: Option<AggregationPolicy>,
    /// Optional tracking notification
    #[serde(default)]
    pub tracking: Option<TrackingSpec>,
}

impl Plan {
    /// Create an empty plan
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            creator: None,
            aggregation: None,
            tracking: None,
        }
    }

    /// With step
    #[must_use]
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// With creator
    #[must_use]
    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = Some(creator.into());
        self
    }

    /// With aggregation policy
    #[inline]
    #[must_use]
    pub fn with_aggregation(mut self, policy: AggregationPolicy) -> Self {
        self.aggregation = Some(policy);
        self
    }

    /// With tracking notification
    #[must_use]
    pub fn with_tracking(mut self, tracking: TrackingSpec) -> Self {
        self.tracking = Some(tracking);
        self
    }

    /// Step at index
    #[inline]
    #[must_use]
    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    /// Check structural invariants
    ///
    /// # Errors
    /// - `PlanError::NoSteps` for an empty plan
    /// - `PlanError::NonIncreasingOrdinal` when ordinals are not strictly increasing
    /// - `PlanError::ZeroTimeout` when a step has no timeout
    /// - `PlanError::EmptyStep` when a step has no targets
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::NoSteps(self.name.clone()));
        }

        let mut previous: Option<u32> = None;
        for step in &self.steps {
            if let Some(prev) = previous {
                if step.ordinal <= prev {
                    return Err(PlanError::NonIncreasingOrdinal {
                        previous: prev,
                        ordinal: step.ordinal,
                    });
                }
            }
            if step.timeout_secs == 0 {
                return Err(PlanError::ZeroTimeout {
                    ordinal: step.ordinal,
                });
            }
            if step.targets.is_empty() {
                return Err(PlanError::EmptyStep {
                    ordinal: step.ordinal,
                });
            }
            previous = Some(step.ordinal);
        }

        Ok(())
    }
}
