//! Escalation runs
//!
//! A [`Run`] is the live state of one incident under one plan snapshot.
//! The engine is its only writer; callers observe it through
//! [`RunSnapshot`].

use crate::state::validate_transition;
use chrono::{DateTime, Utc};
use iris_core::{Incident, IncidentId, Mode, Plan, RunState, StateMachineError, Step};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;

/// What happened during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEventKind {
    /// Run created
    Started {
        /// Plan name
        plan: String,
    },
    /// State changed
    Transition {
        /// Previous state
        from: RunState,
        /// New state
        to: RunState,
    },
    /// Step messages handed to the sender
    StepDispatched {
        /// Step ordinal
        ordinal: u32,
        /// Repeat round, from 0
        round: u32,
        /// Messages queued
        submitted: usize,
        /// Messages dropped as duplicates
        quenched: usize,
        /// Messages held for aggregation
        held: usize,
    },
    /// A step target could not be (fully) resolved
    ResolutionFailed {
        /// Target reference
        target: String,
        /// Reason
        detail: String,
    },
    /// Plan creator notified in place of an unresolvable target
    CreatorFallback {
        /// Unresolvable target reference
        target: String,
        /// Creator notified instead
        creator: String,
    },
    /// A message could not be rendered or queued
    SubmitFailed {
        /// Target user
        target: String,
        /// Reason
        detail: String,
    },
    /// Delivery queue was full; the step went out partially
    QueueSaturated {
        /// Target user
        target: String,
    },
    /// Tracking notification queued
    TrackingSent {
        /// Tracking destination
        destination: String,
    },
    /// A message reached its target
    Delivered {
        /// Target user
        target: String,
        /// Mode that succeeded
        mode: Mode,
    },
    /// Every channel of a target failed
    TargetFailed {
        /// Target user
        target: String,
        /// Last failure detail
        detail: String,
    },
    /// Acknowledged
    Acknowledged {
        /// Who claimed the incident, if known
        owner: Option<String>,
    },
    /// Closed without acknowledgement
    Closed,
    /// Aborted
    Aborted {
        /// Reason
        reason: String,
    },
}

/// Timestamped run event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Wall-clock time
    pub at: DateTime<Utc>,
    /// Event
    #[serde(flatten)]
    pub kind: RunEventKind,
}

/// Target-level delivery failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFailure {
    /// Target user
    pub target: String,
    /// Last failure detail
    pub detail: String,
    /// When the failure was reported
    pub at: DateTime<Utc>,
}

/// Live escalation run
#[derive(Debug)]
pub struct Run {
    /// Incident being escalated
    pub incident: Incident,
    /// Plan snapshot taken at start
    pub plan: Arc<Plan>,
    /// Run generation; later runs of the same incident get higher ones
    pub generation: u64,
    /// Lifecycle state
    pub state: RunState,
    /// Index of the current step
    pub step_index: usize,
    /// Repeat round of the current step, from 0
    pub round: u32,
    /// Set when a step could not be fully queued
    pub partially_delivered: bool,
    /// Who acknowledged the incident
    pub owner: Option<String>,
    /// Event history
    pub history: Vec<RunEvent>,
    /// Target-level delivery failures
    pub failures: Vec<TargetFailure>,
    /// Last change, wall clock
    pub updated_at: DateTime<Utc>,
    /// When the run reached a terminal state
    pub finished_at: Option<Instant>,
}

impl Run {
    /// Create a pending run
    #[must_use]
    pub fn new(incident: Incident, plan: Arc<Plan>) -> Self {
        let mut run = Self {
            incident,
            plan,
            generation: 0,
            state: RunState::Pending,
            step_index: 0,
            round: 0,
            partially_delivered: false,
            owner: None,
            history: Vec::new(),
            failures: Vec::new(),
            updated_at: Utc::now(),
            finished_at: None,
        };
        run.record(RunEventKind::Started {
            plan: run.plan.name.clone(),
        });
        run
    }

    /// Set the run generation
    #[must_use]
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Incident ID
    #[inline]
    #[must_use]
    pub fn id(&self) -> IncidentId {
        self.incident.id
    }

    /// Current step
    #[must_use]
    pub fn current_step(&self) -> Option<&Step> {
        self.plan.step(self.step_index)
    }

    /// Ordinal of the current step
    #[must_use]
    pub fn ordinal(&self) -> Option<u32> {
        self.current_step().map(|s| s.ordinal)
    }

    /// Position after a timeout: the same step while repeats remain,
    /// then the next step; `None` when the plan is exhausted
    #[must_use]
    pub fn next_position(&self) -> Option<(usize, u32)> {
        let step = self.current_step()?;
        if self.round < step.repeat {
            Some((self.step_index, self.round + 1))
        } else if self.step_index + 1 < self.plan.steps.len() {
            Some((self.step_index + 1, 0))
        } else {
            None
        }
    }

    /// Move to a new state
    ///
    /// # Errors
    /// `StateMachineError::IllegalTransition` when the move is not allowed
    pub fn transition(&mut self, to: RunState) -> Result<RunState, StateMachineError> {
        let from = self.state;
        validate_transition(from, to)?;
        self.state = to;
        if to.is_terminal() {
            self.finished_at = Some(Instant::now());
        }
        self.record(RunEventKind::Transition { from, to });
        Ok(from)
    }

    /// Append to history
    pub fn record(&mut self, kind: RunEventKind) {
        let at = Utc::now();
        self.updated_at = at;
        self.history.push(RunEvent { at, kind });
    }

    /// Record a target-level failure
    pub fn record_failure(&mut self, target: impl Into<String>, detail: impl Into<String>) {
        let target = target.into();
        let detail = detail.into();
        let at = Utc::now();
        self.failures.push(TargetFailure {
            target: target.clone(),
            detail: detail.clone(),
            at,
        });
        self.record(RunEventKind::TargetFailed { target, detail });
    }

    /// Number of state transitions into `state`
    #[must_use]
    pub fn transitions_into(&self, state: RunState) -> usize {
        self.history
            .iter()
            .filter(|e| matches!(e.kind, RunEventKind::Transition { to, .. } if to == state))
            .count()
    }

    /// Read-only copy
    #[must_use]
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            incident_id: self.incident.id,
            application: self.incident.application.clone(),
            plan: self.plan.name.clone(),
            state: self.state,
            step_index: self.step_index,
            ordinal: self.ordinal(),
            round: self.round,
            partially_delivered: self.partially_delivered,
            owner: self.owner.clone(),
            history: self.history.clone(),
            failures: self.failures.clone(),
            created_at: self.incident.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Read-only view of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    /// Incident
    pub incident_id: IncidentId,
    /// Triggering application
    pub application: String,
    /// Plan name
    pub plan: String,
    /// Lifecycle state
    pub state: RunState,
    /// Index of the current step
    pub step_index: usize,
    /// Ordinal of the current step
    pub ordinal: Option<u32>,
    /// Repeat round
    pub round: u32,
    /// Whether a step could not be fully queued
    pub partially_delivered: bool,
    /// Who acknowledged the incident
    pub owner: Option<String>,
    /// Event history
    pub history: Vec<RunEvent>,
    /// Target-level delivery failures
    pub failures: Vec<TargetFailure>,
    /// Incident creation time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl RunSnapshot {
    /// Sequence of states the run went through, starting at `PENDING`
    #[must_use]
    pub fn states(&self) -> Vec<RunState> {
        let mut states = vec![RunState::Pending];
        states.extend(self.history.iter().filter_map(|e| match e.kind {
            RunEventKind::Transition { to, .. } => Some(to),
            _ => None,
        }));
        states
    }

    /// Number of transitions into `state`
    #[must_use]
    pub fn transitions_into(&self, state: RunState) -> usize {
        self.states().iter().skip(1).filter(|s| **s == state).count()
    }

    /// Events of the history without timestamps
    #[must_use]
    pub fn events(&self) -> Vec<RunEventKind> {
        self.history.iter().map(|e| e.kind.clone()).collect()
    }
}
