//! Error types for Iris
//!
//! Provides the error taxonomy shared by the engine and the sender:
//! - Per-message failures recovered locally (resolution, render, channel)
//! - Backpressure signals (rate limiting, queue saturation)
//! - Run-fatal conditions (invalid plan, explicit abort)

use crate::types::{IncidentId, Mode, RunState};
use std::time::Duration;

/// Main Iris error type
#[derive(Debug, thiserror::Error)]
pub enum IrisError {
    /// Target could not be resolved
    #[error("resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    /// Template could not be rendered
    #[error("render failed: {0}")]
    Render(#[from] RenderError),

    /// Delivery channel failed
    #[error("channel failed: {0}")]
    Channel(#[from] ChannelError),

    /// Send deferred by the rate limiter
    #[error("rate limited, retry after {}ms", retry_after.as_millis())]
    RateLimited {
        /// Time until the bucket refills
        retry_after: Duration,
    },

    /// Delivery queue rejected the message
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Plan failed validation or was invalidated
    #[error("plan invalid: {0}")]
    PlanInvalid(#[from] PlanError),

    /// No plan with this name
    #[error("plan not found: {0}")]
    PlanNotFound(String),

    /// No run for this incident
    #[error("no run for incident {0}")]
    RunNotFound(IncidentId),

    /// Incident already has a live run
    #[error("incident {0} already has an active run")]
    RunAlreadyActive(IncidentId),

    /// Illegal run state transition
    #[error("state machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// External store failure
    #[error("store error: {0}")]
    Store(String),

    /// Inbound response could not be understood
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Engine has shut down
    #[error("engine shut down")]
    Shutdown,
}

impl IrisError {
    /// Whether this error must terminate the incident run
    #[inline]
    #[must_use]
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, Self::PlanInvalid(_) | Self::PlanNotFound(_))
    }

    /// Whether the failed operation may succeed if retried
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Channel(e) => e.is_retryable(),
            Self::RateLimited { .. } | Self::Queue(QueueError::Saturated { .. }) => true,
            Self::Store(_) => true,
            _ => false,
        }
    }
}

/// Target resolution errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    /// Unknown user
    #[error("unknown user: {0}")]
    UnknownUser(String),

    /// Unknown team
    #[error("unknown team: {0}")]
    UnknownTeam(String),

    /// Unknown schedule
    #[error("unknown schedule: {0}")]
    UnknownSchedule(String),

    /// User exists but has no usable contact
    #[error("user {0} has no usable contact")]
    NoContacts(String),

    /// Directory backend failure
    #[error("directory error: {0}")]
    Directory(String),
}

/// Template rendering errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    /// No template with this name
    #[error("template {0} does not exist")]
    UnknownTemplate(String),

    /// Template lacks content for the application/mode pair
    #[error("template {template} has no content for application {application} mode {mode}")]
    MissingVariant {
        /// Template name
        template: String,
        /// Application name
        application: String,
        /// Mode
        mode: Mode,
    },

    /// Template source is invalid or a variable is missing
    #[error("template {template} failed: {reason}")]
    Template {
        /// Template name
        template: String,
        /// Underlying cause
        reason: String,
    },

    /// Message has no contact to render for
    #[error("message has no contact")]
    NoContact,
}

/// Plugin-reported channel errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Retryable (throttling, 5xx, connection reset before send)
    #[error("transient channel error: {0}")]
    Transient(String),

    /// Not retryable (invalid destination, rejected payload)
    #[error("permanent channel error: {0}")]
    Permanent(String),

    /// Outcome unknown (timeout, connection lost after send)
    #[error("ambiguous channel error: {0}")]
    Ambiguous(String),

    /// No plugin registered for the mode
    #[error("no plugin registered for mode {0}")]
    NoPlugin(Mode),
}

impl ChannelError {
    /// Whether the same channel may be tried again
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Ambiguous(_))
    }

    /// Plugin-reported detail
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Transient(d) | Self::Permanent(d) | Self::Ambiguous(d) => d.clone(),
            Self::NoPlugin(mode) => format!("no plugin for {mode}"),
        }
    }
}

/// Delivery queue errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Queue at capacity
    #[error("delivery queue saturated (capacity {capacity})")]
    Saturated {
        /// Configured capacity
        capacity: usize,
    },

    /// Queue closed for shutdown
    #[error("delivery queue closed")]
    Closed,
}

/// Plan validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// Plan has no steps
    #[error("plan {0} has no steps")]
    NoSteps(String),

    /// Ordinals must strictly increase
    #[error("step ordinal {ordinal} does not follow {previous}")]
    NonIncreasingOrdinal {
        /// Previous ordinal
        previous: u32,
        /// Offending ordinal
        ordinal: u32,
    },

    /// Step timeout must be positive
    #[error("step {ordinal} has zero timeout")]
    ZeroTimeout {
        /// Offending ordinal
        ordinal: u32,
    },

    /// Step has no targets
    #[error("step {ordinal} has no targets")]
    EmptyStep {
        /// Offending ordinal
        ordinal: u32,
    },

    /// Plan was invalidated while runs were bound to it
    #[error("plan {0} was invalidated")]
    Invalidated(String),
}

/// Run state machine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// Transition not in the allowed table
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        /// Current state
        from: RunState,
        /// Requested state
        to: RunState,
    },
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path read
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File could not be parsed
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// Unsupported file extension
    #[error("unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result alias
pub type Result<T, E = IrisError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_error_classification() {
        assert!(ChannelError::Transient("503".into()).is_retryable());
        assert!(ChannelError::Ambiguous("timeout".into()).is_retryable());
        assert!(!ChannelError::Permanent("bad number".into()).is_retryable());
        assert!(!ChannelError::NoPlugin(Mode::call()).is_retryable());
    }

    #[test]
    fn run_fatal_errors() {
        assert!(IrisError::from(PlanError::NoSteps("p".into())).is_run_fatal());
        assert!(!IrisError::from(ResolutionError::UnknownUser("bob".into())).is_run_fatal());
        assert!(!IrisError::from(RenderError::NoContact).is_run_fatal());
    }

    #[test]
    fn saturation_is_retryable() {
        let err = IrisError::from(QueueError::Saturated { capacity: 10 });
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "queue error: delivery queue saturated (capacity 10)"
        );
    }
}
