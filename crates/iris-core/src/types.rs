//! Core types for Iris
//!
//! Defines the fundamental values shared by the engine and the sender:
//! - Identifiers (incidents, messages, batches)
//! - Notification modes and priorities
//! - Incidents and their run lifecycle states
//! - Delivery outcomes and attempt records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use ulid::Ulid;

/// Unique incident identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IncidentId(pub Ulid);

impl IncidentId {
    /// Generate new incident ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for IncidentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Ulid);

impl MessageId {
    /// Generate new message ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier shared by all messages flushed together as one aggregated batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Ulid);

impl BatchId {
    /// Generate new batch ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Notification medium, used as the plugin registry key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mode(String);

impl Mode {
    /// Email mode
    pub const EMAIL: &'static str = "email";
    /// SMS mode
    pub const SMS: &'static str = "sms";
    /// Voice call mode
    pub const CALL: &'static str = "call";
    /// Instant message (chat) mode
    pub const IM: &'static str = "im";
    /// Slack mode
    pub const SLACK: &'static str = "slack";

    /// Create a mode from any name (normalized to lowercase)
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_ascii_lowercase())
    }

    /// Email mode
    #[must_use]
    pub fn email() -> Self {
        Self::new(Self::EMAIL)
    }

    /// SMS mode
    #[must_use]
    pub fn sms() -> Self {
        Self::new(Self::SMS)
    }

    /// Voice call mode
    #[must_use]
    pub fn call() -> Self {
        Self::new(Self::CALL)
    }

    /// Chat mode
    #[must_use]
    pub fn im() -> Self {
        Self::new(Self::IM)
    }

    /// Mode name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this mode carries rich (HTML/markdown) bodies
    #[must_use]
    pub fn is_rich(&self) -> bool {
        matches!(self.0.as_str(), Self::EMAIL | Self::SLACK)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Mode {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Notification priority, ordered from least to most urgent
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Informational
    Low,
    /// Needs attention soon
    #[default]
    Medium,
    /// Needs attention now
    High,
    /// Page immediately
    Urgent,
}

impl Priority {
    /// All priorities, least urgent first
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Urgent,
    ];

    /// Numeric urgency; higher dequeues first
    #[inline]
    #[must_use]
    pub const fn urgency(self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" | "critical" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// One deliverable address: a mode plus a destination on that mode
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    /// Mode to deliver on
    pub mode: Mode,
    /// Mode-specific destination (address, phone number, channel)
    pub destination: String,
}

impl Contact {
    /// Create contact
    #[inline]
    #[must_use]
    pub fn new(mode: Mode, destination: impl Into<String>) -> Self {
        Self {
            mode,
            destination: destination.into(),
        }
    }
}

/// Rendering context supplied with an incident
pub type Context = serde_json::Map<String, serde_json::Value>;

/// A raised incident
///
/// The engine owns the live copy for the duration of its run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    /// Incident ID
    #[serde(default)]
    pub id: IncidentId,
    /// Triggering application
    pub application: String,
    /// Name of the plan driving escalation
    pub plan: String,
    /// Urgency level
    #[serde(default)]
    pub priority: Priority,
    /// Key-value payload used for rendering
    #[serde(default)]
    pub context: Context,
    /// Creation time
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Incident {
    /// Create incident with a fresh ID
    #[must_use]
    pub fn new(application: impl Into<String>, plan: impl Into<String>) -> Self {
        Self {
            id: IncidentId::new(),
            application: application.into(),
            plan: plan.into(),
            priority: Priority::default(),
            context: Context::new(),
            created_at: Utc::now(),
        }
    }

    /// With priority
    #[inline]
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// With a context variable
    #[must_use]
    pub fn with_context_value(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// With a full context
    #[inline]
    #[must_use]
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }
}

/// Lifecycle state of an escalation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Created, not yet dispatched
    Pending,
    /// Current step being dispatched
    Active,
    /// Step messages enqueued, timer armed
    WaitingAck,
    /// Step timer fired, advancing
    Escalated,
    /// Acknowledged or closed
    Resolved,
    /// No further step
    Exhausted,
    /// Incident or plan invalidated
    Aborted,
}

impl RunState {
    /// Terminal states accept no further transition
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Resolved | RunState::Exhausted | RunState::Aborted
        )
    }

    /// Uppercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::Active => "ACTIVE",
            RunState::WaitingAck => "WAITING_ACK",
            RunState::Escalated => "ESCALATED",
            RunState::Resolved => "RESOLVED",
            RunState::Exhausted => "EXHAUSTED",
            RunState::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one plugin send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Channel accepted the message
    Success,
    /// Retryable channel error
    TransientFailure,
    /// Non-retryable channel error
    PermanentFailure,
    /// Timeout or ambiguous failure; the send may have gone through
    Unknown,
}

impl DeliveryOutcome {
    /// Label used in logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            DeliveryOutcome::Success => "success",
            DeliveryOutcome::TransientFailure => "transient_failure",
            DeliveryOutcome::PermanentFailure => "permanent_failure",
            DeliveryOutcome::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record of one message send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Message sent
    pub message_id: MessageId,
    /// Owning incident (none for out-of-band and tracking messages)
    pub incident_id: Option<IncidentId>,
    /// Batch, when the message was aggregated
    pub batch_id: Option<BatchId>,
    /// Target user name (or tracking destination)
    pub target: String,
    /// Mode used
    pub mode: Mode,
    /// Destination used
    pub destination: String,
    /// Attempt number on this mode, starting at 1
    pub attempt: u32,
    /// Outcome
    pub outcome: DeliveryOutcome,
    /// Plugin call latency in milliseconds
    pub latency_ms: u64,
    /// Plugin-reported detail
    pub detail: Option<String>,
    /// Wall-clock time of the attempt
    pub at: DateTime<Utc>,
}

impl DeliveryAttempt {
    /// Plugin latency as a duration
    #[must_use]
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}
