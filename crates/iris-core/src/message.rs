//! Outbound messages
//!
//! A [`Message`] is created by the engine (or by an out-of-band request),
//! mutated by the sender as it retries and falls back, and dropped once a
//! terminal outcome is recorded.

use crate::types::{BatchId, Contact, Context, IncidentId, MessageId, Mode, Priority};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Instant;

/// Duplicate-suppression key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Compute from (application, content signature, target identity)
    #[must_use]
    pub fn compute(application: &str, content: &str, target: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(application.as_bytes());
        hasher.update([0]);
        hasher.update(content.as_bytes());
        hasher.update([0]);
        hasher.update(target.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Content signature of a rendering context
    ///
    /// `serde_json::Map` iterates in key order, so equal contexts produce
    /// equal signatures regardless of insertion order.
    #[must_use]
    pub fn content_signature(plan: &str, context: &Context) -> String {
        let mut hasher = Sha256::new();
        hasher.update(plan.as_bytes());
        hasher.update([0]);
        hasher.update(serde_json::Value::Object(context.clone()).to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Hex form
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..16])
    }
}

/// Where a message came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOrigin {
    /// Escalation step of an incident
    Escalation {
        /// Incident
        incident_id: IncidentId,
        /// Run generation of the incident
        run: u64,
        /// Plan name
        plan: String,
        /// Step ordinal
        step: u32,
    },
    /// Tracking notification of an incident
    Tracking {
        /// Incident
        incident_id: IncidentId,
        /// Run generation of the incident
        run: u64,
        /// Plan name
        plan: String,
    },
    /// Caller-supplied notification outside any incident
    OutOfBand,
}

impl MessageOrigin {
    /// Owning incident, if any
    #[must_use]
    pub fn incident_id(&self) -> Option<IncidentId> {
        match self {
            MessageOrigin::Escalation { incident_id, .. }
            | MessageOrigin::Tracking { incident_id, .. } => Some(*incident_id),
            MessageOrigin::OutOfBand => None,
        }
    }

    /// Owning incident and run generation, if any
    #[must_use]
    pub fn run(&self) -> Option<(IncidentId, u64)> {
        match self {
            MessageOrigin::Escalation {
                incident_id, run, ..
            }
            | MessageOrigin::Tracking {
                incident_id, run, ..
            } => Some((*incident_id, *run)),
            MessageOrigin::OutOfBand => None,
        }
    }

    /// Plan name, if any
    #[must_use]
    pub fn plan(&self) -> Option<&str> {
        match self {
            MessageOrigin::Escalation { plan, .. } | MessageOrigin::Tracking { plan, .. } => {
                Some(plan)
            }
            MessageOrigin::OutOfBand => None,
        }
    }
}

/// Messages folded into one aggregated send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchInfo {
    /// Batch ID
    pub id: BatchId,
    /// Member messages
    pub message_ids: Vec<MessageId>,
    /// Incidents of the member messages
    pub incident_ids: Vec<IncidentId>,
    /// Incident runs of the member messages
    pub runs: Vec<(IncidentId, u64)>,
}

/// One pending notification for a single target
#[derive(Debug, Clone)]
pub struct Message {
    /// Message ID
    pub id: MessageId,
    /// Origin
    pub origin: MessageOrigin,
    /// Application that raised the incident
    pub application: String,
    /// Target user name (or the raw destination for tracking messages)
    pub target: String,
    /// Priority; drives queue order
    pub priority: Priority,
    /// Template name; `None` when subject/body are supplied directly
    pub template: Option<String>,
    /// Rendering context
    pub context: Context,
    /// Contact chain in fallback order
    pub chain: Vec<Contact>,
    /// Index of the contact currently in use
    pub channel_index: usize,
    /// Attempts made on the current contact
    pub channel_attempts: u32,
    /// Attempts made across all contacts
    pub attempts: u32,
    /// Text prepended to the rendered body
    pub body_prefix: Option<String>,
    /// Rendered subject for the current mode
    pub subject: String,
    /// Rendered body for the current mode
    pub body: String,
    /// Quench key; `None` disables quenching
    pub fingerprint: Option<Fingerprint>,
    /// First enqueue time
    pub enqueued_at: Instant,
    /// Whether a rate-limit token is already held for the next send
    pub token_held: bool,
    /// Aggregation batch
    pub batch: Option<BatchInfo>,
}

impl Message {
    /// Create a message with an explicit contact chain
    #[must_use]
    pub fn new(
        origin: MessageOrigin,
        application: impl Into<String>,
        target: impl Into<String>,
        priority: Priority,
        chain: Vec<Contact>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            origin,
            application: application.into(),
            target: target.into(),
            priority,
            template: None,
            context: Context::new(),
            chain,
            channel_index: 0,
            channel_attempts: 0,
            attempts: 0,
            body_prefix: None,
            subject: String::new(),
            body: String::new(),
            fingerprint: None,
            enqueued_at: Instant::now(),
            token_held: false,
            batch: None,
        }
    }

    /// With template and context
    #[must_use]
    pub fn with_template(mut self, template: impl Into<String>, context: Context) -> Self {
        self.template = Some(template.into());
        self.context = context;
        self
    }

    /// With pre-rendered content
    #[must_use]
    pub fn with_content(mut self, subject: impl Into<String>, body: impl Into<String>) -> Self {
        self.subject = subject.into();
        self.body = body.into();
        self
    }

    /// With body prefix
    #[must_use]
    pub fn with_body_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.body_prefix = Some(prefix.into());
        self
    }

    /// With quench fingerprint
    #[inline]
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    /// Owning incident
    #[inline]
    #[must_use]
    pub fn incident_id(&self) -> Option<IncidentId> {
        self.origin.incident_id()
    }

    /// Contact currently in use
    #[inline]
    #[must_use]
    pub fn contact(&self) -> Option<&Contact> {
        self.chain.get(self.channel_index)
    }

    /// Mode currently in use
    #[must_use]
    pub fn mode(&self) -> Option<&Mode> {
        self.contact().map(|c| &c.mode)
    }

    /// Whether another contact remains after the current one
    #[inline]
    #[must_use]
    pub fn has_fallback(&self) -> bool {
        self.channel_index + 1 < self.chain.len()
    }

    /// Move to the next contact, resetting per-channel accounting
    ///
    /// Returns `false` when the chain is exhausted.
    pub fn advance_channel(&mut self) -> bool {
        if !self.has_fallback() {
            return false;
        }
        self.channel_index += 1;
        self.channel_attempts = 0;
        true
    }

    /// Whether the rendered content came from a template
    #[must_use]
    pub fn needs_render(&self) -> bool {
        self.template.is_some() || self.batch.is_some()
    }
}
