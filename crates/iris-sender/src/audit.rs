//! Delivery audit log
//!
//! Every attempt, every target-level failure, every suppressed duplicate
//! and every run state change is appended to a hash-chained in-memory log. Each entry
//! commits to its predecessor, so [`AuditLog::verify_integrity`] detects
//! any record altered after the fact.
//!
//! Attempts are also broadcast to live subscribers, and a durable
//! [`AuditSink`] can be attached to receive entries in append order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iris_core::{DeliveryAttempt, IncidentId, MessageId, RunState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const SUBSCRIBER_BUFFER: usize = 1024;

/// Audit log errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    /// Chain broken at this sequence number
    #[error("audit chain broken at entry {seq}")]
    IntegrityViolation {
        /// First bad entry
        seq: u64,
    },

    /// Durable sink rejected an entry
    #[error("audit sink failed: {0}")]
    Sink(String),
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    /// One plugin send
    Attempt(DeliveryAttempt),
    /// Every channel of a message failed
    TargetFailed {
        /// Message
        message_id: MessageId,
        /// Owning incident
        incident_id: Option<IncidentId>,
        /// Target user
        target: String,
        /// Last failure detail
        detail: String,
    },
    /// Duplicate dropped by the quench filter
    Quenched {
        /// Message
        message_id: MessageId,
        /// Owning incident
        incident_id: Option<IncidentId>,
        /// Target user
        target: String,
        /// Duplicates suppressed so far in the window
        suppressed: u64,
    },
    /// Escalation run changed state
    Transition {
        /// Incident
        incident_id: IncidentId,
        /// Previous state
        from: RunState,
        /// New state
        to: RunState,
        /// Step ordinal at the time of the change
        step: Option<u32>,
    },
}

/// Chained log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the log, from 0
    pub seq: u64,
    /// Append time
    pub at: DateTime<Utc>,
    /// Record
    pub record: AuditRecord,
    /// Hash of the previous entry
    pub prev_hash: [u8; 32],
    /// Hash of this entry
    pub hash: [u8; 32],
}

/// Durable destination for audit entries
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one entry
    ///
    /// # Errors
    /// `AuditError::Sink` when the entry could not be stored
    async fn persist(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

/// Append-only, hash-chained audit log
pub struct AuditLog {
    inner: Mutex<Vec<AuditEntry>>,
    attempts: broadcast::Sender<DeliveryAttempt>,
    sink: Option<mpsc::UnboundedSender<AuditEntry>>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    /// Create empty log without a sink
    #[must_use]
    pub fn new() -> Self {
        let (attempts, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            inner: Mutex::new(Vec::new()),
            attempts,
            sink: None,
        }
    }

    /// Create log forwarding every entry to a sink
    ///
    /// Sink failures are logged and do not affect delivery.
    #[must_use]
    pub fn with_sink(sink: Arc<dyn AuditSink>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEntry>();
        let forwarder = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = sink.persist(&entry).await {
                    tracing::error!(seq = entry.seq, error = %e, "failed to persist audit entry");
                }
            }
        });
        let mut log = Self::new();
        log.sink = Some(tx);
        (log, forwarder)
    }

    /// Append a record; returns its sequence number
    pub fn append(&self, record: AuditRecord) -> u64 {
        let entry = {
            let mut guard = self.inner.lock();
            let prev_hash = guard.last().map_or([0u8; 32], |e| e.hash);
            let mut entry = AuditEntry {
                seq: guard.len() as u64,
                at: Utc::now(),
                record,
                prev_hash,
                hash: [0u8; 32],
            };
            entry.hash = compute_hash(&entry);
            guard.push(entry.clone());
            // forwarded under the lock so the sink sees append order
            if let Some(sink) = &self.sink {
                let _ = sink.send(entry.clone());
            }
            entry
        };

        if let AuditRecord::Attempt(attempt) = entry.record {
            // no subscribers is fine
            let _ = self.attempts.send(attempt);
        }
        entry.seq
    }

    /// Record a delivery attempt
    pub fn record_attempt(&self, attempt: DeliveryAttempt) -> u64 {
        self.append(AuditRecord::Attempt(attempt))
    }

    /// Live stream of delivery attempts
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryAttempt> {
        self.attempts.subscribe()
    }

    /// Every entry
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().clone()
    }

    /// Every delivery attempt
    #[must_use]
    pub fn attempts(&self) -> Vec<DeliveryAttempt> {
        self.inner
            .lock()
            .iter()
            .filter_map(|e| match &e.record {
                AuditRecord::Attempt(a) => Some(a.clone()),
                _ => None,
            })
            .collect()
    }

    /// Delivery attempts of one incident
    #[must_use]
    pub fn attempts_for(&self, incident_id: IncidentId) -> Vec<DeliveryAttempt> {
        self.attempts()
            .into_iter()
            .filter(|a| a.incident_id == Some(incident_id))
            .collect()
    }

    /// Target-level failures of one incident
    #[must_use]
    pub fn failures_for(&self, incident_id: IncidentId) -> Vec<AuditRecord> {
        self.inner
            .lock()
            .iter()
            .filter(|e| {
                matches!(
                    &e.record,
                    AuditRecord::TargetFailed { incident_id: Some(id), .. } if *id == incident_id
                )
            })
            .map(|e| e.record.clone())
            .collect()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Check every link of the chain
    ///
    /// # Errors
    /// `AuditError::IntegrityViolation` at the first broken entry
    pub fn verify_integrity(&self) -> Result<(), AuditError> {
        verify_chain(&self.inner.lock())
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("entries", &self.len())
            .field("sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

/// Check a slice of entries as a chain starting from the zero hash
///
/// # Errors
/// `AuditError::IntegrityViolation` at the first broken entry
pub fn verify_chain(entries: &[AuditEntry]) -> Result<(), AuditError> {
    let mut prev = [0u8; 32];
    for entry in entries {
        if entry.prev_hash != prev || entry.hash != compute_hash(entry) {
            return Err(AuditError::IntegrityViolation { seq: entry.seq });
        }
        prev = entry.hash;
    }
    Ok(())
}

fn compute_hash(entry: &AuditEntry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entry.seq.to_le_bytes());
    hasher.update(entry.at.timestamp_micros().to_le_bytes());
    // serializing a derived Serialize type into a Vec cannot fail
    hasher.update(serde_json::to_vec(&entry.record).unwrap_or_default());
    hasher.update([0]);
    hasher.update(entry.prev_hash);
    hasher.finalize().into()
}
