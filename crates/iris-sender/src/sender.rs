//! Notification sender
//!
//! [`NotificationSender`] owns the delivery pipeline shared by the engine
//! and the worker pool:
//!
//! ```text
//! submit:  quench -> render -> aggregate -> rate limit -> queue
//! process: rate limit -> plugin (with timeout) -> audit -> retry / fallback
//! ```
//!
//! Per-message failures never escape `process`; they end in a recorded
//! attempt and, when every channel is spent, exactly one target-level
//! failure reported to the engine.

use crate::aggregate::{AggregateDecision, Aggregator};
use crate::audit::{AuditLog, AuditRecord};
use crate::plugin::PluginRegistry;
use crate::queue::DeliveryQueue;
use crate::quench::{QuenchDecision, QuenchFilter};
use crate::rate_limit::{Admission, RateLimiter};
use crate::render::MessageRenderer;
use crate::reprioritize::Reprioritizer;
use crate::retry::{Decision, RetryPolicy};
use chrono::Utc;
use iris_core::{
    AggregationPolicy, BatchId, ChannelError, Contact, DeliveryAttempt, DeliveryOutcome, IncidentId,
    IrisConfig, IrisError, Message, MessageId, Mode, ResolutionError,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// What happened to a submitted message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Queued for immediate delivery
    Enqueued,
    /// Queued behind the rate limiter
    Deferred(Duration),
    /// Dropped as a duplicate
    Quenched {
        /// Duplicates suppressed so far in the window
        suppressed: u64,
    },
    /// Held for an aggregation batch
    Held,
}

/// Terminal result of a message, sent to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReport {
    /// A channel accepted the message
    Delivered {
        /// Message
        message_id: MessageId,
        /// Batch, when the message was aggregated
        batch_id: Option<BatchId>,
        /// Incidents covered by the message
        incident_ids: Vec<IncidentId>,
        /// Target user
        target: String,
        /// Mode that succeeded
        mode: Mode,
    },
    /// Every channel failed
    TargetFailed {
        /// Message
        message_id: MessageId,
        /// Batch, when the message was aggregated
        batch_id: Option<BatchId>,
        /// Incidents covered by the message
        incident_ids: Vec<IncidentId>,
        /// Target user
        target: String,
        /// Last failure detail
        detail: String,
    },
}

impl DeliveryReport {
    /// Incidents covered by the message
    #[must_use]
    pub fn incident_ids(&self) -> &[IncidentId] {
        match self {
            Self::Delivered { incident_ids, .. } | Self::TargetFailed { incident_ids, .. } => {
                incident_ids
            }
        }
    }

    /// Target user
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::Delivered { target, .. } | Self::TargetFailed { target, .. } => target,
        }
    }
}

/// Incidents a message speaks for; a batch covers all of its members
#[must_use]
pub fn incident_ids_of(message: &Message) -> Vec<IncidentId> {
    match &message.batch {
        Some(batch) => batch.incident_ids.clone(),
        None => message.incident_id().into_iter().collect(),
    }
}

/// Sender counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    /// Messages accepted by `submit`
    pub submitted: u64,
    /// Messages dropped as duplicates
    pub quenched: u64,
    /// Messages delivered
    pub delivered: u64,
    /// Messages whose every channel failed
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    quenched: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Delivery pipeline
pub struct NotificationSender {
    queue: Arc<DeliveryQueue>,
    quench: Arc<QuenchFilter>,
    aggregator: Aggregator,
    rate_limiter: RateLimiter,
    renderer: Arc<MessageRenderer>,
    plugins: PluginRegistry,
    reprioritizer: Arc<Reprioritizer>,
    audit: Arc<AuditLog>,
    policy: RetryPolicy,
    send_timeout: Duration,
    reports: Mutex<Option<mpsc::UnboundedSender<DeliveryReport>>>,
    counters: Counters,
}

impl NotificationSender {
    /// Build from configuration
    #[must_use]
    pub fn new(config: &IrisConfig, plugins: PluginRegistry, renderer: Arc<MessageRenderer>) -> Self {
        Self {
            queue: Arc::new(DeliveryQueue::new(config.sender.queue_capacity)),
            quench: Arc::new(QuenchFilter::new(config.quench.window())),
            aggregator: Aggregator::new(),
            rate_limiter: RateLimiter::new(
                config.rate_limit.capacity,
                config.rate_limit.refill_interval(),
            ),
            renderer,
            plugins,
            reprioritizer: Arc::new(Reprioritizer::new()),
            audit: Arc::new(AuditLog::new()),
            policy: RetryPolicy::from_config(&config.retry),
            send_timeout: config.sender.send_timeout(),
            reports: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    /// With a shared audit log
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    /// With a shared reprioritization tracker
    #[must_use]
    pub fn with_reprioritizer(mut self, reprioritizer: Arc<Reprioritizer>) -> Self {
        self.reprioritizer = reprioritizer;
        self
    }

    /// Send terminal results to this channel
    pub fn set_reports(&self, reports: mpsc::UnboundedSender<DeliveryReport>) {
        *self.reports.lock() = Some(reports);
    }

    /// Delivery queue
    #[inline]
    #[must_use]
    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    /// Quench filter
    #[inline]
    #[must_use]
    pub fn quench(&self) -> &Arc<QuenchFilter> {
        &self.quench
    }

    /// Audit log
    #[inline]
    #[must_use]
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Renderer
    #[inline]
    #[must_use]
    pub fn renderer(&self) -> &Arc<MessageRenderer> {
        &self.renderer
    }

    /// Reprioritization tracker
    #[inline]
    #[must_use]
    pub fn reprioritizer(&self) -> &Arc<Reprioritizer> {
        &self.reprioritizer
    }

    /// Plugins
    #[inline]
    #[must_use]
    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    /// Aggregator
    #[inline]
    #[must_use]
    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> SenderStats {
        SenderStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            quenched: self.counters.quenched.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Submit a message for delivery
    ///
    /// # Errors
    /// - `IrisError::Render` when the first contact cannot be rendered
    /// - `IrisError::Resolution` when the message has no contact
    /// - `IrisError::Queue` when the queue is saturated or closed
    pub fn submit(
        &self,
        mut message: Message,
        aggregation: Option<&AggregationPolicy>,
    ) -> Result<SubmitOutcome, IrisError> {
        if let Some(fingerprint) = message.fingerprint {
            if let QuenchDecision::Suppressed { suppressed } = self.quench.check(fingerprint) {
                self.counters.quenched.fetch_add(1, Ordering::Relaxed);
                self.audit.append(AuditRecord::Quenched {
                    message_id: message.id,
                    incident_id: message.incident_id(),
                    target: message.target.clone(),
                    suppressed,
                });
                return Ok(SubmitOutcome::Quenched { suppressed });
            }
        }

        if message.needs_render() {
            if let Err(e) = self.renderer.render_message(&mut message) {
                if let Some(fingerprint) = &message.fingerprint {
                    self.quench.forget(fingerprint);
                }
                return Err(e.into());
            }
        }

        let fingerprint = message.fingerprint;
        if let Some(policy) = aggregation {
            match self.aggregator.admit(message, policy) {
                AggregateDecision::Held => return Ok(SubmitOutcome::Held),
                AggregateDecision::Send(released) => message = *released,
            }
        }

        self.enqueue(message).map_err(|e| {
            // not queued, so the fingerprint must not quench a resubmission
            if let Some(fingerprint) = &fingerprint {
                self.quench.forget(fingerprint);
            }
            e
        })
    }

    fn enqueue(&self, mut message: Message) -> Result<SubmitOutcome, IrisError> {
        let mode = message
            .mode()
            .cloned()
            .ok_or_else(|| ResolutionError::NoContacts(message.target.clone()))?;
        let target = message.target.clone();

        let outcome = match self.rate_limiter.try_acquire(&target, &mode) {
            Admission::Granted => {
                message.token_held = true;
                if let Err(e) = self.queue.push(message) {
                    self.rate_limiter.refund(&target, &mode);
                    return Err(e.into());
                }
                SubmitOutcome::Enqueued
            }
            Admission::Deferred(delay) => {
                self.queue.push_delayed(message, delay)?;
                SubmitOutcome::Deferred(delay)
            }
        };
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("iris_messages_enqueued_total", "mode" => mode.to_string()).increment(1);
        Ok(outcome)
    }

    /// Flush due aggregation batches into the queue; returns how many
    /// messages were queued
    pub fn flush_aggregates(&self) -> usize {
        let due = self.aggregator.flush_due(|message| self.queue.is_stale(message));
        let mut queued = 0;
        for mut message in due {
            if message.batch.is_some() {
                if let Err(e) = self.renderer.render_message(&mut message) {
                    tracing::warn!(message_id = %message.id, error = %e, "failed to render batch");
                    continue;
                }
            }
            match self.enqueue(message) {
                Ok(_) => queued += 1,
                Err(e) => tracing::warn!(error = %e, "failed to queue aggregated message"),
            }
        }
        queued
    }

    /// Deliver one message popped from the queue
    pub async fn process(&self, mut message: Message) {
        let Some(contact) = message.contact().cloned() else {
            self.fail_target(&message, "no contact left".to_owned());
            return;
        };

        if !message.token_held {
            if let Admission::Deferred(delay) =
                self.rate_limiter.try_acquire(&message.target, &contact.mode)
            {
                self.requeue(message, delay);
                return;
            }
        }
        message.token_held = false;

        let started = Instant::now();
        let result = match self.plugins.get(&contact.mode) {
            None => Err(ChannelError::NoPlugin(contact.mode.clone())),
            Some(plugin) => {
                match tokio::time::timeout(self.send_timeout, plugin.send(&message)).await {
                    Ok(result) => result,
                    Err(_) => Err(ChannelError::Ambiguous(format!(
                        "send timed out after {}ms",
                        self.send_timeout.as_millis()
                    ))),
                }
            }
        };
        let latency = started.elapsed();

        message.channel_attempts += 1;
        message.attempts += 1;
        let (outcome, detail) = match &result {
            Ok(()) => (DeliveryOutcome::Success, None),
            Err(e) => (outcome_of(e), Some(e.detail())),
        };
        self.record(&message, &contact, outcome, latency, detail.clone());

        match self.policy.decide(&message, outcome) {
            Decision::Delivered => {
                self.reprioritizer.record_sent(&message.target, &contact.mode);
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                self.report(DeliveryReport::Delivered {
                    message_id: message.id,
                    batch_id: message.batch.as_ref().map(|b| b.id),
                    incident_ids: incident_ids_of(&message),
                    target: message.target.clone(),
                    mode: contact.mode,
                });
            }
            Decision::Retry { delay } => {
                tracing::debug!(
                    message_id = %message.id,
                    mode = %contact.mode,
                    attempt = message.channel_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying send"
                );
                self.requeue(message, delay);
            }
            Decision::Fallback => self.fall_back(message, detail.unwrap_or_default()),
            Decision::Exhausted => self.fail_target(&message, detail.unwrap_or_default()),
        }
    }

    /// Move to the next renderable contact, or fail the target
    fn fall_back(&self, mut message: Message, mut detail: String) {
        loop {
            let from = message.mode().cloned();
            if !message.advance_channel() {
                self.fail_target(&message, detail);
                return;
            }
            let Some(contact) = message.contact().cloned() else {
                self.fail_target(&message, detail);
                return;
            };
            tracing::info!(
                message_id = %message.id,
                from = ?from,
                to = %contact.mode,
                "falling back to next contact"
            );
            if !message.needs_render() {
                break;
            }
            match self.renderer.render_message(&mut message) {
                Ok(()) => break,
                Err(e) => {
                    detail = e.to_string();
                    message.channel_attempts = 1;
                    self.record(
                        &message,
                        &contact,
                        DeliveryOutcome::PermanentFailure,
                        Duration::ZERO,
                        Some(detail.clone()),
                    );
                }
            }
        }
        self.requeue(message, Duration::ZERO);
    }

    fn fail_target(&self, message: &Message, detail: String) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("iris_target_failures_total").increment(1);
        tracing::warn!(
            message_id = %message.id,
            target_user = %message.target,
            attempts = message.attempts,
            detail = %detail,
            "all channels failed for target"
        );
        self.audit.append(AuditRecord::TargetFailed {
            message_id: message.id,
            incident_id: message.incident_id(),
            target: message.target.clone(),
            detail: detail.clone(),
        });
        self.report(DeliveryReport::TargetFailed {
            message_id: message.id,
            batch_id: message.batch.as_ref().map(|b| b.id),
            incident_ids: incident_ids_of(message),
            target: message.target.clone(),
            detail,
        });
    }

    fn record(
        &self,
        message: &Message,
        contact: &Contact,
        outcome: DeliveryOutcome,
        latency: Duration,
        detail: Option<String>,
    ) {
        metrics::counter!(
            "iris_delivery_attempts_total",
            "mode" => contact.mode.to_string(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        metrics::histogram!("iris_delivery_latency_seconds", "mode" => contact.mode.to_string())
            .record(latency.as_secs_f64());

        self.audit.record_attempt(DeliveryAttempt {
            message_id: message.id,
            incident_id: message.incident_id(),
            batch_id: message.batch.as_ref().map(|b| b.id),
            target: message.target.clone(),
            mode: contact.mode.clone(),
            destination: contact.destination.clone(),
            attempt: message.channel_attempts,
            outcome,
            latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            detail,
            at: Utc::now(),
        });
    }

    fn requeue(&self, message: Message, delay: Duration) {
        let id = message.id;
        if let Err(e) = self.queue.requeue(message, delay) {
            tracing::warn!(message_id = %id, error = %e, "dropping message");
        }
    }

    fn report(&self, report: DeliveryReport) {
        if let Some(reports) = self.reports.lock().as_ref() {
            // receiver gone means the engine shut down
            let _ = reports.send(report);
        }
    }
}

fn outcome_of(error: &ChannelError) -> DeliveryOutcome {
    match error {
        ChannelError::Transient(_) => DeliveryOutcome::TransientFailure,
        ChannelError::Permanent(_) | ChannelError::NoPlugin(_) => DeliveryOutcome::PermanentFailure,
        ChannelError::Ambiguous(_) => DeliveryOutcome::Unknown,
    }
}

impl std::fmt::Debug for NotificationSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationSender")
            .field("queue", &self.queue)
            .field("plugins", &self.plugins)
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Plugin;
    use crate::render::{Template, TemplateContent, ANY_APPLICATION};
    use async_trait::async_trait;
    use iris_core::{Context, Fingerprint, MessageOrigin, Priority, QueueError};
    use std::collections::VecDeque;

    /// Plugin returning scripted results, then success
    struct Scripted {
        mode: Mode,
        script: Mutex<VecDeque<Result<(), ChannelError>>>,
        calls: AtomicU64,
    }

    impl Scripted {
        fn new(mode: Mode, script: Vec<Result<(), ChannelError>>) -> Arc<Self> {
            Arc::new(Self {
                mode,
                script: Mutex::new(script.into()),
                calls: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl Plugin for Scripted {
        fn mode(&self) -> &Mode {
            &self.mode
        }

        async fn send(&self, _message: &Message) -> Result<(), ChannelError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.script.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    fn sender(plugins: &[Arc<Scripted>]) -> NotificationSender {
        let mut registry = PluginRegistry::new();
        for plugin in plugins {
            registry.register(plugin.clone());
        }
        let renderer = Arc::new(MessageRenderer::new());
        renderer
            .register(
                Template::new("t")
                    .with_content(ANY_APPLICATION, Mode::im(), TemplateContent::new("s", "{{x}}"))
                    .with_content(ANY_APPLICATION, Mode::sms(), TemplateContent::new("", "{{x}}")),
            )
            .unwrap();
        NotificationSender::new(&IrisConfig::default(), registry, renderer)
    }

    fn message(chain: Vec<Mode>) -> Message {
        let mut context = Context::new();
        context.insert("x".into(), "hello".into());
        Message::new(
            MessageOrigin::Escalation {
                incident_id: IncidentId::new(),
                run: 1,
                plan: "p".into(),
                step: 0,
            },
            "api",
            "alice",
            Priority::High,
            chain
                .into_iter()
                .map(|mode| Contact::new(mode, "dest"))
                .collect(),
        )
        .with_template("t", context)
    }

    async fn drain(sender: &NotificationSender) {
        while let Some(next) = tokio::time::timeout(Duration::from_secs(600), sender.queue.pop())
            .await
            .ok()
            .flatten()
        {
            sender.process(next).await;
            if sender.queue.is_empty() {
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_fallback_then_success() {
        let transient = || Err(ChannelError::Transient("503".into()));
        let im = Scripted::new(Mode::im(), vec![transient(), transient(), transient()]);
        let sms = Scripted::new(Mode::sms(), vec![]);
        let sender = sender(&[im.clone(), sms.clone()]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        sender.set_reports(tx);

        let outcome = sender
            .submit(message(vec![Mode::im(), Mode::sms()]), None)
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Enqueued);
        drain(&sender).await;

        assert_eq!(im.calls.load(Ordering::Relaxed), 3);
        assert_eq!(sms.calls.load(Ordering::Relaxed), 1);
        let outcomes: Vec<_> = sender.audit.attempts().iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                DeliveryOutcome::TransientFailure,
                DeliveryOutcome::TransientFailure,
                DeliveryOutcome::TransientFailure,
                DeliveryOutcome::Success,
            ]
        );
        assert!(matches!(
            rx.try_recv(),
            Ok(DeliveryReport::Delivered { mode, .. }) if mode == Mode::sms()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_report_once() {
        let permanent = || Err(ChannelError::Permanent("invalid".into()));
        let im = Scripted::new(Mode::im(), vec![permanent()]);
        let sms = Scripted::new(Mode::sms(), vec![permanent()]);
        let sender = sender(&[im, sms]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        sender.set_reports(tx);

        sender
            .submit(message(vec![Mode::im(), Mode::sms()]), None)
            .unwrap();
        drain(&sender).await;

        assert!(matches!(rx.try_recv(), Ok(DeliveryReport::TargetFailed { .. })));
        assert!(rx.try_recv().is_err());
        assert_eq!(sender.stats().failed, 1);
        assert_eq!(sender.audit.attempts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_plugin_falls_back() {
        let sms = Scripted::new(Mode::sms(), vec![]);
        let sender = sender(&[sms.clone()]);
        sender
            .submit(message(vec![Mode::im(), Mode::sms()]), None)
            .unwrap();
        drain(&sender).await;
        assert_eq!(sms.calls.load(Ordering::Relaxed), 1);
        assert_eq!(sender.stats().delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_submission_quenched() {
        let sender = sender(&[Scripted::new(Mode::im(), vec![])]);
        let fingerprint = Fingerprint::compute("api", "sig", "alice");

        let first = sender
            .submit(message(vec![Mode::im()]).with_fingerprint(fingerprint), None)
            .unwrap();
        let second = sender
            .submit(message(vec![Mode::im()]).with_fingerprint(fingerprint), None)
            .unwrap();
        assert_eq!(first, SubmitOutcome::Enqueued);
        assert_eq!(second, SubmitOutcome::Quenched { suppressed: 1 });
        assert_eq!(sender.queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_submission_is_not_quenched() {
        let mut config = IrisConfig::default();
        config.sender.queue_capacity = 1;
        let mut registry = PluginRegistry::new();
        registry.register(Scripted::new(Mode::im(), vec![]));
        let renderer = Arc::new(MessageRenderer::new());
        renderer
            .register(Template::new("t").with_content(
                ANY_APPLICATION,
                Mode::im(),
                TemplateContent::new("s", "{{x}}"),
            ))
            .unwrap();
        let sender = NotificationSender::new(&config, registry, renderer);
        let fingerprint = Fingerprint::compute("api", "sig", "alice");

        sender.submit(message(vec![Mode::im()]), None).unwrap();
        let err = sender
            .submit(message(vec![Mode::im()]).with_fingerprint(fingerprint), None)
            .unwrap_err();
        assert!(matches!(
            err,
            IrisError::Queue(QueueError::Saturated { capacity: 1 })
        ));

        assert!(sender.queue.try_pop().is_some());
        let retry = sender
            .submit(message(vec![Mode::im()]).with_fingerprint(fingerprint), None)
            .unwrap();
        assert_eq!(retry, SubmitOutcome::Enqueued);

        // once queued, the fingerprint quenches again
        let duplicate = sender
            .submit(message(vec![Mode::im()]).with_fingerprint(fingerprint), None)
            .unwrap();
        assert_eq!(duplicate, SubmitOutcome::Quenched { suppressed: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn render_error_rejects_message() {
        let sender = sender(&[Scripted::new(Mode::call(), vec![])]);
        let err = sender
            .submit(message(vec![Mode::call()]), None)
            .unwrap_err();
        assert!(matches!(err, IrisError::Render(_)));
        assert!(sender.queue.is_empty());
    }
}
