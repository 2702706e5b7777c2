//! Escalation engine
//!
//! Drives one [`Run`] per incident through its plan:
//!
//! ```text
//! start_run ─► dispatch step ─► arm timer ─► (timeout) ─► next step ...
//!                                   │
//!                      acknowledge / close ─► RESOLVED
//! ```
//!
//! Control never blocks on delivery. Dispatch ends once every message of
//! the step has been handed to the sender; timer expiries and delivery
//! reports arrive as events on a single driver task.

use crate::response::{parse_response, ResponseCommand};
use crate::run::{Run, RunEventKind, RunSnapshot};
use crate::store::{InMemoryPlanStore, PlanStore};
use crate::timer::{StepTimers, TimerFired};
use dashmap::{DashMap, DashSet};
use iris_core::{
    DeliveryAttempt, Fingerprint, Incident, IncidentId, IrisConfig, IrisError, Message, MessageId,
    MessageOrigin, Mode, Plan, PlanError, Priority, QueueError, RunState, Step, StepTarget,
};
use iris_sender::{
    AuditLog, AuditRecord, CachedDirectory, DeliveryReport, Directory, InMemoryDirectory,
    MessageRenderer, NotificationSender, PluginRegistry, Reprioritizer, ResolvedContact,
    SubmitOutcome, TargetResolver, WorkerPool,
};
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use ulid::Ulid;

/// Notification outside any incident
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutOfBandNotification {
    /// Application on whose behalf the message is sent
    pub application: String,
    /// Target user
    pub target: String,
    /// Priority; selects the user's mode order when no mode is given
    pub priority: Option<Priority>,
    /// Explicit mode, overriding priority-based selection
    pub mode: Option<Mode>,
    /// Subject
    pub subject: String,
    /// Body
    pub body: String,
}

impl OutOfBandNotification {
    /// Create notification at default priority
    #[must_use]
    pub fn new(
        application: impl Into<String>,
        target: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            application: application.into(),
            target: target.into(),
            priority: None,
            mode: None,
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// With priority
    #[inline]
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// With explicit mode
    #[inline]
    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// Builder for [`EscalationEngine`]
pub struct EngineBuilder {
    config: IrisConfig,
    directory: Option<Arc<dyn Directory>>,
    plans: Option<Arc<dyn PlanStore>>,
    plugins: Option<PluginRegistry>,
    renderer: Option<Arc<MessageRenderer>>,
    audit: Option<Arc<AuditLog>>,
}

impl EngineBuilder {
    /// Start from configuration
    #[must_use]
    pub fn new(config: IrisConfig) -> Self {
        Self {
            config,
            directory: None,
            plans: None,
            plugins: None,
            renderer: None,
            audit: None,
        }
    }

    /// With target directory (default: empty in-memory directory)
    #[inline]
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// With plan store (default: empty in-memory store)
    #[inline]
    #[must_use]
    pub fn with_plan_store(mut self, plans: Arc<dyn PlanStore>) -> Self {
        self.plans = Some(plans);
        self
    }

    /// With plugins (default: built from configuration)
    #[inline]
    #[must_use]
    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = Some(plugins);
        self
    }

    /// With template renderer
    #[inline]
    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<MessageRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// With shared audit log
    #[inline]
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Build the engine and spawn its workers
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// `IrisError::Config` when the configuration or a plugin is invalid
    pub fn build(self) -> Result<EscalationEngine, IrisError> {
        let config = self.config;
        config.validate()?;

        let plugins = match self.plugins {
            Some(plugins) => plugins,
            None => PluginRegistry::from_config(&config.plugins, config.sender.send_timeout())?,
        };
        let backend: Arc<dyn Directory> = self
            .directory
            .unwrap_or_else(|| Arc::new(InMemoryDirectory::new()));
        let directory: Arc<dyn Directory> = match config.resolver.cache_ttl() {
            Some(ttl) => Arc::new(CachedDirectory::new(
                backend,
                config.resolver.cache_capacity,
                ttl,
            )),
            None => backend,
        };
        let plans = self
            .plans
            .unwrap_or_else(|| Arc::new(InMemoryPlanStore::new()));
        let renderer = self
            .renderer
            .unwrap_or_else(|| Arc::new(MessageRenderer::new()));
        let audit = self.audit.unwrap_or_else(|| Arc::new(AuditLog::new()));

        let reprioritizer = Arc::new(Reprioritizer::new());
        let resolver = TargetResolver::new(
            directory,
            config.resolver.clone(),
            config.retry.max_fallback_depth,
        )
        .with_reprioritizer(reprioritizer.clone());
        let sender = Arc::new(
            NotificationSender::new(&config, plugins, renderer)
                .with_audit(audit)
                .with_reprioritizer(reprioritizer),
        );

        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        sender.set_reports(reports_tx);
        let (timers, timer_rx) = StepTimers::new();
        let pool = WorkerPool::spawn(
            sender.clone(),
            config.sender.workers,
            iris_sender::pool::DEFAULT_FLUSH_INTERVAL,
            config.quench.sweep_interval(),
        );

        let inner = Arc::new(Inner {
            config,
            plans,
            resolver,
            sender,
            runs: DashMap::new(),
            active: DashSet::new(),
            timers,
            messages: DashMap::new(),
            last_message: DashMap::new(),
            next_generation: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        });
        let driver = tokio::spawn(drive(inner.clone(), timer_rx, reports_rx));

        tracing::info!(workers = pool.stats().workers, "escalation engine started");
        Ok(EscalationEngine {
            inner,
            pool: SyncMutex::new(Some(pool)),
            driver: SyncMutex::new(Some(driver)),
        })
    }
}

/// Incident escalation engine
pub struct EscalationEngine {
    inner: Arc<Inner>,
    pool: SyncMutex<Option<WorkerPool>>,
    driver: SyncMutex<Option<JoinHandle<()>>>,
}

struct Inner {
    config: IrisConfig,
    plans: Arc<dyn PlanStore>,
    resolver: TargetResolver,
    sender: Arc<NotificationSender>,
    runs: DashMap<IncidentId, Arc<Mutex<Run>>>,
    /// Incidents with a live run; insertion is the at-most-one-run gate
    active: DashSet<IncidentId>,
    timers: StepTimers,
    /// Message and batch ids to the incidents they speak for
    messages: DashMap<Ulid, Vec<IncidentId>>,
    /// Latest delivered message or batch per user
    last_message: DashMap<String, Ulid>,
    next_generation: AtomicU64,
    shutdown: AtomicBool,
}

#[derive(Debug, Default)]
struct DispatchCounts {
    submitted: usize,
    quenched: usize,
    held: usize,
}

impl EscalationEngine {
    /// Builder
    #[must_use]
    pub fn builder(config: IrisConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Delivery pipeline
    #[must_use]
    pub fn sender(&self) -> &Arc<NotificationSender> {
        &self.inner.sender
    }

    /// Audit log
    #[must_use]
    pub fn audit(&self) -> &Arc<AuditLog> {
        self.inner.sender.audit()
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &IrisConfig {
        &self.inner.config
    }

    /// Number of armed step timers
    #[must_use]
    pub fn armed_timers(&self) -> usize {
        self.inner.timers.armed()
    }

    /// Whether a step timer is armed for an incident
    #[must_use]
    pub fn is_timer_armed(&self, incident_id: &IncidentId) -> bool {
        self.inner.timers.is_armed(incident_id)
    }

    /// Number of live (non-terminal) runs
    #[must_use]
    pub fn active_runs(&self) -> usize {
        self.inner.active.len()
    }

    /// Start escalating an incident under its named plan
    ///
    /// # Errors
    /// - `IrisError::PlanNotFound` when the plan does not exist
    /// - `IrisError::PlanInvalid` when the plan fails validation; the run
    ///   is recorded as `ABORTED`
    /// - `IrisError::RunAlreadyActive` when the incident already has a live run
    /// - `IrisError::Shutdown` after [`EscalationEngine::shutdown`]
    pub async fn start_run(&self, incident: Incident) -> Result<IncidentId, IrisError> {
        self.inner.ensure_running()?;
        let plan = self
            .inner
            .plans
            .get_plan(&incident.plan)
            .await?
            .ok_or_else(|| IrisError::PlanNotFound(incident.plan.clone()))?;
        self.start_run_with_plan(incident, plan).await
    }

    /// Start escalating an incident under an explicit plan
    ///
    /// # Errors
    /// As for [`EscalationEngine::start_run`], minus `PlanNotFound`
    pub async fn start_run_with_plan(
        &self,
        incident: Incident,
        plan: Plan,
    ) -> Result<IncidentId, IrisError> {
        self.inner.ensure_running()?;
        let incident_id = incident.id;
        if !self.inner.active.insert(incident_id) {
            return Err(IrisError::RunAlreadyActive(incident_id));
        }

        let validation = plan.validate();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(Mutex::new(
            Run::new(incident, Arc::new(plan)).with_generation(generation),
        ));
        let mut run = handle.lock().await;
        self.inner.runs.insert(incident_id, handle.clone());

        if let Err(e) = validation {
            tracing::warn!(incident_id = %incident_id, error = %e, "aborting run with invalid plan");
            self.inner.abort_locked(&mut run, e.to_string());
            return Err(e.into());
        }

        tracing::info!(
            incident_id = %incident_id,
            application = %run.incident.application,
            plan = %run.plan.name,
            priority = %run.incident.priority,
            "starting escalation run"
        );
        metrics::counter!("iris_runs_started_total").increment(1);
        self.inner.send_tracking(&mut run);
        self.inner.dispatch(&mut run).await;
        Ok(incident_id)
    }

    /// Acknowledge an incident, halting all further steps
    ///
    /// Acknowledging a run that already ended is a no-op returning its
    /// terminal state.
    ///
    /// # Errors
    /// `IrisError::RunNotFound` for an unknown incident
    pub async fn acknowledge(
        &self,
        incident_id: IncidentId,
        owner: Option<String>,
    ) -> Result<RunState, IrisError> {
        self.inner
            .resolve(incident_id, RunEventKind::Acknowledged { owner })
            .await
    }

    /// Close an incident without acknowledgement
    ///
    /// # Errors
    /// `IrisError::RunNotFound` for an unknown incident
    pub async fn close(&self, incident_id: IncidentId) -> Result<RunState, IrisError> {
        self.inner.resolve(incident_id, RunEventKind::Closed).await
    }

    /// Abort a run
    ///
    /// # Errors
    /// `IrisError::RunNotFound` for an unknown incident
    pub async fn abort(
        &self,
        incident_id: IncidentId,
        reason: impl Into<String>,
    ) -> Result<RunState, IrisError> {
        let handle = self.inner.run(incident_id)?;
        let mut run = handle.lock().await;
        if run.state.is_terminal() {
            return Ok(run.state);
        }
        self.inner.abort_locked(&mut run, reason.into());
        Ok(run.state)
    }

    /// Abort every live run bound to a plan; returns how many were aborted
    pub async fn invalidate_plan(&self, name: &str) -> usize {
        let reason = PlanError::Invalidated(name.to_owned()).to_string();
        let handles: Vec<Arc<Mutex<Run>>> =
            self.inner.runs.iter().map(|r| r.value().clone()).collect();
        let mut aborted = 0;
        for handle in handles {
            let mut run = handle.lock().await;
            if run.plan.name == name && !run.state.is_terminal() {
                self.inner.abort_locked(&mut run, reason.clone());
                aborted += 1;
            }
        }
        if aborted > 0 {
            tracing::warn!(plan = name, aborted, "plan invalidated");
        }
        aborted
    }

    /// Current state, step and history of a run
    pub async fn get_run_state(&self, incident_id: IncidentId) -> Option<RunSnapshot> {
        let handle = self.inner.run(incident_id).ok()?;
        let run = handle.lock().await;
        Some(run.snapshot())
    }

    /// Live stream of delivery attempts
    #[must_use]
    pub fn subscribe_attempts(&self) -> broadcast::Receiver<DeliveryAttempt> {
        self.inner.sender.audit().subscribe()
    }

    /// Send a message to a user outside any incident
    ///
    /// Never quenched; rate limited and retried like any other message.
    ///
    /// # Errors
    /// - `IrisError::Resolution` when the user or the requested mode is unknown
    /// - `IrisError::Queue` when the queue is saturated
    pub async fn notify(&self, notification: OutOfBandNotification) -> Result<MessageId, IrisError> {
        self.inner.ensure_running()?;
        let priority = notification.priority.unwrap_or_default();
        let contact = match &notification.mode {
            Some(mode) => {
                self.inner
                    .resolver
                    .resolve_user_mode(&notification.target, mode)
                    .await?
            }
            None => {
                self.inner
                    .resolver
                    .resolve_user(&notification.target, &notification.application, priority)
                    .await?
            }
        };
        let message = Message::new(
            MessageOrigin::OutOfBand,
            notification.application,
            contact.user,
            priority,
            contact.chain,
        )
        .with_content(notification.subject, notification.body);
        let id = message.id;
        self.inner.sender.submit(message, None)?;
        tracing::info!(message_id = %id, target_user = %notification.target, "queued out-of-band notification");
        Ok(id)
    }

    /// Act on a reply received on `mode` from `source`
    ///
    /// Returns the incidents the reply applied to.
    ///
    /// # Errors
    /// - `IrisError::InvalidResponse` for unparseable text, unknown ids, or
    ///   a `claim last` from an unknown sender
    /// - `IrisError::Resolution` when the directory lookup fails
    pub async fn handle_response(
        &self,
        mode: &Mode,
        source: &str,
        text: &str,
    ) -> Result<Vec<IncidentId>, IrisError> {
        let command = parse_response(text)?;
        self.apply_response(mode, source, command).await
    }

    /// Act on an already parsed reply
    ///
    /// # Errors
    /// As for [`EscalationEngine::handle_response`]
    pub async fn apply_response(
        &self,
        mode: &Mode,
        source: &str,
        command: ResponseCommand,
    ) -> Result<Vec<IncidentId>, IrisError> {
        let user = self
            .inner
            .resolver
            .directory()
            .lookup_by_contact(mode, source)
            .await?;

        let (id, owner) = match command {
            ResponseCommand::Claim(id) => (id, Some(user.unwrap_or_else(|| source.to_owned()))),
            ResponseCommand::Suppress(id) => (id, None),
            ResponseCommand::ClaimLast => {
                let user = user.ok_or_else(|| {
                    IrisError::InvalidResponse(format!("unknown sender {source} on {mode}"))
                })?;
                let last = self
                    .inner
                    .last_message
                    .get(&user)
                    .map(|r| *r.value())
                    .ok_or_else(|| {
                        IrisError::InvalidResponse(format!("no message sent to {user}"))
                    })?;
                (last, Some(user))
            }
        };

        let incidents = self
            .inner
            .messages
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| IrisError::InvalidResponse(format!("unknown message {id}")))?;

        for incident_id in &incidents {
            self.inner
                .resolve(
                    *incident_id,
                    RunEventKind::Acknowledged {
                        owner: owner.clone(),
                    },
                )
                .await?;
        }
        tracing::info!(
            mode = %mode,
            source,
            incidents = incidents.len(),
            owner = ?owner,
            "applied response"
        );
        Ok(incidents)
    }

    /// Forget terminal runs that ended at least `older_than` ago
    pub fn prune_terminal(&self, older_than: Duration) -> usize {
        let now = tokio::time::Instant::now();
        let mut pruned = Vec::new();
        self.inner.runs.retain(|id, handle| {
            let Ok(run) = handle.try_lock() else {
                return true;
            };
            let expired = run
                .finished_at
                .is_some_and(|at| now.duration_since(at) >= older_than);
            if expired {
                pruned.push(*id);
            }
            !expired
        });

        for id in &pruned {
            self.inner.sender.queue().forget_incident(id);
        }
        if !pruned.is_empty() {
            let runs = &self.inner.runs;
            self.inner
                .messages
                .retain(|_, incidents| incidents.iter().any(|id| runs.contains_key(id)));
            let messages = &self.inner.messages;
            self.inner
                .last_message
                .retain(|_, id| messages.contains_key(id));
            tracing::debug!(pruned = pruned.len(), "pruned terminal runs");
        }
        pruned.len()
    }

    /// Stop accepting work, disarm timers and drain the worker pool
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.timers.cancel_all();
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        tracing::info!("escalation engine stopped");
    }
}

impl Drop for EscalationEngine {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}

impl std::fmt::Debug for EscalationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationEngine")
            .field("active_runs", &self.inner.active.len())
            .field("armed_timers", &self.inner.timers.armed())
            .field("sender", &self.inner.sender)
            .finish_non_exhaustive()
    }
}

async fn drive(
    inner: Arc<Inner>,
    mut timers: mpsc::UnboundedReceiver<TimerFired>,
    mut reports: mpsc::UnboundedReceiver<DeliveryReport>,
) {
    loop {
        tokio::select! {
            Some(fired) = timers.recv() => {
                let inner = inner.clone();
                tokio::spawn(async move { inner.on_timeout(fired).await });
            }
            Some(report) = reports.recv() => inner.on_report(report).await,
            else => break,
        }
    }
}

impl Inner {
    fn ensure_running(&self) -> Result<(), IrisError> {
        if self.shutdown.load(Ordering::SeqCst) {
            Err(IrisError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn run(&self, incident_id: IncidentId) -> Result<Arc<Mutex<Run>>, IrisError> {
        self.runs
            .get(&incident_id)
            .map(|r| r.value().clone())
            .ok_or(IrisError::RunNotFound(incident_id))
    }

    fn transition(&self, run: &mut Run, to: RunState) -> Result<(), IrisError> {
        let from = run.transition(to)?;
        let incident_id = run.id();
        self.sender.audit().append(AuditRecord::Transition {
            incident_id,
            from,
            to,
            step: run.ordinal(),
        });
        tracing::info!(
            incident_id = %incident_id,
            from = %from,
            to = %to,
            step = ?run.ordinal(),
            round = run.round,
            "run transition"
        );
        if to.is_terminal() {
            metrics::counter!("iris_runs_total", "state" => to.as_str()).increment(1);
        }
        Ok(())
    }

    /// Release everything a finished run holds
    fn finish(&self, run: &Run, cancel_queued: bool) {
        let incident_id = run.id();
        self.timers.cancel(&incident_id);
        if cancel_queued {
            self.sender.queue().cancel_run(incident_id, run.generation);
        }
        self.active.remove(&incident_id);
    }

    fn abort_locked(&self, run: &mut Run, reason: String) {
        run.record(RunEventKind::Aborted {
            reason: reason.clone(),
        });
        if let Err(e) = self.transition(run, RunState::Aborted) {
            tracing::error!(incident_id = %run.id(), error = %e, "failed to abort run");
        }
        tracing::warn!(incident_id = %run.id(), reason, "run aborted");
        self.finish(run, true);
    }

    async fn resolve(
        &self,
        incident_id: IncidentId,
        event: RunEventKind,
    ) -> Result<RunState, IrisError> {
        let handle = self.run(incident_id)?;
        let mut run = handle.lock().await;
        if run.state.is_terminal() {
            tracing::debug!(incident_id = %incident_id, state = %run.state, "ignoring resolve of finished run");
            return Ok(run.state);
        }
        if let RunEventKind::Acknowledged { owner } = &event {
            run.owner.clone_from(owner);
        }
        run.record(event);
        self.transition(&mut run, RunState::Resolved)?;
        self.finish(&run, true);
        Ok(RunState::Resolved)
    }

    /// Send the plan's tracking notification, if any
    fn send_tracking(&self, run: &mut Run) {
        let Some(tracking) = run.plan.tracking.clone() else {
            return;
        };
        let message = Message::new(
            MessageOrigin::Tracking {
                incident_id: run.id(),
                run: run.generation,
                plan: run.plan.name.clone(),
            },
            run.incident.application.clone(),
            tracking.destination.clone(),
            run.incident.priority,
            vec![iris_core::Contact::new(
                tracking.mode.clone(),
                tracking.destination.clone(),
            )],
        )
        .with_template(tracking.template.clone(), run.incident.context.clone());

        match self.sender.submit(message, None) {
            Ok(_) => run.record(RunEventKind::TrackingSent {
                destination: tracking.destination,
            }),
            Err(e) => run.record(RunEventKind::SubmitFailed {
                target: tracking.destination,
                detail: e.to_string(),
            }),
        }
    }

    /// Dispatch the current step and arm its timer
    ///
    /// Entered in `PENDING` or `ESCALATED`; leaves the run in `WAITING_ACK`.
    async fn dispatch(&self, run: &mut Run) {
        if let Err(e) = self.dispatch_step(run).await {
            tracing::error!(incident_id = %run.id(), error = %e, "step dispatch failed");
            self.abort_locked(run, e.to_string());
        }
    }

    async fn dispatch_step(&self, run: &mut Run) -> Result<(), IrisError> {
        self.transition(run, RunState::Active)?;
        let step = run
            .current_step()
            .cloned()
            .ok_or_else(|| PlanError::NoSteps(run.plan.name.clone()))?;

        let mut counts = DispatchCounts::default();
        for target in &step.targets {
            self.dispatch_target(run, &step, target, &mut counts).await;
        }

        tracing::info!(
            incident_id = %run.id(),
            step = step.ordinal,
            round = run.round,
            submitted = counts.submitted,
            quenched = counts.quenched,
            held = counts.held,
            "step dispatched"
        );
        run.record(RunEventKind::StepDispatched {
            ordinal: step.ordinal,
            round: run.round,
            submitted: counts.submitted,
            quenched: counts.quenched,
            held: counts.held,
        });
        self.transition(run, RunState::WaitingAck)?;
        self.timers.arm(run.id(), step.timeout());
        Ok(())
    }

    async fn dispatch_target(
        &self,
        run: &mut Run,
        step: &Step,
        target: &StepTarget,
        counts: &mut DispatchCounts,
    ) {
        let application = run.incident.application.clone();
        let resolution = self
            .resolver
            .resolve(&target.target, &application, target.priority)
            .await;
        for error in &resolution.errors {
            run.record(RunEventKind::ResolutionFailed {
                target: target.target.to_string(),
                detail: error.to_string(),
            });
        }

        let mut priority = target.priority;
        let mut prefix = None;
        let contacts = if resolution.is_empty() {
            match self.creator_fallback(run, target).await {
                Some(contact) => {
                    priority = Priority::Low;
                    prefix = Some(format!(
                        "Iris could not reach any target for {} in plan {}; you are receiving this as the plan creator.\n\n",
                        target.target, run.plan.name
                    ));
                    vec![contact]
                }
                None => Vec::new(),
            }
        } else {
            resolution.contacts
        };

        for contact in contacts {
            let mut message = self.step_message(run, step, target, &contact, priority);
            if let Some(prefix) = &prefix {
                message = message.with_body_prefix(prefix.clone());
            }
            self.submit(run, message, counts);
        }
    }

    /// Plan creator in place of an unresolvable target
    async fn creator_fallback(&self, run: &mut Run, target: &StepTarget) -> Option<ResolvedContact> {
        let creator = run.plan.creator.clone()?;
        match self
            .resolver
            .resolve_user(&creator, &run.incident.application, Priority::Low)
            .await
        {
            Ok(contact) => {
                tracing::warn!(
                    incident_id = %run.id(),
                    target_ref = %target.target,
                    creator = %creator,
                    "notifying plan creator for unresolvable target"
                );
                run.record(RunEventKind::CreatorFallback {
                    target: target.target.to_string(),
                    creator,
                });
                Some(contact)
            }
            Err(e) => {
                run.record(RunEventKind::ResolutionFailed {
                    target: format!("creator:{creator}"),
                    detail: e.to_string(),
                });
                None
            }
        }
    }

    fn step_message(
        &self,
        run: &Run,
        step: &Step,
        target: &StepTarget,
        contact: &ResolvedContact,
        priority: Priority,
    ) -> Message {
        let incident = &run.incident;
        // round is part of the signature so a repeated step is not quenched
        let signature = Fingerprint::content_signature(
            &format!(
                "{}#{}.{}:{}",
                run.plan.name, step.ordinal, run.round, target.template
            ),
            &incident.context,
        );
        let fingerprint = Fingerprint::compute(&incident.application, &signature, &contact.user);

        Message::new(
            MessageOrigin::Escalation {
                incident_id: incident.id,
                run: run.generation,
                plan: run.plan.name.clone(),
                step: step.ordinal,
            },
            incident.application.clone(),
            contact.user.clone(),
            priority,
            contact.chain.clone(),
        )
        .with_template(target.template.clone(), incident.context.clone())
        .with_fingerprint(fingerprint)
    }

    fn submit(&self, run: &mut Run, message: Message, counts: &mut DispatchCounts) {
        let id = message.id;
        let user = message.target.clone();
        match self.sender.submit(message, run.plan.aggregation.as_ref()) {
            Ok(SubmitOutcome::Enqueued | SubmitOutcome::Deferred(_)) => {
                self.messages.insert(id.0, vec![run.id()]);
                counts.submitted += 1;
            }
            Ok(SubmitOutcome::Held) => {
                self.messages.insert(id.0, vec![run.id()]);
                counts.held += 1;
            }
            Ok(SubmitOutcome::Quenched { .. }) => counts.quenched += 1,
            Err(IrisError::Queue(QueueError::Saturated { .. })) => {
                tracing::warn!(incident_id = %run.id(), target_user = %user, "queue saturated; step partially delivered");
                run.partially_delivered = true;
                run.record(RunEventKind::QueueSaturated { target: user });
            }
            Err(e) => {
                tracing::warn!(incident_id = %run.id(), target_user = %user, error = %e, "message not submitted");
                run.record(RunEventKind::SubmitFailed {
                    target: user,
                    detail: e.to_string(),
                });
            }
        }
    }

    async fn on_timeout(&self, fired: TimerFired) {
        if !self.timers.take_if_current(&fired.incident_id, fired.generation) {
            tracing::debug!(incident_id = %fired.incident_id, "ignoring stale timer");
            return;
        }
        let Ok(handle) = self.run(fired.incident_id) else {
            return;
        };
        let mut run = handle.lock().await;
        if run.state != RunState::WaitingAck {
            return;
        }

        if let Err(e) = self.transition(&mut run, RunState::Escalated) {
            tracing::error!(incident_id = %run.id(), error = %e, "failed to escalate run");
            return;
        }
        match run.next_position() {
            Some((step_index, round)) => {
                run.step_index = step_index;
                run.round = round;
                self.dispatch(&mut run).await;
            }
            None => {
                if let Err(e) = self.transition(&mut run, RunState::Exhausted) {
                    tracing::error!(incident_id = %run.id(), error = %e, "failed to exhaust run");
                    return;
                }
                tracing::warn!(incident_id = %run.id(), "escalation plan exhausted");
                self.finish(&run, false);
            }
        }
    }

    async fn on_report(&self, report: DeliveryReport) {
        let incident_ids = report.incident_ids().to_vec();
        match &report {
            DeliveryReport::Delivered {
                message_id,
                batch_id,
                target,
                ..
            } => {
                let key = match batch_id {
                    Some(batch_id) => {
                        self.messages.insert(batch_id.0, incident_ids.clone());
                        batch_id.0
                    }
                    None => message_id.0,
                };
                if !incident_ids.is_empty() {
                    self.last_message.insert(target.clone(), key);
                }
            }
            DeliveryReport::TargetFailed { batch_id, .. } => {
                if let Some(batch_id) = batch_id {
                    self.messages.insert(batch_id.0, incident_ids.clone());
                }
            }
        }

        for incident_id in incident_ids {
            let Ok(handle) = self.run(incident_id) else {
                continue;
            };
            let mut run = handle.lock().await;
            match &report {
                DeliveryReport::Delivered { target, mode, .. } => {
                    run.record(RunEventKind::Delivered {
                        target: target.clone(),
                        mode: mode.clone(),
                    });
                }
                DeliveryReport::TargetFailed { target, detail, .. } => {
                    run.record_failure(target.clone(), detail.clone());
                }
            }
        }
    }
}
