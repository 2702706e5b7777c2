//! Testing utilities for the Iris workspace
//!
//! Scripted plugins, directory and plan builders, and an engine harness
//! wired to in-memory stores.

#![allow(missing_docs)]

use async_trait::async_trait;
use iris_core::{
    ChannelError, DeliveryAttempt, Incident, IncidentId, IrisConfig, Message, MessageId, Mode,
    Plan, Priority, Step, StepTarget, TargetRef, Team, User,
};
use iris_engine::{EscalationEngine, InMemoryPlanStore, RunSnapshot};
use iris_sender::{
    InMemoryDirectory, MessageRenderer, Plugin, PluginRegistry, Template, TemplateContent,
    ANY_APPLICATION,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Template registered by the harness for every well-known mode
pub const TEMPLATE: &str = "alert";

/// What a scripted plugin was asked to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: MessageId,
    pub incident_id: Option<IncidentId>,
    pub target: String,
    pub destination: String,
    pub subject: String,
    pub body: String,
}

/// Plugin returning scripted results, then `Ok(())` once the script runs out
#[derive(Debug)]
pub struct ScriptedPlugin {
    mode: Mode,
    script: Mutex<VecDeque<Result<(), ChannelError>>>,
    fallback: Mutex<Result<(), ChannelError>>,
    delay: Option<Duration>,
    sent: Mutex<Vec<SentMessage>>,
}

impl ScriptedPlugin {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(())),
            delay: None,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Results for the next sends, in order
    pub fn with_script(self, script: Vec<Result<(), ChannelError>>) -> Self {
        *self.script.lock() = script.into();
        self
    }

    /// Result once the script is exhausted
    pub fn with_fallback(self, result: Result<(), ChannelError>) -> Self {
        *self.fallback.lock() = result;
        self
    }

    /// Sleep before answering, to exercise send timeouts
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every send permanently
    pub fn failing(mode: Mode) -> Self {
        Self::new(mode).with_fallback(Err(ChannelError::Permanent("invalid destination".into())))
    }

    /// Fail `n` sends transiently, then succeed
    pub fn flaky(mode: Mode, n: usize) -> Self {
        Self::new(mode).with_script(
            (0..n)
                .map(|_| Err(ChannelError::Transient("503 service unavailable".into())))
                .collect(),
        )
    }

    pub fn calls(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, target: &str) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.target == target)
            .collect()
    }
}

#[async_trait]
impl Plugin for ScriptedPlugin {
    fn mode(&self) -> &Mode {
        &self.mode
    }

    async fn send(&self, message: &Message) -> Result<(), ChannelError> {
        self.sent.lock().push(SentMessage {
            message_id: message.id,
            incident_id: message.incident_id(),
            target: message.target.clone(),
            destination: message
                .contact()
                .map(|c| c.destination.clone())
                .unwrap_or_default(),
            subject: message.subject.clone(),
            body: message.body.clone(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.lock().clone())
    }
}

/// User reachable on im, sms and email, preferring them in that order
/// for every priority
pub fn user(name: &str) -> User {
    let modes = vec![Mode::im(), Mode::sms(), Mode::email()];
    let mut user = User::new(name)
        .with_contact(Mode::im(), format!("@{name}"))
        .with_contact(Mode::sms(), format!("+1-555-{name}"))
        .with_contact(Mode::email(), format!("{name}@example.com"));
    for priority in Priority::ALL {
        user = user.with_modes(priority, modes.clone());
    }
    user
}

/// User reachable by email only
pub fn email_user(name: &str) -> User {
    User::new(name).with_contact(Mode::email(), format!("{name}@example.com"))
}

pub fn team(name: &str, members: &[TargetRef]) -> Team {
    Team {
        name: name.to_owned(),
        members: members.to_vec(),
    }
}

/// Step notifying targets at a priority with the harness template
pub fn step(ordinal: u32, timeout_secs: u64, priority: Priority, targets: &[TargetRef]) -> Step {
    targets.iter().fold(
        Step::new(ordinal, Duration::from_secs(timeout_secs)),
        |step, target| step.with_target(StepTarget::new(target.clone(), priority, TEMPLATE)),
    )
}

/// Plan with one step per timeout, each notifying `target` at high priority
pub fn plan(name: &str, target: TargetRef, timeouts: &[u64]) -> Plan {
    timeouts
        .iter()
        .enumerate()
        .fold(Plan::new(name), |plan, (i, timeout)| {
            let ordinal = u32::try_from(i).unwrap_or(u32::MAX);
            plan.with_step(step(ordinal, *timeout, Priority::High, &[target.clone()]))
        })
}

/// Incident carrying the variables of the harness template
pub fn incident(application: &str, plan: &str, title: &str) -> Incident {
    Incident::new(application, plan)
        .with_priority(Priority::High)
        .with_context_value("title", title)
}

/// Renderer with [`TEMPLATE`] for every well-known mode
pub fn renderer() -> Arc<MessageRenderer> {
    let renderer = MessageRenderer::new();
    let template = [Mode::im(), Mode::sms(), Mode::email(), Mode::call()]
        .into_iter()
        .fold(Template::new(TEMPLATE), |template, mode| {
            template.with_content(
                ANY_APPLICATION,
                mode,
                TemplateContent::new("[{{iris.application}}] {{title}}", "{{title}} ({{iris.message_id}})"),
            )
        });
    renderer.register(template).unwrap();
    Arc::new(renderer)
}

/// Configuration for tests: directory cache off, small pool
pub fn test_config() -> IrisConfig {
    let mut config = IrisConfig::default().with_workers(2);
    config.resolver.cache_ttl_secs = 0;
    config
}

/// Engine wired to in-memory stores and scripted plugins
pub struct Harness {
    pub engine: EscalationEngine,
    pub directory: Arc<InMemoryDirectory>,
    pub plans: Arc<InMemoryPlanStore>,
    pub plugins: BTreeMap<Mode, Arc<ScriptedPlugin>>,
}

pub struct HarnessBuilder {
    config: IrisConfig,
    plugins: BTreeMap<Mode, Arc<ScriptedPlugin>>,
    users: Vec<User>,
    teams: Vec<Team>,
    plans: Vec<Plan>,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        let plugins = [Mode::im(), Mode::sms(), Mode::email(), Mode::call()]
            .into_iter()
            .map(|mode| (mode.clone(), Arc::new(ScriptedPlugin::new(mode))))
            .collect();
        Self {
            config: test_config(),
            plugins,
            users: Vec::new(),
            teams: Vec::new(),
            plans: Vec::new(),
        }
    }
}

impl HarnessBuilder {
    pub fn config(mut self, edit: impl FnOnce(&mut IrisConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    /// Replace the plugin of its mode
    pub fn plugin(mut self, plugin: ScriptedPlugin) -> Self {
        self.plugins.insert(plugin.mode.clone(), Arc::new(plugin));
        self
    }

    /// Drop the plugin of a mode
    pub fn without_plugin(mut self, mode: &Mode) -> Self {
        self.plugins.remove(mode);
        self
    }

    pub fn user(mut self, user: User) -> Self {
        self.users.push(user);
        self
    }

    pub fn team(mut self, team: Team) -> Self {
        self.teams.push(team);
        self
    }

    pub fn plan(mut self, plan: Plan) -> Self {
        self.plans.push(plan);
        self
    }

    /// Build; must run inside a tokio runtime
    pub fn build(self) -> Harness {
        let directory = Arc::new(InMemoryDirectory::new());
        for user in self.users {
            directory.insert_user(user);
        }
        for team in self.teams {
            directory.insert_team(team);
        }
        let plans = Arc::new(InMemoryPlanStore::new());
        for plan in self.plans {
            plans.insert(plan);
        }
        let mut registry = PluginRegistry::new();
        for plugin in self.plugins.values() {
            registry.register(plugin.clone());
        }

        let engine = EscalationEngine::builder(self.config)
            .with_directory(directory.clone())
            .with_plan_store(plans.clone())
            .with_plugins(registry)
            .with_renderer(renderer())
            .build()
            .unwrap();

        Harness {
            engine,
            directory,
            plans,
            plugins: self.plugins,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    pub fn plugin(&self, mode: &Mode) -> Arc<ScriptedPlugin> {
        self.plugins[mode].clone()
    }

    pub async fn snapshot(&self, incident_id: IncidentId) -> RunSnapshot {
        self.engine.get_run_state(incident_id).await.unwrap()
    }

    pub fn attempts(&self, incident_id: IncidentId) -> Vec<DeliveryAttempt> {
        self.engine.audit().attempts_for(incident_id)
    }

    /// Let spawned tasks run without moving the clock
    pub async fn settle(&self) {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    /// Move the (paused) clock forward, then settle
    pub async fn advance(&self, by: Duration) {
        tokio::time::sleep(by).await;
        self.settle().await;
    }
}
