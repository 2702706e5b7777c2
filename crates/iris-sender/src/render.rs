//! Message rendering
//!
//! Templates are Handlebars sources keyed by application and mode, so the
//! same incident can produce a short SMS body and a long email body.
//! Content registered under application `*` applies to every application
//! without its own variant.
//!
//! Strict mode is on: a template that references a variable the context
//! does not provide fails to render instead of producing a blank.
//!
//! Every render context gains an `iris` object:
//! - `incident_id`, `plan`, `step` (absent for out-of-band messages)
//! - `application`, `target`, `destination`, `mode`, `priority`, `message_id`

use handlebars::Handlebars;
use iris_core::{BatchInfo, Message, MessageOrigin, Mode, RenderError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

/// Application key matching every application
pub const ANY_APPLICATION: &str = "*";

/// Subject and body sources for one application/mode pair
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TemplateContent {
    /// Subject source
    #[serde(default)]
    pub subject: String,
    /// Body source
    pub body: String,
}

impl TemplateContent {
    /// Create content
    #[must_use]
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }
}

/// Named template with per-application, per-mode content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    /// Template name referenced by plan steps
    pub name: String,
    /// application -> mode -> content
    pub content: BTreeMap<String, BTreeMap<Mode, TemplateContent>>,
}

impl Template {
    /// Create template without content
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: BTreeMap::new(),
        }
    }

    /// With content for an application and mode
    #[must_use]
    pub fn with_content(
        mut self,
        application: impl Into<String>,
        mode: Mode,
        content: TemplateContent,
    ) -> Self {
        self.content
            .entry(application.into())
            .or_default()
            .insert(mode, content);
        self
    }

    /// Application key holding content for the pair
    fn variant<'a>(&self, application: &'a str, mode: &Mode) -> Option<&'a str> {
        [application, ANY_APPLICATION].into_iter().find(|key| {
            self.content
                .get(*key)
                .is_some_and(|modes| modes.contains_key(mode))
        })
    }
}

/// Rendered subject and body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    /// Subject
    pub subject: String,
    /// Body
    pub body: String,
}

/// Template registry and renderer
pub struct MessageRenderer {
    registry: RwLock<Handlebars<'static>>,
    templates: RwLock<HashMap<String, Template>>,
}

impl Default for MessageRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRenderer {
    /// Create empty renderer
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        // Output goes to SMS, chat and email alike; HTML escaping is wrong for most.
        registry.register_escape_fn(handlebars::no_escape);
        Self {
            registry: RwLock::new(registry),
            templates: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace a template
    ///
    /// Every variant is compiled up front; nothing is registered if any
    /// variant fails to compile.
    ///
    /// # Errors
    /// `RenderError::Template` when a source does not compile
    pub fn register(&self, template: Template) -> Result<(), RenderError> {
        let mut compiled = Handlebars::new();
        for (application, modes) in &template.content {
            for (mode, content) in modes {
                for (part, source) in [("subject", &content.subject), ("body", &content.body)] {
                    compiled
                        .register_template_string(
                            &part_name(&template.name, application, mode, part),
                            source,
                        )
                        .map_err(|e| RenderError::Template {
                            template: template.name.clone(),
                            reason: e.to_string(),
                        })?;
                }
            }
        }

        let mut registry = self.registry.write();
        let mut templates = self.templates.write();
        if let Some(previous) = templates.remove(&template.name) {
            for (application, modes) in &previous.content {
                for mode in modes.keys() {
                    for part in ["subject", "body"] {
                        registry.unregister_template(&part_name(
                            &previous.name,
                            application,
                            mode,
                            part,
                        ));
                    }
                }
            }
        }
        for (name, compiled) in compiled.get_templates() {
            registry.register_template(name, compiled.clone());
        }
        tracing::debug!(template = %template.name, "registered template");
        templates.insert(template.name.clone(), template);
        Ok(())
    }

    /// Whether a template is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.templates.read().contains_key(name)
    }

    /// Whether a template can render for an application and mode
    #[must_use]
    pub fn supports(&self, name: &str, application: &str, mode: &Mode) -> bool {
        self.templates
            .read()
            .get(name)
            .is_some_and(|t| t.variant(application, mode).is_some())
    }

    /// Render a template against an arbitrary context
    ///
    /// # Errors
    /// - `RenderError::UnknownTemplate` when no template has this name
    /// - `RenderError::MissingVariant` when no content exists for the pair
    /// - `RenderError::Template` when rendering fails, including missing variables
    pub fn render(
        &self,
        name: &str,
        application: &str,
        mode: &Mode,
        context: &Value,
    ) -> Result<Rendered, RenderError> {
        let key = {
            let templates = self.templates.read();
            let template = templates
                .get(name)
                .ok_or_else(|| RenderError::UnknownTemplate(name.to_owned()))?;
            template
                .variant(application, mode)
                .ok_or_else(|| RenderError::MissingVariant {
                    template: name.to_owned(),
                    application: application.to_owned(),
                    mode: mode.clone(),
                })?
                .to_owned()
        };

        let registry = self.registry.read();
        let render_part = |part: &str| {
            registry
                .render(&part_name(name, &key, mode, part), context)
                .map_err(|e| RenderError::Template {
                    template: name.to_owned(),
                    reason: e.to_string(),
                })
        };
        Ok(Rendered {
            subject: render_part("subject")?,
            body: render_part("body")?,
        })
    }

    /// Render a message for its current contact
    ///
    /// Messages carrying pre-rendered content are left untouched. Batches
    /// render a summary instead of their template.
    ///
    /// # Errors
    /// - `RenderError::NoContact` when the chain is exhausted
    /// - any error from [`MessageRenderer::render`]
    pub fn render_message(&self, message: &mut Message) -> Result<(), RenderError> {
        let mode = message.mode().cloned().ok_or(RenderError::NoContact)?;
        let rendered = if let Some(batch) = &message.batch {
            batch_summary(message, batch)
        } else if let Some(name) = &message.template {
            self.render(name, &message.application, &mode, &render_context(message, &mode))?
        } else {
            return Ok(());
        };

        message.subject = rendered.subject;
        message.body = match &message.body_prefix {
            Some(prefix) => format!("{prefix}{}", rendered.body),
            None => rendered.body,
        };
        Ok(())
    }
}

impl std::fmt::Debug for MessageRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRenderer")
            .field("templates", &self.templates.read().len())
            .finish_non_exhaustive()
    }
}

fn part_name(template: &str, application: &str, mode: &Mode, part: &str) -> String {
    format!("{template}/{application}/{mode}/{part}")
}

/// Caller context plus the `iris` meta object
fn render_context(message: &Message, mode: &Mode) -> Value {
    let mut meta = json!({
        "application": message.application,
        "target": message.target,
        "destination": message.contact().map(|c| c.destination.as_str()),
        "mode": mode.as_str(),
        "priority": message.priority.as_str(),
        "message_id": message.id.to_string(),
    });
    if let Value::Object(fields) = &mut meta {
        match &message.origin {
            MessageOrigin::Escalation {
                incident_id,
                plan,
                step,
                ..
            } => {
                fields.insert("incident_id".into(), json!(incident_id.to_string()));
                fields.insert("plan".into(), json!(plan));
                fields.insert("step".into(), json!(step));
            }
            MessageOrigin::Tracking {
                incident_id, plan, ..
            } => {
                fields.insert("incident_id".into(), json!(incident_id.to_string()));
                fields.insert("plan".into(), json!(plan));
            }
            MessageOrigin::OutOfBand => {}
        }
    }

    let mut context = message.context.clone();
    context.insert("iris".into(), meta);
    Value::Object(context)
}

fn batch_summary(message: &Message, batch: &BatchInfo) -> Rendered {
    let count = batch.message_ids.len();
    let plan = message.origin.plan().unwrap_or("unknown");
    Rendered {
        subject: format!(
            "[{}] {count} messages from plan {plan}",
            message.application
        ),
        body: format!(
            "Batch {}: {count} messages for {} from plan {plan} across {} incidents were aggregated.",
            batch.id,
            message.target,
            batch.incident_ids.len()
        ),
    }
}
