//! YAML fixtures
//!
//! A fixture bundles templates, directory entries, plans and incidents in
//! one document, used by the `iris` binary to check plans and to simulate
//! escalations without external stores.
//!
//! ```yaml
//! templates:
//!   - name: db-alert
//!     content:
//!       "*":
//!         email: { subject: "{{title}}", body: "{{details}}" }
//! users:
//!   - name: alice
//!     contacts: { email: alice@example.com }
//! plans:
//!   - name: db-oncall
//!     steps:
//!       - ordinal: 0
//!         timeout_secs: 60
//!         targets:
//!           - { target: { type: user, name: alice }, priority: high, template: db-alert }
//! incidents:
//!   - { application: db, plan: db-oncall, context: { title: disk full, details: "/var at 98%" } }
//! ```

use crate::store::InMemoryPlanStore;
use iris_core::{ConfigError, Incident, Plan, PlanError, Schedule, Team, User};
use iris_sender::{InMemoryDirectory, MessageRenderer, Template};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fixture document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Fixture {
    /// Message templates
    pub templates: Vec<Template>,
    /// Users
    pub users: Vec<User>,
    /// Teams
    pub teams: Vec<Team>,
    /// On-call schedules
    pub schedules: Vec<Schedule>,
    /// Escalation plans
    pub plans: Vec<Plan>,
    /// Incidents to start
    pub incidents: Vec<Incident>,
}

impl Fixture {
    /// Parse YAML
    ///
    /// # Errors
    /// `ConfigError::Parse` on malformed YAML
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a file
    ///
    /// # Errors
    /// - `ConfigError::Io` when the file cannot be read
    /// - `ConfigError::Parse` on malformed YAML
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&source)
    }

    /// Validate every plan; returns the failures by plan name
    #[must_use]
    pub fn check_plans(&self) -> Vec<(String, PlanError)> {
        self.plans
            .iter()
            .filter_map(|plan| plan.validate().err().map(|e| (plan.name.clone(), e)))
            .collect()
    }

    /// Load users, teams and schedules into a directory
    pub fn load_directory(&self, directory: &InMemoryDirectory) {
        for user in &self.users {
            directory.insert_user(user.clone());
        }
        for team in &self.teams {
            directory.insert_team(team.clone());
        }
        for schedule in &self.schedules {
            directory.insert_schedule(schedule.clone());
        }
    }

    /// Load plans into a store
    pub fn load_plans(&self, store: &InMemoryPlanStore) {
        for plan in &self.plans {
            store.insert(plan.clone());
        }
    }

    /// Register templates with a renderer
    ///
    /// # Errors
    /// `ConfigError::Invalid` naming the first template that fails to compile
    pub fn load_templates(&self, renderer: &MessageRenderer) -> Result<(), ConfigError> {
        for template in &self.templates {
            renderer
                .register(template.clone())
                .map_err(|e| ConfigError::Invalid(format!("template {}: {e}", template.name)))?;
        }
        Ok(())
    }
}
