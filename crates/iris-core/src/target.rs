//! Target definitions as stored in the directory
//!
//! A [`crate::TargetRef`] names a target; these types describe what the
//! name expands to.

use crate::plan::TargetRef;
use crate::types::{Contact, Mode, Priority};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Moves a mode to the front of a user's chain once it has been used
/// `count` times within `duration_secs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReprioritizationRule {
    /// Mode whose volume is counted
    pub src_mode: Mode,
    /// Mode promoted when the threshold is hit
    pub dst_mode: Mode,
    /// Messages within the window that trigger the rule
    pub count: u32,
    /// Window, in seconds
    pub duration_secs: u64,
}

impl ReprioritizationRule {
    /// Counting window
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// A notifiable person
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct User {
    /// Unique user name
    pub name: String,
    /// Destination per mode
    #[serde(default)]
    pub contacts: BTreeMap<Mode, String>,
    /// Preferred mode order per priority
    #[serde(default)]
    pub modes: BTreeMap<Priority, Vec<Mode>>,
    /// Per-application overrides of `modes`
    #[serde(default)]
    pub application_modes: BTreeMap<String, BTreeMap<Priority, Vec<Mode>>>,
    /// Reprioritization rules
    #[serde(default)]
    pub reprioritization: Vec<ReprioritizationRule>,
}

impl User {
    /// Create user without contacts
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// With a contact
    #[must_use]
    pub fn with_contact(mut self, mode: Mode, destination: impl Into<String>) -> Self {
        self.contacts.insert(mode, destination.into());
        self
    }

    /// With preferred mode order for a priority
    #[must_use]
    pub fn with_modes(mut self, priority: Priority, modes: Vec<Mode>) -> Self {
        self.modes.insert(priority, modes);
        self
    }

    /// With an application-specific mode order for a priority
    #[must_use]
    pub fn with_application_modes(
        mut self,
        application: impl Into<String>,
        priority: Priority,
        modes: Vec<Mode>,
    ) -> Self {
        self.application_modes
            .entry(application.into())
            .or_default()
            .insert(priority, modes);
        self
    }

    /// With a reprioritization rule
    #[must_use]
    pub fn with_rule(mut self, rule: ReprioritizationRule) -> Self {
        self.reprioritization.push(rule);
        self
    }

    /// Contact for a mode, if the user has one
    #[must_use]
    pub fn contact(&self, mode: &Mode) -> Option<Contact> {
        self.contacts
            .get(mode)
            .map(|destination| Contact::new(mode.clone(), destination.clone()))
    }
}

/// Ordered group of targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    /// Unique team name
    pub name: String,
    /// Members in notification order
    pub members: Vec<TargetRef>,
}

/// On-call rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Unique schedule name
    pub name: String,
    /// Currently on call, primary first
    pub on_call: Vec<TargetRef>,
}

/// Directory entry for any target kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetDefinition {
    /// User entry
    User(User),
    /// Team entry
    Team(Team),
    /// Schedule entry
    Schedule(Schedule),
}
