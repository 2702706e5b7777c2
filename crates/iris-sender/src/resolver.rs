//! Target resolution
//!
//! Expands a [`TargetRef`] into concrete users, each with an ordered
//! contact chain. Expansion is depth-first in configured member order;
//! a user reached twice is notified once and a team or schedule that
//! refers back to itself is expanded once.
//!
//! Mode order for a user is taken from, in order of precedence:
//! 1. the user's per-application override for the priority
//! 2. the user's own preference for the priority
//! 3. the configured default for the priority
//!
//! The configured fallback mode is appended when the user has a contact
//! for it, and the chain is capped at the maximum fallback depth.

use crate::directory::Directory;
use crate::reprioritize::Reprioritizer;
use indexmap::IndexSet;
use iris_core::{
    Contact, Mode, Priority, ResolutionError, ResolverConfig, TargetDefinition, TargetRef, User,
};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// One resolved user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedContact {
    /// User name
    pub user: String,
    /// Contacts in fallback order; never empty
    pub chain: Vec<Contact>,
}

/// Outcome of expanding one target reference
///
/// Resolution is partial: unknown members and users without contacts are
/// reported in `errors` while every resolvable user still appears in
/// `contacts`.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Resolved users in notification order
    pub contacts: Vec<ResolvedContact>,
    /// Problems met along the way
    pub errors: Vec<ResolutionError>,
}

impl Resolution {
    /// Whether nobody could be resolved
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

/// Resolves target references against a directory
pub struct TargetResolver {
    directory: Arc<dyn Directory>,
    config: ResolverConfig,
    max_depth: usize,
    reprioritizer: Option<Arc<Reprioritizer>>,
}

impl TargetResolver {
    /// Create resolver
    #[must_use]
    pub fn new(directory: Arc<dyn Directory>, config: ResolverConfig, max_depth: usize) -> Self {
        Self {
            directory,
            config,
            max_depth: max_depth.max(1),
            reprioritizer: None,
        }
    }

    /// With reprioritization applied to every chain
    #[must_use]
    pub fn with_reprioritizer(mut self, reprioritizer: Arc<Reprioritizer>) -> Self {
        self.reprioritizer = Some(reprioritizer);
        self
    }

    /// Underlying directory
    #[inline]
    #[must_use]
    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    /// Expand a target into users with contact chains
    pub async fn resolve(
        &self,
        target: &TargetRef,
        application: &str,
        priority: Priority,
    ) -> Resolution {
        let mut resolution = Resolution::default();
        let mut pending = VecDeque::from([target.clone()]);
        let mut expanded: HashSet<TargetRef> = HashSet::new();
        let mut users: IndexSet<String> = IndexSet::new();

        while let Some(next) = pending.pop_front() {
            match next {
                TargetRef::User(name) => {
                    if !users.insert(name.clone()) {
                        continue;
                    }
                    match self.resolve_user(&name, application, priority).await {
                        Ok(contact) => resolution.contacts.push(contact),
                        Err(e) => resolution.errors.push(e),
                    }
                }
                group => {
                    if !expanded.insert(group.clone()) {
                        tracing::debug!(target_ref = %group, "skipping already expanded group");
                        continue;
                    }
                    match self.members(&group).await {
                        Ok(members) => {
                            for member in members.into_iter().rev() {
                                pending.push_front(member);
                            }
                        }
                        Err(e) => resolution.errors.push(e),
                    }
                }
            }
        }

        if !resolution.errors.is_empty() {
            tracing::warn!(
                target_ref = %target,
                resolved = resolution.contacts.len(),
                errors = resolution.errors.len(),
                "partial target resolution"
            );
        }
        resolution
    }

    /// Resolve a single user by name
    ///
    /// # Errors
    /// - `ResolutionError::UnknownUser` when the user does not exist
    /// - `ResolutionError::NoContacts` when no contact matches any mode
    pub async fn resolve_user(
        &self,
        name: &str,
        application: &str,
        priority: Priority,
    ) -> Result<ResolvedContact, ResolutionError> {
        let user = self.user(name).await?;
        let chain = self.chain_for(&user, application, priority);
        if chain.is_empty() {
            return Err(ResolutionError::NoContacts(user.name));
        }
        Ok(ResolvedContact {
            user: user.name,
            chain,
        })
    }

    /// Resolve a user on one explicit mode
    ///
    /// # Errors
    /// - `ResolutionError::UnknownUser` when the user does not exist
    /// - `ResolutionError::NoContacts` when the user has no contact for the mode
    pub async fn resolve_user_mode(
        &self,
        name: &str,
        mode: &Mode,
    ) -> Result<ResolvedContact, ResolutionError> {
        let user = self.user(name).await?;
        let contact = user
            .contact(mode)
            .ok_or_else(|| ResolutionError::NoContacts(user.name.clone()))?;
        Ok(ResolvedContact {
            user: user.name,
            chain: vec![contact],
        })
    }

    /// Contact chain for a user
    #[must_use]
    pub fn chain_for(&self, user: &User, application: &str, priority: Priority) -> Vec<Contact> {
        let preferred = user
            .application_modes
            .get(application)
            .and_then(|modes| modes.get(&priority))
            .filter(|modes| !modes.is_empty())
            .or_else(|| user.modes.get(&priority).filter(|modes| !modes.is_empty()))
            .map_or_else(|| self.config.default_modes_for(priority), Vec::as_slice);

        let mut chain: Vec<Contact> = Vec::with_capacity(preferred.len() + 1);
        for mode in preferred {
            if chain.iter().any(|c| &c.mode == mode) {
                continue;
            }
            if let Some(contact) = user.contact(mode) {
                chain.push(contact);
            }
        }

        if let Some(reprioritizer) = &self.reprioritizer {
            reprioritizer.apply(user, &mut chain);
        }

        let fallback = self
            .config
            .fallback_mode
            .as_ref()
            .filter(|mode| !chain.iter().any(|c| &c.mode == *mode))
            .and_then(|mode| user.contact(mode));
        match fallback {
            Some(contact) => {
                chain.truncate(self.max_depth - 1);
                chain.push(contact);
            }
            None => chain.truncate(self.max_depth),
        }
        chain
    }

    async fn user(&self, name: &str) -> Result<User, ResolutionError> {
        match self.directory.get_target(&TargetRef::user(name)).await? {
            Some(TargetDefinition::User(user)) => Ok(user),
            _ => Err(ResolutionError::UnknownUser(name.to_owned())),
        }
    }

    async fn members(&self, group: &TargetRef) -> Result<Vec<TargetRef>, ResolutionError> {
        match (group, self.directory.get_target(group).await?) {
            (TargetRef::Team(_), Some(TargetDefinition::Team(team))) => Ok(team.members),
            (TargetRef::Schedule(_), Some(TargetDefinition::Schedule(schedule))) => {
                Ok(schedule.on_call)
            }
            (TargetRef::Team(name), _) => Err(ResolutionError::UnknownTeam(name.clone())),
            (TargetRef::Schedule(name), _) => Err(ResolutionError::UnknownSchedule(name.clone())),
            (TargetRef::User(name), _) => Err(ResolutionError::UnknownUser(name.clone())),
        }
    }
}

impl std::fmt::Debug for TargetResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetResolver")
            .field("max_depth", &self.max_depth)
            .field("fallback_mode", &self.config.fallback_mode)
            .finish_non_exhaustive()
    }
}
