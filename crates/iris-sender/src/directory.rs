//! Target directory
//!
//! The directory answers "who is `team:dba`" and "which user owns this
//! phone number". Backends are pluggable through [`Directory`];
//! [`CachedDirectory`] puts a TTL cache from moka in front of any backend.

use async_trait::async_trait;
use iris_core::{Mode, ResolutionError, Schedule, TargetDefinition, TargetRef, Team, User};
use moka::future::Cache;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Source of target definitions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Directory: Send + Sync {
    /// Definition for a target reference, `None` when unknown
    ///
    /// # Errors
    /// `ResolutionError::Directory` when the backend fails
    async fn get_target(
        &self,
        target: &TargetRef,
    ) -> Result<Option<TargetDefinition>, ResolutionError>;

    /// User owning a contact destination, `None` when unknown
    ///
    /// # Errors
    /// `ResolutionError::Directory` when the backend fails
    async fn lookup_by_contact(
        &self,
        mode: &Mode,
        destination: &str,
    ) -> Result<Option<String>, ResolutionError>;
}

/// Directory held in memory
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    users: RwLock<HashMap<String, User>>,
    teams: RwLock<HashMap<String, Team>>,
    schedules: RwLock<HashMap<String, Schedule>>,
}

impl InMemoryDirectory {
    /// Create empty directory
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user
    pub fn insert_user(&self, user: User) {
        self.users.write().insert(user.name.clone(), user);
    }

    /// Insert or replace a team
    pub fn insert_team(&self, team: Team) {
        self.teams.write().insert(team.name.clone(), team);
    }

    /// Insert or replace a schedule
    pub fn insert_schedule(&self, schedule: Schedule) {
        self.schedules.write().insert(schedule.name.clone(), schedule);
    }

    /// Remove any entry for a reference
    pub fn remove(&self, target: &TargetRef) -> bool {
        match target {
            TargetRef::User(name) => self.users.write().remove(name).is_some(),
            TargetRef::Team(name) => self.teams.write().remove(name).is_some(),
            TargetRef::Schedule(name) => self.schedules.write().remove(name).is_some(),
        }
    }

    /// Number of users
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn get_target(
        &self,
        target: &TargetRef,
    ) -> Result<Option<TargetDefinition>, ResolutionError> {
        let found = match target {
            TargetRef::User(name) => self.users.read().get(name).cloned().map(TargetDefinition::User),
            TargetRef::Team(name) => self.teams.read().get(name).cloned().map(TargetDefinition::Team),
            TargetRef::Schedule(name) => self
                .schedules
                .read()
                .get(name)
                .cloned()
                .map(TargetDefinition::Schedule),
        };
        Ok(found)
    }

    async fn lookup_by_contact(
        &self,
        mode: &Mode,
        destination: &str,
    ) -> Result<Option<String>, ResolutionError> {
        Ok(self
            .users
            .read()
            .values()
            .find(|user| user.contacts.get(mode).is_some_and(|d| d == destination))
            .map(|user| user.name.clone()))
    }
}

/// TTL cache in front of another directory
///
/// Only hits are cached; a miss always reaches the backend so newly added
/// targets become visible immediately.
pub struct CachedDirectory {
    backend: Arc<dyn Directory>,
    cache: Cache<TargetRef, TargetDefinition>,
}

impl CachedDirectory {
    /// Wrap a backend
    #[must_use]
    pub fn new(backend: Arc<dyn Directory>, capacity: u64, ttl: Duration) -> Self {
        Self {
            backend,
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Drop a cached entry
    pub async fn invalidate(&self, target: &TargetRef) {
        self.cache.invalidate(target).await;
    }

    /// Drop every cached entry
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Approximate number of cached entries
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl std::fmt::Debug for CachedDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedDirectory")
            .field("entries", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Directory for CachedDirectory {
    async fn get_target(
        &self,
        target: &TargetRef,
    ) -> Result<Option<TargetDefinition>, ResolutionError> {
        if let Some(hit) = self.cache.get(target).await {
            return Ok(Some(hit));
        }
        let found = self.backend.get_target(target).await?;
        if let Some(definition) = &found {
            self.cache.insert(target.clone(), definition.clone()).await;
        }
        Ok(found)
    }

    async fn lookup_by_contact(
        &self,
        mode: &Mode,
        destination: &str,
    ) -> Result<Option<String>, ResolutionError> {
        self.backend.lookup_by_contact(mode, destination).await
    }
}
