//! Plan storage
//!
//! Runs take a snapshot of their plan at start, so replacing or removing
//! a stored plan never touches runs already in flight.

use async_trait::async_trait;
use iris_core::{IrisError, Plan};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Source of escalation plans
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Plan by name, `None` when unknown
    ///
    /// # Errors
    /// `IrisError::Store` when the backend fails
    async fn get_plan(&self, name: &str) -> Result<Option<Plan>, IrisError>;
}

/// Plans held in memory
#[derive(Debug, Default)]
pub struct InMemoryPlanStore {
    plans: RwLock<HashMap<String, Plan>>,
}

impl InMemoryPlanStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a plan; returns the previous one
    pub fn insert(&self, plan: Plan) -> Option<Plan> {
        self.plans.write().insert(plan.name.clone(), plan)
    }

    /// Remove a plan
    pub fn remove(&self, name: &str) -> Option<Plan> {
        self.plans.write().remove(name)
    }

    /// Stored plan names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plans.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of plans
    #[must_use]
    pub fn len(&self) -> usize {
        self.plans.read().len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plans.read().is_empty()
    }
}

#[async_trait]
impl PlanStore for InMemoryPlanStore {
    async fn get_plan(&self, name: &str) -> Result<Option<Plan>, IrisError> {
        Ok(self.plans.read().get(name).cloned())
    }
}
