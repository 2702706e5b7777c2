//! Iris Core - domain model for incident escalation
//!
//! Shared by the escalation engine and the sender:
//! - Plans, steps and target references
//! - Directory definitions of users, teams and schedules
//! - Incidents, messages and delivery records
//! - The error taxonomy and configuration
//!
//! # Example
//!
//! ```rust
//! use iris_core::{Plan, Priority, Step, StepTarget, TargetRef};
//! use std::time::Duration;
//!
//! let plan = Plan::new("db-oncall").with_step(
//!     Step::new(0, Duration::from_secs(60)).with_target(StepTarget::new(
//!         TargetRef::team("dba"),
//!         Priority::High,
//!         "db-alert",
//!     )),
//! );
//! assert!(plan.validate().is_ok());
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod plan;
pub mod target;
pub mod types;

pub use config::{
    IrisConfig, PluginConfig, QuenchConfig, RateLimitConfig, ResolverConfig, RetryConfig,
    SenderConfig,
};
pub use error::{
    ChannelError, ConfigError, IrisError, PlanError, QueueError, RenderError, ResolutionError,
    Result, StateMachineError,
};
pub use message::{BatchInfo, Fingerprint, Message, MessageOrigin};
pub use plan::{AggregationPolicy, Plan, Step, StepTarget, TargetRef, TrackingSpec};
pub use target::{ReprioritizationRule, Schedule, Team, TargetDefinition, User};
pub use types::{
    BatchId, Contact, Context, DeliveryAttempt, DeliveryOutcome, Incident, IncidentId, MessageId,
    Mode, Priority, RunState,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
