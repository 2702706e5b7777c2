//! Iris Engine - incident escalation
//!
//! Runs each incident through its escalation plan:
//! - One state machine per incident run (`PENDING` through `RESOLVED`,
//!   `EXHAUSTED` or `ABORTED`)
//! - A single timer facility with at most one armed timer per incident
//! - Acknowledgement, close and abort, including replies parsed from
//!   inbound messages
//! - Out-of-band notifications through the same delivery pipeline
//!
//! # Example
//!
//! ```rust,no_run
//! use iris_core::{Incident, IrisConfig};
//! use iris_engine::EscalationEngine;
//!
//! # async fn run() -> Result<(), iris_core::IrisError> {
//! let engine = EscalationEngine::builder(IrisConfig::default()).build()?;
//! let id = engine
//!     .start_run(Incident::new("db", "db-oncall").with_context_value("title", "disk full"))
//!     .await?;
//! engine.acknowledge(id, Some("alice".into())).await?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod fixture;
pub mod response;
pub mod run;
pub mod state;
pub mod store;
pub mod timer;

pub use engine::{EngineBuilder, EscalationEngine, OutOfBandNotification};
pub use fixture::Fixture;
pub use response::{parse_email_response, parse_response, ResponseCommand};
pub use run::{Run, RunEvent, RunEventKind, RunSnapshot, TargetFailure};
pub use state::{allowed_transitions, validate_transition};
pub use store::{InMemoryPlanStore, PlanStore};
pub use timer::{StepTimers, TimerFired};
