//! Iris Sender - multi-channel delivery pipeline
//!
//! Turns resolved notifications into delivered messages:
//! - Target resolution through a pluggable directory
//! - Per-mode template rendering
//! - Duplicate suppression, aggregation and rate limiting
//! - A bounded priority queue drained by a worker pool
//! - Retry, channel fallback and a hash-chained audit log
//!
//! # Example
//!
//! ```rust,no_run
//! use iris_core::IrisConfig;
//! use iris_sender::{MessageRenderer, NotificationSender, PluginRegistry, WorkerPool};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = IrisConfig::default();
//! let plugins = PluginRegistry::from_config(&config.plugins, config.sender.send_timeout())?;
//! let sender = Arc::new(NotificationSender::new(
//!     &config,
//!     plugins,
//!     Arc::new(MessageRenderer::new()),
//! ));
//! let pool = WorkerPool::spawn(
//!     sender.clone(),
//!     config.sender.workers,
//!     iris_sender::pool::DEFAULT_FLUSH_INTERVAL,
//!     config.quench.sweep_interval(),
//! );
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod audit;
pub mod directory;
pub mod plugin;
pub mod pool;
pub mod queue;
pub mod quench;
pub mod rate_limit;
pub mod render;
pub mod reprioritize;
pub mod resolver;
pub mod retry;
pub mod sender;

pub use aggregate::{AggregateDecision, AggregationKey, Aggregator};
pub use audit::{AuditEntry, AuditError, AuditLog, AuditRecord, AuditSink};
pub use directory::{CachedDirectory, Directory, InMemoryDirectory};
pub use plugin::{LogPlugin, Plugin, PluginRegistry, WebhookPlugin};
pub use pool::{PoolStats, WorkerPool};
pub use queue::DeliveryQueue;
pub use quench::{QuenchDecision, QuenchFilter};
pub use rate_limit::{Admission, RateLimiter};
pub use render::{MessageRenderer, Rendered, Template, TemplateContent, ANY_APPLICATION};
pub use reprioritize::Reprioritizer;
pub use resolver::{Resolution, ResolvedContact, TargetResolver};
pub use retry::{Decision, RetryPolicy};
pub use sender::{incident_ids_of, DeliveryReport, NotificationSender, SenderStats, SubmitOutcome};
