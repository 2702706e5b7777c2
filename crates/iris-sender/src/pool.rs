//! Worker pool
//!
//! A fixed number of workers pop from the shared delivery queue and hand
//! each message to [`NotificationSender::process`]. Background tasks flush
//! aggregation batches and sweep expired quench entries.

use crate::sender::NotificationSender;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Interval between aggregation flush checks
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Worker tasks spawned
    pub workers: usize,
    /// Messages waiting in the queue
    pub queued: usize,
}

/// Running delivery workers
#[derive(Debug)]
pub struct WorkerPool {
    sender: Arc<NotificationSender>,
    workers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn workers and background tasks
    #[must_use]
    pub fn spawn(
        sender: Arc<NotificationSender>,
        workers: usize,
        flush_interval: Duration,
        sweep_interval: Option<Duration>,
    ) -> Self {
        let workers: Vec<JoinHandle<()>> = (0..workers.max(1))
            .map(|worker| {
                let sender = sender.clone();
                tokio::spawn(async move {
                    tracing::debug!(worker, "delivery worker started");
                    while let Some(message) = sender.queue().pop().await {
                        sender.process(message).await;
                    }
                    tracing::debug!(worker, "delivery worker stopped");
                })
            })
            .collect();

        let mut background = Vec::new();
        {
            let sender = sender.clone();
            background.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(flush_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let flushed = sender.flush_aggregates();
                    if flushed > 0 {
                        tracing::debug!(flushed, "flushed aggregated messages");
                    }
                }
            }));
        }
        if let Some(interval) = sweep_interval {
            background.push(sender.quench().clone().spawn_sweeper(interval));
        }

        tracing::info!(workers = workers.len(), "delivery pool started");
        Self {
            sender,
            workers,
            background,
        }
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers.len(),
            queued: self.sender.queue().len(),
        }
    }

    /// Close the queue, let workers drain ready messages, then stop
    pub async fn shutdown(mut self) {
        self.sender.queue().close();
        for task in &self.background {
            task.abort();
        }
        for worker in std::mem::take(&mut self.workers) {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "delivery worker panicked");
            }
        }
        tracing::info!("delivery pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}
