//! Scheduler sweep.
//!
//! Periodically asks the store which runs are due and drives each one
//! through the engine. Correctness never depends on the sweep running on
//! time: a late or missed sweep just means the next one catches up, since
//! the engine fires every overdue step in order on a single `advance_due`
//! call.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::EscalationEngine;

/// Backoff after a sweep-level error (store unreachable, etc.)
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct Scheduler {
    engine: Arc<EscalationEngine>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<EscalationEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Sweep loop (blocks until shutdown signal).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Scheduler started");

        loop {
            if *shutdown.borrow() {
                info!("Scheduler shutting down");
                break;
            }

            match self.sweep_once().await {
                Ok(fired) => {
                    if fired > 0 {
                        debug!(fired, "Sweep fired steps");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.interval) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                info!("Scheduler shutting down");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Sweep failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// One full pass over every group. Returns the number of steps fired.
    ///
    /// Runs advance concurrently (they share no state); a failure on one
    /// run is logged and never blocks the others.
    pub async fn sweep_once(&self) -> Result<usize, anyhow::Error> {
        let now = self.engine.clock().now();
        let mut total = 0usize;

        for group_id in self.engine.store().list_groups().await? {
            let due: Vec<Uuid> = self.engine.store().load_due_runs(&group_id, now).await?;
            if due.is_empty() {
                continue;
            }
            debug!(group_id = %group_id, due = due.len(), "Sweeping group");

            let mut tasks = JoinSet::new();
            for run_id in due {
                let engine = self.engine.clone();
                tasks.spawn(async move { (run_id, engine.advance_due(run_id).await) });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, Ok(fired))) => total += fired,
                    Ok((run_id, Err(e))) => {
                        warn!(run_id = %run_id, error = %e, "Failed to advance run");
                    }
                    Err(e) => error!(error = %e, "Sweep task panicked"),
                }
            }
        }

        Ok(total)
    }
}
