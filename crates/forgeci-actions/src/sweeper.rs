// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background sweeps that repair state the request path cannot.
//!
//! Every sweep is idempotent and bounded per pass, so a crash between
//! passes loses nothing and a backlog drains over successive intervals.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::Result;
use crate::logstore::LogStore;
use crate::persistence::Persistence;
use crate::runs::RunManager;
use crate::status::Status;

/// Rows handled per sweep pass.
const SWEEP_BATCH: i64 = 100;

/// Periodic maintenance over tasks, jobs, logs, and stuck runs.
pub struct Sweeper {
    db: Arc<dyn Persistence>,
    logs: Arc<dyn LogStore>,
    runs: Arc<RunManager>,
    interval: Duration,
    zombie_task_timeout_secs: i64,
    abandoned_job_timeout_secs: i64,
    log_flush_timeout_secs: i64,
}

impl Sweeper {
    pub fn new(
        db: Arc<dyn Persistence>,
        logs: Arc<dyn LogStore>,
        runs: Arc<RunManager>,
        interval_secs: u64,
        zombie_task_timeout_secs: i64,
        abandoned_job_timeout_secs: i64,
        log_flush_timeout_secs: i64,
    ) -> Self {
        Self {
            db,
            logs,
            runs,
            interval: Duration::from_secs(interval_secs),
            zombie_task_timeout_secs,
            abandoned_job_timeout_secs,
            log_flush_timeout_secs,
        }
    }

    /// Run all sweeps forever. Individual sweep failures are logged and do
    /// not stop the loop.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep_zombie_tasks().await {
                warn!(error = %e, "zombie task sweep failed");
            }
            if let Err(e) = self.sweep_abandoned_jobs().await {
                warn!(error = %e, "abandoned job sweep failed");
            }
            if let Err(e) = self.sweep_unflushed_logs().await {
                warn!(error = %e, "log flush sweep failed");
            }
            if let Err(e) = self.sweep_incomplete_references().await {
                warn!(error = %e, "incomplete reference sweep failed");
            }
        }
    }

    /// Cancel tasks whose runner stopped reporting. Their runs are advanced
    /// so downstream jobs skip, and ephemeral runners that died mid-task are
    /// removed.
    pub async fn sweep_zombie_tasks(&self) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.zombie_task_timeout_secs);
        for task in self.db.list_zombie_tasks(cutoff, SWEEP_BATCH).await? {
            info!(task_id = task.id, runner_id = task.runner_id, "cancelling zombie task");
            self.db.cancel_task(task.id).await?;
            self.runs.advance_run(task.run_id).await?;

            if let Some(runner) = self.db.get_runner_by_id(task.runner_id).await?
                && runner.ephemeral
            {
                self.db.delete_runner(runner.id).await?;
            }
        }
        Ok(())
    }

    /// Cancel jobs no runner ever picked up within the timeout. Approval-gated
    /// runs are exempt; the gate, not runner supply, is what holds them.
    pub async fn sweep_abandoned_jobs(&self) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.abandoned_job_timeout_secs);
        for job in self.db.list_abandoned_jobs(cutoff, SWEEP_BATCH).await? {
            info!(job_id = job.id, job_key = %job.job_key, "cancelling abandoned job");
            self.db
                .update_job_status(job.id, Status::Cancelled.as_str())
                .await?;
            self.runs.advance_run(job.run_id).await?;
        }
        Ok(())
    }

    /// Retry log transfers that failed at task finalization.
    pub async fn sweep_unflushed_logs(&self) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.log_flush_timeout_secs);
        for task in self.db.list_unflushed_tasks(cutoff, SWEEP_BATCH).await? {
            if self.logs.has(&task.log_filename).await? {
                // Transferred earlier but the flag write was lost.
                self.db.mark_task_log_in_storage(task.id).await?;
                continue;
            }
            match self.logs.transfer(&task.log_filename).await {
                Ok(_) => self.db.mark_task_log_in_storage(task.id).await?,
                Err(e) => {
                    warn!(task_id = task.id, error = %e, "log transfer retry failed")
                }
            }
        }
        Ok(())
    }

    /// Re-drive runs whose placeholder expansion never happened, e.g. when
    /// the process died between finalizing a task and advancing its run.
    pub async fn sweep_incomplete_references(&self) -> Result<()> {
        for run in self
            .db
            .list_runs_with_incomplete_references(SWEEP_BATCH)
            .await?
        {
            if Status::parse(&run.status).is_terminal() {
                // Nothing left to expand; drop the flag.
                self.db.set_run_incomplete_references(run.id, false).await?;
                continue;
            }
            self.runs.advance_run(run.id).await?;
        }
        Ok(())
    }

}
