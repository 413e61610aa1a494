// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task lifecycle: progress updates, output collection, log ingestion.
//!
//! `UpdateTask` doubles as the heartbeat and as the cancellation channel:
//! the response always carries the server's authoritative task state, and a
//! runner that sees a terminal result it did not report stops the task.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forgeci_protocol::runner_proto::{
    StepState, TaskResult, TaskState, UpdateLogRequest, UpdateLogResponse, UpdateTaskRequest,
    UpdateTaskResponse,
};
use tracing::{info, instrument, warn};

use crate::error::{ActionsError, Result};
use crate::logstore::LogStore;
use crate::persistence::{JobRecord, Persistence, RunRecord, RunnerRecord, StepUpdate, TaskRecord};
use crate::runs::RunManager;
use crate::status::Status;

/// Longest accepted output key, in bytes.
const MAX_OUTPUT_KEY_BYTES: usize = 255;
/// Largest accepted output value, in bytes.
const MAX_OUTPUT_VALUE_BYTES: usize = 1 << 20;

/// Notified when a task reaches a terminal status, for surfacing the result
/// on the triggering commit. The engine itself has no forge to talk to.
#[async_trait]
pub trait CommitStatusHook: Send + Sync {
    async fn task_finished(&self, run: &RunRecord, job: &JobRecord, status: Status) -> Result<()>;
}

/// Hook that does nothing.
pub struct NoopStatusHook;

#[async_trait]
impl CommitStatusHook for NoopStatusHook {
    async fn task_finished(
        &self,
        _run: &RunRecord,
        _job: &JobRecord,
        _status: Status,
    ) -> Result<()> {
        Ok(())
    }
}

/// Handles UpdateTask and UpdateLog for authenticated runners.
pub struct Lifecycle {
    db: Arc<dyn Persistence>,
    logs: Arc<dyn LogStore>,
    runs: Arc<RunManager>,
    hook: Arc<dyn CommitStatusHook>,
    /// When concurrency groups are active, every finished task may free a
    /// slot somewhere else, so finalization bumps the global tasks version.
    concurrency_enabled: bool,
}

impl Lifecycle {
    pub fn new(
        db: Arc<dyn Persistence>,
        logs: Arc<dyn LogStore>,
        runs: Arc<RunManager>,
        hook: Arc<dyn CommitStatusHook>,
        concurrency_enabled: bool,
    ) -> Self {
        Self {
            db,
            logs,
            runs,
            hook,
            concurrency_enabled,
        }
    }

    /// Apply a progress report from a runner and return the authoritative
    /// task state. Idempotent once the task is terminal.
    #[instrument(skip_all, fields(runner = %runner.uuid))]
    pub async fn update_task(
        &self,
        runner: &RunnerRecord,
        request: UpdateTaskRequest,
    ) -> Result<UpdateTaskResponse> {
        let state = request.state.ok_or_else(|| ActionsError::ValidationError {
            field: "state".to_string(),
            message: "missing task state".to_string(),
        })?;

        let task = self.owned_task(runner, state.id).await?;

        // A terminal task never changes again; replay the stored state so a
        // retrying (or cancelled) runner converges.
        if Status::parse(&task.status).is_terminal() {
            return self.authoritative_response(&task).await;
        }

        self.store_outputs(task.id, &request.outputs).await?;
        self.store_steps(task.id, &state.steps).await?;

        if task.started_at.is_none()
            && let Some(started) = from_unix(state.started_at)
        {
            self.db.set_task_started(task.id, started).await?;
        }

        let result = TaskResult::try_from(state.result).unwrap_or(TaskResult::Unspecified);
        if result.is_terminal() {
            self.finalize(runner, &task, result, state.stopped_at).await?;
        } else {
            self.db.touch_task(task.id).await?;
        }

        let task = self
            .db
            .get_task(task.id)
            .await?
            .ok_or(ActionsError::TaskNotFound { task_id: task.id })?;
        self.authoritative_response(&task).await
    }

    /// Append log rows with at-least-once semantics. The returned ack is the
    /// durable row count; the runner resends from there on mismatch.
    pub async fn update_log(
        &self,
        runner: &RunnerRecord,
        request: UpdateLogRequest,
    ) -> Result<UpdateLogResponse> {
        let task = self.owned_task(runner, request.task_id).await?;
        let ack = task.log_length;

        if request.rows.is_empty() {
            return Ok(UpdateLogResponse { ack_index: ack });
        }
        // A gap means an earlier batch was lost; refuse and let the runner
        // back up. A batch entirely below the ack is a pure duplicate.
        if request.index > ack || request.index + request.rows.len() as i64 <= ack {
            return Ok(UpdateLogResponse { ack_index: ack });
        }
        if task.log_in_storage {
            return Err(ActionsError::LogArchived { task_id: task.id });
        }

        let fresh = &request.rows[(ack - request.index) as usize..];
        let lengths = self.logs.append(&task.log_filename, fresh).await?;

        let mut indexes = task.log_index_list();
        let mut offset = task.log_size;
        for length in &lengths {
            indexes.push(offset);
            offset += length;
        }
        self.db
            .update_task_log_state(
                task.id,
                ack + fresh.len() as i64,
                offset,
                &serde_json::to_string(&indexes)?,
            )
            .await?;

        Ok(UpdateLogResponse {
            ack_index: ack + fresh.len() as i64,
        })
    }

    /// Fetch a task and verify it belongs to the calling runner. Foreign
    /// tasks read as missing so task ids cannot be probed.
    async fn owned_task(&self, runner: &RunnerRecord, task_id: i64) -> Result<TaskRecord> {
        let task = self
            .db
            .get_task(task_id)
            .await?
            .ok_or(ActionsError::TaskNotFound { task_id })?;
        if task.runner_id != runner.id {
            return Err(ActionsError::TaskNotFound { task_id });
        }
        Ok(task)
    }

    /// Insert the output delta, dropping oversized entries.
    async fn store_outputs(
        &self,
        task_id: i64,
        outputs: &std::collections::HashMap<String, String>,
    ) -> Result<()> {
        let accepted: Vec<(String, String)> = outputs
            .iter()
            .filter(|(k, v)| {
                let fits = k.len() <= MAX_OUTPUT_KEY_BYTES && v.len() <= MAX_OUTPUT_VALUE_BYTES;
                if !fits {
                    warn!(task_id, key_len = k.len(), value_len = v.len(), "dropping oversized output");
                }
                fits
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if accepted.is_empty() {
            return Ok(());
        }
        self.db.insert_task_outputs(task_id, &accepted).await
    }

    async fn store_steps(&self, task_id: i64, steps: &[StepState]) -> Result<()> {
        if steps.is_empty() {
            return Ok(());
        }
        let updates: Vec<StepUpdate> = steps
            .iter()
            .map(|s| {
                let result = TaskResult::try_from(s.result).unwrap_or(TaskResult::Unspecified);
                StepUpdate {
                    step_index: s.id,
                    status: step_status(result, s.started_at).as_str().to_string(),
                    log_index: s.log_index,
                    log_length: s.log_length,
                    started_at: from_unix(s.started_at),
                    stopped_at: from_unix(s.stopped_at),
                }
            })
            .collect();
        self.db.upsert_task_steps(task_id, &updates).await
    }

    /// Terminal transition: close the task and its job, publish the job's
    /// outputs, and push the run forward.
    async fn finalize(
        &self,
        runner: &RunnerRecord,
        task: &TaskRecord,
        result: TaskResult,
        stopped_at: i64,
    ) -> Result<()> {
        let status = Status::from_result(result);
        let stopped = from_unix(stopped_at).unwrap_or_else(Utc::now);
        self.db
            .finalize_task(task.id, task.job_id, status.as_str(), stopped)
            .await?;
        info!(task_id = task.id, job_id = task.job_id, %status, "task finished");

        // The resolver reads needs outputs off the job row.
        let outputs: std::collections::HashMap<String, String> = self
            .db
            .list_task_outputs(task.id)
            .await?
            .into_iter()
            .map(|o| (o.output_key, o.output_value))
            .collect();
        if !outputs.is_empty() {
            self.db
                .set_job_outputs(task.job_id, &serde_json::to_string(&outputs)?)
                .await?;
        }

        if let Some(run) = self.db.get_run(task.run_id).await?
            && let Some(job) = self.db.get_job(task.job_id).await?
        {
            if run.trigger_event != "schedule"
                && let Err(e) = self.hook.task_finished(&run, &job, status).await
            {
                warn!(run_id = run.id, error = %e, "commit status hook failed");
            }
        }

        self.runs.advance_run(task.run_id).await?;

        if self.concurrency_enabled {
            self.db.increment_tasks_version(0, 0).await?;
        }

        if runner.ephemeral {
            info!(runner_id = runner.id, "deleting ephemeral runner after its task");
            self.db.delete_runner(runner.id).await?;
        }

        // Move the log out of the pending area; the flush sweeper retries
        // on failure.
        match self.logs.transfer(&task.log_filename).await {
            Ok(_) => self.db.mark_task_log_in_storage(task.id).await?,
            Err(e) => {
                warn!(task_id = task.id, error = %e, "log transfer failed, leaving for sweeper")
            }
        }

        Ok(())
    }

    /// Server-side view of the task, as the runner protocol shapes it.
    async fn authoritative_response(&self, task: &TaskRecord) -> Result<UpdateTaskResponse> {
        let steps = self
            .db
            .list_task_steps(task.id)
            .await?
            .into_iter()
            .map(|s| StepState {
                id: s.step_index,
                result: Status::parse(&s.status).to_result() as i32,
                log_index: s.log_index,
                log_length: s.log_length,
                started_at: to_unix(s.started_at),
                stopped_at: to_unix(s.stopped_at),
            })
            .collect();
        let sent_outputs = self
            .db
            .list_task_outputs(task.id)
            .await?
            .into_iter()
            .map(|o| o.output_key)
            .collect();

        Ok(UpdateTaskResponse {
            state: Some(TaskState {
                id: task.id,
                result: Status::parse(&task.status).to_result() as i32,
                steps,
                started_at: to_unix(task.started_at),
                stopped_at: to_unix(task.stopped_at),
            }),
            sent_outputs,
        })
    }
}

/// Status for a reported step: terminal results map directly, otherwise the
/// step is running once started and unknown before that.
fn step_status(result: TaskResult, started_at: i64) -> Status {
    if result.is_terminal() {
        Status::from_result(result)
    } else if started_at > 0 {
        Status::Running
    } else {
        Status::Unknown
    }
}

fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    DateTime::from_timestamp(secs, 0)
}

fn to_unix(at: Option<DateTime<Utc>>) -> i64 {
    at.map(|t| t.timestamp()).unwrap_or(0)
}
