// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for forgeci-actions.
//!
//! This module defines the persistence abstraction and backend implementations.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use crate::error::ActionsError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Runner record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunnerRecord {
    /// Database primary key.
    pub id: i64,
    /// Stable UUID presented by the runner on every call.
    pub uuid: String,
    /// Hex SHA-256 of salt + secret token.
    pub token_hash: String,
    /// Per-runner random salt for the token hash.
    pub token_salt: String,
    /// Display name.
    pub name: String,
    /// Runner software version as last declared.
    pub version: String,
    /// Owning user/org id; 0 for repo-scoped and global runners.
    pub owner_id: i64,
    /// Owning repository id; 0 for owner-scoped and global runners.
    pub repo_id: i64,
    /// JSON array of labels.
    pub labels: String,
    /// Ephemeral runners are deleted after their single task terminates.
    pub ephemeral: bool,
    /// When the runner registered.
    pub created_at: DateTime<Utc>,
    /// Last successful poll.
    pub last_online: Option<DateTime<Utc>>,
}

impl RunnerRecord {
    /// Parsed label list.
    pub fn label_list(&self) -> Vec<String> {
        serde_json::from_str(&self.labels).unwrap_or_default()
    }
}

/// Registration token record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RegistrationTokenRecord {
    /// Database primary key.
    pub id: i64,
    /// Opaque token value handed to the administrator.
    pub token: String,
    /// Owning user/org id; 0 for repo-scoped and global tokens.
    pub owner_id: i64,
    /// Owning repository id; 0 for owner-scoped and global tokens.
    pub repo_id: i64,
    /// Inactive tokens are refused; a token goes inactive once consumed.
    pub is_active: bool,
    /// When the token was issued.
    pub created_at: DateTime<Utc>,
}

/// Run record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    /// Database primary key.
    pub id: i64,
    /// Display title (usually the head commit message).
    pub title: String,
    /// Owning user/org id.
    pub owner_id: i64,
    /// Owning repository id.
    pub repo_id: i64,
    /// Workflow file identifier within the repository.
    pub workflow_id: String,
    /// Trigger event name (push, pull_request, ...).
    pub trigger_event: String,
    /// Git ref the run executes on.
    pub git_ref: String,
    /// Head commit SHA.
    pub commit_sha: String,
    /// True for pull requests from forks; suppresses OIDC for the run.
    pub is_fork_pull_request: bool,
    /// Run-level OIDC toggle from the workflow file.
    pub enable_oidc: bool,
    /// JSON event payload used for the Git context.
    pub event_payload: String,
    /// Aggregated run status.
    pub status: String,
    /// JSON `{code, details}` when expansion failed; terminal failure.
    pub pre_execution_error: Option<String>,
    /// Run is gated on a manual approval (e.g. first-time contributor).
    pub needs_approval: bool,
    /// User id that approved the run; 0 when not approved.
    pub approved_by: i64,
    /// Consistency-sweep flag: expansion saw unresolved references.
    pub has_incomplete_references: bool,
    /// Concurrency group key; empty when unset.
    pub concurrency_group: String,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the first task started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// Job record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    /// Database primary key.
    pub id: i64,
    /// Run this job belongs to.
    pub run_id: i64,
    /// Owning user/org id (denormalized from the run).
    pub owner_id: i64,
    /// Owning repository id (denormalized from the run).
    pub repo_id: i64,
    /// Job key in the workflow file.
    pub job_key: String,
    /// Display name, including matrix values for expanded jobs.
    pub name: String,
    /// JSON array of predecessor job keys.
    pub needs: String,
    /// JSON array of required runner labels.
    pub runs_on: String,
    /// Raw `if:` expression; empty means the success() default.
    pub if_condition: String,
    /// JSON map of matrix values chosen for this expansion.
    pub matrix: String,
    /// Concrete single-job workflow YAML dispatched to the runner.
    pub payload: Vec<u8>,
    /// Placeholder jobs carry an unexpanded matrix or `uses` reference and
    /// are replaced once their `needs` are terminal.
    pub is_placeholder: bool,
    /// Outer job of a reusable-workflow call; never dispatched to a runner.
    pub is_workflow_call: bool,
    /// JSON map: declared output name -> source expression (workflow calls).
    pub outputs_map: String,
    /// JSON map of collected outputs, filled when the job terminates.
    pub outputs: String,
    /// Task currently or last assigned; 0 when never picked.
    pub task_id: i64,
    /// Job status.
    pub status: String,
    /// When the job row was created.
    pub created_at: DateTime<Utc>,
    /// When a runner picked the job up.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Parsed `needs` list.
    pub fn needs_list(&self) -> Vec<String> {
        serde_json::from_str(&self.needs).unwrap_or_default()
    }

    /// Parsed `runs-on` label list.
    pub fn runs_on_list(&self) -> Vec<String> {
        serde_json::from_str(&self.runs_on).unwrap_or_default()
    }

    /// Parsed collected outputs.
    pub fn output_map(&self) -> std::collections::HashMap<String, String> {
        serde_json::from_str(&self.outputs).unwrap_or_default()
    }
}

/// Fields for inserting a new run.
#[derive(Debug, Clone, Default)]
pub struct NewRun {
    pub title: String,
    pub owner_id: i64,
    pub repo_id: i64,
    pub workflow_id: String,
    pub trigger_event: String,
    pub git_ref: String,
    pub commit_sha: String,
    pub is_fork_pull_request: bool,
    pub enable_oidc: bool,
    pub event_payload: String,
    pub needs_approval: bool,
    pub concurrency_group: String,
}

/// Fields for inserting a new job.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub run_id: i64,
    pub owner_id: i64,
    pub repo_id: i64,
    pub job_key: String,
    pub name: String,
    /// JSON array of predecessor job keys.
    pub needs: String,
    /// JSON array of required runner labels.
    pub runs_on: String,
    pub if_condition: String,
    /// JSON map of matrix values.
    pub matrix: String,
    pub payload: Vec<u8>,
    pub is_placeholder: bool,
    pub is_workflow_call: bool,
    /// JSON map of declared outputs.
    pub outputs_map: String,
    /// Initial status (blocked or waiting).
    pub status: String,
}

/// Task record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRecord {
    /// Database primary key.
    pub id: i64,
    /// Job this task executes.
    pub job_id: i64,
    /// Run the job belongs to (denormalized).
    pub run_id: i64,
    /// Runner the task is assigned to.
    pub runner_id: i64,
    /// Idempotency key from the FetchTask poll that created the task.
    pub request_key: String,
    /// Task status.
    pub status: String,
    /// Log file name in storage once transferred.
    pub log_filename: String,
    /// True once the log lives in storage rather than the row store.
    pub log_in_storage: bool,
    /// Number of durably appended log rows (the ack index).
    pub log_length: i64,
    /// Total log size in bytes.
    pub log_size: i64,
    /// JSON array: byte offset of each log row.
    pub log_indexes: String,
    /// Log was deleted by retention.
    pub log_expired: bool,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the runner reported the task started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Last update from the runner; drives the zombie sweeper.
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Parsed log row offsets.
    pub fn log_index_list(&self) -> Vec<i64> {
        serde_json::from_str(&self.log_indexes).unwrap_or_default()
    }
}

/// Step record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskStepRecord {
    /// Database primary key.
    pub id: i64,
    /// Task this step belongs to.
    pub task_id: i64,
    /// Zero-based step index.
    pub step_index: i64,
    /// Step status.
    pub status: String,
    /// First log row of this step.
    pub log_index: i64,
    /// Number of log rows belonging to this step.
    pub log_length: i64,
    /// When the step started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step finished.
    pub stopped_at: Option<DateTime<Utc>>,
}

/// Step fields as reported by the runner, for upserting.
#[derive(Debug, Clone)]
pub struct StepUpdate {
    pub step_index: i64,
    pub status: String,
    pub log_index: i64,
    pub log_length: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// Task output row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskOutputRecord {
    /// Database primary key.
    pub id: i64,
    /// Task that produced the output.
    pub task_id: i64,
    /// Output key (at most 255 bytes).
    pub output_key: String,
    /// Output value (at most 1 MiB).
    pub output_value: String,
}

/// Encrypted secret row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SecretRecord {
    /// Database primary key.
    pub id: i64,
    /// Owning user/org id; 0 for repo-scoped secrets.
    pub owner_id: i64,
    /// Owning repository id; 0 for owner-scoped secrets.
    pub repo_id: i64,
    /// Uppercased secret name.
    pub name: String,
    /// Nonce-prefixed AES-256-GCM ciphertext.
    pub data: Vec<u8>,
    /// When the secret was stored.
    pub created_at: DateTime<Utc>,
}

/// Plaintext variable row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VariableRecord {
    /// Database primary key.
    pub id: i64,
    /// Owning user/org id; 0 for repo-scoped variables.
    pub owner_id: i64,
    /// Owning repository id; 0 for owner-scoped variables.
    pub repo_id: i64,
    /// Uppercased variable name.
    pub name: String,
    /// Variable value with normalized newlines.
    pub data: String,
}

/// Persistence interface used by the Actions engine.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Runners and registration tokens
    // ========================================================================

    async fn create_runner(
        &self,
        uuid: &str,
        token_hash: &str,
        token_salt: &str,
        name: &str,
        version: &str,
        owner_id: i64,
        repo_id: i64,
        labels: &str,
        ephemeral: bool,
    ) -> Result<RunnerRecord, ActionsError>;

    async fn get_runner_by_uuid(&self, uuid: &str) -> Result<Option<RunnerRecord>, ActionsError>;

    async fn get_runner_by_id(&self, runner_id: i64) -> Result<Option<RunnerRecord>, ActionsError>;

    async fn update_runner_declare(
        &self,
        runner_id: i64,
        labels: &str,
        version: &str,
    ) -> Result<(), ActionsError>;

    /// Record a successful poll (bumps last_online).
    async fn touch_runner(&self, runner_id: i64) -> Result<(), ActionsError>;

    async fn delete_runner(&self, runner_id: i64) -> Result<(), ActionsError>;

    /// Delete every runner in the given scope, returning the deleted ids.
    async fn delete_runners_in_scope(
        &self,
        owner_id: i64,
        repo_id: i64,
    ) -> Result<Vec<i64>, ActionsError>;

    async fn create_registration_token(
        &self,
        token: &str,
        owner_id: i64,
        repo_id: i64,
    ) -> Result<RegistrationTokenRecord, ActionsError>;

    async fn get_registration_token(
        &self,
        token: &str,
    ) -> Result<Option<RegistrationTokenRecord>, ActionsError>;

    /// Deactivate every active token in a scope (rotation: consumed or
    /// superseded tokens are refused from then on).
    async fn deactivate_registration_tokens(
        &self,
        owner_id: i64,
        repo_id: i64,
    ) -> Result<(), ActionsError>;

    // ========================================================================
    // Runs and jobs
    // ========================================================================

    async fn insert_run(&self, run: &NewRun) -> Result<i64, ActionsError>;

    async fn insert_jobs(&self, jobs: &[NewJob]) -> Result<Vec<i64>, ActionsError>;

    async fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>, ActionsError>;

    async fn update_run_status(&self, run_id: i64, status: &str) -> Result<(), ActionsError>;

    /// Record a pre-execution error and mark the run failed, in one step.
    async fn set_run_pre_execution_error(
        &self,
        run_id: i64,
        error_json: &str,
    ) -> Result<(), ActionsError>;

    async fn set_run_incomplete_references(
        &self,
        run_id: i64,
        flagged: bool,
    ) -> Result<(), ActionsError>;

    async fn approve_run(&self, run_id: i64, user_id: i64) -> Result<(), ActionsError>;

    /// Drop a pending approval gate without recording an approver
    /// (cancellation path).
    async fn clear_run_approval(&self, run_id: i64) -> Result<(), ActionsError>;

    async fn list_jobs_by_run(&self, run_id: i64) -> Result<Vec<JobRecord>, ActionsError>;

    async fn get_job(&self, job_id: i64) -> Result<Option<JobRecord>, ActionsError>;

    async fn update_job_status(&self, job_id: i64, status: &str) -> Result<(), ActionsError>;

    async fn set_job_outputs(&self, job_id: i64, outputs_json: &str) -> Result<(), ActionsError>;

    /// Replace a placeholder job with its expansion, atomically.
    async fn replace_placeholder_job(
        &self,
        placeholder_id: i64,
        jobs: &[NewJob],
    ) -> Result<Vec<i64>, ActionsError>;

    /// Cancel all jobs of a run that no runner has picked up yet.
    /// Returns the ids of the cancelled jobs.
    async fn cancel_unstarted_jobs(&self, run_id: i64) -> Result<Vec<i64>, ActionsError>;

    /// Non-terminal tasks belonging to a run (for cancellation).
    async fn list_active_tasks_by_run(&self, run_id: i64) -> Result<Vec<TaskRecord>, ActionsError>;

    /// Non-terminal tasks assigned to a runner (for cascade deletion).
    async fn list_active_tasks_by_runner(
        &self,
        runner_id: i64,
    ) -> Result<Vec<TaskRecord>, ActionsError>;

    /// Runs flagged by the expander as having unresolved references.
    async fn list_runs_with_incomplete_references(
        &self,
        limit: i64,
    ) -> Result<Vec<RunRecord>, ActionsError>;

    /// Waiting/Blocked jobs created before the cutoff whose run does not
    /// have a pending approval.
    async fn list_abandoned_jobs(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<JobRecord>, ActionsError>;

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Waiting jobs a runner in the given scope may claim, oldest first.
    /// Global runners (owner 0, repo 0) see every waiting job.
    async fn list_claimable_jobs(
        &self,
        owner_id: i64,
        repo_id: i64,
        limit: i64,
    ) -> Result<Vec<JobRecord>, ActionsError>;

    /// Atomically claim a waiting job for a runner: create the task and flip
    /// the job to Running, guarded so that at most one runner wins. Returns
    /// None when another runner claimed the job first.
    async fn claim_job(
        &self,
        job_id: i64,
        runner_id: i64,
        request_key: &str,
        log_filename: &str,
    ) -> Result<Option<TaskRecord>, ActionsError>;

    async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, ActionsError>;

    async fn find_task_by_request_key(
        &self,
        runner_id: i64,
        request_key: &str,
    ) -> Result<Option<TaskRecord>, ActionsError>;

    /// Bump a task's updated timestamp (heartbeat).
    async fn touch_task(&self, task_id: i64) -> Result<(), ActionsError>;

    async fn set_task_started(
        &self,
        task_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<(), ActionsError>;

    /// Set the task and its job terminal in one transaction.
    async fn finalize_task(
        &self,
        task_id: i64,
        job_id: i64,
        status: &str,
        stopped_at: DateTime<Utc>,
    ) -> Result<(), ActionsError>;

    /// Mark a task and its job cancelled immediately (server-side stop).
    async fn cancel_task(&self, task_id: i64) -> Result<(), ActionsError>;

    async fn upsert_task_steps(
        &self,
        task_id: i64,
        steps: &[StepUpdate],
    ) -> Result<(), ActionsError>;

    async fn list_task_steps(&self, task_id: i64) -> Result<Vec<TaskStepRecord>, ActionsError>;

    /// Insert outputs, skipping keys that already exist.
    async fn insert_task_outputs(
        &self,
        task_id: i64,
        outputs: &[(String, String)],
    ) -> Result<(), ActionsError>;

    async fn list_task_outputs(
        &self,
        task_id: i64,
    ) -> Result<Vec<TaskOutputRecord>, ActionsError>;

    /// Persist log progress after an append.
    async fn update_task_log_state(
        &self,
        task_id: i64,
        log_length: i64,
        log_size: i64,
        log_indexes: &str,
    ) -> Result<(), ActionsError>;

    async fn mark_task_log_in_storage(&self, task_id: i64) -> Result<(), ActionsError>;

    /// Running tasks whose last update is older than the cutoff.
    async fn list_zombie_tasks(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TaskRecord>, ActionsError>;

    /// Terminal tasks whose log still lives in the row store.
    async fn list_unflushed_tasks(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TaskRecord>, ActionsError>;

    // ========================================================================
    // Tasks version (poll fast path)
    // ========================================================================

    /// Current version for a scope; rows start at 1.
    async fn get_tasks_version(&self, owner_id: i64, repo_id: i64) -> Result<i64, ActionsError>;

    /// Increment the global, owner, and repo scope rows.
    async fn increment_tasks_version(
        &self,
        owner_id: i64,
        repo_id: i64,
    ) -> Result<(), ActionsError>;

    // ========================================================================
    // Secrets and variables
    // ========================================================================

    async fn put_secret(
        &self,
        owner_id: i64,
        repo_id: i64,
        name: &str,
        data: &[u8],
    ) -> Result<i64, ActionsError>;

    async fn get_secret(
        &self,
        owner_id: i64,
        repo_id: i64,
        name: &str,
    ) -> Result<Option<SecretRecord>, ActionsError>;

    async fn delete_secret(
        &self,
        owner_id: i64,
        repo_id: i64,
        name: &str,
    ) -> Result<(), ActionsError>;

    /// Secrets visible to a run: the repo's own plus its owner's.
    async fn list_secrets_for_run(
        &self,
        owner_id: i64,
        repo_id: i64,
    ) -> Result<Vec<SecretRecord>, ActionsError>;

    async fn put_variable(
        &self,
        owner_id: i64,
        repo_id: i64,
        name: &str,
        data: &str,
    ) -> Result<i64, ActionsError>;

    async fn delete_variable(
        &self,
        owner_id: i64,
        repo_id: i64,
        name: &str,
    ) -> Result<(), ActionsError>;

    /// Variables visible to a run: the repo's own plus its owner's.
    async fn list_variables_for_run(
        &self,
        owner_id: i64,
        repo_id: i64,
    ) -> Result<Vec<VariableRecord>, ActionsError>;

    // ========================================================================
    // Health
    // ========================================================================

    async fn health_check_db(&self) -> Result<bool, ActionsError>;
}
