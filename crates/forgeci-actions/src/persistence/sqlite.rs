// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::ActionsError;

use super::{
    JobRecord, NewJob, NewRun, Persistence, RegistrationTokenRecord, RunRecord, RunnerRecord,
    SecretRecord, StepUpdate, TaskOutputRecord, TaskRecord, TaskStepRecord, VariableRecord,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Connects to the database with sensible defaults
    /// - Runs all migrations
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ActionsError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| ActionsError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let path_str = path.to_string_lossy();
        let url = format!("sqlite:{}?mode=rwc", path_str);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| ActionsError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| ActionsError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Create an in-memory persistence with migrations applied (tests).
    pub async fn in_memory() -> Result<Self, ActionsError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| ActionsError::DatabaseError {
                operation: "connect".to_string(),
                details: e.to_string(),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| ActionsError::DatabaseError {
                operation: "migrate".to_string(),
                details: e.to_string(),
            })?;

        Ok(Self { pool })
    }
}

const RUNNER_COLUMNS: &str = "id, uuid, token_hash, token_salt, name, version, owner_id, repo_id, \
                              labels, ephemeral, created_at, last_online";

const RUN_COLUMNS: &str = "id, title, owner_id, repo_id, workflow_id, trigger_event, git_ref, \
                           commit_sha, is_fork_pull_request, enable_oidc, event_payload, status, \
                           pre_execution_error, needs_approval, approved_by, \
                           has_incomplete_references, concurrency_group, created_at, started_at, \
                           stopped_at, updated_at";

const JOB_COLUMNS: &str = "id, run_id, owner_id, repo_id, job_key, name, needs, runs_on, \
                           if_condition, matrix, payload, is_placeholder, is_workflow_call, \
                           outputs_map, outputs, task_id, status, created_at, started_at, \
                           stopped_at, updated_at";

const TASK_COLUMNS: &str = "id, job_id, run_id, runner_id, request_key, status, log_filename, \
                            log_in_storage, log_length, log_size, log_indexes, log_expired, \
                            created_at, started_at, stopped_at, updated_at";

async fn insert_job_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    job: &NewJob,
) -> Result<i64, ActionsError> {
    // Timestamps are bound rather than left to the column default so they
    // compare correctly against chrono values bound in later queries.
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        INSERT INTO jobs (run_id, owner_id, repo_id, job_key, name, needs, runs_on,
                          if_condition, matrix, payload, is_placeholder, is_workflow_call,
                          outputs_map, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(job.run_id)
    .bind(job.owner_id)
    .bind(job.repo_id)
    .bind(&job.job_key)
    .bind(&job.name)
    .bind(&job.needs)
    .bind(&job.runs_on)
    .bind(&job.if_condition)
    .bind(&job.matrix)
    .bind(&job.payload)
    .bind(job.is_placeholder)
    .bind(job.is_workflow_call)
    .bind(&job.outputs_map)
    .bind(&job.status)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(result.last_insert_rowid())
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    // ========================================================================
    // Runners and registration tokens
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<RunnerRecord, ActionsError> {
        let result = sqlx::query(
            r#"
            INSERT INTO runners (uuid, token_hash, token_salt, name, version,
                                 owner_id, repo_id, labels, ephemeral)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(uuid)
        .bind(token_hash)
        .bind(token_salt)
        .bind(name)
        .bind(version)
        .bind(owner_id)
        .bind(repo_id)
        .bind(labels)
        .bind(ephemeral)
        .execute(&self.pool)
        .await?;

        let record = sqlx::query_as::<_, RunnerRecord>(&format!(
            "SELECT {RUNNER_COLUMNS} FROM runners WHERE id = ?"
        ))
        .bind(result.last_insert_rowid())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_runner_by_uuid(&self, uuid: &str) -> Result<Option<RunnerRecord>, ActionsError> {
        let record = sqlx::query_as::<_, RunnerRecord>(&format!(
            "SELECT {RUNNER_COLUMNS} FROM runners WHERE uuid = ?"
        ))
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_runner_by_id(&self, runner_id: i64) -> Result<Option<RunnerRecord>, ActionsError> {
        let record = sqlx::query_as::<_, RunnerRecord>(&format!(
            "SELECT {RUNNER_COLUMNS} FROM runners WHERE id = ?"
        ))
        .bind(runner_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_runner_declare(
        &self,
        runner_id: i64,
        labels: &str,
        version: &str,
    ) -> Result<(), ActionsError> {
        sqlx::query(
            r#"
            UPDATE runners
            SET labels = ?, version = ?
            WHERE id = ?
            "#,
        )
        .bind(labels)
        .bind(version)
        .bind(runner_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn touch_runner(&self, runner_id: i64) -> Result<(), ActionsError> {
        sqlx::query(
            r#"
            UPDATE runners
            SET last_online = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(runner_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_runner(&self, runner_id: i64) -> Result<(), ActionsError> {
        sqlx::query("DELETE FROM runners WHERE id = ?")
            .bind(runner_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete_runners_in_scope(
        &self,
        owner_id: i64,
        repo_id: i64,
    ) -> Result<Vec<i64>, ActionsError> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = if repo_id != 0 {
            sqlx::query_scalar("SELECT id FROM runners WHERE repo_id = ?")
                .bind(repo_id)
                .fetch_all(&mut *tx)
                .await?
        } else {
            sqlx::query_scalar("SELECT id FROM runners WHERE owner_id = ? AND repo_id = 0")
                .bind(owner_id)
                .fetch_all(&mut *tx)
                .await?
        };

        if repo_id != 0 {
            sqlx::query("DELETE FROM runners WHERE repo_id = ?")
                .bind(repo_id)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query("DELETE FROM runners WHERE owner_id = ? AND repo_id = 0")
                .bind(owner_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn create_registration_token(
        &self,
        token: &str,
        owner_id: i64,
        repo_id: i64,
    ) -> Result<RegistrationTokenRecord, ActionsError> {
        let result = sqlx::query(
            r#"
            INSERT INTO runner_registration_tokens (token, owner_id, repo_id, is_active)
            VALUES (?, ?, ?, 1)
            "#,
        )
        .bind(token)
        .bind(owner_id)
        .bind(repo_id)
        .execute(&self.pool)
        .await?;

        let record = sqlx::query_as::<_, RegistrationTokenRecord>(
            r#"
            SELECT id, token, owner_id, repo_id, is_active, created_at
            FROM runner_registration_tokens
            WHERE id = ?
            "#,
        )
        .bind(result.last_insert_rowid())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_registration_token(
        &self,
        token: &str,
    ) -> Result<Option<RegistrationTokenRecord>, ActionsError> {
        let record = sqlx::query_as::<_, RegistrationTokenRecord>(
            r#"
            SELECT id, token, owner_id, repo_id, is_active, created_at
            FROM runner_registration_tokens
            WHERE token = ?
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn deactivate_registration_tokens(
        &self,
        owner_id: i64,
        repo_id: i64,
    ) -> Result<(), ActionsError> {
        sqlx::query(
            r#"
            UPDATE runner_registration_tokens
            SET is_active = 0
            WHERE owner_id = ? AND repo_id = ?
            "#,
        )
        .bind(owner_id)
        .bind(repo_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // Runs and jobs
    // ========================================================================

    async fn insert_run(&self, run: &NewRun) -> Result<i64, ActionsError> {
        let result = sqlx::query(
            r#"
            INSERT INTO runs (title, owner_id, repo_id, workflow_id, trigger_event, git_ref,
                              commit_sha, is_fork_pull_request, enable_oidc, event_payload,
                              needs_approval, concurrency_group, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'waiting')
            "#,
        )
        .bind(&run.title)
        .bind(run.owner_id)
        .bind(run.repo_id)
        .bind(&run.workflow_id)
        .bind(&run.trigger_event)
        .bind(&run.git_ref)
        .bind(&run.commit_sha)
        .bind(run.is_fork_pull_request)
        .bind(run.enable_oidc)
        .bind(&run.event_payload)
        .bind(run.needs_approval)
        .bind(&run.concurrency_group)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn insert_jobs(&self, jobs: &[NewJob]) -> Result<Vec<i64>, ActionsError> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            ids.push(insert_job_tx(&mut tx, job).await?);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>, ActionsError> {
        let record = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE id = ?"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_run_status(&self, run_id: i64, status: &str) -> Result<(), ActionsError> {
        let now = Utc::now();
        let terminal = matches!(status, "success" | "failure" | "cancelled" | "skipped");

        sqlx::query(
            r#"
            UPDATE runs
            SET status = ?,
                started_at = CASE WHEN ? = 'running' THEN COALESCE(started_at, ?) ELSE started_at END,
                stopped_at = CASE WHEN ? THEN COALESCE(stopped_at, ?) ELSE stopped_at END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(status)
        .bind(now)
        .bind(terminal)
        .bind(now)
        .bind(now)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_run_pre_execution_error(
        &self,
        run_id: i64,
        error_json: &str,
    ) -> Result<(), ActionsError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE runs
            SET pre_execution_error = ?,
                status = 'failure',
                stopped_at = COALESCE(stopped_at, ?),
                has_incomplete_references = 0,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error_json)
        .bind(now)
        .bind(now)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_run_incomplete_references(
        &self,
        run_id: i64,
        flagged: bool,
    ) -> Result<(), ActionsError> {
        sqlx::query(
            r#"
            UPDATE runs
            SET has_incomplete_references = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(flagged)
        .bind(Utc::now())
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn approve_run(&self, run_id: i64, user_id: i64) -> Result<(), ActionsError> {
        sqlx::query(
            r#"
            UPDATE runs
            SET needs_approval = 0, approved_by = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(user_id)
        .bind(Utc::now())
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_run_approval(&self, run_id: i64) -> Result<(), ActionsError> {
        sqlx::query("UPDATE runs SET needs_approval = 0, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(run_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_jobs_by_run(&self, run_id: i64) -> Result<Vec<JobRecord>, ActionsError> {
        let records = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE run_id = ? ORDER BY id ASC"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<JobRecord>, ActionsError> {
        let record = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_job_status(&self, job_id: i64, status: &str) -> Result<(), ActionsError> {
        let now = Utc::now();
        let terminal = matches!(status, "success" | "failure" | "cancelled" | "skipped");

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?,
                started_at = CASE WHEN ? = 'running' THEN COALESCE(started_at, ?) ELSE started_at END,
                stopped_at = CASE WHEN ? THEN COALESCE(stopped_at, ?) ELSE stopped_at END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(status)
        .bind(now)
        .bind(terminal)
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_job_outputs(&self, job_id: i64, outputs_json: &str) -> Result<(), ActionsError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET outputs = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(outputs_json)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn replace_placeholder_job(
        &self,
        placeholder_id: i64,
        jobs: &[NewJob],
    ) -> Result<Vec<i64>, ActionsError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM jobs WHERE id = ? AND is_placeholder = 1")
            .bind(placeholder_id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            // Already replaced by a concurrent expansion.
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            ids.push(insert_job_tx(&mut tx, job).await?);
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn cancel_unstarted_jobs(&self, run_id: i64) -> Result<Vec<i64>, ActionsError> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM jobs
            WHERE run_id = ? AND task_id = 0 AND status IN ('waiting', 'blocked')
            "#,
        )
        .bind(run_id)
        .fetch_all(&mut *tx)
        .await?;

        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', stopped_at = ?, updated_at = ?
            WHERE run_id = ? AND task_id = 0 AND status IN ('waiting', 'blocked')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ids)
    }

    async fn list_active_tasks_by_run(
        &self,
        run_id: i64,
    ) -> Result<Vec<TaskRecord>, ActionsError> {
        let records = sqlx::query_as::<_, TaskRecord>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE run_id = ? AND status NOT IN ('success', 'failure', 'cancelled', 'skipped')"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_active_tasks_by_runner(
        &self,
        runner_id: i64,
    ) -> Result<Vec<TaskRecord>, ActionsError> {
        let records = sqlx::query_as::<_, TaskRecord>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE runner_id = ? AND status NOT IN ('success', 'failure', 'cancelled', 'skipped')"
        ))
        .bind(runner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_runs_with_incomplete_references(
        &self,
        limit: i64,
    ) -> Result<Vec<RunRecord>, ActionsError> {
        // Terminal runs stay in the result set so the sweeper can retire
        // their flag.
        let records = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE has_incomplete_references = 1 \
             ORDER BY id ASC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_abandoned_jobs(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<JobRecord>, ActionsError> {
        let columns: String = JOB_COLUMNS
            .split(", ")
            .map(|c| format!("j.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");

        let records = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {columns} FROM jobs j \
             JOIN runs r ON r.id = j.run_id \
             WHERE j.status IN ('waiting', 'blocked') \
               AND j.task_id = 0 \
               AND j.created_at < ? \
               AND r.needs_approval = 0 \
             ORDER BY j.id ASC LIMIT ?"
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    async fn list_claimable_jobs(
        &self,
        owner_id: i64,
        repo_id: i64,
        limit: i64,
    ) -> Result<Vec<JobRecord>, ActionsError> {
        let base = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = 'waiting' AND task_id = 0 \
               AND is_placeholder = 0 AND is_workflow_call = 0"
        );

        let records = if repo_id != 0 {
            sqlx::query_as::<_, JobRecord>(&format!(
                "{base} AND repo_id = ? ORDER BY id ASC LIMIT ?"
            ))
            .bind(repo_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else if owner_id != 0 {
            sqlx::query_as::<_, JobRecord>(&format!(
                "{base} AND owner_id = ? ORDER BY id ASC LIMIT ?"
            ))
            .bind(owner_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, JobRecord>(&format!("{base} ORDER BY id ASC LIMIT ?"))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
        };

        Ok(records)
    }

    async fn claim_job(
        &self,
        job_id: i64,
        runner_id: i64,
        request_key: &str,
        log_filename: &str,
    ) -> Result<Option<TaskRecord>, ActionsError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        // 1. Flip the job to running, guarded on it still being unclaimed.
        //    At most one concurrent fetch wins this update.
        let claimed = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', started_at = ?, updated_at = ?
            WHERE id = ? AND status = 'waiting' AND task_id = 0
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let run_id: i64 = sqlx::query_scalar("SELECT run_id FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;

        // 2. Create the task. Timestamps are bound so the sweeper's cutoff
        // comparisons see the same text format chrono binds elsewhere.
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (job_id, run_id, runner_id, request_key, status,
                               log_filename, started_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'running', ?, ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(run_id)
        .bind(runner_id)
        .bind(request_key)
        .bind(log_filename)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let task_id = result.last_insert_rowid();

        // 3. Point the job back at its task.
        sqlx::query("UPDATE jobs SET task_id = ? WHERE id = ?")
            .bind(task_id)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        // 4. The run is running once any job is.
        sqlx::query(
            r#"
            UPDATE runs
            SET status = 'running', started_at = COALESCE(started_at, ?), updated_at = ?
            WHERE id = ? AND status IN ('waiting', 'running')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let record = sqlx::query_as::<_, TaskRecord>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"
        ))
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Some(record))
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, ActionsError> {
        let record = sqlx::query_as::<_, TaskRecord>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_task_by_request_key(
        &self,
        runner_id: i64,
        request_key: &str,
    ) -> Result<Option<TaskRecord>, ActionsError> {
        let record = sqlx::query_as::<_, TaskRecord>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE runner_id = ? AND request_key = ?"
        ))
        .bind(runner_id)
        .bind(request_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn touch_task(&self, task_id: i64) -> Result<(), ActionsError> {
        sqlx::query("UPDATE tasks SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn set_task_started(
        &self,
        task_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<(), ActionsError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET started_at = COALESCE(started_at, ?), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(started_at)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finalize_task(
        &self,
        task_id: i64,
        job_id: i64,
        status: &str,
        stopped_at: DateTime<Utc>,
    ) -> Result<(), ActionsError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, stopped_at = COALESCE(stopped_at, ?), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(stopped_at)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, stopped_at = COALESCE(stopped_at, ?), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(stopped_at)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn cancel_task(&self, task_id: i64) -> Result<(), ActionsError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let job_id: Option<i64> = sqlx::query_scalar("SELECT job_id FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(job_id) = job_id else {
            tx.rollback().await?;
            return Err(ActionsError::TaskNotFound { task_id });
        };

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'cancelled', stopped_at = COALESCE(stopped_at, ?), updated_at = ?
            WHERE id = ? AND status NOT IN ('success', 'failure', 'cancelled', 'skipped')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', stopped_at = COALESCE(stopped_at, ?), updated_at = ?
            WHERE id = ? AND status NOT IN ('success', 'failure', 'cancelled', 'skipped')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_task_steps(
        &self,
        task_id: i64,
        steps: &[StepUpdate],
    ) -> Result<(), ActionsError> {
        let mut tx = self.pool.begin().await?;

        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO task_steps (task_id, step_index, status, log_index, log_length,
                                        started_at, stopped_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (task_id, step_index) DO UPDATE SET
                    status = excluded.status,
                    log_index = excluded.log_index,
                    log_length = excluded.log_length,
                    started_at = COALESCE(task_steps.started_at, excluded.started_at),
                    stopped_at = COALESCE(task_steps.stopped_at, excluded.stopped_at)
                "#,
            )
            .bind(task_id)
            .bind(step.step_index)
            .bind(&step.status)
            .bind(step.log_index)
            .bind(step.log_length)
            .bind(step.started_at)
            .bind(step.stopped_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_task_steps(&self, task_id: i64) -> Result<Vec<TaskStepRecord>, ActionsError> {
        let records = sqlx::query_as::<_, TaskStepRecord>(
            r#"
            SELECT id, task_id, step_index, status, log_index, log_length, started_at, stopped_at
            FROM task_steps
            WHERE task_id = ?
            ORDER BY step_index ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn insert_task_outputs(
        &self,
        task_id: i64,
        outputs: &[(String, String)],
    ) -> Result<(), ActionsError> {
        let mut tx = self.pool.begin().await?;

        for (key, value) in outputs {
            // Insert-if-absent: a key is written once and never overwritten.
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO task_outputs (task_id, output_key, output_value)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(task_id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_task_outputs(
        &self,
        task_id: i64,
    ) -> Result<Vec<TaskOutputRecord>, ActionsError> {
        let records = sqlx::query_as::<_, TaskOutputRecord>(
            r#"
            SELECT id, task_id, output_key, output_value
            FROM task_outputs
            WHERE task_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_task_log_state(
        &self,
        task_id: i64,
        log_length: i64,
        log_size: i64,
        log_indexes: &str,
    ) -> Result<(), ActionsError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET log_length = ?, log_size = ?, log_indexes = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(log_length)
        .bind(log_size)
        .bind(log_indexes)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_task_log_in_storage(&self, task_id: i64) -> Result<(), ActionsError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET log_in_storage = 1, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_zombie_tasks(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TaskRecord>, ActionsError> {
        let records = sqlx::query_as::<_, TaskRecord>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status = 'running' AND updated_at < ? \
             ORDER BY updated_at ASC LIMIT ?"
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_unflushed_tasks(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TaskRecord>, ActionsError> {
        let records = sqlx::query_as::<_, TaskRecord>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status IN ('success', 'failure', 'cancelled', 'skipped') \
               AND log_in_storage = 0 AND log_expired = 0 AND updated_at < ? \
             ORDER BY updated_at ASC LIMIT ?"
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    // ========================================================================
    // Tasks version (poll fast path)
    // ========================================================================

    async fn get_tasks_version(&self, owner_id: i64, repo_id: i64) -> Result<i64, ActionsError> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT version FROM tasks_version WHERE owner_id = ? AND repo_id = ?
            "#,
        )
        .bind(owner_id)
        .bind(repo_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(version) = version {
            return Ok(version);
        }

        // First read for this scope: initialize to 1.
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO tasks_version (owner_id, repo_id, version)
            VALUES (?, ?, 1)
            "#,
        )
        .bind(owner_id)
        .bind(repo_id)
        .execute(&self.pool)
        .await?;

        Ok(1)
    }

    async fn increment_tasks_version(
        &self,
        owner_id: i64,
        repo_id: i64,
    ) -> Result<(), ActionsError> {
        let mut tx = self.pool.begin().await?;

        // Global, owner, and repo scopes all observe the change.
        let mut scopes = vec![(0i64, 0i64), (owner_id, 0), (0, repo_id)];
        scopes.sort_unstable();
        scopes.dedup();
        for (o, r) in scopes {
            sqlx::query(
                r#"
                INSERT INTO tasks_version (owner_id, repo_id, version)
                VALUES (?, ?, 2)
                ON CONFLICT (owner_id, repo_id) DO UPDATE SET version = version + 1
                "#,
            )
            .bind(o)
            .bind(r)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Secrets and variables
    // ========================================================================

    async fn put_secret(
        &self,
        owner_id: i64,
        repo_id: i64,
        name: &str,
        data: &[u8],
    ) -> Result<i64, ActionsError> {
        let result = sqlx::query(
            r#"
            INSERT INTO secrets (owner_id, repo_id, name, data)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (owner_id, repo_id, name) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(owner_id)
        .bind(repo_id)
        .bind(name)
        .bind(data)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn get_secret(
        &self,
        owner_id: i64,
        repo_id: i64,
        name: &str,
    ) -> Result<Option<SecretRecord>, ActionsError> {
        let record = sqlx::query_as::<_, SecretRecord>(
            r#"
            SELECT id, owner_id, repo_id, name, data, created_at
            FROM secrets
            WHERE owner_id = ? AND repo_id = ? AND name = ?
            "#,
        )
        .bind(owner_id)
        .bind(repo_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn delete_secret(
        &self,
        owner_id: i64,
        repo_id: i64,
        name: &str,
    ) -> Result<(), ActionsError> {
        sqlx::query("DELETE FROM secrets WHERE owner_id = ? AND repo_id = ? AND name = ?")
            .bind(owner_id)
            .bind(repo_id)
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_secrets_for_run(
        &self,
        owner_id: i64,
        repo_id: i64,
    ) -> Result<Vec<SecretRecord>, ActionsError> {
        // Repo-level entries shadow owner-level entries of the same name;
        // ordering puts owner rows first so callers can overwrite in a map.
        let records = sqlx::query_as::<_, SecretRecord>(
            r#"
            SELECT id, owner_id, repo_id, name, data, created_at
            FROM secrets
            WHERE (owner_id = ? AND repo_id = 0) OR (owner_id = 0 AND repo_id = ?)
            ORDER BY repo_id ASC, name ASC
            "#,
        )
        .bind(owner_id)
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn put_variable(
        &self,
        owner_id: i64,
        repo_id: i64,
        name: &str,
        data: &str,
    ) -> Result<i64, ActionsError> {
        let result = sqlx::query(
            r#"
            INSERT INTO variables (owner_id, repo_id, name, data)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (owner_id, repo_id, name) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(owner_id)
        .bind(repo_id)
        .bind(name)
        .bind(data)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn delete_variable(
        &self,
        owner_id: i64,
        repo_id: i64,
        name: &str,
    ) -> Result<(), ActionsError> {
        sqlx::query("DELETE FROM variables WHERE owner_id = ? AND repo_id = ? AND name = ?")
            .bind(owner_id)
            .bind(repo_id)
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_variables_for_run(
        &self,
        owner_id: i64,
        repo_id: i64,
    ) -> Result<Vec<VariableRecord>, ActionsError> {
        let records = sqlx::query_as::<_, VariableRecord>(
            r#"
            SELECT id, owner_id, repo_id, name, data
            FROM variables
            WHERE (owner_id = ? AND repo_id = 0) OR (owner_id = 0 AND repo_id = ?)
            ORDER BY repo_id ASC, name ASC
            "#,
        )
        .bind(owner_id)
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    // ========================================================================
    // Health
    // ========================================================================

    async fn health_check_db(&self) -> Result<bool, ActionsError> {
        let result: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(result == 1)
    }
}
