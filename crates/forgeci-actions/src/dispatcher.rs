// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task dispatch: turning waiting jobs into tasks a runner executes.
//!
//! FetchTask is the hot path. It is idempotent per `(runner, request_key)`
//! so a retried poll recovers its earlier assignment (with a rotated
//! runtime token) instead of claiming twice, and it short-circuits on the
//! per-scope tasks version so idle polls never scan the job table.

use std::collections::HashMap;
use std::sync::Arc;

use forgeci_protocol::runner_proto::{FetchTaskResponse, Task, TaskNeed};
use serde_json::json;
use tracing::{debug, instrument};

use crate::error::{ActionsError, Result};
use crate::logstore::task_log_filename;
use crate::persistence::{JobRecord, Persistence, RunRecord, RunnerRecord, TaskRecord};
use crate::resolver;
use crate::secrets::SecretStore;
use crate::status::Status;
use crate::token::TokenService;

/// Upper bound on jobs examined per poll.
const SCAN_LIMIT: i64 = 100;

/// Assembles and assigns tasks for polling runners.
pub struct Dispatcher {
    db: Arc<dyn Persistence>,
    secrets: SecretStore,
    tokens: TokenService,
    /// `<AppURL>/api/actions`, the base of the ID-token endpoint.
    actions_base: String,
}

impl Dispatcher {
    pub fn new(
        db: Arc<dyn Persistence>,
        secrets: SecretStore,
        tokens: TokenService,
        actions_base: String,
    ) -> Self {
        Self {
            db,
            secrets,
            tokens,
            actions_base,
        }
    }

    /// Handle one FetchTask poll.
    #[instrument(skip_all, fields(runner = %runner.uuid))]
    pub async fn fetch_tasks(
        &self,
        runner: &RunnerRecord,
        client_version: i64,
        task_capacity: i64,
        request_key: &str,
    ) -> Result<FetchTaskResponse> {
        let (scope_owner, scope_repo) = version_scope(runner);
        let version = self.db.get_tasks_version(scope_owner, scope_repo).await?;

        // 1. Idempotent replay: a retried poll recovers its assignment.
        if !request_key.is_empty()
            && let Some(existing) = self
                .db
                .find_task_by_request_key(runner.id, request_key)
                .await?
        {
            debug!(task_id = existing.id, "replaying fetch by request key");
            let task = self.build_task(&existing).await?;
            return Ok(FetchTaskResponse {
                task: Some(task),
                tasks_version: version,
                additional_tasks: Vec::new(),
            });
        }

        // 2. Ephemeral runners execute exactly one task.
        if runner.ephemeral
            && !self
                .db
                .list_active_tasks_by_runner(runner.id)
                .await?
                .is_empty()
        {
            return Ok(empty_response(version));
        }

        // 3. Version fast path: nothing changed since the last poll.
        if client_version == version {
            return Ok(empty_response(version));
        }

        // 4. Scan and claim, up to the runner's capacity.
        let capacity = if runner.ephemeral {
            1
        } else {
            task_capacity.max(1)
        };
        let runner_labels = runner.label_list();

        let mut claimed: Vec<Task> = Vec::new();
        let candidates = self
            .db
            .list_claimable_jobs(runner.owner_id, runner.repo_id, SCAN_LIMIT)
            .await?;
        for job in candidates {
            if claimed.len() as i64 >= capacity {
                break;
            }
            if job.is_placeholder || job.is_workflow_call {
                continue;
            }
            if !labels_match(&job.runs_on_list(), &runner_labels) {
                continue;
            }
            // Conditional update: at most one runner wins the claim. Only
            // the first task of a poll carries the request key; replay
            // recovers the primary task and the unique index stays happy
            // when capacity > 1.
            let claim_key = if claimed.is_empty() { request_key } else { "" };
            if let Some(task) = self
                .db
                .claim_job(job.id, runner.id, claim_key, &task_log_filename(job.id))
                .await?
            {
                debug!(task_id = task.id, job_id = job.id, "task claimed");
                claimed.push(self.build_task(&task).await?);
            }
        }

        let version = self.db.get_tasks_version(scope_owner, scope_repo).await?;
        let mut claimed = claimed.into_iter();
        Ok(FetchTaskResponse {
            task: claimed.next(),
            tasks_version: version,
            additional_tasks: claimed.collect(),
        })
    }

    /// Assemble the full payload for a task. Called both for fresh claims
    /// and for request-key replays; the runtime token is minted fresh each
    /// time (rotation).
    pub async fn build_task(&self, task: &TaskRecord) -> Result<Task> {
        let job = self
            .db
            .get_job(task.job_id)
            .await?
            .ok_or(ActionsError::JobNotFound { job_id: task.job_id })?;
        let run = self
            .db
            .get_run(task.run_id)
            .await?
            .ok_or(ActionsError::RunNotFound { run_id: task.run_id })?;

        let oidc_enabled = oidc_enabled(&run);
        let oidc = oidc_enabled.then(|| {
            (
                oidc_subject(&run),
                serde_json::to_string(&oidc_extra_claims(&run, &job)).unwrap_or_default(),
            )
        });
        let runtime_token = self.tokens.create(task.id, run.id, job.id, oidc)?;

        let context = self.build_context(&run, &runtime_token, oidc_enabled);

        let mut secrets = self
            .secrets
            .secrets_for_run(run.owner_id, run.repo_id)
            .await?;
        // Synthesized tokens; user secrets cannot shadow these names.
        for name in ["FORGEJO_TOKEN", "GITEA_TOKEN", "GITHUB_TOKEN"] {
            secrets.insert(name.to_string(), runtime_token.clone());
        }

        let vars = self
            .secrets
            .variables_for_run(run.owner_id, run.repo_id)
            .await?;

        let needs = self.build_needs(&job).await?;

        Ok(Task {
            id: task.id,
            workflow_payload: job.payload.clone(),
            context: serde_json::to_string(&context)?,
            secrets,
            vars,
            needs,
        })
    }

    fn build_context(
        &self,
        run: &RunRecord,
        runtime_token: &str,
        oidc_enabled: bool,
    ) -> serde_json::Value {
        let event: serde_json::Value =
            serde_json::from_str(&run.event_payload).unwrap_or(json!({}));

        let mut context = json!({
            "event": event,
            "event_name": run.trigger_event,
            "ref": run.git_ref,
            "sha": run.commit_sha,
            "repository_id": run.repo_id,
            "repository_owner_id": run.owner_id,
            "run_id": run.id,
            "workflow": run.workflow_id,
            "token": runtime_token,
        });

        if oidc_enabled && let Some(map) = context.as_object_mut() {
            map.insert(
                "forgejo_actions_id_token_request_url".to_string(),
                json!(format!(
                    "{}/_apis/pipelines/workflows/{}/idtoken",
                    self.actions_base, run.id
                )),
            );
            map.insert(
                "forgejo_actions_id_token_request_token".to_string(),
                json!(runtime_token),
            );
        }

        context
    }

    /// Outputs and aggregate result of each `needs` predecessor, with
    /// matrix rows of one key folded together.
    async fn build_needs(&self, job: &JobRecord) -> Result<HashMap<String, TaskNeed>> {
        let needs_keys = job.needs_list();
        if needs_keys.is_empty() {
            return Ok(HashMap::new());
        }

        let siblings = self.db.list_jobs_by_run(job.run_id).await?;
        let mut needs = HashMap::with_capacity(needs_keys.len());
        for key in needs_keys {
            let rows: Vec<&JobRecord> =
                siblings.iter().filter(|j| j.job_key == key).collect();
            if rows.is_empty() {
                continue;
            }

            let statuses: Vec<Status> =
                rows.iter().map(|j| Status::parse(&j.status)).collect();
            let mut outputs = HashMap::new();
            for row in &rows {
                for (k, v) in row.output_map() {
                    outputs.entry(k).or_insert(v);
                }
            }

            needs.insert(
                key,
                TaskNeed {
                    outputs,
                    result: resolver::aggregate(&statuses).to_result() as i32,
                },
            );
        }
        Ok(needs)
    }
}

/// Which tasks_version row a runner polls against.
fn version_scope(runner: &RunnerRecord) -> (i64, i64) {
    if runner.repo_id != 0 {
        (0, runner.repo_id)
    } else if runner.owner_id != 0 {
        (runner.owner_id, 0)
    } else {
        (0, 0)
    }
}

/// Every label the job demands must be offered by the runner.
fn labels_match(required: &[String], offered: &[String]) -> bool {
    required.iter().all(|l| offered.contains(l))
}

/// OIDC is suppressed for fork pull requests unless the event explicitly
/// targets the base repository.
fn oidc_enabled(run: &RunRecord) -> bool {
    run.enable_oidc
        && !(run.is_fork_pull_request && run.trigger_event != "pull_request_target")
}

fn oidc_subject(run: &RunRecord) -> String {
    format!(
        "repo:{}/{}:ref:{}",
        run.owner_id, run.repo_id, run.git_ref
    )
}

fn oidc_extra_claims(run: &RunRecord, job: &JobRecord) -> serde_json::Value {
    json!({
        "ref": run.git_ref,
        "sha": run.commit_sha,
        "repository_id": run.repo_id.to_string(),
        "repository_owner": run.owner_id.to_string(),
        "run_id": run.id.to_string(),
        "event_name": run.trigger_event,
        "workflow": run.workflow_id,
        "job_workflow_ref": job.job_key,
    })
}

fn empty_response(version: i64) -> FetchTaskResponse {
    FetchTaskResponse {
        task: None,
        tasks_version: version,
        additional_tasks: Vec::new(),
    }
}
