// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run management: creation, advancement, cancellation, approval.
//!
//! `advance_run` is the convergence loop: it applies resolver transitions,
//! expands ready placeholders, synthesizes workflow-call outputs, and
//! aggregates the run status, repeating until the job list is stable.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::error::{ActionsError, Result};
use crate::persistence::{JobRecord, NewJob, NewRun, Persistence, RunRecord};
use crate::resolver::{self, Transition};
use crate::status::Status;
use crate::workflow::expand::{
    CALL_SEPARATOR, ExpandedJob, Expansion, NeedsContext, WorkflowFetcher, expand_workflow,
};
use crate::workflow::expr::{self, EvalFrame};

/// Creates and advances runs over a persistence backend.
pub struct RunManager {
    db: Arc<dyn Persistence>,
    fetcher: Arc<dyn WorkflowFetcher>,
}

impl RunManager {
    pub fn new(db: Arc<dyn Persistence>, fetcher: Arc<dyn WorkflowFetcher>) -> Self {
        Self { db, fetcher }
    }

    /// Create a run from workflow bytes and persist its initial job graph.
    ///
    /// Returns the run id. Expansion failures with an enumerated code are
    /// recorded on the run (terminal failure) instead of being returned.
    #[instrument(skip_all, fields(repo_id = new_run.repo_id, workflow = %new_run.workflow_id))]
    pub async fn create_run(&self, mut new_run: NewRun, workflow_bytes: &[u8]) -> Result<i64> {
        let workflow = crate::workflow::Workflow::parse(workflow_bytes)?;
        new_run.enable_oidc = workflow.enable_oidc;

        let ctx = NeedsContext::default();
        let expansion = expand_workflow(workflow_bytes, &ctx, self.fetcher.as_ref()).await?;

        let run_id = self.db.insert_run(&new_run).await?;

        match expansion {
            Expansion::Failed(error) => {
                warn!(run_id, error = %error, "workflow expansion failed at creation");
                self.db
                    .set_run_pre_execution_error(run_id, &error.to_json())
                    .await?;
                return Ok(run_id);
            }
            Expansion::Jobs(jobs) => {
                let has_placeholders = jobs.iter().any(|j| j.is_placeholder);
                let rows: Vec<NewJob> = jobs
                    .iter()
                    .map(|j| to_new_job(run_id, &new_run, j))
                    .collect();
                self.db.insert_jobs(&rows).await?;
                if has_placeholders {
                    self.db.set_run_incomplete_references(run_id, true).await?;
                }
            }
        }

        // Wake polling runners in this scope.
        self.db
            .increment_tasks_version(new_run.owner_id, new_run.repo_id)
            .await?;

        info!(run_id, "run created");
        Ok(run_id)
    }

    /// Apply resolver transitions and placeholder expansions until the job
    /// list stops changing, then aggregate the run status.
    pub async fn advance_run(&self, run_id: i64) -> Result<()> {
        let run = self
            .db
            .get_run(run_id)
            .await?
            .ok_or(ActionsError::RunNotFound { run_id })?;
        if run.pre_execution_error.is_some() {
            return Ok(());
        }
        if run.needs_approval {
            // Approval gates the whole graph; nothing moves until then.
            return Ok(());
        }

        let run_cancelled = Status::parse(&run.status) == Status::Cancelled;
        let mut woke_runners = false;
        let mut failed_in_expansion = false;

        // Each pass applies at most one wave of transitions; a wave can
        // unblock the next one (skips cascade, placeholder expansions), so
        // iterate to a fixpoint bounded by the current job count.
        let mut jobs = self.db.list_jobs_by_run(run_id).await?;
        let mut passes = 0;
        loop {
            passes += 1;
            if passes > jobs.len() + 1 {
                break;
            }
            let transitions = resolver::resolve(&jobs, run_cancelled);
            if transitions.is_empty() {
                break;
            }

            for transition in &transitions {
                match self.apply_transition(&run, &jobs, transition).await? {
                    Applied::Woke => woke_runners = true,
                    Applied::Failed => failed_in_expansion = true,
                    Applied::Quiet => {}
                }
            }
            if failed_in_expansion {
                break;
            }

            jobs = self.db.list_jobs_by_run(run_id).await?;
        }

        if !run_cancelled && !failed_in_expansion {
            let aggregated = resolver::aggregate_run_status(&jobs);
            if aggregated.as_str() != run.status {
                self.db
                    .update_run_status(run_id, aggregated.as_str())
                    .await?;
            }
        }

        if woke_runners {
            self.db
                .increment_tasks_version(run.owner_id, run.repo_id)
                .await?;
        }

        Ok(())
    }

    /// Apply one transition.
    async fn apply_transition(
        &self,
        run: &RunRecord,
        jobs: &[JobRecord],
        transition: &Transition,
    ) -> Result<Applied> {
        let Some(job) = jobs.iter().find(|j| j.id == transition.job_id) else {
            return Ok(Applied::Quiet);
        };

        if job.is_placeholder && transition.to == Status::Waiting {
            return self.expand_placeholder(run, jobs, job).await;
        }

        if job.is_workflow_call && transition.to == Status::Success {
            let outputs = collect_call_outputs(job, jobs);
            self.db
                .set_job_outputs(job.id, &serde_json::to_string(&outputs)?)
                .await?;
        }

        self.db
            .update_job_status(job.id, transition.to.as_str())
            .await?;
        if transition.to == Status::Waiting && !job.is_placeholder && !job.is_workflow_call {
            Ok(Applied::Woke)
        } else {
            Ok(Applied::Quiet)
        }
    }

    /// Re-expand a placeholder whose predecessors are all terminal.
    async fn expand_placeholder(
        &self,
        run: &RunRecord,
        jobs: &[JobRecord],
        placeholder: &JobRecord,
    ) -> Result<Applied> {
        let ctx = needs_context(jobs);
        match expand_workflow(&placeholder.payload, &ctx, self.fetcher.as_ref()).await? {
            Expansion::Failed(error) => {
                warn!(run_id = run.id, job = %placeholder.job_key, error = %error,
                      "placeholder expansion failed");
                // Consume the placeholder, fail the run, converge.
                self.db.replace_placeholder_job(placeholder.id, &[]).await?;
                self.db
                    .set_run_pre_execution_error(run.id, &error.to_json())
                    .await?;
                self.db.cancel_unstarted_jobs(run.id).await?;
                Ok(Applied::Failed)
            }
            Expansion::Jobs(expanded) => {
                // Rows go in Blocked; the next resolver wave promotes them,
                // since their predecessors are already terminal.
                let rows: Vec<NewJob> = expanded
                    .iter()
                    .map(|j| {
                        let mut row = to_new_job(run.id, &run_fields(run), j);
                        row.status = Status::Blocked.as_str().to_string();
                        row
                    })
                    .collect();
                self.db.replace_placeholder_job(placeholder.id, &rows).await?;
                if !self.still_has_placeholders(run.id).await? {
                    self.db.set_run_incomplete_references(run.id, false).await?;
                }
                Ok(Applied::Quiet)
            }
        }
    }

    async fn still_has_placeholders(&self, run_id: i64) -> Result<bool> {
        Ok(self
            .db
            .list_jobs_by_run(run_id)
            .await?
            .iter()
            .any(|j| j.is_placeholder))
    }

    /// Cancel a run: every job and task not yet terminal goes to Cancelled,
    /// and a pending approval gate is dropped.
    pub async fn cancel_run(&self, run_id: i64) -> Result<()> {
        let run = self
            .db
            .get_run(run_id)
            .await?
            .ok_or(ActionsError::RunNotFound { run_id })?;

        self.db.cancel_unstarted_jobs(run_id).await?;
        for task in self.db.list_active_tasks_by_run(run_id).await? {
            self.db.cancel_task(task.id).await?;
        }
        self.db.clear_run_approval(run_id).await?;
        self.db
            .update_run_status(run_id, Status::Cancelled.as_str())
            .await?;
        // Running tasks discover the cancellation on their next update;
        // prompt their runners to call in.
        self.db
            .increment_tasks_version(run.owner_id, run.repo_id)
            .await?;

        info!(run_id, "run cancelled");
        Ok(())
    }

    /// Approve a gated run: valid only while the gate is pending and no job
    /// has moved past Blocked. Root jobs become Waiting immediately.
    pub async fn approve_run(&self, run_id: i64, approver: i64) -> Result<()> {
        let run = self
            .db
            .get_run(run_id)
            .await?
            .ok_or(ActionsError::RunNotFound { run_id })?;
        if !run.needs_approval {
            return Err(ActionsError::ValidationError {
                field: "run".to_string(),
                message: "run does not need approval".to_string(),
            });
        }

        let jobs = self.db.list_jobs_by_run(run_id).await?;
        if jobs
            .iter()
            .any(|j| Status::parse(&j.status) != Status::Blocked)
        {
            return Err(ActionsError::ValidationError {
                field: "run".to_string(),
                message: "run is no longer approvable".to_string(),
            });
        }

        self.db.approve_run(run_id, approver).await?;
        for job in &jobs {
            if job.needs_list().is_empty() && !job.is_placeholder && !job.is_workflow_call {
                self.db
                    .update_job_status(job.id, Status::Waiting.as_str())
                    .await?;
            }
        }
        self.advance_run(run_id).await?;
        self.db
            .increment_tasks_version(run.owner_id, run.repo_id)
            .await?;

        info!(run_id, approver, "run approved");
        Ok(())
    }
}

/// Outcome of applying one resolver transition.
enum Applied {
    /// A dispatchable job became Waiting; runners should be woken.
    Woke,
    /// Placeholder expansion failed and the run was marked failed.
    Failed,
    /// Nothing a runner cares about.
    Quiet,
}

/// Needs context over the current job list, keyed by base job key so
/// workflow-call inner jobs resolve under their unprefixed names too.
fn needs_context(jobs: &[JobRecord]) -> NeedsContext {
    let mut by_key: HashMap<String, Vec<Status>> = HashMap::new();
    let mut outputs: HashMap<String, HashMap<String, String>> = HashMap::new();
    for job in jobs {
        let status = Status::parse(&job.status);
        let mut keys = vec![job.job_key.clone()];
        if let Some((_, inner)) = job.job_key.rsplit_once(CALL_SEPARATOR) {
            keys.push(inner.to_string());
        }
        for key in keys {
            by_key.entry(key.clone()).or_default().push(status);
            let merged = outputs.entry(key).or_default();
            for (k, v) in job.output_map() {
                merged.entry(k).or_insert(v);
            }
        }
    }

    let mut ctx = NeedsContext::default();
    for (key, statuses) in by_key {
        let aggregated = if statuses.iter().all(|s| s.is_terminal()) {
            resolver::aggregate(&statuses)
        } else {
            Status::Running
        };
        ctx.results.insert(key, aggregated);
    }
    ctx.outputs = outputs;
    ctx
}

/// Evaluate a workflow-call outer job's declared outputs against its inner
/// jobs. Values use `jobs.<inner>.outputs.<key>` references.
fn collect_call_outputs(outer: &JobRecord, jobs: &[JobRecord]) -> HashMap<String, String> {
    let declared: HashMap<String, String> =
        serde_json::from_str(&outer.outputs_map).unwrap_or_default();
    if declared.is_empty() {
        return HashMap::new();
    }

    // Inner jobs are stored under "<outer> / <inner>"; expose them by their
    // inner name for evaluation.
    let prefix = format!("{}{}", outer.job_key, CALL_SEPARATOR);
    let mut results = HashMap::new();
    let mut outputs: HashMap<String, HashMap<String, String>> = HashMap::new();
    for job in jobs {
        let Some(inner) = job.job_key.strip_prefix(&prefix) else {
            continue;
        };
        results.insert(inner.to_string(), Status::parse(&job.status));
        let merged = outputs.entry(inner.to_string()).or_default();
        for (k, v) in job.output_map() {
            merged.entry(k).or_insert(v);
        }
    }

    let frame = EvalFrame {
        needs_results: &results,
        needs_outputs: &outputs,
        matrix: &HashMap::new(),
        run_cancelled: false,
        strict_outputs: false,
    };

    let mut collected = HashMap::new();
    for (name, value_expr) in declared {
        // The workflow_call outputs syntax references `jobs.*`; it reads
        // like a needs reference once the inner jobs are framed.
        let rewritten = rewrite_call_refs(&value_expr);
        match expr::evaluate_template(&rewritten, &frame) {
            Ok(value) => {
                collected.insert(name, value.to_string());
            }
            Err(e) => {
                warn!(output = %name, error = %e, "workflow-call output did not evaluate");
            }
        }
    }
    collected
}

/// Rewrite `jobs.` context references to `needs.` so inner jobs evaluate
/// through the standard frame. Text inside single-quoted string literals
/// is left alone, as are identifiers that merely end in `jobs`.
fn rewrite_call_refs(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len() + 8);
    let mut in_str = false;
    let mut prev: Option<char> = None;
    let mut iter = expr.char_indices();
    while let Some((idx, c)) = iter.next() {
        if in_str {
            out.push(c);
            if c == '\'' {
                in_str = false;
            }
            prev = Some(c);
            continue;
        }
        if c == '\'' {
            in_str = true;
            out.push(c);
            prev = Some(c);
            continue;
        }
        let at_boundary = !prev
            .is_some_and(|p| p.is_ascii_alphanumeric() || p == '_' || p == '-' || p == '.');
        if at_boundary && expr[idx..].starts_with("jobs.") {
            out.push_str("needs.");
            // "jobs." is five chars; 'j' was already consumed.
            for _ in 0..4 {
                iter.next();
            }
            prev = Some('.');
            continue;
        }
        out.push(c);
        prev = Some(c);
    }
    out
}

fn run_fields(run: &RunRecord) -> NewRun {
    NewRun {
        owner_id: run.owner_id,
        repo_id: run.repo_id,
        needs_approval: run.needs_approval,
        ..Default::default()
    }
}

fn to_new_job(run_id: i64, run: &NewRun, job: &ExpandedJob) -> NewJob {
    // Approval-gated runs hold everything; otherwise root jobs start
    // claimable and the rest block on the resolver.
    let status = if run.needs_approval
        || job.is_placeholder
        || job.is_workflow_call
        || !job.needs.is_empty()
    {
        Status::Blocked
    } else {
        Status::Waiting
    };

    let matrix: HashMap<&str, &str> = job
        .matrix
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let outputs_map: HashMap<&str, &str> = job
        .outputs_map
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    NewJob {
        run_id,
        owner_id: run.owner_id,
        repo_id: run.repo_id,
        job_key: job.job_key.clone(),
        name: job.name.clone(),
        needs: serde_json::to_string(&job.needs).unwrap_or_else(|_| "[]".to_string()),
        runs_on: serde_json::to_string(&job.runs_on).unwrap_or_else(|_| "[]".to_string()),
        if_condition: job.if_condition.clone(),
        matrix: serde_json::to_string(&matrix).unwrap_or_else(|_| "{}".to_string()),
        payload: job.payload.clone(),
        is_placeholder: job.is_placeholder,
        is_workflow_call: job.is_workflow_call,
        outputs_map: serde_json::to_string(&outputs_map).unwrap_or_else(|_| "{}".to_string()),
        status: status.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use crate::workflow::expand::NoFetcher;

    async fn manager() -> (RunManager, Arc<SqlitePersistence>) {
        let db = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        (RunManager::new(db.clone(), Arc::new(NoFetcher)), db)
    }

    fn new_run() -> NewRun {
        NewRun {
            title: "test run".to_string(),
            repo_id: 7,
            trigger_event: "push".to_string(),
            git_ref: "refs/heads/main".to_string(),
            commit_sha: "abc".to_string(),
            workflow_id: "ci.yml".to_string(),
            event_payload: "{}".to_string(),
            ..Default::default()
        }
    }

    const CHAIN: &str = r#"
jobs:
  build:
    runs-on: ubuntu-latest
  deploy:
    needs: build
    runs-on: ubuntu-latest
"#;

    #[test]
    fn test_rewrite_call_refs_skips_literals_and_suffixes() {
        assert_eq!(
            rewrite_call_refs("${{ jobs.build.outputs.version }}"),
            "${{ needs.build.outputs.version }}"
        );
        // A string literal mentioning jobs. stays verbatim.
        assert_eq!(
            rewrite_call_refs("${{ jobs.a.result == 'jobs.x' }}"),
            "${{ needs.a.result == 'jobs.x' }}"
        );
        // Identifiers that merely end in "jobs" are untouched.
        assert_eq!(
            rewrite_call_refs("${{ needs.all-jobs.outputs.n }}"),
            "${{ needs.all-jobs.outputs.n }}"
        );
    }

    #[tokio::test]
    async fn test_create_run_initial_statuses() {
        let (manager, db) = manager().await;
        let run_id = manager
            .create_run(new_run(), CHAIN.as_bytes())
            .await
            .unwrap();

        let jobs = db.list_jobs_by_run(run_id).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].status, "waiting");
        assert_eq!(jobs[1].status, "blocked");

        // Runner wakeup: the scope version moved past its initial value.
        assert!(db.get_tasks_version(0, 7).await.unwrap() > 1);
    }

    #[tokio::test]
    async fn test_advance_unblocks_after_success() {
        let (manager, db) = manager().await;
        let run_id = manager.create_run(new_run(), CHAIN.as_bytes()).await.unwrap();

        let jobs = db.list_jobs_by_run(run_id).await.unwrap();
        db.update_job_status(jobs[0].id, "success").await.unwrap();

        manager.advance_run(run_id).await.unwrap();

        let jobs = db.list_jobs_by_run(run_id).await.unwrap();
        assert_eq!(jobs[1].status, "waiting");
        assert_eq!(db.get_run(run_id).await.unwrap().unwrap().status, "running");
    }

    #[tokio::test]
    async fn test_skip_cascades_in_one_advance() {
        let yaml = r#"
jobs:
  a:
    runs-on: x
  b:
    needs: a
    runs-on: x
  c:
    needs: b
    runs-on: x
"#;
        let (manager, db) = manager().await;
        let run_id = manager.create_run(new_run(), yaml.as_bytes()).await.unwrap();

        let jobs = db.list_jobs_by_run(run_id).await.unwrap();
        db.update_job_status(jobs[0].id, "failure").await.unwrap();

        manager.advance_run(run_id).await.unwrap();

        let jobs = db.list_jobs_by_run(run_id).await.unwrap();
        assert_eq!(jobs[1].status, "skipped");
        assert_eq!(jobs[2].status, "skipped");
        assert_eq!(db.get_run(run_id).await.unwrap().unwrap().status, "failure");
    }

    #[tokio::test]
    async fn test_run_converges_to_success() {
        let (manager, db) = manager().await;
        let run_id = manager.create_run(new_run(), CHAIN.as_bytes()).await.unwrap();

        let jobs = db.list_jobs_by_run(run_id).await.unwrap();
        db.update_job_status(jobs[0].id, "success").await.unwrap();
        manager.advance_run(run_id).await.unwrap();

        let jobs = db.list_jobs_by_run(run_id).await.unwrap();
        db.update_job_status(jobs[1].id, "success").await.unwrap();
        manager.advance_run(run_id).await.unwrap();

        assert_eq!(db.get_run(run_id).await.unwrap().unwrap().status, "success");
    }

    #[tokio::test]
    async fn test_placeholder_expands_after_needs_finish() {
        let yaml = r#"
jobs:
  a:
    runs-on: ubuntu-latest
  b:
    needs: a
    runs-on: ubuntu-latest
    strategy:
      matrix:
        v: ${{ needs.a.outputs.versions }}
"#;
        let (manager, db) = manager().await;
        let run_id = manager.create_run(new_run(), yaml.as_bytes()).await.unwrap();

        let jobs = db.list_jobs_by_run(run_id).await.unwrap();
        let placeholder = jobs.iter().find(|j| j.is_placeholder).unwrap();
        assert_eq!(placeholder.status, "blocked");
        assert!(
            db.get_run(run_id)
                .await
                .unwrap()
                .unwrap()
                .has_incomplete_references
        );

        let a = jobs.iter().find(|j| j.job_key == "a").unwrap();
        db.set_job_outputs(a.id, r#"{"versions":"[\"1\",\"2\"]"}"#)
            .await
            .unwrap();
        db.update_job_status(a.id, "success").await.unwrap();

        manager.advance_run(run_id).await.unwrap();

        let jobs = db.list_jobs_by_run(run_id).await.unwrap();
        let b_rows: Vec<&JobRecord> = jobs.iter().filter(|j| j.job_key == "b").collect();
        assert_eq!(b_rows.len(), 2);
        assert!(b_rows.iter().all(|j| !j.is_placeholder));
        assert!(b_rows.iter().all(|j| j.status == "waiting"));
        assert_eq!(b_rows[0].name, "b (1)");
        assert!(
            !db.get_run(run_id)
                .await
                .unwrap()
                .unwrap()
                .has_incomplete_references
        );
    }

    #[tokio::test]
    async fn test_missing_output_fails_run_and_consumes_placeholder() {
        let yaml = r#"
jobs:
  A:
    runs-on: ubuntu-latest
  B:
    needs: A
    runs-on: ubuntu-latest
    strategy:
      matrix:
        x: ${{ needs.A.outputs.colours }}
"#;
        let (manager, db) = manager().await;
        let run_id = manager.create_run(new_run(), yaml.as_bytes()).await.unwrap();

        let jobs = db.list_jobs_by_run(run_id).await.unwrap();
        let a = jobs.iter().find(|j| j.job_key == "A").unwrap();
        db.update_job_status(a.id, "success").await.unwrap();

        manager.advance_run(run_id).await.unwrap();

        let run = db.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, "failure");
        let error = crate::workflow::expand::PreExecutionError::from_json(
            run.pre_execution_error.as_deref().unwrap(),
        )
        .unwrap();
        assert_eq!(
            error.code,
            crate::workflow::expand::PreExecutionErrorCode::IncompleteMatrixMissingOutput
        );
        assert_eq!(
            error.details,
            vec!["B".to_string(), "A".to_string(), "colours".to_string()]
        );
        // The placeholder is gone.
        let jobs = db.list_jobs_by_run(run_id).await.unwrap();
        assert!(jobs.iter().all(|j| j.job_key != "B"));
    }

    #[tokio::test]
    async fn test_pre_execution_error_at_creation() {
        let yaml = r#"
jobs:
  b:
    runs-on: x
    strategy:
      matrix:
        v: ${{ needs.ghost.outputs.list }}
"#;
        let (manager, db) = manager().await;
        let run_id = manager.create_run(new_run(), yaml.as_bytes()).await.unwrap();

        let run = db.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, "failure");
        assert!(run.pre_execution_error.is_some());
        assert!(db.list_jobs_by_run(run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_run() {
        let (manager, db) = manager().await;
        let run_id = manager.create_run(new_run(), CHAIN.as_bytes()).await.unwrap();

        manager.cancel_run(run_id).await.unwrap();

        let run = db.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, "cancelled");
        let jobs = db.list_jobs_by_run(run_id).await.unwrap();
        assert!(jobs.iter().all(|j| j.status == "cancelled"));

        // advance_run after cancellation must not resurrect the run.
        manager.advance_run(run_id).await.unwrap();
        assert_eq!(
            db.get_run(run_id).await.unwrap().unwrap().status,
            "cancelled"
        );
    }

    #[tokio::test]
    async fn test_approval_gate() {
        let mut run = new_run();
        run.needs_approval = true;
        let (manager, db) = manager().await;
        let run_id = manager.create_run(run, CHAIN.as_bytes()).await.unwrap();

        // Everything is held back, including the root job.
        let jobs = db.list_jobs_by_run(run_id).await.unwrap();
        assert!(jobs.iter().all(|j| j.status == "blocked"));
        manager.advance_run(run_id).await.unwrap();
        let jobs = db.list_jobs_by_run(run_id).await.unwrap();
        assert!(jobs.iter().all(|j| j.status == "blocked"));

        manager.approve_run(run_id, 42).await.unwrap();

        let run = db.get_run(run_id).await.unwrap().unwrap();
        assert!(!run.needs_approval);
        assert_eq!(run.approved_by, 42);
        let jobs = db.list_jobs_by_run(run_id).await.unwrap();
        assert_eq!(jobs[0].status, "waiting");
        assert_eq!(jobs[1].status, "blocked");

        // A second approval is refused.
        assert!(manager.approve_run(run_id, 42).await.is_err());
    }

    #[tokio::test]
    async fn test_workflow_call_outputs_collected() {
        let (manager, db) = manager().await;
        let run_id = manager.create_run(new_run(), CHAIN.as_bytes()).await.unwrap();

        // Hand-build a workflow-call topology on top of the run.
        let ids = db
            .insert_jobs(&[
                NewJob {
                    run_id,
                    repo_id: 7,
                    job_key: "release / build".to_string(),
                    name: "build".to_string(),
                    needs: "[]".to_string(),
                    runs_on: "[]".to_string(),
                    matrix: "{}".to_string(),
                    outputs_map: "{}".to_string(),
                    status: "success".to_string(),
                    ..Default::default()
                },
                NewJob {
                    run_id,
                    repo_id: 7,
                    job_key: "release".to_string(),
                    name: "release".to_string(),
                    needs: r#"["release / build"]"#.to_string(),
                    runs_on: "[]".to_string(),
                    matrix: "{}".to_string(),
                    is_workflow_call: true,
                    outputs_map: r#"{"image":"${{ jobs.build.outputs.image }}"}"#.to_string(),
                    status: "blocked".to_string(),
                    ..Default::default()
                },
            ])
            .await
            .unwrap();
        db.set_job_outputs(ids[0], r#"{"image":"registry/app:1"}"#)
            .await
            .unwrap();

        manager.advance_run(run_id).await.unwrap();

        let outer = db.get_job(ids[1]).await.unwrap().unwrap();
        assert_eq!(outer.status, "success");
        assert_eq!(outer.output_map()["image"], "registry/app:1");
    }
}
