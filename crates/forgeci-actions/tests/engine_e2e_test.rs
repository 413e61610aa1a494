// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for the Actions engine over the runner protocol.
//!
//! Each test drives the full path a real runner takes: register with a
//! registration token, poll for work, execute, report results and logs.
//! Everything runs against an in-memory SQLite database.

use std::sync::Arc;

use forgeci_actions::dispatcher::Dispatcher;
use forgeci_actions::lifecycle::{Lifecycle, NoopStatusHook};
use forgeci_actions::logstore::FsLogStore;
use forgeci_actions::persistence::{NewRun, Persistence, SqlitePersistence};
use forgeci_actions::registry::{AllScopesValid, RunnerRegistry};
use forgeci_actions::runs::RunManager;
use forgeci_actions::secrets::SecretStore;
use forgeci_actions::server::RunnerService;
use forgeci_actions::sweeper::Sweeper;
use forgeci_actions::token::TokenService;
use forgeci_actions::workflow::expand::NoFetcher;
use forgeci_protocol::runner_proto::*;

const RUNTIME_SECRET: &str = "0123456789abcdef0123456789abcdef";

struct TestContext {
    db: Arc<SqlitePersistence>,
    registry: Arc<RunnerRegistry>,
    runs: Arc<RunManager>,
    service: RunnerService,
    sweeper: Sweeper,
    tokens: TokenService,
    _dir: tempfile::TempDir,
}

impl TestContext {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let logs = Arc::new(FsLogStore::new(dir.path()));
        let registry = Arc::new(RunnerRegistry::new(
            db.clone(),
            logs.clone(),
            Arc::new(AllScopesValid),
        ));
        let tokens = TokenService::new(RUNTIME_SECRET.to_string());
        let secrets = SecretStore::new(db.clone(), RUNTIME_SECRET.to_string());
        let runs = Arc::new(RunManager::new(db.clone(), Arc::new(NoFetcher)));
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            secrets,
            tokens.clone(),
            "http://localhost:3000/api/actions".to_string(),
        ));
        let lifecycle = Arc::new(Lifecycle::new(
            db.clone(),
            logs.clone(),
            runs.clone(),
            Arc::new(NoopStatusHook),
            false,
        ));
        let service = RunnerService::new(registry.clone(), dispatcher, lifecycle);
        let sweeper = Sweeper::new(db.clone(), logs, runs.clone(), 60, 0, 0, 0);

        Self {
            db,
            registry,
            runs,
            service,
            sweeper,
            tokens,
            _dir: dir,
        }
    }

    /// Register a runner through the protocol, as a real runner would.
    async fn register_runner(&self, name: &str, labels: &[&str], ephemeral: bool) -> Runner {
        let token = self.registry.issue_registration_token(0, 0).await.unwrap();
        let response = self
            .service
            .handle(RpcRequest {
                uuid: String::new(),
                token: String::new(),
                request: Some(rpc_request::Request::Register(RegisterRequest {
                    token,
                    name: name.to_string(),
                    version: "1.0.0".to_string(),
                    labels: labels.iter().map(|l| l.to_string()).collect(),
                    ephemeral,
                })),
            })
            .await;
        match response.response.unwrap() {
            rpc_response::Response::Register(r) => r.runner.unwrap(),
            other => panic!("register failed: {other:?}"),
        }
    }

    async fn create_run(&self, workflow: &str) -> i64 {
        self.create_run_with(workflow, NewRun {
            title: "e2e".to_string(),
            owner_id: 5,
            repo_id: 3,
            workflow_id: "ci.yml".to_string(),
            trigger_event: "push".to_string(),
            git_ref: "refs/heads/main".to_string(),
            commit_sha: "deadbeef".to_string(),
            event_payload: "{}".to_string(),
            ..Default::default()
        })
        .await
    }

    async fn create_run_with(&self, workflow: &str, new_run: NewRun) -> i64 {
        self.runs
            .create_run(new_run, workflow.as_bytes())
            .await
            .unwrap()
    }

    async fn fetch(&self, runner: &Runner, request_key: &str) -> FetchTaskResponse {
        let response = self
            .service
            .handle(RpcRequest {
                uuid: runner.uuid.clone(),
                token: runner.token.clone(),
                request: Some(rpc_request::Request::FetchTask(FetchTaskRequest {
                    tasks_version: 0,
                    task_capacity: 1,
                    request_key: request_key.to_string(),
                })),
            })
            .await;
        match response.response.unwrap() {
            rpc_response::Response::FetchTask(r) => r,
            other => panic!("fetch failed: {other:?}"),
        }
    }

    async fn report(
        &self,
        runner: &Runner,
        task_id: i64,
        result: TaskResult,
        outputs: &[(&str, &str)],
    ) -> UpdateTaskResponse {
        let response = self
            .service
            .handle(RpcRequest {
                uuid: runner.uuid.clone(),
                token: runner.token.clone(),
                request: Some(rpc_request::Request::UpdateTask(UpdateTaskRequest {
                    state: Some(TaskState {
                        id: task_id,
                        result: result as i32,
                        steps: vec![],
                        started_at: 1_700_000_000,
                        stopped_at: if result.is_terminal() { 1_700_000_060 } else { 0 },
                    }),
                    outputs: outputs
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                })),
            })
            .await;
        match response.response.unwrap() {
            rpc_response::Response::UpdateTask(r) => r,
            other => panic!("update failed: {other:?}"),
        }
    }
}

const SINGLE_JOB: &str = r#"
name: ci
on: push
jobs:
  job1:
    runs-on: ubuntu-latest
    steps:
      - run: echo ok
"#;

#[tokio::test]
async fn test_happy_path_register_fetch_succeed() {
    let ctx = TestContext::new().await;
    let runner = ctx.register_runner("worker", &["ubuntu-latest"], false).await;
    let run_id = ctx.create_run(SINGLE_JOB).await;

    let fetched = ctx.fetch(&runner, "poll-1").await;
    let task = fetched.task.expect("a task should be pending");
    let payload = String::from_utf8(task.workflow_payload.clone()).unwrap();
    assert!(payload.contains("echo ok"));
    assert!(!task.context.is_empty());
    assert!(!task.secrets["GITHUB_TOKEN"].is_empty());

    ctx.report(&runner, task.id, TaskResult::Success, &[]).await;

    let run = ctx.db.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "success");
    // The runner survives; it was not ephemeral.
    assert!(
        ctx.db
            .get_runner_by_uuid(&runner.uuid)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_happy_path_ephemeral_runner_removed() {
    let ctx = TestContext::new().await;
    let runner = ctx.register_runner("once", &["ubuntu-latest"], true).await;
    ctx.create_run(SINGLE_JOB).await;

    let task = ctx.fetch(&runner, "poll-1").await.task.unwrap();
    ctx.report(&runner, task.id, TaskResult::Success, &[]).await;

    assert!(
        ctx.db
            .get_runner_by_uuid(&runner.uuid)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_idempotent_fetch_replays_same_task() {
    let ctx = TestContext::new().await;
    let runner = ctx.register_runner("worker", &["ubuntu-latest"], false).await;
    ctx.create_run(SINGLE_JOB).await;

    let first = ctx.fetch(&runner, "retry-key").await.task.unwrap();
    let second = ctx.fetch(&runner, "retry-key").await.task.unwrap();

    assert_eq!(first.id, second.id);

    // The replayed assignment carries a freshly minted runtime token that
    // still authenticates for the same task.
    let context: serde_json::Value = serde_json::from_str(&second.context).unwrap();
    let replayed_token = context["token"].as_str().unwrap();
    let claims = ctx.tokens.verify(replayed_token).unwrap();
    assert_eq!(claims.task_id, first.id);

    // A different key on the same runner does not hand out the job twice.
    assert!(ctx.fetch(&runner, "other-key").await.task.is_none());
}

#[tokio::test]
async fn test_matrix_expansion_produces_eight_jobs() {
    let workflow = r#"
jobs:
  job1:
    runs-on: ubuntu-latest
    strategy:
      matrix:
        d1: [a, b]
        d2: [12.x, 14.x]
        d3: [17, 18]
"#;
    let ctx = TestContext::new().await;
    let run_id = ctx.create_run(workflow).await;

    let jobs = ctx.db.list_jobs_by_run(run_id).await.unwrap();
    assert_eq!(jobs.len(), 8);
    assert!(jobs.iter().all(|j| !j.is_placeholder));
    assert!(jobs.iter().all(|j| j.status == "waiting"));

    let names: Vec<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
    assert!(names.contains(&"job1 (a, 12.x, 17)"));
    assert!(names.contains(&"job1 (b, 14.x, 18)"));
}

#[tokio::test]
async fn test_missing_needs_output_fails_run() {
    let workflow = r#"
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
    let ctx = TestContext::new().await;
    let runner = ctx.register_runner("worker", &["ubuntu-latest"], false).await;
    let run_id = ctx.create_run(workflow).await;

    // A runs and finishes without emitting `colours`.
    let task = ctx.fetch(&runner, "poll-a").await.task.unwrap();
    ctx.report(&runner, task.id, TaskResult::Success, &[]).await;

    let run = ctx.db.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "failure");
    let error: serde_json::Value =
        serde_json::from_str(run.pre_execution_error.as_deref().unwrap()).unwrap();
    assert_eq!(error["details"], serde_json::json!(["B", "A", "colours"]));

    // B was consumed; nothing is left to dispatch.
    assert!(ctx.fetch(&runner, "poll-b").await.task.is_none());
}

#[tokio::test]
async fn test_fork_pr_suppresses_oidc_context() {
    let workflow = r#"
enable-openid-connect: true
jobs:
  job1:
    runs-on: ubuntu-latest
"#;
    let ctx = TestContext::new().await;
    let runner = ctx.register_runner("worker", &["ubuntu-latest"], false).await;
    ctx.create_run_with(
        workflow,
        NewRun {
            owner_id: 5,
            repo_id: 3,
            trigger_event: "pull_request".to_string(),
            is_fork_pull_request: true,
            git_ref: "refs/pull/9/head".to_string(),
            event_payload: "{}".to_string(),
            ..Default::default()
        },
    )
    .await;

    let task = ctx.fetch(&runner, "poll-1").await.task.unwrap();
    let context: serde_json::Value = serde_json::from_str(&task.context).unwrap();

    assert!(context["token"].as_str().is_some());
    assert!(context.get("forgejo_actions_id_token_request_url").is_none());
    assert!(context.get("forgejo_actions_id_token_request_token").is_none());
}

#[tokio::test]
async fn test_zombie_task_swept_and_ephemeral_runner_removed() {
    let ctx = TestContext::new().await;
    let runner = ctx.register_runner("doomed", &["ubuntu-latest"], true).await;
    let run_id = ctx.create_run(SINGLE_JOB).await;

    let task = ctx.fetch(&runner, "poll-1").await.task.unwrap();

    // The sweeper's zombie timeout is zero: the task is immediately stale.
    ctx.sweeper.sweep_zombie_tasks().await.unwrap();

    assert_eq!(
        ctx.db.get_task(task.id).await.unwrap().unwrap().status,
        "cancelled"
    );
    assert_eq!(
        ctx.db.get_run(run_id).await.unwrap().unwrap().status,
        "cancelled"
    );
    assert!(
        ctx.db
            .get_runner_by_uuid(&runner.uuid)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_needs_outputs_flow_to_downstream_task() {
    let workflow = r#"
jobs:
  build:
    runs-on: ubuntu-latest
  deploy:
    needs: build
    runs-on: ubuntu-latest
"#;
    let ctx = TestContext::new().await;
    let runner = ctx.register_runner("worker", &["ubuntu-latest"], false).await;
    ctx.create_run(workflow).await;

    let build = ctx.fetch(&runner, "poll-1").await.task.unwrap();
    ctx.report(&runner, build.id, TaskResult::Success, &[("artifact", "a.tar")])
        .await;

    let deploy = ctx.fetch(&runner, "poll-2").await.task.unwrap();
    let need = &deploy.needs["build"];
    assert_eq!(need.result, TaskResult::Success as i32);
    assert_eq!(need.outputs["artifact"], "a.tar");
}

#[tokio::test]
async fn test_log_stream_acked_and_archived() {
    let ctx = TestContext::new().await;
    let runner = ctx.register_runner("worker", &["ubuntu-latest"], false).await;
    ctx.create_run(SINGLE_JOB).await;
    let task = ctx.fetch(&runner, "poll-1").await.task.unwrap();

    let rows: Vec<LogRow> = (0..3)
        .map(|i| LogRow {
            time: 1_700_000_000 + i,
            content: format!("line {i}"),
        })
        .collect();
    let response = ctx
        .service
        .handle(RpcRequest {
            uuid: runner.uuid.clone(),
            token: runner.token.clone(),
            request: Some(rpc_request::Request::UpdateLog(UpdateLogRequest {
                task_id: task.id,
                index: 0,
                rows,
            })),
        })
        .await;
    match response.response.unwrap() {
        rpc_response::Response::UpdateLog(r) => assert_eq!(r.ack_index, 3),
        other => panic!("log update failed: {other:?}"),
    }

    ctx.report(&runner, task.id, TaskResult::Success, &[]).await;
    let stored = ctx.db.get_task(task.id).await.unwrap().unwrap();
    assert!(stored.log_in_storage);
    assert_eq!(stored.log_length, 3);
}
