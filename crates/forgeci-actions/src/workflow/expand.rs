// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow expansion: reusable workflows, matrix strategies, `runs-on`.
//!
//! Expansion turns a workflow definition into concrete jobs. A job whose
//! matrix or `runs-on` references a `needs` job that has not finished yet
//! is kept as a single placeholder; once its predecessors are terminal the
//! placeholder's payload goes through expansion again with their outputs
//! in the frame. References that can never resolve become a structured
//! [`PreExecutionError`] that fails the whole run.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as Yaml;

use crate::error::{ActionsError, Result};
use crate::status::Status;
use crate::workflow::expr::{self, EvalError, EvalFrame, Expr, Value};
use crate::workflow::{JobSpec, Workflow, matrix};

/// Separator between a workflow-call job key and the inner job keys it
/// expands into.
pub const CALL_SEPARATOR: &str = " / ";

/// Enumerated unrecoverable expansion failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreExecutionErrorCode {
    IncompleteMatrixMissingJob = 1,
    IncompleteMatrixMissingOutput = 2,
    IncompleteRunsOnMissingJob = 3,
    IncompleteRunsOnMissingOutput = 4,
    IncompleteRunsOnMissingMatrixDimension = 5,
}

/// Structured error attached to a run when expansion cannot complete.
/// Details are positional: consumer job first, then the referenced id,
/// then (for outputs) the key and whatever the job did emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreExecutionError {
    pub code: PreExecutionErrorCode,
    pub details: Vec<String>,
}

impl PreExecutionError {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(s: &str) -> Option<Self> {
        serde_json::from_str(s).ok()
    }
}

impl fmt::Display for PreExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: [{}]", self.code, self.details.join(", "))
    }
}

/// Produces the bytes of a referenced reusable workflow.
///
/// `None` means the reference cannot be served; private owners and repos
/// are reported identically to missing ones.
#[async_trait]
pub trait WorkflowFetcher: Send + Sync {
    /// `./path/to/file.yml` in the same repo at the run's commit.
    async fn fetch_local(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// `owner/repo/path.yml@ref` on this instance.
    async fn fetch_instance(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<Vec<u8>>>;
}

/// Fetcher for deployments without reusable-workflow support.
pub struct NoFetcher;

#[async_trait]
impl WorkflowFetcher for NoFetcher {
    async fn fetch_local(&self, _path: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn fetch_instance(
        &self,
        _owner: &str,
        _repo: &str,
        _path: &str,
        _git_ref: &str,
    ) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Finished-job state available to expansion.
#[derive(Default)]
pub struct NeedsContext {
    pub results: HashMap<String, Status>,
    pub outputs: HashMap<String, HashMap<String, String>>,
}

/// One concrete (or placeholder) job produced by expansion.
#[derive(Debug, Clone)]
pub struct ExpandedJob {
    /// Stable id within the run; matrix rows share it.
    pub job_key: String,
    pub name: String,
    pub needs: Vec<String>,
    pub runs_on: Vec<String>,
    pub if_condition: String,
    /// Concrete matrix values for this row.
    pub matrix: Vec<(String, String)>,
    /// Single-job workflow bytes for the runner (or for re-expansion when
    /// this is a placeholder).
    pub payload: Vec<u8>,
    pub is_placeholder: bool,
    pub is_workflow_call: bool,
    /// For workflow-call outer jobs: output name → value expression.
    pub outputs_map: Vec<(String, String)>,
}

/// Outcome of expanding a workflow.
#[derive(Debug)]
pub enum Expansion {
    Jobs(Vec<ExpandedJob>),
    Failed(PreExecutionError),
}

/// Expand workflow bytes into concrete jobs.
pub async fn expand_workflow(
    bytes: &[u8],
    ctx: &NeedsContext,
    fetcher: &dyn WorkflowFetcher,
) -> Result<Expansion> {
    let workflow = Workflow::parse(bytes)?;
    let job_keys: Vec<String> = workflow.jobs.iter().map(|(k, _)| k.clone()).collect();

    let mut out = Vec::new();
    for (job_key, job) in &workflow.jobs {
        if let Some(uses) = &job.uses
            && !job.has_declared_runs_on()
        {
            match expand_call(&workflow, job_key, job, uses, ctx, fetcher).await? {
                Expansion::Jobs(jobs) => out.extend(jobs),
                failed => return Ok(failed),
            }
            continue;
        }

        match expand_one(&workflow, job_key, job, &job_keys, ctx)? {
            Expansion::Jobs(jobs) => out.extend(jobs),
            failed => return Ok(failed),
        }
    }

    Ok(Expansion::Jobs(out))
}

/// Expand a `uses:` job into its inner jobs plus an outer marker job.
async fn expand_call(
    workflow: &Workflow,
    outer_key: &str,
    outer: &JobSpec,
    uses: &str,
    ctx: &NeedsContext,
    fetcher: &dyn WorkflowFetcher,
) -> Result<Expansion> {
    let bytes = match parse_uses(uses) {
        UsesRef::Local(path) => fetcher.fetch_local(&path).await?,
        UsesRef::Instance {
            owner,
            repo,
            path,
            git_ref,
        } => fetcher.fetch_instance(&owner, &repo, &path, &git_ref).await?,
        UsesRef::Invalid => None,
    };
    let Some(bytes) = bytes else {
        // Missing and private references read the same.
        return Err(ActionsError::WorkflowError {
            message: format!("reusable workflow '{}' not found", uses),
        });
    };

    let inner_workflow = Workflow::parse(&bytes)?;
    let inner_keys: Vec<String> = inner_workflow.jobs.iter().map(|(k, _)| k.clone()).collect();
    let prefix = |key: &str| format!("{}{}{}", outer_key, CALL_SEPARATOR, key);

    let mut out = Vec::new();
    let mut outer_needs = Vec::with_capacity(inner_keys.len());
    for (inner_key, inner_job) in &inner_workflow.jobs {
        if inner_job.uses.is_some() && !inner_job.has_declared_runs_on() {
            return Err(ActionsError::WorkflowError {
                message: format!(
                    "nested reusable workflow in '{}' is not supported",
                    uses
                ),
            });
        }

        let prefixed_key = prefix(inner_key);
        outer_needs.push(prefixed_key.clone());

        match expand_one(&inner_workflow, &prefixed_key, inner_job, &inner_keys, ctx)? {
            Expansion::Jobs(mut jobs) => {
                // Inner needs reference unprefixed keys.
                for job in &mut jobs {
                    for need in &mut job.needs {
                        if inner_keys.contains(need) {
                            *need = prefix(need);
                        }
                    }
                }
                out.extend(jobs);
            }
            failed => return Ok(failed),
        }
    }

    let payload = placeholder_payload(workflow, outer_key, outer)?;
    out.push(ExpandedJob {
        job_key: outer_key.to_string(),
        name: outer.display_name(outer_key),
        needs: outer_needs,
        runs_on: Vec::new(),
        if_condition: outer.if_condition.clone().unwrap_or_default(),
        matrix: Vec::new(),
        payload,
        is_placeholder: false,
        is_workflow_call: true,
        outputs_map: inner_workflow.call_outputs.clone(),
    });

    Ok(Expansion::Jobs(out))
}

/// Expand a single job's matrix and `runs-on`.
///
/// `known_keys` are the job ids that count as existing for reference
/// checks.
fn expand_one(
    workflow: &Workflow,
    job_key: &str,
    job: &JobSpec,
    known_keys: &[String],
    ctx: &NeedsContext,
) -> Result<Expansion> {
    let display_name = job.display_name(base_key(job_key));

    // Collect every needs job the matrix and runs-on templates reference.
    let mut referenced = Vec::new();
    for (_, values) in &job.matrix {
        collect_references(values, &mut referenced)?;
    }
    if let Some(runs_on) = &job.runs_on {
        collect_references(runs_on, &mut referenced)?;
    }

    for ref_job in &referenced {
        let exists = known_keys.iter().any(|k| base_key(k) == ref_job)
            || ctx.results.contains_key(ref_job)
            || ctx.outputs.contains_key(ref_job);
        if !exists {
            return Ok(Expansion::Failed(PreExecutionError {
                code: PreExecutionErrorCode::IncompleteMatrixMissingJob,
                details: vec![base_key(job_key).to_string(), ref_job.clone()],
            }));
        }
        let terminal = ctx
            .results
            .get(ref_job)
            .map(|s| s.is_terminal())
            .unwrap_or(false);
        if !terminal {
            // Predecessor not finished yet: keep a single blocked
            // placeholder and re-expand later.
            let mut needs = job.needs.clone();
            for r in &referenced {
                if !needs.contains(r) {
                    needs.push(r.clone());
                }
            }
            return Ok(Expansion::Jobs(vec![ExpandedJob {
                job_key: job_key.to_string(),
                name: display_name,
                needs,
                runs_on: Vec::new(),
                if_condition: job.if_condition.clone().unwrap_or_default(),
                matrix: Vec::new(),
                payload: placeholder_payload(workflow, base_key(job_key), job)?,
                is_placeholder: true,
                is_workflow_call: false,
                outputs_map: Vec::new(),
            }]));
        }
    }

    let frame = EvalFrame {
        needs_results: &ctx.results,
        needs_outputs: &ctx.outputs,
        matrix: &HashMap::new(),
        run_cancelled: false,
        strict_outputs: true,
    };

    // Evaluate matrix axes.
    let mut axes = Vec::with_capacity(job.matrix.len());
    for (axis, values) in &job.matrix {
        match eval_axis(values, &frame) {
            Ok(resolved) => axes.push((axis.clone(), resolved)),
            Err(e) => return Ok(matrix_failure(base_key(job_key), e)),
        }
    }

    let combos = if axes.is_empty() {
        vec![Vec::new()]
    } else {
        // Zero combinations consume the job entirely.
        matrix::cartesian(&axes)
    };

    let mut out = Vec::with_capacity(combos.len());
    for combo in combos {
        let matrix_map: HashMap<String, String> = combo.iter().cloned().collect();
        let combo_frame = EvalFrame {
            needs_results: &ctx.results,
            needs_outputs: &ctx.outputs,
            matrix: &matrix_map,
            run_cancelled: false,
            strict_outputs: true,
        };

        let runs_on = match eval_runs_on(job.runs_on.as_ref(), &combo_frame) {
            Ok(labels) => labels,
            Err(e) => return Ok(runs_on_failure(base_key(job_key), e)),
        };

        let name = matrix::job_name(&display_name, &combo);
        let payload =
            workflow.single_job_payload(base_key(job_key), job, &name, &combo, &runs_on)?;

        out.push(ExpandedJob {
            job_key: job_key.to_string(),
            name,
            needs: job.needs.clone(),
            runs_on,
            if_condition: job.if_condition.clone().unwrap_or_default(),
            matrix: combo,
            payload,
            is_placeholder: false,
            is_workflow_call: false,
            outputs_map: Vec::new(),
        });
    }

    Ok(Expansion::Jobs(out))
}

// A prefixed workflow-call inner key still parses with its base id.
fn base_key(key: &str) -> &str {
    key.rsplit(CALL_SEPARATOR).next().unwrap_or(key)
}

/// Resolve one matrix axis to its concrete values.
fn eval_axis(values: &Yaml, frame: &EvalFrame<'_>) -> std::result::Result<Vec<String>, EvalError> {
    match values {
        Yaml::Sequence(seq) => {
            let mut out = Vec::with_capacity(seq.len());
            for item in seq {
                out.extend(eval_scalar(item, frame)?);
            }
            Ok(out)
        }
        other => eval_scalar(other, frame),
    }
}

/// A scalar axis entry: either a literal or an expression whose result may
/// itself be a JSON list (outputs carrying multiple values).
fn eval_scalar(item: &Yaml, frame: &EvalFrame<'_>) -> std::result::Result<Vec<String>, EvalError> {
    let text = yaml_scalar_string(item);
    if !expr::is_templated(&text) {
        return Ok(vec![text]);
    }

    let value = expr::evaluate_template(&text, frame)?;
    if let Value::Str(s) = &value
        && let Ok(serde_json::Value::Array(items)) = serde_json::from_str::<serde_json::Value>(s)
    {
        return Ok(items
            .into_iter()
            .map(|v| match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .collect());
    }
    Ok(vec![value.to_string()])
}

fn eval_runs_on(
    runs_on: Option<&Yaml>,
    frame: &EvalFrame<'_>,
) -> std::result::Result<Vec<String>, EvalError> {
    match runs_on {
        None => Ok(Vec::new()),
        // Array shape is preserved: each element evaluates independently.
        Some(Yaml::Sequence(seq)) => seq
            .iter()
            .map(|item| {
                expr::evaluate_template(&yaml_scalar_string(item), frame).map(|v| v.to_string())
            })
            .collect(),
        Some(other) => {
            let value = expr::evaluate_template(&yaml_scalar_string(other), frame)?;
            Ok(vec![value.to_string()])
        }
    }
}

fn yaml_scalar_string(value: &Yaml) -> String {
    match value {
        Yaml::String(s) => s.clone(),
        Yaml::Bool(b) => b.to_string(),
        Yaml::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

/// Pull `needs` references out of every template in a YAML subtree.
fn collect_references(node: &Yaml, into: &mut Vec<String>) -> Result<()> {
    match node {
        Yaml::String(s) if expr::is_templated(s) => {
            for region in template_exprs(s) {
                let parsed = Expr::parse(&region).map_err(|e| ActionsError::WorkflowError {
                    message: e.to_string(),
                })?;
                expr::referenced_needs(&parsed, into);
            }
        }
        Yaml::Sequence(seq) => {
            for item in seq {
                collect_references(item, into)?;
            }
        }
        Yaml::Mapping(map) => {
            for (_, value) in map {
                collect_references(value, into)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn template_exprs(input: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = input;
    while let Some(start) = rest.find("${{") {
        let Some(end) = rest[start + 3..].find("}}") else {
            break;
        };
        out.push(rest[start + 3..start + 3 + end].trim().to_string());
        rest = &rest[start + 3 + end + 2..];
    }
    out
}

fn matrix_failure(job_key: &str, e: EvalError) -> Expansion {
    let (code, details) = match e {
        EvalError::MissingJob { job } => (
            PreExecutionErrorCode::IncompleteMatrixMissingJob,
            vec![job_key.to_string(), job],
        ),
        EvalError::MissingOutput {
            job,
            key,
            available,
        } => {
            let mut details = vec![job_key.to_string(), job, key];
            details.extend(available);
            (PreExecutionErrorCode::IncompleteMatrixMissingOutput, details)
        }
        // A matrix value cannot reference the matrix being built.
        EvalError::MissingMatrixDimension { key } => (
            PreExecutionErrorCode::IncompleteRunsOnMissingMatrixDimension,
            vec![job_key.to_string(), key],
        ),
        EvalError::Parse { message } => (
            PreExecutionErrorCode::IncompleteMatrixMissingJob,
            vec![job_key.to_string(), message],
        ),
    };
    Expansion::Failed(PreExecutionError { code, details })
}

fn runs_on_failure(job_key: &str, e: EvalError) -> Expansion {
    let (code, details) = match e {
        EvalError::MissingJob { job } => (
            PreExecutionErrorCode::IncompleteRunsOnMissingJob,
            vec![job_key.to_string(), job],
        ),
        EvalError::MissingOutput {
            job,
            key,
            available,
        } => {
            let mut details = vec![job_key.to_string(), job, key];
            details.extend(available);
            (PreExecutionErrorCode::IncompleteRunsOnMissingOutput, details)
        }
        EvalError::MissingMatrixDimension { key } => (
            PreExecutionErrorCode::IncompleteRunsOnMissingMatrixDimension,
            vec![job_key.to_string(), key],
        ),
        EvalError::Parse { message } => (
            PreExecutionErrorCode::IncompleteRunsOnMissingJob,
            vec![job_key.to_string(), message],
        ),
    };
    Expansion::Failed(PreExecutionError { code, details })
}

/// Serialize a job unchanged as a single-job workflow, for placeholders
/// and workflow-call outer jobs.
fn placeholder_payload(workflow: &Workflow, job_key: &str, job: &JobSpec) -> Result<Vec<u8>> {
    let mut root = serde_yaml::Mapping::new();
    if let Some(name) = &workflow.name {
        root.insert(Yaml::from("name"), Yaml::from(name.as_str()));
    }
    if let Some(on) = &workflow.on {
        root.insert(Yaml::from("on"), on.clone());
    }
    let mut jobs = serde_yaml::Mapping::new();
    jobs.insert(Yaml::from(job_key), job.raw.clone());
    root.insert(Yaml::from("jobs"), Yaml::Mapping(jobs));
    Ok(serde_yaml::to_string(&Yaml::Mapping(root))?.into_bytes())
}

enum UsesRef {
    Local(String),
    Instance {
        owner: String,
        repo: String,
        path: String,
        git_ref: String,
    },
    Invalid,
}

fn parse_uses(uses: &str) -> UsesRef {
    if let Some(path) = uses.strip_prefix("./") {
        return UsesRef::Local(path.to_string());
    }

    let Some((location, git_ref)) = uses.rsplit_once('@') else {
        return UsesRef::Invalid;
    };
    let mut parts = location.splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(repo), Some(path))
            if !owner.is_empty() && !repo.is_empty() && !path.is_empty() && !git_ref.is_empty() =>
        {
            UsesRef::Instance {
                owner: owner.to_string(),
                repo: repo.to_string(),
                path: path.to_string(),
                git_ref: git_ref.to_string(),
            }
        }
        _ => UsesRef::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jobs(expansion: Expansion) -> Vec<ExpandedJob> {
        match expansion {
            Expansion::Jobs(jobs) => jobs,
            Expansion::Failed(e) => panic!("expected jobs, got {}", e),
        }
    }

    fn failure(expansion: Expansion) -> PreExecutionError {
        match expansion {
            Expansion::Failed(e) => e,
            Expansion::Jobs(jobs) => panic!("expected failure, got {} jobs", jobs.len()),
        }
    }

    #[tokio::test]
    async fn test_static_matrix_produces_cartesian_jobs() {
        let yaml = r#"
jobs:
  job1:
    runs-on: ubuntu-latest
    strategy:
      matrix:
        d1: [a, b]
        d2: [12.x, 14.x]
        d3: [17, 18]
    steps:
      - run: echo ok
"#;
        let ctx = NeedsContext::default();
        let expanded = jobs(expand_workflow(yaml.as_bytes(), &ctx, &NoFetcher).await.unwrap());

        assert_eq!(expanded.len(), 8);
        assert_eq!(expanded[0].name, "job1 (a, 12.x, 17)");
        assert_eq!(expanded[7].name, "job1 (b, 14.x, 18)");
        for job in &expanded {
            assert_eq!(job.job_key, "job1");
            assert!(!job.is_placeholder);
            assert!(job.needs.is_empty());
            assert_eq!(job.runs_on, vec!["ubuntu-latest".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_needs_reference_defers_to_placeholder() {
        let yaml = r#"
jobs:
  a:
    runs-on: x
  b:
    needs: a
    runs-on: x
    strategy:
      matrix:
        v: ${{ needs.a.outputs.versions }}
"#;
        let ctx = NeedsContext::default();
        let expanded = jobs(expand_workflow(yaml.as_bytes(), &ctx, &NoFetcher).await.unwrap());

        assert_eq!(expanded.len(), 2);
        let b = expanded.iter().find(|j| j.job_key == "b").unwrap();
        assert!(b.is_placeholder);
        assert_eq!(b.needs, vec!["a".to_string()]);
        // Placeholder payload keeps the templated matrix for re-expansion.
        let reparsed = Workflow::parse(&b.payload).unwrap();
        assert_eq!(reparsed.jobs[0].1.matrix.len(), 1);
    }

    #[tokio::test]
    async fn test_placeholder_reexpands_with_outputs() {
        let yaml = r#"
jobs:
  b:
    needs: a
    runs-on: x
    strategy:
      matrix:
        v: ${{ needs.a.outputs.versions }}
"#;
        let mut ctx = NeedsContext::default();
        ctx.results.insert("a".to_string(), Status::Success);
        let mut outputs = HashMap::new();
        outputs.insert("versions".to_string(), r#"["1.0","2.0"]"#.to_string());
        ctx.outputs.insert("a".to_string(), outputs);

        let expanded = jobs(expand_workflow(yaml.as_bytes(), &ctx, &NoFetcher).await.unwrap());
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[0].name, "b (1.0)");
        assert_eq!(expanded[1].name, "b (2.0)");
    }

    #[tokio::test]
    async fn test_missing_needs_job_fails_immediately() {
        let yaml = r#"
jobs:
  b:
    runs-on: x
    strategy:
      matrix:
        v: ${{ needs.ghost.outputs.list }}
"#;
        let ctx = NeedsContext::default();
        let err = failure(expand_workflow(yaml.as_bytes(), &ctx, &NoFetcher).await.unwrap());
        assert_eq!(err.code, PreExecutionErrorCode::IncompleteMatrixMissingJob);
        assert_eq!(err.details, vec!["b".to_string(), "ghost".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_output_after_finish() {
        let yaml = r#"
jobs:
  B:
    needs: A
    runs-on: x
    strategy:
      matrix:
        x: ${{ needs.A.outputs.colours }}
"#;
        let mut ctx = NeedsContext::default();
        ctx.results.insert("A".to_string(), Status::Success);
        ctx.outputs.insert("A".to_string(), HashMap::new());

        let err = failure(expand_workflow(yaml.as_bytes(), &ctx, &NoFetcher).await.unwrap());
        assert_eq!(err.code, PreExecutionErrorCode::IncompleteMatrixMissingOutput);
        assert_eq!(
            err.details,
            vec!["B".to_string(), "A".to_string(), "colours".to_string()]
        );
    }

    #[tokio::test]
    async fn test_runs_on_template_preserves_array_shape() {
        let yaml = r#"
jobs:
  job1:
    runs-on: [self-hosted, "${{ matrix.os }}"]
    strategy:
      matrix:
        os: [linux, macos]
"#;
        let ctx = NeedsContext::default();
        let expanded = jobs(expand_workflow(yaml.as_bytes(), &ctx, &NoFetcher).await.unwrap());
        assert_eq!(expanded.len(), 2);
        assert_eq!(
            expanded[0].runs_on,
            vec!["self-hosted".to_string(), "linux".to_string()]
        );
        assert_eq!(
            expanded[1].runs_on,
            vec!["self-hosted".to_string(), "macos".to_string()]
        );
    }

    #[tokio::test]
    async fn test_runs_on_missing_matrix_dimension() {
        let yaml = r#"
jobs:
  job1:
    runs-on: ${{ matrix.arch }}
    strategy:
      matrix:
        os: [linux]
"#;
        let ctx = NeedsContext::default();
        let err = failure(expand_workflow(yaml.as_bytes(), &ctx, &NoFetcher).await.unwrap());
        assert_eq!(
            err.code,
            PreExecutionErrorCode::IncompleteRunsOnMissingMatrixDimension
        );
        assert_eq!(err.details, vec!["job1".to_string(), "arch".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_matrix_after_evaluation_consumes_job() {
        let yaml = r#"
jobs:
  b:
    needs: a
    runs-on: x
    strategy:
      matrix:
        v: ${{ needs.a.outputs.list }}
"#;
        let mut ctx = NeedsContext::default();
        ctx.results.insert("a".to_string(), Status::Success);
        let mut outputs = HashMap::new();
        outputs.insert("list".to_string(), "[]".to_string());
        ctx.outputs.insert("a".to_string(), outputs);

        let expanded = jobs(expand_workflow(yaml.as_bytes(), &ctx, &NoFetcher).await.unwrap());
        assert!(expanded.is_empty());
    }

    struct MapFetcher(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl WorkflowFetcher for MapFetcher {
        async fn fetch_local(&self, path: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.0.get(path).cloned())
        }

        async fn fetch_instance(
            &self,
            owner: &str,
            repo: &str,
            path: &str,
            git_ref: &str,
        ) -> Result<Option<Vec<u8>>> {
            let key = format!("{}/{}/{}@{}", owner, repo, path, git_ref);
            Ok(self.0.get(&key).cloned())
        }
    }

    const REUSABLE: &str = r#"
on:
  workflow_call:
    outputs:
      image:
        value: ${{ jobs.build.outputs.image }}
jobs:
  build:
    runs-on: x
  publish:
    needs: build
    runs-on: x
"#;

    #[tokio::test]
    async fn test_local_uses_expands_inner_jobs() {
        let yaml = r#"
jobs:
  release:
    uses: ./.forgejo/workflows/build.yml
"#;
        let mut files = HashMap::new();
        files.insert(
            ".forgejo/workflows/build.yml".to_string(),
            REUSABLE.as_bytes().to_vec(),
        );
        let fetcher = MapFetcher(files);

        let ctx = NeedsContext::default();
        let expanded = jobs(expand_workflow(yaml.as_bytes(), &ctx, &fetcher).await.unwrap());

        assert_eq!(expanded.len(), 3);
        assert_eq!(expanded[0].job_key, "release / build");
        assert_eq!(expanded[1].job_key, "release / publish");
        assert_eq!(expanded[1].needs, vec!["release / build".to_string()]);

        let outer = &expanded[2];
        assert_eq!(outer.job_key, "release");
        assert!(outer.is_workflow_call);
        assert_eq!(
            outer.needs,
            vec!["release / build".to_string(), "release / publish".to_string()]
        );
        assert_eq!(outer.outputs_map.len(), 1);
        assert_eq!(outer.outputs_map[0].0, "image");
    }

    #[tokio::test]
    async fn test_missing_reusable_workflow_fails() {
        let yaml = "jobs:\n  j:\n    uses: owner/private/wf.yml@main\n";
        let ctx = NeedsContext::default();
        let err = expand_workflow(yaml.as_bytes(), &ctx, &NoFetcher)
            .await
            .unwrap_err();
        assert!(matches!(err, ActionsError::WorkflowError { .. }));
    }

    #[tokio::test]
    async fn test_declared_runs_on_skips_uses_expansion() {
        let yaml = r#"
jobs:
  j:
    uses: owner/repo/wf.yml@main
    runs-on: ubuntu-latest
"#;
        let ctx = NeedsContext::default();
        let expanded = jobs(expand_workflow(yaml.as_bytes(), &ctx, &NoFetcher).await.unwrap());
        assert_eq!(expanded.len(), 1);
        assert!(!expanded[0].is_workflow_call);
        assert_eq!(expanded[0].runs_on, vec!["ubuntu-latest".to_string()]);
    }
}
