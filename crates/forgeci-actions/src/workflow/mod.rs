// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions: YAML model, expression evaluation, expansion.
//!
//! [`Workflow::parse`] reads the YAML subset the dispatcher cares about
//! while keeping each job's raw node around, so concrete single-job
//! payloads can be re-serialized for the runner without losing fields this
//! model does not interpret.

pub mod expand;
pub mod expr;
pub mod matrix;

use serde_yaml::Value;

use crate::error::{ActionsError, Result};

/// A parsed workflow definition.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: Option<String>,
    /// Raw `on:` node, carried into single-job payloads untouched.
    pub on: Option<Value>,
    /// Workflow-level `enable-openid-connect:` toggle.
    pub enable_oidc: bool,
    /// Jobs in declared order.
    pub jobs: Vec<(String, JobSpec)>,
    /// `on.workflow_call.outputs` name → value expression, for reusable
    /// workflows called by an outer job.
    pub call_outputs: Vec<(String, String)>,
}

/// One job declaration. `raw` keeps the full YAML node.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub raw: Value,
    pub name: Option<String>,
    pub needs: Vec<String>,
    /// Raw `runs-on:` node (scalar or sequence), before evaluation.
    pub runs_on: Option<Value>,
    pub if_condition: Option<String>,
    pub uses: Option<String>,
    /// `strategy.matrix` axes in declared order.
    pub matrix: Vec<(String, Value)>,
}

impl Workflow {
    /// Parse workflow bytes.
    pub fn parse(bytes: &[u8]) -> Result<Workflow> {
        let root: Value = serde_yaml::from_slice(bytes)?;
        let map = root.as_mapping().ok_or_else(|| ActionsError::WorkflowError {
            message: "workflow root is not a mapping".to_string(),
        })?;

        let name = get_str(&root, "name");
        let on = map.get(Value::from("on")).cloned();
        let enable_oidc = map
            .get(Value::from("enable-openid-connect"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let jobs_node = map
            .get(Value::from("jobs"))
            .and_then(Value::as_mapping)
            .ok_or_else(|| ActionsError::WorkflowError {
                message: "workflow has no jobs".to_string(),
            })?;

        let mut jobs = Vec::with_capacity(jobs_node.len());
        for (key, value) in jobs_node {
            let key = key.as_str().ok_or_else(|| ActionsError::WorkflowError {
                message: "job key is not a string".to_string(),
            })?;
            jobs.push((key.to_string(), JobSpec::parse(value)?));
        }
        if jobs.is_empty() {
            return Err(ActionsError::WorkflowError {
                message: "workflow has no jobs".to_string(),
            });
        }

        let call_outputs = parse_call_outputs(on.as_ref());

        Ok(Workflow {
            name,
            on,
            enable_oidc,
            jobs,
            call_outputs,
        })
    }

    /// Serialize a single concrete job as a standalone workflow payload.
    ///
    /// `display_name` and `matrix` pin the expanded identity: the matrix is
    /// rewritten to single-value axes so the runner sees exactly one
    /// combination.
    pub fn single_job_payload(
        &self,
        job_key: &str,
        job: &JobSpec,
        display_name: &str,
        matrix: &[(String, String)],
        runs_on: &[String],
    ) -> Result<Vec<u8>> {
        let mut job_node = job.raw.clone();
        if let Some(job_map) = job_node.as_mapping_mut() {
            job_map.insert(Value::from("name"), Value::from(display_name));
            job_map.insert(
                Value::from("runs-on"),
                Value::Sequence(runs_on.iter().map(|l| Value::from(l.as_str())).collect()),
            );
            if !matrix.is_empty() {
                let mut matrix_map = serde_yaml::Mapping::new();
                for (axis, value) in matrix {
                    matrix_map.insert(
                        Value::from(axis.as_str()),
                        Value::Sequence(vec![Value::from(value.as_str())]),
                    );
                }
                let mut strategy = serde_yaml::Mapping::new();
                strategy.insert(Value::from("matrix"), Value::Mapping(matrix_map));
                job_map.insert(Value::from("strategy"), Value::Mapping(strategy));
            }
        }

        let mut root = serde_yaml::Mapping::new();
        if let Some(name) = &self.name {
            root.insert(Value::from("name"), Value::from(name.as_str()));
        }
        if let Some(on) = &self.on {
            root.insert(Value::from("on"), on.clone());
        }
        let mut jobs = serde_yaml::Mapping::new();
        jobs.insert(Value::from(job_key), job_node);
        root.insert(Value::from("jobs"), Value::Mapping(jobs));

        Ok(serde_yaml::to_string(&Value::Mapping(root))?.into_bytes())
    }
}

impl JobSpec {
    fn parse(value: &Value) -> Result<JobSpec> {
        let needs = match value.get("needs") {
            Some(node) => string_or_seq(node),
            None => Vec::new(),
        };

        let matrix = match value.get("strategy").and_then(|s| s.get("matrix")) {
            Some(Value::Mapping(map)) => {
                let mut axes = Vec::with_capacity(map.len());
                for (axis, values) in map {
                    let axis = axis.as_str().ok_or_else(|| ActionsError::WorkflowError {
                        message: "matrix axis name is not a string".to_string(),
                    })?;
                    axes.push((axis.to_string(), values.clone()));
                }
                axes
            }
            _ => Vec::new(),
        };

        Ok(JobSpec {
            raw: value.clone(),
            name: get_str(value, "name"),
            needs,
            runs_on: value.get("runs-on").cloned(),
            if_condition: get_scalar_string(value, "if"),
            uses: get_str(value, "uses"),
            matrix,
        })
    }

    /// Display name before matrix expansion.
    pub fn display_name(&self, job_key: &str) -> String {
        self.name.clone().unwrap_or_else(|| job_key.to_string())
    }

    /// Whether `runs-on` declares at least one concrete (non-templated)
    /// label. Such a job skips reusable-workflow expansion.
    pub fn has_declared_runs_on(&self) -> bool {
        match &self.runs_on {
            Some(Value::String(s)) => !expr::is_templated(s),
            Some(Value::Sequence(seq)) => seq
                .iter()
                .any(|v| matches!(v, Value::String(s) if !expr::is_templated(s))),
            _ => false,
        }
    }
}

fn get_str(value: &Value, key: &str) -> Option<String> {
    value.get(key)?.as_str().map(str::to_string)
}

// `if: true` and `if: 1` are legal YAML scalars; normalize to their string
// form so the expression parser sees them.
fn get_scalar_string(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_or_seq(node: &Value) -> Vec<String> {
    match node {
        Value::String(s) => vec![s.clone()],
        Value::Sequence(seq) => seq
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_call_outputs(on: Option<&Value>) -> Vec<(String, String)> {
    let Some(outputs) = on
        .and_then(|on| on.get("workflow_call"))
        .and_then(|wc| wc.get("outputs"))
        .and_then(Value::as_mapping)
    else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity(outputs.len());
    for (name, spec) in outputs {
        if let (Some(name), Some(value)) = (name.as_str(), spec.get("value").and_then(Value::as_str))
        {
            out.push((name.to_string(), value.to_string()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
name: CI
on: push
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - run: echo build
  test:
    name: Test Suite
    needs: build
    runs-on: [self-hosted, linux]
    if: success()
    steps:
      - run: echo test
"#;

    #[test]
    fn test_parse_basic_workflow() {
        let wf = Workflow::parse(BASIC.as_bytes()).unwrap();
        assert_eq!(wf.name.as_deref(), Some("CI"));
        assert!(!wf.enable_oidc);
        assert_eq!(wf.jobs.len(), 2);

        let (key, build) = &wf.jobs[0];
        assert_eq!(key, "build");
        assert!(build.needs.is_empty());
        assert!(build.has_declared_runs_on());

        let (key, test) = &wf.jobs[1];
        assert_eq!(key, "test");
        assert_eq!(test.needs, vec!["build".to_string()]);
        assert_eq!(test.if_condition.as_deref(), Some("success()"));
        assert_eq!(test.display_name("test"), "Test Suite");
    }

    #[test]
    fn test_parse_matrix_axes_in_declared_order() {
        let yaml = r#"
jobs:
  job1:
    runs-on: ubuntu-latest
    strategy:
      matrix:
        d1: [a, b]
        d2: [12.x, 14.x]
        d3: [17, 18]
"#;
        let wf = Workflow::parse(yaml.as_bytes()).unwrap();
        let axes: Vec<&str> = wf.jobs[0].1.matrix.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(axes, vec!["d1", "d2", "d3"]);
    }

    #[test]
    fn test_parse_rejects_jobless_workflow() {
        assert!(Workflow::parse(b"name: empty\non: push\n").is_err());
        assert!(Workflow::parse(b"jobs: {}\n").is_err());
        assert!(Workflow::parse(b"- not a mapping\n").is_err());
    }

    #[test]
    fn test_enable_oidc_toggle() {
        let yaml = "enable-openid-connect: true\njobs:\n  a:\n    runs-on: x\n";
        assert!(Workflow::parse(yaml.as_bytes()).unwrap().enable_oidc);
    }

    #[test]
    fn test_templated_runs_on_is_not_declared() {
        let yaml = "jobs:\n  a:\n    runs-on: ${{ matrix.os }}\n";
        let wf = Workflow::parse(yaml.as_bytes()).unwrap();
        assert!(!wf.jobs[0].1.has_declared_runs_on());
    }

    #[test]
    fn test_call_outputs_parsed() {
        let yaml = r#"
on:
  workflow_call:
    outputs:
      image:
        description: built image
        value: ${{ jobs.build.outputs.image }}
jobs:
  build:
    runs-on: x
"#;
        let wf = Workflow::parse(yaml.as_bytes()).unwrap();
        assert_eq!(wf.call_outputs.len(), 1);
        assert_eq!(wf.call_outputs[0].0, "image");
    }

    #[test]
    fn test_single_job_payload_round_trips() {
        let wf = Workflow::parse(BASIC.as_bytes()).unwrap();
        let (key, job) = &wf.jobs[0];
        let payload = wf
            .single_job_payload(
                key,
                job,
                "build (a)",
                &[("d1".to_string(), "a".to_string())],
                &["ubuntu-latest".to_string()],
            )
            .unwrap();

        let reparsed = Workflow::parse(&payload).unwrap();
        assert_eq!(reparsed.jobs.len(), 1);
        let (rkey, rjob) = &reparsed.jobs[0];
        assert_eq!(rkey, "build");
        assert_eq!(rjob.name.as_deref(), Some("build (a)"));
        assert_eq!(rjob.matrix.len(), 1);
        // Steps survive re-serialization untouched.
        assert!(rjob.raw.get("steps").is_some());
    }
}
