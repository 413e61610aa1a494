// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job graph resolution: which blocked jobs move, and where.
//!
//! [`resolve`] is a pure function over an in-memory job list; the caller
//! loads the list inside a transaction and applies the returned
//! transitions in the same transaction. Re-running it on an unchanged
//! list yields the same transitions.
//!
//! Matrix rows share a `job_key`; a `needs` edge on that key is satisfied
//! only when every row is terminal, and its result is the aggregate of
//! the rows' results.

use std::collections::HashMap;

use tracing::warn;

use crate::persistence::JobRecord;
use crate::status::Status;
use crate::workflow::expr::{EvalFrame, Expr};

/// One status change the caller should apply.
///
/// `to == Waiting` on a placeholder job means "ready to expand", not
/// "ready to dispatch"; placeholders never reach a runner.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub job_id: i64,
    pub from: Status,
    pub to: Status,
}

/// Compute transitions for every blocked job in the list.
pub fn resolve(jobs: &[JobRecord], run_cancelled: bool) -> Vec<Transition> {
    // Aggregate per job_key: matrix rows act as one logical predecessor.
    let mut by_key: HashMap<&str, Vec<Status>> = HashMap::new();
    let mut outputs_by_key: HashMap<String, HashMap<String, String>> = HashMap::new();
    for job in jobs {
        let status = Status::parse(&job.status);
        by_key.entry(job.job_key.as_str()).or_default().push(status);
        let merged = outputs_by_key.entry(job.job_key.clone()).or_default();
        for (k, v) in job.output_map() {
            merged.entry(k).or_insert(v);
        }
    }

    let mut transitions = Vec::new();
    for job in jobs {
        let from = Status::parse(&job.status);
        if from != Status::Blocked {
            continue;
        }

        let needs = job.needs_list();

        // A need that is not in the list at all (cycle, self-reference,
        // consumed placeholder) can never be satisfied.
        if needs.iter().any(|n| !by_key.contains_key(n.as_str())) {
            transitions.push(Transition {
                job_id: job.id,
                from,
                to: Status::Skipped,
            });
            continue;
        }

        let all_terminal = needs.iter().all(|n| {
            by_key[n.as_str()].iter().all(|s| s.is_terminal())
        });
        if !all_terminal {
            continue;
        }

        if job.is_workflow_call {
            // Outer job of a reusable-workflow call: synthesize its
            // terminal status from the inner jobs. Failure is monotone.
            let succeeded = needs.iter().all(|n| {
                by_key[n.as_str()]
                    .iter()
                    .all(|s| s.is_success() || *s == Status::Skipped)
            });
            transitions.push(Transition {
                job_id: job.id,
                from,
                to: if succeeded { Status::Success } else { Status::Failure },
            });
            continue;
        }

        let needs_results: HashMap<String, Status> = needs
            .iter()
            .map(|n| (n.clone(), aggregate(&by_key[n.as_str()])))
            .collect();
        let needs_outputs: HashMap<String, HashMap<String, String>> = needs
            .iter()
            .filter_map(|n| outputs_by_key.get(n).map(|m| (n.clone(), m.clone())))
            .collect();

        let matrix: HashMap<String, String> =
            serde_json::from_str(&job.matrix).unwrap_or_default();
        let ready = condition_holds(
            &job.if_condition,
            &EvalFrame {
                needs_results: &needs_results,
                needs_outputs: &needs_outputs,
                matrix: &matrix,
                run_cancelled,
                strict_outputs: false,
            },
        );

        transitions.push(Transition {
            job_id: job.id,
            from,
            to: if ready { Status::Waiting } else { Status::Skipped },
        });
    }

    transitions
}

/// Evaluate an `if:` condition. Empty means `success()`; a condition
/// without a status function gets an implicit `success() &&`.
fn condition_holds(condition: &str, frame: &EvalFrame<'_>) -> bool {
    let success = !frame.run_cancelled
        && frame.needs_results.values().all(|s| s.is_success());

    let condition = condition.trim();
    if condition.is_empty() {
        return success;
    }

    // `if:` text may or may not be wrapped in a template region.
    let inner = condition
        .strip_prefix("${{")
        .and_then(|s| s.strip_suffix("}}"))
        .unwrap_or(condition)
        .trim();

    let expr = match Expr::parse(inner) {
        Ok(expr) => expr,
        Err(e) => {
            warn!(condition = inner, error = %e, "unparseable if condition, skipping job");
            return false;
        }
    };

    if !expr.references_status_fn() && !success {
        return false;
    }

    match expr.eval(frame) {
        Ok(value) => value.truthy(),
        Err(e) => {
            warn!(condition = inner, error = %e, "if condition failed to evaluate, skipping job");
            false
        }
    }
}

/// Aggregate the statuses of one job key's rows into a single result.
pub(crate) fn aggregate(statuses: &[Status]) -> Status {
    if statuses.iter().any(|s| *s == Status::Failure) {
        Status::Failure
    } else if statuses.iter().any(|s| *s == Status::Cancelled) {
        Status::Cancelled
    } else if statuses.iter().all(|s| *s == Status::Skipped) {
        Status::Skipped
    } else {
        Status::Success
    }
}

/// Aggregate job statuses into the run's status.
///
/// Running while anything is still in flight; once converged, Success iff
/// every job succeeded or was intentionally skipped.
pub fn aggregate_run_status(jobs: &[JobRecord]) -> Status {
    let statuses: Vec<Status> = jobs.iter().map(|j| Status::parse(&j.status)).collect();
    if statuses.iter().any(|s| !s.is_terminal()) {
        return Status::Running;
    }
    if statuses.iter().any(|s| *s == Status::Cancelled) {
        return Status::Cancelled;
    }
    if statuses
        .iter()
        .all(|s| s.is_success() || *s == Status::Skipped)
    {
        Status::Success
    } else {
        Status::Failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn job(id: i64, key: &str, status: Status, needs: &[&str], if_condition: &str) -> JobRecord {
        JobRecord {
            id,
            run_id: 1,
            owner_id: 0,
            repo_id: 7,
            job_key: key.to_string(),
            name: key.to_string(),
            needs: serde_json::to_string(needs).unwrap(),
            runs_on: "[]".to_string(),
            if_condition: if_condition.to_string(),
            matrix: "{}".to_string(),
            payload: Vec::new(),
            is_placeholder: false,
            is_workflow_call: false,
            outputs_map: "{}".to_string(),
            outputs: "{}".to_string(),
            task_id: 0,
            status: status.as_str().to_string(),
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            updated_at: Utc::now(),
        }
    }

    fn to_of(transitions: &[Transition], job_id: i64) -> Option<Status> {
        transitions.iter().find(|t| t.job_id == job_id).map(|t| t.to)
    }

    #[test]
    fn test_blocked_job_waits_for_successful_needs() {
        let jobs = vec![
            job(1, "a", Status::Success, &[], ""),
            job(2, "b", Status::Blocked, &["a"], ""),
        ];
        let transitions = resolve(&jobs, false);
        assert_eq!(to_of(&transitions, 2), Some(Status::Waiting));
    }

    #[test]
    fn test_non_terminal_need_stays_blocked() {
        let jobs = vec![
            job(1, "a", Status::Running, &[], ""),
            job(2, "b", Status::Blocked, &["a"], ""),
        ];
        assert!(resolve(&jobs, false).is_empty());
    }

    #[test]
    fn test_missing_need_skips_job() {
        let jobs = vec![job(1, "b", Status::Blocked, &["ghost"], "")];
        let transitions = resolve(&jobs, false);
        assert_eq!(to_of(&transitions, 1), Some(Status::Skipped));
    }

    #[test]
    fn test_failed_need_with_empty_if_skips() {
        let jobs = vec![
            job(1, "a", Status::Failure, &[], ""),
            job(2, "b", Status::Blocked, &["a"], ""),
        ];
        let transitions = resolve(&jobs, false);
        assert_eq!(to_of(&transitions, 2), Some(Status::Skipped));
    }

    #[test]
    fn test_always_runs_after_failure_and_skip() {
        let jobs = vec![
            job(1, "a", Status::Failure, &[], ""),
            job(2, "b", Status::Skipped, &[], ""),
            job(3, "c", Status::Blocked, &["a", "b"], "always()"),
        ];
        let transitions = resolve(&jobs, false);
        assert_eq!(to_of(&transitions, 3), Some(Status::Waiting));
    }

    #[test]
    fn test_skipped_need_does_not_satisfy_success() {
        let jobs = vec![
            job(1, "a", Status::Skipped, &[], ""),
            job(2, "b", Status::Blocked, &["a"], "success()"),
            job(3, "c", Status::Blocked, &["a"], ""),
        ];
        let transitions = resolve(&jobs, false);
        assert_eq!(to_of(&transitions, 2), Some(Status::Skipped));
        assert_eq!(to_of(&transitions, 3), Some(Status::Skipped));
    }

    #[test]
    fn test_failure_condition_runs_only_on_failure() {
        let jobs = vec![
            job(1, "a", Status::Failure, &[], ""),
            job(2, "report", Status::Blocked, &["a"], "failure()"),
        ];
        let transitions = resolve(&jobs, false);
        assert_eq!(to_of(&transitions, 2), Some(Status::Waiting));

        let jobs = vec![
            job(1, "a", Status::Success, &[], ""),
            job(2, "report", Status::Blocked, &["a"], "failure()"),
        ];
        let transitions = resolve(&jobs, false);
        assert_eq!(to_of(&transitions, 2), Some(Status::Skipped));
    }

    #[test]
    fn test_condition_without_status_fn_implies_success() {
        let mut producer = job(1, "a", Status::Failure, &[], "");
        producer.outputs = r#"{"go":"yes"}"#.to_string();
        let jobs = vec![
            producer,
            job(2, "b", Status::Blocked, &["a"], "needs.a.outputs.go == 'yes'"),
        ];
        // The expression is truthy but the predecessor failed.
        let transitions = resolve(&jobs, false);
        assert_eq!(to_of(&transitions, 2), Some(Status::Skipped));
    }

    #[test]
    fn test_needs_result_condition() {
        let jobs = vec![
            job(1, "a", Status::Failure, &[], ""),
            job(
                2,
                "b",
                Status::Blocked,
                &["a"],
                "always() && needs.a.result == 'failure'",
            ),
        ];
        let transitions = resolve(&jobs, false);
        assert_eq!(to_of(&transitions, 2), Some(Status::Waiting));
    }

    #[test]
    fn test_matrix_rows_aggregate_as_one_need() {
        let jobs = vec![
            job(1, "build", Status::Success, &[], ""),
            job(2, "build", Status::Running, &[], ""),
            job(3, "deploy", Status::Blocked, &["build"], ""),
        ];
        // One row still running: the need is not terminal.
        assert!(resolve(&jobs, false).is_empty());

        let jobs = vec![
            job(1, "build", Status::Success, &[], ""),
            job(2, "build", Status::Failure, &[], ""),
            job(3, "deploy", Status::Blocked, &["build"], ""),
        ];
        let transitions = resolve(&jobs, false);
        assert_eq!(to_of(&transitions, 3), Some(Status::Skipped));
    }

    #[test]
    fn test_workflow_call_outer_job_synthesized() {
        let mut outer = job(3, "release", Status::Blocked, &["release / build"], "");
        outer.is_workflow_call = true;
        let jobs = vec![
            job(1, "release / build", Status::Success, &[], ""),
            outer.clone(),
        ];
        let transitions = resolve(&jobs, false);
        assert_eq!(to_of(&transitions, 3), Some(Status::Success));

        let jobs = vec![job(1, "release / build", Status::Failure, &[], ""), outer];
        let transitions = resolve(&jobs, false);
        assert_eq!(to_of(&transitions, 3), Some(Status::Failure));
    }

    #[test]
    fn test_cancelled_run_gates_success() {
        let jobs = vec![
            job(1, "a", Status::Success, &[], ""),
            job(2, "b", Status::Blocked, &["a"], ""),
            job(3, "c", Status::Blocked, &["a"], "cancelled()"),
        ];
        let transitions = resolve(&jobs, true);
        assert_eq!(to_of(&transitions, 2), Some(Status::Skipped));
        assert_eq!(to_of(&transitions, 3), Some(Status::Waiting));
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let jobs = vec![
            job(1, "a", Status::Failure, &[], ""),
            job(2, "b", Status::Blocked, &["a"], "always()"),
            job(3, "c", Status::Blocked, &["b"], ""),
        ];
        let first = resolve(&jobs, false);
        let second = resolve(&jobs, false);
        assert_eq!(first, second);
        // c's need is not terminal yet; only b moves.
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn test_run_aggregation() {
        let jobs = vec![
            job(1, "a", Status::Success, &[], ""),
            job(2, "b", Status::Running, &[], ""),
        ];
        assert_eq!(aggregate_run_status(&jobs), Status::Running);

        let jobs = vec![
            job(1, "a", Status::Success, &[], ""),
            job(2, "b", Status::Skipped, &[], ""),
        ];
        assert_eq!(aggregate_run_status(&jobs), Status::Success);

        let jobs = vec![
            job(1, "a", Status::Success, &[], ""),
            job(2, "b", Status::Failure, &[], ""),
        ];
        assert_eq!(aggregate_run_status(&jobs), Status::Failure);

        let jobs = vec![
            job(1, "a", Status::Cancelled, &[], ""),
            job(2, "b", Status::Success, &[], ""),
        ];
        assert_eq!(aggregate_run_status(&jobs), Status::Cancelled);
    }
}
