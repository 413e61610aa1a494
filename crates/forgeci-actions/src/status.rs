// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared status type for runs, jobs, tasks, and steps.

use forgeci_protocol::runner_proto::TaskResult;

/// Execution status of a run, job, task, or step.
///
/// Terminal statuses never change once set: Success, Failure, Cancelled,
/// and Skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Not yet determined (e.g. a step the runner has not reached).
    Unknown,
    /// Eligible for dispatch, waiting for a runner.
    Waiting,
    /// A runner is executing it.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with a failure.
    Failure,
    /// Cancelled before or during execution.
    Cancelled,
    /// Skipped because a predecessor failed or a condition was falsy.
    Skipped,
    /// Waiting for `needs` predecessors (or an approval) before dispatch.
    Blocked,
}

impl Status {
    /// Database / wire string for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Waiting => "waiting",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Cancelled => "cancelled",
            Status::Skipped => "skipped",
            Status::Blocked => "blocked",
        }
    }

    /// Parse a status string; unrecognized values map to Unknown.
    pub fn parse(s: &str) -> Self {
        match s {
            "waiting" => Status::Waiting,
            "running" => Status::Running,
            "success" => Status::Success,
            "failure" => Status::Failure,
            "cancelled" => Status::Cancelled,
            "skipped" => Status::Skipped,
            "blocked" => Status::Blocked,
            _ => Status::Unknown,
        }
    }

    /// True for Success, Failure, Cancelled, and Skipped.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Success | Status::Failure | Status::Cancelled | Status::Skipped
        )
    }

    /// True only for Success.
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// Status corresponding to a runner-reported terminal result.
    pub fn from_result(result: TaskResult) -> Self {
        match result {
            TaskResult::Unspecified => Status::Running,
            TaskResult::Success => Status::Success,
            TaskResult::Failure => Status::Failure,
            TaskResult::Cancelled => Status::Cancelled,
            TaskResult::Skipped => Status::Skipped,
        }
    }

    /// Runner-protocol result for this status, Unspecified when non-terminal.
    pub fn to_result(self) -> TaskResult {
        match self {
            Status::Success => TaskResult::Success,
            Status::Failure => TaskResult::Failure,
            Status::Cancelled => TaskResult::Cancelled,
            Status::Skipped => TaskResult::Skipped,
            _ => TaskResult::Unspecified,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
