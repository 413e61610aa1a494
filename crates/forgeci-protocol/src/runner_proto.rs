// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf messages for the runner service.
//!
//! These are hand-maintained prost derives rather than `build.rs` output so
//! the crate builds without a `protoc` toolchain. Tag numbers are part of the
//! wire contract: never reuse or renumber a released tag.

/// Terminal (or unset) result of a task or step as reported by a runner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TaskResult {
    /// No result yet; the update is a heartbeat / output flush.
    Unspecified = 0,
    /// Task finished successfully.
    Success = 1,
    /// Task finished with a failure.
    Failure = 2,
    /// Task was cancelled.
    Cancelled = 3,
    /// Task was skipped.
    Skipped = 4,
}

impl TaskResult {
    /// True for every variant except [`TaskResult::Unspecified`].
    pub fn is_terminal(self) -> bool {
        self != TaskResult::Unspecified
    }
}

/// A registered runner as returned by `Register` and `Declare`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Runner {
    /// Server-assigned numeric id.
    #[prost(int64, tag = "1")]
    pub id: i64,
    /// Stable UUID identifying the runner across calls.
    #[prost(string, tag = "2")]
    pub uuid: ::prost::alloc::string::String,
    /// Secret token; returned only once, on registration.
    #[prost(string, tag = "3")]
    pub token: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub version: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "6")]
    pub labels: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Ephemeral runners are deleted after their single task terminates.
    #[prost(bool, tag = "7")]
    pub ephemeral: bool,
}

/// Register a new runner with a registration token.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterRequest {
    /// Registration token (scoped, single use).
    #[prost(string, tag = "1")]
    pub token: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub version: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "4")]
    pub labels: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(bool, tag = "5")]
    pub ephemeral: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterResponse {
    #[prost(message, optional, tag = "1")]
    pub runner: ::core::option::Option<Runner>,
}

/// Update mutable fields of an already-registered runner.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeclareRequest {
    #[prost(string, repeated, tag = "1")]
    pub labels: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, tag = "2")]
    pub version: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeclareResponse {
    #[prost(message, optional, tag = "1")]
    pub runner: ::core::option::Option<Runner>,
}

/// Poll for pending tasks.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FetchTaskRequest {
    /// The tasks version the runner last saw for its scope. When this equals
    /// the server-side version, the server skips the task scan entirely.
    #[prost(int64, tag = "1")]
    pub tasks_version: i64,
    /// Maximum number of tasks the runner is willing to accept in one poll.
    #[prost(int64, tag = "2")]
    pub task_capacity: i64,
    /// Client-controlled idempotency key. Retrying a fetch with the same key
    /// returns the previously assigned tasks instead of new ones.
    #[prost(string, tag = "3")]
    pub request_key: ::prost::alloc::string::String,
}

/// Outputs and terminal result of a `needs` predecessor job.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskNeed {
    #[prost(map = "string, string", tag = "1")]
    pub outputs: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
    #[prost(enumeration = "TaskResult", tag = "2")]
    pub result: i32,
}

/// A dispatched task: everything a runner needs to execute one job.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Task {
    #[prost(int64, tag = "1")]
    pub id: i64,
    /// Concrete single-job workflow bytes (YAML).
    #[prost(bytes = "vec", tag = "2")]
    pub workflow_payload: ::prost::alloc::vec::Vec<u8>,
    /// JSON object with the Git context, the runtime token and, when OIDC is
    /// enabled for the job, the ID-token request URL and token.
    #[prost(string, tag = "3")]
    pub context: ::prost::alloc::string::String,
    #[prost(map = "string, string", tag = "4")]
    pub secrets: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
    #[prost(map = "string, string", tag = "5")]
    pub vars: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
    /// Keyed by the predecessor's job id within the run.
    #[prost(map = "string, message", tag = "6")]
    pub needs: ::std::collections::HashMap<::prost::alloc::string::String, TaskNeed>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FetchTaskResponse {
    /// Primary task, absent when nothing is pending.
    #[prost(message, optional, tag = "1")]
    pub task: ::core::option::Option<Task>,
    /// Current tasks version for the runner's scope.
    #[prost(int64, tag = "2")]
    pub tasks_version: i64,
    /// Further tasks picked in the same poll, up to `task_capacity - 1`.
    #[prost(message, repeated, tag = "3")]
    pub additional_tasks: ::prost::alloc::vec::Vec<Task>,
}

/// Per-step progress within a task.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StepState {
    /// Zero-based step index.
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(enumeration = "TaskResult", tag = "2")]
    pub result: i32,
    /// First log row of this step.
    #[prost(int64, tag = "3")]
    pub log_index: i64,
    /// Number of log rows belonging to this step.
    #[prost(int64, tag = "4")]
    pub log_length: i64,
    /// Unix seconds; zero when not started / not stopped.
    #[prost(int64, tag = "5")]
    pub started_at: i64,
    #[prost(int64, tag = "6")]
    pub stopped_at: i64,
}

/// Task progress as reported by the runner.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskState {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(enumeration = "TaskResult", tag = "2")]
    pub result: i32,
    #[prost(message, repeated, tag = "3")]
    pub steps: ::prost::alloc::vec::Vec<StepState>,
    #[prost(int64, tag = "4")]
    pub started_at: i64,
    #[prost(int64, tag = "5")]
    pub stopped_at: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateTaskRequest {
    #[prost(message, optional, tag = "1")]
    pub state: ::core::option::Option<TaskState>,
    /// Output delta; inserted if absent, never overwritten.
    #[prost(map = "string, string", tag = "2")]
    pub outputs: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateTaskResponse {
    /// Authoritative state after the update; the runner stops when the
    /// server reports a terminal result it did not send (cancellation).
    #[prost(message, optional, tag = "1")]
    pub state: ::core::option::Option<TaskState>,
    /// Output keys the server has accepted so far.
    #[prost(string, repeated, tag = "2")]
    pub sent_outputs: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

/// One log line.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogRow {
    /// Unix seconds when the row was produced.
    #[prost(int64, tag = "1")]
    pub time: i64,
    #[prost(string, tag = "2")]
    pub content: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateLogRequest {
    #[prost(int64, tag = "1")]
    pub task_id: i64,
    /// Row number of `rows[0]`.
    #[prost(int64, tag = "2")]
    pub index: i64,
    #[prost(message, repeated, tag = "3")]
    pub rows: ::prost::alloc::vec::Vec<LogRow>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateLogResponse {
    /// Number of rows the server has durably appended. The runner resends
    /// from this index when it does not match its own counter.
    #[prost(int64, tag = "1")]
    pub ack_index: i64,
}

/// Structured error returned instead of a method response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcError {
    #[prost(string, tag = "1")]
    pub code: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

/// Envelope for every runner-service call.
///
/// `uuid` and `token` authenticate the runner for all methods except
/// `Register`, which instead carries a registration token in its body.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcRequest {
    #[prost(string, tag = "1")]
    pub uuid: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub token: ::prost::alloc::string::String,
    #[prost(oneof = "rpc_request::Request", tags = "3, 4, 5, 6, 7")]
    pub request: ::core::option::Option<rpc_request::Request>,
}

/// Nested types for [`RpcRequest`].
pub mod rpc_request {
    /// The method-specific request payload.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "3")]
        Register(super::RegisterRequest),
        #[prost(message, tag = "4")]
        Declare(super::DeclareRequest),
        #[prost(message, tag = "5")]
        FetchTask(super::FetchTaskRequest),
        #[prost(message, tag = "6")]
        UpdateTask(super::UpdateTaskRequest),
        #[prost(message, tag = "7")]
        UpdateLog(super::UpdateLogRequest),
    }
}

/// Envelope for every runner-service response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcResponse {
    #[prost(oneof = "rpc_response::Response", tags = "1, 2, 3, 4, 5, 6")]
    pub response: ::core::option::Option<rpc_response::Response>,
}

/// Nested types for [`RpcResponse`].
pub mod rpc_response {
    /// The method-specific response payload, or an error.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Response {
        #[prost(message, tag = "1")]
        Register(super::RegisterResponse),
        #[prost(message, tag = "2")]
        Declare(super::DeclareResponse),
        #[prost(message, tag = "3")]
        FetchTask(super::FetchTaskResponse),
        #[prost(message, tag = "4")]
        UpdateTask(super::UpdateTaskResponse),
        #[prost(message, tag = "5")]
        UpdateLog(super::UpdateLogResponse),
        #[prost(message, tag = "6")]
        Error(super::RpcError),
    }
}
