// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Forgeci Actions - CI/CD Execution Core
//!
//! This crate is the execution engine behind Actions workflows: it parses and
//! expands workflow files into job graphs, dispatches jobs to registered
//! runners over QUIC, tracks task progress and logs, and mints the runtime
//! and OIDC tokens jobs use to authenticate.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Forge                                 │
//! │              (webhooks, UI, repository storage)                  │
//! └─────────────────────────────────────────────────────────────────┘
//!                │ create/cancel/approve runs
//!                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      forgeci-actions                             │
//! │                                                                  │
//! │   workflow ──► runs ──► resolver ──► dispatcher ──► lifecycle    │
//! │   (parse,      (job     (blocked ►   (FetchTask)    (UpdateTask, │
//! │    expand)      graph)   waiting)                    UpdateLog)  │
//! │                                                                  │
//! │   registry (runners)   sweeper (repair)   oidc/token (identity)  │
//! └─────────────────────────────────────────────────────────────────┘
//!        │ QUIC (runner protocol)          │ HTTP (OIDC surface)
//!        ▼                                 ▼
//! ┌──────────────────────┐      ┌────────────────────────────┐
//! │       Runners        │      │  Cloud providers / STS     │
//! │  (poll, execute,     │      │  (verify ID tokens via     │
//! │   stream logs)       │      │   discovery + JWKS)        │
//! └──────────────────────┘      └────────────────────────────┘
//! ```
//!
//! # Runner Protocol
//!
//! Runners speak a five-method protocol over QUIC (one request/response
//! frame per stream):
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `Register` | Exchange a registration token for runner credentials |
//! | `Declare` | Update labels and version of a registered runner |
//! | `FetchTask` | Poll for work; idempotent via a client request key |
//! | `UpdateTask` | Report progress/outputs; doubles as the heartbeat |
//! | `UpdateLog` | Append log rows with at-least-once delivery |
//!
//! # Statuses
//!
//! Runs, jobs, tasks, and steps share one status set. Success, Failure,
//! Cancelled, and Skipped are terminal and never change once set.
//!
//! ```text
//!   ┌─────────┐  needs terminal   ┌─────────┐  claimed   ┌─────────┐
//!   │ BLOCKED │──────────────────►│ WAITING │───────────►│ RUNNING │
//!   └─────────┘   (condition ok)  └─────────┘            └─────────┘
//!        │                                                    │
//!        │ condition falsy / predecessor failed               │ reported
//!        ▼                                                    ▼
//!   ┌─────────┐                      ┌─────────────────────────────┐
//!   │ SKIPPED │                      │ SUCCESS / FAILURE / CANCELLED │
//!   └─────────┘                      └─────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`]: Server configuration from environment variables
//! - [`dispatcher`]: FetchTask handling and task payload assembly
//! - [`error`]: Error types with RPC error code and HTTP status mapping
//! - [`http`]: OIDC discovery, JWKS, and the ID-token endpoint
//! - [`lifecycle`]: UpdateTask/UpdateLog handling and task finalization
//! - [`logstore`]: Filesystem log storage (pending and archive areas)
//! - [`migrations`]: Embedded SQLite migrations
//! - [`oidc`]: ID-token signing key management and JWKS
//! - [`persistence`]: Persistence trait and the SQLite backend
//! - [`registry`]: Runner registration, authentication, and scopes
//! - [`resolver`]: Blocked-job transitions over the run's job graph
//! - [`runs`]: Run creation, advancement, cancellation, approval
//! - [`secrets`]: Encrypted secrets and plaintext variables
//! - [`server`]: QUIC runner service routing
//! - [`status`]: Shared status type
//! - [`sweeper`]: Background repair loops
//! - [`token`]: Runtime (HMAC) tokens scoped to one task
//! - [`workflow`]: Workflow parsing, expressions, matrix expansion

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod logstore;
pub mod migrations;
pub mod oidc;
pub mod persistence;
pub mod registry;
pub mod resolver;
pub mod runs;
pub mod secrets;
pub mod server;
pub mod status;
pub mod sweeper;
pub mod token;
pub mod workflow;
