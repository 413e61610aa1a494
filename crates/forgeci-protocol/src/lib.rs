// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Forgeci Protocol - QUIC + Protobuf communication layer
//!
//! This crate provides the wire protocol between runners and the Actions
//! server. Each QUIC stream carries one RPC call: a length-prefixed
//! protobuf [`runner_proto::RpcRequest`] followed by one
//! [`runner_proto::RpcResponse`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    forgeci-protocol                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC Layer: Request/Response envelopes (oneof routing)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn)                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Runner service
//!
//! | Method | Description |
//! |--------|-------------|
//! | `Register` | Exchange a registration token for runner credentials |
//! | `Declare` | Update a runner's labels and version |
//! | `FetchTask` | Poll for pending tasks (idempotent via request key) |
//! | `UpdateTask` | Report task state, steps and outputs |
//! | `UpdateLog` | Stream log rows (ack protocol) |
//!
//! # Usage
//!
//! ```ignore
//! use forgeci_protocol::{RunnerClient, runner_proto};
//!
//! let client = RunnerClient::localhost("127.0.0.1:8088".parse()?)?;
//! let response = client
//!     .call(
//!         "",
//!         "",
//!         runner_proto::rpc_request::Request::Register(runner_proto::RegisterRequest {
//!             token: "registration-token".into(),
//!             name: "my-runner".into(),
//!             version: "1.0.0".into(),
//!             labels: vec!["ubuntu-latest".into()],
//!             ephemeral: false,
//!         }),
//!     )
//!     .await?;
//! ```

pub mod client;
pub mod frame;
pub mod runner_proto;
pub mod server;

// Re-export main types
pub use client::{ClientError, RunnerClient, RunnerClientConfig};
pub use frame::{Frame, FrameError, MessageType};
pub use server::{ConnectionHandler, ForgeServer, ForgeServerConfig, ServerError, StreamHandler};
