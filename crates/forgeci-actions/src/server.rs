// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC runner service: decodes request frames, authenticates, and routes
//! to the registry, dispatcher, and lifecycle.
//!
//! Every method except `Register` requires the runner's UUID and secret
//! token in the request envelope. Errors travel back as an `Error` variant
//! in the response oneof, so the stream protocol itself never fails on a
//! domain error.

use std::sync::Arc;

use forgeci_protocol::frame::Frame;
use forgeci_protocol::runner_proto::{
    DeclareResponse, RegisterResponse, Runner, RpcRequest, RpcResponse, rpc_request, rpc_response,
};
use forgeci_protocol::server::{ConnectionHandler, ForgeServer, StreamHandler};
use tracing::{debug, instrument, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{ActionsError, Result};
use crate::lifecycle::Lifecycle;
use crate::persistence::RunnerRecord;
use crate::registry::RunnerRegistry;

/// Routes runner-service calls to the engine components.
pub struct RunnerService {
    registry: Arc<RunnerRegistry>,
    dispatcher: Arc<Dispatcher>,
    lifecycle: Arc<Lifecycle>,
}

impl RunnerService {
    pub fn new(
        registry: Arc<RunnerRegistry>,
        dispatcher: Arc<Dispatcher>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            lifecycle,
        }
    }

    /// Accept connections until the endpoint closes.
    pub async fn serve(self: Arc<Self>, server: ForgeServer) {
        let service = self.clone();
        let result = server
            .run(move |connection: ConnectionHandler| {
                let service = service.clone();
                async move {
                    connection
                        .run(move |stream| {
                            let service = service.clone();
                            async move { service.handle_stream(stream).await }
                        })
                        .await;
                }
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "runner service stopped");
        }
    }

    /// One request/response exchange per stream.
    async fn handle_stream(&self, mut stream: StreamHandler) {
        let request = match stream.read_frame().await {
            Ok(frame) => match frame.decode::<RpcRequest>() {
                Ok(request) => request,
                Err(e) => {
                    debug!(error = %e, "undecodable request frame");
                    return;
                }
            },
            Err(e) => {
                debug!(error = %e, "failed to read request frame");
                return;
            }
        };

        let response = self.handle(request).await;
        match Frame::response(&response) {
            Ok(frame) => {
                if let Err(e) = stream.write_frame(&frame).await {
                    debug!(error = %e, "failed to write response frame");
                    return;
                }
                if let Err(e) = stream.finish() {
                    debug!(error = %e, "failed to finish stream");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode response frame"),
        }
    }

    /// Dispatch one envelope. Domain errors become an `Error` response.
    #[instrument(skip_all)]
    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let response = match self.route(request).await {
            Ok(response) => response,
            Err(e) => rpc_response::Response::Error(e.to_rpc_error()),
        };
        RpcResponse {
            response: Some(response),
        }
    }

    async fn route(&self, request: RpcRequest) -> Result<rpc_response::Response> {
        let body = request.request.ok_or_else(|| ActionsError::ValidationError {
            field: "request".to_string(),
            message: "missing request body".to_string(),
        })?;

        // Register is the only unauthenticated method.
        if let rpc_request::Request::Register(register) = &body {
            let registration = self
                .registry
                .register(
                    &register.token,
                    &register.name,
                    &register.version,
                    &register.labels,
                    register.ephemeral,
                )
                .await?;
            return Ok(rpc_response::Response::Register(RegisterResponse {
                runner: Some(to_proto_runner(
                    &registration.runner,
                    &registration.secret_token,
                )),
            }));
        }

        let runner = self
            .registry
            .authenticate(&request.uuid, &request.token)
            .await?;

        match body {
            rpc_request::Request::Register(_) => unreachable!("handled above"),
            rpc_request::Request::Declare(declare) => {
                self.registry
                    .declare(&runner, &declare.labels, &declare.version)
                    .await?;
                let mut proto = to_proto_runner(&runner, "");
                proto.labels = declare.labels;
                proto.version = declare.version;
                Ok(rpc_response::Response::Declare(DeclareResponse {
                    runner: Some(proto),
                }))
            }
            rpc_request::Request::FetchTask(fetch) => {
                let response = self
                    .dispatcher
                    .fetch_tasks(
                        &runner,
                        fetch.tasks_version,
                        fetch.task_capacity,
                        &fetch.request_key,
                    )
                    .await?;
                Ok(rpc_response::Response::FetchTask(response))
            }
            rpc_request::Request::UpdateTask(update) => {
                let response = self.lifecycle.update_task(&runner, update).await?;
                Ok(rpc_response::Response::UpdateTask(response))
            }
            rpc_request::Request::UpdateLog(update) => {
                let response = self.lifecycle.update_log(&runner, update).await?;
                Ok(rpc_response::Response::UpdateLog(response))
            }
        }
    }
}

/// Wire shape of a runner. The secret token rides along only on
/// registration; every other path passes an empty string.
fn to_proto_runner(record: &RunnerRecord, secret_token: &str) -> Runner {
    Runner {
        id: record.id,
        uuid: record.uuid.clone(),
        token: secret_token.to_string(),
        name: record.name.clone(),
        version: record.version.clone(),
        labels: record.label_list(),
        ephemeral: record.ephemeral,
    }
}
