// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface for OIDC: discovery, the JWKS, and the ID-token endpoint
//! runners call mid-job with their runtime token.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::ActionsError;
use crate::oidc::IdTokenSigner;
use crate::persistence::Persistence;
use crate::status::Status;
use crate::token::TokenService;

/// Shared state for the OIDC routes.
#[derive(Clone)]
pub struct HttpState {
    pub db: Arc<dyn Persistence>,
    pub tokens: TokenService,
    pub signer: Arc<IdTokenSigner>,
    /// Base URL of the installation, without a trailing slash.
    pub app_url: String,
}

/// Routes rooted at `/api/actions`, matching the token issuer.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route(
            "/api/actions/.well-known/openid-configuration",
            get(openid_configuration),
        )
        .route("/api/actions/.well-known/keys", get(keys))
        .route(
            "/api/actions/_apis/pipelines/workflows/{run_id}/idtoken",
            get(id_token),
        )
        .route("/api/actions/healthz", get(healthz))
        .with_state(state)
}

async fn openid_configuration(State(state): State<HttpState>) -> Json<Value> {
    Json(state.signer.discovery())
}

async fn keys(State(state): State<HttpState>) -> Json<Value> {
    Json(state.signer.jwks())
}

async fn healthz(State(state): State<HttpState>) -> Response {
    match state.db.health_check_db().await {
        Ok(true) => (StatusCode::OK, Json(json!({"status": "ok"}))).into_response(),
        _ => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable"})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct IdTokenQuery {
    audience: Option<String>,
}

/// Mint an ID token for a running task.
///
/// The caller authenticates with its runtime token as a bearer. The token
/// must carry the `generate_id_token` scope for exactly the run in the path,
/// and the task must still be running.
async fn id_token(
    State(state): State<HttpState>,
    Path(run_id): Path<i64>,
    Query(query): Query<IdTokenQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>, HttpError> {
    let bearer = bearer_token(&headers).ok_or(ActionsError::BadAuthorization)?;
    let claims = state.tokens.verify(bearer)?;

    if !claims.can_generate_id_token() {
        return Err(ActionsError::BadAuthorization.into());
    }
    if claims.run_id != run_id {
        return Err(ActionsError::RunMismatch {
            requested: run_id,
            actual: claims.run_id,
        }
        .into());
    }

    let task = state
        .db
        .get_task(claims.task_id)
        .await?
        .ok_or(ActionsError::TaskNotFound {
            task_id: claims.task_id,
        })?;
    if Status::parse(&task.status) != Status::Running {
        return Err(ActionsError::TaskNotRunning { task_id: task.id }.into());
    }

    let run = state
        .db
        .get_run(run_id)
        .await?
        .ok_or(ActionsError::RunNotFound { run_id })?;

    let sub = claims.oidc_sub.unwrap_or_default();
    let extra: serde_json::Map<String, Value> = claims
        .oidc_extra
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    let audience = query
        .audience
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| format!("{}/{}", state.app_url, run.owner_id));

    let token = state.signer.create_id_token(&sub, &audience, &extra)?;
    debug!(run_id, task_id = task.id, "issued id token");

    Ok(Json(json!({ "value": token })))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Maps domain errors onto HTTP status codes.
struct HttpError(ActionsError);

impl From<ActionsError> for HttpError {
    fn from(e: ActionsError) -> Self {
        Self(e)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(json!({
                "code": self.0.error_code(),
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}
