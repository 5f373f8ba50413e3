// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP ingress: invoking workflows, posting events, cancelling instances,
//! and the callback sandboxes use to report asynchronous results.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::actions::ActionResultPayload;
use crate::engine::Engine;
use crate::error::{CoreError, EngineError};
use crate::events::CloudEvent;
use crate::persistence::InstanceRecord;

/// Error body returned by every endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Stable error code.
    pub code: String,
    /// Human readable message.
    pub message: String,
}

/// Engine error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::Core(e) => match e {
                CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                CoreError::AlreadyExists { .. }
                | CoreError::AlreadyUpdated { .. }
                | CoreError::InvalidInstanceState { .. } => StatusCode::CONFLICT,
                CoreError::ValidationError { .. } => StatusCode::BAD_REQUEST,
                CoreError::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
                CoreError::DatabaseError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            EngineError::Uncatchable { code, .. }
                if code == crate::error::codes::LIMITS_INSTANCES =>
            {
                StatusCode::TOO_MANY_REQUESTS
            }
            EngineError::Catchable { .. } | EngineError::Uncatchable { .. } => {
                StatusCode::BAD_REQUEST
            }
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorResponse {
        let code = match &self.0 {
            EngineError::Core(e) => e.error_code().to_string(),
            other => other.code().to_string(),
        };
        ErrorResponse {
            code,
            message: self.0.message(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

/// Body of `POST /instances/cancel`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    /// Instance to cancel.
    pub instance_id: String,
}

/// Body of `POST /actions/report`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    /// Instance waiting for the result.
    pub instance_id: String,
    /// Step the action was started from.
    pub step: i32,
    /// The result.
    #[serde(flatten)]
    pub payload: ActionResultPayload,
}

/// Summary returned after an invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResponse {
    /// New instance id.
    pub instance_id: String,
    /// Status at creation.
    pub status: String,
}

impl From<&InstanceRecord> for InvokeResponse {
    fn from(instance: &InstanceRecord) -> Self {
        Self {
            instance_id: instance.id.clone(),
            status: instance.status.to_string(),
        }
    }
}

/// Build the ingress router.
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/namespaces/{namespace}/workflows/{workflow}/invoke",
            post(invoke),
        )
        .route("/namespaces/{namespace}/events", post(broadcast))
        .route("/instances/cancel", post(cancel))
        .route("/actions/report", post(report))
        .with_state(engine)
}

/// Serve the ingress until `shutdown` is notified.
pub async fn serve(
    addr: SocketAddr,
    engine: Arc<Engine>,
    shutdown: Arc<Notify>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP ingress listening");
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await
}

async fn health(State(engine): State<Arc<Engine>>) -> Result<Json<Value>, ApiError> {
    engine.store().health_check().await?;
    Ok(Json(json!({ "status": "ok", "node": engine.node_id() })))
}

async fn invoke(
    State(engine): State<Arc<Engine>>,
    Path((namespace, workflow)): Path<(String, String)>,
    body: Option<Json<Value>>,
) -> Result<(StatusCode, Json<InvokeResponse>), ApiError> {
    let input = body.map(|Json(v)| v).unwrap_or_else(|| json!({}));
    let instance = engine.invoke(&namespace, &workflow, input).await?;
    Ok((StatusCode::ACCEPTED, Json(InvokeResponse::from(&instance))))
}

async fn broadcast(
    State(engine): State<Arc<Engine>>,
    Path(namespace): Path<String>,
    Json(event): Json<CloudEvent>,
) -> Result<Json<Value>, ApiError> {
    let fired = engine.broadcast_event(&namespace, event).await?;
    debug!(namespace = %namespace, fired, "Event accepted");
    Ok(Json(json!({ "fired": fired })))
}

async fn cancel(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<Value>, ApiError> {
    let cancelled = engine
        .cancel_instance(
            &request.instance_id,
            crate::error::codes::CANCELS_API,
            "cancelled by api",
        )
        .await?;
    Ok(Json(json!({ "cancelled": cancelled })))
}

async fn report(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<ReportRequest>,
) -> Result<StatusCode, ApiError> {
    engine
        .report_action_result(&request.instance_id, request.step, request.payload)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    #[test]
    fn test_error_status_mapping() {
        let missing = ApiError::from(CoreError::not_found("workflow", "ns/wf"));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(missing.body().code, "NOT_FOUND");

        let invalid = ApiError::from(CoreError::validation("start", "not a default start"));
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let limited = ApiError::from(EngineError::uncatchable(codes::LIMITS_INSTANCES, "slow down"));
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(limited.body().code, codes::LIMITS_INSTANCES);
        assert_eq!(limited.body().message, "slow down");
    }

    #[test]
    fn test_report_request_flattens_payload() {
        let request: ReportRequest = serde_json::from_value(json!({
            "instanceId": "ns/wf/abcdef",
            "step": 3,
            "actionId": "a-1",
            "errorCode": "app.failed",
            "errorMessage": "boom"
        }))
        .unwrap();
        assert_eq!(request.step, 3);
        assert_eq!(request.payload.action_id, "a-1");
        assert_eq!(request.payload.error_code.as_deref(), Some("app.failed"));
        assert!(request.payload.output.is_empty());
    }
}
