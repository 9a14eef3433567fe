//! REST endpoints for submitting and auditing workflows.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::TenantDefaults;
use crate::error::PipelineError;
use crate::pipeline::controller::{CancelToken, Orchestrator};
use crate::pipeline::ingest::IncomingMessageRequest;
use crate::store::WorkflowFilter;
use crate::workflow::WorkflowStatus;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Policy applied when a request omits tenant configuration.
    pub tenant_defaults: Arc<TenantDefaults>,
    /// Tripped on shutdown; in-flight runs stop at the next stage boundary.
    pub cancel: CancelToken,
}

/// Build the router with workflow and health routes.
pub fn workflow_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/workflows", get(list_workflows))
        .route("/workflows/incoming-message", post(incoming_message))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/close", post(close_workflow))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// Pipeline errors rendered as JSON responses.
pub struct ApiError {
    status: StatusCode,
    body: serde_json::Value,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: serde_json::json!({"error": message.into()}),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::Validation(fields) => {
                let fields: Vec<serde_json::Value> = fields
                    .iter()
                    .map(|f| serde_json::json!({"field": f.field, "message": f.message}))
                    .collect();
                return Self {
                    status: StatusCode::BAD_REQUEST,
                    body: serde_json::json!({"error": "validation failed", "fields": fields}),
                };
            }
            PipelineError::NotFound { .. } => StatusCode::NOT_FOUND,
            PipelineError::StaleWrite { .. } | PipelineError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            PipelineError::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Persistence { .. } | PipelineError::InvariantBreach(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            body: serde_json::json!({"error": err.to_string()}),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "ops-desk",
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Workflows ───────────────────────────────────────────────────────────

async fn incoming_message(
    State(state): State<AppState>,
    Json(request): Json<IncomingMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let payload = request.into_payload(&state.tenant_defaults).inspect_err(|e| {
        warn!(error = %e, "Rejected incoming message");
    })?;
    let workflow_id = payload.workflow_id;
    info!(
        workflow_id = %workflow_id,
        tenant_id = %payload.tenant_id,
        correlation_id = %payload.correlation_id,
        "Incoming message accepted"
    );

    // Detached so a dropped connection does not abandon a run mid-stage.
    let orchestrator = Arc::clone(&state.orchestrator);
    let cancel = state.cancel.clone();
    let result = tokio::spawn(async move { orchestrator.run(payload, &cancel).await })
        .await
        .map_err(|e| {
            error!(workflow_id = %workflow_id, error = %e, "Workflow task panicked");
            PipelineError::InvariantBreach(format!("workflow {workflow_id} task failed: {e}"))
        })??;

    Ok(Json(result))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let payload = state.orchestrator.get(id).await?;
    Ok(Json(payload))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    tenant_id: Option<String>,
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_workflows(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let status = params
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<WorkflowStatus>)
        .transpose()
        .map_err(ApiError::bad_request)?;

    let mut filter = WorkflowFilter {
        tenant_id: params.tenant_id.filter(|t| !t.is_empty()),
        status,
        ..Default::default()
    };
    if let Some(limit) = params.limit {
        filter.limit = limit;
    }

    let workflows = state.orchestrator.list(&filter).await?;
    Ok(Json(serde_json::json!({
        "count": workflows.len(),
        "workflows": workflows,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct CloseRequest {
    reason: Option<String>,
}

async fn close_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<CloseRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let reason = body.and_then(|Json(b)| b.reason);
    let payload = state.orchestrator.close(id, reason).await?;
    Ok(Json(serde_json::json!({
        "workflow_id": payload.workflow_id,
        "status": payload.status,
    })))
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request("Invalid workflow ID"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FieldError;

    fn status_of(err: PipelineError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn pipeline_errors_map_to_status_codes() {
        assert_eq!(
            status_of(PipelineError::Validation(vec![FieldError::new("tenant_id", "is required")])),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(PipelineError::NotFound {
                workflow_id: "w".into()
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(PipelineError::StaleWrite {
                workflow_id: "w".into(),
                reason: "moved".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(PipelineError::InvalidTransition {
                workflow_id: "w".into(),
                from: WorkflowStatus::Received,
                to: WorkflowStatus::Closed,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(PipelineError::Cancelled {
                stage: "classify".into()
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(PipelineError::Persistence {
                attempts: 3,
                reason: "locked".into()
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn validation_body_lists_fields() {
        let err = ApiError::from(PipelineError::Validation(vec![
            FieldError::new("contact.email", "is required"),
            FieldError::new("tenant_config.escalation_threshold", "must be within [0, 1]"),
        ]));
        assert_eq!(err.body["fields"].as_array().unwrap().len(), 2);
        assert_eq!(err.body["fields"][0]["field"], "contact.email");
    }

    #[test]
    fn malformed_id_is_bad_request() {
        let err = parse_id("not-a-uuid").err().unwrap();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
