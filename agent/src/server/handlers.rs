//! HTTP request handlers

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::AgentError;
use crate::ledger::filter::LedgerFilter;
use crate::models::deployment::DeploymentResult;
use crate::server::state::ServerState;
use crate::trigger::receiver::TriggerEvent;
use crate::trigger::webhook::{PushEvent, EVENT_HEADER, SIGNATURE_HEADER};
use crate::utils::version_info;

/// Error body returned by every failing handler
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// An error with the status code it is reported under
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn forbidden(err: AgentError) -> Self {
        Self::new(StatusCode::FORBIDDEN, err.to_string())
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        let status = match &err {
            AgentError::InvalidTrigger(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AgentError::AuthError(_) => StatusCode::FORBIDDEN,
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentError::ServerError(_) | AgentError::ShutdownError(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "rollout".to_string(),
        version: version.version,
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Accepted trigger response
#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub request_id: String,
}

/// Webhook acknowledged without deploying
#[derive(Debug, Serialize, Deserialize)]
pub struct IgnoredResponse {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct PushQuery {
    pub host: Option<String>,
}

/// Push webhook handler
pub async fn push_hook_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<PushQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let receiver = state.deployer.receiver();
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    receiver
        .verify_push_signature(&body, signature)
        .map_err(ApiError::forbidden)?;

    let event = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("push");
    if event != "push" {
        info!("Ignoring {} webhook event", event);
        let status = if event == "ping" { "pong" } else { "ignored" };
        return Ok((
            StatusCode::OK,
            Json(IgnoredResponse {
                status: status.to_string(),
            }),
        )
            .into_response());
    }

    let payload = PushEvent::from_slice(&body)?;
    let request = state.deployer.accept(TriggerEvent::Push {
        payload,
        target_host: query.host,
    })?;
    let request_id = request.request_id().to_string();
    state.queue.submit(request)?;

    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { request_id })).into_response())
}

/// Manual deployment request body
#[derive(Debug, Serialize, Deserialize)]
pub struct ManualDeployBody {
    #[serde(rename = "ref")]
    pub source_ref: String,
    pub actor: String,
    pub target_host: String,
}

/// Manual deployment handler
pub async fn manual_deploy_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<ManualDeployBody>,
) -> Result<impl IntoResponse, ApiError> {
    require_token(&state, &headers)?;

    let request = state.deployer.accept(TriggerEvent::Manual {
        source_ref: body.source_ref,
        actor: body.actor,
        target_host: body.target_host,
    })?;
    let request_id = request.request_id().to_string();
    state.queue.submit(request)?;

    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { request_id })))
}

/// Deployment history handler
pub async fn deployments_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(filter): Query<LedgerFilter>,
) -> Result<Json<Vec<DeploymentResult>>, ApiError> {
    require_token(&state, &headers)?;
    let results = state.deployer.ledger().query_all(filter).await?;
    Ok(Json(results))
}

/// Single deployment handler
pub async fn deployment_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(request_id): Path<String>,
) -> Result<Json<DeploymentResult>, ApiError> {
    require_token(&state, &headers)?;
    match state.deployer.ledger().get(&request_id).await? {
        Some(result) => Ok(Json(result)),
        None => Err(AgentError::NotFound(format!("No deployment {}", request_id)).into()),
    }
}

/// Abort handler
pub async fn abort_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(request_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_token(&state, &headers)?;
    if state.deployer.abort(&request_id) {
        Ok(StatusCode::ACCEPTED)
    } else {
        warn!("Abort requested for {}, which is not running", request_id);
        Err(AgentError::NotFound(format!("Deployment {} is not in flight", request_id)).into())
    }
}

/// Reject the request unless it carries the configured API token
fn require_token(state: &ServerState, headers: &HeaderMap) -> Result<(), ApiError> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    state
        .deployer
        .receiver()
        .verify_api_token(authorization)
        .map_err(ApiError::forbidden)
}
