//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, RawQuery, State,
    },
    http::{HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::deploy::fsm::DeploymentState;
use crate::errors::EngineError;
use crate::models::deployment::DeploymentSummary;
use crate::models::request::{DeployRequest, Environment, Runtime, ServiceType};
use crate::server::sse;
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Response header carrying the id of a deployment created by the streaming entry point
pub const DEPLOYMENT_ID_HEADER: HeaderName = HeaderName::from_static("x-deployment-id");

/// Error returned by handlers
///
/// Only request errors are described to the client; anything else is a
/// bare 500.
#[derive(Debug)]
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self.0 {
            EngineError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            EngineError::NotFound(msg) => (StatusCode::NOT_FOUND, format!("{} not found", msg)),
            other => {
                error!("Request failed: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub deployments: usize,
}

/// Health check handler
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "deployd".to_string(),
        version: version.version,
        deployments: state.registry.len(),
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

/// Response to a created deployment
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedResponse {
    pub id: String,
    pub state: DeploymentState,
    pub events_url: String,
}

/// Create a deployment from a JSON body
pub async fn create_handler(
    State(state): State<Arc<ServerState>>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) =
        payload.map_err(|e| EngineError::ValidationError(e.body_text()))?;

    let deployment = state.registry.create(request)?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse {
            id: deployment.id().to_string(),
            state: deployment.state(),
            events_url: format!("/deployments/{}/events", deployment.id()),
        }),
    ))
}

/// Query-string form of a deploy request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployQuery {
    #[serde(alias = "repo")]
    pub repository: String,
    pub branch: String,
    #[serde(default)]
    pub runtime: Option<Runtime>,
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub build_command: String,
    #[serde(default)]
    pub start_command: String,
    #[serde(default)]
    pub output_dir: String,
    #[serde(default)]
    pub service_type: Option<ServiceType>,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub git_url: Option<String>,
    /// Adds the event kind to every frame
    #[serde(default)]
    pub typed: Option<String>,
}

/// Query parameters of the events stream
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub typed: Option<String>,
}

/// A flag parameter is set when present and not explicitly false
fn flag(value: Option<&str>) -> bool {
    !matches!(value, None | Some("0" | "false" | "no"))
}

/// Environment passed as repeated `env=NAME=value` query parameters
fn query_environment(raw: Option<&str>) -> Result<Environment, EngineError> {
    let Some(raw) = raw else {
        return Ok(Environment::default());
    };
    url::form_urlencoded::parse(raw.as_bytes())
        .filter(|(key, _)| key == "env")
        .map(|(_, pair)| {
            pair.split_once('=')
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .ok_or_else(|| {
                    EngineError::ValidationError(format!(
                        "env parameter {:?} must have the form NAME=value",
                        pair
                    ))
                })
        })
        .collect()
}

impl From<DeployQuery> for DeployRequest {
    fn from(query: DeployQuery) -> Self {
        DeployRequest {
            repository: query.repository,
            branch: query.branch,
            runtime: query.runtime.unwrap_or(Runtime::Nodejs),
            install_command: query.install_command,
            build_command: query.build_command,
            start_command: query.start_command,
            output_dir: query.output_dir,
            environment: Environment::default(),
            service_type: query.service_type.unwrap_or(ServiceType::WebService),
            app_name: query.app_name,
            region: query.region,
            git_url: query.git_url,
        }
    }
}

/// Create a deployment from query parameters and stream its log right away
pub async fn deploy_stream_handler(
    State(state): State<Arc<ServerState>>,
    query: Result<Query<DeployQuery>, QueryRejection>,
    RawQuery(raw): RawQuery,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query.map_err(|e| EngineError::ValidationError(e.body_text()))?;
    let environment = query_environment(raw.as_deref())?;
    let framing = sse::Framing::from_flag(flag(query.typed.as_deref()));

    let mut request = DeployRequest::from(query);
    request.environment = environment;

    let deployment = state.registry.create(request)?;
    let subscription = deployment.subscribe(None);
    Ok((
        [(DEPLOYMENT_ID_HEADER, deployment.id().to_string())],
        sse::stream(subscription, framing),
    ))
}

/// List deployments, newest first
pub async fn list_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let summaries: Vec<DeploymentSummary> = state
        .registry
        .list()
        .iter()
        .map(|d| d.summary())
        .collect();
    Json(summaries)
}

/// Get one deployment
pub async fn get_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = state.registry.get(&id)?;
    Ok(Json(deployment.summary()))
}

/// Stream a deployment's log: retained history, then live events
pub async fn events_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    query: Result<Query<StreamQuery>, QueryRejection>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query.map_err(|e| EngineError::ValidationError(e.body_text()))?;
    let subscription = state
        .registry
        .subscribe(&id, sse::last_event_id(&headers))?;
    Ok(sse::stream(
        subscription,
        sse::Framing::from_flag(flag(query.typed.as_deref())),
    ))
}

/// Request cancellation of a deployment
pub async fn cancel_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = state.registry.cancel(&id)?;
    Ok((StatusCode::ACCEPTED, Json(deployment.summary())))
}
