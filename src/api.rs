//! HTTP trigger surface. Every trigger authenticates first, then answers
//! `202 Accepted` while the work continues on a detached task.
use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{AdminAuth, Unauthorized};
use crate::model::{is_valid_location_id, RunStatus, RunType};
use crate::runner::TaskRunner;
use crate::status;

#[derive(Clone)]
pub struct AppState {
    runner: TaskRunner,
    auth: AdminAuth,
}

impl AppState {
    pub fn new(runner: TaskRunner, auth: AdminAuth) -> Self {
        Self { runner, auth }
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        self.auth.authorize(header).map_err(ApiError::from)
    }
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<Unauthorized> for ApiError {
    fn from(_: Unauthorized) -> Self {
        ApiError::Unauthorized
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub status: &'static str,
    pub run_id: Uuid,
    pub scope: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    pub force: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/photos/migrate", post(trigger_catalog))
        .route("/api/photos/status", get(run_status))
        .route("/api/locations/{id}/photos", post(trigger_location))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn trigger_catalog(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<TriggerParams>,
) -> Result<impl IntoResponse, ApiError> {
    if let Err(err) = state.authorize(&headers) {
        warn!("rejected catalog trigger: unauthorized");
        return Err(err);
    }
    let run = state.runner.spawn_catalog_run(RunType::Manual, params.force);
    info!(run_id = %run.run_id, force = params.force, "catalog run accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            run_id: run.run_id,
            scope: "catalog",
            location_id: None,
            force: params.force,
        }),
    ))
}

async fn trigger_location(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(params): Query<TriggerParams>,
) -> Result<impl IntoResponse, ApiError> {
    if let Err(err) = state.authorize(&headers) {
        warn!("rejected location trigger: unauthorized");
        return Err(err);
    }
    let id = id.trim().to_string();
    if !is_valid_location_id(&id) {
        return Err(ApiError::BadRequest(format!("invalid location id: {id:?}")));
    }
    let run = state.runner.spawn_location_run(id.clone(), params.force);
    info!(run_id = %run.run_id, location_id = %id, force = params.force, "location run accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            run_id: run.run_id,
            scope: "location",
            location_id: Some(id),
            force: params.force,
        }),
    ))
}

async fn run_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RunStatus>, ApiError> {
    state.authorize(&headers)?;
    match status::read_status(state.runner.pipeline().pool()).await {
        Ok(Some(status)) => Ok(Json(status)),
        Ok(None) => Err(ApiError::NotFound("no run recorded yet".into())),
        Err(err) => {
            error!(?err, "failed to read run status");
            Err(ApiError::Internal("failed to read run status".into()))
        }
    }
}
