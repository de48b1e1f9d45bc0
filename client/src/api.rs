//! HTTP control surface: trigger input, model list and the render state.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::controller::{ControllerHandle, TriggerReply};
use crate::ClientError;

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    controller: ControllerHandle,
    models: Vec<String>,
}

impl AppState {
    pub fn new(controller: ControllerHandle, models: Vec<String>) -> Self {
        Self { controller, models }
    }

    fn check_model(&self, model: &str) -> Result<(), Response> {
        if self.models.iter().any(|m| m == model) {
            return Ok(());
        }
        warn!(model, "rejecting unknown model");
        Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("unknown model '{model}'"), "models": self.models })),
        )
            .into_response())
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CaptureRequest {
    #[serde(rename = "modelType")]
    model_type: String,
}

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    active: bool,
    #[serde(rename = "modelType")]
    model_type: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /health
async fn health() -> &'static str {
    "ok"
}

/// GET /models — model tags the capture form offers
async fn list_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.models.clone())
}

/// POST /capture — press the capture button
/// Body: { "modelType": "general" }
async fn capture(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CaptureRequest>,
) -> Response {
    if let Err(rejection) = state.check_model(&body.model_type) {
        return rejection;
    }
    info!(model = %body.model_type, "capture requested");
    trigger_response(state.controller.capture(body.model_type).await)
}

/// POST /trigger — raw trigger level
/// Body: { "active": true, "modelType": "general" }
async fn set_trigger(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TriggerRequest>,
) -> Response {
    if let Some(model) = body.model_type.as_deref() {
        if let Err(rejection) = state.check_model(model) {
            return rejection;
        }
    }
    trigger_response(state.controller.trigger(body.active, body.model_type).await)
}

/// POST /source/retry
async fn retry_source(State(state): State<Arc<AppState>>) -> Response {
    match state.controller.retry_source().await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => unavailable(e),
    }
}

/// GET /state
async fn view_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.view())
}

/// GET /frames/:index — JPEG bytes of a captured input frame
async fn frame(State(state): State<Arc<AppState>>, Path(index): Path<usize>) -> Response {
    let view = state.controller.view();
    match view.frames.as_ref().and_then(|batch| batch.get(index)) {
        Some(frame) => (
            [(header::CONTENT_TYPE, frame.encoding().mime_type())],
            frame.data().clone(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn trigger_response(reply: Result<TriggerReply, ClientError>) -> Response {
    match reply {
        Ok(reply @ TriggerReply::Busy) => (StatusCode::CONFLICT, Json(reply)).into_response(),
        Ok(reply) => Json(reply).into_response(),
        Err(e) => unavailable(e),
    }
}

fn unavailable(e: ClientError) -> Response {
    warn!(error = %e, "controller unavailable");
    (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/models", get(list_models))
        .route("/capture", post(capture))
        .route("/trigger", post(set_trigger))
        .route("/source/retry", post(retry_source))
        .route("/state", get(view_state))
        .route("/frames/:index", get(frame))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
