//! HTTP transport for gnomestep.
//!
//! Routes:
//! - `GET /step` advances the session's active model by one step.
//! - `GET /rewind` resets it.
//! - `GET|PUT|DELETE /model` reads, installs or removes the active model.
//!
//! The caller's session comes from the `x-session-id` header; without it the
//! process default session is used. Orchestrator calls block on the step gate
//! and on replica workers, so every handler runs them on the blocking pool
//! under the configured request timeout. A request that times out leaves its
//! blocking task running; the gate is released when that task finishes.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::error::{Diagnostic, GnomeError, GnomeResult, ValidationError};
use crate::model::reference::{ReferenceModel, ReferenceModelConfig, ReferenceUncertainty};
use crate::orchestrator::StepOrchestrator;
use crate::output::StepResponse;
use crate::session::{ActiveModel, ModelSummary, SessionId};

/// Header carrying the caller's session id.
pub const SESSION_HEADER: &str = "x-session-id";

/// Builds an active model from a `PUT /model` request body.
pub trait ModelFactory: Send + Sync {
    /// Build a model from `body`. An empty body selects the factory defaults.
    ///
    /// # Errors
    /// - `Validation` if the body does not describe a valid model.
    fn build(&self, body: &[u8]) -> GnomeResult<ActiveModel>;
}

/// Factory for reference models configured by a JSON `ReferenceModelConfig`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceModelFactory;

impl ModelFactory for ReferenceModelFactory {
    fn build(&self, body: &[u8]) -> GnomeResult<ActiveModel> {
        let config: ReferenceModelConfig = if body.iter().all(u8::is_ascii_whitespace) {
            ReferenceModelConfig::default()
        } else {
            serde_json::from_slice(body).map_err(|e| ValidationError::InvalidModelConfig {
                reason: format!("invalid model JSON: {e}"),
            })?
        };
        let model = ReferenceModel::new(config.clone())?;
        Ok(ActiveModel::new(
            Box::new(model),
            Arc::new(ReferenceUncertainty::new(config)),
        ))
    }
}

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<StepOrchestrator>,
    factory: Arc<dyn ModelFactory>,
    request_timeout: Duration,
}

impl AppState {
    /// Bundle the orchestrator, the model factory and the per-request timeout.
    #[must_use]
    pub fn new(
        orchestrator: Arc<StepOrchestrator>,
        factory: Arc<dyn ModelFactory>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            factory,
            request_timeout,
        }
    }
}

/// Build the router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/step", get(step))
        .route("/rewind", get(rewind))
        .route(
            "/model",
            get(model_summary).put(install_model).delete(remove_model),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn step(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StepResponse>, ApiError> {
    let session = session_from_headers(&headers)?;
    let orchestrator = Arc::clone(&state.orchestrator);
    let response = run_blocking(state.request_timeout, move || {
        orchestrator.advance_step(session)
    })
    .await?;
    Ok(Json(response))
}

async fn rewind(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode, ApiError> {
    let session = session_from_headers(&headers)?;
    let orchestrator = Arc::clone(&state.orchestrator);
    run_blocking(state.request_timeout, move || orchestrator.rewind(session)).await?;
    Ok(StatusCode::OK)
}

async fn model_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ModelSummary>, ApiError> {
    let session = session_from_headers(&headers)?;
    let orchestrator = Arc::clone(&state.orchestrator);
    let summary = run_blocking(state.request_timeout, move || {
        let active = orchestrator
            .registry()
            .active_model(session)
            .ok_or(GnomeError::PreconditionFailed)?;
        active.summary(orchestrator.config().gate_timeout())
    })
    .await?;
    Ok(Json(summary))
}

async fn install_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<ModelSummary>), ApiError> {
    let session = session_from_headers(&headers)?;
    let orchestrator = Arc::clone(&state.orchestrator);
    let factory = Arc::clone(&state.factory);
    let summary = run_blocking(state.request_timeout, move || {
        let model = factory.build(&body)?;
        let active = orchestrator.registry().set_active_model(session, model)?;
        active.summary(orchestrator.config().gate_timeout())
    })
    .await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn remove_model(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let session = session_from_headers(&headers)?;
    let orchestrator = Arc::clone(&state.orchestrator);
    // Dropping the last reference joins replica workers, so this blocks too.
    run_blocking(state.request_timeout, move || {
        orchestrator
            .registry()
            .remove_active_model(session)
            .map(drop)
            .ok_or(GnomeError::PreconditionFailed)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

fn session_from_headers(headers: &HeaderMap) -> Result<SessionId, ApiError> {
    let Some(value) = headers.get(SESSION_HEADER) else {
        return Ok(SessionId::default_session());
    };
    let value = value.to_str().map_err(|_| {
        GnomeError::from(ValidationError::InvalidSessionId {
            value: "<non-ascii>".to_string(),
        })
    })?;
    value
        .parse::<SessionId>()
        .map_err(|e| ApiError(GnomeError::from(e)))
}

async fn run_blocking<T, F>(timeout: Duration, f: F) -> GnomeResult<T>
where
    F: FnOnce() -> GnomeResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(GnomeError::internal(format!("request task failed: {join}"))),
        Err(_) => Err(GnomeError::timeout(timeout)),
    }
}

/// Maps an error to its HTTP status.
#[must_use]
pub fn status_for(err: &GnomeError) -> StatusCode {
    match err {
        GnomeError::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
        GnomeError::NotFound { .. } => StatusCode::NOT_FOUND,
        GnomeError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
        GnomeError::Timeout { .. } | GnomeError::SessionLimit { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        GnomeError::Validation(_) => StatusCode::BAD_REQUEST,
        GnomeError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn code_for(err: &GnomeError) -> &'static str {
    match err {
        GnomeError::PreconditionFailed => "precondition_failed",
        GnomeError::NotFound { .. } => "not_found",
        GnomeError::Unprocessable(_) => "unprocessable",
        GnomeError::Timeout { .. } => "timeout",
        GnomeError::SessionLimit { .. } => "session_limit",
        GnomeError::Validation(_) => "invalid_request",
        GnomeError::Internal { .. } => "internal",
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: &'static str,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    diagnostic: Option<&'a Diagnostic>,
}

/// A `GnomeError` rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub GnomeError);

impl From<GnomeError> for ApiError {
    fn from(err: GnomeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = ErrorBody {
            code: code_for(&self.0),
            message: self.0.to_string(),
            retryable: self.0.is_retryable(),
            diagnostic: self.0.diagnostic(),
        };
        (status, Json(body)).into_response()
    }
}
