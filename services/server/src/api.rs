use crate::capture::CaptureError;
use crate::classification::{Classification, ClassifierError};
use crate::config::ApiConfig;
use crate::event_store::{ClassificationEvent, EventQuery, LabelCount};
use crate::handler::{HandlerError, RequestHandler};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use halo_protocol::{ErrorBody, Label};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Largest image accepted by the ad-hoc classification endpoint.
const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Largest page of events returned at once.
const MAX_EVENT_LIMIT: i64 = 500;

type ApiError = (StatusCode, Json<ErrorBody>);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub handler: RequestHandler,
    pub service_name: String,
}

/// Query parameters for the event list
#[derive(Debug, Deserialize)]
pub struct EventListQuery {
    /// Filter by label
    pub label: Option<Label>,
    /// Only events at or after this time (ISO 8601)
    pub since: Option<DateTime<Utc>>,
    /// Maximum results
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// Event list response
#[derive(Debug, Serialize, Deserialize)]
pub struct EventListResponse {
    pub events: Vec<ClassificationEvent>,
    pub count: usize,
}

/// Query parameters for the event summary
#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub since: Option<DateTime<Utc>>,
}

/// Per-label totals
#[derive(Debug, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub since: Option<DateTime<Utc>>,
    pub counts: Vec<LabelCount>,
    pub total: i64,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/run", post(run_trigger))
        .route("/api/v1/events", get(list_events))
        .route("/api/v1/events/summary", get(event_summary))
        .route(
            "/api/v1/classify",
            post(classify_upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorBody::new(message)))
}

/// Bare liveness probe used by the edge at start-up
async fn root() -> &'static str {
    "ok"
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.service_name
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.handler.store().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "store": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Trigger a capture and classification; replies with the sort token
async fn run_trigger(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    match state.handler.handle(&body).await {
        Ok(reply) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            reply.token(),
        )),
        Err(e) => {
            let status = match &e {
                HandlerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                HandlerError::Capture(CaptureError::Busy) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Err(error_response(status, e.public_message()))
        }
    }
}

/// List recent classification events
#[instrument(skip(state))]
async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventListQuery>,
) -> Result<Json<EventListResponse>, ApiError> {
    if params.limit <= 0 {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "limit must be positive",
        ));
    }

    let query = EventQuery {
        label: params.label,
        since: params.since,
        limit: Some(params.limit.min(MAX_EVENT_LIMIT)),
    };

    let events = state.handler.store().query(&query).await.map_err(|e| {
        error!(error = %e, "Failed to query events");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to query events")
    })?;

    Ok(Json(EventListResponse {
        count: events.len(),
        events,
    }))
}

/// Count events per label
#[instrument(skip(state))]
async fn event_summary(
    State(state): State<AppState>,
    Query(params): Query<SummaryQuery>,
) -> Result<Json<SummaryResponse>, ApiError> {
    let counts = state
        .handler
        .store()
        .summary(params.since)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to summarize events");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to summarize events")
        })?;

    Ok(Json(SummaryResponse {
        since: params.since,
        total: counts.iter().map(|c| c.count).sum(),
        counts,
    }))
}

/// Classify an uploaded image without touching the camera or the store
#[instrument(skip(state, body), fields(size = body.len()))]
async fn classify_upload(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Classification>, ApiError> {
    if body.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "Empty image upload"));
    }

    state
        .handler
        .classification()
        .classify_bytes(&body)
        .await
        .map(Json)
        .map_err(|e| match e {
            ClassifierError::Decode(_) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
            _ => {
                error!(error = %e, "Ad-hoc classification failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        })
}

/// Serve `router` on an already bound listener until `shutdown` is cancelled
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}

/// Start the classification API server
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting classification API server");

    let listener = TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    serve(listener, router, shutdown).await
}
