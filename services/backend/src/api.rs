use crate::codec::{CodecError, DeviceConfig, RiskClass};
use crate::config::ApiConfig;
use crate::publisher::{
    publish_device_config, CommandError, FeedPublisher, PublishError, CONFIG_SET_TOPIC,
};
use crate::store::{RiskEventRecord, SensorReadingRecord, StoreError, StoreStats, TelemetryStore};
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TelemetryStore>,
    pub publisher: Arc<dyn FeedPublisher>,
}

/// Risk event in API responses
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskEventResponse {
    pub id: i64,
    pub risk_level: u8,
    pub classification: RiskClass,
    pub recorded_at: DateTime<Utc>,
}

impl From<RiskEventRecord> for RiskEventResponse {
    fn from(r: RiskEventRecord) -> Self {
        Self {
            id: r.id,
            risk_level: r.risk_level,
            classification: r.level().class(),
            recorded_at: r.recorded_at,
        }
    }
}

/// Body of a `202 Accepted` config command
#[derive(Debug, Serialize)]
pub struct ConfigAccepted {
    pub status: &'static str,
    pub topic: &'static str,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Errors surfaced to API callers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid limit {0:?}: expected a non-negative integer")]
    InvalidLimit(String),

    #[error("Invalid config body: {0}")]
    InvalidConfigBody(String),

    #[error(transparent)]
    Encoding(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Encoding(e) => ApiError::Encoding(e),
            CommandError::Publish(e) => ApiError::Publish(e),
        }
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::InvalidLimit(_) => (StatusCode::BAD_REQUEST, "INVALID_LIMIT"),
            ApiError::InvalidConfigBody(_) => (StatusCode::BAD_REQUEST, "INVALID_CONFIG_BODY"),
            ApiError::Encoding(_) => (StatusCode::BAD_REQUEST, "ENCODING_OVERFLOW"),
            ApiError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
            ApiError::Publish(_) => (StatusCode::INTERNAL_SERVER_ERROR, "PUBLISH_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(error = %self, code, "Request failed");
        } else {
            warn!(error = %self, code, "Rejected request");
        }

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

fn parse_limit(raw: &str) -> Result<u64, ApiError> {
    raw.parse::<u64>()
        .map_err(|_| ApiError::InvalidLimit(raw.to_string()))
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([header::CONTENT_TYPE])
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(store_stats))
        .route("/sensors/:limit", get(list_sensor_readings))
        .route("/sensor", get(latest_sensor_reading))
        .route("/risk", get(latest_risk_event))
        .route("/risks/:limit", get(list_risk_events))
        .route("/config", post(post_config))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "iot-backend"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

async fn store_stats(State(state): State<AppState>) -> Result<Json<StoreStats>, ApiError> {
    Ok(Json(state.store.stats().await?))
}

/// Latest N sensor readings, newest first
#[instrument(skip(state))]
async fn list_sensor_readings(
    State(state): State<AppState>,
    Path(limit): Path<String>,
) -> Result<Json<Vec<SensorReadingRecord>>, ApiError> {
    let limit = parse_limit(&limit)?;
    let readings = state.store.sensor_readings(limit).await?;
    Ok(Json(readings))
}

/// Latest sensor reading, `null` when none has been stored
#[instrument(skip(state))]
async fn latest_sensor_reading(
    State(state): State<AppState>,
) -> Result<Json<Option<SensorReadingRecord>>, ApiError> {
    Ok(Json(state.store.latest_sensor_reading().await?))
}

/// Latest risk event, `null` when none has been stored
#[instrument(skip(state))]
async fn latest_risk_event(
    State(state): State<AppState>,
) -> Result<Json<Option<RiskEventResponse>>, ApiError> {
    let event = state.store.latest_risk_event().await?;
    Ok(Json(event.map(Into::into)))
}

/// Latest N risk events, newest first
#[instrument(skip(state))]
async fn list_risk_events(
    State(state): State<AppState>,
    Path(limit): Path<String>,
) -> Result<Json<Vec<RiskEventResponse>>, ApiError> {
    let limit = parse_limit(&limit)?;
    let events = state.store.risk_events(limit).await?;
    Ok(Json(events.into_iter().map(Into::into).collect()))
}

/// Encode and publish a device configuration.
///
/// Fire-and-forget: `202` means the message was handed to the feed, not that
/// any device applied it.
#[instrument(skip(state, body))]
async fn post_config(
    State(state): State<AppState>,
    body: Result<Json<DeviceConfig>, JsonRejection>,
) -> Result<(StatusCode, Json<ConfigAccepted>), ApiError> {
    let Json(config) = body.map_err(|e| {
        metrics::counter!("api.config.rejected").increment(1);
        ApiError::InvalidConfigBody(e.body_text())
    })?;

    publish_device_config(state.publisher.as_ref(), &config)
        .await
        .map_err(|e| {
            metrics::counter!("api.config.rejected").increment(1);
            ApiError::from(e)
        })?;

    metrics::counter!("api.config.published").increment(1);

    Ok((
        StatusCode::ACCEPTED,
        Json(ConfigAccepted {
            status: "accepted",
            topic: CONFIG_SET_TOPIC,
        }),
    ))
}

/// Start the query/command API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting query/command API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
