//! HTTP API for health checks, Prometheus metrics and scaling status

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use scaler_lib::{
    controller::ScalingController,
    error::ControllerError,
    health::{ComponentStatus, HealthRegistry},
    models::{TargetRef, UsageSample},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub controller: Arc<ScalingController>,
    pub samples: mpsc::Sender<UsageSample>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        controller: Arc<ScalingController>,
        samples: mpsc::Sender<UsageSample>,
    ) -> Self {
        Self {
            health_registry,
            controller,
            samples,
        }
    }
}

/// Health check response - returns 200 if healthy, 503 if degraded/unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Registered targets
async fn list_targets(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.targets())
}

/// Current recommendations of one target
async fn recommendations(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let target = TargetRef::new(namespace, name);
    match state.controller.recommendations(&target) {
        Ok(recommendations) => Json(recommendations).into_response(),
        Err(e @ ControllerError::UnknownTarget(_)) => error_response(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct OperationsQuery {
    pub namespace: Option<String>,
    pub name: Option<String>,
}

/// Scale operations, optionally filtered to one target
async fn operations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OperationsQuery>,
) -> impl IntoResponse {
    let coordinator = state.controller.coordinator();
    let operations = match (query.namespace, query.name) {
        (Some(namespace), Some(name)) => coordinator.status(&TargetRef::new(namespace, name)),
        _ => coordinator.operations(),
    };
    Json(operations)
}

/// Push usage samples into the controller
async fn ingest_samples(
    State(state): State<Arc<AppState>>,
    Json(samples): Json<Vec<UsageSample>>,
) -> Response {
    let count = samples.len();
    for sample in samples {
        if state.samples.send(sample).await.is_err() {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "controller is shutting down".to_string(),
            );
        }
    }
    (StatusCode::ACCEPTED, Json(json!({ "accepted": count }))).into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/targets", get(list_targets))
        .route(
            "/v1/targets/:namespace/:name/recommendations",
            get(recommendations),
        )
        .route("/v1/operations", get(operations))
        .route("/v1/samples", post(ingest_samples))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
