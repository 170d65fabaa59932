//! HTTP API for order intake, status and health checks

use crate::config::ApiConfig;
use crate::error::{SwapError, SwapResult};
use crate::intake::OrderService;
use crate::model::OrderInput;
use crate::resolver::ChainRegistry;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<OrderService>,
    pub chains: Arc<ChainRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/secret", post(reveal_secret))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> SwapResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SwapError::Config(format!("Cannot bind API server to {}: {}", addr, e)))?;
    axum::serve(listener, router(state))
        .await
        .map_err(|e| SwapError::Internal(format!("API server error: {}", e)))
}

/// Taxonomy to HTTP status; chain and storage details stay in the logs
pub struct ApiError(SwapError);

impl From<SwapError> for ApiError {
    fn from(e: SwapError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SwapError::Validation(_)
            | SwapError::UnsupportedChain { .. }
            | SwapError::InvalidSecret { .. } => StatusCode::BAD_REQUEST,
            SwapError::OrderNotFound { .. } => StatusCode::NOT_FOUND,
            SwapError::InvalidState { .. } | SwapError::FlowInProgress { .. } => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
            "internal error".to_string()
        } else {
            self.0.to_string()
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.kind().to_string(),
                message,
            }),
        )
            .into_response()
    }
}

async fn create_order(
    State(state): State<AppState>,
    Json(input): Json<OrderInput>,
) -> Result<impl IntoResponse, ApiError> {
    let created = state.orders.create_order(input).await?;
    let status = if created.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(created.view)))
}

async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orders.get_status(&id).await?))
}

async fn reveal_secret(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RevealRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.orders.reveal_secret(&id, &body.secret).await?;
    Ok((StatusCode::ACCEPTED, Json(view)))
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - store and every configured chain reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.orders.health_check().await.is_ok();
    let chain_health = state.chains.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let status = if store_ok && chains_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: store_ok && chains_ok,
            store: store_ok,
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
                .collect(),
        }),
    )
}

// Request and response types

#[derive(Deserialize)]
struct RevealRequest {
    secret: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChainHealth {
    chain_id: i64,
    healthy: bool,
}
