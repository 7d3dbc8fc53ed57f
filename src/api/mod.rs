//! HTTP API for health checks, trades, and monitoring

use crate::config::ApiConfig;
use crate::coordination::TradeOrchestrator;
use crate::engine::{EngineKind, EngineSet};
use crate::error::{ForwarderError, ForwarderResult};
use crate::state::{Quote, Trade, TradeId, TradeStats, TradeStore};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const DEFAULT_TRADE_LIMIT: u32 = 50;
const MAX_TRADE_LIMIT: u32 = 500;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TradeStore>,
    pub orchestrator: Arc<TradeOrchestrator>,
    pub engines: Arc<EngineSet>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/trades", get(list_trades).post(create_trade))
        .route("/trades/:id", get(get_trade))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> ForwarderResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ForwarderError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| ForwarderError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

/// Error body returned by every failing handler
#[derive(Debug)]
pub enum ApiError {
    NotReady,
    Forwarder(ForwarderError),
}

impl From<ForwarderError> for ApiError {
    fn from(e: ForwarderError) -> Self {
        ApiError::Forwarder(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        let e = match self {
            ApiError::NotReady => return StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Forwarder(e) => e,
        };
        match e {
            ForwarderError::TradeNotFound { .. } => StatusCode::NOT_FOUND,
            ForwarderError::EngineNotFound { .. } => StatusCode::BAD_REQUEST,
            ForwarderError::TradeFinalized { .. } => StatusCode::CONFLICT,
            ForwarderError::Database(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::NotReady => "engines are not validated yet".to_string(),
            ApiError::Forwarder(e) => e.to_string(),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("API request failed: {}", message);
        }
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - database reachable and every engine validated
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.store.health_check().await.is_ok();

    let details: Vec<EngineHealth> = state
        .engines
        .all()
        .map(|engine| EngineHealth {
            asset: engine.asset().to_string(),
            kind: engine.kind(),
            validated: engine.is_validated(),
        })
        .collect();
    let engines = details.iter().all(|e| e.validated);

    let ready = database && engines;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            database,
            engines,
            details,
        }),
    )
}

async fn list_trades(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<TradeResponse>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_TRADE_LIMIT)
        .min(MAX_TRADE_LIMIT);
    let trades = state.store.list_trades(limit).await?;
    Ok(Json(trades.into_iter().map(TradeResponse::from).collect()))
}

async fn get_trade(
    State(state): State<AppState>,
    Path(id): Path<TradeId>,
) -> Result<Json<TradeResponse>, ApiError> {
    let trade = state.store.get_trade(id).await?;
    Ok(Json(TradeResponse::from(trade)))
}

/// Accept a quote and start executing it in the background
async fn create_trade(
    State(state): State<AppState>,
    Json(quote): Json<Quote>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    if !state.engines.all_validated() {
        return Err(ApiError::NotReady);
    }

    let id = state.orchestrator.create_trade(quote).await?;

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = orchestrator.execute_trade(id).await {
            error!(trade_id = %id, "Trade did not complete: {}", e);
        }
    });

    Ok((StatusCode::ACCEPTED, Json(CreatedResponse { id })))
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<TradeStats>, ApiError> {
    Ok(Json(state.store.stats().await?))
}

// Request and response types

#[derive(Deserialize)]
struct ListParams {
    limit: Option<u32>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    engines: bool,
    details: Vec<EngineHealth>,
}

#[derive(Serialize)]
struct EngineHealth {
    asset: String,
    kind: EngineKind,
    validated: bool,
}

#[derive(Serialize)]
struct CreatedResponse {
    id: TradeId,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
pub struct TradeResponse {
    #[serde(flatten)]
    trade: Trade,
    status: crate::state::TradeStatus,
}

impl From<Trade> for TradeResponse {
    fn from(trade: Trade) -> Self {
        let status = trade.status();
        Self { trade, status }
    }
}
