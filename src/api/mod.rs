//! HTTP API for bridge requests, validator attestations and monitoring

use crate::chain::{units, BridgeDirection, BridgeMode, ChainDescriptor, ChainId};
use crate::config::ApiConfig;
use crate::coordination::{AttestationAck, BridgeOrchestrator, InitiateReceipt, InitiateRequest};
use crate::error::{BridgeError, BridgeResult, ValidationError};
use crate::state::{BridgeTransaction, TransactionId, TransactionStats, TransactionStatus};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<BridgeOrchestrator>,
}

/// Build the router
pub fn router(orchestrator: Arc<BridgeOrchestrator>) -> Router {
    let state = AppState { orchestrator };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/chains", get(get_chains))
        .route("/stats", get(get_stats))
        .route("/transactions", post(initiate_transaction))
        .route("/transactions/:id", get(get_transaction))
        .route("/transactions/:id/attestations", post(submit_attestation))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, orchestrator: Arc<BridgeOrchestrator>) -> BridgeResult<()> {
    let app = router(orchestrator);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| BridgeError::Internal(format!("API bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| BridgeError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

/// Error response wrapper
pub struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            BridgeError::Validation(e @ ValidationError::IdempotencyKeyConflict { .. }) => {
                (StatusCode::CONFLICT, e.kind())
            }
            BridgeError::Validation(e) => (StatusCode::BAD_REQUEST, e.kind()),
            BridgeError::TransactionNotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            BridgeError::DuplicateTransaction { .. } => (StatusCode::CONFLICT, "duplicate"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                kind,
            }),
        )
            .into_response()
    }
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify the transaction store
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.orchestrator.health_check().await.is_ok();
    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: database,
            database,
            in_flight: state.orchestrator.in_flight(),
        }),
    )
}

/// Configured chains and supported directions
async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    let decimals = state.orchestrator.token_decimals();
    let registry = state.orchestrator.registry();

    let mut directions = registry.supported_directions();
    directions.sort_by_key(|d| (d.source, d.destination));

    Json(ChainsResponse {
        chains: registry
            .descriptors()
            .into_iter()
            .map(|d| ChainView::new(d, decimals))
            .collect(),
        directions: directions
            .into_iter()
            .map(|direction| DirectionView {
                direction,
                mode: direction.mode(),
            })
            .collect(),
    })
}

/// Get transaction statistics
async fn get_stats(State(state): State<AppState>) -> Result<Json<TransactionStats>, ApiError> {
    Ok(Json(state.orchestrator.stats().await?))
}

/// Initiate a bridge transfer
async fn initiate_transaction(
    State(state): State<AppState>,
    Json(request): Json<InitiateRequest>,
) -> Result<(StatusCode, Json<InitiateReceipt>), ApiError> {
    let receipt = state.orchestrator.initiate(request).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// Get a transaction by id
async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<TransactionId>,
) -> Result<Json<TransactionView>, ApiError> {
    let tx = state.orchestrator.get(id).await?;
    Ok(Json(TransactionView::new(
        &tx,
        state.orchestrator.token_decimals(),
    )))
}

/// Submit a validator attestation
async fn submit_attestation(
    State(state): State<AppState>,
    Path(id): Path<TransactionId>,
    Json(request): Json<AttestationRequest>,
) -> Result<Json<AttestationAck>, ApiError> {
    let signature = hex::decode(request.signature.trim_start_matches("0x"))
        .map_err(|_| ValidationError::InvalidSignature)?;
    let ack = state
        .orchestrator
        .submit_attestation(id, &request.validator_address, signature)
        .await?;
    Ok(Json(ack))
}

// Request and response types

#[derive(Debug, Deserialize)]
struct AttestationRequest {
    validator_address: String,
    /// Hex encoded, optionally 0x-prefixed
    signature: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
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
    in_flight: usize,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<ChainView>,
    directions: Vec<DirectionView>,
}

#[derive(Serialize)]
struct DirectionView {
    #[serde(flatten)]
    direction: BridgeDirection,
    mode: BridgeMode,
}

#[derive(Serialize)]
struct ChainView {
    id: ChainId,
    native_asset_symbol: String,
    confirmations_required: u64,
    block_time_secs: u64,
    is_active: bool,
    base_fee: String,
    percentage_basis_points: u32,
    min_fee: String,
    max_fee: String,
}

impl ChainView {
    fn new(descriptor: &ChainDescriptor, decimals: u32) -> Self {
        let fees = &descriptor.fee_schedule;
        Self {
            id: descriptor.id,
            native_asset_symbol: descriptor.native_asset_symbol.clone(),
            confirmations_required: descriptor.confirmations_required,
            block_time_secs: descriptor.block_time_secs,
            is_active: descriptor.is_active,
            base_fee: units::format_amount(fees.base_fee, decimals),
            percentage_basis_points: fees.percentage_basis_points,
            min_fee: units::format_amount(fees.min_fee, decimals),
            max_fee: units::format_amount(fees.max_fee, decimals),
        }
    }
}

/// Transaction as shown to clients, amounts in token units
#[derive(Serialize)]
struct TransactionView {
    id: TransactionId,
    status: TransactionStatus,
    #[serde(flatten)]
    direction: BridgeDirection,
    mode: BridgeMode,
    source_address: String,
    destination_address: String,
    amount: String,
    fee: String,
    net_amount: String,
    validators: Vec<String>,
    attestation_digest: String,
    source_tx_hash: Option<String>,
    destination_tx_hash: Option<String>,
    refund_tx_hash: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    refund_attempts: u32,
    requires_manual_intervention: bool,
}

impl TransactionView {
    fn new(tx: &BridgeTransaction, decimals: u32) -> Self {
        Self {
            id: tx.id,
            status: tx.status,
            direction: tx.direction,
            mode: tx.direction.mode(),
            source_address: tx.source_address.clone(),
            destination_address: tx.destination_address.clone(),
            amount: units::format_amount(tx.amount, decimals),
            fee: units::format_amount(tx.fee, decimals),
            net_amount: units::format_amount(tx.net_amount, decimals),
            validators: tx.validator_signatures.keys().cloned().collect(),
            attestation_digest: tx.attestation_digest(),
            source_tx_hash: tx.source_tx_hash.clone(),
            destination_tx_hash: tx.destination_tx_hash.clone(),
            refund_tx_hash: tx.refund_tx_hash.clone(),
            created_at: tx.created_at,
            updated_at: tx.updated_at,
            completed_at: tx.completed_at,
            error_message: tx.error_message.clone(),
            refund_attempts: tx.refund_attempts,
            requires_manual_intervention: tx.requires_manual_intervention,
        }
    }
}
