//! REST API for block operations and exchange introspection

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::content_id::parse_cid_str;
use crate::exchange::{Exchange, ExchangeError};
use crate::ledger::Receipt;
use crate::rocks_store::RocksBlockStore;
use crate::stats::Stat;
use crate::storage::{Block, StorageError};

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub exchange: Arc<Exchange>,
    /// Source of block totals for `/health` and `/metrics`, when persistent
    pub rocks: Option<Arc<RocksBlockStore>>,
}

/// Response for storing a block
#[derive(Serialize, Deserialize)]
pub struct StoreBlockResponse {
    pub cid: String,
    pub size: usize,
}

/// Response for retrieving a block
#[derive(Serialize, Deserialize)]
pub struct GetBlockResponse {
    pub cid: String,
    pub data: String, // base64-encoded
    pub size: usize,
}

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub peer_id: String,
    pub peers: usize,
    pub block_count: u64,
    pub total_bytes: u64,
}

#[derive(Serialize, Deserialize)]
pub struct WantlistResponse {
    pub wantlist: Vec<String>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn create_router(exchange: Arc<Exchange>, rocks: Option<Arc<RocksBlockStore>>) -> Router {
    let state = ApiState { exchange, rocks };

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/v1/stats", get(stats_endpoint))
        .route("/api/v1/wantlist", get(wantlist_endpoint))
        .route("/api/v1/ledger/:peer", get(ledger_endpoint))
        .route("/api/v1/blocks", post(store_block))
        .route("/api/v1/blocks/:cid", get(get_block))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn block_totals(state: &ApiState) -> Result<(u64, u64), ApiError> {
    match &state.rocks {
        Some(rocks) => {
            let stats = rocks
                .stats()
                .await
                .map_err(|e| ApiError::Internal(format!("Failed to read store stats: {}", e)))?;
            Ok((stats.block_count as u64, stats.total_size as u64))
        }
        None => Ok((0, 0)),
    }
}

async fn health_check(State(state): State<ApiState>) -> Result<Json<HealthResponse>, ApiError> {
    let (block_count, total_bytes) = block_totals(&state).await?;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        peer_id: state.exchange.local_peer().to_string(),
        peers: state.exchange.peers().len(),
        block_count,
        total_bytes,
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let (block_count, total_bytes) = block_totals(&state).await?;
    let metrics = state
        .exchange
        .stats()
        .to_prometheus(block_count, total_bytes);

    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics,
    )
        .into_response())
}

async fn stats_endpoint(State(state): State<ApiState>) -> Json<Stat> {
    Json(state.exchange.stat())
}

async fn wantlist_endpoint(State(state): State<ApiState>) -> Json<WantlistResponse> {
    Json(WantlistResponse {
        wantlist: state
            .exchange
            .wantlist()
            .iter()
            .map(|c| c.to_string())
            .collect(),
    })
}

async fn ledger_endpoint(
    State(state): State<ApiState>,
    Path(peer_str): Path<String>,
) -> Result<Json<Receipt>, ApiError> {
    let peer: PeerId = peer_str
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid peer id: {}", e)))?;

    state
        .exchange
        .ledger_for_peer(&peer)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No ledger for peer {}", peer)))
}

/// Store a block (POST /api/v1/blocks)
async fn store_block(
    State(state): State<ApiState>,
    body: bytes::Bytes,
) -> Result<Json<StoreBlockResponse>, ApiError> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("Empty block data".to_string()));
    }

    info!("API: Storing block ({} bytes)", body.len());

    let block = Block::new(body)
        .map_err(|e| ApiError::Internal(format!("Failed to create block: {}", e)))?;
    let cid = block.cid;
    let size = block.size();

    state.exchange.add_block(block).await?;

    info!("API: Stored block {} ({} bytes)", cid, size);
    Ok(Json(StoreBlockResponse {
        cid: cid.to_string(),
        size,
    }))
}

/// Retrieve a locally stored block (GET /api/v1/blocks/:cid)
async fn get_block(
    State(state): State<ApiState>,
    Path(cid_str): Path<String>,
) -> Result<Json<GetBlockResponse>, ApiError> {
    let cid = parse_cid_str(&cid_str)
        .map_err(|e| ApiError::BadRequest(format!("Invalid CID: {}", e)))?;

    let block = state
        .exchange
        .store()
        .get(&cid)
        .await
        .map_err(ExchangeError::from)?;

    Ok(Json(GetBlockResponse {
        cid: cid_str,
        data: base64::prelude::BASE64_STANDARD.encode(&block.data),
        size: block.size(),
    }))
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<ExchangeError> for ApiError {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::Storage(StorageError::NotFound(cid)) => {
                ApiError::NotFound(format!("Block not found: {}", cid))
            }
            ExchangeError::Storage(StorageError::InvalidCid(e)) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => {
                error!("API error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}
