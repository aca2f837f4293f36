//! HTTP routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::coordinator::{CastVoteReceipt, CastVoteRequest};
use crate::database::models::{VoteAttempt, VoteRecord};
use crate::error::{ErrorBody, VoteError};
use crate::ledger::TxHash;
use crate::metrics;
use crate::reconcile::Invalidation;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/version", get(get_version))
        .route("/metrics", get(get_metrics))
        .route("/votes", post(cast_vote))
        .route("/votes/{tx_hash}", get(get_vote))
        .route("/votes/{tx_hash}/invalidate", post(invalidate_vote))
        .route("/attempts/{id}", get(get_attempt))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Errors of the lookup endpoints
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Store(sqlx::Error),
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
            ApiError::Store(err) => {
                error!("Store error while serving request: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_error",
                    "internal server error".to_string(),
                )
            }
        };
        let body = ErrorBody {
            error,
            message,
            attempt_id: None,
            transaction_hash: None,
        };
        (status, Json(body)).into_response()
    }
}

fn parse_tx_hash(raw: &str) -> Result<TxHash, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid transaction hash {}: {}", raw, e)))
}

async fn health_check() -> &'static str {
    info!("GET /healthz - Health check requested");
    "ok"
}

async fn get_version() -> Json<Value> {
    info!("GET /version - Version requested");
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "git_hash": option_env!("VOTE_SERVICE_BUILD_GIT_HASH").unwrap_or("unknown"),
        "build_time_unix": option_env!("VOTE_SERVICE_BUILD_TIME_UNIX").unwrap_or("unknown"),
    }))
}

async fn get_metrics(State(state): State<AppState>) -> Json<Value> {
    info!("GET /metrics - Metrics requested");
    Json(metrics::snapshot_as_json(state.db.path()))
}

async fn cast_vote(
    State(state): State<AppState>,
    Json(request): Json<CastVoteRequest>,
) -> Result<Json<CastVoteReceipt>, VoteError> {
    info!(
        "POST /votes - Vote from {} in election {}",
        request.voter_id, request.election_id
    );
    let result = state.coordinator.cast_vote(&request).await;
    if let Err(e @ (VoteError::Store(_) | VoteError::Internal(_))) = &result {
        error!("CastVote for voter {} failed: {}", request.voter_id, e);
    }
    result.map(Json)
}

async fn get_vote(
    State(state): State<AppState>,
    Path(tx_hash): Path<String>,
) -> Result<Json<VoteRecord>, ApiError> {
    info!("GET /votes/{} - Vote lookup requested", tx_hash);
    let hash = parse_tx_hash(&tx_hash)?;
    state
        .coordinator
        .get_vote(&hash)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no vote recorded for {}", hash)))
}

async fn invalidate_vote(
    State(state): State<AppState>,
    Path(tx_hash): Path<String>,
) -> Result<Json<Value>, ApiError> {
    info!("POST /votes/{}/invalidate - Invalidation requested", tx_hash);
    let hash = parse_tx_hash(&tx_hash)?;
    match state.coordinator.invalidate(&hash).await? {
        Invalidation::Invalidated(record) => Ok(Json(json!({
            "invalidated": true,
            "vote": record,
        }))),
        Invalidation::AlreadyInvalid(record) => Ok(Json(json!({
            "invalidated": false,
            "vote": record,
        }))),
        Invalidation::NotFound => Err(ApiError::NotFound(format!("no vote recorded for {}", hash))),
    }
}

async fn get_attempt(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<VoteAttempt>, ApiError> {
    info!("GET /attempts/{} - Attempt lookup requested", id);
    let id: Uuid = id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid attempt id {}", id)))?;
    state
        .coordinator
        .get_attempt(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no attempt {}", id)))
}
