use axum::{
    Json, Router, debug_handler,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::{
    errors::{EngineError, PersistenceError, SettlementError},
    orderbook::{BookDepth, MatchOutcome},
    orders::{NewOrder, OrderStatus},
    retry::SweepReport,
    settlement::SettlementStats,
    state::{AppState, SubmitAck},
    trade::Trade,
};

const DEFAULT_LEVELS: usize = 20;
const MAX_LEVELS: usize = 1000;

/// Errors returned by handlers, rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Settlement(#[from] SettlementError),
    #[error("{0}")]
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Engine(EngineError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Engine(EngineError::UnknownPair(_)) | ApiError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Engine(EngineError::Persistence(PersistenceError::Halted(_))) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Settlement(_) => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// What `POST /orders` returns: the incoming order's final state, the match and its trades.
#[derive(Debug, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub sequence: u64,
    pub status: OrderStatus,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub outcome: MatchOutcome,
    /// Resting orders the self-trade policy removed.
    pub cancelled: Vec<String>,
    pub trades: Vec<Trade>,
}

impl From<SubmitAck> for OrderAck {
    fn from(ack: SubmitAck) -> Self {
        let event = ack.event;
        OrderAck {
            order_id: event.incoming.id.clone(),
            sequence: event.sequence,
            status: event.incoming.status,
            filled: event.incoming.filled_size(),
            remaining: event.incoming.remaining_size,
            cancelled: event.cancelled.iter().map(|o| o.id.clone()).collect(),
            outcome: event.outcome,
            trades: ack.trades,
        }
    }
}

#[debug_handler]
pub async fn create_order(
    State(state): State<AppState>,
    Json(payload): Json<NewOrder>,
) -> Result<Json<OrderAck>, ApiError> {
    let ack = state.submit_order(payload).await?;
    Ok(Json(ack.into()))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    Path((pair, order_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.cancel_order(&pair, &order_id).await? {
        Ok(Json(json!({ "cancelled": order_id })))
    } else {
        Err(ApiError::NotFound(format!("order `{order_id}` is not resting")))
    }
}

#[derive(Deserialize)]
pub struct DepthParams {
    pub levels: Option<usize>,
}

pub async fn get_book(
    State(state): State<AppState>,
    Path(pair): Path<String>,
    Query(params): Query<DepthParams>,
) -> Result<Json<BookDepth>, ApiError> {
    let levels = params.levels.unwrap_or(DEFAULT_LEVELS).clamp(1, MAX_LEVELS);
    Ok(Json(state.depth(&pair, levels).await?))
}

pub async fn settlement_stats(
    State(state): State<AppState>,
) -> Result<Json<SettlementStats>, ApiError> {
    Ok(Json(state.settlement_stats()?))
}

#[derive(Serialize)]
pub struct RetryAck {
    pub message: &'static str,
    pub report: SweepReport,
}

pub async fn retry_failed(State(state): State<AppState>) -> Result<Json<RetryAck>, ApiError> {
    let report = state.retry_failed().await?;
    Ok(Json(RetryAck {
        message: "failed settlements retried",
        report,
    }))
}

pub async fn bot_balance(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.bot_balance().await? {
        Some((address, balance)) => Ok(Json(json!({
            "address": address,
            // u128 does not fit a JSON number
            "balance": balance.to_string(),
        }))),
        None => Err(ApiError::NotFound("no settlement submitter configured".into())),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/{pair}/{order_id}", delete(cancel_order))
        .route("/book/{pair}", get(get_book))
        .route("/settlement/stats", get(settlement_stats))
        .route("/settlement/retry-failed", post(retry_failed))
        .route("/settlement/bot-balance", get(bot_balance))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
