//! HTTP route handlers.
//!
//! Handlers resolve the caller's account and correlation id from headers,
//! run the ledger call under the request-path retry executor and map the
//! outcome through [`ErrorKind::status_code`](crate::types::ErrorKind::status_code).

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::context::Context;
use crate::engine::ledger::Ledger;
use crate::engine::retry::RetryExecutor;
use crate::types::{AccountId, Order, OrderStatus, ServiceError, Withdrawal};

/// Set by the authentication layer in front of this service.
pub const ACCOUNT_HEADER: &str = "x-account-id";

pub const REQUEST_ID_HEADER: &str = "x-request-id";

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct ApiState {
    pub ledger: Ledger,
    /// Retries `Internal` failures, with `BalanceChanged` folded into them.
    pub retry: RetryExecutor,
    /// Request contexts derive their cancellation from this one.
    pub root: Context,
}

pub type AppState = Arc<ApiState>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct OrderView {
    pub number: String,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Decimal>,
    pub uploaded_at: DateTime<Utc>,
}

impl From<Order> for OrderView {
    fn from(order: Order) -> Self {
        // The award becomes visible together with the balance credit.
        let accrual = match order.status {
            OrderStatus::Processed => order.accrual,
            _ => None,
        };
        Self {
            number: order.number.into(),
            status: order.status,
            accrual,
            uploaded_at: order.uploaded_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceView {
    pub current: Decimal,
    pub withdrawn: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawRequest {
    pub order: String,
    pub sum: Decimal,
}

/// Error response carrying the status from the error's kind.
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.kind().status_code();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
            return (status, "internal server error").into_response();
        }
        if status == StatusCode::OK || status == StatusCode::NO_CONTENT {
            return (status, Body::empty()).into_response();
        }
        (status, self.0.to_string()).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Resolve the authenticated account and a request context.
fn caller(state: &ApiState, headers: &HeaderMap) -> ApiResult<(AccountId, Context)> {
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .unwrap_or_else(Uuid::new_v4);
    let ctx = state.root.with_request_id(request_id);

    let account_id = headers
        .get(ACCOUNT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<AccountId>().ok())
        .ok_or(ServiceError::Unauthorized)?;

    Ok((account_id, ctx))
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// POST /api/user/orders
pub async fn submit_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<StatusCode> {
    let (account_id, ctx) = caller(&state, &headers)?;
    let ledger = &state.ledger;
    let raw = body.as_str();

    state
        .retry
        .invoke(&ctx, |attempt_ctx| async move {
            ledger.submit_order(&attempt_ctx, account_id, raw).await
        })
        .await?;

    info!(request_id = %ctx.request_id(), account_id, "Order accepted for scoring");
    Ok(StatusCode::ACCEPTED)
}

/// GET /api/user/orders
pub async fn list_orders(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<OrderView>>> {
    let (account_id, ctx) = caller(&state, &headers)?;
    let ledger = &state.ledger;

    let orders = state
        .retry
        .invoke(&ctx, |attempt_ctx| async move { ledger.orders(&attempt_ctx, account_id).await })
        .await?;
    Ok(Json(orders.into_iter().map(OrderView::from).collect()))
}

/// GET /api/user/balance
pub async fn get_balance(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<BalanceView>> {
    let (account_id, ctx) = caller(&state, &headers)?;
    let ledger = &state.ledger;

    let balance = state
        .retry
        .invoke(&ctx, |attempt_ctx| async move { ledger.balance(&attempt_ctx, account_id).await })
        .await?;
    Ok(Json(BalanceView {
        current: balance.current,
        withdrawn: balance.withdrawn,
    }))
}

/// POST /api/user/balance/withdraw
pub async fn withdraw(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<WithdrawRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let (account_id, ctx) = caller(&state, &headers)?;
    let Json(request) =
        payload.map_err(|e| ServiceError::InvalidFormat(format!("malformed withdrawal: {e}")))?;
    let ledger = &state.ledger;
    let request = &request;

    state
        .retry
        .invoke(&ctx, |attempt_ctx| async move {
            ledger
                .withdraw(&attempt_ctx, account_id, &request.order, request.sum)
                .await
        })
        .await?;
    Ok(StatusCode::OK)
}

/// GET /api/user/withdrawals
pub async fn list_withdrawals(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Withdrawal>>> {
    let (account_id, ctx) = caller(&state, &headers)?;
    let ledger = &state.ledger;

    let withdrawals = state
        .retry
        .invoke(&ctx, |attempt_ctx| async move {
            ledger.withdrawals(&attempt_ctx, account_id).await
        })
        .await?;
    Ok(Json(withdrawals))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> StatusCode {
    let ctx = state.root.child();
    match state.ledger.ping(&ctx).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            error!(request_id = %ctx.request_id(), error = %e, "Health check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
