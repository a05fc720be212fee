//! HTTP API: Axum server over the ledger service.
//!
//! Authentication happens upstream; the authenticated account arrives in
//! the `X-Account-Id` header. CORS enabled for browser clients.

pub mod routes;

use anyhow::{Context as _, Result};
use axum::{
    http::{header, HeaderName, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::context::Context;
use crate::engine::ledger::Ledger;
use crate::engine::retry::{RetryExecutor, RetryPolicy};
use crate::types::{ErrorKind, ServiceError};

pub use routes::{ApiState, AppState};

/// Request-path retry: `Internal` failures are retried, and a balance
/// collision is treated as one.
pub fn request_retry(policy: RetryPolicy) -> RetryExecutor {
    RetryExecutor::new(policy, ErrorKind::Internal).with_normalizer(|e| match e {
        ServiceError::BalanceChanged(account_id) => {
            ServiceError::Internal(format!("balance of account {account_id} changed concurrently"))
        }
        other => other,
    })
}

pub fn app_state(ledger: Ledger, policy: RetryPolicy, root: Context) -> AppState {
    Arc::new(ApiState {
        ledger,
        retry: request_retry(policy),
        root,
    })
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(routes::ACCOUNT_HEADER),
            HeaderName::from_static(routes::REQUEST_ID_HEADER),
        ]);

    Router::new()
        .route(
            "/api/user/orders",
            post(routes::submit_order).get(routes::list_orders),
        )
        .route("/api/user/balance", get(routes::get_balance))
        .route("/api/user/balance/withdraw", post(routes::withdraw))
        .route("/api/user/withdrawals", get(routes::list_withdrawals))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` is cancelled, then drain.
pub async fn serve(state: AppState, addr: &str, shutdown: Context) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API address {addr}"))?;
    info!(addr, "API server listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    info!("API server stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
