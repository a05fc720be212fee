//! HTTP client for the accrual-scoring service.
//!
//! `GET {base_url}/api/orders/{number}`:
//! - `200` with a JSON body decodes into a [`ScoringResult`]
//! - `204` means the service has not seen the order yet
//! - `429` and any other status are `Internal` (retriable by the caller)
//!
//! Connection-level failures are retried a few times with a fixed wait.
//! That is the only retrying done here; response-level retries belong to
//! the caller's `RetryExecutor`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::ScoringClient;
use crate::context::Context;
use crate::types::{OrderNumber, Result, ScoringResult, ScoringStatus, ServiceError};

const USER_AGENT: &str = concat!("loyalty/", env!("CARGO_PKG_VERSION"));

/// Default number of extra attempts on connection failures.
const DEFAULT_TRANSPORT_RETRIES: u32 = 2;

/// Default fixed wait between transport attempts (ms).
const DEFAULT_TRANSPORT_RETRY_WAIT_MS: u64 = 200;

pub struct HttpScoringClient {
    http: Client,
    base_url: String,
    transport_retries: u32,
    transport_retry_wait: Duration,
}

impl HttpScoringClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            transport_retries: DEFAULT_TRANSPORT_RETRIES,
            transport_retry_wait: Duration::from_millis(DEFAULT_TRANSPORT_RETRY_WAIT_MS),
        })
    }

    pub fn with_transport_retries(mut self, retries: u32, wait: Duration) -> Self {
        self.transport_retries = retries;
        self.transport_retry_wait = wait;
        self
    }

    fn order_url(&self, number: &OrderNumber) -> String {
        format!(
            "{}/api/orders/{}",
            self.base_url,
            urlencoding::encode(number.as_str())
        )
    }

    /// Send the request, retrying connect and timeout failures only.
    async fn send(&self, ctx: &Context, url: &str) -> Result<reqwest::Response> {
        let mut attempt = 0;

        loop {
            match self.http.get(url).send().await {
                Ok(resp) => return Ok(resp),
                Err(e) if (e.is_connect() || e.is_timeout()) && attempt < self.transport_retries => {
                    attempt += 1;
                    warn!(
                        request_id = %ctx.request_id(),
                        attempt,
                        error = %e,
                        "Scoring service unreachable, retrying"
                    );
                    tokio::time::sleep(self.transport_retry_wait).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn decode(number: &OrderNumber, body: &[u8]) -> Result<ScoringResult> {
        let mut result: ScoringResult = serde_json::from_slice(body).map_err(|e| {
            ServiceError::Internal(format!(
                "undecodable scoring response for order {number}: {e}"
            ))
        })?;

        if &result.order != number {
            return Err(ServiceError::Internal(format!(
                "scoring response for order {} answered order {}",
                number, result.order
            )));
        }

        // Only PROCESSED carries an award.
        if result.status != ScoringStatus::Processed {
            result.accrual = None;
        }
        if let Some(accrual) = result.accrual.filter(|a| *a < Decimal::ZERO) {
            return Err(ServiceError::Internal(format!(
                "scoring response for order {number} carries negative award {accrual}"
            )));
        }
        Ok(result)
    }
}

#[async_trait]
impl ScoringClient for HttpScoringClient {
    async fn get_status(&self, ctx: &Context, number: &OrderNumber) -> Result<Option<ScoringResult>> {
        let url = self.order_url(number);

        ctx.run(async {
            debug!(request_id = %ctx.request_id(), number = %number, "Querying scoring service");
            let resp = self.send(ctx, &url).await?;
            let status = resp.status();

            match status {
                StatusCode::OK => {
                    let body = resp.bytes().await?;
                    let result = Self::decode(number, &body)?;
                    debug!(
                        request_id = %ctx.request_id(),
                        number = %number,
                        status = ?result.status,
                        accrual = ?result.accrual,
                        "Scoring result received"
                    );
                    Ok(Some(result))
                }
                StatusCode::NO_CONTENT => {
                    debug!(request_id = %ctx.request_id(), number = %number, "Order not yet known to scoring service");
                    Ok(None)
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("unspecified")
                        .to_string();
                    warn!(
                        request_id = %ctx.request_id(),
                        number = %number,
                        retry_after = %retry_after,
                        "Scoring service rate limited"
                    );
                    Err(ServiceError::Internal(format!(
                        "scoring service rate limited (retry after {retry_after})"
                    )))
                }
                other => {
                    let body = resp.text().await.unwrap_or_default();
                    warn!(
                        request_id = %ctx.request_id(),
                        number = %number,
                        status = %other,
                        "Unexpected scoring service response"
                    );
                    Err(ServiceError::Internal(format!(
                        "scoring service returned {other} for order {number}: {body}"
                    )))
                }
            }
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
