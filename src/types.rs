//! Shared types for the loyalty ledger.
//!
//! Orders, balances, withdrawals, the scoring-service vocabulary and the
//! error taxonomy. Every other module depends on these; nothing here
//! depends on storage or transport.

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Order number
// ---------------------------------------------------------------------------

/// Externally supplied order number: a non-empty string of ASCII digits,
/// globally unique across all accounts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderNumber(String);

impl OrderNumber {
    /// Parse a raw order number. Surrounding whitespace is ignored.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ServiceError::InvalidFormat(format!(
                "order number must be a non-empty digit string, got {trimmed:?}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Luhn checksum over the digits.
    pub fn is_luhn_valid(&self) -> bool {
        let sum: u32 = self
            .0
            .bytes()
            .rev()
            .enumerate()
            .map(|(i, b)| {
                let d = u32::from(b - b'0');
                if i % 2 == 1 {
                    let doubled = d * 2;
                    if doubled > 9 {
                        doubled - 9
                    } else {
                        doubled
                    }
                } else {
                    d
                }
            })
            .sum();
        sum % 10 == 0
    }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for OrderNumber {
    type Error = ServiceError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<OrderNumber> for String {
    fn from(value: OrderNumber) -> Self {
        value.0
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Account identifier as issued by the (external) authentication layer.
pub type AccountId = i64;

/// Lifecycle status of a submitted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    New,
    Processing,
    Processed,
    Invalid,
}

impl OrderStatus {
    /// Storage / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Processed => "PROCESSED",
            OrderStatus::Invalid => "INVALID",
        }
    }

    /// `Processed` and `Invalid` orders are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Processed | OrderStatus::Invalid)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "PROCESSED" => Ok(OrderStatus::Processed),
            "INVALID" => Ok(OrderStatus::Invalid),
            other => Err(ServiceError::Internal(format!("unknown order status {other:?}"))),
        }
    }
}

/// A submitted order as persisted by the order store.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub number: OrderNumber,
    pub account_id: AccountId,
    pub status: OrderStatus,
    /// Awarded points. Set once the scoring service reports `PROCESSED`.
    pub accrual: Option<Decimal>,
    pub uploaded_at: DateTime<Utc>,
    /// Claim lease marker; the order can be claimed only once this is in the past.
    pub claimed_until: DateTime<Utc>,
}

impl Order {
    /// A freshly submitted order in status `New`, immediately claimable.
    pub fn new(number: OrderNumber, account_id: AccountId, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            number,
            account_id,
            status: OrderStatus::New,
            accrual: None,
            uploaded_at,
            claimed_until: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Scored by the scoring service but not yet reflected in the balance.
    pub fn awaits_reconciliation(&self) -> bool {
        self.status == OrderStatus::Processing && self.accrual.is_some()
    }
}

/// One row of a batch status update written by the scoring poller.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderResult {
    pub number: OrderNumber,
    pub status: OrderStatus,
    pub accrual: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Balances
// ---------------------------------------------------------------------------

/// Per-account balance row with its optimistic-concurrency version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBalance {
    pub balance_id: i64,
    pub account_id: AccountId,
    pub current: Decimal,
    pub withdrawn: Decimal,
    /// Incremented on every successful update.
    pub version: i64,
}

/// Append-only record of a balance debit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal {
    /// Caller-supplied reference; need not match a submitted order.
    pub order: OrderNumber,
    pub sum: Decimal,
    pub processed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Scoring service vocabulary
// ---------------------------------------------------------------------------

/// Status reported by the external scoring service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScoringStatus {
    Registered,
    Processing,
    Invalid,
    Processed,
}

/// A decoded scoring-service answer for one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringResult {
    pub order: OrderNumber,
    pub status: ScoringStatus,
    /// Present only for `Processed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Decimal>,
}

impl ScoringResult {
    /// Translate into the order-store update the poller writes back.
    ///
    /// `PROCESSED` keeps the order in `Processing` with the award recorded;
    /// the reconciler owns the final `Processed` transition together with
    /// the balance credit.
    pub fn to_order_result(&self) -> OrderResult {
        let (status, accrual) = match self.status {
            ScoringStatus::Registered | ScoringStatus::Processing => (OrderStatus::Processing, None),
            ScoringStatus::Invalid => (OrderStatus::Invalid, None),
            ScoringStatus::Processed => (
                OrderStatus::Processing,
                Some(self.accrual.unwrap_or(Decimal::ZERO)),
            ),
        };
        OrderResult {
            number: self.order.clone(),
            status,
            accrual,
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Discriminant of [`ServiceError`], used for retry classification and
/// HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    AlreadyAccepted,
    BalanceChanged,
    Internal,
    Cancelled,
    InvalidFormat,
    InvalidOrderNumber,
    InsufficientFunds,
    Unauthorized,
}

impl ErrorKind {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::InvalidFormat => StatusCode::BAD_REQUEST,
            ErrorKind::InvalidOrderNumber => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::AlreadyAccepted => StatusCode::OK,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
            ErrorKind::NotFound => StatusCode::NO_CONTENT,
            ErrorKind::BalanceChanged | ErrorKind::Internal | ErrorKind::Cancelled => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Errors produced by the stores, the scoring client and the engine.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("no matching data found")]
    NotFound,

    #[error("order {0} was already uploaded by another account")]
    Conflict(OrderNumber),

    #[error("order {0} was already uploaded by this account")]
    AlreadyAccepted(OrderNumber),

    #[error("balance of account {0} changed concurrently")]
    BalanceChanged(AccountId),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidFormat(String),

    #[error("order number {0} fails checksum validation")]
    InvalidOrderNumber(OrderNumber),

    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: Decimal, available: Decimal },

    #[error("request is not authenticated")]
    Unauthorized,
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::NotFound => ErrorKind::NotFound,
            ServiceError::Conflict(_) => ErrorKind::Conflict,
            ServiceError::AlreadyAccepted(_) => ErrorKind::AlreadyAccepted,
            ServiceError::BalanceChanged(_) => ErrorKind::BalanceChanged,
            ServiceError::Internal(_) | ServiceError::Storage(_) | ServiceError::Transport(_) => {
                ErrorKind::Internal
            }
            ServiceError::Cancelled => ErrorKind::Cancelled,
            ServiceError::InvalidFormat(_) => ErrorKind::InvalidFormat,
            ServiceError::InvalidOrderNumber(_) => ErrorKind::InvalidOrderNumber,
            ServiceError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            ServiceError::Unauthorized => ErrorKind::Unauthorized,
        }
    }

    /// Optimistic-concurrency collisions and internal failures may succeed
    /// when re-run; everything else is final.
    pub fn is_retriable(&self) -> bool {
        matches!(self.kind(), ErrorKind::BalanceChanged | ErrorKind::Internal)
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
