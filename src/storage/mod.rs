//! Persistence layer.
//!
//! Two ports, [`OrderStore`] and [`BalanceStore`], and one SQLite adapter
//! ([`SqliteStore`]) implementing both over a shared `sqlx` pool. Order rows
//! are owned by the order side, balance and withdrawal rows by the balance
//! side; neither side writes the other's rows outside the single
//! reconciliation transaction.
//!
//! Timestamps are stored as Unix milliseconds, amounts as decimal text.

mod balances;
mod orders;

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::context::Context;
use crate::types::{
    AccountBalance, AccountId, Order, OrderNumber, OrderResult, OrderStatus, Result, ServiceError,
    Withdrawal,
};

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Claim-queue and lifecycle operations over order rows.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert a new order in status `New`.
    ///
    /// Re-uploading a number the same account already owns fails with
    /// `AlreadyAccepted`; a number owned by another account fails with
    /// `Conflict`.
    async fn upload(&self, ctx: &Context, order: &Order) -> Result<()>;

    /// Atomically lease up to `limit` unscored orders in `status` whose
    /// claim marker has expired, advancing the marker to now + lease.
    /// Returns the post-claim rows.
    async fn claim_batch(&self, ctx: &Context, status: OrderStatus, limit: u32) -> Result<Vec<Order>>;

    /// Same lease discipline over orders that are scored but not yet
    /// reflected in their account's balance.
    async fn claim_scored(&self, ctx: &Context, limit: u32) -> Result<Vec<Order>>;

    /// Write status and award for every order in one transaction; all or
    /// nothing. Updated orders have their lease released.
    async fn update_batch(&self, ctx: &Context, results: &[OrderResult]) -> Result<()>;

    /// All orders of one account, oldest first.
    async fn orders(&self, ctx: &Context, account_id: AccountId) -> Result<Vec<Order>>;

    async fn order(&self, ctx: &Context, number: &OrderNumber) -> Result<Option<Order>>;

    /// Round-trip to the database.
    async fn ping(&self, ctx: &Context) -> Result<()>;
}

/// Balance rows with optimistic versioning, plus the withdrawal journal.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Read the account's balance, creating a zero row on first access.
    async fn balance(&self, ctx: &Context, account_id: AccountId) -> Result<AccountBalance>;

    /// Mark `order` as `Processed` and write `updated` in one transaction.
    ///
    /// `updated.version` must be the version the caller read. Fails with
    /// `NotFound` if the order is no longer awaiting reconciliation and with
    /// `BalanceChanged` if the stored version moved on.
    async fn apply_order(&self, ctx: &Context, updated: &AccountBalance, order: &Order) -> Result<()>;

    /// Append `withdrawal` and write `updated` in one transaction, under the
    /// same version check as [`BalanceStore::apply_order`].
    async fn withdraw(
        &self,
        ctx: &Context,
        updated: &AccountBalance,
        withdrawal: &Withdrawal,
    ) -> Result<()>;

    /// All withdrawals of one account, oldest first.
    async fn withdrawals(&self, ctx: &Context, account_id: AccountId) -> Result<Vec<Withdrawal>>;
}

// ---------------------------------------------------------------------------
// SQLite adapter
// ---------------------------------------------------------------------------

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS orders (
        number        TEXT PRIMARY KEY,
        account_id    INTEGER NOT NULL,
        status        TEXT NOT NULL,
        accrual       TEXT,
        uploaded_at   INTEGER NOT NULL,
        claimed_until INTEGER NOT NULL DEFAULT 0
    )"#,
    "CREATE INDEX IF NOT EXISTS orders_account_idx ON orders (account_id)",
    "CREATE INDEX IF NOT EXISTS orders_queue_idx ON orders (status, claimed_until)",
    r#"CREATE TABLE IF NOT EXISTS balances (
        balance_id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL UNIQUE,
        current    TEXT NOT NULL DEFAULT '0',
        withdrawn  TEXT NOT NULL DEFAULT '0',
        version    INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS withdrawals (
        withdrawal_id INTEGER PRIMARY KEY AUTOINCREMENT,
        balance_id    INTEGER NOT NULL REFERENCES balances (balance_id),
        number        TEXT NOT NULL,
        sum           TEXT NOT NULL,
        processed_at  INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS withdrawals_balance_idx ON withdrawals (balance_id)",
];

/// SQLite implementation of both stores.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    /// Claim lease duration.
    score_delta: Duration,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, score_delta: Duration) -> Self {
        Self { pool, score_delta }
    }

    /// Open a pool against `url` (e.g. `sqlite://loyalty.db`), creating the
    /// database file if missing.
    pub async fn connect(url: &str, max_connections: u32, score_delta: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        info!(max_connections, "SQLite pool opened");
        Ok(Self::new(pool, score_delta))
    }

    /// Single-connection in-memory database, schema applied.
    pub async fn in_memory(score_delta: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self::new(pool, score_delta);
        store.migrate().await?;
        Ok(store)
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ---------------------------------------------------------------------------
// Column codecs
// ---------------------------------------------------------------------------

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| ServiceError::Internal(format!("timestamp out of range: {ms}")))
}

pub(crate) fn parse_amount(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| ServiceError::Internal(format!("malformed amount {raw:?}: {e}")))
}
