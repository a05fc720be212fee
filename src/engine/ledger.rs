//! Request-path application service.
//!
//! Order submission, listings, balance reads and withdrawals for one
//! authenticated account. Each call makes a single attempt; the HTTP layer
//! owns the retry budget for the request path.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;

use crate::context::Context;
use crate::storage::{BalanceStore, OrderStore};
use crate::types::{AccountBalance, AccountId, Order, OrderNumber, Result, ServiceError, Withdrawal};

/// Parse a request-supplied order number and check its Luhn digit.
pub fn validate_order_number(raw: &str) -> Result<OrderNumber> {
    let number = OrderNumber::parse(raw)?;
    if !number.is_luhn_valid() {
        return Err(ServiceError::InvalidOrderNumber(number));
    }
    Ok(number)
}

#[derive(Clone)]
pub struct Ledger {
    orders: Arc<dyn OrderStore>,
    balances: Arc<dyn BalanceStore>,
}

impl Ledger {
    pub fn new(orders: Arc<dyn OrderStore>, balances: Arc<dyn BalanceStore>) -> Self {
        Self { orders, balances }
    }

    /// Register a new order for scoring.
    pub async fn submit_order(&self, ctx: &Context, account_id: AccountId, raw: &str) -> Result<()> {
        let number = validate_order_number(raw)?;
        let order = Order::new(number, account_id, Utc::now());
        self.orders.upload(ctx, &order).await
    }

    pub async fn orders(&self, ctx: &Context, account_id: AccountId) -> Result<Vec<Order>> {
        let orders = self.orders.orders(ctx, account_id).await?;
        if orders.is_empty() {
            return Err(ServiceError::NotFound);
        }
        Ok(orders)
    }

    pub async fn balance(&self, ctx: &Context, account_id: AccountId) -> Result<AccountBalance> {
        self.balances.balance(ctx, account_id).await
    }

    /// Debit `sum` from the account, referencing `raw_order`.
    ///
    /// Fails with `InsufficientFunds` when the balance does not cover the
    /// sum and with `BalanceChanged` when it moved between read and write.
    pub async fn withdraw(
        &self,
        ctx: &Context,
        account_id: AccountId,
        raw_order: &str,
        sum: Decimal,
    ) -> Result<()> {
        let order = validate_order_number(raw_order)?;
        if sum <= Decimal::ZERO {
            return Err(ServiceError::InvalidFormat(format!(
                "withdrawal sum must be positive, got {sum}"
            )));
        }

        let mut balance = self.balances.balance(ctx, account_id).await?;
        if balance.current < sum {
            return Err(ServiceError::InsufficientFunds {
                needed: sum,
                available: balance.current,
            });
        }

        balance.current -= sum;
        balance.withdrawn += sum;
        let withdrawal = Withdrawal {
            order,
            sum,
            processed_at: Utc::now(),
        };
        self.balances.withdraw(ctx, &balance, &withdrawal).await?;

        info!(
            request_id = %ctx.request_id(),
            account_id,
            sum = %sum,
            "Withdrawal accepted"
        );
        Ok(())
    }

    pub async fn withdrawals(&self, ctx: &Context, account_id: AccountId) -> Result<Vec<Withdrawal>> {
        let withdrawals = self.balances.withdrawals(ctx, account_id).await?;
        if withdrawals.is_empty() {
            return Err(ServiceError::NotFound);
        }
        Ok(withdrawals)
    }

    /// Storage reachability, for health checks.
    pub async fn ping(&self, ctx: &Context) -> Result<()> {
        self.orders.ping(ctx).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
