//! Balance rows and the withdrawal journal.
//!
//! Every balance write is conditioned on the version the caller read; a
//! mismatch surfaces as `BalanceChanged` and the caller re-reads.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, info};

use super::{from_millis, parse_amount, to_millis, BalanceStore, SqliteStore};
use crate::context::Context;
use crate::types::{
    AccountBalance, AccountId, Order, OrderNumber, OrderStatus, Result, ServiceError, Withdrawal,
};

fn balance_from_row(row: &SqliteRow) -> Result<AccountBalance> {
    let current: String = row.try_get("current")?;
    let withdrawn: String = row.try_get("withdrawn")?;

    Ok(AccountBalance {
        balance_id: row.try_get("balance_id")?,
        account_id: row.try_get("account_id")?,
        current: parse_amount(&current)?,
        withdrawn: parse_amount(&withdrawn)?,
        version: row.try_get("version")?,
    })
}

/// Compare-and-swap on the version column.
async fn write_balance(tx: &mut Transaction<'_, Sqlite>, updated: &AccountBalance) -> Result<()> {
    if updated.current.is_sign_negative() && !updated.current.is_zero() {
        return Err(ServiceError::Internal(format!(
            "refusing to store negative balance {} for account {}",
            updated.current, updated.account_id
        )));
    }

    let res = sqlx::query(
        "UPDATE balances SET current = ?1, withdrawn = ?2, version = version + 1 \
         WHERE account_id = ?3 AND version = ?4",
    )
    .bind(updated.current.to_string())
    .bind(updated.withdrawn.to_string())
    .bind(updated.account_id)
    .bind(updated.version)
    .execute(&mut **tx)
    .await?;

    if res.rows_affected() == 0 {
        return Err(ServiceError::BalanceChanged(updated.account_id));
    }
    Ok(())
}

#[async_trait]
impl BalanceStore for SqliteStore {
    async fn balance(&self, ctx: &Context, account_id: AccountId) -> Result<AccountBalance> {
        ctx.run(async {
            sqlx::query("INSERT INTO balances (account_id) VALUES (?1) ON CONFLICT (account_id) DO NOTHING")
                .bind(account_id)
                .execute(&self.pool)
                .await?;

            let row = sqlx::query(
                "SELECT balance_id, account_id, current, withdrawn, version \
                 FROM balances WHERE account_id = ?1",
            )
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;

            balance_from_row(&row)
        })
        .await
    }

    async fn apply_order(&self, ctx: &Context, updated: &AccountBalance, order: &Order) -> Result<()> {
        let accrual = order
            .accrual
            .ok_or_else(|| ServiceError::Internal(format!("order {} has no award", order.number)))?;

        ctx.run(async {
            let mut tx = self.pool.begin().await?;

            let marked = sqlx::query(
                "UPDATE orders SET status = ?1, claimed_until = 0 \
                 WHERE number = ?2 AND account_id = ?3 AND status = ?4 AND accrual = ?5",
            )
            .bind(OrderStatus::Processed.as_str())
            .bind(order.number.as_str())
            .bind(order.account_id)
            .bind(OrderStatus::Processing.as_str())
            .bind(accrual.to_string())
            .execute(&mut *tx)
            .await?;

            if marked.rows_affected() == 0 {
                debug!(request_id = %ctx.request_id(), number = %order.number, "Order no longer awaiting reconciliation");
                return Err(ServiceError::NotFound);
            }

            write_balance(&mut tx, updated).await?;
            tx.commit().await?;

            info!(
                request_id = %ctx.request_id(),
                number = %order.number,
                account_id = updated.account_id,
                accrual = %accrual,
                current = %updated.current,
                version = updated.version + 1,
                "Order award applied to balance"
            );
            Ok(())
        })
        .await
    }

    async fn withdraw(
        &self,
        ctx: &Context,
        updated: &AccountBalance,
        withdrawal: &Withdrawal,
    ) -> Result<()> {
        ctx.run(async {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                "INSERT INTO withdrawals (balance_id, number, sum, processed_at) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(updated.balance_id)
            .bind(withdrawal.order.as_str())
            .bind(withdrawal.sum.to_string())
            .bind(to_millis(withdrawal.processed_at))
            .execute(&mut *tx)
            .await?;

            write_balance(&mut tx, updated).await?;
            tx.commit().await?;

            info!(
                request_id = %ctx.request_id(),
                account_id = updated.account_id,
                order = %withdrawal.order,
                sum = %withdrawal.sum,
                current = %updated.current,
                "Withdrawal recorded"
            );
            Ok(())
        })
        .await
    }

    async fn withdrawals(&self, ctx: &Context, account_id: AccountId) -> Result<Vec<Withdrawal>> {
        let rows = ctx
            .run(async {
                let rows = sqlx::query(
                    "SELECT w.number, w.sum, w.processed_at FROM withdrawals w \
                     INNER JOIN balances b ON b.balance_id = w.balance_id \
                     WHERE b.account_id = ?1 \
                     ORDER BY w.processed_at, w.withdrawal_id",
                )
                .bind(account_id)
                .fetch_all(&self.pool)
                .await?;
                Ok(rows)
            })
            .await?;

        rows.iter()
            .map(|row| {
                let number: String = row.try_get("number")?;
                let sum: String = row.try_get("sum")?;
                Ok(Withdrawal {
                    order: OrderNumber::parse(&number)?,
                    sum: parse_amount(&sum)?,
                    processed_at: from_millis(row.try_get("processed_at")?)?,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
