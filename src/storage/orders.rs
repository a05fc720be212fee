//! Order rows: submission, the claim-lease queue and batch result writes.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info, warn};

use super::{from_millis, parse_amount, to_millis, OrderStore, SqliteStore};
use crate::context::Context;
use crate::types::{AccountId, Order, OrderNumber, OrderResult, OrderStatus, Result, ServiceError};

const ORDER_COLUMNS: &str = "number, account_id, status, accrual, uploaded_at, claimed_until";

/// Select-and-mark in one statement so two claimers can never lease the
/// same row. `{filter}` narrows the queue.
fn claim_sql(filter: &str) -> String {
    format!(
        "UPDATE orders SET claimed_until = ?1 \
         WHERE number IN ( \
             SELECT number FROM orders \
             WHERE status = ?2 AND {filter} AND claimed_until < ?3 \
             ORDER BY uploaded_at, number \
             LIMIT ?4 \
         ) \
         RETURNING {ORDER_COLUMNS}"
    )
}

fn order_from_row(row: &SqliteRow) -> Result<Order> {
    let number: String = row.try_get("number")?;
    let status: String = row.try_get("status")?;
    let accrual: Option<String> = row.try_get("accrual")?;

    Ok(Order {
        number: OrderNumber::parse(&number)?,
        account_id: row.try_get("account_id")?,
        status: status.parse()?,
        accrual: accrual.as_deref().map(parse_amount).transpose()?,
        uploaded_at: from_millis(row.try_get("uploaded_at")?)?,
        claimed_until: from_millis(row.try_get("claimed_until")?)?,
    })
}

impl SqliteStore {
    async fn claim(
        &self,
        ctx: &Context,
        status: OrderStatus,
        filter: &str,
        limit: u32,
    ) -> Result<Vec<Order>> {
        let now = Utc::now();
        let lease_until = now
            + chrono::Duration::from_std(self.score_delta)
                .map_err(|e| ServiceError::Internal(format!("lease duration out of range: {e}")))?;

        let sql = claim_sql(filter);
        let rows = ctx
            .run(async {
                let rows = sqlx::query(&sql)
                    .bind(to_millis(lease_until))
                    .bind(status.as_str())
                    .bind(to_millis(now))
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?;
                Ok(rows)
            })
            .await?;

        let mut claimed = rows.iter().map(order_from_row).collect::<Result<Vec<_>>>()?;
        claimed.sort_by(|a, b| {
            a.uploaded_at
                .cmp(&b.uploaded_at)
                .then_with(|| a.number.cmp(&b.number))
        });

        debug!(
            request_id = %ctx.request_id(),
            status = %status,
            limit,
            claimed = claimed.len(),
            "Orders claimed"
        );
        Ok(claimed)
    }
}

#[async_trait]
impl OrderStore for SqliteStore {
    async fn upload(&self, ctx: &Context, order: &Order) -> Result<()> {
        ctx.run(async {
            let inserted = sqlx::query(
                "INSERT INTO orders (number, account_id, status, accrual, uploaded_at, claimed_until) \
                 VALUES (?1, ?2, ?3, NULL, ?4, ?5) \
                 ON CONFLICT (number) DO NOTHING \
                 RETURNING number",
            )
            .bind(order.number.as_str())
            .bind(order.account_id)
            .bind(OrderStatus::New.as_str())
            .bind(to_millis(order.uploaded_at))
            .bind(to_millis(order.claimed_until))
            .fetch_optional(&self.pool)
            .await?;

            if inserted.is_some() {
                info!(
                    request_id = %ctx.request_id(),
                    number = %order.number,
                    account_id = order.account_id,
                    "Order uploaded"
                );
                return Ok(());
            }

            let owner: AccountId =
                sqlx::query_scalar("SELECT account_id FROM orders WHERE number = ?1")
                    .bind(order.number.as_str())
                    .fetch_one(&self.pool)
                    .await?;

            if owner == order.account_id {
                debug!(request_id = %ctx.request_id(), number = %order.number, "Order already uploaded by owner");
                Err(ServiceError::AlreadyAccepted(order.number.clone()))
            } else {
                info!(
                    request_id = %ctx.request_id(),
                    number = %order.number,
                    account_id = order.account_id,
                    owner,
                    "Order number belongs to another account"
                );
                Err(ServiceError::Conflict(order.number.clone()))
            }
        })
        .await
    }

    async fn claim_batch(&self, ctx: &Context, status: OrderStatus, limit: u32) -> Result<Vec<Order>> {
        self.claim(ctx, status, "accrual IS NULL", limit).await
    }

    async fn claim_scored(&self, ctx: &Context, limit: u32) -> Result<Vec<Order>> {
        self.claim(ctx, OrderStatus::Processing, "accrual IS NOT NULL", limit)
            .await
    }

    async fn ping(&self, ctx: &Context) -> Result<()> {
        ctx.run(async {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    async fn update_batch(&self, ctx: &Context, results: &[OrderResult]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }

        ctx.run(async {
            let mut tx = self.pool.begin().await?;

            for result in results {
                let updated = sqlx::query(
                    "UPDATE orders SET status = ?1, accrual = ?2, claimed_until = 0 \
                     WHERE number = ?3 AND status NOT IN ('PROCESSED', 'INVALID')",
                )
                .bind(result.status.as_str())
                .bind(result.accrual.map(|a| a.to_string()))
                .bind(result.number.as_str())
                .execute(&mut *tx)
                .await?;

                if updated.rows_affected() == 0 {
                    warn!(
                        request_id = %ctx.request_id(),
                        number = %result.number,
                        "Batch update target missing or terminal, rolling back"
                    );
                    return Err(ServiceError::NotFound);
                }
            }

            tx.commit().await?;
            info!(request_id = %ctx.request_id(), count = results.len(), "Order batch updated");
            Ok(())
        })
        .await
    }

    async fn orders(&self, ctx: &Context, account_id: AccountId) -> Result<Vec<Order>> {
        let rows = ctx
            .run(async {
                let rows = sqlx::query(&format!(
                    "SELECT {ORDER_COLUMNS} FROM orders WHERE account_id = ?1 \
                     ORDER BY uploaded_at, number"
                ))
                .bind(account_id)
                .fetch_all(&self.pool)
                .await?;
                Ok(rows)
            })
            .await?;

        rows.iter().map(order_from_row).collect()
    }

    async fn order(&self, ctx: &Context, number: &OrderNumber) -> Result<Option<Order>> {
        let row = ctx
            .run(async {
                let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE number = ?1"))
                    .bind(number.as_str())
                    .fetch_optional(&self.pool)
                    .await?;
                Ok(row)
            })
            .await?;

        row.as_ref().map(order_from_row).transpose()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
