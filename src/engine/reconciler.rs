//! Balance reconciliation.
//!
//! Applies a scored order's award to its owner's balance exactly once. The
//! read → compute → conditional write cycle is wrapped in a
//! [`RetryExecutor`] that retries `BalanceChanged`, so a collision with a
//! concurrent withdrawal or reconciliation restarts from a fresh read.
//! A second reconciliation of the same order finds the order no longer in
//! `Processing` and fails with `NotFound` instead of crediting twice.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::retry::RetryExecutor;
use crate::context::Context;
use crate::storage::{BalanceStore, OrderStore};
use crate::types::{Order, Result, ServiceError};

/// Outcome counters for one reconciliation tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub claimed: usize,
    pub applied: usize,
    /// Already reconciled by a concurrent pass.
    pub skipped: usize,
    pub failed: usize,
}

pub struct BalanceReconciler {
    orders: Arc<dyn OrderStore>,
    balances: Arc<dyn BalanceStore>,
    retry: RetryExecutor,
    batch_size: u32,
    concurrency: usize,
}

impl BalanceReconciler {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        balances: Arc<dyn BalanceStore>,
        retry: RetryExecutor,
        batch_size: u32,
        concurrency: usize,
    ) -> Self {
        Self {
            orders,
            balances,
            retry,
            batch_size,
            concurrency: concurrency.max(1),
        }
    }

    /// Credit `order`'s award to its account and mark it `Processed`.
    pub async fn reconcile(&self, ctx: &Context, order: &Order) -> Result<()> {
        let accrual = match order.accrual {
            Some(accrual) if order.awaits_reconciliation() => accrual,
            _ => {
                debug!(
                    request_id = %ctx.request_id(),
                    number = %order.number,
                    status = %order.status,
                    "Order not awaiting reconciliation"
                );
                return Err(ServiceError::NotFound);
            }
        };
        if accrual < Decimal::ZERO {
            warn!(
                request_id = %ctx.request_id(),
                number = %order.number,
                accrual = %accrual,
                "Refusing to reconcile negative award"
            );
            return Err(ServiceError::Internal(format!(
                "order {} carries negative award {accrual}",
                order.number
            )));
        }

        let balances = self.balances.as_ref();
        self.retry
            .invoke(ctx, |attempt_ctx| async move {
                let mut balance = balances.balance(&attempt_ctx, order.account_id).await?;
                balance.current += accrual;
                balances.apply_order(&attempt_ctx, &balance, order).await
            })
            .await
    }

    /// Claim a batch of scored orders and reconcile them with bounded
    /// concurrency.
    pub async fn tick(&self, ctx: &Context) -> Result<ReconcileReport> {
        let claimed = self.orders.claim_scored(ctx, self.batch_size).await?;
        let mut report = ReconcileReport {
            claimed: claimed.len(),
            ..ReconcileReport::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<_> = stream::iter(claimed)
            .map(|order| async move {
                let outcome = self.reconcile(ctx, &order).await;
                (order, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut cancelled = false;
        for (order, outcome) in outcomes {
            match outcome {
                Ok(()) => report.applied += 1,
                Err(ServiceError::NotFound) => {
                    report.skipped += 1;
                    debug!(request_id = %ctx.request_id(), number = %order.number, "Order already reconciled");
                }
                Err(ServiceError::Cancelled) => cancelled = true,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        request_id = %ctx.request_id(),
                        number = %order.number,
                        account_id = order.account_id,
                        error = %e,
                        "Reconciliation failed, order left for next lease"
                    );
                }
            }
        }

        info!(
            request_id = %ctx.request_id(),
            claimed = report.claimed,
            applied = report.applied,
            skipped = report.skipped,
            failed = report.failed,
            "Reconciliation batch complete"
        );

        if cancelled {
            return Err(ServiceError::Cancelled);
        }
        Ok(report)
    }

    pub async fn run(&self, ctx: &Context, every: Duration) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = every.as_millis() as u64, "Balance reconciler started");

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = interval.tick() => {
                    let tick_ctx = ctx.child();
                    let span = info_span!("reconcile_tick", request_id = %tick_ctx.request_id());
                    match self.tick(&tick_ctx).instrument(span).await {
                        Ok(_) => {}
                        Err(ServiceError::Cancelled) => break,
                        Err(e) => error!(request_id = %tick_ctx.request_id(), error = %e, "Reconciliation tick failed"),
                    }
                }
            }
        }

        info!("Balance reconciler stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
