//! Order scoring poller.
//!
//! Each tick claims a batch of unscored orders per status, asks the scoring
//! service about every order with bounded concurrency, and writes all the
//! answers back as one batch update. Orders that produced no answer keep
//! their lease and are picked up again once it expires.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, info_span, warn, Instrument};

use super::retry::RetryExecutor;
use crate::context::Context;
use crate::scoring::ScoringClient;
use crate::storage::OrderStore;
use crate::types::{Order, OrderResult, OrderStatus, Result, ScoringResult, ServiceError};

/// Statuses the poller drains, in order. `Processing` goes first so an order
/// promoted out of `New` is not queried twice in the same tick.
const POLLED_STATUSES: [OrderStatus; 2] = [OrderStatus::Processing, OrderStatus::New];

/// Outcome counters for one tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub claimed: usize,
    pub updated: usize,
    /// The scoring service does not know the order yet.
    pub unknown: usize,
    pub failed: usize,
}

impl PollReport {
    fn absorb(&mut self, other: PollReport) {
        self.claimed += other.claimed;
        self.updated += other.updated;
        self.unknown += other.unknown;
        self.failed += other.failed;
    }
}

pub struct OrderScoringPoller {
    orders: Arc<dyn OrderStore>,
    scoring: Arc<dyn ScoringClient>,
    retry: RetryExecutor,
    batch_size: u32,
    concurrency: usize,
}

impl OrderScoringPoller {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        scoring: Arc<dyn ScoringClient>,
        retry: RetryExecutor,
        batch_size: u32,
        concurrency: usize,
    ) -> Self {
        Self {
            orders,
            scoring,
            retry,
            batch_size,
            concurrency: concurrency.max(1),
        }
    }

    /// One claim → score → update pass over every polled status.
    ///
    /// A failed pass is logged and the next status still runs; the tick
    /// fails only if every pass did.
    pub async fn tick(&self, ctx: &Context) -> Result<PollReport> {
        let mut report = PollReport::default();
        let mut first_error = None;
        let mut any_passed = false;

        for status in POLLED_STATUSES {
            match self.poll_status(ctx, status).await {
                Ok(pass) => {
                    report.absorb(pass);
                    any_passed = true;
                }
                Err(ServiceError::Cancelled) => return Err(ServiceError::Cancelled),
                Err(e) => {
                    error!(
                        request_id = %ctx.request_id(),
                        status = %status,
                        error = %e,
                        "Scoring pass failed, claimed orders left for next lease"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if !any_passed => Err(e),
            _ => Ok(report),
        }
    }

    async fn poll_status(&self, ctx: &Context, status: OrderStatus) -> Result<PollReport> {
        let claimed = self.orders.claim_batch(ctx, status, self.batch_size).await?;
        let mut report = PollReport {
            claimed: claimed.len(),
            ..PollReport::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        let answers: Vec<_> = stream::iter(claimed)
            .map(|order| async move {
                let answer = self.score(ctx, &order).await;
                (order, answer)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut results: Vec<OrderResult> = Vec::with_capacity(answers.len());
        for (order, answer) in answers {
            match answer {
                Ok(Some(scored)) => results.push(scored.to_order_result()),
                Ok(None) => report.unknown += 1,
                Err(ServiceError::Cancelled) => return Err(ServiceError::Cancelled),
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        request_id = %ctx.request_id(),
                        number = %order.number,
                        error = %e,
                        "Scoring failed, order left for next lease"
                    );
                }
            }
        }

        if !results.is_empty() {
            self.orders.update_batch(ctx, &results).await?;
            report.updated = results.len();
        }

        info!(
            request_id = %ctx.request_id(),
            status = %status,
            claimed = report.claimed,
            updated = report.updated,
            unknown = report.unknown,
            failed = report.failed,
            "Scoring batch complete"
        );
        Ok(report)
    }

    async fn score(&self, ctx: &Context, order: &Order) -> Result<Option<ScoringResult>> {
        let scoring = self.scoring.as_ref();
        let number = &order.number;
        self.retry
            .invoke(ctx, |attempt_ctx| async move {
                scoring.get_status(&attempt_ctx, number).await
            })
            .await
    }

    /// Tick every `every` until `ctx` is cancelled. Each tick runs under a
    /// child context with its own correlation id.
    pub async fn run(&self, ctx: &Context, every: Duration) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = every.as_millis() as u64, "Scoring poller started");

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = interval.tick() => {
                    let tick_ctx = ctx.child();
                    let span = info_span!("scoring_tick", request_id = %tick_ctx.request_id());
                    match self.tick(&tick_ctx).instrument(span).await {
                        Ok(_) => {}
                        Err(ServiceError::Cancelled) => break,
                        Err(e) => error!(request_id = %tick_ctx.request_id(), error = %e, "Scoring tick failed"),
                    }
                }
            }
        }

        info!("Scoring poller stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
