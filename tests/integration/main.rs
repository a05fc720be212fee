//! End-to-end flow: submit → poll → reconcile → withdraw, over an
//! in-memory SQLite store and a scripted scoring service.

mod mock_scoring;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use loyalty::api::request_retry;
use loyalty::context::Context;
use loyalty::engine::ledger::Ledger;
use loyalty::engine::poller::OrderScoringPoller;
use loyalty::engine::reconciler::BalanceReconciler;
use loyalty::engine::retry::{RetryExecutor, RetryPolicy};
use loyalty::storage::{BalanceStore, OrderStore, SqliteStore};
use loyalty::types::{
    AccountBalance, AccountId, ErrorKind, Order, OrderNumber, OrderStatus, Result, ScoringStatus,
    ServiceError, Withdrawal,
};

use mock_scoring::MockScoring;

struct Harness {
    store: SqliteStore,
    scoring: MockScoring,
    poller: OrderScoringPoller,
    reconciler: BalanceReconciler,
    ledger: Ledger,
}

fn quick_policy() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 4)
}

async fn harness(lease: Duration) -> Harness {
    let store = SqliteStore::in_memory(lease).await.unwrap();
    let scoring = MockScoring::new();

    let poller = OrderScoringPoller::new(
        Arc::new(store.clone()),
        Arc::new(scoring.clone()),
        RetryExecutor::new(quick_policy(), ErrorKind::Internal),
        50,
        4,
    );
    let reconciler = BalanceReconciler::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        RetryExecutor::new(quick_policy(), ErrorKind::BalanceChanged),
        50,
        4,
    );
    let ledger = Ledger::new(Arc::new(store.clone()), Arc::new(store.clone()));

    Harness { store, scoring, poller, reconciler, ledger }
}

fn num(s: &str) -> OrderNumber {
    OrderNumber::parse(s).unwrap()
}

async fn upload(store: &SqliteStore, number: &str, account_id: i64) {
    store
        .upload(&Context::detached(), &Order::new(num(number), account_id, Utc::now()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unknown_order_changes_nothing() {
    let h = harness(Duration::ZERO).await;
    let ctx = Context::detached();
    upload(&h.store, "1234562", 1).await;

    let polled = h.poller.tick(&ctx).await.unwrap();
    assert_eq!(polled.unknown, 1);
    let reconciled = h.reconciler.tick(&ctx).await.unwrap();
    assert_eq!(reconciled.claimed, 0);

    let balance = h.store.balance(&ctx, 1).await.unwrap();
    assert_eq!((balance.current, balance.version), (Decimal::ZERO, 0));

    let order = h.store.order(&ctx, &num("1234562")).await.unwrap().unwrap();
    assert!(!order.status.is_terminal());

    // Next cycle asks again once the lease has lapsed.
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.poller.tick(&ctx).await.unwrap();
    assert_eq!(h.scoring.calls_for("1234562"), 2);
}

#[tokio::test]
async fn test_processed_order_credited_exactly_once() {
    let h = harness(Duration::from_secs(30)).await;
    let ctx = Context::detached();
    upload(&h.store, "1234562", 1).await;
    h.scoring.set("1234562", ScoringStatus::Processed, Some(dec!(50)));

    h.poller.tick(&ctx).await.unwrap();
    let scored = h.store.order(&ctx, &num("1234562")).await.unwrap().unwrap();
    assert!(scored.awaits_reconciliation());

    let report = h.reconciler.tick(&ctx).await.unwrap();
    assert_eq!(report.applied, 1);

    let balance = h.store.balance(&ctx, 1).await.unwrap();
    assert_eq!(balance.current, dec!(50));
    assert_eq!(balance.version, 1);

    let done = h.store.order(&ctx, &num("1234562")).await.unwrap().unwrap();
    assert_eq!(done.status, OrderStatus::Processed);

    let again = h.reconciler.reconcile(&ctx, &scored).await.unwrap_err();
    assert!(matches!(again, ServiceError::NotFound));
    assert_eq!(h.store.balance(&ctx, 1).await.unwrap().current, dec!(50));

    // Terminal orders are never claimed again.
    assert_eq!(h.poller.tick(&ctx).await.unwrap().claimed, 0);
    assert_eq!(h.scoring.calls_for("1234562"), 1);
}

#[tokio::test]
async fn test_invalid_order_has_no_balance_effect() {
    let h = harness(Duration::from_secs(30)).await;
    let ctx = Context::detached();
    upload(&h.store, "18", 3).await;
    h.scoring.set("18", ScoringStatus::Invalid, None);

    h.poller.tick(&ctx).await.unwrap();
    assert_eq!(h.reconciler.tick(&ctx).await.unwrap().claimed, 0);

    let order = h.store.order(&ctx, &num("18")).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Invalid);
    assert_eq!(h.store.balance(&ctx, 3).await.unwrap().current, Decimal::ZERO);
}

#[tokio::test]
async fn test_rate_limited_order_is_retried_then_left() {
    let h = harness(Duration::from_secs(30)).await;
    let ctx = Context::detached();
    upload(&h.store, "26", 1).await;
    h.scoring.rate_limit("26");

    let report = h.poller.tick(&ctx).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.scoring.calls_for("26"), 4);

    let order = h.store.order(&ctx, &num("26")).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::New);
}

#[tokio::test]
async fn test_submit_score_reconcile_withdraw() {
    let h = harness(Duration::from_secs(30)).await;
    let ctx = Context::detached();

    h.ledger.submit_order(&ctx, 9, "12345678903").await.unwrap();
    h.ledger.submit_order(&ctx, 9, "79927398713").await.unwrap();
    h.scoring.set("12345678903", ScoringStatus::Processed, Some(dec!(729.98)));
    h.scoring.set("79927398713", ScoringStatus::Registered, None);

    h.poller.tick(&ctx).await.unwrap();
    h.reconciler.tick(&ctx).await.unwrap();

    let orders = h.ledger.orders(&ctx, 9).await.unwrap();
    let statuses: Vec<_> = orders.iter().map(|o| (o.number.as_str(), o.status)).collect();
    assert!(statuses.contains(&("12345678903", OrderStatus::Processed)));
    assert!(statuses.contains(&("79927398713", OrderStatus::Processing)));

    let err = h.ledger.withdraw(&ctx, 9, "2377225624", dec!(1000)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientFunds);

    h.ledger.withdraw(&ctx, 9, "2377225624", dec!(500)).await.unwrap();
    let balance = h.ledger.balance(&ctx, 9).await.unwrap();
    assert_eq!(balance.current, dec!(229.98));
    assert_eq!(balance.withdrawn, dec!(500));

    let withdrawals = h.ledger.withdrawals(&ctx, 9).await.unwrap();
    assert_eq!(withdrawals.len(), 1);
    assert_eq!(withdrawals[0].order.as_str(), "2377225624");
}

#[tokio::test]
async fn test_withdraw_alongside_reconcile_tick_converges() {
    let h = harness(Duration::from_secs(30)).await;
    let ctx = Context::detached();

    upload(&h.store, "18", 1).await;
    h.scoring.set("18", ScoringStatus::Processed, Some(dec!(100)));
    h.poller.tick(&ctx).await.unwrap();
    h.reconciler.tick(&ctx).await.unwrap();

    upload(&h.store, "26", 1).await;
    h.scoring.set("26", ScoringStatus::Processed, Some(dec!(50)));
    h.poller.tick(&ctx).await.unwrap();

    let retry = request_retry(quick_policy());
    let ledger = &h.ledger;
    let withdraw = retry.invoke(&ctx, |attempt_ctx| async move {
        ledger.withdraw(&attempt_ctx, 1, "2377225624", dec!(30)).await
    });
    let reconcile = h.reconciler.tick(&ctx);

    let (withdrawn, reconciled) = tokio::join!(withdraw, reconcile);
    withdrawn.unwrap();
    assert_eq!(reconciled.unwrap().applied, 1);

    let balance = h.store.balance(&ctx, 1).await.unwrap();
    assert_eq!(balance.current, dec!(100) + dec!(50) - dec!(30));
    assert_eq!(balance.withdrawn, dec!(30));
    assert_eq!(balance.version, 3);
}

/// Reconciles `pending` right before the first withdrawal write, so that
/// write carries a stale version.
struct ReconcileBeforeWithdraw {
    inner: SqliteStore,
    reconciler: BalanceReconciler,
    pending: Mutex<Option<Order>>,
    withdraw_calls: AtomicU32,
    collisions: AtomicU32,
}

#[async_trait]
impl BalanceStore for ReconcileBeforeWithdraw {
    async fn balance(&self, ctx: &Context, account_id: AccountId) -> Result<AccountBalance> {
        self.inner.balance(ctx, account_id).await
    }

    async fn apply_order(&self, ctx: &Context, updated: &AccountBalance, order: &Order) -> Result<()> {
        self.inner.apply_order(ctx, updated, order).await
    }

    async fn withdraw(&self, ctx: &Context, updated: &AccountBalance, withdrawal: &Withdrawal) -> Result<()> {
        self.withdraw_calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.pending.lock().unwrap().take();
        if let Some(order) = pending {
            self.reconciler.reconcile(ctx, &order).await?;
        }

        let res = self.inner.withdraw(ctx, updated, withdrawal).await;
        if matches!(res, Err(ServiceError::BalanceChanged(_))) {
            self.collisions.fetch_add(1, Ordering::SeqCst);
        }
        res
    }

    async fn withdrawals(&self, ctx: &Context, account_id: AccountId) -> Result<Vec<Withdrawal>> {
        self.inner.withdrawals(ctx, account_id).await
    }
}

#[tokio::test]
async fn test_withdraw_losing_to_reconcile_is_retried() {
    let h = harness(Duration::from_secs(30)).await;
    let ctx = Context::detached();

    upload(&h.store, "18", 1).await;
    h.scoring.set("18", ScoringStatus::Processed, Some(dec!(100)));
    h.poller.tick(&ctx).await.unwrap();
    h.reconciler.tick(&ctx).await.unwrap();
    let before = h.store.balance(&ctx, 1).await.unwrap();

    upload(&h.store, "26", 1).await;
    h.scoring.set("26", ScoringStatus::Processed, Some(dec!(50)));
    h.poller.tick(&ctx).await.unwrap();
    let scored = h.store.order(&ctx, &num("26")).await.unwrap().unwrap();
    assert!(scored.awaits_reconciliation());

    let racing = Arc::new(ReconcileBeforeWithdraw {
        inner: h.store.clone(),
        reconciler: BalanceReconciler::new(
            Arc::new(h.store.clone()),
            Arc::new(h.store.clone()),
            RetryExecutor::new(quick_policy(), ErrorKind::BalanceChanged),
            50,
            1,
        ),
        pending: Mutex::new(Some(scored)),
        withdraw_calls: AtomicU32::new(0),
        collisions: AtomicU32::new(0),
    });
    let ledger = Ledger::new(Arc::new(h.store.clone()), racing.clone());
    let ledger = &ledger;

    request_retry(quick_policy())
        .invoke(&ctx, |attempt_ctx| async move {
            ledger.withdraw(&attempt_ctx, 1, "2377225624", dec!(30)).await
        })
        .await
        .unwrap();

    assert_eq!(racing.collisions.load(Ordering::SeqCst), 1);
    assert_eq!(racing.withdraw_calls.load(Ordering::SeqCst), 2);

    let after = h.store.balance(&ctx, 1).await.unwrap();
    assert_eq!(after.current, before.current + dec!(50) - dec!(30));
    assert_eq!(after.withdrawn, dec!(30));
    assert_eq!(after.version, before.version + 2);

    // The rolled-back attempt left no journal entry behind.
    assert_eq!(h.store.withdrawals(&ctx, 1).await.unwrap().len(), 1);
    let credited = h.store.order(&ctx, &num("26")).await.unwrap().unwrap();
    assert_eq!(credited.status, OrderStatus::Processed);
}

#[tokio::test]
async fn test_shutdown_stops_background_tasks() {
    let h = harness(Duration::from_secs(30)).await;
    let poller = Arc::new(h.poller);
    let reconciler = Arc::new(h.reconciler);
    let (canceller, root) = Context::root();

    let poll_task = {
        let (poller, ctx) = (poller.clone(), root.clone());
        tokio::spawn(async move { poller.run(&ctx, Duration::from_millis(10)).await })
    };
    let reconcile_task = {
        let (reconciler, ctx) = (reconciler.clone(), root.clone());
        tokio::spawn(async move { reconciler.run(&ctx, Duration::from_millis(10)).await })
    };

    upload(&h.store, "34", 2).await;
    h.scoring.set("34", ScoringStatus::Processed, Some(dec!(7)));

    let ctx = Context::detached();
    let mut credited = false;
    for _ in 0..100 {
        if h.store.balance(&ctx, 2).await.unwrap().current == dec!(7) {
            credited = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(credited, "background tasks never credited the order");

    canceller.cancel();
    tokio::time::timeout(Duration::from_secs(2), async {
        poll_task.await.unwrap();
        reconcile_task.await.unwrap();
    })
    .await
    .unwrap();
}
