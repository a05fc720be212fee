//! LOYALTY: loyalty-point ledger
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the database, then runs the scoring poller, the balance
//! reconciler and the HTTP API until Ctrl+C.

use anyhow::{Context as _, Result};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{error, info};

use loyalty::api;
use loyalty::config::AppConfig;
use loyalty::context::Context;
use loyalty::engine::ledger::Ledger;
use loyalty::engine::poller::OrderScoringPoller;
use loyalty::engine::reconciler::BalanceReconciler;
use loyalty::engine::retry::RetryExecutor;
use loyalty::scoring::http::HttpScoringClient;
use loyalty::storage::SqliteStore;
use loyalty::types::ErrorKind;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = AppConfig::load_default()?;
    init_logging();

    info!(
        run_address = %cfg.server.run_address,
        accrual = %cfg.accrual.base_url,
        batch_size = cfg.processing.batch_size,
        concurrency = cfg.processing.concurrency,
        "LOYALTY starting up"
    );

    // -- Storage ---------------------------------------------------------

    let database_url = cfg.database_url()?;
    let store = SqliteStore::connect(
        database_url.expose_secret(),
        cfg.database.max_connections,
        cfg.processing.score_delta(),
    )
    .await
    .context("Failed to open database")?;
    store.migrate().await.context("Failed to apply schema")?;

    // -- Components ------------------------------------------------------

    let scoring = HttpScoringClient::new(&cfg.accrual.base_url, cfg.accrual.timeout())
        .context("Failed to build scoring client")?
        .with_transport_retries(cfg.accrual.transport_retries, cfg.accrual.transport_retry_wait());

    let poller = Arc::new(OrderScoringPoller::new(
        Arc::new(store.clone()),
        Arc::new(scoring),
        RetryExecutor::new(cfg.retry.scoring, ErrorKind::Internal),
        cfg.processing.batch_size,
        cfg.processing.concurrency,
    ));

    let reconciler = Arc::new(BalanceReconciler::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        RetryExecutor::new(cfg.retry.reconcile, ErrorKind::BalanceChanged),
        cfg.processing.batch_size,
        cfg.processing.concurrency,
    ));

    let ledger = Ledger::new(Arc::new(store.clone()), Arc::new(store.clone()));

    // -- Run ------------------------------------------------------------

    let (canceller, root) = Context::root();

    let poll_task = {
        let poller = poller.clone();
        let ctx = root.clone();
        let every = cfg.processing.poll_interval();
        tokio::spawn(async move { poller.run(&ctx, every).await })
    };

    let reconcile_task = {
        let reconciler = reconciler.clone();
        let ctx = root.clone();
        let every = cfg.processing.reconcile_interval();
        tokio::spawn(async move { reconciler.run(&ctx, every).await })
    };

    let state = api::app_state(ledger, cfg.retry.request, root.clone());
    let server = api::serve(state, &cfg.server.run_address, root.clone());
    tokio::pin!(server);

    info!("Press Ctrl+C to stop.");

    tokio::select! {
        res = &mut server => {
            if let Err(e) = &res {
                error!(error = %e, "API server exited");
            }
            canceller.cancel();
            res?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received.");
            canceller.cancel();
            server.await?;
        }
    }

    for (name, task) in [("poller", poll_task), ("reconciler", reconcile_task)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "Background task panicked");
        }
    }

    store.close().await;
    info!("LOYALTY shut down cleanly.");
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("loyalty=info"));

    let json_logging = std::env::var("LOYALTY_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
