//! Market Settlement Engine scheduler
//!
//! Long-running process around the settlement core: opens the document
//! store, spawns the notification worker, and runs the metrics batch job on
//! a fixed interval. Resolution and sale handlers are invoked by the
//! serving layer through the library API; this binary owns only the
//! scheduled work.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

use market_engine::config::{now_ms, METRICS_INTERVAL_SECS};
use market_engine::job::MetricsJob;
use market_engine::metrics::{NoLoans, VolumeScoring};
use market_engine::notifications::spawn_notification_worker;
use market_engine::store::{SqliteStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with both stdout and file output
    let file_appender = tracing_appender::rolling::never(".", "engine.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("market_engine=info".parse()?);

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    let db_path = std::env::var("MARKET_DB").unwrap_or_else(|_| "markets.db".to_string());
    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::open(&db_path).context("failed to open document store")?);

    let notifications = spawn_notification_worker();
    let job = Arc::new(MetricsJob::new(store, Arc::new(NoLoans), Arc::new(VolumeScoring)));

    info!(
        "[MAIN] settlement engine started (db={}, metrics every {}s)",
        db_path, METRICS_INTERVAL_SECS
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(METRICS_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let job = job.clone();
                match tokio::task::spawn_blocking(move || job.run(now_ms())).await {
                    Ok(Ok(summary)) if summary.skipped => {}
                    Ok(Ok(summary)) => info!(
                        "[MAIN] metrics cycle done: {} contracts, {} users, {} snapshots, {} groups",
                        summary.contracts_updated,
                        summary.users_updated,
                        summary.snapshots_written,
                        summary.groups_updated
                    ),
                    Ok(Err(e)) => error!("[MAIN] metrics cycle failed: {}", e),
                    Err(e) => error!("[MAIN] metrics task panicked: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("[MAIN] shutting down");
                notifications.shutdown();
                break;
            }
        }
    }

    Ok(())
}
