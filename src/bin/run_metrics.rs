//! One-shot metrics job runner for manual invocation and backfills.
//!
//! Usage: run_metrics [db-path]

use anyhow::{Context, Result};
use std::sync::Arc;

use market_engine::config::now_ms;
use market_engine::job::MetricsJob;
use market_engine::metrics::{NoLoans, VolumeScoring};
use market_engine::store::{SqliteStore, Store};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let db_path = std::env::args().nth(1).unwrap_or_else(|| "markets.db".to_string());
    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::open(&db_path).context("failed to open document store")?);

    let job = MetricsJob::new(store, Arc::new(NoLoans), Arc::new(VolumeScoring));
    let summary = job.run(now_ms())?;

    println!(
        "metrics cycle done: {} contracts, {} users, {} snapshots, {} groups",
        summary.contracts_updated,
        summary.users_updated,
        summary.snapshots_written,
        summary.groups_updated
    );
    Ok(())
}
