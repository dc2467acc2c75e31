use std::sync::OnceLock;

use anyhow::{Context, Result};
use metrics::{describe_counter, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing(service_name: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}=info,info")));

    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    guard
}

/// Installs the process-wide Prometheus recorder on first call and returns the
/// shared handle afterwards.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install prometheus recorder")?;
    describe_ledger_metrics();

    let _ = PROM_HANDLE.set(handle.clone());
    Ok(handle)
}

fn describe_ledger_metrics() {
    describe_counter!("ledger.bet.placed", Unit::Count, "new bet rows inserted");
    describe_counter!("ledger.bet.replaced", Unit::Count, "bets overwritten for the same target date");
    describe_counter!("ledger.bet.rejected", Unit::Count, "bet submissions refused, by error kind");
    describe_counter!("ledger.block.added", Unit::Count, "block entries created");
    describe_counter!("ledger.referral.linked", Unit::Count, "referral links recorded");
    describe_counter!("ledger.referral.confirmed", Unit::Count, "referral links confirmed");
    describe_counter!("ledger.free_entry.redeemed", Unit::Count, "free entries redeemed");
    describe_counter!("ledger.storage.retry", Unit::Count, "transactions retried after a transient conflict");
    describe_counter!("oracle.timeout", Unit::Count, "membership lookups that timed out");
    describe_counter!("ledger.audit.lagged", Unit::Count, "ledger events dropped by a slow audit subscriber");
}
