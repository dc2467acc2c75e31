use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use bet_ledger::BetLedger;
use blocklist::Blocklist;
use core_types::{Clock, MarketRegistry, MembershipOracle, WalletAddress};
use event_bus::LedgerBus;
use gatekeeper::Gatekeeper;
use infra_clock::SystemClock;
use ledger_store::LedgerStore;
use membership_oracle::{HttpMembershipOracle, HttpOracleConfig, StaticMembershipOracle};
use metrics_exporter_prometheus::PrometheusHandle;
use observability::{init_metrics, init_tracing};
use referral_ledger::ReferralLedger;
use settlement_hook::SettlementHook;
use tokio::sync::broadcast::error::RecvError;
use window_policy::WindowPolicy;

use crate::config_loader::{load_engine_config, EngineConfig, OracleConfig, OracleKind};
use crate::ledger_api;

#[derive(Clone)]
pub(super) struct AppState {
    pub(super) registry: Arc<MarketRegistry>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) window: WindowPolicy,
    pub(super) gatekeeper: Arc<Gatekeeper>,
    pub(super) bets: Arc<BetLedger>,
    pub(super) blocklist: Arc<Blocklist>,
    pub(super) referrals: Arc<ReferralLedger>,
    pub(super) settlement: Arc<SettlementHook>,
    pub(super) bus: LedgerBus,
    pub(super) prometheus: PrometheusHandle,
}

pub(super) fn open_store(cfg: &EngineConfig) -> Result<LedgerStore> {
    let store = match cfg.storage.path.as_deref() {
        Some(path) => LedgerStore::open(Path::new(path))
            .with_context(|| format!("open ledger store {path}"))?,
        None => {
            tracing::warn!("storage.path not set; ledger state is in-memory only");
            LedgerStore::open_in_memory().context("open in-memory ledger store")?
        }
    };
    Ok(store)
}

fn build_oracle(
    cfg: &OracleConfig,
    registry: &MarketRegistry,
) -> Result<Arc<dyn MembershipOracle>> {
    match cfg.kind {
        OracleKind::Http => {
            let oracle = HttpMembershipOracle::new(HttpOracleConfig {
                base_url: cfg.base_url.clone(),
                request_timeout: cfg.timeout(),
            })?;
            Ok(Arc::new(oracle))
        }
        OracleKind::Static => {
            let oracle = StaticMembershipOracle::new();
            for (market, wallets) in &cfg.participants {
                let market = registry
                    .resolve(market)
                    .context("oracle.participants references an unknown market")?;
                for raw in wallets {
                    let wallet = WalletAddress::parse(raw)
                        .with_context(|| format!("oracle.participants[{market}]"))?;
                    oracle.add(&market, wallet);
                }
            }
            Ok(Arc::new(oracle))
        }
    }
}

pub(super) fn build_state(
    cfg: &EngineConfig,
    store: LedgerStore,
    clock: Arc<dyn Clock>,
    prometheus: PrometheusHandle,
) -> Result<AppState> {
    let registry = Arc::new(cfg.registry());
    let oracle = build_oracle(&cfg.oracle, &registry)?;
    let store = Arc::new(store);
    let bus = LedgerBus::new(cfg.server.event_bus_capacity.max(16));

    let blocklist = Arc::new(Blocklist::new(store.clone()).with_bus(bus.clone()));
    let bets = Arc::new(BetLedger::new(store.clone()).with_bus(bus.clone()));
    let referrals = Arc::new(ReferralLedger::new(store.clone()).with_bus(bus.clone()));
    let settlement = Arc::new(SettlementHook::new(store).with_bus(bus.clone()));
    let gatekeeper = Arc::new(
        Gatekeeper::new(oracle, blocklist.clone(), bets.clone())
            .with_oracle_timeout(cfg.oracle.timeout()),
    );

    Ok(AppState {
        registry,
        window: WindowPolicy::new(clock.clone()),
        clock,
        gatekeeper,
        bets,
        blocklist,
        referrals,
        settlement,
        bus,
        prometheus,
    })
}

/// Mirrors every ledger event into the `audit` tracing target.
pub(super) fn spawn_audit_logger(bus: &LedgerBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => tracing::info!(target: "audit", event = %line, "ledger event"),
                    Err(err) => tracing::warn!(error = %err, "ledger event not serializable"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    metrics::counter!("ledger.audit.lagged").increment(skipped);
                    tracing::warn!(skipped, "audit logger lagged behind ledger bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

pub(super) async fn async_main() -> Result<()> {
    let _guard = init_tracing("app_runner");
    let prometheus = init_metrics()?;

    let cfg = load_engine_config()?;
    let store = open_store(&cfg)?;
    let state = build_state(&cfg, store, Arc::new(SystemClock), prometheus)?;
    let _audit = spawn_audit_logger(&state.bus);

    let addr: SocketAddr = cfg
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid server.bind {:?}", cfg.server.bind))?;
    tracing::info!(
        %addr,
        markets = state.registry.len(),
        phase = %state.window.current_phase(),
        "prediwin ledger service starting"
    );

    let app = ledger_api::build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve http")?;
    tracing::info!("prediwin ledger service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "ctrl-c handler failed");
    }
}
