use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bet_ledger::BetLedger;
use blocklist::Blocklist;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use core_types::{BlockScope, FreeEntrySource, MarketRegistry, Prediction, WalletAddress};
use ledger_store::LedgerStore;
use referral_ledger::ReferralLedger;
use serde::Deserialize;
use serde_json::{json, Value};
use settlement_hook::SettlementHook;

#[derive(Parser, Debug)]
#[command(name = "prediwin", about = "PrediWin ledger operations CLI", version)]
struct Cli {
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,
    #[arg(long, global = true, env = "PREDIWIN_DB_PATH", default_value = "data/prediwin.db")]
    db: PathBuf,
    #[arg(
        long,
        global = true,
        env = "PREDIWIN_CONFIG_PATH",
        default_value = "configs/prediwin.toml"
    )]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Betting phase and dates at `--at` (default: now).
    Phase {
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Entry fee for tomorrow's pot.
    Fee {
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Block a wallet in one market, or globally when `--market` is omitted.
    Block {
        #[arg(long)]
        wallet: String,
        #[arg(long)]
        market: Option<String>,
        #[arg(long, default_value = "manual block")]
        reason: String,
    },
    Unblock {
        #[arg(long)]
        wallet: String,
        #[arg(long)]
        market: Option<String>,
    },
    /// Blocklist entries affecting a market.
    Blocked {
        #[arg(long)]
        market: String,
    },
    /// Apply a day's outcome and block every wrong predictor.
    Settle {
        #[arg(long)]
        market: String,
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        outcome: String,
    },
    Bets {
        #[arg(long)]
        market: String,
        #[arg(long)]
        date: NaiveDate,
    },
    Stats {
        #[arg(long)]
        wallet: String,
    },
    Award {
        #[arg(long)]
        wallet: String,
        #[arg(long)]
        source: String,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CliConfig {
    markets: Vec<MarketEntry>,
}

#[derive(Debug, Deserialize)]
struct MarketEntry {
    id: String,
    display: String,
}

fn load_registry(path: &Path) -> Result<MarketRegistry> {
    let cfg: CliConfig = match fs::read_to_string(path) {
        Ok(raw) => toml::from_str(&raw).with_context(|| format!("parse {}", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => CliConfig::default(),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    if cfg.markets.is_empty() {
        return Ok(MarketRegistry::default());
    }
    Ok(MarketRegistry::new(
        cfg.markets.into_iter().map(|m| (m.id, m.display)),
    ))
}

fn scope_of(registry: &MarketRegistry, market: Option<&str>) -> Result<BlockScope> {
    Ok(match market {
        Some(raw) => BlockScope::Market(registry.resolve(raw)?),
        None => BlockScope::Global,
    })
}

/// Runs one command. `open_store` is only called by commands that touch the ledger.
fn execute(
    command: Commands,
    registry: &MarketRegistry,
    now: DateTime<Utc>,
    open_store: impl FnOnce() -> Result<Arc<LedgerStore>>,
) -> Result<Value> {
    let out = match command {
        Commands::Phase { at } => serde_json::to_value(window_policy::snapshot(at.unwrap_or(now)))?,
        Commands::Fee { at } => {
            let at = at.unwrap_or(now);
            json!({
                "target_date": window_policy::target_date(at),
                "entry_fee_micros": window_policy::entry_fee_micros(at),
            })
        }
        Commands::Block {
            wallet,
            market,
            reason,
        } => {
            let wallet = WalletAddress::parse(&wallet)?;
            let scope = scope_of(registry, market.as_deref())?;
            let entry = Blocklist::new(open_store()?).block(&wallet, scope, &reason, now)?;
            serde_json::to_value(entry)?
        }
        Commands::Unblock { wallet, market } => {
            let wallet = WalletAddress::parse(&wallet)?;
            let scope = scope_of(registry, market.as_deref())?;
            let removed = Blocklist::new(open_store()?).unblock(&wallet, scope)?;
            json!({ "removed": removed })
        }
        Commands::Blocked { market } => {
            let market = registry.resolve(&market)?;
            serde_json::to_value(Blocklist::new(open_store()?).entries(&market)?)?
        }
        Commands::Settle {
            market,
            date,
            outcome,
        } => {
            let market = registry.resolve(&market)?;
            let outcome: Prediction = outcome.parse()?;
            let summary =
                SettlementHook::new(open_store()?).apply_outcome(&market, date, outcome, now)?;
            serde_json::to_value(summary)?
        }
        Commands::Bets { market, date } => {
            let market = registry.resolve(&market)?;
            serde_json::to_value(BetLedger::new(open_store()?).bets_for_date(&market, date)?)?
        }
        Commands::Stats { wallet } => {
            let wallet = WalletAddress::parse(&wallet)?;
            serde_json::to_value(ReferralLedger::new(open_store()?).referral_stats(&wallet)?)?
        }
        Commands::Award { wallet, source } => {
            let wallet = WalletAddress::parse(&wallet)?;
            let source: FreeEntrySource = source.parse()?;
            let referrals = ReferralLedger::new(open_store()?);
            referrals.award_free_entry(&wallet, source, now)?;
            serde_json::to_value(referrals.referral_stats(&wallet)?)?
        }
    };
    Ok(out)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "warn" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .try_init();

    let registry = load_registry(&cli.config)?;
    let db = cli.db;
    let out = execute(cli.command, &registry, Utc::now(), || {
        tracing::debug!(db = %db.display(), "opening ledger store");
        let store = LedgerStore::open(&db).with_context(|| format!("open {}", db.display()))?;
        Ok(Arc::new(store))
    })?;
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
