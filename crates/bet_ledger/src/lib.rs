use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use core_types::{
    Bet, DualView, LedgerError, LedgerEvent, MarketId, Phase, PlaceOutcome, Prediction,
    WalletAddress,
};
use event_bus::{emit, LedgerBus};
use ledger_store::{date_text, parse_date, ts_from_ms, LedgerStore, StorageResultExt};
use rusqlite::{params, Connection, Row};

const BET_COLUMNS: &str = "wallet, prediction, target_date, created_at_ms, updated_at_ms";

fn bet_from_row(row: &Row<'_>, market: &MarketId) -> Result<Bet, LedgerError> {
    let wallet: String = row.get(0).storage()?;
    let prediction: String = row.get(1).storage()?;
    let target_date: String = row.get(2).storage()?;
    Ok(Bet {
        wallet: WalletAddress::parse(&wallet)?,
        market: market.clone(),
        prediction: prediction
            .parse()
            .map_err(|_| LedgerError::Storage(format!("corrupt prediction {prediction:?}")))?,
        target_date: parse_date(&target_date)?,
        created_at: ts_from_ms(row.get(3).storage()?),
        updated_at: ts_from_ms(row.get(4).storage()?),
    })
}

pub fn bet_in(
    conn: &Connection,
    wallet: &WalletAddress,
    market: &MarketId,
    date: NaiveDate,
) -> Result<Option<Bet>, LedgerError> {
    let sql = format!(
        "SELECT {BET_COLUMNS} FROM bets WHERE wallet = ?1 AND market = ?2 AND target_date = ?3"
    );
    let mut stmt = conn.prepare_cached(&sql).storage()?;
    let mut rows = stmt
        .query(params![wallet.as_str(), market.as_str(), date_text(date)])
        .storage()?;
    match rows.next().storage()? {
        Some(row) => bet_from_row(row, market).map(Some),
        None => Ok(None),
    }
}

/// Most recent bet for (wallet, market) whose target date is `date` or earlier.
pub fn latest_until_in(
    conn: &Connection,
    wallet: &WalletAddress,
    market: &MarketId,
    date: NaiveDate,
) -> Result<Option<Bet>, LedgerError> {
    let sql = format!(
        "SELECT {BET_COLUMNS} FROM bets WHERE wallet = ?1 AND market = ?2 AND target_date <= ?3
         ORDER BY target_date DESC LIMIT 1"
    );
    let mut stmt = conn.prepare_cached(&sql).storage()?;
    let mut rows = stmt
        .query(params![wallet.as_str(), market.as_str(), date_text(date)])
        .storage()?;
    match rows.next().storage()? {
        Some(row) => bet_from_row(row, market).map(Some),
        None => Ok(None),
    }
}

/// Every bet targeting `date` in `market`, ordered by wallet.
pub fn bets_for_date_in(
    conn: &Connection,
    market: &MarketId,
    date: NaiveDate,
) -> Result<Vec<Bet>, LedgerError> {
    let sql = format!(
        "SELECT {BET_COLUMNS} FROM bets WHERE market = ?1 AND target_date = ?2 ORDER BY wallet"
    );
    let mut stmt = conn.prepare_cached(&sql).storage()?;
    let mut rows = stmt
        .query(params![market.as_str(), date_text(date)])
        .storage()?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().storage()? {
        out.push(bet_from_row(row, market)?);
    }
    Ok(out)
}

/// Per-wallet prediction ledger. Holds at most the resolved day's bet and the
/// next day's bet for each (wallet, market).
pub struct BetLedger {
    store: Arc<LedgerStore>,
    bus: Option<LedgerBus>,
}

impl BetLedger {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self { store, bus: None }
    }

    pub fn with_bus(mut self, bus: LedgerBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Places tomorrow's prediction or overwrites it if one exists.
    ///
    /// Window, blocklist, pruning and the upsert all run inside one
    /// transaction, so two racing placements for the same key end up as one
    /// insert followed by one overwrite.
    pub fn place_or_replace(
        &self,
        wallet: &WalletAddress,
        market: &MarketId,
        prediction: Prediction,
        as_of: DateTime<Utc>,
    ) -> Result<PlaceOutcome, LedgerError> {
        let target = window_policy::ensure_open(as_of)?;
        let resolved = window_policy::resolved_date(as_of);
        let now_ms = as_of.timestamp_millis();

        let outcome = self.store.write("place_bet", |conn| {
            if blocklist::is_blocked_in(conn, wallet, market)? {
                return Err(LedgerError::Blocked);
            }
            let replaced = bet_in(conn, wallet, market, target)?.is_some();

            conn.execute(
                "DELETE FROM bets
                 WHERE wallet = ?1 AND market = ?2 AND target_date NOT IN (?3, ?4)",
                params![
                    wallet.as_str(),
                    market.as_str(),
                    date_text(target),
                    date_text(resolved)
                ],
            )
            .storage()?;

            conn.execute(
                "INSERT INTO bets (wallet, market, target_date, prediction, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(wallet, market, target_date) DO UPDATE SET
                    prediction = excluded.prediction,
                    updated_at_ms = excluded.updated_at_ms",
                params![
                    wallet.as_str(),
                    market.as_str(),
                    date_text(target),
                    prediction.as_str(),
                    now_ms
                ],
            )
            .storage()?;

            let bet = bet_in(conn, wallet, market, target)?.ok_or_else(|| {
                LedgerError::Storage("bet row missing after upsert".to_string())
            })?;
            Ok(PlaceOutcome { bet, replaced })
        })?;

        if outcome.replaced {
            metrics::counter!("ledger.bet.replaced", "market" => market.to_string()).increment(1);
        } else {
            metrics::counter!("ledger.bet.placed", "market" => market.to_string()).increment(1);
        }
        tracing::info!(
            wallet = %wallet,
            market = %market,
            prediction = %prediction,
            target_date = %target,
            replaced = outcome.replaced,
            "bet recorded"
        );
        emit(self.bus.as_ref(), LedgerEvent::BetPlaced(outcome.clone()));
        Ok(outcome)
    }

    pub fn get_for_target_date(
        &self,
        wallet: &WalletAddress,
        market: &MarketId,
        date: NaiveDate,
    ) -> Result<Option<Bet>, LedgerError> {
        self.store.read(|conn| bet_in(conn, wallet, market, date))
    }

    /// Bet for the day being settled: the one whose target date is `date`,
    /// read as a result rather than an editable prediction.
    pub fn get_resolved(
        &self,
        wallet: &WalletAddress,
        market: &MarketId,
        date: NaiveDate,
    ) -> Result<Option<Bet>, LedgerError> {
        self.store.read(|conn| bet_in(conn, wallet, market, date))
    }

    /// Open: today's result next to tomorrow's editable prediction.
    /// ResultsPending: today's bet, flagged as awaiting settlement.
    /// Closed: the last bet stays visible as `last_result`.
    pub fn dual_view(
        &self,
        wallet: &WalletAddress,
        market: &MarketId,
        now: DateTime<Utc>,
    ) -> Result<DualView, LedgerError> {
        let phase = window_policy::phase(now);
        let today = window_policy::resolved_date(now);
        let tomorrow = window_policy::target_date(now);
        self.store.read(|conn| {
            let today_result = bet_in(conn, wallet, market, today)?;
            let view = match phase {
                Phase::Open => DualView {
                    phase,
                    today_result,
                    tomorrow_prediction: bet_in(conn, wallet, market, tomorrow)?,
                    awaiting_settlement: false,
                    last_result: None,
                },
                Phase::ResultsPending | Phase::Closed => DualView {
                    phase,
                    awaiting_settlement: phase == Phase::ResultsPending && today_result.is_some(),
                    today_result,
                    tomorrow_prediction: None,
                    last_result: latest_until_in(conn, wallet, market, today)?,
                },
            };
            Ok(view)
        })
    }

    pub fn bets_for_date(&self, market: &MarketId, date: NaiveDate) -> Result<Vec<Bet>, LedgerError> {
        self.store.read(|conn| bets_for_date_in(conn, market, date))
    }

    /// Number of rows held for (wallet, market) across all dates.
    pub fn row_count(&self, wallet: &WalletAddress, market: &MarketId) -> Result<usize, LedgerError> {
        self.store.read(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM bets WHERE wallet = ?1 AND market = ?2",
                params![wallet.as_str(), market.as_str()],
                |r| r.get::<_, i64>(0),
            )
            .storage()
            .map(|n| n as usize)
        })
    }
}
