use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use core_types::{
    BlockScope, LedgerError, LedgerEvent, MarketId, Prediction, SettlementSummary,
};
use event_bus::{emit, LedgerBus};
use ledger_store::LedgerStore;

pub fn wrong_prediction_reason(date: NaiveDate) -> String {
    format!("wrong prediction for {date}")
}

/// Turns a day's outcome into block state. Wallets whose bet for `date`
/// missed are blocked from the market at the entry fee in force at `now`;
/// the rest are reported as survivors. Payouts are someone else's job.
pub struct SettlementHook {
    store: Arc<LedgerStore>,
    bus: Option<LedgerBus>,
}

impl SettlementHook {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self { store, bus: None }
    }

    pub fn with_bus(mut self, bus: LedgerBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn apply_outcome(
        &self,
        market: &MarketId,
        date: NaiveDate,
        outcome: Prediction,
        now: DateTime<Utc>,
    ) -> Result<SettlementSummary, LedgerError> {
        let reason = wrong_prediction_reason(date);
        let scope = BlockScope::Market(market.clone());
        let re_entry_fee = window_policy::entry_fee_micros(now);

        let (summary, newly_blocked) = self.store.write("apply_outcome", |conn| {
            let bets = bet_ledger::bets_for_date_in(conn, market, date)?;
            let mut blocked = Vec::new();
            let mut survivors = Vec::new();
            let mut newly_blocked = Vec::new();
            for bet in bets {
                if bet.prediction == outcome {
                    survivors.push(bet.wallet);
                    continue;
                }
                let (entry, inserted) = blocklist::block_in(
                    conn,
                    &bet.wallet,
                    &scope,
                    &reason,
                    re_entry_fee,
                    now,
                )?;
                if inserted {
                    newly_blocked.push(entry);
                }
                blocked.push(bet.wallet);
            }
            Ok((
                SettlementSummary {
                    market: market.clone(),
                    date,
                    outcome,
                    blocked,
                    survivors,
                },
                newly_blocked,
            ))
        })?;

        metrics::counter!("ledger.block.added").increment(newly_blocked.len() as u64);
        tracing::info!(
            market = %market,
            date = %date,
            outcome = %outcome,
            blocked = summary.blocked.len(),
            survivors = summary.survivors.len(),
            "outcome applied"
        );
        for entry in newly_blocked {
            emit(self.bus.as_ref(), LedgerEvent::WalletBlocked(entry));
        }
        emit(self.bus.as_ref(), LedgerEvent::OutcomeApplied(summary.clone()));
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bet_ledger::BetLedger;
    use blocklist::Blocklist;
    use chrono::TimeZone;
    use core_types::{MarketRegistry, WalletAddress};

    // 2024-06-04 is a Tuesday.
    fn tuesday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 4, 10, 0, 0).unwrap()
    }

    fn wallet(raw: &str) -> WalletAddress {
        WalletAddress::parse(raw).unwrap()
    }

    #[test]
    fn wrong_predictors_are_blocked_and_survivors_listed() {
        let store = Arc::new(LedgerStore::open_in_memory().unwrap());
        let registry = MarketRegistry::default();
        let btc = registry.resolve("bitcoin").unwrap();
        let eth = registry.resolve("ethereum").unwrap();
        let ledger = BetLedger::new(store.clone());
        let list = Blocklist::new(store.clone());
        let hook = SettlementHook::new(store);

        ledger.place_or_replace(&wallet("0x1"), &btc, Prediction::Up, tuesday()).unwrap();
        ledger.place_or_replace(&wallet("0x2"), &btc, Prediction::Down, tuesday()).unwrap();
        ledger.place_or_replace(&wallet("0x3"), &btc, Prediction::Up, tuesday()).unwrap();
        ledger.place_or_replace(&wallet("0x2"), &eth, Prediction::Down, tuesday()).unwrap();

        let wednesday = NaiveDate::from_ymd_opt(2024, 6, 5).unwrap();
        let summary = hook
            .apply_outcome(&btc, wednesday, Prediction::Up, tuesday())
            .unwrap();
        assert_eq!(summary.blocked, vec![wallet("0x2")]);
        assert_eq!(summary.survivors, vec![wallet("0x1"), wallet("0x3")]);

        assert!(list.is_blocked(&wallet("0x2"), &btc).unwrap());
        assert!(!list.is_blocked(&wallet("0x2"), &eth).unwrap());
        let entry = list.entry(&wallet("0x2"), &btc).unwrap().unwrap();
        assert_eq!(entry.reason, "wrong prediction for 2024-06-05");
        assert_eq!(entry.re_entry_fee_micros, window_policy::entry_fee_micros(tuesday()));
        assert_eq!(entry.re_entry_fee_micros, 40_000);

        // Re-applying the same outcome is harmless.
        let again = hook
            .apply_outcome(&btc, wednesday, Prediction::Up, tuesday())
            .unwrap();
        assert_eq!(again.blocked, summary.blocked);
        assert_eq!(list.entries(&btc).unwrap().len(), 1);
    }
}
