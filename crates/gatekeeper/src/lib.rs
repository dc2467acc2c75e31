use std::sync::Arc;
use std::time::Duration;

use bet_ledger::BetLedger;
use blocklist::Blocklist;
use chrono::{DateTime, Utc};
use core_types::{
    LedgerError, MarketId, MembershipOracle, Phase, PlaceOutcome, Prediction, WalletAddress,
};
use tokio::time::timeout;

pub const DEFAULT_ORACLE_TIMEOUT: Duration = Duration::from_millis(1_500);

/// Front door for bet placement. Checks run in a fixed order: membership,
/// blocklist, betting window, then the ledger write. Everything after the
/// membership lookup touches SQLite and runs on the blocking pool.
pub struct Gatekeeper {
    oracle: Arc<dyn MembershipOracle>,
    blocklist: Arc<Blocklist>,
    ledger: Arc<BetLedger>,
    oracle_timeout: Duration,
}

impl Gatekeeper {
    pub fn new(
        oracle: Arc<dyn MembershipOracle>,
        blocklist: Arc<Blocklist>,
        ledger: Arc<BetLedger>,
    ) -> Self {
        Self {
            oracle,
            blocklist,
            ledger,
            oracle_timeout: DEFAULT_ORACLE_TIMEOUT,
        }
    }

    pub fn with_oracle_timeout(mut self, oracle_timeout: Duration) -> Self {
        self.oracle_timeout = oracle_timeout;
        self
    }

    pub async fn submit_bet(
        &self,
        wallet: &WalletAddress,
        market: &MarketId,
        prediction: &str,
        as_of: DateTime<Utc>,
    ) -> Result<PlaceOutcome, LedgerError> {
        let result = self.evaluate(wallet, market, prediction, as_of).await;
        if let Err(err) = &result {
            metrics::counter!("ledger.bet.rejected", "kind" => err.kind()).increment(1);
            tracing::info!(
                wallet = %wallet,
                market = %market,
                kind = err.kind(),
                error = %err,
                "bet rejected"
            );
        }
        result
    }

    async fn evaluate(
        &self,
        wallet: &WalletAddress,
        market: &MarketId,
        prediction: &str,
        as_of: DateTime<Utc>,
    ) -> Result<PlaceOutcome, LedgerError> {
        self.check_membership(wallet, market).await?;

        let blocklist = self.blocklist.clone();
        let ledger = self.ledger.clone();
        let wallet = wallet.clone();
        let market = market.clone();
        let prediction = prediction.to_string();
        tokio::task::spawn_blocking(move || {
            place_checked(&blocklist, &ledger, &wallet, &market, &prediction, as_of)
        })
        .await
        .map_err(|err| LedgerError::Storage(format!("ledger task failed: {err}")))?
    }

    /// Oracle failures and timeouts surface as `OracleUnavailable`, never as
    /// `NotParticipant`.
    async fn check_membership(
        &self,
        wallet: &WalletAddress,
        market: &MarketId,
    ) -> Result<(), LedgerError> {
        match timeout(self.oracle_timeout, self.oracle.is_participant(wallet, market)).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(LedgerError::NotParticipant),
            Ok(Err(err)) => {
                tracing::warn!(?err, market = %market, "membership oracle failed");
                Err(LedgerError::OracleUnavailable(format!("{err:#}")))
            }
            Err(_) => {
                metrics::counter!("oracle.timeout").increment(1);
                Err(LedgerError::OracleUnavailable(format!(
                    "membership lookup timed out after {}ms",
                    self.oracle_timeout.as_millis()
                )))
            }
        }
    }
}

fn place_checked(
    blocklist: &Blocklist,
    ledger: &BetLedger,
    wallet: &WalletAddress,
    market: &MarketId,
    prediction: &str,
    as_of: DateTime<Utc>,
) -> Result<PlaceOutcome, LedgerError> {
    if blocklist.is_blocked(wallet, market)? {
        return Err(LedgerError::Blocked);
    }

    let phase = window_policy::phase(as_of);
    if phase != Phase::Open {
        return Err(LedgerError::PhaseClosed(phase));
    }

    let prediction: Prediction = prediction.parse()?;
    ledger.place_or_replace(wallet, market, prediction, as_of)
}
