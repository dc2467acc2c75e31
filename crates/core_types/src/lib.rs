use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lowercase-normalized wallet address. Every ledger key uses this form so
/// `0xAbC` and `0xabc` always land on the same rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(LedgerError::InvalidWallet(raw.to_string()));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WalletAddress> for String {
    fn from(value: WalletAddress) -> Self {
        value.0
    }
}

/// Key of a registered market. Only [`MarketRegistry::resolve`] hands these
/// out, so a `MarketId` always names a known prediction table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MarketId(String);

impl MarketId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Market {
    pub id: MarketId,
    pub display: String,
}

#[derive(Debug, Clone)]
pub struct MarketRegistry {
    markets: BTreeMap<String, Market>,
}

impl MarketRegistry {
    /// Builds a registry from `(id, display)` pairs. Ids are matched
    /// case-insensitively; later duplicates replace earlier ones.
    pub fn new<I, K, D>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, D)>,
        K: AsRef<str>,
        D: Into<String>,
    {
        let mut markets = BTreeMap::new();
        for (id, display) in entries {
            let key = id.as_ref().trim().to_ascii_lowercase();
            if key.is_empty() {
                continue;
            }
            markets.insert(
                key.clone(),
                Market {
                    id: MarketId(key),
                    display: display.into(),
                },
            );
        }
        Self { markets }
    }

    pub fn resolve(&self, raw: &str) -> Result<MarketId, LedgerError> {
        let key = raw.trim().to_ascii_lowercase();
        self.markets
            .get(&key)
            .map(|m| m.id.clone())
            .ok_or_else(|| LedgerError::UnknownMarket(raw.to_string()))
    }

    pub fn get(&self, id: &MarketId) -> Option<&Market> {
        self.markets.get(id.as_str())
    }

    pub fn all(&self) -> impl Iterator<Item = &Market> {
        self.markets.values()
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }
}

impl Default for MarketRegistry {
    fn default() -> Self {
        Self::new([
            ("bitcoin", "Bitcoin Up/Down"),
            ("ethereum", "Ethereum Up/Down"),
            ("featured", "Featured - Random Topics"),
            ("crypto", "Crypto Featured"),
        ])
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Prediction {
    Up,
    Down,
}

impl Prediction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Prediction {
    type Err = LedgerError;

    // "positive"/"negative" are the legacy spellings still sent by older clients.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" | "positive" => Ok(Self::Up),
            "down" | "negative" => Ok(Self::Down),
            _ => Err(LedgerError::InvalidPrediction(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Open,
    ResultsPending,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Open => "open",
            Self::ResultsPending => "results_pending",
            Self::Closed => "closed",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Bet {
    pub wallet: WalletAddress,
    pub market: MarketId,
    pub prediction: Prediction,
    pub target_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlaceOutcome {
    pub bet: Bet,
    /// True when an existing row for the same target date was overwritten.
    pub replaced: bool,
}

/// "Today's result / tomorrow's prediction" for one wallet in one market.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DualView {
    pub phase: Phase,
    pub today_result: Option<Bet>,
    /// Only populated while betting is open.
    pub tomorrow_prediction: Option<Bet>,
    /// True on Friday when `today_result` is still waiting for settlement.
    pub awaiting_settlement: bool,
    /// Outside the open phase, the most recent bet dated today or earlier.
    pub last_result: Option<Bet>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BlockScope {
    Market(MarketId),
    Global,
}

impl fmt::Display for BlockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market(id) => write!(f, "{id}"),
            Self::Global => f.write_str("global"),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BlockEntry {
    pub wallet: WalletAddress,
    pub scope: BlockScope,
    pub reason: String,
    /// Entry fee owed to bet again. Zero for manual blocks.
    pub re_entry_fee_micros: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReferralCode {
    pub owner: WalletAddress,
    pub code: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReferralLink {
    pub referrer: WalletAddress,
    pub referred: WalletAddress,
    pub code: String,
    pub confirmed: bool,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RedemptionEvent {
    pub id: String,
    pub wallet: WalletAddress,
    /// 1-based position of this redemption in the wallet's history.
    pub seq: u32,
    /// Caller-supplied idempotency key, if any.
    pub request_id: Option<String>,
    pub redeemed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FreeEntrySource {
    Trivia,
    Wordle,
}

impl FreeEntrySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trivia => "trivia",
            Self::Wordle => "wordle",
        }
    }
}

impl FromStr for FreeEntrySource {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trivia" => Ok(Self::Trivia),
            "wordle" => Ok(Self::Wordle),
            other => Err(LedgerError::InvalidSource(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
pub struct ReferralStats {
    pub code: Option<String>,
    pub total_referrals: u64,
    pub confirmed_referrals: u64,
    pub entries_from_referrals: u64,
    pub entries_from_trivia: u64,
    pub entries_from_wordle: u64,
    pub entries_redeemed: u64,
    pub entries_available: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SettlementSummary {
    pub market: MarketId,
    pub date: NaiveDate,
    pub outcome: Prediction,
    pub blocked: Vec<WalletAddress>,
    pub survivors: Vec<WalletAddress>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    BetPlaced(PlaceOutcome),
    WalletBlocked(BlockEntry),
    WalletUnblocked {
        wallet: WalletAddress,
        scope: BlockScope,
    },
    ReferralLinked(ReferralLink),
    ReferralConfirmed(ReferralLink),
    FreeEntryAwarded {
        wallet: WalletAddress,
        source: FreeEntrySource,
    },
    FreeEntryRedeemed(RedemptionEvent),
    OutcomeApplied(SettlementSummary),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Authorization,
    Timing,
    Validation,
    Conflict,
    Infrastructure,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
    #[error("wallet is not a participant of this market")]
    NotParticipant,
    #[error("wallet is blocked from betting in this market")]
    Blocked,
    #[error("betting is not open (phase: {0})")]
    PhaseClosed(Phase),
    #[error("invalid prediction: {0:?}")]
    InvalidPrediction(String),
    #[error("invalid wallet address: {0:?}")]
    InvalidWallet(String),
    #[error("unknown market: {0:?}")]
    UnknownMarket(String),
    #[error("invalid free entry source: {0:?}")]
    InvalidSource(String),
    #[error("invalid date {0:?}, expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("unknown referral code")]
    UnknownCode,
    #[error("a wallet cannot use its own referral code")]
    SelfReferral,
    #[error("wallet is already linked to a referrer")]
    AlreadyLinked,
    #[error("no free entries available")]
    NoCreditsAvailable,
    #[error("membership oracle unavailable: {0}")]
    OracleUnavailable(String),
    #[error("storage conflict: {0}")]
    StorageConflict(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotParticipant | Self::Blocked => ErrorClass::Authorization,
            Self::PhaseClosed(_) => ErrorClass::Timing,
            Self::InvalidPrediction(_)
            | Self::InvalidWallet(_)
            | Self::UnknownMarket(_)
            | Self::InvalidSource(_)
            | Self::InvalidDate(_)
            | Self::UnknownCode
            | Self::SelfReferral => ErrorClass::Validation,
            Self::AlreadyLinked | Self::NoCreditsAvailable => ErrorClass::Conflict,
            Self::OracleUnavailable(_) | Self::StorageConflict(_) | Self::Storage(_) => {
                ErrorClass::Infrastructure
            }
        }
    }

    /// Only infrastructure failures may be retried locally; business
    /// outcomes go straight back to the caller.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Infrastructure
    }

    /// Stable snake_case label for metrics and API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotParticipant => "not_participant",
            Self::Blocked => "blocked",
            Self::PhaseClosed(_) => "phase_closed",
            Self::InvalidPrediction(_) => "invalid_prediction",
            Self::InvalidWallet(_) => "invalid_wallet",
            Self::UnknownMarket(_) => "unknown_market",
            Self::InvalidSource(_) => "invalid_source",
            Self::InvalidDate(_) => "invalid_date",
            Self::UnknownCode => "unknown_code",
            Self::SelfReferral => "self_referral",
            Self::AlreadyLinked => "already_linked",
            Self::NoCreditsAvailable => "no_credits_available",
            Self::OracleUnavailable(_) => "oracle_unavailable",
            Self::StorageConflict(_) => "storage_conflict",
            Self::Storage(_) => "storage",
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[async_trait]
pub trait MembershipOracle: Send + Sync {
    async fn is_participant(&self, wallet: &WalletAddress, market: &MarketId) -> Result<bool>;
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
