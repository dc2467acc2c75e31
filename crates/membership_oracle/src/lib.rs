use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use core_types::{MarketId, MembershipOracle, WalletAddress};
use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;

/// Participant sets held in memory, keyed by market. Used when the pot
/// membership is mirrored locally and in tests.
#[derive(Debug, Default)]
pub struct StaticMembershipOracle {
    participants: DashMap<MarketId, HashSet<WalletAddress>>,
}

impl StaticMembershipOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, market: &MarketId, wallet: WalletAddress) -> bool {
        self.participants
            .entry(market.clone())
            .or_default()
            .insert(wallet)
    }

    pub fn remove(&self, market: &MarketId, wallet: &WalletAddress) -> bool {
        self.participants
            .get_mut(market)
            .map(|mut set| set.remove(wallet))
            .unwrap_or(false)
    }

    pub fn participant_count(&self, market: &MarketId) -> usize {
        self.participants.get(market).map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MembershipOracle for StaticMembershipOracle {
    async fn is_participant(&self, wallet: &WalletAddress, market: &MarketId) -> Result<bool> {
        Ok(self
            .participants
            .get(market)
            .map(|set| set.contains(wallet))
            .unwrap_or(false))
    }
}

#[derive(Debug, Clone)]
pub struct HttpOracleConfig {
    /// Base URL of the participant lookup service.
    pub base_url: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ParticipantResp {
    participant: bool,
}

/// Asks a remote service whether a wallet entered a market's pot:
/// `GET {base_url}/participants/{market}/{wallet}` -> `{"participant": bool}`.
pub struct HttpMembershipOracle {
    http: Client,
    cfg: HttpOracleConfig,
}

impl HttpMembershipOracle {
    pub fn new(cfg: HttpOracleConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .context("build membership http client")?;
        Ok(Self { http, cfg })
    }

    pub fn lookup_url(&self, wallet: &WalletAddress, market: &MarketId) -> String {
        format!(
            "{}/participants/{}/{}",
            self.cfg.base_url.trim_end_matches('/'),
            market,
            wallet
        )
    }
}

#[async_trait]
impl MembershipOracle for HttpMembershipOracle {
    async fn is_participant(&self, wallet: &WalletAddress, market: &MarketId) -> Result<bool> {
        let url = self.lookup_url(wallet, market);
        let resp: ParticipantResp = self
            .http
            .get(&url)
            .send()
            .await
            .context("membership request")?
            .error_for_status()
            .context("membership status")?
            .json()
            .await
            .context("membership json")?;
        Ok(resp.participant)
    }
}
