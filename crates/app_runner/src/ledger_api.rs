use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use core_types::{
    Bet, BlockEntry, BlockScope, DualView, ErrorClass, FreeEntrySource, LedgerError, Market,
    MarketId, PlaceOutcome, Prediction, RedemptionEvent, ReferralCode, ReferralLink,
    ReferralStats, SettlementSummary, WalletAddress,
};
use serde::{Deserialize, Serialize};
use window_policy::WindowSnapshot;

use crate::bootstrap::AppState;

pub(super) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/phase", get(phase))
        .route("/markets", get(markets))
        .route("/markets/:market/bets/:date", get(bets_for_date))
        .route(
            "/markets/:market/blocks",
            get(market_blocks).delete(clear_market_blocks),
        )
        .route("/bets", post(submit_bet))
        .route("/bets/:market/:wallet", get(dual_view))
        .route("/bets/:market/:wallet/:date", get(bet_for_date))
        .route("/blocks", post(block_wallet))
        .route("/blocks/remove", post(unblock_wallet))
        .route("/blocks/:market/:wallet", get(block_status))
        .route("/settlement", post(apply_outcome))
        .route("/referrals/code", post(issue_code))
        .route("/referrals/link", post(link_referral))
        .route("/referrals/confirm", post(confirm_referral))
        .route("/wallets/:wallet/referrals", get(referral_stats))
        .route("/free-entries/award", post(award_free_entry))
        .route("/free-entries/redeem", post(redeem_free_entry))
        .route("/wallets/:wallet/free-entries", get(free_entries))
        .with_state(state)
}

#[derive(Debug)]
pub(super) struct ApiError(LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        Self(err)
    }
}

#[derive(Debug, Serialize)]
struct ErrorResp {
    ok: bool,
    error: &'static str,
    class: ErrorClass,
    message: String,
}

pub(super) fn status_for(err: &LedgerError) -> StatusCode {
    if let LedgerError::UnknownMarket(_) = err {
        return StatusCode::NOT_FOUND;
    }
    match err.class() {
        ErrorClass::Authorization => StatusCode::FORBIDDEN,
        ErrorClass::Timing => StatusCode::LOCKED,
        ErrorClass::Validation => StatusCode::BAD_REQUEST,
        ErrorClass::Conflict => StatusCode::CONFLICT,
        ErrorClass::Infrastructure => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if self.0.is_retryable() {
            tracing::warn!(kind = self.0.kind(), error = %self.0, "ledger request failed");
        }
        let body = ErrorResp {
            ok: false,
            error: self.0.kind(),
            class: self.0.class(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Runs a synchronous ledger call off the async workers.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
{
    let value = tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| LedgerError::Storage(format!("ledger task failed: {err}")))??;
    Ok(Json(value))
}

fn ids(
    state: &AppState,
    market: &str,
    wallet: &str,
) -> Result<(MarketId, WalletAddress), ApiError> {
    let market = state.registry.resolve(market)?;
    let wallet = WalletAddress::parse(wallet)?;
    Ok((market, wallet))
}

fn request_date(raw: &str) -> Result<NaiveDate, LedgerError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| LedgerError::InvalidDate(raw.to_string()))
}

#[derive(Debug, Serialize)]
struct HealthResp {
    status: &'static str,
    markets: usize,
    audit_subscribers: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResp> {
    Json(HealthResp {
        status: "ok",
        markets: state.registry.len(),
        audit_subscribers: state.bus.receiver_count(),
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

async fn phase(State(state): State<AppState>) -> Json<WindowSnapshot> {
    Json(state.window.current())
}

async fn markets(State(state): State<AppState>) -> Json<Vec<Market>> {
    Json(state.registry.all().cloned().collect())
}

#[derive(Debug, Deserialize)]
struct BetReq {
    wallet: String,
    market: String,
    prediction: String,
}

async fn submit_bet(
    State(state): State<AppState>,
    Json(req): Json<BetReq>,
) -> ApiResult<PlaceOutcome> {
    let (market, wallet) = ids(&state, &req.market, &req.wallet)?;
    let outcome = state
        .gatekeeper
        .submit_bet(&wallet, &market, &req.prediction, state.clock.now())
        .await?;
    Ok(Json(outcome))
}

async fn dual_view(
    State(state): State<AppState>,
    Path((market, wallet)): Path<(String, String)>,
) -> ApiResult<DualView> {
    let (market, wallet) = ids(&state, &market, &wallet)?;
    let now = state.clock.now();
    let bets = state.bets.clone();
    blocking(move || bets.dual_view(&wallet, &market, now)).await
}

async fn bet_for_date(
    State(state): State<AppState>,
    Path((market, wallet, date)): Path<(String, String, String)>,
) -> ApiResult<Option<Bet>> {
    let (market, wallet) = ids(&state, &market, &wallet)?;
    let date = request_date(&date)?;
    let bets = state.bets.clone();
    blocking(move || bets.get_for_target_date(&wallet, &market, date)).await
}

async fn bets_for_date(
    State(state): State<AppState>,
    Path((market, date)): Path<(String, String)>,
) -> ApiResult<Vec<Bet>> {
    let market = state.registry.resolve(&market)?;
    let date = request_date(&date)?;
    let bets = state.bets.clone();
    blocking(move || bets.bets_for_date(&market, date)).await
}

#[derive(Debug, Serialize)]
struct BlockStatus {
    blocked: bool,
    entry: Option<BlockEntry>,
}

async fn block_status(
    State(state): State<AppState>,
    Path((market, wallet)): Path<(String, String)>,
) -> ApiResult<BlockStatus> {
    let (market, wallet) = ids(&state, &market, &wallet)?;
    let blocklist = state.blocklist.clone();
    blocking(move || {
        let entry = blocklist.entry(&wallet, &market)?;
        Ok(BlockStatus {
            blocked: entry.is_some(),
            entry,
        })
    })
    .await
}

async fn market_blocks(
    State(state): State<AppState>,
    Path(market): Path<String>,
) -> ApiResult<Vec<BlockEntry>> {
    let market = state.registry.resolve(&market)?;
    let blocklist = state.blocklist.clone();
    blocking(move || blocklist.entries(&market)).await
}

#[derive(Debug, Serialize)]
struct RemovedResp {
    removed: usize,
}

async fn clear_market_blocks(
    State(state): State<AppState>,
    Path(market): Path<String>,
) -> ApiResult<RemovedResp> {
    let market = state.registry.resolve(&market)?;
    let blocklist = state.blocklist.clone();
    blocking(move || {
        let removed = blocklist.clear_market(&market)?;
        Ok(RemovedResp { removed })
    })
    .await
}

/// `market: None` addresses the global scope.
#[derive(Debug, Deserialize)]
struct BlockReq {
    wallet: String,
    #[serde(default)]
    market: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

fn scope_of(state: &AppState, market: Option<&str>) -> Result<BlockScope, ApiError> {
    match market {
        Some(raw) => Ok(BlockScope::Market(state.registry.resolve(raw)?)),
        None => Ok(BlockScope::Global),
    }
}

async fn block_wallet(
    State(state): State<AppState>,
    Json(req): Json<BlockReq>,
) -> ApiResult<BlockEntry> {
    let wallet = WalletAddress::parse(&req.wallet)?;
    let scope = scope_of(&state, req.market.as_deref())?;
    let reason = req.reason.unwrap_or_else(|| "manual block".to_string());
    let now = state.clock.now();
    let blocklist = state.blocklist.clone();
    blocking(move || blocklist.block(&wallet, scope, &reason, now)).await
}

async fn unblock_wallet(
    State(state): State<AppState>,
    Json(req): Json<BlockReq>,
) -> ApiResult<RemovedResp> {
    let wallet = WalletAddress::parse(&req.wallet)?;
    let scope = scope_of(&state, req.market.as_deref())?;
    let blocklist = state.blocklist.clone();
    blocking(move || {
        let removed = usize::from(blocklist.unblock(&wallet, scope)?);
        Ok(RemovedResp { removed })
    })
    .await
}

#[derive(Debug, Deserialize)]
struct SettlementReq {
    market: String,
    date: String,
    outcome: String,
}

async fn apply_outcome(
    State(state): State<AppState>,
    Json(req): Json<SettlementReq>,
) -> ApiResult<SettlementSummary> {
    let market = state.registry.resolve(&req.market)?;
    let date = request_date(&req.date)?;
    let outcome: Prediction = req.outcome.parse()?;
    let now = state.clock.now();
    let settlement = state.settlement.clone();
    blocking(move || settlement.apply_outcome(&market, date, outcome, now)).await
}

#[derive(Debug, Deserialize)]
struct WalletReq {
    wallet: String,
}

async fn issue_code(
    State(state): State<AppState>,
    Json(req): Json<WalletReq>,
) -> ApiResult<ReferralCode> {
    let wallet = WalletAddress::parse(&req.wallet)?;
    let now = state.clock.now();
    let referrals = state.referrals.clone();
    blocking(move || referrals.issue_code(&wallet, now)).await
}

#[derive(Debug, Deserialize)]
struct LinkReq {
    wallet: String,
    code: String,
}

async fn link_referral(
    State(state): State<AppState>,
    Json(req): Json<LinkReq>,
) -> ApiResult<ReferralLink> {
    let wallet = WalletAddress::parse(&req.wallet)?;
    let now = state.clock.now();
    let referrals = state.referrals.clone();
    blocking(move || referrals.link_referral(&wallet, &req.code, now)).await
}

#[derive(Debug, Serialize)]
struct ConfirmResp {
    link: Option<ReferralLink>,
    newly_confirmed: bool,
}

async fn confirm_referral(
    State(state): State<AppState>,
    Json(req): Json<WalletReq>,
) -> ApiResult<ConfirmResp> {
    let wallet = WalletAddress::parse(&req.wallet)?;
    let now = state.clock.now();
    let referrals = state.referrals.clone();
    blocking(move || {
        let resp = match referrals.confirm_referral(&wallet, now)? {
            Some(c) => ConfirmResp {
                link: Some(c.link),
                newly_confirmed: c.newly_confirmed,
            },
            None => ConfirmResp {
                link: None,
                newly_confirmed: false,
            },
        };
        Ok(resp)
    })
    .await
}

async fn referral_stats(
    State(state): State<AppState>,
    Path(wallet): Path<String>,
) -> ApiResult<ReferralStats> {
    let wallet = WalletAddress::parse(&wallet)?;
    let referrals = state.referrals.clone();
    blocking(move || referrals.referral_stats(&wallet)).await
}

#[derive(Debug, Deserialize)]
struct AwardReq {
    wallet: String,
    source: String,
}

#[derive(Debug, Serialize)]
struct FreeEntriesResp {
    available: u64,
    redemptions: Vec<RedemptionEvent>,
}

async fn award_free_entry(
    State(state): State<AppState>,
    Json(req): Json<AwardReq>,
) -> ApiResult<FreeEntriesResp> {
    let wallet = WalletAddress::parse(&req.wallet)?;
    let source: FreeEntrySource = req.source.parse()?;
    let now = state.clock.now();
    let referrals = state.referrals.clone();
    blocking(move || {
        referrals.award_free_entry(&wallet, source, now)?;
        Ok(FreeEntriesResp {
            available: referrals.available_free_entries(&wallet)?,
            redemptions: referrals.redemptions(&wallet)?,
        })
    })
    .await
}

#[derive(Debug, Deserialize)]
struct RedeemReq {
    wallet: String,
    /// Idempotency key; a retry with the same key gets the original redemption.
    #[serde(default)]
    request_id: Option<String>,
}

async fn redeem_free_entry(
    State(state): State<AppState>,
    Json(req): Json<RedeemReq>,
) -> ApiResult<RedemptionEvent> {
    let wallet = WalletAddress::parse(&req.wallet)?;
    let now = state.clock.now();
    let referrals = state.referrals.clone();
    let request_id = req.request_id;
    blocking(move || referrals.redeem_free_entry(&wallet, request_id.as_deref(), now)).await
}

async fn free_entries(
    State(state): State<AppState>,
    Path(wallet): Path<String>,
) -> ApiResult<FreeEntriesResp> {
    let wallet = WalletAddress::parse(&wallet)?;
    let referrals = state.referrals.clone();
    blocking(move || {
        Ok(FreeEntriesResp {
            available: referrals.available_free_entries(&wallet)?,
            redemptions: referrals.redemptions(&wallet)?,
        })
    })
    .await
}
