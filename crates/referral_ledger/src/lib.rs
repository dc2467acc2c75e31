use std::sync::Arc;

use chrono::{DateTime, Utc};
use core_types::{
    new_id, FreeEntrySource, LedgerError, LedgerEvent, RedemptionEvent, ReferralCode,
    ReferralLink, ReferralStats, WalletAddress,
};
use event_bus::{emit, LedgerBus};
use ledger_store::{ts_from_ms, LedgerStore, StorageResultExt};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

/// Confirmed referrals needed for one free entry.
pub const REFERRALS_PER_FREE_ENTRY: u64 = 3;
const CODE_LEN: usize = 8;
const MAX_CODE_SALTS: u32 = 64;

/// Candidate code for `wallet`. Salt 0 is the wallet's natural code; higher
/// salts are only tried when a lower one is already owned by another wallet.
pub fn derive_code(wallet: &WalletAddress, salt: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(wallet.as_str().as_bytes());
    if salt > 0 {
        hasher.update(b":");
        hasher.update(salt.to_le_bytes());
    }
    let digest = hasher.finalize();
    digest
        .iter()
        .flat_map(|b| [b >> 4, b & 0x0f])
        .take(CODE_LEN)
        .map(|nibble| char::from_digit(u32::from(nibble), 16).unwrap_or('0'))
        .collect::<String>()
        .to_ascii_uppercase()
}

pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// `floor(confirmed / 3) + awarded - redeemed`, floored at zero.
pub fn free_entries_available(confirmed: u64, awarded: u64, redeemed: u64) -> u64 {
    (confirmed / REFERRALS_PER_FREE_ENTRY + awarded).saturating_sub(redeemed)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Tally {
    total_referrals: u64,
    confirmed_referrals: u64,
    trivia: u64,
    wordle: u64,
    redeemed: u64,
}

impl Tally {
    fn available(&self) -> u64 {
        free_entries_available(
            self.confirmed_referrals,
            self.trivia + self.wordle,
            self.redeemed,
        )
    }
}

fn count(conn: &Connection, sql: &str, wallet: &WalletAddress) -> Result<u64, LedgerError> {
    conn.query_row(sql, params![wallet.as_str()], |r| r.get::<_, i64>(0))
        .storage()
        .map(|n| n.max(0) as u64)
}

fn tally_in(conn: &Connection, wallet: &WalletAddress) -> Result<Tally, LedgerError> {
    Ok(Tally {
        total_referrals: count(
            conn,
            "SELECT COUNT(*) FROM referral_links WHERE referrer_wallet = ?1",
            wallet,
        )?,
        confirmed_referrals: count(
            conn,
            "SELECT COUNT(*) FROM referral_links WHERE referrer_wallet = ?1 AND confirmed = 1",
            wallet,
        )?,
        trivia: count(
            conn,
            "SELECT COUNT(*) FROM free_entry_awards WHERE wallet = ?1 AND source = 'trivia'",
            wallet,
        )?,
        wordle: count(
            conn,
            "SELECT COUNT(*) FROM free_entry_awards WHERE wallet = ?1 AND source = 'wordle'",
            wallet,
        )?,
        redeemed: count(
            conn,
            "SELECT COUNT(*) FROM free_entry_redemptions WHERE wallet = ?1",
            wallet,
        )?,
    })
}

fn code_of(conn: &Connection, wallet: &WalletAddress) -> Result<Option<ReferralCode>, LedgerError> {
    conn.query_row(
        "SELECT code, created_at_ms FROM referral_codes WHERE wallet = ?1",
        params![wallet.as_str()],
        |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)),
    )
    .optional()
    .storage()
    .map(|hit| {
        hit.map(|(code, created_at_ms)| ReferralCode {
            owner: wallet.clone(),
            code,
            created_at: ts_from_ms(created_at_ms),
        })
    })
}

fn owner_of(conn: &Connection, code: &str) -> Result<Option<WalletAddress>, LedgerError> {
    let owner: Option<String> = conn
        .query_row(
            "SELECT wallet FROM referral_codes WHERE code = ?1",
            params![code],
            |r| r.get(0),
        )
        .optional()
        .storage()?;
    owner.map(|w| WalletAddress::parse(&w)).transpose()
}

fn link_of(conn: &Connection, referred: &WalletAddress) -> Result<Option<ReferralLink>, LedgerError> {
    let row = conn
        .query_row(
            "SELECT referrer_wallet, code, confirmed, created_at_ms, confirmed_at_ms
             FROM referral_links WHERE referred_wallet = ?1",
            params![referred.as_str()],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, Option<i64>>(4)?,
                ))
            },
        )
        .optional()
        .storage()?;
    let Some((referrer, code, confirmed, created_at_ms, confirmed_at_ms)) = row else {
        return Ok(None);
    };
    Ok(Some(ReferralLink {
        referrer: WalletAddress::parse(&referrer)?,
        referred: referred.clone(),
        code,
        confirmed: confirmed != 0,
        created_at: ts_from_ms(created_at_ms),
        confirmed_at: confirmed_at_ms.map(ts_from_ms),
    }))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    pub link: ReferralLink,
    /// False when the link had already been confirmed earlier.
    pub newly_confirmed: bool,
}

fn redemption_row(
    r: &rusqlite::Row<'_>,
    wallet: &WalletAddress,
) -> rusqlite::Result<RedemptionEvent> {
    Ok(RedemptionEvent {
        id: r.get(0)?,
        wallet: wallet.clone(),
        seq: r.get(1)?,
        request_id: r.get(2)?,
        redeemed_at: ts_from_ms(r.get(3)?),
    })
}

fn redemption_by_request_in(
    conn: &Connection,
    wallet: &WalletAddress,
    request_id: &str,
) -> Result<Option<RedemptionEvent>, LedgerError> {
    conn.query_row(
        "SELECT id, seq, request_id, redeemed_at_ms FROM free_entry_redemptions
         WHERE wallet = ?1 AND request_id = ?2",
        params![wallet.as_str(), request_id],
        |r| redemption_row(r, wallet),
    )
    .optional()
    .storage()
}

/// Referral codes, referral links and the free entries they earn.
pub struct ReferralLedger {
    store: Arc<LedgerStore>,
    bus: Option<LedgerBus>,
}

impl ReferralLedger {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self { store, bus: None }
    }

    pub fn with_bus(mut self, bus: LedgerBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Returns the wallet's code, creating it on first request.
    pub fn issue_code(
        &self,
        wallet: &WalletAddress,
        now: DateTime<Utc>,
    ) -> Result<ReferralCode, LedgerError> {
        self.store.write("issue_code", |conn| {
            if let Some(existing) = code_of(conn, wallet)? {
                return Ok(existing);
            }
            for salt in 0..MAX_CODE_SALTS {
                let candidate = derive_code(wallet, salt);
                if owner_of(conn, &candidate)?.is_some() {
                    continue;
                }
                conn.execute(
                    "INSERT INTO referral_codes (wallet, code, created_at_ms) VALUES (?1, ?2, ?3)",
                    params![wallet.as_str(), candidate, now.timestamp_millis()],
                )
                .storage()?;
                tracing::info!(wallet = %wallet, code = %candidate, salt, "referral code issued");
                return Ok(ReferralCode {
                    owner: wallet.clone(),
                    code: candidate,
                    created_at: now,
                });
            }
            Err(LedgerError::Storage(format!(
                "no free referral code for {wallet} after {MAX_CODE_SALTS} salts"
            )))
        })
    }

    pub fn code_for(&self, wallet: &WalletAddress) -> Result<Option<ReferralCode>, LedgerError> {
        self.store.read(|conn| code_of(conn, wallet))
    }

    pub fn code_owner(&self, code: &str) -> Result<Option<WalletAddress>, LedgerError> {
        let code = normalize_code(code);
        self.store.read(|conn| owner_of(conn, &code))
    }

    /// Links `referred` to the owner of `code`. The first link for a referred
    /// wallet wins; every later attempt fails with `AlreadyLinked`.
    pub fn link_referral(
        &self,
        referred: &WalletAddress,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<ReferralLink, LedgerError> {
        let code = normalize_code(code);
        let link = self.store.write("link_referral", |conn| {
            let referrer = owner_of(conn, &code)?.ok_or(LedgerError::UnknownCode)?;
            if &referrer == referred {
                return Err(LedgerError::SelfReferral);
            }
            if link_of(conn, referred)?.is_some() {
                return Err(LedgerError::AlreadyLinked);
            }
            conn.execute(
                "INSERT INTO referral_links (referred_wallet, referrer_wallet, code, confirmed, created_at_ms)
                 VALUES (?1, ?2, ?3, 0, ?4)",
                params![referred.as_str(), referrer.as_str(), code, now.timestamp_millis()],
            )
            .storage()?;
            Ok(ReferralLink {
                referrer,
                referred: referred.clone(),
                code: code.clone(),
                confirmed: false,
                created_at: now,
                confirmed_at: None,
            })
        })?;
        metrics::counter!("ledger.referral.linked").increment(1);
        tracing::info!(referred = %referred, referrer = %link.referrer, "referral linked");
        emit(self.bus.as_ref(), LedgerEvent::ReferralLinked(link.clone()));
        Ok(link)
    }

    pub fn link_for(&self, referred: &WalletAddress) -> Result<Option<ReferralLink>, LedgerError> {
        self.store.read(|conn| link_of(conn, referred))
    }

    /// Marks the referred wallet's link as confirmed. Returns `None` when the
    /// wallet was never referred; repeat confirmations change nothing.
    pub fn confirm_referral(
        &self,
        referred: &WalletAddress,
        now: DateTime<Utc>,
    ) -> Result<Option<Confirmation>, LedgerError> {
        let confirmation = self.store.write("confirm_referral", |conn| {
            let changed = conn
                .execute(
                    "UPDATE referral_links SET confirmed = 1, confirmed_at_ms = ?2
                     WHERE referred_wallet = ?1 AND confirmed = 0",
                    params![referred.as_str(), now.timestamp_millis()],
                )
                .storage()?;
            Ok(link_of(conn, referred)?.map(|link| Confirmation {
                link,
                newly_confirmed: changed == 1,
            }))
        })?;
        if let Some(c) = confirmation.as_ref().filter(|c| c.newly_confirmed) {
            metrics::counter!("ledger.referral.confirmed").increment(1);
            tracing::info!(referred = %referred, referrer = %c.link.referrer, "referral confirmed");
            emit(self.bus.as_ref(), LedgerEvent::ReferralConfirmed(c.link.clone()));
        }
        Ok(confirmation)
    }

    /// Records a bonus entry won in a side game.
    pub fn award_free_entry(
        &self,
        wallet: &WalletAddress,
        source: FreeEntrySource,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.store.write("award_free_entry", |conn| {
            conn.execute(
                "INSERT INTO free_entry_awards (wallet, source, awarded_at_ms) VALUES (?1, ?2, ?3)",
                params![wallet.as_str(), source.as_str(), now.timestamp_millis()],
            )
            .storage()
        })?;
        tracing::info!(wallet = %wallet, source = source.as_str(), "free entry awarded");
        emit(
            self.bus.as_ref(),
            LedgerEvent::FreeEntryAwarded {
                wallet: wallet.clone(),
                source,
            },
        );
        Ok(())
    }

    pub fn available_free_entries(&self, wallet: &WalletAddress) -> Result<u64, LedgerError> {
        self.store
            .read(|conn| tally_in(conn, wallet))
            .map(|t| t.available())
    }

    /// Spends one free entry. The availability check and the redemption
    /// record share a transaction, and the (wallet, seq) key rejects a second
    /// writer that computed the same sequence number. A retry carrying an
    /// already used `request_id` gets the stored redemption back and spends
    /// nothing.
    pub fn redeem_free_entry(
        &self,
        wallet: &WalletAddress,
        request_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RedemptionEvent, LedgerError> {
        let request_id = request_id.map(str::trim).filter(|k| !k.is_empty());
        let (event, replayed) = self.store.write("redeem_free_entry", |conn| {
            if let Some(key) = request_id {
                if let Some(existing) = redemption_by_request_in(conn, wallet, key)? {
                    return Ok((existing, true));
                }
            }
            let tally = tally_in(conn, wallet)?;
            if tally.available() == 0 {
                return Err(LedgerError::NoCreditsAvailable);
            }
            let seq = u32::try_from(tally.redeemed + 1)
                .map_err(|_| LedgerError::Storage("redemption sequence overflow".to_string()))?;
            let event = RedemptionEvent {
                id: new_id(),
                wallet: wallet.clone(),
                seq,
                request_id: request_id.map(str::to_string),
                redeemed_at: now,
            };
            conn.execute(
                "INSERT INTO free_entry_redemptions (wallet, seq, id, request_id, redeemed_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    wallet.as_str(),
                    seq,
                    event.id,
                    event.request_id,
                    now.timestamp_millis()
                ],
            )
            .storage()?;
            Ok((event, false))
        })?;
        if replayed {
            tracing::debug!(wallet = %wallet, seq = event.seq, "free entry redemption replayed");
            return Ok(event);
        }
        metrics::counter!("ledger.free_entry.redeemed").increment(1);
        tracing::info!(wallet = %wallet, seq = event.seq, "free entry redeemed");
        emit(self.bus.as_ref(), LedgerEvent::FreeEntryRedeemed(event.clone()));
        Ok(event)
    }

    pub fn redemptions(&self, wallet: &WalletAddress) -> Result<Vec<RedemptionEvent>, LedgerError> {
        self.store.read(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, seq, request_id, redeemed_at_ms FROM free_entry_redemptions
                     WHERE wallet = ?1 ORDER BY seq",
                )
                .storage()?;
            let rows = stmt
                .query_map(params![wallet.as_str()], |r| redemption_row(r, wallet))
                .storage()?;
            let events = rows.collect::<rusqlite::Result<Vec<_>>>().storage()?;
            Ok(events)
        })
    }

    pub fn referral_stats(&self, wallet: &WalletAddress) -> Result<ReferralStats, LedgerError> {
        self.store.read(|conn| {
            let tally = tally_in(conn, wallet)?;
            Ok(ReferralStats {
                code: code_of(conn, wallet)?.map(|c| c.code),
                total_referrals: tally.total_referrals,
                confirmed_referrals: tally.confirmed_referrals,
                entries_from_referrals: tally.confirmed_referrals / REFERRALS_PER_FREE_ENTRY,
                entries_from_trivia: tally.trivia,
                entries_from_wordle: tally.wordle,
                entries_redeemed: tally.redeemed,
                entries_available: tally.available(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ledger() -> Arc<ReferralLedger> {
        let store = Arc::new(LedgerStore::open_in_memory().expect("store"));
        Arc::new(ReferralLedger::new(store))
    }

    fn wallet(raw: &str) -> WalletAddress {
        WalletAddress::parse(raw).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 4, 12, 0, 0).unwrap()
    }

    fn refer_and_confirm(ledger: &ReferralLedger, referrer: &WalletAddress, n: usize) {
        let code = ledger.issue_code(referrer, now()).unwrap().code;
        for i in 0..n {
            let friend = wallet(&format!("0xfriend{i}"));
            ledger.link_referral(&friend, &code, now()).unwrap();
            ledger.confirm_referral(&friend, now()).unwrap();
        }
    }

    #[test]
    fn code_is_deterministic_and_idempotent() {
        let l = ledger();
        let a = wallet("0xAAAA");
        let first = l.issue_code(&a, now()).unwrap();
        let again = l.issue_code(&a, now()).unwrap();
        assert_eq!(first.code, again.code);
        assert_eq!(first.code, derive_code(&a, 0));
        assert_eq!(first.code.len(), 8);
        assert_eq!(l.code_owner(&first.code.to_lowercase()).unwrap(), Some(a));
    }

    #[test]
    fn codes_differ_across_wallets_and_salts() {
        let a = wallet("0xa");
        let b = wallet("0xb");
        assert_ne!(derive_code(&a, 0), derive_code(&b, 0));
        assert_ne!(derive_code(&a, 0), derive_code(&a, 1));
    }

    #[test]
    fn taken_code_falls_through_to_next_salt() {
        let store = Arc::new(LedgerStore::open_in_memory().unwrap());
        let l = ReferralLedger::new(store.clone());
        let a = wallet("0xa");
        // Squat on a's natural code with another wallet.
        store
            .write("test", |conn| {
                conn.execute(
                    "INSERT INTO referral_codes (wallet, code, created_at_ms) VALUES ('0xsquatter', ?1, 0)",
                    params![derive_code(&a, 0)],
                )
                .storage()
            })
            .unwrap();
        let issued = l.issue_code(&a, now()).unwrap();
        assert_eq!(issued.code, derive_code(&a, 1));
    }

    #[test]
    fn link_validation_order() {
        let l = ledger();
        let owner = wallet("0xowner");
        let friend = wallet("0xfriend");
        let code = l.issue_code(&owner, now()).unwrap().code;

        assert_eq!(l.link_referral(&friend, "NOPE", now()), Err(LedgerError::UnknownCode));
        assert_eq!(l.link_referral(&owner, &code, now()), Err(LedgerError::SelfReferral));
        let link = l.link_referral(&friend, &code, now()).unwrap();
        assert_eq!(link.referrer, owner);
        assert!(!link.confirmed);

        let other = wallet("0xother");
        let other_code = l.issue_code(&other, now()).unwrap().code;
        assert_eq!(
            l.link_referral(&friend, &other_code, now()),
            Err(LedgerError::AlreadyLinked)
        );
        assert_eq!(l.link_for(&friend).unwrap().unwrap().referrer, owner);
    }

    #[test]
    fn confirm_flips_once() {
        let l = ledger();
        let owner = wallet("0xowner");
        let friend = wallet("0xfriend");
        let code = l.issue_code(&owner, now()).unwrap().code;
        l.link_referral(&friend, &code, now()).unwrap();

        let first = l.confirm_referral(&friend, now()).unwrap().unwrap();
        assert!(first.newly_confirmed);
        assert!(first.link.confirmed);
        let later = now() + chrono::Duration::hours(1);
        let second = l.confirm_referral(&friend, later).unwrap().unwrap();
        assert!(!second.newly_confirmed);
        assert_eq!(second.link.confirmed_at, Some(now()));
        assert_eq!(l.confirm_referral(&wallet("0xstranger"), now()).unwrap(), None);
    }

    #[test]
    fn three_confirmed_referrals_earn_one_entry() {
        let l = ledger();
        let b = wallet("0xb");
        refer_and_confirm(&l, &b, 3);
        assert_eq!(l.available_free_entries(&b).unwrap(), 1);

        let event = l.redeem_free_entry(&b, None, now()).unwrap();
        assert_eq!(event.seq, 1);
        assert_eq!(l.available_free_entries(&b).unwrap(), 0);
        assert_eq!(l.redeem_free_entry(&b, None, now()), Err(LedgerError::NoCreditsAvailable));
        assert_eq!(l.redemptions(&b).unwrap().len(), 1);
    }

    #[test]
    fn unconfirmed_referrals_earn_nothing() {
        let l = ledger();
        let b = wallet("0xb");
        let code = l.issue_code(&b, now()).unwrap().code;
        for i in 0..5 {
            l.link_referral(&wallet(&format!("0xf{i}")), &code, now()).unwrap();
        }
        let stats = l.referral_stats(&b).unwrap();
        assert_eq!(stats.total_referrals, 5);
        assert_eq!(stats.confirmed_referrals, 0);
        assert_eq!(stats.entries_available, 0);
    }

    #[test]
    fn awards_add_to_referral_entries() {
        let l = ledger();
        let b = wallet("0xb");
        refer_and_confirm(&l, &b, 7);
        l.award_free_entry(&b, FreeEntrySource::Trivia, now()).unwrap();
        l.award_free_entry(&b, FreeEntrySource::Wordle, now()).unwrap();
        l.redeem_free_entry(&b, None, now()).unwrap();

        let stats = l.referral_stats(&b).unwrap();
        assert_eq!(stats.entries_from_referrals, 2);
        assert_eq!(stats.entries_from_trivia, 1);
        assert_eq!(stats.entries_from_wordle, 1);
        assert_eq!(stats.entries_redeemed, 1);
        assert_eq!(stats.entries_available, 3);
        assert!(stats.code.is_some());
    }

    #[test]
    fn availability_is_monotone_and_never_negative() {
        for redeemed in 0..6 {
            let mut prev = 0;
            for confirmed in 0..12 {
                let v = free_entries_available(confirmed, 0, redeemed);
                assert!(v >= prev);
                prev = v;
            }
        }
        for confirmed in 0..12 {
            let mut prev = u64::MAX;
            for redeemed in 0..8 {
                let v = free_entries_available(confirmed, 0, redeemed);
                assert!(v <= prev);
                prev = v;
            }
        }
        assert_eq!(free_entries_available(2, 0, 5), 0);
    }

    #[test]
    fn concurrent_redemptions_never_overspend() {
        let l = ledger();
        let b = wallet("0xb");
        refer_and_confirm(&l, &b, 6);
        let handles = (0..10)
            .map(|_| {
                let l = l.clone();
                let b = b.clone();
                std::thread::spawn(move || l.redeem_free_entry(&b, None, now()))
            })
            .collect::<Vec<_>>();
        let ok = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(Result::is_ok)
            .count();
        assert_eq!(ok, 2);
        assert_eq!(l.available_free_entries(&b).unwrap(), 0);
    }

    #[test]
    fn retried_redemption_returns_the_stored_event() {
        let l = ledger();
        let b = wallet("0xb");
        refer_and_confirm(&l, &b, 6);

        let first = l.redeem_free_entry(&b, Some("req-1"), now()).unwrap();
        let later = now() + chrono::Duration::minutes(5);
        let retry = l.redeem_free_entry(&b, Some(" req-1 "), later).unwrap();
        assert_eq!(retry, first);
        assert_eq!(retry.request_id.as_deref(), Some("req-1"));
        assert_eq!(l.available_free_entries(&b).unwrap(), 1);

        let second = l.redeem_free_entry(&b, Some("req-2"), later).unwrap();
        assert_eq!(second.seq, 2);
        // a replay still answers once the credits are gone
        assert_eq!(l.redeem_free_entry(&b, Some("req-1"), later).unwrap(), first);
        assert_eq!(
            l.redeem_free_entry(&b, Some("req-3"), later),
            Err(LedgerError::NoCreditsAvailable)
        );
        assert_eq!(l.redemptions(&b).unwrap(), vec![first, second]);
    }

    #[test]
    fn request_ids_are_scoped_per_wallet() {
        let l = ledger();
        let a = wallet("0xa");
        let b = wallet("0xb");
        refer_and_confirm(&l, &a, 3);
        l.award_free_entry(&b, FreeEntrySource::Wordle, now()).unwrap();
        let from_a = l.redeem_free_entry(&a, Some("same"), now()).unwrap();
        let from_b = l.redeem_free_entry(&b, Some("same"), now()).unwrap();
        assert_ne!(from_a.id, from_b.id);
        assert_eq!(from_b.wallet, b);
    }

    #[test]
    fn concurrent_retries_spend_once() {
        let l = ledger();
        let b = wallet("0xb");
        refer_and_confirm(&l, &b, 6);
        let handles = (0..8)
            .map(|_| {
                let l = l.clone();
                let b = b.clone();
                std::thread::spawn(move || l.redeem_free_entry(&b, Some("retry"), now()))
            })
            .collect::<Vec<_>>();
        let events = handles
            .into_iter()
            .map(|h| h.join().expect("join").expect("redeem"))
            .collect::<Vec<_>>();
        assert!(events.iter().all(|e| e == &events[0]));
        assert_eq!(l.available_free_entries(&b).unwrap(), 1);
    }

    #[test]
    fn concurrent_links_have_one_winner() {
        let l = ledger();
        let friend = wallet("0xfriend");
        let codes = (0..8)
            .map(|i| l.issue_code(&wallet(&format!("0xref{i}")), now()).unwrap().code)
            .collect::<Vec<_>>();
        let handles = codes
            .into_iter()
            .map(|code| {
                let l = l.clone();
                let friend = friend.clone();
                std::thread::spawn(move || l.link_referral(&friend, &code, now()))
            })
            .collect::<Vec<_>>();
        let results = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect::<Vec<_>>();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| *e == LedgerError::AlreadyLinked));
    }
}
