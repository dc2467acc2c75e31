use std::sync::Arc;

use chrono::{DateTime, Utc};
use core_types::{BlockEntry, BlockScope, LedgerError, LedgerEvent, MarketId, WalletAddress};
use event_bus::{emit, LedgerBus};
use ledger_store::{ts_from_ms, LedgerStore, StorageResultExt};
use rusqlite::{params, Connection, OptionalExtension};

/// Scope key stored for wallet-wide blocks.
pub const GLOBAL_SCOPE: &str = "*";

fn scope_key(scope: &BlockScope) -> &str {
    match scope {
        BlockScope::Market(id) => id.as_str(),
        BlockScope::Global => GLOBAL_SCOPE,
    }
}

fn scope_from_key(key: &str, market: &MarketId) -> BlockScope {
    if key == GLOBAL_SCOPE {
        BlockScope::Global
    } else {
        BlockScope::Market(market.clone())
    }
}

/// True when the wallet has an entry for `market` or a global entry.
pub fn is_blocked_in(
    conn: &Connection,
    wallet: &WalletAddress,
    market: &MarketId,
) -> Result<bool, LedgerError> {
    let hit = conn
        .query_row(
            "SELECT 1 FROM block_entries WHERE wallet = ?1 AND scope IN (?2, ?3) LIMIT 1",
            params![wallet.as_str(), market.as_str(), GLOBAL_SCOPE],
            |_| Ok(()),
        )
        .optional()
        .storage()?;
    Ok(hit.is_some())
}

fn fee_from_db(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}

/// Inserts the entry unless one already exists for (wallet, scope). Returns
/// the stored entry and whether this call created it; an existing entry keeps
/// its original reason, fee and timestamp.
pub fn block_in(
    conn: &Connection,
    wallet: &WalletAddress,
    scope: &BlockScope,
    reason: &str,
    re_entry_fee_micros: u64,
    now: DateTime<Utc>,
) -> Result<(BlockEntry, bool), LedgerError> {
    let fee = i64::try_from(re_entry_fee_micros)
        .map_err(|_| LedgerError::Storage(format!("fee out of range: {re_entry_fee_micros}")))?;
    let inserted = conn
        .execute(
            "INSERT INTO block_entries (wallet, scope, reason, re_entry_fee_micros, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(wallet, scope) DO NOTHING",
            params![wallet.as_str(), scope_key(scope), reason, fee, now.timestamp_millis()],
        )
        .storage()?
        == 1;
    let (stored_reason, stored_fee, created_at_ms): (String, i64, i64) = conn
        .query_row(
            "SELECT reason, re_entry_fee_micros, created_at_ms FROM block_entries
             WHERE wallet = ?1 AND scope = ?2",
            params![wallet.as_str(), scope_key(scope)],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .storage()?;
    Ok((
        BlockEntry {
            wallet: wallet.clone(),
            scope: scope.clone(),
            reason: stored_reason,
            re_entry_fee_micros: fee_from_db(stored_fee),
            created_at: ts_from_ms(created_at_ms),
        },
        inserted,
    ))
}

pub struct Blocklist {
    store: Arc<LedgerStore>,
    bus: Option<LedgerBus>,
}

impl Blocklist {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self { store, bus: None }
    }

    pub fn with_bus(mut self, bus: LedgerBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn is_blocked(&self, wallet: &WalletAddress, market: &MarketId) -> Result<bool, LedgerError> {
        self.store.read(|conn| is_blocked_in(conn, wallet, market))
    }

    /// Manual block with no re-entry fee. Idempotent: blocking an already
    /// blocked wallet returns the existing entry.
    pub fn block(
        &self,
        wallet: &WalletAddress,
        scope: BlockScope,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<BlockEntry, LedgerError> {
        let (entry, inserted) = self
            .store
            .write("block", |conn| block_in(conn, wallet, &scope, reason, 0, now))?;
        if inserted {
            metrics::counter!("ledger.block.added").increment(1);
            tracing::info!(wallet = %wallet, scope = %scope, reason, "wallet blocked");
            emit(self.bus.as_ref(), LedgerEvent::WalletBlocked(entry.clone()));
        }
        Ok(entry)
    }

    /// Returns whether an entry was removed.
    pub fn unblock(&self, wallet: &WalletAddress, scope: BlockScope) -> Result<bool, LedgerError> {
        let removed = self.store.write("unblock", |conn| {
            conn.execute(
                "DELETE FROM block_entries WHERE wallet = ?1 AND scope = ?2",
                params![wallet.as_str(), scope_key(&scope)],
            )
            .storage()
        })?;
        if removed > 0 {
            tracing::info!(wallet = %wallet, scope = %scope, "wallet unblocked");
            emit(
                self.bus.as_ref(),
                LedgerEvent::WalletUnblocked {
                    wallet: wallet.clone(),
                    scope,
                },
            );
        }
        Ok(removed > 0)
    }

    /// Entry currently blocking the wallet in `market`, preferring the
    /// market-specific one over a global one.
    pub fn entry(
        &self,
        wallet: &WalletAddress,
        market: &MarketId,
    ) -> Result<Option<BlockEntry>, LedgerError> {
        self.store.read(|conn| {
            conn.query_row(
                "SELECT scope, reason, re_entry_fee_micros, created_at_ms FROM block_entries
                 WHERE wallet = ?1 AND scope IN (?2, ?3)
                 ORDER BY CASE scope WHEN ?3 THEN 1 ELSE 0 END
                 LIMIT 1",
                params![wallet.as_str(), market.as_str(), GLOBAL_SCOPE],
                |r| {
                    let scope: String = r.get(0)?;
                    Ok(BlockEntry {
                        wallet: wallet.clone(),
                        scope: scope_from_key(&scope, market),
                        reason: r.get(1)?,
                        re_entry_fee_micros: fee_from_db(r.get(2)?),
                        created_at: ts_from_ms(r.get(3)?),
                    })
                },
            )
            .optional()
            .storage()
        })
    }

    /// Every wallet barred from `market`, global entries included.
    pub fn entries(&self, market: &MarketId) -> Result<Vec<BlockEntry>, LedgerError> {
        self.store.read(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT wallet, scope, reason, re_entry_fee_micros, created_at_ms
                     FROM block_entries
                     WHERE scope IN (?1, ?2) ORDER BY created_at_ms, wallet",
                )
                .storage()?;
            let rows = stmt
                .query_map(params![market.as_str(), GLOBAL_SCOPE], |r| {
                    let wallet: String = r.get(0)?;
                    let scope: String = r.get(1)?;
                    Ok((
                        wallet,
                        scope,
                        r.get::<_, String>(2)?,
                        r.get::<_, i64>(3)?,
                        r.get::<_, i64>(4)?,
                    ))
                })
                .storage()?;
            let mut out = Vec::new();
            for row in rows {
                let (wallet, scope, reason, fee, created_at_ms) = row.storage()?;
                out.push(BlockEntry {
                    wallet: WalletAddress::parse(&wallet)?,
                    scope: scope_from_key(&scope, market),
                    reason,
                    re_entry_fee_micros: fee_from_db(fee),
                    created_at: ts_from_ms(created_at_ms),
                });
            }
            Ok(out)
        })
    }

    /// Drops every market-scoped entry for `market` (the weekly reset).
    /// Global entries are untouched.
    pub fn clear_market(&self, market: &MarketId) -> Result<usize, LedgerError> {
        let removed = self.store.write("clear_market", |conn| {
            conn.execute(
                "DELETE FROM block_entries WHERE scope = ?1",
                params![market.as_str()],
            )
            .storage()
        })?;
        tracing::info!(market = %market, removed, "market blocklist cleared");
        Ok(removed)
    }
}
