use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use core_types::LedgerError;
pub use infra_clock::ts_from_ms;
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, TransactionBehavior};

const BUSY_TIMEOUT: Duration = Duration::from_millis(2_000);
const DATE_FORMAT: &str = "%Y-%m-%d";

/// SQLite-backed storage shared by every ledger. Each mutation runs inside a
/// single IMMEDIATE transaction; uniqueness is enforced by the schema.
pub struct LedgerStore {
    conn: Mutex<Connection>,
}

impl LedgerStore {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|err| LedgerError::Storage(format!("create db dir: {err}")))?;
            }
        }
        let conn = Connection::open(path).storage()?;
        conn.pragma_update(None, "journal_mode", "WAL").storage()?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::from_connection(Connection::open_in_memory().storage()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.busy_timeout(BUSY_TIMEOUT).storage()?;
        conn.pragma_update(None, "foreign_keys", "ON").storage()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs a read-only query.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Runs `f` inside one transaction. Any error rolls the whole transaction
    /// back. A transient storage conflict is retried exactly once.
    pub fn write<T>(
        &self,
        op: &'static str,
        mut f: impl FnMut(&Connection) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut attempt = 0;
        loop {
            match self.try_write(&mut f) {
                Err(LedgerError::StorageConflict(msg)) if attempt == 0 => {
                    attempt += 1;
                    metrics::counter!("ledger.storage.retry", "op" => op).increment(1);
                    tracing::warn!(op, error = %msg, "transient storage conflict; retrying");
                }
                other => return other,
            }
        }
    }

    fn try_write<T>(
        &self,
        f: &mut impl FnMut(&Connection) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage()?;
        let out = f(&tx)?;
        tx.commit().storage()?;
        Ok(out)
    }
}

fn init_schema(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS bets (
            wallet TEXT NOT NULL,
            market TEXT NOT NULL,
            target_date TEXT NOT NULL,
            prediction TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (wallet, market, target_date)
        );
        CREATE INDEX IF NOT EXISTS idx_bets_market_date ON bets(market, target_date);

        CREATE TABLE IF NOT EXISTS block_entries (
            wallet TEXT NOT NULL,
            scope TEXT NOT NULL,
            reason TEXT NOT NULL,
            re_entry_fee_micros INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL,
            PRIMARY KEY (wallet, scope)
        );
        CREATE INDEX IF NOT EXISTS idx_block_entries_scope ON block_entries(scope);

        CREATE TABLE IF NOT EXISTS referral_codes (
            wallet TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS referral_links (
            referred_wallet TEXT PRIMARY KEY,
            referrer_wallet TEXT NOT NULL,
            code TEXT NOT NULL,
            confirmed INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL,
            confirmed_at_ms INTEGER NULL
        );
        CREATE INDEX IF NOT EXISTS idx_referral_links_referrer ON referral_links(referrer_wallet);

        CREATE TABLE IF NOT EXISTS free_entry_awards (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            wallet TEXT NOT NULL,
            source TEXT NOT NULL,
            awarded_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_free_entry_awards_wallet ON free_entry_awards(wallet);

        CREATE TABLE IF NOT EXISTS free_entry_redemptions (
            wallet TEXT NOT NULL,
            seq INTEGER NOT NULL,
            id TEXT NOT NULL UNIQUE,
            request_id TEXT NULL,
            redeemed_at_ms INTEGER NOT NULL,
            PRIMARY KEY (wallet, seq),
            UNIQUE (wallet, request_id)
        );
        "#,
    )
    .storage()
}

/// Maps rusqlite failures onto the ledger taxonomy. Busy, locked and
/// constraint failures are conflicts that a fresh transaction may resolve.
pub fn storage_error(err: rusqlite::Error) -> LedgerError {
    let transient = matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::ConstraintViolation)
    );
    if transient {
        LedgerError::StorageConflict(err.to_string())
    } else {
        LedgerError::Storage(err.to_string())
    }
}

pub trait StorageResultExt<T> {
    fn storage(self) -> Result<T, LedgerError>;
}

impl<T> StorageResultExt<T> for rusqlite::Result<T> {
    fn storage(self) -> Result<T, LedgerError> {
        self.map_err(storage_error)
    }
}

pub fn date_text(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, LedgerError> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|err| LedgerError::Storage(format!("corrupt date {raw:?}: {err}")))
}
