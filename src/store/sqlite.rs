//! Persistent backend on SQLite.
//!
//! - WAL mode, foreign keys on
//! - Timestamps are Unix epoch milliseconds
//! - Amounts are `INTEGER` token units
//! - Schema version stored in `PRAGMA user_version`
//! - `ledger_entries` rejects UPDATE and DELETE through triggers

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use super::{AuditSnapshot, Changeset, LedgerStore, RecordKind, StoreError};
use crate::Amount;
use crate::model::{
    Actor, EntryId, LedgerEntry, PayoutMethodId, PayoutRequest, PayoutRequestId, PayoutStatus,
    RefundId, RefundRecord, RefundStatus, SpendTransaction, TransactionId, UserId, Vault, VaultId,
};

pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS vaults (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    owner TEXT,
    available INTEGER NOT NULL CHECK (available >= 0),
    locked INTEGER NOT NULL CHECK (locked >= 0),
    lifetime_in INTEGER NOT NULL,
    lifetime_out INTEGER NOT NULL,
    updated_at INTEGER,
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_entries (
    sequence INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    timestamp INTEGER NOT NULL,
    kind TEXT NOT NULL,
    vault TEXT NOT NULL,
    counterparty TEXT,
    amount INTEGER NOT NULL,
    related_transaction TEXT NOT NULL,
    metadata TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entries_vault ON ledger_entries(vault);
CREATE INDEX IF NOT EXISTS idx_entries_related ON ledger_entries(related_transaction);
CREATE INDEX IF NOT EXISTS idx_entries_timestamp ON ledger_entries(timestamp);

CREATE TRIGGER IF NOT EXISTS ledger_entries_immutable
BEFORE UPDATE ON ledger_entries
BEGIN
    SELECT RAISE(ABORT, 'ledger entries are immutable');
END;

CREATE TRIGGER IF NOT EXISTS ledger_entries_append_only
BEFORE DELETE ON ledger_entries
BEGIN
    SELECT RAISE(ABORT, 'ledger entries are append-only');
END;

CREATE TABLE IF NOT EXISTS spend_transactions (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    payer TEXT NOT NULL,
    earner TEXT,
    payer_vault TEXT NOT NULL,
    earner_vault TEXT,
    platform_vault TEXT NOT NULL,
    gross_amount INTEGER NOT NULL,
    earner_share INTEGER NOT NULL,
    platform_share INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    CHECK (earner_share + platform_share = gross_amount)
);

CREATE INDEX IF NOT EXISTS idx_spends_payer ON spend_transactions(payer);
CREATE INDEX IF NOT EXISTS idx_spends_earner ON spend_transactions(earner);

CREATE TABLE IF NOT EXISTS refund_records (
    id TEXT PRIMARY KEY,
    original_transaction TEXT NOT NULL,
    requested_by TEXT NOT NULL,
    status TEXT NOT NULL,
    refunded_amount INTEGER NOT NULL,
    reason TEXT NOT NULL,
    denial TEXT,
    decided_by TEXT,
    created_at INTEGER NOT NULL,
    decided_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_refunds_requester ON refund_records(requested_by, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_refunds_one_reversal
    ON refund_records(original_transaction) WHERE status = 'REVERSED';

CREATE TABLE IF NOT EXISTS payout_requests (
    id TEXT PRIMARY KEY,
    creator TEXT NOT NULL,
    creator_vault TEXT NOT NULL,
    method TEXT NOT NULL,
    amount INTEGER NOT NULL CHECK (amount > 0),
    status TEXT NOT NULL,
    checks TEXT NOT NULL,
    risk_score REAL,
    decided_by TEXT,
    created_at INTEGER NOT NULL,
    decided_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_payouts_creator ON payout_requests(creator);
CREATE INDEX IF NOT EXISTS idx_payouts_status ON payout_requests(status);
"#;

/// SQLite-backed [`LedgerStore`]. One connection, serialized by a mutex;
/// every commit runs in an `IMMEDIATE` transaction.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path` and run pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "opened ledger database");
        Self::init(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = FULL;",
        )?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if current == 0 {
        info!("initializing ledger schema v{SCHEMA_VERSION}");
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    } else if current > SCHEMA_VERSION {
        return Err(StoreError::Corrupt(format!(
            "database schema v{current} is newer than supported v{SCHEMA_VERSION}"
        )));
    }
    Ok(())
}

// column helpers

fn conversion_error(
    idx: usize,
    ty: Type,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, Type::Text, e))
}

fn parse_opt_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: Option<String> = row.get(idx)?;
    text.map(|t| t.parse::<T>().map_err(|e| conversion_error(idx, Type::Text, e)))
        .transpose()
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, Type::Text, e))
}

#[derive(Debug, thiserror::Error)]
#[error("timestamp {0} out of range")]
struct TimestampOutOfRange(i64);

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(idx, Type::Integer, TimestampOutOfRange(ms)))
}

fn ts_opt_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => ts_col(row, idx).map(Some),
        None => Ok(None),
    }
}

fn amount_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Amount> {
    row.get::<_, i64>(idx).map(Amount::new)
}

// row mappers

const VAULT_COLUMNS: &str =
    "id, kind, owner, available, locked, lifetime_in, lifetime_out, updated_at, version";

fn vault_row(row: &Row<'_>) -> rusqlite::Result<Vault> {
    Ok(Vault {
        id: VaultId::new(row.get::<_, String>(0)?),
        kind: parse_col(row, 1)?,
        owner: row.get::<_, Option<String>>(2)?.map(UserId::new),
        available: amount_col(row, 3)?,
        locked: amount_col(row, 4)?,
        lifetime_in: amount_col(row, 5)?,
        lifetime_out: amount_col(row, 6)?,
        updated_at: ts_opt_col(row, 7)?,
        version: row.get::<_, i64>(8)? as u64,
    })
}

const ENTRY_COLUMNS: &str =
    "sequence, id, timestamp, kind, vault, counterparty, amount, related_transaction, metadata";

fn entry_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        sequence: row.get::<_, i64>(0)? as u64,
        id: EntryId::new(row.get::<_, String>(1)?),
        timestamp: ts_col(row, 2)?,
        kind: parse_col(row, 3)?,
        vault: VaultId::new(row.get::<_, String>(4)?),
        counterparty: row.get::<_, Option<String>>(5)?.map(VaultId::new),
        amount: amount_col(row, 6)?,
        related_transaction: TransactionId::new(row.get::<_, String>(7)?),
        metadata: json_col(row, 8)?,
    })
}

const SPEND_COLUMNS: &str = "id, kind, payer, earner, payer_vault, earner_vault, platform_vault, \
     gross_amount, earner_share, platform_share, created_at";

fn spend_row(row: &Row<'_>) -> rusqlite::Result<SpendTransaction> {
    Ok(SpendTransaction {
        id: TransactionId::new(row.get::<_, String>(0)?),
        kind: parse_col(row, 1)?,
        payer: UserId::new(row.get::<_, String>(2)?),
        earner: row.get::<_, Option<String>>(3)?.map(UserId::new),
        payer_vault: VaultId::new(row.get::<_, String>(4)?),
        earner_vault: row.get::<_, Option<String>>(5)?.map(VaultId::new),
        platform_vault: VaultId::new(row.get::<_, String>(6)?),
        gross_amount: amount_col(row, 7)?,
        earner_share: amount_col(row, 8)?,
        platform_share: amount_col(row, 9)?,
        created_at: ts_col(row, 10)?,
    })
}

const REFUND_COLUMNS: &str = "id, original_transaction, requested_by, status, refunded_amount, \
     reason, denial, decided_by, created_at, decided_at";

fn refund_row(row: &Row<'_>) -> rusqlite::Result<RefundRecord> {
    Ok(RefundRecord {
        id: RefundId::new(row.get::<_, String>(0)?),
        original_transaction: TransactionId::new(row.get::<_, String>(1)?),
        requested_by: parse_col(row, 2)?,
        status: parse_col(row, 3)?,
        refunded_amount: amount_col(row, 4)?,
        reason: row.get(5)?,
        denial: row.get(6)?,
        decided_by: parse_opt_col(row, 7)?,
        created_at: ts_col(row, 8)?,
        decided_at: ts_opt_col(row, 9)?,
    })
}

const PAYOUT_COLUMNS: &str = "id, creator, creator_vault, method, amount, status, checks, \
     risk_score, decided_by, created_at, decided_at";

fn payout_row(row: &Row<'_>) -> rusqlite::Result<PayoutRequest> {
    Ok(PayoutRequest {
        id: PayoutRequestId::new(row.get::<_, String>(0)?),
        creator: UserId::new(row.get::<_, String>(1)?),
        creator_vault: VaultId::new(row.get::<_, String>(2)?),
        method: PayoutMethodId::new(row.get::<_, String>(3)?),
        amount: amount_col(row, 4)?,
        status: parse_col(row, 5)?,
        checks: json_col(row, 6)?,
        risk_score: row.get(7)?,
        decided_by: parse_opt_col(row, 8)?,
        created_at: ts_col(row, 9)?,
        decided_at: ts_opt_col(row, 10)?,
    })
}

fn exists(conn: &Connection, sql: &str, key: &str) -> Result<bool, StoreError> {
    Ok(conn
        .query_row(sql, [key], |_| Ok(()))
        .optional()?
        .is_some())
}

fn validate(conn: &Connection, changes: &Changeset) -> Result<(), StoreError> {
    for (id, version) in &changes.read_versions {
        let current: Option<i64> = conn
            .query_row("SELECT version FROM vaults WHERE id = ?1", [id.as_str()], |r| {
                r.get(0)
            })
            .optional()?;
        if current.unwrap_or(0) as u64 != *version {
            return Err(StoreError::Conflict);
        }
    }
    for (payout, expected) in &changes.payout_updates {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM payout_requests WHERE id = ?1",
                [payout.id.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        if status.as_deref() != Some(expected.as_str()) {
            return Err(StoreError::Conflict);
        }
    }
    let duplicate = |kind, id: &str| StoreError::Duplicate {
        kind,
        id: id.to_string(),
    };
    for entry in &changes.entries {
        if exists(conn, "SELECT 1 FROM ledger_entries WHERE id = ?1", entry.id.as_str())? {
            return Err(duplicate(RecordKind::Entry, entry.id.as_str()));
        }
    }
    for spend in &changes.spends {
        if exists(conn, "SELECT 1 FROM spend_transactions WHERE id = ?1", spend.id.as_str())? {
            return Err(duplicate(RecordKind::Spend, spend.id.as_str()));
        }
    }
    for refund in &changes.refunds {
        let reversed = refund.status == RefundStatus::Reversed
            && exists(
                conn,
                "SELECT 1 FROM refund_records
                 WHERE original_transaction = ?1 AND status = 'REVERSED'",
                refund.original_transaction.as_str(),
            )?;
        if reversed || exists(conn, "SELECT 1 FROM refund_records WHERE id = ?1", refund.id.as_str())? {
            return Err(duplicate(RecordKind::Refund, refund.id.as_str()));
        }
    }
    for payout in &changes.new_payouts {
        if exists(conn, "SELECT 1 FROM payout_requests WHERE id = ?1", payout.id.as_str())? {
            return Err(duplicate(RecordKind::Payout, payout.id.as_str()));
        }
    }
    Ok(())
}

fn write(conn: &Connection, changes: Changeset) -> Result<(), StoreError> {
    for vault in changes.written_vaults() {
        conn.execute(
            "INSERT INTO vaults (id, kind, owner, available, locked, lifetime_in, lifetime_out,
                                 updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                available = excluded.available,
                locked = excluded.locked,
                lifetime_in = excluded.lifetime_in,
                lifetime_out = excluded.lifetime_out,
                updated_at = excluded.updated_at,
                version = excluded.version",
            params![
                vault.id.as_str(),
                vault.kind.as_str(),
                vault.owner.as_ref().map(UserId::as_str),
                vault.available.units(),
                vault.locked.units(),
                vault.lifetime_in.units(),
                vault.lifetime_out.units(),
                vault.updated_at.map(millis),
                vault.version as i64,
            ],
        )?;
    }
    for entry in &changes.entries {
        conn.execute(
            "INSERT INTO ledger_entries (id, timestamp, kind, vault, counterparty, amount,
                                         related_transaction, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.id.as_str(),
                millis(entry.timestamp),
                entry.kind.as_str(),
                entry.vault.as_str(),
                entry.counterparty.as_ref().map(VaultId::as_str),
                entry.amount.units(),
                entry.related_transaction.as_str(),
                serde_json::to_string(&entry.metadata)?,
            ],
        )?;
    }
    for spend in &changes.spends {
        conn.execute(
            &format!(
                "INSERT INTO spend_transactions ({SPEND_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                spend.id.as_str(),
                spend.kind.as_str(),
                spend.payer.as_str(),
                spend.earner.as_ref().map(UserId::as_str),
                spend.payer_vault.as_str(),
                spend.earner_vault.as_ref().map(VaultId::as_str),
                spend.platform_vault.as_str(),
                spend.gross_amount.units(),
                spend.earner_share.units(),
                spend.platform_share.units(),
                millis(spend.created_at),
            ],
        )?;
    }
    for refund in &changes.refunds {
        conn.execute(
            &format!(
                "INSERT INTO refund_records ({REFUND_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                refund.id.as_str(),
                refund.original_transaction.as_str(),
                refund.requested_by.to_string(),
                refund.status.as_str(),
                refund.refunded_amount.units(),
                refund.reason,
                refund.denial,
                refund.decided_by.as_ref().map(Actor::to_string),
                millis(refund.created_at),
                refund.decided_at.map(millis),
            ],
        )?;
    }
    for payout in &changes.new_payouts {
        conn.execute(
            &format!(
                "INSERT INTO payout_requests ({PAYOUT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                payout.id.as_str(),
                payout.creator.as_str(),
                payout.creator_vault.as_str(),
                payout.method.as_str(),
                payout.amount.units(),
                payout.status.as_str(),
                serde_json::to_string(&payout.checks)?,
                payout.risk_score,
                payout.decided_by.as_ref().map(Actor::to_string),
                millis(payout.created_at),
                payout.decided_at.map(millis),
            ],
        )?;
    }
    for (payout, expected) in &changes.payout_updates {
        let updated = conn.execute(
            "UPDATE payout_requests
             SET status = ?1, checks = ?2, risk_score = ?3, decided_by = ?4, decided_at = ?5
             WHERE id = ?6 AND status = ?7",
            params![
                payout.status.as_str(),
                serde_json::to_string(&payout.checks)?,
                payout.risk_score,
                payout.decided_by.as_ref().map(Actor::to_string),
                payout.decided_at.map(millis),
                payout.id.as_str(),
                expected.as_str(),
            ],
        )?;
        if updated != 1 {
            return Err(StoreError::Conflict);
        }
    }
    Ok(())
}

impl LedgerStore for SqliteStore {
    fn load_vaults(&self, ids: &[VaultId]) -> Result<Vec<Vault>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {VAULT_COLUMNS} FROM vaults WHERE id = ?1"
        ))?;
        ids.iter()
            .map(|id| {
                Ok::<_, StoreError>(
                    stmt.query_row([id.as_str()], vault_row)
                        .optional()?
                        .unwrap_or_else(|| Vault::empty(id.clone())),
                )
            })
            .collect()
    }

    fn commit(&self, changes: Changeset) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        // dropping `tx` on an early return rolls back
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        validate(&tx, &changes)?;
        write(&tx, changes)?;
        tx.commit()?;
        Ok(())
    }

    fn vault(&self, id: &VaultId) -> Result<Option<Vault>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {VAULT_COLUMNS} FROM vaults WHERE id = ?1"),
                [id.as_str()],
                vault_row,
            )
            .optional()?)
    }

    fn vaults(&self) -> Result<Vec<Vault>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {VAULT_COLUMNS} FROM vaults ORDER BY id"))?;
        let rows = stmt
            .query_map([], vault_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn entry(&self, id: &EntryId) -> Result<Option<LedgerEntry>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE id = ?1"),
                [id.as_str()],
                entry_row,
            )
            .optional()?)
    }

    fn entries_after(&self, after: u64, limit: usize) -> Result<Vec<LedgerEntry>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries
             WHERE sequence > ?1 ORDER BY sequence LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![after as i64, limit as i64], entry_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn spend(&self, id: &TransactionId) -> Result<Option<SpendTransaction>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {SPEND_COLUMNS} FROM spend_transactions WHERE id = ?1"),
                [id.as_str()],
                spend_row,
            )
            .optional()?)
    }

    fn reversal_of(&self, transaction: &TransactionId) -> Result<Option<RefundRecord>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {REFUND_COLUMNS} FROM refund_records
                     WHERE original_transaction = ?1 AND status = 'REVERSED'"
                ),
                [transaction.as_str()],
                refund_row,
            )
            .optional()?)
    }

    fn refund_requests_since(
        &self,
        requester: &Actor,
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM refund_records WHERE requested_by = ?1 AND created_at >= ?2",
            params![requester.to_string(), millis(since)],
            |r| r.get(0),
        )?;
        Ok(count as u32)
    }

    fn payout(&self, id: &PayoutRequestId) -> Result<Option<PayoutRequest>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {PAYOUT_COLUMNS} FROM payout_requests WHERE id = ?1"),
                [id.as_str()],
                payout_row,
            )
            .optional()?)
    }

    fn payouts_by_creator(&self, creator: &UserId) -> Result<Vec<PayoutRequest>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payout_requests WHERE creator = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map([creator.as_str()], payout_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn payouts_by_status(&self, status: PayoutStatus) -> Result<Vec<PayoutRequest>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payout_requests WHERE status = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map([status.as_str()], payout_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn audit_snapshot(&self) -> Result<AuditSnapshot, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let head: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) FROM ledger_entries",
            [],
            |r| r.get(0),
        )?;
        let vaults = {
            let mut stmt = tx.prepare(&format!("SELECT {VAULT_COLUMNS} FROM vaults ORDER BY id"))?;
            let rows = stmt
                .query_map([], vault_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let reserved = {
            let mut stmt = tx.prepare(
                "SELECT creator_vault, SUM(amount) FROM payout_requests
                 WHERE status IN ('REQUESTED', 'LOCKED') GROUP BY creator_vault",
            )?;
            let rows = stmt
                .query_map([], |r| {
                    Ok((VaultId::new(r.get::<_, String>(0)?), amount_col(r, 1)?))
                })?
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            rows
        };
        tx.commit()?;
        Ok(AuditSnapshot {
            head: head as u64,
            vaults,
            reserved,
        })
    }
}
