//! Storage abstraction for vault rows, the append-only ledger, and request
//! records.
//!
//! Every balance change goes through [`atomic_update`]: vault rows are read
//! with their versions, the caller stages changes on a [`Changeset`], and the
//! backend commits the whole set only if none of the rows it read has moved.
//! A conflicting commit is retried from a fresh read a bounded number of times.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::Amount;
use crate::model::{
    Actor, EntryId, LedgerEntry, PayoutRequest, PayoutRequestId, PayoutStatus, RefundRecord,
    SpendTransaction, TransactionId, UserId, Vault, VaultId,
};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Kind of record a duplicate id collided with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Entry,
    Spend,
    Refund,
    Payout,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordKind::Entry => "ledger entry",
            RecordKind::Spend => "spend transaction",
            RecordKind::Refund => "refund record",
            RecordKind::Payout => "payout request",
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// A row read by the changeset moved before commit. Retried internally.
    #[error("write conflict")]
    Conflict,

    #[error("store contended; gave up after {attempts} attempts")]
    Contended { attempts: u32 },

    /// An id that must be unique already exists; the idempotent replay path.
    #[error("duplicate {kind} {id}")]
    Duplicate { kind: RecordKind, id: String },

    #[error("balance invariant broken: {0}")]
    Balance(#[from] BalanceError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Callers may retry the whole operation later.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Contended { .. } | StoreError::Conflict)
    }
}

/// A staged balance change that would break non-negativity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalanceError {
    #[error("vault {vault}: available {available}, requested {requested}")]
    InsufficientAvailable {
        vault: VaultId,
        available: Amount,
        requested: Amount,
    },

    #[error("vault {vault}: locked {locked}, requested {requested}")]
    InsufficientLocked {
        vault: VaultId,
        locked: Amount,
        requested: Amount,
    },

    #[error("vault {0}: balance overflow")]
    Overflow(VaultId),

    #[error("vault {0} was not loaded into the changeset")]
    NotLoaded(VaultId),
}

/// Staged writes of one atomic update.
#[derive(Debug)]
pub struct Changeset {
    now: DateTime<Utc>,
    pub(crate) read_versions: BTreeMap<VaultId, u64>,
    vaults: BTreeMap<VaultId, Vault>,
    touched: BTreeSet<VaultId>,
    pub(crate) entries: Vec<LedgerEntry>,
    pub(crate) spends: Vec<SpendTransaction>,
    pub(crate) refunds: Vec<RefundRecord>,
    pub(crate) new_payouts: Vec<PayoutRequest>,
    /// Payout updates with the status they must still have at commit.
    pub(crate) payout_updates: Vec<(PayoutRequest, PayoutStatus)>,
}

impl Changeset {
    pub fn new(vaults: Vec<Vault>, now: DateTime<Utc>) -> Self {
        Self {
            now,
            read_versions: vaults.iter().map(|v| (v.id.clone(), v.version)).collect(),
            vaults: vaults.into_iter().map(|v| (v.id.clone(), v)).collect(),
            touched: BTreeSet::new(),
            entries: Vec::new(),
            spends: Vec::new(),
            refunds: Vec::new(),
            new_payouts: Vec::new(),
            payout_updates: Vec::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn vault(&self, id: &VaultId) -> Option<&Vault> {
        self.vaults.get(id)
    }

    fn vault_mut(&mut self, id: &VaultId) -> Result<&mut Vault, BalanceError> {
        let vault = self
            .vaults
            .get_mut(id)
            .ok_or_else(|| BalanceError::NotLoaded(id.clone()))?;
        vault.updated_at = Some(self.now);
        self.touched.insert(id.clone());
        Ok(vault)
    }

    /// Apply `entry.amount` to the available balance of `entry.vault` and
    /// stage the entry. Debits fail if available would go negative.
    pub fn post(&mut self, entry: LedgerEntry) -> Result<(), BalanceError> {
        let vault = self.vault_mut(&entry.vault)?;
        let available = vault
            .available
            .checked_add(entry.amount)
            .ok_or_else(|| BalanceError::Overflow(vault.id.clone()))?;
        if available.is_negative() {
            return Err(BalanceError::InsufficientAvailable {
                vault: vault.id.clone(),
                available: vault.available,
                requested: entry.amount.abs(),
            });
        }
        vault.available = available;
        count_lifetime(vault, entry.amount)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Debit `entry.amount` (negative) from the locked balance of `entry.vault`.
    pub fn post_locked(&mut self, entry: LedgerEntry) -> Result<(), BalanceError> {
        let vault = self.vault_mut(&entry.vault)?;
        let locked = vault
            .locked
            .checked_add(entry.amount)
            .ok_or_else(|| BalanceError::Overflow(vault.id.clone()))?;
        if locked.is_negative() {
            return Err(BalanceError::InsufficientLocked {
                vault: vault.id.clone(),
                locked: vault.locked,
                requested: entry.amount.abs(),
            });
        }
        vault.locked = locked;
        count_lifetime(vault, entry.amount)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Move `amount` from available to locked. Total is unchanged, so no entry.
    pub fn reserve(&mut self, id: &VaultId, amount: Amount) -> Result<(), BalanceError> {
        let vault = self.vault_mut(id)?;
        if vault.available < amount {
            return Err(BalanceError::InsufficientAvailable {
                vault: id.clone(),
                available: vault.available,
                requested: amount,
            });
        }
        vault.available -= amount;
        vault.locked = vault
            .locked
            .checked_add(amount)
            .ok_or_else(|| BalanceError::Overflow(id.clone()))?;
        Ok(())
    }

    /// Move `amount` from locked back to available.
    pub fn release(&mut self, id: &VaultId, amount: Amount) -> Result<(), BalanceError> {
        let vault = self.vault_mut(id)?;
        if vault.locked < amount {
            return Err(BalanceError::InsufficientLocked {
                vault: id.clone(),
                locked: vault.locked,
                requested: amount,
            });
        }
        vault.locked -= amount;
        vault.available = vault
            .available
            .checked_add(amount)
            .ok_or_else(|| BalanceError::Overflow(id.clone()))?;
        Ok(())
    }

    pub fn insert_spend(&mut self, spend: SpendTransaction) {
        self.spends.push(spend);
    }

    pub fn insert_refund(&mut self, refund: RefundRecord) {
        self.refunds.push(refund);
    }

    pub fn insert_payout(&mut self, payout: PayoutRequest) {
        self.new_payouts.push(payout);
    }

    /// Stage a payout state change; the commit fails with a conflict if the
    /// stored request is no longer in `expected`.
    pub fn update_payout(&mut self, payout: PayoutRequest, expected: PayoutStatus) {
        self.payout_updates.push((payout, expected));
    }

    /// Vault rows that were modified, with their next version.
    pub(crate) fn written_vaults(&self) -> impl Iterator<Item = Vault> + '_ {
        self.touched.iter().filter_map(|id| {
            self.vaults.get(id).map(|vault| Vault {
                version: vault.version + 1,
                ..vault.clone()
            })
        })
    }
}

fn count_lifetime(vault: &mut Vault, amount: Amount) -> Result<(), BalanceError> {
    let updated = if amount.is_negative() {
        vault.lifetime_out.checked_add(amount.abs())
    } else {
        vault.lifetime_in.checked_add(amount)
    }
    .ok_or_else(|| BalanceError::Overflow(vault.id.clone()))?;
    if amount.is_negative() {
        vault.lifetime_out = updated;
    } else {
        vault.lifetime_in = updated;
    }
    Ok(())
}

/// Consistent view of live state used by reconciliation.
#[derive(Debug, Clone)]
pub struct AuditSnapshot {
    /// Sequence of the last committed entry at the time of the snapshot.
    pub head: u64,
    pub vaults: Vec<Vault>,
    /// Sum of REQUESTED/LOCKED payout amounts per vault.
    pub reserved: BTreeMap<VaultId, Amount>,
}

/// Persistence backend.
///
/// Implementations must make [`commit`](LedgerStore::commit) all-or-nothing and
/// serializable with respect to the vault versions recorded in the changeset.
pub trait LedgerStore: Send + Sync {
    /// Vault rows for `ids`, with empty version-0 rows for ids never written.
    fn load_vaults(&self, ids: &[VaultId]) -> Result<Vec<Vault>, StoreError>;

    /// Validate and apply a changeset. Fails with [`StoreError::Conflict`] if a
    /// read row moved or a guarded payout changed state, with
    /// [`StoreError::Duplicate`] if an id to insert already exists.
    fn commit(&self, changes: Changeset) -> Result<(), StoreError>;

    fn vault(&self, id: &VaultId) -> Result<Option<Vault>, StoreError>;

    fn vaults(&self) -> Result<Vec<Vault>, StoreError>;

    fn entry(&self, id: &EntryId) -> Result<Option<LedgerEntry>, StoreError>;

    /// Up to `limit` entries with `sequence > after`, in sequence order.
    fn entries_after(&self, after: u64, limit: usize) -> Result<Vec<LedgerEntry>, StoreError>;

    fn spend(&self, id: &TransactionId) -> Result<Option<SpendTransaction>, StoreError>;

    /// The successful (REVERSED) refund of `transaction`, if any.
    fn reversal_of(&self, transaction: &TransactionId) -> Result<Option<RefundRecord>, StoreError>;

    /// Refund requests filed by `requester` at or after `since`.
    fn refund_requests_since(
        &self,
        requester: &Actor,
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    fn payout(&self, id: &PayoutRequestId) -> Result<Option<PayoutRequest>, StoreError>;

    fn payouts_by_creator(&self, creator: &UserId) -> Result<Vec<PayoutRequest>, StoreError>;

    fn payouts_by_status(&self, status: PayoutStatus) -> Result<Vec<PayoutRequest>, StoreError>;

    /// Vaults, ledger head, and outstanding reservations read atomically.
    fn audit_snapshot(&self) -> Result<AuditSnapshot, StoreError>;
}

/// Run `apply` against freshly loaded `vaults` and commit its changeset,
/// retrying on write conflicts at most `max_attempts` times.
///
/// Errors returned by `apply` abort without writing anything.
pub fn atomic_update<S, T, E, F>(
    store: &S,
    vaults: &[VaultId],
    now: DateTime<Utc>,
    max_attempts: u32,
    mut apply: F,
) -> Result<T, E>
where
    S: LedgerStore + ?Sized,
    E: From<StoreError>,
    F: FnMut(&mut Changeset) -> Result<T, E>,
{
    for attempt in 1..=max_attempts {
        let mut changes = Changeset::new(store.load_vaults(vaults)?, now);
        let value = apply(&mut changes)?;
        match store.commit(changes) {
            Ok(()) => return Ok(value),
            Err(StoreError::Conflict) => {
                debug!(attempt, "write conflict, retrying");
                std::thread::yield_now();
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(StoreError::Contended {
        attempts: max_attempts,
    }
    .into())
}

/// Lazy, ordered, restartable walk over ledger entries.
pub struct LedgerCursor<'a, S: ?Sized> {
    store: &'a S,
    position: u64,
    until: Option<u64>,
    batch: usize,
    buffer: VecDeque<LedgerEntry>,
    exhausted: bool,
}

/// Entries with `sequence > cursor`, fetched `batch` at a time.
pub fn fold_since<S: LedgerStore + ?Sized>(
    store: &S,
    cursor: u64,
    batch: usize,
) -> LedgerCursor<'_, S> {
    LedgerCursor {
        store,
        position: cursor,
        until: None,
        batch: batch.max(1),
        buffer: VecDeque::new(),
        exhausted: false,
    }
}

impl<'a, S: LedgerStore + ?Sized> LedgerCursor<'a, S> {
    /// Stop after the entry with sequence `head`.
    pub fn up_to(mut self, head: u64) -> Self {
        self.until = Some(head);
        self
    }

    /// Sequence of the last entry yielded; pass it back to resume.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl<'a, S: LedgerStore + ?Sized> Iterator for LedgerCursor<'a, S> {
    type Item = Result<LedgerEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.store.entries_after(self.position, self.batch) {
                Ok(page) => {
                    self.exhausted = page.len() < self.batch;
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        let entry = self.buffer.pop_front()?;
        if self.until.is_some_and(|head| entry.sequence > head) {
            self.buffer.clear();
            self.exhausted = true;
            return None;
        }
        self.position = entry.sequence;
        Some(Ok(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntryKind;

    fn entry(id: &str, vault: &VaultId, amount: i64) -> LedgerEntry {
        LedgerEntry::new(
            EntryId::new(id),
            Utc::now(),
            EntryKind::Purchase,
            vault.clone(),
            Amount::new(amount),
            TransactionId::new(id),
        )
    }

    #[test]
    fn post_rejects_overdraft_and_leaves_vault_untouched() {
        let id = VaultId::user(&UserId::new("alice"));
        let mut changes = Changeset::new(vec![Vault::empty(id.clone())], Utc::now());
        changes.post(entry("p1", &id, 100)).unwrap();

        let err = changes.post(entry("s1", &id, -101)).unwrap_err();
        assert_eq!(
            err,
            BalanceError::InsufficientAvailable {
                vault: id.clone(),
                available: Amount::new(100),
                requested: Amount::new(101),
            }
        );
        let vault = changes.vault(&id).unwrap();
        assert_eq!(vault.available, Amount::new(100));
        assert_eq!(vault.lifetime_in, Amount::new(100));
        assert_eq!(changes.entries.len(), 1);
    }

    #[test]
    fn reserve_and_release_move_between_sub_balances() {
        let id = VaultId::creator(&UserId::new("bob"));
        let mut changes = Changeset::new(vec![Vault::empty(id.clone())], Utc::now());
        changes.post(entry("e1", &id, 50)).unwrap();
        changes.reserve(&id, Amount::new(30)).unwrap();
        assert_eq!(changes.vault(&id).unwrap().available, Amount::new(20));
        assert_eq!(changes.vault(&id).unwrap().locked, Amount::new(30));

        assert!(changes.reserve(&id, Amount::new(21)).is_err());
        assert!(changes.release(&id, Amount::new(31)).is_err());

        changes.release(&id, Amount::new(30)).unwrap();
        assert_eq!(changes.vault(&id).unwrap().available, Amount::new(50));
        assert_eq!(changes.vault(&id).unwrap().total(), Amount::new(50));
    }

    #[test]
    fn unloaded_vault_is_an_error() {
        let mut changes = Changeset::new(vec![], Utc::now());
        let id = VaultId::hot();
        assert_eq!(
            changes.post(entry("x", &id, 1)),
            Err(BalanceError::NotLoaded(id))
        );
    }

    #[test]
    fn written_vaults_bump_version() {
        let id = VaultId::hot();
        let other = VaultId::cold();
        let mut changes = Changeset::new(
            vec![Vault::empty(id.clone()), Vault::empty(other)],
            Utc::now(),
        );
        changes.post(entry("x", &id, 5)).unwrap();
        let written: Vec<_> = changes.written_vaults().collect();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].version, 1);
    }
}
