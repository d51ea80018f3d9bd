//! In-memory backend. Readers and the committer share one `RwLock`; commits
//! validate versions under the write lock, so concurrent updates of the same
//! vault surface as conflicts and are retried by [`atomic_update`](super::atomic_update).

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use super::{AuditSnapshot, Changeset, LedgerStore, RecordKind, StoreError};
use crate::Amount;
use crate::model::{
    Actor, EntryId, LedgerEntry, PayoutRequest, PayoutRequestId, PayoutStatus, RefundId,
    RefundRecord, RefundStatus, SpendTransaction, TransactionId, UserId, Vault, VaultId,
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    vaults: HashMap<VaultId, Vault>,
    /// Append-only; `entries[i].sequence == i + 1`.
    entries: Vec<LedgerEntry>,
    entry_index: HashMap<EntryId, usize>,
    spends: HashMap<TransactionId, SpendTransaction>,
    refunds: HashMap<RefundId, RefundRecord>,
    reversals: HashMap<TransactionId, RefundId>,
    payouts: HashMap<PayoutRequestId, PayoutRequest>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn validate(&self, changes: &Changeset) -> Result<(), StoreError> {
        for (id, version) in &changes.read_versions {
            let current = self.vaults.get(id).map_or(0, |v| v.version);
            if current != *version {
                return Err(StoreError::Conflict);
            }
        }
        for (payout, expected) in &changes.payout_updates {
            match self.payouts.get(&payout.id) {
                Some(stored) if stored.status == *expected => {}
                _ => return Err(StoreError::Conflict),
            }
        }
        for entry in &changes.entries {
            if self.entry_index.contains_key(&entry.id) {
                return Err(duplicate(RecordKind::Entry, entry.id.as_str()));
            }
        }
        for spend in &changes.spends {
            if self.spends.contains_key(&spend.id) {
                return Err(duplicate(RecordKind::Spend, spend.id.as_str()));
            }
        }
        for refund in &changes.refunds {
            if self.refunds.contains_key(&refund.id)
                || (refund.status == RefundStatus::Reversed
                    && self.reversals.contains_key(&refund.original_transaction))
            {
                return Err(duplicate(RecordKind::Refund, refund.id.as_str()));
            }
        }
        for payout in &changes.new_payouts {
            if self.payouts.contains_key(&payout.id) {
                return Err(duplicate(RecordKind::Payout, payout.id.as_str()));
            }
        }
        Ok(())
    }

    fn apply(&mut self, changes: Changeset) {
        for vault in changes.written_vaults() {
            self.vaults.insert(vault.id.clone(), vault);
        }
        for mut entry in changes.entries {
            entry.sequence = self.entries.len() as u64 + 1;
            self.entry_index.insert(entry.id.clone(), self.entries.len());
            self.entries.push(entry);
        }
        for spend in changes.spends {
            self.spends.insert(spend.id.clone(), spend);
        }
        for refund in changes.refunds {
            if refund.status == RefundStatus::Reversed {
                self.reversals
                    .insert(refund.original_transaction.clone(), refund.id.clone());
            }
            self.refunds.insert(refund.id.clone(), refund);
        }
        for payout in changes.new_payouts {
            self.payouts.insert(payout.id.clone(), payout);
        }
        for (payout, _) in changes.payout_updates {
            self.payouts.insert(payout.id.clone(), payout);
        }
    }
}

fn duplicate(kind: RecordKind, id: &str) -> StoreError {
    StoreError::Duplicate {
        kind,
        id: id.to_string(),
    }
}

impl LedgerStore for MemoryStore {
    fn load_vaults(&self, ids: &[VaultId]) -> Result<Vec<Vault>, StoreError> {
        let inner = self.inner.read();
        Ok(ids
            .iter()
            .map(|id| {
                inner
                    .vaults
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| Vault::empty(id.clone()))
            })
            .collect())
    }

    fn commit(&self, changes: Changeset) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.validate(&changes)?;
        inner.apply(changes);
        Ok(())
    }

    fn vault(&self, id: &VaultId) -> Result<Option<Vault>, StoreError> {
        Ok(self.inner.read().vaults.get(id).cloned())
    }

    fn vaults(&self) -> Result<Vec<Vault>, StoreError> {
        let mut vaults: Vec<_> = self.inner.read().vaults.values().cloned().collect();
        vaults.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(vaults)
    }

    fn entry(&self, id: &EntryId) -> Result<Option<LedgerEntry>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .entry_index
            .get(id)
            .map(|&idx| inner.entries[idx].clone()))
    }

    fn entries_after(&self, after: u64, limit: usize) -> Result<Vec<LedgerEntry>, StoreError> {
        let inner = self.inner.read();
        let start = (after as usize).min(inner.entries.len());
        Ok(inner.entries[start..].iter().take(limit).cloned().collect())
    }

    fn spend(&self, id: &TransactionId) -> Result<Option<SpendTransaction>, StoreError> {
        Ok(self.inner.read().spends.get(id).cloned())
    }

    fn reversal_of(&self, transaction: &TransactionId) -> Result<Option<RefundRecord>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .reversals
            .get(transaction)
            .and_then(|id| inner.refunds.get(id))
            .cloned())
    }

    fn refund_requests_since(
        &self,
        requester: &Actor,
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let inner = self.inner.read();
        let count = inner
            .refunds
            .values()
            .filter(|r| &r.requested_by == requester && r.created_at >= since)
            .count();
        Ok(count as u32)
    }

    fn payout(&self, id: &PayoutRequestId) -> Result<Option<PayoutRequest>, StoreError> {
        Ok(self.inner.read().payouts.get(id).cloned())
    }

    fn payouts_by_creator(&self, creator: &UserId) -> Result<Vec<PayoutRequest>, StoreError> {
        let inner = self.inner.read();
        let mut payouts: Vec<_> = inner
            .payouts
            .values()
            .filter(|p| &p.creator == creator)
            .cloned()
            .collect();
        payouts.sort_by_key(|p| p.created_at);
        Ok(payouts)
    }

    fn payouts_by_status(&self, status: PayoutStatus) -> Result<Vec<PayoutRequest>, StoreError> {
        let inner = self.inner.read();
        let mut payouts: Vec<_> = inner
            .payouts
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        payouts.sort_by_key(|p| p.created_at);
        Ok(payouts)
    }

    fn audit_snapshot(&self) -> Result<AuditSnapshot, StoreError> {
        let inner = self.inner.read();
        let mut reserved: BTreeMap<VaultId, Amount> = BTreeMap::new();
        for payout in inner.payouts.values() {
            if payout.status.holds_reservation() {
                *reserved.entry(payout.creator_vault.clone()).or_default() += payout.amount;
            }
        }
        let mut vaults: Vec<_> = inner.vaults.values().cloned().collect();
        vaults.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(AuditSnapshot {
            head: inner.entries.len() as u64,
            vaults,
            reserved,
        })
    }
}
