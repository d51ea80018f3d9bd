//! Transaction engine.
//!
//! The only writer of vault balances for purchases and spends. Every
//! operation is one atomic update across the vaults it touches, appends the
//! ledger entries that back the change, and is idempotent on its key.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::Amount;
use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::model::{
    EntryId, EntryKind, LedgerEntry, SpendKind, SpendTransaction, SplitPolicy, TransactionId,
    UserId, VaultBalance, VaultId,
};
use crate::store::{LedgerStore, RecordKind, StoreError, atomic_update};

mod error;
pub use error::{
    EngineError, PayoutError, PurchaseError, RebalanceError, RefundError, SpendError,
};

/// Result of [`Engine::allocate_spend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendReceipt {
    pub transaction_id: TransactionId,
    pub earner_share: Amount,
    pub platform_share: Amount,
    /// The key had already been processed; nothing was applied this time.
    pub replayed: bool,
}

impl SpendReceipt {
    fn from_spend(spend: &SpendTransaction, replayed: bool) -> Self {
        Self {
            transaction_id: spend.id.clone(),
            earner_share: spend.earner_share,
            platform_share: spend.platform_share,
            replayed,
        }
    }
}

/// Result of [`Engine::record_purchase`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseReceipt {
    pub entry_id: EntryId,
    pub replayed: bool,
}

/// The transaction engine.
pub struct Engine {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    split: SplitPolicy,
    max_attempts: u32,
}

/// Public API
impl Engine {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, config: &LedgerConfig) -> Self {
        Self {
            store,
            clock,
            split: config.split_policy(),
            max_attempts: config.store.max_attempts,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn split_policy(&self) -> SplitPolicy {
        self.split
    }

    /// Current balance of a vault. Vaults never written report zero.
    pub fn vault_balance(&self, id: &VaultId) -> Result<VaultBalance, StoreError> {
        Ok(self
            .store
            .vault(id)?
            .map(|vault| vault.balance())
            .unwrap_or_default())
    }

    /// Debit `gross` from the payer's wallet and split it between the
    /// earner's creator vault and the platform revenue vault:
    /// - Reject non-positive amounts and self-payment
    /// - Return the stored result if `key` was already processed
    /// - Append SPEND, EARN and COMMISSION entries sharing `key` as their
    ///   related transaction, in one atomic update with the spend record
    pub fn allocate_spend(
        &self,
        payer: &UserId,
        earner: Option<&UserId>,
        gross: Amount,
        kind: SpendKind,
        key: &TransactionId,
    ) -> Result<SpendReceipt, SpendError> {
        if !gross.is_positive() {
            return Err(SpendError::InvalidAmount(gross));
        }
        if earner == Some(payer) {
            return Err(SpendError::SelfPaymentNotAllowed(payer.clone()));
        }
        if let Some(existing) = self.store.spend(key)? {
            return Ok(SpendReceipt::from_spend(&existing, true));
        }

        let mut vaults = vec![VaultId::user(payer), VaultId::platform_revenue()];
        vaults.extend(earner.map(VaultId::creator));

        let result = atomic_update(
            self.store.as_ref(),
            &vaults,
            self.clock.now(),
            self.max_attempts,
            |changes| {
                // a concurrent call with the same key may have committed since the first check
                if let Some(existing) = self.store.spend(key)? {
                    return Ok(SpendReceipt::from_spend(&existing, true));
                }
                let spend = SpendTransaction::new(
                    key.clone(),
                    kind,
                    payer.clone(),
                    earner.cloned(),
                    gross,
                    &self.split,
                    changes.now(),
                );
                let entry = |suffix: &str, entry_kind, vault: &VaultId, amount| {
                    LedgerEntry::new(
                        EntryId::new(format!("{key}:{suffix}")),
                        spend.created_at,
                        entry_kind,
                        vault.clone(),
                        amount,
                        key.clone(),
                    )
                    .with_meta("spend_kind", kind.as_str())
                };

                let counterparty = spend
                    .earner_vault
                    .clone()
                    .unwrap_or_else(|| spend.platform_vault.clone());
                changes.post(
                    entry("spend", EntryKind::Spend, &spend.payer_vault, -gross)
                        .with_counterparty(counterparty),
                )?;
                if let Some(earner_vault) = &spend.earner_vault {
                    changes.post(
                        entry("earn", EntryKind::Earn, earner_vault, spend.earner_share)
                            .with_counterparty(spend.payer_vault.clone()),
                    )?;
                }
                changes.post(
                    entry(
                        "commission",
                        EntryKind::Commission,
                        &spend.platform_vault,
                        spend.platform_share,
                    )
                    .with_counterparty(spend.payer_vault.clone()),
                )?;

                let receipt = SpendReceipt::from_spend(&spend, false);
                changes.insert_spend(spend);
                Ok(receipt)
            },
        );

        match result {
            Err(SpendError::Store(StoreError::Duplicate {
                kind: RecordKind::Spend | RecordKind::Entry,
                ..
            })) => {
                debug!(key = %key, "spend raced with a replay of the same key");
                let existing = self.store.spend(key)?.ok_or_else(|| {
                    StoreError::Corrupt(format!("spend {key} reported duplicate but is missing"))
                })?;
                Ok(SpendReceipt::from_spend(&existing, true))
            }
            other => other,
        }
    }

    /// Credit `amount` to the user's wallet for a purchase the payment
    /// processor has already settled. The HOT reserve vault is credited with
    /// the same amount. `external_ref` is the idempotency key.
    pub fn record_purchase(
        &self,
        user: &UserId,
        external_ref: &str,
        amount: Amount,
    ) -> Result<PurchaseReceipt, PurchaseError> {
        if external_ref.is_empty() {
            return Err(PurchaseError::MissingReference);
        }
        if !amount.is_positive() {
            return Err(PurchaseError::InvalidAmount(amount));
        }

        let related = TransactionId::new(format!("purchase:{external_ref}"));
        let user_entry = EntryId::new(format!("{related}:user"));
        let hot_entry = EntryId::new(format!("{related}:hot"));
        if let Some(existing) = self.store.entry(&user_entry)? {
            if existing.vault != VaultId::user(user) || existing.amount != amount {
                warn!(
                    reference = external_ref,
                    user = %user,
                    "purchase replayed with different details; keeping original"
                );
            }
            return Ok(PurchaseReceipt {
                entry_id: user_entry,
                replayed: true,
            });
        }

        let user_vault = VaultId::user(user);
        let result = atomic_update(
            self.store.as_ref(),
            &[user_vault.clone(), VaultId::hot()],
            self.clock.now(),
            self.max_attempts,
            |changes| {
                let now = changes.now();
                changes.post(
                    LedgerEntry::new(
                        user_entry.clone(),
                        now,
                        EntryKind::Purchase,
                        user_vault.clone(),
                        amount,
                        related.clone(),
                    )
                    .with_counterparty(VaultId::hot())
                    .with_meta("external_ref", external_ref),
                )?;
                changes.post(
                    LedgerEntry::new(
                        hot_entry.clone(),
                        now,
                        EntryKind::Purchase,
                        VaultId::hot(),
                        amount,
                        related.clone(),
                    )
                    .with_counterparty(user_vault.clone())
                    .with_meta("external_ref", external_ref),
                )?;
                Ok::<_, PurchaseError>(())
            },
        );

        match result {
            Ok(()) => Ok(PurchaseReceipt {
                entry_id: user_entry,
                replayed: false,
            }),
            Err(PurchaseError::Store(StoreError::Duplicate {
                kind: RecordKind::Entry,
                ..
            })) => Ok(PurchaseReceipt {
                entry_id: user_entry,
                replayed: true,
            }),
            Err(e) => Err(e),
        }
    }
}

/// Scheduler-only API
impl Engine {
    /// Move `amount` between the two reserve vaults. Not reachable from any
    /// user-facing path; only the rebalancer calls it.
    pub(crate) fn transfer_reserve(
        &self,
        from: &VaultId,
        to: &VaultId,
        amount: Amount,
        key: &TransactionId,
    ) -> Result<(), RebalanceError> {
        let reserve = [VaultId::hot(), VaultId::cold()];
        debug_assert!(reserve.contains(from) && reserve.contains(to) && from != to);

        atomic_update(
            self.store.as_ref(),
            &[from.clone(), to.clone()],
            self.clock.now(),
            self.max_attempts,
            |changes| {
                let now = changes.now();
                changes.post(
                    LedgerEntry::new(
                        EntryId::new(format!("{key}:out")),
                        now,
                        EntryKind::Rebalance,
                        from.clone(),
                        -amount,
                        key.clone(),
                    )
                    .with_counterparty(to.clone()),
                )?;
                changes.post(
                    LedgerEntry::new(
                        EntryId::new(format!("{key}:in")),
                        now,
                        EntryKind::Rebalance,
                        to.clone(),
                        amount,
                        key.clone(),
                    )
                    .with_counterparty(from.clone()),
                )?;
                Ok(())
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::MemoryStore;

    // test utils

    fn engine() -> Engine {
        Engine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            &LedgerConfig::default(),
        )
    }

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    fn key(id: &str) -> TransactionId {
        TransactionId::new(id)
    }

    fn available(engine: &Engine, vault: VaultId) -> Amount {
        engine.vault_balance(&vault).unwrap().available
    }

    // Purchase

    #[test]
    fn purchase_credits_user_and_hot_reserve() {
        let engine = engine();
        let receipt = engine
            .record_purchase(&user("alice"), "pi_1", Amount::new(1_000))
            .unwrap();
        assert!(!receipt.replayed);
        assert_eq!(available(&engine, VaultId::user(&user("alice"))), Amount::new(1_000));
        assert_eq!(available(&engine, VaultId::hot()), Amount::new(1_000));
    }

    #[test]
    fn duplicate_webhook_credits_once() {
        let engine = engine();
        engine
            .record_purchase(&user("alice"), "pi_abc123", Amount::new(200))
            .unwrap();
        let replay = engine
            .record_purchase(&user("alice"), "pi_abc123", Amount::new(200))
            .unwrap();
        assert!(replay.replayed);
        assert_eq!(available(&engine, VaultId::user(&user("alice"))), Amount::new(200));
        assert_eq!(engine.store().entries_after(0, 10).unwrap().len(), 2);
    }

    #[test]
    fn purchase_rejects_bad_input() {
        let engine = engine();
        assert!(matches!(
            engine.record_purchase(&user("alice"), "pi_1", Amount::ZERO),
            Err(PurchaseError::InvalidAmount(_))
        ));
        assert!(matches!(
            engine.record_purchase(&user("alice"), "", Amount::new(5)),
            Err(PurchaseError::MissingReference)
        ));
    }

    // Spend

    #[test]
    fn spend_splits_between_earner_and_platform() {
        let engine = engine();
        engine
            .record_purchase(&user("alice"), "pi_1", Amount::new(1_000))
            .unwrap();
        let receipt = engine
            .allocate_spend(
                &user("alice"),
                Some(&user("bob")),
                Amount::new(100),
                SpendKind::Chat,
                &key("chat-1"),
            )
            .unwrap();

        assert_eq!(receipt.earner_share, Amount::new(65));
        assert_eq!(receipt.platform_share, Amount::new(35));
        assert_eq!(available(&engine, VaultId::user(&user("alice"))), Amount::new(900));
        assert_eq!(available(&engine, VaultId::creator(&user("bob"))), Amount::new(65));
        assert_eq!(available(&engine, VaultId::platform_revenue()), Amount::new(35));

        let kinds: Vec<_> = engine
            .store()
            .entries_after(2, 10)
            .unwrap()
            .into_iter()
            .map(|e| (e.kind, e.related_transaction))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (EntryKind::Spend, key("chat-1")),
                (EntryKind::Earn, key("chat-1")),
                (EntryKind::Commission, key("chat-1")),
            ]
        );
    }

    #[test]
    fn spend_is_idempotent_on_key() {
        let engine = engine();
        engine
            .record_purchase(&user("alice"), "pi_1", Amount::new(1_000))
            .unwrap();
        let first = engine
            .allocate_spend(&user("alice"), Some(&user("bob")), Amount::new(100), SpendKind::Chat, &key("k"))
            .unwrap();
        let second = engine
            .allocate_spend(&user("alice"), Some(&user("bob")), Amount::new(100), SpendKind::Chat, &key("k"))
            .unwrap();

        assert!(second.replayed);
        assert_eq!(first.earner_share, second.earner_share);
        assert_eq!(available(&engine, VaultId::user(&user("alice"))), Amount::new(900));
        assert_eq!(engine.store().entries_after(0, 100).unwrap().len(), 5);
    }

    #[test]
    fn spend_insufficient_balance_changes_nothing() {
        let engine = engine();
        engine
            .record_purchase(&user("alice"), "pi_1", Amount::new(50))
            .unwrap();
        let result = engine.allocate_spend(
            &user("alice"),
            Some(&user("bob")),
            Amount::new(51),
            SpendKind::Call,
            &key("call-1"),
        );
        assert!(matches!(
            result,
            Err(SpendError::InsufficientBalance { available, requested, .. })
                if available == Amount::new(50) && requested == Amount::new(51)
        ));
        assert_eq!(available(&engine, VaultId::user(&user("alice"))), Amount::new(50));
        assert_eq!(engine.store().spend(&key("call-1")).unwrap(), None);
        assert_eq!(engine.store().entries_after(0, 100).unwrap().len(), 2);
    }

    #[test]
    fn spend_from_unknown_wallet_is_insufficient() {
        let engine = engine();
        let result = engine.allocate_spend(
            &user("ghost"),
            Some(&user("bob")),
            Amount::new(1),
            SpendKind::Gift,
            &key("g"),
        );
        assert!(matches!(result, Err(SpendError::InsufficientBalance { .. })));
    }

    #[test]
    fn self_payment_rejected() {
        let engine = engine();
        engine
            .record_purchase(&user("alice"), "pi_1", Amount::new(100))
            .unwrap();
        assert!(matches!(
            engine.allocate_spend(&user("alice"), Some(&user("alice")), Amount::new(10), SpendKind::Gift, &key("g")),
            Err(SpendError::SelfPaymentNotAllowed(_))
        ));
    }

    #[test]
    fn non_positive_spend_rejected() {
        let engine = engine();
        assert!(matches!(
            engine.allocate_spend(&user("alice"), Some(&user("bob")), Amount::new(-5), SpendKind::Gift, &key("g")),
            Err(SpendError::InvalidAmount(_))
        ));
    }

    #[test]
    fn boost_without_earner_goes_to_platform() {
        let engine = engine();
        engine
            .record_purchase(&user("alice"), "pi_1", Amount::new(100))
            .unwrap();
        let receipt = engine
            .allocate_spend(&user("alice"), None, Amount::new(40), SpendKind::Boost, &key("b"))
            .unwrap();
        assert_eq!(receipt.platform_share, Amount::new(40));
        assert_eq!(available(&engine, VaultId::platform_revenue()), Amount::new(40));
    }

    // Reserve transfers

    #[test]
    fn transfer_reserve_moves_between_hot_and_cold() {
        let engine = engine();
        engine
            .record_purchase(&user("alice"), "pi_1", Amount::new(500))
            .unwrap();
        engine
            .transfer_reserve(&VaultId::hot(), &VaultId::cold(), Amount::new(200), &key("rb-1"))
            .unwrap();
        assert_eq!(available(&engine, VaultId::hot()), Amount::new(300));
        assert_eq!(available(&engine, VaultId::cold()), Amount::new(200));

        let err = engine
            .transfer_reserve(&VaultId::cold(), &VaultId::hot(), Amount::new(201), &key("rb-2"))
            .unwrap_err();
        assert!(matches!(
            err,
            RebalanceError::Store(StoreError::Balance(_))
        ));
    }
}
