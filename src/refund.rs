//! Refund engine.
//!
//! A refund returns the earner share of a spend to the payer. The platform
//! share is never touched. Eligibility is checked in a fixed order and the
//! first failure is the reason reported to the caller. Every decision is kept
//! as a [`RefundRecord`], which is also what the daily quota counts.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::Amount;
use crate::config::RefundConfig;
use crate::engine::{Engine, RefundError};
use crate::model::{
    Actor, EntryId, EntryKind, LedgerEntry, RefundId, RefundRecord, SpendTransaction,
    TransactionId,
};
use crate::signals::DeliveryStatus;
use crate::store::{BalanceError, RecordKind, StoreError, atomic_update};

/// Window the daily refund quota is counted over.
const QUOTA_WINDOW_HOURS: i64 = 24;

/// Result of a successful refund.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReceipt {
    pub refund_id: RefundId,
    pub refunded_amount: Amount,
}

pub struct RefundEngine {
    engine: Arc<Engine>,
    delivery: Arc<dyn DeliveryStatus>,
    grace_window: Duration,
    daily_quota: u32,
}

impl RefundEngine {
    pub fn new(engine: Arc<Engine>, delivery: Arc<dyn DeliveryStatus>, config: &RefundConfig) -> Self {
        let grace_window = config.grace_window().unwrap_or_else(|| {
            warn!(
                secs = config.grace_window_secs,
                "refund grace window out of range, only overrides can refund"
            );
            Duration::zero()
        });
        Self {
            engine,
            delivery,
            grace_window,
            daily_quota: config.daily_quota,
        }
    }

    /// Reverse the earner share of `transaction` back to its payer.
    ///
    /// Users may only refund their own spends, inside the grace window.
    pub fn request_refund(
        &self,
        transaction: &TransactionId,
        reason: &str,
        requested_by: &Actor,
    ) -> Result<RefundReceipt, RefundError> {
        self.process(transaction, reason, requested_by, false)
    }

    /// Administrator path: identical to [`request_refund`](Self::request_refund)
    /// except that the grace window is not enforced.
    pub fn override_refund(
        &self,
        transaction: &TransactionId,
        reason: &str,
        admin: &Actor,
    ) -> Result<RefundReceipt, RefundError> {
        if !matches!(admin, Actor::Admin(_)) {
            return Err(RefundError::Unauthorized(admin.clone()));
        }
        self.process(transaction, reason, admin, true)
    }

    fn process(
        &self,
        transaction: &TransactionId,
        reason: &str,
        requested_by: &Actor,
        override_window: bool,
    ) -> Result<RefundReceipt, RefundError> {
        let now = self.engine.clock().now();
        let request = RefundRecord::requested(transaction, requested_by, reason, now);
        let result = self
            .check_eligibility(transaction, requested_by, override_window, now)
            .and_then(|spend| self.reverse(&spend, request.clone().eligible(), now));

        match &result {
            Err(RefundError::Store(_)) | Ok(_) => {}
            Err(denial) => self.record_denial(request.denied(denial.code(), now)),
        }
        result
    }

    /// Eligibility checks, first failure wins:
    /// - The transaction exists and a user requester is its payer
    /// - (a) Not already refunded
    /// - (b) Inside the grace window, unless overridden
    /// - (c) Content not yet delivered
    /// - (d) User requester under the daily quota
    /// - There is an earner share to return
    fn check_eligibility(
        &self,
        transaction: &TransactionId,
        requested_by: &Actor,
        override_window: bool,
        now: DateTime<Utc>,
    ) -> Result<SpendTransaction, RefundError> {
        let store = self.engine.store();
        let spend = store
            .spend(transaction)?
            .ok_or_else(|| RefundError::TransactionNotFound(transaction.clone()))?;

        if matches!(requested_by, Actor::User(user) if user != &spend.payer) {
            return Err(RefundError::NotPayer {
                transaction: transaction.clone(),
                requester: requested_by.clone(),
            });
        }

        if store.reversal_of(transaction)?.is_some() {
            return Err(RefundError::AlreadyRefunded(transaction.clone()));
        }

        // a window reaching past the calendar never closes
        if !override_window {
            if let Some(closed_at) = spend.created_at.checked_add_signed(self.grace_window) {
                if now > closed_at {
                    return Err(RefundError::GraceWindowExpired {
                        transaction: transaction.clone(),
                        closed_at,
                    });
                }
            }
        }

        if self.delivery.is_content_delivered(transaction) {
            return Err(RefundError::ContentAlreadyDelivered(transaction.clone()));
        }

        if matches!(requested_by, Actor::User(_)) {
            let since = now - Duration::hours(QUOTA_WINDOW_HOURS);
            let recent = store.refund_requests_since(requested_by, since)?;
            if recent >= self.daily_quota {
                return Err(RefundError::RefundQuotaExceeded {
                    requester: requested_by.clone(),
                    quota: self.daily_quota,
                });
            }
        }

        if !spend.earner_share.is_positive() {
            return Err(RefundError::NothingToRefund(transaction.clone()));
        }
        Ok(spend)
    }

    /// Debit the earner vault and credit the payer by the earner share, in
    /// one atomic update with the REVERSED record.
    fn reverse(
        &self,
        spend: &SpendTransaction,
        eligible: RefundRecord,
        now: DateTime<Utc>,
    ) -> Result<RefundReceipt, RefundError> {
        let transaction = &spend.id;
        let earner_vault = spend
            .earner_vault
            .clone()
            .ok_or_else(|| RefundError::NothingToRefund(transaction.clone()))?;
        let amount = spend.earner_share;
        let record = eligible.reversed(amount, now);
        let reason = record.reason.as_str();

        let result = atomic_update(
            self.engine.store().as_ref(),
            &[spend.payer_vault.clone(), earner_vault.clone()],
            now,
            self.engine.max_attempts(),
            |changes| {
                if self.engine.store().reversal_of(transaction)?.is_some() {
                    return Err(RefundError::AlreadyRefunded(transaction.clone()));
                }
                changes
                    .post(
                        LedgerEntry::new(
                            EntryId::new(format!("{transaction}:refund:earner")),
                            now,
                            EntryKind::Refund,
                            earner_vault.clone(),
                            -amount,
                            transaction.clone(),
                        )
                        .with_counterparty(spend.payer_vault.clone()),
                    )
                    .map_err(earner_shortfall)?;
                changes
                    .post(
                        LedgerEntry::new(
                            EntryId::new(format!("{transaction}:refund:payer")),
                            now,
                            EntryKind::Refund,
                            spend.payer_vault.clone(),
                            amount,
                            transaction.clone(),
                        )
                        .with_counterparty(earner_vault.clone())
                        .with_meta("reason", reason),
                    )
                    .map_err(StoreError::from)?;
                changes.insert_refund(record.clone());
                Ok(())
            },
        );

        match result {
            Ok(()) => {
                debug!(transaction = %transaction, amount = %amount, "earner share reversed");
                Ok(RefundReceipt {
                    refund_id: record.id,
                    refunded_amount: amount,
                })
            }
            Err(RefundError::Store(StoreError::Duplicate {
                kind: RecordKind::Refund | RecordKind::Entry,
                ..
            })) => Err(RefundError::AlreadyRefunded(transaction.clone())),
            Err(e) => Err(e),
        }
    }

    fn record_denial(&self, record: RefundRecord) {
        let now = record.created_at;
        let stored = atomic_update(
            self.engine.store().as_ref(),
            &[],
            now,
            self.engine.max_attempts(),
            |changes| {
                changes.insert_refund(record.clone());
                Ok::<_, StoreError>(())
            },
        );
        if let Err(e) = stored {
            warn!(
                transaction = %record.original_transaction,
                reason = %e,
                "failed to record refund denial"
            );
        }
    }
}

fn earner_shortfall(err: BalanceError) -> RefundError {
    match err {
        BalanceError::InsufficientAvailable {
            vault,
            available,
            requested,
        } => RefundError::EarnerFundsUnavailable {
            vault,
            available,
            requested,
        },
        other => RefundError::Store(other.into()),
    }
}
