//! Error types for ledger operations.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::Amount;
use crate::model::{
    Actor, PayoutBlockReason, PayoutRequestId, PayoutStatus, TransactionId, UserId, VaultId,
};
use crate::store::{BalanceError, StoreError};

/// Top-level error returned by [`Treasury::apply`](crate::Treasury::apply).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("spend failed: {0}")]
    Spend(#[from] SpendError),

    #[error("purchase failed: {0}")]
    Purchase(#[from] PurchaseError),

    #[error("refund denied: {0}")]
    Refund(#[from] RefundError),

    #[error("payout failed: {0}")]
    Payout(#[from] PayoutError),

    #[error("rebalance failed: {0}")]
    Rebalance(#[from] RebalanceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Transient storage contention; the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        let store = match self {
            EngineError::Spend(SpendError::Store(e))
            | EngineError::Purchase(PurchaseError::Store(e))
            | EngineError::Refund(RefundError::Store(e))
            | EngineError::Payout(PayoutError::Store(e))
            | EngineError::Rebalance(RebalanceError::Store(e))
            | EngineError::Store(e) => e,
            _ => return false,
        };
        store.is_transient()
    }
}

/// Error during spend allocation.
#[derive(Debug, Error)]
pub enum SpendError {
    #[error("amount {0} must be positive")]
    InvalidAmount(Amount),

    #[error("user {0} cannot pay themselves")]
    SelfPaymentNotAllowed(UserId),

    #[error("insufficient balance in {vault}: available {available}, requested {requested}")]
    InsufficientBalance {
        vault: VaultId,
        available: Amount,
        requested: Amount,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<BalanceError> for SpendError {
    fn from(err: BalanceError) -> Self {
        match err {
            BalanceError::InsufficientAvailable {
                vault,
                available,
                requested,
            } => SpendError::InsufficientBalance {
                vault,
                available,
                requested,
            },
            other => SpendError::Store(other.into()),
        }
    }
}

/// Error while recording a settled purchase.
#[derive(Debug, Error)]
pub enum PurchaseError {
    #[error("amount {0} must be positive")]
    InvalidAmount(Amount),

    #[error("external payment reference is empty")]
    MissingReference,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<BalanceError> for PurchaseError {
    fn from(err: BalanceError) -> Self {
        PurchaseError::Store(err.into())
    }
}

/// Reason a refund request was denied.
#[derive(Debug, Error)]
pub enum RefundError {
    #[error("transaction {0} not found")]
    TransactionNotFound(TransactionId),

    #[error("{requester} did not pay for transaction {transaction}")]
    NotPayer {
        transaction: TransactionId,
        requester: Actor,
    },

    #[error("transaction {0} was already refunded")]
    AlreadyRefunded(TransactionId),

    #[error("refund window for transaction {transaction} closed at {closed_at}")]
    GraceWindowExpired {
        transaction: TransactionId,
        closed_at: DateTime<Utc>,
    },

    #[error("content for transaction {0} was already delivered")]
    ContentAlreadyDelivered(TransactionId),

    #[error("{requester} exceeded the daily quota of {quota} refund requests")]
    RefundQuotaExceeded { requester: Actor, quota: u32 },

    #[error("{0} may not override the refund window")]
    Unauthorized(Actor),

    #[error("transaction {0} has no refundable earner share")]
    NothingToRefund(TransactionId),

    #[error("earner vault {vault} cannot cover the refund: available {available}, requested {requested}")]
    EarnerFundsUnavailable {
        vault: VaultId,
        available: Amount,
        requested: Amount,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RefundError {
    /// Stable code persisted on DENIED refund records and shown to users.
    pub fn code(&self) -> &'static str {
        match self {
            RefundError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            RefundError::NotPayer { .. } => "NOT_PAYER",
            RefundError::AlreadyRefunded(_) => "ALREADY_REFUNDED",
            RefundError::GraceWindowExpired { .. } => "GRACE_WINDOW_EXPIRED",
            RefundError::ContentAlreadyDelivered(_) => "CONTENT_ALREADY_DELIVERED",
            RefundError::RefundQuotaExceeded { .. } => "REFUND_QUOTA_EXCEEDED",
            RefundError::Unauthorized(_) => "UNAUTHORIZED",
            RefundError::NothingToRefund(_) => "NOTHING_TO_REFUND",
            RefundError::EarnerFundsUnavailable { .. } => "EARNER_FUNDS_UNAVAILABLE",
            RefundError::Store(_) => "STORE_ERROR",
        }
    }
}

/// Error from the payout safety gate.
#[derive(Debug, Error)]
pub enum PayoutError {
    #[error("amount {0} must be positive")]
    InvalidAmount(Amount),

    #[error("insufficient balance in {vault}: available {available}, requested {requested}")]
    InsufficientBalance {
        vault: VaultId,
        available: Amount,
        requested: Amount,
    },

    #[error("payout {request} blocked by {reason} check")]
    Blocked {
        request: PayoutRequestId,
        reason: PayoutBlockReason,
    },

    #[error("payout request {0} not found")]
    NotFound(PayoutRequestId),

    #[error("payout request {request} is {status}")]
    InvalidState {
        request: PayoutRequestId,
        status: PayoutStatus,
    },

    #[error("{0} may not decide payouts")]
    Unauthorized(Actor),

    #[error("payout approvals halted: {0}")]
    Halted(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error during a hot/cold transfer.
#[derive(Debug, Error)]
pub enum RebalanceError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<BalanceError> for RebalanceError {
    fn from(err: BalanceError) -> Self {
        RebalanceError::Store(err.into())
    }
}
