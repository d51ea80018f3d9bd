//! External collaborators the ledger consults but does not own.
//!
//! Identity verification, fraud scoring, region policy, and content delivery
//! all live outside this crate. The ledger only consumes their answers.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::model::{PayoutMethodId, TransactionId, UserId};

/// Signals consumed by the payout safety gate.
pub trait PayoutSignals: Send + Sync {
    fn is_kyc_verified(&self, user: &UserId) -> bool;

    /// Fraud risk in `[0, 1]`; higher is riskier.
    fn fraud_risk_score(&self, user: &UserId) -> f64;

    fn is_region_payout_allowed(&self, region: &str) -> bool;

    /// Region code of a registered payout destination, `None` if unknown.
    fn payout_method_region(&self, method: &PayoutMethodId) -> Option<String>;
}

/// Delivery status consumed by the refund engine.
pub trait DeliveryStatus: Send + Sync {
    fn is_content_delivered(&self, transaction: &TransactionId) -> bool;
}

/// In-process signal table. Backs the CLI and tests; production wires real
/// collaborators instead.
#[derive(Debug, Default)]
pub struct StaticSignals {
    inner: RwLock<SignalTable>,
}

#[derive(Debug, Default)]
struct SignalTable {
    kyc_verified: HashSet<UserId>,
    kyc_revoked: HashSet<UserId>,
    risk: HashMap<UserId, f64>,
    allowed_regions: HashSet<String>,
    method_regions: HashMap<PayoutMethodId, String>,
    delivered: HashSet<TransactionId>,
    default_region: Option<String>,
    trust_everyone: bool,
}

impl StaticSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every user verified, zero risk, every method in an allowed region.
    pub fn permissive() -> Self {
        let signals = Self::new();
        {
            let mut table = signals.inner.write();
            table.trust_everyone = true;
            table.default_region = Some("ZZ".to_string());
            table.allowed_regions.insert("ZZ".to_string());
        }
        signals
    }

    pub fn verify_kyc(&self, user: &UserId) {
        let mut table = self.inner.write();
        table.kyc_revoked.remove(user);
        table.kyc_verified.insert(user.clone());
    }

    pub fn revoke_kyc(&self, user: &UserId) {
        let mut table = self.inner.write();
        table.kyc_verified.remove(user);
        table.kyc_revoked.insert(user.clone());
    }

    pub fn set_risk(&self, user: &UserId, score: f64) {
        self.inner.write().risk.insert(user.clone(), score);
    }

    pub fn allow_region(&self, region: &str) {
        self.inner.write().allowed_regions.insert(region.to_string());
    }

    pub fn register_method(&self, method: &PayoutMethodId, region: &str) {
        self.inner
            .write()
            .method_regions
            .insert(method.clone(), region.to_string());
    }

    pub fn mark_delivered(&self, transaction: &TransactionId) {
        self.inner.write().delivered.insert(transaction.clone());
    }
}

impl PayoutSignals for StaticSignals {
    fn is_kyc_verified(&self, user: &UserId) -> bool {
        let table = self.inner.read();
        !table.kyc_revoked.contains(user)
            && (table.trust_everyone || table.kyc_verified.contains(user))
    }

    fn fraud_risk_score(&self, user: &UserId) -> f64 {
        self.inner.read().risk.get(user).copied().unwrap_or(0.0)
    }

    fn is_region_payout_allowed(&self, region: &str) -> bool {
        self.inner.read().allowed_regions.contains(region)
    }

    fn payout_method_region(&self, method: &PayoutMethodId) -> Option<String> {
        let table = self.inner.read();
        table
            .method_regions
            .get(method)
            .cloned()
            .or_else(|| table.default_region.clone())
    }
}

impl DeliveryStatus for StaticSignals {
    fn is_content_delivered(&self, transaction: &TransactionId) -> bool {
        self.inner.read().delivered.contains(transaction)
    }
}
