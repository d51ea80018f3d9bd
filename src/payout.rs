//! Payout safety gate.
//!
//! `REQUESTED -> LOCKED -> APPROVED -> RELEASED`, with `REJECTED` reachable
//! from the first two states. Funds are reserved before any external check
//! runs, so the checks never hold a lock on shared balance state and a
//! creator can never have more reserved than they actually hold.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::Amount;
use crate::config::PayoutConfig;
use crate::engine::{Engine, PayoutError};
use crate::model::{
    Actor, CheckOutcome, EntryId, EntryKind, LedgerEntry, PayoutBlockReason, PayoutMethodId,
    PayoutRequest, PayoutRequestId, PayoutStatus, SafetyChecks, TransactionId, UserId, VaultId,
};
use crate::signals::PayoutSignals;
use crate::store::{BalanceError, RecordKind, StoreError, atomic_update};

/// Result of [`PayoutGate::request_payout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutReceipt {
    pub request_id: PayoutRequestId,
    pub status: PayoutStatus,
    pub replayed: bool,
}

pub struct PayoutGate {
    engine: Arc<Engine>,
    signals: Arc<dyn PayoutSignals>,
    max_risk_score: f64,
    auto_approve_limit: Option<Amount>,
    /// Set by reconciliation; blocks approvals until an operator clears it.
    integrity_hold: RwLock<Option<String>>,
    /// Deficit the rebalancer could not cover from COLD.
    liquidity_shortfall: RwLock<Option<Amount>>,
}

impl PayoutGate {
    pub fn new(engine: Arc<Engine>, signals: Arc<dyn PayoutSignals>, config: &PayoutConfig) -> Self {
        Self {
            engine,
            signals,
            max_risk_score: config.max_risk_score,
            auto_approve_limit: config.auto_approve_limit,
            integrity_hold: RwLock::new(None),
            liquidity_shortfall: RwLock::new(None),
        }
    }

    pub fn payout(&self, id: &PayoutRequestId) -> Result<Option<PayoutRequest>, StoreError> {
        self.engine.store().payout(id)
    }

    /// Reserve `amount` on the creator vault and run the safety checks.
    ///
    /// Returns `InsufficientBalance` without creating a request if the
    /// reservation fails. A failed check rejects the request, releases the
    /// reservation and returns `Blocked`. Otherwise the request is LOCKED, or
    /// APPROVED straight away when it is under the auto-approval limit.
    pub fn request_payout(
        &self,
        creator: &UserId,
        amount: Amount,
        method: &PayoutMethodId,
        key: &str,
    ) -> Result<PayoutReceipt, PayoutError> {
        if !amount.is_positive() {
            return Err(PayoutError::InvalidAmount(amount));
        }
        let id = PayoutRequestId::derive(creator, key);
        if let Some(existing) = self.payout(&id)? {
            return self.resume(existing);
        }

        let request = match self.reserve(creator, amount, method, &id) {
            Ok(request) => request,
            Err(PayoutError::Store(StoreError::Duplicate {
                kind: RecordKind::Payout,
                ..
            })) => return self.resume(self.load(&id)?),
            Err(e) => return Err(e),
        };

        let status = self.screen(request)?;
        let status = self.auto_approve(&id, amount, status)?;
        Ok(PayoutReceipt {
            request_id: id,
            status,
            replayed: false,
        })
    }

    /// Finish screening every request still REQUESTED, e.g. after the process
    /// stopped between reserving funds and running the checks.
    pub fn resume_stalled(&self) -> Result<usize, PayoutError> {
        let stalled = self
            .engine
            .store()
            .payouts_by_status(PayoutStatus::Requested)?;
        let count = stalled.len();
        for request in stalled {
            let id = request.id.clone();
            match self.resume(request) {
                Ok(receipt) => info!(request = %id, status = %receipt.status, "stalled payout resumed"),
                Err(e) => warn!(request = %id, reason = %e, "stalled payout not resumed"),
            }
        }
        Ok(count)
    }

    /// Administrative decision on a pending request.
    ///
    /// Approval permanently removes the locked funds from the creator vault
    /// and the HOT reserve and appends PAYOUT entries. A request still
    /// REQUESTED is screened first. Rejection unlocks the reservation.
    /// Repeating a decision that already took effect returns the current
    /// status.
    pub fn decide_payout(
        &self,
        id: &PayoutRequestId,
        approve: bool,
        decided_by: &Actor,
    ) -> Result<PayoutStatus, PayoutError> {
        if matches!(decided_by, Actor::User(_)) {
            return Err(PayoutError::Unauthorized(decided_by.clone()));
        }
        let mut request = self.load(id)?;
        let target = if approve {
            PayoutStatus::Approved
        } else {
            PayoutStatus::Rejected
        };
        if request.status == target {
            return Ok(target);
        }
        match (request.status, approve) {
            (from @ (PayoutStatus::Requested | PayoutStatus::Locked), false) => {
                self.reject(&request, from, decided_by)?;
                return Ok(PayoutStatus::Rejected);
            }
            (PayoutStatus::Requested, true) => {
                self.screen(request)?;
                request = self.load(id)?;
            }
            (PayoutStatus::Locked, true) => {}
            (status, _) => {
                return Err(PayoutError::InvalidState {
                    request: id.clone(),
                    status,
                });
            }
        }

        if let Some(reason) = self.integrity_hold() {
            return Err(PayoutError::Halted(reason));
        }
        if let Some(deficit) = *self.liquidity_shortfall.read() {
            warn!(request = %id, deficit = %deficit, "approval blocked by liquidity shortfall");
            return Err(PayoutError::Blocked {
                request: id.clone(),
                reason: PayoutBlockReason::Balance,
            });
        }

        let now = self.engine.clock().now();
        let mut approved = request.clone();
        approved.status = PayoutStatus::Approved;
        approved.decided_by = Some(decided_by.clone());
        approved.decided_at = Some(now);

        let related = TransactionId::new(id.as_str());
        let amount = request.amount;
        let creator_vault = request.creator_vault.clone();
        self.transition(
            approved,
            PayoutStatus::Locked,
            &[creator_vault.clone(), VaultId::hot()],
            now,
            |changes, _| {
                changes
                    .post_locked(
                        LedgerEntry::new(
                            EntryId::new(format!("{id}:creator")),
                            now,
                            EntryKind::Payout,
                            creator_vault.clone(),
                            -amount,
                            related.clone(),
                        )
                        .with_meta("method", request.method.as_str()),
                    )
                    .map_err(StoreError::from)?;
                changes
                    .post(
                        LedgerEntry::new(
                            EntryId::new(format!("{id}:hot")),
                            now,
                            EntryKind::Payout,
                            VaultId::hot(),
                            -amount,
                            related.clone(),
                        )
                        .with_counterparty(creator_vault.clone()),
                    )
                    .map_err(|e| match e {
                        BalanceError::InsufficientAvailable { .. } => PayoutError::Blocked {
                            request: id.clone(),
                            reason: PayoutBlockReason::Balance,
                        },
                        other => StoreError::from(other).into(),
                    })
            },
        )?;
        info!(request = %id, amount = %amount, decided_by = %decided_by, "payout approved");
        Ok(PayoutStatus::Approved)
    }

    /// The external rail confirmed an APPROVED payout. Balances are not touched.
    pub fn confirm_payout_released(&self, id: &PayoutRequestId) -> Result<PayoutStatus, PayoutError> {
        let request = self.load(id)?;
        match request.status {
            PayoutStatus::Released => return Ok(PayoutStatus::Released),
            PayoutStatus::Approved => {}
            status => {
                return Err(PayoutError::InvalidState {
                    request: id.clone(),
                    status,
                });
            }
        }
        let mut released = request;
        released.status = PayoutStatus::Released;
        let now = self.engine.clock().now();
        self.transition(released, PayoutStatus::Approved, &[], now, |_, _| Ok(()))?;
        Ok(PayoutStatus::Released)
    }

    /// Block every approval until [`clear_integrity_hold`](Self::clear_integrity_hold).
    pub fn set_integrity_hold(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "payout approvals halted");
        *self.integrity_hold.write() = Some(reason);
    }

    pub fn clear_integrity_hold(&self, operator: &Actor) -> Result<(), PayoutError> {
        if !matches!(operator, Actor::Admin(_)) {
            return Err(PayoutError::Unauthorized(operator.clone()));
        }
        if self.integrity_hold.write().take().is_some() {
            info!(operator = %operator, "integrity hold cleared");
        }
        Ok(())
    }

    pub fn integrity_hold(&self) -> Option<String> {
        self.integrity_hold.read().clone()
    }

    pub(crate) fn set_liquidity_shortfall(&self, deficit: Option<Amount>) {
        *self.liquidity_shortfall.write() = deficit;
    }

    pub fn liquidity_shortfall(&self) -> Option<Amount> {
        *self.liquidity_shortfall.read()
    }
}

/// Private API
impl PayoutGate {
    fn load(&self, id: &PayoutRequestId) -> Result<PayoutRequest, PayoutError> {
        self.payout(id)?
            .ok_or_else(|| PayoutError::NotFound(id.clone()))
    }

    /// Move `amount` from available to locked and create the REQUESTED
    /// record in the same atomic update.
    fn reserve(
        &self,
        creator: &UserId,
        amount: Amount,
        method: &PayoutMethodId,
        id: &PayoutRequestId,
    ) -> Result<PayoutRequest, PayoutError> {
        let creator_vault = VaultId::creator(creator);
        let now = self.engine.clock().now();
        atomic_update(
            self.engine.store().as_ref(),
            &[creator_vault.clone()],
            now,
            self.engine.max_attempts(),
            |changes| {
                changes
                    .reserve(&creator_vault, amount)
                    .map_err(|e| match e {
                        BalanceError::InsufficientAvailable {
                            vault,
                            available,
                            requested,
                        } => PayoutError::InsufficientBalance {
                            vault,
                            available,
                            requested,
                        },
                        other => StoreError::from(other).into(),
                    })?;
                let request = PayoutRequest {
                    id: id.clone(),
                    creator: creator.clone(),
                    creator_vault: creator_vault.clone(),
                    method: method.clone(),
                    amount,
                    status: PayoutStatus::Requested,
                    checks: SafetyChecks {
                        balance: CheckOutcome::Passed,
                        ..SafetyChecks::default()
                    },
                    risk_score: None,
                    decided_by: None,
                    created_at: now,
                    decided_at: None,
                };
                changes.insert_payout(request.clone());
                Ok(request)
            },
        )
    }

    /// Replay of a stored request. One still REQUESTED never finished its
    /// checks, so they run now.
    fn resume(&self, existing: PayoutRequest) -> Result<PayoutReceipt, PayoutError> {
        let id = existing.id.clone();
        let status = match existing.status {
            PayoutStatus::Requested => {
                info!(request = %id, "resuming payout screening");
                let amount = existing.amount;
                let status = self.screen(existing)?;
                self.auto_approve(&id, amount, status)?
            }
            status => status,
        };
        Ok(PayoutReceipt {
            request_id: id,
            status,
            replayed: true,
        })
    }

    /// Run the safety checks on a REQUESTED request. It moves to LOCKED, or
    /// to REJECTED with its reservation released when a check fails.
    fn screen(&self, mut request: PayoutRequest) -> Result<PayoutStatus, PayoutError> {
        let (checks, risk_score) = self.run_checks(&request.creator, &request.method);
        request.checks = checks;
        request.risk_score = Some(risk_score);

        if let Some(reason) = checks.first_failure() {
            self.reject(&request, PayoutStatus::Requested, &Actor::System)?;
            return Err(PayoutError::Blocked {
                request: request.id,
                reason,
            });
        }

        let now = self.engine.clock().now();
        request.status = PayoutStatus::Locked;
        self.transition(request, PayoutStatus::Requested, &[], now, |_, _| Ok(()))?;
        Ok(PayoutStatus::Locked)
    }

    /// Approve a LOCKED request under the auto-approval limit. Blocked or
    /// halted approvals leave it LOCKED for manual review.
    fn auto_approve(
        &self,
        id: &PayoutRequestId,
        amount: Amount,
        status: PayoutStatus,
    ) -> Result<PayoutStatus, PayoutError> {
        let eligible = status == PayoutStatus::Locked
            && self.auto_approve_limit.is_some_and(|limit| amount <= limit);
        if !eligible {
            return Ok(status);
        }
        match self.decide_payout(id, true, &Actor::System) {
            Ok(decided) => Ok(decided),
            Err(e @ (PayoutError::Blocked { .. } | PayoutError::Halted(_))) => {
                warn!(request = %id, reason = %e, "auto-approval deferred to manual review");
                Ok(PayoutStatus::Locked)
            }
            Err(e) => Err(e),
        }
    }

    /// KYC, risk and region checks. Unknown payout regions fail closed.
    fn run_checks(&self, creator: &UserId, method: &PayoutMethodId) -> (SafetyChecks, f64) {
        let risk_score = self.signals.fraud_risk_score(creator);
        let region_allowed = self
            .signals
            .payout_method_region(method)
            .is_some_and(|region| self.signals.is_region_payout_allowed(&region));
        let checks = SafetyChecks {
            kyc: CheckOutcome::from_bool(self.signals.is_kyc_verified(creator)),
            risk: CheckOutcome::from_bool(risk_score < self.max_risk_score),
            region: CheckOutcome::from_bool(region_allowed),
            balance: CheckOutcome::Passed,
        };
        debug!(creator = %creator, ?checks, risk_score, "payout checks evaluated");
        (checks, risk_score)
    }

    /// Unlock the reservation and mark the request REJECTED.
    fn reject(
        &self,
        request: &PayoutRequest,
        expected: PayoutStatus,
        decided_by: &Actor,
    ) -> Result<(), PayoutError> {
        let now = self.engine.clock().now();
        let mut rejected = request.clone();
        rejected.status = PayoutStatus::Rejected;
        rejected.decided_by = Some(decided_by.clone());
        rejected.decided_at = Some(now);
        let vault = request.creator_vault.clone();
        let amount = request.amount;
        self.transition(
            rejected,
            expected,
            std::slice::from_ref(&vault),
            now,
            |changes, _| {
                changes
                    .release(&vault, amount)
                    .map_err(|e| PayoutError::from(StoreError::from(e)))
            },
        )?;
        info!(request = %request.id, amount = %amount, decided_by = %decided_by, "payout rejected");
        Ok(())
    }

    /// Stage `next` over the stored request, guarded on `expected`, together
    /// with the balance effects staged by `effects`.
    fn transition<F>(
        &self,
        next: PayoutRequest,
        expected: PayoutStatus,
        vaults: &[VaultId],
        now: DateTime<Utc>,
        mut effects: F,
    ) -> Result<(), PayoutError>
    where
        F: FnMut(&mut crate::store::Changeset, &PayoutRequest) -> Result<(), PayoutError>,
    {
        debug_assert!(expected.can_transition_to(next.status));
        atomic_update(
            self.engine.store().as_ref(),
            vaults,
            now,
            self.engine.max_attempts(),
            |changes| {
                let stored = self.load(&next.id)?;
                if stored.status != expected {
                    return Err(PayoutError::InvalidState {
                        request: next.id.clone(),
                        status: stored.status,
                    });
                }
                effects(changes, &stored)?;
                changes.update_payout(next.clone(), expected);
                Ok(())
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::LedgerConfig;
    use crate::model::SpendKind;
    use crate::signals::StaticSignals;
    use crate::store::MemoryStore;

    struct Fixture {
        signals: Arc<StaticSignals>,
        engine: Arc<Engine>,
        gate: PayoutGate,
    }

    /// No commission, so creator vaults receive the full gross.
    fn fixture_with(payout: PayoutConfig) -> Fixture {
        let mut config = LedgerConfig::default();
        config.split.platform_rate_bps = 0;
        config.payout = payout;
        let signals = Arc::new(StaticSignals::permissive());
        let engine = Arc::new(Engine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            &config,
        ));
        let gate = PayoutGate::new(engine.clone(), signals.clone(), &config.payout);
        Fixture {
            signals,
            engine,
            gate,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(PayoutConfig::default())
    }

    fn bob() -> UserId {
        UserId::new("bob")
    }

    fn method() -> PayoutMethodId {
        PayoutMethodId::new("bank-1")
    }

    fn fund_creator(f: &Fixture, amount: i64) {
        let fan = UserId::new("fan");
        f.engine
            .record_purchase(&fan, &format!("pi_{amount}"), Amount::new(amount))
            .unwrap();
        f.engine
            .allocate_spend(
                &fan,
                Some(&bob()),
                Amount::new(amount),
                SpendKind::Call,
                &TransactionId::new(format!("call-{amount}")),
            )
            .unwrap();
    }

    fn creator_balance(f: &Fixture) -> (Amount, Amount) {
        let balance = f.engine.vault_balance(&VaultId::creator(&bob())).unwrap();
        (balance.available, balance.locked)
    }

    #[test]
    fn request_above_balance_creates_nothing() {
        let f = fixture();
        fund_creator(&f, 5_000);
        let err = f
            .gate
            .request_payout(&bob(), Amount::new(6_000), &method(), "w1")
            .unwrap_err();
        assert!(matches!(err, PayoutError::InsufficientBalance { .. }));
        assert_eq!(creator_balance(&f), (Amount::new(5_000), Amount::ZERO));
        assert!(f.engine.store().payouts_by_creator(&bob()).unwrap().is_empty());
    }

    #[test]
    fn failed_kyc_rejects_and_unlocks() {
        let f = fixture();
        fund_creator(&f, 5_000);
        f.signals.revoke_kyc(&bob());
        let err = f
            .gate
            .request_payout(&bob(), Amount::new(5_000), &method(), "w1")
            .unwrap_err();
        let PayoutError::Blocked { request, reason } = err else {
            panic!("expected blocked payout");
        };
        assert_eq!(reason, PayoutBlockReason::Kyc);
        assert_eq!(creator_balance(&f), (Amount::new(5_000), Amount::ZERO));

        let stored = f.gate.payout(&request).unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Rejected);
        assert_eq!(stored.checks.kyc, CheckOutcome::Failed);
        assert_eq!(stored.checks.balance, CheckOutcome::Passed);
    }

    #[test]
    fn risk_and_region_block() {
        let f = fixture();
        fund_creator(&f, 1_000);
        f.signals.set_risk(&bob(), 0.9);
        assert!(matches!(
            f.gate.request_payout(&bob(), Amount::new(100), &method(), "w1"),
            Err(PayoutError::Blocked { reason: PayoutBlockReason::Risk, .. })
        ));

        f.signals.set_risk(&bob(), 0.1);
        let offshore = PayoutMethodId::new("offshore");
        f.signals.register_method(&offshore, "XX");
        assert!(matches!(
            f.gate.request_payout(&bob(), Amount::new(100), &offshore, "w2"),
            Err(PayoutError::Blocked { reason: PayoutBlockReason::Region, .. })
        ));
        assert_eq!(creator_balance(&f), (Amount::new(1_000), Amount::ZERO));
    }

    #[test]
    fn approve_removes_locked_funds_and_hot_reserve() {
        let f = fixture();
        fund_creator(&f, 1_000);
        let receipt = f
            .gate
            .request_payout(&bob(), Amount::new(400), &method(), "w1")
            .unwrap();
        assert_eq!(receipt.status, PayoutStatus::Locked);
        assert_eq!(creator_balance(&f), (Amount::new(600), Amount::new(400)));

        let admin = Actor::Admin("ops".into());
        let status = f.gate.decide_payout(&receipt.request_id, true, &admin).unwrap();
        assert_eq!(status, PayoutStatus::Approved);
        assert_eq!(creator_balance(&f), (Amount::new(600), Amount::ZERO));
        assert_eq!(
            f.engine.vault_balance(&VaultId::hot()).unwrap().available,
            Amount::new(600)
        );

        // repeated decision is a no-op
        assert_eq!(
            f.gate.decide_payout(&receipt.request_id, true, &admin).unwrap(),
            PayoutStatus::Approved
        );
        assert!(matches!(
            f.gate.decide_payout(&receipt.request_id, false, &admin),
            Err(PayoutError::InvalidState { status: PayoutStatus::Approved, .. })
        ));

        assert_eq!(
            f.gate.confirm_payout_released(&receipt.request_id).unwrap(),
            PayoutStatus::Released
        );
        assert_eq!(creator_balance(&f), (Amount::new(600), Amount::ZERO));
    }

    #[test]
    fn reject_unlocks_reservation() {
        let f = fixture();
        fund_creator(&f, 1_000);
        let receipt = f
            .gate
            .request_payout(&bob(), Amount::new(400), &method(), "w1")
            .unwrap();
        let status = f
            .gate
            .decide_payout(&receipt.request_id, false, &Actor::Admin("ops".into()))
            .unwrap();
        assert_eq!(status, PayoutStatus::Rejected);
        assert_eq!(creator_balance(&f), (Amount::new(1_000), Amount::ZERO));
        assert!(matches!(
            f.gate.confirm_payout_released(&receipt.request_id),
            Err(PayoutError::InvalidState { .. })
        ));
    }

    #[test]
    fn reservations_cannot_exceed_balance() {
        let f = fixture();
        fund_creator(&f, 1_000);
        f.gate
            .request_payout(&bob(), Amount::new(700), &method(), "w1")
            .unwrap();
        assert!(matches!(
            f.gate.request_payout(&bob(), Amount::new(700), &method(), "w2"),
            Err(PayoutError::InsufficientBalance { .. })
        ));
        assert_eq!(creator_balance(&f), (Amount::new(300), Amount::new(700)));
    }

    #[test]
    fn request_is_idempotent_on_key() {
        let f = fixture();
        fund_creator(&f, 1_000);
        let first = f
            .gate
            .request_payout(&bob(), Amount::new(300), &method(), "w1")
            .unwrap();
        let again = f
            .gate
            .request_payout(&bob(), Amount::new(300), &method(), "w1")
            .unwrap();
        assert!(again.replayed);
        assert_eq!(first.request_id, again.request_id);
        assert_eq!(creator_balance(&f), (Amount::new(700), Amount::new(300)));
    }

    fn stall(f: &Fixture, amount: i64, key: &str) -> PayoutRequestId {
        let id = PayoutRequestId::derive(&bob(), key);
        let request = f
            .gate
            .reserve(&bob(), Amount::new(amount), &method(), &id)
            .unwrap();
        assert_eq!(request.status, PayoutStatus::Requested);
        id
    }

    #[test]
    fn replay_finishes_a_stalled_request() {
        let f = fixture();
        fund_creator(&f, 1_000);
        let id = stall(&f, 500, "w1");
        assert_eq!(creator_balance(&f), (Amount::new(500), Amount::new(500)));

        let replay = f
            .gate
            .request_payout(&bob(), Amount::new(500), &method(), "w1")
            .unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.request_id, id);
        assert_eq!(replay.status, PayoutStatus::Locked);

        let admin = Actor::Admin("ops".into());
        assert_eq!(
            f.gate.decide_payout(&id, true, &admin).unwrap(),
            PayoutStatus::Approved
        );
        assert_eq!(creator_balance(&f), (Amount::new(500), Amount::ZERO));
    }

    #[test]
    fn stalled_request_can_be_rejected() {
        let f = fixture();
        fund_creator(&f, 1_000);
        let id = stall(&f, 500, "w1");
        assert_eq!(
            f.gate
                .decide_payout(&id, false, &Actor::Admin("ops".into()))
                .unwrap(),
            PayoutStatus::Rejected
        );
        assert_eq!(creator_balance(&f), (Amount::new(1_000), Amount::ZERO));
    }

    #[test]
    fn approving_a_stalled_request_runs_the_checks() {
        let f = fixture();
        fund_creator(&f, 1_000);
        let id = stall(&f, 500, "w1");
        f.signals.revoke_kyc(&bob());

        assert!(matches!(
            f.gate.decide_payout(&id, true, &Actor::Admin("ops".into())),
            Err(PayoutError::Blocked { reason: PayoutBlockReason::Kyc, .. })
        ));
        let stored = f.gate.payout(&id).unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Rejected);
        assert_eq!(creator_balance(&f), (Amount::new(1_000), Amount::ZERO));
    }

    #[test]
    fn resume_stalled_screens_every_requested() {
        let f = fixture_with(PayoutConfig {
            auto_approve_limit: Some(Amount::new(100)),
            ..PayoutConfig::default()
        });
        fund_creator(&f, 1_000);
        let small = stall(&f, 100, "w1");
        let large = stall(&f, 400, "w2");

        assert_eq!(f.gate.resume_stalled().unwrap(), 2);
        let store = f.engine.store();
        assert!(store.payouts_by_status(PayoutStatus::Requested).unwrap().is_empty());
        assert_eq!(f.gate.payout(&small).unwrap().unwrap().status, PayoutStatus::Approved);
        assert_eq!(f.gate.payout(&large).unwrap().unwrap().status, PayoutStatus::Locked);
        assert_eq!(creator_balance(&f), (Amount::new(500), Amount::new(400)));
        assert_eq!(f.gate.resume_stalled().unwrap(), 0);
    }

    #[test]
    fn users_cannot_decide() {
        let f = fixture();
        fund_creator(&f, 1_000);
        let receipt = f
            .gate
            .request_payout(&bob(), Amount::new(300), &method(), "w1")
            .unwrap();
        assert!(matches!(
            f.gate.decide_payout(&receipt.request_id, true, &Actor::User(bob())),
            Err(PayoutError::Unauthorized(_))
        ));
        assert!(matches!(
            f.gate.decide_payout(&PayoutRequestId::new("nope"), true, &Actor::System),
            Err(PayoutError::NotFound(_))
        ));
    }

    #[test]
    fn integrity_hold_blocks_approval_until_cleared() {
        let f = fixture();
        fund_creator(&f, 1_000);
        let receipt = f
            .gate
            .request_payout(&bob(), Amount::new(300), &method(), "w1")
            .unwrap();
        let admin = Actor::Admin("ops".into());

        f.gate.set_integrity_hold("drift on treasury:hot");
        assert!(matches!(
            f.gate.decide_payout(&receipt.request_id, true, &admin),
            Err(PayoutError::Halted(_))
        ));
        assert!(matches!(
            f.gate.clear_integrity_hold(&Actor::System),
            Err(PayoutError::Unauthorized(_))
        ));

        // rejection still works while halted
        let other = f
            .gate
            .request_payout(&bob(), Amount::new(100), &method(), "w2")
            .unwrap();
        assert_eq!(
            f.gate.decide_payout(&other.request_id, false, &admin).unwrap(),
            PayoutStatus::Rejected
        );

        f.gate.clear_integrity_hold(&admin).unwrap();
        assert_eq!(
            f.gate.decide_payout(&receipt.request_id, true, &admin).unwrap(),
            PayoutStatus::Approved
        );
    }

    #[test]
    fn approval_fails_closed_on_liquidity() {
        let f = fixture();
        fund_creator(&f, 1_000);
        let receipt = f
            .gate
            .request_payout(&bob(), Amount::new(300), &method(), "w1")
            .unwrap();
        let admin = Actor::Admin("ops".into());

        f.gate.set_liquidity_shortfall(Some(Amount::new(50)));
        assert!(matches!(
            f.gate.decide_payout(&receipt.request_id, true, &admin),
            Err(PayoutError::Blocked { reason: PayoutBlockReason::Balance, .. })
        ));
        f.gate.set_liquidity_shortfall(None);

        // drain HOT into COLD so it cannot cover the payout
        f.engine
            .transfer_reserve(
                &VaultId::hot(),
                &VaultId::cold(),
                Amount::new(900),
                &TransactionId::new("rb-1"),
            )
            .unwrap();
        assert!(matches!(
            f.gate.decide_payout(&receipt.request_id, true, &admin),
            Err(PayoutError::Blocked { reason: PayoutBlockReason::Balance, .. })
        ));
        let stored = f.gate.payout(&receipt.request_id).unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Locked);
        assert_eq!(creator_balance(&f), (Amount::new(700), Amount::new(300)));
    }

    #[test]
    fn small_requests_auto_approve() {
        let f = fixture_with(PayoutConfig {
            auto_approve_limit: Some(Amount::new(100)),
            ..PayoutConfig::default()
        });
        fund_creator(&f, 1_000);
        let small = f
            .gate
            .request_payout(&bob(), Amount::new(100), &method(), "w1")
            .unwrap();
        assert_eq!(small.status, PayoutStatus::Approved);
        let stored = f.gate.payout(&small.request_id).unwrap().unwrap();
        assert_eq!(stored.decided_by, Some(Actor::System));

        let large = f
            .gate
            .request_payout(&bob(), Amount::new(101), &method(), "w2")
            .unwrap();
        assert_eq!(large.status, PayoutStatus::Locked);
    }
}
