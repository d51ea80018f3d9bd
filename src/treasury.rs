//! The ledger facade.
//!
//! Wires the transaction engine, refund engine, payout gate, rebalancer and
//! reconciler over one store and exposes the inbound operations. Also
//! supports an async stream of [`Command`]s.

use chrono::{DateTime, Utc};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tracing::info;

use crate::Amount;
use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::engine::{
    Engine, EngineError, PayoutError, PurchaseError, RebalanceError, RefundError, SpendError,
    PurchaseReceipt, SpendReceipt,
};
use crate::model::{
    Actor, Command, PayoutMethodId, PayoutRequestId, PayoutStatus, SpendKind, TransactionId,
    UserId, Vault, VaultBalance, VaultId,
};
use crate::payout::{PayoutGate, PayoutReceipt};
use crate::rebalance::{RebalanceOutcome, Rebalancer};
use crate::reconcile::{AlertSink, LogAlertSink, ReconciliationReport, Reconciler};
use crate::refund::{RefundEngine, RefundReceipt};
use crate::signals::{DeliveryStatus, PayoutSignals, StaticSignals};
use crate::store::{LedgerStore, StoreError};

/// External services the ledger consults.
#[derive(Clone)]
pub struct Collaborators {
    pub payout: Arc<dyn PayoutSignals>,
    pub delivery: Arc<dyn DeliveryStatus>,
    pub alerts: Arc<dyn AlertSink>,
}

impl Collaborators {
    /// Both signal traits answered by one [`StaticSignals`] table, alerts logged.
    pub fn from_static(signals: Arc<StaticSignals>) -> Self {
        Self {
            payout: signals.clone(),
            delivery: signals,
            alerts: Arc::new(LogAlertSink),
        }
    }
}

pub struct Treasury {
    config: LedgerConfig,
    engine: Arc<Engine>,
    refunds: RefundEngine,
    gate: Arc<PayoutGate>,
    rebalancer: Arc<Rebalancer>,
    reconciler: Arc<Reconciler>,
}

/// Public API
impl Treasury {
    pub fn new(
        config: LedgerConfig,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        collaborators: Collaborators,
    ) -> Self {
        let engine = Arc::new(Engine::new(store, clock, &config));
        let refunds = RefundEngine::new(engine.clone(), collaborators.delivery, &config.refund);
        let gate = Arc::new(PayoutGate::new(
            engine.clone(),
            collaborators.payout,
            &config.payout,
        ));
        let rebalancer = Arc::new(Rebalancer::new(engine.clone(), gate.clone(), &config.reserve));
        let reconciler = Arc::new(Reconciler::new(
            engine.clone(),
            gate.clone(),
            collaborators.alerts,
            config.store.fold_batch_size,
        ));
        Self {
            config,
            engine,
            refunds,
            gate,
            rebalancer,
            reconciler,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn allocate_spend(
        &self,
        payer: &UserId,
        earner: Option<&UserId>,
        gross: Amount,
        kind: SpendKind,
        key: &TransactionId,
    ) -> Result<SpendReceipt, SpendError> {
        self.engine.allocate_spend(payer, earner, gross, kind, key)
    }

    pub fn record_purchase(
        &self,
        user: &UserId,
        external_ref: &str,
        amount: Amount,
    ) -> Result<PurchaseReceipt, PurchaseError> {
        self.engine.record_purchase(user, external_ref, amount)
    }

    pub fn request_refund(
        &self,
        transaction: &TransactionId,
        reason: &str,
        requested_by: &Actor,
    ) -> Result<RefundReceipt, RefundError> {
        self.refunds.request_refund(transaction, reason, requested_by)
    }

    pub fn override_refund(
        &self,
        transaction: &TransactionId,
        reason: &str,
        admin: &Actor,
    ) -> Result<RefundReceipt, RefundError> {
        self.refunds.override_refund(transaction, reason, admin)
    }

    pub fn request_payout(
        &self,
        creator: &UserId,
        amount: Amount,
        method: &PayoutMethodId,
        key: &str,
    ) -> Result<PayoutReceipt, PayoutError> {
        self.gate.request_payout(creator, amount, method, key)
    }

    pub fn decide_payout(
        &self,
        request: &PayoutRequestId,
        approve: bool,
        decided_by: &Actor,
    ) -> Result<PayoutStatus, PayoutError> {
        self.gate.decide_payout(request, approve, decided_by)
    }

    /// Screen payouts left REQUESTED by an interrupted run. Returns how many
    /// were found.
    pub fn resume_stalled_payouts(&self) -> Result<usize, PayoutError> {
        self.gate.resume_stalled()
    }

    pub fn confirm_payout_released(&self, request: &PayoutRequestId) -> Result<PayoutStatus, PayoutError> {
        self.gate.confirm_payout_released(request)
    }

    pub fn clear_integrity_hold(&self, operator: &Actor) -> Result<(), PayoutError> {
        self.gate.clear_integrity_hold(operator)
    }

    pub fn integrity_hold(&self) -> Option<String> {
        self.gate.integrity_hold()
    }

    pub fn vault_balance(&self, vault: &VaultId) -> Result<VaultBalance, StoreError> {
        self.engine.vault_balance(vault)
    }

    /// All vault rows ordered by id.
    pub fn vaults(&self) -> Result<Vec<Vault>, StoreError> {
        self.engine.store().vaults()
    }

    pub fn run_reconciliation(
        &self,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<ReconciliationReport, StoreError> {
        self.reconciler.run(as_of)
    }

    pub fn rebalance(&self) -> Result<RebalanceOutcome, RebalanceError> {
        self.rebalancer.run_once()
    }

    /// Start the rebalancer and reconciler on their configured intervals.
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            self.rebalancer.clone().spawn(
                Duration::from_secs(self.config.reserve.interval_secs),
                shutdown.clone(),
            ),
            self.reconciler.clone().spawn(
                Duration::from_secs(self.config.reconcile.interval_secs),
                shutdown,
            ),
        ]
    }

    /// Run the ledger with the given command stream
    pub async fn run(&self, mut stream: impl Stream<Item = Command> + Unpin) {
        while let Some(command) = stream.next().await {
            // any error should not stop the ledger, so we just ignore the application result
            let _ = self.apply(command);
        }
    }

    /// Apply a single command
    pub fn apply(&self, command: Command) -> Result<(), EngineError> {
        match &command {
            Command::Purchase {
                user,
                reference,
                amount,
            } => {
                let result = self.record_purchase(user, reference, *amount);
                Self::log_result("purchase", user, reference, Some(*amount), &result);
                result?;
            }
            Command::Spend {
                payer,
                earner,
                amount,
                kind,
                key,
            } => {
                let result = self.allocate_spend(payer, earner.as_ref(), *amount, *kind, key);
                Self::log_result("spend", payer, key, Some(*amount), &result);
                result?;
            }
            Command::Refund {
                transaction,
                requested_by,
                reason,
                override_window,
            } => {
                let result = if *override_window {
                    self.override_refund(transaction, reason, requested_by)
                } else {
                    self.request_refund(transaction, reason, requested_by)
                };
                let refunded = result.as_ref().ok().map(|receipt| receipt.refunded_amount);
                Self::log_result("refund", requested_by, transaction, refunded, &result);
                result?;
            }
            Command::Payout {
                creator,
                amount,
                method,
                key,
            } => {
                let result = self.request_payout(creator, *amount, method, key);
                Self::log_result("payout", creator, key, Some(*amount), &result);
                result?;
            }
            Command::DecidePayout {
                request,
                approve,
                decided_by,
            } => {
                let result = self.decide_payout(request, *approve, decided_by);
                let op = if *approve { "approve" } else { "reject" };
                Self::log_result(op, decided_by, request, None, &result);
                result?;
            }
            Command::ConfirmReleased { request } => {
                let result = self.confirm_payout_released(request);
                Self::log_result("release", &Actor::System, request, None, &result);
                result?;
            }
        }
        Ok(())
    }
}

/// Private API
impl Treasury {
    /// Small helper to log `apply` results
    fn log_result<T, E: Display>(
        op: &str,
        actor: &dyn Display,
        reference: &dyn Display,
        amount: Option<Amount>,
        result: &Result<T, E>,
    ) {
        match (result, amount) {
            (Ok(_), Some(amt)) => {
                info!(
                    actor = %actor,
                    reference = %reference,
                    amount = %amt,
                    "{op} applied"
                );
            }
            (Ok(_), None) => {
                info!(
                    actor = %actor,
                    reference = %reference,
                    "{op} applied"
                );
            }
            (Err(e), Some(amt)) => {
                info!(
                    actor = %actor,
                    reference = %reference,
                    amount = %amt,
                    reason = %e,
                    "{op} skipped"
                );
            }
            (Err(e), None) => {
                info!(
                    actor = %actor,
                    reference = %reference,
                    reason = %e,
                    "{op} skipped"
                );
            }
        }
    }
}
