//! Reconciliation and audit.
//!
//! Folds the ledger from genesis, re-derives every vault, and compares the
//! result with live vault rows read in the same snapshot. Reads only: any
//! violation is reported to the [`AlertSink`] and puts the payout gate on
//! hold, nothing is corrected.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::Amount;
use crate::engine::Engine;
use crate::model::{EntryKind, LedgerEntry, VaultId};
use crate::payout::PayoutGate;
use crate::store::{AuditSnapshot, StoreError, fold_since};

/// Which side of the books a vault sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerSide {
    /// User wallets, creator vaults, platform revenue.
    Liability,
    /// Hot and cold pools.
    Reserve,
}

impl LedgerSide {
    fn of(vault: &VaultId) -> Self {
        match vault.describe() {
            Some((kind, _)) if kind.is_reserve() => LedgerSide::Reserve,
            _ => LedgerSide::Liability,
        }
    }
}

/// A broken ledger invariant. Never returned to end users.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum IntegrityViolation {
    #[error("vault {vault}: ledger total {expected}, live total {actual}")]
    BalanceMismatch {
        vault: VaultId,
        expected: Amount,
        actual: Amount,
    },

    #[error("vault {vault}: ledger lifetime in/out {expected_in}/{expected_out}, live {actual_in}/{actual_out}")]
    LifetimeMismatch {
        vault: VaultId,
        expected_in: Amount,
        expected_out: Amount,
        actual_in: Amount,
        actual_out: Amount,
    },

    #[error("vault {vault}: locked {locked}, outstanding payout reservations {reserved}")]
    LockedMismatch {
        vault: VaultId,
        locked: Amount,
        reserved: Amount,
    },

    #[error("vault {vault} is negative: available {available}, locked {locked}")]
    NegativeBalance {
        vault: VaultId,
        available: Amount,
        locked: Amount,
    },

    #[error("{side:?} side holds {actual}, purchases minus payouts is {expected}")]
    ConservationBroken {
        side: LedgerSide,
        expected: Amount,
        actual: Amount,
    },
}

/// Receives integrity violations. Implementations escalate to humans.
pub trait AlertSink: Send + Sync {
    fn raise(&self, violation: &IntegrityViolation);
}

/// Default sink: one `error!` event per violation.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn raise(&self, violation: &IntegrityViolation) {
        error!(violation = %violation, "integrity violation");
    }
}

/// Totals re-derived from the ledger for one vault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VaultTotals {
    pub total: Amount,
    pub lifetime_in: Amount,
    pub lifetime_out: Amount,
    pub entries: u64,
}

impl VaultTotals {
    fn apply(&mut self, amount: Amount) {
        self.total += amount;
        if amount.is_negative() {
            self.lifetime_out += amount.abs();
        } else {
            self.lifetime_in += amount;
        }
        self.entries += 1;
    }
}

/// Per-side flow of value into and out of the system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SideFlow {
    pub purchases: Amount,
    pub payouts: Amount,
}

impl SideFlow {
    fn expected(&self) -> Amount {
        self.purchases - self.payouts
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub generated_at: DateTime<Utc>,
    pub as_of: Option<DateTime<Utc>>,
    /// Last ledger sequence covered by the snapshot.
    pub head_sequence: u64,
    pub entry_count: u64,
    pub entries_by_kind: BTreeMap<EntryKind, u64>,
    pub first_entry_at: Option<DateTime<Utc>>,
    pub last_entry_at: Option<DateTime<Utc>>,
    pub vaults: BTreeMap<VaultId, VaultTotals>,
    pub flows: BTreeMap<LedgerSide, SideFlow>,
    /// Whether live vault rows were compared; false when `as_of` cut the fold short.
    pub live_compared: bool,
    pub violations: Vec<IntegrityViolation>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

pub struct Reconciler {
    engine: Arc<Engine>,
    gate: Arc<PayoutGate>,
    alerts: Arc<dyn AlertSink>,
    batch: usize,
}

impl Reconciler {
    pub fn new(
        engine: Arc<Engine>,
        gate: Arc<PayoutGate>,
        alerts: Arc<dyn AlertSink>,
        batch: usize,
    ) -> Self {
        Self {
            engine,
            gate,
            alerts,
            batch,
        }
    }

    /// Fold the ledger up to the snapshot head (and `as_of`, if given) and
    /// check it against live state.
    pub fn run(&self, as_of: Option<DateTime<Utc>>) -> Result<ReconciliationReport, StoreError> {
        let store = self.engine.store();
        let snapshot = store.audit_snapshot()?;

        let mut report = ReconciliationReport {
            generated_at: self.engine.clock().now(),
            as_of,
            head_sequence: snapshot.head,
            entry_count: 0,
            entries_by_kind: BTreeMap::new(),
            first_entry_at: None,
            last_entry_at: None,
            vaults: BTreeMap::new(),
            flows: BTreeMap::new(),
            live_compared: false,
            violations: Vec::new(),
        };

        let mut skipped = false;
        for entry in fold_since(store.as_ref(), 0, self.batch).up_to(snapshot.head) {
            let entry = entry?;
            if as_of.is_some_and(|cutoff| entry.timestamp > cutoff) {
                skipped = true;
                continue;
            }
            report.record(&entry);
        }

        if skipped {
            report.check_derived_conservation();
        } else {
            report.live_compared = true;
            report.check_live(&snapshot);
        }
        for vault in &snapshot.vaults {
            if vault.available.is_negative() || vault.locked.is_negative() {
                report.violations.push(IntegrityViolation::NegativeBalance {
                    vault: vault.id.clone(),
                    available: vault.available,
                    locked: vault.locked,
                });
            }
        }

        self.escalate(&report);
        Ok(report)
    }

    /// Run [`run`](Self::run) every `period` until `shutdown` flips to `true`
    /// or its sender is dropped.
    pub fn spawn(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let this = self.clone();
                        match tokio::task::spawn_blocking(move || this.run(None)).await {
                            Ok(Ok(report)) => debug!(
                                head = report.head_sequence,
                                violations = report.violations.len(),
                                "reconciliation pass finished"
                            ),
                            Ok(Err(e)) => warn!(reason = %e, "reconciliation pass failed"),
                            Err(e) => warn!(reason = %e, "reconciliation task panicked"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("reconciler shutting down");
                            return;
                        }
                    }
                }
            }
        })
    }

    fn escalate(&self, report: &ReconciliationReport) {
        if report.is_clean() {
            info!(
                head = report.head_sequence,
                entries = report.entry_count,
                "reconciliation clean"
            );
            return;
        }
        for violation in &report.violations {
            self.alerts.raise(violation);
        }
        self.gate.set_integrity_hold(format!(
            "{} integrity violation(s) at ledger head {}",
            report.violations.len(),
            report.head_sequence
        ));
    }
}

impl ReconciliationReport {
    fn record(&mut self, entry: &LedgerEntry) {
        self.entry_count += 1;
        *self.entries_by_kind.entry(entry.kind).or_default() += 1;
        self.first_entry_at = Some(match self.first_entry_at {
            Some(first) => first.min(entry.timestamp),
            None => entry.timestamp,
        });
        self.last_entry_at = Some(match self.last_entry_at {
            Some(last) => last.max(entry.timestamp),
            None => entry.timestamp,
        });
        self.vaults
            .entry(entry.vault.clone())
            .or_default()
            .apply(entry.amount);

        let flow = self.flows.entry(LedgerSide::of(&entry.vault)).or_default();
        match entry.kind {
            EntryKind::Purchase => flow.purchases += entry.amount,
            EntryKind::Payout => flow.payouts += entry.amount.abs(),
            _ => {}
        }
    }

    /// Every transaction other than purchases and payouts must net to zero
    /// within its side.
    fn check_derived_conservation(&mut self) {
        let mut held: BTreeMap<LedgerSide, Amount> = BTreeMap::new();
        for (vault, totals) in &self.vaults {
            *held.entry(LedgerSide::of(vault)).or_default() += totals.total;
        }
        self.check_conservation(&held);
    }

    fn check_live(&mut self, snapshot: &AuditSnapshot) {
        let mut held: BTreeMap<LedgerSide, Amount> = BTreeMap::new();
        let mut seen = Vec::with_capacity(snapshot.vaults.len());

        for vault in &snapshot.vaults {
            seen.push(vault.id.clone());
            *held.entry(LedgerSide::of(&vault.id)).or_default() += vault.total();

            let derived = self.vaults.get(&vault.id).copied().unwrap_or_default();
            if derived.total != vault.total() {
                self.violations.push(IntegrityViolation::BalanceMismatch {
                    vault: vault.id.clone(),
                    expected: derived.total,
                    actual: vault.total(),
                });
            }
            if derived.lifetime_in != vault.lifetime_in || derived.lifetime_out != vault.lifetime_out {
                self.violations.push(IntegrityViolation::LifetimeMismatch {
                    vault: vault.id.clone(),
                    expected_in: derived.lifetime_in,
                    expected_out: derived.lifetime_out,
                    actual_in: vault.lifetime_in,
                    actual_out: vault.lifetime_out,
                });
            }
            let reserved = snapshot.reserved.get(&vault.id).copied().unwrap_or_default();
            if vault.locked != reserved {
                self.violations.push(IntegrityViolation::LockedMismatch {
                    vault: vault.id.clone(),
                    locked: vault.locked,
                    reserved,
                });
            }
        }

        // entries for vaults that have no live row at all
        for (vault, derived) in &self.vaults {
            if !seen.contains(vault) && derived.total != Amount::ZERO {
                self.violations.push(IntegrityViolation::BalanceMismatch {
                    vault: vault.clone(),
                    expected: derived.total,
                    actual: Amount::ZERO,
                });
            }
        }

        self.check_conservation(&held);
    }

    fn check_conservation(&mut self, held: &BTreeMap<LedgerSide, Amount>) {
        for side in [LedgerSide::Liability, LedgerSide::Reserve] {
            let expected = self.flows.get(&side).copied().unwrap_or_default().expected();
            let actual = held.get(&side).copied().unwrap_or_default();
            if expected != actual {
                self.violations.push(IntegrityViolation::ConservationBroken {
                    side,
                    expected,
                    actual,
                });
            }
        }
    }
}
