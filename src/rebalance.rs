//! Hot/cold rebalancer.
//!
//! Keeps the HOT operating pool inside `[hot_min, hot_max]` by moving funds
//! to and from the COLD reserve. When COLD cannot cover a deficit the payout
//! gate is told to stop approving until a later run closes the gap.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::Amount;
use crate::config::ReserveConfig;
use crate::engine::{Engine, RebalanceError};
use crate::model::{TransactionId, VaultId};
use crate::payout::PayoutGate;

/// What one rebalancing pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceOutcome {
    Balanced,
    MovedToCold(Amount),
    MovedToHot(Amount),
    /// COLD could only cover `moved` of the deficit; approvals are halted.
    Shortfall { moved: Amount, deficit: Amount },
}

pub struct Rebalancer {
    engine: Arc<Engine>,
    gate: Arc<PayoutGate>,
    hot_min: Amount,
    hot_max: Amount,
}

impl Rebalancer {
    pub fn new(engine: Arc<Engine>, gate: Arc<PayoutGate>, config: &ReserveConfig) -> Self {
        Self {
            engine,
            gate,
            hot_min: config.hot_min,
            hot_max: config.hot_max,
        }
    }

    /// One pass: read both pools, move at most one transfer, update the
    /// liquidity flag on the payout gate.
    pub fn run_once(&self) -> Result<RebalanceOutcome, RebalanceError> {
        let hot = self.engine.vault_balance(&VaultId::hot())?.available;
        let cold = self.engine.vault_balance(&VaultId::cold())?.available;

        if hot > self.hot_max {
            let excess = hot - self.hot_max;
            self.transfer(&VaultId::hot(), &VaultId::cold(), excess)?;
            self.gate.set_liquidity_shortfall(None);
            info!(amount = %excess, "moved excess from hot to cold");
            return Ok(RebalanceOutcome::MovedToCold(excess));
        }

        if hot < self.hot_min {
            let deficit = self.hot_min - hot;
            let moved = deficit.min(cold);
            if moved.is_positive() {
                self.transfer(&VaultId::cold(), &VaultId::hot(), moved)?;
            }
            if moved == deficit {
                self.gate.set_liquidity_shortfall(None);
                info!(amount = %moved, "topped up hot from cold");
                return Ok(RebalanceOutcome::MovedToHot(moved));
            }
            let remaining = deficit - moved;
            warn!(moved = %moved, deficit = %remaining, "cold reserve cannot cover hot deficit");
            self.gate.set_liquidity_shortfall(Some(remaining));
            return Ok(RebalanceOutcome::Shortfall {
                moved,
                deficit: remaining,
            });
        }

        self.gate.set_liquidity_shortfall(None);
        debug!(hot = %hot, cold = %cold, "reserve within bounds");
        Ok(RebalanceOutcome::Balanced)
    }

    /// Run [`run_once`](Self::run_once) every `period` until `shutdown` flips
    /// to `true` or its sender is dropped.
    pub fn spawn(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let this = self.clone();
                        match tokio::task::spawn_blocking(move || this.run_once()).await {
                            Ok(Ok(outcome)) => debug!(?outcome, "rebalance pass finished"),
                            Ok(Err(e)) => warn!(reason = %e, "rebalance pass failed"),
                            Err(e) => warn!(reason = %e, "rebalance task panicked"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("rebalancer shutting down");
                            return;
                        }
                    }
                }
            }
        })
    }

    fn transfer(&self, from: &VaultId, to: &VaultId, amount: Amount) -> Result<(), RebalanceError> {
        let key = TransactionId::new(format!("rebalance:{}", Uuid::now_v7()));
        self.engine.transfer_reserve(from, to, amount, &key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::LedgerConfig;
    use crate::model::UserId;
    use crate::signals::StaticSignals;
    use crate::store::MemoryStore;

    fn setup(hot_min: i64, hot_max: i64) -> (Arc<Engine>, Arc<PayoutGate>, Arc<Rebalancer>) {
        let mut config = LedgerConfig::default();
        config.reserve.hot_min = Amount::new(hot_min);
        config.reserve.hot_max = Amount::new(hot_max);
        let engine = Arc::new(Engine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            &config,
        ));
        let gate = Arc::new(PayoutGate::new(
            engine.clone(),
            Arc::new(StaticSignals::permissive()),
            &config.payout,
        ));
        let rebalancer = Arc::new(Rebalancer::new(engine.clone(), gate.clone(), &config.reserve));
        (engine, gate, rebalancer)
    }

    fn pools(engine: &Engine) -> (Amount, Amount) {
        (
            engine.vault_balance(&VaultId::hot()).unwrap().available,
            engine.vault_balance(&VaultId::cold()).unwrap().available,
        )
    }

    fn buy(engine: &Engine, reference: &str, amount: i64) {
        engine
            .record_purchase(&UserId::new("alice"), reference, Amount::new(amount))
            .unwrap();
    }

    #[test]
    fn excess_moves_to_cold() {
        let (engine, _, rebalancer) = setup(100, 500);
        buy(&engine, "pi_1", 800);
        assert_eq!(
            rebalancer.run_once().unwrap(),
            RebalanceOutcome::MovedToCold(Amount::new(300))
        );
        assert_eq!(pools(&engine), (Amount::new(500), Amount::new(300)));
        assert_eq!(rebalancer.run_once().unwrap(), RebalanceOutcome::Balanced);
    }

    #[test]
    fn deficit_is_covered_from_cold() {
        let (engine, _, rebalancer) = setup(100, 500);
        buy(&engine, "pi_1", 800);
        rebalancer.run_once().unwrap();
        engine
            .transfer_reserve(
                &VaultId::hot(),
                &VaultId::cold(),
                Amount::new(450),
                &TransactionId::new("drain"),
            )
            .unwrap();

        assert_eq!(
            rebalancer.run_once().unwrap(),
            RebalanceOutcome::MovedToHot(Amount::new(50))
        );
        assert_eq!(pools(&engine), (Amount::new(100), Amount::new(700)));
    }

    #[test]
    fn uncovered_deficit_fails_closed_then_recovers() {
        let (engine, gate, rebalancer) = setup(1_000, 5_000);
        buy(&engine, "pi_1", 400);

        assert_eq!(
            rebalancer.run_once().unwrap(),
            RebalanceOutcome::Shortfall {
                moved: Amount::ZERO,
                deficit: Amount::new(600),
            }
        );
        assert_eq!(gate.liquidity_shortfall(), Some(Amount::new(600)));

        buy(&engine, "pi_2", 700);
        assert_eq!(rebalancer.run_once().unwrap(), RebalanceOutcome::Balanced);
        assert_eq!(gate.liquidity_shortfall(), None);
    }

    #[test]
    fn rebalancing_keeps_reserve_total() {
        let (engine, _, rebalancer) = setup(100, 200);
        buy(&engine, "pi_1", 1_000);
        rebalancer.run_once().unwrap();
        let (hot, cold) = pools(&engine);
        assert_eq!(hot + cold, Amount::new(1_000));
    }

    #[tokio::test]
    async fn periodic_task_stops_on_shutdown() {
        let (engine, _, rebalancer) = setup(100, 500);
        buy(&engine, "pi_1", 900);
        let (stop, shutdown) = watch::channel(false);
        let handle = rebalancer.spawn(Duration::from_millis(10), shutdown);

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(pools(&engine), (Amount::new(500), Amount::new(400)));
    }
}
