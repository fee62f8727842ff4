//! Washing units - the consumers of the network.
//!
//! A unit keeps private reserves of each resource kind. To run a job it:
//!
//! 1. Debits the whole demand from its reserves if they cover it.
//! 2. Otherwise tops up every short kind from that kind's producer, all kinds
//!    concurrently, crediting blocks as they arrive (capped at the maximum).
//! 3. Retries the debit. Still short: the unit steps aside and hands the job
//!    to the first idle peer in registry order. The peer gets one attempt of
//!    its own and never delegates further.
//! 4. Runs a fixed-length washing cycle and goes idle.
//!
//! Debits are all-or-nothing under the unit's lock, so reserves never go
//! negative whatever the interleaving of jobs and top-ups.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cistern_transfer::{Delivery, Quantity, ResourceKind, SupplySource};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::models::Demand;
use crate::registry::UnitRegistry;

/// Producer to pull each resource kind from.
pub type SupplyRoutes = BTreeMap<ResourceKind, Arc<dyn SupplySource>>;

/// Default per-kind reserve ceiling.
pub const DEFAULT_MAX_RESERVE: Quantity = 80;

/// Configuration for a washing unit.
#[derive(Debug, Clone)]
pub struct UnitConfig {
    /// Reserve ceiling per kind; kinds not listed cannot be used
    pub max_reserve: BTreeMap<ResourceKind, Quantity>,
    /// Length of a washing cycle
    pub cycle: Duration,
    /// Top reserves back up in the background after each cycle
    pub replenish_after_cycle: bool,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            max_reserve: ResourceKind::ALL.iter().map(|k| (*k, DEFAULT_MAX_RESERVE)).collect(),
            cycle: Duration::from_secs(3),
            replenish_after_cycle: true,
        }
    }
}

impl UnitConfig {
    /// Set the ceiling for one kind.
    #[must_use]
    pub fn with_max_reserve(mut self, kind: ResourceKind, max: Quantity) -> Self {
        self.max_reserve.insert(kind, max);
        self
    }

    /// Set the cycle length.
    #[must_use]
    pub fn with_cycle(mut self, cycle: Duration) -> Self {
        self.cycle = cycle;
        self
    }

    /// Enable or disable post-cycle replenishment.
    #[must_use]
    pub fn with_replenish(mut self, enabled: bool) -> Self {
        self.replenish_after_cycle = enabled;
        self
    }
}

/// What a unit is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitPhase {
    Idle,
    Busy,
    /// Short after top-up, looking for a peer to take the job
    Delegating,
}

/// Point-in-time view of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitSnapshot {
    pub name: String,
    pub phase: UnitPhase,
    pub reserves: BTreeMap<ResourceKind, Quantity>,
}

/// Terminal outcome of a completed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    /// Unit that ran the washing cycle
    pub unit: String,
    /// Unit that handed the job over, if it was delegated
    pub delegated_from: Option<String>,
}

#[derive(Debug)]
struct UnitState {
    phase: UnitPhase,
    reserves: BTreeMap<ResourceKind, Quantity>,
}

/// A consumer with private reserves.
pub struct WashingUnit {
    name: String,
    config: UnitConfig,
    suppliers: SupplyRoutes,
    state: Mutex<UnitState>,
}

impl WashingUnit {
    /// Create an idle unit with full reserves.
    pub fn new(name: impl Into<String>, config: UnitConfig, suppliers: SupplyRoutes) -> Self {
        let reserves = config.max_reserve.clone();
        Self {
            name: name.into(),
            config,
            suppliers,
            state: Mutex::new(UnitState {
                phase: UnitPhase::Idle,
                reserves,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, UnitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unit name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current phase.
    pub fn phase(&self) -> UnitPhase {
        self.lock().phase
    }

    /// Whether the unit can take a job.
    pub fn is_idle(&self) -> bool {
        self.phase() == UnitPhase::Idle
    }

    /// Reserve currently held of `kind`.
    pub fn reserve(&self, kind: ResourceKind) -> Quantity {
        self.lock().reserves.get(&kind).copied().unwrap_or(0)
    }

    /// Point-in-time view.
    pub fn snapshot(&self) -> UnitSnapshot {
        let state = self.lock();
        UnitSnapshot {
            name: self.name.clone(),
            phase: state.phase,
            reserves: state.reserves.clone(),
        }
    }

    /// Claim the unit if idle. The claim returns it to idle when dropped.
    pub(crate) fn claim(self: &Arc<Self>, released: &Arc<Notify>) -> Option<UnitClaim> {
        let mut state = self.lock();
        if state.phase != UnitPhase::Idle {
            return None;
        }
        state.phase = UnitPhase::Busy;
        drop(state);
        Some(UnitClaim {
            unit: Arc::clone(self),
            released: Arc::clone(released),
        })
    }

    fn set_phase(&self, phase: UnitPhase) {
        self.lock().phase = phase;
    }

    /// Refuse demands this unit could never hold.
    pub fn check_demand(&self, demand: &Demand) -> Result<()> {
        demand.validate()?;
        for (kind, quantity) in demand.iter() {
            match self.config.max_reserve.get(&kind) {
                None => {
                    return Err(Error::InvalidRequest(format!("{} does not use {}", self.name, kind)));
                }
                Some(max) if quantity > *max => {
                    return Err(Error::InvalidRequest(format!(
                        "{} {} exceeds the {} reserve ceiling of {}",
                        quantity, kind, self.name, max
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Debit the whole demand, or nothing.
    fn try_debit(&self, demand: &Demand) -> bool {
        let mut state = self.lock();
        let covered = demand
            .iter()
            .all(|(kind, quantity)| state.reserves.get(&kind).copied().unwrap_or(0) >= quantity);
        if !covered {
            return false;
        }
        for (kind, quantity) in demand.iter() {
            if let Some(reserve) = state.reserves.get_mut(&kind) {
                *reserve -= quantity;
            }
        }
        true
    }

    /// Credit a received block, capped at the reserve ceiling.
    fn credit(&self, kind: ResourceKind, quantity: Quantity) {
        let max = self.config.max_reserve.get(&kind).copied().unwrap_or(0);
        let mut state = self.lock();
        let reserve = state.reserves.entry(kind).or_insert(0);
        *reserve = reserve.saturating_add(quantity).min(max);
    }

    /// Kinds (and amounts) the reserves fall short of `demand` by.
    fn shortfalls(&self, demand: &Demand) -> Vec<(ResourceKind, Quantity)> {
        let state = self.lock();
        demand
            .iter()
            .filter_map(|(kind, quantity)| {
                let held = state.reserves.get(&kind).copied().unwrap_or(0);
                (held < quantity).then(|| (kind, quantity - held))
            })
            .collect()
    }

    /// Pull `quantity` of `kind` from its producer into the reserves.
    async fn top_up(&self, kind: ResourceKind, quantity: Quantity) -> Option<Delivery> {
        let Some(source) = self.suppliers.get(&kind) else {
            tracing::warn!("{} has no {} supplier", self.name, kind);
            return None;
        };

        let stream = match source.request(quantity) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("{} could not get {} {} from {}: {}", self.name, quantity, kind, source.name(), e);
                return None;
            }
        };

        let delivery = stream
            .deliver_into(|block| {
                self.credit(block.kind, block.quantity);
                true
            })
            .await;

        if delivery.is_complete() {
            tracing::debug!("{} received {} {} (reserve {})", self.name, delivery.delivered, kind, self.reserve(kind));
        } else {
            tracing::info!(
                "{} received {}/{} {} before the stream ended {}",
                self.name,
                delivery.delivered,
                quantity,
                kind,
                delivery.end
            );
        }
        Some(delivery)
    }

    /// Secure the demand from reserves, topping up if needed.
    ///
    /// On failure returns the first kind still short and by how much.
    async fn secure(&self, demand: &Demand) -> std::result::Result<(), (ResourceKind, Quantity)> {
        if self.try_debit(demand) {
            return Ok(());
        }

        let short = self.shortfalls(demand);
        join_all(short.iter().map(|(kind, quantity)| self.top_up(*kind, *quantity))).await;

        if self.try_debit(demand) {
            return Ok(());
        }
        Err(self
            .shortfalls(demand)
            .into_iter()
            .next()
            .unwrap_or((ResourceKind::Water, 0)))
    }

    /// Top every kind back up to its ceiling.
    pub async fn replenish(&self) {
        let deficits: Vec<_> = {
            let state = self.lock();
            self.config
                .max_reserve
                .iter()
                .filter_map(|(kind, max)| {
                    let held = state.reserves.get(kind).copied().unwrap_or(0);
                    (held < *max).then(|| (*kind, max - held))
                })
                .collect()
        };
        join_all(deficits.iter().map(|(kind, quantity)| self.top_up(*kind, *quantity))).await;
    }
}

/// Exclusive hold on a unit. Dropping it returns the unit to idle.
pub struct UnitClaim {
    unit: Arc<WashingUnit>,
    released: Arc<Notify>,
}

impl UnitClaim {
    /// The claimed unit.
    pub fn unit(&self) -> &Arc<WashingUnit> {
        &self.unit
    }

    /// Run a job on the claimed unit, delegating once on a shortfall.
    ///
    /// `peers` is searched in order for an idle unit when this one cannot
    /// cover the demand even after topping up.
    pub async fn run(self, demand: &Demand, peers: &UnitRegistry) -> Result<JobOutcome> {
        let unit = Arc::clone(&self.unit);
        unit.check_demand(demand)?;

        let (kind, short_by) = match unit.secure(demand).await {
            Ok(()) => {
                self.wash().await;
                return Ok(JobOutcome {
                    unit: unit.name.clone(),
                    delegated_from: None,
                });
            }
            Err(short) => short,
        };

        unit.set_phase(UnitPhase::Delegating);
        tracing::info!("{} short {} {} after top-up, delegating", unit.name, short_by, kind);
        let peer = peers.claim_idle_peer(&unit.name);
        drop(self);

        let Some(peer) = peer else {
            tracing::warn!("{} found no idle peer", unit.name);
            return Err(Error::ResourceExhausted {
                unit: unit.name.clone(),
                kind,
                short_by,
            });
        };

        tracing::info!("{} handing job to {}", unit.name, peer.unit.name);
        peer.run_delegated(demand, unit.name.clone()).await
    }

    /// Run a job handed over by a peer. No further delegation.
    async fn run_delegated(self, demand: &Demand, from: String) -> Result<JobOutcome> {
        let unit = Arc::clone(&self.unit);
        unit.check_demand(demand)?;

        match unit.secure(demand).await {
            Ok(()) => {
                self.wash().await;
                Ok(JobOutcome {
                    unit: unit.name.clone(),
                    delegated_from: Some(from),
                })
            }
            Err((kind, short_by)) => {
                tracing::warn!("{} (delegated by {}) short {} {}", unit.name, from, short_by, kind);
                Err(Error::ResourceExhausted {
                    unit: unit.name.clone(),
                    kind,
                    short_by,
                })
            }
        }
    }

    /// Washing cycle, then release.
    async fn wash(self) {
        let unit = Arc::clone(&self.unit);
        tracing::info!("{} started washing cycle", unit.name);
        tokio::time::sleep(unit.config.cycle).await;
        tracing::info!("{} finished washing cycle", unit.name);
        drop(self);

        if unit.config.replenish_after_cycle {
            tokio::spawn(async move { unit.replenish().await });
        }
    }
}

impl Drop for UnitClaim {
    fn drop(&mut self) {
        self.unit.set_phase(UnitPhase::Idle);
        self.released.notify_one();
    }
}
