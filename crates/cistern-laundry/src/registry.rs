//! Ordered set of washing units.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::models::Demand;
use crate::unit::{UnitClaim, UnitSnapshot, WashingUnit};

/// All washing units of a node, in a fixed order.
///
/// Claims scan in that order, so the first idle unit always wins. Every claim
/// released wakes one waiter on [`UnitRegistry::released`].
pub struct UnitRegistry {
    units: Vec<Arc<WashingUnit>>,
    released: Arc<Notify>,
}

impl UnitRegistry {
    /// Build a registry. Unit names must be unique.
    pub fn new(units: Vec<WashingUnit>) -> Result<Self> {
        let mut seen = HashSet::new();
        for unit in &units {
            if !seen.insert(unit.name().to_string()) {
                return Err(Error::Config(format!("duplicate unit name {}", unit.name())));
            }
        }
        Ok(Self {
            units: units.into_iter().map(Arc::new).collect(),
            released: Arc::new(Notify::new()),
        })
    }

    /// Claim the first idle unit.
    pub fn claim_idle(&self) -> Option<UnitClaim> {
        self.units.iter().find_map(|unit| unit.claim(&self.released))
    }

    /// Claim the first idle unit other than `exclude`.
    pub fn claim_idle_peer(&self, exclude: &str) -> Option<UnitClaim> {
        self.units
            .iter()
            .filter(|unit| unit.name() != exclude)
            .find_map(|unit| unit.claim(&self.released))
    }

    /// Look a unit up by name.
    pub fn get(&self, name: &str) -> Option<&Arc<WashingUnit>> {
        self.units.iter().find(|unit| unit.name() == name)
    }

    /// All units, in claim order.
    pub fn units(&self) -> &[Arc<WashingUnit>] {
        &self.units
    }

    /// Number of units currently idle.
    pub fn idle_count(&self) -> usize {
        self.units.iter().filter(|unit| unit.is_idle()).count()
    }

    /// Refuse a demand that no unit could ever hold.
    pub fn check_demand(&self, demand: &Demand) -> Result<()> {
        let mut refusal = None;
        for unit in &self.units {
            match unit.check_demand(demand) {
                Ok(()) => return Ok(()),
                Err(e) => refusal = refusal.or(Some(e)),
            }
        }
        Err(refusal.unwrap_or_else(|| Error::InvalidRequest("no washing units".into())))
    }

    pub fn snapshot(&self) -> Vec<UnitSnapshot> {
        self.units.iter().map(|unit| unit.snapshot()).collect()
    }

    /// Wait until some claim is released.
    pub async fn released(&self) {
        self.released.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{SupplyRoutes, UnitConfig, UnitPhase};
    use std::time::Duration;

    fn units(names: &[&str]) -> Vec<WashingUnit> {
        names
            .iter()
            .map(|name| WashingUnit::new(*name, UnitConfig::default(), SupplyRoutes::new()))
            .collect()
    }

    #[test]
    fn test_claims_in_order() {
        let registry = UnitRegistry::new(units(&["washer1", "washer2", "washer3"])).unwrap();

        let first = registry.claim_idle().unwrap();
        let second = registry.claim_idle().unwrap();
        assert_eq!(first.unit().name(), "washer1");
        assert_eq!(second.unit().name(), "washer2");
        assert_eq!(registry.idle_count(), 1);

        drop(first);
        assert_eq!(registry.claim_idle().unwrap().unit().name(), "washer1");
    }

    #[test]
    fn test_claim_excludes_self() {
        let registry = UnitRegistry::new(units(&["washer1", "washer2"])).unwrap();
        let peer = registry.claim_idle_peer("washer1").unwrap();
        assert_eq!(peer.unit().name(), "washer2");
        assert!(registry.claim_idle_peer("washer1").is_none());
    }

    #[test]
    fn test_none_when_all_busy() {
        let registry = UnitRegistry::new(units(&["washer1"])).unwrap();
        let _claim = registry.claim_idle().unwrap();
        assert!(registry.claim_idle().is_none());
        assert_eq!(registry.snapshot()[0].phase, UnitPhase::Busy);
    }

    #[test]
    fn test_check_demand_needs_one_capable_unit() {
        use cistern_transfer::ResourceKind;

        let small = WashingUnit::new(
            "small",
            UnitConfig::default().with_max_reserve(ResourceKind::Water, 40),
            SupplyRoutes::new(),
        );
        let registry = UnitRegistry::new(vec![small, WashingUnit::new("big", UnitConfig::default(), SupplyRoutes::new())]).unwrap();

        let water = |q| Demand::new().with(ResourceKind::Water, q);
        assert!(registry.check_demand(&water(60)).is_ok());
        assert!(matches!(registry.check_demand(&water(81)), Err(Error::InvalidRequest(_))));
        assert!(matches!(registry.check_demand(&water(u32::MAX)), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        assert!(matches!(UnitRegistry::new(units(&["a", "a"])), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_release_wakes_waiter() {
        let registry = Arc::new(UnitRegistry::new(units(&["washer1"])).unwrap());
        let claim = registry.claim_idle().unwrap();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.released().await })
        };
        drop(claim);

        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(registry.idle_count(), 1);
    }
}
