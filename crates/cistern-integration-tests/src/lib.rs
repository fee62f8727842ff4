//! Fixtures for the Cistern scenario tests.
//!
//! Everything runs with a short tick so tests can use tokio's paused clock
//! and still read like the real network.

use std::sync::Arc;
use std::time::Duration;

use cistern_laundry::{SupplyRoutes, UnitConfig, UnitRegistry, WashingUnit};
use cistern_supply::{ProducerConfig, ProducerNode, RefillPolicy, ResourcePool, Wellspring};
use cistern_transfer::{Quantity, ResourceKind, StreamConfig, SupplySource};

/// One tick of every fixture stream.
pub const TICK: Duration = Duration::from_millis(100);

/// Stream pacing used by the fixtures.
pub fn stream() -> StreamConfig {
    StreamConfig::default().with_tick(TICK)
}

/// An unlimited source of `kind`.
pub fn wellspring(name: &str, kind: ResourceKind) -> Arc<dyn SupplySource> {
    Arc::new(Wellspring::new(name, kind, stream()))
}

/// A producer whose monitor checks four times per tick.
pub fn producer(
    name: &str,
    pool: ResourcePool,
    top_up: Quantity,
    upstream: Option<Arc<dyn SupplySource>>,
) -> Arc<ProducerNode> {
    let config = ProducerConfig::named(name)
        .with_stream(stream())
        .with_refill(RefillPolicy::default().with_period(TICK / 4).with_top_up(top_up));
    match ProducerNode::new(config, pool, upstream) {
        Ok(producer) => Arc::new(producer),
        Err(e) => panic!("invalid producer fixture {}: {}", name, e),
    }
}

/// A producer holding `level` of `kind` with no upstream.
pub fn stock(name: &str, kind: ResourceKind, level: Quantity) -> Arc<ProducerNode> {
    let capacity = level.max(1);
    match ResourcePool::new(kind, capacity, 0, level) {
        Ok(pool) => producer(name, pool, 0, None),
        Err(e) => panic!("invalid pool fixture {}: {}", name, e),
    }
}

/// Route both kinds to the given producers.
pub fn routes(water: Arc<dyn SupplySource>, energy: Arc<dyn SupplySource>) -> SupplyRoutes {
    let mut routes = SupplyRoutes::new();
    routes.insert(ResourceKind::Water, water);
    routes.insert(ResourceKind::Energy, energy);
    routes
}

/// Unit config with a three-tick cycle and no background replenishment.
pub fn unit_config() -> UnitConfig {
    UnitConfig::default().with_cycle(TICK * 3).with_replenish(false)
}

/// `count` units named washer1.. sharing `routes`.
pub fn registry(count: usize, routes: &SupplyRoutes) -> Arc<UnitRegistry> {
    let units = (1..=count)
        .map(|i| WashingUnit::new(format!("washer{}", i), unit_config(), routes.clone()))
        .collect();
    match UnitRegistry::new(units) {
        Ok(registry) => Arc::new(registry),
        Err(e) => panic!("invalid registry fixture: {}", e),
    }
}
