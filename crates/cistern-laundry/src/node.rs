//! Laundry node - the main application entry point.
//!
//! Architecture:
//! - Water mains (unlimited) feed the water utility pool, which feeds the tank
//! - Both pools keep themselves topped up with a refill monitor
//! - Washing units draw water from the tank and energy from the energy utility
//! - A job queue dispatches washing jobs to idle units
//! - HTTP API for clients (jobs, supply streams, tank, status)

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use cistern_supply::{ProducerConfig, ProducerNode, RefillMonitor, RefillPolicy, ResourcePool, Wellspring};
use cistern_transfer::{Quantity, ResourceKind, StreamConfig, SupplySource};

use crate::api;
use crate::error::{Error, Result};
use crate::queue::{Dispatcher, JobQueue, QueueConfig};
use crate::registry::UnitRegistry;
use crate::unit::{SupplyRoutes, UnitConfig, WashingUnit};

/// Configuration for a laundry node.
#[derive(Debug, Clone)]
pub struct LaundryConfig {
    /// HTTP API listen address
    pub api_addr: SocketAddr,

    /// One streaming tick; also the refill monitor period
    pub tick: Duration,

    /// Washing cycle duration
    pub cycle: Duration,

    /// Number of washing units
    pub units: usize,

    pub tank_capacity: Quantity,
    pub tank_threshold: Quantity,
    pub tank_top_up: Quantity,

    pub utility_capacity: Quantity,
    pub utility_threshold: Quantity,
    pub utility_top_up: Quantity,

    /// Job queue bound
    pub max_pending: usize,
}

impl Default for LaundryConfig {
    fn default() -> Self {
        Self {
            api_addr: SocketAddr::from(([0, 0, 0, 0], 4007)),
            tick: Duration::from_secs(1),
            cycle: Duration::from_secs(3),
            units: 3,
            tank_capacity: 1500,
            tank_threshold: 1490,
            tank_top_up: 30,
            utility_capacity: 5000,
            utility_threshold: 2500,
            utility_top_up: 500,
            max_pending: 256,
        }
    }
}

/// Read `key`, falling back to `default` when unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

impl LaundryConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_addr: env_or("CISTERN_API_ADDR", defaults.api_addr),
            tick: Duration::from_millis(env_or("CISTERN_TICK_MS", defaults.tick.as_millis() as u64)),
            cycle: Duration::from_millis(env_or("CISTERN_CYCLE_MS", defaults.cycle.as_millis() as u64)),
            units: env_or("CISTERN_UNITS", defaults.units),
            tank_capacity: env_or("CISTERN_TANK_CAPACITY", defaults.tank_capacity),
            tank_threshold: env_or("CISTERN_TANK_THRESHOLD", defaults.tank_threshold),
            tank_top_up: env_or("CISTERN_TANK_TOP_UP", defaults.tank_top_up),
            utility_capacity: env_or("CISTERN_UTILITY_CAPACITY", defaults.utility_capacity),
            utility_threshold: env_or("CISTERN_UTILITY_THRESHOLD", defaults.utility_threshold),
            utility_top_up: env_or("CISTERN_UTILITY_TOP_UP", defaults.utility_top_up),
            max_pending: env_or("CISTERN_MAX_PENDING", defaults.max_pending),
        }
    }

    fn stream(&self) -> StreamConfig {
        StreamConfig::default().with_tick(self.tick)
    }

    fn refill(&self, top_up: Quantity) -> RefillPolicy {
        RefillPolicy::default().with_period(self.tick).with_top_up(top_up)
    }
}

/// Shared state for the laundry node, used by the API handlers.
pub struct LaundryState {
    pub config: LaundryConfig,
    pub utility: Arc<ProducerNode>,
    pub tank: Arc<ProducerNode>,
    pub energy: Arc<Wellspring>,
    pub queue: Arc<JobQueue>,
}

impl LaundryState {
    /// Producer that serves `kind` to washing units.
    pub fn source(&self, kind: ResourceKind) -> Arc<dyn SupplySource> {
        match kind {
            ResourceKind::Water => Arc::clone(&self.tank) as Arc<dyn SupplySource>,
            ResourceKind::Energy => Arc::clone(&self.energy) as Arc<dyn SupplySource>,
        }
    }

    pub fn registry(&self) -> &Arc<UnitRegistry> {
        self.queue.registry()
    }
}

/// A laundry node instance.
pub struct LaundryNode {
    state: Arc<LaundryState>,
    config: LaundryConfig,
    monitors: Vec<RefillMonitor>,
    dispatcher: Dispatcher,
}

impl LaundryNode {
    /// Wire the network and start its background tasks.
    pub async fn new(config: LaundryConfig) -> Result<Self> {
        if config.units == 0 {
            return Err(Error::Config("at least one washing unit is required".into()));
        }
        if config.tick.is_zero() || config.cycle.is_zero() {
            return Err(Error::Config("tick and cycle must be non-zero".into()));
        }
        let stream = config.stream();

        let mains: Arc<dyn SupplySource> = Arc::new(Wellspring::new("water-mains", ResourceKind::Water, stream));
        let utility = Arc::new(ProducerNode::new(
            ProducerConfig::named("water-utility")
                .with_stream(stream)
                .with_refill(config.refill(config.utility_top_up)),
            ResourcePool::full(ResourceKind::Water, config.utility_capacity, config.utility_threshold)?,
            Some(mains),
        )?);

        let tank = Arc::new(ProducerNode::new(
            ProducerConfig::named("tank")
                .with_stream(stream)
                .with_refill(config.refill(config.tank_top_up)),
            ResourcePool::full(ResourceKind::Water, config.tank_capacity, config.tank_threshold)?,
            Some(Arc::clone(&utility) as Arc<dyn SupplySource>),
        )?);

        let energy = Arc::new(Wellspring::new("energy-utility", ResourceKind::Energy, stream));

        let mut routes = SupplyRoutes::new();
        routes.insert(ResourceKind::Water, Arc::clone(&tank) as Arc<dyn SupplySource>);
        routes.insert(ResourceKind::Energy, Arc::clone(&energy) as Arc<dyn SupplySource>);

        let units = (1..=config.units)
            .map(|i| {
                WashingUnit::new(
                    format!("washer{}", i),
                    UnitConfig::default().with_cycle(config.cycle),
                    routes.clone(),
                )
            })
            .collect();
        let registry = Arc::new(UnitRegistry::new(units)?);

        let queue = Arc::new(JobQueue::new(
            registry,
            QueueConfig::default()
                .with_max_pending(config.max_pending)
                .with_retry_interval(config.tick),
        ));

        let monitors = [&utility, &tank].iter().filter_map(|p| p.spawn_monitor()).collect();
        let dispatcher = queue.spawn_dispatcher();

        let state = Arc::new(LaundryState {
            config: config.clone(),
            utility,
            tank,
            energy,
            queue,
        });

        Ok(Self {
            state,
            config,
            monitors,
            dispatcher,
        })
    }

    /// Get the shared state (for API handlers).
    pub fn state(&self) -> Arc<LaundryState> {
        Arc::clone(&self.state)
    }

    /// Serve the HTTP API until Ctrl-C, then stop background tasks.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Laundry node starting");
        tracing::info!("  API: http://{}", self.config.api_addr);
        tracing::info!("  Units: {}", self.config.units);
        tracing::info!("  Tick: {:?}, cycle: {:?}", self.config.tick, self.config.cycle);

        let app = api::build_router(self.state());

        let listener = tokio::net::TcpListener::bind(self.config.api_addr).await?;
        tracing::info!("HTTP server listening on {}", self.config.api_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
            })
            .await?;

        self.shutdown().await;
        Ok(())
    }

    /// Stop the dispatcher and refill monitors.
    pub async fn shutdown(self) {
        tracing::info!("Laundry node shutting down");
        self.dispatcher.stop().await;
        for monitor in self.monitors {
            monitor.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Demand, JobStatus, LoadType};

    fn fast_config() -> LaundryConfig {
        LaundryConfig {
            tick: Duration::from_millis(10),
            cycle: Duration::from_millis(30),
            ..LaundryConfig::default()
        }
    }

    #[test]
    fn test_env_or_falls_back() {
        std::env::set_var("CISTERN_TEST_BAD_NUMBER", "lots");
        std::env::set_var("CISTERN_TEST_GOOD_NUMBER", " 42 ");
        assert_eq!(env_or("CISTERN_TEST_BAD_NUMBER", 7u32), 7);
        assert_eq!(env_or("CISTERN_TEST_GOOD_NUMBER", 7u32), 42);
        assert_eq!(env_or("CISTERN_TEST_UNSET_NUMBER", 7u32), 7);
    }

    #[test]
    fn test_defaults() {
        let config = LaundryConfig::default();
        assert_eq!(config.api_addr.port(), 4007);
        assert_eq!(config.tank_capacity, 1500);
        assert_eq!(config.tank_threshold, 1490);
        assert_eq!(config.units, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_runs_a_load() {
        let node = LaundryNode::new(fast_config()).await.unwrap();
        let state = node.state();

        let job = state.queue.submit(Demand::for_load(LoadType::Large), 1).unwrap();
        let done = state.queue.wait_for(job.id).await.unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(state.registry().units().len(), 3);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejects_zero_units() {
        let config = LaundryConfig {
            units: 0,
            ..fast_config()
        };
        assert!(matches!(LaundryNode::new(config).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_rejects_zero_tick_or_cycle() {
        for config in [
            LaundryConfig {
                tick: Duration::ZERO,
                ..fast_config()
            },
            LaundryConfig {
                cycle: Duration::ZERO,
                ..fast_config()
            },
        ] {
            assert!(matches!(LaundryNode::new(config).await, Err(Error::Config(_))));
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_pool_config() {
        let config = LaundryConfig {
            tank_threshold: 2000,
            ..fast_config()
        };
        assert!(matches!(LaundryNode::new(config).await, Err(Error::Supply(_))));
    }
}
