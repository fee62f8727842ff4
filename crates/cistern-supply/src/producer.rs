//! Producer node: a resource pool served over the streaming contract.
//!
//! Each request streams blocks drawn from the pool one tick at a time. If the
//! pool runs dry mid-stream the stream ends short; the producer may kick off a
//! refill from its own upstream, but never holds the caller's stream open
//! waiting for it. Callers wanting more issue a new request.

use std::sync::Arc;

use cistern_transfer::{
    BlockReserve, Quantity, ResourceKind, StreamConfig, SupplySource, SupplyStream, TickedStreamer, TransferError,
};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::pool::ResourcePool;
use crate::refill::{FillReport, RefillMonitor, RefillPolicy, Refiller};

/// Configuration for a producer node.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Name used in logs and status
    pub name: String,
    /// Outgoing stream pacing
    pub stream: StreamConfig,
    /// Refill behaviour towards the upstream
    pub refill: RefillPolicy,
    /// Trigger an out-of-band refill when a request finds the pool dry.
    pub refill_on_exhaustion: bool,
}

impl ProducerConfig {
    /// Default configuration under the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stream: StreamConfig::default(),
            refill: RefillPolicy::default(),
            refill_on_exhaustion: true,
        }
    }

    /// Set the outgoing stream pacing.
    #[must_use]
    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    /// Set the refill policy.
    #[must_use]
    pub fn with_refill(mut self, refill: RefillPolicy) -> Self {
        self.refill = refill;
        self
    }

    /// Enable or disable out-of-band refills on exhaustion.
    #[must_use]
    pub fn with_refill_on_exhaustion(mut self, enabled: bool) -> Self {
        self.refill_on_exhaustion = enabled;
        self
    }
}

/// Snapshot of a producer's pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub name: String,
    pub kind: ResourceKind,
    pub level: Quantity,
    pub capacity: Quantity,
    pub refill_threshold: Quantity,
    pub refilling: bool,
}

/// A pool-backed supply source with an optional upstream.
pub struct ProducerNode {
    config: ProducerConfig,
    pool: Arc<ResourcePool>,
    streamer: TickedStreamer,
    refiller: Option<Arc<Refiller>>,
}

impl ProducerNode {
    /// Create a producer owning `pool`. With an upstream, the pool can be
    /// refilled from it.
    pub fn new(config: ProducerConfig, pool: ResourcePool, upstream: Option<Arc<dyn SupplySource>>) -> Result<Self> {
        let pool = Arc::new(pool);
        if let Some(upstream) = &upstream {
            if upstream.kind() != pool.kind() {
                return Err(Error::InvalidConfig(format!(
                    "{} holds {} but upstream {} supplies {}",
                    config.name,
                    pool.kind(),
                    upstream.name(),
                    upstream.kind()
                )));
            }
        }
        let refiller = upstream.map(|upstream| Arc::new(Refiller::new(Arc::clone(&pool), upstream, config.refill.top_up)));

        Ok(Self {
            streamer: TickedStreamer::new(config.stream),
            config,
            pool,
            refiller,
        })
    }

    /// Start the periodic refill monitor. `None` without an upstream.
    pub fn spawn_monitor(&self) -> Option<RefillMonitor> {
        let refiller = self.refiller.as_ref()?;
        tracing::info!(
            "{} monitoring {} pool (threshold {}, top-up {})",
            self.config.name,
            self.pool.kind(),
            self.pool.refill_threshold(),
            self.config.refill.top_up
        );
        Some(RefillMonitor::spawn(Arc::clone(refiller), self.config.refill.period))
    }

    /// Pull `quantity` from the upstream into the pool, stopping when full.
    pub async fn fill(&self, quantity: Quantity) -> Result<FillReport> {
        let refiller = self
            .refiller
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig(format!("{} has no upstream to fill from", self.config.name)))?;
        let report = refiller.pull(quantity).await?;
        tracing::info!(
            "{} filled +{} of {} (level {}{})",
            self.config.name,
            report.added,
            quantity,
            report.level,
            if report.capacity_reached { ", full" } else { "" }
        );
        Ok(report)
    }

    /// Current pool state.
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            name: self.config.name.clone(),
            kind: self.pool.kind(),
            level: self.pool.level(),
            capacity: self.pool.capacity(),
            refill_threshold: self.pool.refill_threshold(),
            refilling: self.refiller.as_ref().is_some_and(|r| r.is_refilling()),
        }
    }

    /// The pool behind this producer.
    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    /// The refiller, when an upstream is configured.
    pub fn refiller(&self) -> Option<&Arc<Refiller>> {
        self.refiller.as_ref()
    }

    fn on_exhaustion(&self) -> Option<Arc<Refiller>> {
        if self.config.refill_on_exhaustion {
            self.refiller.clone()
        } else {
            None
        }
    }
}

struct PoolReserve {
    pool: Arc<ResourcePool>,
    on_exhaustion: Option<Arc<Refiller>>,
}

impl BlockReserve for PoolReserve {
    fn reserve(&mut self, quantity: Quantity) -> bool {
        self.pool.try_consume(quantity)
    }

    fn refund(&mut self, quantity: Quantity) {
        if !self.pool.add(quantity) {
            tracing::debug!("{} pool full, dropped {} unsent units", self.pool.kind(), quantity);
        }
    }

    fn exhausted(&mut self) {
        if let Some(refiller) = &self.on_exhaustion {
            refiller.trigger();
        }
    }
}

impl SupplySource for ProducerNode {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> ResourceKind {
        self.pool.kind()
    }

    fn request(&self, quantity: Quantity) -> std::result::Result<SupplyStream, TransferError> {
        if quantity == 0 {
            return Err(TransferError::InvalidQuantity);
        }

        let first_block = quantity.min(self.streamer.config().block_size);
        let available = self.pool.level();
        if available < first_block {
            tracing::warn!(
                "{} cannot serve {} {}: {} available",
                self.config.name,
                quantity,
                self.pool.kind(),
                available
            );
            if let Some(refiller) = self.on_exhaustion() {
                refiller.trigger();
            }
            return Err(TransferError::Exhausted {
                kind: self.pool.kind(),
                available,
                requested: quantity,
            });
        }

        tracing::debug!(
            "{} streaming {} {} (level {})",
            self.config.name,
            quantity,
            self.pool.kind(),
            available
        );
        let reserve = PoolReserve {
            pool: Arc::clone(&self.pool),
            on_exhaustion: self.on_exhaustion(),
        };
        Ok(self.streamer.open(self.pool.kind(), quantity, reserve))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wellspring::Wellspring;
    use cistern_transfer::StreamEnd;
    use std::time::Duration;

    fn tick() -> Duration {
        Duration::from_millis(100)
    }

    fn stream_config() -> StreamConfig {
        StreamConfig::default().with_tick(tick())
    }

    fn tank(level: Quantity, upstream: bool) -> ProducerNode {
        let pool = ResourcePool::new(ResourceKind::Water, 100, 50, level).unwrap();
        let upstream: Option<Arc<dyn SupplySource>> = upstream
            .then(|| Arc::new(Wellspring::new("utility", ResourceKind::Water, stream_config())) as Arc<dyn SupplySource>);
        let config = ProducerConfig::named("tank")
            .with_stream(stream_config())
            .with_refill(RefillPolicy::default().with_period(tick()).with_top_up(30));
        ProducerNode::new(config, pool, upstream).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_from_pool() {
        let tank = tank(100, false);
        let delivery = tank.request(25).unwrap().deliver_into(|_| true).await;

        assert!(delivery.is_complete());
        assert_eq!(delivery.delivered, 25);
        assert_eq!(tank.pool().level(), 75);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_mid_stream_truncates_and_refills() {
        let tank = tank(20, true);
        let delivery = tank.request(50).unwrap().deliver_into(|_| true).await;

        assert_eq!(delivery.delivered, 20);
        assert_eq!(delivery.end, StreamEnd::Exhausted);

        // The out-of-band refill lands over the following ticks.
        tokio::time::sleep(tick() * 5).await;
        let refiller = tank.refiller().unwrap();
        assert_eq!(refiller.requests(), 1);
        assert_eq!(tank.pool().level(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_refill_can_be_disabled() {
        let pool = ResourcePool::new(ResourceKind::Water, 100, 50, 0).unwrap();
        let upstream: Arc<dyn SupplySource> =
            Arc::new(Wellspring::new("utility", ResourceKind::Water, stream_config()));
        let config = ProducerConfig::named("tank")
            .with_stream(stream_config())
            .with_refill_on_exhaustion(false);
        let tank = ProducerNode::new(config, pool, Some(upstream)).unwrap();

        assert!(tank.request(10).is_err());
        tokio::time::sleep(tick() * 3).await;
        assert_eq!(tank.refiller().unwrap().requests(), 0);
        assert_eq!(tank.pool().level(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refuses_when_first_block_unavailable() {
        let tank = tank(5, false);
        let err = tank.request(30).err().unwrap();
        assert_eq!(
            err,
            TransferError::Exhausted {
                kind: ResourceKind::Water,
                available: 5,
                requested: 30
            }
        );
        // A request no larger than what is left still goes through.
        let delivery = tank.request(5).unwrap().deliver_into(|_| true).await;
        assert_eq!(delivery.delivered, 5);
    }

    #[tokio::test]
    async fn test_rejects_zero_quantity() {
        let tank = tank(100, false);
        assert!(matches!(tank.request(0), Err(TransferError::InvalidQuantity)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_reports_capacity() {
        let tank = tank(80, true);
        let report = tank.fill(50).await.unwrap();

        assert_eq!(report.added, 20);
        assert!(report.capacity_reached);
        assert_eq!(report.level, 100);
    }

    #[tokio::test]
    async fn test_fill_without_upstream_fails() {
        let tank = tank(80, false);
        assert!(matches!(tank.fill(10).await, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_upstream_kind_must_match() {
        let pool = ResourcePool::full(ResourceKind::Water, 100, 50).unwrap();
        let upstream: Arc<dyn SupplySource> =
            Arc::new(Wellspring::new("cfe", ResourceKind::Energy, StreamConfig::default()));
        let result = ProducerNode::new(ProducerConfig::named("tank"), pool, Some(upstream));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_pool() {
        let tank = Arc::new(tank(60, false));
        let a = tank.request(40).unwrap();
        let b = tank.request(40).unwrap();

        let (a, b) = tokio::join!(a.deliver_into(|_| true), b.deliver_into(|_| true));

        assert_eq!(a.delivered + b.delivered, 60);
        assert_eq!(tank.pool().level(), 0);
    }
}
