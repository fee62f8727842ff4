//! Threshold-triggered pool refill.
//!
//! A [`Refiller`] pulls a fixed top-up from a pool's upstream source and adds
//! each arriving block until the stream ends or the pool refuses a block for
//! being full. At most one refill per pool is in flight: the periodic
//! [`RefillMonitor`] and out-of-band triggers from the producer share the same
//! gate, so a slow upstream is asked once, not once per period.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cistern_transfer::{Quantity, StreamEnd, SupplySource, TransferError};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::pool::ResourcePool;

/// Refill timing and size.
#[derive(Debug, Clone, Copy)]
pub struct RefillPolicy {
    /// How often the monitor checks the level.
    pub period: Duration,
    /// Units requested per refill.
    pub top_up: Quantity,
}

impl Default for RefillPolicy {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            top_up: 30,
        }
    }
}

impl RefillPolicy {
    /// Set the check period.
    #[must_use]
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Set the top-up quantity.
    #[must_use]
    pub fn with_top_up(mut self, top_up: Quantity) -> Self {
        self.top_up = top_up;
        self
    }
}

/// Result of pulling supply into a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FillReport {
    /// Units asked of the upstream
    pub requested: Quantity,
    /// Units actually added to the pool
    pub added: Quantity,
    /// Whether a block was refused because the pool was full
    pub capacity_reached: bool,
    /// Pool level after the fill
    pub level: Quantity,
}

/// What a refill attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefillOutcome {
    /// Another refill was already running.
    Skipped,
    /// The upstream refused the request outright.
    Refused(TransferError),
    /// Supply was pulled (possibly less than asked).
    Filled(FillReport),
}

/// Pulls supply from an upstream source into a pool.
pub struct Refiller {
    pool: Arc<ResourcePool>,
    upstream: Arc<dyn SupplySource>,
    top_up: Quantity,
    in_flight: AtomicBool,
    requests: AtomicU64,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Refiller {
    /// Create a refiller topping `pool` up by `top_up` from `upstream`.
    pub fn new(pool: Arc<ResourcePool>, upstream: Arc<dyn SupplySource>, top_up: Quantity) -> Self {
        Self {
            pool,
            upstream,
            top_up,
            in_flight: AtomicBool::new(false),
            requests: AtomicU64::new(0),
        }
    }

    /// Pool being refilled.
    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    /// Refill requests issued so far.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Whether a refill is currently running.
    pub fn is_refilling(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Request one top-up, unless a refill is already running.
    pub async fn refill(&self) -> RefillOutcome {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return RefillOutcome::Skipped;
        }
        let _gate = InFlight(&self.in_flight);

        self.requests.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            "{} pool low ({}/{}), requesting {} from {}",
            self.pool.kind(),
            self.pool.level(),
            self.pool.refill_threshold(),
            self.top_up,
            self.upstream.name()
        );

        match self.pull(self.top_up).await {
            Ok(report) => {
                tracing::info!(
                    "{} refill finished: +{} (level {})",
                    self.pool.kind(),
                    report.added,
                    report.level
                );
                RefillOutcome::Filled(report)
            }
            Err(e) => {
                tracing::warn!("{} refill refused by {}: {}", self.pool.kind(), self.upstream.name(), e);
                RefillOutcome::Refused(e)
            }
        }
    }

    /// Start a refill in the background, unless one is already running.
    pub fn trigger(self: &Arc<Self>) {
        if self.is_refilling() {
            return;
        }
        let refiller = Arc::clone(self);
        tokio::spawn(async move {
            refiller.refill().await;
        });
    }

    /// Pull `quantity` from the upstream into the pool, bypassing the gate.
    ///
    /// Stops at the first block the pool refuses.
    pub async fn pull(&self, quantity: Quantity) -> Result<FillReport, TransferError> {
        let stream = self.upstream.request(quantity)?;
        let pool = &self.pool;
        let delivery = stream.deliver_into(|block| pool.add(block.quantity)).await;

        let capacity_reached = delivery.end == StreamEnd::Declined;
        if capacity_reached {
            tracing::debug!("{} pool full, refill ended early", pool.kind());
        }

        Ok(FillReport {
            requested: quantity,
            added: delivery.delivered,
            capacity_reached,
            level: pool.level(),
        })
    }
}

/// Background task that keeps a pool above its refill threshold.
///
/// Dropping the monitor stops the task after its current check.
pub struct RefillMonitor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RefillMonitor {
    /// Start checking the pool every `period`.
    pub fn spawn(refiller: Arc<Refiller>, period: Duration) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(monitor_loop(refiller, period, rx));
        Self { shutdown, handle }
    }

    /// Stop the monitor and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }

    /// Whether the monitor task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn monitor_loop(refiller: Arc<Refiller>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        if refiller.pool().needs_refill() {
            refiller.refill().await;
        }
    }

    tracing::debug!("{} refill monitor stopped", refiller.pool().kind());
}
