//! Tick-paced block streaming
//!
//! A supply request is answered with a [`SupplyStream`]: a finite sequence of
//! [`SupplyBlock`]s, one per tick, followed by an explicit [`StreamEnd`]
//! marker. The emitter and the receiver are joined by a channel with room for
//! a single block, so an emitter whose receiver is not draining stalls on its
//! next send instead of piling blocks up.
//!
//! Blocks drawn through a [`BlockReserve`] are taken out of the backing store
//! only once the channel has room for them, and a block still buffered when
//! the receiver is dropped goes back to the store.
//!
//! A stream that stops before its requested quantity is a partial delivery,
//! not an error. Receivers inspect [`Delivery`] to decide what to do with a
//! short total.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::types::{plan_blocks, Quantity, ResourceKind, SupplyBlock, DEFAULT_BLOCK_SIZE};

/// Pacing configuration for an emitter
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    /// Units per block
    pub block_size: Quantity,
    /// Delay before each block
    pub tick: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            tick: Duration::from_secs(1),
        }
    }
}

impl StreamConfig {
    /// Set the block size.
    #[must_use]
    pub fn with_block_size(mut self, block_size: Quantity) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the tick duration.
    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

/// How a stream terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Every planned block was emitted.
    Complete,
    /// The source ran dry before the next block.
    Exhausted,
    /// The receiver stopped consuming (for instance its store was full).
    Declined,
    /// The emitter went away without a terminal marker.
    Interrupted,
}

impl StreamEnd {
    /// Wire form of the marker that closes a block sequence: `{"end":"complete"}`.
    pub fn to_json_line(&self) -> String {
        format!("{{\"end\":\"{}\"}}\n", self)
    }
}

impl std::fmt::Display for StreamEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Declined => write!(f, "declined"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

enum Frame {
    Block(SupplyBlock),
    End(StreamEnd),
}

/// Open a stream channel for `requested` units of `kind`.
pub fn supply_channel(kind: ResourceKind, requested: Quantity) -> (SupplySender, SupplyStream) {
    let (tx, rx) = mpsc::channel(1);
    (
        SupplySender { kind, tx, sent: 0 },
        SupplyStream {
            kind,
            requested,
            rx,
            delivered: 0,
            end: None,
            refund: None,
        },
    )
}

type SharedReserve = Arc<Mutex<dyn BlockReserve>>;

fn lock_reserve(reserve: &SharedReserve) -> MutexGuard<'_, dyn BlockReserve + 'static> {
    reserve.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Emitting half of a supply stream
pub struct SupplySender {
    kind: ResourceKind,
    tx: mpsc::Sender<Frame>,
    sent: Quantity,
}

impl SupplySender {
    /// Send one block. Waits while the previous block is still unconsumed.
    ///
    /// Returns `false` once the receiver has gone away.
    pub async fn send(&mut self, quantity: Quantity) -> bool {
        let block = SupplyBlock::new(self.kind, quantity);
        if self.tx.send(Frame::Block(block)).await.is_err() {
            return false;
        }
        self.sent += quantity;
        true
    }

    /// Terminate the stream with an explicit marker.
    pub async fn finish(self, end: StreamEnd) {
        // A receiver that already left needs no marker.
        let _ = self.tx.send(Frame::End(end)).await;
    }

    /// Units sent so far.
    pub fn sent(&self) -> Quantity {
        self.sent
    }

    /// Whether the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a supply stream
pub struct SupplyStream {
    kind: ResourceKind,
    requested: Quantity,
    rx: mpsc::Receiver<Frame>,
    delivered: Quantity,
    end: Option<StreamEnd>,
    refund: Option<SharedReserve>,
}

impl SupplyStream {
    /// Resource carried by this stream.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Quantity that was requested.
    pub fn requested(&self) -> Quantity {
        self.requested
    }

    /// Units received so far.
    pub fn received(&self) -> Quantity {
        self.delivered
    }

    /// Terminal marker, once the stream has ended.
    pub fn end(&self) -> Option<StreamEnd> {
        self.end
    }

    /// Wait for the next block. `None` once the stream has ended.
    pub async fn next_block(&mut self) -> Option<SupplyBlock> {
        if self.end.is_some() {
            return None;
        }
        let frame = self.rx.recv().await;
        self.on_frame(frame)
    }

    /// Drain the stream, handing each block to `apply`.
    ///
    /// `apply` returns `false` to refuse a block; the stream is then abandoned
    /// and the delivery ends as [`StreamEnd::Declined`].
    pub async fn deliver_into<F>(mut self, mut apply: F) -> Delivery
    where
        F: FnMut(&SupplyBlock) -> bool,
    {
        let mut accepted: Quantity = 0;
        let mut discarded: Quantity = 0;
        let mut blocks = 0usize;

        while let Some(block) = self.next_block().await {
            if !apply(&block) {
                discarded = block.quantity;
                self.end = Some(StreamEnd::Declined);
                break;
            }
            accepted += block.quantity;
            blocks += 1;
        }

        let end = self.end.unwrap_or(StreamEnd::Interrupted);
        if !matches!(end, StreamEnd::Complete) {
            tracing::debug!(
                "{} stream ended {} after {}/{} units",
                self.kind,
                end,
                accepted,
                self.requested
            );
        }

        Delivery {
            kind: self.kind,
            requested: self.requested,
            delivered: accepted,
            discarded,
            blocks,
            end,
        }
    }

    fn on_frame(&mut self, frame: Option<Frame>) -> Option<SupplyBlock> {
        match frame {
            Some(Frame::Block(block)) => {
                self.delivered += block.quantity;
                Some(block)
            }
            Some(Frame::End(end)) => {
                self.end = Some(end);
                None
            }
            None => {
                self.end = Some(StreamEnd::Interrupted);
                None
            }
        }
    }
}

impl Drop for SupplyStream {
    fn drop(&mut self) {
        let Some(reserve) = self.refund.take() else {
            return;
        };
        // Closing under the reserve lock means the emitter either already
        // buffered its block (drained here) or sees the channel closed.
        let mut store = lock_reserve(&reserve);
        self.rx.close();
        let mut returned: Quantity = 0;
        while let Ok(frame) = self.rx.try_recv() {
            if let Frame::Block(block) = frame {
                returned += block.quantity;
            }
        }
        if returned > 0 {
            store.refund(returned);
            tracing::debug!("{} stream dropped, {} buffered units returned", self.kind, returned);
        }
    }
}

impl Stream for SupplyStream {
    type Item = SupplyBlock;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.end.is_some() {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(frame) => Poll::Ready(this.on_frame(frame)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Outcome of draining a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Resource delivered
    pub kind: ResourceKind,
    /// Quantity asked for
    pub requested: Quantity,
    /// Units accepted by the receiver
    pub delivered: Quantity,
    /// Units of the block the receiver refused, if any
    pub discarded: Quantity,
    /// Number of accepted blocks
    pub blocks: usize,
    /// How the stream terminated
    pub end: StreamEnd,
}

impl Delivery {
    /// Whether the full requested quantity arrived and was accepted.
    pub fn is_complete(&self) -> bool {
        self.end == StreamEnd::Complete && self.delivered >= self.requested
    }

    /// Units still missing from the request.
    pub fn shortfall(&self) -> Quantity {
        self.requested.saturating_sub(self.delivered)
    }
}

/// Reservation hook a [`TickedStreamer`] draws blocks through
pub trait BlockReserve: Send + 'static {
    /// Take `quantity` units out of the backing store. `false` if unavailable.
    fn reserve(&mut self, quantity: Quantity) -> bool;

    /// Return units that were reserved but could not be handed over.
    fn refund(&mut self, _quantity: Quantity) {}

    /// Called once when `reserve` fails, before the stream ends.
    fn exhausted(&mut self) {}
}

/// Tick-paced block emitter
///
/// Each opened stream runs on its own task: wait one tick, wait for room in
/// the channel, reserve the next block, hand it over, repeat.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickedStreamer {
    config: StreamConfig,
}

impl TickedStreamer {
    /// Create a streamer with the given pacing.
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }

    /// Pacing in use.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Start streaming `quantity` units of `kind` drawn from `reserve`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<R: BlockReserve>(&self, kind: ResourceKind, quantity: Quantity, reserve: R) -> SupplyStream {
        let (tx, mut rx) = supply_channel(kind, quantity);
        let reserve: SharedReserve = Arc::new(Mutex::new(reserve));
        rx.refund = Some(Arc::clone(&reserve));
        tokio::spawn(emit(self.config, quantity, tx, reserve));
        rx
    }
}

async fn emit(config: StreamConfig, quantity: Quantity, mut tx: SupplySender, reserve: SharedReserve) {
    let kind = tx.kind;
    let mut interval = (!config.tick.is_zero()).then(|| {
        let mut interval = tokio::time::interval_at(Instant::now() + config.tick, config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    tracing::debug!("Starting {} stream: {} units in blocks of {}", kind, quantity, config.block_size);

    for size in plan_blocks(quantity, config.block_size) {
        match interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => tokio::task::yield_now().await,
        }

        // Nothing leaves the store until the previous block has been taken.
        let Ok(permit) = tx.tx.reserve().await else {
            tracing::debug!("{} receiver left after {} units", kind, tx.sent());
            return;
        };

        let mut store = lock_reserve(&reserve);
        if tx.is_closed() {
            tracing::debug!("{} receiver left after {} units", kind, tx.sent());
            return;
        }
        if !store.reserve(size) {
            store.exhausted();
            drop(store);
            tracing::debug!("{} source exhausted after {}/{} units", kind, tx.sent(), quantity);
            permit.send(Frame::End(StreamEnd::Exhausted));
            return;
        }
        permit.send(Frame::Block(SupplyBlock::new(kind, size)));
        tx.sent += size;
    }

    tx.finish(StreamEnd::Complete).await;
}
