//! Cistern Transfer - tick-paced resource streaming
//!
//! This crate provides the delivery primitive shared by every Cistern node:
//! - Block planning: a quantity becomes full blocks plus a truncated remainder
//! - A ticked emitter that releases one block per tick with single-block
//!   backpressure
//! - A receiver with an explicit terminal marker, so a short stream is seen as
//!   a partial delivery instead of a silent success
//!
//! # Example
//!
//! ```rust,ignore
//! use cistern_transfer::{ResourceKind, StreamConfig, TickedStreamer};
//!
//! let streamer = TickedStreamer::new(StreamConfig::default());
//! let stream = streamer.open(ResourceKind::Water, 25, my_reserve);
//! let delivery = stream.deliver_into(|block| tank.add(block.quantity)).await;
//! if !delivery.is_complete() {
//!     // decide whether delivery.delivered is enough
//! }
//! ```

pub mod error;
pub mod source;
pub mod streaming;
pub mod types;

// Re-export main types at crate root
pub use error::{Result, TransferError};
pub use source::SupplySource;
pub use streaming::{
    supply_channel, BlockReserve, Delivery, StreamConfig, StreamEnd, SupplySender, SupplyStream, TickedStreamer,
};
pub use types::{plan_blocks, Quantity, ResourceKind, SupplyBlock, DEFAULT_BLOCK_SIZE};
