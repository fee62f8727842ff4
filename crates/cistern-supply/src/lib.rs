//! Cistern Supply - resource pools and producer nodes
//!
//! A producer owns a capacity-bounded [`ResourcePool`] and serves it over the
//! streaming contract of `cistern-transfer`. Pools with an upstream keep
//! themselves above a refill threshold:
//!
//! ```text
//!  Wellspring (utility) ──blocks──▶ ProducerNode (utility pool)
//!                                        │
//!                                        └──blocks──▶ ProducerNode (tank) ──blocks──▶ consumers
//! ```
//!
//! - **Pool**: atomic add/consume under one lock; over-capacity adds are refused
//! - **Refill**: a periodic monitor plus out-of-band triggers, one request in flight
//! - **Producer**: streams pool blocks one per tick, ends short when dry

pub mod error;
pub mod pool;
pub mod producer;
pub mod refill;
pub mod wellspring;

pub use error::{Error, Result};
pub use pool::ResourcePool;
pub use producer::{PoolStatus, ProducerConfig, ProducerNode};
pub use refill::{FillReport, RefillMonitor, RefillOutcome, RefillPolicy, Refiller};
pub use wellspring::Wellspring;
