//! Cistern Laundry - washing units fed by the Cistern supply network
//!
//! A single-process node that wires producers, washing units and a job queue
//! together and serves them over HTTP.
//!
//! # Architecture
//!
//! - **Models**: Jobs, demands and load types
//! - **Unit**: Washing units with private reserves, top-up and one-hop delegation
//! - **Registry**: Ordered set of units, claimed first-idle-wins
//! - **Queue**: FIFO job queue with tail requeue and a single dispatcher
//! - **API**: HTTP endpoints for jobs, supply streams and status
//!
//! # Example
//!
//! ```no_run
//! use cistern_laundry::{LaundryConfig, LaundryNode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LaundryConfig::from_env();
//!     let node = LaundryNode::new(config).await?;
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod error;
pub mod models;
pub mod node;
pub mod queue;
pub mod registry;
pub mod unit;

pub use error::{Error, Result};
pub use models::{Demand, Job, JobEvent, JobId, JobStatus, LoadType};
pub use node::{LaundryConfig, LaundryNode, LaundryState};
pub use queue::{Dispatcher, JobQueue, QueueConfig};
pub use registry::UnitRegistry;
pub use unit::{JobOutcome, SupplyRoutes, UnitClaim, UnitConfig, UnitPhase, UnitSnapshot, WashingUnit};
