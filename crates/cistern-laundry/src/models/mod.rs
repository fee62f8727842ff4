//! Data models for the laundry node.
//!
//! - [`Job`] - a washing request and its lifecycle
//! - [`Demand`] - resources a job consumes
//! - [`LoadType`] - the three standard load sizes

mod demand;
mod job;

pub use demand::{Demand, LoadType};
pub use job::{now_millis, Job, JobEvent, JobId, JobStatus};
