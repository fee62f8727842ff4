//! Error types for the laundry node.

use cistern_transfer::{Quantity, ResourceKind};
use thiserror::Error;

/// Result type for laundry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in laundry operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or out-of-range request; never retried.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// `unit` is still short after topping up and the job cannot move on.
    #[error("Resource exhausted: {unit} short {short_by} {kind}")]
    ResourceExhausted {
        unit: String,
        kind: ResourceKind,
        short_by: Quantity,
    },

    /// The pending queue is at its bound.
    #[error("Job queue full ({0} pending)")]
    QueueFull(usize),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Supply request refused
    #[error("Transfer error: {0}")]
    Transfer(#[from] cistern_transfer::TransferError),

    /// Producer setup error
    #[error("Supply error: {0}")]
    Supply(#[from] cistern_supply::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
