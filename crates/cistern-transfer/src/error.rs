//! Error types for cistern-transfer.

use thiserror::Error;

use crate::types::{Quantity, ResourceKind};

/// Result type for supply requests.
pub type Result<T> = std::result::Result<T, TransferError>;

/// Errors a supply request can be refused with.
///
/// A stream that started and then ended short is not an error; see
/// [`StreamEnd`](crate::StreamEnd).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// Requested quantity was zero.
    #[error("quantity must be a positive integer")]
    InvalidQuantity,

    /// The source cannot supply even the first block.
    #[error("{kind} exhausted: {available} available, {requested} requested")]
    Exhausted {
        kind: ResourceKind,
        available: Quantity,
        requested: Quantity,
    },
}
