//! Error types for cistern-supply.

use thiserror::Error;

/// Result type for cistern-supply operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur building or driving producers.
#[derive(Debug, Error)]
pub enum Error {
    /// A pool or producer was configured with impossible bounds.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The upstream refused a request.
    #[error("transfer error: {0}")]
    Transfer(#[from] cistern_transfer::TransferError),
}
