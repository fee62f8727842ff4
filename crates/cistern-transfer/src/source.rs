//! The request side of the streaming contract.

use crate::error::Result;
use crate::streaming::SupplyStream;
use crate::types::{Quantity, ResourceKind};

/// Anything that answers supply requests with a block stream.
///
/// `request` returns as soon as the stream is open; blocks follow at the
/// source's own pace. A source never parks a caller waiting for stock: a
/// request it cannot start is refused with
/// [`TransferError::Exhausted`](crate::TransferError::Exhausted), and a stream
/// that runs dry ends early. Callers retry with a new request.
pub trait SupplySource: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Resource this source delivers.
    fn kind(&self) -> ResourceKind;

    /// Open a stream of `quantity` units.
    fn request(&self, quantity: Quantity) -> Result<SupplyStream>;
}
