//! Unlimited upstream source.

use cistern_transfer::{
    BlockReserve, Quantity, ResourceKind, StreamConfig, SupplySource, SupplyStream, TickedStreamer, TransferError,
};

/// A source that never runs dry, limited only by its tick rate.
///
/// Models the base utilities: any request is served in full, one block per
/// tick.
pub struct Wellspring {
    name: String,
    kind: ResourceKind,
    streamer: TickedStreamer,
}

struct Bottomless;

impl BlockReserve for Bottomless {
    fn reserve(&mut self, _quantity: Quantity) -> bool {
        true
    }
}

impl Wellspring {
    /// Create a source of `kind` paced by `config`.
    pub fn new(name: impl Into<String>, kind: ResourceKind, config: StreamConfig) -> Self {
        Self {
            name: name.into(),
            kind,
            streamer: TickedStreamer::new(config),
        }
    }
}

impl SupplySource for Wellspring {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn request(&self, quantity: Quantity) -> Result<SupplyStream, TransferError> {
        if quantity == 0 {
            return Err(TransferError::InvalidQuantity);
        }
        tracing::debug!("{} streaming {} {}", self.name, quantity, self.kind);
        Ok(self.streamer.open(self.kind, quantity, Bottomless))
    }
}
