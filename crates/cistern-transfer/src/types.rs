//! Core types for Cistern supply streams

use serde::{Deserialize, Serialize};

/// Count of resource units. Resources are never fractional or negative.
pub type Quantity = u32;

/// Default number of units carried by one block (water and energy alike)
pub const DEFAULT_BLOCK_SIZE: Quantity = 10;

/// The kind of resource a pool holds or a stream carries
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Water, supplied by the utility and stored in the tank
    Water,
    /// Energy, supplied directly by the energy utility
    Energy,
}

impl ResourceKind {
    /// Every kind, in a fixed order.
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Water, ResourceKind::Energy];

    /// Lowercase name, as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Water => "water",
            Self::Energy => "energy",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "water" => Ok(Self::Water),
            "energy" => Ok(Self::Energy),
            other => Err(format!("unknown resource kind '{}'", other)),
        }
    }
}

/// One increment of a streamed delivery
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyBlock {
    /// Resource carried by the block
    pub kind: ResourceKind,
    /// Units carried (always > 0)
    pub quantity: Quantity,
}

impl SupplyBlock {
    /// Create a block
    pub fn new(kind: ResourceKind, quantity: Quantity) -> Self {
        Self { kind, quantity }
    }

    /// Wire form: a single-key JSON object such as `{"water":10}`.
    pub fn to_json_line(&self) -> String {
        format!("{{\"{}\":{}}}\n", self.kind, self.quantity)
    }
}

/// Split `quantity` into block sizes: full blocks followed by the remainder.
///
/// Yields `ceil(quantity / block_size)` items. A zero `block_size` yields nothing.
pub fn plan_blocks(quantity: Quantity, block_size: Quantity) -> impl Iterator<Item = Quantity> {
    let mut remaining = if block_size == 0 { 0 } else { quantity };
    std::iter::from_fn(move || {
        if remaining == 0 {
            return None;
        }
        let next = remaining.min(block_size);
        remaining -= next;
        Some(next)
    })
}
