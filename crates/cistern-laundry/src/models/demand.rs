//! Resource demand of a job.

use std::collections::BTreeMap;

use cistern_transfer::{Quantity, ResourceKind};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Units of each resource kind a job consumes.
///
/// Kinds iterate in a fixed order, so multi-kind operations are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Demand(BTreeMap<ResourceKind, Quantity>);

impl Demand {
    /// Empty demand.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the demand for one kind.
    #[must_use]
    pub fn with(mut self, kind: ResourceKind, quantity: Quantity) -> Self {
        self.0.insert(kind, quantity);
        self
    }

    /// The standard demand of a washing load.
    pub fn for_load(load: LoadType) -> Self {
        Self::new()
            .with(ResourceKind::Water, load.water())
            .with(ResourceKind::Energy, LoadType::ENERGY)
    }

    /// Units of `kind` demanded (zero if absent).
    pub fn get(&self, kind: ResourceKind) -> Quantity {
        self.0.get(&kind).copied().unwrap_or(0)
    }

    /// Iterate `(kind, quantity)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, Quantity)> + '_ {
        self.0.iter().map(|(k, q)| (*k, *q))
    }

    /// Whether nothing is demanded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reject empty demands and zero quantities.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::InvalidRequest("demand must name at least one resource".into()));
        }
        if let Some((kind, _)) = self.0.iter().find(|(_, q)| **q == 0) {
            return Err(Error::InvalidRequest(format!("demand for {} must be positive", kind)));
        }
        Ok(())
    }
}

impl FromIterator<(ResourceKind, Quantity)> for Demand {
    fn from_iter<I: IntoIterator<Item = (ResourceKind, Quantity)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Washing load size, numbered 1 to 3 on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LoadType {
    Small,
    Medium,
    Large,
}

impl LoadType {
    /// Energy used by every load type.
    pub const ENERGY: Quantity = 30;

    /// Water used by this load type.
    pub fn water(&self) -> Quantity {
        match self {
            Self::Small => 10,
            Self::Medium => 20,
            Self::Large => 30,
        }
    }
}

impl TryFrom<u8> for LoadType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Small),
            2 => Ok(Self::Medium),
            3 => Ok(Self::Large),
            other => Err(format!("load must be 1, 2 or 3, got {}", other)),
        }
    }
}

impl From<LoadType> for u8 {
    fn from(load: LoadType) -> Self {
        match load {
            LoadType::Small => 1,
            LoadType::Medium => 2,
            LoadType::Large => 3,
        }
    }
}
