//! Capacity-bounded resource pool.

use std::sync::{Mutex, MutexGuard, PoisonError};

use cistern_transfer::{Quantity, ResourceKind};

use crate::error::{Error, Result};

/// A store of one resource kind, bounded by `0 <= level <= capacity`.
///
/// Every mutation takes the pool's single lock, so consumes and adds are
/// totally ordered and never observed half-applied.
#[derive(Debug)]
pub struct ResourcePool {
    kind: ResourceKind,
    capacity: Quantity,
    refill_threshold: Quantity,
    level: Mutex<Quantity>,
}

impl ResourcePool {
    /// Create a pool holding `initial` units.
    pub fn new(
        kind: ResourceKind,
        capacity: Quantity,
        refill_threshold: Quantity,
        initial: Quantity,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidConfig(format!("{} pool capacity must be positive", kind)));
        }
        if refill_threshold > capacity {
            return Err(Error::InvalidConfig(format!(
                "{} refill threshold {} exceeds capacity {}",
                kind, refill_threshold, capacity
            )));
        }
        if initial > capacity {
            return Err(Error::InvalidConfig(format!(
                "{} initial level {} exceeds capacity {}",
                kind, initial, capacity
            )));
        }
        Ok(Self {
            kind,
            capacity,
            refill_threshold,
            level: Mutex::new(initial),
        })
    }

    /// Create a pool filled to capacity.
    pub fn full(kind: ResourceKind, capacity: Quantity, refill_threshold: Quantity) -> Result<Self> {
        Self::new(kind, capacity, refill_threshold, capacity)
    }

    fn lock(&self) -> MutexGuard<'_, Quantity> {
        self.level.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subtract `amount` if the pool holds at least that much.
    pub fn try_consume(&self, amount: Quantity) -> bool {
        let mut level = self.lock();
        if *level < amount {
            return false;
        }
        *level -= amount;
        tracing::trace!("{} pool supplied {} (level {})", self.kind, amount, *level);
        true
    }

    /// Add `amount` unless it would overflow capacity. Over-capacity adds are
    /// rejected whole, never clamped.
    pub fn add(&self, amount: Quantity) -> bool {
        let mut level = self.lock();
        match level.checked_add(amount) {
            Some(next) if next <= self.capacity => {
                *level = next;
                tracing::trace!("{} pool received {} (level {})", self.kind, amount, next);
                true
            }
            _ => false,
        }
    }

    /// Current level.
    pub fn level(&self) -> Quantity {
        *self.lock()
    }

    /// Whether the level has dropped below the refill threshold.
    pub fn needs_refill(&self) -> bool {
        *self.lock() < self.refill_threshold
    }

    /// Resource held.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Maximum level.
    pub fn capacity(&self) -> Quantity {
        self.capacity
    }

    /// Level under which a refill is requested.
    pub fn refill_threshold(&self) -> Quantity {
        self.refill_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn pool(level: Quantity) -> ResourcePool {
        ResourcePool::new(ResourceKind::Water, 100, 90, level).unwrap()
    }

    #[test]
    fn rejects_invalid_config() {
        assert!(ResourcePool::new(ResourceKind::Water, 0, 0, 0).is_err());
        assert!(ResourcePool::new(ResourceKind::Water, 100, 101, 0).is_err());
        assert!(ResourcePool::new(ResourceKind::Water, 100, 90, 101).is_err());
    }

    #[test]
    fn add_rejects_overflow_without_clamping() {
        let pool = pool(95);
        assert!(!pool.add(10));
        assert_eq!(pool.level(), 95);
        assert!(pool.add(5));
        assert_eq!(pool.level(), 100);
        assert!(!pool.add(Quantity::MAX));
    }

    #[test]
    fn refill_threshold_is_strict() {
        assert!(!pool(90).needs_refill());
        assert!(pool(89).needs_refill());
    }

    #[test]
    fn concurrent_consumers_never_overdraw() {
        let pool = Arc::new(pool(100));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || (0..50).filter(|_| pool.try_consume(3)).count())
            })
            .collect();
        let served: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(served, 33);
        assert_eq!(pool.level(), 1);
    }

    proptest! {
        #[test]
        fn add_succeeds_iff_within_capacity(level in 0u32..=100, amount in 0u32..200) {
            let pool = pool(level);
            let ok = pool.add(amount);
            prop_assert_eq!(ok, level + amount <= 100);
            if ok {
                prop_assert_eq!(pool.level(), level + amount);
            } else {
                prop_assert_eq!(pool.level(), level);
            }
        }

        #[test]
        fn consume_succeeds_iff_available(level in 0u32..=100, amount in 0u32..200) {
            let pool = pool(level);
            let ok = pool.try_consume(amount);
            prop_assert_eq!(ok, amount <= level);
            if ok {
                prop_assert_eq!(pool.level(), level - amount);
            } else {
                prop_assert_eq!(pool.level(), level);
            }
        }
    }
}
