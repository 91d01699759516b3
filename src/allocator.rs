//! Unicast address allocation
//!
//! Addresses are handed out from a persisted watermark that only moves up.
//! Deleted nodes never give their addresses back.

use std::sync::{Arc, Mutex, PoisonError};

use crate::store::Store;
use crate::{Error, Result};

/// Highest unicast address
pub const MAX_UNICAST: u16 = 0x7FFF;

/// Allocates consecutive unicast address ranges
#[derive(Debug)]
pub struct AddressAllocator {
    store: Arc<Store>,
    next: Mutex<u16>,
}

impl AddressAllocator {
    /// Resume from the watermark recorded in the store
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        let next = store.read(|doc| doc.prov.base_address);
        Self {
            store,
            next: Mutex::new(next),
        }
    }

    /// Next address that would be handed out
    #[must_use]
    pub fn watermark(&self) -> u16 {
        *self.next.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `count` consecutive addresses
    ///
    /// Returns `(net_index, first_address)`. The advanced watermark is
    /// persisted before returning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressExhaustion`] if the range would pass
    /// [`MAX_UNICAST`], or an error if the store cannot be written
    pub fn allocate(&self, count: u16) -> Result<(u16, u16)> {
        let count = count.max(1);
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);

        let first = *next;
        let end = first
            .checked_add(count)
            .filter(|end| *end <= MAX_UNICAST + 1)
            .ok_or(Error::AddressExhaustion {
                next: first,
                requested: count,
            })?;

        *next = end;
        self.store.update(|doc| doc.prov.base_address = end);
        self.store.persist()?;

        tracing::info!(first, count, next = end, "allocated addresses");
        Ok((0, first))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_are_disjoint_and_increasing() {
        let allocator = AddressAllocator::new(Arc::new(Store::in_memory()));

        let (_, a) = allocator.allocate(1).unwrap();
        let (_, b) = allocator.allocate(3).unwrap();
        let (net, c) = allocator.allocate(2).unwrap();

        assert_eq!((a, b, c), (4, 5, 8));
        assert_eq!(net, 0);
        assert_eq!(allocator.watermark(), 10);
    }

    #[test]
    fn watermark_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.yaml");

        {
            let allocator = AddressAllocator::new(Arc::new(Store::open(&path).unwrap()));
            allocator.allocate(5).unwrap();
        }

        let allocator = AddressAllocator::new(Arc::new(Store::open(&path).unwrap()));
        assert_eq!(allocator.allocate(1).unwrap(), (0, 9));
    }

    #[test]
    fn exhaustion_fails_without_advancing() {
        let store = Arc::new(Store::in_memory());
        store.update(|doc| doc.prov.base_address = MAX_UNICAST - 1);
        let allocator = AddressAllocator::new(store);

        let err = allocator.allocate(3).unwrap_err();
        assert!(matches!(err, Error::AddressExhaustion { requested: 3, .. }));
        assert_eq!(allocator.watermark(), MAX_UNICAST - 1);

        assert_eq!(allocator.allocate(2).unwrap(), (0, MAX_UNICAST - 1));
        assert!(allocator.allocate(1).is_err());
    }

    #[test]
    fn zero_count_takes_one_address() {
        let allocator = AddressAllocator::new(Arc::new(Store::in_memory()));
        allocator.allocate(0).unwrap();
        assert_eq!(allocator.watermark(), 5);
    }
}
