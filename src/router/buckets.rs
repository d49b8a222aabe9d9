use parking_lot::Mutex;

use crate::gateway::GatewayAddress;

/// The connection a bucket routes to, identified by address and generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BucketSlot {
    pub address: GatewayAddress,
    pub generation: u64,
}

/// Fixed-size table mapping grain hashes to connections.
///
/// A slot only names a connection. Whether that connection is still the live one for its address is checked by the
/// caller against the slot's generation before every use.
pub(crate) struct BucketTable {
    slots: Box<[Mutex<Option<BucketSlot>>]>,
}

impl BucketTable {
    pub fn new(count: usize) -> Self {
        BucketTable {
            slots: (0..count.max(1)).map(|_| Mutex::new(None)).collect(),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn index(&self, hash: u32) -> usize {
        hash as usize % self.slots.len()
    }

    pub fn get(&self, index: usize) -> Option<BucketSlot> {
        *self.slots[index].lock()
    }

    /// Stores `new` if the slot still holds `current`. On conflict, returns what the slot holds instead.
    pub fn compare_and_set(
        &self,
        index: usize,
        current: Option<BucketSlot>,
        new: BucketSlot,
    ) -> Result<(), Option<BucketSlot>> {
        let mut slot = self.slots[index].lock();
        if *slot != current {
            return Err(*slot);
        }
        *slot = Some(new);
        Ok(())
    }

    /// Empties every slot pointing at `generation`. Returns how many were cleared.
    pub fn invalidate(&self, generation: u64) -> usize {
        let mut cleared = 0;
        for slot in self.slots.iter() {
            let mut slot = slot.lock();
            if slot.is_some_and(|slot| slot.generation == generation) {
                *slot = None;
                cleared += 1;
            }
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::gateway_addr;

    fn slot(n: u16, generation: u64) -> BucketSlot {
        BucketSlot {
            address: gateway_addr(n),
            generation,
        }
    }

    #[test]
    fn test_index_wraps_hash() {
        let table = BucketTable::new(8);
        assert_eq!(table.len(), 8);
        assert_eq!(table.index(3), 3);
        assert_eq!(table.index(11), 3);
        assert_eq!(table.index(u32::MAX), (u32::MAX % 8) as usize);
    }

    #[test]
    fn test_zero_count_has_one_bucket() {
        let table = BucketTable::new(0);
        assert_eq!(table.len(), 1);
        assert_eq!(table.index(12345), 0);
    }

    #[test]
    fn test_compare_and_set() {
        let table = BucketTable::new(4);
        assert_eq!(table.get(1), None);

        table.compare_and_set(1, None, slot(1, 10)).unwrap();
        assert_eq!(table.get(1), Some(slot(1, 10)));

        // A stale expectation loses and sees the winner.
        assert_eq!(
            table.compare_and_set(1, None, slot(2, 11)),
            Err(Some(slot(1, 10)))
        );
        table
            .compare_and_set(1, Some(slot(1, 10)), slot(2, 11))
            .unwrap();
        assert_eq!(table.get(1), Some(slot(2, 11)));
    }

    #[test]
    fn test_invalidate_clears_only_matching_generation() {
        let table = BucketTable::new(4);
        table.compare_and_set(0, None, slot(1, 5)).unwrap();
        table.compare_and_set(2, None, slot(1, 5)).unwrap();
        table.compare_and_set(3, None, slot(2, 6)).unwrap();

        assert_eq!(table.invalidate(5), 2);
        assert_eq!(table.get(0), None);
        assert_eq!(table.get(2), None);
        assert_eq!(table.get(3), Some(slot(2, 6)));
    }
}
