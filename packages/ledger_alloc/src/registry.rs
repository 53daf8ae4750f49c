use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::ptr::NonNull;

use foldhash::{HashMap, HashMapExt};

use crate::AllocationRecord;

/// The canonical index of every block the manager is tracking, keyed by user address.
///
/// Three disjoint sets of addresses are maintained:
///
/// * Live blocks (`ref_count >= 1`), looked up by exact address on every operation.
/// * Vacant heap blocks (`ref_count == 0`) parked under the deferred release policy. These are
///   never reachable through the live lookups and are kept in address order because the only
///   things that ever look at them (reuse and coalescing) want first-fit by address.
/// * Retired addresses, which were live at some point and have been released since. We keep
///   them only to tell a double release apart from a pointer we never handed out. An address
///   leaves this set as soon as memory covering it is registered again, whether or not the new
///   block starts at the same address.
#[derive(Debug)]
pub(crate) struct BlockRegistry {
    /// We use foldhash for better performance with small hash tables.
    live: HashMap<usize, AllocationRecord>,

    vacant: BTreeMap<usize, AllocationRecord>,

    /// Ordered so that every retired address inside a newly registered span can be found
    /// without scanning the whole set.
    retired: BTreeSet<usize>,
}

impl BlockRegistry {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            live: HashMap::new(),
            vacant: BTreeMap::new(),
            retired: BTreeSet::new(),
        }
    }

    /// Adds a live record, returning the user pointer it is now registered under.
    ///
    /// # Panics
    ///
    /// Panics if the record is unreferenced or its address is already registered. Both imply
    /// the manager has lost track of ownership somewhere.
    pub(crate) fn register(&mut self, record: AllocationRecord) -> NonNull<u8> {
        assert!(
            record.ref_count() > 0,
            "unreferenced block {:#x} cannot be registered as live",
            record.address()
        );

        let address = record.address();
        let user_pointer = record.user_pointer();
        let raw_start = record.raw().address();
        let raw_end = record.raw().end_address();

        assert!(
            !self.vacant.contains_key(&address),
            "block {address:#x} is registered as both live and vacant"
        );

        let previous = self.live.insert(address, record);
        assert!(
            previous.is_none(),
            "two live blocks registered at the same address {address:#x}"
        );

        self.retired.remove(&address);
        self.forget_retired_within(raw_start, raw_end);

        user_pointer
    }

    #[must_use]
    pub(crate) fn find(&self, address: usize) -> Option<&AllocationRecord> {
        self.live.get(&address)
    }

    #[must_use]
    pub(crate) fn find_mut(&mut self, address: usize) -> Option<&mut AllocationRecord> {
        self.live.get_mut(&address)
    }

    /// Removes a live record. The address is not retired; callers decide whether it should be.
    pub(crate) fn remove(&mut self, address: usize) -> Option<AllocationRecord> {
        self.live.remove(&address)
    }

    /// Remembers that `address` was released, so releasing it again can be reported as such.
    pub(crate) fn retire(&mut self, address: usize) {
        self.retired.insert(address);
    }

    #[must_use]
    pub(crate) fn is_retired(&self, address: usize) -> bool {
        self.retired.contains(&address)
    }

    /// Drops retired addresses in `[start, end)`. That memory belongs to a live block again,
    /// so a pointer into it is no longer a stale handle to a released block.
    fn forget_retired_within(&mut self, start: usize, end: usize) {
        let stale = self
            .retired
            .range(start..end)
            .copied()
            .collect::<Vec<_>>();

        for address in stale {
            self.retired.remove(&address);
        }
    }

    /// Finds the live block whose user span covers `[address, address + len)`.
    ///
    /// An exact address match is resolved in constant time; interior pointers fall back to
    /// a scan over all live blocks.
    #[must_use]
    pub(crate) fn containing(&self, address: usize, len: usize) -> Option<&AllocationRecord> {
        if let Some(record) = self.live.get(&address) {
            return record.covers(address, len).then_some(record);
        }

        self.live.values().find(|record| record.covers(address, len))
    }

    /// Parks an unreferenced heap block as vacant.
    ///
    /// # Panics
    ///
    /// Panics if the record is still referenced, belongs to a pool, or its address is in use.
    pub(crate) fn park_vacant(&mut self, record: AllocationRecord) {
        assert_eq!(record.ref_count(), 0, "vacant blocks must be unreferenced");
        assert!(record.is_heap(), "pool slots are never parked as vacant heap blocks");

        let address = record.address();

        assert!(
            !self.live.contains_key(&address),
            "block {address:#x} is registered as both live and vacant"
        );

        let previous = self.vacant.insert(address, record);
        assert!(
            previous.is_none(),
            "two vacant blocks registered at the same address {address:#x}"
        );
    }

    /// Removes and returns the lowest-addressed vacant block that can host the span.
    pub(crate) fn take_vacant_fitting(
        &mut self,
        size: usize,
        alignment: usize,
    ) -> Option<AllocationRecord> {
        let address = self
            .vacant
            .iter()
            .find(|(_, record)| record.can_host(size, alignment))
            .map(|(&address, _)| address)?;

        self.vacant.remove(&address)
    }

    pub(crate) fn remove_vacant(&mut self, address: usize) -> Option<AllocationRecord> {
        self.vacant.remove(&address)
    }

    #[must_use]
    pub(crate) fn is_vacant(&self, address: usize) -> bool {
        self.vacant.contains_key(&address)
    }

    /// Looks up a heap block by address in either the live or the vacant set.
    #[must_use]
    pub(crate) fn find_heap_block(&self, address: usize) -> Option<&AllocationRecord> {
        self.live
            .get(&address)
            .or_else(|| self.vacant.get(&address))
            .filter(|record| record.is_heap())
    }

    /// Addresses of all heap blocks, live and vacant, in ascending address order.
    #[must_use]
    pub(crate) fn heap_addresses_in_order(&self) -> Vec<usize> {
        let mut addresses = self
            .live
            .values()
            .filter(|record| record.is_heap())
            .map(AllocationRecord::address)
            .chain(self.vacant.keys().copied())
            .collect::<Vec<_>>();

        addresses.sort_unstable();
        addresses
    }

    /// Number of live blocks.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    #[must_use]
    pub(crate) fn vacant_len(&self) -> usize {
        self.vacant.len()
    }

    pub(crate) fn live(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.live.values()
    }

    pub(crate) fn vacant(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.vacant.values()
    }

    /// Removes every vacant record, in address order.
    pub(crate) fn drain_vacant(&mut self) -> Vec<AllocationRecord> {
        mem::take(&mut self.vacant).into_values().collect()
    }

    /// Removes every record, live and vacant, and forgets all retired addresses.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = AllocationRecord> {
        self.retired.clear();

        let live = self.live.drain().map(|(_, record)| record);
        let vacant = mem::take(&mut self.vacant).into_values();

        live.chain(vacant)
    }

    /// Verifies the invariants of whatever is registered at `address`, live or vacant.
    ///
    /// An address that is neither is not an error: the block may just have been released.
    #[cfg(debug_assertions)]
    pub(crate) fn check_address(&self, address: usize) {
        if let Some(record) = self.live.get(&address) {
            self.check_live(address, record);
        } else if let Some(record) = self.vacant.get(&address) {
            check_vacant(address, record);
        }
    }

    /// Verifies the structural invariants of the registry.
    #[cfg(any(debug_assertions, test))]
    pub(crate) fn integrity_check(&self) {
        for (&address, record) in &self.live {
            self.check_live(address, record);
        }

        for (&address, record) in &self.vacant {
            check_vacant(address, record);
        }
    }

    #[cfg(any(debug_assertions, test))]
    fn check_live(&self, address: usize, record: &AllocationRecord) {
        assert_eq!(address, record.address());
        assert!(record.ref_count() > 0);
        assert!(!self.vacant.contains_key(&address));
        assert!(!self.retired.contains(&address));
        record.integrity_check();
    }
}

#[cfg(any(debug_assertions, test))]
fn check_vacant(address: usize, record: &AllocationRecord) {
    assert_eq!(address, record.address());
    assert_eq!(record.ref_count(), 0);
    assert!(record.is_heap());
    record.integrity_check();
}
