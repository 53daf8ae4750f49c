use scopeguard::ScopeGuard;

use crate::pal::Memory;
use crate::{AllocError, AllocationRecord, BlockOrigin, PoolId, RawBlock, Result, align};

/// A fixed set of pre-allocated slots of identical size and alignment.
///
/// Every slot owns its own raw block for its entire lifetime. Slots move between this pool's
/// free list and the manager's live index but are never resized, merged or released until the
/// pool itself is torn down.
#[derive(Debug)]
pub(crate) struct Pool {
    id: PoolId,
    slot_size: usize,
    slot_alignment: usize,

    /// Stack of parked slots. The top of the stack is the next slot handed out.
    free_slots: Vec<AllocationRecord>,

    /// Number of slots ever created. Slots are only created up front, so this never changes.
    capacity: usize,
}

impl Pool {
    /// Pre-allocates `slot_count` slots of `slot_size` bytes aligned to `alignment`.
    ///
    /// Either every slot is allocated or none is: on failure, any slots allocated so far
    /// are released again before returning.
    pub(crate) fn create(
        id: PoolId,
        slot_size: usize,
        slot_count: usize,
        alignment: usize,
        memory: &impl Memory,
    ) -> Result<Self> {
        align::validate(alignment)?;

        let raw_len = align::padded_len(slot_size, alignment)?;

        let mut slots: Vec<AllocationRecord> = Vec::new();
        slots
            .try_reserve_exact(slot_count)
            .map_err(|_| AllocError::OutOfMemory {
                requested: slot_size,
            })?;

        let mut slots = scopeguard::guard(slots, |slots| {
            for slot in slots {
                slot.into_raw().release(memory);
            }
        });

        for _ in 0..slot_count {
            let raw = RawBlock::allocate(memory, raw_len).ok_or(AllocError::OutOfMemory {
                requested: slot_size,
            })?;

            slots.push(AllocationRecord::place(
                raw,
                slot_size,
                alignment,
                BlockOrigin::Pool(id),
            ));
        }

        let mut free_slots = ScopeGuard::into_inner(slots);

        // Hand out slots in the order they were created.
        free_slots.reverse();

        Ok(Self {
            id,
            slot_size,
            slot_alignment: alignment,
            free_slots,
            capacity: slot_count,
        })
    }

    /// Whether slots of this pool can satisfy a request, regardless of availability.
    #[must_use]
    pub(crate) fn matches(&self, size: usize, alignment: usize) -> bool {
        self.slot_size >= size && align::satisfies(self.slot_alignment, alignment)
    }

    /// Takes a free slot if this pool can satisfy the request.
    ///
    /// The returned record is still unreferenced; the caller activates it when registering.
    pub(crate) fn try_take(&mut self, size: usize, alignment: usize) -> Option<AllocationRecord> {
        if !self.matches(size, alignment) {
            return None;
        }

        let mut slot = self.free_slots.pop()?;

        // Same alignment as the slot already has, so the user pointer does not move.
        slot.rehost(size, self.slot_alignment);

        Some(slot)
    }

    /// Parks a slot back on the free list.
    ///
    /// # Panics
    ///
    /// Panics if the slot belongs to a different pool.
    pub(crate) fn give_back(&mut self, mut slot: AllocationRecord) {
        assert_eq!(
            slot.origin(),
            BlockOrigin::Pool(self.id),
            "slot {:#x} returned to pool {} that does not own it",
            slot.address(),
            self.id
        );

        slot.set_ref_count(0);
        slot.rehost(self.slot_size, self.slot_alignment);

        self.free_slots.push(slot);
    }

    /// Releases the raw blocks of all parked slots, returning how many were released.
    pub(crate) fn release_free_slots(&mut self, memory: &impl Memory) -> usize {
        let count = self.free_slots.len();

        for slot in self.free_slots.drain(..) {
            slot.into_raw().release(memory);
        }

        count
    }

    #[must_use]
    pub(crate) fn id(&self) -> PoolId {
        self.id
    }

    #[must_use]
    pub(crate) fn slot_size(&self) -> usize {
        self.slot_size
    }

    #[must_use]
    pub(crate) fn slot_alignment(&self) -> usize {
        self.slot_alignment
    }

    #[must_use]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub(crate) fn free_len(&self) -> usize {
        self.free_slots.len()
    }

    #[cfg(test)]
    pub(crate) fn free_slots(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.free_slots.iter()
    }

    /// Verifies the structural invariants of the pool.
    #[cfg(any(debug_assertions, test))]
    pub(crate) fn integrity_check(&self) {
        assert!(self.free_slots.len() <= self.capacity);

        for slot in &self.free_slots {
            assert_eq!(slot.origin(), BlockOrigin::Pool(self.id));
            assert_eq!(slot.ref_count(), 0);
            assert_eq!(slot.size(), self.slot_size);
            assert_eq!(slot.alignment(), self.slot_alignment);
            slot.integrity_check();
        }
    }
}
