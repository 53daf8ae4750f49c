use std::fmt;
use std::ptr::{self, NonNull};

use crate::pal::Memory;
use crate::{AllocError, RawBlock, align};

/// Identifies a pool within the manager that created it.
///
/// Pools are numbered in creation order, which is also the order in which they are consulted
/// when servicing an allocation request.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PoolId(usize);

impl PoolId {
    #[must_use]
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }

    /// Position of the pool in creation order, starting from zero.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where the memory behind a block came from, and therefore where it goes when released.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum BlockOrigin {
    /// A dedicated raw allocation made for this block.
    Heap,

    /// A slot owned by the identified pool.
    Pool(PoolId),
}

/// The manager's canonical record of one block of memory.
///
/// The record owns the raw block and remembers the (possibly offset) user pointer separately,
/// so release always hands the primitive exactly what it handed out.
#[derive(Debug)]
pub(crate) struct AllocationRecord {
    raw: RawBlock,
    user_pointer: NonNull<u8>,
    size: usize,
    alignment: usize,
    ref_count: usize,
    origin: BlockOrigin,
}

impl AllocationRecord {
    /// Creates an unreferenced record for a span of `size` bytes aligned to `alignment`
    /// placed at the first suitably aligned address in `raw`.
    ///
    /// # Panics
    ///
    /// Panics if the raw block is too small to hold the aligned span.
    #[must_use]
    pub(crate) fn place(raw: RawBlock, size: usize, alignment: usize, origin: BlockOrigin) -> Self {
        assert!(
            Self::fits(&raw, size, alignment),
            "raw block of {} bytes cannot hold {size} bytes aligned to {alignment}",
            raw.len()
        );

        let offset = align::offset_to_align(raw.address(), alignment);

        // SAFETY: offset + size <= raw.len() as asserted above, so the pointer stays in bounds.
        let user_pointer = unsafe { raw.ptr().add(offset) };

        Self {
            raw,
            user_pointer,
            size,
            alignment,
            ref_count: 0,
            origin,
        }
    }

    fn fits(raw: &RawBlock, size: usize, alignment: usize) -> bool {
        align::offset_to_align(raw.address(), alignment)
            .checked_add(size)
            .is_some_and(|end| end <= raw.len())
    }

    /// Whether the raw block of this record could host `size` bytes aligned to `alignment`.
    #[must_use]
    pub(crate) fn can_host(&self, size: usize, alignment: usize) -> bool {
        Self::fits(&self.raw, size, alignment)
    }

    /// Re-places the user span inside the existing raw block. Contents are not preserved.
    ///
    /// # Panics
    ///
    /// Panics if the raw block cannot host the span.
    pub(crate) fn rehost(&mut self, size: usize, alignment: usize) {
        assert!(self.can_host(size, alignment));

        let offset = align::offset_to_align(self.raw.address(), alignment);

        // SAFETY: Bounds checked by the assertion above.
        self.user_pointer = unsafe { self.raw.ptr().add(offset) };
        self.size = size;
        self.alignment = alignment;
    }

    /// Resizes the block to `new_size` bytes aligned to `new_alignment`, resizing the raw block
    /// as needed and preserving the first `min(size, new_size)` bytes of content.
    ///
    /// The user pointer may change. On failure the record is returned unchanged.
    pub(crate) fn resize(
        self,
        memory: &impl Memory,
        new_size: usize,
        new_alignment: usize,
    ) -> Result<Self, (Self, AllocError)> {
        let needed = match align::padded_len(new_size, new_alignment) {
            Ok(needed) => needed,
            Err(e) => return Err((self, e)),
        };

        let keep = self.size.min(new_size);
        let old_offset = self.offset();

        // The preserved bytes must survive the raw resize even when the new span would
        // start closer to the beginning of the raw block than the old one did.
        // Cannot overflow: both values describe ranges inside the current raw block.
        let target_len = needed.max(old_offset.wrapping_add(keep));

        let Self {
            raw,
            user_pointer,
            size,
            alignment,
            ref_count,
            origin,
        } = self;

        let raw = match raw.resize(memory, target_len) {
            Ok(raw) => raw,
            Err(raw) => {
                return Err((
                    Self {
                        raw,
                        user_pointer,
                        size,
                        alignment,
                        ref_count,
                        origin,
                    },
                    AllocError::OutOfMemory {
                        requested: new_size,
                    },
                ));
            }
        };

        let new_offset = align::offset_to_align(raw.address(), new_alignment);

        if new_offset != old_offset && keep > 0 {
            // SAFETY: Both ranges lie inside the resized raw block: old_offset + keep <= target_len
            // by construction and new_offset + keep <= new_offset + new_size <= needed. The ranges
            // may overlap, which ptr::copy permits.
            unsafe {
                ptr::copy(
                    raw.ptr().add(old_offset).as_ptr(),
                    raw.ptr().add(new_offset).as_ptr(),
                    keep,
                );
            }
        }

        // SAFETY: new_offset + new_size <= needed <= raw.len().
        let user_pointer = unsafe { raw.ptr().add(new_offset) };

        Ok(Self {
            raw,
            user_pointer,
            size: new_size,
            alignment: new_alignment,
            ref_count,
            origin,
        })
    }

    /// Increments the reference count, returning the new value.
    ///
    /// # Panics
    ///
    /// Panics if the count would overflow.
    pub(crate) fn retain(&mut self) -> usize {
        self.ref_count = self
            .ref_count
            .checked_add(1)
            .expect("reference count overflow");
        self.ref_count
    }

    /// Decrements the reference count, returning the new value.
    ///
    /// # Panics
    ///
    /// Panics if the count is already zero. Callers check for this and report it as a
    /// double release before it gets here.
    pub(crate) fn release(&mut self) -> usize {
        self.ref_count = self
            .ref_count
            .checked_sub(1)
            .expect("reference count underflow on a registered block");
        self.ref_count
    }

    pub(crate) fn set_ref_count(&mut self, ref_count: usize) {
        self.ref_count = ref_count;
    }

    /// Consumes the record, returning the raw block for release.
    #[must_use]
    pub(crate) fn into_raw(self) -> RawBlock {
        self.raw
    }

    #[must_use]
    pub(crate) fn raw(&self) -> &RawBlock {
        &self.raw
    }

    #[must_use]
    pub(crate) fn user_pointer(&self) -> NonNull<u8> {
        self.user_pointer
    }

    #[must_use]
    pub(crate) fn address(&self) -> usize {
        self.user_pointer.as_ptr() as usize
    }

    /// Address one past the last byte of the user span.
    #[must_use]
    pub(crate) fn end_address(&self) -> usize {
        // Cannot overflow because the span lies inside the raw block.
        self.address().wrapping_add(self.size)
    }

    /// Distance from the start of the raw block to the user pointer.
    #[must_use]
    pub(crate) fn offset(&self) -> usize {
        // Cannot underflow because the user pointer is never before the raw block.
        self.address().wrapping_sub(self.raw.address())
    }

    #[must_use]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub(crate) fn alignment(&self) -> usize {
        self.alignment
    }

    #[must_use]
    pub(crate) fn ref_count(&self) -> usize {
        self.ref_count
    }

    #[must_use]
    pub(crate) fn origin(&self) -> BlockOrigin {
        self.origin
    }

    #[must_use]
    pub(crate) fn is_heap(&self) -> bool {
        matches!(self.origin, BlockOrigin::Heap)
    }

    /// Whether `[address, address + len)` lies within the user span of this record.
    #[must_use]
    pub(crate) fn covers(&self, address: usize, len: usize) -> bool {
        address >= self.address()
            && address
                .checked_add(len)
                .is_some_and(|end| end <= self.end_address())
    }

    /// Verifies the structural invariants of the record.
    #[cfg(any(debug_assertions, test))]
    pub(crate) fn integrity_check(&self) {
        assert!(self.alignment.is_power_of_two());
        assert_eq!(self.address() % self.alignment, 0);
        assert!(self.address() >= self.raw.address());
        assert!(self.end_address() <= self.raw.end_address());
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use super::*;
    use crate::pal::FakeMemory;

    fn heap_record(memory: &FakeMemory, size: usize, alignment: usize) -> AllocationRecord {
        let raw = RawBlock::allocate(memory, align::padded_len(size, alignment).unwrap()).unwrap();
        AllocationRecord::place(raw, size, alignment, BlockOrigin::Heap)
    }

    fn fill(record: &AllocationRecord, len: usize) {
        for i in 0..len {
            unsafe { record.user_pointer().add(i).write(i as u8) };
        }
    }

    fn assert_filled(record: &AllocationRecord, len: usize) {
        for i in 0..len {
            assert_eq!(unsafe { record.user_pointer().add(i).read() }, i as u8);
        }
    }

    #[test]
    fn place_aligns_user_pointer() {
        let memory = FakeMemory::new(1024);

        // Knock the arena cursor off alignment first.
        let spacer = RawBlock::allocate(&memory, 3).unwrap();

        let record = heap_record(&memory, 32, 8);
        assert_eq!(record.address() % 8, 0);
        assert_eq!(record.size(), 32);
        assert_eq!(record.ref_count(), 0);
        assert!(record.is_heap());
        assert!(record.end_address() <= record.raw().end_address());
        record.integrity_check();

        record.into_raw().release(&memory);
        spacer.release(&memory);
        assert_eq!(memory.outstanding(), 0);
    }

    #[test]
    #[should_panic]
    fn place_panics_if_raw_too_small() {
        let memory = FakeMemory::new(1024);
        let raw = RawBlock::allocate(&memory, 4).unwrap();
        let _record = AllocationRecord::place(raw, 8, 1, BlockOrigin::Heap);
    }

    #[test]
    fn retain_and_release_track_count() {
        let memory = FakeMemory::new(1024);
        let mut record = heap_record(&memory, 8, 1);

        record.set_ref_count(1);
        assert_eq!(record.retain(), 2);
        assert_eq!(record.release(), 1);
        assert_eq!(record.release(), 0);

        record.into_raw().release(&memory);
    }

    #[test]
    fn resize_grow_preserves_content() {
        let memory = FakeMemory::new(1024);
        let record = heap_record(&memory, 16, 4);
        fill(&record, 16);

        // Block the space behind it so the raw block must move.
        let blocker = RawBlock::allocate(&memory, 8).unwrap();

        let record = record.resize(&memory, 64, 4).unwrap();
        assert_eq!(record.size(), 64);
        assert_eq!(record.address() % 4, 0);
        assert_filled(&record, 16);
        record.integrity_check();

        record.into_raw().release(&memory);
        blocker.release(&memory);
        assert_eq!(memory.outstanding(), 0);
    }

    #[test]
    fn resize_with_new_alignment_moves_content_to_aligned_offset() {
        let memory = FakeMemory::new(4096);
        let spacer = RawBlock::allocate(&memory, 1).unwrap();

        let record = heap_record(&memory, 8, 1);
        fill(&record, 8);

        let record = record.resize(&memory, 8, 256).unwrap();
        assert_eq!(record.address() % 256, 0);
        assert_filled(&record, 8);
        record.integrity_check();

        record.into_raw().release(&memory);
        spacer.release(&memory);
    }

    #[test]
    fn resize_shrink_keeps_prefix() {
        let memory = FakeMemory::new(4096);
        let spacer = RawBlock::allocate(&memory, 1).unwrap();

        // Large offset inside the raw block, then shrink to an alignment with no slack.
        let record = heap_record(&memory, 32, 128);
        fill(&record, 32);

        let record = record.resize(&memory, 4, 1).unwrap();
        assert_eq!(record.size(), 4);
        assert_filled(&record, 4);
        record.integrity_check();

        record.into_raw().release(&memory);
        spacer.release(&memory);
    }

    #[test]
    fn resize_failure_returns_record_unchanged() {
        let memory = FakeMemory::new(1024);
        let record = heap_record(&memory, 16, 1);
        fill(&record, 16);
        let address = record.address();

        memory.fail_after(0);
        let (record, error) = record.resize(&memory, 32, 1).unwrap_err();
        memory.stop_failing();

        assert_eq!(error, AllocError::OutOfMemory { requested: 32 });
        assert_eq!(record.address(), address);
        assert_eq!(record.size(), 16);
        assert_filled(&record, 16);

        record.into_raw().release(&memory);
    }

    #[test]
    fn covers_checks_user_span() {
        let memory = FakeMemory::new(1024);
        let record = heap_record(&memory, 16, 1);
        let start = record.address();

        assert!(record.covers(start, 16));
        assert!(record.covers(start + 4, 8));
        assert!(!record.covers(start + 4, 16));
        assert!(!record.covers(start - 1, 1));
        assert!(!record.covers(start, usize::MAX));

        record.into_raw().release(&memory);
    }

    #[test]
    fn rehost_moves_span_inside_raw_block() {
        let memory = FakeMemory::new(1024);
        let spacer = RawBlock::allocate(&memory, 1).unwrap();

        let mut record = heap_record(&memory, 64, 1);
        assert!(record.can_host(32, 16));
        assert!(!record.can_host(65, 1));

        record.rehost(32, 16);
        assert_eq!(record.size(), 32);
        assert_eq!(record.alignment(), 16);
        assert_eq!(record.address() % 16, 0);
        record.integrity_check();

        record.into_raw().release(&memory);
        spacer.release(&memory);
    }
}
