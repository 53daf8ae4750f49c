//! Fake allocation primitive for testing.

use std::alloc::{Layout, alloc, dealloc};
use std::collections::BTreeMap;
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex};

use crate::pal::Memory;

const ERR_POISONED: &str = "FakeMemory state lock should not be poisoned";

/// Alignment of the arena base, so tests can reason about the alignment of handed out blocks.
const ARENA_ALIGN: usize = 4096;

/// Internal state for the fake primitive that can be shared between clones.
#[derive(Debug)]
struct FakeMemoryState {
    base: NonNull<u8>,
    capacity: usize,

    /// Offset -> length of every block that has been handed out and not yet released.
    blocks: BTreeMap<usize, usize>,

    /// If set, this many more requests succeed and every request after that fails.
    successes_remaining: Option<usize>,

    /// If set, every resize moves the block even when it could stay where it is.
    force_move: bool,

    allocate_calls: usize,
    resize_calls: usize,
    release_calls: usize,
}

// SAFETY: The base pointer is owned exclusively by this state and only dereferenced while the
// state mutex is held, so the state can be moved between threads.
unsafe impl Send for FakeMemoryState {}

impl FakeMemoryState {
    fn offset_of(&self, ptr: NonNull<u8>) -> usize {
        (ptr.as_ptr() as usize)
            .checked_sub(self.base.as_ptr() as usize)
            .expect("pointer does not belong to this FakeMemory arena")
    }

    fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset < self.capacity);

        // SAFETY: offset is within the arena allocation, checked above.
        unsafe { self.base.add(offset) }
    }

    /// Consumes one unit of the failure budget. Returns `false` if this request must fail.
    fn admit(&mut self) -> bool {
        match &mut self.successes_remaining {
            None => true,
            Some(0) => false,
            Some(remaining) => {
                *remaining -= 1;
                true
            }
        }
    }

    /// First-fit search over the gaps between live blocks.
    fn find_gap(&self, len: usize) -> Option<usize> {
        let mut cursor = 0;

        for (&offset, &block_len) in &self.blocks {
            if offset - cursor >= len {
                return Some(cursor);
            }

            cursor = offset + block_len;
        }

        (self.capacity - cursor >= len).then_some(cursor)
    }

    /// End of the free space that directly follows the block at `offset`.
    fn free_until(&self, offset: usize) -> usize {
        self.blocks
            .range(offset + 1..)
            .next()
            .map_or(self.capacity, |(&next, _)| next)
    }
}

impl Drop for FakeMemoryState {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity, ARENA_ALIGN)
            .expect("arena layout was valid when allocated");

        // SAFETY: The arena was allocated in FakeMemory::new() with this exact layout.
        unsafe {
            dealloc(self.base.as_ptr(), layout);
        }
    }
}

/// Fake implementation of the allocation primitive for testing.
///
/// Hands out blocks first-fit from a fixed arena, so consecutive allocations are physically
/// adjacent and freed space directly after a block lets that block grow in place. Multiple
/// clones share the same arena, allowing tests to keep a handle for inspection and failure
/// injection after handing a clone to the manager.
#[derive(Clone, Debug)]
pub(crate) struct FakeMemory {
    state: Arc<Mutex<FakeMemoryState>>,
}

impl FakeMemory {
    /// Creates a fake arena of the given capacity in bytes.
    pub(crate) fn new(capacity: usize) -> Self {
        let layout =
            Layout::from_size_align(capacity, ARENA_ALIGN).expect("test arena layout is valid");

        // SAFETY: Tests always request a non-zero capacity.
        let base = NonNull::new(unsafe { alloc(layout) }).expect("test arena allocation failed");

        Self {
            state: Arc::new(Mutex::new(FakeMemoryState {
                base,
                capacity,
                blocks: BTreeMap::new(),
                successes_remaining: None,
                force_move: false,
                allocate_calls: 0,
                resize_calls: 0,
                release_calls: 0,
            })),
        }
    }

    /// Lets the next `count` allocate/resize requests succeed and fails all after that.
    pub(crate) fn fail_after(&self, count: usize) {
        self.state.lock().expect(ERR_POISONED).successes_remaining = Some(count);
    }

    /// Removes any failure injection.
    pub(crate) fn stop_failing(&self) {
        self.state.lock().expect(ERR_POISONED).successes_remaining = None;
    }

    /// Makes every later resize move the block to a different address, as a real allocator may.
    pub(crate) fn force_move_on_resize(&self) {
        self.state.lock().expect(ERR_POISONED).force_move = true;
    }

    /// Lets resizes stay in place again whenever there is room.
    pub(crate) fn resize_in_place_when_possible(&self) {
        self.state.lock().expect(ERR_POISONED).force_move = false;
    }

    /// Number of blocks handed out and not yet released.
    pub(crate) fn outstanding(&self) -> usize {
        self.state.lock().expect(ERR_POISONED).blocks.len()
    }

    /// Number of bytes in blocks handed out and not yet released.
    pub(crate) fn outstanding_bytes(&self) -> usize {
        self.state.lock().expect(ERR_POISONED).blocks.values().sum()
    }

    pub(crate) fn allocate_calls(&self) -> usize {
        self.state.lock().expect(ERR_POISONED).allocate_calls
    }

    pub(crate) fn resize_calls(&self) -> usize {
        self.state.lock().expect(ERR_POISONED).resize_calls
    }

    pub(crate) fn release_calls(&self) -> usize {
        self.state.lock().expect(ERR_POISONED).release_calls
    }
}

impl Memory for FakeMemory {
    fn allocate(&self, len: usize) -> Option<NonNull<u8>> {
        assert!(len > 0, "zero-length allocation requested from FakeMemory");

        let mut state = self.state.lock().expect(ERR_POISONED);
        state.allocate_calls += 1;

        if !state.admit() {
            return None;
        }

        let offset = state.find_gap(len)?;
        state.blocks.insert(offset, len);

        Some(state.ptr_at(offset))
    }

    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_len: usize,
        new_len: usize,
    ) -> Option<NonNull<u8>> {
        assert!(new_len > 0, "zero-length resize requested from FakeMemory");

        let mut state = self.state.lock().expect(ERR_POISONED);
        state.resize_calls += 1;

        let offset = state.offset_of(ptr);
        assert_eq!(
            state.blocks.get(&offset),
            Some(&old_len),
            "resize of a block that is not live with the stated length"
        );

        if !state.admit() {
            return None;
        }

        let fits_in_place = new_len <= old_len || state.free_until(offset) - offset >= new_len;

        if fits_in_place && !state.force_move {
            state.blocks.insert(offset, new_len);
            return Some(ptr);
        }

        // Move: find space elsewhere while the old block is still reserved, then copy.
        let new_offset = state.find_gap(new_len)?;
        let new_ptr = state.ptr_at(new_offset);

        // SAFETY: Both ranges are inside the arena and do not overlap, as the old block was still
        // reserved when the new range was chosen.
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_len.min(new_len));
        }

        state.blocks.remove(&offset);
        state.blocks.insert(new_offset, new_len);

        Some(new_ptr)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, len: usize) {
        let mut state = self.state.lock().expect(ERR_POISONED);
        state.release_calls += 1;

        let offset = state.offset_of(ptr);
        assert_eq!(
            state.blocks.remove(&offset),
            Some(len),
            "release of a block that is not live with the stated length"
        );
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

    #[test]
    fn consecutive_allocations_are_adjacent() {
        let memory = FakeMemory::new(1024);

        let a = memory.allocate(16).unwrap();
        let b = memory.allocate(16).unwrap();

        assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + 16);
        assert_eq!(memory.outstanding(), 2);
        assert_eq!(memory.outstanding_bytes(), 32);

        unsafe {
            memory.release(a, 16);
            memory.release(b, 16);
        }

        assert_eq!(memory.outstanding(), 0);
    }

    #[test]
    fn freed_gap_is_reused_first_fit() {
        let memory = FakeMemory::new(1024);

        let a = memory.allocate(16).unwrap();
        let b = memory.allocate(16).unwrap();

        unsafe { memory.release(a, 16) };

        let c = memory.allocate(8).unwrap();
        assert_eq!(c, a);

        unsafe {
            memory.release(b, 16);
            memory.release(c, 8);
        }
    }

    #[test]
    fn resize_grows_in_place_into_free_space() {
        let memory = FakeMemory::new(1024);

        let a = memory.allocate(16).unwrap();
        let b = memory.allocate(16).unwrap();

        unsafe { memory.release(b, 16) };

        let grown = unsafe { memory.resize(a, 16, 32) }.unwrap();
        assert_eq!(grown, a);

        unsafe { memory.release(grown, 32) };
    }

    #[test]
    fn resize_moves_and_preserves_content() {
        let memory = FakeMemory::new(1024);

        let a = memory.allocate(4).unwrap();
        let b = memory.allocate(4).unwrap();

        unsafe {
            ptr::copy_nonoverlapping([1_u8, 2, 3, 4].as_ptr(), a.as_ptr(), 4);
        }

        let moved = unsafe { memory.resize(a, 4, 64) }.unwrap();
        assert_ne!(moved, a);

        let mut content = [0_u8; 4];
        unsafe {
            ptr::copy_nonoverlapping(moved.as_ptr(), content.as_mut_ptr(), 4);
        }
        assert_eq!(content, [1, 2, 3, 4]);

        unsafe {
            memory.release(b, 4);
            memory.release(moved, 64);
        }
    }

    #[test]
    fn force_move_on_resize_moves_even_with_room_to_grow() {
        let memory = FakeMemory::new(1024);

        let a = memory.allocate(4).unwrap();
        let b = memory.allocate(4).unwrap();

        unsafe {
            ptr::copy_nonoverlapping([5_u8, 6, 7, 8].as_ptr(), a.as_ptr(), 4);
            memory.release(b, 4);
        }

        memory.force_move_on_resize();
        let moved = unsafe { memory.resize(a, 4, 8) }.unwrap();
        assert_ne!(moved, a);

        let mut content = [0_u8; 4];
        unsafe {
            ptr::copy_nonoverlapping(moved.as_ptr(), content.as_mut_ptr(), 4);
        }
        assert_eq!(content, [5, 6, 7, 8]);
        assert_eq!(memory.outstanding_bytes(), 8);

        memory.resize_in_place_when_possible();
        let grown = unsafe { memory.resize(moved, 8, 16) }.unwrap();
        assert_eq!(grown, moved);

        unsafe { memory.release(grown, 16) };
        assert_eq!(memory.outstanding(), 0);
    }

    #[test]
    fn fail_after_fails_subsequent_requests() {
        let memory = FakeMemory::new(1024);
        memory.fail_after(1);

        let a = memory.allocate(8).unwrap();
        assert!(memory.allocate(8).is_none());
        assert!(unsafe { memory.resize(a, 8, 16) }.is_none());

        memory.stop_failing();
        let b = memory.allocate(8).unwrap();

        assert_eq!(memory.allocate_calls(), 3);
        assert_eq!(memory.resize_calls(), 1);

        unsafe {
            memory.release(a, 8);
            memory.release(b, 8);
        }

        assert_eq!(memory.release_calls(), 2);
    }

    #[test]
    fn exhausted_arena_returns_none() {
        let memory = FakeMemory::new(32);

        let a = memory.allocate(32).unwrap();
        assert!(memory.allocate(1).is_none());

        unsafe { memory.release(a, 32) };
    }
}
