// Real allocation primitive that delegates to the global allocator.
//
// This is a trivial forwarder to system APIs and is excluded from coverage and mutation testing.

use std::alloc::{Layout, alloc, dealloc, realloc};
use std::ptr::NonNull;

use crate::pal::Memory;

/// Allocation primitive backed by the Rust global allocator at byte alignment.
#[derive(Debug, Default)]
pub(crate) struct SystemMemory;

// Trivial forwarder to system APIs - not worth testing.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl Memory for SystemMemory {
    fn allocate(&self, len: usize) -> Option<NonNull<u8>> {
        debug_assert!(len > 0);

        // Fails only if len exceeds isize::MAX, which no allocator could satisfy anyway.
        let layout = Layout::from_size_align(len, 1).ok()?;

        // SAFETY: The layout has a non-zero size, as guaranteed by the trait contract.
        NonNull::new(unsafe { alloc(layout) })
    }

    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_len: usize,
        new_len: usize,
    ) -> Option<NonNull<u8>> {
        debug_assert!(new_len > 0);

        // Validate the target length up front, as realloc() requires it to fit in a layout.
        Layout::from_size_align(new_len, 1).ok()?;

        // SAFETY: This layout was valid when the block was allocated with the same length.
        let old_layout = unsafe { Layout::from_size_align_unchecked(old_len, 1) };

        // SAFETY: The caller guarantees ptr came from allocate()/resize() on this primitive with
        // old_len, and we checked above that new_len forms a valid layout with the same alignment.
        NonNull::new(unsafe { realloc(ptr.as_ptr(), old_layout, new_len) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, len: usize) {
        // SAFETY: This layout was valid when the block was allocated with the same length.
        let layout = unsafe { Layout::from_size_align_unchecked(len, 1) };

        // SAFETY: The caller guarantees ptr came from this primitive with this length
        // and has not been released yet.
        unsafe {
            dealloc(ptr.as_ptr(), layout);
        }
    }
}
