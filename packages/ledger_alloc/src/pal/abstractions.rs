// Raw allocation primitive abstraction for mocking in tests.

use std::fmt::Debug;
use std::ptr::NonNull;

/// A byte-granular allocation primitive with `malloc`/`realloc`/`free` semantics.
///
/// All blocks are obtained at byte alignment; alignment is layered on top by over-allocating.
/// Lengths passed in are always non-zero.
pub(crate) trait Memory: Debug + Send + 'static {
    /// Obtains a new block of `len` bytes, or `None` if the primitive is exhausted.
    fn allocate(&self, len: usize) -> Option<NonNull<u8>>;

    /// Resizes a block, possibly moving it, preserving the first `min(old_len, new_len)` bytes.
    ///
    /// Returns `None` if the primitive is exhausted, in which case the original block is
    /// untouched and still owned by the caller.
    ///
    /// # Safety
    ///
    /// `ptr` must have been obtained from this same primitive with length `old_len` and must
    /// not have been released yet. On success, the old pointer must no longer be used.
    unsafe fn resize(&self, ptr: NonNull<u8>, old_len: usize, new_len: usize)
    -> Option<NonNull<u8>>;

    /// Returns a block to the primitive.
    ///
    /// # Safety
    ///
    /// `ptr` must have been obtained from this same primitive with length `len` and must not
    /// have been released yet.
    unsafe fn release(&self, ptr: NonNull<u8>, len: usize);
}
