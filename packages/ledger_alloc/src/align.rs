//! Alignment arithmetic shared by pools, the front door and the defragmenter.
//!
//! Raw allocations are obtained at byte alignment and over-allocated by `alignment - 1` bytes,
//! which guarantees that an aligned sub-range of the requested size exists somewhere in the
//! first `alignment` bytes of every raw block.

use crate::{AllocError, Result};

/// Validates that `alignment` is a non-zero power of two.
pub(crate) fn validate(alignment: usize) -> Result<()> {
    // is_power_of_two() is false for zero.
    if alignment.is_power_of_two() {
        Ok(())
    } else {
        Err(AllocError::InvalidAlignment { alignment })
    }
}

/// Number of raw bytes needed to guarantee an aligned span of `size` bytes.
///
/// Never returns zero, as the allocation primitive does not hand out empty blocks.
pub(crate) fn padded_len(size: usize, alignment: usize) -> Result<usize> {
    debug_assert!(alignment.is_power_of_two());

    size.checked_add(alignment.wrapping_sub(1))
        .map(|len| len.max(1))
        .ok_or(AllocError::OutOfMemory { requested: size })
}

/// Offset that must be added to `address` to make it a multiple of `alignment`.
#[must_use]
pub(crate) fn offset_to_align(address: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());

    address.wrapping_neg() & alignment.wrapping_sub(1)
}

/// Whether `alignment` satisfies a request for `requested` alignment.
///
/// Both are powers of two, so this is the same as the one being a multiple of the other.
#[must_use]
pub(crate) fn satisfies(alignment: usize, requested: usize) -> bool {
    debug_assert!(alignment.is_power_of_two());
    debug_assert!(requested.is_power_of_two());

    alignment >= requested
}
