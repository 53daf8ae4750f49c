use std::ptr::NonNull;

use crate::pal::Memory;

/// Ownership token for one allocation obtained from the raw allocation primitive.
///
/// This is the only value that may be handed back to the primitive, and it is consumed when
/// that happens. It is deliberately neither `Clone` nor `Copy`: exactly one owner (a registry
/// record or a parked pool slot) is responsible for eventually releasing it.
#[derive(Debug)]
pub(crate) struct RawBlock {
    ptr: NonNull<u8>,
    len: usize,
}

impl RawBlock {
    /// Obtains a new raw block of `len` bytes.
    ///
    /// Returns `None` if the primitive is exhausted.
    pub(crate) fn allocate(memory: &impl Memory, len: usize) -> Option<Self> {
        debug_assert!(len > 0);

        memory.allocate(len).map(|ptr| Self { ptr, len })
    }

    /// Resizes the block, possibly moving it.
    ///
    /// On failure the original block is returned unchanged, still owned by the caller.
    pub(crate) fn resize(self, memory: &impl Memory, new_len: usize) -> Result<Self, Self> {
        debug_assert!(new_len > 0);

        // SAFETY: A RawBlock is only ever constructed from a successful allocate()/resize()
        // on the manager's primitive and is consumed when released, so it is still live here.
        match unsafe { memory.resize(self.ptr, self.len, new_len) } {
            Some(ptr) => Ok(Self { ptr, len: new_len }),
            None => Err(self),
        }
    }

    /// Hands the block back to the primitive.
    pub(crate) fn release(self, memory: &impl Memory) {
        // SAFETY: See resize(). Consuming self guarantees this happens at most once.
        unsafe {
            memory.release(self.ptr, self.len);
        }
    }

    #[must_use]
    pub(crate) fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub(crate) fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Address one past the last byte of the block.
    #[cfg(any(debug_assertions, test))]
    #[must_use]
    pub(crate) fn end_address(&self) -> usize {
        // Cannot overflow because the block exists in the address space.
        self.address().wrapping_add(self.len)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::pal::FakeMemory;

    #[test]
    fn allocate_and_release_round_trip() {
        let memory = FakeMemory::new(256);

        let block = RawBlock::allocate(&memory, 24).unwrap();
        assert_eq!(block.len(), 24);
        assert_eq!(block.end_address(), block.address() + 24);
        assert_eq!(memory.outstanding(), 1);

        block.release(&memory);
        assert_eq!(memory.outstanding(), 0);
    }

    #[test]
    fn failed_resize_returns_original() {
        let memory = FakeMemory::new(256);

        let block = RawBlock::allocate(&memory, 8).unwrap();
        let address = block.address();

        memory.fail_after(0);
        let block = block.resize(&memory, 16).unwrap_err();
        memory.stop_failing();

        assert_eq!(block.address(), address);
        assert_eq!(block.len(), 8);

        let block = block.resize(&memory, 16).unwrap();
        assert_eq!(block.len(), 16);

        block.release(&memory);
        assert_eq!(memory.outstanding(), 0);
    }

    #[test]
    fn exhausted_primitive_yields_none() {
        let memory = FakeMemory::new(16);

        let block = RawBlock::allocate(&memory, 16).unwrap();
        assert!(RawBlock::allocate(&memory, 1).is_none());

        block.release(&memory);
    }
}
