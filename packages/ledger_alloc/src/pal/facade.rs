// Facade that dispatches to either the real allocation primitive or a fake in tests.

use std::ptr::NonNull;

#[cfg(test)]
use crate::pal::FakeMemory;
use crate::pal::{Memory, SystemMemory};

/// Facade over the raw allocation primitive, dispatching to real or fake implementation.
///
/// In production, this always uses `SystemMemory`. In tests, it can also wrap a `FakeMemory`
/// for controlled scenarios (adjacent blocks, injected failures, leak accounting).
#[derive(Clone)]
pub(crate) enum MemoryFacade {
    /// Real allocation primitive.
    System(&'static SystemMemory),

    /// Fake arena for testing.
    #[cfg(test)]
    Fake(FakeMemory),
}

// Debug implementations have no API contract to test.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl std::fmt::Debug for MemoryFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System(_) => f.debug_struct("MemoryFacade::System").finish(),
            #[cfg(test)]
            Self::Fake(_) => f.debug_struct("MemoryFacade::Fake").finish(),
        }
    }
}

/// Static instance of the real primitive for production use.
static SYSTEM_MEMORY: SystemMemory = SystemMemory;

// Facade types are trivial pass-through layers - not worth testing.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl MemoryFacade {
    /// Creates a facade using the real allocation primitive.
    pub(crate) const fn system() -> Self {
        Self::System(&SYSTEM_MEMORY)
    }

    /// Creates a facade wrapping a fake arena (test builds only).
    #[cfg(test)]
    pub(crate) fn from_fake(fake: FakeMemory) -> Self {
        Self::Fake(fake)
    }
}

impl Default for MemoryFacade {
    fn default() -> Self {
        Self::system()
    }
}

// Facade types are trivial pass-through layers - not worth testing.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl Memory for MemoryFacade {
    fn allocate(&self, len: usize) -> Option<NonNull<u8>> {
        match self {
            Self::System(memory) => memory.allocate(len),
            #[cfg(test)]
            Self::Fake(fake) => fake.allocate(len),
        }
    }

    unsafe fn resize(
        &self,
        ptr: NonNull<u8>,
        old_len: usize,
        new_len: usize,
    ) -> Option<NonNull<u8>> {
        match self {
            // SAFETY: Forwarding safety requirements to the caller.
            Self::System(memory) => unsafe { memory.resize(ptr, old_len, new_len) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to the caller.
            Self::Fake(fake) => unsafe { fake.resize(ptr, old_len, new_len) },
        }
    }

    unsafe fn release(&self, ptr: NonNull<u8>, len: usize) {
        match self {
            // SAFETY: Forwarding safety requirements to the caller.
            Self::System(memory) => unsafe { memory.release(ptr, len) },
            #[cfg(test)]
            // SAFETY: Forwarding safety requirements to the caller.
            Self::Fake(fake) => unsafe { fake.release(ptr, len) },
        }
    }
}
