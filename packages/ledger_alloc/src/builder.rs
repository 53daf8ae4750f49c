use std::cell::Cell;
use std::marker::PhantomData;

use crate::pal::MemoryFacade;
use crate::{DropPolicy, Manager, ReleasePolicy, Result};

/// A pool requested through the builder, created when the manager is built.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct PoolSpec {
    slot_size: usize,
    slot_count: usize,
    alignment: usize,
}

/// Builder for creating an instance of [`Manager`].
///
/// All settings are optional. Pools declared with [`pool()`](Self::pool) are created in
/// declaration order when [`build()`](Self::build) is called, which is also the order in which
/// they are consulted when servicing allocation requests.
///
/// # Examples
///
/// ```
/// use ledger_alloc::{DropPolicy, Manager, ReleasePolicy};
///
/// let mut manager = Manager::builder()
///     .pool(32, 4, 8)
///     .pool(256, 16, 64)
///     .drop_policy(DropPolicy::MustNotReleaseBlocks)
///     .release_policy(ReleasePolicy::Deferred)
///     .build()?;
///
/// assert_eq!(manager.pool_count(), 2);
///
/// let ptr = manager.allocate(24, 8)?;
/// manager.release(ptr)?;
/// # Ok::<(), ledger_alloc::AllocError>(())
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing manager configuration to happen on different threads than where it is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[derive(Debug)]
#[must_use]
pub struct ManagerBuilder {
    drop_policy: DropPolicy,
    release_policy: ReleasePolicy,
    pools: Vec<PoolSpec>,
    memory: MemoryFacade,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl ManagerBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            drop_policy: DropPolicy::default(),
            release_policy: ReleasePolicy::default(),
            pools: Vec::new(),
            memory: MemoryFacade::system(),
            _not_sync: PhantomData,
        }
    }

    /// Sets the [drop policy][DropPolicy] for the manager. This governs how to treat
    /// remaining live blocks when the manager is torn down.
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Sets the [release policy][ReleasePolicy] for the manager. This governs what happens
    /// to heap blocks whose reference count drops to zero.
    #[inline]
    pub fn release_policy(mut self, policy: ReleasePolicy) -> Self {
        self.release_policy = policy;
        self
    }

    /// Declares a pool of `slot_count` pre-allocated slots of `slot_size` bytes aligned to
    /// `alignment`.
    ///
    /// The alignment is validated when the manager is built.
    #[inline]
    pub fn pool(mut self, slot_size: usize, slot_count: usize, alignment: usize) -> Self {
        self.pools.push(PoolSpec {
            slot_size,
            slot_count,
            alignment,
        });
        self
    }

    /// Replaces the raw allocation primitive.
    #[cfg(test)]
    pub(crate) fn memory(mut self, memory: MemoryFacade) -> Self {
        self.memory = memory;
        self
    }

    /// Builds the manager with the specified configuration, creating all declared pools.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by pool creation:
    /// [`InvalidAlignment`][crate::AllocError::InvalidAlignment] or
    /// [`OutOfMemory`][crate::AllocError::OutOfMemory]. Pools created before the failing one
    /// are released again.
    pub fn build(self) -> Result<Manager> {
        let mut manager = Manager::new_inner(self.memory, self.drop_policy, self.release_policy);

        for spec in self.pools {
            manager.create_pool(spec.slot_size, spec.slot_count, spec.alignment)?;
        }

        Ok(manager)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::AllocError;
    use crate::pal::FakeMemory;

    assert_impl_all!(ManagerBuilder: Send, std::fmt::Debug);
    assert_not_impl_any!(ManagerBuilder: Sync);

    #[test]
    fn builder_new_creates_default_state() {
        let builder = ManagerBuilder::new();
        assert_eq!(builder.drop_policy, DropPolicy::default());
        assert_eq!(builder.release_policy, ReleasePolicy::default());
        assert!(builder.pools.is_empty());
    }

    #[test]
    fn pools_are_recorded_in_declaration_order() {
        let builder = ManagerBuilder::new().pool(16, 2, 8).pool(64, 1, 32);

        assert_eq!(
            builder.pools,
            vec![
                PoolSpec {
                    slot_size: 16,
                    slot_count: 2,
                    alignment: 8
                },
                PoolSpec {
                    slot_size: 64,
                    slot_count: 1,
                    alignment: 32
                },
            ]
        );
    }

    #[test]
    fn policies_are_applied() {
        let manager = ManagerBuilder::new()
            .drop_policy(DropPolicy::MustNotReleaseBlocks)
            .release_policy(ReleasePolicy::Deferred)
            .build()
            .unwrap();

        assert_eq!(manager.drop_policy(), DropPolicy::MustNotReleaseBlocks);
        assert_eq!(manager.release_policy(), ReleasePolicy::Deferred);
    }

    #[test]
    fn build_creates_declared_pools() {
        let manager = ManagerBuilder::new()
            .pool(32, 4, 8)
            .pool(128, 2, 16)
            .build()
            .unwrap();

        let snapshot = manager.describe();
        assert_eq!(snapshot.pools.len(), 2);
        assert_eq!(snapshot.pools[0].slot_size, 32);
        assert_eq!(snapshot.pools[1].capacity, 2);
    }

    #[test]
    fn build_with_invalid_pool_fails() {
        let result = ManagerBuilder::new().pool(32, 4, 3).build();

        assert_eq!(
            result.unwrap_err(),
            AllocError::InvalidAlignment { alignment: 3 }
        );
    }

    #[test]
    fn build_failure_releases_earlier_pools() {
        let memory = FakeMemory::new(4096);

        let result = ManagerBuilder::new()
            .memory(MemoryFacade::from_fake(memory.clone()))
            .pool(16, 4, 8)
            .pool(16, 4, 0)
            .build();

        assert_eq!(
            result.unwrap_err(),
            AllocError::InvalidAlignment { alignment: 0 }
        );
        assert_eq!(memory.allocate_calls(), 4);
        assert_eq!(memory.outstanding(), 0);
    }
}
