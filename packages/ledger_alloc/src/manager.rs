use std::ptr::{self, NonNull};
use std::thread;

use tracing::{debug, trace, warn};

use crate::pal::MemoryFacade;
use crate::{
    AllocError, AllocationRecord, BlockInfo, BlockOrigin, BlockRegistry, BlockState,
    DefragReport, DropPolicy, ManagerBuilder, Pool, PoolId, PoolInfo, RawBlock, ReleasePolicy,
    Result, Snapshot, align, defrag,
};

/// A reference-counting memory manager with fixed-size slot pools.
///
/// Every block handed out by the manager has a reference count that starts at one. The block
/// stays valid until [`release()`](Self::release) has been called once more than
/// [`retain()`](Self::retain), after which its memory returns to the pool it came from or to
/// the raw allocation primitive (see [`ReleasePolicy`]).
///
/// Allocation requests are first offered to pools in creation order (first-fit). A request
/// that no pool can serve is satisfied by a dedicated, over-allocated raw block.
///
/// # Example
///
/// ```rust
/// use ledger_alloc::Manager;
///
/// let mut manager = Manager::new();
/// manager.create_pool(32, 4, 8)?;
///
/// let ptr = manager.allocate(24, 8)?;
/// assert_eq!(ptr.as_ptr() as usize % 8, 0);
///
/// // SAFETY: The block is live and at least 24 bytes long.
/// unsafe { ptr.as_ptr().write_bytes(0xAB, 24) };
///
/// manager.retain(ptr)?;
/// manager.release(ptr)?; // Still live.
/// manager.release(ptr)?; // Returned to the pool.
///
/// assert!(manager.is_empty());
/// # Ok::<(), ledger_alloc::AllocError>(())
/// ```
///
/// # Out of band access
///
/// The manager never creates references to the memory it hands out. Callers access blocks
/// through the returned pointers from unsafe code and are responsible for not using a pointer
/// after the block behind it has been released, reallocated to a new address or relocated by
/// [`defragment()`](Self::defragment).
///
/// # Thread safety
///
/// The manager is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]). For shared use
/// across threads, wrap it in a [`SharedManager`][crate::SharedManager].
#[derive(Debug)]
pub struct Manager {
    registry: BlockRegistry,

    /// Pools in creation order. Pools are never removed before teardown, so the index of a
    /// pool in this list is its `PoolId`.
    pools: Vec<Pool>,

    memory: MemoryFacade,

    drop_policy: DropPolicy,

    release_policy: ReleasePolicy,
}

/// Summary of what [`Manager::destroy()`] released.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct TeardownReport {
    /// Heap blocks whose raw allocation was released, live and vacant.
    pub blocks_released: usize,

    /// Pool slots whose raw allocation was released, free and in use.
    pub slots_released: usize,

    /// Blocks (heap or pool) that still had references when the manager was torn down.
    pub live_blocks: usize,
}

impl Manager {
    /// Creates a manager with default configuration and no pools.
    ///
    /// For custom configuration, use [`Manager::builder()`].
    #[must_use]
    pub fn new() -> Self {
        Self::new_inner(
            MemoryFacade::system(),
            DropPolicy::default(),
            ReleasePolicy::default(),
        )
    }

    /// Creates a builder for configuring and constructing a [`Manager`].
    #[inline]
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    #[must_use]
    pub(crate) fn new_inner(
        memory: MemoryFacade,
        drop_policy: DropPolicy,
        release_policy: ReleasePolicy,
    ) -> Self {
        Self {
            registry: BlockRegistry::new(),
            pools: Vec::new(),
            memory,
            drop_policy,
            release_policy,
        }
    }

    /// Creates a pool of `slot_count` pre-allocated slots of `slot_size` bytes, each aligned
    /// to `alignment`.
    ///
    /// Pools are consulted in creation order, so pools created earlier take precedence.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidAlignment`] if `alignment` is zero or not a power of two, and
    /// [`AllocError::OutOfMemory`] if any slot cannot be allocated. Nothing is allocated
    /// when this returns an error.
    pub fn create_pool(
        &mut self,
        slot_size: usize,
        slot_count: usize,
        alignment: usize,
    ) -> Result<PoolId> {
        let id = PoolId::from_index(self.pools.len());

        let pool = Pool::create(id, slot_size, slot_count, alignment, &self.memory)
            .inspect_err(|e| {
                debug!(slot_size, slot_count, alignment, error = %e, "pool creation failed");
            })?;

        #[cfg(debug_assertions)]
        pool.integrity_check();

        debug!(pool = %id, slot_size, slot_count, alignment, "created pool");

        self.pools.push(pool);

        Ok(id)
    }

    /// Allocates a block of at least `size` bytes aligned to `alignment`, with a reference
    /// count of one.
    ///
    /// The contents of the block are unspecified.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidAlignment`] if `alignment` is zero or not a power of two, and
    /// [`AllocError::OutOfMemory`] if the raw allocation primitive cannot satisfy the request.
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        align::validate(alignment)?;

        let mut record = self
            .obtain(size, alignment)
            .inspect_err(|e| warn!(size, alignment, error = %e, "allocation failed"))?;

        record.set_ref_count(1);
        let ptr = self.registry.register(record);

        trace!(size, alignment, ?ptr, "allocated block");

        #[cfg(debug_assertions)]
        self.check_block(ptr.as_ptr() as usize);

        Ok(ptr)
    }

    /// Finds memory for a new block: a pool slot, then (deferred release only) a vacant heap
    /// block, then a fresh raw allocation. The returned record is unreferenced.
    fn obtain(&mut self, size: usize, alignment: usize) -> Result<AllocationRecord> {
        if let Some(slot) = self
            .pools
            .iter_mut()
            .find_map(|pool| pool.try_take(size, alignment))
        {
            return Ok(slot);
        }

        if self.release_policy == ReleasePolicy::Deferred {
            if let Some(mut vacant) = self.registry.take_vacant_fitting(size, alignment) {
                vacant.rehost(size, alignment);
                return Ok(vacant);
            }
        }

        let len = align::padded_len(size, alignment)?;

        let raw = RawBlock::allocate(&self.memory, len)
            .ok_or(AllocError::OutOfMemory { requested: size })?;

        Ok(AllocationRecord::place(raw, size, alignment, BlockOrigin::Heap))
    }

    /// Adds a reference to a live block.
    ///
    /// # Errors
    ///
    /// [`AllocError::UnknownPointer`] if `ptr` is not a live block of this manager.
    ///
    /// # Panics
    ///
    /// Panics if the reference count overflows.
    pub fn retain(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let address = ptr.as_ptr() as usize;

        let Some(record) = self.registry.find_mut(address) else {
            warn!(?ptr, "retain of a pointer that is not a live block");
            return Err(AllocError::UnknownPointer { address });
        };

        let ref_count = record.retain();
        trace!(?ptr, ref_count, "retained block");

        Ok(())
    }

    /// Drops a reference to a live block, releasing the block when no references remain.
    ///
    /// A released pool slot returns to its pool. A released heap block has its raw allocation
    /// released, or is parked as vacant under [`ReleasePolicy::Deferred`].
    ///
    /// # Errors
    ///
    /// [`AllocError::DoubleRelease`] if the block at `ptr` has already been released, and
    /// [`AllocError::UnknownPointer`] if `ptr` was never handed out by this manager.
    pub fn release(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let address = ptr.as_ptr() as usize;

        let remaining = match self.registry.find_mut(address) {
            Some(record) => record.release(),
            None => return Err(self.not_releasable(address)),
        };

        trace!(?ptr, ref_count = remaining, "released reference");

        if remaining == 0 {
            if let Some(record) = self.registry.remove(address) {
                self.dispose(record);
            }
        }

        #[cfg(debug_assertions)]
        self.check_block(address);

        Ok(())
    }

    /// Classifies a failed release.
    fn not_releasable(&self, address: usize) -> AllocError {
        if self.registry.is_retired(address) || self.registry.is_vacant(address) {
            warn!(address = %format_args!("{address:#x}"), "block was already released");
            AllocError::DoubleRelease { address }
        } else {
            warn!(
                address = %format_args!("{address:#x}"),
                "release of a pointer this manager never handed out"
            );
            AllocError::UnknownPointer { address }
        }
    }

    /// Routes a block that has just lost its last reference to wherever its memory belongs.
    fn dispose(&mut self, mut record: AllocationRecord) {
        record.set_ref_count(0);
        self.registry.retire(record.address());

        match record.origin() {
            BlockOrigin::Pool(id) => {
                let pool = self
                    .pools
                    .get_mut(id.index())
                    .expect("registered block refers to a pool this manager never created");

                trace!(ptr = ?record.user_pointer(), pool = %id, "returned slot to pool");
                pool.give_back(record);
            }
            BlockOrigin::Heap => match self.release_policy {
                ReleasePolicy::Immediate => {
                    trace!(ptr = ?record.user_pointer(), "released block");
                    record.into_raw().release(&self.memory);
                }
                ReleasePolicy::Deferred => {
                    trace!(ptr = ?record.user_pointer(), "parked block as vacant");
                    self.registry.park_vacant(record);
                }
            },
        }
    }

    /// Resizes a block to `new_size` bytes aligned to `alignment`.
    ///
    /// * `ptr == None` behaves as [`allocate()`](Self::allocate).
    /// * `new_size == 0` releases the block completely, regardless of its reference count,
    ///   and returns `Ok(None)`.
    /// * Otherwise the first `min(old_size, new_size)` bytes are preserved and the returned
    ///   pointer replaces `ptr`, which may now be dangling. The reference count is unchanged.
    ///
    /// # Errors
    ///
    /// [`AllocError::UnknownPointer`] if `ptr` is not a live block of this manager,
    /// [`AllocError::PoolBlockNotResizable`] if it is a pool slot,
    /// [`AllocError::InvalidAlignment`] for a bad alignment and [`AllocError::OutOfMemory`] if
    /// the raw allocation cannot be resized. On error the original block is left untouched.
    pub fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        alignment: usize,
    ) -> Result<Option<NonNull<u8>>> {
        let Some(ptr) = ptr else {
            return self.allocate(new_size, alignment).map(Some);
        };

        let address = ptr.as_ptr() as usize;

        let Some(origin) = self.registry.find(address).map(AllocationRecord::origin) else {
            warn!(?ptr, new_size, "reallocation of a pointer that is not a live block");
            return Err(AllocError::UnknownPointer { address });
        };

        if new_size == 0 {
            if let Some(record) = self.registry.remove(address) {
                self.dispose(record);
            }

            trace!(?ptr, "reallocation to zero bytes released the block");

            #[cfg(debug_assertions)]
            self.check_block(address);

            return Ok(None);
        }

        if let BlockOrigin::Pool(pool) = origin {
            return Err(AllocError::PoolBlockNotResizable { address, pool });
        }

        align::validate(alignment)?;

        let Some(record) = self.registry.remove(address) else {
            return Err(AllocError::UnknownPointer { address });
        };

        match record.resize(&self.memory, new_size, alignment) {
            Ok(record) => {
                let new_ptr = self.registry.register(record);
                trace!(?ptr, new_size, alignment, ?new_ptr, "reallocated block");

                #[cfg(debug_assertions)]
                self.check_block(new_ptr.as_ptr() as usize);

                Ok(Some(new_ptr))
            }
            Err((record, e)) => {
                warn!(?ptr, new_size, alignment, error = %e, "reallocation failed");
                self.registry.register(record);

                #[cfg(debug_assertions)]
                self.check_block(address);

                Err(e)
            }
        }
    }

    /// Allocates a new block of `size` bytes (byte alignment) and copies `size` bytes
    /// starting at `src` into it.
    ///
    /// `src` may point into the middle of a live block, as long as `size` bytes starting at
    /// `src` lie within that block.
    ///
    /// # Errors
    ///
    /// [`AllocError::UnknownPointer`] if `[src, src + size)` is not within a live block of
    /// this manager, and [`AllocError::OutOfMemory`] if the new block cannot be allocated.
    pub fn copy(&mut self, src: NonNull<u8>, size: usize) -> Result<NonNull<u8>> {
        let address = src.as_ptr() as usize;

        if self.registry.containing(address, size).is_none() {
            warn!(?src, size, "copy source is not within a live block");
            return Err(AllocError::UnknownPointer { address });
        }

        let dest = self.allocate(size, 1)?;

        // SAFETY: The source range lies within a live block owned by this manager (checked
        // above) and the destination is a freshly allocated block of at least `size` bytes.
        // Live blocks never overlap and allocating never moves an existing block.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), dest.as_ptr(), size);
        }

        trace!(?src, size, ?dest, "copied block");

        Ok(dest)
    }

    /// Coalesces physically adjacent heap blocks where the second block is vacant.
    ///
    /// Only vacant blocks are ever absorbed, so this only has an effect under
    /// [`ReleasePolicy::Deferred`]. A live block that absorbs a vacant neighbor keeps its
    /// contents but may move; every such move is listed in
    /// [`DefragReport::relocations`] and the old pointer must no longer be used.
    pub fn defragment(&mut self) -> DefragReport {
        let report = defrag::coalesce(&mut self.registry, &self.memory);

        debug!(
            merges_performed = report.merges_performed,
            relocations = report.relocations.len(),
            "defragmented heap blocks"
        );

        // Coalescing already visits every heap block, so a full sweep costs no more than
        // the pass itself.
        #[cfg(debug_assertions)]
        self.integrity_check();

        report
    }

    /// Releases the raw allocations of all vacant heap blocks, returning how many there were.
    pub fn purge_vacant(&mut self) -> usize {
        let vacant = self.registry.drain_vacant();
        let count = vacant.len();

        for record in vacant {
            record.into_raw().release(&self.memory);
        }

        debug!(count, "purged vacant blocks");

        count
    }

    /// Returns a point-in-time description of all blocks and pools.
    #[must_use]
    pub fn describe(&self) -> Snapshot {
        let mut blocks = self
            .registry
            .live()
            .map(|record| block_info(record, BlockState::Live))
            .chain(
                self.registry
                    .vacant()
                    .map(|record| block_info(record, BlockState::Vacant)),
            )
            .collect::<Vec<_>>();

        blocks.sort_unstable_by_key(|block| block.address);

        let pools = self
            .pools
            .iter()
            .map(|pool| PoolInfo {
                id: pool.id(),
                slot_size: pool.slot_size(),
                slot_alignment: pool.slot_alignment(),
                capacity: pool.capacity(),
                free: pool.free_len(),
            })
            .collect();

        Snapshot { blocks, pools }
    }

    /// The current reference count of the live block at `ptr`.
    #[must_use]
    pub fn ref_count(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.registry
            .find(ptr.as_ptr() as usize)
            .map(AllocationRecord::ref_count)
    }

    /// The size requested for the live block at `ptr`.
    #[must_use]
    pub fn size_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.registry
            .find(ptr.as_ptr() as usize)
            .map(AllocationRecord::size)
    }

    /// The number of live blocks, including pool slots in use.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Whether there are no live blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// The number of vacant heap blocks retained under [`ReleasePolicy::Deferred`].
    #[must_use]
    pub fn vacant_len(&self) -> usize {
        self.registry.vacant_len()
    }

    /// The number of pools created so far.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// How remaining live blocks are treated at teardown.
    #[must_use]
    pub fn drop_policy(&self) -> DropPolicy {
        self.drop_policy
    }

    /// What happens to heap blocks whose reference count drops to zero.
    #[must_use]
    pub fn release_policy(&self) -> ReleasePolicy {
        self.release_policy
    }

    /// Tears down the manager, releasing every pool slot and every block's raw allocation
    /// regardless of outstanding reference counts.
    ///
    /// Dropping the manager does the same; this method additionally reports what was
    /// released.
    ///
    /// # Panics
    ///
    /// Panics if live blocks remain and the drop policy is
    /// [`DropPolicy::MustNotReleaseBlocks`]. All memory is released before panicking.
    pub fn destroy(mut self) -> TeardownReport {
        self.teardown()
    }

    fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport {
            live_blocks: self.registry.len(),
            ..TeardownReport::default()
        };

        for record in self.registry.drain().collect::<Vec<_>>() {
            match record.origin() {
                BlockOrigin::Heap => {
                    report.blocks_released = report.blocks_released.wrapping_add(1);
                }
                BlockOrigin::Pool(id) => {
                    assert!(
                        id.index() < self.pools.len(),
                        "registry corrupted: block {:#x} refers to nonexistent pool {id}",
                        record.address()
                    );
                    report.slots_released = report.slots_released.wrapping_add(1);
                }
            }

            record.into_raw().release(&self.memory);
        }

        for mut pool in self.pools.drain(..) {
            report.slots_released = report
                .slots_released
                .wrapping_add(pool.release_free_slots(&self.memory));
        }

        if report.live_blocks > 0 {
            warn!(
                live_blocks = report.live_blocks,
                "manager torn down with live blocks still referenced"
            );
        }

        debug!(
            blocks_released = report.blocks_released,
            slots_released = report.slots_released,
            "manager torn down"
        );

        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if !thread::panicking() && self.drop_policy == DropPolicy::MustNotReleaseBlocks {
            assert!(
                report.live_blocks == 0,
                "manager torn down with {} live blocks - this is forbidden by DropPolicy::MustNotReleaseBlocks",
                report.live_blocks
            );
        }

        report
    }

    /// Verifies the invariants of the block at `address` after an operation touched it.
    ///
    /// Only the one block and the pool it came from are inspected, so this stays constant
    /// time no matter how many blocks are live.
    #[cfg(debug_assertions)]
    #[cfg_attr(test, mutants::skip)] // Only ever asserts; mutations cannot be observed.
    fn check_block(&self, address: usize) {
        self.registry.check_address(address);

        let origin = self.registry.find(address).map(AllocationRecord::origin);

        if let Some(BlockOrigin::Pool(id)) = origin {
            let pool = self
                .pools
                .get(id.index())
                .expect("live block refers to a pool this manager never created");

            // At least this slot is out of the pool.
            assert!(pool.free_len() < pool.capacity());
        }
    }

    /// Verifies the cross-structure invariants of the manager.
    ///
    /// This sweeps every block and every pool slot. Operations that touch a single block only
    /// check that block.
    #[cfg(any(debug_assertions, test))]
    #[cfg_attr(test, mutants::skip)] // Only ever asserts; mutations cannot be observed.
    fn integrity_check(&self) {
        self.registry.integrity_check();

        let mut slots_in_use = vec![0_usize; self.pools.len()];

        for record in self.registry.live() {
            if let BlockOrigin::Pool(id) = record.origin() {
                let count = slots_in_use
                    .get_mut(id.index())
                    .expect("live block refers to a pool this manager never created");
                *count = count.wrapping_add(1);
            }
        }

        for (index, (pool, in_use)) in self.pools.iter().zip(slots_in_use).enumerate() {
            assert_eq!(pool.id().index(), index);
            assert_eq!(pool.free_len().wrapping_add(in_use), pool.capacity());
            pool.integrity_check();
        }
    }
}

fn block_info(record: &AllocationRecord, state: BlockState) -> BlockInfo {
    BlockInfo {
        address: record.address(),
        size: record.size(),
        alignment: record.alignment(),
        ref_count: record.ref_count(),
        origin: record.origin(),
        state,
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        // Nothing left to release if destroy() already ran.
        if self.registry.is_empty() && self.registry.vacant_len() == 0 && self.pools.is_empty() {
            return;
        }

        self.teardown();
    }
}

// SAFETY: The manager exclusively owns every raw block it tracks and holds no thread-specific
// state; the pointers it stores are only dereferenced through &mut self methods. The memory
// itself is plain bytes, so moving ownership of it to another thread is sound.
unsafe impl Send for Manager {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use tracing::span::{Attributes, Id, Record};
    use tracing::{Event, Level, Metadata, Subscriber};

    use super::*;
    use crate::pal::FakeMemory;

    assert_impl_all!(Manager: Send, std::fmt::Debug);
    assert_not_impl_any!(Manager: Sync);

    fn fake_manager(release_policy: ReleasePolicy) -> (Manager, FakeMemory) {
        let memory = FakeMemory::new(64 * 1024);

        let manager = Manager::builder()
            .memory(MemoryFacade::from_fake(memory.clone()))
            .release_policy(release_policy)
            .build()
            .unwrap();

        (manager, memory)
    }

    /// Counts `warn` events emitted on the thread it is installed on.
    struct WarningCounter {
        warnings: Arc<AtomicUsize>,
    }

    impl Subscriber for WarningCounter {
        fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
            true
        }

        fn new_span(&self, _span: &Attributes<'_>) -> Id {
            Id::from_u64(1)
        }

        fn record(&self, _span: &Id, _values: &Record<'_>) {}

        fn record_follows_from(&self, _span: &Id, _follows: &Id) {}

        fn event(&self, event: &Event<'_>) {
            if *event.metadata().level() == Level::WARN {
                self.warnings.fetch_add(1, Ordering::Relaxed);
            }
        }

        fn enter(&self, _span: &Id) {}

        fn exit(&self, _span: &Id) {}
    }

    fn fill(ptr: NonNull<u8>, len: usize, seed: u8) {
        for i in 0..len {
            unsafe { ptr.add(i).write(seed.wrapping_add(i as u8)) };
        }
    }

    fn read(ptr: NonNull<u8>, len: usize) -> Vec<u8> {
        (0..len).map(|i| unsafe { ptr.add(i).read() }).collect()
    }

    #[test]
    fn allocate_respects_alignment() {
        let mut manager = Manager::new();

        for shift in 0..12 {
            let alignment = 1_usize << shift;
            let ptr = manager.allocate(24, alignment).unwrap();

            assert_eq!(ptr.as_ptr() as usize % alignment, 0);
            fill(ptr, 24, 0);
        }

        assert_eq!(manager.len(), 12);
    }

    #[test]
    fn allocate_rejects_invalid_alignment() {
        let mut manager = Manager::new();

        assert_eq!(
            manager.allocate(8, 0),
            Err(AllocError::InvalidAlignment { alignment: 0 })
        );
        assert_eq!(
            manager.allocate(8, 6),
            Err(AllocError::InvalidAlignment { alignment: 6 })
        );
        assert!(manager.is_empty());
    }

    #[test]
    fn allocate_out_of_memory() {
        let (mut manager, memory) = fake_manager(ReleasePolicy::Immediate);
        memory.fail_after(0);

        assert_eq!(
            manager.allocate(40, 8),
            Err(AllocError::OutOfMemory { requested: 40 })
        );
        assert!(manager.is_empty());
    }

    #[test]
    fn zero_sized_allocations_get_distinct_addresses() {
        let (mut manager, memory) = fake_manager(ReleasePolicy::Immediate);

        let a = manager.allocate(0, 1).unwrap();
        let b = manager.allocate(0, 1).unwrap();

        assert_ne!(a, b);
        assert_eq!(memory.outstanding(), 2);
    }

    #[test]
    fn retain_then_release_keeps_block_live() {
        let (mut manager, memory) = fake_manager(ReleasePolicy::Immediate);

        let ptr = manager.allocate(40, 8).unwrap();
        manager.retain(ptr).unwrap();
        assert_eq!(manager.ref_count(ptr), Some(2));

        manager.release(ptr).unwrap();
        assert_eq!(manager.ref_count(ptr), Some(1));
        assert_eq!(memory.outstanding(), 1);
    }

    #[test]
    fn release_sequence_ends_in_double_release() {
        let (mut manager, memory) = fake_manager(ReleasePolicy::Immediate);

        let ptr = manager.allocate(40, 8).unwrap();
        manager.retain(ptr).unwrap();

        manager.release(ptr).unwrap();
        assert_eq!(memory.release_calls(), 0);

        manager.release(ptr).unwrap();
        assert_eq!(memory.release_calls(), 1);
        assert_eq!(memory.outstanding(), 0);

        assert_eq!(
            manager.release(ptr),
            Err(AllocError::DoubleRelease {
                address: ptr.as_ptr() as usize
            })
        );
        assert_eq!(memory.release_calls(), 1);
    }

    #[test]
    fn double_release_emits_one_warning() {
        let warnings = Arc::new(AtomicUsize::new(0));
        let subscriber = WarningCounter {
            warnings: Arc::clone(&warnings),
        };

        tracing::subscriber::with_default(subscriber, || {
            let mut manager = Manager::new();

            let ptr = manager.allocate(8, 8).unwrap();
            manager.release(ptr).unwrap();
            assert!(manager.release(ptr).is_err());
        });

        assert_eq!(warnings.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn release_of_foreign_pointer_is_unknown() {
        let mut manager = Manager::new();
        let mut local = 0_u8;
        let ptr = NonNull::from(&mut local);

        assert_eq!(
            manager.release(ptr),
            Err(AllocError::UnknownPointer {
                address: ptr.as_ptr() as usize
            })
        );
        assert_eq!(
            manager.retain(ptr),
            Err(AllocError::UnknownPointer {
                address: ptr.as_ptr() as usize
            })
        );
    }

    #[test]
    fn reissued_address_is_no_longer_a_double_release() {
        let (mut manager, _memory) = fake_manager(ReleasePolicy::Immediate);

        let first = manager.allocate(16, 1).unwrap();
        manager.release(first).unwrap();

        // The fake arena reuses the gap, so the same address is handed out again.
        let second = manager.allocate(16, 1).unwrap();
        assert_eq!(first, second);

        manager.release(second).unwrap();
        assert!(matches!(
            manager.release(second),
            Err(AllocError::DoubleRelease { .. })
        ));
    }

    #[test]
    fn pool_scenario_falls_back_to_heap_when_exhausted() {
        let (mut manager, memory) = fake_manager(ReleasePolicy::Immediate);
        manager.create_pool(32, 4, 8).unwrap();
        assert_eq!(memory.outstanding(), 4);

        let pool_slots = manager
            .describe()
            .pools
            .first()
            .map(|pool| pool.free)
            .unwrap();
        assert_eq!(pool_slots, 4);

        let from_pool = (0..4)
            .map(|_| manager.allocate(32, 8).unwrap())
            .collect::<Vec<_>>();

        let distinct = from_pool.iter().collect::<HashSet<_>>();
        assert_eq!(distinct.len(), 4);

        for ptr in &from_pool {
            assert_eq!(ptr.as_ptr() as usize % 8, 0);
        }

        // No raw allocation happened while the pool had capacity.
        assert_eq!(memory.allocate_calls(), 4);

        let from_heap = manager.allocate(32, 8).unwrap();
        assert!(!from_pool.contains(&from_heap));
        assert_eq!(memory.allocate_calls(), 5);

        let snapshot = manager.describe();
        assert_eq!(
            snapshot.block(from_heap.as_ptr() as usize).unwrap().origin,
            BlockOrigin::Heap
        );
        assert_eq!(snapshot.pools[0].free, 0);

        for ptr in from_pool.iter().chain([&from_heap]) {
            manager.release(*ptr).unwrap();
        }

        assert_eq!(manager.describe().pools[0].free, 4);
        assert_eq!(memory.outstanding(), 4);
        assert_eq!(memory.release_calls(), 1);
    }

    #[test]
    fn pool_round_trip_reuses_same_addresses() {
        let (mut manager, memory) = fake_manager(ReleasePolicy::Immediate);
        manager.create_pool(64, 3, 16).unwrap();

        let first_round = (0..3)
            .map(|_| manager.allocate(48, 16).unwrap())
            .collect::<HashSet<_>>();

        for ptr in &first_round {
            manager.release(*ptr).unwrap();
        }

        let second_round = (0..3)
            .map(|_| manager.allocate(64, 4).unwrap())
            .collect::<HashSet<_>>();

        assert_eq!(first_round, second_round);
        assert_eq!(memory.allocate_calls(), 3);
    }

    #[test]
    fn pools_are_first_fit_in_creation_order() {
        let (mut manager, _memory) = fake_manager(ReleasePolicy::Immediate);
        let large = manager.create_pool(256, 1, 8).unwrap();
        let small = manager.create_pool(16, 2, 8).unwrap();

        // The large pool comes first, so it wins even though the small one fits better.
        let a = manager.allocate(8, 8).unwrap();
        let b = manager.allocate(8, 8).unwrap();

        let snapshot = manager.describe();
        assert_eq!(
            snapshot.block(a.as_ptr() as usize).unwrap().origin,
            BlockOrigin::Pool(large)
        );
        assert_eq!(
            snapshot.block(b.as_ptr() as usize).unwrap().origin,
            BlockOrigin::Pool(small)
        );
    }

    #[test]
    fn pool_with_weaker_alignment_is_skipped() {
        let (mut manager, _memory) = fake_manager(ReleasePolicy::Immediate);
        manager.create_pool(64, 1, 8).unwrap();

        let ptr = manager.allocate(32, 64).unwrap();

        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        assert_eq!(
            manager
                .describe()
                .block(ptr.as_ptr() as usize)
                .unwrap()
                .origin,
            BlockOrigin::Heap
        );
    }

    #[test]
    fn create_pool_rejects_bad_alignment() {
        let mut manager = Manager::new();

        assert_eq!(
            manager.create_pool(32, 4, 12),
            Err(AllocError::InvalidAlignment { alignment: 12 })
        );
        assert_eq!(manager.pool_count(), 0);
    }

    #[test]
    fn reallocate_preserves_prefix() {
        let (mut manager, _memory) = fake_manager(ReleasePolicy::Immediate);

        let ptr = manager.allocate(40, 4).unwrap();
        fill(ptr, 40, 1);

        // Something right behind it forces the grow to move.
        let _blocker = manager.allocate(8, 1).unwrap();

        let grown = manager.reallocate(Some(ptr), 80, 4).unwrap().unwrap();
        assert_ne!(grown, ptr);
        assert_eq!(read(grown, 40), read_expected(40, 1));
        assert_eq!(manager.size_of(grown), Some(80));
        assert_eq!(manager.size_of(ptr), None);

        let shrunk = manager.reallocate(Some(grown), 10, 16).unwrap().unwrap();
        assert_eq!(shrunk.as_ptr() as usize % 16, 0);
        assert_eq!(read(shrunk, 10), read_expected(10, 1));
    }

    fn read_expected(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn reallocate_keeps_reference_count() {
        let (mut manager, _memory) = fake_manager(ReleasePolicy::Immediate);

        let ptr = manager.allocate(8, 8).unwrap();
        manager.retain(ptr).unwrap();

        let moved = manager.reallocate(Some(ptr), 4096, 8).unwrap().unwrap();
        assert_eq!(manager.ref_count(moved), Some(2));
    }

    #[test]
    fn reallocate_null_allocates() {
        let mut manager = Manager::new();

        let ptr = manager.reallocate(None, 16, 8).unwrap().unwrap();
        assert_eq!(manager.ref_count(ptr), Some(1));
        assert_eq!(manager.size_of(ptr), Some(16));
    }

    #[test]
    fn reallocate_to_zero_releases_fully() {
        let (mut manager, memory) = fake_manager(ReleasePolicy::Immediate);

        let ptr = manager.allocate(16, 8).unwrap();
        manager.retain(ptr).unwrap();

        assert_eq!(manager.reallocate(Some(ptr), 0, 8), Ok(None));
        assert!(manager.is_empty());
        assert_eq!(memory.outstanding(), 0);
        assert!(matches!(
            manager.release(ptr),
            Err(AllocError::DoubleRelease { .. })
        ));
    }

    #[test]
    fn reallocate_errors_leave_block_untouched() {
        let (mut manager, memory) = fake_manager(ReleasePolicy::Immediate);
        let pool = manager.create_pool(32, 1, 8).unwrap();

        let slot = manager.allocate(32, 8).unwrap();
        assert_eq!(
            manager.reallocate(Some(slot), 64, 8),
            Err(AllocError::PoolBlockNotResizable {
                address: slot.as_ptr() as usize,
                pool
            })
        );

        let heap = manager.allocate(16, 1).unwrap();
        fill(heap, 16, 7);

        assert_eq!(
            manager.reallocate(Some(heap), 32, 3),
            Err(AllocError::InvalidAlignment { alignment: 3 })
        );

        let _blocker = manager.allocate(1, 1).unwrap();
        memory.fail_after(0);
        assert_eq!(
            manager.reallocate(Some(heap), 4096, 1),
            Err(AllocError::OutOfMemory { requested: 4096 })
        );
        memory.stop_failing();

        assert_eq!(manager.size_of(heap), Some(16));
        assert_eq!(read(heap, 16), read_expected(16, 7));

        let mut local = 0_u8;
        let foreign = NonNull::from(&mut local);
        assert_eq!(
            manager.reallocate(Some(foreign), 8, 1),
            Err(AllocError::UnknownPointer {
                address: foreign.as_ptr() as usize
            })
        );
    }

    #[test]
    fn copy_duplicates_content() {
        let mut manager = Manager::new();

        let src = manager.allocate(20, 4).unwrap();
        fill(src, 20, 100);

        let dest = manager.copy(src, 20).unwrap();
        assert_ne!(dest, src);
        assert_eq!(read(dest, 20), read(src, 20));

        fill(dest, 20, 0);
        assert_eq!(read(src, 20), read_expected(20, 100));
    }

    #[test]
    fn copy_accepts_interior_range() {
        let mut manager = Manager::new();

        let src = manager.allocate(32, 8).unwrap();
        fill(src, 32, 0);

        let interior = unsafe { src.add(8) };
        let dest = manager.copy(interior, 16).unwrap();

        assert_eq!(read(dest, 16), read_expected(16, 8));
    }

    #[test]
    fn copy_rejects_unresolvable_source() {
        let mut manager = Manager::new();

        let src = manager.allocate(16, 8).unwrap();
        assert_eq!(
            manager.copy(src, 17),
            Err(AllocError::UnknownPointer {
                address: src.as_ptr() as usize
            })
        );
        assert_eq!(manager.len(), 1);

        manager.release(src).unwrap();
        assert!(manager.copy(src, 1).is_err());
    }

    #[test]
    fn deferred_release_parks_and_reuses_heap_blocks() {
        let (mut manager, memory) = fake_manager(ReleasePolicy::Deferred);

        let ptr = manager.allocate(64, 8).unwrap();
        manager.release(ptr).unwrap();

        assert!(manager.is_empty());
        assert_eq!(manager.vacant_len(), 1);
        assert_eq!(memory.outstanding(), 1);
        assert_eq!(
            manager.release(ptr),
            Err(AllocError::DoubleRelease {
                address: ptr.as_ptr() as usize
            })
        );

        let reused = manager.allocate(32, 8).unwrap();
        assert_eq!(reused, ptr);
        assert_eq!(manager.vacant_len(), 0);
        assert_eq!(memory.allocate_calls(), 1);

        manager.release(reused).unwrap();
        assert_eq!(manager.purge_vacant(), 1);
        assert_eq!(memory.outstanding(), 0);
    }

    #[test]
    fn defragment_merges_adjacent_vacant_block() {
        let (mut manager, memory) = fake_manager(ReleasePolicy::Deferred);

        let a = manager.allocate(16, 1).unwrap();
        let b = manager.allocate(16, 1).unwrap();
        assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + 16);

        fill(a, 16, 9);
        manager.release(b).unwrap();

        let report = manager.defragment();
        assert_eq!(report.merges_performed, 1);

        let snapshot = manager.describe();
        assert!(snapshot.block(b.as_ptr() as usize).is_none());
        assert_eq!(snapshot.blocks.len(), 1);

        let merged = snapshot.blocks[0].address;
        assert_eq!(snapshot.blocks[0].size, 32);

        // The fake arena grows in place into the freed neighbor.
        assert_eq!(merged, a.as_ptr() as usize);
        assert!(report.relocations.is_empty());
        assert_eq!(read(a, 16), read_expected(16, 9));
        assert_eq!(memory.outstanding(), 1);
    }

    #[test]
    fn defragment_chains_merges() {
        let (mut manager, memory) = fake_manager(ReleasePolicy::Deferred);

        let a = manager.allocate(16, 1).unwrap();
        let b = manager.allocate(8, 1).unwrap();
        let c = manager.allocate(8, 1).unwrap();
        let d = manager.allocate(16, 1).unwrap();

        manager.release(b).unwrap();
        manager.release(c).unwrap();

        let report = manager.defragment();
        assert_eq!(report.merges_performed, 2);
        assert_eq!(manager.size_of(a), Some(32));
        assert_eq!(manager.size_of(d), Some(16));
        assert_eq!(manager.vacant_len(), 0);
        assert_eq!(memory.outstanding(), 2);
    }

    #[test]
    fn defragment_merges_vacant_into_vacant() {
        let (mut manager, memory) = fake_manager(ReleasePolicy::Deferred);

        let a = manager.allocate(16, 1).unwrap();
        let b = manager.allocate(16, 1).unwrap();
        manager.release(a).unwrap();
        manager.release(b).unwrap();

        assert_eq!(manager.defragment().merges_performed, 1);
        assert_eq!(manager.vacant_len(), 1);

        let snapshot = manager.describe();
        assert_eq!(snapshot.blocks[0].size, 32);
        assert_eq!(snapshot.blocks[0].state, BlockState::Vacant);

        // The coalesced span now satisfies a request neither half could.
        let big = manager.allocate(32, 1).unwrap();
        assert_eq!(big, a);
        assert_eq!(memory.outstanding(), 1);
    }

    #[test]
    fn defragment_skips_live_successors_and_pool_slots() {
        let (mut manager, _memory) = fake_manager(ReleasePolicy::Deferred);
        manager.create_pool(16, 2, 1).unwrap();

        let slot_a = manager.allocate(16, 1).unwrap();
        let slot_b = manager.allocate(16, 1).unwrap();
        manager.release(slot_b).unwrap();

        let a = manager.allocate(32, 1).unwrap();
        let _b = manager.allocate(32, 1).unwrap();

        assert_eq!(manager.defragment().merges_performed, 0);
        assert_eq!(manager.size_of(a), Some(32));
        assert_eq!(manager.size_of(slot_a), Some(16));
    }

    #[test]
    fn defragment_is_a_no_op_under_immediate_release() {
        let (mut manager, _memory) = fake_manager(ReleasePolicy::Immediate);

        let a = manager.allocate(16, 1).unwrap();
        let b = manager.allocate(16, 1).unwrap();
        manager.release(b).unwrap();

        assert_eq!(manager.defragment().merges_performed, 0);
        assert_eq!(manager.size_of(a), Some(16));
    }

    #[test]
    fn defragment_failure_keeps_block_valid() {
        let (mut manager, memory) = fake_manager(ReleasePolicy::Deferred);

        let a = manager.allocate(16, 1).unwrap();
        let b = manager.allocate(16, 1).unwrap();
        fill(a, 16, 3);
        manager.release(b).unwrap();

        memory.fail_after(0);
        let report = manager.defragment();
        memory.stop_failing();

        assert_eq!(report.merges_performed, 0);
        assert_eq!(manager.size_of(a), Some(16));
        assert_eq!(read(a, 16), read_expected(16, 3));
        assert_eq!(manager.ref_count(a), Some(1));
    }

    #[test]
    fn defragment_reports_relocated_live_block() {
        let (mut manager, memory) = fake_manager(ReleasePolicy::Deferred);

        let a = manager.allocate(16, 1).unwrap();
        let b = manager.allocate(16, 1).unwrap();
        fill(a, 16, 40);
        manager.retain(a).unwrap();
        manager.release(b).unwrap();

        memory.force_move_on_resize();
        let report = manager.defragment();
        memory.resize_in_place_when_possible();

        assert_eq!(report.merges_performed, 1);
        assert_eq!(report.relocations.len(), 1);
        assert_eq!(report.relocations[0].from, a.as_ptr() as usize);

        let moved = report.relocations[0].to;
        assert_ne!(moved, a);
        assert_eq!(manager.size_of(moved), Some(32));
        assert_eq!(manager.ref_count(moved), Some(2));
        assert_eq!(read(moved, 16), read_expected(16, 40));

        // The old address is simply gone, not released.
        assert_eq!(manager.size_of(a), None);
        assert!(matches!(
            manager.release(a),
            Err(AllocError::UnknownPointer { .. })
        ));

        manager.integrity_check();
        assert_eq!(memory.outstanding(), 1);
    }

    #[test]
    fn many_live_blocks_are_checked_one_at_a_time() {
        // Debug builds check only the block each operation touched. Sweeping everything after
        // every operation would make this loop quadratic.
        const COUNT: usize = 20_000;

        let mut manager = Manager::new();

        let blocks = (0..COUNT)
            .map(|_| manager.allocate(16, 8).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(manager.len(), COUNT);

        manager.integrity_check();

        for ptr in blocks {
            manager.release(ptr).unwrap();
        }

        assert!(manager.is_empty());
        manager.integrity_check();
    }

    #[test]
    fn describe_lists_blocks_in_address_order() {
        let (mut manager, _memory) = fake_manager(ReleasePolicy::Deferred);

        let a = manager.allocate(8, 1).unwrap();
        let b = manager.allocate(8, 1).unwrap();
        let c = manager.allocate(8, 1).unwrap();
        manager.retain(c).unwrap();
        manager.release(b).unwrap();

        let snapshot = manager.describe();
        let addresses = snapshot
            .blocks
            .iter()
            .map(|block| block.address)
            .collect::<Vec<_>>();

        assert_eq!(
            addresses,
            vec![
                a.as_ptr() as usize,
                b.as_ptr() as usize,
                c.as_ptr() as usize
            ]
        );
        assert_eq!(snapshot.blocks[1].state, BlockState::Vacant);
        assert_eq!(snapshot.blocks[2].ref_count, 2);
    }

    #[test]
    fn destroy_releases_everything_regardless_of_ref_counts() {
        let (mut manager, memory) = fake_manager(ReleasePolicy::Deferred);
        manager.create_pool(32, 4, 8).unwrap();

        let slot = manager.allocate(32, 8).unwrap();
        manager.retain(slot).unwrap();

        let heap = manager.allocate(100, 16).unwrap();
        manager.retain(heap).unwrap();
        manager.retain(heap).unwrap();

        let vacant = manager.allocate(100, 16).unwrap();
        manager.release(vacant).unwrap();

        let report = manager.destroy();

        assert_eq!(
            report,
            TeardownReport {
                blocks_released: 2,
                slots_released: 4,
                live_blocks: 2,
            }
        );
        assert_eq!(memory.outstanding(), 0);
    }

    #[test]
    fn drop_releases_everything() {
        let (mut manager, memory) = fake_manager(ReleasePolicy::Immediate);
        manager.create_pool(8, 2, 8).unwrap();
        manager.allocate(8, 8).unwrap();
        manager.allocate(1024, 64).unwrap();

        drop(manager);

        assert_eq!(memory.outstanding(), 0);
    }

    #[test]
    #[should_panic]
    fn must_not_release_blocks_panics_on_live_blocks() {
        let mut manager = Manager::builder()
            .drop_policy(DropPolicy::MustNotReleaseBlocks)
            .build()
            .unwrap();

        manager.allocate(8, 8).unwrap();

        drop(manager);
    }

    #[test]
    fn must_not_release_blocks_allows_clean_teardown() {
        let mut manager = Manager::builder()
            .drop_policy(DropPolicy::MustNotReleaseBlocks)
            .pool(16, 2, 8)
            .build()
            .unwrap();

        let ptr = manager.allocate(16, 8).unwrap();
        manager.release(ptr).unwrap();

        let report = manager.destroy();
        assert_eq!(report.live_blocks, 0);
        assert_eq!(report.slots_released, 2);
    }

    #[test]
    fn managers_are_independent() {
        let mut first = Manager::new();
        let mut second = Manager::new();

        let ptr = first.allocate(16, 8).unwrap();

        assert!(matches!(
            second.release(ptr),
            Err(AllocError::UnknownPointer { .. })
        ));
        first.release(ptr).unwrap();
    }
}
