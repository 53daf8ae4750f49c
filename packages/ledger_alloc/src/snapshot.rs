use std::fmt;

use crate::{BlockOrigin, PoolId};

/// Whether a block in a [`Snapshot`] is in use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum BlockState {
    /// The block has at least one reference and its address is valid for use.
    Live,

    /// The block has been released but its memory is retained for reuse and coalescing.
    ///
    /// Only produced under [`ReleasePolicy::Deferred`][crate::ReleasePolicy::Deferred].
    Vacant,
}

/// Diagnostic description of one block tracked by a [`Manager`][crate::Manager].
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct BlockInfo {
    /// The address handed out to the caller.
    pub address: usize,

    /// The size the caller asked for.
    pub size: usize,

    /// The alignment guaranteed for `address`.
    pub alignment: usize,

    /// Current number of references. Zero for vacant blocks.
    pub ref_count: usize,

    /// Where the memory behind the block came from.
    pub origin: BlockOrigin,

    /// Whether the block is in use.
    pub state: BlockState,
}

/// Diagnostic description of one pool owned by a [`Manager`][crate::Manager].
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct PoolInfo {
    /// Identifies the pool. Pools are listed in creation order.
    pub id: PoolId,

    /// Size of every slot in the pool.
    pub slot_size: usize,

    /// Alignment of every slot in the pool.
    pub slot_alignment: usize,

    /// Number of slots created for the pool.
    pub capacity: usize,

    /// Number of slots currently on the free list.
    pub free: usize,
}

/// A point-in-time, read-only view of a [`Manager`][crate::Manager].
///
/// Blocks are listed in ascending address order. The [`Display`][fmt::Display] implementation
/// renders a human-readable listing suitable for logging.
///
/// # Example
///
/// ```rust
/// use ledger_alloc::Manager;
///
/// let mut manager = Manager::new();
/// let ptr = manager.allocate(40, 8)?;
///
/// let snapshot = manager.describe();
/// assert_eq!(snapshot.blocks.len(), 1);
/// assert_eq!(snapshot.blocks[0].address, ptr.as_ptr() as usize);
/// assert_eq!(snapshot.blocks[0].size, 40);
///
/// println!("{snapshot}");
/// # Ok::<(), ledger_alloc::AllocError>(())
/// ```
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct Snapshot {
    /// Every live and vacant block, in ascending address order.
    pub blocks: Vec<BlockInfo>,

    /// Every pool, in creation order.
    pub pools: Vec<PoolInfo>,
}

impl Snapshot {
    /// Looks up a block by the address it was handed out at.
    #[must_use]
    pub fn block(&self, address: usize) -> Option<&BlockInfo> {
        self.blocks.iter().find(|block| block.address == address)
    }

    /// Iterates over blocks that are in use.
    pub fn live_blocks(&self) -> impl Iterator<Item = &BlockInfo> {
        self.blocks
            .iter()
            .filter(|block| block.state == BlockState::Live)
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Memory blocks:")?;

        for block in &self.blocks {
            write!(
                f,
                "Block at {:#x}, size: {} bytes, ref_count: {}",
                block.address, block.size, block.ref_count
            )?;

            if let BlockOrigin::Pool(pool) = block.origin {
                write!(f, ", pool {pool}")?;
            }

            if block.state == BlockState::Vacant {
                write!(f, " (vacant)")?;
            }

            writeln!(f)?;
        }

        if !self.pools.is_empty() {
            writeln!(f)?;
            writeln!(f, "Pools:")?;

            for pool in &self.pools {
                writeln!(
                    f,
                    "Pool {}: {}-byte slots aligned to {}, {} of {} free",
                    pool.id, pool.slot_size, pool.slot_alignment, pool.free, pool.capacity
                )?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn display_lists_blocks_and_pools() {
        let snapshot = Snapshot {
            blocks: vec![
                BlockInfo {
                    address: 0x1000,
                    size: 40,
                    alignment: 8,
                    ref_count: 2,
                    origin: BlockOrigin::Heap,
                    state: BlockState::Live,
                },
                BlockInfo {
                    address: 0x2000,
                    size: 32,
                    alignment: 8,
                    ref_count: 1,
                    origin: BlockOrigin::Pool(PoolId::from_index(0)),
                    state: BlockState::Live,
                },
                BlockInfo {
                    address: 0x3000,
                    size: 16,
                    alignment: 1,
                    ref_count: 0,
                    origin: BlockOrigin::Heap,
                    state: BlockState::Vacant,
                },
            ],
            pools: vec![PoolInfo {
                id: PoolId::from_index(0),
                slot_size: 32,
                slot_alignment: 8,
                capacity: 4,
                free: 3,
            }],
        };

        let rendered = snapshot.to_string();

        assert_eq!(
            rendered,
            "Memory blocks:\n\
             Block at 0x1000, size: 40 bytes, ref_count: 2\n\
             Block at 0x2000, size: 32 bytes, ref_count: 1, pool #0\n\
             Block at 0x3000, size: 16 bytes, ref_count: 0 (vacant)\n\
             \n\
             Pools:\n\
             Pool #0: 32-byte slots aligned to 8, 3 of 4 free\n"
        );
    }

    #[test]
    fn empty_snapshot_renders_header_only() {
        assert_eq!(Snapshot::default().to_string(), "Memory blocks:\n");
    }

    #[test]
    fn block_lookup_and_live_filter() {
        let snapshot = Snapshot {
            blocks: vec![
                BlockInfo {
                    address: 0x10,
                    size: 8,
                    alignment: 1,
                    ref_count: 1,
                    origin: BlockOrigin::Heap,
                    state: BlockState::Live,
                },
                BlockInfo {
                    address: 0x20,
                    size: 8,
                    alignment: 1,
                    ref_count: 0,
                    origin: BlockOrigin::Heap,
                    state: BlockState::Vacant,
                },
            ],
            pools: Vec::new(),
        };

        assert_eq!(snapshot.block(0x20).unwrap().state, BlockState::Vacant);
        assert!(snapshot.block(0x30).is_none());
        assert_eq!(snapshot.live_blocks().count(), 1);
    }
}
