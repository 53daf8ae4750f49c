//! Best-effort coalescing of physically adjacent heap blocks.

use std::ptr::NonNull;

use tracing::{debug, warn};

use crate::pal::Memory;
use crate::{AllocationRecord, BlockRegistry};

/// Outcome of [`Manager::defragment()`][crate::Manager::defragment].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct DefragReport {
    /// Number of vacant blocks absorbed into their lower neighbor.
    pub merges_performed: usize,

    /// Live blocks whose address changed while absorbing a neighbor, in the order the moves
    /// happened. A block that moved more than once appears once per move.
    pub relocations: Vec<Relocation>,
}

/// A live block that moved during defragmentation.
///
/// The contents and reference count moved with it. The old address is no longer valid.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct Relocation {
    /// The address the block was registered under before the move.
    pub from: usize,

    /// The pointer to use from now on.
    pub to: NonNull<u8>,
}

/// Walks all heap blocks once in ascending address order, letting each block absorb any run of
/// vacant blocks that directly follow it.
///
/// Absorbing means releasing the vacant block's raw memory first and then growing the lower
/// block's raw memory by the vacant block's size, which lets the primitive grow in place into
/// the space just freed. If growing fails, the lower block is left as it was and the vacant
/// block is gone, so the scan continues after it.
pub(crate) fn coalesce(registry: &mut BlockRegistry, memory: &impl Memory) -> DefragReport {
    let order = registry.heap_addresses_in_order();
    let mut report = DefragReport::default();

    let mut index = 0;

    while let Some(&first) = order.get(index) {
        let mut current = first;
        index = index.wrapping_add(1);

        while let Some(&successor) = order.get(index) {
            if !is_absorbable(registry, current, successor) {
                break;
            }

            index = index.wrapping_add(1);

            match absorb(registry, memory, current, successor) {
                Some(merged) => {
                    report.merges_performed = report.merges_performed.wrapping_add(1);

                    if let Some(relocation) = merged.relocation {
                        report.relocations.push(relocation);
                    }

                    current = merged.address;
                }
                None => break,
            }
        }
    }

    report
}

/// A vacant block can be absorbed by the heap block that ends exactly where it starts.
fn is_absorbable(registry: &BlockRegistry, lower: usize, upper: usize) -> bool {
    if !registry.is_vacant(upper) {
        return false;
    }

    registry
        .find_heap_block(lower)
        .is_some_and(|record| record.end_address() == upper)
}

struct Merged {
    address: usize,
    relocation: Option<Relocation>,
}

fn absorb(
    registry: &mut BlockRegistry,
    memory: &impl Memory,
    lower: usize,
    upper: usize,
) -> Option<Merged> {
    let absorbed = registry.remove_vacant(upper)?;
    let absorbed_size = absorbed.size();
    absorbed.into_raw().release(memory);

    let lower_is_vacant = registry.is_vacant(lower);

    let record = if lower_is_vacant {
        registry.remove_vacant(lower)
    } else {
        registry.remove(lower)
    }?;

    let alignment = record.alignment();

    let Some(new_size) = record.size().checked_add(absorbed_size) else {
        debug!(
            upper = %format_args!("{upper:#x}"),
            absorbed_size,
            "released vacant block without merging it"
        );
        put_back(registry, record, lower_is_vacant);
        return None;
    };

    match record.resize(memory, new_size, alignment) {
        Ok(record) => {
            let address = record.address();

            debug!(
                upper = %format_args!("{upper:#x}"),
                lower = %format_args!("{lower:#x}"),
                address = %format_args!("{address:#x}"),
                new_size,
                "merged vacant block into its lower neighbor"
            );

            let relocation = (address != lower && !lower_is_vacant).then(|| Relocation {
                from: lower,
                to: record.user_pointer(),
            });

            put_back(registry, record, lower_is_vacant);

            Some(Merged {
                address,
                relocation,
            })
        }
        Err((record, e)) => {
            warn!(
                upper = %format_args!("{upper:#x}"),
                lower = %format_args!("{lower:#x}"),
                error = %e,
                "could not merge vacant block into its lower neighbor"
            );
            debug!(
                upper = %format_args!("{upper:#x}"),
                absorbed_size,
                "released vacant block without merging it"
            );

            put_back(registry, record, lower_is_vacant);

            None
        }
    }
}

fn put_back(registry: &mut BlockRegistry, record: AllocationRecord, vacant: bool) {
    if vacant {
        registry.park_vacant(record);
    } else {
        registry.register(record);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use super::*;
    use crate::pal::FakeMemory;
    use crate::{BlockOrigin, RawBlock};

    fn heap(memory: &FakeMemory, size: usize, ref_count: usize) -> AllocationRecord {
        let raw = RawBlock::allocate(memory, size).unwrap();
        let mut record = AllocationRecord::place(raw, size, 1, BlockOrigin::Heap);
        record.set_ref_count(ref_count);
        record
    }

    fn add(registry: &mut BlockRegistry, record: AllocationRecord) -> usize {
        let address = record.address();

        if record.ref_count() == 0 {
            registry.park_vacant(record);
        } else {
            registry.register(record);
        }

        address
    }

    fn release_all(registry: &mut BlockRegistry, memory: &FakeMemory) {
        for record in registry.drain().collect::<Vec<_>>() {
            record.into_raw().release(memory);
        }

        assert_eq!(memory.outstanding(), 0);
    }

    #[test]
    fn empty_registry_has_nothing_to_do() {
        let memory = FakeMemory::new(1024);
        let mut registry = BlockRegistry::new();

        assert_eq!(coalesce(&mut registry, &memory), DefragReport::default());
    }

    #[test]
    fn vacant_run_is_absorbed_by_live_block() {
        let memory = FakeMemory::new(1024);
        let mut registry = BlockRegistry::new();

        let a = add(&mut registry, heap(&memory, 16, 1));
        add(&mut registry, heap(&memory, 8, 0));
        add(&mut registry, heap(&memory, 8, 0));
        let d = add(&mut registry, heap(&memory, 16, 1));

        let report = coalesce(&mut registry, &memory);

        assert_eq!(report.merges_performed, 2);
        assert!(report.relocations.is_empty());
        assert_eq!(registry.find(a).unwrap().size(), 32);
        assert_eq!(registry.find(d).unwrap().size(), 16);
        assert_eq!(registry.vacant_len(), 0);
        registry.integrity_check();

        release_all(&mut registry, &memory);
    }

    #[test]
    fn live_successor_stops_the_run() {
        let memory = FakeMemory::new(1024);
        let mut registry = BlockRegistry::new();

        let a = add(&mut registry, heap(&memory, 16, 1));
        add(&mut registry, heap(&memory, 16, 2));
        add(&mut registry, heap(&memory, 16, 0));

        let report = coalesce(&mut registry, &memory);

        // Only the second block can absorb the vacant one.
        assert_eq!(report.merges_performed, 1);
        assert_eq!(registry.find(a).unwrap().size(), 16);

        release_all(&mut registry, &memory);
    }

    #[test]
    fn gap_between_blocks_prevents_merge() {
        let memory = FakeMemory::new(1024);
        let mut registry = BlockRegistry::new();

        add(&mut registry, heap(&memory, 16, 1));
        let spacer = RawBlock::allocate(&memory, 4).unwrap();
        add(&mut registry, heap(&memory, 16, 0));

        assert_eq!(coalesce(&mut registry, &memory).merges_performed, 0);
        assert_eq!(registry.vacant_len(), 1);

        spacer.release(&memory);
        release_all(&mut registry, &memory);
    }

    #[test]
    fn failed_grow_keeps_lower_block() {
        let memory = FakeMemory::new(1024);
        let mut registry = BlockRegistry::new();

        let a = add(&mut registry, heap(&memory, 16, 1));
        let b = add(&mut registry, heap(&memory, 16, 0));

        memory.fail_after(0);
        let report = coalesce(&mut registry, &memory);
        memory.stop_failing();

        assert_eq!(report.merges_performed, 0);
        assert_eq!(registry.find(a).unwrap().size(), 16);
        assert_eq!(registry.find(a).unwrap().ref_count(), 1);

        // The vacant neighbor was released before the failed grow and is not coming back.
        assert!(!registry.is_vacant(b));
        assert_eq!(registry.vacant_len(), 0);
        assert_eq!(memory.outstanding(), 1);

        release_all(&mut registry, &memory);
    }

    #[test]
    fn live_block_that_moves_is_reported_and_rekeyed() {
        let memory = FakeMemory::new(1024);
        let mut registry = BlockRegistry::new();

        let lower = heap(&memory, 16, 2);
        unsafe { lower.user_pointer().as_ptr().write_bytes(0x5A, 16) };
        let a = add(&mut registry, lower);
        add(&mut registry, heap(&memory, 16, 0));

        memory.force_move_on_resize();
        let report = coalesce(&mut registry, &memory);
        memory.resize_in_place_when_possible();

        assert_eq!(report.merges_performed, 1);
        assert_eq!(report.relocations.len(), 1);

        let relocation = report.relocations[0];
        assert_eq!(relocation.from, a);

        let to = relocation.to.as_ptr() as usize;
        assert_ne!(to, a);
        assert!(registry.find(a).is_none());

        let moved = registry.find(to).unwrap();
        assert_eq!(moved.size(), 32);
        assert_eq!(moved.ref_count(), 2);

        let content = (0..16)
            .map(|i| unsafe { relocation.to.add(i).read() })
            .collect::<Vec<_>>();
        assert_eq!(content, vec![0x5A; 16]);

        registry.integrity_check();
        release_all(&mut registry, &memory);
    }

    #[test]
    fn vacant_block_that_moves_is_not_reported() {
        let memory = FakeMemory::new(1024);
        let mut registry = BlockRegistry::new();

        let a = add(&mut registry, heap(&memory, 16, 0));
        add(&mut registry, heap(&memory, 16, 0));

        memory.force_move_on_resize();
        let report = coalesce(&mut registry, &memory);
        memory.resize_in_place_when_possible();

        assert_eq!(report.merges_performed, 1);
        assert!(report.relocations.is_empty());

        assert!(!registry.is_vacant(a));
        assert_eq!(registry.vacant_len(), 1);
        assert!(registry.is_empty());

        let merged = registry.vacant().next().unwrap();
        assert_ne!(merged.address(), a);
        assert_eq!(merged.size(), 32);

        registry.integrity_check();
        release_all(&mut registry, &memory);
    }
}
