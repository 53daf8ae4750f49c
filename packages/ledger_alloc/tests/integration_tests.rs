//! Integration tests for the `ledger_alloc` package.
//!
//! These exercise the public API against the system allocator: reference counting, pools,
//! resizing, copying, diagnostics, teardown and shared use across threads.
#![allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]

use std::ptr::NonNull;
use std::thread;

use ledger_alloc::{
    AllocError, BlockOrigin, BlockState, DropPolicy, Manager, ReleasePolicy, SharedManager,
};

fn write_pattern(ptr: NonNull<u8>, len: usize) {
    for i in 0..len {
        unsafe { ptr.add(i).write((i % 251) as u8) };
    }
}

fn has_pattern(ptr: NonNull<u8>, len: usize) -> bool {
    (0..len).all(|i| unsafe { ptr.add(i).read() } == (i % 251) as u8)
}

#[test]
fn reference_counted_lifecycle() {
    let mut manager = Manager::new();

    let ptr = manager.allocate(40, 8).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 8, 0);
    assert_eq!(manager.ref_count(ptr), Some(1));

    manager.retain(ptr).unwrap();
    manager.retain(ptr).unwrap();
    assert_eq!(manager.ref_count(ptr), Some(3));

    manager.release(ptr).unwrap();
    manager.release(ptr).unwrap();
    assert_eq!(manager.len(), 1);

    manager.release(ptr).unwrap();
    assert!(manager.is_empty());

    assert_eq!(
        manager.release(ptr),
        Err(AllocError::DoubleRelease {
            address: ptr.as_ptr() as usize
        })
    );
}

#[test]
fn errors_render_addresses() {
    let error = AllocError::UnknownPointer { address: 0x1000 };
    assert!(error.to_string().contains("0x1000"));
}

#[test]
fn pools_serve_first_then_heap() {
    let mut manager = Manager::builder().pool(32, 4, 8).build().unwrap();

    let blocks = (0..5)
        .map(|_| manager.allocate(32, 8).unwrap())
        .collect::<Vec<_>>();

    let snapshot = manager.describe();
    let pooled = snapshot
        .live_blocks()
        .filter(|block| matches!(block.origin, BlockOrigin::Pool(_)))
        .count();

    assert_eq!(pooled, 4);
    assert_eq!(snapshot.pools[0].free, 0);

    for ptr in blocks {
        manager.release(ptr).unwrap();
    }

    assert_eq!(manager.describe().pools[0].free, 4);
}

#[test]
fn pool_slots_cannot_be_resized() {
    let mut manager = Manager::new();
    let pool = manager.create_pool(64, 2, 16).unwrap();

    let ptr = manager.allocate(10, 4).unwrap();

    assert_eq!(
        manager.reallocate(Some(ptr), 100, 4),
        Err(AllocError::PoolBlockNotResizable {
            address: ptr.as_ptr() as usize,
            pool
        })
    );
    assert_eq!(manager.size_of(ptr), Some(10));
}

#[test]
fn reallocate_grows_and_shrinks_with_content() {
    let mut manager = Manager::new();

    let ptr = manager.allocate(100, 8).unwrap();
    write_pattern(ptr, 100);

    let grown = manager.reallocate(Some(ptr), 10_000, 64).unwrap().unwrap();
    assert_eq!(grown.as_ptr() as usize % 64, 0);
    assert!(has_pattern(grown, 100));

    let shrunk = manager.reallocate(Some(grown), 50, 1).unwrap().unwrap();
    assert!(has_pattern(shrunk, 50));
    assert_eq!(manager.size_of(shrunk), Some(50));
    assert_eq!(manager.len(), 1);

    assert_eq!(manager.reallocate(Some(shrunk), 0, 1), Ok(None));
    assert!(manager.is_empty());
}

#[test]
fn copy_produces_independent_block() {
    let mut manager = Manager::new();

    let src = manager.allocate(256, 32).unwrap();
    write_pattern(src, 256);

    let dest = manager.copy(src, 256).unwrap();
    assert!(has_pattern(dest, 256));
    assert_eq!(manager.ref_count(dest), Some(1));

    manager.release(src).unwrap();
    assert!(has_pattern(dest, 256));
}

#[test]
fn invalid_alignment_is_rejected_everywhere() {
    let mut manager = Manager::new();

    assert!(matches!(
        manager.allocate(8, 0),
        Err(AllocError::InvalidAlignment { alignment: 0 })
    ));
    assert!(matches!(
        manager.create_pool(8, 1, 5),
        Err(AllocError::InvalidAlignment { alignment: 5 })
    ));

    let ptr = manager.allocate(8, 8).unwrap();
    assert!(matches!(
        manager.reallocate(Some(ptr), 16, 48),
        Err(AllocError::InvalidAlignment { alignment: 48 })
    ));
}

#[test]
fn huge_request_is_out_of_memory() {
    let mut manager = Manager::new();

    assert_eq!(
        manager.allocate(usize::MAX, 8),
        Err(AllocError::OutOfMemory {
            requested: usize::MAX
        })
    );
    assert!(manager.is_empty());
}

#[test]
fn deferred_release_keeps_blocks_for_reuse() {
    let mut manager = Manager::builder()
        .release_policy(ReleasePolicy::Deferred)
        .build()
        .unwrap();

    let ptr = manager.allocate(128, 16).unwrap();
    manager.release(ptr).unwrap();

    let snapshot = manager.describe();
    assert_eq!(snapshot.blocks.len(), 1);
    assert_eq!(snapshot.blocks[0].state, BlockState::Vacant);
    assert_eq!(snapshot.blocks[0].ref_count, 0);

    let again = manager.allocate(64, 16).unwrap();
    assert_eq!(again, ptr);
    assert_eq!(manager.vacant_len(), 0);

    manager.release(again).unwrap();
    assert_eq!(manager.purge_vacant(), 1);
    assert!(manager.describe().blocks.is_empty());
}

#[test]
fn defragment_keeps_live_blocks_valid() {
    let mut manager = Manager::builder()
        .release_policy(ReleasePolicy::Deferred)
        .build()
        .unwrap();

    let blocks = (0..8)
        .map(|_| {
            let ptr = manager.allocate(48, 8).unwrap();
            write_pattern(ptr, 48);
            ptr
        })
        .collect::<Vec<_>>();

    for ptr in blocks.iter().skip(1).step_by(2) {
        manager.release(*ptr).unwrap();
    }

    let report = manager.defragment();

    // Whether anything merges depends on the system allocator's layout, but every live block
    // must still be reachable, at its new address if it moved.
    let mut live = blocks.iter().step_by(2).copied().collect::<Vec<_>>();
    for relocation in &report.relocations {
        let block = live
            .iter_mut()
            .find(|ptr| ptr.as_ptr() as usize == relocation.from)
            .unwrap();
        *block = relocation.to;
    }

    for ptr in live {
        assert_eq!(manager.ref_count(ptr), Some(1));
        assert!(has_pattern(ptr, 48));
        manager.release(ptr).unwrap();
    }

    assert!(manager.is_empty());
}

#[test]
fn describe_renders_listing() {
    let mut manager = Manager::builder().pool(16, 2, 8).build().unwrap();

    let ptr = manager.allocate(40, 8).unwrap();
    manager.retain(ptr).unwrap();
    manager.allocate(16, 8).unwrap();

    let rendered = manager.describe().to_string();

    assert!(rendered.starts_with("Memory blocks:\n"));
    assert!(rendered.contains(&format!(
        "Block at {:#x}, size: 40 bytes, ref_count: 2\n",
        ptr.as_ptr() as usize
    )));
    assert!(rendered.contains(", pool #0\n"));
    assert!(rendered.contains("Pool #0: 16-byte slots aligned to 8, 1 of 2 free\n"));
}

#[test]
fn destroy_reports_released_memory() {
    let mut manager = Manager::builder().pool(32, 3, 8).build().unwrap();

    manager.allocate(32, 8).unwrap();
    let heap = manager.allocate(1024, 8).unwrap();
    manager.retain(heap).unwrap();

    let report = manager.destroy();

    assert_eq!(report.blocks_released, 1);
    assert_eq!(report.slots_released, 3);
    assert_eq!(report.live_blocks, 2);
}

#[test]
#[should_panic]
fn must_not_release_blocks_detects_leaks() {
    let mut manager = Manager::builder()
        .drop_policy(DropPolicy::MustNotReleaseBlocks)
        .build()
        .unwrap();

    manager.allocate(8, 8).unwrap();

    drop(manager);
}

#[test]
fn shared_manager_across_threads() {
    let shared = SharedManager::from(Manager::builder().pool(64, 16, 8).build().unwrap());

    let workers = (0..4)
        .map(|_| {
            let shared = shared.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let ptr = shared.allocate(64, 8).unwrap();
                    shared.retain(ptr).unwrap();
                    shared.release(ptr).unwrap();
                    shared.release(ptr).unwrap();
                }
            })
        })
        .collect::<Vec<_>>();

    for worker in workers {
        worker.join().unwrap();
    }

    assert!(shared.is_empty());
    assert_eq!(shared.describe().pools[0].free, 16);
}
