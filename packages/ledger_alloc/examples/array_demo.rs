//! Walks through the life of a shared integer array managed by `Manager`.
//!
//! The array is allocated, shared with a second owner, grown while keeping its contents,
//! duplicated, described and finally released by both owners.

use std::slice;

use ledger_alloc::Manager;

const INITIAL_LEN: usize = 10;
const GROWN_LEN: usize = 20;

fn main() -> Result<(), ledger_alloc::AllocError> {
    let mut manager = Manager::new();

    let array = manager.allocate(INITIAL_LEN * size_of::<i32>(), align_of::<i32>())?;

    // SAFETY: The block is live, aligned for i32 and holds INITIAL_LEN of them. No other
    // reference to it exists while the slice is alive.
    let values = unsafe { slice::from_raw_parts_mut(array.cast::<i32>().as_ptr(), INITIAL_LEN) };
    for (value, n) in values.iter_mut().zip(0..) {
        *value = n;
    }

    println!("Allocated array of {INITIAL_LEN} integers at {array:p}");

    // A second owner now shares the array.
    manager.retain(array)?;
    println!("Reference count after retain: {:?}", manager.ref_count(array));

    let array = manager
        .reallocate(Some(array), GROWN_LEN * size_of::<i32>(), align_of::<i32>())?
        .expect("a non-zero size always yields a block");

    // SAFETY: The block is live and now holds GROWN_LEN integers, the first INITIAL_LEN of
    // which were preserved by the resize.
    let values = unsafe { slice::from_raw_parts_mut(array.cast::<i32>().as_ptr(), GROWN_LEN) };
    for (value, n) in values.iter_mut().zip(0..).skip(INITIAL_LEN) {
        *value = n * 10;
    }

    println!("Grew array to {GROWN_LEN} integers at {array:p}: {values:?}");

    let copy = manager.copy(array, GROWN_LEN * size_of::<i32>())?;
    println!("Copied array to {copy:p}");

    println!();
    print!("{}", manager.describe());
    println!();

    manager.release(array)?;
    println!("First owner released the array");

    manager.release(array)?;
    println!("Second owner released the array");

    manager.release(copy)?;

    println!();
    print!("{}", manager.describe());

    let report = manager.destroy();
    println!(
        "Teardown released {} heap blocks and {} pool slots",
        report.blocks_released, report.slots_released
    );

    Ok(())
}
