#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A reference-counting memory manager with fixed-size slot pools, alignment control and
//! best-effort coalescing of adjacent blocks.
//!
//! This crate provides [`Manager`], which hands out raw blocks of memory and tracks every one of
//! them in a registry keyed by address. Each block carries a reference count, so several owners
//! can share a block and the memory is only released when the last of them lets go.
//!
//! # Key Features
//!
//! - **Reference counting**: [`retain()`](Manager::retain) and [`release()`](Manager::release)
//!   per block, with double releases detected and reported instead of corrupting memory
//! - **Alignment control**: every request names its alignment, any power of two is accepted
//! - **Slot pools**: pre-allocated fixed-size slots served first-fit in pool creation order,
//!   falling back to dedicated raw allocations when no pool can serve a request
//! - **Content-preserving resize**: [`reallocate()`](Manager::reallocate) keeps the common prefix
//!   even when the block moves or changes alignment
//! - **Coalescing**: under [`ReleasePolicy::Deferred`], released heap blocks are kept as vacant
//!   and [`defragment()`](Manager::defragment) merges them into their physical predecessors
//! - **Diagnostics**: [`describe()`](Manager::describe) returns a [`Snapshot`] that can be
//!   inspected or printed
//! - **Leak-free teardown**: dropping the manager releases every pool slot and block, with a
//!   [`DropPolicy`] to turn remaining live blocks into a panic instead
//!
//! # Example
//!
//! ```rust
//! use ledger_alloc::Manager;
//!
//! let mut manager = Manager::new();
//!
//! let numbers = manager.allocate(10 * size_of::<i32>(), align_of::<i32>())?;
//!
//! // SAFETY: The block is live, aligned for i32 and 10 i32s long.
//! unsafe {
//!     let slice = std::slice::from_raw_parts_mut(numbers.cast::<i32>().as_ptr(), 10);
//!     for (i, value) in slice.iter_mut().enumerate() {
//!         *value = i32::try_from(i).unwrap();
//!     }
//! }
//!
//! // A second owner takes a reference.
//! manager.retain(numbers)?;
//!
//! let numbers = manager
//!     .reallocate(Some(numbers), 20 * size_of::<i32>(), align_of::<i32>())?
//!     .expect("non-zero size always yields a block");
//!
//! // SAFETY: The first 10 values survived the resize.
//! let fifth = unsafe { numbers.cast::<i32>().add(5).read() };
//! assert_eq!(fifth, 5);
//!
//! println!("{}", manager.describe());
//!
//! manager.release(numbers)?;
//! manager.release(numbers)?;
//! assert!(manager.is_empty());
//! # Ok::<(), ledger_alloc::AllocError>(())
//! ```
//!
//! # Logging
//!
//! The crate emits structured events through [`tracing`](https://docs.rs/tracing): failed
//! operations at `warn`, pool and defragmentation activity at `debug` and individual block
//! operations at `trace`. Install a subscriber to see them.
//!
//! # Thread safety
//!
//! [`Manager`] is [`Send`] but not [`Sync`]. [`SharedManager`] wraps it for use from multiple
//! threads at once.

mod align;
mod builder;
mod defrag;
mod drop_policy;
mod error;
mod manager;
mod pal;
mod pool;
mod raw_block;
mod record;
mod registry;
mod release_policy;
mod shared;
mod snapshot;

pub use builder::*;
pub use defrag::{DefragReport, Relocation};
pub use drop_policy::*;
pub use error::*;
pub use manager::*;
pub(crate) use pool::*;
pub(crate) use raw_block::*;
pub(crate) use record::AllocationRecord;
pub use record::{BlockOrigin, PoolId};
pub(crate) use registry::*;
pub use release_policy::*;
pub use shared::*;
pub use snapshot::*;

const ERR_POISONED_LOCK: &str = "encountered poisoned lock - program validity cannot be guaranteed";
