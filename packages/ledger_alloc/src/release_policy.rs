/// Determines what happens to a heap block when its reference count drops to zero.
///
/// Pool slots always return to their pool, regardless of this policy.
///
/// # Examples
///
/// ```
/// use ledger_alloc::{Manager, ReleasePolicy};
///
/// let mut manager = Manager::builder()
///     .release_policy(ReleasePolicy::Deferred)
///     .build()?;
///
/// let ptr = manager.allocate(64, 8)?;
/// manager.release(ptr)?;
///
/// // The memory is retained as a vacant block until it is reused or coalesced.
/// assert!(manager.is_empty());
/// assert_eq!(manager.vacant_len(), 1);
/// # Ok::<(), ledger_alloc::AllocError>(())
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ReleasePolicy {
    /// The raw allocation is released to the allocation primitive immediately. This is the
    /// default.
    #[default]
    Immediate,

    /// The raw allocation is kept as a vacant block. Vacant blocks satisfy later allocation
    /// requests that fit in them (first-fit by address, after pools) and are candidates for
    /// coalescing by [`Manager::defragment()`][crate::Manager::defragment]. They are released
    /// by [`Manager::purge_vacant()`][crate::Manager::purge_vacant] or at teardown.
    Deferred,
}
