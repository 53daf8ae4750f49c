/// Determines how a [`Manager`][crate::Manager] treats blocks that are still live when it is
/// torn down.
///
/// Teardown always releases every raw allocation the manager owns, regardless of outstanding
/// reference counts. The policy only decides whether finding live blocks at that point is
/// acceptable.
///
/// # Examples
///
/// ```
/// use ledger_alloc::{DropPolicy, Manager};
///
/// let manager = Manager::builder()
///     .drop_policy(DropPolicy::MustNotReleaseBlocks)
///     .build()?;
/// # Ok::<(), ledger_alloc::AllocError>(())
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// Live blocks are released along with everything else. This is the default.
    #[default]
    MayReleaseBlocks,

    /// The manager will panic if it still has live blocks when it is torn down.
    ///
    /// This may be valuable to detect leaks of references in tests, or when unsafe code is
    /// known to hold pointers into managed blocks until they are explicitly released.
    MustNotReleaseBlocks,
}
