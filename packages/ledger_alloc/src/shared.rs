use std::ptr::NonNull;
use std::result::Result as StdResult;
use std::sync::{Arc, Mutex};

use crate::{DefragReport, ERR_POISONED_LOCK, Manager, PoolId, Result, Snapshot};

/// A thread-safe, cloneable handle to a [`Manager`].
///
/// Every operation takes the lock for its own duration only, so a sequence of operations from
/// different threads interleaves at operation granularity. The manager is torn down when the
/// last handle is dropped.
///
/// Pointers returned by the manager are not [`Send`]. To hand a block to another thread,
/// pass its address and rebuild the pointer on the other side.
///
/// # Example
///
/// ```rust
/// use std::ptr::NonNull;
/// use std::thread;
///
/// use ledger_alloc::{Manager, SharedManager};
///
/// let mut manager = Manager::new();
/// manager.create_pool(64, 8, 8)?;
/// let shared = SharedManager::from(manager);
///
/// let worker = shared.clone();
/// let address = thread::spawn(move || {
///     let ptr = worker.allocate(48, 8).unwrap();
///     ptr.as_ptr() as usize
/// })
/// .join()
/// .unwrap();
///
/// let ptr = NonNull::new(address as *mut u8).unwrap();
/// assert_eq!(shared.ref_count(ptr), Some(1));
/// shared.release(ptr)?;
/// assert!(shared.is_empty());
/// # Ok::<(), ledger_alloc::AllocError>(())
/// ```
#[derive(Clone, Debug)]
pub struct SharedManager {
    inner: Arc<Mutex<Manager>>,
}

impl From<Manager> for SharedManager {
    fn from(manager: Manager) -> Self {
        Self {
            inner: Arc::new(Mutex::new(manager)),
        }
    }
}

impl Default for SharedManager {
    fn default() -> Self {
        Self::from(Manager::new())
    }
}

impl SharedManager {
    /// Creates a shared manager with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with exclusive access to the manager.
    ///
    /// Use this to perform several operations atomically with respect to other handles.
    pub fn with<R>(&self, f: impl FnOnce(&mut Manager) -> R) -> R {
        let mut manager = self.inner.lock().expect(ERR_POISONED_LOCK);
        f(&mut manager)
    }

    /// See [`Manager::create_pool()`].
    ///
    /// # Errors
    ///
    /// Same as [`Manager::create_pool()`].
    pub fn create_pool(
        &self,
        slot_size: usize,
        slot_count: usize,
        alignment: usize,
    ) -> Result<PoolId> {
        self.with(|manager| manager.create_pool(slot_size, slot_count, alignment))
    }

    /// See [`Manager::allocate()`].
    ///
    /// # Errors
    ///
    /// Same as [`Manager::allocate()`].
    pub fn allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        self.with(|manager| manager.allocate(size, alignment))
    }

    /// See [`Manager::retain()`].
    ///
    /// # Errors
    ///
    /// Same as [`Manager::retain()`].
    pub fn retain(&self, ptr: NonNull<u8>) -> Result<()> {
        self.with(|manager| manager.retain(ptr))
    }

    /// See [`Manager::release()`].
    ///
    /// # Errors
    ///
    /// Same as [`Manager::release()`].
    pub fn release(&self, ptr: NonNull<u8>) -> Result<()> {
        self.with(|manager| manager.release(ptr))
    }

    /// See [`Manager::reallocate()`].
    ///
    /// # Errors
    ///
    /// Same as [`Manager::reallocate()`].
    pub fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        alignment: usize,
    ) -> Result<Option<NonNull<u8>>> {
        self.with(|manager| manager.reallocate(ptr, new_size, alignment))
    }

    /// See [`Manager::copy()`].
    ///
    /// # Errors
    ///
    /// Same as [`Manager::copy()`].
    pub fn copy(&self, src: NonNull<u8>, size: usize) -> Result<NonNull<u8>> {
        self.with(|manager| manager.copy(src, size))
    }

    /// See [`Manager::defragment()`].
    pub fn defragment(&self) -> DefragReport {
        self.with(Manager::defragment)
    }

    /// See [`Manager::describe()`].
    #[must_use]
    pub fn describe(&self) -> Snapshot {
        self.with(|manager| manager.describe())
    }

    /// See [`Manager::ref_count()`].
    #[must_use]
    pub fn ref_count(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.with(|manager| manager.ref_count(ptr))
    }

    /// See [`Manager::len()`].
    #[must_use]
    pub fn len(&self) -> usize {
        self.with(|manager| manager.len())
    }

    /// See [`Manager::is_empty()`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.with(|manager| manager.is_empty())
    }

    /// Returns the manager if this is the last handle to it.
    ///
    /// # Errors
    ///
    /// Returns the handle unchanged if other handles still exist.
    pub fn try_into_inner(self) -> StdResult<Manager, Self> {
        Arc::try_unwrap(self.inner)
            .map(|mutex| mutex.into_inner().expect(ERR_POISONED_LOCK))
            .map_err(|inner| Self { inner })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(SharedManager: Send, Sync, Clone);

    #[test]
    fn handles_share_one_manager() {
        let shared = SharedManager::new();
        let other = shared.clone();

        let ptr = shared.allocate(32, 8).unwrap();
        other.retain(ptr).unwrap();

        assert_eq!(shared.ref_count(ptr), Some(2));
        assert_eq!(other.len(), 1);

        other.release(ptr).unwrap();
        shared.release(ptr).unwrap();
        assert!(shared.is_empty());
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let shared = SharedManager::new();
        shared.create_pool(16, 32, 8).unwrap();

        let workers = (0..4)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    (0..16)
                        .map(|_| shared.allocate(16, 8).unwrap().as_ptr() as usize)
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut addresses = workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect::<Vec<_>>();

        addresses.sort_unstable();
        addresses.dedup();
        assert_eq!(addresses.len(), 64);
        assert_eq!(shared.len(), 64);

        let snapshot = shared.describe();
        assert_eq!(snapshot.pools[0].free, 0);
    }

    #[test]
    fn try_into_inner_requires_last_handle() {
        let shared = SharedManager::new();
        let other = shared.clone();

        let shared = shared.try_into_inner().unwrap_err();
        drop(other);

        let manager = shared.try_into_inner().unwrap();
        assert!(manager.is_empty());
    }
}
