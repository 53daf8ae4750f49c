use thiserror::Error;

use crate::PoolId;

/// Errors returned by [`Manager`][crate::Manager] operations.
///
/// Every variant is recoverable: the manager is left in a consistent state and the
/// operation that failed has had no effect.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum AllocError {
    /// The requested alignment was zero or not a power of two.
    #[error("invalid alignment {alignment}: must be a non-zero power of two")]
    InvalidAlignment {
        /// The alignment the caller asked for.
        alignment: usize,
    },

    /// The underlying allocation primitive could not satisfy the request, or the padded
    /// length of the request does not fit in the address space.
    #[error("out of memory: could not obtain {requested} bytes")]
    OutOfMemory {
        /// The size the caller asked for, before alignment padding.
        requested: usize,
    },

    /// The address is not a block handed out by this manager.
    #[error("unknown pointer {address:#x}: no live block is registered at this address")]
    UnknownPointer {
        /// The address the caller passed in.
        address: usize,
    },

    /// The block at this address was already released down to zero references.
    #[error("double release of {address:#x}: the block has already been released")]
    DoubleRelease {
        /// The address the caller passed in.
        address: usize,
    },

    /// Pool slots have a fixed size and cannot be reallocated.
    #[error("block {address:#x} belongs to pool {pool} and cannot be resized")]
    PoolBlockNotResizable {
        /// The address the caller passed in.
        address: usize,

        /// The pool that owns the slot.
        pool: PoolId,
    },
}

/// A specialized `Result` type for memory manager operations, returning the crate's
/// [`AllocError`] type as the error value.
pub type Result<T> = std::result::Result<T, AllocError>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(AllocError: Send, Sync, Debug, Copy);

    #[test]
    fn messages_include_hex_address() {
        let error = AllocError::UnknownPointer { address: 0x1000 };
        assert_eq!(
            error.to_string(),
            "unknown pointer 0x1000: no live block is registered at this address"
        );

        let error = AllocError::DoubleRelease { address: 0xff };
        assert!(error.to_string().contains("0xff"));
    }

    #[test]
    fn pool_error_names_pool() {
        let error = AllocError::PoolBlockNotResizable {
            address: 0x40,
            pool: PoolId::from_index(3),
        };

        assert!(error.to_string().contains("pool #3"));
    }
}
