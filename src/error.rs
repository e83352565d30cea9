//! Error types

/// Errors reported by a [`RegionProvider`](crate::RegionProvider) when asked to grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegionError {
    /// The region cannot grow by the requested amount
    #[error("region exhausted: {requested} bytes requested, {remaining} remaining")]
    Exhausted {
        /// Bytes asked for
        requested: usize,
        /// Bytes the region could still hand out
        remaining: usize,
    },
    /// The region has no backing memory at all
    #[error("region has no backing memory")]
    Unavailable,
}

/// Errors returned by the fallible allocator entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocatorError {
    /// Zero-sized allocations are never served
    #[error("zero-sized allocation requested")]
    ZeroSize,
    /// The request cannot be described by a block header
    #[error("allocation of {0} bytes exceeds the largest block")]
    TooLarge(usize),
    /// The memory region is out of space. Smaller requests may still succeed.
    #[error("out of memory: {0}")]
    OutOfMemory(RegionError),
    /// The memory region failed to produce memory
    #[error("memory region failed: {0}")]
    ProviderFailure(RegionError),
    /// The pointer does not point at the payload of a block of this allocator
    #[error("pointer {0:#x} was not issued by this allocator")]
    InvalidPointer(usize),
    /// The pointer has already been released
    #[error("pointer {0:#x} was already released")]
    DoubleFree(usize),
}

impl From<RegionError> for AllocatorError {
    fn from(err: RegionError) -> Self {
        match err {
            RegionError::Exhausted { .. } => Self::OutOfMemory(err),
            RegionError::Unavailable => Self::ProviderFailure(err),
        }
    }
}
