//! Memory regions the allocator carves its blocks out of

use alloc::alloc::{alloc_zeroed, dealloc};
use core::{alloc::Layout, ptr::NonNull};

use crate::block::ALIGNMENT;
use crate::error::RegionError;

/// Size of the arena reserved by [`FixedRegion::default`], 20 MiB.
pub const DEFAULT_ARENA_CAPACITY: usize = 20 * (1 << 20);

/// A contiguous, growable region of raw memory.
///
/// The region starts empty at [`base`](Self::base) and only grows at its high end,
/// the same way `sbrk` moves the program break.
///
/// # Safety
///
/// Implementors must guarantee that:
/// - `base` never changes, and is aligned to [`ALIGNMENT`] once `grow` has succeeded.
/// - `[base, base + high_water)` is valid for reads and writes, initialized, and not
///   used for any other purpose while the region is alive.
/// - `grow` extends the region contiguously by exactly `bytes` and returns the previous
///   high-water mark, or fails without changing anything.
pub unsafe trait RegionProvider {
    /// The fixed low address of the region
    fn base(&self) -> NonNull<u8>;

    /// Number of bytes handed out so far
    fn high_water(&self) -> usize;

    /// Extend the region by `bytes`, returning the offset where the new bytes start.
    fn grow(&mut self, bytes: usize) -> Result<usize, RegionError>;

    /// Give every byte back, moving the high-water mark to zero.
    fn reset(&mut self);
}

/// A region backed by one fixed reservation with a movable break.
#[derive(Debug)]
pub struct FixedRegion {
    base: NonNull<u8>,
    capacity: usize,
    brk: usize,
    // Set when the reservation is ours to free
    layout: Option<Layout>,
}

// The region exclusively owns (or was exclusively handed) its memory.
unsafe impl Send for FixedRegion {}

impl FixedRegion {
    /// A region without any memory. Every growth request fails with
    /// [`RegionError::Unavailable`]; swap in a real region before use.
    pub const fn empty() -> Self {
        Self {
            base: NonNull::dangling(),
            capacity: 0,
            brk: 0,
            layout: None,
        }
    }

    /// Reserve `capacity` bytes from the global allocator.
    pub fn with_capacity(capacity: usize) -> Result<Self, RegionError> {
        let layout = Layout::from_size_align(capacity.max(ALIGNMENT), ALIGNMENT)
            .map_err(|_| RegionError::Unavailable)?;
        // SAFETY: the layout never has a zero size
        let base = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(base).ok_or(RegionError::Unavailable)?;
        Ok(Self {
            base,
            capacity,
            brk: 0,
            layout: Some(layout),
        })
    }

    /// Wrap `len` bytes of caller memory starting at `start`. The start is moved up to
    /// the next [`ALIGNMENT`] boundary, so the capacity may be slightly less than `len`.
    ///
    /// # Safety
    ///
    /// `start..start + len` must be valid for reads and writes and must not be used for
    /// anything else while the region is alive.
    pub unsafe fn from_raw_parts(start: NonNull<u8>, len: usize) -> Self {
        let offset = start.as_ptr().align_offset(ALIGNMENT);
        if offset >= len {
            return Self::empty();
        }
        // Stale bytes must never decode as a header
        unsafe { start.as_ptr().write_bytes(0, len) };
        Self {
            // SAFETY: offset < len, so we stay inside the caller's memory
            base: unsafe { start.add(offset) },
            capacity: len - offset,
            brk: 0,
            layout: None,
        }
    }

    /// Total bytes the region can grow to
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes the region can still grow by
    pub fn remaining(&self) -> usize {
        self.capacity - self.brk
    }
}

impl Default for FixedRegion {
    /// An owned region of [`DEFAULT_ARENA_CAPACITY`] bytes, or an empty one if the
    /// reservation fails.
    fn default() -> Self {
        Self::with_capacity(DEFAULT_ARENA_CAPACITY).unwrap_or_else(|_| Self::empty())
    }
}

unsafe impl RegionProvider for FixedRegion {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn high_water(&self) -> usize {
        self.brk
    }

    fn grow(&mut self, bytes: usize) -> Result<usize, RegionError> {
        if self.capacity == 0 {
            return Err(RegionError::Unavailable);
        }
        let remaining = self.remaining();
        if bytes > remaining {
            return Err(RegionError::Exhausted {
                requested: bytes,
                remaining,
            });
        }
        let previous = self.brk;
        self.brk += bytes;
        Ok(previous)
    }

    fn reset(&mut self) {
        self.brk = 0;
    }
}

impl Drop for FixedRegion {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: we allocated `base` with exactly this layout
            unsafe { dealloc(self.base.as_ptr(), layout) };
        }
    }
}
