//! A free list allocator
//!
//! [`FreeListAllocator`] manages one contiguous region that only ever grows, handed out
//! by a [`RegionProvider`]. Blocks are carved out of the region back to back; each one
//! starts with a two word header holding its capacity, its state, and the offset of the
//! block before it. Free blocks are kept on an explicit, unordered free list whose links
//! live in the otherwise unused payload.
//!
//! Allocation checks the last block first, then the free list (first fit), and grows the
//! region only when nothing fits. Oversized free blocks are split, and released blocks
//! are merged with free neighbours right away, so no two free blocks are ever adjacent.
//!
//! The allocator itself is single threaded. Wrap it in [`Locked`] to share it, or to use
//! it as a [`GlobalAlloc`].
//!
//! ```
//! use freelist_alloc::{FixedRegion, FreeListAllocator};
//!
//! let region = FixedRegion::with_capacity(4096).unwrap();
//! let mut heap = FreeListAllocator::with_region(region);
//!
//! let a = heap.allocate(40);
//! let b = heap.allocate(40);
//! unsafe { heap.release(a) };
//! assert_eq!(heap.allocate(40), a);
//! assert!(heap.check_consistency().is_consistent());
//! # unsafe { heap.release(b) };
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]
#![forbid(unsafe_op_in_unsafe_fn)]
#![allow(unstable_name_collisions)]

extern crate alloc;

#[macro_use]
mod alog;

/// The main allocator
mod allocator;
mod block;
mod check;
mod error;
mod region;

pub use allocator::{BlockInfo, Blocks, FreeBlocks, FreeListAllocator, HeapStats};
pub use block::{round_to, round_up, BlockState, ALIGNMENT, HEADER_SIZE, MAX_CAPACITY};
pub use check::{ConsistencyReport, HeapDump, Violation};
pub use error::{AllocatorError, RegionError};
pub use region::{FixedRegion, RegionProvider, DEFAULT_ARENA_CAPACITY};

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

static ALLOC_LOG: AtomicBool = AtomicBool::new(false);

/// Enables logging for the allocator. Off by default.
///
/// While it is off, failures are still recorded, see
/// [`FreeListAllocator::last_error`].
pub fn enable_logging() {
    ALLOC_LOG.store(true, Ordering::Relaxed);
}

/// Disables logging for the allocator
pub fn disable_logging() {
    ALLOC_LOG.store(false, Ordering::Relaxed);
}

pub(crate) fn should_log() -> bool {
    ALLOC_LOG.load(Ordering::Relaxed)
}

/// An allocator type, the main allocator behind a Mutex
pub type Allocator = Locked<FreeListAllocator<FixedRegion>>;

/// Allows putting a type behind a Mutex
#[derive(Debug)]
pub struct Locked<T> {
    inner: Mutex<T>,
}

impl<T> Locked<T> {
    /// Create a new Mutex locked type
    pub const fn new(inner: T) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Get the interior
    pub fn lock(&self) -> spin::MutexGuard<'_, T> {
        self.inner.lock()
    }
}

unsafe impl<R: RegionProvider> GlobalAlloc for Locked<FreeListAllocator<R>> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            aerror!(
                "Alignment {} is above the supported {}",
                layout.align(),
                ALIGNMENT
            );
            return ptr::null_mut();
        }
        self.lock().allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: `GlobalAlloc` callers only hand back pointers from `alloc`
        unsafe { self.lock().release(ptr) }
    }
}

#[cfg(test)]
#[ctor::ctor]
fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
    enable_logging();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_locked() -> Allocator {
        Locked::new(FreeListAllocator::with_region(
            FixedRegion::with_capacity(0x1000).unwrap(),
        ))
    }

    #[test]
    fn global_alloc_round_trip() {
        let allocator = new_locked();
        let layout = Layout::new::<[u64; 4]>();
        unsafe {
            let ptr = allocator.alloc(layout).cast::<[u64; 4]>();
            assert!(!ptr.is_null());
            ptr.write([1, 2, 3, 4]);
            assert_eq!(*ptr, [1, 2, 3, 4]);
            allocator.dealloc(ptr.cast(), layout);

            let again = allocator.alloc(layout);
            assert_eq!(again, ptr.cast::<u8>());
        }
        assert!(allocator.lock().check_consistency().is_consistent());
    }

    #[test]
    fn global_alloc_rejects_large_alignment() {
        let allocator = new_locked();
        let layout = Layout::from_size_align(8, ALIGNMENT * 2).unwrap();
        assert!(unsafe { allocator.alloc(layout) }.is_null());
        assert_eq!(allocator.lock().high_water(), 0);
    }

    #[test]
    fn global_alloc_realloc_copies() {
        let allocator = new_locked();
        let layout = Layout::from_size_align(16, 8).unwrap();
        unsafe {
            let ptr = allocator.alloc(layout);
            ptr.write_bytes(7, 16);
            let grown = allocator.realloc(ptr, layout, 256);
            assert!(!grown.is_null());
            assert_eq!(*grown.add(15), 7);
            allocator.dealloc(grown, Layout::from_size_align(256, 8).unwrap());
        }
        assert!(allocator.lock().check_consistency().is_consistent());
    }

    #[test]
    fn static_allocator_can_be_attached() {
        static ALLOCATOR: Allocator = Locked::new(FreeListAllocator::new(FixedRegion::empty()));

        assert!(unsafe { ALLOCATOR.alloc(Layout::new::<u32>()) }.is_null());
        ALLOCATOR
            .lock()
            .attach(FixedRegion::with_capacity(0x1000).unwrap());
        let ptr = unsafe { ALLOCATOR.alloc(Layout::new::<u32>()) };
        assert!(!ptr.is_null());
        unsafe { ALLOCATOR.dealloc(ptr, Layout::new::<u32>()) };
    }

    #[test]
    fn logging_switch() {
        enable_logging();
        assert!(should_log());
        disable_logging();
        assert!(!should_log());
        enable_logging();
    }
}
