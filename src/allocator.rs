//! The free list allocator.
//!
//! Every byte of the region belongs to exactly one block. Blocks are laid out back to
//! back (the ledger): the next block is found by skipping the header and payload of the
//! current one, the previous block is remembered in the header. Free blocks are also
//! threaded onto a doubly linked registry whose links live in their unused payload.
//!
//! ```text
//!   allocated:  [ capacity | prev ][ payload ................ ]
//!   free:       [ capacity | prev ][ next free | prev free ][ ... ]
//! ```
//!
//! All links are byte offsets from the region base.

use core::ptr::{self, NonNull};

use sptr::Strict;

use crate::block::{round_up, BlockHeader, BlockState, ALIGNMENT, HEADER_SIZE, MAX_CAPACITY, NIL};
use crate::error::AllocatorError;
use crate::region::RegionProvider;

/// Offset of the ledger back-link inside a block
const PREV_WORD: usize = size_of::<usize>();
/// Offset of the next registry link inside a free block
const NEXT_FREE_WORD: usize = HEADER_SIZE;
/// Offset of the previous registry link inside a free block
const PREV_FREE_WORD: usize = HEADER_SIZE + size_of::<usize>();

/// A first-fit allocator with an explicit free list, immediate coalescing and block
/// splitting, working inside a single growable [`RegionProvider`].
pub struct FreeListAllocator<R> {
    region: R,
    free_head: Option<usize>,
    tail: Option<usize>,
    last_error: Option<AllocatorError>,
}

/// A snapshot of one block in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the block header from the region base
    pub offset: usize,
    /// Offset of the previous block in the ledger
    pub prev: Option<usize>,
    /// State and payload capacity
    pub state: BlockState,
}

/// Summary of the heap, gathered with one walk of the ledger.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes requested from the region so far
    pub arena_bytes: usize,
    /// Blocks in the ledger
    pub blocks: usize,
    /// Blocks currently free
    pub free_blocks: usize,
    /// Payload bytes held by free blocks
    pub free_bytes: usize,
    /// Payload bytes held by allocated blocks
    pub allocated_bytes: usize,
    /// Capacity of the largest free block
    pub largest_free: usize,
}

fn decode(word: usize) -> Option<usize> {
    (word != NIL).then_some(word)
}

fn encode(link: Option<usize>) -> usize {
    link.unwrap_or(NIL)
}

impl<R> FreeListAllocator<R> {
    /// Create an allocator over `region`. [`initialize`](Self::initialize) must run
    /// before the first allocation; [`with_region`](Self::with_region) does both.
    pub const fn new(region: R) -> Self {
        Self {
            region,
            free_head: None,
            tail: None,
            last_error: None,
        }
    }

    /// The region backing this allocator
    pub fn region(&self) -> &R {
        &self.region
    }

    pub(crate) fn free_head(&self) -> Option<usize> {
        self.free_head
    }

    pub(crate) fn tail(&self) -> Option<usize> {
        self.tail
    }
}

impl<R: RegionProvider> FreeListAllocator<R> {
    /// Create an allocator over `region` and initialize it.
    pub fn with_region(region: R) -> Self {
        let mut allocator = Self::new(region);
        allocator.initialize();
        allocator
    }

    /// Forget every block and give the whole region back. Calling it twice in a row has
    /// the same effect as calling it once.
    ///
    /// Pointers handed out before are invalidated.
    pub fn initialize(&mut self) {
        self.region.reset();
        self.free_head = None;
        self.tail = None;
        self.last_error = None;
        ainfo!("Heap initialized at {:#x}", Strict::addr(self.region.base().as_ptr()));
    }

    /// Replace the region and re-initialize, returning the previous region.
    pub fn attach(&mut self, region: R) -> R {
        let previous = core::mem::replace(&mut self.region, region);
        self.initialize();
        previous
    }

    /// The most recent failure reported by [`allocate`](Self::allocate) or
    /// [`release`](Self::release), kept whether or not logging is enabled.
    pub fn last_error(&self) -> Option<AllocatorError> {
        self.last_error
    }

    /// Bytes requested from the region so far. This only ever grows until the next
    /// [`initialize`](Self::initialize).
    pub fn high_water(&self) -> usize {
        self.region.high_water()
    }

    fn word(&self, offset: usize) -> *mut usize {
        self.region.base().as_ptr().wrapping_add(offset).cast()
    }

    fn read_word(&self, offset: usize) -> usize {
        debug_assert!(offset + size_of::<usize>() <= self.high_water());
        // SAFETY: callers only pass word offsets inside the ledger, which the region keeps
        // valid, initialized, and aligned
        unsafe { self.word(offset).read() }
    }

    fn write_word(&mut self, offset: usize, value: usize) {
        debug_assert!(offset + size_of::<usize>() <= self.high_water());
        // SAFETY: as in `read_word`
        unsafe { self.word(offset).write(value) }
    }

    pub(crate) fn header(&self, block: usize) -> BlockHeader {
        BlockHeader::from_bits_retain(self.read_word(block))
    }

    pub(crate) fn state(&self, block: usize) -> BlockState {
        self.header(block).state()
    }

    pub(crate) fn set_state(&mut self, block: usize, state: BlockState) {
        self.write_word(block, BlockHeader::new(state).bits());
    }

    pub(crate) fn prev_block(&self, block: usize) -> Option<usize> {
        decode(self.read_word(block + PREV_WORD))
    }

    pub(crate) fn set_prev_block(&mut self, block: usize, prev: Option<usize>) {
        self.write_word(block + PREV_WORD, encode(prev));
    }

    /// Offset one past the payload of `block`, where its ledger successor would start
    pub(crate) fn extent_end(&self, block: usize) -> Option<usize> {
        block
            .checked_add(HEADER_SIZE)?
            .checked_add(self.header(block).capacity())
    }

    /// The ledger successor of `block`, `None` at the tail
    pub(crate) fn next_block(&self, block: usize) -> Option<usize> {
        let high_water = self.high_water();
        self.extent_end(block)
            .filter(|&next| next.saturating_add(HEADER_SIZE) <= high_water)
    }

    pub(crate) fn next_free(&self, block: usize) -> Option<usize> {
        decode(self.read_word(block + NEXT_FREE_WORD))
    }

    pub(crate) fn prev_free(&self, block: usize) -> Option<usize> {
        decode(self.read_word(block + PREV_FREE_WORD))
    }

    pub(crate) fn set_next_free(&mut self, block: usize, next: Option<usize>) {
        self.write_word(block + NEXT_FREE_WORD, encode(next));
    }

    fn set_prev_free(&mut self, block: usize, prev: Option<usize>) {
        self.write_word(block + PREV_FREE_WORD, encode(prev));
    }

    fn info(&self, block: usize) -> BlockInfo {
        BlockInfo {
            offset: block,
            prev: self.prev_block(block),
            state: self.state(block),
        }
    }

    /// Walk the ledger from the lowest block to the tail
    pub fn blocks(&self) -> Blocks<'_, R> {
        Blocks {
            allocator: self,
            cursor: (self.high_water() >= HEADER_SIZE).then_some(0),
        }
    }

    /// Walk the free registry from its head
    pub fn free_blocks(&self) -> FreeBlocks<'_, R> {
        FreeBlocks {
            allocator: self,
            cursor: self.free_head,
        }
    }

    /// Push `block` onto the front of the registry
    fn push_free(&mut self, block: usize) {
        let head = self.free_head;
        self.set_prev_free(block, None);
        self.set_next_free(block, head);
        if let Some(head) = head {
            self.set_prev_free(head, Some(block));
        }
        self.free_head = Some(block);
    }

    /// Unlink `block` from the registry
    fn unlink_free(&mut self, block: usize) {
        if self.free_head.is_none() {
            return;
        }
        let prev = self.prev_free(block);
        let next = self.next_free(block);
        match (prev, next) {
            (Some(prev), Some(next)) => {
                self.set_next_free(prev, Some(next));
                self.set_prev_free(next, Some(prev));
            }
            (None, Some(next)) => {
                self.free_head = Some(next);
                self.set_prev_free(next, None);
            }
            (Some(prev), None) => self.set_next_free(prev, None),
            (None, None) => self.free_head = None,
        }
    }

    /// Find a free block that can hold `request` bytes: the tail if it fits, otherwise
    /// the first fit in registry order.
    fn search(&self, request: usize) -> Option<usize> {
        if let Some(tail) = self.tail {
            if self.state(tail).fits(request) {
                return Some(tail);
            }
        }
        self.free_blocks()
            .find(|block| block.state.fits(request))
            .map(|block| block.offset)
    }

    /// Allocate at least `size` bytes, aligned to [`ALIGNMENT`].
    pub fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocatorError> {
        if size == 0 {
            return Err(AllocatorError::ZeroSize);
        }
        let request = round_up(size)
            .filter(|&request| request <= MAX_CAPACITY)
            .ok_or(AllocatorError::TooLarge(size))?;

        let block = match self.search(request) {
            Some(block) => self.place(block, request),
            None => self.extend(request)?,
        };

        atrace!("Allocated {} bytes at block {:#x}", size, block);
        Ok(self.payload(block))
    }

    /// Allocate at least `size` bytes, returning null for a zero size or when the region
    /// is out of memory. Out of memory is logged as a warning while logging is enabled,
    /// and always kept in [`last_error`](Self::last_error).
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        match self.try_allocate(size) {
            Ok(ptr) => ptr.as_ptr(),
            Err(AllocatorError::ZeroSize) => ptr::null_mut(),
            Err(err) => {
                awarn!("Failed to allocate {} bytes: {}", size, err);
                self.last_error = Some(err);
                ptr::null_mut()
            }
        }
    }

    /// Hand out the free `block` for `request` bytes, splitting off the tail of the block
    /// if it can stand on its own as a free block.
    fn place(&mut self, block: usize, request: usize) -> usize {
        let capacity = self.state(block).capacity();
        self.unlink_free(block);

        if capacity > request + HEADER_SIZE {
            let successor = self.next_block(block);
            let remainder = block + HEADER_SIZE + request;

            self.set_state(block, BlockState::Allocated { capacity: request });
            self.set_state(
                remainder,
                BlockState::Free {
                    capacity: capacity - request - HEADER_SIZE,
                },
            );
            self.set_prev_block(remainder, Some(block));
            match successor {
                Some(successor) => self.set_prev_block(successor, Some(remainder)),
                None => self.tail = Some(remainder),
            }
            self.push_free(remainder);
            atrace!("Split block {:#x}, remainder {:#x}", block, remainder);
        } else {
            // Too little left over to host a header and the registry links
            self.set_state(block, BlockState::Allocated { capacity });
        }
        block
    }

    /// Append a new allocated block of `request` bytes at the ledger tail
    fn extend(&mut self, request: usize) -> Result<usize, AllocatorError> {
        let block = self.region.grow(HEADER_SIZE + request).map_err(|err| {
            awarn!("Region refused to grow by {} bytes: {}", HEADER_SIZE + request, err);
            AllocatorError::from(err)
        })?;
        debug_assert_eq!(
            self.tail.and_then(|tail| self.extent_end(tail)).unwrap_or(0),
            block
        );

        self.set_state(block, BlockState::Allocated { capacity: request });
        self.set_prev_block(block, self.tail);
        self.tail = Some(block);
        adebug!("Grew region to {:#x} bytes", self.high_water());
        Ok(block)
    }

    fn payload(&self, block: usize) -> NonNull<u8> {
        // SAFETY: the payload of a ledger block starts inside the region
        unsafe { self.region.base().add(block + HEADER_SIZE) }
    }

    /// Map a payload pointer back to its block, rejecting anything that does not sit
    /// exactly on a block of the ledger.
    fn locate(&self, ptr: NonNull<u8>) -> Result<usize, AllocatorError> {
        let addr = Strict::addr(ptr.as_ptr());
        let invalid = AllocatorError::InvalidPointer(addr);
        let high_water = self.high_water();

        let block = addr
            .checked_sub(Strict::addr(self.region.base().as_ptr()))
            .and_then(|offset| offset.checked_sub(HEADER_SIZE))
            .ok_or(invalid)?;
        if block % ALIGNMENT != 0 || block.saturating_add(HEADER_SIZE + ALIGNMENT) > high_water {
            return Err(invalid);
        }

        let header = self.header(block);
        let in_bounds = self.extent_end(block).is_some_and(|end| end <= high_water);
        if !header.is_well_formed() || header.capacity() == 0 || !in_bounds {
            return Err(invalid);
        }

        let linked = match self.prev_block(block) {
            None => block == 0,
            Some(prev) => {
                prev < block && prev % ALIGNMENT == 0 && self.extent_end(prev) == Some(block)
            }
        };
        if !linked {
            return Err(invalid);
        }
        Ok(block)
    }

    /// Release a pointer returned by [`allocate`](Self::allocate). Null is ignored.
    ///
    /// Pointers that do not sit on a ledger block and blocks that are already free are
    /// reported as errors and leave the allocator untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by this allocator, and must not be used
    /// after this call. The misuse checks are cheap, not exhaustive: a forged pointer
    /// that lines up with stale header words can still corrupt the heap.
    pub unsafe fn try_release(&mut self, ptr: *mut u8) -> Result<(), AllocatorError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };
        let block = self.locate(ptr)?;
        let capacity = match self.state(block) {
            BlockState::Allocated { capacity } => capacity,
            BlockState::Free { .. } => {
                return Err(AllocatorError::DoubleFree(Strict::addr(ptr.as_ptr())));
            }
        };

        self.set_state(block, BlockState::Free { capacity });
        atrace!("Released block {:#x} ({} bytes)", block, capacity);
        self.coalesce(block);
        Ok(())
    }

    /// Release a pointer returned by [`allocate`](Self::allocate), logging misuse
    /// instead of returning it.
    ///
    /// # Safety
    ///
    /// See [`try_release`](Self::try_release).
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        // SAFETY: same contract as ours
        if let Err(err) = unsafe { self.try_release(ptr) } {
            aerror!("Failed to release: {}", err);
            self.last_error = Some(err);
        }
    }

    /// Merge the freshly freed `block` with free ledger neighbours, then put the result
    /// on the registry. Neighbours never need more than one merge each, since no two
    /// free blocks are ever left adjacent.
    fn coalesce(&mut self, block: usize) {
        let mut block = block;

        if let Some(prev) = self.prev_block(block) {
            if let BlockState::Free { capacity } = self.state(prev) {
                self.unlink_free(prev);
                let merged = capacity + HEADER_SIZE + self.state(block).capacity();
                self.set_state(prev, BlockState::Free { capacity: merged });
                block = prev;
                self.relink_successor(block);
                atrace!("Merged into previous block {:#x}", block);
            }
        }

        if let Some(next) = self.next_block(block) {
            if let BlockState::Free { capacity } = self.state(next) {
                self.unlink_free(next);
                let merged = self.state(block).capacity() + HEADER_SIZE + capacity;
                self.set_state(block, BlockState::Free { capacity: merged });
                self.relink_successor(block);
                atrace!("Merged next block {:#x} into {:#x}", next, block);
            }
        }

        self.push_free(block);
    }

    /// Point the ledger successor of `block` (or the tail) back at `block`
    fn relink_successor(&mut self, block: usize) {
        match self.next_block(block) {
            Some(successor) => self.set_prev_block(successor, Some(block)),
            None => self.tail = Some(block),
        }
    }

    /// Payload bytes usable behind `ptr`, at least what was asked for.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, AllocatorError> {
        let block = self.locate(ptr)?;
        match self.state(block) {
            BlockState::Allocated { capacity } => Ok(capacity),
            BlockState::Free { .. } => Err(AllocatorError::DoubleFree(Strict::addr(ptr.as_ptr()))),
        }
    }

    /// Gather [`HeapStats`] with one walk of the ledger
    pub fn stats(&self) -> HeapStats {
        let initial = HeapStats {
            arena_bytes: self.high_water(),
            ..HeapStats::default()
        };
        self.blocks().fold(initial, |mut stats, block| {
            stats.blocks += 1;
            match block.state {
                BlockState::Free { capacity } => {
                    stats.free_blocks += 1;
                    stats.free_bytes += capacity;
                    stats.largest_free = stats.largest_free.max(capacity);
                }
                BlockState::Allocated { capacity } => stats.allocated_bytes += capacity,
            }
            stats
        })
    }
}

/// Iterator over the ledger, see [`FreeListAllocator::blocks`]
pub struct Blocks<'a, R> {
    allocator: &'a FreeListAllocator<R>,
    cursor: Option<usize>,
}

impl<R: RegionProvider> Iterator for Blocks<'_, R> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.cursor?;
        self.cursor = self.allocator.next_block(block);
        Some(self.allocator.info(block))
    }
}

/// Iterator over the free registry, see [`FreeListAllocator::free_blocks`]
pub struct FreeBlocks<'a, R> {
    allocator: &'a FreeListAllocator<R>,
    cursor: Option<usize>,
}

impl<R: RegionProvider> Iterator for FreeBlocks<'_, R> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.cursor?;
        self.cursor = self.allocator.next_free(block);
        Some(self.allocator.info(block))
    }
}
