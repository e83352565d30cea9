//! Heap consistency checking and introspection

use alloc::vec::Vec;
use core::fmt;

use sptr::Strict;

use crate::allocator::FreeListAllocator;
use crate::block::{BlockState, ALIGNMENT, HEADER_SIZE};
use crate::region::RegionProvider;

/// A broken heap invariant found by [`FreeListAllocator::check_consistency`].
///
/// Blocks are identified by their offset from the region base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    /// The header or payload of a block runs past the end of the region
    #[error("block {block:#x} runs past the heap end {high_water:#x}")]
    Overrun {
        /// The offending block
        block: usize,
        /// Bytes requested from the region
        high_water: usize,
    },
    /// The header carries flag bits the allocator never sets
    #[error("block {block:#x} has a malformed header")]
    Malformed {
        /// The offending block
        block: usize,
    },
    /// A free block is too small to hold the registry links
    #[error("free block {block:#x} is too small to hold registry links")]
    Undersized {
        /// The offending block
        block: usize,
    },
    /// The back-link of a block does not name its ledger predecessor
    #[error("block {block:#x} links back to {found:x?}, expected {expected:x?}")]
    BackLink {
        /// The offending block
        block: usize,
        /// The actual predecessor
        expected: Option<usize>,
        /// The stored back-link
        found: Option<usize>,
    },
    /// Two ledger neighbours are both free, so a merge was missed
    #[error("free block {block:#x} follows another free block")]
    AdjacentFree {
        /// The second of the two free blocks
        block: usize,
    },
    /// The remembered tail is not the last block of the ledger
    #[error("tail is {found:x?}, expected {expected:x?}")]
    Tail {
        /// The last block of the ledger
        expected: Option<usize>,
        /// The remembered tail
        found: Option<usize>,
    },
    /// A registry entry is not the start of a ledger block
    #[error("registry entry {block:#x} is not a block")]
    RegistryStray {
        /// The offending entry
        block: usize,
    },
    /// A registry entry is an allocated block
    #[error("registry entry {block:#x} is allocated")]
    RegistryNotFree {
        /// The offending entry
        block: usize,
    },
    /// The previous-free link of an entry does not name the entry before it
    #[error("registry entry {block:#x} links back to {found:x?}, expected {expected:x?}")]
    RegistryBackLink {
        /// The offending entry
        block: usize,
        /// The entry walked right before it
        expected: Option<usize>,
        /// The stored link
        found: Option<usize>,
    },
    /// The registry never terminates
    #[error("free registry is circular")]
    RegistryCycle,
    /// The registry length differs from the number of free blocks
    #[error("registry holds {registry} entries, ledger has {ledger} free blocks")]
    RegistryCount {
        /// Entries walked in the registry
        registry: usize,
        /// Free blocks walked in the ledger
        ledger: usize,
    },
}

/// The outcome of a consistency check. Violations are reported, never repaired.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Blocks walked in the ledger
    pub blocks: usize,
    /// Free blocks walked in the ledger
    pub free_blocks: usize,
    /// Entries walked in the free registry
    pub registry_len: usize,
    /// Every broken invariant, in the order it was found
    pub violations: Vec<Violation>,
}

impl ConsistencyReport {
    /// Returns true if no violation was found
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

impl<R: RegionProvider> FreeListAllocator<R> {
    /// Walk the ledger and the free registry and report every broken invariant.
    ///
    /// The walk never trusts a link it has not checked, so it terminates on any heap.
    /// Violations are also logged as errors.
    pub fn check_consistency(&self) -> ConsistencyReport {
        let mut report = ConsistencyReport::default();
        let high_water = self.high_water();

        // The ledger, in address order, with the state of each block
        let mut ledger: Vec<(usize, BlockState)> = Vec::new();
        let mut expected_prev = None;
        let mut previous_free = false;
        let mut cursor = 0;
        while cursor < high_water {
            let end = cursor
                .checked_add(HEADER_SIZE)
                .filter(|&end| end <= high_water)
                .and_then(|_| self.extent_end(cursor))
                .filter(|&end| end <= high_water);
            let Some(end) = end else {
                report.violations.push(Violation::Overrun {
                    block: cursor,
                    high_water,
                });
                break;
            };

            if !self.header(cursor).is_well_formed() {
                report.violations.push(Violation::Malformed { block: cursor });
            }
            let state = self.state(cursor);
            let found = self.prev_block(cursor);
            if found != expected_prev {
                report.violations.push(Violation::BackLink {
                    block: cursor,
                    expected: expected_prev,
                    found,
                });
            }
            if state.is_free() {
                report.free_blocks += 1;
                if state.capacity() < ALIGNMENT {
                    report.violations.push(Violation::Undersized { block: cursor });
                }
                if previous_free {
                    report
                        .violations
                        .push(Violation::AdjacentFree { block: cursor });
                }
            }

            previous_free = state.is_free();
            ledger.push((cursor, state));
            report.blocks += 1;
            expected_prev = Some(cursor);
            cursor = end;
        }

        if self.tail() != expected_prev {
            report.violations.push(Violation::Tail {
                expected: expected_prev,
                found: self.tail(),
            });
        }

        // Every valid entry is a distinct free block, so walking more entries than there
        // are free blocks means the registry loops
        let mut complete = true;
        let mut previous = None;
        let mut cursor = self.free_head();
        while let Some(block) = cursor {
            let state = match ledger.binary_search_by_key(&block, |&(offset, _)| offset) {
                Ok(index) => ledger[index].1,
                Err(_) => {
                    report.violations.push(Violation::RegistryStray { block });
                    complete = false;
                    break;
                }
            };
            match state {
                BlockState::Allocated { .. } => {
                    report.violations.push(Violation::RegistryNotFree { block });
                    complete = false;
                    break;
                }
                // Already reported, and the links cannot be read
                BlockState::Free { capacity } if capacity < ALIGNMENT => {
                    complete = false;
                    break;
                }
                BlockState::Free { .. } => {}
            }
            if report.registry_len == report.free_blocks {
                report.violations.push(Violation::RegistryCycle);
                complete = false;
                break;
            }

            let found = self.prev_free(block);
            if found != previous {
                report.violations.push(Violation::RegistryBackLink {
                    block,
                    expected: previous,
                    found,
                });
            }
            report.registry_len += 1;
            previous = Some(block);
            cursor = self.next_free(block);
        }

        if complete && report.registry_len != report.free_blocks {
            report.violations.push(Violation::RegistryCount {
                registry: report.registry_len,
                ledger: report.free_blocks,
            });
        }

        for violation in &report.violations {
            aerror!("Heap check failed: {}", violation);
        }
        report
    }

    /// A printable listing of the ledger and the free registry
    pub fn dump(&self) -> HeapDump<'_, R> {
        HeapDump { allocator: self }
    }

    /// Print the heap listing to the log, whether allocator logging is enabled or not
    pub fn introspect(&self) {
        log::info!("{}", self.dump());
    }
}

/// Listing of the heap, see [`FreeListAllocator::dump`].
///
/// Meant for a heap that passes [`FreeListAllocator::check_consistency`]; the listing
/// follows the ledger and registry links as they are.
pub struct HeapDump<'a, R> {
    allocator: &'a FreeListAllocator<R>,
}

/// Prints an offset as an address, or `nil`
struct Link(usize, Option<usize>);

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.1 {
            Some(offset) => write!(f, "{:#x}", self.0 + offset),
            None => f.write_str("nil"),
        }
    }
}

impl<R: RegionProvider> fmt::Display for HeapDump<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heap = self.allocator;
        let base = Strict::addr(heap.region().base().as_ptr());
        let high_water = heap.high_water();

        writeln!(f, "heap size:\t{:#x}", high_water)?;
        writeln!(f, "heap start:\t{:#x}", base)?;
        writeln!(f, "heap end:\t{:#x}", base + high_water)?;
        writeln!(f, "free list head: {}", Link(base, heap.free_head()))?;
        writeln!(f, "tail: {}", Link(base, heap.tail()))?;

        let mut blocks = 0;
        for block in heap.blocks() {
            blocks += 1;
            write!(f, "{:#x}: {}\t", base + block.offset, block.state.capacity())?;
            match block.state {
                BlockState::Allocated { .. } => {
                    writeln!(f, "ALLOCATED\tprev: {}", Link(base, block.prev))?;
                }
                BlockState::Free { .. } => writeln!(
                    f,
                    "FREE\tnext_free: {}, prev_free: {}, prev: {}",
                    Link(base, heap.next_free(block.offset)),
                    Link(base, heap.prev_free(block.offset)),
                    Link(base, block.prev)
                )?,
            }
        }
        writeln!(f, "END OF HEAP")?;

        f.write_str("Head")?;
        // A looping registry still prints in bounded time
        for block in heap.free_blocks().take(blocks + 1) {
            write!(f, " -> {:#x}", base + block.offset)?;
        }
        writeln!(f)
    }
}

impl<R: RegionProvider> fmt::Debug for FreeListAllocator<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // One entry per ledger block, addresses in hex
        #[derive(Debug)]
        #[allow(dead_code)]
        struct Block {
            heap_ptr: Hex,
            state: BlockState,
            prev: Option<Hex>,
        }

        struct Hex(usize);

        impl fmt::Debug for Hex {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#X}", self.0)
            }
        }

        let base = Strict::addr(self.region().base().as_ptr());
        let mut list = f.debug_list();
        for block in self.blocks() {
            list.entry(&Block {
                heap_ptr: Hex(base + block.offset),
                state: block.state,
                prev: block.prev.map(|prev| Hex(base + prev)),
            });
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::block::{BlockState, ALIGNMENT, HEADER_SIZE};
    use crate::region::{FixedRegion, RegionProvider};
    use crate::FreeListAllocator;

    use super::Violation;

    fn new_heap() -> FreeListAllocator<FixedRegion> {
        FreeListAllocator::with_region(FixedRegion::with_capacity(0x4000).unwrap())
    }

    /// Allocate `count` blocks of one alignment unit
    fn fill(heap: &mut FreeListAllocator<FixedRegion>, count: usize) -> Vec<*mut u8> {
        (0..count).map(|_| heap.allocate(ALIGNMENT)).collect()
    }

    fn offset(heap: &FreeListAllocator<FixedRegion>, ptr: *mut u8) -> usize {
        ptr as usize - heap.region().base().as_ptr() as usize - HEADER_SIZE
    }

    #[test]
    fn empty_heap_is_consistent() {
        let heap = new_heap();
        let report = heap.check_consistency();
        assert!(report.is_consistent());
        assert_eq!(report.blocks, 0);
        assert_eq!(report.registry_len, 0);
    }

    #[test]
    fn healthy_heap_is_consistent() {
        let mut heap = new_heap();
        let ptrs = fill(&mut heap, 6);
        unsafe {
            heap.release(ptrs[1]);
            heap.release(ptrs[3]);
            heap.release(ptrs[4]);
        }
        let report = heap.check_consistency();
        assert!(report.is_consistent(), "{:?}", report);
        assert_eq!(report.blocks, 5);
        assert_eq!(report.free_blocks, 2);
        assert_eq!(report.registry_len, 2);
    }

    #[test]
    fn broken_back_link_is_reported() {
        let mut heap = new_heap();
        let ptrs = fill(&mut heap, 3);
        let second = offset(&heap, ptrs[1]);
        heap.set_prev_block(second, None);

        let report = heap.check_consistency();
        assert_eq!(
            report.violations,
            vec![Violation::BackLink {
                block: second,
                expected: Some(0),
                found: None,
            }]
        );
    }

    #[test]
    fn missed_merge_is_reported() {
        let mut heap = new_heap();
        let ptrs = fill(&mut heap, 3);
        unsafe { heap.release(ptrs[0]) };
        let second = offset(&heap, ptrs[1]);
        // Mark the neighbour free behind the allocator's back
        heap.set_state(
            second,
            BlockState::Free {
                capacity: ALIGNMENT,
            },
        );

        let report = heap.check_consistency();
        assert!(report
            .violations
            .contains(&Violation::AdjacentFree { block: second }));
        assert!(report.violations.contains(&Violation::RegistryCount {
            registry: 1,
            ledger: 2
        }));
    }

    #[test]
    fn circular_registry_is_reported() {
        let mut heap = new_heap();
        let ptrs = fill(&mut heap, 4);
        unsafe {
            heap.release(ptrs[0]);
            heap.release(ptrs[2]);
        }
        let head = offset(&heap, ptrs[2]);
        heap.set_next_free(head, Some(head));

        let report = heap.check_consistency();
        assert!(report.violations.contains(&Violation::RegistryCycle));
        assert!(!report.is_consistent());
    }

    #[test]
    fn allocated_registry_entry_is_reported() {
        let mut heap = new_heap();
        let ptrs = fill(&mut heap, 3);
        unsafe { heap.release(ptrs[0]) };
        let allocated = offset(&heap, ptrs[1]);
        heap.set_next_free(0, Some(allocated));

        let report = heap.check_consistency();
        assert!(report
            .violations
            .contains(&Violation::RegistryNotFree { block: allocated }));
    }

    #[test]
    fn stray_registry_entry_is_reported() {
        let mut heap = new_heap();
        let ptrs = fill(&mut heap, 3);
        unsafe { heap.release(ptrs[0]) };
        heap.set_next_free(0, Some(8));

        let report = heap.check_consistency();
        assert!(report
            .violations
            .contains(&Violation::RegistryStray { block: 8 }));
    }

    #[test]
    fn overrun_is_reported() {
        let mut heap = new_heap();
        let ptrs = fill(&mut heap, 2);
        let last = offset(&heap, ptrs[1]);
        heap.set_state(
            last,
            BlockState::Allocated {
                capacity: 4 * ALIGNMENT,
            },
        );

        let report = heap.check_consistency();
        assert_eq!(
            report.violations,
            vec![
                Violation::Overrun {
                    block: last,
                    high_water: heap.high_water(),
                },
                Violation::Tail {
                    expected: Some(0),
                    found: Some(last),
                },
            ]
        );
    }

    #[test]
    fn dump_lists_blocks_and_registry() {
        let mut heap = new_heap();
        let ptrs = fill(&mut heap, 3);
        unsafe { heap.release(ptrs[1]) };

        let dump = heap.dump().to_string();
        assert_eq!(dump.matches("ALLOCATED").count(), 2);
        assert_eq!(dump.matches("FREE").count(), 1);
        assert!(dump.contains("END OF HEAP"));
        assert!(dump.contains(&format!("Head -> {:#x}", ptrs[1] as usize - HEADER_SIZE)));
        assert!(dump.contains(&format!("heap size:\t{:#x}", heap.high_water())));
        heap.introspect();
    }

    #[test]
    fn debug_lists_blocks() {
        let mut heap = new_heap();
        fill(&mut heap, 2);
        let debug = format!("{:?}", heap);
        assert_eq!(debug.matches("heap_ptr").count(), 2);
        assert!(debug.contains("Allocated"));
    }
}
