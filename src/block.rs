//! Block header encoding and layout constants

use bitflags::bitflags;

/// The size of the block header: the capacity word followed by the offset of the
/// previous block in the ledger.
pub const HEADER_SIZE: usize = 2 * size_of::<usize>();

/// Every payload capacity is a multiple of this. It is the size of the two registry
/// links a free block keeps at the start of its payload, so any block can be freed.
pub const ALIGNMENT: usize = 2 * size_of::<usize>();

/// The largest payload capacity a single block can describe.
pub const MAX_CAPACITY: usize = (isize::MAX as usize - HEADER_SIZE) & !(ALIGNMENT - 1);

/// Encodes "no block" in a link word.
pub(crate) const NIL: usize = usize::MAX;

/// Low bits of the capacity word that never hold size information.
const FLAG_MASK: usize = ALIGNMENT - 1;

bitflags! {
    /// The first word of every block header. The capacity is always a multiple of
    /// [`ALIGNMENT`], so the low bits are free to carry the block state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct BlockHeader: usize {
        /// The block is free and linked into the free registry
        const FREE = 0b1;
    }
}

impl BlockHeader {
    /// Create a new header word for a block in `state`
    pub(crate) fn new(state: BlockState) -> Self {
        let capacity = state.capacity();
        debug_assert!(capacity % ALIGNMENT == 0);
        let mut header = Self::from_bits_retain(capacity);
        header.set(Self::FREE, state.is_free());
        header
    }

    /// Payload bytes, never counting the header
    pub(crate) fn capacity(self) -> usize {
        self.bits() & !FLAG_MASK
    }

    pub(crate) fn state(self) -> BlockState {
        let capacity = self.capacity();
        if self.contains(Self::FREE) {
            BlockState::Free { capacity }
        } else {
            BlockState::Allocated { capacity }
        }
    }

    /// Returns false if any flag bit other than the known ones is set.
    pub(crate) fn is_well_formed(self) -> bool {
        Self::from_bits(self.bits() & FLAG_MASK).is_some()
    }
}

/// The state of a block in the ledger together with its payload capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Handed out to a caller
    Allocated {
        /// Payload bytes available to the caller
        capacity: usize,
    },
    /// Sitting in the free registry
    Free {
        /// Payload bytes available for reuse
        capacity: usize,
    },
}

impl BlockState {
    /// Payload bytes of the block, whatever its state
    pub fn capacity(self) -> usize {
        match self {
            Self::Allocated { capacity } | Self::Free { capacity } => capacity,
        }
    }

    /// Returns true if the block is free
    pub fn is_free(self) -> bool {
        matches!(self, Self::Free { .. })
    }

    /// Returns true if the block is free and can hold `request` payload bytes
    pub(crate) fn fits(self, request: usize) -> bool {
        matches!(self, Self::Free { capacity } if capacity >= request)
    }
}

/// Rounds `value` up to a multiple of `round_to`, which must be a power of two.
/// Returns `None` if the result would not fit in a `usize`.
pub fn round_to(value: usize, round_to: usize) -> Option<usize> {
    debug_assert!(round_to.is_power_of_two());
    value
        .checked_add(round_to - 1)
        .map(|value| value & !(round_to - 1))
}

/// Convenience method that rounds up to the next multiple of [`ALIGNMENT`]
pub fn round_up(value: usize) -> Option<usize> {
    round_to(value, ALIGNMENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that creating a header stores capacity and state in one word
    #[test]
    fn test_header() {
        let header = BlockHeader::new(BlockState::Free {
            capacity: 3 * ALIGNMENT,
        });
        assert_eq!(header.bits(), 3 * ALIGNMENT | 1);
        assert_eq!(header.capacity(), 3 * ALIGNMENT);
        assert_eq!(
            header.state(),
            BlockState::Free {
                capacity: 3 * ALIGNMENT
            }
        );

        let header = BlockHeader::new(BlockState::Allocated {
            capacity: ALIGNMENT,
        });
        assert_eq!(header.bits(), ALIGNMENT);
        assert!(!header.state().is_free());
    }

    #[test]
    fn test_header_flags() {
        assert!(BlockHeader::from_bits_retain(ALIGNMENT | 1).is_well_formed());
        assert!(!BlockHeader::from_bits_retain(ALIGNMENT | 0b10).is_well_formed());
    }

    #[test]
    fn test_fits() {
        let free = BlockState::Free {
            capacity: 2 * ALIGNMENT,
        };
        assert!(free.fits(ALIGNMENT));
        assert!(free.fits(2 * ALIGNMENT));
        assert!(!free.fits(3 * ALIGNMENT));
        let allocated = BlockState::Allocated {
            capacity: 2 * ALIGNMENT,
        };
        assert!(!allocated.fits(ALIGNMENT));
    }

    /// Test that we always round up to the nearest multiple
    #[test]
    fn test_round_to() {
        assert_eq!(Some(8), round_to(7, 8));
        assert_eq!(Some(40), round_to(33, 8));
        assert_eq!(Some(32), round_to(32, 8));
        assert_eq!(None, round_to(usize::MAX, 8));
        assert_eq!(Some(ALIGNMENT), round_up(1));
        assert_eq!(Some(0), round_up(0));
    }

    /// Test that the layout constants agree with each other
    #[test]
    fn header_size() {
        assert_eq!(HEADER_SIZE, 2 * size_of::<usize>());
        assert_eq!(HEADER_SIZE % ALIGNMENT, 0);
        assert_eq!(MAX_CAPACITY % ALIGNMENT, 0);
        assert!(ALIGNMENT.is_power_of_two());
    }
}
