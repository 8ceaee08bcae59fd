//! Address types and the small value types shared across components.

use crate::constants::{COMPRESSED_FRAGMENTS_PER_BLOCK, MAX_MAPPED_PBN};
use crate::errors::{VdoError, VdoResult};

/// Logical block number, addressed by the consumer above.
pub type Lbn = u64;

/// Physical block number on the backing device.
pub type Pbn = u64;

/// Block offset within a slab.
pub type Sbn = u64;

/// Monotonic sequence number of a journal block.
pub type SequenceNumber = u64;

/// Index of a slab within the depot.
pub type SlabNumber = u64;

/// Zone index within a zone type.
pub type ZoneId = u8;

/// The zero PBN, used by unmapped entries.
pub const ZERO_BLOCK: Pbn = 0;

/// The state half of a block-map entry.
///
/// The packed 4-bit field encodes exactly one of three variants: unmapped,
/// a full data block, or a fragment slot within a compressed container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    Unmapped,
    Uncompressed,
    Compressed(u8),
}

impl MappingState {
    /// Numeric value of the first compressed state.
    pub const COMPRESSED_BASE: u8 = 2;

    /// Decode a 4-bit state value.
    pub fn from_raw(raw: u8) -> VdoResult<MappingState> {
        match raw {
            0 => Ok(MappingState::Unmapped),
            1 => Ok(MappingState::Uncompressed),
            s if (s as usize) < Self::COMPRESSED_BASE as usize + COMPRESSED_FRAGMENTS_PER_BLOCK => {
                Ok(MappingState::Compressed(s - Self::COMPRESSED_BASE))
            }
            _ => Err(VdoError::OutOfRange),
        }
    }

    /// The 4-bit wire value.
    pub fn to_raw(self) -> u8 {
        match self {
            MappingState::Unmapped => 0,
            MappingState::Uncompressed => 1,
            MappingState::Compressed(slot) => Self::COMPRESSED_BASE + slot,
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, MappingState::Compressed(_))
    }
}

/// A decoded block-map entry: where a logical block lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub pbn: Pbn,
    pub state: MappingState,
}

impl Mapping {
    /// The canonical unmapped entry.
    pub const UNMAPPED: Mapping = Mapping {
        pbn: ZERO_BLOCK,
        state: MappingState::Unmapped,
    };

    /// A mapping to a full data block.
    pub fn uncompressed(pbn: Pbn) -> Mapping {
        Mapping {
            pbn,
            state: MappingState::Uncompressed,
        }
    }

    /// A mapping to fragment `slot` of a compressed container.
    pub fn compressed(pbn: Pbn, slot: u8) -> Mapping {
        Mapping {
            pbn,
            state: MappingState::Compressed(slot),
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.state != MappingState::Unmapped
    }

    /// Enforce the packing domain: the PBN must fit 36 bits and an
    /// unmapped entry must carry the zero PBN.
    pub fn validate(&self) -> VdoResult<()> {
        if self.pbn > MAX_MAPPED_PBN {
            return Err(VdoError::OutOfRange);
        }
        if !self.is_mapped() && self.pbn != ZERO_BLOCK {
            return Err(VdoError::OutOfRange);
        }
        Ok(())
    }
}

/// A position in a journal: a block sequence number plus the entry index
/// within that block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct JournalPoint {
    pub sequence: SequenceNumber,
    pub entry: u16,
}

impl JournalPoint {
    pub fn new(sequence: SequenceNumber, entry: u16) -> JournalPoint {
        JournalPoint { sequence, entry }
    }

    /// Pack into the 64-bit on-disk form: sequence in the high 48 bits,
    /// entry index in the low 16.
    pub fn pack(&self) -> u64 {
        (self.sequence << 16) | self.entry as u64
    }

    pub fn unpack(raw: u64) -> JournalPoint {
        JournalPoint {
            sequence: raw >> 16,
            entry: (raw & 0xffff) as u16,
        }
    }

    /// True if this point was reached at or after `other`.
    pub fn covers(&self, other: &JournalPoint) -> bool {
        self >= other
    }
}

/// The two operations a recovery-journal entry can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOperation {
    /// A data-block mapping change.
    DataRemap,
    /// A block-map tree page coming into (or leaving) service.
    BlockMapRemap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_state_raw_round_trip() {
        for raw in 0u8..16 {
            let state = MappingState::from_raw(raw).unwrap();
            assert_eq!(state.to_raw(), raw);
        }
    }

    #[test]
    fn unmapped_requires_zero_pbn() {
        let bad = Mapping {
            pbn: 7,
            state: MappingState::Unmapped,
        };
        assert_eq!(bad.validate(), Err(VdoError::OutOfRange));
        assert!(Mapping::UNMAPPED.validate().is_ok());
    }

    #[test]
    fn journal_point_ordering_matches_pack_order() {
        let a = JournalPoint::new(5, 100);
        let b = JournalPoint::new(6, 0);
        assert!(b.covers(&a));
        assert!(a.pack() < b.pack());
        assert_eq!(JournalPoint::unpack(a.pack()), a);
    }
}
