//! Packed journal and mapping entries.

use static_assertions::const_assert_eq;

use crate::constants::{
    BLOCK_MAP_ENTRY_SIZE, MAX_MAPPED_PBN, RECOVERY_JOURNAL_ENTRY_SIZE, SLAB_JOURNAL_ENTRY_SIZE,
    SLAB_JOURNAL_FULL_ENTRY_SIZE,
};
use crate::errors::{VdoError, VdoResult};
use crate::types::{JournalOperation, Mapping, MappingState, Pbn, Sbn};

const_assert_eq!(BLOCK_MAP_ENTRY_SIZE, 5);
const_assert_eq!(RECOVERY_JOURNAL_ENTRY_SIZE, 11);
const_assert_eq!(SLAB_JOURNAL_ENTRY_SIZE, 3);
const_assert_eq!(SLAB_JOURNAL_FULL_ENTRY_SIZE, 4);

/// Pack a block-map entry into its 5-byte wire form.
///
/// Byte 0 carries the 4-bit state in the low nibble and bits 32..36 of the
/// PBN in the high nibble; bytes 1..5 are the low 32 PBN bits.
pub fn pack_block_map_entry(mapping: &Mapping) -> VdoResult<[u8; BLOCK_MAP_ENTRY_SIZE]> {
    mapping.validate()?;
    let mut packed = [0u8; BLOCK_MAP_ENTRY_SIZE];
    packed[0] = mapping.state.to_raw() | (((mapping.pbn >> 32) as u8) << 4);
    packed[1..5].copy_from_slice(&(mapping.pbn as u32).to_le_bytes());
    Ok(packed)
}

/// Unpack a 5-byte block-map entry.
pub fn unpack_block_map_entry(packed: &[u8; BLOCK_MAP_ENTRY_SIZE]) -> VdoResult<Mapping> {
    let state = MappingState::from_raw(packed[0] & 0x0f)?;
    let high = (packed[0] >> 4) as u64;
    let low = u32::from_le_bytes([packed[1], packed[2], packed[3], packed[4]]) as u64;
    let mapping = Mapping {
        pbn: (high << 32) | low,
        state,
    };
    mapping.validate()?;
    Ok(mapping)
}

/// A decoded recovery-journal entry.
///
/// `slot_pbn` and `slot` address the block-map page slot being updated;
/// `mapping` is the value the slot takes (for increments) or the value it
/// previously held (for decrements).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryJournalEntry {
    pub operation: JournalOperation,
    pub increment: bool,
    pub slot: u16,
    pub slot_pbn: Pbn,
    pub mapping: Mapping,
}

impl RecoveryJournalEntry {
    /// Pack into the 11-byte wire form.
    ///
    /// Bytes 0..2 hold the 10-bit slot, the operation bit, and PBN bits
    /// 31..36. Byte 2 holds PBN bits 24..31 with the increment flag in
    /// bit 7. Bytes 3..6 hold PBN bits 0..24 and bytes 6..11 the packed
    /// mapping.
    pub fn pack(&self) -> VdoResult<[u8; RECOVERY_JOURNAL_ENTRY_SIZE]> {
        if self.slot >= 1 << 10 || self.slot_pbn > MAX_MAPPED_PBN {
            return Err(VdoError::OutOfRange);
        }
        let mut packed = [0u8; RECOVERY_JOURNAL_ENTRY_SIZE];
        let op_bit = match self.operation {
            JournalOperation::DataRemap => 0u16,
            JournalOperation::BlockMapRemap => 1u16,
        };
        let word = self.slot | (op_bit << 10) | ((((self.slot_pbn >> 31) & 0x1f) as u16) << 11);
        packed[0..2].copy_from_slice(&word.to_le_bytes());
        packed[2] = ((self.slot_pbn >> 24) & 0x7f) as u8 | ((self.increment as u8) << 7);
        packed[3] = (self.slot_pbn & 0xff) as u8;
        packed[4] = ((self.slot_pbn >> 8) & 0xff) as u8;
        packed[5] = ((self.slot_pbn >> 16) & 0xff) as u8;
        packed[6..11].copy_from_slice(&pack_block_map_entry(&self.mapping)?);
        Ok(packed)
    }

    /// Unpack an 11-byte wire entry.
    pub fn unpack(packed: &[u8; RECOVERY_JOURNAL_ENTRY_SIZE]) -> VdoResult<RecoveryJournalEntry> {
        let word = u16::from_le_bytes([packed[0], packed[1]]);
        let operation = if word & (1 << 10) != 0 {
            JournalOperation::BlockMapRemap
        } else {
            JournalOperation::DataRemap
        };
        let pbn_high = ((word >> 11) & 0x1f) as u64;
        let increment = packed[2] & 0x80 != 0;
        let pbn_mid = (packed[2] & 0x7f) as u64;
        let pbn_low =
            packed[3] as u64 | ((packed[4] as u64) << 8) | ((packed[5] as u64) << 16);
        let mut mapping_bytes = [0u8; BLOCK_MAP_ENTRY_SIZE];
        mapping_bytes.copy_from_slice(&packed[6..11]);
        Ok(RecoveryJournalEntry {
            operation,
            increment,
            slot: word & 0x3ff,
            slot_pbn: (pbn_high << 31) | (pbn_mid << 24) | pbn_low,
            mapping: unpack_block_map_entry(&mapping_bytes)?,
        })
    }
}

/// A decoded slab-journal entry: one refcount adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabJournalEntry {
    pub sbn: Sbn,
    pub increment: bool,
    /// Set only in blocks whose header carries `has_block_map_increments`;
    /// marks the increment as a block-map page coming into service.
    pub block_map_increment: bool,
}

impl SlabJournalEntry {
    /// Pack into the 3-byte form used by data-only blocks. The 23-bit SBN
    /// occupies bits 0..23 and the increment flag bit 23.
    pub fn pack(&self) -> VdoResult<[u8; SLAB_JOURNAL_ENTRY_SIZE]> {
        if self.sbn >= 1 << 23 || self.block_map_increment {
            return Err(VdoError::OutOfRange);
        }
        let word = self.sbn as u32 | ((self.increment as u32) << 23);
        let bytes = word.to_le_bytes();
        Ok([bytes[0], bytes[1], bytes[2]])
    }

    /// Unpack the 3-byte form.
    pub fn unpack(packed: &[u8; SLAB_JOURNAL_ENTRY_SIZE]) -> SlabJournalEntry {
        let word = u32::from_le_bytes([packed[0], packed[1], packed[2], 0]);
        SlabJournalEntry {
            sbn: (word & 0x7f_ffff) as Sbn,
            increment: word & (1 << 23) != 0,
            block_map_increment: false,
        }
    }

    /// Pack into the 4-byte form used when the block mixes block-map
    /// increments with data remaps.
    pub fn pack_full(&self) -> VdoResult<[u8; SLAB_JOURNAL_FULL_ENTRY_SIZE]> {
        if self.sbn >= 1 << 23 {
            return Err(VdoError::OutOfRange);
        }
        let word = self.sbn as u32 | ((self.increment as u32) << 23);
        let bytes = word.to_le_bytes();
        Ok([bytes[0], bytes[1], bytes[2], self.block_map_increment as u8])
    }

    /// Unpack the 4-byte form.
    pub fn unpack_full(packed: &[u8; SLAB_JOURNAL_FULL_ENTRY_SIZE]) -> SlabJournalEntry {
        let word = u32::from_le_bytes([packed[0], packed[1], packed[2], 0]);
        SlabJournalEntry {
            sbn: (word & 0x7f_ffff) as Sbn,
            increment: word & (1 << 23) != 0,
            block_map_increment: packed[3] != 0,
        }
    }
}
