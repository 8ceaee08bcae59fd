//! Block headers and the slab-summary entry.

use crate::constants::{
    BLOCK_MAP_PAGE_HEADER_SIZE, COUNTS_PER_SECTOR, JOURNAL_POINT_SIZE,
    RECOVERY_JOURNAL_HEADER_SIZE, SECTOR_SIZE, SLAB_JOURNAL_HEADER_SIZE,
};
use crate::encoding::{get_u16, get_u64, put_u16, put_u64};
use crate::errors::{VdoError, VdoResult};
use crate::types::{JournalPoint, Pbn, SequenceNumber};

/// Metadata type tag stamped in journal block headers.
pub const METADATA_TYPE_RECOVERY_JOURNAL: u8 = 1;

/// Metadata type tag stamped in slab journal block headers.
pub const METADATA_TYPE_SLAB_JOURNAL: u8 = 2;

/// Derive the check byte a journal block carries for its sequence number.
///
/// The top bit is always set so a zeroed block can never pass.
pub fn journal_check_byte(sequence: SequenceNumber) -> u8 {
    ((sequence & 0x7f) | 0x80) as u8
}

/// Header of a block-map page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMapPageHeader {
    /// Instance nonce; a mismatch marks the page as never written by this
    /// volume.
    pub nonce: u64,
    /// The page's own location, guarding against misdirected writes.
    pub pbn: Pbn,
    /// Oldest recovery-journal sequence number whose effects this page
    /// carried when it was written.
    pub recovery_lock: SequenceNumber,
    pub initialized: bool,
    /// Entries persisted by the writer; later slots are unmapped.
    pub entries_written: u16,
}

impl BlockMapPageHeader {
    /// Serialize into the page's leading header region.
    pub fn encode(&self, page: &mut [u8]) {
        put_u64(page, 0, self.nonce);
        put_u64(page, 8, self.pbn);
        put_u64(page, 16, self.recovery_lock);
        page[24] = self.initialized as u8;
        put_u16(page, 25, self.entries_written);
        for byte in &mut page[27..BLOCK_MAP_PAGE_HEADER_SIZE] {
            *byte = 0;
        }
    }

    /// Deserialize from the page's leading header region.
    pub fn decode(page: &[u8]) -> BlockMapPageHeader {
        BlockMapPageHeader {
            nonce: get_u64(page, 0),
            pbn: get_u64(page, 8),
            recovery_lock: get_u64(page, 16),
            initialized: page[24] != 0,
            entries_written: get_u16(page, 25),
        }
    }
}

/// Header of a recovery-journal block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryBlockHeader {
    pub block_map_head: SequenceNumber,
    pub slab_journal_head: SequenceNumber,
    pub sequence_number: SequenceNumber,
    pub nonce: u64,
    pub metadata_type: u8,
    pub entry_count: u16,
    pub logical_blocks_used: u64,
    pub block_map_data_blocks: u64,
    pub check_byte: u8,
    pub recovery_count: u8,
}

impl RecoveryBlockHeader {
    /// Serialize into the block's 64-byte header region. Field order and
    /// widths follow the on-disk format; bytes 53..64 are reserved zeros.
    pub fn encode(&self, block: &mut [u8]) {
        put_u64(block, 0, self.block_map_head);
        put_u64(block, 8, self.slab_journal_head);
        put_u64(block, 16, self.sequence_number);
        put_u64(block, 24, self.nonce);
        block[32] = self.metadata_type;
        put_u16(block, 33, self.entry_count);
        put_u64(block, 35, self.logical_blocks_used);
        put_u64(block, 43, self.block_map_data_blocks);
        block[51] = self.check_byte;
        block[52] = self.recovery_count;
        for byte in &mut block[53..RECOVERY_JOURNAL_HEADER_SIZE] {
            *byte = 0;
        }
    }

    /// Deserialize from a block's header region.
    pub fn decode(block: &[u8]) -> RecoveryBlockHeader {
        RecoveryBlockHeader {
            block_map_head: get_u64(block, 0),
            slab_journal_head: get_u64(block, 8),
            sequence_number: get_u64(block, 16),
            nonce: get_u64(block, 24),
            metadata_type: block[32],
            entry_count: get_u16(block, 33),
            logical_blocks_used: get_u64(block, 35),
            block_map_data_blocks: get_u64(block, 43),
            check_byte: block[51],
            recovery_count: block[52],
        }
    }

    /// Whether this header could be a block of the journal identified by
    /// `nonce` written during the lifetime numbered `recovery_count`.
    pub fn is_valid_for(&self, nonce: u64, recovery_count: u8) -> bool {
        self.nonce == nonce
            && self.metadata_type == METADATA_TYPE_RECOVERY_JOURNAL
            && self.recovery_count == recovery_count
            && self.check_byte == journal_check_byte(self.sequence_number)
    }
}

/// Header of a slab-journal block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabJournalBlockHeader {
    /// Oldest still-meaningful sequence number in this slab's journal at
    /// the time the block was written.
    pub head: SequenceNumber,
    pub sequence_number: SequenceNumber,
    /// Earliest unreaped recovery-journal point referenced by any entry in
    /// this block.
    pub recovery_point: JournalPoint,
    /// Newest recovery-journal point captured by this block. Replay after
    /// a crash re-journals only recovery entries past this cutoff.
    pub newest_recovery_point: JournalPoint,
    pub nonce: u64,
    pub metadata_type: u8,
    pub has_block_map_increments: bool,
    pub entry_count: u16,
}

impl SlabJournalBlockHeader {
    /// Serialize into the block's 64-byte header region.
    pub fn encode(&self, block: &mut [u8]) {
        put_u64(block, 0, self.head);
        put_u64(block, 8, self.sequence_number);
        put_u64(block, 16, self.recovery_point.pack());
        put_u64(block, 24, self.nonce);
        block[32] = self.metadata_type;
        block[33] = self.has_block_map_increments as u8;
        put_u16(block, 34, self.entry_count);
        put_u64(block, 36, self.newest_recovery_point.pack());
        for byte in &mut block[44..SLAB_JOURNAL_HEADER_SIZE] {
            *byte = 0;
        }
    }

    /// Deserialize from a block's header region.
    pub fn decode(block: &[u8]) -> SlabJournalBlockHeader {
        SlabJournalBlockHeader {
            head: get_u64(block, 0),
            sequence_number: get_u64(block, 8),
            recovery_point: JournalPoint::unpack(get_u64(block, 16)),
            newest_recovery_point: JournalPoint::unpack(get_u64(block, 36)),
            nonce: get_u64(block, 24),
            metadata_type: block[32],
            has_block_map_increments: block[33] != 0,
            entry_count: get_u16(block, 34),
        }
    }

    pub fn is_valid_for(&self, nonce: u64) -> bool {
        self.nonce == nonce && self.metadata_type == METADATA_TYPE_SLAB_JOURNAL
    }
}

/// One slab's two-byte summary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlabSummaryEntry {
    /// Ring offset of the slab journal's tail block.
    pub tail_block_offset: u8,
    /// Free-block count compressed through the zone's hint shift.
    pub fullness_hint: u8,
    /// Whether the slab's refcounts must be read at load time.
    pub load_ref_counts: bool,
    /// Whether the slab had unwritten state when last summarized.
    pub is_dirty: bool,
}

impl SlabSummaryEntry {
    /// Pack into the 16-bit wire form: offset in bits 0..8, hint in bits
    /// 8..14, the load flag in bit 14 and the dirty flag in bit 15.
    pub fn pack(&self) -> VdoResult<u16> {
        if self.fullness_hint >= 1 << 6 {
            return Err(VdoError::OutOfRange);
        }
        Ok(self.tail_block_offset as u16
            | ((self.fullness_hint as u16) << 8)
            | ((self.load_ref_counts as u16) << 14)
            | ((self.is_dirty as u16) << 15))
    }

    pub fn unpack(raw: u16) -> SlabSummaryEntry {
        SlabSummaryEntry {
            tail_block_offset: (raw & 0xff) as u8,
            fullness_hint: ((raw >> 8) & 0x3f) as u8,
            load_ref_counts: raw & (1 << 14) != 0,
            is_dirty: raw & (1 << 15) != 0,
        }
    }
}

/// Serialize one refcount sector: the commit point followed by
/// [`COUNTS_PER_SECTOR`] counters.
pub fn encode_ref_count_sector(sector: &mut [u8], commit_point: JournalPoint, counts: &[u8]) {
    debug_assert_eq!(sector.len(), SECTOR_SIZE);
    debug_assert_eq!(counts.len(), COUNTS_PER_SECTOR);
    put_u64(sector, 0, commit_point.pack());
    sector[JOURNAL_POINT_SIZE..].copy_from_slice(counts);
}

/// Deserialize one refcount sector.
pub fn decode_ref_count_sector(sector: &[u8]) -> (JournalPoint, &[u8]) {
    debug_assert_eq!(sector.len(), SECTOR_SIZE);
    (
        JournalPoint::unpack(get_u64(sector, 0)),
        &sector[JOURNAL_POINT_SIZE..],
    )
}
