//! Component-state blobs embedded in the super block.
//!
//! Each blob is a 20-byte header `{id, major, minor, size}` followed by the
//! payload. The payload always begins at byte 24; the four bytes after the
//! header are reserved zeros. `size` counts payload bytes only.

use alloc::vec;
use alloc::vec::Vec;

use crate::encoding::{get_u32, get_u64, put_u32, put_u64};
use crate::errors::{VdoError, VdoResult};
use crate::types::SequenceNumber;

/// Component ids.
pub const COMPONENT_BLOCK_MAP: u32 = 1;
pub const COMPONENT_RECOVERY_JOURNAL: u32 = 2;
pub const COMPONENT_SLAB_DEPOT: u32 = 3;
pub const COMPONENT_LAYOUT: u32 = 4;

/// Offset at which every blob payload begins.
pub const COMPONENT_PAYLOAD_OFFSET: usize = 24;

fn encode_header(out: &mut Vec<u8>, id: u32, major: u32, minor: u32, size: u64) {
    let base = out.len();
    out.resize(base + COMPONENT_PAYLOAD_OFFSET, 0);
    put_u32(out, base, id);
    put_u32(out, base + 4, major);
    put_u32(out, base + 8, minor);
    put_u64(out, base + 12, size);
}

fn check_header(
    blob: &[u8],
    id: u32,
    major: u32,
    minor: u32,
    size: u64,
) -> VdoResult<()> {
    if blob.len() < COMPONENT_PAYLOAD_OFFSET + size as usize {
        return Err(VdoError::OutOfRange);
    }
    if get_u32(blob, 0) != id
        || get_u32(blob, 4) != major
        || get_u32(blob, 8) != minor
        || get_u64(blob, 12) != size
    {
        return Err(VdoError::OutOfRange);
    }
    Ok(())
}

/// Persistent state of the recovery journal, format 7.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryJournalState {
    /// Sequence number to resume appending from.
    pub journal_start: SequenceNumber,
    pub logical_blocks_used: u64,
    pub block_map_data_blocks: u64,
}

impl RecoveryJournalState {
    pub const SIZE: usize = COMPONENT_PAYLOAD_OFFSET + 24;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        encode_header(&mut out, COMPONENT_RECOVERY_JOURNAL, 7, 0, 24);
        let mut payload = vec![0u8; 24];
        put_u64(&mut payload, 0, self.journal_start);
        put_u64(&mut payload, 8, self.logical_blocks_used);
        put_u64(&mut payload, 16, self.block_map_data_blocks);
        out.extend_from_slice(&payload);
        out
    }

    pub fn decode(blob: &[u8]) -> VdoResult<RecoveryJournalState> {
        check_header(blob, COMPONENT_RECOVERY_JOURNAL, 7, 0, 24)?;
        let p = COMPONENT_PAYLOAD_OFFSET;
        Ok(RecoveryJournalState {
            journal_start: get_u64(blob, p),
            logical_blocks_used: get_u64(blob, p + 8),
            block_map_data_blocks: get_u64(blob, p + 16),
        })
    }
}

/// Persistent state of the slab depot, format 2.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlabDepotState {
    pub slab_origin: u64,
    pub slab_size: u64,
    pub slab_journal_blocks: u64,
    pub slab_count: u64,
    pub physical_zones: u64,
}

impl SlabDepotState {
    pub const SIZE: usize = COMPONENT_PAYLOAD_OFFSET + 40;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        encode_header(&mut out, COMPONENT_SLAB_DEPOT, 2, 0, 40);
        let mut payload = vec![0u8; 40];
        put_u64(&mut payload, 0, self.slab_origin);
        put_u64(&mut payload, 8, self.slab_size);
        put_u64(&mut payload, 16, self.slab_journal_blocks);
        put_u64(&mut payload, 24, self.slab_count);
        put_u64(&mut payload, 32, self.physical_zones);
        out.extend_from_slice(&payload);
        out
    }

    pub fn decode(blob: &[u8]) -> VdoResult<SlabDepotState> {
        check_header(blob, COMPONENT_SLAB_DEPOT, 2, 0, 40)?;
        let p = COMPONENT_PAYLOAD_OFFSET;
        Ok(SlabDepotState {
            slab_origin: get_u64(blob, p),
            slab_size: get_u64(blob, p + 8),
            slab_journal_blocks: get_u64(blob, p + 16),
            slab_count: get_u64(blob, p + 24),
            physical_zones: get_u64(blob, p + 32),
        })
    }
}

/// Persistent state of the block map, format 2.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockMapState {
    pub root_origin: u64,
    pub root_count: u64,
    pub logical_blocks: u64,
}

impl BlockMapState {
    pub const SIZE: usize = COMPONENT_PAYLOAD_OFFSET + 24;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        encode_header(&mut out, COMPONENT_BLOCK_MAP, 2, 0, 24);
        let mut payload = vec![0u8; 24];
        put_u64(&mut payload, 0, self.root_origin);
        put_u64(&mut payload, 8, self.root_count);
        put_u64(&mut payload, 16, self.logical_blocks);
        out.extend_from_slice(&payload);
        out
    }

    pub fn decode(blob: &[u8]) -> VdoResult<BlockMapState> {
        check_header(blob, COMPONENT_BLOCK_MAP, 2, 0, 24)?;
        let p = COMPONENT_PAYLOAD_OFFSET;
        Ok(BlockMapState {
            root_origin: get_u64(blob, p),
            root_count: get_u64(blob, p + 8),
            logical_blocks: get_u64(blob, p + 16),
        })
    }
}

/// Fixed region table, format 3.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LayoutState {
    pub journal_origin: u64,
    pub journal_blocks: u64,
    pub summary_origin: u64,
    pub root_origin: u64,
    pub root_count: u64,
    pub slab_origin: u64,
    pub physical_blocks: u64,
}

impl LayoutState {
    pub const SIZE: usize = COMPONENT_PAYLOAD_OFFSET + 56;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        encode_header(&mut out, COMPONENT_LAYOUT, 3, 0, 56);
        let mut payload = vec![0u8; 56];
        put_u64(&mut payload, 0, self.journal_origin);
        put_u64(&mut payload, 8, self.journal_blocks);
        put_u64(&mut payload, 16, self.summary_origin);
        put_u64(&mut payload, 24, self.root_origin);
        put_u64(&mut payload, 32, self.root_count);
        put_u64(&mut payload, 40, self.slab_origin);
        put_u64(&mut payload, 48, self.physical_blocks);
        out.extend_from_slice(&payload);
        out
    }

    pub fn decode(blob: &[u8]) -> VdoResult<LayoutState> {
        check_header(blob, COMPONENT_LAYOUT, 3, 0, 56)?;
        let p = COMPONENT_PAYLOAD_OFFSET;
        Ok(LayoutState {
            journal_origin: get_u64(blob, p),
            journal_blocks: get_u64(blob, p + 8),
            summary_origin: get_u64(blob, p + 16),
            root_origin: get_u64(blob, p + 24),
            root_count: get_u64(blob, p + 32),
            slab_origin: get_u64(blob, p + 40),
            physical_blocks: get_u64(blob, p + 48),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_journal_state_matches_fixture() {
        let state = RecoveryJournalState {
            journal_start: 0x1e,
            logical_blocks_used: 0x123,
            block_map_data_blocks: 0x0001_abcd_0403_0201,
        };
        let expected: [u8; 48] = [
            0x02, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x18, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1e, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x23, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02,
            0x03, 0x04, 0xcd, 0xab, 0x01, 0x00,
        ];
        assert_eq!(state.encode()[..], expected[..]);
        assert_eq!(RecoveryJournalState::decode(&expected).unwrap(), state);
    }

    #[test]
    fn wrong_component_id_rejected() {
        let state = RecoveryJournalState::default();
        let blob = state.encode();
        assert_eq!(SlabDepotState::decode(&blob), Err(VdoError::OutOfRange));
    }

    #[test]
    fn depot_state_round_trip() {
        let state = SlabDepotState {
            slab_origin: 100,
            slab_size: 1 << 15,
            slab_journal_blocks: 8,
            slab_count: 12,
            physical_zones: 2,
        };
        assert_eq!(SlabDepotState::decode(&state.encode()).unwrap(), state);
    }

    #[test]
    fn block_map_state_round_trip() {
        let state = BlockMapState {
            root_origin: 70,
            root_count: 1,
            logical_blocks: 8192,
        };
        assert_eq!(BlockMapState::decode(&state.encode()).unwrap(), state);
    }

    #[test]
    fn layout_state_round_trip() {
        let state = LayoutState {
            journal_origin: 1,
            journal_blocks: 32,
            summary_origin: 33,
            root_origin: 97,
            root_count: 2,
            slab_origin: 128,
            physical_blocks: 1 << 20,
        };
        assert_eq!(LayoutState::decode(&state.encode()).unwrap(), state);
    }

    #[test]
    fn truncated_blob_rejected() {
        let blob = RecoveryJournalState::default().encode();
        assert_eq!(
            RecoveryJournalState::decode(&blob[..40]),
            Err(VdoError::OutOfRange)
        );
    }
}
