//! The super block: one block at a fixed location naming everything else.
//!
//! Holds the volume state, the recovery counters, and the component-state
//! blobs for the layout, recovery journal, slab depot, and block map. The
//! whole payload is sealed with a CRC-32; any mismatch, wrong magic, or
//! wrong version refuses the load with `OutOfRange`.

use alloc::vec;
use alloc::vec::Vec;

use crate::constants::{BLOCK_SIZE, SUPER_BLOCK_PBN};
use crate::encoding::{
    crc32, get_u32, get_u64, put_u32, put_u64, BlockMapState, LayoutState,
    RecoveryJournalState, SlabDepotState,
};
use crate::errors::{VdoError, VdoResult};
use crate::physical::PhysicalLayer;

const SUPER_BLOCK_MAGIC: u64 = 0x5644_4f5f_5355_5042; // "VDO_SUPB"
const SUPER_BLOCK_MAJOR: u32 = 12;
const SUPER_BLOCK_MINOR: u32 = 0;

/// Volume state recorded in the super block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VdoState {
    New,
    Clean,
    /// Unclean shutdown; the recovery journal is assumed consistent and
    /// must be replayed.
    Dirty,
    /// Metadata is compromised; only a full rebuild from the refcounts'
    /// point of view of the block map can restore service.
    ForceRebuild,
    /// A recovery was interrupted; resume from the persisted stage.
    Replaying,
    ReadOnlyMode,
}

impl VdoState {
    fn to_raw(self) -> u8 {
        match self {
            VdoState::New => 0,
            VdoState::Clean => 1,
            VdoState::Dirty => 2,
            VdoState::ForceRebuild => 3,
            VdoState::Replaying => 4,
            VdoState::ReadOnlyMode => 5,
        }
    }

    fn from_raw(raw: u8) -> VdoResult<VdoState> {
        Ok(match raw {
            0 => VdoState::New,
            1 => VdoState::Clean,
            2 => VdoState::Dirty,
            3 => VdoState::ForceRebuild,
            4 => VdoState::Replaying,
            5 => VdoState::ReadOnlyMode,
            _ => return Err(VdoError::OutOfRange),
        })
    }
}

/// Progress marker for crash-during-recovery. Each stage persists its
/// completion before the next begins, so an interrupted recovery redoes
/// only the unfinished stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStage {
    None,
    /// The block map has been replayed and flushed; only refcount
    /// recovery remains.
    BlockMapReplayed,
}

impl RecoveryStage {
    fn to_raw(self) -> u8 {
        match self {
            RecoveryStage::None => 0,
            RecoveryStage::BlockMapReplayed => 1,
        }
    }

    fn from_raw(raw: u8) -> VdoResult<RecoveryStage> {
        Ok(match raw {
            0 => RecoveryStage::None,
            1 => RecoveryStage::BlockMapReplayed,
            _ => return Err(VdoError::OutOfRange),
        })
    }
}

/// In-memory form of the super block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    pub nonce: u64,
    pub state: VdoState,
    pub recovery_stage: RecoveryStage,
    /// Stamped into journal blocks; distinguishes writes from before and
    /// after a recovery.
    pub recovery_count: u8,
    pub complete_recoveries: u64,
    pub read_only_recoveries: u64,
    pub layout: LayoutState,
    pub journal: RecoveryJournalState,
    pub depot: SlabDepotState,
    pub block_map: BlockMapState,
}

impl SuperBlock {
    /// Serialize to a full block image.
    pub fn encode(&self) -> Vec<u8> {
        let mut blobs = Vec::new();
        blobs.extend_from_slice(&self.layout.encode());
        blobs.extend_from_slice(&self.journal.encode());
        blobs.extend_from_slice(&self.depot.encode());
        blobs.extend_from_slice(&self.block_map.encode());

        let mut image = vec![0u8; BLOCK_SIZE];
        put_u64(&mut image, 0, SUPER_BLOCK_MAGIC);
        put_u32(&mut image, 8, SUPER_BLOCK_MAJOR);
        put_u32(&mut image, 12, SUPER_BLOCK_MINOR);
        put_u64(&mut image, 16, self.nonce);
        image[24] = self.state.to_raw();
        image[25] = self.recovery_stage.to_raw();
        image[26] = self.recovery_count;
        put_u64(&mut image, 32, self.complete_recoveries);
        put_u64(&mut image, 40, self.read_only_recoveries);
        put_u32(&mut image, 48, blobs.len() as u32);
        image[52..52 + blobs.len()].copy_from_slice(&blobs);
        let checksum = crc32(&image[..52 + blobs.len()]);
        put_u32(&mut image, 52 + blobs.len(), checksum);
        image
    }

    /// Deserialize and validate a block image.
    pub fn decode(image: &[u8]) -> VdoResult<SuperBlock> {
        if image.len() != BLOCK_SIZE
            || get_u64(image, 0) != SUPER_BLOCK_MAGIC
            || get_u32(image, 8) != SUPER_BLOCK_MAJOR
            || get_u32(image, 12) != SUPER_BLOCK_MINOR
        {
            return Err(VdoError::OutOfRange);
        }
        let blob_length = get_u32(image, 48) as usize;
        if 52 + blob_length + 4 > BLOCK_SIZE {
            return Err(VdoError::OutOfRange);
        }
        let stored = get_u32(image, 52 + blob_length);
        if crc32(&image[..52 + blob_length]) != stored {
            return Err(VdoError::OutOfRange);
        }

        let mut offset = 52;
        let layout = LayoutState::decode(&image[offset..])?;
        offset += LayoutState::SIZE;
        let journal = RecoveryJournalState::decode(&image[offset..])?;
        offset += RecoveryJournalState::SIZE;
        let depot = SlabDepotState::decode(&image[offset..])?;
        offset += SlabDepotState::SIZE;
        let block_map = BlockMapState::decode(&image[offset..])?;

        Ok(SuperBlock {
            nonce: get_u64(image, 16),
            state: VdoState::from_raw(image[24])?,
            recovery_stage: RecoveryStage::from_raw(image[25])?,
            recovery_count: image[26],
            complete_recoveries: get_u64(image, 32),
            read_only_recoveries: get_u64(image, 40),
            layout,
            journal,
            depot,
            block_map,
        })
    }

    /// Read and validate the super block from the device.
    pub fn load<L: PhysicalLayer>(layer: &L) -> VdoResult<SuperBlock> {
        let mut image = vec![0u8; BLOCK_SIZE];
        layer.read_block(SUPER_BLOCK_PBN, &mut image)?;
        SuperBlock::decode(&image)
    }

    /// Write the super block and flush it down.
    ///
    /// The flush-before guarantees the state transition never lands ahead
    /// of the metadata it describes; the flush-after makes the transition
    /// itself durable.
    pub fn save<L: PhysicalLayer>(&self, layer: &L) -> VdoResult<()> {
        layer.flush()?;
        layer.write_block(SUPER_BLOCK_PBN, &self.encode())?;
        layer.flush()
    }
}
