//! Volume configuration and the fixed physical layout derived from it.

use crate::block_map::BlockMap;
use crate::constants::{MAX_BLOCK_ADDRESS, MAX_MAPPED_PBN, SLAB_SUMMARY_BLOCKS, SUPER_BLOCK_PBN};
use crate::encoding::LayoutState;
use crate::errors::{VdoError, VdoResult};
use crate::slab_depot::SlabGeometry;
use crate::types::Pbn;

/// Everything needed to format or load a volume.
#[derive(Debug, Clone, Copy)]
pub struct VdoConfig {
    pub logical_blocks: u64,
    pub physical_blocks: u64,
    /// Power of two, at most 2^23.
    pub slab_size: u64,
    pub slab_journal_blocks: u64,
    pub recovery_journal_blocks: u64,
    pub logical_zones: u8,
    pub physical_zones: u8,
    /// Page cache slots per logical zone.
    pub page_cache_size: usize,
    /// Dirty-period lag bound for block-map pages.
    pub maximum_age: u64,
    pub nonce: u64,
}

impl VdoConfig {
    /// A small geometry suitable for tests and tooling.
    pub fn small(logical_blocks: u64, physical_blocks: u64, nonce: u64) -> VdoConfig {
        VdoConfig {
            logical_blocks,
            physical_blocks,
            slab_size: 256,
            slab_journal_blocks: 8,
            recovery_journal_blocks: 16,
            logical_zones: 1,
            physical_zones: 1,
            page_cache_size: 32,
            maximum_age: 4,
            nonce,
        }
    }

    pub fn validate(&self) -> VdoResult<()> {
        if self.logical_blocks == 0
            || self.logical_blocks > MAX_BLOCK_ADDRESS
            || self.physical_blocks > MAX_MAPPED_PBN
            || self.recovery_journal_blocks < 2
            || self.logical_zones == 0
            || self.physical_zones == 0
            || self.page_cache_size < 2
            || self.maximum_age == 0
        {
            return Err(VdoError::OutOfRange);
        }
        SlabGeometry::compute(self.slab_size, self.slab_journal_blocks)?;
        Ok(())
    }
}

/// The fixed region table: super block, recovery journal, slab summary,
/// block-map roots, then the slab region to the end of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub journal_origin: Pbn,
    pub journal_blocks: u64,
    pub summary_origin: Pbn,
    pub root_origin: Pbn,
    pub root_count: u64,
    pub slab_origin: Pbn,
    pub slab_count: u64,
    pub physical_blocks: u64,
}

impl Layout {
    /// Carve the device described by `config`.
    pub fn compute(config: &VdoConfig) -> VdoResult<Layout> {
        config.validate()?;
        let journal_origin = SUPER_BLOCK_PBN + 1;
        let summary_origin = journal_origin + config.recovery_journal_blocks;
        let root_origin = summary_origin + SLAB_SUMMARY_BLOCKS;
        let root_count = BlockMap::roots_for(config.logical_blocks);
        let slab_origin = root_origin + root_count;
        if slab_origin + config.slab_size > config.physical_blocks {
            return Err(VdoError::OutOfRange);
        }
        let slab_count = (config.physical_blocks - slab_origin) / config.slab_size;
        Ok(Layout {
            journal_origin,
            journal_blocks: config.recovery_journal_blocks,
            summary_origin,
            root_origin,
            root_count,
            slab_origin,
            slab_count,
            physical_blocks: config.physical_blocks,
        })
    }

    pub fn to_state(&self) -> LayoutState {
        LayoutState {
            journal_origin: self.journal_origin,
            journal_blocks: self.journal_blocks,
            summary_origin: self.summary_origin,
            root_origin: self.root_origin,
            root_count: self.root_count,
            slab_origin: self.slab_origin,
            physical_blocks: self.physical_blocks,
        }
    }

    pub fn from_state(state: &LayoutState, slab_size: u64, slab_count: u64) -> Layout {
        let _ = slab_size;
        Layout {
            journal_origin: state.journal_origin,
            journal_blocks: state.journal_blocks,
            summary_origin: state.summary_origin,
            root_origin: state.root_origin,
            root_count: state.root_count,
            slab_origin: state.slab_origin,
            slab_count,
            physical_blocks: state.physical_blocks,
        }
    }
}
