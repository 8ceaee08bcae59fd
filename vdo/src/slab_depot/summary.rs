//! Slab summary: a two-byte hint per slab.
//!
//! The summary is read once at startup to plan scrubbing and allocation
//! priority without touching any slab metadata, and rewritten (a block at a
//! time) whenever a slab's hinted state changes. Each zone owns the writes
//! for its own slabs; a failed summary write forces read-only and fails
//! every waiter on that block.

use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;

use crate::constants::{
    BLOCK_SIZE, FULLNESS_HINT_BITS, SLAB_SUMMARY_BLOCKS, SLAB_SUMMARY_ENTRIES_PER_BLOCK,
    SLAB_SUMMARY_ENTRY_SIZE,
};
use crate::encoding::SlabSummaryEntry;
use crate::errors::{VdoError, VdoResult};
use crate::physical::PhysicalLayer;
use crate::types::{Pbn, SlabNumber};

/// Shift compressing a slab's free-block count into the 6-bit hint.
pub fn hint_shift(slab_data_blocks: u64) -> u32 {
    let bits = 64 - slab_data_blocks.leading_zeros();
    bits.saturating_sub(FULLNESS_HINT_BITS)
}

/// Compress a free-block count into the hint. A nonzero count never
/// compresses to zero, so the hint orders "has space" above "full".
pub fn compute_fullness_hint(free_blocks: u64, shift: u32) -> u8 {
    if free_blocks == 0 {
        return 0;
    }
    let hint = (free_blocks >> shift) as u8;
    hint.max(1).min((1 << FULLNESS_HINT_BITS) - 1)
}

/// Decompress a hint into an approximate free-block count.
pub fn hint_to_free_blocks(hint: u8, shift: u32) -> u64 {
    (hint as u64) << shift
}

/// The in-memory summary, mirroring the on-disk region.
pub struct SlabSummary {
    origin: Pbn,
    entries: Vec<SlabSummaryEntry>,
    dirty_blocks: BTreeSet<usize>,
}

impl SlabSummary {
    /// A fresh all-default summary covering `slab_count` slabs.
    pub fn new(origin: Pbn, slab_count: u64) -> SlabSummary {
        SlabSummary {
            origin,
            entries: vec![SlabSummaryEntry::default(); slab_count as usize],
            dirty_blocks: BTreeSet::new(),
        }
    }

    /// Read the summary region.
    pub fn load<L: PhysicalLayer>(
        layer: &L,
        origin: Pbn,
        slab_count: u64,
    ) -> VdoResult<SlabSummary> {
        let mut entries = Vec::with_capacity(slab_count as usize);
        let mut buffer = vec![0u8; BLOCK_SIZE];
        let blocks = (slab_count as usize).div_ceil(SLAB_SUMMARY_ENTRIES_PER_BLOCK);
        for block in 0..blocks {
            layer.read_block(origin + block as u64, &mut buffer)?;
            let base = block * SLAB_SUMMARY_ENTRIES_PER_BLOCK;
            for index in 0..SLAB_SUMMARY_ENTRIES_PER_BLOCK {
                if base + index >= slab_count as usize {
                    break;
                }
                let offset = index * SLAB_SUMMARY_ENTRY_SIZE;
                let raw = u16::from_le_bytes([buffer[offset], buffer[offset + 1]]);
                entries.push(SlabSummaryEntry::unpack(raw));
            }
        }
        Ok(SlabSummary {
            origin,
            entries,
            dirty_blocks: BTreeSet::new(),
        })
    }

    pub fn entry(&self, slab: SlabNumber) -> VdoResult<SlabSummaryEntry> {
        self.entries
            .get(slab as usize)
            .copied()
            .ok_or(VdoError::OutOfRange)
    }

    /// Record a slab's new hinted state; the containing summary block
    /// becomes dirty.
    pub fn update(&mut self, slab: SlabNumber, entry: SlabSummaryEntry) -> VdoResult<()> {
        entry.pack()?;
        let index = slab as usize;
        if index >= self.entries.len() {
            return Err(VdoError::OutOfRange);
        }
        self.entries[index] = entry;
        self.dirty_blocks.insert(index / SLAB_SUMMARY_ENTRIES_PER_BLOCK);
        Ok(())
    }

    /// Grow the summary to cover `slab_count` slabs. The region is sized
    /// for [`crate::constants::MAX_SLABS`], so growth never moves it.
    pub fn grow(&mut self, slab_count: u64) -> VdoResult<()> {
        if slab_count > crate::constants::MAX_SLABS {
            return Err(VdoError::OutOfRange);
        }
        while (self.entries.len() as u64) < slab_count {
            self.entries.push(SlabSummaryEntry::default());
            self.dirty_blocks
                .insert((self.entries.len() - 1) / SLAB_SUMMARY_ENTRIES_PER_BLOCK);
        }
        Ok(())
    }

    pub fn slab_count(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn dirty_block_count(&self) -> usize {
        self.dirty_blocks.len()
    }

    /// Write every dirty summary block.
    pub fn write_dirty<L: PhysicalLayer>(&mut self, layer: &L) -> VdoResult<()> {
        let targets: Vec<usize> = self.dirty_blocks.iter().copied().collect();
        for block in targets {
            if block as u64 >= SLAB_SUMMARY_BLOCKS {
                return Err(VdoError::OutOfRange);
            }
            let mut buffer = vec![0u8; BLOCK_SIZE];
            let base = block * SLAB_SUMMARY_ENTRIES_PER_BLOCK;
            for index in 0..SLAB_SUMMARY_ENTRIES_PER_BLOCK {
                let entry = match self.entries.get(base + index) {
                    Some(entry) => *entry,
                    None => break,
                };
                let offset = index * SLAB_SUMMARY_ENTRY_SIZE;
                let raw = entry.pack()?;
                buffer[offset..offset + SLAB_SUMMARY_ENTRY_SIZE]
                    .copy_from_slice(&raw.to_le_bytes());
            }
            layer.write_block(self.origin + block as u64, &buffer)?;
            self.dirty_blocks.remove(&block);
        }
        Ok(())
    }
}
