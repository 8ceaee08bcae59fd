//! Per-slab reference counters.
//!
//! One byte per data block: `EMPTY`, an exact count, `MAX` (saturating), or
//! `PROVISIONAL` for an allocation that has not yet been journal-committed.
//! Counters persist in refcount blocks of eight sectors; each sector
//! carries the slab-journal point of the last adjustment applied to it, so
//! scrubbing after a crash can skip already-applied entries at sector
//! granularity.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec;
use alloc::vec::Vec;

use crate::constants::{
    COUNTS_PER_BLOCK, COUNTS_PER_SECTOR, EMPTY_REFERENCE_COUNT, MAXIMUM_REFERENCE_COUNT,
    OCTET_SCAN_BYTES, PROVISIONAL_REFERENCE_COUNT, SECTORS_PER_BLOCK, SECTOR_SIZE,
};
use crate::encoding::{decode_ref_count_sector, encode_ref_count_sector};
use crate::errors::{VdoError, VdoResult};
use crate::physical::PhysicalLayer;
use crate::types::{JournalPoint, Pbn, Sbn, SequenceNumber};
use crate::vio::{VioPool, VioPriority};

/// How an adjustment is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Live operation: always apply.
    Normal,
    /// Scrubbing: skip entries the sector has already absorbed.
    Scrub,
}

/// What a single adjustment did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdjustOutcome {
    /// The counter returned to `EMPTY`.
    pub freed: bool,
    /// The counter left `EMPTY` (or `PROVISIONAL`) for a real reference.
    pub allocated: bool,
    /// Skipped by the scrub sector check.
    pub skipped: bool,
    /// Refcount block index dirtied, if any.
    pub dirtied_block: Option<usize>,
}

/// Report from a refcount write-back pass.
#[derive(Debug, Default)]
pub struct RefWriteReport {
    pub blocks_written: Vec<usize>,
    pub released_locks: Vec<SequenceNumber>,
}

/// The counter array for one slab.
pub struct RefCounts {
    data_blocks: u64,
    block_count: usize,
    counters: Vec<u8>,
    free_blocks: u64,
    search_cursor: usize,
    dirty_blocks: BTreeSet<usize>,
    /// Per-sector slab-journal commit points (global sector index).
    sector_points: Vec<JournalPoint>,
    /// Earliest recovery-journal lock held per dirty block.
    block_locks: BTreeMap<usize, SequenceNumber>,
    loaded: bool,
}

impl RefCounts {
    /// Fresh, all-empty counters for `data_blocks` blocks.
    pub fn new(data_blocks: u64) -> RefCounts {
        let block_count = (data_blocks as usize).div_ceil(COUNTS_PER_BLOCK);
        RefCounts {
            data_blocks,
            block_count,
            counters: vec![EMPTY_REFERENCE_COUNT; block_count * COUNTS_PER_BLOCK],
            free_blocks: data_blocks,
            search_cursor: 0,
            dirty_blocks: BTreeSet::new(),
            sector_points: vec![JournalPoint::default(); block_count * SECTORS_PER_BLOCK],
            block_locks: BTreeMap::new(),
            loaded: true,
        }
    }

    /// Construct without loading; counters are not usable until
    /// [`RefCounts::load`] runs.
    pub fn new_unloaded(data_blocks: u64) -> RefCounts {
        let mut counts = Self::new(data_blocks);
        counts.loaded = false;
        counts
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn free_blocks(&self) -> u64 {
        self.free_blocks
    }

    pub fn data_blocks(&self) -> u64 {
        self.data_blocks
    }

    pub fn dirty_block_count(&self) -> usize {
        self.dirty_blocks.len()
    }

    /// Raw counter bytes, for audits and save/reload comparisons.
    pub fn counters(&self) -> &[u8] {
        &self.counters[..self.data_blocks as usize]
    }

    pub fn counter(&self, sbn: Sbn) -> VdoResult<u8> {
        if sbn >= self.data_blocks {
            return Err(VdoError::OutOfRange);
        }
        Ok(self.counters[sbn as usize])
    }

    /// Find and provisionally claim a free block.
    ///
    /// Scans 32-byte octet groups for a zero counter, starting from an
    /// advancing cursor that wraps once per pass.
    pub fn allocate(&mut self) -> Option<Sbn> {
        if self.free_blocks == 0 {
            return None;
        }
        let limit = self.data_blocks as usize;
        let start_octet = (self.search_cursor / OCTET_SCAN_BYTES) * OCTET_SCAN_BYTES;
        let mut octet = start_octet;
        loop {
            let end = (octet + OCTET_SCAN_BYTES).min(limit);
            if let Some(offset) = self.counters[octet..end]
                .iter()
                .position(|&count| count == EMPTY_REFERENCE_COUNT)
            {
                let sbn = octet + offset;
                self.counters[sbn] = PROVISIONAL_REFERENCE_COUNT;
                self.free_blocks -= 1;
                self.search_cursor = sbn + 1;
                if self.search_cursor >= limit {
                    self.search_cursor = 0;
                }
                return Some(sbn as Sbn);
            }
            octet += OCTET_SCAN_BYTES;
            if octet >= limit {
                octet = 0;
            }
            if octet == start_octet {
                return None;
            }
        }
    }

    /// Revert a provisional claim that will never commit.
    pub fn release_provisional(&mut self, sbn: Sbn) -> VdoResult<()> {
        if self.counter(sbn)? != PROVISIONAL_REFERENCE_COUNT {
            return Err(VdoError::ReferenceCountInvalid);
        }
        self.counters[sbn as usize] = EMPTY_REFERENCE_COUNT;
        self.free_blocks += 1;
        Ok(())
    }

    /// Apply one journalled adjustment.
    ///
    /// `recovery_lock`, when given, is the recovery-journal sequence whose
    /// release is gated on this counter's block reaching disk; the block
    /// keeps the earliest such lock and the surplus is returned through
    /// the outcome for immediate release.
    pub fn adjust(
        &mut self,
        sbn: Sbn,
        increment: bool,
        block_map: bool,
        point: JournalPoint,
        recovery_lock: Option<SequenceNumber>,
        mode: ApplyMode,
    ) -> VdoResult<(AdjustOutcome, Option<SequenceNumber>)> {
        if sbn >= self.data_blocks {
            return Err(VdoError::OutOfRange);
        }
        let index = sbn as usize;
        let sector = index / COUNTS_PER_SECTOR;
        let mut outcome = AdjustOutcome::default();

        if mode == ApplyMode::Scrub && self.sector_points[sector].covers(&point) {
            outcome.skipped = true;
            return Ok((outcome, recovery_lock));
        }

        let old = self.counters[index];
        let new = if increment {
            match (old, block_map) {
                // Tree pages are never shared; they pin their block at MAX.
                (EMPTY_REFERENCE_COUNT | PROVISIONAL_REFERENCE_COUNT, true) => {
                    outcome.allocated = old == EMPTY_REFERENCE_COUNT;
                    MAXIMUM_REFERENCE_COUNT
                }
                (_, true) => return Err(VdoError::ReferenceCountInvalid),
                (EMPTY_REFERENCE_COUNT, false) => {
                    outcome.allocated = true;
                    1
                }
                (PROVISIONAL_REFERENCE_COUNT, false) => 1,
                (MAXIMUM_REFERENCE_COUNT, false) => MAXIMUM_REFERENCE_COUNT,
                (count, false) => count + 1,
            }
        } else {
            match old {
                EMPTY_REFERENCE_COUNT => return Err(VdoError::ReferenceCountInvalid),
                PROVISIONAL_REFERENCE_COUNT => EMPTY_REFERENCE_COUNT,
                MAXIMUM_REFERENCE_COUNT if block_map => EMPTY_REFERENCE_COUNT,
                count => count - 1,
            }
        };

        if outcome.allocated {
            self.free_blocks -= 1;
        }
        if new == EMPTY_REFERENCE_COUNT {
            outcome.freed = true;
            self.free_blocks += 1;
        }
        self.counters[index] = new;
        if self.sector_points[sector] < point {
            self.sector_points[sector] = point;
        }

        let block = index / COUNTS_PER_BLOCK;
        self.dirty_blocks.insert(block);
        outcome.dirtied_block = Some(block);

        let surplus = match recovery_lock {
            None => None,
            Some(lock) => match self.block_locks.get_mut(&block) {
                None => {
                    self.block_locks.insert(block, lock);
                    None
                }
                Some(held) if lock < *held => Some(core::mem::replace(held, lock)),
                Some(_) => Some(lock),
            },
        };
        Ok((outcome, surplus))
    }

    /// Write the dirty refcount blocks, oldest-numbered first, up to
    /// `limit` blocks (all when `None`). Buffers come from the allocator's
    /// VIO pool.
    pub fn write_dirty<L: PhysicalLayer>(
        &mut self,
        layer: &L,
        pool: &VioPool,
        origin: Pbn,
        limit: Option<usize>,
        priority: VioPriority,
    ) -> VdoResult<RefWriteReport> {
        let mut report = RefWriteReport::default();
        let targets: Vec<usize> = match limit {
            Some(limit) => self.dirty_blocks.iter().copied().take(limit).collect(),
            None => self.dirty_blocks.iter().copied().collect(),
        };
        for block in targets {
            let mut buffer = match pool.acquire(priority) {
                Some(buffer) => buffer,
                // Pool exhausted: leave the block dirty; the waiter wakes
                // when a buffer returns.
                None => break,
            };
            self.encode_block(block, &mut buffer[..]);
            let result = layer.write_block(origin + block as u64, &buffer[..]);
            pool.release(buffer);
            result?;
            self.dirty_blocks.remove(&block);
            if let Some(lock) = self.block_locks.remove(&block) {
                report.released_locks.push(lock);
            }
            report.blocks_written.push(block);
        }
        Ok(report)
    }

    fn encode_block(&self, block: usize, buffer: &mut [u8]) {
        for sector in 0..SECTORS_PER_BLOCK {
            let global_sector = block * SECTORS_PER_BLOCK + sector;
            let count_base = block * COUNTS_PER_BLOCK + sector * COUNTS_PER_SECTOR;
            let counts = &self.counters[count_base..count_base + COUNTS_PER_SECTOR];
            encode_ref_count_sector(
                &mut buffer[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE],
                self.sector_points[global_sector],
                counts,
            );
        }
    }

    /// Read all refcount blocks from disk. Issues exactly
    /// [`RefCounts::block_count`] reads. A second load is an admin error.
    pub fn load<L: PhysicalLayer>(&mut self, layer: &L, origin: Pbn) -> VdoResult<()> {
        if self.loaded {
            return Err(VdoError::InvalidAdminState);
        }
        let mut buffer = vec![0u8; crate::constants::BLOCK_SIZE];
        let mut free = 0u64;
        for block in 0..self.block_count {
            layer.read_block(origin + block as u64, &mut buffer)?;
            for sector in 0..SECTORS_PER_BLOCK {
                let (point, counts) =
                    decode_ref_count_sector(&buffer[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE]);
                let global_sector = block * SECTORS_PER_BLOCK + sector;
                self.sector_points[global_sector] = point;
                let count_base = block * COUNTS_PER_BLOCK + sector * COUNTS_PER_SECTOR;
                self.counters[count_base..count_base + COUNTS_PER_SECTOR]
                    .copy_from_slice(counts);
            }
        }
        for sbn in 0..self.data_blocks as usize {
            // A provisional counter on disk is an allocation that never
            // committed; it reads back as free.
            if self.counters[sbn] == PROVISIONAL_REFERENCE_COUNT {
                self.counters[sbn] = EMPTY_REFERENCE_COUNT;
            }
            if self.counters[sbn] == EMPTY_REFERENCE_COUNT {
                free += 1;
            }
        }
        self.free_blocks = free;
        self.loaded = true;
        Ok(())
    }

    /// Mark all loaded with no I/O; used for slabs the summary proves have
    /// never held a reference.
    pub fn load_as_empty(&mut self) -> VdoResult<()> {
        if self.loaded {
            return Err(VdoError::InvalidAdminState);
        }
        self.loaded = true;
        Ok(())
    }

    /// Reset every counter to `EMPTY`; the rebuild path repopulates from
    /// the block map.
    pub fn reset_for_rebuild(&mut self) {
        self.counters.fill(EMPTY_REFERENCE_COUNT);
        self.sector_points.fill(JournalPoint::default());
        self.free_blocks = self.data_blocks;
        self.dirty_blocks = (0..self.block_count).collect();
        self.block_locks.clear();
        self.loaded = true;
    }

    /// Locks currently pinned by dirty blocks; drains release these by
    /// writing everything back.
    pub fn held_locks(&self) -> impl Iterator<Item = SequenceNumber> + '_ {
        self.block_locks.values().copied()
    }
}
