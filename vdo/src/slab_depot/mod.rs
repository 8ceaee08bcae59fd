//! Slab depot: every data PBN's home.
//!
//! The depot carves the slab region into fixed-size slabs, partitions them
//! across physical zones, and serves allocation and reference adjustment.
//! Each zone's allocator prefers the slab it most recently allocated from
//! and otherwise picks its emptiest slab, the same ordering the on-disk
//! summary hints encode.

pub mod ref_counts;
pub mod slab;
pub mod slab_journal;
pub mod summary;

use alloc::vec::Vec;

use crate::constants::MAX_SLABS;
use crate::encoding::{SlabJournalEntry, SlabSummaryEntry};
use crate::errors::{VdoError, VdoResult};
use crate::physical::PhysicalLayer;
use crate::slab_depot::ref_counts::ApplyMode;
use crate::slab_depot::slab::{Slab, SlabState};
use crate::slab_depot::slab_journal::AddOutcome;
use crate::slab_depot::summary::{hint_shift, SlabSummary};
use crate::types::{JournalPoint, Pbn, Sbn, SequenceNumber, SlabNumber};
use crate::vio::{VioPool, VioPriority};

/// Buffers per physical zone's metadata VIO pool.
const VIO_POOL_SIZE: usize = 8;
/// Buffers held back for drain paths.
const VIO_POOL_RESERVE: usize = 2;

/// Derived per-slab layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabGeometry {
    pub slab_size: u64,
    pub journal_blocks: u64,
    pub data_blocks: u64,
    pub refcount_blocks: u64,
    pub hint_shift: u32,
}

impl SlabGeometry {
    /// Split a slab of `slab_size` blocks into data, refcounts, and
    /// journal. `slab_size` must be a power of two.
    pub fn compute(slab_size: u64, journal_blocks: u64) -> VdoResult<SlabGeometry> {
        if !slab_size.is_power_of_two() || slab_size > 1 << 23 {
            return Err(VdoError::OutOfRange);
        }
        if journal_blocks < 2 || journal_blocks + 2 >= slab_size {
            return Err(VdoError::OutOfRange);
        }
        let mut data_blocks = slab_size - journal_blocks;
        loop {
            let refcount_blocks =
                (data_blocks as usize).div_ceil(crate::constants::COUNTS_PER_BLOCK) as u64;
            let next = slab_size - journal_blocks - refcount_blocks;
            if next == data_blocks {
                return Ok(SlabGeometry {
                    slab_size,
                    journal_blocks,
                    data_blocks,
                    refcount_blocks,
                    hint_shift: hint_shift(data_blocks),
                });
            }
            data_blocks = next;
        }
    }
}

struct ZoneAllocator {
    slabs: Vec<SlabNumber>,
    open_slab: Option<SlabNumber>,
    pool: VioPool,
}

/// Report from an adjustment or allocation path: every recovery-journal
/// lock that became releasable, plus data-path side effects.
#[derive(Debug, Default)]
pub struct AdjustReport {
    pub released_locks: Vec<SequenceNumber>,
    /// The adjusted block dropped to zero references.
    pub freed_pbn: Option<Pbn>,
    /// The slab-journal point assigned to the entry.
    pub point: JournalPoint,
}

pub struct SlabDepot {
    geometry: SlabGeometry,
    slab_origin: Pbn,
    slabs: Vec<Slab>,
    zones: Vec<ZoneAllocator>,
    zone_cursor: usize,
    pub summary: SlabSummary,
    nonce: u64,
    pub slabs_scrubbed: u64,
}

impl SlabDepot {
    /// Build the depot. `fresh` slabs start clean and empty; loaded slabs
    /// start unrecovered until their refcounts are read.
    pub fn new(
        nonce: u64,
        slab_origin: Pbn,
        slab_count: u64,
        geometry: SlabGeometry,
        physical_zones: usize,
        summary: SlabSummary,
        fresh: bool,
    ) -> VdoResult<SlabDepot> {
        if slab_count == 0 || slab_count > MAX_SLABS || physical_zones == 0 {
            return Err(VdoError::OutOfRange);
        }
        let mut zones = Vec::with_capacity(physical_zones);
        for _ in 0..physical_zones {
            zones.push(ZoneAllocator {
                slabs: Vec::new(),
                open_slab: None,
                pool: VioPool::new(VIO_POOL_SIZE, VIO_POOL_RESERVE),
            });
        }
        let mut depot = SlabDepot {
            geometry,
            slab_origin,
            slabs: Vec::with_capacity(slab_count as usize),
            zones,
            zone_cursor: 0,
            summary,
            nonce,
            slabs_scrubbed: 0,
        };
        for number in 0..slab_count {
            depot.push_slab(number, fresh);
        }
        Ok(depot)
    }

    fn push_slab(&mut self, number: SlabNumber, fresh: bool) {
        let zone = (number % self.zones.len() as u64) as u8;
        let base = self.slab_origin + number * self.geometry.slab_size;
        let slab = Slab::new(
            number,
            zone,
            base,
            self.geometry.data_blocks,
            base + self.geometry.data_blocks,
            base + self.geometry.data_blocks + self.geometry.refcount_blocks,
            self.geometry.journal_blocks,
            self.nonce,
            fresh,
        );
        self.zones[zone as usize].slabs.push(number);
        self.slabs.push(slab);
    }

    pub fn geometry(&self) -> SlabGeometry {
        self.geometry
    }

    pub fn slab_origin(&self) -> Pbn {
        self.slab_origin
    }

    pub fn slab_count(&self) -> u64 {
        self.slabs.len() as u64
    }

    pub fn slab(&self, number: SlabNumber) -> VdoResult<&Slab> {
        self.slabs.get(number as usize).ok_or(VdoError::OutOfRange)
    }

    pub fn slab_mut(&mut self, number: SlabNumber) -> VdoResult<&mut Slab> {
        self.slabs
            .get_mut(number as usize)
            .ok_or(VdoError::OutOfRange)
    }

    /// Which slab and offset a data PBN belongs to.
    pub fn slab_for_pbn(&self, pbn: Pbn) -> VdoResult<(SlabNumber, Sbn)> {
        if pbn < self.slab_origin {
            return Err(VdoError::OutOfRange);
        }
        let number = (pbn - self.slab_origin) / self.geometry.slab_size;
        if number >= self.slab_count() {
            return Err(VdoError::OutOfRange);
        }
        let offset = (pbn - self.slab_origin) % self.geometry.slab_size;
        if offset >= self.geometry.data_blocks {
            // Refcount or journal block, not a data block.
            return Err(VdoError::OutOfRange);
        }
        Ok((number, offset))
    }

    /// True if `pbn` addresses a data block.
    pub fn is_data_block(&self, pbn: Pbn) -> bool {
        self.slab_for_pbn(pbn).is_ok()
    }

    pub fn free_blocks(&self) -> u64 {
        self.slabs
            .iter()
            .map(|slab| slab.ref_counts.free_blocks())
            .sum()
    }

    pub fn used_data_blocks(&self) -> u64 {
        self.slab_count() * self.geometry.data_blocks - self.free_blocks()
    }

    /// Allocate a data block, claiming it provisionally.
    ///
    /// Zones take turns; within a zone the open slab is preferred and
    /// otherwise the emptiest clean slab wins.
    pub fn allocate(&mut self) -> VdoResult<Pbn> {
        let zone_count = self.zones.len();
        for attempt in 0..zone_count {
            let zone_index = (self.zone_cursor + attempt) % zone_count;
            if let Some(pbn) = self.allocate_in_zone(zone_index) {
                self.zone_cursor = (zone_index + 1) % zone_count;
                return Ok(pbn);
            }
        }
        Err(VdoError::NoSpace)
    }

    fn allocate_in_zone(&mut self, zone_index: usize) -> Option<Pbn> {
        let candidate = {
            let zone = &self.zones[zone_index];
            let open = zone.open_slab.filter(|&number| {
                let slab = &self.slabs[number as usize];
                slab.is_clean() && slab.ref_counts.free_blocks() > 0
            });
            open.or_else(|| {
                zone.slabs
                    .iter()
                    .copied()
                    .filter(|&number| {
                        let slab = &self.slabs[number as usize];
                        slab.is_clean() && slab.ref_counts.free_blocks() > 0
                    })
                    .max_by_key(|&number| self.slabs[number as usize].ref_counts.free_blocks())
            })
        };
        let number = candidate?;
        let sbn = self.slabs[number as usize].ref_counts.allocate()?;
        self.zones[zone_index].open_slab = Some(number);
        let slab = &mut self.slabs[number as usize];
        slab.note_referenced();
        Some(slab.pbn_of(sbn))
    }

    /// Abort a provisional allocation.
    pub fn release_provisional(&mut self, pbn: Pbn) -> VdoResult<()> {
        let (number, sbn) = self.slab_for_pbn(pbn)?;
        self.slabs[number as usize].release_provisional(sbn)
    }

    /// Reference count of a data block; tests and audits use this.
    pub fn reference_count(&self, pbn: Pbn) -> VdoResult<u8> {
        let (number, sbn) = self.slab_for_pbn(pbn)?;
        self.slabs[number as usize].ref_counts.counter(sbn)
    }

    /// Journal and apply one reference adjustment.
    ///
    /// `lock` is the recovery-journal sequence backing this adjustment;
    /// the caller has acquired two physical-zone lock counts for it (one
    /// for the slab-journal block, one for the refcount block), and every
    /// sequence in the returned report's `released_locks` must be released
    /// again.
    #[allow(clippy::too_many_arguments)]
    pub fn adjust_reference<L: PhysicalLayer>(
        &mut self,
        layer: &L,
        pbn: Pbn,
        increment: bool,
        block_map: bool,
        recovery_point: JournalPoint,
        lock: Option<SequenceNumber>,
        mode: ApplyMode,
    ) -> VdoResult<AdjustReport> {
        let (number, sbn) = self.slab_for_pbn(pbn)?;
        let mut report = AdjustReport::default();
        let zone_index = self.slabs[number as usize].zone as usize;

        if self.slabs[number as usize].state() != SlabState::Clean {
            return Err(VdoError::InvalidAdminState);
        }

        let entry = SlabJournalEntry {
            sbn,
            increment,
            block_map_increment: block_map && increment,
        };

        // Admission can require making ring space: commit the journal,
        // push refcounts to disk, and reap.
        let mut attempts = 0;
        let point = loop {
            let slab = &mut self.slabs[number as usize];
            let (outcome, surplus) = slab.journal.add_entry(entry, recovery_point, lock);
            match outcome {
                AddOutcome::Added(point) => {
                    if let Some(sequence) = surplus {
                        report.released_locks.push(sequence);
                    }
                    break point;
                }
                AddOutcome::Blocked => {
                    // The lock came back unconsumed; retry after making
                    // ring space.
                    attempts += 1;
                    if attempts > 2 {
                        // Commit, write-back, and reap freed nothing: the
                        // ring is wedged and the volume cannot stay
                        // consistent.
                        log::error!("slab {} journal wedged at blocking threshold", number);
                        return Err(VdoError::Io);
                    }
                    self.make_journal_progress(layer, number, zone_index, &mut report)?;
                }
            }
        };
        report.point = point;

        let slab = &mut self.slabs[number as usize];
        let (outcome, surplus) =
            slab.ref_counts
                .adjust(sbn, increment, block_map, point, lock, mode)?;
        if let Some(sequence) = surplus {
            report.released_locks.push(sequence);
        }
        if let Some(block) = outcome.dirtied_block {
            slab.journal.note_ref_block_dirtied(point, block);
        }
        if outcome.freed {
            report.freed_pbn = Some(pbn);
        }
        slab.note_referenced();

        // Ring pressure: force the oldest dirty refcount block out.
        if self.slabs[number as usize].journal.requires_flushing() {
            self.write_some_refcounts(layer, number, zone_index, Some(1), &mut report)?;
        }

        self.refresh_summary(number)?;
        Ok(report)
    }

    /// Durably direct loaders to read and scrub this slab, before its
    /// first metadata write. Without this, a crash could leave slab
    /// journal or refcount blocks on disk that the summary tells the next
    /// load to ignore.
    fn ensure_slab_marked<L: PhysicalLayer>(
        &mut self,
        layer: &L,
        number: SlabNumber,
    ) -> VdoResult<()> {
        if self.slabs[number as usize].summary_marked {
            return Ok(());
        }
        let mut entry = self.slabs[number as usize].summary_entry(self.geometry.hint_shift);
        entry.load_ref_counts = true;
        entry.is_dirty = true;
        self.summary.update(number, entry)?;
        self.summary.write_dirty(layer)?;
        self.slabs[number as usize].summary_marked = true;
        Ok(())
    }

    fn make_journal_progress<L: PhysicalLayer>(
        &mut self,
        layer: &L,
        number: SlabNumber,
        zone_index: usize,
        report: &mut AdjustReport,
    ) -> VdoResult<()> {
        self.ensure_slab_marked(layer, number)?;
        self.slabs[number as usize].journal.commit(layer, true)?;
        self.write_some_refcounts(layer, number, zone_index, None, report)?;
        let reap = self.slabs[number as usize].journal.reap();
        report.released_locks.extend(reap.released_locks);
        Ok(())
    }

    fn write_some_refcounts<L: PhysicalLayer>(
        &mut self,
        layer: &L,
        number: SlabNumber,
        zone_index: usize,
        limit: Option<usize>,
        report: &mut AdjustReport,
    ) -> VdoResult<()> {
        self.ensure_slab_marked(layer, number)?;
        let pool = &self.zones[zone_index].pool;
        let slab = &mut self.slabs[number as usize];
        // Write-ahead ordering: the journal entries covering these
        // counters must be durable before the counters themselves.
        slab.journal.commit(layer, true)?;
        let origin = slab.refcount_origin();
        let write_report = slab.ref_counts.write_dirty(
            layer,
            pool,
            origin,
            limit,
            if limit.is_none() {
                VioPriority::Drain
            } else {
                VioPriority::Normal
            },
        )?;
        report.released_locks.extend(write_report.released_locks);
        slab.journal
            .note_ref_blocks_written(&write_report.blocks_written);
        let reap = slab.journal.reap();
        report.released_locks.extend(reap.released_locks);
        Ok(())
    }

    fn refresh_summary(&mut self, number: SlabNumber) -> VdoResult<()> {
        let entry = self.slabs[number as usize].summary_entry(self.geometry.hint_shift);
        if self.summary.entry(number)? != entry {
            self.summary.update(number, entry)?;
        }
        Ok(())
    }

    /// Bring every slab into service per the summary's instructions.
    ///
    /// Slabs the summary proves untouched load with zero reads; slabs that
    /// were clean at shutdown reload their refcounts and journal position;
    /// dirty slabs load their refcounts and are left unrecovered for
    /// scrubbing. When `for_recovery` is set, scrubbing is the caller's
    /// job; otherwise dirty slabs are scrubbed here.
    pub fn load_slabs<L: PhysicalLayer>(&mut self, layer: &L, for_recovery: bool) -> VdoResult<()> {
        for number in 0..self.slab_count() {
            let summary_entry = self.summary.entry(number)?;
            let slab = &mut self.slabs[number as usize];
            slab.summary_marked = summary_entry.is_dirty && summary_entry.load_ref_counts;
            if !summary_entry.load_ref_counts && !summary_entry.is_dirty {
                slab.mark_clean_fresh()?;
            } else if summary_entry.is_dirty || for_recovery {
                slab.load_ref_counts(layer, &summary_entry)?;
            } else {
                slab.load_clean(layer, &summary_entry)?;
            }
        }
        if !for_recovery {
            self.scrub_all(layer)?;
        }
        Ok(())
    }

    /// Scrub every unrecovered slab.
    pub fn scrub_all<L: PhysicalLayer>(&mut self, layer: &L) -> VdoResult<()> {
        for number in 0..self.slab_count() {
            let slab = &mut self.slabs[number as usize];
            if slab.state() != SlabState::Clean {
                slab.scrub(layer)?;
                self.slabs_scrubbed += 1;
            }
            self.refresh_summary(number)?;
        }
        Ok(())
    }

    /// Persist every slab's journal tail, dirty refcounts, and summary
    /// entry. Uses the drain reserve so exhaustion cannot wedge the drain.
    pub fn drain<L: PhysicalLayer>(&mut self, layer: &L) -> VdoResult<Vec<SequenceNumber>> {
        let mut released = Vec::new();
        for number in 0..self.slab_count() {
            let zone_index = self.slabs[number as usize].zone as usize;
            let mut report = AdjustReport::default();
            self.write_some_refcounts(layer, number, zone_index, None, &mut report)?;
            released.extend(report.released_locks);
            self.refresh_summary(number)?;
            // The summary entry about to be written is exact; the next
            // metadata write must re-mark before touching disk.
            self.slabs[number as usize].summary_marked = false;
        }
        self.summary.write_dirty(layer)?;
        Ok(released)
    }

    /// Append `additional` slabs of fresh capacity.
    pub fn grow(&mut self, additional: u64) -> VdoResult<()> {
        if additional == 0 {
            return Err(VdoError::IncrementTooSmall);
        }
        let start = self.slab_count();
        if start + additional > MAX_SLABS {
            return Err(VdoError::OutOfRange);
        }
        self.summary.grow(start + additional)?;
        for number in start..start + additional {
            self.push_slab(number, true);
        }
        log::info!("depot grown to {} slabs", self.slab_count());
        Ok(())
    }

    /// Newest recovery-journal point already durable in the slab journal
    /// owning `pbn`.
    pub fn recovery_cutoff_for(&self, pbn: Pbn) -> VdoResult<JournalPoint> {
        let (number, _) = self.slab_for_pbn(pbn)?;
        Ok(self.slabs[number as usize].recovery_cutoff())
    }

    /// Reset every slab's counters to empty for a full rebuild.
    pub fn reset_for_rebuild(&mut self) {
        for slab in &mut self.slabs {
            slab.reset_for_rebuild();
        }
    }

    /// Count one reference during a rebuild, without journalling.
    pub fn rebuild_reference<L: PhysicalLayer>(
        &mut self,
        _layer: &L,
        pbn: Pbn,
        block_map: bool,
    ) -> VdoResult<()> {
        let (number, sbn) = self.slab_for_pbn(pbn)?;
        let slab = &mut self.slabs[number as usize];
        slab.ref_counts.adjust(
            sbn,
            true,
            block_map,
            JournalPoint::default(),
            None,
            ApplyMode::Normal,
        )?;
        slab.note_referenced();
        Ok(())
    }

    /// Every slab clean and quiescent?
    pub fn is_quiescent(&self) -> bool {
        self.slabs.iter().all(|slab| {
            slab.is_clean()
                && slab.journal.is_quiescent()
                && slab.ref_counts.dirty_block_count() == 0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::RamLayer;

    fn small_geometry() -> SlabGeometry {
        SlabGeometry::compute(256, 8).unwrap()
    }

    fn test_depot(slabs: u64, zones: usize) -> SlabDepot {
        let geometry = small_geometry();
        let summary = SlabSummary::new(1, slabs);
        SlabDepot::new(0x99, 1024, slabs, geometry, zones, summary, true).unwrap()
    }

    #[test]
    fn geometry_accounts_for_every_block() {
        let geometry = small_geometry();
        assert_eq!(
            geometry.data_blocks + geometry.refcount_blocks + geometry.journal_blocks,
            geometry.slab_size
        );
        assert_eq!(geometry.refcount_blocks, 1);

        let big = SlabGeometry::compute(1 << 15, 8).unwrap();
        assert_eq!(
            big.data_blocks + big.refcount_blocks + big.journal_blocks,
            big.slab_size
        );
        assert!(big.refcount_blocks >= big.data_blocks / 4032);
    }

    #[test]
    fn bad_geometry_rejected() {
        assert!(SlabGeometry::compute(100, 8).is_err());
        assert!(SlabGeometry::compute(256, 1).is_err());
        assert!(SlabGeometry::compute(1 << 24, 8).is_err());
    }

    #[test]
    fn pbn_mapping_excludes_metadata_blocks() {
        let depot = test_depot(2, 1);
        let geometry = depot.geometry();
        // First data block of slab 0.
        assert_eq!(depot.slab_for_pbn(1024).unwrap(), (0, 0));
        // Last data block of slab 0.
        let last = 1024 + geometry.data_blocks - 1;
        assert_eq!(depot.slab_for_pbn(last).unwrap(), (0, geometry.data_blocks - 1));
        // Refcount block is not a data block.
        assert!(depot.slab_for_pbn(1024 + geometry.data_blocks).is_err());
        // Slab 1 data.
        assert_eq!(
            depot.slab_for_pbn(1024 + geometry.slab_size).unwrap(),
            (1, 0)
        );
        assert!(depot.slab_for_pbn(1023).is_err());
    }

    #[test]
    fn allocation_rotates_zones() {
        let mut depot = test_depot(4, 2);
        let a = depot.allocate().unwrap();
        let b = depot.allocate().unwrap();
        let (slab_a, _) = depot.slab_for_pbn(a).unwrap();
        let (slab_b, _) = depot.slab_for_pbn(b).unwrap();
        assert_ne!(
            depot.slab(slab_a).unwrap().zone,
            depot.slab(slab_b).unwrap().zone
        );
    }

    #[test]
    fn allocations_never_collide() {
        let mut depot = test_depot(2, 2);
        let mut seen = alloc::collections::BTreeSet::new();
        let capacity = 2 * depot.geometry().data_blocks;
        for _ in 0..capacity {
            assert!(seen.insert(depot.allocate().unwrap()));
        }
        assert_eq!(depot.allocate(), Err(VdoError::NoSpace));
    }

    #[test]
    fn exact_capacity_then_no_space() {
        let mut depot = test_depot(1, 1);
        let capacity = depot.geometry().data_blocks;
        for _ in 0..capacity {
            depot.allocate().unwrap();
        }
        assert_eq!(depot.free_blocks(), 0);
        assert_eq!(depot.allocate(), Err(VdoError::NoSpace));
        // Releasing one provisional makes exactly one allocation possible.
        depot.release_provisional(1024).unwrap();
        assert_eq!(depot.allocate().unwrap(), 1024);
        assert_eq!(depot.allocate(), Err(VdoError::NoSpace));
    }

    #[test]
    fn adjust_promotes_provisional_and_frees() {
        let layer = RamLayer::new(4096);
        let mut depot = test_depot(1, 1);
        let pbn = depot.allocate().unwrap();
        let report = depot
            .adjust_reference(
                &layer,
                pbn,
                true,
                false,
                JournalPoint::new(3, 0),
                Some(3),
                ApplyMode::Normal,
            )
            .unwrap();
        assert!(report.freed_pbn.is_none());
        assert_eq!(depot.reference_count(pbn).unwrap(), 1);

        let report = depot
            .adjust_reference(
                &layer,
                pbn,
                false,
                false,
                JournalPoint::new(3, 1),
                Some(3),
                ApplyMode::Normal,
            )
            .unwrap();
        assert_eq!(report.freed_pbn, Some(pbn));
        assert_eq!(depot.free_blocks(), depot.geometry().data_blocks);
    }

    #[test]
    fn summary_tracks_allocation() {
        let layer = RamLayer::new(4096);
        let mut depot = test_depot(1, 1);
        let pbn = depot.allocate().unwrap();
        depot
            .adjust_reference(
                &layer,
                pbn,
                true,
                false,
                JournalPoint::new(1, 0),
                None,
                ApplyMode::Normal,
            )
            .unwrap();
        let entry = depot.summary.entry(0).unwrap();
        assert!(entry.load_ref_counts);
        assert!(entry.is_dirty);
    }

    #[test]
    fn grow_requires_at_least_one_slab() {
        let mut depot = test_depot(1, 1);
        assert_eq!(depot.grow(0), Err(VdoError::IncrementTooSmall));
        depot.grow(2).unwrap();
        assert_eq!(depot.slab_count(), 3);
        // New slabs are allocable immediately.
        let before = depot.free_blocks();
        assert_eq!(before, 3 * depot.geometry().data_blocks);
    }

    #[test]
    fn drain_persists_and_quiesces() {
        let layer = RamLayer::new(4096);
        let mut depot = test_depot(2, 1);
        let pbn = depot.allocate().unwrap();
        depot
            .adjust_reference(
                &layer,
                pbn,
                true,
                false,
                JournalPoint::new(2, 0),
                Some(2),
                ApplyMode::Normal,
            )
            .unwrap();
        assert!(!depot.is_quiescent());
        let released = depot.drain(&layer).unwrap();
        assert!(released.contains(&2));
        assert!(depot.is_quiescent());
        assert_eq!(depot.summary.dirty_block_count(), 0);
    }
}
