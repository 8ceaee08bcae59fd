//! A single slab: a contiguous run of physical blocks with its own
//! reference counts and journal.
//!
//! Layout within the slab: data blocks first, then the refcount blocks,
//! then the journal ring. A slab found unrecovered at load must be
//! scrubbed (its journal replayed into its refcounts) before any user
//! data adjustment may touch it.

use crate::constants::PROVISIONAL_REFERENCE_COUNT;
use crate::encoding::SlabSummaryEntry;
use crate::errors::{VdoError, VdoResult};
use crate::physical::PhysicalLayer;
use crate::slab_depot::ref_counts::{ApplyMode, RefCounts};
use crate::slab_depot::slab_journal::SlabJournal;
use crate::slab_depot::summary::compute_fullness_hint;
use crate::types::{JournalPoint, Pbn, Sbn, SlabNumber, ZoneId};

/// Slab lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabState {
    /// Journal and refcounts on disk may disagree; scrub before use.
    Unrecovered,
    Scrubbing,
    Clean,
    Draining,
    Resuming,
}

pub struct Slab {
    pub number: SlabNumber,
    pub zone: ZoneId,
    /// First data block.
    base: Pbn,
    state: SlabState,
    pub ref_counts: RefCounts,
    pub journal: SlabJournal,
    refcount_origin: Pbn,
    /// True once any reference has ever landed here; drives the summary's
    /// `load_ref_counts` flag.
    ever_referenced: bool,
    /// Newest recovery-journal point known to be captured in the on-disk
    /// slab journal, learned at scrub or clean-load time. Replay skips
    /// recovery entries at or before this point.
    recovery_cutoff: JournalPoint,
    /// Whether the on-disk summary already directs a loader to read and
    /// scrub this slab. Must be made true, durably, before the slab's
    /// first metadata write.
    pub summary_marked: bool,
}

impl Slab {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        number: SlabNumber,
        zone: ZoneId,
        base: Pbn,
        data_blocks: u64,
        refcount_origin: Pbn,
        journal_origin: Pbn,
        journal_blocks: u64,
        nonce: u64,
        fresh: bool,
    ) -> Slab {
        let flushing = (journal_blocks / 2).max(1);
        let blocking = (journal_blocks - 1).max(flushing + 1).min(journal_blocks);
        Slab {
            number,
            zone,
            base,
            state: if fresh {
                SlabState::Clean
            } else {
                SlabState::Unrecovered
            },
            ref_counts: if fresh {
                RefCounts::new(data_blocks)
            } else {
                RefCounts::new_unloaded(data_blocks)
            },
            journal: SlabJournal::new(nonce, journal_origin, journal_blocks, flushing, blocking),
            refcount_origin,
            ever_referenced: false,
            recovery_cutoff: JournalPoint::default(),
            summary_marked: false,
        }
    }

    /// Newest recovery-journal point already durable in this slab's
    /// journal.
    pub fn recovery_cutoff(&self) -> JournalPoint {
        self.recovery_cutoff
    }

    pub fn state(&self) -> SlabState {
        self.state
    }

    pub fn is_clean(&self) -> bool {
        self.state == SlabState::Clean
    }

    pub fn base(&self) -> Pbn {
        self.base
    }

    pub fn refcount_origin(&self) -> Pbn {
        self.refcount_origin
    }

    pub fn pbn_of(&self, sbn: Sbn) -> Pbn {
        self.base + sbn
    }

    pub fn sbn_of(&self, pbn: Pbn) -> VdoResult<Sbn> {
        if pbn < self.base || pbn >= self.base + self.ref_counts.data_blocks() {
            return Err(VdoError::OutOfRange);
        }
        Ok(pbn - self.base)
    }

    pub fn note_referenced(&mut self) {
        self.ever_referenced = true;
    }

    pub fn ever_referenced(&self) -> bool {
        self.ever_referenced
    }

    /// The slab's current summary entry.
    pub fn summary_entry(&self, hint_shift: u32) -> SlabSummaryEntry {
        SlabSummaryEntry {
            tail_block_offset: self.journal.tail_block_offset(),
            fullness_hint: compute_fullness_hint(self.ref_counts.free_blocks(), hint_shift),
            load_ref_counts: self.ever_referenced,
            is_dirty: self.ref_counts.dirty_block_count() > 0 || !self.journal.is_quiescent(),
        }
    }

    /// Load refcounts according to the summary's instructions. A slab the
    /// summary proves empty loads with zero reads.
    pub fn load_ref_counts<L: PhysicalLayer>(
        &mut self,
        layer: &L,
        summary: &SlabSummaryEntry,
    ) -> VdoResult<()> {
        if summary.load_ref_counts {
            self.ref_counts.load(layer, self.refcount_origin)?;
            self.ever_referenced = true;
        } else {
            self.ref_counts.load_as_empty()?;
        }
        Ok(())
    }

    /// Replay the on-disk slab journal into the refcounts.
    ///
    /// Per-sector journal points make this idempotent: entries a sector
    /// already absorbed are skipped. No refcount I/O is issued while the
    /// scrub runs.
    pub fn scrub<L: PhysicalLayer>(&mut self, layer: &L) -> VdoResult<()> {
        if self.state == SlabState::Clean {
            return Ok(());
        }
        if self.state != SlabState::Unrecovered {
            return Err(VdoError::InvalidAdminState);
        }
        if !self.ref_counts.is_loaded() {
            return Err(VdoError::InvalidAdminState);
        }
        self.state = SlabState::Scrubbing;

        let blocks = self.journal.read_ring(layer)?;
        let mut max_sequence = 0;
        let mut head = 1;
        for (header, entries) in &blocks {
            if header.sequence_number > max_sequence {
                max_sequence = header.sequence_number;
                head = header.head;
            }
            if header.newest_recovery_point > self.recovery_cutoff {
                self.recovery_cutoff = header.newest_recovery_point;
            }
            for (index, entry) in entries.iter().enumerate() {
                let point = JournalPoint::new(header.sequence_number, index as u16);
                let (outcome, _) = self.ref_counts.adjust(
                    entry.sbn,
                    entry.increment,
                    entry.block_map_increment,
                    point,
                    None,
                    ApplyMode::Scrub,
                )?;
                if !outcome.skipped {
                    self.ever_referenced = true;
                }
            }
        }
        // Resume appending after the newest block found on disk.
        self.journal
            .restore_position(head.max(1), max_sequence + 1);
        self.state = SlabState::Clean;
        log::debug!("slab {} scrubbed, {} journal blocks", self.number, blocks.len());
        Ok(())
    }

    /// Abort a provisional allocation that never reached the journal.
    pub fn release_provisional(&mut self, sbn: Sbn) -> VdoResult<()> {
        self.ref_counts.release_provisional(sbn)
    }

    /// True when the counter at `sbn` holds a provisional claim.
    pub fn is_provisional(&self, sbn: Sbn) -> bool {
        self.ref_counts.counter(sbn) == Ok(PROVISIONAL_REFERENCE_COUNT)
    }

    /// Empty the counters for a rebuild; the block map walk repopulates
    /// them.
    pub fn reset_for_rebuild(&mut self) {
        self.ref_counts.reset_for_rebuild();
        self.state = SlabState::Clean;
        self.ever_referenced = false;
        self.recovery_cutoff = JournalPoint::default();
    }

    /// Mark a never-referenced slab clean with no I/O at all.
    pub fn mark_clean_fresh(&mut self) -> VdoResult<()> {
        if self.state != SlabState::Unrecovered {
            return Err(VdoError::InvalidAdminState);
        }
        self.ref_counts.load_as_empty()?;
        self.state = SlabState::Clean;
        Ok(())
    }

    /// Bring a clean-on-disk slab into service: load its refcounts and
    /// reposition the journal from the summary's tail pointer, without
    /// replaying anything.
    pub fn load_clean<L: PhysicalLayer>(
        &mut self,
        layer: &L,
        summary: &SlabSummaryEntry,
    ) -> VdoResult<()> {
        if self.state != SlabState::Unrecovered {
            return Err(VdoError::InvalidAdminState);
        }
        self.load_ref_counts(layer, summary)?;
        self.journal
            .restore_from_tail(layer, summary.tail_block_offset)?;
        self.recovery_cutoff = self.journal.last_recovery_point();
        self.state = SlabState::Clean;
        Ok(())
    }

    pub fn start_draining(&mut self) -> VdoResult<()> {
        if self.state != SlabState::Clean {
            return Err(VdoError::InvalidAdminState);
        }
        self.state = SlabState::Draining;
        Ok(())
    }

    pub fn finish_draining(&mut self) {
        self.state = SlabState::Clean;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::SlabJournalEntry;
    use crate::physical::RamLayer;
    use crate::slab_depot::slab_journal::AddOutcome;
    use crate::vio::{VioPool, VioPriority};

    fn fresh_slab() -> Slab {
        // Base 100, 64 data blocks, refcounts at 164, journal at 165..173.
        Slab::new(0, 0, 100, 64, 164, 165, 8, 0x77, true)
    }

    #[test]
    fn address_conversions() {
        let slab = fresh_slab();
        assert_eq!(slab.pbn_of(3), 103);
        assert_eq!(slab.sbn_of(103).unwrap(), 3);
        assert_eq!(slab.sbn_of(99), Err(VdoError::OutOfRange));
        assert_eq!(slab.sbn_of(164), Err(VdoError::OutOfRange));
    }

    #[test]
    fn scrub_replays_journal_into_refcounts() {
        let layer = RamLayer::new(256);
        // Build a journal on disk describing two increments and a
        // decrement.
        {
            let mut slab = fresh_slab();
            for (sbn, increment) in [(4u64, true), (5, true), (4, false)] {
                let (outcome, _) = slab.journal.add_entry(
                    SlabJournalEntry {
                        sbn,
                        increment,
                        block_map_increment: false,
                    },
                    JournalPoint::new(2, 0),
                    None,
                );
                assert!(matches!(outcome, AddOutcome::Added(_)));
            }
            slab.journal.commit(&layer, true).unwrap();
            // Refcounts intentionally not written: the crash lost them.
        }

        let mut slab = Slab::new(0, 0, 100, 64, 164, 165, 8, 0x77, false);
        assert_eq!(slab.state(), SlabState::Unrecovered);
        slab.load_ref_counts(&layer, &SlabSummaryEntry::default())
            .unwrap();
        slab.scrub(&layer).unwrap();
        assert_eq!(slab.state(), SlabState::Clean);
        assert_eq!(slab.ref_counts.counter(4).unwrap(), 0);
        assert_eq!(slab.ref_counts.counter(5).unwrap(), 1);
        assert_eq!(slab.ref_counts.free_blocks(), 63);
        // The journal resumes after the replayed block.
        assert_eq!(slab.journal.tail(), 2);
    }

    #[test]
    fn scrub_skips_already_applied_sectors() {
        let layer = RamLayer::new(256);
        let pool = VioPool::new(2, 1);
        {
            let mut slab = fresh_slab();
            let (outcome, _) = slab.journal.add_entry(
                SlabJournalEntry {
                    sbn: 9,
                    increment: true,
                    block_map_increment: false,
                },
                JournalPoint::new(1, 0),
                None,
            );
            let point = match outcome {
                AddOutcome::Added(point) => point,
                AddOutcome::Blocked => panic!("unexpected block"),
            };
            slab.journal.commit(&layer, true).unwrap();
            // This time the refcounts did land before the crash.
            slab.ref_counts
                .adjust(9, true, false, point, None, ApplyMode::Normal)
                .unwrap();
            slab.ref_counts
                .write_dirty(&layer, &pool, 164, None, VioPriority::Drain)
                .unwrap();
        }

        let mut slab = Slab::new(0, 0, 100, 64, 164, 165, 8, 0x77, false);
        slab.load_ref_counts(
            &layer,
            &SlabSummaryEntry {
                load_ref_counts: true,
                ..SlabSummaryEntry::default()
            },
        )
        .unwrap();
        slab.scrub(&layer).unwrap();
        // Not double-applied.
        assert_eq!(slab.ref_counts.counter(9).unwrap(), 1);
    }

    #[test]
    fn scrub_requires_loaded_refcounts() {
        let layer = RamLayer::new(256);
        let mut slab = Slab::new(0, 0, 100, 64, 164, 165, 8, 0x77, false);
        assert_eq!(slab.scrub(&layer), Err(VdoError::InvalidAdminState));
    }

    #[test]
    fn empty_slab_loads_without_reads() {
        let layer = RamLayer::new(256);
        let mut slab = Slab::new(0, 0, 100, 64, 164, 165, 8, 0x77, false);
        layer.reset_counters();
        slab.load_ref_counts(&layer, &SlabSummaryEntry::default())
            .unwrap();
        assert_eq!(layer.read_count(), 0);
        assert_eq!(slab.ref_counts.free_blocks(), 64);
    }

    #[test]
    fn summary_entry_reflects_state() {
        let mut slab = fresh_slab();
        let entry = slab.summary_entry(0);
        assert!(!entry.load_ref_counts);
        assert!(!entry.is_dirty);
        slab.ref_counts.allocate().unwrap();
        slab.note_referenced();
        let entry = slab.summary_entry(0);
        assert!(entry.load_ref_counts);
        assert_eq!(entry.fullness_hint, 63);
    }
}
