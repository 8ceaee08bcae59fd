//! The recovery journal: a single ring totally ordering every mutation.
//!
//! Each data operation appends an increment/decrement entry pair before any
//! block-map page or reference counter changes. A block is sealed and
//! written when full; the partial tail block is committed whenever an
//! acknowledgement needs it, and only when no earlier block write is
//! outstanding, so commit order equals append order equals acknowledgement
//! order.
//!
//! Reaping advances the head past blocks whose every per-entry lock has
//! been released: by the appending operation once its updates are handed
//! off, by block-map pages when they persist, and by slab journals and
//! refcount blocks when theirs do.

pub mod lock_counter;

use alloc::vec;
use alloc::vec::Vec;

use crate::constants::{
    BLOCK_SIZE, RECOVERY_JOURNAL_ENTRIES_PER_BLOCK, RECOVERY_JOURNAL_ENTRY_SIZE,
    RECOVERY_JOURNAL_HEADER_SIZE,
};
use crate::encoding::{
    journal_check_byte, RecoveryBlockHeader, RecoveryJournalEntry, RecoveryJournalState,
    METADATA_TYPE_RECOVERY_JOURNAL,
};
use crate::errors::{VdoError, VdoResult};
use crate::physical::PhysicalLayer;
use crate::types::{JournalPoint, Pbn, SequenceNumber};

pub use lock_counter::{LockCounter, ZoneType};

/// Where a pair of entries landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    /// Sequence number the appending operation's locks are held against:
    /// the block holding the pair's first entry.
    pub lock_sequence: SequenceNumber,
    /// Journal point of the increment entry.
    pub increment_point: JournalPoint,
    /// Journal point of the decrement entry.
    pub decrement_point: JournalPoint,
    /// True when space pressure forced the decrement ahead of the
    /// increment.
    pub decrement_first: bool,
}

pub struct RecoveryJournal {
    nonce: u64,
    origin: Pbn,
    size: u64,
    /// Sequence number of the open appending block.
    tail: SequenceNumber,
    /// Oldest unreaped sequence number.
    head: SequenceNumber,
    block_map_head: SequenceNumber,
    slab_journal_head: SequenceNumber,
    entries: Vec<RecoveryJournalEntry>,
    /// Entries of the open block persisted by the last partial commit.
    committed_entries: usize,
    logical_blocks_used: u64,
    block_map_data_blocks: u64,
    recovery_count: u8,
    /// Newest sequence for which the wrap barrier has been issued. A ring
    /// slot is only overwritten after a flush makes its old occupant's
    /// released effects durable.
    wrap_flushed: SequenceNumber,
    pub locks: LockCounter,
    pub blocks_committed: u64,
    pub blocks_reaped: u64,
    pub entries_appended: u64,
}

impl RecoveryJournal {
    pub fn new(
        nonce: u64,
        origin: Pbn,
        size: u64,
        state: RecoveryJournalState,
        recovery_count: u8,
    ) -> RecoveryJournal {
        let start = state.journal_start.max(1);
        RecoveryJournal {
            nonce,
            origin,
            size,
            tail: start,
            head: start,
            block_map_head: start,
            slab_journal_head: start,
            entries: Vec::new(),
            committed_entries: 0,
            logical_blocks_used: state.logical_blocks_used,
            block_map_data_blocks: state.block_map_data_blocks,
            recovery_count,
            wrap_flushed: 0,
            locks: LockCounter::new(),
            blocks_committed: 0,
            blocks_reaped: 0,
            entries_appended: 0,
        }
    }

    pub fn origin(&self) -> Pbn {
        self.origin
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn tail(&self) -> SequenceNumber {
        self.tail
    }

    pub fn head(&self) -> SequenceNumber {
        self.head
    }

    pub fn recovery_count(&self) -> u8 {
        self.recovery_count
    }

    pub fn logical_blocks_used(&self) -> u64 {
        self.logical_blocks_used
    }

    pub fn block_map_data_blocks(&self) -> u64 {
        self.block_map_data_blocks
    }

    /// Adjust the mapped-LBN gauge.
    pub fn note_logical_blocks(&mut self, delta: i64) {
        self.logical_blocks_used = self.logical_blocks_used.wrapping_add_signed(delta);
    }

    /// Adjust the tree-page gauge.
    pub fn note_block_map_blocks(&mut self, delta: i64) {
        self.block_map_data_blocks = self.block_map_data_blocks.wrapping_add_signed(delta);
    }

    /// Persistent state for the super block.
    pub fn state(&self) -> RecoveryJournalState {
        RecoveryJournalState {
            journal_start: if self.entries.is_empty() {
                self.tail
            } else {
                self.tail + 1
            },
            logical_blocks_used: self.logical_blocks_used,
            block_map_data_blocks: self.block_map_data_blocks,
        }
    }

    fn pbn_of(&self, sequence: SequenceNumber) -> Pbn {
        self.origin + (sequence - 1) % self.size
    }

    /// Ring blocks not yet reaped, counting the open block.
    fn active_blocks(&self) -> u64 {
        self.tail - self.head + 1
    }

    /// Entry slots remaining before the ring is hard-full.
    pub fn available_space(&self) -> u64 {
        let whole_blocks = self.size - self.active_blocks();
        whole_blocks * RECOVERY_JOURNAL_ENTRIES_PER_BLOCK as u64
            + (RECOVERY_JOURNAL_ENTRIES_PER_BLOCK - self.entries.len()) as u64
    }

    /// Append an increment/decrement pair for one data operation.
    ///
    /// The increment leads unless the ring is too tight to guarantee the
    /// paired decrement a slot, in which case the decrement is admitted
    /// first so a full journal can never strand reference-count debt.
    ///
    /// On return both entries are in the ring (possibly uncommitted), and
    /// one logical plus one physical lock have been acquired on
    /// `lock_sequence` for the appending operation.
    pub fn append_pair<L: PhysicalLayer>(
        &mut self,
        layer: &L,
        increment: RecoveryJournalEntry,
        decrement: RecoveryJournalEntry,
    ) -> VdoResult<AppendResult> {
        debug_assert!(increment.increment && !decrement.increment);
        if self.available_space() < 2 {
            self.reap();
            if self.available_space() < 2 {
                return Err(VdoError::NoSpace);
            }
        }

        // Full-on-insertion: this pair takes the ring's last usable slots.
        // The decrement goes first, so a journal that fills mid-pair can
        // never have recorded an increment without the decrement that pays
        // its reference-count debt.
        let decrement_first = self.available_space() < 4;

        let (first, second) = if decrement_first {
            (decrement, increment)
        } else {
            (increment, decrement)
        };
        let first_point = self.append_entry(layer, first)?;
        let second_point = self.append_entry(layer, second)?;

        let lock_sequence = first_point.sequence;
        self.locks.acquire(ZoneType::Logical, lock_sequence);
        self.locks.acquire(ZoneType::Physical, lock_sequence);
        self.entries_appended += 2;

        let (increment_point, decrement_point) = if decrement_first {
            (second_point, first_point)
        } else {
            (first_point, second_point)
        };
        Ok(AppendResult {
            lock_sequence,
            increment_point,
            decrement_point,
            decrement_first,
        })
    }

    fn append_entry<L: PhysicalLayer>(
        &mut self,
        layer: &L,
        entry: RecoveryJournalEntry,
    ) -> VdoResult<JournalPoint> {
        if self.entries.len() >= RECOVERY_JOURNAL_ENTRIES_PER_BLOCK {
            self.seal_block(layer)?;
        }
        let point = JournalPoint::new(self.tail, self.entries.len() as u16);
        self.entries.push(entry);
        Ok(point)
    }

    /// Write the full open block and advance to the next sequence number.
    fn seal_block<L: PhysicalLayer>(&mut self, layer: &L) -> VdoResult<()> {
        self.write_block(layer)?;
        self.tail += 1;
        self.entries.clear();
        self.committed_entries = 0;
        Ok(())
    }

    /// Commit the open tail block if it has uncommitted entries. Called
    /// before every acknowledgement.
    pub fn commit_tail<L: PhysicalLayer>(&mut self, layer: &L) -> VdoResult<()> {
        if self.entries.len() > self.committed_entries {
            self.write_block(layer)?;
            self.committed_entries = self.entries.len();
        }
        Ok(())
    }

    fn write_block<L: PhysicalLayer>(&mut self, layer: &L) -> VdoResult<()> {
        if self.tail > self.size && self.tail > self.wrap_flushed {
            layer.flush()?;
            self.wrap_flushed = self.tail;
        }
        let mut image = vec![0u8; BLOCK_SIZE];
        RecoveryBlockHeader {
            block_map_head: self.block_map_head,
            slab_journal_head: self.slab_journal_head,
            sequence_number: self.tail,
            nonce: self.nonce,
            metadata_type: METADATA_TYPE_RECOVERY_JOURNAL,
            entry_count: self.entries.len() as u16,
            logical_blocks_used: self.logical_blocks_used,
            block_map_data_blocks: self.block_map_data_blocks,
            check_byte: journal_check_byte(self.tail),
            recovery_count: self.recovery_count,
        }
        .encode(&mut image);
        let mut offset = RECOVERY_JOURNAL_HEADER_SIZE;
        for entry in &self.entries {
            image[offset..offset + RECOVERY_JOURNAL_ENTRY_SIZE].copy_from_slice(&entry.pack()?);
            offset += RECOVERY_JOURNAL_ENTRY_SIZE;
        }
        layer.write_block(self.pbn_of(self.tail), &image)?;
        self.blocks_committed += 1;
        Ok(())
    }

    /// Advance the heads past fully unlocked blocks.
    ///
    /// `block_map_head` trails the oldest logical lock, `slab_journal_head`
    /// the oldest physical lock; the reap head is their minimum. Reaping
    /// is monotonic.
    pub fn reap(&mut self) -> u64 {
        self.block_map_head = self
            .locks
            .oldest_locked(ZoneType::Logical)
            .unwrap_or(self.tail)
            .max(self.block_map_head);
        self.slab_journal_head = self
            .locks
            .oldest_locked(ZoneType::Physical)
            .unwrap_or(self.tail)
            .max(self.slab_journal_head);
        let new_head = self.block_map_head.min(self.slab_journal_head);
        let reaped = new_head.saturating_sub(self.head);
        if reaped > 0 {
            log::debug!("recovery journal reaped {} blocks, head now {}", reaped, new_head);
            self.head = new_head;
            self.blocks_reaped += reaped;
        }
        reaped
    }

    /// Release one lock and reap.
    pub fn release_lock(&mut self, zone: ZoneType, sequence: SequenceNumber) -> VdoResult<()> {
        self.locks.release(zone, sequence)?;
        self.reap();
        Ok(())
    }

    /// Release a batch of locks of one zone type, then reap.
    pub fn release_locks(
        &mut self,
        zone: ZoneType,
        sequences: &[SequenceNumber],
    ) -> VdoResult<()> {
        for &sequence in sequences {
            self.locks.release(zone, sequence)?;
        }
        if !sequences.is_empty() {
            self.reap();
        }
        Ok(())
    }

    /// True when every appended entry is committed and every lock
    /// released.
    pub fn is_quiescent(&self) -> bool {
        self.committed_entries == self.entries.len()
            && self.locks.oldest_locked(ZoneType::Logical).is_none()
            && self.locks.oldest_locked(ZoneType::Physical).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::RamLayer;
    use crate::types::{JournalOperation, Mapping};

    fn incr(slot: u16, pbn: u64) -> RecoveryJournalEntry {
        RecoveryJournalEntry {
            operation: JournalOperation::DataRemap,
            increment: true,
            slot,
            slot_pbn: 40,
            mapping: Mapping::uncompressed(pbn),
        }
    }

    fn decr(slot: u16) -> RecoveryJournalEntry {
        RecoveryJournalEntry {
            operation: JournalOperation::DataRemap,
            increment: false,
            slot,
            slot_pbn: 40,
            mapping: Mapping::UNMAPPED,
        }
    }

    fn journal(size: u64) -> RecoveryJournal {
        RecoveryJournal::new(0xabc, 1, size, RecoveryJournalState::default(), 0)
    }

    #[test]
    fn pair_lands_in_order() {
        let layer = RamLayer::new(64);
        let mut journal = journal(8);
        let result = journal.append_pair(&layer, incr(1, 100), decr(1)).unwrap();
        assert!(!result.decrement_first);
        assert_eq!(result.increment_point, JournalPoint::new(1, 0));
        assert_eq!(result.decrement_point, JournalPoint::new(1, 1));
        assert_eq!(result.lock_sequence, 1);
    }

    #[test]
    fn head_commit_append_ordering_invariant() {
        let layer = RamLayer::new(64);
        let mut journal = journal(8);
        for index in 0..500u16 {
            let result = journal
                .append_pair(&layer, incr(index % 812, 100), decr(index % 812))
                .unwrap();
            journal.commit_tail(&layer).unwrap();
            // head <= commit point <= append point.
            assert!(journal.head() <= journal.tail());
            // Hand the locks straight back so the ring can reap.
            journal
                .release_lock(ZoneType::Logical, result.lock_sequence)
                .unwrap();
            journal
                .release_lock(ZoneType::Physical, result.lock_sequence)
                .unwrap();
        }
        assert!(journal.is_quiescent());
    }

    #[test]
    fn reaping_is_monotonic_and_lock_gated() {
        let layer = RamLayer::new(64);
        let mut journal = journal(8);
        let result = journal.append_pair(&layer, incr(0, 100), decr(0)).unwrap();
        journal.commit_tail(&layer).unwrap();
        let head_before = journal.head();
        journal.reap();
        // Locks still held: no movement.
        assert_eq!(journal.head(), head_before);
        journal
            .release_lock(ZoneType::Logical, result.lock_sequence)
            .unwrap();
        assert_eq!(journal.head(), head_before);
        journal
            .release_lock(ZoneType::Physical, result.lock_sequence)
            .unwrap();
        assert!(journal.head() >= head_before);
    }

    #[test]
    fn ring_exhaustion_reports_no_space() {
        let layer = RamLayer::new(64);
        let mut journal = journal(2);
        // Never release any lock; the ring must eventually refuse.
        let mut appended = 0u64;
        loop {
            match journal.append_pair(&layer, incr(0, 100), decr(0)) {
                Ok(_) => appended += 1,
                Err(VdoError::NoSpace) => break,
                Err(other) => panic!("unexpected error {:?}", other),
            }
            if appended > 10_000 {
                panic!("journal never filled");
            }
        }
        assert!(appended >= RECOVERY_JOURNAL_ENTRIES_PER_BLOCK as u64 / 2);
    }

    #[test]
    fn decrement_admitted_first_under_pressure() {
        let layer = RamLayer::new(64);
        let mut journal = journal(2);
        let mut saw_decrement_first = false;
        loop {
            match journal.append_pair(&layer, incr(0, 100), decr(0)) {
                Ok(result) => {
                    if result.decrement_first {
                        saw_decrement_first = true;
                        assert!(result.decrement_point < result.increment_point);
                    }
                }
                Err(VdoError::NoSpace) => break,
                Err(other) => panic!("unexpected error {:?}", other),
            }
        }
        assert!(saw_decrement_first);
    }

    #[test]
    fn committed_blocks_validate_on_disk() {
        let layer = RamLayer::new(64);
        let mut journal = journal(8);
        journal.note_logical_blocks(3);
        journal.append_pair(&layer, incr(7, 123), decr(7)).unwrap();
        journal.commit_tail(&layer).unwrap();

        let mut block = vec![0u8; BLOCK_SIZE];
        layer.read_block(1, &mut block).unwrap();
        let header = RecoveryBlockHeader::decode(&block);
        assert!(header.is_valid_for(journal.nonce(), 0));
        assert_eq!(header.sequence_number, 1);
        assert_eq!(header.entry_count, 2);
        assert_eq!(header.logical_blocks_used, 3);

        let mut packed = [0u8; RECOVERY_JOURNAL_ENTRY_SIZE];
        packed.copy_from_slice(
            &block[RECOVERY_JOURNAL_HEADER_SIZE..RECOVERY_JOURNAL_HEADER_SIZE + 11],
        );
        let first = RecoveryJournalEntry::unpack(&packed).unwrap();
        assert_eq!(first, incr(7, 123));
    }

    #[test]
    fn partial_commit_is_not_repeated() {
        let layer = RamLayer::new(64);
        let mut journal = journal(8);
        journal.append_pair(&layer, incr(0, 5), decr(0)).unwrap();
        journal.commit_tail(&layer).unwrap();
        let writes = layer.write_count();
        journal.commit_tail(&layer).unwrap();
        assert_eq!(layer.write_count(), writes);
    }
}
