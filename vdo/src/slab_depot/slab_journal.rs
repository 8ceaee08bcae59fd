//! Per-slab journal ring.
//!
//! Every refcount adjustment is appended here, stamped with the recovery
//! journal point that requested it, before the counter itself changes. A
//! block is sealed and written when full; partial tail blocks are written
//! when the recovery journal needs its locks back or a drain demands it.
//!
//! Reaping is gated on durability: a sealed block reaps only once it has
//! been committed and every refcount block its entries dirtied has reached
//! disk. Reaping releases the recovery-journal locks the block held.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec;
use alloc::vec::Vec;

use crate::constants::{
    BLOCK_SIZE, SLAB_JOURNAL_ENTRIES_PER_BLOCK, SLAB_JOURNAL_ENTRY_SIZE,
    SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK, SLAB_JOURNAL_FULL_ENTRY_SIZE,
    SLAB_JOURNAL_HEADER_SIZE,
};
use crate::encoding::{
    SlabJournalBlockHeader, SlabJournalEntry, METADATA_TYPE_SLAB_JOURNAL,
};
use crate::errors::{VdoError, VdoResult};
use crate::physical::PhysicalLayer;
use crate::types::{JournalPoint, Pbn, SequenceNumber};

/// Result of trying to append an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Appended at this slab-journal point.
    Added(JournalPoint),
    /// The ring is at its blocking threshold; the caller must wait for a
    /// reap. Decrements are exempt up to the hard ring limit.
    Blocked,
}

struct BlockRecord {
    entries: Vec<SlabJournalEntry>,
    recovery_points: Vec<JournalPoint>,
    has_block_map_increments: bool,
    /// Earliest recovery-journal lock held on behalf of these entries.
    recovery_lock: Option<SequenceNumber>,
    /// Refcount blocks dirtied by these entries and not yet written back.
    pending_ref_blocks: BTreeSet<usize>,
    committed: bool,
}

impl BlockRecord {
    fn new() -> BlockRecord {
        BlockRecord {
            entries: Vec::new(),
            recovery_points: Vec::new(),
            has_block_map_increments: false,
            recovery_lock: None,
            pending_ref_blocks: BTreeSet::new(),
            committed: false,
        }
    }

    fn capacity(&self) -> usize {
        if self.has_block_map_increments {
            SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK
        } else {
            SLAB_JOURNAL_ENTRIES_PER_BLOCK
        }
    }

    fn earliest_recovery_point(&self) -> JournalPoint {
        self.recovery_points
            .iter()
            .min()
            .copied()
            .unwrap_or_default()
    }

    fn newest_recovery_point(&self) -> JournalPoint {
        self.recovery_points
            .iter()
            .max()
            .copied()
            .unwrap_or_default()
    }
}

/// Report from a reap pass: recovery locks now released.
#[derive(Debug, Default)]
pub struct ReapReport {
    pub released_locks: Vec<SequenceNumber>,
    pub blocks_reaped: u64,
}

/// One slab's journal.
pub struct SlabJournal {
    nonce: u64,
    origin: Pbn,
    size: u64,
    /// Oldest unreaped sequence number.
    head: SequenceNumber,
    /// Sequence number of the open tail block.
    tail: SequenceNumber,
    tail_block: BlockRecord,
    /// Entries written to the tail block by the last partial commit.
    tail_committed_entries: usize,
    sealed: BTreeMap<SequenceNumber, BlockRecord>,
    flushing_threshold: u64,
    blocking_threshold: u64,
    /// Newest recovery point ever appended; replay uses it to skip
    /// recovery-journal entries already present here.
    last_recovery_point: JournalPoint,
    /// Newest sequence the wrap barrier has covered; a ring slot is only
    /// overwritten after a flush.
    wrap_flushed: SequenceNumber,
}

impl SlabJournal {
    pub fn new(
        nonce: u64,
        origin: Pbn,
        size: u64,
        flushing_threshold: u64,
        blocking_threshold: u64,
    ) -> SlabJournal {
        debug_assert!(flushing_threshold < blocking_threshold);
        debug_assert!(blocking_threshold <= size);
        SlabJournal {
            nonce,
            origin,
            size,
            head: 1,
            tail: 1,
            tail_block: BlockRecord::new(),
            tail_committed_entries: 0,
            sealed: BTreeMap::new(),
            flushing_threshold,
            blocking_threshold,
            last_recovery_point: JournalPoint::default(),
            wrap_flushed: 0,
        }
    }

    pub fn origin(&self) -> Pbn {
        self.origin
    }

    pub fn head(&self) -> SequenceNumber {
        self.head
    }

    pub fn tail(&self) -> SequenceNumber {
        self.tail
    }

    /// Ring offset of the tail block, as recorded in the slab summary.
    pub fn tail_block_offset(&self) -> u8 {
        self.block_offset(self.tail)
    }

    fn block_offset(&self, sequence: SequenceNumber) -> u8 {
        ((sequence - 1) % self.size) as u8
    }

    fn pbn_of(&self, sequence: SequenceNumber) -> Pbn {
        self.origin + self.block_offset(sequence) as u64
    }

    /// Sealed blocks not yet reaped.
    pub fn unreaped_blocks(&self) -> u64 {
        self.tail - self.head
    }

    /// True once the ring is loaded enough that the oldest dirty refcount
    /// block should be forced out.
    pub fn requires_flushing(&self) -> bool {
        self.unreaped_blocks() >= self.flushing_threshold
    }

    pub fn last_recovery_point(&self) -> JournalPoint {
        self.last_recovery_point
    }

    /// Append one entry.
    ///
    /// Returns the surplus recovery lock (if the open block already holds
    /// an earlier one) alongside the outcome; the caller releases it.
    pub fn add_entry(
        &mut self,
        entry: SlabJournalEntry,
        recovery_point: JournalPoint,
        recovery_lock: Option<SequenceNumber>,
    ) -> (AddOutcome, Option<SequenceNumber>) {
        if self.unreaped_blocks() >= self.blocking_threshold && entry.increment {
            // Decrement priority: only decrements may land once the ring
            // is at its blocking threshold, so a full ring can always pay
            // down reference-count debt.
            return (AddOutcome::Blocked, recovery_lock);
        }
        if self.unreaped_blocks() >= self.size {
            return (AddOutcome::Blocked, recovery_lock);
        }

        let needs_full = entry.block_map_increment;
        let effective_capacity = if needs_full && !self.tail_block.has_block_map_increments {
            SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK
        } else {
            self.tail_block.capacity()
        };
        if self.tail_block.entries.len() >= effective_capacity {
            self.seal_tail();
            if self.unreaped_blocks() >= self.blocking_threshold && entry.increment {
                return (AddOutcome::Blocked, recovery_lock);
            }
            if self.unreaped_blocks() >= self.size {
                // The new tail would overwrite the unreaped head.
                return (AddOutcome::Blocked, recovery_lock);
            }
        }

        if needs_full {
            self.tail_block.has_block_map_increments = true;
        }
        let point = JournalPoint::new(self.tail, self.tail_block.entries.len() as u16);
        self.tail_block.entries.push(entry);
        self.tail_block.recovery_points.push(recovery_point);
        if recovery_point > self.last_recovery_point {
            self.last_recovery_point = recovery_point;
        }

        let surplus = match recovery_lock {
            None => None,
            Some(lock) => match self.tail_block.recovery_lock {
                None => {
                    self.tail_block.recovery_lock = Some(lock);
                    None
                }
                Some(held) if lock < held => {
                    self.tail_block.recovery_lock = Some(lock);
                    Some(held)
                }
                Some(_) => Some(lock),
            },
        };
        (AddOutcome::Added(point), surplus)
    }

    /// Record that `ref_block` was dirtied by the entry at `point`.
    pub fn note_ref_block_dirtied(&mut self, point: JournalPoint, ref_block: usize) {
        if point.sequence == self.tail {
            self.tail_block.pending_ref_blocks.insert(ref_block);
        } else if let Some(record) = self.sealed.get_mut(&point.sequence) {
            record.pending_ref_blocks.insert(ref_block);
        }
    }

    /// Record that refcount blocks reached disk; sealed blocks gating on
    /// them become reapable.
    pub fn note_ref_blocks_written(&mut self, ref_blocks: &[usize]) {
        for block in ref_blocks {
            self.tail_block.pending_ref_blocks.remove(block);
            for record in self.sealed.values_mut() {
                record.pending_ref_blocks.remove(block);
            }
        }
    }

    fn seal_tail(&mut self) {
        let record = core::mem::replace(&mut self.tail_block, BlockRecord::new());
        self.sealed.insert(self.tail, record);
        self.tail += 1;
        self.tail_committed_entries = 0;
    }

    /// Write every sealed-but-unwritten block and, when `include_partial`,
    /// the open tail block as well.
    pub fn commit<L: PhysicalLayer>(
        &mut self,
        layer: &L,
        include_partial: bool,
    ) -> VdoResult<()> {
        let pending: Vec<SequenceNumber> = self
            .sealed
            .iter()
            .filter(|(_, record)| !record.committed)
            .map(|(seq, _)| *seq)
            .collect();
        for sequence in pending {
            self.write_block(layer, sequence)?;
            if let Some(record) = self.sealed.get_mut(&sequence) {
                record.committed = true;
            }
        }
        if include_partial
            && !self.tail_block.entries.is_empty()
            && self.tail_block.entries.len() > self.tail_committed_entries
        {
            self.write_tail(layer)?;
            self.tail_committed_entries = self.tail_block.entries.len();
        }
        Ok(())
    }

    fn wrap_barrier<L: PhysicalLayer>(
        &mut self,
        layer: &L,
        sequence: SequenceNumber,
    ) -> VdoResult<()> {
        if sequence > self.size && sequence > self.wrap_flushed {
            layer.flush()?;
            self.wrap_flushed = sequence;
        }
        Ok(())
    }

    fn write_block<L: PhysicalLayer>(
        &mut self,
        layer: &L,
        sequence: SequenceNumber,
    ) -> VdoResult<()> {
        self.wrap_barrier(layer, sequence)?;
        let record = match self.sealed.get(&sequence) {
            Some(record) => record,
            None => return Err(VdoError::OutOfRange),
        };
        let image = self.encode_block(sequence, record)?;
        layer.write_block(self.pbn_of(sequence), &image)
    }

    fn write_tail<L: PhysicalLayer>(&mut self, layer: &L) -> VdoResult<()> {
        self.wrap_barrier(layer, self.tail)?;
        let image = self.encode_block(self.tail, &self.tail_block)?;
        layer.write_block(self.pbn_of(self.tail), &image)
    }

    fn encode_block(
        &self,
        sequence: SequenceNumber,
        record: &BlockRecord,
    ) -> VdoResult<[u8; BLOCK_SIZE]> {
        let mut image = [0u8; BLOCK_SIZE];
        SlabJournalBlockHeader {
            head: self.head,
            sequence_number: sequence,
            recovery_point: record.earliest_recovery_point(),
            newest_recovery_point: record.newest_recovery_point(),
            nonce: self.nonce,
            metadata_type: METADATA_TYPE_SLAB_JOURNAL,
            has_block_map_increments: record.has_block_map_increments,
            entry_count: record.entries.len() as u16,
        }
        .encode(&mut image);
        let mut offset = SLAB_JOURNAL_HEADER_SIZE;
        for entry in &record.entries {
            if record.has_block_map_increments {
                image[offset..offset + SLAB_JOURNAL_FULL_ENTRY_SIZE]
                    .copy_from_slice(&entry.pack_full()?);
                offset += SLAB_JOURNAL_FULL_ENTRY_SIZE;
            } else {
                image[offset..offset + SLAB_JOURNAL_ENTRY_SIZE]
                    .copy_from_slice(&entry.pack()?);
                offset += SLAB_JOURNAL_ENTRY_SIZE;
            }
        }
        Ok(image)
    }

    /// Reap committed blocks whose refcount updates are durable, from the
    /// head forward, releasing their recovery locks.
    ///
    /// The open tail block's lock is also released once every entry in it
    /// has been committed by a partial write and its refcount updates are
    /// durable; entries appended afterwards take a fresh lock.
    pub fn reap(&mut self) -> ReapReport {
        let mut report = ReapReport::default();
        while self.head < self.tail {
            let reapable = match self.sealed.get(&self.head) {
                Some(record) => record.committed && record.pending_ref_blocks.is_empty(),
                None => false,
            };
            if !reapable {
                break;
            }
            if let Some(record) = self.sealed.remove(&self.head) {
                if let Some(lock) = record.recovery_lock {
                    report.released_locks.push(lock);
                }
            }
            self.head += 1;
            report.blocks_reaped += 1;
        }
        if self.sealed.is_empty()
            && !self.tail_block.entries.is_empty()
            && self.tail_committed_entries == self.tail_block.entries.len()
            && self.tail_block.pending_ref_blocks.is_empty()
        {
            if let Some(lock) = self.tail_block.recovery_lock.take() {
                report.released_locks.push(lock);
            }
        }
        report
    }

    /// Locks held by all unreaped blocks, oldest first. A drain releases
    /// these by committing and reaping.
    pub fn held_locks(&self) -> Vec<SequenceNumber> {
        let mut locks: Vec<SequenceNumber> = self
            .sealed
            .values()
            .filter_map(|record| record.recovery_lock)
            .collect();
        locks.extend(self.tail_block.recovery_lock);
        locks.sort_unstable();
        locks
    }

    /// True when nothing is buffered or awaiting reap.
    pub fn is_quiescent(&self) -> bool {
        self.sealed.is_empty()
            && (self.tail_block.entries.is_empty()
                || self.tail_committed_entries == self.tail_block.entries.len())
    }

    /// Decode every valid block in the ring, ascending by sequence number.
    /// Used by scrubbing.
    pub fn read_ring<L: PhysicalLayer>(
        &self,
        layer: &L,
    ) -> VdoResult<Vec<(SlabJournalBlockHeader, Vec<SlabJournalEntry>)>> {
        let mut blocks = Vec::new();
        let mut buffer = vec![0u8; BLOCK_SIZE];
        for offset in 0..self.size {
            layer.read_block(self.origin + offset, &mut buffer)?;
            let header = SlabJournalBlockHeader::decode(&buffer);
            if !header.is_valid_for(self.nonce) {
                continue;
            }
            let entry_size = if header.has_block_map_increments {
                SLAB_JOURNAL_FULL_ENTRY_SIZE
            } else {
                SLAB_JOURNAL_ENTRY_SIZE
            };
            let capacity = (BLOCK_SIZE - SLAB_JOURNAL_HEADER_SIZE) / entry_size;
            if header.entry_count as usize > capacity {
                continue;
            }
            let mut entries = Vec::with_capacity(header.entry_count as usize);
            for index in 0..header.entry_count as usize {
                let start = SLAB_JOURNAL_HEADER_SIZE + index * entry_size;
                if header.has_block_map_increments {
                    let mut packed = [0u8; SLAB_JOURNAL_FULL_ENTRY_SIZE];
                    packed.copy_from_slice(&buffer[start..start + SLAB_JOURNAL_FULL_ENTRY_SIZE]);
                    entries.push(SlabJournalEntry::unpack_full(&packed));
                } else {
                    let mut packed = [0u8; SLAB_JOURNAL_ENTRY_SIZE];
                    packed.copy_from_slice(&buffer[start..start + SLAB_JOURNAL_ENTRY_SIZE]);
                    entries.push(SlabJournalEntry::unpack(&packed));
                }
            }
            blocks.push((header, entries));
        }
        blocks.sort_by_key(|(header, _)| header.sequence_number);
        Ok(blocks)
    }

    /// Restore ring position after a load: continue appending after the
    /// newest valid block on disk.
    pub fn restore_position(&mut self, head: SequenceNumber, tail: SequenceNumber) {
        self.head = head;
        self.tail = tail;
        self.tail_block = BlockRecord::new();
        self.tail_committed_entries = 0;
        self.sealed.clear();
    }

    /// Restore ring position from the tail block the summary points at,
    /// without replaying anything. Used for slabs loaded clean.
    pub fn restore_from_tail<L: PhysicalLayer>(
        &mut self,
        layer: &L,
        tail_block_offset: u8,
    ) -> VdoResult<()> {
        let mut buffer = vec![0u8; BLOCK_SIZE];
        layer.read_block(self.origin + tail_block_offset as u64, &mut buffer)?;
        let header = SlabJournalBlockHeader::decode(&buffer);
        if header.is_valid_for(self.nonce) {
            self.restore_position(header.head.max(1), header.sequence_number + 1);
            self.last_recovery_point = header.newest_recovery_point;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::RamLayer;

    fn entry(sbn: u64, increment: bool) -> SlabJournalEntry {
        SlabJournalEntry {
            sbn,
            increment,
            block_map_increment: false,
        }
    }

    #[test]
    fn entries_get_sequential_points() {
        let mut journal = SlabJournal::new(1, 100, 8, 4, 7);
        let (a, _) = journal.add_entry(entry(1, true), JournalPoint::new(9, 0), None);
        let (b, _) = journal.add_entry(entry(2, false), JournalPoint::new(9, 1), None);
        assert_eq!(a, AddOutcome::Added(JournalPoint::new(1, 0)));
        assert_eq!(b, AddOutcome::Added(JournalPoint::new(1, 1)));
    }

    #[test]
    fn blocking_threshold_admits_decrement_not_increment() {
        let mut journal = SlabJournal::new(1, 100, 8, 2, 3);
        // Fill three blocks; one more decrement forces the third seal.
        for _ in 0..3 {
            for index in 0..SLAB_JOURNAL_ENTRIES_PER_BLOCK {
                journal.add_entry(entry(0, false), JournalPoint::new(1, index as u16), None);
            }
        }
        journal.add_entry(entry(0, false), JournalPoint::new(1, 0), None);
        assert_eq!(journal.unreaped_blocks(), 3);
        let (increment_outcome, _) =
            journal.add_entry(entry(5, true), JournalPoint::new(2, 0), None);
        assert_eq!(increment_outcome, AddOutcome::Blocked);
        let (decrement_outcome, _) =
            journal.add_entry(entry(5, false), JournalPoint::new(2, 0), None);
        assert!(matches!(decrement_outcome, AddOutcome::Added(_)));
    }

    #[test]
    fn block_map_entries_shrink_capacity() {
        let mut journal = SlabJournal::new(1, 100, 8, 4, 7);
        let bm_entry = SlabJournalEntry {
            sbn: 3,
            increment: true,
            block_map_increment: true,
        };
        journal.add_entry(bm_entry, JournalPoint::new(1, 0), None);
        for index in 1..SLAB_JOURNAL_FULL_ENTRIES_PER_BLOCK {
            let (outcome, _) =
                journal.add_entry(entry(0, false), JournalPoint::new(1, index as u16), None);
            assert!(matches!(outcome, AddOutcome::Added(_)));
        }
        // The full-entry block is at capacity; the next entry opens block 2.
        let (outcome, _) = journal.add_entry(entry(0, false), JournalPoint::new(1, 9999), None);
        assert_eq!(outcome, AddOutcome::Added(JournalPoint::new(2, 0)));
    }

    #[test]
    fn reap_waits_for_commit_and_refcount_durability() {
        let layer = RamLayer::new(256);
        let mut journal = SlabJournal::new(1, 100, 8, 4, 7);
        for index in 0..SLAB_JOURNAL_ENTRIES_PER_BLOCK {
            let (outcome, _) = journal.add_entry(
                entry(0, false),
                JournalPoint::new(4, index as u16),
                Some(4),
            );
            if let AddOutcome::Added(point) = outcome {
                journal.note_ref_block_dirtied(point, 0);
            }
        }
        // Force the seal.
        journal.add_entry(entry(0, false), JournalPoint::new(5, 0), Some(5));
        assert_eq!(journal.unreaped_blocks(), 1);

        // Not committed yet: no reap.
        assert_eq!(journal.reap().blocks_reaped, 0);
        journal.commit(&layer, false).unwrap();
        // Committed but refcount block 0 still dirty: no reap.
        assert_eq!(journal.reap().blocks_reaped, 0);
        journal.note_ref_blocks_written(&[0]);
        let report = journal.reap();
        assert_eq!(report.blocks_reaped, 1);
        assert_eq!(report.released_locks, [4]);
        assert_eq!(journal.head(), 2);
    }

    #[test]
    fn head_is_monotonic() {
        let layer = RamLayer::new(256);
        let mut journal = SlabJournal::new(1, 100, 8, 4, 7);
        let mut last_head = journal.head();
        for round in 0..20u64 {
            for index in 0..SLAB_JOURNAL_ENTRIES_PER_BLOCK {
                journal.add_entry(entry(0, false), JournalPoint::new(round, index as u16), None);
            }
            journal.commit(&layer, true).unwrap();
            journal.reap();
            assert!(journal.head() >= last_head);
            last_head = journal.head();
        }
    }

    #[test]
    fn ring_round_trips_through_device() {
        let layer = RamLayer::new(256);
        let mut journal = SlabJournal::new(0xabc, 100, 8, 4, 7);
        journal.add_entry(entry(11, true), JournalPoint::new(3, 0), None);
        journal.add_entry(entry(12, false), JournalPoint::new(3, 1), None);
        journal.commit(&layer, true).unwrap();

        let reader = SlabJournal::new(0xabc, 100, 8, 4, 7);
        let blocks = reader.read_ring(&layer).unwrap();
        assert_eq!(blocks.len(), 1);
        let (header, entries) = &blocks[0];
        assert_eq!(header.sequence_number, 1);
        assert_eq!(header.entry_count, 2);
        assert_eq!(header.recovery_point, JournalPoint::new(3, 0));
        assert_eq!(entries[0], entry(11, true));
        assert_eq!(entries[1], entry(12, false));
    }

    #[test]
    fn partial_commit_is_idempotent() {
        let layer = RamLayer::new(256);
        let mut journal = SlabJournal::new(1, 100, 8, 4, 7);
        journal.add_entry(entry(1, true), JournalPoint::new(1, 0), None);
        journal.commit(&layer, true).unwrap();
        let writes = layer.write_count();
        // Nothing new: no extra write.
        journal.commit(&layer, true).unwrap();
        assert_eq!(layer.write_count(), writes);
        journal.add_entry(entry(2, true), JournalPoint::new(1, 1), None);
        journal.commit(&layer, true).unwrap();
        assert_eq!(layer.write_count(), writes + 1);
    }
}
