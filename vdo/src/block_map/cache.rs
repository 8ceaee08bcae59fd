//! Page cache with generation-aged write-back.
//!
//! Each cache slot is in exactly one state:
//!
//! ```text
//! Free -> Incoming -> Resident -> {Dirty, Outgoing} -> Resident | Free
//! ```
//!
//! Writes are never issued synchronously with the mutation that dirtied the
//! page. A dirty page joins the aged-dirty list for the period in which it
//! was first dirtied; advancing the era writes back every page whose period
//! has aged out. A page dirtied while its write is in flight is marked
//! deferred and rewritten as soon as the outstanding write returns.
//!
//! Two writes of the same physical page are always separated by a
//! physical-layer flush, so a torn second write can never destroy the only
//! durable copy.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::vec::Vec;

use crate::block_map::page::{self, PageValidity};
use crate::constants::BLOCK_SIZE;
use crate::errors::{VdoError, VdoResult};
use crate::physical::PhysicalLayer;
use crate::types::{Pbn, SequenceNumber};

/// Slot states. `Outgoing` keeps the buffer readable; only `Free` and
/// `Incoming` slots have no usable content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Free,
    Incoming,
    Resident,
    Dirty,
    Outgoing,
}

/// Write status of an `Outgoing` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteStatus {
    Normal,
    /// Re-dirtied during the in-flight write; rewrite immediately after it
    /// returns.
    Deferred,
}

/// How to treat a page image that fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Fail the read with `OutOfRange`.
    Normal,
    /// Treat the page as empty; used by recovery, which knows an invalid
    /// leaf is one that was allocated but never written.
    Recovery,
}

struct PageInfo {
    pbn: Pbn,
    state: PageState,
    buffer: Box<[u8; BLOCK_SIZE]>,
    busy: u32,
    /// Period in which the page was first dirtied; meaningful while Dirty
    /// or Outgoing.
    dirty_period: u64,
    /// Earliest recovery-journal sequence whose effect this page holds and
    /// has not yet persisted. Zero when none.
    recovery_lock: SequenceNumber,
    write_status: WriteStatus,
    /// LRU stamp; larger is more recent.
    used: u64,
    /// Operations parked on this slot while it was busy. Drained by the
    /// owning zone; only the count is observable.
    waiters: VecDeque<u64>,
}

impl PageInfo {
    fn new() -> PageInfo {
        PageInfo {
            pbn: 0,
            state: PageState::Free,
            buffer: Box::new([0u8; BLOCK_SIZE]),
            busy: 0,
            dirty_period: 0,
            recovery_lock: 0,
            write_status: WriteStatus::Normal,
            used: 0,
            waiters: VecDeque::new(),
        }
    }
}

/// Outcome of a write-back pass: the recovery locks the written pages were
/// holding, now eligible for release on the journal.
#[derive(Debug, Default)]
pub struct WriteBackReport {
    pub released_locks: Vec<SequenceNumber>,
    pub pages_written: u64,
}

/// Fixed-slot cache for the block-map pages of one logical zone.
pub struct PageCache {
    nonce: u64,
    slots: Vec<PageInfo>,
    by_pbn: BTreeMap<Pbn, usize>,
    /// Dirty slot indices grouped by the period that first dirtied them.
    dirty_lists: BTreeMap<u64, BTreeSet<usize>>,
    current_period: u64,
    maximum_age: u64,
    /// Pages written since the last device flush; a rewrite of any of
    /// these must be preceded by a flush.
    written_since_flush: BTreeSet<Pbn>,
    lru_clock: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub pages_written: u64,
}

impl PageCache {
    pub fn new(nonce: u64, slot_count: usize, maximum_age: u64) -> PageCache {
        let mut slots = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            slots.push(PageInfo::new());
        }
        PageCache {
            nonce,
            slots,
            by_pbn: BTreeMap::new(),
            dirty_lists: BTreeMap::new(),
            current_period: 1,
            maximum_age,
            written_since_flush: BTreeSet::new(),
            lru_clock: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            pages_written: 0,
        }
    }

    pub fn current_period(&self) -> u64 {
        self.current_period
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn maximum_age(&self) -> u64 {
        self.maximum_age
    }

    /// Number of dirty or outgoing slots.
    pub fn dirty_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.state, PageState::Dirty | PageState::Outgoing))
            .count()
    }

    pub fn waiter_count(&self, slot: usize) -> usize {
        self.slots[slot].waiters.len()
    }

    /// Look up or read in the page at `pbn`, returning its slot index with
    /// the busy count raised. Pair with [`PageCache::release`].
    ///
    /// A page image failing validation in [`ValidationMode::Normal`] is not
    /// cached and the read fails with `OutOfRange`; in
    /// [`ValidationMode::Recovery`] it is replaced with a fresh empty page.
    pub fn get_page<L: PhysicalLayer>(
        &mut self,
        layer: &L,
        pbn: Pbn,
        mode: ValidationMode,
    ) -> VdoResult<usize> {
        if let Some(&slot) = self.by_pbn.get(&pbn) {
            self.hits += 1;
            self.touch(slot);
            self.slots[slot].busy += 1;
            return Ok(slot);
        }

        self.misses += 1;
        let slot = self.find_free_slot(layer)?;
        self.slots[slot].state = PageState::Incoming;
        self.slots[slot].pbn = pbn;

        let read_result = layer.read_block(pbn, &mut self.slots[slot].buffer[..]);
        if let Err(error) = read_result {
            self.slots[slot].state = PageState::Free;
            return Err(error);
        }

        match page::validate_page(&self.slots[slot].buffer[..], self.nonce, pbn) {
            PageValidity::Valid => {}
            PageValidity::Unformatted => {
                page::format_page(&mut self.slots[slot].buffer, self.nonce, pbn);
            }
            PageValidity::Bad => {
                if mode == ValidationMode::Normal {
                    self.slots[slot].state = PageState::Free;
                    log::warn!("block map page {} failed validation", pbn);
                    return Err(VdoError::OutOfRange);
                }
                page::format_page(&mut self.slots[slot].buffer, self.nonce, pbn);
            }
        }

        self.slots[slot].state = PageState::Resident;
        self.slots[slot].recovery_lock = 0;
        self.slots[slot].write_status = WriteStatus::Normal;
        self.by_pbn.insert(pbn, slot);
        self.touch(slot);
        self.slots[slot].busy += 1;
        Ok(slot)
    }

    /// Install a brand-new empty page at `pbn` without reading the device.
    /// Used when a tree page is first materialized.
    pub fn install_new_page<L: PhysicalLayer>(
        &mut self,
        layer: &L,
        pbn: Pbn,
    ) -> VdoResult<usize> {
        debug_assert!(!self.by_pbn.contains_key(&pbn));
        let slot = self.find_free_slot(layer)?;
        page::format_page(&mut self.slots[slot].buffer, self.nonce, pbn);
        self.slots[slot].state = PageState::Resident;
        self.slots[slot].pbn = pbn;
        self.slots[slot].recovery_lock = 0;
        self.slots[slot].write_status = WriteStatus::Normal;
        self.by_pbn.insert(pbn, slot);
        self.touch(slot);
        self.slots[slot].busy += 1;
        Ok(slot)
    }

    /// Drop the busy count taken by `get_page`/`install_new_page`.
    pub fn release(&mut self, slot: usize) {
        debug_assert!(self.slots[slot].busy > 0);
        self.slots[slot].busy -= 1;
    }

    /// Read access to a held page's buffer.
    pub fn buffer(&self, slot: usize) -> &[u8] {
        &self.slots[slot].buffer[..]
    }

    /// Write access to a held page's buffer. The caller must follow with
    /// [`PageCache::mark_dirty`].
    pub fn buffer_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.slots[slot].buffer[..]
    }

    pub fn state(&self, slot: usize) -> PageState {
        self.slots[slot].state
    }

    pub fn pbn(&self, slot: usize) -> Pbn {
        self.slots[slot].pbn
    }

    /// Record a mutation of the page under `journal_lock`.
    ///
    /// The page keeps the earliest lock it has carried since it was last
    /// written; if it already holds one, the new lock is surplus and is
    /// returned for immediate release by the caller.
    pub fn mark_dirty(
        &mut self,
        slot: usize,
        journal_lock: SequenceNumber,
    ) -> Option<SequenceNumber> {
        let info = &mut self.slots[slot];
        let surplus = match info.state {
            PageState::Outgoing => {
                info.write_status = WriteStatus::Deferred;
                Self::fold_lock(info, journal_lock)
            }
            PageState::Dirty => Self::fold_lock(info, journal_lock),
            PageState::Resident => {
                info.state = PageState::Dirty;
                info.dirty_period = self.current_period;
                self.dirty_lists
                    .entry(self.current_period)
                    .or_default()
                    .insert(slot);
                Self::fold_lock(info, journal_lock)
            }
            PageState::Free | PageState::Incoming => {
                debug_assert!(false, "dirtying a content-free slot");
                Some(journal_lock)
            }
        };
        surplus
    }

    fn fold_lock(info: &mut PageInfo, journal_lock: SequenceNumber) -> Option<SequenceNumber> {
        if journal_lock == 0 {
            None
        } else if info.recovery_lock == 0 {
            info.recovery_lock = journal_lock;
            None
        } else if journal_lock < info.recovery_lock {
            let surplus = info.recovery_lock;
            info.recovery_lock = journal_lock;
            Some(surplus)
        } else {
            Some(journal_lock)
        }
    }

    /// Advance the dirty period to `new_period` and write back every page
    /// whose period has aged out.
    pub fn advance_era<L: PhysicalLayer>(
        &mut self,
        layer: &L,
        new_period: u64,
    ) -> VdoResult<WriteBackReport> {
        let mut report = WriteBackReport::default();
        if new_period <= self.current_period {
            return Ok(report);
        }
        self.current_period = new_period;

        let aged: Vec<usize> = self
            .dirty_lists
            .range(..=new_period.saturating_sub(self.maximum_age))
            .flat_map(|(_, slots)| slots.iter().copied())
            .collect();
        for slot in aged {
            self.write_page(layer, slot, &mut report)?;
        }
        Ok(report)
    }

    /// Write back every dirty page; used by drains and saves.
    pub fn flush_all<L: PhysicalLayer>(&mut self, layer: &L) -> VdoResult<WriteBackReport> {
        let mut report = WriteBackReport::default();
        let dirty: Vec<usize> = self
            .dirty_lists
            .values()
            .flat_map(|slots| slots.iter().copied())
            .collect();
        for slot in dirty {
            self.write_page(layer, slot, &mut report)?;
        }
        Ok(report)
    }

    /// The device has flushed; rewrites no longer need a separating flush.
    pub fn note_device_flushed(&mut self) {
        self.written_since_flush.clear();
    }

    /// Write one dirty page, honoring the torn-write rule and the deferred
    /// rewrite state.
    fn write_page<L: PhysicalLayer>(
        &mut self,
        layer: &L,
        slot: usize,
        report: &mut WriteBackReport,
    ) -> VdoResult<()> {
        if self.slots[slot].state != PageState::Dirty {
            return Ok(());
        }
        self.remove_from_dirty_list(slot);

        loop {
            let pbn = self.slots[slot].pbn;
            if self.written_since_flush.contains(&pbn) {
                layer.flush()?;
                self.written_since_flush.clear();
            }

            let outgoing_lock = self.slots[slot].recovery_lock;
            self.slots[slot].recovery_lock = 0;
            self.slots[slot].state = PageState::Outgoing;
            self.slots[slot].write_status = WriteStatus::Normal;
            page::stamp_for_write(&mut self.slots[slot].buffer[..], outgoing_lock);

            let result = layer.write_block(pbn, &self.slots[slot].buffer[..]);
            if let Err(error) = result {
                // Keep the content; the volume is about to go read-only and
                // every waiter sees the same error.
                self.slots[slot].state = PageState::Dirty;
                self.slots[slot].recovery_lock = outgoing_lock;
                self.dirty_lists
                    .entry(self.slots[slot].dirty_period)
                    .or_default()
                    .insert(slot);
                return Err(error);
            }

            self.written_since_flush.insert(pbn);
            self.pages_written += 1;
            report.pages_written += 1;
            if outgoing_lock != 0 {
                report.released_locks.push(outgoing_lock);
            }

            if self.slots[slot].write_status == WriteStatus::Deferred {
                // Re-dirtied mid-write; issue the rewrite immediately.
                self.slots[slot].write_status = WriteStatus::Normal;
                continue;
            }
            self.slots[slot].state = PageState::Resident;
            return Ok(());
        }
    }

    fn remove_from_dirty_list(&mut self, slot: usize) {
        let period = self.slots[slot].dirty_period;
        if let Some(list) = self.dirty_lists.get_mut(&period) {
            list.remove(&slot);
            if list.is_empty() {
                self.dirty_lists.remove(&period);
            }
        }
    }

    fn touch(&mut self, slot: usize) {
        self.lru_clock += 1;
        self.slots[slot].used = self.lru_clock;
    }

    /// Find a free slot, evicting the least recently used clean, idle page
    /// if necessary. Dirty and busy pages are never evicted.
    fn find_free_slot<L: PhysicalLayer>(&mut self, _layer: &L) -> VdoResult<usize> {
        if let Some(slot) = self
            .slots
            .iter()
            .position(|info| info.state == PageState::Free)
        {
            return Ok(slot);
        }

        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, info)| info.state == PageState::Resident && info.busy == 0)
            .min_by_key(|(_, info)| info.used)
            .map(|(slot, _)| slot);
        match victim {
            Some(slot) => {
                self.by_pbn.remove(&self.slots[slot].pbn);
                self.slots[slot].state = PageState::Free;
                self.evictions += 1;
                Ok(slot)
            }
            None => {
                // Every slot is dirty or busy; the caller must write back
                // before faulting more pages in.
                log::warn!("page cache exhausted: all slots dirty or busy");
                Err(VdoError::NoSpace)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_map::page::new_page;
    use crate::physical::RamLayer;
    use crate::types::Mapping;

    const NONCE: u64 = 0x5eed;

    fn seeded_layer() -> RamLayer {
        let layer = RamLayer::new(64);
        for pbn in 10..20u64 {
            let page = new_page(NONCE, pbn);
            layer.write_block(pbn, &page[..]).unwrap();
        }
        layer
    }

    #[test]
    fn hit_after_miss() {
        let layer = seeded_layer();
        let mut cache = PageCache::new(NONCE, 4, 2);
        let slot = cache.get_page(&layer, 10, ValidationMode::Normal).unwrap();
        cache.release(slot);
        assert_eq!(cache.misses, 1);
        let again = cache.get_page(&layer, 10, ValidationMode::Normal).unwrap();
        cache.release(again);
        assert_eq!(slot, again);
        assert_eq!(cache.hits, 1);
    }

    #[test]
    fn unformatted_page_reads_as_empty() {
        let layer = seeded_layer();
        let mut cache = PageCache::new(NONCE, 4, 2);
        // Block 30 was never written.
        let slot = cache.get_page(&layer, 30, ValidationMode::Normal).unwrap();
        assert_eq!(
            crate::block_map::page::get_entry(cache.buffer(slot), 5).unwrap(),
            Mapping::UNMAPPED
        );
        cache.release(slot);
    }

    #[test]
    fn bad_page_not_cached_in_normal_mode() {
        let layer = seeded_layer();
        let mut garbage = [0u8; BLOCK_SIZE];
        garbage[0] = 0xff;
        layer.write_block(31, &garbage).unwrap();

        let mut cache = PageCache::new(NONCE, 4, 2);
        assert_eq!(
            cache.get_page(&layer, 31, ValidationMode::Normal),
            Err(VdoError::OutOfRange)
        );
        // The failed read must not occupy a slot.
        assert_eq!(cache.state(0), PageState::Free);
        // Recovery mode formats it instead.
        let slot = cache.get_page(&layer, 31, ValidationMode::Recovery).unwrap();
        assert_eq!(cache.state(slot), PageState::Resident);
        cache.release(slot);
    }

    #[test]
    fn era_advance_writes_aged_pages() {
        let layer = seeded_layer();
        let mut cache = PageCache::new(NONCE, 4, 2);
        let slot = cache.get_page(&layer, 10, ValidationMode::Normal).unwrap();
        crate::block_map::page::set_entry(
            cache.buffer_mut(slot),
            0,
            &Mapping::uncompressed(777),
        )
        .unwrap();
        assert!(cache.mark_dirty(slot, 9).is_none());
        cache.release(slot);
        assert_eq!(cache.dirty_count(), 1);

        // Period 2 is still within the age bound.
        let report = cache.advance_era(&layer, 2).unwrap();
        assert_eq!(report.pages_written, 0);

        // Period 3 ages period 1 out (1 + 2 <= 3).
        let report = cache.advance_era(&layer, 3).unwrap();
        assert_eq!(report.pages_written, 1);
        assert_eq!(report.released_locks, [9]);
        assert_eq!(cache.dirty_count(), 0);

        // The write is visible on the device.
        let mut read_back = [0u8; BLOCK_SIZE];
        layer.read_block(10, &mut read_back).unwrap();
        assert_eq!(
            crate::block_map::page::get_entry(&read_back, 0).unwrap(),
            Mapping::uncompressed(777)
        );
    }

    #[test]
    fn page_keeps_earliest_lock() {
        let layer = seeded_layer();
        let mut cache = PageCache::new(NONCE, 4, 2);
        let slot = cache.get_page(&layer, 10, ValidationMode::Normal).unwrap();
        assert!(cache.mark_dirty(slot, 5).is_none());
        // A later lock is surplus.
        assert_eq!(cache.mark_dirty(slot, 8), Some(8));
        // An earlier lock displaces the held one.
        assert_eq!(cache.mark_dirty(slot, 3), Some(5));
        cache.release(slot);
        let report = cache.flush_all(&layer).unwrap();
        assert_eq!(report.released_locks, [3]);
    }

    #[test]
    fn rewrite_of_same_page_flushes_first() {
        let layer = seeded_layer();
        let mut cache = PageCache::new(NONCE, 4, 2);
        let slot = cache.get_page(&layer, 10, ValidationMode::Normal).unwrap();
        cache.mark_dirty(slot, 1);
        cache.release(slot);
        let flushes_before = layer.flush_count();
        cache.flush_all(&layer).unwrap();
        // First write needs no separating flush.
        assert_eq!(layer.flush_count(), flushes_before);

        let slot = cache.get_page(&layer, 10, ValidationMode::Normal).unwrap();
        cache.mark_dirty(slot, 2);
        cache.release(slot);
        cache.flush_all(&layer).unwrap();
        // Second write of the same page must be preceded by a flush.
        assert_eq!(layer.flush_count(), flushes_before + 1);
    }

    #[test]
    fn eviction_prefers_lru_clean() {
        let layer = seeded_layer();
        let mut cache = PageCache::new(NONCE, 2, 2);
        let a = cache.get_page(&layer, 10, ValidationMode::Normal).unwrap();
        cache.release(a);
        let b = cache.get_page(&layer, 11, ValidationMode::Normal).unwrap();
        cache.release(b);
        // Touch 10 so 11 becomes the LRU victim.
        let a = cache.get_page(&layer, 10, ValidationMode::Normal).unwrap();
        cache.release(a);
        let c = cache.get_page(&layer, 12, ValidationMode::Normal).unwrap();
        cache.release(c);
        assert_eq!(cache.evictions, 1);
        // 11 is gone, 10 still cached.
        assert_eq!(cache.hits, 1);
        let a = cache.get_page(&layer, 10, ValidationMode::Normal).unwrap();
        cache.release(a);
        assert_eq!(cache.hits, 2);
    }

    #[test]
    fn dirty_pages_are_never_evicted() {
        let layer = seeded_layer();
        let mut cache = PageCache::new(NONCE, 2, 2);
        let a = cache.get_page(&layer, 10, ValidationMode::Normal).unwrap();
        cache.mark_dirty(a, 1);
        cache.release(a);
        let b = cache.get_page(&layer, 11, ValidationMode::Normal).unwrap();
        cache.mark_dirty(b, 2);
        cache.release(b);
        // No clean slot available.
        assert_eq!(
            cache.get_page(&layer, 12, ValidationMode::Normal),
            Err(VdoError::NoSpace)
        );
        cache.flush_all(&layer).unwrap();
        let c = cache.get_page(&layer, 12, ValidationMode::Normal).unwrap();
        cache.release(c);
    }

    #[test]
    fn failed_write_keeps_page_dirty() {
        let layer = seeded_layer();
        let mut cache = PageCache::new(NONCE, 4, 2);
        let slot = cache.get_page(&layer, 10, ValidationMode::Normal).unwrap();
        cache.mark_dirty(slot, 4);
        cache.release(slot);
        layer.inject_error(crate::physical::ram::InjectOn::Write, 10, 10);
        assert_eq!(cache.flush_all(&layer).err(), Some(VdoError::Injected));
        assert_eq!(cache.dirty_count(), 1);
        // Retry succeeds and still releases the lock.
        let report = cache.flush_all(&layer).unwrap();
        assert_eq!(report.released_locks, [4]);
    }
}
