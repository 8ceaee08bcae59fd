//! The volume aggregate and its data path.
//!
//! A [`Vdo`] owns every component and hands references down explicitly;
//! there are no globals. The write path follows the canonical order: data
//! block first, then the journal entry pair, then, only after the journal
//! block is committed, the block-map and reference-count updates, each of
//! which inherits a per-entry journal lock it releases when it reaches
//! disk.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::admin::{AdminComponent, AdminState};
use crate::block_map::cache::{ValidationMode, WriteBackReport};
use crate::block_map::BlockMap;
use crate::compressed::{self, Decompressor};
use crate::config::{Layout, VdoConfig};
use crate::constants::{
    BLOCK_SIZE, MAXIMUM_REFERENCE_COUNT, SECTOR_SIZE, SECTORS_PER_BLOCK, SUPER_BLOCK_PBN,
};
use crate::dedup::DedupIndex;
use crate::encoding::{BlockMapState, RecoveryJournalState, SlabDepotState};
use crate::errors::{VdoError, VdoResult};
use crate::flush::Flusher;
use crate::physical::PhysicalLayer;
use crate::read_only::ReadOnlyNotifier;
use crate::recovery::{self, rebuild};
use crate::recovery_journal::{RecoveryJournal, ZoneType};
use crate::slab_depot::ref_counts::ApplyMode;
use crate::slab_depot::summary::SlabSummary;
use crate::slab_depot::{SlabDepot, SlabGeometry};
use crate::statistics::VdoStatistics;
use crate::super_block::{RecoveryStage, SuperBlock, VdoState};
use crate::types::{JournalOperation, Lbn, Mapping, Pbn};
use crate::encoding::RecoveryJournalEntry;

/// Outcome of an audit pass over the whole volume.
#[derive(Debug, Default)]
pub struct AuditReport {
    /// `(pbn, expected, actual)` for every disagreeing counter.
    pub mismatches: Vec<(Pbn, u8, u8)>,
    pub mapped_logical_blocks: u64,
    pub tree_pages: u64,
}

impl AuditReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// The assembled volume.
pub struct Vdo<L: PhysicalLayer> {
    layer: Arc<L>,
    layout: Layout,
    super_block: SuperBlock,
    admin: AdminState,
    read_only: ReadOnlyNotifier,
    block_map: BlockMap,
    depot: SlabDepot,
    journal: RecoveryJournal,
    flusher: Flusher,
    index: Option<Box<dyn DedupIndex>>,
    decompressor: Option<Box<dyn Decompressor>>,
    compression_enabled: bool,
    reads: u64,
    writes: u64,
    discards: u64,
    dedupe_hits: u64,
    zero_elisions: u64,
}

impl<L: PhysicalLayer> Vdo<L> {
    /// Write an initial empty volume onto `layer`.
    pub fn format(layer: &L, config: &VdoConfig) -> VdoResult<()> {
        let layout = Layout::compute(config)?;
        if config.physical_blocks > layer.block_count() {
            return Err(VdoError::OutOfRange);
        }
        let geometry = SlabGeometry::compute(config.slab_size, config.slab_journal_blocks)?;

        // Scrub the metadata regions so stale content can never validate.
        let zero = vec![0u8; BLOCK_SIZE];
        for pbn in layout.journal_origin..layout.summary_origin {
            layer.write_block(pbn, &zero)?;
        }
        for pbn in layout.summary_origin..layout.root_origin {
            layer.write_block(pbn, &zero)?;
        }
        for pbn in layout.root_origin..layout.slab_origin {
            layer.write_block(pbn, &zero)?;
        }
        for slab in 0..layout.slab_count {
            let base = layout.slab_origin + slab * config.slab_size;
            Self::zero_slab_metadata(layer, base, &geometry)?;
        }

        let super_block = SuperBlock {
            nonce: config.nonce,
            state: VdoState::New,
            recovery_stage: RecoveryStage::None,
            recovery_count: 0,
            complete_recoveries: 0,
            read_only_recoveries: 0,
            layout: layout.to_state(),
            journal: RecoveryJournalState {
                journal_start: 1,
                logical_blocks_used: 0,
                block_map_data_blocks: 0,
            },
            depot: SlabDepotState {
                slab_origin: layout.slab_origin,
                slab_size: config.slab_size,
                slab_journal_blocks: config.slab_journal_blocks,
                slab_count: layout.slab_count,
                physical_zones: config.physical_zones as u64,
            },
            block_map: BlockMapState {
                root_origin: layout.root_origin,
                root_count: layout.root_count,
                logical_blocks: config.logical_blocks,
            },
        };
        super_block.save(layer)?;
        log::info!(
            "formatted volume: {} logical blocks, {} slabs of {} blocks",
            config.logical_blocks,
            layout.slab_count,
            config.slab_size
        );
        Ok(())
    }

    /// Zero a slab's refcount and journal blocks so nothing stale can
    /// validate or decode there.
    fn zero_slab_metadata(layer: &L, base: Pbn, geometry: &SlabGeometry) -> VdoResult<()> {
        let zero = vec![0u8; BLOCK_SIZE];
        let metadata_start = base + geometry.data_blocks;
        for pbn in metadata_start..base + geometry.slab_size {
            layer.write_block(pbn, &zero)?;
        }
        Ok(())
    }

    /// Load the volume, running whatever recovery its state demands.
    ///
    /// Geometry comes from the super block; `config` supplies only the
    /// runtime knobs (zone counts, cache size, age bound).
    pub fn load(layer: Arc<L>, config: &VdoConfig) -> VdoResult<Vdo<L>> {
        let mut super_block = SuperBlock::load(&*layer)?;
        let nonce = super_block.nonce;
        let layout = Layout::from_state(
            &super_block.layout,
            super_block.depot.slab_size,
            super_block.depot.slab_count,
        );
        let geometry = SlabGeometry::compute(
            super_block.depot.slab_size,
            super_block.depot.slab_journal_blocks,
        )?;
        let summary = SlabSummary::load(&*layer, layout.summary_origin, layout.slab_count)?;
        let mut depot = SlabDepot::new(
            nonce,
            super_block.depot.slab_origin,
            layout.slab_count,
            geometry,
            super_block.depot.physical_zones as usize,
            summary,
            false,
        )?;
        let mut block_map = BlockMap::new(
            nonce,
            super_block.block_map.root_origin,
            super_block.block_map.root_count,
            super_block.block_map.logical_blocks,
            config.logical_zones.max(1) as usize,
            config.page_cache_size.max(2),
            config.maximum_age.max(1),
        );

        let read_only = ReadOnlyNotifier::new();
        let journal;
        match super_block.state {
            VdoState::New | VdoState::Clean => {
                depot.load_slabs(&*layer, false)?;
                journal = RecoveryJournal::new(
                    nonce,
                    layout.journal_origin,
                    layout.journal_blocks,
                    super_block.journal,
                    super_block.recovery_count,
                );
            }
            VdoState::Dirty | VdoState::Replaying => {
                journal = Self::run_recovery(
                    &*layer,
                    &mut super_block,
                    &layout,
                    &mut block_map,
                    &mut depot,
                )?;
            }
            VdoState::ForceRebuild => {
                journal = Self::run_rebuild(
                    &*layer,
                    &mut super_block,
                    &layout,
                    &mut depot,
                )?;
            }
            VdoState::ReadOnlyMode => {
                depot.load_slabs(&*layer, false)?;
                journal = RecoveryJournal::new(
                    nonce,
                    layout.journal_origin,
                    layout.journal_blocks,
                    super_block.journal,
                    super_block.recovery_count,
                );
                read_only.enter(VdoError::Io);
            }
        }

        // Mark the volume in use so the next load knows whether shutdown
        // was clean.
        if !read_only.is_read_only() {
            super_block.state = VdoState::Dirty;
            super_block.journal = journal.state();
            super_block.save(&*layer)?;
        }

        Ok(Vdo {
            layer,
            layout,
            super_block,
            admin: AdminState::Normal,
            read_only,
            block_map,
            depot,
            journal,
            flusher: Flusher::new(4),
            index: None,
            decompressor: None,
            compression_enabled: true,
            reads: 0,
            writes: 0,
            discards: 0,
            dedupe_hits: 0,
            zero_elisions: 0,
        })
    }

    fn run_recovery(
        layer: &L,
        super_block: &mut SuperBlock,
        layout: &Layout,
        block_map: &mut BlockMap,
        depot: &mut SlabDepot,
    ) -> VdoResult<RecoveryJournal> {
        let nonce = super_block.nonce;
        log::info!("starting recovery (state {:?})", super_block.state);
        depot.load_slabs(layer, true)?;

        let tail = recovery::scan_journal(
            layer,
            layout.journal_origin,
            layout.journal_blocks,
            nonce,
            super_block.recovery_count,
        )?;

        let journal_state = match tail {
            Some(tail) => {
                if super_block.recovery_stage != RecoveryStage::BlockMapReplayed {
                    recovery::replay_block_map(layer, block_map, &tail)?;
                    super_block.state = VdoState::Replaying;
                    super_block.recovery_stage = RecoveryStage::BlockMapReplayed;
                    super_block.save(layer)?;
                } else {
                    log::info!("block map already replayed; resuming at refcount recovery");
                }
                recovery::recover_ref_counts(layer, depot, &tail)?;
                RecoveryJournalState {
                    journal_start: tail.tail,
                    logical_blocks_used: tail.logical_blocks_used,
                    block_map_data_blocks: tail.block_map_data_blocks,
                }
            }
            None => {
                // Nothing on disk to replay; the slabs may still need
                // scrubbing against their own journals.
                depot.scrub_all(layer)?;
                super_block.journal
            }
        };

        super_block.recovery_count = super_block.recovery_count.wrapping_add(1);
        super_block.complete_recoveries += 1;
        super_block.recovery_stage = RecoveryStage::None;
        super_block.state = VdoState::Clean;
        super_block.journal = journal_state;
        super_block.save(layer)?;
        log::info!(
            "recovery {} complete",
            super_block.complete_recoveries
        );

        Ok(RecoveryJournal::new(
            nonce,
            layout.journal_origin,
            layout.journal_blocks,
            journal_state,
            super_block.recovery_count,
        ))
    }

    fn run_rebuild(
        layer: &L,
        super_block: &mut SuperBlock,
        layout: &Layout,
        depot: &mut SlabDepot,
    ) -> VdoResult<RecoveryJournal> {
        let nonce = super_block.nonce;
        log::info!("starting forced rebuild");
        let result = rebuild::rebuild_ref_counts(
            layer,
            depot,
            nonce,
            layout.root_origin,
            layout.root_count,
        )?;

        let journal_state = RecoveryJournalState {
            journal_start: 1,
            logical_blocks_used: result.logical_blocks_used,
            block_map_data_blocks: result.block_map_data_blocks,
        };
        super_block.recovery_count = super_block.recovery_count.wrapping_add(1);
        super_block.read_only_recoveries += 1;
        super_block.recovery_stage = RecoveryStage::None;
        super_block.state = VdoState::Clean;
        super_block.journal = journal_state;
        super_block.save(layer)?;

        Ok(RecoveryJournal::new(
            nonce,
            layout.journal_origin,
            layout.journal_blocks,
            journal_state,
            super_block.recovery_count,
        ))
    }

    /// Attach the external deduplication index.
    pub fn set_dedup_index(&mut self, index: Box<dyn DedupIndex>) {
        self.index = Some(index);
    }

    /// Attach the external decompressor. Without one, compressed
    /// fragments are returned stored-form: copied and zero-filled.
    pub fn set_decompressor(&mut self, decompressor: Box<dyn Decompressor>) {
        self.decompressor = Some(decompressor);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.is_read_only()
    }

    pub fn logical_blocks(&self) -> u64 {
        self.block_map.logical_blocks()
    }

    fn metadata<T>(&mut self, result: VdoResult<T>) -> VdoResult<T> {
        match result {
            Err(error) if error.is_fatal_for_metadata() => {
                self.read_only.enter(error);
                Err(VdoError::ReadOnly)
            }
            other => other,
        }
    }

    fn release_logical_report(&mut self, report: &WriteBackReport) -> VdoResult<()> {
        self.journal
            .release_locks(ZoneType::Logical, &report.released_locks)
    }

    /// Read one logical block.
    pub fn read(&mut self, lbn: Lbn, buffer: &mut [u8]) -> VdoResult<()> {
        if buffer.len() != BLOCK_SIZE {
            return Err(VdoError::OutOfRange);
        }
        if !self.admin.is_normal() {
            return Err(VdoError::InvalidAdminState);
        }
        self.reads += 1;
        let mut report = WriteBackReport::default();
        let lookup = self.block_map.lookup(&*self.layer, lbn, &mut report);
        let release = self.release_logical_report(&report);
        let mapping = lookup?;
        self.metadata(release)?;

        match mapping.state {
            crate::types::MappingState::Unmapped => {
                buffer.fill(0);
                Ok(())
            }
            crate::types::MappingState::Uncompressed => {
                self.layer.read_block(mapping.pbn, buffer)
            }
            crate::types::MappingState::Compressed(slot) => {
                let mut container = vec![0u8; BLOCK_SIZE];
                self.layer.read_block(mapping.pbn, &mut container)?;
                let fragment = compressed::get_fragment(&container, slot)?;
                match &self.decompressor {
                    Some(decompressor) => decompressor.decompress(fragment, buffer),
                    None => {
                        buffer.fill(0);
                        buffer[..fragment.len()].copy_from_slice(fragment);
                        Ok(())
                    }
                }
            }
        }
    }

    /// Write one logical block.
    pub fn write(&mut self, lbn: Lbn, data: &[u8]) -> VdoResult<()> {
        if data.len() != BLOCK_SIZE {
            return Err(VdoError::OutOfRange);
        }
        self.read_only.check()?;
        if !self.admin.is_normal() {
            return Err(VdoError::InvalidAdminState);
        }
        self.writes += 1;
        let generation = self.flusher.join();
        let result = self.write_block_inner(lbn, data);
        self.flusher.retire(generation);
        result
    }

    fn write_block_inner(&mut self, lbn: Lbn, data: &[u8]) -> VdoResult<()> {
        let mut report = WriteBackReport::default();
        let lookup = self.block_map.lookup(&*self.layer, lbn, &mut report);
        let release = self.release_logical_report(&report);
        let old_mapping = lookup?;
        self.metadata(release)?;

        // Zero blocks are elided: they map to nothing.
        if data.iter().all(|&byte| byte == 0) {
            self.zero_elisions += 1;
            if !old_mapping.is_mapped() {
                return Ok(());
            }
            return self.install_mapping(lbn, Mapping::UNMAPPED, old_mapping);
        }

        // Writes never overwrite in place; with nothing allocable the
        // operation fails before any dedup verification read is issued.
        if self.depot.free_blocks() == 0 {
            return Err(VdoError::NoSpace);
        }

        // Offer the block to the index; verify any advice by reading the
        // candidate, since advice may be stale.
        let mut shared_target: Option<Pbn> = None;
        if let Some(index) = self.index.as_mut() {
            if let Some(candidate) = index.query(data) {
                if self.depot.is_data_block(candidate) {
                    let count = self.depot.reference_count(candidate)?;
                    if count >= 1 && count < MAXIMUM_REFERENCE_COUNT {
                        let mut existing = vec![0u8; BLOCK_SIZE];
                        if self.layer.read_block(candidate, &mut existing).is_ok()
                            && existing.as_slice() == data
                        {
                            shared_target = Some(candidate);
                        }
                    }
                }
            }
        }

        let (new_pbn, shared) = match shared_target {
            Some(pbn) => {
                self.dedupe_hits += 1;
                (pbn, true)
            }
            None => {
                let pbn = self.depot.allocate()?;
                if let Err(error) = self.layer.write_block(pbn, data) {
                    // A failed data write fails only this operation.
                    let _ = self.depot.release_provisional(pbn);
                    return Err(error);
                }
                (pbn, false)
            }
        };

        let result = self.install_mapping(lbn, Mapping::uncompressed(new_pbn), old_mapping);
        match result {
            Ok(()) => {
                if !shared {
                    if let Some(index) = self.index.as_mut() {
                        index.record(data, new_pbn);
                    }
                }
                Ok(())
            }
            Err(error) => {
                if !shared {
                    let _ = self.depot.release_provisional(new_pbn);
                }
                Err(error)
            }
        }
    }

    /// Journal and apply a mapping change: the common tail of every write,
    /// trim, and fragment installation.
    fn install_mapping(
        &mut self,
        lbn: Lbn,
        new_mapping: Mapping,
        old_mapping: Mapping,
    ) -> VdoResult<()> {
        let slot = self.block_map.tree_slot(lbn)?;

        // Materialize the leaf first if this write needs one.
        let mut report = WriteBackReport::default();
        let leaf = self.block_map.leaf_pbn(&*self.layer, &slot, &mut report);
        let release = self.release_logical_report(&report);
        let leaf_pbn = leaf?;
        self.metadata(release)?;
        let leaf_pbn = match leaf_pbn {
            Some(pbn) => pbn,
            None => {
                if !new_mapping.is_mapped() {
                    // Unmapping under an absent leaf changes nothing.
                    return Ok(());
                }
                self.materialize_leaf(lbn)?
            }
        };

        let increment = RecoveryJournalEntry {
            operation: JournalOperation::DataRemap,
            increment: true,
            slot: slot.leaf_slot as u16,
            slot_pbn: leaf_pbn,
            mapping: new_mapping,
        };
        let decrement = RecoveryJournalEntry {
            operation: JournalOperation::DataRemap,
            increment: false,
            slot: slot.leaf_slot as u16,
            slot_pbn: leaf_pbn,
            mapping: old_mapping,
        };
        let append = self.append_pair_with_space(increment, decrement)?;

        let delta = new_mapping.is_mapped() as i64 - old_mapping.is_mapped() as i64;
        self.journal.note_logical_blocks(delta);
        let commit = self.journal.commit_tail(&*self.layer);
        self.metadata(commit)?;

        self.apply_journalled_change(lbn, &append, new_mapping, old_mapping)?;
        self.advance_era()
    }

    /// Allocate, journal, and install a new block-map leaf for `lbn`.
    fn materialize_leaf(&mut self, lbn: Lbn) -> VdoResult<Pbn> {
        let slot = self.block_map.tree_slot(lbn)?;
        let leaf_pbn = self.depot.allocate()?;

        let increment = RecoveryJournalEntry {
            operation: JournalOperation::BlockMapRemap,
            increment: true,
            slot: slot.interior_slot as u16,
            slot_pbn: slot.interior_pbn,
            mapping: Mapping::uncompressed(leaf_pbn),
        };
        let decrement = RecoveryJournalEntry {
            operation: JournalOperation::BlockMapRemap,
            increment: false,
            slot: slot.interior_slot as u16,
            slot_pbn: slot.interior_pbn,
            mapping: Mapping::UNMAPPED,
        };
        let append = match self.append_pair_with_space(increment, decrement) {
            Ok(append) => append,
            Err(error) => {
                let _ = self.depot.release_provisional(leaf_pbn);
                return Err(error);
            }
        };
        self.journal.note_block_map_blocks(1);
        let commit = self.journal.commit_tail(&*self.layer);
        self.metadata(commit)?;

        // Interior page update, under the journal lock.
        self.journal.locks.acquire(ZoneType::Logical, append.lock_sequence);
        let mut report = WriteBackReport::default();
        let install = self.block_map.install_leaf(
            &*self.layer,
            lbn,
            leaf_pbn,
            append.lock_sequence,
            &mut report,
        );
        let release = self.release_logical_report(&report);
        self.metadata(install)?;
        self.metadata(release)?;

        // Reference the new tree page at MAX.
        self.journal.locks.acquire(ZoneType::Physical, append.lock_sequence);
        self.journal.locks.acquire(ZoneType::Physical, append.lock_sequence);
        let adjust = self.depot.adjust_reference(
            &*self.layer,
            leaf_pbn,
            true,
            true,
            append.increment_point,
            Some(append.lock_sequence),
            ApplyMode::Normal,
        );
        let adjust = self.metadata(adjust)?;
        self.release_physical(&adjust.released_locks)?;

        // The appending operation's own locks.
        let released = self
            .journal
            .release_lock(ZoneType::Logical, append.lock_sequence)
            .and_then(|_| {
                self.journal
                    .release_lock(ZoneType::Physical, append.lock_sequence)
            });
        self.metadata(released)?;
        log::debug!("materialized block map leaf {} for lbn {}", leaf_pbn, lbn);
        Ok(leaf_pbn)
    }

    fn release_physical(&mut self, locks: &[crate::types::SequenceNumber]) -> VdoResult<()> {
        let result = self.journal.release_locks(ZoneType::Physical, locks);
        self.metadata(result)
    }

    /// Append a pair, making space by force-writing dirty state if the
    /// ring is full.
    fn append_pair_with_space(
        &mut self,
        increment: RecoveryJournalEntry,
        decrement: RecoveryJournalEntry,
    ) -> VdoResult<crate::recovery_journal::AppendResult> {
        match self.journal.append_pair(&*self.layer, increment, decrement) {
            Err(VdoError::NoSpace) => {
                let flushed = self.block_map.flush_all(&*self.layer);
                let flushed = self.metadata(flushed)?;
                self.release_logical_report(&flushed)?;
                let drained = self.depot.drain(&*self.layer);
                let drained = self.metadata(drained)?;
                self.release_physical(&drained)?;
                let retry = self.journal.append_pair(&*self.layer, increment, decrement);
                self.metadata(retry)
            }
            other => self.metadata(other),
        }
    }

    /// Apply the block-map and refcount effects of a committed pair.
    fn apply_journalled_change(
        &mut self,
        lbn: Lbn,
        append: &crate::recovery_journal::AppendResult,
        new_mapping: Mapping,
        old_mapping: Mapping,
    ) -> VdoResult<()> {
        // Block map side.
        self.journal.locks.acquire(ZoneType::Logical, append.lock_sequence);
        let mut report = WriteBackReport::default();
        let update = self.block_map.update(
            &*self.layer,
            lbn,
            new_mapping,
            append.lock_sequence,
            ValidationMode::Normal,
            &mut report,
        );
        let release = self.release_logical_report(&report);
        self.metadata(update)?;
        self.metadata(release)?;

        // Slab side: the new mapping's increment.
        if new_mapping.is_mapped() && self.depot.is_data_block(new_mapping.pbn) {
            self.journal.locks.acquire(ZoneType::Physical, append.lock_sequence);
            self.journal.locks.acquire(ZoneType::Physical, append.lock_sequence);
            let adjust = self.depot.adjust_reference(
                &*self.layer,
                new_mapping.pbn,
                true,
                false,
                append.increment_point,
                Some(append.lock_sequence),
                ApplyMode::Normal,
            );
            let adjust = self.metadata(adjust)?;
            self.release_physical(&adjust.released_locks)?;
        }

        // Slab side: the old mapping's decrement.
        if old_mapping.is_mapped() && self.depot.is_data_block(old_mapping.pbn) {
            self.journal.locks.acquire(ZoneType::Physical, append.lock_sequence);
            self.journal.locks.acquire(ZoneType::Physical, append.lock_sequence);
            let adjust = self.depot.adjust_reference(
                &*self.layer,
                old_mapping.pbn,
                false,
                false,
                append.decrement_point,
                Some(append.lock_sequence),
                ApplyMode::Normal,
            );
            let adjust = self.metadata(adjust)?;
            if let Some(freed) = adjust.freed_pbn {
                if let Some(index) = self.index.as_mut() {
                    index.forget(freed);
                }
            }
            self.release_physical(&adjust.released_locks)?;
        }

        // The appending operation's own locks.
        let released = self
            .journal
            .release_lock(ZoneType::Logical, append.lock_sequence)
            .and_then(|_| {
                self.journal
                    .release_lock(ZoneType::Physical, append.lock_sequence)
            });
        self.metadata(released)
    }

    /// Advance the block-map dirty era to the journal tail, writing back
    /// aged pages.
    fn advance_era(&mut self) -> VdoResult<()> {
        let tail = self.journal.tail();
        if tail <= self.block_map.era() {
            return Ok(());
        }
        let report = self.block_map.advance_era(&*self.layer, tail);
        let report = self.metadata(report)?;
        self.release_logical_report(&report)?;
        Ok(())
    }

    /// Install pre-compressed fragments packed into one container block.
    ///
    /// Each `(lbn, fragment)` pair maps its LBN to the shared container
    /// with a distinct fragment slot; the container's reference count ends
    /// at the fragment count.
    pub fn pack_fragments(&mut self, fragments: &[(Lbn, &[u8])]) -> VdoResult<()> {
        self.read_only.check()?;
        if !self.admin.is_normal() || !self.compression_enabled {
            return Err(VdoError::InvalidAdminState);
        }
        let images: Vec<&[u8]> = fragments.iter().map(|(_, data)| *data).collect();
        let (container, slots) = compressed::build_compressed_block(&images)?;
        if self.depot.free_blocks() == 0 {
            return Err(VdoError::NoSpace);
        }
        let container_pbn = self.depot.allocate()?;
        if let Err(error) = self.layer.write_block(container_pbn, &container) {
            let _ = self.depot.release_provisional(container_pbn);
            return Err(error);
        }

        for ((lbn, _), slot) in fragments.iter().zip(slots) {
            let mut report = WriteBackReport::default();
            let lookup = self.block_map.lookup(&*self.layer, *lbn, &mut report);
            let release = self.release_logical_report(&report);
            let old_mapping = lookup?;
            self.metadata(release)?;
            self.install_mapping(*lbn, Mapping::compressed(container_pbn, slot), old_mapping)?;
        }
        Ok(())
    }

    /// Discard whole logical blocks: their mappings return to unmapped.
    pub fn discard_blocks(&mut self, lbn: Lbn, count: u64) -> VdoResult<()> {
        self.read_only.check()?;
        if !self.admin.is_normal() {
            return Err(VdoError::InvalidAdminState);
        }
        self.discards += 1;
        for offset in 0..count {
            let target = lbn + offset;
            let mut report = WriteBackReport::default();
            let lookup = self.block_map.lookup(&*self.layer, target, &mut report);
            let release = self.release_logical_report(&report);
            let old_mapping = lookup?;
            self.metadata(release)?;
            if !old_mapping.is_mapped() {
                continue;
            }
            let generation = self.flusher.join();
            let result = self.install_mapping(target, Mapping::UNMAPPED, old_mapping);
            self.flusher.retire(generation);
            result?;
        }
        Ok(())
    }

    /// Discard a sector range, zeroing partial blocks read-modify-write
    /// and unmapping fully covered blocks.
    pub fn discard_sectors(&mut self, start_sector: u64, sector_count: u64) -> VdoResult<()> {
        self.read_only.check()?;
        if !self.admin.is_normal() {
            return Err(VdoError::InvalidAdminState);
        }
        if sector_count == 0 {
            return Ok(());
        }
        let end_sector = start_sector + sector_count;
        let mut sector = start_sector;
        while sector < end_sector {
            let lbn = sector / SECTORS_PER_BLOCK as u64;
            let block_start = lbn * SECTORS_PER_BLOCK as u64;
            let block_end = block_start + SECTORS_PER_BLOCK as u64;
            let covered_from = sector;
            let covered_to = end_sector.min(block_end);

            if covered_from == block_start && covered_to == block_end {
                self.discard_blocks(lbn, 1)?;
            } else {
                let mut buffer = vec![0u8; BLOCK_SIZE];
                self.read(lbn, &mut buffer)?;
                let from = (covered_from - block_start) as usize * SECTOR_SIZE;
                let to = (covered_to - block_start) as usize * SECTOR_SIZE;
                buffer[from..to].fill(0);
                self.write(lbn, &buffer)?;
            }
            sector = covered_to;
        }
        Ok(())
    }

    /// Flush: everything acknowledged so far is durable on success.
    pub fn flush(&mut self) -> VdoResult<()> {
        self.read_only.check()?;
        if !self.admin.is_normal() {
            return Err(VdoError::InvalidAdminState);
        }
        self.flusher.launch()?;
        let commit = self.journal.commit_tail(&*self.layer);
        self.metadata(commit)?;
        for _generation in self.flusher.ready() {
            self.layer.flush()?;
            self.block_map.note_device_flushed();
            self.flusher.complete();
        }
        Ok(())
    }

    fn drain_component(&mut self, component: AdminComponent) -> VdoResult<()> {
        log::debug!("draining {}", component);
        match component {
            AdminComponent::Journal => {
                let commit = self.journal.commit_tail(&*self.layer);
                self.metadata(commit)
            }
            AdminComponent::BlockMap => {
                let report = self.block_map.flush_all(&*self.layer);
                let report = self.metadata(report)?;
                self.release_logical_report(&report)
            }
            AdminComponent::Packer => Ok(()),
            AdminComponent::SlabDepot => {
                let released = self.depot.drain(&*self.layer);
                let released = self.metadata(released)?;
                self.release_physical(&released)
            }
            AdminComponent::Slab(_) => Ok(()),
            AdminComponent::SlabSummary => {
                let written = self.depot.summary.write_dirty(&*self.layer);
                self.metadata(written)
            }
        }
    }

    fn drain_all(&mut self) -> VdoResult<()> {
        for component in [
            AdminComponent::Journal,
            AdminComponent::BlockMap,
            AdminComponent::Packer,
            AdminComponent::SlabDepot,
            AdminComponent::SlabSummary,
        ] {
            self.drain_component(component)?;
        }
        self.journal.reap();
        self.layer.flush()?;
        self.block_map.note_device_flushed();
        Ok(())
    }

    /// Quiesce without persisting a clean flag.
    pub fn suspend(&mut self) -> VdoResult<()> {
        self.read_only.check()?;
        self.admin.start_draining(AdminState::Suspended)?;
        match self.drain_all() {
            Ok(()) => self.admin.finish_draining(),
            Err(error) => {
                // The drain failed; the volume stays readable.
                self.admin = AdminState::Normal;
                self.metadata(Err(error))
            }
        }
    }

    /// Quiesce and persist a clean super block.
    pub fn save(&mut self) -> VdoResult<()> {
        self.read_only.check()?;
        self.admin.start_draining(AdminState::Saved)?;
        if let Err(error) = self.drain_all() {
            self.admin = AdminState::Normal;
            return self.metadata(Err(error));
        }
        self.super_block.state = VdoState::Clean;
        self.super_block.journal = self.journal.state();
        let saved = self.super_block.save(&*self.layer);
        self.metadata(saved)?;
        self.admin.finish_draining()?;
        log::info!("volume saved clean");
        Ok(())
    }

    /// Return to normal operation from a quiescent state.
    pub fn resume(&mut self) -> VdoResult<()> {
        let was_saved = self.admin == AdminState::Saved;
        self.admin.start_resuming()?;
        if was_saved && !self.read_only.is_read_only() {
            self.super_block.state = VdoState::Dirty;
            let saved = self.super_block.save(&*self.layer);
            self.metadata(saved)?;
        }
        self.admin.finish_resuming()
    }

    /// Append whole slabs of new physical capacity.
    pub fn grow_physical(&mut self, new_physical_blocks: u64) -> VdoResult<()> {
        self.read_only.check()?;
        if !self.admin.is_normal() {
            return Err(VdoError::InvalidAdminState);
        }
        if new_physical_blocks > self.layer.block_count() {
            return Err(VdoError::OutOfRange);
        }
        let slab_size = self.depot.geometry().slab_size;
        let usable = new_physical_blocks.saturating_sub(self.layout.slab_origin);
        let new_count = usable / slab_size;
        let current = self.depot.slab_count();
        if new_count <= current {
            return Err(VdoError::IncrementTooSmall);
        }
        let geometry = self.depot.geometry();
        for slab in current..new_count {
            let base = self.layout.slab_origin + slab * slab_size;
            let zeroed = Self::zero_slab_metadata(&*self.layer, base, &geometry);
            self.metadata(zeroed)?;
        }
        self.depot.grow(new_count - current)?;
        self.layout.slab_count = new_count;
        self.layout.physical_blocks = new_physical_blocks;
        self.super_block.layout = self.layout.to_state();
        self.super_block.depot.slab_count = new_count;
        let written = self.depot.summary.write_dirty(&*self.layer);
        self.metadata(written)?;
        let saved = self.super_block.save(&*self.layer);
        self.metadata(saved)
    }

    /// Route new writes to the external compressor. The core keeps
    /// serving existing compressed mappings either way.
    pub fn set_compression(&mut self, enabled: bool) {
        self.compression_enabled = enabled;
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression_enabled
    }

    /// Mark the volume for a forced rebuild at next load. This is the only
    /// way back to a writable volume after read-only mode.
    pub fn schedule_rebuild(&mut self) -> VdoResult<()> {
        self.super_block.state = VdoState::ForceRebuild;
        self.super_block.save(&*self.layer)
    }

    /// Verify that the reference counts agree with the block map.
    ///
    /// Flushes the block map first so the on-disk tree is current, then
    /// walks it and compares the per-block tallies with the depot.
    pub fn audit(&mut self) -> VdoResult<AuditReport> {
        let flushed = self.block_map.flush_all(&*self.layer);
        let flushed = self.metadata(flushed)?;
        self.release_logical_report(&flushed)?;

        let mut expected: BTreeMap<Pbn, (u64, bool)> = BTreeMap::new();
        let mut report = AuditReport::default();
        recovery::walk_tree(
            &*self.layer,
            self.block_map.nonce(),
            self.block_map.root_origin(),
            self.block_map.root_count(),
            |_, _, mapping, is_tree| {
                let entry = expected.entry(mapping.pbn).or_insert((0, is_tree));
                entry.0 += 1;
                entry.1 |= is_tree;
                if is_tree {
                    report.tree_pages += 1;
                } else {
                    report.mapped_logical_blocks += 1;
                }
            },
        )?;

        for (pbn, (count, is_tree)) in &expected {
            if !self.depot.is_data_block(*pbn) {
                continue;
            }
            let actual = self.depot.reference_count(*pbn)?;
            let expected_count = if *is_tree {
                MAXIMUM_REFERENCE_COUNT
            } else {
                (*count).min(MAXIMUM_REFERENCE_COUNT as u64) as u8
            };
            if actual != expected_count {
                report.mismatches.push((*pbn, expected_count, actual));
            }
        }
        // Blocks referenced by nothing must be free.
        let geometry = self.depot.geometry();
        for slab_number in 0..self.depot.slab_count() {
            let base = self.depot.slab_origin() + slab_number * geometry.slab_size;
            for sbn in 0..geometry.data_blocks {
                let pbn = base + sbn;
                if expected.contains_key(&pbn) {
                    continue;
                }
                let actual = self.depot.reference_count(pbn)?;
                if actual != 0 {
                    report.mismatches.push((pbn, 0, actual));
                }
            }
        }
        Ok(report)
    }

    /// Point-in-time statistics.
    pub fn statistics(&self) -> VdoStatistics {
        let (hits, misses, evictions, pages_written) = self.block_map.cache_stats();
        VdoStatistics {
            logical_blocks_used: self.journal.logical_blocks_used(),
            data_blocks_used: self.depot.used_data_blocks(),
            block_map_data_blocks: self.journal.block_map_data_blocks(),
            reads: self.reads,
            writes: self.writes,
            discards: self.discards,
            dedupe_hits: self.dedupe_hits,
            zero_block_elisions: self.zero_elisions,
            journal_blocks_committed: self.journal.blocks_committed,
            journal_blocks_reaped: self.journal.blocks_reaped,
            page_cache_hits: hits,
            page_cache_misses: misses,
            page_cache_evictions: evictions,
            page_cache_writes: pages_written,
            slabs_scrubbed: self.depot.slabs_scrubbed,
            flushes_completed: self.flusher.completed_count(),
            complete_recoveries: self.super_block.complete_recoveries,
            read_only_recoveries: self.super_block.read_only_recoveries,
        }
    }

    /// The super block location, exposed for tooling.
    pub fn super_block_pbn() -> Pbn {
        SUPER_BLOCK_PBN
    }
}
