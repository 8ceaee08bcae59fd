//! Crash recovery: journal replay and full rebuild.
//!
//! After an unclean shutdown the recovery journal is the authority: its
//! contiguous valid tail is replayed into the block map and, through the
//! slab journals, into the reference counts. When the journal itself is
//! not trustworthy, the block map becomes the authority instead and the
//! reference counts are rebuilt from a full tree walk.
//!
//! Every stage persists its completion to the super block before the next
//! begins, so a crash during recovery redoes only the unfinished stage.

pub mod rebuild;

use alloc::vec;
use alloc::vec::Vec;

use crate::block_map::cache::WriteBackReport;
use crate::block_map::{page, BlockMap};
use crate::constants::{
    BLOCK_SIZE, RECOVERY_JOURNAL_ENTRIES_PER_BLOCK, RECOVERY_JOURNAL_ENTRY_SIZE,
    RECOVERY_JOURNAL_HEADER_SIZE,
};
use crate::encoding::{RecoveryBlockHeader, RecoveryJournalEntry};
use crate::errors::{VdoError, VdoResult};
use crate::physical::PhysicalLayer;
use crate::slab_depot::ref_counts::ApplyMode;
use crate::slab_depot::SlabDepot;
use crate::types::{JournalPoint, Pbn, SequenceNumber};

/// The replayable portion of the journal found on disk.
#[derive(Debug)]
pub struct JournalTail {
    pub head: SequenceNumber,
    /// One past the newest valid block.
    pub tail: SequenceNumber,
    pub entries: Vec<(JournalPoint, RecoveryJournalEntry)>,
    pub logical_blocks_used: u64,
    pub block_map_data_blocks: u64,
}

fn journal_pbn(origin: Pbn, size: u64, sequence: SequenceNumber) -> Pbn {
    origin + (sequence - 1) % size
}

/// Find the contiguous valid tail of the recovery journal.
///
/// A block belongs to the tail when its nonce, metadata type, check byte,
/// and recovery count all match and its sequence number continues the
/// chain. The scan starts from the oldest head recorded by the newest
/// valid block.
pub fn scan_journal<L: PhysicalLayer>(
    layer: &L,
    origin: Pbn,
    size: u64,
    nonce: u64,
    recovery_count: u8,
) -> VdoResult<Option<JournalTail>> {
    let mut buffer = vec![0u8; BLOCK_SIZE];

    // Pass 1: the newest valid block tells us where the tail ends and
    // where replay must start.
    let mut newest: Option<RecoveryBlockHeader> = None;
    for offset in 0..size {
        layer.read_block(origin + offset, &mut buffer)?;
        let header = RecoveryBlockHeader::decode(&buffer);
        if !header.is_valid_for(nonce, recovery_count) {
            continue;
        }
        if journal_pbn(origin, size, header.sequence_number) != origin + offset {
            // A stale block left at the wrong ring position.
            continue;
        }
        if newest.map_or(true, |best| header.sequence_number > best.sequence_number) {
            newest = Some(header);
        }
    }
    let newest = match newest {
        Some(header) => header,
        None => return Ok(None),
    };

    let head = newest.block_map_head.min(newest.slab_journal_head).max(1);

    // Pass 2: walk forward from the head, stopping at the first break in
    // the chain.
    let mut entries = Vec::new();
    let mut sequence = head;
    let mut last_valid = None;
    while sequence <= newest.sequence_number {
        layer.read_block(origin + (sequence - 1) % size, &mut buffer)?;
        let header = RecoveryBlockHeader::decode(&buffer);
        if !header.is_valid_for(nonce, recovery_count) || header.sequence_number != sequence {
            break;
        }
        if header.entry_count as usize > RECOVERY_JOURNAL_ENTRIES_PER_BLOCK {
            return Err(VdoError::CorruptJournal);
        }
        for index in 0..header.entry_count as usize {
            let start = RECOVERY_JOURNAL_HEADER_SIZE + index * RECOVERY_JOURNAL_ENTRY_SIZE;
            let mut packed = [0u8; RECOVERY_JOURNAL_ENTRY_SIZE];
            packed.copy_from_slice(&buffer[start..start + RECOVERY_JOURNAL_ENTRY_SIZE]);
            let entry = match RecoveryJournalEntry::unpack(&packed) {
                Ok(entry) => entry,
                // A torn entry ends the usable tail.
                Err(_) => return Err(VdoError::CorruptJournal),
            };
            entries.push((JournalPoint::new(sequence, index as u16), entry));
        }
        last_valid = Some(header);
        sequence += 1;
    }

    let last = match last_valid {
        Some(header) => header,
        None => return Ok(None),
    };
    Ok(Some(JournalTail {
        head,
        tail: last.sequence_number + 1,
        entries,
        logical_blocks_used: last.logical_blocks_used,
        block_map_data_blocks: last.block_map_data_blocks,
    }))
}

/// Stage one of recovery: replay every journalled mapping into the block
/// map and flush the pages out.
///
/// Increments carry the new slot value; replaying them in journal order
/// leaves each slot holding its newest mapping, so the pass is idempotent.
/// Decrements change no page. Pages that fail validation are leaves that
/// were allocated but never written and start empty.
pub fn replay_block_map<L: PhysicalLayer>(
    layer: &L,
    block_map: &mut BlockMap,
    tail: &JournalTail,
) -> VdoResult<()> {
    let mut report = WriteBackReport::default();
    let mut applied = 0u64;
    for (_, entry) in &tail.entries {
        if !entry.increment {
            continue;
        }
        block_map.apply_raw(
            layer,
            entry.slot_pbn,
            entry.slot as usize,
            entry.mapping,
            &mut report,
        )?;
        applied += 1;
    }
    block_map.flush_all(layer)?;
    layer.flush()?;
    block_map.reset_caches();
    log::info!("block map replay applied {} journal entries", applied);
    Ok(())
}

/// Stage two of recovery: scrub every slab, then re-journal and apply the
/// tail entries the slab journals never captured.
pub fn recover_ref_counts<L: PhysicalLayer>(
    layer: &L,
    depot: &mut SlabDepot,
    tail: &JournalTail,
) -> VdoResult<()> {
    depot.scrub_all(layer)?;

    let mut replayed = 0u64;
    for (point, entry) in &tail.entries {
        if !entry.mapping.is_mapped() {
            continue;
        }
        let pbn = entry.mapping.pbn;
        if !depot.is_data_block(pbn) {
            log::warn!("journal entry references non-data block {}", pbn);
            continue;
        }
        if *point <= depot.recovery_cutoff_for(pbn)? {
            // Already durable in the slab journal and applied by the
            // scrub.
            continue;
        }
        let block_map = matches!(
            entry.operation,
            crate::types::JournalOperation::BlockMapRemap
        );
        depot.adjust_reference(
            layer,
            pbn,
            entry.increment,
            block_map,
            *point,
            None,
            ApplyMode::Normal,
        )?;
        replayed += 1;
    }
    let _ = depot.drain(layer)?;
    layer.flush()?;
    log::info!("reference count recovery replayed {} entries", replayed);
    Ok(())
}

/// Walk every mapped entry reachable from the tree roots, reading raw
/// pages. Invalid or unreadable leaves count as unmapped. The callback
/// sees `(container_page_pbn, slot, mapping, is_tree_page)` where tree
/// pages are reported through interior entries.
pub fn walk_tree<L: PhysicalLayer, F: FnMut(Pbn, usize, &crate::types::Mapping, bool)>(
    layer: &L,
    nonce: u64,
    root_origin: Pbn,
    root_count: u64,
    mut visit: F,
) -> VdoResult<()> {
    let mut interior = vec![0u8; BLOCK_SIZE];
    let mut leaf = vec![0u8; BLOCK_SIZE];
    for root in 0..root_count {
        let root_pbn = root_origin + root;
        layer.read_block(root_pbn, &mut interior)?;
        if page::validate_page(&interior, nonce, root_pbn) != page::PageValidity::Valid {
            continue;
        }
        for interior_slot in 0..crate::constants::BLOCK_MAP_ENTRIES_PER_PAGE {
            let entry = match page::get_entry(&interior, interior_slot) {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            if !entry.is_mapped() {
                continue;
            }
            visit(root_pbn, interior_slot, &entry, true);

            let leaf_pbn = entry.pbn;
            if layer.read_block(leaf_pbn, &mut leaf).is_err() {
                continue;
            }
            if page::validate_page(&leaf, nonce, leaf_pbn) != page::PageValidity::Valid {
                continue;
            }
            for leaf_slot in 0..crate::constants::BLOCK_MAP_ENTRIES_PER_PAGE {
                let mapping = match page::get_entry(&leaf, leaf_slot) {
                    Ok(mapping) => mapping,
                    Err(_) => continue,
                };
                if mapping.is_mapped() {
                    visit(leaf_pbn, leaf_slot, &mapping, false);
                }
            }
        }
    }
    Ok(())
}
