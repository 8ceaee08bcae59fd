//! In-memory form of a single block-map page.

use alloc::boxed::Box;

use crate::constants::{
    BLOCK_MAP_ENTRIES_PER_PAGE, BLOCK_MAP_ENTRY_SIZE, BLOCK_MAP_PAGE_HEADER_SIZE, BLOCK_SIZE,
};
use crate::encoding::{
    pack_block_map_entry, unpack_block_map_entry, BlockMapPageHeader,
};
use crate::errors::{VdoError, VdoResult};
use crate::types::{Mapping, Pbn, SequenceNumber};

/// Result of validating a page image read from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageValidity {
    /// Header matches this volume and location.
    Valid,
    /// The page has never been written by this volume; its content is
    /// meaningless and it reads as all-unmapped.
    Unformatted,
    /// The header belongs to some other volume, location, or torn write.
    Bad,
}

/// Inspect a raw page image.
pub fn validate_page(buffer: &[u8], nonce: u64, expected_pbn: Pbn) -> PageValidity {
    let header = BlockMapPageHeader::decode(buffer);
    if header.nonce == nonce && header.pbn == expected_pbn && header.initialized {
        return PageValidity::Valid;
    }
    if buffer.iter().all(|&byte| byte == 0) {
        return PageValidity::Unformatted;
    }
    PageValidity::Bad
}

/// Format `buffer` as an empty page owned by this volume at `pbn`.
pub fn format_page(buffer: &mut [u8; BLOCK_SIZE], nonce: u64, pbn: Pbn) {
    buffer.fill(0);
    BlockMapPageHeader {
        nonce,
        pbn,
        recovery_lock: 0,
        initialized: true,
        entries_written: 0,
    }
    .encode(buffer);
}

/// Create a fresh all-unmapped page image.
pub fn new_page(nonce: u64, pbn: Pbn) -> Box<[u8; BLOCK_SIZE]> {
    let mut buffer = Box::new([0u8; BLOCK_SIZE]);
    format_page(&mut buffer, nonce, pbn);
    buffer
}

fn entry_offset(index: usize) -> usize {
    BLOCK_MAP_PAGE_HEADER_SIZE + index * BLOCK_MAP_ENTRY_SIZE
}

/// Read entry `index` from a page image.
pub fn get_entry(buffer: &[u8], index: usize) -> VdoResult<Mapping> {
    if index >= BLOCK_MAP_ENTRIES_PER_PAGE {
        return Err(VdoError::OutOfRange);
    }
    let offset = entry_offset(index);
    let mut packed = [0u8; BLOCK_MAP_ENTRY_SIZE];
    packed.copy_from_slice(&buffer[offset..offset + BLOCK_MAP_ENTRY_SIZE]);
    unpack_block_map_entry(&packed)
}

/// Write entry `index` into a page image.
pub fn set_entry(buffer: &mut [u8], index: usize, mapping: &Mapping) -> VdoResult<()> {
    if index >= BLOCK_MAP_ENTRIES_PER_PAGE {
        return Err(VdoError::OutOfRange);
    }
    let packed = pack_block_map_entry(mapping)?;
    let offset = entry_offset(index);
    buffer[offset..offset + BLOCK_MAP_ENTRY_SIZE].copy_from_slice(&packed);
    Ok(())
}

/// Stamp the header fields a writer persists: the recovery lock being
/// carried to disk and the number of live entries.
pub fn stamp_for_write(buffer: &mut [u8], recovery_lock: SequenceNumber) {
    let mut header = BlockMapPageHeader::decode(buffer);
    header.recovery_lock = recovery_lock;
    header.initialized = true;
    header.entries_written = BLOCK_MAP_ENTRIES_PER_PAGE as u16;
    header.encode(buffer);
}
