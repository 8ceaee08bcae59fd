//! Compressed-container block format.
//!
//! The packer (an external collaborator) fills a data block with up to 14
//! compressed fragments; the mapping state of each sharing LBN selects its
//! slot. The core only locates and validates fragments at read time; the
//! compression transform itself lives behind [`Decompressor`].

use alloc::vec::Vec;

use crate::constants::{BLOCK_SIZE, COMPRESSED_FRAGMENTS_PER_BLOCK};
use crate::encoding::{get_u16, put_u16};
use crate::errors::{VdoError, VdoResult};

/// Version tag in byte 0 of a container block.
pub const COMPRESSED_BLOCK_VERSION: u8 = 1;

/// Bytes before the first fragment: version, a reserved byte, and one
/// little-endian u16 length per slot.
pub const COMPRESSED_BLOCK_HEADER_SIZE: usize = 2 + 2 * COMPRESSED_FRAGMENTS_PER_BLOCK;

/// Largest payload a single container can carry.
pub const COMPRESSED_BLOCK_DATA_SIZE: usize = BLOCK_SIZE - COMPRESSED_BLOCK_HEADER_SIZE;

/// Decompresses one fragment back into a full block.
///
/// Supplied by the host; the core never interprets fragment bytes.
pub trait Decompressor {
    fn decompress(&self, fragment: &[u8], out: &mut [u8]) -> VdoResult<()>;
}

/// Assemble a container block from pre-compressed fragments.
///
/// Returns the container image and the slot assigned to each fragment, in
/// input order.
pub fn build_compressed_block(fragments: &[&[u8]]) -> VdoResult<([u8; BLOCK_SIZE], Vec<u8>)> {
    if fragments.is_empty() || fragments.len() > COMPRESSED_FRAGMENTS_PER_BLOCK {
        return Err(VdoError::InvalidFragment);
    }
    let total: usize = fragments.iter().map(|f| f.len()).sum();
    if total > COMPRESSED_BLOCK_DATA_SIZE || fragments.iter().any(|f| f.is_empty()) {
        return Err(VdoError::InvalidFragment);
    }

    let mut block = [0u8; BLOCK_SIZE];
    block[0] = COMPRESSED_BLOCK_VERSION;
    let mut offset = COMPRESSED_BLOCK_HEADER_SIZE;
    let mut slots = Vec::with_capacity(fragments.len());
    for (slot, fragment) in fragments.iter().enumerate() {
        put_u16(&mut block, 2 + 2 * slot, fragment.len() as u16);
        block[offset..offset + fragment.len()].copy_from_slice(fragment);
        offset += fragment.len();
        slots.push(slot as u8);
    }
    Ok((block, slots))
}

/// Locate fragment `slot` inside a container block.
///
/// Fails with [`VdoError::InvalidFragment`] when the container version is
/// wrong, the slot is empty, or the recorded sizes overrun the block.
pub fn get_fragment(block: &[u8], slot: u8) -> VdoResult<&[u8]> {
    if block.len() != BLOCK_SIZE || block[0] != COMPRESSED_BLOCK_VERSION {
        return Err(VdoError::InvalidFragment);
    }
    if slot as usize >= COMPRESSED_FRAGMENTS_PER_BLOCK {
        return Err(VdoError::InvalidFragment);
    }
    let mut offset = COMPRESSED_BLOCK_HEADER_SIZE;
    for index in 0..slot {
        offset += get_u16(block, 2 + 2 * index as usize) as usize;
    }
    let length = get_u16(block, 2 + 2 * slot as usize) as usize;
    if length == 0 || offset + length > BLOCK_SIZE {
        return Err(VdoError::InvalidFragment);
    }
    Ok(&block[offset..offset + length])
}
