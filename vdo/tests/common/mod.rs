//! Shared fixtures for the end-to-end tests.

#![allow(dead_code)]

use std::sync::Arc;

use vdo::config::VdoConfig;
use vdo::physical::RamLayer;
use vdo::vdo::Vdo;

pub const NONCE: u64 = 0xdec0_de00_0000_0042;

/// Format a small volume on a fresh RAM layer and load it.
pub fn fresh_volume(
    logical_blocks: u64,
    physical_blocks: u64,
) -> (Arc<RamLayer>, VdoConfig, Vdo<RamLayer>) {
    let layer = Arc::new(RamLayer::new(physical_blocks));
    let config = VdoConfig::small(logical_blocks, physical_blocks, NONCE);
    Vdo::format(&*layer, &config).expect("format");
    let volume = Vdo::load(layer.clone(), &config).expect("load");
    (layer, config, volume)
}

/// Reload the volume from the same layer, as after a crash or restart.
pub fn reload(layer: &Arc<RamLayer>, config: &VdoConfig) -> Vdo<RamLayer> {
    Vdo::load(layer.clone(), config).expect("reload")
}

/// A block whose every byte is `value`.
pub fn filled_block(value: u8) -> Vec<u8> {
    vec![value; vdo::constants::BLOCK_SIZE]
}

/// A block with distinctive per-sector content: sector `s` of logical
/// block `lbn` holds the byte `lbn * 8 + s + 1`.
pub fn sector_patterned_block(lbn: u64) -> Vec<u8> {
    let mut data = vec![0u8; vdo::constants::BLOCK_SIZE];
    for sector in 0..vdo::constants::SECTORS_PER_BLOCK as u64 {
        let value = (lbn * vdo::constants::SECTORS_PER_BLOCK as u64 + sector + 1) as u8;
        let start = sector as usize * vdo::constants::SECTOR_SIZE;
        data[start..start + vdo::constants::SECTOR_SIZE].fill(value);
    }
    data
}

/// Assert that refcounts and block map agree everywhere.
pub fn assert_consistent(volume: &mut Vdo<RamLayer>) {
    let report = volume.audit().expect("audit");
    assert!(
        report.is_consistent(),
        "reference count mismatches: {:?}",
        report.mismatches
    );
}
