//! Lifecycle operations: suspend, save, resume, grow, read-only mode, and
//! forced rebuild.

mod common;

use common::{assert_consistent, filled_block, fresh_volume, reload};
use vdo::constants::BLOCK_SIZE;
use vdo::physical::ram::InjectOn;
use vdo::VdoError;
use vdo::PhysicalLayer;

#[test]
fn suspend_blocks_io_until_resume() {
    let (_layer, _config, mut volume) = fresh_volume(1024, 4096);
    volume.write(1, &filled_block(1)).unwrap();
    volume.suspend().unwrap();
    let mut buffer = vec![0u8; BLOCK_SIZE];
    assert_eq!(
        volume.write(2, &filled_block(2)),
        Err(VdoError::InvalidAdminState)
    );
    assert_eq!(volume.read(1, &mut buffer), Err(VdoError::InvalidAdminState));
    volume.resume().unwrap();
    volume.read(1, &mut buffer).unwrap();
    assert_eq!(buffer[0], 1);
    volume.write(2, &filled_block(2)).unwrap();
}

#[test]
fn double_suspend_is_an_admin_error() {
    let (_layer, _config, mut volume) = fresh_volume(1024, 4096);
    volume.suspend().unwrap();
    assert_eq!(volume.suspend(), Err(VdoError::InvalidAdminState));
    volume.resume().unwrap();
}

#[test]
fn save_resume_cycle_keeps_data() {
    let (_layer, _config, mut volume) = fresh_volume(1024, 4096);
    volume.write(42, &filled_block(0x42)).unwrap();
    volume.save().unwrap();
    volume.resume().unwrap();
    let mut buffer = vec![0u8; BLOCK_SIZE];
    volume.read(42, &mut buffer).unwrap();
    assert_eq!(buffer[0], 0x42);
    volume.write(43, &filled_block(0x43)).unwrap();
    assert_consistent(&mut volume);
}

#[test]
fn grow_physical_adds_capacity() {
    // The device is 2048 blocks; the volume initially claims 1024.
    let layer = std::sync::Arc::new(vdo::physical::RamLayer::new(2048));
    let config = vdo::config::VdoConfig::small(4096, 1024, common::NONCE);
    vdo::vdo::Vdo::format(&*layer, &config).unwrap();
    let mut volume = vdo::vdo::Vdo::load(layer.clone(), &config).unwrap();

    let mut written = 0u64;
    loop {
        match volume.write(written, &filled_block((written % 251 + 1) as u8)) {
            Ok(()) => written += 1,
            Err(VdoError::NoSpace) => break,
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    // Less than one slab of growth is refused; past the device too.
    assert_eq!(volume.grow_physical(1025), Err(VdoError::IncrementTooSmall));
    assert_eq!(volume.grow_physical(4096), Err(VdoError::OutOfRange));

    volume.grow_physical(1024 + 256).unwrap();
    volume.write(written, &filled_block(7)).unwrap();
    assert_consistent(&mut volume);

    // The growth survives a reload.
    drop(volume);
    let mut reloaded = vdo::vdo::Vdo::load(layer.clone(), &config).unwrap();
    let mut buffer = vec![0u8; BLOCK_SIZE];
    reloaded.read(written, &mut buffer).unwrap();
    assert_eq!(buffer[0], 7);
    assert_consistent(&mut reloaded);
}

#[test]
fn refcount_write_error_forces_read_only() {
    let (layer, _config, mut volume) = fresh_volume(1024, 4096);
    volume.write(1, &filled_block(1)).unwrap();
    volume.write(2, &filled_block(2)).unwrap();

    // Arm a failure on the refcount region of the first slab. The save's
    // refcount write-back trips it.
    let geometry_data = 247u64; // data blocks per 256-block slab
    let slab_origin = 1 + 16 + 64 + 1;
    let refcount_pbn = slab_origin + geometry_data;
    layer.inject_error(InjectOn::Write, refcount_pbn, refcount_pbn);

    assert_eq!(volume.save(), Err(VdoError::ReadOnly));
    assert!(volume.is_read_only());

    // Writes, discards, flushes, and suspends all refuse.
    assert_eq!(volume.write(3, &filled_block(3)), Err(VdoError::ReadOnly));
    assert_eq!(volume.discard_blocks(1, 1), Err(VdoError::ReadOnly));
    assert_eq!(volume.flush(), Err(VdoError::ReadOnly));
    assert_eq!(volume.suspend(), Err(VdoError::ReadOnly));

    // Reads of previously written data still work.
    let mut buffer = vec![0u8; BLOCK_SIZE];
    volume.read(1, &mut buffer).unwrap();
    assert_eq!(buffer[0], 1);
    volume.read(2, &mut buffer).unwrap();
    assert_eq!(buffer[0], 2);
}

#[test]
fn forced_rebuild_reconstructs_refcounts() {
    let (layer, config, mut volume) = fresh_volume(1024, 4096);
    volume.write(10, &filled_block(0xaa)).unwrap();
    volume.write(20, &filled_block(0xbb)).unwrap();
    // Make the tree durable, then schedule a rebuild.
    volume.save().unwrap();
    volume.resume().unwrap();
    volume.schedule_rebuild().unwrap();
    drop(volume);

    let mut rebuilt = reload(&layer, &config);
    assert_eq!(rebuilt.statistics().read_only_recoveries, 1);
    let mut buffer = vec![0u8; BLOCK_SIZE];
    rebuilt.read(10, &mut buffer).unwrap();
    assert_eq!(buffer[0], 0xaa);
    rebuilt.read(20, &mut buffer).unwrap();
    assert_eq!(buffer[0], 0xbb);
    // Rebuilt refcounts agree with the tree, and writes work again.
    assert_consistent(&mut rebuilt);
    rebuilt.write(30, &filled_block(0xcc)).unwrap();
    assert_consistent(&mut rebuilt);
}

#[test]
fn compression_toggle_gates_the_packer_only() {
    let (_layer, _config, mut volume) = fresh_volume(1024, 4096);
    let fragment = vec![0x12u8; 64];
    volume.pack_fragments(&[(1, &fragment)]).unwrap();
    volume.set_compression(false);
    assert_eq!(
        volume.pack_fragments(&[(2, &fragment)]),
        Err(VdoError::InvalidAdminState)
    );
    // Existing compressed mappings still read.
    let mut buffer = vec![0u8; BLOCK_SIZE];
    volume.read(1, &mut buffer).unwrap();
    assert_eq!(&buffer[..64], &fragment[..]);
    volume.set_compression(true);
    volume.pack_fragments(&[(2, &fragment)]).unwrap();
    assert_consistent(&mut volume);
}

#[test]
fn load_rejects_corrupt_super_block() {
    let (layer, config, volume) = fresh_volume(256, 4096);
    drop(volume);
    let garbage = vec![0x5au8; BLOCK_SIZE];
    layer.write_block(0, &garbage).unwrap();
    assert!(matches!(
        vdo::vdo::Vdo::load(layer.clone(), &config),
        Err(VdoError::OutOfRange)
    ));
}
