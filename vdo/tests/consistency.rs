//! Reference-count integrity under mixed workloads.
//!
//! After any sequence of writes, trims, flushes, crashes, and recoveries,
//! every quiescent state must satisfy: the number of block-map references
//! to each data block equals its reference count.

mod common;

use common::{assert_consistent, fresh_volume, reload};
use vdo::constants::BLOCK_SIZE;
use vdo::dedup::MemoryIndex;

/// Small deterministic generator so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

fn content_block(seed: u64) -> Vec<u8> {
    // A handful of distinct contents so dedup actually triggers.
    let mut data = vec![0u8; BLOCK_SIZE];
    let value = (seed % 7 + 1) as u8;
    data.fill(value);
    data[0] = value;
    data
}

#[test]
fn mixed_workload_stays_consistent() {
    let (_layer, _config, mut volume) = fresh_volume(512, 4096);
    volume.set_dedup_index(Box::new(MemoryIndex::new()));
    let mut rng = Lcg(0x1234_5678);

    for round in 0..6 {
        for _ in 0..40 {
            let lbn = rng.next() % 512;
            match rng.next() % 4 {
                0 => {
                    volume.discard_blocks(lbn, 1).unwrap();
                }
                1 => {
                    let start = rng.next() % (512 * 8 - 24);
                    volume.discard_sectors(start, rng.next() % 24 + 1).unwrap();
                }
                _ => {
                    let data = content_block(rng.next());
                    volume.write(lbn, &data).unwrap();
                }
            }
        }
        volume.flush().unwrap();
        assert_consistent(&mut volume);
        assert!(round < 6);
    }
}

#[test]
fn workload_with_crashes_stays_consistent() {
    let (layer, config, mut volume) = fresh_volume(512, 4096);
    let mut rng = Lcg(0x9e37_79b9);
    let mut expected: Vec<Option<u64>> = vec![None; 512];

    for round in 0..4u64 {
        for _ in 0..30 {
            let lbn = (rng.next() % 512) as usize;
            if rng.next() % 5 == 0 {
                volume.discard_blocks(lbn as u64, 1).unwrap();
                expected[lbn] = None;
            } else {
                let seed = rng.next();
                volume.write(lbn as u64, &content_block(seed)).unwrap();
                expected[lbn] = Some(seed);
            }
        }
        // Crash and recover.
        drop(volume);
        volume = reload(&layer, &config);
        assert_eq!(volume.statistics().complete_recoveries, round + 1);
        assert_consistent(&mut volume);

        // Every acknowledged operation survived.
        let mut buffer = vec![0u8; BLOCK_SIZE];
        for (lbn, entry) in expected.iter().enumerate() {
            volume.read(lbn as u64, &mut buffer).unwrap();
            match entry {
                None => assert!(
                    buffer.iter().all(|&byte| byte == 0),
                    "round {round} lbn {lbn} should be unmapped"
                ),
                Some(seed) => assert_eq!(
                    buffer,
                    content_block(*seed),
                    "round {round} lbn {lbn} content lost"
                ),
            }
        }
    }
}

#[test]
fn trim_of_unmapped_space_is_a_no_op() {
    let (_layer, _config, mut volume) = fresh_volume(512, 4096);
    volume.discard_blocks(0, 100).unwrap();
    volume.discard_sectors(3, 17).unwrap();
    assert_eq!(volume.statistics().logical_blocks_used, 0);
    assert_consistent(&mut volume);
}

#[test]
fn journal_pressure_does_not_wedge() {
    // A small recovery journal forces the ring to wrap and reap many
    // times over.
    let layer = std::sync::Arc::new(vdo::physical::RamLayer::new(4096));
    let mut config = vdo::config::VdoConfig::small(512, 4096, common::NONCE);
    config.recovery_journal_blocks = 4;
    config.maximum_age = 2;
    vdo::vdo::Vdo::format(&*layer, &config).unwrap();
    let mut volume = vdo::vdo::Vdo::load(layer.clone(), &config).unwrap();

    for pass in 0..4u64 {
        for lbn in 0..400u64 {
            let mut data = vec![0u8; BLOCK_SIZE];
            data.fill((lbn % 200 + 1) as u8);
            data[1] = pass as u8;
            match volume.write(lbn, &data) {
                Ok(()) => {}
                Err(error) => panic!("pass {pass} lbn {lbn}: {error:?}"),
            }
        }
    }
    volume.flush().unwrap();
    assert_consistent(&mut volume);
    let stats = volume.statistics();
    assert!(stats.journal_blocks_reaped > 0);
    assert_eq!(stats.logical_blocks_used, 400);

    // And it still recovers.
    drop(volume);
    let mut recovered = vdo::vdo::Vdo::load(layer, &config).unwrap();
    assert_consistent(&mut recovered);
    let mut buffer = vec![0u8; BLOCK_SIZE];
    recovered.read(0, &mut buffer).unwrap();
    assert_eq!(buffer[1], 3);
}
