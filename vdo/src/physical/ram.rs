//! In-memory physical layer used by tests and tooling.
//!
//! Besides being a plain RAM-backed block array, the layer can model the two
//! failure modes the core has to survive:
//!
//! - **Power loss**: with the volatile write cache enabled, writes land in a
//!   cache that only reaches the backing store on `flush`. `crash` discards
//!   the cache, so everything written since the last flush is lost: the
//!   worst case a real device with a volatile cache presents.
//! - **Media errors**: a single-shot injected failure on the next read or
//!   write touching a chosen block range, reported as
//!   [`VdoError::Injected`].
//!
//! Read, write, and flush counters support the I/O-count contracts in the
//! slab-loading tests.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::constants::BLOCK_SIZE;
use crate::errors::{VdoError, VdoResult};
use crate::physical::PhysicalLayer;

/// Which operations an injected error should match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectOn {
    Read,
    Write,
}

struct Injection {
    on: InjectOn,
    /// Inclusive block range the injection arms against.
    range: (u64, u64),
}

struct Backing {
    blocks: Vec<u8>,
    /// Writes not yet flushed, when the volatile cache is enabled.
    cache: BTreeMap<u64, Vec<u8>>,
    volatile_cache: bool,
    injection: Option<Injection>,
}

/// RAM-backed [`PhysicalLayer`] with crash simulation and error injection.
pub struct RamLayer {
    backing: Mutex<Backing>,
    block_count: u64,
    reads: AtomicU64,
    writes: AtomicU64,
    flushes: AtomicU64,
}

impl RamLayer {
    /// Create a zero-filled layer of `block_count` blocks.
    pub fn new(block_count: u64) -> Self {
        RamLayer {
            backing: Mutex::new(Backing {
                blocks: vec![0u8; block_count as usize * BLOCK_SIZE],
                cache: BTreeMap::new(),
                volatile_cache: false,
                injection: None,
            }),
            block_count,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Enable or disable the volatile write cache.
    ///
    /// While enabled, writes are not durable until the next `flush`.
    pub fn set_volatile_cache(&self, enabled: bool) {
        let mut backing = self.backing.lock();
        backing.volatile_cache = enabled;
        if !enabled {
            Self::drain_cache(&mut backing);
        }
    }

    /// Simulate a power failure: every write since the last flush is lost.
    pub fn crash(&self) {
        self.backing.lock().cache.clear();
    }

    /// Arm a single-shot error on the next matching operation touching a
    /// block in `[first, last]`.
    pub fn inject_error(&self, on: InjectOn, first: u64, last: u64) {
        self.backing.lock().injection = Some(Injection {
            on,
            range: (first, last),
        });
    }

    /// Disarm any pending injection.
    pub fn clear_injection(&self) {
        self.backing.lock().injection = None;
    }

    /// Number of block reads issued since creation or the last reset.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of block writes issued since creation or the last reset.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of flushes issued since creation or the last reset.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Zero all I/O counters.
    pub fn reset_counters(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.flushes.store(0, Ordering::Relaxed);
    }

    fn drain_cache(backing: &mut Backing) {
        let pending: Vec<(u64, Vec<u8>)> = backing
            .cache
            .iter()
            .map(|(pbn, data)| (*pbn, data.clone()))
            .collect();
        for (pbn, data) in pending {
            let offset = pbn as usize * BLOCK_SIZE;
            backing.blocks[offset..offset + BLOCK_SIZE].copy_from_slice(&data);
        }
        backing.cache.clear();
    }

    fn take_injection(backing: &mut Backing, on: InjectOn, pbn: u64) -> bool {
        let hit = match &backing.injection {
            Some(inj) => inj.on == on && pbn >= inj.range.0 && pbn <= inj.range.1,
            None => false,
        };
        if hit {
            backing.injection = None;
        }
        hit
    }
}

impl PhysicalLayer for RamLayer {
    fn read_block(&self, pbn: u64, buf: &mut [u8]) -> VdoResult<()> {
        if pbn >= self.block_count || buf.len() != BLOCK_SIZE {
            return Err(VdoError::OutOfRange);
        }
        let mut backing = self.backing.lock();
        if Self::take_injection(&mut backing, InjectOn::Read, pbn) {
            return Err(VdoError::Injected);
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        if let Some(cached) = backing.cache.get(&pbn) {
            buf.copy_from_slice(cached);
        } else {
            let offset = pbn as usize * BLOCK_SIZE;
            buf.copy_from_slice(&backing.blocks[offset..offset + BLOCK_SIZE]);
        }
        Ok(())
    }

    fn write_block(&self, pbn: u64, buf: &[u8]) -> VdoResult<()> {
        if pbn >= self.block_count || buf.len() != BLOCK_SIZE {
            return Err(VdoError::OutOfRange);
        }
        let mut backing = self.backing.lock();
        if Self::take_injection(&mut backing, InjectOn::Write, pbn) {
            return Err(VdoError::Injected);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        if backing.volatile_cache {
            backing.cache.insert(pbn, buf.to_vec());
        } else {
            let offset = pbn as usize * BLOCK_SIZE;
            backing.blocks[offset..offset + BLOCK_SIZE].copy_from_slice(buf);
        }
        Ok(())
    }

    fn flush(&self) -> VdoResult<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        let mut backing = self.backing.lock();
        Self::drain_cache(&mut backing);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_what_was_written() {
        let layer = RamLayer::new(16);
        let block = [0xabu8; BLOCK_SIZE];
        layer.write_block(3, &block).unwrap();
        let mut out = [0u8; BLOCK_SIZE];
        layer.read_block(3, &mut out).unwrap();
        assert_eq!(out[..], block[..]);
    }

    #[test]
    fn out_of_range_rejected() {
        let layer = RamLayer::new(4);
        let mut buf = [0u8; BLOCK_SIZE];
        assert_eq!(layer.read_block(4, &mut buf), Err(VdoError::OutOfRange));
        assert_eq!(layer.write_block(9, &buf), Err(VdoError::OutOfRange));
    }

    #[test]
    fn crash_loses_unflushed_writes() {
        let layer = RamLayer::new(8);
        layer.set_volatile_cache(true);
        let durable = [1u8; BLOCK_SIZE];
        layer.write_block(0, &durable).unwrap();
        layer.flush().unwrap();
        let lost = [2u8; BLOCK_SIZE];
        layer.write_block(1, &lost).unwrap();
        layer.crash();

        let mut out = [0u8; BLOCK_SIZE];
        layer.read_block(0, &mut out).unwrap();
        assert_eq!(out[0], 1);
        layer.read_block(1, &mut out).unwrap();
        assert_eq!(out[0], 0);
    }

    #[test]
    fn injection_fires_once() {
        let layer = RamLayer::new(8);
        layer.inject_error(InjectOn::Write, 2, 5);
        let buf = [0u8; BLOCK_SIZE];
        assert_eq!(layer.write_block(3, &buf), Err(VdoError::Injected));
        assert_eq!(layer.write_block(3, &buf), Ok(()));
    }

    #[test]
    fn counters_track_io() {
        let layer = RamLayer::new(8);
        let mut buf = [0u8; BLOCK_SIZE];
        layer.write_block(0, &buf).unwrap();
        layer.read_block(0, &mut buf).unwrap();
        layer.read_block(1, &mut buf).unwrap();
        layer.flush().unwrap();
        assert_eq!(layer.write_count(), 1);
        assert_eq!(layer.read_count(), 2);
        assert_eq!(layer.flush_count(), 1);
    }
}
