//! Physical-layer abstraction.
//!
//! The layer below the volume is an addressable array of 4 KiB blocks that
//! guarantees atomicity only at 512-byte sector granularity. Everything the
//! core writes is framed so that a torn block write is detectable on the
//! next load.
//!
//! Implementations handle their own interior locking; all trait methods
//! take `&self` so the device handle can be shared across components.

use crate::errors::VdoResult;

pub mod ram;

pub use ram::RamLayer;

/// A random-access array of 4 KiB blocks.
pub trait PhysicalLayer: Send + Sync {
    /// Read the block at `pbn` into `buf`.
    ///
    /// `buf` must be exactly [`crate::constants::BLOCK_SIZE`] bytes.
    fn read_block(&self, pbn: u64, buf: &mut [u8]) -> VdoResult<()>;

    /// Write `buf` to the block at `pbn`.
    ///
    /// Sector-atomic only: a crash mid-write may leave any prefix of the
    /// block's sectors updated.
    fn write_block(&self, pbn: u64, buf: &[u8]) -> VdoResult<()>;

    /// Make every completed write durable.
    fn flush(&self) -> VdoResult<()>;

    /// Hint that the blocks in `[pbn, pbn + count)` are no longer needed.
    ///
    /// Purely advisory; the default does nothing.
    fn discard(&self, _pbn: u64, _count: u64) -> VdoResult<()> {
        Ok(())
    }

    /// Total number of addressable blocks. Queried once at load.
    fn block_count(&self) -> u64;
}
