//! Deduplicating, compressing block-device transformation layer.
//!
//! The crate implements the crash-consistent core of a virtual data
//! optimizer: a two-level block map with a generation-aged page cache, a
//! depot of fixed-size allocation slabs with per-slab reference counts and
//! journals, a system-wide recovery journal ordering every mutation, a
//! compact slab summary for fast startup, and the recovery and rebuild
//! procedures that reconstruct state after a crash.
//!
//! The host supplies the physical layer (any [`physical::PhysicalLayer`])
//! and the external collaborators (deduplication index, compressor) as
//! trait objects. Everything else is owned by the [`vdo::Vdo`] aggregate.
//!
//! # Example
//!
//! ```rust,ignore
//! use vdo::{config::VdoConfig, physical::RamLayer, vdo::Vdo};
//! use alloc::sync::Arc;
//!
//! let layer = Arc::new(RamLayer::new(8192));
//! let config = VdoConfig::small(4096, 8192, 0x1234);
//! Vdo::format(&*layer, &config)?;
//! let mut vdo = Vdo::load(layer, &config)?;
//! vdo.write(0, &[7u8; 4096])?;
//! vdo.flush()?;
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod admin;
pub mod block_map;
pub mod compressed;
pub mod config;
pub mod constants;
pub mod dedup;
pub mod encoding;
pub mod errors;
pub mod flush;
pub mod physical;
pub mod read_only;
pub mod recovery;
pub mod recovery_journal;
pub mod slab_depot;
pub mod statistics;
pub mod super_block;
pub mod types;
pub mod vdo;
pub mod vio;

pub use config::VdoConfig;
pub use errors::{VdoError, VdoResult};
pub use physical::{PhysicalLayer, RamLayer};
pub use statistics::VdoStatistics;
pub use types::{Lbn, Mapping, MappingState, Pbn, Sbn};
pub use vdo::Vdo;
