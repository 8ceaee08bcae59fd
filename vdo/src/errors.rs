//! Error taxonomy for the whole layer.
//!
//! Every fallible operation returns [`VdoResult`]. Errors that indicate a
//! damaged or untrustworthy persistent structure force the volume into
//! read-only mode at the point of detection; the codes themselves carry no
//! state.

use core::fmt;

/// Result alias used throughout the crate.
pub type VdoResult<T> = Result<T, VdoError>;

/// Errors reported by the data path, the metadata structures, and the
/// lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VdoError {
    /// No free physical block is available. The caller may retry after
    /// pending decrements land.
    NoSpace,
    /// A prior fatal error has placed the volume in read-only mode.
    ReadOnly,
    /// A persistent structure failed validation (nonce, checksum, or
    /// bounds), or an address was outside its configured range.
    OutOfRange,
    /// A compressed container failed validation at read time.
    InvalidFragment,
    /// The operation is not permitted in the current lifecycle state.
    InvalidAdminState,
    /// A grow operation was smaller than the minimum step of one slab.
    IncrementTooSmall,
    /// A synthetic failure injected by a test layer.
    Injected,
    /// The physical layer reported an I/O failure.
    Io,
    /// A block-map page read back with an unrecognizable header.
    BlockMapPageInvalid,
    /// A reference counter was asked to go below zero.
    ReferenceCountInvalid,
    /// The recovery journal on disk is not usable for replay.
    CorruptJournal,
}

impl VdoError {
    /// True for errors that must force the volume read-only when raised by
    /// a metadata write.
    pub fn is_fatal_for_metadata(self) -> bool {
        !matches!(self, VdoError::NoSpace | VdoError::InvalidAdminState)
    }
}

impl fmt::Display for VdoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VdoError::NoSpace => write!(f, "no free physical blocks"),
            VdoError::ReadOnly => write!(f, "volume is read-only"),
            VdoError::OutOfRange => write!(f, "value or structure out of range"),
            VdoError::InvalidFragment => write!(f, "invalid compressed fragment"),
            VdoError::InvalidAdminState => write!(f, "invalid admin state for operation"),
            VdoError::IncrementTooSmall => write!(f, "growth increment below one slab"),
            VdoError::Injected => write!(f, "injected test failure"),
            VdoError::Io => write!(f, "physical layer I/O error"),
            VdoError::BlockMapPageInvalid => write!(f, "block map page failed validation"),
            VdoError::ReferenceCountInvalid => write!(f, "reference count underflow"),
            VdoError::CorruptJournal => write!(f, "recovery journal is corrupt"),
        }
    }
}
