//! Lifecycle state machine shared by every drainable component.
//!
//! Each component (and the volume itself) carries an [`AdminState`]. Drains
//! and resumes are dispatched over [`AdminComponent`] so cross-cutting
//! lifecycle code can treat them uniformly; the actual work happens on the
//! owning component, one zone at a time.

use core::fmt;

use crate::errors::{VdoError, VdoResult};
use crate::types::SlabNumber;

/// The lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminState {
    /// Freshly constructed, not yet loaded.
    New,
    /// Normal operation.
    Normal,
    /// Quiescing without persisting a clean flag.
    Suspending,
    Suspended,
    /// Quiescing and persisting everything for a clean shutdown.
    Saving,
    Saved,
    Resuming,
    /// Loading persistent state after a clean shutdown.
    Loading,
    /// Loading persistent state for crash recovery; refcount reads are
    /// deferred to scrubbing.
    LoadingForRecovery,
    /// Replaying journals.
    Recovering,
    /// Rebuilding refcounts from the block map.
    Rebuilding,
}

impl AdminState {
    /// True while the component accepts new work.
    pub fn is_normal(self) -> bool {
        self == AdminState::Normal
    }

    /// True in any state where the component has quiesced.
    pub fn is_quiescent(self) -> bool {
        matches!(self, AdminState::Suspended | AdminState::Saved)
    }

    pub fn is_draining(self) -> bool {
        matches!(self, AdminState::Suspending | AdminState::Saving)
    }

    pub fn is_loading(self) -> bool {
        matches!(
            self,
            AdminState::Loading | AdminState::LoadingForRecovery | AdminState::Recovering
        )
    }

    /// Begin a drain toward `target` (`Suspended` or `Saved`).
    pub fn start_draining(&mut self, target: AdminState) -> VdoResult<()> {
        if !self.is_normal() {
            return Err(VdoError::InvalidAdminState);
        }
        *self = match target {
            AdminState::Suspended => AdminState::Suspending,
            AdminState::Saved => AdminState::Saving,
            _ => return Err(VdoError::InvalidAdminState),
        };
        Ok(())
    }

    /// Complete an in-progress drain.
    pub fn finish_draining(&mut self) -> VdoResult<()> {
        *self = match *self {
            AdminState::Suspending => AdminState::Suspended,
            AdminState::Saving => AdminState::Saved,
            _ => return Err(VdoError::InvalidAdminState),
        };
        Ok(())
    }

    /// Begin resuming from a quiescent state.
    pub fn start_resuming(&mut self) -> VdoResult<()> {
        if !self.is_quiescent() {
            return Err(VdoError::InvalidAdminState);
        }
        *self = AdminState::Resuming;
        Ok(())
    }

    /// Complete a resume (or a load) into normal operation.
    pub fn finish_resuming(&mut self) -> VdoResult<()> {
        match *self {
            AdminState::Resuming
            | AdminState::Loading
            | AdminState::LoadingForRecovery
            | AdminState::Recovering
            | AdminState::Rebuilding => {
                *self = AdminState::Normal;
                Ok(())
            }
            _ => Err(VdoError::InvalidAdminState),
        }
    }
}

impl fmt::Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdminState::New => "new",
            AdminState::Normal => "normal",
            AdminState::Suspending => "suspending",
            AdminState::Suspended => "suspended",
            AdminState::Saving => "saving",
            AdminState::Saved => "saved",
            AdminState::Resuming => "resuming",
            AdminState::Loading => "loading",
            AdminState::LoadingForRecovery => "loading for recovery",
            AdminState::Recovering => "recovering",
            AdminState::Rebuilding => "rebuilding",
        };
        f.write_str(name)
    }
}

/// The drainable components, in the order lifecycle events visit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminComponent {
    Journal,
    BlockMap,
    Packer,
    SlabDepot,
    Slab(SlabNumber),
    SlabSummary,
}

impl fmt::Display for AdminComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminComponent::Journal => f.write_str("recovery journal"),
            AdminComponent::BlockMap => f.write_str("block map"),
            AdminComponent::Packer => f.write_str("packer"),
            AdminComponent::SlabDepot => f.write_str("slab depot"),
            AdminComponent::Slab(n) => write!(f, "slab {}", n),
            AdminComponent::SlabSummary => f.write_str("slab summary"),
        }
    }
}
