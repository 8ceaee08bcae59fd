//! Read-only mode notifier.
//!
//! Entering read-only mode is the system's only cancellation mechanism: the
//! first fatal error is recorded, every later attempt to write observes the
//! flag, and in-flight operations complete naturally before reporting
//! [`VdoError::ReadOnly`].

use spin::Mutex;

use crate::errors::{VdoError, VdoResult};

/// Shared read-only flag plus the recorded cause.
pub struct ReadOnlyNotifier {
    state: Mutex<Option<VdoError>>,
}

impl ReadOnlyNotifier {
    pub fn new() -> ReadOnlyNotifier {
        ReadOnlyNotifier {
            state: Mutex::new(None),
        }
    }

    /// Record `cause` and enter read-only mode. Idempotent: only the first
    /// cause is kept.
    pub fn enter(&self, cause: VdoError) {
        let mut state = self.state.lock();
        if state.is_none() {
            log::error!("entering read-only mode: {}", cause);
            *state = Some(cause);
        }
    }

    /// Clear read-only mode. Only a completed forced rebuild may do this.
    pub fn clear(&self) {
        *self.state.lock() = None;
    }

    pub fn is_read_only(&self) -> bool {
        self.state.lock().is_some()
    }

    /// The first recorded cause, if any.
    pub fn cause(&self) -> Option<VdoError> {
        *self.state.lock()
    }

    /// Fail with `ReadOnly` if the flag is set.
    pub fn check(&self) -> VdoResult<()> {
        if self.is_read_only() {
            Err(VdoError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

impl Default for ReadOnlyNotifier {
    fn default() -> Self {
        Self::new()
    }
}
