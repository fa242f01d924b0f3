use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Process-level lifecycle of one hypervisor instance.
///
/// ```text
/// Spawned -> Configured -> Started -> Stopping -> Stopped
///     \__________\____________\__________\-----> Error -> Stopping
/// ```
///
/// `Stopped` is terminal; a new spawn starts a fresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum VmState {
    Spawned,
    Configured,
    Started,
    Stopping,
    Stopped,
    Error,
}

impl VmState {
    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: VmState) -> bool {
        use VmState::{Configured, Error, Spawned, Started, Stopped, Stopping};
        matches!(
            (self, next),
            (Spawned, Configured)
                | (Configured, Started)
                | (Spawned | Configured | Started | Error, Stopping)
                | (Stopping, Stopped)
                | (Spawned | Configured | Started | Stopping, Error)
        )
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidTransition`] for illegal moves.
    pub fn transition(self, next: VmState) -> Result<VmState, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidTransition { from: self, to: next })
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == VmState::Stopped
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Spawned => "spawned",
            VmState::Configured => "configured",
            VmState::Started => "started",
            VmState::Stopping => "stopping",
            VmState::Stopped => "stopped",
            VmState::Error => "error",
        };
        f.write_str(s)
    }
}
