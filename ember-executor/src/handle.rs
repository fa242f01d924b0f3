//! Hypervisor process handle for one running Firecracker instance.

use std::path::Path;

use chrono::{DateTime, Utc};
use ember_core::{CoreError, SerialConsolePaths, VmId, VmLayout, VmState};

/// A handle to a spawned Firecracker process.
///
/// Dropping this handle does NOT terminate the VM. Call
/// [`Hypervisor::stop`](crate::Hypervisor::stop) explicitly to shut it down
/// and clean up its runtime files.
#[derive(Debug)]
#[non_exhaustive]
pub struct HypervisorProcess {
    /// OS process id of the hypervisor.
    pub pid: u32,

    /// Socket, pipe and log paths of this VM.
    pub layout: VmLayout,

    /// Timestamp when the process was spawned.
    pub spawned_at: DateTime<Utc>,

    state: VmState,

    /// Present when this process spawned the child; used to reap it.
    child: Option<tokio::process::Child>,
}

impl HypervisorProcess {
    /// Create a handle in the `Spawned` state.
    #[must_use]
    pub fn new(pid: u32, layout: VmLayout, child: Option<tokio::process::Child>) -> Self {
        Self {
            pid,
            layout,
            spawned_at: Utc::now(),
            state: VmState::Spawned,
            child,
        }
    }

    #[must_use]
    pub fn vm_id(&self) -> &VmId {
        &self.layout.vm_id
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.layout.socket
    }

    #[must_use]
    pub fn pipes(&self) -> &SerialConsolePaths {
        &self.layout.pipes
    }

    #[must_use]
    pub fn state(&self) -> VmState {
        self.state
    }

    /// Move to `next` if the lifecycle allows it.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidTransition`] and leaves the state unchanged
    /// otherwise.
    pub fn transition(&mut self, next: VmState) -> Result<(), CoreError> {
        self.state = self.state.transition(next)?;
        tracing::debug!(vm_id = %self.layout.vm_id, state = %self.state, "hypervisor state changed");
        Ok(())
    }

    /// Record an unrecoverable failure. A no-op once stopped.
    pub fn mark_error(&mut self) {
        if self.state.can_transition_to(VmState::Error) {
            self.state = VmState::Error;
        }
    }

    /// Reap the child if it has exited. Returns `true` when it has.
    pub(crate) fn reap(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(vm_id = %self.layout.vm_id, pid = self.pid, %status, "hypervisor exited");
                self.child = None;
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(vm_id = %self.layout.vm_id, pid = self.pid, error = %e, "failed to poll hypervisor status");
                false
            }
        }
    }
}
