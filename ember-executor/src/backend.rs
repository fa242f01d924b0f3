//! Hypervisor backend abstraction trait.
//!
//! Lets the fleet orchestration run against Firecracker or a test double
//! without changing its logic.

use async_trait::async_trait;
use ember_core::{MachineConfiguration, VmId};

use crate::{ExecutorError, HypervisorProcess, StopOptions};

/// How a successful [`Hypervisor::stop`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StopOutcome {
    /// The process was already gone when stop began.
    AlreadyExited,
    /// The process exited after the shutdown action; no signal was sent.
    Graceful,
    /// The process needed SIGTERM.
    Terminated,
}

/// Process-level control of one kind of hypervisor.
///
/// Implementations must be `Send + Sync` to allow use across async tasks.
/// The state of the passed [`HypervisorProcess`] is advanced by each call
/// and set to `Error` when a call fails.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Launch a hypervisor process for `vm_id` with its serial pipes wired up.
    ///
    /// # Errors
    /// Returns [`ExecutorError::SpawnFailed`] if no process comes up, or a
    /// pipe error if the serial pipes cannot be prepared.
    async fn spawn(&self, vm_id: &VmId) -> Result<HypervisorProcess, ExecutorError>;

    /// Wait for the control socket and push `config`.
    ///
    /// # Errors
    /// Returns [`ExecutorError::NotReady`] or the first failing API request.
    async fn configure(
        &self,
        process: &mut HypervisorProcess,
        config: &MachineConfiguration,
    ) -> Result<(), ExecutorError>;

    /// Boot the configured guest.
    ///
    /// # Errors
    /// Returns [`ExecutorError::NotReady`] or [`ExecutorError::Api`].
    async fn start(&self, process: &mut HypervisorProcess) -> Result<(), ExecutorError>;

    /// Shut the process down, escalating from a guest shutdown to SIGTERM,
    /// then remove its runtime files.
    ///
    /// # Errors
    /// Returns [`ExecutorError::StopFailed`] if the process survives both.
    async fn stop(
        &self,
        process: &mut HypervisorProcess,
        options: &StopOptions,
    ) -> Result<StopOutcome, ExecutorError>;

    /// Check if the backend is available and properly configured.
    ///
    /// # Errors
    /// Returns [`ExecutorError::BinaryNotFound`] or [`ExecutorError::KvmUnavailable`]
    /// if the environment is not ready.
    async fn health_check(&self) -> Result<(), ExecutorError>;
}
