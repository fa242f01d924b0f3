//! Multi-VM orchestration on top of a [`Hypervisor`].
//!
//! Tracks launched VMs by id and routes every console consumer through one
//! shared [`ConsoleRegistry`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ember_core::{MachineConfiguration, VmId, VmState};
use tokio::sync::Mutex;

use crate::bootstrap::{run_bootstrap, BootstrapFailure, BootstrapReport, BootstrapScript, CONNECT_STEP};
use crate::registry::ConsoleRegistry;
use crate::{CommandRunner, ExecutorError, Hypervisor, HypervisorProcess, SerialConsole, StopOptions, StopOutcome};

/// Console holder label used by [`Fleet::command_runner`].
pub const RUNNER_HOLDER: &str = "command-runner";
/// Console holder label used by [`Fleet::bootstrap`].
pub const BOOTSTRAP_HOLDER: &str = "bootstrap";

enum Slot {
    /// Reserved while spawn/configure/start are in progress.
    Launching,
    Running(HypervisorProcess),
}

/// Snapshot of one launched VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    pub vm_id: VmId,
    pub pid: u32,
    pub state: VmState,
    pub spawned_at: DateTime<Utc>,
    pub runtime_dir: PathBuf,
}

/// Launched VMs of one hypervisor backend.
///
/// All operations are safe to call concurrently. Launching and stopping a
/// given id are serialised through its slot; distinct ids do not contend
/// beyond the map lock.
pub struct Fleet<H: Hypervisor> {
    hypervisor: H,
    registry: Arc<ConsoleRegistry>,
    stop_options: StopOptions,
    vms: Mutex<HashMap<VmId, Slot>>,
}

impl<H: Hypervisor> Fleet<H> {
    /// Create a fleet with its own console registry.
    #[must_use]
    pub fn new(hypervisor: H) -> Self {
        Self::with_registry(hypervisor, Arc::new(ConsoleRegistry::new()))
    }

    /// Create a fleet sharing `registry` with other console consumers.
    #[must_use]
    pub fn with_registry(hypervisor: H, registry: Arc<ConsoleRegistry>) -> Self {
        Self {
            hypervisor,
            registry,
            stop_options: StopOptions::default(),
            vms: Mutex::new(HashMap::new()),
        }
    }

    /// Stop windows used by [`Self::shutdown`] and by launch rollback.
    #[must_use]
    pub fn stop_options(mut self, options: StopOptions) -> Self {
        self.stop_options = options;
        self
    }

    #[must_use]
    pub fn hypervisor(&self) -> &H {
        &self.hypervisor
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConsoleRegistry> {
        &self.registry
    }

    /// Spawn, configure and start `vm_id`.
    ///
    /// If configure or start fails the half-started process is stopped
    /// before the error is returned, and the id is free again.
    ///
    /// # Errors
    /// Returns [`ExecutorError::AlreadyRunning`] if the id is taken, or the
    /// first failing lifecycle step's error.
    pub async fn launch(&self, vm_id: &VmId, config: &MachineConfiguration) -> Result<VmInfo, ExecutorError> {
        {
            let mut vms = self.vms.lock().await;
            if vms.contains_key(vm_id) {
                return Err(ExecutorError::AlreadyRunning(vm_id.clone()));
            }
            vms.insert(vm_id.clone(), Slot::Launching);
        }

        match self.boot(vm_id, config).await {
            Ok(process) => {
                let info = info_of(&process);
                self.vms.lock().await.insert(vm_id.clone(), Slot::Running(process));
                Ok(info)
            }
            Err(e) => {
                self.vms.lock().await.remove(vm_id);
                Err(e)
            }
        }
    }

    async fn boot(&self, vm_id: &VmId, config: &MachineConfiguration) -> Result<HypervisorProcess, ExecutorError> {
        let mut process = self.hypervisor.spawn(vm_id).await?;

        let booted = match self.hypervisor.configure(&mut process, config).await {
            Ok(()) => self.hypervisor.start(&mut process).await,
            Err(e) => Err(e),
        };
        if let Err(e) = booted {
            tracing::warn!(vm_id = %vm_id, error = %e, "launch failed, stopping process");
            if let Err(stop_err) = self.hypervisor.stop(&mut process, &self.stop_options).await {
                tracing::warn!(vm_id = %vm_id, error = %stop_err, "rollback stop failed");
            }
            return Err(e);
        }
        Ok(process)
    }

    /// Stop `vm_id` and forget it.
    ///
    /// On failure the VM stays registered (in `Error` state) so the stop can
    /// be retried.
    ///
    /// # Errors
    /// Returns [`ExecutorError::VmNotFound`] if the id is not running, or the
    /// backend's stop error.
    pub async fn shutdown(&self, vm_id: &VmId) -> Result<StopOutcome, ExecutorError> {
        let mut process = {
            let mut vms = self.vms.lock().await;
            match vms.remove(vm_id) {
                Some(Slot::Running(process)) => process,
                Some(Slot::Launching) => {
                    vms.insert(vm_id.clone(), Slot::Launching);
                    return Err(ExecutorError::VmNotFound(vm_id.clone()));
                }
                None => return Err(ExecutorError::VmNotFound(vm_id.clone())),
            }
        };

        match self.hypervisor.stop(&mut process, &self.stop_options).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.vms.lock().await.insert(vm_id.clone(), Slot::Running(process));
                Err(e)
            }
        }
    }

    /// Stop every running VM. Returns one result per VM.
    pub async fn shutdown_all(&self) -> Vec<(VmId, Result<StopOutcome, ExecutorError>)> {
        let ids: Vec<VmId> = {
            let vms = self.vms.lock().await;
            vms.iter()
                .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let result = self.shutdown(&id).await;
            results.push((id, result));
        }
        results
    }

    /// Claim and open the serial console of `vm_id` for `holder`.
    ///
    /// # Errors
    /// Returns [`ExecutorError::VmNotFound`], or the errors of
    /// [`SerialConsole::open`].
    pub async fn open_console(&self, vm_id: &VmId, holder: &str) -> Result<SerialConsole, ExecutorError> {
        let dir = self.runtime_dir(vm_id).await?;
        SerialConsole::open(&self.registry, vm_id, &dir, holder).await
    }

    /// Open the console of `vm_id` and wrap it in an unconnected
    /// [`CommandRunner`].
    ///
    /// # Errors
    /// See [`Self::open_console`].
    pub async fn command_runner(&self, vm_id: &VmId) -> Result<CommandRunner, ExecutorError> {
        let console = self.open_console(vm_id, RUNNER_HOLDER).await?;
        CommandRunner::new(console)
    }

    /// Run `script` on `vm_id`'s console, then release the console.
    ///
    /// # Errors
    /// Returns [`BootstrapFailure`]; a console that cannot be opened is
    /// reported as a failed [`CONNECT_STEP`].
    pub async fn bootstrap(
        &self,
        vm_id: &VmId,
        script: &BootstrapScript,
    ) -> Result<BootstrapReport, BootstrapFailure> {
        let opened = self
            .open_console(vm_id, BOOTSTRAP_HOLDER)
            .await
            .and_then(CommandRunner::new);
        let runner = opened.map_err(|e| BootstrapFailure {
            step: CONNECT_STEP.to_owned(),
            reason: e.to_string(),
            completed: 0,
        })?;

        let result = run_bootstrap(&runner, script).await;
        runner.close().await;
        result
    }

    /// Number of launched (or launching) VMs.
    pub async fn active_count(&self) -> usize {
        self.vms.lock().await.len()
    }

    /// Lifecycle state of `vm_id`, if it is running.
    pub async fn state(&self, vm_id: &VmId) -> Option<VmState> {
        match self.vms.lock().await.get(vm_id)? {
            Slot::Running(process) => Some(process.state()),
            Slot::Launching => None,
        }
    }

    /// Snapshot of `vm_id`, if it is running.
    pub async fn info(&self, vm_id: &VmId) -> Option<VmInfo> {
        match self.vms.lock().await.get(vm_id)? {
            Slot::Running(process) => Some(info_of(process)),
            Slot::Launching => None,
        }
    }

    async fn runtime_dir(&self, vm_id: &VmId) -> Result<PathBuf, ExecutorError> {
        match self.vms.lock().await.get(vm_id) {
            Some(Slot::Running(process)) => Ok(process.layout.dir.clone()),
            _ => Err(ExecutorError::VmNotFound(vm_id.clone())),
        }
    }
}

fn info_of(process: &HypervisorProcess) -> VmInfo {
    VmInfo {
        vm_id: process.vm_id().clone(),
        pid: process.pid,
        state: process.state(),
        spawned_at: process.spawned_at,
        runtime_dir: process.layout.dir.clone(),
    }
}
