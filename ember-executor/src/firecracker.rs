//! Firecracker process supervisor.
//!
//! Owns the hypervisor child end-to-end: prepares the runtime directory and
//! serial pipes, launches `firecracker --api-sock <sock>` with its stdio on
//! the pipes, drives configuration and boot over the control socket, and
//! stops it with a shutdown action followed by SIGTERM.
//!
//! Liveness is never taken from stored state. A PID only counts as alive
//! while `/proc/<pid>/cmdline` still names `--api-sock <our socket>`, so a
//! recycled PID is not mistaken for the VM.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ember_core::{MachineConfiguration, VmId, VmLayout, VmState};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::api::FirecrackerClient;
use crate::backend::{Hypervisor, StopOutcome};
use crate::serial::{create_pipes, remove_pipes};
use crate::{ExecutorError, HypervisorProcess, StopOptions, SupervisorConfig};

const API_SOCK_FLAG: &str = "--api-sock";

/// Firecracker implementation of [`Hypervisor`].
#[derive(Debug, Clone, Default)]
pub struct FirecrackerSupervisor {
    config: SupervisorConfig,
}

impl FirecrackerSupervisor {
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Runtime file layout for `vm_id` under the configured directory.
    #[must_use]
    pub fn layout(&self, vm_id: &VmId) -> VmLayout {
        VmLayout::new(vm_id, &self.config.runtime_dir)
    }

    /// Control-socket client for `process`.
    #[must_use]
    pub fn client(process: &HypervisorProcess) -> FirecrackerClient {
        FirecrackerClient::new(process.socket_path())
    }

    async fn launch(&self, layout: &VmLayout) -> Result<HypervisorProcess, ExecutorError> {
        // Read-write opens of a FIFO return immediately, with or without a peer.
        let guest_input = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&layout.pipes.stdout)?;
        let guest_output = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&layout.pipes.stdin)?;
        // A file rather than an inherited stderr: writing to a vanished
        // parent's terminal would raise SIGPIPE in the VMM.
        let stderr_log = std::fs::File::create(&layout.stderr_log)?;

        let mut command = Command::new(&self.config.binary_path);
        command
            .arg(API_SOCK_FLAG)
            .arg(&layout.socket)
            .stdin(Stdio::from(guest_input))
            .stdout(Stdio::from(guest_output))
            .stderr(Stdio::from(stderr_log))
            .kill_on_drop(false);
        if self.config.detach {
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|e| {
            ExecutorError::SpawnFailed(format!("exec {}: {e}", self.config.binary_path.display()))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| ExecutorError::SpawnFailed("process exited before a pid was assigned".to_owned()))?;

        tokio::time::sleep(self.config.spawn_grace).await;
        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                return Err(ExecutorError::SpawnFailed(format!(
                    "process {pid} exited during startup ({status}); see {}",
                    layout.stderr_log.display()
                )));
            }
            Err(e) => {
                // Unknown state; the caller never gets a handle, so nothing else would reap it.
                abandon(&mut child, pid);
                return Err(ExecutorError::SpawnFailed(format!(
                    "cannot poll process {pid}: {e}"
                )));
            }
        }

        Ok(HypervisorProcess::new(pid, layout.clone(), Some(child)))
    }

    /// Fail early, without touching the process, if `next` is not reachable.
    fn ensure_transition(process: &HypervisorProcess, next: VmState) -> Result<(), ExecutorError> {
        process.state().transition(next)?;
        Ok(())
    }

    async fn wait_ready(&self, process: &mut HypervisorProcess) -> Result<FirecrackerClient, ExecutorError> {
        let client = Self::client(process);
        if let Err(e) = client
            .wait_until_ready(self.config.ready_timeout, self.config.ready_interval)
            .await
        {
            process.mark_error();
            return Err(e);
        }
        Ok(client)
    }

    /// Poll until the process is gone or `timeout` elapses. Returns `true`
    /// once it is gone.
    async fn wait_for_exit(process: &mut HypervisorProcess, timeout: Duration, poll: Duration) -> bool {
        let started = Instant::now();
        loop {
            if !is_running(process) {
                return true;
            }
            if started.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[async_trait]
impl Hypervisor for FirecrackerSupervisor {
    async fn spawn(&self, vm_id: &VmId) -> Result<HypervisorProcess, ExecutorError> {
        which_binary(&self.config.binary_path)?;

        let layout = self.layout(vm_id);
        tokio::fs::create_dir_all(&layout.dir).await?;
        match tokio::fs::remove_file(&layout.socket).await {
            Ok(()) => tracing::debug!(vm_id = %vm_id, socket = %layout.socket.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        create_pipes(vm_id, &layout.dir).await?;

        tracing::info!(vm_id = %vm_id, socket = %layout.socket.display(), detach = self.config.detach, "spawning Firecracker");

        match self.launch(&layout).await {
            Ok(process) => {
                tracing::info!(vm_id = %vm_id, pid = process.pid, "Firecracker spawned");
                Ok(process)
            }
            Err(e) => {
                if let Err(cleanup) = remove_pipes(&layout.pipes).await {
                    tracing::warn!(vm_id = %vm_id, error = %cleanup, "failed to remove pipes after spawn failure");
                }
                Err(e)
            }
        }
    }

    async fn configure(
        &self,
        process: &mut HypervisorProcess,
        config: &MachineConfiguration,
    ) -> Result<(), ExecutorError> {
        Self::ensure_transition(process, VmState::Configured)?;
        let client = self.wait_ready(process).await?;

        if let Err(e) = client.configure_all(config).await {
            tracing::warn!(vm_id = %process.vm_id(), error = %e, "configuration rejected");
            process.mark_error();
            return Err(e);
        }
        process.transition(VmState::Configured)?;
        tracing::info!(
            vm_id = %process.vm_id(),
            vcpus = config.vcpu_count(),
            mem_mib = config.mem_size_mib(),
            drives = config.drives().len(),
            nics = config.network_interfaces().len(),
            "VM configured"
        );
        Ok(())
    }

    async fn start(&self, process: &mut HypervisorProcess) -> Result<(), ExecutorError> {
        Self::ensure_transition(process, VmState::Started)?;
        let client = self.wait_ready(process).await?;

        if let Err(e) = client.start_instance().await {
            process.mark_error();
            return Err(e);
        }
        process.transition(VmState::Started)?;
        tracing::info!(vm_id = %process.vm_id(), pid = process.pid, "VM started");
        Ok(())
    }

    async fn stop(
        &self,
        process: &mut HypervisorProcess,
        options: &StopOptions,
    ) -> Result<StopOutcome, ExecutorError> {
        process.transition(VmState::Stopping)?;
        let vm_id = process.vm_id().clone();
        let pid = process.pid;

        let outcome = if is_running(process) {
            let mut outcome = None;

            let client = Self::client(process);
            if client.is_ready().await {
                match client.send_shutdown_action().await {
                    Ok(()) => {
                        tracing::info!(vm_id = %vm_id, pid, "shutdown action sent");
                        if Self::wait_for_exit(process, options.graceful_timeout, options.poll_interval).await {
                            outcome = Some(StopOutcome::Graceful);
                        }
                    }
                    Err(e) => tracing::warn!(vm_id = %vm_id, pid, error = %e, "shutdown action failed"),
                }
            }

            match outcome {
                Some(outcome) => outcome,
                None => {
                    tracing::info!(vm_id = %vm_id, pid, "sending SIGTERM");
                    if let Err(reason) = terminate(pid) {
                        process.mark_error();
                        return Err(ExecutorError::StopFailed { vm_id, pid, reason });
                    }
                    if !Self::wait_for_exit(process, options.sigterm_timeout, options.poll_interval).await {
                        process.mark_error();
                        return Err(ExecutorError::StopFailed {
                            vm_id,
                            pid,
                            reason: format!(
                                "still running {}ms after SIGTERM",
                                options.sigterm_timeout.as_millis()
                            ),
                        });
                    }
                    StopOutcome::Terminated
                }
            }
        } else {
            StopOutcome::AlreadyExited
        };

        cleanup_runtime_files(process.layout.clone()).await;
        process.transition(VmState::Stopped)?;
        tracing::info!(vm_id = %vm_id, pid, ?outcome, "VM stopped");
        Ok(outcome)
    }

    async fn health_check(&self) -> Result<(), ExecutorError> {
        let kvm = Path::new("/dev/kvm");
        if !kvm.exists() {
            return Err(ExecutorError::KvmUnavailable {
                reason: "/dev/kvm not found".to_owned(),
            });
        }
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(kvm)
            .map_err(|e| ExecutorError::KvmUnavailable {
                reason: format!("cannot open /dev/kvm: {e}"),
            })?;

        which_binary(&self.config.binary_path)
    }
}

/// `true` while `process` has not been reaped and its PID still belongs to
/// a hypervisor bound to its socket.
fn is_running(process: &mut HypervisorProcess) -> bool {
    if process.reap() {
        return false;
    }
    is_hypervisor_alive(process.pid, process.socket_path())
}

/// Kill a child that is being given up on during launch.
fn abandon(child: &mut Child, pid: u32) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(pid, error = %e, "failed to kill abandoned hypervisor process");
    }
}

/// Whether `pid` is a live process started with `--api-sock <socket>`.
///
/// Reads `/proc/<pid>/cmdline`; a missing entry, an exited zombie (empty
/// cmdline) or a recycled PID running something else all count as dead.
#[must_use]
pub fn is_hypervisor_alive(pid: u32, socket: &Path) -> bool {
    match std::fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(raw) => cmdline_matches(&raw, socket),
        Err(_) => false,
    }
}

fn cmdline_matches(raw: &[u8], socket: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;

    let socket = socket.as_os_str().as_bytes();
    let args: Vec<&[u8]> = raw.split(|&b| b == 0).collect();
    args.windows(2)
        .any(|pair| pair[0] == API_SOCK_FLAG.as_bytes() && pair[1] == socket)
}

fn terminate(pid: u32) -> Result<(), String> {
    let raw = i32::try_from(pid).map_err(|_| format!("pid {pid} out of range"))?;
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        // Exited between the liveness check and the signal.
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(errno) => Err(format!("SIGTERM failed: {errno}")),
    }
}

/// Remove the pipes and the socket. Failures are logged and swallowed.
async fn cleanup_runtime_files(layout: VmLayout) {
    if let Err(e) = remove_pipes(&layout.pipes).await {
        tracing::warn!(vm_id = %layout.vm_id, error = %e, "failed to remove serial pipes");
    }
    match tokio::fs::remove_file(&layout.socket).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(vm_id = %layout.vm_id, socket = %layout.socket.display(), error = %e, "failed to remove control socket");
        }
    }
}

/// Verify a binary exists either at the given path or in PATH.
///
/// # Errors
/// Returns [`ExecutorError::BinaryNotFound`].
pub fn which_binary(path: &Path) -> Result<(), ExecutorError> {
    if path.components().count() > 1 || path.is_absolute() {
        if path.exists() {
            return Ok(());
        }
        return Err(ExecutorError::BinaryNotFound { path: path.to_owned() });
    }

    // Bare name: check PATH
    let found = std::env::var_os("PATH")
        .map(|dirs| std::env::split_paths(&dirs).any(|dir| dir.join(path).is_file()))
        .unwrap_or(false);

    if found {
        Ok(())
    } else {
        Err(ExecutorError::BinaryNotFound { path: path.to_owned() })
    }
}
