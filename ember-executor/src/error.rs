//! Error types for the executor crate.

use std::path::PathBuf;

use ember_core::{CoreError, VmId};

/// Errors that can occur while supervising a hypervisor or driving its
/// serial console.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// Firecracker binary not found at the configured path.
    #[error("firecracker binary not found at {path}")]
    BinaryNotFound { path: PathBuf },

    /// KVM device is not available or not accessible.
    #[error("KVM not available: {reason}")]
    KvmUnavailable { reason: String },

    /// The hypervisor process did not come up.
    #[error("VM spawn failed: {0}")]
    SpawnFailed(String),

    /// The control socket could not be reached or the exchange broke off.
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// The hypervisor answered with a non-success status.
    #[error("{endpoint} returned HTTP {status}: {fault}")]
    Api {
        endpoint: String,
        status: u16,
        /// `fault_message` from the response body, or the raw status text.
        fault: String,
    },

    /// The control socket did not answer within the readiness window.
    #[error("control socket {socket} not ready after {waited_ms}ms")]
    NotReady { socket: PathBuf, waited_ms: u128 },

    /// The process survived both the shutdown action and SIGTERM.
    #[error("failed to stop VM {vm_id} (pid {pid}): {reason}")]
    StopFailed { vm_id: VmId, pid: u32, reason: String },

    /// One or both serial pipes are missing.
    #[error("serial pipe(s) not found: {}; is the VM running?", display_paths(.missing))]
    PipeNotFound { missing: Vec<PathBuf> },

    /// `mkfifo` failed.
    #[error("failed to create pipe {path}: {source}")]
    PipeCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stale pipe could not be removed.
    #[error("failed to remove pipe {path}: {source}")]
    PipeRemoveFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another consumer already holds this VM's serial console.
    #[error("serial console for VM {vm_id} is already held by {holder}")]
    ConsoleBusy { vm_id: VmId, holder: String },

    /// The console was used after `close()`.
    #[error("serial console is not active")]
    ConsoleInactive,

    /// The console has no write handle.
    #[error("serial console input pipe is not open")]
    PipeNotInitialized,

    /// Writing to the guest input pipe failed.
    #[error("failed to write to serial console: {0}")]
    WriteFailed(#[source] std::io::Error),

    /// No shell prompt was observed in time.
    #[error("no shell prompt within {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u128 },

    /// The end marker of a command was not observed in time.
    #[error("command did not finish within {timeout_ms}ms")]
    CommandTimeout { timeout_ms: u128 },

    /// The guest is asking for credentials; serial autologin is not set up.
    #[error("guest console is at a login prompt; configure serial autologin in the image")]
    LoginPrompt,

    /// Command output exceeded the configured cap.
    #[error("command output exceeded {limit} bytes")]
    OutputLimit { limit: usize },

    /// A `run`/`connect` is already waiting on this runner.
    #[error("another command is already waiting on this console")]
    ConcurrentWait,

    /// The runner was closed while (or before) waiting.
    #[error("command runner is closed")]
    RunnerClosed,

    /// VM not found in the active registry.
    #[error("VM not found: {0}")]
    VmNotFound(VmId),

    /// A VM with this id is already launched or launching.
    #[error("VM already running: {0}")]
    AlreadyRunning(VmId),

    /// A core value failed validation.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
