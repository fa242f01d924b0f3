//! Tunables for the supervisor, stop sequence and command runner.
//!
//! Every struct has a `Default` carrying the production values; callers
//! override individual fields.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default cap on bytes accumulated while waiting for one command.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 512 * 1024;

/// How the supervisor launches hypervisor processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct SupervisorConfig {
    /// Path to the `firecracker` binary (absolute, or a bare name looked up
    /// in `$PATH`).
    pub binary_path: PathBuf,

    /// Directory holding per-VM sockets, pipes and stderr logs.
    pub runtime_dir: PathBuf,

    /// Put the child in its own process group so that a signal to the
    /// parent's group (e.g. a service restart) does not take VMs down.
    pub detach: bool,

    /// How long a freshly spawned process must survive to count as started.
    pub spawn_grace: Duration,

    /// How long `configure`/`start` wait for the control socket.
    pub ready_timeout: Duration,

    /// Readiness poll interval.
    pub ready_interval: Duration,
}

impl SupervisorConfig {
    #[must_use]
    pub fn new(binary_path: impl Into<PathBuf>, runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            runtime_dir: runtime_dir.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_detach(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }
}

impl Default for SupervisorConfig {
    /// `firecracker` from `$PATH`, runtime files under `/tmp/ember`.
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("firecracker"),
            runtime_dir: PathBuf::from("/tmp/ember"),
            detach: false,
            spawn_grace: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(5),
            ready_interval: Duration::from_millis(100),
        }
    }
}

/// Windows for the graceful-then-forced stop sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct StopOptions {
    /// Wait after the shutdown action before escalating.
    pub graceful_timeout: Duration,
    /// Wait after SIGTERM before giving up.
    pub sigterm_timeout: Duration,
    /// Liveness poll interval inside both windows.
    pub poll_interval: Duration,
}

impl StopOptions {
    #[must_use]
    pub fn new(graceful_timeout: Duration, sigterm_timeout: Duration) -> Self {
        Self {
            graceful_timeout,
            sigterm_timeout,
            ..Self::default()
        }
    }
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(30),
            sigterm_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Limits for one [`CommandRunner::run`](crate::CommandRunner::run).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct RunOptions {
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl RunOptions {
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}
