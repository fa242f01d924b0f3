//! Per-VM runtime file layout.
//!
//! For a VM id `V` under runtime directory `D`:
//!
//! | path | purpose |
//! |---|---|
//! | `D/V.stdin` | guest serial output (hypervisor stdout writes here, consoles read) |
//! | `D/V.stdout` | guest serial input (consoles write here, hypervisor stdin reads) |
//! | `D/V.sock` | hypervisor control socket |
//! | `D/V.firecracker.stderr.log` | hypervisor diagnostics |
//!
//! The supervisor that creates these files and the console that opens them
//! agree only through these names.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::id::VmId;

/// The two named pipes forming one VM's serial line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub struct SerialConsolePaths {
    /// Pipe carrying guest output.
    pub stdin: PathBuf,
    /// Pipe carrying guest input.
    pub stdout: PathBuf,
}

impl SerialConsolePaths {
    /// Both paths, `stdin` first.
    #[must_use]
    pub fn both(&self) -> [&Path; 2] {
        [&self.stdin, &self.stdout]
    }
}

/// Derive the serial pipe paths for `vm_id` under `pipe_dir`.
///
/// Pure: identical inputs always yield identical paths.
#[must_use]
pub fn generate_pipe_paths(vm_id: &VmId, pipe_dir: &Path) -> SerialConsolePaths {
    SerialConsolePaths {
        stdin: pipe_dir.join(format!("{vm_id}.stdin")),
        stdout: pipe_dir.join(format!("{vm_id}.stdout")),
    }
}

/// Every runtime file belonging to one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct VmLayout {
    pub vm_id: VmId,
    pub dir: PathBuf,
    pub pipes: SerialConsolePaths,
    pub socket: PathBuf,
    pub stderr_log: PathBuf,
}

impl VmLayout {
    #[must_use]
    pub fn new(vm_id: &VmId, dir: &Path) -> Self {
        Self {
            vm_id: vm_id.clone(),
            dir: dir.to_owned(),
            pipes: generate_pipe_paths(vm_id, dir),
            socket: dir.join(format!("{vm_id}.sock")),
            stderr_log: dir.join(format!("{vm_id}.firecracker.stderr.log")),
        }
    }
}
