//! Firecracker process and serial control plane for ember.
//!
//! Supervises hypervisor processes, configures them over their control
//! socket, and turns the guest's serial console into an exclusive duplex
//! channel and a request/response command runner.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod api;
pub mod backend;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod firecracker;
pub mod handle;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod runner;
pub mod serial;
pub mod terminal;
mod unix_client;

pub use api::{FirecrackerClient, InstanceInfo};
pub use backend::{Hypervisor, StopOutcome};
pub use bootstrap::{run_bootstrap, BootstrapFailure, BootstrapReport, BootstrapScript, BootstrapStep};
pub use config::{RunOptions, StopOptions, SupervisorConfig, DEFAULT_MAX_OUTPUT_BYTES};
pub use error::ExecutorError;
pub use firecracker::{is_hypervisor_alive, FirecrackerSupervisor};
pub use handle::HypervisorProcess;
pub use orchestrator::{Fleet, VmInfo};
pub use registry::{ConsoleClaim, ConsoleRegistry};
pub use runner::{CommandRunner, DEFAULT_CONNECT_TIMEOUT};
pub use serial::{create_pipes, remove_pipes, SerialConsole};
pub use terminal::{bridge, BridgeStats};
