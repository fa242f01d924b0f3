//! `ember` command line: boot one Firecracker microVM, drive it over its
//! serial console, and stop it again.
//!
//! Every flag has an `EMBER_*` environment fallback. Nothing below this
//! crate reads the environment.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use ember_core::{BlockDevice, CoreError, MachineConfiguration, NetworkInterface, VmId};
use ember_executor::{
    bridge, BootstrapFailure, BootstrapScript, CommandRunner, ExecutorError, FirecrackerSupervisor, Fleet,
    Hypervisor, RunOptions, StopOptions, SupervisorConfig,
};

/// Console holder label of the interactive bridge.
const TERMINAL_HOLDER: &str = "terminal";

const DEFAULT_RUNTIME_DIR: &str = "/tmp/ember";

#[derive(Debug, Parser)]
#[command(name = "ember", version)]
#[command(about = "Boot a Firecracker microVM and drive it over its serial console")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Boot, run a bootstrap file and/or commands, print their output, stop
    Run(RunArgs),
    /// Boot and attach this terminal to the serial console (Ctrl-] detaches)
    Console(ConsoleArgs),
    /// Check that KVM and the firecracker binary are usable
    Check {
        /// Path or `$PATH` name of the firecracker binary
        #[arg(long, env = "EMBER_FIRECRACKER", default_value = "firecracker")]
        firecracker: PathBuf,
    },
}

/// Which VM to boot and how.
#[derive(Debug, Args)]
pub struct VmArgs {
    /// VM id; names the socket, pipes and log under the runtime directory
    #[arg(long, env = "EMBER_VM_ID", default_value = "ember-0")]
    pub id: VmId,

    /// Path or `$PATH` name of the firecracker binary
    #[arg(long, env = "EMBER_FIRECRACKER", default_value = "firecracker")]
    pub firecracker: PathBuf,

    /// Directory for per-VM sockets, pipes and logs
    #[arg(long, env = "EMBER_RUNTIME_DIR", default_value = DEFAULT_RUNTIME_DIR)]
    pub runtime_dir: PathBuf,

    /// Guest kernel image
    #[arg(long, env = "EMBER_KERNEL")]
    pub kernel: PathBuf,

    /// Root filesystem image
    #[arg(long, env = "EMBER_ROOTFS")]
    pub rootfs: PathBuf,

    /// Attach the root filesystem read-only
    #[arg(long)]
    pub rootfs_read_only: bool,

    /// Optional initrd
    #[arg(long, env = "EMBER_INITRD")]
    pub initrd: Option<PathBuf>,

    /// Kernel command line (default: serial console on ttyS0)
    #[arg(long, env = "EMBER_BOOT_ARGS")]
    pub boot_args: Option<String>,

    #[arg(long, env = "EMBER_VCPUS", default_value_t = 1)]
    pub vcpus: u8,

    #[arg(long, env = "EMBER_MEM_MIB", default_value_t = 512)]
    pub mem_mib: u32,

    /// Host tap device for a guest `eth0`
    #[arg(long, env = "EMBER_TAP")]
    pub tap: Option<String>,

    /// Guest MAC for `eth0`
    #[arg(long, env = "EMBER_GUEST_MAC", requires = "tap")]
    pub guest_mac: Option<String>,

    /// Put firecracker in its own process group so it survives our signals
    #[arg(long, env = "EMBER_DETACH")]
    pub detach: bool,

    /// Seconds to wait for a guest shutdown before SIGTERM
    #[arg(long, default_value_t = 30)]
    pub graceful_timeout: u64,

    /// Seconds to wait after SIGTERM
    #[arg(long, default_value_t = 10)]
    pub sigterm_timeout: u64,
}

impl VmArgs {
    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig::new(&self.firecracker, &self.runtime_dir).with_detach(self.detach)
    }

    /// # Errors
    /// Returns the [`CoreError`] of an invalid vCPU count, memory size or
    /// device.
    pub fn machine_config(&self) -> Result<MachineConfiguration, CoreError> {
        let root = if self.rootfs_read_only {
            let mut drive = BlockDevice::root("rootfs", &self.rootfs);
            drive.is_read_only = true;
            drive
        } else {
            BlockDevice::root("rootfs", &self.rootfs)
        };

        let mut builder = MachineConfiguration::builder(&self.kernel, self.vcpus, self.mem_mib).drive(root);
        if let Some(args) = &self.boot_args {
            builder = builder.boot_args(args.clone());
        }
        if let Some(initrd) = &self.initrd {
            builder = builder.initrd(initrd);
        }
        if let Some(tap) = &self.tap {
            builder = builder.network_interface(NetworkInterface::new("eth0", tap, self.guest_mac.clone()));
        }
        builder.build()
    }

    #[must_use]
    pub fn stop_options(&self) -> StopOptions {
        StopOptions::new(
            Duration::from_secs(self.graceful_timeout),
            Duration::from_secs(self.sigterm_timeout),
        )
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub vm: VmArgs,

    /// File of shell commands, one per line, run before any `--exec`
    #[arg(long)]
    pub bootstrap: Option<PathBuf>,

    /// Command to run in the guest; repeatable
    #[arg(long = "exec", value_name = "COMMAND")]
    pub exec: Vec<String>,

    /// Seconds each command may run
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Seconds to wait for the guest shell prompt
    #[arg(long, default_value_t = 10)]
    pub connect_timeout: u64,
}

#[derive(Debug, Args)]
pub struct ConsoleArgs {
    #[command(flatten)]
    pub vm: VmArgs,
}

/// Errors surfaced by the `ember` binary.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CliError {
    #[error("invalid machine configuration: {0}")]
    Config(#[from] CoreError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapFailure),

    #[error("cannot read bootstrap file {}: {source}", path.display())]
    BootstrapFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("interrupted")]
    Interrupted,
}

/// Run the parsed command line. The exit code is the last failing guest
/// command's status, or success.
///
/// # Errors
/// Returns the first [`CliError`]; the VM is stopped before returning.
pub async fn execute(cli: Cli) -> Result<ExitCode, CliError> {
    match cli.command {
        Command::Check { firecracker } => {
            FirecrackerSupervisor::new(SupervisorConfig::new(firecracker, DEFAULT_RUNTIME_DIR))
                .health_check()
                .await?;
            tracing::info!("KVM and firecracker are available");
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(args) => boot_and_drive(&args.vm, Session::Run(&args)).await,
        Command::Console(args) => boot_and_drive(&args.vm, Session::Console).await,
    }
}

/// What to do with the guest once it is running.
enum Session<'a> {
    Run(&'a RunArgs),
    Console,
}

/// Launch the VM, drive `session`, and stop the VM whatever happened.
/// Ctrl-C abandons the session and still stops the VM.
async fn boot_and_drive(vm: &VmArgs, session: Session<'_>) -> Result<ExitCode, CliError> {
    let machine = vm.machine_config()?;
    let fleet = Fleet::new(FirecrackerSupervisor::new(vm.supervisor_config())).stop_options(vm.stop_options());

    let info = fleet.launch(&vm.id, &machine).await?;
    tracing::info!(vm_id = %info.vm_id, pid = info.pid, "VM running");

    let drive = async {
        match session {
            Session::Run(args) => run_commands(&fleet, args).await,
            Session::Console => attach(&fleet, &vm.id).await,
        }
    };
    let result = tokio::select! {
        result = drive => result,
        _ = tokio::signal::ctrl_c() => Err(CliError::Interrupted),
    };

    match fleet.shutdown(&vm.id).await {
        Ok(outcome) => tracing::info!(vm_id = %vm.id, ?outcome, "VM stopped"),
        Err(e) => {
            tracing::error!(vm_id = %vm.id, error = %e, "failed to stop VM");
            result?;
            return Err(e.into());
        }
    }
    result
}

async fn run_commands(fleet: &Fleet<FirecrackerSupervisor>, args: &RunArgs) -> Result<ExitCode, CliError> {
    let vm_id = &args.vm.id;
    let connect_timeout = Duration::from_secs(args.connect_timeout);
    let command_timeout = Duration::from_secs(args.timeout);

    if let Some(path) = &args.bootstrap {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| CliError::BootstrapFile {
                path: path.clone(),
                source,
            })?;
        let mut script = BootstrapScript::new().connect_timeout(connect_timeout);
        for step in BootstrapScript::from_lines(&text).steps() {
            script = script.step_with_timeout(step.name.clone(), step.command.clone(), command_timeout);
        }
        let report = fleet.bootstrap(vm_id, &script).await?;
        tracing::info!(vm_id = %vm_id, steps = report.steps.len(), "bootstrap finished");
    }

    if args.exec.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }

    let runner = fleet.command_runner(vm_id).await?;
    let result = exec_all(&runner, &args.exec, connect_timeout, command_timeout).await;
    runner.close().await;
    result
}

async fn exec_all(
    runner: &CommandRunner,
    commands: &[String],
    connect_timeout: Duration,
    command_timeout: Duration,
) -> Result<ExitCode, CliError> {
    runner.connect(connect_timeout).await?;

    let mut last_failure = None;
    for command in commands {
        let out = runner.run(command, RunOptions::with_timeout(command_timeout)).await?;
        print!("{}", out.output);
        if !out.success() {
            tracing::warn!(%command, exit_code = out.exit_code, "guest command failed");
            last_failure = Some(out.exit_code);
        }
    }
    Ok(last_failure.map_or(ExitCode::SUCCESS, exit_code))
}

async fn attach(fleet: &Fleet<FirecrackerSupervisor>, vm_id: &VmId) -> Result<ExitCode, CliError> {
    let console = fleet.open_console(vm_id, TERMINAL_HOLDER).await?;
    let result = bridge(&console, tokio::io::stdin(), tokio::io::stdout()).await;
    console.close().await;
    let stats = result?;
    tracing::info!(to_guest = stats.to_guest, from_guest = stats.from_guest, "console detached");
    Ok(ExitCode::SUCCESS)
}

/// Map a failed guest exit status onto a process exit code. Zero and
/// out-of-range values become 1.
fn exit_code(status: i32) -> ExitCode {
    match u8::try_from(status) {
        Ok(0) | Err(_) => ExitCode::FAILURE,
        Ok(code) => ExitCode::from(code),
    }
}
