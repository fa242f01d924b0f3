//! End-to-end lifecycle against a real Firecracker.
//!
//! These tests require KVM, the Firecracker binary, a guest kernel and a
//! rootfs with serial autologin, plus a host tap device.
//! Run with: `cargo test --test firecracker_lifecycle -- --ignored`
//!
//! Paths come from `EMBER_TEST_KERNEL`, `EMBER_TEST_ROOTFS` and
//! `EMBER_TEST_TAP` (default `tap0`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ember_core::{BlockDevice, MachineConfiguration, NetworkInterface, VmId};
use ember_executor::{
    is_hypervisor_alive, CommandRunner, ConsoleRegistry, FirecrackerSupervisor, Hypervisor, RunOptions,
    SerialConsole, StopOptions, SupervisorConfig, DEFAULT_CONNECT_TIMEOUT,
};

fn env_path(name: &str) -> PathBuf {
    std::env::var_os(name)
        .map(PathBuf::from)
        .unwrap_or_else(|| panic!("{name} must point at a test asset"))
}

fn test_config() -> MachineConfiguration {
    let tap = std::env::var("EMBER_TEST_TAP").unwrap_or_else(|_| "tap0".to_owned());
    MachineConfiguration::builder(env_path("EMBER_TEST_KERNEL"), 2, 512)
        .drive(BlockDevice::root("rootfs", env_path("EMBER_TEST_ROOTFS")))
        .network_interface(NetworkInterface::new("eth0", tap, None))
        .build()
        .expect("valid machine config")
}

#[tokio::test]
#[ignore = "requires KVM and Firecracker binary"]
async fn boot_run_echo_and_stop() {
    let runtime = tempfile::tempdir().expect("tempdir");
    let supervisor = FirecrackerSupervisor::new(SupervisorConfig::new("firecracker", runtime.path()));
    supervisor.health_check().await.expect("KVM and firecracker available");

    let vm_id = VmId::new("e2e").expect("valid vm id");
    let start = Instant::now();
    let mut process = supervisor.spawn(&vm_id).await.expect("spawn");
    supervisor
        .configure(&mut process, &test_config())
        .await
        .expect("configure");
    supervisor.start(&mut process).await.expect("start");
    println!("VM start time: {:?}", start.elapsed());

    let registry = Arc::new(ConsoleRegistry::new());
    let console = SerialConsole::open(&registry, &vm_id, runtime.path(), "e2e")
        .await
        .expect("open console");
    let runner = CommandRunner::new(console).expect("runner");
    runner
        .connect(DEFAULT_CONNECT_TIMEOUT * 3)
        .await
        .expect("guest shell prompt");

    let out = runner
        .run("echo hi", RunOptions::default())
        .await
        .expect("run echo");
    assert_eq!(out.exit_code, 0);
    assert_eq!(out.output, "hi\n");
    runner.close().await;

    let socket = process.socket_path().to_owned();
    let pid = process.pid;
    let outcome = supervisor
        .stop(&mut process, &StopOptions::new(Duration::from_secs(10), Duration::from_secs(5)))
        .await
        .expect("stop");
    println!("stop outcome: {outcome:?}");
    assert!(!is_hypervisor_alive(pid, &socket), "no live hypervisor may remain on the socket");
}
