//! Core types for the ember microVM control plane.
//!
//! Defines the value types shared by the process supervisor, the serial
//! console and their callers: VM identifiers, machine configuration, the
//! per-VM runtime file layout and the lifecycle state machine.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod execution;
pub mod id;
pub mod layout;
pub mod machine;
pub mod state;

pub use error::CoreError;
pub use execution::CommandOutput;
pub use id::VmId;
pub use layout::{generate_pipe_paths, SerialConsolePaths, VmLayout};
pub use machine::{
    BlockDevice, BootSource, MachineConfiguration, MachineConfigurationBuilder, NetworkInterface,
};
pub use state::VmState;

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn vm(id: &str) -> VmId {
        match VmId::new(id) {
            Ok(v) => v,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn machine_config_rejects_zero_vcpus() {
        let result = MachineConfiguration::builder("/k", 0, 128).build();
        assert!(matches!(result, Err(CoreError::InvalidVcpuCount { value: 0 })));
    }

    #[test]
    fn machine_config_rejects_33_vcpus() {
        let result = MachineConfiguration::builder("/k", 33, 128).build();
        assert!(matches!(result, Err(CoreError::InvalidVcpuCount { value: 33 })));
    }

    #[test]
    fn machine_config_rejects_zero_memory() {
        let result = MachineConfiguration::builder("/k", 1, 0).build();
        assert!(matches!(result, Err(CoreError::InvalidMemorySize { value: 0 })));
    }

    #[test]
    fn machine_config_keeps_device_order() {
        let config = MachineConfiguration::builder("/k", 2, 512)
            .drive(BlockDevice::root("rootfs", "/images/root.ext4"))
            .drive(BlockDevice::data("scratch", "/images/scratch.ext4", false))
            .network_interface(NetworkInterface::new("eth0", "tap0", None))
            .build()
            .expect("valid config");

        let ids: Vec<_> = config.drives().iter().map(|d| d.drive_id.as_str()).collect();
        assert_eq!(ids, ["rootfs", "scratch"]);
        assert_eq!(config.root_drive().map(|d| d.drive_id.as_str()), Some("rootfs"));
        assert_eq!(config.network_interfaces().len(), 1);
    }

    #[test]
    fn machine_config_rejects_two_root_devices() {
        let result = MachineConfiguration::builder("/k", 1, 128)
            .drive(BlockDevice::root("a", "/a"))
            .drive(BlockDevice::root("b", "/b"))
            .build();
        assert!(matches!(result, Err(CoreError::InvalidDevice { .. })));
    }

    #[test]
    fn machine_config_rejects_duplicate_iface_ids() {
        let result = MachineConfiguration::builder("/k", 1, 128)
            .network_interface(NetworkInterface::new("eth0", "tap0", None))
            .network_interface(NetworkInterface::new("eth0", "tap1", None))
            .build();
        assert!(matches!(result, Err(CoreError::InvalidDevice { .. })));
    }

    #[test]
    fn machine_config_boot_args_default_and_override() {
        let default = MachineConfiguration::builder("/k", 1, 128).build().expect("valid");
        assert_eq!(
            default.boot_source().boot_args.as_deref(),
            Some(machine::DEFAULT_BOOT_ARGS)
        );

        let none = MachineConfiguration::builder("/k", 1, 128)
            .default_boot_args()
            .build()
            .expect("valid");
        assert!(none.boot_source().boot_args.is_none());
    }

    #[test]
    fn vm_id_rejects_path_separators_and_empty() {
        assert!(VmId::new("").is_err());
        assert!(VmId::new("../etc").is_err());
        assert!(VmId::new("a/b").is_err());
        assert!(VmId::new("x".repeat(65)).is_err());
        assert!(VmId::new("vm-01_a").is_ok());
    }

    #[test]
    fn vm_id_serde_validates() {
        let ok: Result<VmId, _> = serde_json::from_str("\"vm-1\"");
        assert!(ok.is_ok());
        let bad: Result<VmId, _> = serde_json::from_str("\"vm/1\"");
        assert!(bad.is_err(), "deserialisation must run validation");
    }

    #[test]
    fn machine_config_serde_validates() {
        let config = MachineConfiguration::builder("/k", 2, 256)
            .drive(BlockDevice::root("rootfs", "/r.ext4"))
            .build()
            .expect("valid");
        let json = serde_json::to_string(&config).expect("serialise");
        let back: MachineConfiguration = serde_json::from_str(&json).expect("deserialise");
        assert_eq!(back, config);

        let zero_vcpus = json.replace("\"vcpu_count\":2", "\"vcpu_count\":0");
        let bad: Result<MachineConfiguration, _> = serde_json::from_str(&zero_vcpus);
        assert!(bad.is_err(), "deserialisation must run validation");

        let two_roots = r#"{"vcpu_count":1,"mem_size_mib":128,
            "boot_source":{"kernel_image_path":"/k"},
            "drives":[
                {"drive_id":"a","path_on_host":"/a","is_root_device":true,"is_read_only":false},
                {"drive_id":"b","path_on_host":"/b","is_root_device":true,"is_read_only":false}]}"#;
        let bad: Result<MachineConfiguration, _> = serde_json::from_str(two_roots);
        assert!(bad.is_err(), "a second root device must be rejected");
    }

    #[test]
    fn layout_follows_file_naming_contract() {
        let layout = VmLayout::new(&vm("abc"), Path::new("/run/ember"));
        assert_eq!(layout.pipes.stdin, Path::new("/run/ember/abc.stdin"));
        assert_eq!(layout.pipes.stdout, Path::new("/run/ember/abc.stdout"));
        assert_eq!(layout.socket, Path::new("/run/ember/abc.sock"));
        assert_eq!(
            layout.stderr_log,
            Path::new("/run/ember/abc.firecracker.stderr.log")
        );
    }

    #[test]
    fn state_machine_happy_path() {
        let mut state = VmState::Spawned;
        for next in [
            VmState::Configured,
            VmState::Started,
            VmState::Stopping,
            VmState::Stopped,
        ] {
            state = state.transition(next).expect("legal transition");
        }
        assert!(state.is_terminal());
    }

    #[test]
    fn state_machine_stopped_is_terminal() {
        for next in [
            VmState::Spawned,
            VmState::Configured,
            VmState::Started,
            VmState::Stopping,
            VmState::Error,
        ] {
            assert!(
                VmState::Stopped.transition(next).is_err(),
                "stopped -> {next} must be rejected"
            );
        }
    }

    #[test]
    fn state_machine_error_can_still_stop() {
        let state = VmState::Started.transition(VmState::Error).expect("legal");
        assert_eq!(state.transition(VmState::Stopping).ok(), Some(VmState::Stopping));
        assert!(state.transition(VmState::Started).is_err());
    }

    #[test]
    fn state_display_is_lowercase() {
        assert_eq!(VmState::Configured.to_string(), "configured");
        assert_eq!(VmState::Error.to_string(), "error");
    }

    #[test]
    fn command_output_success_reflects_exit_code() {
        assert!(CommandOutput::new(0, "hi\n").success());
        assert!(!CommandOutput::new(1, "").success());
    }

    proptest::proptest! {
        #[test]
        fn proptest_valid_vcpu_and_memory_always_build(
            vcpus in 1u8..=32,
            mem in 1u32..=u32::MAX,
        ) {
            let result = MachineConfiguration::builder("/k", vcpus, mem).build();
            proptest::prop_assert!(result.is_ok(), "vcpus={} mem={} must build", vcpus, mem);
        }

        #[test]
        fn proptest_out_of_range_vcpus_always_fail(vcpus in 33u8..=u8::MAX) {
            let result = MachineConfiguration::builder("/k", vcpus, 128).build();
            let is_vcpu_error = matches!(result, Err(CoreError::InvalidVcpuCount { .. }));
            proptest::prop_assert!(is_vcpu_error);
        }

        #[test]
        fn proptest_pipe_paths_are_pure_and_distinct(
            a in "[A-Za-z0-9_-]{1,64}",
            b in "[A-Za-z0-9_-]{1,64}",
        ) {
            let dir = Path::new("/run/ember");
            let id_a = VmId::new(a.clone()).expect("pattern yields valid ids");
            let id_b = VmId::new(b.clone()).expect("pattern yields valid ids");

            proptest::prop_assert_eq!(
                generate_pipe_paths(&id_a, dir),
                generate_pipe_paths(&id_a, dir)
            );
            if a != b {
                let pa = generate_pipe_paths(&id_a, dir);
                let pb = generate_pipe_paths(&id_b, dir);
                proptest::prop_assert_ne!(&pa.stdin, &pb.stdin);
                proptest::prop_assert_ne!(&pa.stdout, &pb.stdout);
            }
        }
    }
}
