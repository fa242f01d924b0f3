//! Machine configuration pushed to a freshly spawned hypervisor.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Smallest accepted virtual CPU count.
pub const MIN_VCPUS: u8 = 1;

/// Largest accepted virtual CPU count.
pub const MAX_VCPUS: u8 = 32;

/// Kernel command line used when the caller does not supply one.
///
/// `console=ttyS0` routes the guest console to the serial line the
/// hypervisor wires to its standard streams.
pub const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// Kernel image and optional boot arguments / initrd.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct BootSource {
    /// Path to the uncompressed kernel image on the host.
    pub kernel_image_path: PathBuf,
    /// Kernel command line; the hypervisor default applies when `None`.
    pub boot_args: Option<String>,
    /// Optional initial ramdisk.
    pub initrd_path: Option<PathBuf>,
}

/// A block device attached to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct BlockDevice {
    /// Device id, also used as the `/drives/{id}` path segment.
    pub drive_id: String,
    /// Backing file on the host.
    pub path_on_host: PathBuf,
    /// Whether the guest mounts this device as `/`.
    pub is_root_device: bool,
    /// Whether the guest sees the device read-only.
    pub is_read_only: bool,
}

impl BlockDevice {
    /// A writable root device.
    pub fn root(drive_id: impl Into<String>, path_on_host: impl Into<PathBuf>) -> Self {
        Self {
            drive_id: drive_id.into(),
            path_on_host: path_on_host.into(),
            is_root_device: true,
            is_read_only: false,
        }
    }

    /// A non-root data device.
    pub fn data(
        drive_id: impl Into<String>,
        path_on_host: impl Into<PathBuf>,
        is_read_only: bool,
    ) -> Self {
        Self {
            drive_id: drive_id.into(),
            path_on_host: path_on_host.into(),
            is_root_device: false,
            is_read_only,
        }
    }
}

/// A network interface backed by a host tap device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct NetworkInterface {
    /// Interface id, also used as the `/network-interfaces/{id}` path segment.
    pub iface_id: String,
    /// Name of the host tap device.
    pub host_dev_name: String,
    /// Guest MAC address; the hypervisor picks one when `None`.
    pub guest_mac: Option<String>,
}

impl NetworkInterface {
    pub fn new(
        iface_id: impl Into<String>,
        host_dev_name: impl Into<String>,
        guest_mac: Option<String>,
    ) -> Self {
        Self {
            iface_id: iface_id.into(),
            host_dev_name: host_dev_name.into(),
            guest_mac,
        }
    }
}

/// Everything the supervisor pushes to a hypervisor before starting it.
///
/// Only constructible through [`MachineConfigurationBuilder::build`], so a
/// value of this type has always passed validation. Deserialisation goes
/// through the builder as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MachineConfigurationBuilder")]
pub struct MachineConfiguration {
    vcpu_count: u8,
    mem_size_mib: u32,
    boot_source: BootSource,
    drives: Vec<BlockDevice>,
    network_interfaces: Vec<NetworkInterface>,
}

impl MachineConfiguration {
    /// Start building a configuration.
    pub fn builder(
        kernel_image_path: impl Into<PathBuf>,
        vcpu_count: u8,
        mem_size_mib: u32,
    ) -> MachineConfigurationBuilder {
        MachineConfigurationBuilder {
            vcpu_count,
            mem_size_mib,
            boot_source: BootSource {
                kernel_image_path: kernel_image_path.into(),
                boot_args: Some(DEFAULT_BOOT_ARGS.to_owned()),
                initrd_path: None,
            },
            drives: Vec::new(),
            network_interfaces: Vec::new(),
        }
    }

    #[must_use]
    pub fn vcpu_count(&self) -> u8 {
        self.vcpu_count
    }

    #[must_use]
    pub fn mem_size_mib(&self) -> u32 {
        self.mem_size_mib
    }

    #[must_use]
    pub fn boot_source(&self) -> &BootSource {
        &self.boot_source
    }

    /// Block devices in the order they are attached.
    #[must_use]
    pub fn drives(&self) -> &[BlockDevice] {
        &self.drives
    }

    /// Network interfaces in the order they are attached.
    #[must_use]
    pub fn network_interfaces(&self) -> &[NetworkInterface] {
        &self.network_interfaces
    }

    /// The root block device, if one was configured.
    #[must_use]
    pub fn root_drive(&self) -> Option<&BlockDevice> {
        self.drives.iter().find(|d| d.is_root_device)
    }
}

/// Builder for [`MachineConfiguration`].
#[derive(Debug, Clone, Deserialize)]
#[must_use]
pub struct MachineConfigurationBuilder {
    vcpu_count: u8,
    mem_size_mib: u32,
    boot_source: BootSource,
    #[serde(default)]
    drives: Vec<BlockDevice>,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

impl TryFrom<MachineConfigurationBuilder> for MachineConfiguration {
    type Error = CoreError;

    fn try_from(builder: MachineConfigurationBuilder) -> Result<Self, Self::Error> {
        builder.build()
    }
}

impl MachineConfigurationBuilder {
    /// Replace the kernel command line.
    pub fn boot_args(mut self, boot_args: impl Into<String>) -> Self {
        self.boot_source.boot_args = Some(boot_args.into());
        self
    }

    /// Let the hypervisor choose its default kernel command line.
    pub fn default_boot_args(mut self) -> Self {
        self.boot_source.boot_args = None;
        self
    }

    pub fn initrd(mut self, initrd_path: impl Into<PathBuf>) -> Self {
        self.boot_source.initrd_path = Some(initrd_path.into());
        self
    }

    pub fn drive(mut self, drive: BlockDevice) -> Self {
        self.drives.push(drive);
        self
    }

    pub fn network_interface(mut self, iface: NetworkInterface) -> Self {
        self.network_interfaces.push(iface);
        self
    }

    /// Validate and freeze the configuration.
    ///
    /// # Errors
    /// - [`CoreError::InvalidVcpuCount`] unless `1 <= vcpus <= 32`
    /// - [`CoreError::InvalidMemorySize`] if memory is zero
    /// - [`CoreError::InvalidDevice`] for empty or duplicate device ids, or
    ///   more than one root device
    pub fn build(self) -> Result<MachineConfiguration, CoreError> {
        if !(MIN_VCPUS..=MAX_VCPUS).contains(&self.vcpu_count) {
            return Err(CoreError::InvalidVcpuCount { value: self.vcpu_count });
        }
        if self.mem_size_mib == 0 {
            return Err(CoreError::InvalidMemorySize { value: self.mem_size_mib });
        }

        let mut root_seen = false;
        for (i, drive) in self.drives.iter().enumerate() {
            check_device_id(&drive.drive_id)?;
            if self.drives[..i].iter().any(|d| d.drive_id == drive.drive_id) {
                return Err(duplicate(&drive.drive_id));
            }
            if drive.is_root_device {
                if root_seen {
                    return Err(CoreError::InvalidDevice {
                        device_id: drive.drive_id.clone(),
                        reason: "only one root device may be attached".to_owned(),
                    });
                }
                root_seen = true;
            }
        }

        for (i, iface) in self.network_interfaces.iter().enumerate() {
            check_device_id(&iface.iface_id)?;
            if self.network_interfaces[..i]
                .iter()
                .any(|n| n.iface_id == iface.iface_id)
            {
                return Err(duplicate(&iface.iface_id));
            }
            if iface.host_dev_name.is_empty() {
                return Err(CoreError::InvalidDevice {
                    device_id: iface.iface_id.clone(),
                    reason: "host tap device name must not be empty".to_owned(),
                });
            }
        }

        Ok(MachineConfiguration {
            vcpu_count: self.vcpu_count,
            mem_size_mib: self.mem_size_mib,
            boot_source: self.boot_source,
            drives: self.drives,
            network_interfaces: self.network_interfaces,
        })
    }
}

fn check_device_id(id: &str) -> Result<(), CoreError> {
    if id.is_empty() || id.contains('/') {
        return Err(CoreError::InvalidDevice {
            device_id: id.to_owned(),
            reason: "device id must be non-empty and must not contain '/'".to_owned(),
        });
    }
    Ok(())
}

fn duplicate(id: &str) -> CoreError {
    CoreError::InvalidDevice {
        device_id: id.to_owned(),
        reason: "duplicate device id".to_owned(),
    }
}

