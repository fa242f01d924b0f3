//! Typed client for the Firecracker control-socket API.
//!
//! Each operation performs exactly one request. `PUT`s succeed on
//! `204 No Content`, `GET`s on `200 OK`; anything else becomes
//! [`ExecutorError::Api`] carrying the hypervisor's `fault_message`, or the
//! raw status line when the body is not the expected JSON.
//!
//! # API Reference
//! Firecracker API spec: `firecracker/src/api_server/swagger/firecracker.yaml`

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ember_core::{BlockDevice, BootSource, MachineConfiguration, NetworkInterface};
use hyper::{Method, StatusCode};
use serde::Deserialize;

use crate::unix_client::{exchange, RawResponse};
use crate::ExecutorError;

/// Response of `GET /`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[non_exhaustive]
pub struct InstanceInfo {
    /// Instance id passed with `--id`, or `anonymous-instance`.
    pub id: String,
    /// `Not started`, `Running` or `Paused`.
    pub state: String,
    pub vmm_version: String,
    #[serde(default)]
    pub app_name: String,
}

#[derive(Deserialize)]
struct FaultBody {
    fault_message: String,
}

/// Action sent to `PUT /actions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    InstanceStart,
    SendCtrlAltDel,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::InstanceStart => "InstanceStart",
            Action::SendCtrlAltDel => "SendCtrlAltDel",
        }
    }
}

/// Client bound to one hypervisor's control socket.
///
/// Holds nothing but the socket path; every call opens a fresh connection.
#[derive(Debug, Clone)]
pub struct FirecrackerClient {
    socket_path: PathBuf,
}

impl FirecrackerClient {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// `PUT /machine-config`.
    ///
    /// # Errors
    /// [`ExecutorError::Api`] on a non-204 answer, [`ExecutorError::ApiRequest`]
    /// if the socket cannot be reached.
    pub async fn put_machine_config(&self, config: &MachineConfiguration) -> Result<(), ExecutorError> {
        let body = serde_json::json!({
            "vcpu_count": config.vcpu_count(),
            "mem_size_mib": config.mem_size_mib(),
        });
        self.put("/machine-config", &body).await
    }

    /// `PUT /boot-source`.
    ///
    /// # Errors
    /// See [`Self::put_machine_config`].
    pub async fn put_boot_source(&self, boot: &BootSource) -> Result<(), ExecutorError> {
        let mut body = serde_json::json!({ "kernel_image_path": boot.kernel_image_path });
        if let Some(args) = &boot.boot_args {
            body["boot_args"] = serde_json::json!(args);
        }
        if let Some(initrd) = &boot.initrd_path {
            body["initrd_path"] = serde_json::json!(initrd);
        }
        self.put("/boot-source", &body).await
    }

    /// `PUT /drives/{drive_id}`.
    ///
    /// # Errors
    /// See [`Self::put_machine_config`].
    pub async fn put_drive(&self, drive: &BlockDevice) -> Result<(), ExecutorError> {
        let body = serde_json::json!({
            "drive_id": drive.drive_id,
            "path_on_host": drive.path_on_host,
            "is_root_device": drive.is_root_device,
            "is_read_only": drive.is_read_only,
        });
        self.put(&format!("/drives/{}", drive.drive_id), &body).await
    }

    /// `PUT /network-interfaces/{iface_id}`.
    ///
    /// # Errors
    /// See [`Self::put_machine_config`].
    pub async fn put_network_interface(&self, iface: &NetworkInterface) -> Result<(), ExecutorError> {
        let mut body = serde_json::json!({
            "iface_id": iface.iface_id,
            "host_dev_name": iface.host_dev_name,
        });
        if let Some(mac) = &iface.guest_mac {
            body["guest_mac"] = serde_json::json!(mac);
        }
        self.put(&format!("/network-interfaces/{}", iface.iface_id), &body)
            .await
    }

    /// `PUT /actions {"action_type": "InstanceStart"}`.
    ///
    /// # Errors
    /// See [`Self::put_machine_config`].
    pub async fn start_instance(&self) -> Result<(), ExecutorError> {
        self.action(Action::InstanceStart).await
    }

    /// `PUT /actions {"action_type": "SendCtrlAltDel"}`.
    ///
    /// Asks the guest to reboot; with `reboot=k` on the kernel command line
    /// the hypervisor exits when it does.
    ///
    /// # Errors
    /// See [`Self::put_machine_config`].
    pub async fn send_shutdown_action(&self) -> Result<(), ExecutorError> {
        self.action(Action::SendCtrlAltDel).await
    }

    /// `GET /`.
    ///
    /// # Errors
    /// [`ExecutorError::Api`] on a non-200 answer or an unparseable body.
    pub async fn get_instance_info(&self) -> Result<InstanceInfo, ExecutorError> {
        let resp = exchange(&self.socket_path, Method::GET, "/", None).await?;
        let resp = expect_status(resp, StatusCode::OK, "GET /")?;
        serde_json::from_str(&resp.body).map_err(|e| ExecutorError::Api {
            endpoint: "GET /".to_owned(),
            status: resp.status.as_u16(),
            fault: format!("unparseable instance info: {e}"),
        })
    }

    /// Lightweight readiness probe: the socket file exists and `GET /`
    /// answers. Never fails.
    pub async fn is_ready(&self) -> bool {
        if !self.socket_path.exists() {
            return false;
        }
        match self.get_instance_info().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(socket = %self.socket_path.display(), error = %e, "control socket not ready");
                false
            }
        }
    }

    /// Poll [`Self::is_ready`] every `interval` until it succeeds or
    /// `timeout` has elapsed.
    ///
    /// # Errors
    /// Returns [`ExecutorError::NotReady`] when the timeout elapses.
    pub async fn wait_until_ready(
        &self,
        timeout: Duration,
        interval: Duration,
    ) -> Result<(), ExecutorError> {
        let started = Instant::now();
        loop {
            if self.is_ready().await {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(ExecutorError::NotReady {
                    socket: self.socket_path.clone(),
                    waited_ms: started.elapsed().as_millis(),
                });
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Push a complete machine configuration.
    ///
    /// Order is fixed: machine config, boot source, drives, network
    /// interfaces. Drives and interfaces are validated against an already
    /// set boot source.
    ///
    /// # Errors
    /// Stops at and returns the first failing request.
    pub async fn configure_all(&self, config: &MachineConfiguration) -> Result<(), ExecutorError> {
        self.put_machine_config(config).await?;
        self.put_boot_source(config.boot_source()).await?;
        for drive in config.drives() {
            self.put_drive(drive).await?;
        }
        for iface in config.network_interfaces() {
            self.put_network_interface(iface).await?;
        }
        Ok(())
    }

    async fn action(&self, action: Action) -> Result<(), ExecutorError> {
        let body = serde_json::json!({ "action_type": action.as_str() });
        self.put("/actions", &body).await
    }

    async fn put(&self, path: &str, body: &serde_json::Value) -> Result<(), ExecutorError> {
        let resp = exchange(&self.socket_path, Method::PUT, path, Some(body.to_string())).await?;
        expect_status(resp, StatusCode::NO_CONTENT, &format!("PUT {path}"))?;
        Ok(())
    }
}

fn expect_status(
    resp: RawResponse,
    expected: StatusCode,
    endpoint: &str,
) -> Result<RawResponse, ExecutorError> {
    if resp.status == expected {
        return Ok(resp);
    }
    Err(ExecutorError::Api {
        endpoint: endpoint.to_owned(),
        status: resp.status.as_u16(),
        fault: fault_message(resp.status, &resp.body),
    })
}

/// `fault_message` from a Firecracker error body, or the status line.
fn fault_message(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<FaultBody>(body) {
        Ok(fault) => fault.fault_message,
        Err(_) => format!("HTTP {status}"),
    }
}
