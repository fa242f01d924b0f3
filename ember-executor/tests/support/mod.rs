//! Hardware-free stand-ins shared by the integration tests: a scripted
//! control-socket responder, a simulated guest shell on the serial pipes,
//! and a shell script posing as the `firecracker` binary.

#![allow(dead_code)]

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ember_core::SerialConsolePaths;
use ember_executor::{StopOptions, SupervisorConfig};
use hyper::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

pub const INSTANCE_INFO: &str =
    r#"{"id":"anonymous-instance","state":"Running","vmm_version":"1.7.0","app_name":"Firecracker"}"#;

/// Keeps running until killed; the shell stays the process image, so
/// `/proc/<pid>/cmdline` carries `--api-sock`.
pub const RUN_FOREVER: &str = "while :; do sleep 0.1; done";

/// A serial shell on the process's own stdin/stdout, the way a guest is
/// reached through the hypervisor: each line is echoed like a terminal,
/// evaluated, and followed by the current prompt.
pub const SERIAL_SHELL: &str = r#"PS1='# '
printf '%s' "$PS1"
while IFS= read -r line; do
  printf '%s
' "$line"
  eval "$line"
  printf '%s' "$PS1"
done"#;

/// Like [`RUN_FOREVER`] but survives SIGTERM.
pub const IGNORE_TERM: &str = "trap '' TERM\nwhile :; do sleep 0.1; done";

// ---------------------------------------------------------------------------
// Control socket
// ---------------------------------------------------------------------------

/// One request seen by [`FakeApi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub body: String,
}

impl Recorded {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("request body is JSON")
    }
}

/// HTTP/1.1 responder on a Unix socket. Every request is recorded, then
/// answered with the handler's `(status, body)`.
pub struct FakeApi {
    requests: Arc<Mutex<Vec<Recorded>>>,
    task: JoinHandle<()>,
}

impl FakeApi {
    pub fn serve<F>(socket: &Path, handler: F) -> Self
    where
        F: Fn(&Recorded) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = UnixListener::bind(socket).expect("bind fake API socket");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(handler);

        let recorded = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = Arc::clone(&handler);
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let _ = serve_connection(stream, handler.as_ref(), &recorded).await;
                });
            }
        });
        Self { requests, task }
    }

    /// Answers like an idle Firecracker: `GET /` is 200, every `PUT` is 204.
    pub fn firecracker_like(socket: &Path) -> Self {
        Self::serve(socket, default_reply)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// `"METHOD /path"` of every request except readiness probes.
    pub fn calls(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| r.method != "GET")
            .map(|r| format!("{} {}", r.method, r.path))
            .collect()
    }
}

impl Drop for FakeApi {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn default_reply(request: &Recorded) -> (u16, String) {
    if request.method == "GET" {
        (200, INSTANCE_INFO.to_owned())
    } else {
        (204, String::new())
    }
}

async fn serve_connection<F>(
    mut stream: UnixStream,
    handler: &F,
    requests: &Mutex<Vec<Recorded>>,
) -> io::Result<()>
where
    F: Fn(&Recorded) -> (u16, String),
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_owned();
    let path = request_line.next().unwrap_or_default().to_owned();
    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body_end = buf.len().min(header_end + content_length);
    let body = String::from_utf8_lossy(&buf[header_end..body_end]).into_owned();

    let request = Recorded { method, path, body };
    requests.lock().expect("requests lock").push(request.clone());
    let (status, reply) = handler(&request);

    let reason = StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown");
    let mut response = format!("HTTP/1.1 {status} {reason}\r\nConnection: close\r\n");
    if status == 204 {
        response.push_str("\r\n");
    } else {
        response.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{reply}",
            reply.len()
        ));
    }
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

// ---------------------------------------------------------------------------
// Guest shell
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestMode {
    /// Autologin root shell with `# ` prompt.
    Shell,
    /// Getty without autologin: answers every line with `vm login: `.
    Login,
}

/// Line-echoing shell attached to the guest side of the serial pipes.
///
/// Understands `export PS1="..."`, `echo <text>`, `true`, `false`, and three
/// test commands: `flood` (endless output), `hang` (never finishes) and
/// `login` (drops to a login prompt). Anything else is "not found" (127).
pub struct SimulatedGuest {
    task: JoinHandle<()>,
}

impl SimulatedGuest {
    pub fn attach(pipes: &SerialConsolePaths, mode: GuestMode) -> Self {
        let input = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&pipes.stdout)
            .expect("open guest input pipe");
        let output = pipe::OpenOptions::new()
            .read_write(true)
            .open_sender(&pipes.stdin)
            .expect("open guest output pipe");
        Self {
            task: tokio::spawn(run_guest(input, output, mode)),
        }
    }
}

impl Drop for SimulatedGuest {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Reply {
    Text(String),
    /// Write the text, then output forever.
    Flood(String),
}

async fn run_guest(mut input: pipe::Receiver, mut output: pipe::Sender, mode: GuestMode) {
    let mut prompt = "# ".to_owned();
    let mut pending = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = match input.read(&mut buf).await {
            Ok(0) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
            Ok(n) => n,
            Err(_) => return,
        };
        pending.extend_from_slice(&buf[..n]);

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw)
                .trim_end_matches(['\r', '\n'])
                .to_owned();
            let reply = match mode {
                GuestMode::Login => Reply::Text(format!("{line}\r\nvm login: ")),
                GuestMode::Shell => respond(&line, &mut prompt),
            };
            match reply {
                Reply::Text(text) => {
                    if output.write_all(text.as_bytes()).await.is_err() {
                        return;
                    }
                }
                Reply::Flood(text) => {
                    let _ = output.write_all(text.as_bytes()).await;
                    let chunk = vec![b'x'; 4096];
                    while output.write_all(&chunk).await.is_ok() {
                        tokio::task::yield_now().await;
                    }
                    return;
                }
            }
        }
    }
}

fn respond(line: &str, prompt: &mut String) -> Reply {
    let echo = format!("{line}\r\n");

    if let Some(value) = line
        .strip_prefix("export PS1=\"")
        .and_then(|rest| rest.strip_suffix('"'))
    {
        value.clone_into(prompt);
        return Reply::Text(format!("{echo}{prompt}"));
    }

    if let Some((command, marker)) = line.split_once("; echo __END__") {
        let nonce = marker.trim_end_matches(":$?");
        match command {
            "flood" => return Reply::Flood(echo),
            "hang" => return Reply::Text(echo),
            "login" => return Reply::Text(format!("{echo}vm login: ")),
            _ => {}
        }
        let (out, code) = evaluate(command);
        return Reply::Text(format!("{echo}{out}__END__{nonce}:{code}\r\n{prompt}"));
    }

    if line.is_empty() {
        return Reply::Text(format!("{echo}{prompt}"));
    }
    let (out, _) = evaluate(line);
    Reply::Text(format!("{echo}{out}{prompt}"))
}

fn evaluate(command: &str) -> (String, i32) {
    match command {
        "true" => (String::new(), 0),
        "false" => (String::new(), 1),
        _ => match command.strip_prefix("echo ") {
            Some(text) => (format!("{text}\r\n"), 0),
            None => (format!("sh: {command}: not found\r\n"), 127),
        },
    }
}

// ---------------------------------------------------------------------------
// Hypervisor binary
// ---------------------------------------------------------------------------

/// Write an executable `/bin/sh` script standing in for `firecracker`.
pub fn fake_firecracker(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-firecracker");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write fake binary");
    let mut perms = std::fs::metadata(&path).expect("stat fake binary").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod fake binary");
    path
}

/// Supervisor settings with test-sized windows.
pub fn supervisor_config(binary: &Path, runtime_dir: &Path) -> SupervisorConfig {
    let mut config = SupervisorConfig::new(binary, runtime_dir);
    config.spawn_grace = Duration::from_millis(200);
    config.ready_timeout = Duration::from_secs(2);
    config.ready_interval = Duration::from_millis(20);
    config
}

pub fn fast_stop(graceful: Duration, sigterm: Duration) -> StopOptions {
    let mut options = StopOptions::new(graceful, sigterm);
    options.poll_interval = Duration::from_millis(20);
    options
}
