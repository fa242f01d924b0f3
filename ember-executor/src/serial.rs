//! Serial console over the named pipes wired to the hypervisor.
//!
//! The console writes guest input to `V.stdout` (the hypervisor's stdin)
//! and reads guest output from `V.stdin` (the hypervisor's stdout). Both
//! pipes outlive any console: they are created before spawn and removed by
//! the supervisor after stop, so a console can be closed and reopened
//! without losing guest output buffered in between.
//!
//! Output is delivered through bounded channels returned by
//! [`SerialConsole::subscribe`]. The read loop starts with the first
//! subscriber, runs until the console is closed or dropped, and is owned by
//! the console.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ember_core::{generate_pipe_paths, SerialConsolePaths, VmId};
use nix::sys::stat::Mode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::registry::{ConsoleClaim, ConsoleRegistry};
use crate::ExecutorError;

/// Size of the buffer each pipe read fills.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Pause after a read that returned no data.
const EMPTY_READ_BACKOFF: Duration = Duration::from_millis(20);

/// Chunks buffered per subscriber; a full subscriber misses chunks instead
/// of holding up the others.
const SUBSCRIBER_CAPACITY: usize = 256;

type Subscribers = Arc<Mutex<Vec<mpsc::Sender<Vec<u8>>>>>;

/// Delete and recreate both serial pipes of `vm_id`.
///
/// Must run before the hypervisor is spawned. Idempotent.
///
/// # Errors
/// Returns [`ExecutorError::PipeRemoveFailed`] if a stale pipe cannot be
/// removed and [`ExecutorError::PipeCreateFailed`] if `mkfifo` fails.
pub async fn create_pipes(vm_id: &VmId, pipe_dir: &Path) -> Result<SerialConsolePaths, ExecutorError> {
    tokio::fs::create_dir_all(pipe_dir).await?;
    let paths = generate_pipe_paths(vm_id, pipe_dir);
    for path in paths.both() {
        remove_if_present(path).await?;
        nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|errno| {
            ExecutorError::PipeCreateFailed {
                path: path.to_owned(),
                source: io::Error::from(errno),
            }
        })?;
    }
    tracing::debug!(vm_id = %vm_id, dir = %pipe_dir.display(), "serial pipes created");
    Ok(paths)
}

/// Remove both serial pipes. Missing pipes are not an error.
///
/// Both removals are attempted; the first failure is returned.
///
/// # Errors
/// Returns [`ExecutorError::PipeRemoveFailed`].
pub async fn remove_pipes(paths: &SerialConsolePaths) -> Result<(), ExecutorError> {
    let mut first_err = None;
    for path in paths.both() {
        if let Err(e) = remove_if_present(path).await {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

async fn remove_if_present(path: &Path) -> Result<(), ExecutorError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ExecutorError::PipeRemoveFailed {
            path: path.to_owned(),
            source,
        }),
    }
}

/// Open duplex connection to one VM's serial line.
#[derive(Debug)]
pub struct SerialConsole {
    vm_id: VmId,
    paths: SerialConsolePaths,
    active: AtomicBool,
    writer: tokio::sync::Mutex<Option<pipe::Sender>>,
    closing: Notify,
    read_task: Mutex<Option<JoinHandle<()>>>,
    subscribers: Subscribers,
    claim: Mutex<Option<ConsoleClaim>>,
}

impl SerialConsole {
    /// Claim and open the console of `vm_id`.
    ///
    /// The input pipe is opened immediately so [`Self::write`] works right
    /// away; the output pipe is opened by the first [`Self::subscribe`].
    ///
    /// # Errors
    /// - [`ExecutorError::ConsoleBusy`] if another consumer holds the console;
    ///   no pipe is touched in that case
    /// - [`ExecutorError::PipeNotFound`] listing whichever pipe is missing
    /// - [`ExecutorError::Io`] if the input pipe cannot be opened
    pub async fn open(
        registry: &Arc<ConsoleRegistry>,
        vm_id: &VmId,
        pipe_dir: &Path,
        holder: &str,
    ) -> Result<Self, ExecutorError> {
        let claim = registry.claim(vm_id, holder)?;
        let paths = generate_pipe_paths(vm_id, pipe_dir);

        let mut missing: Vec<PathBuf> = Vec::new();
        for path in paths.both() {
            if tokio::fs::symlink_metadata(path).await.is_err() {
                missing.push(path.to_owned());
            }
        }
        if !missing.is_empty() {
            return Err(ExecutorError::PipeNotFound { missing });
        }

        // Read-write keeps the open from blocking until the hypervisor reads.
        let writer = pipe::OpenOptions::new()
            .read_write(true)
            .open_sender(&paths.stdout)?;

        tracing::info!(vm_id = %vm_id, %holder, "serial console opened");

        Ok(Self {
            vm_id: vm_id.clone(),
            paths,
            active: AtomicBool::new(true),
            writer: tokio::sync::Mutex::new(Some(writer)),
            closing: Notify::new(),
            read_task: Mutex::new(None),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            claim: Mutex::new(Some(claim)),
        })
    }

    #[must_use]
    pub fn vm_id(&self) -> &VmId {
        &self.vm_id
    }

    #[must_use]
    pub fn paths(&self) -> &SerialConsolePaths {
        &self.paths
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Register a consumer of guest output.
    ///
    /// Every chunk read from the pipe is delivered, in read order, to every
    /// live subscriber. Dropping the receiver unsubscribes. The channel
    /// closes when the console does.
    ///
    /// # Errors
    /// Returns [`ExecutorError::ConsoleInactive`] after `close()`, or
    /// [`ExecutorError::Io`] if the output pipe cannot be opened.
    pub fn subscribe(&self) -> Result<mpsc::Receiver<Vec<u8>>, ExecutorError> {
        if !self.is_active() {
            return Err(ExecutorError::ConsoleInactive);
        }

        let mut task = lock(&self.read_task);
        if task.is_none() {
            // Non-blocking open: succeeds even with no writer attached yet.
            let reader = pipe::OpenOptions::new().open_receiver(&self.paths.stdin)?;
            *task = Some(tokio::spawn(read_loop(
                self.vm_id.clone(),
                reader,
                Arc::clone(&self.subscribers),
            )));
            tracing::debug!(vm_id = %self.vm_id, "serial read loop started");
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        lock(&self.subscribers).push(tx);
        Ok(rx)
    }

    /// Send bytes to the guest.
    ///
    /// Blocks while the guest is not draining its input pipe. A concurrent
    /// [`Self::close`] aborts the write, which may then have been partially
    /// delivered.
    ///
    /// # Errors
    /// - [`ExecutorError::ConsoleInactive`] after or during `close()`
    /// - [`ExecutorError::PipeNotInitialized`] if there is no write handle
    /// - [`ExecutorError::WriteFailed`] wrapping the I/O error otherwise
    pub async fn write(&self, data: &[u8]) -> Result<(), ExecutorError> {
        let closing = self.closing.notified();
        tokio::pin!(closing);
        // Registered before the flag is read, so a close in between still wakes us.
        closing.as_mut().enable();
        if !self.is_active() {
            return Err(ExecutorError::ConsoleInactive);
        }

        tokio::select! {
            () = &mut closing => Err(ExecutorError::ConsoleInactive),
            result = async {
                let mut writer = self.writer.lock().await;
                let sender = writer.as_mut().ok_or(ExecutorError::PipeNotInitialized)?;
                sender.write_all(data).await.map_err(ExecutorError::WriteFailed)
            } => result,
        }
    }

    /// Release both pipe handles and the registry claim.
    ///
    /// Idempotent. The pipe files themselves are left in place.
    pub async fn close(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.closing.notify_waiters();

        let task = lock(&self.read_task).take();
        if let Some(task) = task {
            task.abort();
            // Wait so no read is in flight once close returns.
            let _ = task.await;
        }
        self.writer.lock().await.take();
        lock(&self.subscribers).clear();
        lock(&self.claim).take();

        tracing::info!(vm_id = %self.vm_id, "serial console closed");
    }
}

impl Drop for SerialConsole {
    fn drop(&mut self) {
        if let Ok(slot) = self.read_task.get_mut() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

async fn read_loop(vm_id: VmId, mut reader: pipe::Receiver, subscribers: Subscribers) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            // No writer attached or nothing buffered: not end-of-stream.
            Ok(0) => tokio::time::sleep(EMPTY_READ_BACKOFF).await,
            Ok(n) => broadcast(&vm_id, &subscribers, &buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!(vm_id = %vm_id, error = %e, "serial read failed");
                tokio::time::sleep(EMPTY_READ_BACKOFF).await;
            }
        }
    }
}

fn broadcast(vm_id: &VmId, subscribers: &Subscribers, chunk: &[u8]) {
    let mut subscribers = lock(subscribers);
    subscribers.retain(|tx| match tx.try_send(chunk.to_vec()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!(vm_id = %vm_id, bytes = chunk.len(), "serial subscriber lagging, chunk dropped");
            true
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(vm_id = %vm_id, "serial subscriber went away");
            false
        }
    });
}

// The guarded data stays consistent across a panicking holder.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
