//! Command runner: request/response command execution over a serial console.
//!
//! The runner owns a [`SerialConsole`] and one subscription to its output.
//! Every `connect`/`run` clears the accumulated buffer, writes its payload,
//! and then polls the buffer until the wait completes, a login prompt shows
//! up, the output cap is exceeded, or the deadline passes. The deadline also
//! bounds the payload write, which blocks while the guest is not reading.
//!
//! Only one wait may be in flight per runner; a second caller gets
//! [`ExecutorError::ConcurrentWait`] instead of queueing behind the first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ember_core::{CommandOutput, VmId};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::{
    command_payload, ends_with_prompt_token, extract_output, find_completion, is_login_prompt,
    looks_like_shell_prompt, prompt_payload,
};
use crate::{ExecutorError, RunOptions, SerialConsole, DEFAULT_MAX_OUTPUT_BYTES};

/// Default time `connect` waits for a shell prompt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on how long the wait loop sleeps without new data, so the
/// deadline is enforced against a silent guest.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct WaitState {
    output: mpsc::Receiver<Vec<u8>>,
    buffer: Vec<u8>,
}

/// Synchronous command execution on a guest shell reachable over a
/// [`SerialConsole`].
///
/// # Cancel Safety
/// Dropping a `connect`/`run` future mid-wait leaves the runner usable; the
/// next call clears whatever the abandoned command produced.
pub struct CommandRunner {
    console: SerialConsole,
    state: Mutex<WaitState>,
    waiting: AtomicBool,
    closed: AtomicBool,
    wake: Notify,
    prompt_token: String,
    connect_output_limit: usize,
}

impl CommandRunner {
    /// Take ownership of `console` and subscribe to its output.
    ///
    /// # Errors
    /// Returns [`ExecutorError::ConsoleInactive`] if the console is closed, or
    /// the I/O error from opening its output pipe.
    pub fn new(console: SerialConsole) -> Result<Self, ExecutorError> {
        let output = console.subscribe()?;
        Ok(Self {
            console,
            state: Mutex::new(WaitState {
                output,
                buffer: Vec::new(),
            }),
            waiting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
            prompt_token: format!("EMBER_{}", Uuid::new_v4().simple()),
            connect_output_limit: DEFAULT_MAX_OUTPUT_BYTES,
        })
    }

    /// Cap on the output `connect` accumulates while looking for a prompt.
    /// Defaults to [`DEFAULT_MAX_OUTPUT_BYTES`]; raise it for guests whose
    /// boot log is still streaming when `connect` starts.
    #[must_use]
    pub fn with_connect_output_limit(mut self, bytes: usize) -> Self {
        self.connect_output_limit = bytes;
        self
    }

    #[must_use]
    pub fn vm_id(&self) -> &VmId {
        self.console.vm_id()
    }

    /// Token embedded in the shell prompt once connected.
    #[must_use]
    pub fn prompt_token(&self) -> &str {
        &self.prompt_token
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Bring the guest shell to a known prompt.
    ///
    /// Sends a newline, then `export PS1="<token>> "`, and waits for the
    /// token prompt or anything that ends like a shell prompt. Boot output
    /// queued before the call counts towards the connect output limit
    /// (see [`Self::with_connect_output_limit`]).
    ///
    /// # Errors
    /// - [`ExecutorError::LoginPrompt`] as soon as a login prompt is seen
    /// - [`ExecutorError::ConnectTimeout`] if no prompt appears in time,
    ///   including when the guest does not drain the payload
    /// - [`ExecutorError::OutputLimit`] if the connect output limit is
    ///   exceeded first
    /// - [`ExecutorError::ConcurrentWait`] if another wait is in flight
    /// - [`ExecutorError::RunnerClosed`] if the runner is or gets closed
    pub async fn connect(&self, timeout: Duration) -> Result<(), ExecutorError> {
        let _wait = self.begin_wait()?;
        let deadline = Instant::now() + timeout;
        let timed_out = || ExecutorError::ConnectTimeout {
            timeout_ms: timeout.as_millis(),
        };
        let mut state = self.state.lock().await;
        state.buffer.clear();

        let payload = format!("\n{}", prompt_payload(&self.prompt_token));
        if !self.send_before(payload.as_bytes(), deadline).await? {
            return Err(timed_out());
        }

        let token = self.prompt_token.as_str();
        let outcome = self
            .wait_for(&mut state, deadline, self.connect_output_limit, |text| {
                (ends_with_prompt_token(text, token) || looks_like_shell_prompt(text)).then_some(())
            })
            .await?;

        match outcome {
            Some(()) => {
                tracing::info!(vm_id = %self.vm_id(), "serial shell connected");
                Ok(())
            }
            None => Err(timed_out()),
        }
    }

    /// Run `command` in the guest shell and wait for its exit status.
    ///
    /// # Errors
    /// - [`ExecutorError::CommandTimeout`] if the payload cannot be written or
    ///   the end marker does not arrive within `options.timeout`
    /// - [`ExecutorError::OutputLimit`] once more than
    ///   `options.max_output_bytes` accumulate, even before the timeout
    /// - [`ExecutorError::LoginPrompt`], [`ExecutorError::ConcurrentWait`],
    ///   [`ExecutorError::RunnerClosed`] as for [`Self::connect`]
    pub async fn run(&self, command: &str, options: RunOptions) -> Result<CommandOutput, ExecutorError> {
        let _wait = self.begin_wait()?;
        let started = Instant::now();
        let deadline = started + options.timeout;
        let timed_out = || ExecutorError::CommandTimeout {
            timeout_ms: options.timeout.as_millis(),
        };
        let mut state = self.state.lock().await;

        // Drop whatever arrived since the last wait, e.g. a trailing prompt.
        while state.output.try_recv().is_ok() {}
        state.buffer.clear();

        let nonce = Uuid::new_v4().simple().to_string();
        tracing::debug!(vm_id = %self.vm_id(), %nonce, %command, "running command");
        if !self
            .send_before(command_payload(&nonce, command).as_bytes(), deadline)
            .await?
        {
            tracing::warn!(vm_id = %self.vm_id(), "guest is not reading its serial input");
            return Err(timed_out());
        }

        let outcome = self
            .wait_for(&mut state, deadline, options.max_output_bytes, |text| {
                find_completion(text, &nonce).map(|done| {
                    let output = extract_output(text, &nonce, done, &self.prompt_token);
                    CommandOutput::new(done.exit_code, output)
                })
            })
            .await?;

        let Some(result) = outcome else {
            return Err(timed_out());
        };
        tracing::debug!(
            vm_id = %self.vm_id(),
            exit_code = result.exit_code,
            bytes = result.output.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "command finished"
        );
        Ok(result)
    }

    /// Close the console and wake any pending wait, which then fails with
    /// [`ExecutorError::RunnerClosed`]. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wake.notify_waiters();
        self.console.close().await;
    }

    fn begin_wait(&self) -> Result<WaitGuard<'_>, ExecutorError> {
        if self.is_closed() {
            return Err(ExecutorError::RunnerClosed);
        }
        WaitGuard::acquire(&self.waiting)
    }

    /// Write `payload` unless `deadline` passes first, in which case the
    /// write is abandoned and `false` returned.
    async fn send_before(&self, payload: &[u8], deadline: Instant) -> Result<bool, ExecutorError> {
        match tokio::time::timeout_at(deadline, self.console.write(payload)).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) if self.is_closed() => Err(ExecutorError::RunnerClosed),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(false),
        }
    }

    /// Poll the buffer until `scan` yields a value (`Some`) or `deadline`
    /// passes (`None`).
    ///
    /// Each iteration checks, in order: closed, new data, login prompt,
    /// `scan`, output cap, deadline.
    async fn wait_for<T>(
        &self,
        state: &mut WaitState,
        deadline: Instant,
        max_output_bytes: usize,
        scan: impl Fn(&str) -> Option<T>,
    ) -> Result<Option<T>, ExecutorError> {
        loop {
            if self.is_closed() {
                return Err(ExecutorError::RunnerClosed);
            }
            while state.buffer.len() <= max_output_bytes {
                match state.output.try_recv() {
                    Ok(chunk) => state.buffer.extend_from_slice(&chunk),
                    Err(_) => break,
                }
            }

            let text = String::from_utf8_lossy(&state.buffer);
            if is_login_prompt(&text) {
                tracing::warn!(vm_id = %self.vm_id(), "guest console is at a login prompt");
                return Err(ExecutorError::LoginPrompt);
            }
            if let Some(found) = scan(&text) {
                return Ok(Some(found));
            }
            if state.buffer.len() > max_output_bytes {
                return Err(ExecutorError::OutputLimit {
                    limit: max_output_bytes,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            tokio::select! {
                chunk = state.output.recv() => match chunk {
                    Some(chunk) => state.buffer.extend_from_slice(&chunk),
                    None => return Err(ExecutorError::RunnerClosed),
                },
                () = tokio::time::sleep(POLL_INTERVAL.min(deadline - now)) => {}
                () = self.wake.notified() => {}
            }
        }
    }
}

impl std::fmt::Debug for CommandRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRunner")
            .field("vm_id", self.vm_id())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Marks a wait as in flight; clears the flag on drop.
struct WaitGuard<'a>(&'a AtomicBool);

impl<'a> WaitGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, ExecutorError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ExecutorError::ConcurrentWait)?;
        Ok(Self(flag))
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
