//! Unattended guest bootstrap over the serial console.
//!
//! A [`BootstrapScript`] is an ordered list of named shell steps. Running it
//! connects the runner, executes each step, and stops at the first failure.
//! Failures carry the runner's error text verbatim, or the exit code and the
//! tail of the step's output, so the reason is readable without the logs.

use std::time::Duration;

use ember_core::CommandOutput;

use crate::{CommandRunner, RunOptions, DEFAULT_CONNECT_TIMEOUT};

/// Step name reported when the shell could not be reached at all.
pub const CONNECT_STEP: &str = "connect";

/// Lines of output quoted in a failure reason.
const FAILURE_TAIL_LINES: usize = 5;

/// One named command of a bootstrap script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapStep {
    pub name: String,
    pub command: String,
    pub timeout: Duration,
}

/// Ordered bootstrap steps plus the connect window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapScript {
    steps: Vec<BootstrapStep>,
    connect_timeout: Duration,
    max_output_bytes: usize,
}

impl Default for BootstrapScript {
    fn default() -> Self {
        Self {
            steps: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_output_bytes: RunOptions::default().max_output_bytes,
        }
    }
}

impl BootstrapScript {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one command per line. Blank lines and `#` comments are skipped;
    /// each step is named after its line number.
    #[must_use]
    pub fn from_lines(text: &str) -> Self {
        let mut script = Self::new();
        for (idx, line) in text.lines().enumerate() {
            let command = line.trim();
            if command.is_empty() || command.starts_with('#') {
                continue;
            }
            script = script.step(format!("line {}", idx + 1), command);
        }
        script
    }

    /// Append a step with the default command timeout.
    #[must_use]
    pub fn step(self, name: impl Into<String>, command: impl Into<String>) -> Self {
        let timeout = RunOptions::default().timeout;
        self.step_with_timeout(name, command, timeout)
    }

    #[must_use]
    pub fn step_with_timeout(
        mut self,
        name: impl Into<String>,
        command: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        self.steps.push(BootstrapStep {
            name: name.into(),
            command: command.into(),
            timeout,
        });
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    #[must_use]
    pub fn steps(&self) -> &[BootstrapStep] {
        &self.steps
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Outcome of one successful step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub name: String,
    pub output: CommandOutput,
    pub elapsed: Duration,
}

/// All steps ran and exited 0.
#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    pub steps: Vec<StepReport>,
}

/// The step that stopped the script, and why.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("bootstrap step '{step}' failed: {reason}")]
pub struct BootstrapFailure {
    /// Step name, or [`CONNECT_STEP`].
    pub step: String,
    pub reason: String,
    /// Steps that completed before the failure.
    pub completed: usize,
}

/// Connect `runner` and run every step of `script` in order.
///
/// # Errors
/// Returns [`BootstrapFailure`] for the first step that errors or exits
/// non-zero; later steps are not run.
pub async fn run_bootstrap(
    runner: &CommandRunner,
    script: &BootstrapScript,
) -> Result<BootstrapReport, BootstrapFailure> {
    runner
        .connect(script.connect_timeout)
        .await
        .map_err(|e| BootstrapFailure {
            step: CONNECT_STEP.to_owned(),
            reason: e.to_string(),
            completed: 0,
        })?;

    let mut report = BootstrapReport::default();
    for step in &script.steps {
        let options = RunOptions::with_timeout(step.timeout).max_output_bytes(script.max_output_bytes);
        let started = std::time::Instant::now();
        tracing::info!(vm_id = %runner.vm_id(), step = %step.name, "bootstrap step started");

        let failure = |reason: String| BootstrapFailure {
            step: step.name.clone(),
            reason,
            completed: report.steps.len(),
        };
        let output = runner
            .run(&step.command, options)
            .await
            .map_err(|e| failure(e.to_string()))?;
        if !output.success() {
            let reason = exit_reason(&output);
            tracing::warn!(vm_id = %runner.vm_id(), step = %step.name, %reason, "bootstrap step failed");
            return Err(failure(reason));
        }

        report.steps.push(StepReport {
            name: step.name.clone(),
            output,
            elapsed: started.elapsed(),
        });
    }

    tracing::info!(vm_id = %runner.vm_id(), steps = report.steps.len(), "bootstrap complete");
    Ok(report)
}

fn exit_reason(output: &CommandOutput) -> String {
    let lines: Vec<&str> = output
        .output
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();
    let tail = &lines[lines.len().saturating_sub(FAILURE_TAIL_LINES)..];
    if tail.is_empty() {
        format!("exited with code {}", output.exit_code)
    } else {
        format!("exited with code {}: {}", output.exit_code, tail.join("\n"))
    }
}
