use serde::{Deserialize, Serialize};

/// Result of one command run over the serial console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CommandOutput {
    /// Exit status reported by the guest shell (`$?`).
    pub exit_code: i32,
    /// Text the command printed, with echo artifacts removed and line
    /// endings normalised to `\n`.
    pub output: String,
}

impl CommandOutput {
    #[must_use]
    pub fn new(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
