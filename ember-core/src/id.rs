use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Longest identifier accepted; matches the hypervisor's own `--id` limit.
pub const MAX_VM_ID_LEN: usize = 64;

/// Identifier of one microVM.
///
/// VM ids are interpolated into socket, pipe and log file names, so only
/// ASCII alphanumerics, `-` and `_` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[non_exhaustive]
pub struct VmId(String);

impl VmId {
    /// Validates and wraps an identifier.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidVmId`] if the value is empty, longer than
    /// [`MAX_VM_ID_LEN`], or contains characters outside `[A-Za-z0-9_-]`.
    pub fn new(id: impl Into<String>) -> Result<Self, CoreError> {
        let id = id.into();
        if id.is_empty() {
            return Err(CoreError::InvalidVmId {
                value: id,
                reason: "must not be empty".to_owned(),
            });
        }
        if id.len() > MAX_VM_ID_LEN {
            return Err(CoreError::InvalidVmId {
                reason: format!("longer than {MAX_VM_ID_LEN} characters"),
                value: id,
            });
        }
        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(CoreError::InvalidVmId {
                reason: format!("character {bad:?} is not allowed"),
                value: id,
            });
        }
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VmId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for VmId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VmId> for String {
    fn from(id: VmId) -> Self {
        id.0
    }
}

impl AsRef<str> for VmId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
