use crate::state::VmState;

/// Errors produced by the `ember-core` crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// The virtual CPU count was outside `[1, 32]`.
    #[error("invalid vcpu count {value}: must be in [1, 32]")]
    InvalidVcpuCount { value: u8 },

    /// The memory size was zero.
    #[error("invalid memory size {value} MiB: must be greater than zero")]
    InvalidMemorySize { value: u32 },

    /// A VM identifier could not be used to derive file names.
    #[error("invalid vm id '{value}': {reason}")]
    InvalidVmId { value: String, reason: String },

    /// A device descriptor failed validation.
    #[error("invalid device '{device_id}': {reason}")]
    InvalidDevice { device_id: String, reason: String },

    /// A lifecycle state change that the state machine does not allow.
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: VmState, to: VmState },
}
