//! Block device error types.

use carbide_nvme::Status;

use crate::device::Lifecycle;

/// Result alias for block device operations.
pub type BdevResult<T> = Result<T, BdevError>;

/// Errors from the block device layer.
#[derive(Debug, thiserror::Error)]
pub enum BdevError {
    /// Invalid or unsupported configuration, including an unknown device
    /// path and I/O modes this backend does not serve.
    #[error("invalid configuration: {reason}")]
    Configuration { reason: String },

    /// The device exists but another owner already claimed it.
    #[error("device {path} is already claimed")]
    Busy { path: String },

    /// Offset or length is not a multiple of the device block size.
    #[error("i/o not aligned to {block_size}-byte blocks (offset {offset}, length {length})")]
    Alignment {
        offset: u64,
        length: u64,
        block_size: u64,
    },

    /// The addressed range extends past the end of the device.
    #[error("i/o past end of device (offset {offset}, length {length}, device size {size})")]
    OutOfRange { offset: u64, length: u64, size: u64 },

    /// The submission queue is full. Nothing was submitted; retry after
    /// completions drain.
    #[error("submission queue is full")]
    Saturated,

    /// The device reported a failure completing a command, or refuses new
    /// commands after a fatal status latched it faulted.
    #[error("i/o failed: {status}")]
    Io { status: Status },

    /// The operation is not valid in the device's current lifecycle state.
    #[error("device is {state}")]
    Lifecycle { state: Lifecycle },
}

impl BdevError {
    /// Returns `true` if retrying the same operation later can succeed
    /// without any intervening repair.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BdevError::Saturated | BdevError::Busy { .. })
    }
}
