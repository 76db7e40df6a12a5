//! Driver seam: probing controllers and moving commands through queues.
//!
//! The block layer talks to hardware exclusively through these traits.
//! A driver binding (SPDK, io_uring passthrough, the in-memory driver in
//! [`crate::mem`]) implements them; the block layer stays free of transport
//! detail and can be tested against the in-memory driver.

use std::sync::Arc;
use std::time::Duration;

use crate::{Command, Completion};

/// Geometry of a probed namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceInfo {
    /// Namespace identifier within the controller.
    pub nsid: u32,
    /// Logical block size in bytes.
    pub block_size: u64,
    /// Number of logical blocks in the namespace.
    pub block_count: u64,
}

impl NamespaceInfo {
    /// Returns the namespace capacity in bytes.
    pub const fn size_bytes(&self) -> u64 {
        self.block_size * self.block_count
    }
}

/// Errors from probing a controller.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// No controller answers to this address.
    #[error("no nvme controller at {path}")]
    NotFound { path: String },

    /// The controller exists but another owner already claimed it.
    #[error("nvme controller at {path} is already claimed")]
    Busy { path: String },
}

/// Result of attempting to submit to a full queue.
///
/// Submission queues are bounded. When full, the command comes back to the
/// caller instead of blocking, so the block layer can surface backpressure
/// without stalling inside the driver.
#[derive(Debug)]
pub enum SubmitResult {
    /// Command was accepted onto the queue.
    Ok,
    /// Queue is full. Returns the command for the caller to handle.
    Saturated(Command),
}

/// Entry point of a driver binding: discovers and claims controllers.
pub trait NvmeDriver: Send + Sync {
    /// Probes the controller at `path` and claims it for exclusive use.
    ///
    /// A successful probe hands back a [`Controller`] holding the claim.
    /// Probing a path another owner holds fails with [`ProbeError::Busy`].
    fn probe(&self, path: &str) -> Result<Box<dyn Controller>, ProbeError>;
}

/// An exclusive claim on one controller and its active namespace.
///
/// Dropping the controller releases the claim, after which the same path
/// can be probed again.
pub trait Controller: Send + Sync {
    /// Returns the geometry of the active namespace.
    fn namespace(&self) -> NamespaceInfo;

    /// Returns the controller's I/O queue pair.
    ///
    /// The queue is shared: submitters and the completion poller hold their
    /// own handles. Queues returned by repeated calls refer to the same
    /// underlying pair.
    fn io_queue(&self) -> Arc<dyn IoQueue>;
}

/// A paired submission and completion queue.
///
/// `submit` and `poll` may be called concurrently from different threads.
/// A driver completes every accepted command exactly once and echoes its
/// token and payload back through [`Completion`].
pub trait IoQueue: Send + Sync {
    /// Attempts to place `cmd` on the submission queue.
    ///
    /// Never blocks: a full queue returns [`SubmitResult::Saturated`] with
    /// the command handed back.
    fn submit(&self, cmd: Command) -> SubmitResult;

    /// Reaps up to `max` completions into `out`, waiting at most `wait` for
    /// the first one. Returns the number of completions appended.
    ///
    /// A zero `wait` polls once without sleeping.
    fn poll(&self, out: &mut Vec<Completion>, max: usize, wait: Duration) -> usize;

    /// Returns the submission queue depth.
    fn depth(&self) -> usize;
}
