//! In-memory NVMe driver.
//!
//! Backs each namespace with a `Vec<u8>` and executes commands when the
//! poller reaps them, so completions always arrive on the polling thread,
//! exactly as they do with real hardware. Used by the block layer's test
//! suite and by development setups without NVMe devices.
//!
//! Namespace storage is allocated eagerly, so keep registered devices
//! small (megabytes, not terabytes).
//!
//! Test controls on [`MemQueue`] make failure modes reproducible:
//! [`MemQueue::pause`] holds completions back, [`MemQueue::inject_status`]
//! fails upcoming commands, and [`MemQueue::reverse_completions`] delivers
//! batches out of submission order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use tracing::{debug, trace};

use crate::{
    Command, Completion, Controller, IoQueue, NamespaceInfo, NvmeDriver, Opcode, Payload,
    ProbeError, Status, SubmitResult,
};

/// Submission queue depth used by [`MemDriver::add_device`].
pub const DEFAULT_QUEUE_DEPTH: usize = 128;

/// Driver that serves registered in-memory namespaces.
pub struct MemDriver {
    devices: Mutex<HashMap<String, Arc<MemDevice>>>,
}

struct MemDevice {
    claimed: AtomicBool,
    queue: Arc<MemQueue>,
}

impl MemDriver {
    /// Creates a driver with no registered devices.
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a namespace reachable at `path` with the default queue
    /// depth.
    ///
    /// # Panics
    ///
    /// Panics if `path` is already registered or the geometry is zero.
    pub fn add_device(&self, path: &str, block_size: u64, block_count: u64) {
        self.add_device_with_depth(path, block_size, block_count, DEFAULT_QUEUE_DEPTH);
    }

    /// Registers a namespace with an explicit submission queue depth.
    ///
    /// Small depths make saturation reproducible in tests.
    ///
    /// # Panics
    ///
    /// Panics if `path` is already registered, the geometry is zero, or
    /// `depth` is zero.
    pub fn add_device_with_depth(
        &self,
        path: &str,
        block_size: u64,
        block_count: u64,
        depth: usize,
    ) {
        assert!(block_size > 0, "block size must be positive");
        assert!(block_count > 0, "block count must be positive");
        assert!(depth > 0, "queue depth must be positive");

        let info = NamespaceInfo {
            nsid: 1,
            block_size,
            block_count,
        };
        let device = Arc::new(MemDevice {
            claimed: AtomicBool::new(false),
            queue: Arc::new(MemQueue::new(info, depth)),
        });

        let mut devices = self.devices.lock().expect("lock poisoned");
        let previous = devices.insert(path.to_string(), device);
        assert!(previous.is_none(), "device {path} already registered");
        debug!(path, block_size, block_count, depth, "registered in-memory device");
    }

    /// Returns the queue behind `path` for driving test controls.
    pub fn queue(&self, path: &str) -> Option<Arc<MemQueue>> {
        let devices = self.devices.lock().expect("lock poisoned");
        devices.get(path).map(|d| Arc::clone(&d.queue))
    }
}

impl Default for MemDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl NvmeDriver for MemDriver {
    fn probe(&self, path: &str) -> Result<Box<dyn Controller>, ProbeError> {
        let device = {
            let devices = self.devices.lock().expect("lock poisoned");
            devices.get(path).cloned()
        };
        let Some(device) = device else {
            return Err(ProbeError::NotFound {
                path: path.to_string(),
            });
        };

        if device
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ProbeError::Busy {
                path: path.to_string(),
            });
        }

        debug!(path, "claimed in-memory controller");
        Ok(Box::new(MemController {
            path: path.to_string(),
            device,
        }))
    }
}

struct MemController {
    path: String,
    device: Arc<MemDevice>,
}

impl Controller for MemController {
    fn namespace(&self) -> NamespaceInfo {
        self.device.queue.info
    }

    fn io_queue(&self) -> Arc<dyn IoQueue> {
        Arc::clone(&self.device.queue) as Arc<dyn IoQueue>
    }
}

impl Drop for MemController {
    fn drop(&mut self) {
        self.device.claimed.store(false, Ordering::Release);
        debug!(path = %self.path, "released in-memory controller");
    }
}

/// Queue pair of an in-memory namespace.
///
/// Commands wait in a bounded submission queue until a poller reaps them;
/// execution happens inside [`IoQueue::poll`] on the polling thread.
pub struct MemQueue {
    info: NamespaceInfo,
    sq: ArrayQueue<Command>,
    store: Mutex<Vec<u8>>,
    doorbell: Mutex<()>,
    doorbell_cond: Condvar,
    paused: AtomicBool,
    reversed: AtomicBool,
    faults: Mutex<VecDeque<Status>>,
}

impl MemQueue {
    fn new(info: NamespaceInfo, depth: usize) -> Self {
        let size = info.size_bytes() as usize;
        Self {
            info,
            sq: ArrayQueue::new(depth),
            store: Mutex::new(vec![0u8; size]),
            doorbell: Mutex::new(()),
            doorbell_cond: Condvar::new(),
            paused: AtomicBool::new(false),
            reversed: AtomicBool::new(false),
            faults: Mutex::new(VecDeque::new()),
        }
    }

    /// Holds back completions: polls find nothing until [`Self::resume`].
    /// Submissions still queue up (and saturate) as usual.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Resumes completion delivery and wakes a waiting poller.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        let _guard = self.doorbell.lock().expect("lock poisoned");
        self.doorbell_cond.notify_all();
    }

    /// Queues `status` to be reported by an upcoming command instead of
    /// executing it. Injected statuses apply in FIFO order, one command
    /// each.
    pub fn inject_status(&self, status: Status) {
        self.faults
            .lock()
            .expect("lock poisoned")
            .push_back(status);
    }

    /// When enabled, each polled batch is delivered in reverse submission
    /// order, exercising completion reordering.
    pub fn reverse_completions(&self, on: bool) {
        self.reversed.store(on, Ordering::Release);
    }

    /// Returns the number of commands waiting in the submission queue.
    pub fn queued(&self) -> usize {
        self.sq.len()
    }

    fn execute(&self, cmd: Command) -> Completion {
        let injected = self.faults.lock().expect("lock poisoned").pop_front();
        let status = injected.unwrap_or(Status::Success);

        let Command {
            token,
            opcode,
            lba,
            nblocks,
            mut payload,
        } = cmd;

        if status.is_ok() {
            let offset = (lba * self.info.block_size) as usize;
            let length = nblocks as usize * self.info.block_size as usize;
            let mut store = self.store.lock().expect("lock poisoned");
            debug_assert!(
                offset + length <= store.len(),
                "command addresses past the end of the namespace"
            );
            match opcode {
                Opcode::Read => {
                    if let Payload::Read(buf) = &mut payload {
                        buf.extend_from_slice(&store[offset..offset + length]);
                    }
                }
                Opcode::Write => {
                    if let Payload::Write(data) = &payload {
                        debug_assert_eq!(data.len(), length);
                        store[offset..offset + length].copy_from_slice(data);
                    }
                }
                Opcode::WriteZeroes => store[offset..offset + length].fill(0),
                Opcode::Flush => {}
            }
        }

        trace!(token = %token, op = %opcode, status = %status, "executed command");
        Completion {
            token,
            status,
            payload,
        }
    }
}

impl IoQueue for MemQueue {
    fn submit(&self, cmd: Command) -> SubmitResult {
        match self.sq.push(cmd) {
            Ok(()) => {
                let _guard = self.doorbell.lock().expect("lock poisoned");
                self.doorbell_cond.notify_all();
                SubmitResult::Ok
            }
            Err(cmd) => SubmitResult::Saturated(cmd),
        }
    }

    fn poll(&self, out: &mut Vec<Completion>, max: usize, wait: Duration) -> usize {
        let deadline = Instant::now() + wait;
        let mut guard = self.doorbell.lock().expect("lock poisoned");
        loop {
            if !self.paused.load(Ordering::Acquire) {
                let mut batch = Vec::new();
                while batch.len() < max {
                    match self.sq.pop() {
                        Some(cmd) => batch.push(self.execute(cmd)),
                        None => break,
                    }
                }
                if !batch.is_empty() {
                    if self.reversed.load(Ordering::Acquire) {
                        batch.reverse();
                    }
                    let count = batch.len();
                    out.extend(batch);
                    return count;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            let (g, _) = self
                .doorbell_cond
                .wait_timeout(guard, deadline - now)
                .expect("lock poisoned");
            guard = g;
        }
    }

    fn depth(&self) -> usize {
        self.sq.capacity()
    }
}
