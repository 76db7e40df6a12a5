//! The block device: lifecycle, validation, and the submission path.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;

use bytes::{Bytes, BytesMut};
use carbide_nvme::{
    Command, Controller, IoQueue, NvmeDriver, ProbeError, Status, SubmitResult, Token,
};
use tracing::{debug, info, trace, warn};

use crate::aio::{AioKind, SubRequest};
use crate::completion;
use crate::config::BdevConfig;
use crate::error::{BdevError, BdevResult};
use crate::ioctx::{CtxShared, IoContext};

/// Callback contract for asynchronous completions.
///
/// `io_complete` runs on the device's completion thread, exactly once per
/// asynchronous operation, after the owning context's bookkeeping for that
/// operation is done and outside every internal lock. `owner` is the value
/// the issuing context was created with; `status` is the controller's
/// verdict.
///
/// Completions for one context may arrive out of submission order.
/// Handlers may issue new I/O, but must not block on the context the
/// completion belongs to: the completion thread delivers callbacks
/// serially, and a handler that blocks stalls every completion behind it.
///
/// Handlers must not panic. A panic is caught on the completion thread
/// and latches the device faulted with [`Status::InternalError`], so
/// `close()` still drains; the panic itself goes no further than the
/// offending callback.
pub trait CompletionHandler: Send + Sync {
    fn io_complete(&self, owner: u64, status: Status);
}

/// Lifecycle phase of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Constructed, not yet bound to a controller.
    Unopened,
    /// Bound and serving I/O.
    Open,
    /// Close in progress: draining in-flight operations, refusing new ones.
    Draining,
    /// Closed. The handle cannot be reused; open a new device instead.
    Closed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Unopened => "unopened",
            Lifecycle::Open => "open",
            Lifecycle::Draining => "draining",
            Lifecycle::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct DeviceState {
    phase: Lifecycle,
    /// Operations admitted but not yet fully dispatched. `close()` drains
    /// this to zero before stopping the completion thread.
    inflight: u64,
}

/// State shared between the `Device` handle and its completion thread.
pub(crate) struct DeviceShared {
    state: Mutex<DeviceState>,
    state_cond: Condvar,
    /// First fatal status latched on this device, if any. Once set, new
    /// submissions fail fast until the device is replaced.
    fault: OnceLock<Status>,
    /// Set by `close()` after draining; tells the poller to exit.
    stop: AtomicBool,
    /// Token to owning context, for routing completions.
    routes: Mutex<HashMap<Token, Arc<CtxShared>>>,
    next_token: AtomicU64,
    handler: Arc<dyn CompletionHandler>,
}

impl DeviceShared {
    fn new(handler: Arc<dyn CompletionHandler>) -> Self {
        Self {
            state: Mutex::new(DeviceState {
                phase: Lifecycle::Unopened,
                inflight: 0,
            }),
            state_cond: Condvar::new(),
            fault: OnceLock::new(),
            stop: AtomicBool::new(false),
            routes: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            handler,
        }
    }

    /// Fails unless the device is open and unfaulted.
    fn ensure_open(&self) -> BdevResult<()> {
        let state = self.state.lock().expect("lock poisoned");
        if state.phase != Lifecycle::Open {
            return Err(BdevError::Lifecycle { state: state.phase });
        }
        if let Some(status) = self.fault.get() {
            return Err(BdevError::Io { status: *status });
        }
        Ok(())
    }

    /// Admits one operation into the device-wide in-flight count. Every
    /// successful `begin_op` is balanced by `end_op` after the operation's
    /// completion has been fully dispatched, callback included.
    fn begin_op(&self) -> BdevResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.phase != Lifecycle::Open {
            return Err(BdevError::Lifecycle { state: state.phase });
        }
        if let Some(status) = self.fault.get() {
            return Err(BdevError::Io { status: *status });
        }
        state.inflight += 1;
        Ok(())
    }

    /// Balances `begin_op`; wakes `close()` when the last operation
    /// finishes.
    pub(crate) fn end_op(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.inflight = state.inflight.saturating_sub(1);
        if state.inflight == 0 {
            self.state_cond.notify_all();
        }
    }

    pub(crate) fn inflight(&self) -> u64 {
        self.state.lock().expect("lock poisoned").inflight
    }

    fn alloc_token(&self) -> Token {
        Token::new(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Latches the device faulted. Returns `true` if this call latched it.
    pub(crate) fn latch_fault(&self, status: Status) -> bool {
        self.fault.set(status).is_ok()
    }

    pub(crate) fn fault(&self) -> Option<Status> {
        self.fault.get().copied()
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.state.lock().expect("lock poisoned").phase
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Removes and returns the context that owns `token`.
    pub(crate) fn route(&self, token: Token) -> Option<Arc<CtxShared>> {
        self.routes.lock().expect("lock poisoned").remove(&token)
    }

    pub(crate) fn handler(&self) -> &Arc<dyn CompletionHandler> {
        &self.handler
    }
}

/// One NVMe namespace exposed as a block device.
///
/// Construction injects the driver, the completion handler, and config;
/// [`Device::open`] binds a controller and starts the completion thread;
/// I/O methods serve until [`Device::close`] drains and releases it.
///
/// Open and close take `&mut self` while I/O takes `&self`: callers share
/// a `&Device` across submitting threads for as long as it is open, and
/// regain exclusive access to close it. Dropping an open device closes it.
pub struct Device {
    driver: Arc<dyn NvmeDriver>,
    config: BdevConfig,
    shared: Arc<DeviceShared>,
    controller: Option<Box<dyn Controller>>,
    queue: Option<Arc<dyn IoQueue>>,
    poller: Option<JoinHandle<()>>,
    path: Option<String>,
    size: u64,
    block_size: u64,
}

impl Device {
    /// Creates an unopened device.
    ///
    /// # Panics
    ///
    /// Panics if `config.poll_batch` is 0.
    pub fn new(
        driver: Arc<dyn NvmeDriver>,
        handler: Arc<dyn CompletionHandler>,
        config: BdevConfig,
    ) -> Self {
        assert!(config.poll_batch > 0, "poll_batch must be positive");
        Self {
            driver,
            config,
            shared: Arc::new(DeviceShared::new(handler)),
            controller: None,
            queue: None,
            poller: None,
            path: None,
            size: 0,
            block_size: 0,
        }
    }

    /// Probes and claims the controller at `path`, reads the namespace
    /// geometry, starts the completion thread, and begins serving I/O.
    ///
    /// An unknown path fails `Configuration`; a path another owner holds
    /// fails `Busy`. A device can be opened once: after `close`, open a
    /// new `Device` for the same path.
    pub fn open(&mut self, path: &str) -> BdevResult<()> {
        {
            let state = self.shared.state.lock().expect("lock poisoned");
            if state.phase != Lifecycle::Unopened {
                return Err(BdevError::Lifecycle { state: state.phase });
            }
        }

        let controller = self.driver.probe(path).map_err(|e| match e {
            ProbeError::NotFound { path } => BdevError::Configuration {
                reason: format!("no nvme controller at {path}"),
            },
            ProbeError::Busy { path } => BdevError::Busy { path },
        })?;

        let info = controller.namespace();
        if info.block_size == 0 || info.block_count == 0 {
            return Err(BdevError::Configuration {
                reason: format!("controller at {path} reports empty namespace geometry"),
            });
        }

        let queue = controller.io_queue();
        let poller = completion::spawn(
            Arc::clone(&self.shared),
            Arc::clone(&queue),
            self.config.clone(),
        );

        self.size = info.size_bytes();
        self.block_size = info.block_size;
        self.controller = Some(controller);
        self.queue = Some(queue);
        self.poller = Some(poller);
        self.path = Some(path.to_string());

        {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            state.phase = Lifecycle::Open;
        }

        info!(
            path,
            size = self.size,
            block_size = self.block_size,
            "opened nvme block device"
        );
        Ok(())
    }

    /// Drains in-flight I/O, stops the completion thread, and releases the
    /// claim on the controller.
    ///
    /// When `close` returns, every asynchronous completion handler call
    /// has already returned and no further calls will be made. Closing a
    /// never-opened device just marks it closed; closing twice is a no-op.
    pub fn close(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            match state.phase {
                Lifecycle::Open => state.phase = Lifecycle::Draining,
                Lifecycle::Unopened => {
                    state.phase = Lifecycle::Closed;
                    return;
                }
                Lifecycle::Draining | Lifecycle::Closed => return,
            }
        }
        debug!(path = self.path_for_log(), "draining nvme block device");

        {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            while state.inflight > 0 {
                state = self
                    .shared
                    .state_cond
                    .wait(state)
                    .expect("lock poisoned");
            }
        }

        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.poller.take() {
            let _ = handle.join();
        }
        self.queue = None;
        // Dropping the controller releases the claim.
        self.controller = None;

        {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            state.phase = Lifecycle::Closed;
        }
        info!(path = self.path_for_log(), "closed nvme block device");
    }

    /// Total addressable bytes. 0 until a successful open.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Logical block size in bytes. 0 until a successful open.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Current lifecycle phase.
    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle()
    }

    /// First fatal status latched on this device: a fatal completion from
    /// the controller, or a completion handler panic.
    pub fn fault(&self) -> Option<Status> {
        self.shared.fault()
    }

    /// The path this device was opened at, if it was opened.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Synchronously reads `length` bytes at `offset`, appending them to
    /// `buf`.
    ///
    /// Blocks the calling thread until the device completes this read;
    /// other operations on `ioc` are unaffected and no completion handler
    /// call is made for it. Zero-length reads return immediately.
    /// `buffered` reads are not served by this backend and fail
    /// `Configuration`.
    pub fn read(
        &self,
        offset: u64,
        length: u64,
        buf: &mut BytesMut,
        ioc: &IoContext,
        buffered: bool,
    ) -> BdevResult<()> {
        self.shared.ensure_open()?;
        self.ensure_direct(buffered)?;
        if length == 0 {
            return Ok(());
        }
        self.validate_range(offset, length)?;

        let ctx = ioc.shared();
        let token = self.shared.alloc_token();
        let sub = SubRequest {
            token,
            kind: AioKind::Read,
            offset,
            length,
        };
        let command = Command::read(
            token,
            offset / self.block_size,
            (length / self.block_size) as u32,
            BytesMut::with_capacity(length as usize),
        );
        self.submit_aio(ctx, sub, command)?;

        let result = ctx.wait_sync(token);
        if !result.status.is_ok() {
            return Err(BdevError::Io {
                status: result.status,
            });
        }
        match result.data {
            Some(data) if data.len() as u64 == length => {
                buf.extend_from_slice(&data);
                Ok(())
            }
            _ => {
                // Drivers must return exactly the requested bytes on a
                // successful read.
                warn!(token = %token, length, "driver returned wrong byte count for read");
                Err(BdevError::Io {
                    status: Status::InternalError,
                })
            }
        }
    }

    /// Queues an asynchronous write of `data` at `offset` against `ioc`
    /// and returns once the driver has accepted it.
    ///
    /// Completion is reported through the device's [`CompletionHandler`]
    /// with `ioc`'s owner. On `Saturated` nothing was staged or submitted;
    /// `Bytes` clones share one buffer, so callers keep a clone when they
    /// intend to retry. Zero-length writes return immediately without a
    /// handler call.
    pub fn aio_write(
        &self,
        offset: u64,
        data: Bytes,
        ioc: &IoContext,
        buffered: bool,
    ) -> BdevResult<()> {
        self.shared.ensure_open()?;
        self.ensure_direct(buffered)?;
        if data.is_empty() {
            return Ok(());
        }
        let length = data.len() as u64;
        self.validate_range(offset, length)?;

        let ctx = ioc.shared();
        let token = self.shared.alloc_token();
        let sub = SubRequest {
            token,
            kind: AioKind::Write,
            offset,
            length,
        };
        let command = Command::write(
            token,
            offset / self.block_size,
            (length / self.block_size) as u32,
            data,
        );
        self.submit_aio(ctx, sub, command)
    }

    /// Queues an asynchronous Write Zeroes covering `length` bytes at
    /// `offset`. No data moves between host and device; completion is
    /// reported like `aio_write`.
    pub fn aio_zero(&self, offset: u64, length: u64, ioc: &IoContext) -> BdevResult<()> {
        self.shared.ensure_open()?;
        if length == 0 {
            return Ok(());
        }
        self.validate_range(offset, length)?;

        let ctx = ioc.shared();
        let token = self.shared.alloc_token();
        let sub = SubRequest {
            token,
            kind: AioKind::Zero,
            offset,
            length,
        };
        let command = Command::write_zeroes(
            token,
            offset / self.block_size,
            (length / self.block_size) as u32,
        );
        self.submit_aio(ctx, sub, command)
    }

    /// Flushes the device's volatile write cache and blocks until the
    /// controller confirms it.
    ///
    /// Durability covers writes whose completions the device has already
    /// reported. Callers wanting write-then-flush ordering call
    /// [`IoContext::aio_wait`] before `flush`.
    pub fn flush(&self) -> BdevResult<()> {
        self.shared.ensure_open()?;

        let ioc = IoContext::new(0);
        let ctx = ioc.shared();
        let token = self.shared.alloc_token();
        let sub = SubRequest {
            token,
            kind: AioKind::Flush,
            offset: 0,
            length: 0,
        };
        self.submit_aio(ctx, sub, Command::flush(token))?;

        let result = ctx.wait_sync(token);
        if result.status.is_ok() {
            Ok(())
        } else {
            Err(BdevError::Io {
                status: result.status,
            })
        }
    }

    /// Accepts a cache invalidation hint for `length` bytes at `offset`.
    ///
    /// The direct path carries no cache, so after validation this does
    /// nothing.
    pub fn invalidate_cache(&self, offset: u64, length: u64) -> BdevResult<()> {
        self.shared.ensure_open()?;
        if length == 0 {
            return Ok(());
        }
        self.validate_range(offset, length)?;
        debug!(offset, length, "ignoring cache invalidation hint");
        Ok(())
    }

    fn path_for_log(&self) -> &str {
        self.path.as_deref().unwrap_or("<unopened>")
    }

    fn ensure_direct(&self, buffered: bool) -> BdevResult<()> {
        if buffered {
            return Err(BdevError::Configuration {
                reason: "buffered i/o is not supported by the nvme backend".to_string(),
            });
        }
        Ok(())
    }

    /// Checks `offset`/`length` against the block size and device bounds.
    /// A single command addresses at most `u32::MAX` blocks.
    fn validate_range(&self, offset: u64, length: u64) -> BdevResult<()> {
        if offset % self.block_size != 0 || length % self.block_size != 0 {
            return Err(BdevError::Alignment {
                offset,
                length,
                block_size: self.block_size,
            });
        }
        let out_of_range = BdevError::OutOfRange {
            offset,
            length,
            size: self.size,
        };
        let Some(end) = offset.checked_add(length) else {
            return Err(out_of_range);
        };
        if end > self.size || length / self.block_size > u64::from(u32::MAX) {
            return Err(out_of_range);
        }
        Ok(())
    }

    /// Stages `sub` on its context, submits `command`, and promotes the
    /// sub-request to `running`, all in one context critical section, so
    /// no observer ever sees queues and counters disagree.
    ///
    /// The route is registered before the submit: the instant the driver
    /// accepts, the completion thread can find the owning context. The
    /// context lock keeps it from touching this sub-request until staging
    /// is done.
    fn submit_aio(
        &self,
        ctx: &Arc<CtxShared>,
        sub: SubRequest,
        command: Command,
    ) -> BdevResult<()> {
        let Some(queue) = self.queue.as_ref() else {
            return Err(BdevError::Lifecycle {
                state: self.lifecycle(),
            });
        };
        self.shared.begin_op()?;

        let token = sub.token;
        let kind = sub.kind;
        trace!(token = %token, op = ?kind, offset = sub.offset, length = sub.length, "submitting aio");

        {
            let mut routes = self.shared.routes.lock().expect("lock poisoned");
            routes.insert(token, Arc::clone(ctx));
        }

        let mut inner = ctx.lock();
        ctx.num_pending.fetch_add(1, Ordering::Relaxed);
        if kind.is_read() {
            ctx.num_reading.fetch_add(1, Ordering::Relaxed);
        }
        inner.pending.push_back(sub);

        match queue.submit(command) {
            SubmitResult::Ok => {
                let sub = inner
                    .pending
                    .iter()
                    .position(|s| s.token == token)
                    .and_then(|pos| inner.pending.remove(pos));
                if let Some(sub) = sub {
                    inner.running.push_back(sub);
                }
                // Running grows before pending shrinks so lock-free readers
                // never see the sum dip below what is actually in flight.
                ctx.num_running.fetch_add(1, Ordering::Relaxed);
                ctx.num_pending.fetch_sub(1, Ordering::Relaxed);
                Ok(())
            }
            SubmitResult::Saturated(_) => {
                // The driver never saw this operation; undo the staging.
                if let Some(pos) = inner.pending.iter().position(|s| s.token == token) {
                    inner.pending.remove(pos);
                }
                ctx.num_pending.fetch_sub(1, Ordering::Relaxed);
                if kind.is_read() {
                    ctx.num_reading.fetch_sub(1, Ordering::Relaxed);
                }
                drop(inner);

                self.shared
                    .routes
                    .lock()
                    .expect("lock poisoned")
                    .remove(&token);
                self.shared.end_op();
                debug!(token = %token, "submission queue saturated");
                Err(BdevError::Saturated)
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}
