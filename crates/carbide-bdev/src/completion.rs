//! The per-device completion thread.
//!
//! One dedicated thread per open device polls the driver's queue and
//! dispatches each completion: context bookkeeping under the context lock,
//! then the user callback outside it, then the device-wide in-flight
//! decrement that `close()` drains against. That order is what makes the
//! close contract hold: the count reaches zero only after the last
//! callback has returned.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};

use bytes::BytesMut;
use carbide_nvme::{Completion, IoQueue, Status};
use tracing::{debug, error, trace, warn};

use crate::config::BdevConfig;
use crate::device::DeviceShared;
use crate::ioctx::SyncResult;

/// Spawns the completion thread for an open device.
pub(crate) fn spawn(
    shared: Arc<DeviceShared>,
    queue: Arc<dyn IoQueue>,
    config: BdevConfig,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("carbide-poll".to_string())
        .spawn(move || poll_loop(&shared, queue.as_ref(), &config))
        .expect("failed to spawn completion thread")
}

/// Polls until a stop has been requested and nothing is left in flight.
///
/// `close()` drains the in-flight count to zero before requesting the
/// stop, so once both conditions hold no further completion can exist.
fn poll_loop(shared: &DeviceShared, queue: &dyn IoQueue, config: &BdevConfig) {
    debug!("completion thread started");
    let mut batch = Vec::with_capacity(config.poll_batch);
    loop {
        queue.poll(&mut batch, config.poll_batch, config.poll_wait);
        for completion in batch.drain(..) {
            dispatch(shared, completion);
        }
        if shared.stop_requested() && shared.inflight() == 0 {
            break;
        }
    }
    debug!("completion thread stopped");
}

/// Routes one completion to its context and reports it.
fn dispatch(shared: &DeviceShared, completion: Completion) {
    let Completion {
        token,
        status,
        payload,
    } = completion;

    // Write payloads drop here, releasing the caller's buffer share
    // before anything observable happens.
    let data = payload.into_read().map(BytesMut::freeze);

    let Some(ctx) = shared.route(token) else {
        warn!(token = %token, status = %status, "completion with no matching route");
        return;
    };

    let mut async_done = false;
    let now_idle;
    {
        let mut inner = ctx.lock();
        let sub = inner
            .running
            .iter()
            .position(|s| s.token == token)
            .and_then(|pos| inner.running.remove(pos));
        let Some(sub) = sub else {
            drop(inner);
            warn!(token = %token, status = %status, "completion for unknown sub-request");
            shared.end_op();
            return;
        };

        ctx.num_running.fetch_sub(1, Ordering::Relaxed);
        if sub.kind.is_read() {
            ctx.num_reading.fetch_sub(1, Ordering::Relaxed);
        }
        trace!(
            token = %token,
            op = ?sub.kind,
            offset = sub.offset,
            length = sub.length,
            status = %status,
            "completed aio"
        );

        if sub.kind.is_sync() {
            inner.sync_results.insert(token, SyncResult { status, data });
            ctx.cond.notify_all();
        } else {
            async_done = true;
        }
        now_idle = ctx.in_flight() == 0;
    }

    if status.is_fatal() && shared.latch_fault(status) {
        warn!(status = %status, "fatal completion status, refusing further i/o");
    }

    if async_done {
        // A panicking handler must not unwind the completion thread; the
        // in-flight count would never drain and close() would hang.
        let handler = shared.handler();
        let call = AssertUnwindSafe(|| handler.io_complete(ctx.owner(), status));
        if panic::catch_unwind(call).is_err() {
            error!(owner = ctx.owner(), "completion handler panicked, refusing further i/o");
            shared.latch_fault(Status::InternalError);
        }
    }
    if now_idle {
        ctx.notify_idle();
    }
    shared.end_op();
}
