//! Per-batch tracking of in-flight operations.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use bytes::Bytes;
use carbide_nvme::{Status, Token};
use tracing::trace;

use crate::aio::SubRequest;

/// Tracks one logical batch of in-flight operations.
///
/// A context belongs to the caller that created it; the handle is
/// deliberately not `Clone`, so whose batch an operation lands on is
/// always unambiguous. Any number of threads may still issue operations
/// against one context through a shared `&IoContext`.
///
/// `owner` is an opaque reference handed back verbatim to the device's
/// completion handler with every asynchronous completion on this context.
#[derive(Debug)]
pub struct IoContext {
    shared: Arc<CtxShared>,
}

impl IoContext {
    /// Creates an empty context with the given owner reference.
    pub fn new(owner: u64) -> Self {
        Self {
            shared: Arc::new(CtxShared {
                owner,
                inner: Mutex::new(CtxInner::default()),
                cond: Condvar::new(),
                num_pending: AtomicU64::new(0),
                num_running: AtomicU64::new(0),
                num_reading: AtomicU64::new(0),
                num_waiting: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the opaque owner reference.
    pub fn owner(&self) -> u64 {
        self.shared.owner
    }

    /// Returns `true` if any operation on this context is staged or
    /// awaiting completion. Lock-free; never blocks.
    pub fn has_aios(&self) -> bool {
        self.shared.in_flight() > 0
    }

    /// Blocks until every operation issued against this context has
    /// completed. Returns immediately when none are in flight.
    ///
    /// Robust to spurious wakeups and to operations submitted while
    /// waiting: the predicate is re-checked under the context lock, and
    /// the counters it reads only change inside that lock.
    pub fn aio_wait(&self) {
        self.shared.wait_idle();
    }

    /// Number of operations staged but not yet accepted by the driver.
    pub fn num_pending(&self) -> u64 {
        self.shared.num_pending.load(Ordering::Relaxed)
    }

    /// Number of operations accepted by the driver and awaiting
    /// completion.
    pub fn num_running(&self) -> u64 {
        self.shared.num_running.load(Ordering::Relaxed)
    }

    /// Number of in-flight reads.
    pub fn num_reading(&self) -> u64 {
        self.shared.num_reading.load(Ordering::Relaxed)
    }

    /// Number of threads currently blocked on this context.
    pub fn num_waiting(&self) -> u64 {
        self.shared.num_waiting.load(Ordering::Relaxed)
    }

    pub(crate) fn shared(&self) -> &Arc<CtxShared> {
        &self.shared
    }
}

/// State shared between the context handle, the submission path, and the
/// completion thread.
///
/// Invariant: the counters mirror the queues exactly, and every counter
/// mutation happens in the same critical section as the queue change it
/// describes. Lock-free reads therefore see a value the queues held at
/// some instant, and `num_pending + num_running == 0` iff both queues are
/// empty.
#[derive(Debug)]
pub(crate) struct CtxShared {
    owner: u64,
    inner: Mutex<CtxInner>,
    pub(crate) cond: Condvar,
    pub(crate) num_pending: AtomicU64,
    pub(crate) num_running: AtomicU64,
    pub(crate) num_reading: AtomicU64,
    num_waiting: AtomicU64,
}

#[derive(Debug, Default)]
pub(crate) struct CtxInner {
    pub(crate) pending: VecDeque<SubRequest>,
    pub(crate) running: VecDeque<SubRequest>,
    /// Results deposited for blocked synchronous callers, keyed by token.
    pub(crate) sync_results: HashMap<Token, SyncResult>,
}

/// What the completion thread leaves for a blocked synchronous caller.
#[derive(Debug)]
pub(crate) struct SyncResult {
    pub(crate) status: Status,
    pub(crate) data: Option<Bytes>,
}

impl CtxShared {
    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().expect("lock poisoned")
    }

    /// Sum of staged and running operations, read lock-free.
    pub(crate) fn in_flight(&self) -> u64 {
        self.num_pending.load(Ordering::Relaxed) + self.num_running.load(Ordering::Relaxed)
    }

    /// Blocks until nothing is staged or running.
    pub(crate) fn wait_idle(&self) {
        let mut inner = self.lock();
        self.num_waiting.fetch_add(1, Ordering::Relaxed);
        while self.in_flight() > 0 {
            inner = self.cond.wait(inner).expect("lock poisoned");
        }
        self.num_waiting.fetch_sub(1, Ordering::Relaxed);
        drop(inner);
        trace!(owner = self.owner, "context drained");
    }

    /// Blocks until the completion thread deposits the result for `token`.
    pub(crate) fn wait_sync(&self, token: Token) -> SyncResult {
        let mut inner = self.lock();
        self.num_waiting.fetch_add(1, Ordering::Relaxed);
        loop {
            if let Some(result) = inner.sync_results.remove(&token) {
                self.num_waiting.fetch_sub(1, Ordering::Relaxed);
                return result;
            }
            inner = self.cond.wait(inner).expect("lock poisoned");
        }
    }

    /// Wakes every waiter so it re-checks its predicate. Taking the lock
    /// first means a waiter is either already parked or has not yet read
    /// the counters this notification is about.
    pub(crate) fn notify_idle(&self) {
        let _inner = self.lock();
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_is_idle() {
        let ioc = IoContext::new(7);
        assert_eq!(ioc.owner(), 7);
        assert!(!ioc.has_aios());
        assert_eq!(ioc.num_pending(), 0);
        assert_eq!(ioc.num_running(), 0);
        assert_eq!(ioc.num_reading(), 0);
        assert_eq!(ioc.num_waiting(), 0);
    }

    #[test]
    fn wait_on_idle_context_returns_immediately() {
        let ioc = IoContext::new(0);
        ioc.aio_wait();
        ioc.aio_wait();
    }
}
