//! # carbide-bdev: Userspace NVMe Block Device
//!
//! Asynchronous block I/O against an NVMe namespace, for storage engines
//! that keep latency predictable by bypassing the kernel block layer:
//!
//! - **[`Device`]**: open/close lifecycle, synchronous `read`/`flush`,
//!   asynchronous `aio_write`/`aio_zero`
//! - **[`IoContext`]**: per-batch tracking with `has_aios`/`aio_wait`
//! - **[`CompletionHandler`]**: the callback contract for asynchronous
//!   completions
//! - one dedicated completion thread per open device
//!
//! # Architecture
//!
//! ```text
//!  caller threads                         completion thread
//!  ──────────────                         ─────────────────
//!  Device::aio_write ──┐                   ┌── IoQueue::poll
//!  Device::read ───────┼──── IoQueue ──────┤
//!  Device::flush ──────┘    (driver)       └── CompletionHandler::io_complete
//!          │                                        │
//!          └───────────── IoContext ◄───────────────┘
//!                 (queues, counters, condvar)
//! ```
//!
//! Drivers plug in behind the `carbide-nvme` traits; tests and local
//! development run against its in-memory driver.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use bytes::{Bytes, BytesMut};
//! use carbide_bdev::{BdevConfig, CompletionHandler, Device, IoContext, Status};
//! use carbide_nvme::MemDriver;
//!
//! struct Ignore;
//! impl CompletionHandler for Ignore {
//!     fn io_complete(&self, _owner: u64, _status: Status) {}
//! }
//!
//! let driver = Arc::new(MemDriver::new());
//! driver.add_device("mem0", 512, 128);
//!
//! let mut device = Device::new(driver, Arc::new(Ignore), BdevConfig::default());
//! device.open("mem0").unwrap();
//!
//! let ioc = IoContext::new(1);
//! device.aio_write(0, Bytes::from(vec![7u8; 512]), &ioc, false).unwrap();
//! ioc.aio_wait();
//!
//! let mut buf = BytesMut::new();
//! device.read(0, 512, &mut buf, &ioc, false).unwrap();
//! assert_eq!(buf[0], 7);
//! device.close();
//! ```

mod aio;
mod completion;
mod config;
mod device;
mod error;
mod ioctx;

pub use carbide_nvme::Status;
pub use config::BdevConfig;
pub use device::{CompletionHandler, Device, Lifecycle};
pub use error::{BdevError, BdevResult};
pub use ioctx::IoContext;
