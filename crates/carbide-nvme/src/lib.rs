//! # carbide-nvme: NVMe Driver Seam for Carbide
//!
//! This crate defines the boundary between the Carbide block layer and
//! whatever moves NVMe commands to hardware:
//!
//! - **[`NvmeDriver`]**: probes and claims controllers
//! - **[`IoQueue`]**: a paired submission/completion queue with bounded,
//!   non-blocking submission and bounded-wait polling
//! - **[`MemDriver`]**: an in-memory driver used for tests and development
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────┐
//! │       carbide-bdev        │
//! │  (uses NvmeDriver trait)  │
//! └─────────────┬─────────────┘
//!               │
//! ┌─────────────┴─────────────┐
//! │       carbide-nvme        │
//! │  ┌─────────┐  ┌─────────┐ │
//! │  │   Mem   │  │ Future  │ │
//! │  │ Driver  │  │  SPDK   │ │
//! │  └─────────┘  └─────────┘ │
//! └───────────────────────────┘
//! ```
//!
//! Commands and completions are correlated by [`Token`]; buffers travel by
//! ownership inside [`Payload`], so no driver binding needs raw pointers.

mod command;
mod driver;
mod mem;
mod status;

pub use command::{Command, Completion, Opcode, Payload, Token};
pub use driver::{Controller, IoQueue, NamespaceInfo, NvmeDriver, ProbeError, SubmitResult};
pub use mem::{DEFAULT_QUEUE_DEPTH, MemDriver, MemQueue};
pub use status::Status;

#[cfg(test)]
mod tests;
