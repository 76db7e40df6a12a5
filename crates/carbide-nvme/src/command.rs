//! Submission and completion records for the driver seam.
//!
//! A [`Command`] is one NVMe command as the block layer hands it to a
//! driver; a [`Completion`] is the matching record the driver hands back.
//! The two are correlated by [`Token`], never by ordering: drivers may
//! complete commands in any order.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::Status;

/// Identifier correlating a submitted [`Command`] with its [`Completion`].
///
/// Tokens are allocated by the block layer and are unique among commands
/// in flight on one device. Drivers treat them as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl Token {
    /// Creates a token from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The NVMe I/O opcodes the block layer issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Read `nblocks` blocks starting at `lba`.
    Read,
    /// Write `nblocks` blocks starting at `lba`.
    Write,
    /// Zero `nblocks` blocks starting at `lba` without transferring data.
    WriteZeroes,
    /// Flush the volatile write cache for the namespace.
    Flush,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Opcode::Read => "read",
            Opcode::Write => "write",
            Opcode::WriteZeroes => "write zeroes",
            Opcode::Flush => "flush",
        };
        f.write_str(s)
    }
}

/// Data buffer travelling with a command.
///
/// Ownership of the buffer moves into the driver at submission and comes
/// back in the [`Completion`]. For reads the block layer provides an empty
/// buffer with capacity for the transfer and the driver appends into it;
/// for writes the driver only reads the payload.
#[derive(Debug)]
pub enum Payload {
    /// No data transfer (write zeroes, flush).
    None,
    /// Destination buffer for a read.
    Read(BytesMut),
    /// Source data for a write. Length equals the transfer size.
    Write(Bytes),
}

impl Payload {
    /// Returns the number of payload bytes currently held.
    ///
    /// For a read payload this is the number of bytes the driver has
    /// filled in, not the requested transfer size.
    pub fn len(&self) -> usize {
        match self {
            Payload::None => 0,
            Payload::Read(buf) => buf.len(),
            Payload::Write(data) => data.len(),
        }
    }

    /// Returns `true` if no payload bytes are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consumes the payload, returning the read buffer if this was a read.
    pub fn into_read(self) -> Option<BytesMut> {
        match self {
            Payload::Read(buf) => Some(buf),
            Payload::None | Payload::Write(_) => None,
        }
    }
}

/// One NVMe command, ready for a submission queue.
///
/// `lba` and `nblocks` are in units of the namespace block size. The block
/// layer validates alignment and range before building a command, so a
/// driver may treat out-of-range addressing as a caller bug.
#[derive(Debug)]
pub struct Command {
    /// Correlation token, echoed back in the completion.
    pub token: Token,
    /// Operation to perform.
    pub opcode: Opcode,
    /// First logical block addressed.
    pub lba: u64,
    /// Number of logical blocks addressed.
    pub nblocks: u32,
    /// Data buffer, if the opcode transfers data.
    pub payload: Payload,
}

impl Command {
    /// Builds a read command. `buf` should be empty with capacity for the
    /// transfer; the driver appends the data read.
    pub fn read(token: Token, lba: u64, nblocks: u32, buf: BytesMut) -> Self {
        Self {
            token,
            opcode: Opcode::Read,
            lba,
            nblocks,
            payload: Payload::Read(buf),
        }
    }

    /// Builds a write command carrying `data`.
    pub fn write(token: Token, lba: u64, nblocks: u32, data: Bytes) -> Self {
        Self {
            token,
            opcode: Opcode::Write,
            lba,
            nblocks,
            payload: Payload::Write(data),
        }
    }

    /// Builds a write zeroes command. No data is transferred.
    pub fn write_zeroes(token: Token, lba: u64, nblocks: u32) -> Self {
        Self {
            token,
            opcode: Opcode::WriteZeroes,
            lba,
            nblocks,
            payload: Payload::None,
        }
    }

    /// Builds a flush command for the whole namespace.
    pub fn flush(token: Token) -> Self {
        Self {
            token,
            opcode: Opcode::Flush,
            lba: 0,
            nblocks: 0,
            payload: Payload::None,
        }
    }
}

/// Record of one completed command.
#[derive(Debug)]
pub struct Completion {
    /// Token of the command this completion belongs to.
    pub token: Token,
    /// Outcome reported by the controller.
    pub status: Status,
    /// The command's buffer, returned to the block layer. For a successful
    /// read it holds exactly the requested bytes.
    pub payload: Payload,
}
