//! NVMe completion status codes.

use std::fmt;

/// Status reported by the controller for a completed command.
///
/// This is a pragmatic subset of the NVMe status field: the generic and
/// media error codes that a block layer actually has to react to. Everything
/// the block layer cannot act on specifically is folded into
/// [`Status::InternalError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Command completed successfully.
    Success,
    /// The controller does not support the submitted opcode.
    InvalidOpcode,
    /// A field in the command is invalid (bad namespace, bad flags).
    InvalidField,
    /// The command references blocks past the end of the namespace.
    LbaOutOfRange,
    /// The media could not be written.
    WriteFault,
    /// The media could not be read back without error.
    UnrecoveredRead,
    /// The command was aborted before it reached the media.
    Aborted,
    /// The controller failed internally. The device cannot be trusted
    /// to service further commands until it is reset.
    InternalError,
}

impl Status {
    /// Returns `true` if the command completed successfully.
    pub const fn is_ok(self) -> bool {
        matches!(self, Status::Success)
    }

    /// Returns `true` if this status indicates the controller itself is in
    /// an unusable state, as opposed to a per-command failure.
    ///
    /// A fatal status poisons the device: per-command errors (a bad LBA, an
    /// unreadable sector) affect only the command that carried them.
    pub const fn is_fatal(self) -> bool {
        matches!(self, Status::InternalError)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Success => "success",
            Status::InvalidOpcode => "invalid opcode",
            Status::InvalidField => "invalid field",
            Status::LbaOutOfRange => "lba out of range",
            Status::WriteFault => "write fault",
            Status::UnrecoveredRead => "unrecovered read error",
            Status::Aborted => "aborted",
            Status::InternalError => "internal error",
        };
        f.write_str(s)
    }
}
