//! Sub-request records tracked by an [`crate::IoContext`].

use carbide_nvme::Token;

/// Operation a sub-request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AioKind {
    Read,
    Write,
    Zero,
    Flush,
}

impl AioKind {
    /// Synchronous kinds report to a blocked caller instead of the
    /// completion handler.
    pub(crate) fn is_sync(self) -> bool {
        matches!(self, AioKind::Read | AioKind::Flush)
    }

    pub(crate) fn is_read(self) -> bool {
        matches!(self, AioKind::Read)
    }
}

/// One tracked operation, staged in `pending`, then moved to `running`
/// when the driver accepts it, then removed at completion.
#[derive(Debug)]
pub(crate) struct SubRequest {
    pub(crate) token: Token,
    pub(crate) kind: AioKind,
    pub(crate) offset: u64,
    pub(crate) length: u64,
}
