use thiserror::Error;

/// The non-success outcomes shared by every I/O and ring operation.
///
/// Together with `Ok(_)` these form the four result kinds the whole data
/// plane is written against. Callees propagate them unchanged with `?`;
/// `ClosePeer` is absorbed only by the TCP-layer mortality handler, and the
/// first `Fatal` tears the process down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IoErr {
    /// A peer-scoped failure or an orderly peer close. The peer's mortality
    /// must be escalated; the process keeps running.
    #[error("peer must be closed")]
    ClosePeer,

    /// Non-blocking I/O would block. The caller records the blocked
    /// direction and yields back to its readiness loop.
    #[error("operation would block")]
    Again,

    /// An invariant violation (shutdown syscall failure, clock failure,
    /// oversize send). Not recoverable; the process exits.
    #[error("fatal invariant violation")]
    Fatal,
}

/// Result alias used throughout the data plane.
pub type IoResult<T = ()> = Result<T, IoErr>;

impl IoErr {
    /// Returns `true` if the operation may be retried once the fd is ready
    /// again.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Again)
    }

    /// Returns `true` if this outcome must terminate the process.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Fatal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(IoErr::Again.is_retryable());
        assert!(!IoErr::ClosePeer.is_retryable());
        assert!(IoErr::Fatal.is_terminal());
        assert!(!IoErr::Again.is_terminal());
    }
}
