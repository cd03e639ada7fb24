//! Node session errors.
//!
//! Every error maps to a negative errno-style result code, which is what a
//! `done` reply carries back to the server. `is_fatal()` decides whether the
//! session survives: negotiation and validation failures stay local, protocol
//! violations and transport failures end the session.

use std::io;

use tetherproto::{Direction, FrameError, MemId, PortId, Seq};
use thiserror::Error;

/// A peer broke the protocol contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("done for unknown or already resolved seq {0}")]
    UnknownSeq(Seq),

    #[error("seq {0} reused while still pending")]
    DuplicateSeq(Seq),

    #[error("done for seq {seq} while seq {oldest} is still pending")]
    OutOfOrderDone { seq: Seq, oldest: Seq },

    #[error("{direction} port {port_id} references unregistered mem {mem_id}")]
    UnregisteredMem {
        direction: Direction,
        port_id: PortId,
        mem_id: MemId,
    },

    #[error("format for {direction} port {port_id} was never advertised")]
    FormatNotAdvertised {
        direction: Direction,
        port_id: PortId,
    },

    #[error("operation after destroy")]
    AfterDestroy,

    #[error("no {direction} port {port_id}")]
    UnknownPort {
        direction: Direction,
        port_id: PortId,
    },

    #[error("{direction} port limit {max} reached ({live} live)")]
    PortLimit {
        direction: Direction,
        max: u32,
        live: u32,
    },

    #[error("mem {mem_id} is still referenced by {refs} buffer(s)")]
    MemInUse { mem_id: MemId, refs: u32 },

    #[error("descriptor index {0} missing from frame")]
    BadDescriptor(u32),

    #[error("transport already established and renegotiation is disabled")]
    TransportRenegotiation,

    #[error("unknown memory type {0}")]
    UnknownMemType(u32),
}

impl Violation {
    /// Violations that are answered with a negative `done` and otherwise
    /// leave the session running.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Violation::FormatNotAdvertised { .. }
                | Violation::UnknownPort { .. }
                | Violation::PortLimit { .. }
        )
    }

    pub fn code(&self) -> i32 {
        match self {
            Violation::UnknownSeq(_)
            | Violation::DuplicateSeq(_)
            | Violation::OutOfOrderDone { .. }
            | Violation::BadDescriptor(_) => -libc::EINVAL,
            Violation::UnregisteredMem { .. } | Violation::UnknownPort { .. } => -libc::ENOENT,
            Violation::FormatNotAdvertised { .. } => -libc::EPERM,
            Violation::AfterDestroy => -libc::EPIPE,
            Violation::PortLimit { .. } => -libc::ENOSPC,
            Violation::MemInUse { .. } => -libc::EBUSY,
            Violation::TransportRenegotiation | Violation::UnknownMemType(_) => -libc::ENOTSUP,
        }
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] Violation),

    /// The processing side cannot honour a format, param, prop or command.
    #[error("negotiation failed: {reason}")]
    Negotiation { code: i32, reason: String },

    #[error("{what}: {source}")]
    Resource {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("range {offset}+{size} outside mem {mem_id} ({extent} bytes)")]
    OutOfBounds {
        mem_id: MemId,
        offset: u64,
        size: u64,
        extent: u64,
    },

    #[error("mem {0} is mapped read-only")]
    ReadOnly(MemId),

    #[error("stale buffer handle")]
    StaleBuffer,

    #[error("activation ring is full")]
    RingFull,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("peer answered with {0}")]
    Refused(i32),

    #[error("control channel I/O: {0}")]
    Io(#[from] io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("session destroyed")]
    Destroyed,

    #[error("cancelled by destroy")]
    Cancelled,

    #[error("timed out waiting for done")]
    Timeout,
}

impl NodeError {
    /// A negotiation refusal carrying `-EINVAL`.
    pub fn negotiation(reason: impl Into<String>) -> Self {
        NodeError::Negotiation {
            code: -libc::EINVAL,
            reason: reason.into(),
        }
    }

    /// A negotiation refusal carrying `-ENOTSUP`.
    pub fn unsupported(reason: impl Into<String>) -> Self {
        NodeError::Negotiation {
            code: -libc::ENOTSUP,
            reason: reason.into(),
        }
    }

    pub fn resource(what: impl Into<String>, source: io::Error) -> Self {
        NodeError::Resource {
            what: what.into(),
            source,
        }
    }

    /// Negative result code for a `done` reply.
    pub fn code(&self) -> i32 {
        match self {
            NodeError::ProtocolViolation(v) => v.code(),
            NodeError::Negotiation { code, .. } => *code,
            NodeError::Resource { source, .. } => {
                source.raw_os_error().map(|e| -e).unwrap_or(-libc::ENOMEM)
            }
            NodeError::OutOfBounds { .. } | NodeError::StaleBuffer | NodeError::Frame(_) => {
                -libc::EINVAL
            }
            NodeError::ReadOnly(_) => -libc::EACCES,
            NodeError::RingFull => -libc::ENOSPC,
            NodeError::Transport(_) | NodeError::Io(_) => -libc::EIO,
            NodeError::Refused(res) => *res,
            NodeError::Destroyed => -libc::EPIPE,
            NodeError::Cancelled => -libc::ECANCELED,
            NodeError::Timeout => -libc::ETIMEDOUT,
        }
    }

    /// Whether the session must end.
    pub fn is_fatal(&self) -> bool {
        match self {
            NodeError::ProtocolViolation(v) => v.is_fatal(),
            NodeError::Negotiation { .. }
            | NodeError::Resource { .. }
            | NodeError::OutOfBounds { .. }
            | NodeError::ReadOnly(_)
            | NodeError::StaleBuffer
            | NodeError::RingFull
            | NodeError::Refused(_) => false,
            NodeError::Transport(_)
            | NodeError::Io(_)
            | NodeError::Frame(_)
            | NodeError::Destroyed
            | NodeError::Cancelled
            | NodeError::Timeout => true,
        }
    }

    pub fn violation(&self) -> Option<Violation> {
        match self {
            NodeError::ProtocolViolation(v) => Some(*v),
            _ => None,
        }
    }
}

pub type Result<T, E = NodeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unadvertised_format_reports_minus_one() {
        let err = NodeError::from(Violation::FormatNotAdvertised {
            direction: Direction::Output,
            port_id: PortId(0),
        });
        assert_eq!(err.code(), -1);
        assert!(!err.is_fatal());
    }

    #[test]
    fn seq_violations_end_the_session() {
        let err = NodeError::from(Violation::UnknownSeq(Seq(9)));
        assert!(err.is_fatal());
        assert_eq!(err.code(), -libc::EINVAL);
        assert_eq!(err.violation(), Some(Violation::UnknownSeq(Seq(9))));
    }

    #[test]
    fn resource_errors_keep_os_code() {
        let err = NodeError::resource("mmap", io::Error::from_raw_os_error(libc::ENODEV));
        assert_eq!(err.code(), -libc::ENODEV);
        assert!(!err.is_fatal());
    }

    #[test]
    fn refusal_passes_peer_code_through() {
        assert_eq!(NodeError::Refused(-22).code(), -22);
        assert_eq!(NodeError::Cancelled.code(), -libc::ECANCELED);
    }
}
