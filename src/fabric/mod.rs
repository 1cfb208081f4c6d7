//! Software loopback fabric.
//!
//! A [`Fabric`] joins two in-process ports with a pair of FIFO links. Each
//! port owns a registration table, a posted-receive queue and a completion
//! queue, and makes progress only when its owner calls [`FabricPort::progress`]
//! (directly or through [`FabricPort::poll`]). Delivery preserves submission
//! order, remote access is checked against registered keys and permissions,
//! and a flush is resolved by a ping that the peer's progress function
//! answers. This gives the connection and completion layers above the same
//! contract a hardware port would, without requiring one.

mod port;

pub use port::{Fabric, FabricPort};

use thiserror::Error;

use crate::types::*;

/// Work completion opcode: which kind of operation completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    /// Two-sided send (requester side).
    Send,
    /// One-sided write (requester side).
    Write,
    /// Two-sided receive.
    Recv,
    /// Receive consumed by a write with immediate data.
    RecvImm,
    /// Tag-matched receive.
    TagRecv,
}

/// Work completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WcStatus {
    #[error("success")]
    Success,

    /// A local buffer was too small for the inbound payload.
    #[error("local protection error")]
    LocalProtection,

    /// The remote key, bounds, or permissions check failed on the peer.
    #[error("remote access error")]
    RemoteAccess,

    /// The operation was flushed because the link went down.
    #[error("work request flushed")]
    Flushed,
}

/// A work completion entry.
#[derive(Debug, Clone, Copy)]
pub struct Wc {
    /// The identifier the operation was posted with (receiver-chosen for
    /// inbound completions).
    pub wr_id: WrId,
    pub opcode: WcOpcode,
    pub status: WcStatus,
    /// Payload length in bytes. Zero when the status is not success.
    pub bytes: usize,
    /// Immediate data, present only on [`WcOpcode::RecvImm`] completions.
    pub imm: Option<ImmData>,
}

impl Wc {
    /// Get the number of bytes processed if the completion is successful,
    /// the failure status otherwise.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        match self.status {
            WcStatus::Success => Ok(self.bytes),
            e => Err(e),
        }
    }
}

/// Error posting an operation to a port.
#[derive(Debug, Error)]
pub enum PostError {
    /// The posted-receive queue is at capacity.
    #[error("receive queue full (capacity {0})")]
    RecvQueueFull(usize),

    /// The peer port has been dropped.
    #[error("link down")]
    LinkDown,

    /// The local buffer range is outside the registered region.
    #[error("local buffer range out of bounds")]
    OutOfBounds,

    /// The connection is not in a state that allows this operation.
    #[error("connection not ready for this operation")]
    NotReady,
}

/// What travels over a link. One packet per posted operation, plus the
/// flush handshake and write acknowledgements.
pub(crate) enum Packet {
    Send {
        data: Vec<u8>,
        imm: Option<ImmData>,
    },
    Write {
        wr_id: WrId,
        raddr: u64,
        rkey: RKey,
        data: Vec<u8>,
        imm: Option<ImmData>,
        signaled: bool,
    },
    TagSend {
        tag: u64,
        data: Vec<u8>,
    },
    /// Requester-side completion for a write, carrying the outcome of the
    /// peer's access checks.
    WriteAck {
        wr_id: WrId,
        status: WcStatus,
        bytes: usize,
    },
    FlushPing {
        token: u64,
    },
    FlushAck {
        token: u64,
    },
}
