//! Connected queue pair and its state machine.
//!
//! A queue pair starts unusable and is activated by a fixed staircase of
//! transitions: `Uninit -> Init -> ReceiveReady -> SendReady`. The first
//! step applies local attributes only, the second consumes the peer's
//! connection descriptor and opens the receive direction, and the third
//! arms the send direction with the timeout and retry profile. Skipping or
//! reordering a step is an error, and data operations are gated on the
//! state they require.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::descriptor::ConnDescriptor;
use crate::fabric::{FabricPort, PostError, Wc};
use crate::region::RegionMem;
use crate::types::*;

/// Transport retry count for unacknowledged operations.
pub const RETRY_COUNT: u8 = 7;
/// Retry count for receiver-not-ready conditions. 7 means infinite.
pub const RNR_RETRY: u8 = 7;
/// Local ack timeout exponent (4.096 us * 2^14).
pub const TIMEOUT_EXP: u8 = 14;
/// Minimum receiver-not-ready back-off timer code.
pub const MIN_RNR_TIMER: u8 = 12;
/// Maximum outstanding inbound read/atomic operations.
pub const MAX_RD_ATOMIC: u8 = 1;
/// Largest payload that may travel inline in the work request itself.
pub const MAX_INLINE_DATA: u32 = 220;

static NEXT_QPN: AtomicU32 = AtomicU32::new(0x1000);

/// Queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    /// Freshly created, nothing may be posted.
    Uninit,
    /// Local attributes applied; receives may be posted but will not
    /// complete yet.
    Init,
    /// Remote parameters applied; inbound operations flow.
    ReceiveReady,
    /// Fully connected; outbound operations flow.
    SendReady,
}

impl std::fmt::Display for QpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QpState::Uninit => "UNINIT",
            QpState::Init => "INIT",
            QpState::ReceiveReady => "RECEIVE_READY",
            QpState::SendReady => "SEND_READY",
        };
        f.write_str(s)
    }
}

/// Path MTU of a connected queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathMtu {
    Mtu256,
    Mtu512,
    #[default]
    Mtu1024,
    Mtu2048,
    Mtu4096,
}

impl PathMtu {
    /// Map a byte count to an MTU code. Returns `None` for anything other
    /// than the five defined sizes.
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            256 => Some(Self::Mtu256),
            512 => Some(Self::Mtu512),
            1024 => Some(Self::Mtu1024),
            2048 => Some(Self::Mtu2048),
            4096 => Some(Self::Mtu4096),
            _ => None,
        }
    }

    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            Self::Mtu256 => 256,
            Self::Mtu512 => 512,
            Self::Mtu1024 => 1024,
            Self::Mtu2048 => 2048,
            Self::Mtu4096 => 4096,
        }
    }
}

/// Queue pair capacity attributes.
#[derive(Debug, Clone, Copy)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_inline_data: u32,
}

impl Default for QpCaps {
    fn default() -> Self {
        Self {
            max_send_wr: 100,
            max_recv_wr: 100,
            max_inline_data: MAX_INLINE_DATA,
        }
    }
}

/// Error in a queue pair state transition.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    /// The requested transition does not start from the current state.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: QpState, to: QpState },

    /// The transition parameters were refused.
    #[error("transition rejected: {0}")]
    Rejected(&'static str),
}

/// A connected (reliable) queue pair bound to one fabric port.
pub struct Qp {
    port: FabricPort,
    state: QpState,
    caps: QpCaps,
    qpn: Qpn,
    psn: Psn,
    mtu: PathMtu,
    global: bool,
    remote: Option<ConnDescriptor>,
}

impl Qp {
    /// Create a queue pair on the given port. The pair starts in the
    /// [`QpState::Uninit`] state.
    pub fn new(port: FabricPort, caps: QpCaps) -> Result<Self, StateTransitionError> {
        if caps.max_inline_data > MAX_INLINE_DATA {
            return Err(StateTransitionError::Rejected("inline capacity too large"));
        }
        if caps.max_send_wr == 0 || caps.max_recv_wr == 0 {
            return Err(StateTransitionError::Rejected("zero queue depth"));
        }
        Ok(Self {
            port,
            state: QpState::Uninit,
            caps,
            qpn: NEXT_QPN.fetch_add(1, Ordering::Relaxed),
            psn: initial_psn(),
            mtu: PathMtu::default(),
            global: false,
            remote: None,
        })
    }

    #[inline]
    pub fn state(&self) -> QpState {
        self.state
    }

    #[inline]
    pub fn qpn(&self) -> Qpn {
        self.qpn
    }

    #[inline]
    pub fn psn(&self) -> Psn {
        self.psn
    }

    #[inline]
    pub fn caps(&self) -> QpCaps {
        self.caps
    }

    /// The remote descriptor, once connected.
    #[inline]
    pub fn remote(&self) -> Option<&ConnDescriptor> {
        self.remote.as_ref()
    }

    /// The port this queue pair is bound to.
    #[inline]
    pub fn port(&self) -> &FabricPort {
        &self.port
    }

    /// Mutable port access, for region registration before connecting.
    #[inline]
    pub fn port_mut(&mut self) -> &mut FabricPort {
        &mut self.port
    }

    /// Drive the full activation staircase against the peer's descriptor.
    pub fn connect(
        &mut self,
        remote: &ConnDescriptor,
        mtu: PathMtu,
    ) -> Result<(), StateTransitionError> {
        self.uninit_to_init()?;
        self.init_to_receive_ready(remote, mtu)?;
        self.receive_ready_to_send_ready()
    }

    /// Apply local attributes: port binding and access flags.
    fn uninit_to_init(&mut self) -> Result<(), StateTransitionError> {
        if self.state != QpState::Uninit {
            return Err(StateTransitionError::InvalidTransition {
                from: self.state,
                to: QpState::Init,
            });
        }
        self.state = QpState::Init;
        Ok(())
    }

    /// Apply the peer's parameters and open the receive direction. The path
    /// is routed globally exactly when the peer's GID is non-zero.
    fn init_to_receive_ready(
        &mut self,
        remote: &ConnDescriptor,
        mtu: PathMtu,
    ) -> Result<(), StateTransitionError> {
        if self.state != QpState::Init {
            return Err(StateTransitionError::InvalidTransition {
                from: self.state,
                to: QpState::ReceiveReady,
            });
        }
        if remote.qpn == 0 {
            return Err(StateTransitionError::Rejected("zero remote QPN"));
        }
        if remote.lid == 0 && remote.gid.is_zero() {
            return Err(StateTransitionError::Rejected("no addressable path"));
        }
        self.remote = Some(*remote);
        self.mtu = mtu;
        self.global = !remote.gid.is_zero();
        self.state = QpState::ReceiveReady;
        Ok(())
    }

    /// Arm the send direction with the timeout and retry profile
    /// (`RETRY_COUNT`, `RNR_RETRY`, `TIMEOUT_EXP`, `MAX_RD_ATOMIC`).
    fn receive_ready_to_send_ready(&mut self) -> Result<(), StateTransitionError> {
        if self.state != QpState::ReceiveReady {
            return Err(StateTransitionError::InvalidTransition {
                from: self.state,
                to: QpState::SendReady,
            });
        }
        self.state = QpState::SendReady;
        Ok(())
    }

    /// Post a receive. Allowed from [`QpState::Init`] onwards; inbound work
    /// only flows once the pair reaches [`QpState::ReceiveReady`].
    pub fn post_recv(
        &mut self,
        wr_id: WrId,
        mem: RegionMem,
        offset: usize,
        len: usize,
    ) -> Result<(), PostError> {
        if self.state == QpState::Uninit {
            return Err(PostError::NotReady);
        }
        self.port.post_recv(wr_id, mem, offset, len)
    }

    /// Post a two-sided send. Requires [`QpState::SendReady`].
    pub fn post_send(
        &mut self,
        wr_id: WrId,
        mem: RegionMem,
        offset: usize,
        len: usize,
        signaled: bool,
    ) -> Result<(), PostError> {
        if self.state != QpState::SendReady {
            return Err(PostError::NotReady);
        }
        self.port.post_send(wr_id, mem, offset, len, signaled)
    }

    /// Post a one-sided write to the peer's memory. Requires
    /// [`QpState::SendReady`].
    #[allow(clippy::too_many_arguments)]
    pub fn post_write(
        &mut self,
        wr_id: WrId,
        mem: RegionMem,
        offset: usize,
        len: usize,
        raddr: u64,
        rkey: RKey,
        imm: Option<ImmData>,
        signaled: bool,
    ) -> Result<(), PostError> {
        if self.state != QpState::SendReady {
            return Err(PostError::NotReady);
        }
        self.port
            .post_write(wr_id, mem, offset, len, raddr, rkey, imm, signaled)
    }

    /// Make progress and pop up to `n` completions.
    #[inline]
    pub fn poll(&mut self, n: usize) -> Vec<Wc> {
        self.port.poll(n)
    }

    /// Block until every posted operation has been processed by the peer.
    #[inline]
    pub fn flush(&mut self) -> Result<(), PostError> {
        self.port.flush()
    }
}

/// Initial packet sequence number, randomized per queue pair from the
/// clock's sub-second fraction and truncated to the 24-bit PSN space.
fn initial_psn() -> Psn {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    nanos & 0xffffff
}
