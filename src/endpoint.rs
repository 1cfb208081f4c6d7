//! Connected endpoint and completion engine.
//!
//! An [`Endpoint`] bundles a queue pair with its two registered regions: a
//! small control region for two-sided acknowledgements and a data region of
//! `depth * max_msg` bytes that the peer writes into directly. It keeps the
//! receive queue stocked, matches completions against the closed work
//! request tag space, and exposes the slot-ring posting operations the
//! transports are built on.

use thiserror::Error;

use crate::config::BenchConfig;
use crate::descriptor::ConnDescriptor;
use crate::error::BenchError;
use crate::exchange::{Role, TcpExchanger};
use crate::fabric::{FabricPort, PostError, WcStatus};
use crate::qp::{PathMtu, Qp, QpCaps};
use crate::region::{Permission, Region, RemoteRegion};
use crate::types::*;

/// Control region size, covering acknowledgements with room to spare.
pub const CTRL_SIZE: usize = 4096;

/// Length of a control acknowledgement message.
const ACK_LEN: usize = 4;

/// Completions drained per poll call.
pub const WC_BATCH: usize = 10;

/// The closed space of work request identifiers an endpoint posts with.
/// Anything a poll returns outside this space is a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum WrTag {
    /// A posted receive (two-sided ack or write-with-immediate boundary).
    Recv = 1,
    /// An outbound operation: data write or control send.
    Send = 2,
}

impl WrTag {
    #[inline]
    pub fn from_wr_id(wr_id: WrId) -> Option<Self> {
        match wr_id {
            1 => Some(Self::Recv),
            2 => Some(Self::Send),
            _ => None,
        }
    }
}

/// Completion processing error type.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// An operation completed with a failure status.
    #[error("work request {wr_id} failed: {status}")]
    Failed { wr_id: WrId, status: WcStatus },

    /// A completion carried an identifier outside the posted tag space.
    #[error("completion with unknown work request id {0}")]
    UnknownId(WrId),

    #[error(transparent)]
    Post(#[from] PostError),
}

/// Sizing parameters for an endpoint, derived from the run configuration.
#[derive(Debug, Clone, Copy)]
pub struct EndpointParams {
    /// Outstanding operations per batch, also the slot count.
    pub depth: usize,
    /// Receives kept posted.
    pub rx_depth: usize,
    /// Largest message a slot must hold.
    pub max_msg: usize,
}

impl From<&BenchConfig> for EndpointParams {
    fn from(cfg: &BenchConfig) -> Self {
        Self {
            depth: cfg.depth,
            rx_depth: cfg.rx_depth,
            max_msg: cfg.max_size,
        }
    }
}

/// What one completion-engine pass observed.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchOutcome {
    /// Receive-role completions: acks or write boundaries.
    pub recv: usize,
    /// Send-role completions: signaled writes or control sends.
    pub send: usize,
}

/// A connected endpoint: queue pair plus registered control and data
/// regions.
pub struct Endpoint {
    qp: Qp,
    ctrl: Region,
    data: Region,
    depth: usize,
    rx_depth: usize,
    max_msg: usize,
    /// Receives currently posted.
    routs: usize,
    remote: Option<RemoteRegion>,
}

impl Endpoint {
    /// Build an endpoint on the given port. The control region is local
    /// only; the data region grants the peer write access. Fill patterns
    /// differ per role so that landed data is distinguishable from the
    /// receiver's own.
    pub fn new(
        port: FabricPort,
        role: Role,
        params: EndpointParams,
    ) -> Result<Self, BenchError> {
        let mut port = port;
        let ctrl = Region::allocate(
            &mut port,
            CTRL_SIZE,
            Permission::LOCAL_WRITE,
            0x7b + role.index(),
        )?;
        let data = Region::allocate(
            &mut port,
            params.depth * params.max_msg,
            Permission::default(),
            0x3f + role.index(),
        )?;
        let caps = QpCaps {
            max_send_wr: params.depth as u32,
            max_recv_wr: params.rx_depth as u32,
            ..QpCaps::default()
        };
        let qp = Qp::new(port, caps)?;
        Ok(Self {
            qp,
            ctrl,
            data,
            depth: params.depth,
            rx_depth: params.rx_depth,
            max_msg: params.max_msg,
            routs: 0,
            remote: None,
        })
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn max_msg(&self) -> usize {
        self.max_msg
    }

    #[inline]
    pub fn data(&self) -> &Region {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut Region {
        &mut self.data
    }

    /// The peer's data region, once connected.
    #[inline]
    pub fn remote(&self) -> Option<RemoteRegion> {
        self.remote
    }

    /// The local half of the descriptor exchange.
    pub fn descriptor(&self) -> ConnDescriptor {
        ConnDescriptor {
            lid: self.qp.port().lid(),
            qpn: self.qp.qpn(),
            psn: self.qp.psn(),
            rkey: self.data.rkey(),
            addr: self.data.addr(),
            gid: self.qp.port().gid(),
        }
    }

    /// Run the descriptor exchange and activate the connection. The
    /// responder side activates before replying; both sides leave with the
    /// receive queue stocked.
    pub fn connect(
        &mut self,
        ex: TcpExchanger,
        mtu: PathMtu,
    ) -> Result<(), BenchError> {
        let local = self.descriptor();
        let qp = &mut self.qp;
        let remote = ex.exchange(&local, |peer| qp.connect(peer, mtu))?;
        self.remote = Some(RemoteRegion::new(remote.addr, self.data.len(), remote.rkey));
        self.routs = self.post_recv(self.rx_depth)?;
        if self.routs < self.rx_depth {
            // Fewer receives than the configured depth means the peer's
            // sends could be dropped later. Refuse to start.
            return Err(PostError::RecvQueueFull(self.routs).into());
        }
        Ok(())
    }

    /// Post up to `n` receives on the control region. Returns how many were
    /// actually posted; stops early when the receive queue is at capacity.
    pub fn post_recv(&mut self, n: usize) -> Result<usize, PostError> {
        for i in 0..n {
            match self
                .qp
                .post_recv(WrTag::Recv as WrId, self.ctrl.mem(), 0, CTRL_SIZE)
            {
                Ok(()) => {}
                Err(PostError::RecvQueueFull(_)) => return Ok(i),
                Err(e) => return Err(e),
            }
        }
        Ok(n)
    }

    /// Post a one-sided write of `len` bytes from slot `slot` of the local
    /// data region to the same slot of the peer's. A signaled write also
    /// carries immediate data, marking a batch boundary the peer can
    /// observe.
    pub fn post_write(&mut self, slot: usize, len: usize, signal: bool) -> Result<(), PostError> {
        let remote = self.remote.ok_or(PostError::NotReady)?;
        let offset = slot * self.max_msg;
        self.qp.post_write(
            WrTag::Send as WrId,
            self.data.mem(),
            offset,
            len,
            remote.at(offset),
            remote.rkey,
            signal.then_some(1),
            signal,
        )
    }

    /// Post a two-sided control acknowledgement.
    pub fn post_send(&mut self) -> Result<(), PostError> {
        self.qp
            .post_send(WrTag::Send as WrId, self.ctrl.mem(), 0, ACK_LEN, true)
    }

    /// One pass of the completion engine: poll up to [`WC_BATCH`] entries,
    /// match each against the tag space, and re-stock the receive queue
    /// when it runs low. Any failed completion aborts the pass.
    pub fn wait_completions(&mut self) -> Result<BatchOutcome, CompletionError> {
        let mut outcome = BatchOutcome::default();
        let wcs = self.qp.poll(WC_BATCH);
        if wcs.is_empty() && self.qp.port().link_down() {
            return Err(CompletionError::Post(PostError::LinkDown));
        }
        for wc in wcs {
            if let Err(status) = wc.ok() {
                log::error!("work request {} failed: {}", wc.wr_id, status);
                return Err(CompletionError::Failed {
                    wr_id: wc.wr_id,
                    status,
                });
            }
            match WrTag::from_wr_id(wc.wr_id) {
                Some(WrTag::Recv) => {
                    outcome.recv += 1;
                    self.routs -= 1;
                }
                Some(WrTag::Send) => outcome.send += 1,
                None => return Err(CompletionError::UnknownId(wc.wr_id)),
            }
        }
        if self.routs <= 1 {
            self.routs += self.post_recv(self.rx_depth - self.routs)?;
        }
        Ok(outcome)
    }

    /// Block until the peer has processed everything posted so far.
    pub fn flush(&mut self) -> Result<(), CompletionError> {
        self.qp.flush().map_err(CompletionError::from)
    }
}
