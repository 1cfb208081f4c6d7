//! Out-of-band rendezvous.
//!
//! Before any fabric traffic can flow, the two peers trade connection
//! descriptors over an ordinary TCP socket. The protocol is a fixed
//! four-step dance: the initiator sends its record first and acknowledges
//! last, and the responder activates its own connection *before* replying,
//! so that by the time the initiator sees the response the responder can
//! already receive. The same module also provides an in-process exchanger
//! for transports that bind a two-rank group over channels instead of
//! sockets.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, Sender};

use thiserror::Error;

use crate::descriptor::ConnDescriptor;
use crate::qp::StateTransitionError;

/// The acknowledgement closing the descriptor exchange, NUL included.
const DONE_ACK: &[u8; 5] = b"done\0";

/// Which side of the rendezvous this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dials the responder and drives the benchmark.
    Initiator,
    /// Listens, serves inbound traffic, and acknowledges batches.
    Responder,
}

impl Role {
    /// A small per-role offset, used to derive distinct buffer fill
    /// patterns on the two sides.
    #[inline]
    pub fn index(self) -> u8 {
        match self {
            Role::Initiator => 0,
            Role::Responder => 1,
        }
    }
}

/// Rendezvous error type.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The peer address did not resolve to anything connectable.
    #[error("cannot resolve peer: {0}")]
    Resolve(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer's record failed to decode.
    #[error("malformed descriptor record")]
    Malformed,

    /// The initiator never acknowledged the exchange.
    #[error("missing or corrupt exchange acknowledgement")]
    MissingAck,

    /// The in-process peer hung up.
    #[error("exchange channel closed")]
    ChannelClosed,

    /// The local connection could not be activated during the exchange.
    #[error(transparent)]
    NotReady(#[from] StateTransitionError),
}

/// Listening side of the TCP rendezvous.
pub struct ExchangeListener {
    listener: TcpListener,
}

impl ExchangeListener {
    /// Bind the rendezvous port on all interfaces. Port 0 binds an
    /// ephemeral port, retrievable via [`ExchangeListener::local_port`].
    pub fn bind(port: u16) -> Result<Self, ExchangeError> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        Ok(Self { listener })
    }

    /// The actually bound port.
    pub fn local_port(&self) -> Result<u16, ExchangeError> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accept one inbound rendezvous, yielding a responder-role exchanger.
    pub fn accept(&self) -> Result<TcpExchanger, ExchangeError> {
        let (stream, _) = self.listener.accept()?;
        Ok(TcpExchanger {
            stream,
            role: Role::Responder,
        })
    }
}

/// One-shot descriptor exchange over a TCP stream.
pub struct TcpExchanger {
    stream: TcpStream,
    role: Role,
}

impl TcpExchanger {
    /// Dial the responder, yielding an initiator-role exchanger.
    pub fn connect(host: &str, port: u16) -> Result<Self, ExchangeError> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| ExchangeError::Resolve(format!("{host}:{port}: {e}")))?;
        let mut last = None;
        for addr in addrs {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    return Ok(Self {
                        stream,
                        role: Role::Initiator,
                    })
                }
                Err(e) => last = Some(e),
            }
        }
        Err(match last {
            Some(e) => ExchangeError::Io(e),
            None => ExchangeError::Resolve(format!("{host}:{port}: no addresses")),
        })
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Run the exchange. `ready` is invoked with the peer's descriptor at
    /// the point where the local connection must be activated: before the
    /// reply on the responder, after the reply arrives on the initiator.
    /// Consumes the exchanger; the socket closes when it drops.
    pub fn exchange(
        mut self,
        local: &ConnDescriptor,
        ready: impl FnOnce(&ConnDescriptor) -> Result<(), StateTransitionError>,
    ) -> Result<ConnDescriptor, ExchangeError> {
        match self.role {
            Role::Initiator => {
                self.write_record(local)?;
                let remote = self.read_record()?;
                ready(&remote)?;
                self.stream.write_all(DONE_ACK)?;
                Ok(remote)
            }
            Role::Responder => {
                let remote = self.read_record()?;
                // Activate before replying: the initiator may post the
                // moment it has our record.
                ready(&remote)?;
                self.write_record(local)?;
                let mut ack = [0u8; DONE_ACK.len()];
                self.stream.read_exact(&mut ack)?;
                if &ack != DONE_ACK {
                    return Err(ExchangeError::MissingAck);
                }
                Ok(remote)
            }
        }
    }

    fn write_record(&mut self, desc: &ConnDescriptor) -> Result<(), ExchangeError> {
        self.stream.write_all(desc.to_wire().as_bytes())?;
        Ok(())
    }

    fn read_record(&mut self) -> Result<ConnDescriptor, ExchangeError> {
        let mut raw = [0u8; ConnDescriptor::WIRE_LEN];
        self.stream.read_exact(&mut raw)?;
        let s = std::str::from_utf8(&raw).map_err(|_| ExchangeError::Malformed)?;
        ConnDescriptor::from_wire(s).ok_or(ExchangeError::Malformed)
    }
}

/// An in-process two-rank group bound over channels.
///
/// Transports that exchange opaque blobs (addresses, packed keys) and
/// synchronize with barriers use this instead of the socket rendezvous.
/// Rank 0 is the initiator.
pub struct PairExchanger {
    rank: usize,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl PairExchanger {
    /// Create a bound pair. The first element is rank 0.
    pub fn pair() -> (Self, Self) {
        let (tx0, rx1) = mpsc::channel();
        let (tx1, rx0) = mpsc::channel();
        (
            Self {
                rank: 0,
                tx: tx0,
                rx: rx0,
            },
            Self {
                rank: 1,
                tx: tx1,
                rx: rx1,
            },
        )
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn role(&self) -> Role {
        if self.rank == 0 {
            Role::Initiator
        } else {
            Role::Responder
        }
    }

    pub fn send_blob(&self, blob: &[u8]) -> Result<(), ExchangeError> {
        self.tx
            .send(blob.to_vec())
            .map_err(|_| ExchangeError::ChannelClosed)
    }

    pub fn recv_blob(&self) -> Result<Vec<u8>, ExchangeError> {
        self.rx.recv().map_err(|_| ExchangeError::ChannelClosed)
    }

    /// Trade one blob with the peer, rank 0 sending first.
    pub fn exchange_blob(&self, blob: &[u8]) -> Result<Vec<u8>, ExchangeError> {
        if self.rank == 0 {
            self.send_blob(blob)?;
            self.recv_blob()
        } else {
            let got = self.recv_blob()?;
            self.send_blob(blob)?;
            Ok(got)
        }
    }

    /// Block until both ranks arrive.
    pub fn barrier(&self) -> Result<(), ExchangeError> {
        self.exchange_blob(&[])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gid::Gid;

    fn desc(qpn: u32) -> ConnDescriptor {
        ConnDescriptor {
            lid: 1,
            qpn,
            psn: 0x10,
            rkey: 0x20,
            addr: 0x30,
            gid: Gid::default(),
        }
    }

    #[test]
    fn test_tcp_exchange_with_ack() {
        let listener = ExchangeListener::bind(0).unwrap();
        let port = listener.local_port().unwrap();

        let server = std::thread::spawn(move || {
            let ex = listener.accept().unwrap();
            let mut activated_before_reply = false;
            let remote = ex
                .exchange(&desc(2), |peer| {
                    assert_eq!(peer.qpn, 1);
                    activated_before_reply = true;
                    Ok(())
                })
                .unwrap();
            assert!(activated_before_reply);
            remote
        });

        let ex = TcpExchanger::connect("127.0.0.1", port).unwrap();
        let remote = ex.exchange(&desc(1), |_| Ok(())).unwrap();
        assert_eq!(remote.qpn, 2);
        assert_eq!(server.join().unwrap().qpn, 1);
    }

    #[test]
    fn test_truncated_record_is_an_error() {
        let listener = ExchangeListener::bind(0).unwrap();
        let port = listener.local_port().unwrap();

        let server = std::thread::spawn(move || {
            let ex = listener.accept().unwrap();
            ex.exchange(&desc(2), |_| Ok(()))
        });

        // Write half a record and hang up.
        let mut raw = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        raw.write_all(&[b'0'; 40]).unwrap();
        drop(raw);

        assert!(matches!(
            server.join().unwrap(),
            Err(ExchangeError::Io(_))
        ));
    }

    #[test]
    fn test_responder_activation_failure_aborts() {
        let listener = ExchangeListener::bind(0).unwrap();
        let port = listener.local_port().unwrap();

        let server = std::thread::spawn(move || {
            let ex = listener.accept().unwrap();
            ex.exchange(&desc(2), |_| {
                Err(StateTransitionError::Rejected("test refusal"))
            })
        });

        let ex = TcpExchanger::connect("127.0.0.1", port).unwrap();
        // The responder aborts before replying, so the initiator sees EOF.
        let got = ex.exchange(&desc(1), |_| Ok(()));
        assert!(got.is_err());
        assert!(matches!(
            server.join().unwrap(),
            Err(ExchangeError::NotReady(_))
        ));
    }

    #[test]
    fn test_pair_blobs_and_barrier() {
        let (a, b) = PairExchanger::pair();
        assert_eq!(a.role(), Role::Initiator);
        let h = std::thread::spawn(move || {
            let got = b.exchange_blob(b"from-b").unwrap();
            assert_eq!(got, b"from-a");
            b.barrier().unwrap();
        });
        let got = a.exchange_blob(b"from-a").unwrap();
        assert_eq!(got, b"from-b");
        a.barrier().unwrap();
        h.join().unwrap();
    }
}
