//! A completion-driven micro-benchmark engine for one-sided RMA transports.
//!
//! The crate splits into three layers:
//!
//! - **Fabric** ([`fabric`], [`region`]): a software loopback fabric with
//!   registered memory regions, posted receives, explicit progress and a
//!   completion queue. It gives the layers above the same contract a
//!   hardware port would.
//! - **Connection** ([`descriptor`], [`exchange`], [`qp`], [`endpoint`]):
//!   the out-of-band rendezvous, the queue pair activation staircase and
//!   the connected endpoint with its completion engine.
//! - **Benchmark** ([`transport`], [`bench`], [`config`]): the transport
//!   abstraction, its reliable-connected write and tag/put
//!   implementations, and the size-sweep driver.
//!
//! A minimal in-process run:
//!
//! ```no_run
//! use rmabench::bench::{run_initiator, run_responder};
//! use rmabench::config::BenchConfig;
//! use rmabench::endpoint::{Endpoint, EndpointParams};
//! use rmabench::exchange::{ExchangeListener, Role, TcpExchanger};
//! use rmabench::fabric::Fabric;
//! use rmabench::transport::RcTransport;
//!
//! # fn main() -> Result<(), rmabench::BenchError> {
//! let cfg = BenchConfig::default();
//! let mtu = cfg.path_mtu();
//! let params = EndpointParams::from(&cfg);
//! let (pa, pb) = Fabric::open_pair(cfg.rx_depth);
//!
//! let listener = ExchangeListener::bind(cfg.port)?;
//! let responder = std::thread::spawn({
//!     let cfg = cfg.clone();
//!     move || -> Result<(), rmabench::BenchError> {
//!         let mut ep = Endpoint::new(pb, Role::Responder, params)?;
//!         ep.connect(listener.accept()?, mtu)?;
//!         run_responder(&mut RcTransport::new(ep), &cfg)
//!     }
//! });
//!
//! let mut ep = Endpoint::new(pa, Role::Initiator, params)?;
//! ep.connect(TcpExchanger::connect("127.0.0.1", cfg.port)?, mtu)?;
//! run_initiator(&mut RcTransport::new(ep), &cfg, &mut std::io::stdout())?;
//! # responder.join().unwrap()?;
//! # Ok(())
//! # }
//! ```

pub mod bench;
pub mod config;
pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod fabric;
pub mod gid;
pub mod qp;
pub mod region;
pub mod transport;
pub mod types;

pub use config::BenchConfig;
pub use descriptor::ConnDescriptor;
pub use endpoint::Endpoint;
pub use error::BenchError;
pub use exchange::Role;
pub use gid::Gid;
pub use qp::{PathMtu, Qp, QpState};
pub use region::{Permission, Region, RemoteRegion};
pub use transport::{RcTransport, TagRmaTransport, Transport};
