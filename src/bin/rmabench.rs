//! Benchmark runner.
//!
//! Hosts both sides of a run: the responder serves on a background thread
//! while the initiator sweeps message sizes and reports one line per
//! measured size on stdout. The descriptor rendezvous for the
//! reliable-connected transport goes over a real TCP socket, so the
//! rendezvous host and port are configurable even though the fabric itself
//! is an in-process pair.

use std::process;

use clap::{Parser, ValueEnum};

use rmabench::bench::{run_initiator, run_responder};
use rmabench::config::BenchConfig;
use rmabench::endpoint::{Endpoint, EndpointParams};
use rmabench::exchange::{ExchangeListener, PairExchanger, Role, TcpExchanger};
use rmabench::fabric::Fabric;
use rmabench::transport::{RcTransport, TagRmaTransport};
use rmabench::BenchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// Reliable-connected one-sided writes, throughput in GiB/s.
    Rc,
    /// Tagged puts settled by flush, mean latency in microseconds.
    Tag,
}

#[derive(Parser, Debug)]
#[command(name = "rmabench", about = "One-sided RMA micro-benchmark", version)]
struct Cli {
    /// Rendezvous host to dial.
    #[arg(default_value = "127.0.0.1")]
    host: String,

    /// Which transport to measure.
    #[arg(long, value_enum, default_value_t = TransportKind::Rc)]
    transport: TransportKind,

    /// Load defaults from a TOML file before applying flags.
    #[arg(long, value_name = "FILE")]
    config: Option<String>,

    /// TCP rendezvous port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Operations per message size.
    #[arg(short = 'n', long)]
    iters: Option<usize>,

    /// Outstanding operations per batch.
    #[arg(short, long)]
    depth: Option<usize>,

    /// Receives kept posted on each side.
    #[arg(short, long)]
    rx_depth: Option<usize>,

    /// Largest message size in bytes.
    #[arg(short, long)]
    size: Option<usize>,

    /// Path MTU in bytes (256, 512, 1024, 2048 or 4096).
    #[arg(short, long)]
    mtu: Option<usize>,

    /// Wait for completion events instead of busy-polling. The loopback
    /// fabric resolves both the same way.
    #[arg(short, long)]
    events: bool,

    /// GID index for globally routed paths. Loopback links are locally
    /// addressed, so this only affects the exchanged descriptor.
    #[arg(short, long)]
    gid_index: Option<u8>,
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("rmabench: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), BenchError> {
    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(path) => BenchConfig::load_toml(path)?,
        None => BenchConfig::default(),
    };
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(iters) = cli.iters {
        cfg.iters = iters;
    }
    if let Some(depth) = cli.depth {
        cfg.depth = depth;
    }
    if let Some(rx_depth) = cli.rx_depth {
        cfg.rx_depth = rx_depth;
    }
    if let Some(size) = cli.size {
        cfg.max_size = size;
    }
    if let Some(mtu) = cli.mtu {
        cfg.mtu = mtu;
    }
    cfg.validate()?;

    if cli.events {
        log::debug!("event waiting requested; using the polling path");
    }
    if let Some(idx) = cli.gid_index {
        log::debug!("gid index {idx} requested; loopback paths stay local");
    }
    log::info!(
        "{:?} transport: iters={} depth={} rx_depth={} max_size={} mtu={}",
        cli.transport,
        cfg.iters,
        cfg.depth,
        cfg.rx_depth,
        cfg.max_size,
        cfg.mtu
    );

    match cli.transport {
        TransportKind::Rc => run_rc(&cli, &cfg),
        TransportKind::Tag => run_tag(&cfg),
    }
}

fn run_rc(cli: &Cli, cfg: &BenchConfig) -> Result<(), BenchError> {
    let mtu = cfg.path_mtu();
    let params = EndpointParams::from(cfg);
    let (pa, pb) = Fabric::open_pair(cfg.rx_depth);

    let listener = ExchangeListener::bind(cfg.port)?;
    let responder = std::thread::spawn({
        let cfg = cfg.clone();
        move || -> Result<(), BenchError> {
            let mut ep = Endpoint::new(pb, Role::Responder, params)?;
            ep.connect(listener.accept()?, mtu)?;
            run_responder(&mut RcTransport::new(ep), &cfg)
        }
    });

    let mut ep = Endpoint::new(pa, Role::Initiator, params)?;
    ep.connect(TcpExchanger::connect(&cli.host, cfg.port)?, mtu)?;
    let result = run_initiator(&mut RcTransport::new(ep), cfg, &mut std::io::stdout().lock());

    join_responder(responder)?;
    result
}

fn run_tag(cfg: &BenchConfig) -> Result<(), BenchError> {
    let (pa, pb) = Fabric::open_pair(cfg.rx_depth);
    let (ga, gb) = PairExchanger::pair();

    let responder = std::thread::spawn({
        let cfg = cfg.clone();
        move || -> Result<(), BenchError> {
            let mut t = TagRmaTransport::new(pb, gb, cfg.max_size)?;
            t.establish()?;
            run_responder(&mut t, &cfg)
        }
    });

    let mut t = TagRmaTransport::new(pa, ga, cfg.max_size)?;
    t.establish()?;
    let result = run_initiator(&mut t, cfg, &mut std::io::stdout().lock());

    join_responder(responder)?;
    result
}

fn join_responder(
    handle: std::thread::JoinHandle<Result<(), BenchError>>,
) -> Result<(), BenchError> {
    match handle.join() {
        Ok(r) => r,
        Err(_) => Err(BenchError::Config("responder thread panicked".into())),
    }
}
