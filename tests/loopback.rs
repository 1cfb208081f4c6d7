//! End-to-end sweeps over the in-process fabric, exercising the rendezvous,
//! the connection staircase, both transports and the report format.

use std::thread;

use anyhow::Result;

use rmabench::bench::{run_initiator, run_responder};
use rmabench::config::BenchConfig;
use rmabench::endpoint::{Endpoint, EndpointParams};
use rmabench::exchange::{ExchangeListener, PairExchanger, Role, TcpExchanger};
use rmabench::fabric::Fabric;
use rmabench::transport::{RcTransport, TagRmaTransport};
use rmabench::{BenchError, PathMtu};

fn small_cfg() -> BenchConfig {
    BenchConfig {
        iters: 4,
        depth: 2,
        rx_depth: 8,
        max_size: 8,
        ..Default::default()
    }
}

/// Connect a pair of endpoints over a real TCP rendezvous on an ephemeral
/// port, returning both sides.
fn connect_endpoints(cfg: &BenchConfig) -> Result<(Endpoint, Endpoint)> {
    let params = EndpointParams::from(cfg);
    let mtu = cfg.path_mtu();
    let (pa, pb) = Fabric::open_pair(cfg.rx_depth);

    let listener = ExchangeListener::bind(0)?;
    let port = listener.local_port()?;
    let responder = thread::spawn(move || -> Result<Endpoint, BenchError> {
        let mut ep = Endpoint::new(pb, Role::Responder, params)?;
        ep.connect(listener.accept()?, mtu)?;
        Ok(ep)
    });

    let mut ep = Endpoint::new(pa, Role::Initiator, params)?;
    ep.connect(TcpExchanger::connect("127.0.0.1", port)?, mtu)?;
    let peer = responder.join().expect("responder panicked")?;
    Ok((ep, peer))
}

#[test]
fn rc_sweep_reports_every_size() -> Result<()> {
    let cfg = small_cfg();
    let (a, b) = connect_endpoints(&cfg)?;

    let responder = thread::spawn({
        let cfg = cfg.clone();
        move || -> Result<RcTransport, BenchError> {
            let mut t = RcTransport::new(b);
            run_responder(&mut t, &cfg)?;
            Ok(t)
        }
    });

    let mut out = Vec::new();
    run_initiator(&mut RcTransport::new(a), &cfg, &mut out)?;
    let t = responder.join().expect("responder panicked")?;

    let report = String::from_utf8(out)?;
    let lines: Vec<&str> = report.lines().collect();
    assert_eq!(lines.len(), 4, "sizes 1, 2, 4, 8 each get one line");
    for (line, expect_size) in lines.iter().zip([1usize, 2, 4, 8]) {
        let mut fields = line.split('\t');
        let size: usize = fields.next().unwrap().parse()?;
        let value: f64 = fields.next().unwrap().parse()?;
        assert_eq!(size, expect_size);
        assert!(value > 0.0);
        assert_eq!(fields.next(), Some("GiB/s"));
        assert_eq!(fields.next(), None);
    }

    // The initiator's fill pattern landed in both slots of the final pass.
    let mut got = [0u8; 8];
    for slot in 0..cfg.depth {
        t.endpoint()
            .data()
            .read_at(slot * cfg.max_size, &mut got);
        assert_eq!(got, [0x3f; 8]);
    }
    Ok(())
}

#[test]
fn rc_deep_sweep_throughput_scales_with_size() -> Result<()> {
    let cfg = BenchConfig {
        iters: 100,
        depth: 10,
        rx_depth: 20,
        max_size: 64,
        ..Default::default()
    };
    let (a, b) = connect_endpoints(&cfg)?;

    let responder = thread::spawn({
        let cfg = cfg.clone();
        move || run_responder(&mut RcTransport::new(b), &cfg)
    });

    let mut out = Vec::new();
    run_initiator(&mut RcTransport::new(a), &cfg, &mut out)?;
    responder.join().expect("responder panicked")?;

    let report = String::from_utf8(out)?;
    let values: Vec<f64> = report
        .lines()
        .map(|line| line.split('\t').nth(1).unwrap().parse())
        .collect::<std::result::Result<_, _>>()?;
    assert_eq!(values.len(), 7, "sizes 1 through 64");
    assert!(values.iter().all(|&v| v > 0.0), "report: {report}");
    // Per-operation overhead dominates at these sizes, so throughput must
    // grow with message size (64x the bytes in roughly the same time).
    assert!(
        values[values.len() - 1] > values[0],
        "report: {report}"
    );
    Ok(())
}

#[test]
fn rc_sweep_with_uneven_final_batch() -> Result<()> {
    // 5 iterations at depth 2: batches of 2, 2 and 1 per pass.
    let cfg = BenchConfig {
        iters: 5,
        depth: 2,
        rx_depth: 8,
        max_size: 4,
        ..Default::default()
    };
    let (a, b) = connect_endpoints(&cfg)?;

    let responder = thread::spawn({
        let cfg = cfg.clone();
        move || run_responder(&mut RcTransport::new(b), &cfg)
    });

    let mut out = Vec::new();
    run_initiator(&mut RcTransport::new(a), &cfg, &mut out)?;
    responder.join().expect("responder panicked")?;

    assert_eq!(String::from_utf8(out)?.lines().count(), 3);
    Ok(())
}

#[test]
fn tag_sweep_reports_latency() -> Result<()> {
    let cfg = BenchConfig {
        iters: 8,
        depth: 4,
        rx_depth: 8,
        max_size: 32,
        ..Default::default()
    };
    let (pa, pb) = Fabric::open_pair(cfg.rx_depth);
    let (ga, gb) = PairExchanger::pair();

    let responder = thread::spawn({
        let cfg = cfg.clone();
        move || -> Result<(), BenchError> {
            let mut t = TagRmaTransport::new(pb, gb, cfg.max_size)?;
            t.establish()?;
            run_responder(&mut t, &cfg)
        }
    });

    let mut t = TagRmaTransport::new(pa, ga, cfg.max_size)?;
    t.establish()?;
    let mut out = Vec::new();
    run_initiator(&mut t, &cfg, &mut out)?;
    responder.join().expect("responder panicked")?;

    let report = String::from_utf8(out)?;
    let lines: Vec<&str> = report.lines().collect();
    assert_eq!(lines.len(), 3, "sizes 8, 16, 32");
    for (line, expect_size) in lines.iter().zip([8usize, 16, 32]) {
        let mut fields = line.split('\t');
        assert_eq!(fields.next().unwrap().parse::<usize>()?, expect_size);
        let value: f64 = fields.next().unwrap().parse()?;
        assert!(value >= 0.0);
        assert_eq!(fields.next(), Some("us"));
    }
    Ok(())
}

#[test]
fn rendezvous_rejects_garbage_peer() -> Result<()> {
    let cfg = small_cfg();
    let params = EndpointParams::from(&cfg);
    let (_pa, pb) = Fabric::open_pair(cfg.rx_depth);

    let listener = ExchangeListener::bind(0)?;
    let port = listener.local_port()?;
    let responder = thread::spawn(move || -> Result<(), BenchError> {
        let mut ep = Endpoint::new(pb, Role::Responder, params)?;
        ep.connect(listener.accept()?, PathMtu::default())?;
        Ok(())
    });

    // A peer that writes a short burst of noise and hangs up.
    use std::io::Write as _;
    let mut raw = std::net::TcpStream::connect(("127.0.0.1", port))?;
    raw.write_all(b"not a descriptor")?;
    drop(raw);

    let got = responder.join().expect("responder panicked");
    assert!(matches!(got, Err(BenchError::Exchange(_))));
    Ok(())
}
