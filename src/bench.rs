//! Sweep driver.
//!
//! The driver walks a doubling size series, batching submissions up to the
//! configured depth and timing each size pass. The base size is run twice:
//! the first pass warms caches, key translations and code paths, and its
//! measurement is discarded. Every measured pass emits one tab-separated
//! report line of `size  value  unit`.

use std::io::Write;

use crate::config::BenchConfig;
use crate::error::BenchError;
use crate::exchange::Role;
use crate::transport::Transport;

/// One pass of the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pass {
    pub size: usize,
    /// Warm-up passes run the full workload but are not reported.
    pub warmup: bool,
}

/// The doubling size series, warm-up pass included.
#[derive(Debug, Clone, Copy)]
pub struct SizeSeries {
    base: usize,
    max: usize,
}

impl SizeSeries {
    pub fn new(base: usize, max: usize) -> Self {
        Self {
            base: base.max(1),
            max,
        }
    }

    /// All passes in run order: the base size once as warm-up, then every
    /// doubling from the base up to the maximum, measured.
    pub fn passes(&self) -> Vec<Pass> {
        let mut out = Vec::new();
        if self.base > self.max {
            return out;
        }
        out.push(Pass {
            size: self.base,
            warmup: true,
        });
        let mut size = self.base;
        while size <= self.max {
            out.push(Pass {
                size,
                warmup: false,
            });
            // Checked: the series must terminate even at usize's edge.
            match size.checked_mul(2) {
                Some(next) => size = next,
                None => break,
            }
        }
        out
    }
}

/// Drive the measuring side of the sweep, writing one report line per
/// measured size to `out`.
pub fn run_initiator<T: Transport>(
    transport: &mut T,
    cfg: &BenchConfig,
    out: &mut impl Write,
) -> Result<(), BenchError> {
    let series = SizeSeries::new(transport.base_size(), cfg.max_size);
    for pass in series.passes() {
        let start = quanta::Instant::now();
        let mut submitted = 0;
        while submitted < cfg.iters {
            let batch = cfg.depth.min(cfg.iters - submitted);
            transport.post_batch(pass.size, batch)?;
            transport.complete_batch()?;
            submitted += batch;
        }
        transport.finish_size()?;
        let elapsed_us = start.elapsed().as_secs_f64() * 1e6;
        if !pass.warmup {
            let value = transport.measure(pass.size, cfg.iters, elapsed_us);
            writeln!(
                out,
                "{}\t{}\t{}",
                pass.size,
                transport.format_metric(value),
                transport.unit()
            )?;
        }
    }
    transport.shutdown(Role::Initiator)
}

/// Drive the serving side of the sweep: one serve loop per pass, warm-up
/// included, then the orderly shutdown.
pub fn run_responder<T: Transport>(
    transport: &mut T,
    cfg: &BenchConfig,
) -> Result<(), BenchError> {
    let series = SizeSeries::new(transport.base_size(), cfg.max_size);
    for _pass in series.passes() {
        transport.serve(cfg.iters, cfg.depth)?;
    }
    transport.shutdown(Role::Responder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::CompletionError;
    use crate::fabric::PostError;

    #[test]
    fn test_series_includes_base_twice() {
        let passes = SizeSeries::new(1, 8).passes();
        let shape: Vec<_> = passes.iter().map(|p| (p.size, p.warmup)).collect();
        assert_eq!(
            shape,
            vec![(1, true), (1, false), (2, false), (4, false), (8, false)]
        );
    }

    #[test]
    fn test_series_stops_at_max() {
        let passes = SizeSeries::new(8, 100).passes();
        let sizes: Vec<_> = passes.iter().filter(|p| !p.warmup).map(|p| p.size).collect();
        assert_eq!(sizes, vec![8, 16, 32, 64]);
    }

    #[test]
    fn test_empty_series_when_base_exceeds_max() {
        assert!(SizeSeries::new(64, 32).passes().is_empty());
    }

    /// Records the driver's calls without moving any data.
    struct MockTransport {
        batches: Vec<(usize, usize)>,
        finishes: usize,
        served: usize,
        shut: Option<Role>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                batches: Vec::new(),
                finishes: 0,
                served: 0,
                shut: None,
            }
        }
    }

    impl Transport for MockTransport {
        fn base_size(&self) -> usize {
            1
        }

        fn unit(&self) -> &'static str {
            "ops"
        }

        fn post_batch(&mut self, size: usize, count: usize) -> Result<(), PostError> {
            self.batches.push((size, count));
            Ok(())
        }

        fn complete_batch(&mut self) -> Result<(), CompletionError> {
            Ok(())
        }

        fn finish_size(&mut self) -> Result<(), CompletionError> {
            self.finishes += 1;
            Ok(())
        }

        fn measure(&self, _size: usize, iters: usize, _elapsed_us: f64) -> f64 {
            iters as f64
        }

        fn format_metric(&self, value: f64) -> String {
            format!("{value:.0}")
        }

        fn serve(&mut self, _iters: usize, _depth: usize) -> Result<(), CompletionError> {
            self.served += 1;
            Ok(())
        }

        fn shutdown(&mut self, role: Role) -> Result<(), BenchError> {
            self.shut = Some(role);
            Ok(())
        }
    }

    fn small_cfg() -> BenchConfig {
        BenchConfig {
            iters: 4,
            depth: 2,
            max_size: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_warmup_not_reported() {
        let mut t = MockTransport::new();
        let mut out = Vec::new();
        run_initiator(&mut t, &small_cfg(), &mut out).unwrap();
        let report = String::from_utf8(out).unwrap();
        let lines: Vec<_> = report.lines().collect();
        // Sizes 1, 2, 4 reported; the warm-up pass at size 1 is not.
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "1\t4\tops");
        assert_eq!(lines[2], "4\t4\tops");
        // Four passes (warm-up included) of two batches each.
        assert_eq!(t.batches.len(), 8);
        assert!(t.batches.iter().all(|&(_, count)| count == 2));
        assert_eq!(t.finishes, 4);
        assert_eq!(t.shut, Some(Role::Initiator));
    }

    #[test]
    fn test_short_final_batch() {
        let mut t = MockTransport::new();
        let cfg = BenchConfig {
            iters: 5,
            depth: 2,
            max_size: 1,
            ..Default::default()
        };
        let mut out = Vec::new();
        run_initiator(&mut t, &cfg, &mut out).unwrap();
        // Per pass: 2 + 2 + 1.
        assert_eq!(&t.batches[..3], &[(1, 2), (1, 2), (1, 1)]);
    }

    #[test]
    fn test_responder_serves_every_pass() {
        let mut t = MockTransport::new();
        run_responder(&mut t, &small_cfg()).unwrap();
        assert_eq!(t.served, 4);
        assert_eq!(t.shut, Some(Role::Responder));
    }
}
