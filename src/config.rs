//! Benchmark configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::BenchError;
use crate::qp::PathMtu;

/// Tunable parameters of a benchmark run.
///
/// Every field has a default, so a TOML file (or the CLI) only needs to
/// name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// TCP rendezvous port.
    pub port: u16,
    /// Operations per message size.
    pub iters: usize,
    /// Outstanding operations per batch.
    pub depth: usize,
    /// Receives kept posted on each side.
    pub rx_depth: usize,
    /// Largest message size in the sweep, in bytes.
    pub max_size: usize,
    /// Path MTU in bytes.
    pub mtu: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            port: 12345,
            iters: 1000,
            depth: 100,
            rx_depth: 100,
            max_size: 131072,
            mtu: 1024,
        }
    }
}

impl BenchConfig {
    /// Load a configuration from a TOML file. Missing keys take their
    /// defaults.
    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self, BenchError> {
        let content = std::fs::read_to_string(path)?;
        let cfg: Self =
            toml::from_str(&content).map_err(|e| BenchError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check the cross-field constraints the engine relies on.
    pub fn validate(&self) -> Result<(), BenchError> {
        if self.depth == 0 || self.rx_depth == 0 {
            return Err(BenchError::Config("queue depth must be nonzero".into()));
        }
        if self.iters < self.depth {
            return Err(BenchError::Config(format!(
                "iters ({}) must be at least the batch depth ({})",
                self.iters, self.depth
            )));
        }
        if self.max_size == 0 {
            return Err(BenchError::Config("max size must be nonzero".into()));
        }
        if PathMtu::from_bytes(self.mtu).is_none() {
            return Err(BenchError::Config(format!("invalid MTU: {}", self.mtu)));
        }
        Ok(())
    }

    /// The path MTU as a code. Call after [`BenchConfig::validate`].
    pub fn path_mtu(&self) -> PathMtu {
        PathMtu::from_bytes(self.mtu).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = BenchConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.port, 12345);
        assert_eq!(cfg.max_size, 131072);
    }

    #[test]
    fn test_partial_toml() {
        let cfg: BenchConfig = toml::from_str("iters = 200\ndepth = 50").unwrap();
        assert_eq!(cfg.iters, 200);
        assert_eq!(cfg.depth, 50);
        assert_eq!(cfg.port, 12345);
    }

    #[test]
    fn test_rejects_iters_below_depth() {
        let cfg = BenchConfig {
            iters: 10,
            depth: 100,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_mtu() {
        let cfg = BenchConfig {
            mtu: 1500,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
