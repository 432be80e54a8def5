//! Evaluation subsystem configuration.
//!
//! One record, built once at process start by the embedding engine (from
//! its CLI or a config file) and passed by reference to the cache, client
//! and server. Nothing in this crate reads globals.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Configuration consumed by the evaluation cache and the distributed
/// offload layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Board side length. 19 for standard play; the intersection count and
    /// all wire frame sizes derive from it, so every peer must agree.
    pub board_size: usize,

    /// Number of boolean feature planes fed to the network.
    pub input_channels: usize,

    /// Sizes the client connection pool and the server admission cap.
    pub desired_threads: usize,

    /// Gate informational logs about client connection churn.
    pub nn_client_verbose: bool,

    /// Total cache budget in entries (memory and file index combined).
    pub cache_size: usize,

    /// Remote evaluation servers as `host:port` tokens.
    pub servers: Vec<String>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            board_size: 19,
            input_channels: 18,
            desired_threads: 2,
            nn_client_verbose: false,
            cache_size: crate::nn_cache::MAX_CACHE_COUNT,
            servers: Vec::new(),
        }
    }
}

impl EvalConfig {
    /// Intersections on the board; the policy vector length N.
    pub fn num_intersections(&self) -> usize {
        self.board_size * self.board_size
    }

    /// Byte length of one feature block on the wire.
    pub fn feature_len(&self) -> usize {
        self.input_channels * self.num_intersections()
    }

    pub fn validate(&self) -> Result<()> {
        if self.board_size == 0 || self.board_size > 25 {
            bail!("board_size {} out of range 1..=25", self.board_size);
        }
        if self.input_channels == 0 {
            bail!("input_channels must be nonzero");
        }
        if self.desired_threads == 0 {
            bail!("desired_threads must be nonzero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = EvalConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.num_intersections(), 361);
        assert_eq!(cfg.feature_len(), 18 * 361);
    }

    #[test]
    fn zero_board_rejected() {
        let cfg = EvalConfig {
            board_size: 0,
            ..EvalConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
