//! The evaluation capability and its cached composition.
//!
//! Everything that can turn feature planes into a [`NetResult`] implements
//! [`Evaluator`]: the engine's own network, the remote client
//! ([`crate::client::RemoteEvaluator`]) and test stand-ins. The search
//! consumes evaluations through [`CachedEvaluator`], which fronts any
//! backend with the fingerprint cache.

use crate::error::EvalError;
use crate::nn_cache::{NetResult, NnCache};
use std::sync::Arc;

/// Capability to evaluate one position's feature planes.
///
/// Implementations must be callable from many search threads at once.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, features: &[bool]) -> Result<NetResult, EvalError>;
}

/// Deterministic stand-in evaluator: a uniform policy and scalars derived
/// from the feature population count. Used by tests and as the delegate
/// of throwaway servers; the engine's real network lives outside this
/// crate and implements [`Evaluator`] itself.
pub struct UniformEvaluator {
    num_intersections: usize,
}

impl UniformEvaluator {
    pub fn new(num_intersections: usize) -> Self {
        Self { num_intersections }
    }
}

impl Evaluator for UniformEvaluator {
    fn evaluate(&self, features: &[bool]) -> Result<NetResult, EvalError> {
        let n = self.num_intersections;
        let live = features.iter().filter(|&&b| b).count();
        Ok(NetResult {
            policy: vec![1.0 / n as f32; n],
            policy_pass: 1.0 / (n + 1) as f32,
            winrate: (live % 128) as f32 / 128.0,
        })
    }
}

/// Cache-fronted evaluator: lookup by fingerprint, compute on miss,
/// insert the fresh result.
///
/// In selfcheck mode both the cache and the regular backend are bypassed
/// and every call goes to the designated local evaluator; the caller
/// compares those results against previously cached or remote ones when
/// hunting numeric divergence.
pub struct CachedEvaluator {
    cache: Arc<NnCache>,
    backend: Box<dyn Evaluator>,
    selfcheck_backend: Option<Arc<dyn Evaluator>>,
    selfcheck: bool,
}

impl CachedEvaluator {
    pub fn new(cache: Arc<NnCache>, backend: Box<dyn Evaluator>) -> Self {
        Self {
            cache,
            backend,
            selfcheck_backend: None,
            selfcheck: false,
        }
    }

    /// Route every evaluation to `local`, skipping cache and backend.
    pub fn enable_selfcheck(&mut self, local: Arc<dyn Evaluator>) {
        self.selfcheck_backend = Some(local);
        self.selfcheck = true;
    }

    pub fn cache(&self) -> &NnCache {
        &self.cache
    }

    /// Evaluate the position identified by `fingerprint`.
    pub fn evaluate_position(
        &self,
        fingerprint: u64,
        features: &[bool],
    ) -> Result<NetResult, EvalError> {
        if self.selfcheck {
            if let Some(local) = &self.selfcheck_backend {
                return local.evaluate(features);
            }
        }

        if let Some(cached) = self.cache.lookup(fingerprint) {
            return Ok(cached);
        }

        let result = self.backend.evaluate(features)?;
        self.cache.insert(fingerprint, &result);
        Ok(result)
    }
}
