//! Embedding engine: L2-normalized fixed-dimension float32 vectors.
//!
//! A real model can be plugged in behind [`EmbeddingModel`]; without one the
//! engine falls back to a deterministic hash-expansion embedder so `embed`
//! always succeeds offline. The `(provider, model, dim)` tuple identifies
//! the producer; changing it invalidates existing vectors and the store
//! rebuilds them.

use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::EmbeddingConfig;
use crate::error::{MemoryError, Result};

/// Identity of a vector producer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelIdentity {
    pub provider: String,
    pub model: String,
    pub dim: usize,
}

/// A pluggable embedding model. Inference must not mutate internal state.
pub trait EmbeddingModel: Send + Sync {
    fn identity(&self) -> ModelIdentity;
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Identity used by the offline fallback embedder.
pub const FALLBACK_PROVIDER: &str = "local";
pub const FALLBACK_MODEL: &str = "hash-v1";

pub struct EmbeddingEngine {
    model: Option<Arc<dyn EmbeddingModel>>,
    fallback_identity: ModelIdentity,
    enabled: bool,
    remote_allowed: bool,
}

impl EmbeddingEngine {
    pub fn new(config: &EmbeddingConfig, model: Option<Arc<dyn EmbeddingModel>>) -> Self {
        Self {
            model,
            fallback_identity: ModelIdentity {
                provider: FALLBACK_PROVIDER.into(),
                model: FALLBACK_MODEL.into(),
                dim: config.dim,
            },
            enabled: config.enabled,
            remote_allowed: config.remote_allowed,
        }
    }

    /// Offline engine at the default dimension, for tests and the factory
    /// path with no model configured.
    pub fn offline(dim: usize) -> Self {
        Self {
            model: None,
            fallback_identity: ModelIdentity {
                provider: FALLBACK_PROVIDER.into(),
                model: FALLBACK_MODEL.into(),
                dim,
            },
            enabled: true,
            remote_allowed: false,
        }
    }

    /// Master switch (`BARTHO_EMBED_ENABLED`): when off, the pipeline skips
    /// the embedding hook entirely.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn remote_allowed(&self) -> bool {
        self.remote_allowed
    }

    /// The active `(provider, model, dim)` tuple.
    pub fn identity(&self) -> ModelIdentity {
        match &self.model {
            Some(m) => m.identity(),
            None => self.fallback_identity.clone(),
        }
    }

    /// Embed text. Always succeeds under the fallback; a loaded model may
    /// fail, and the caller decides whether that fails ingestion.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match &self.model {
            Some(m) => {
                let identity = m.identity();
                let mut vec = m.embed(text)?;
                if vec.len() != identity.dim {
                    return Err(MemoryError::Embed(format!(
                        "model returned {} dims, expected {}",
                        vec.len(),
                        identity.dim
                    )));
                }
                l2_normalize(&mut vec);
                Ok(vec)
            }
            None => Ok(hash_embed(text, self.fallback_identity.dim)),
        }
    }
}

/// Deterministic hash-expansion embedding: each token hashes to a handful of
/// signed positions. Weak next to a transformer, but stable, offline, and
/// good enough for paraphrase-free recall and tests.
pub fn hash_embed(text: &str, dim: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dim.max(1)];
    let lower = text.to_lowercase();
    for token in lower.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
        let digest = Sha256::digest(token.as_bytes());
        // Three (index, sign) features per token from independent digest lanes.
        for lane in 0..3 {
            let off = lane * 8;
            let h = u64::from_le_bytes(digest[off..off + 8].try_into().unwrap());
            let idx = (h % dim.max(1) as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
    }
    l2_normalize(&mut v);
    if v.iter().all(|x| *x == 0.0) {
        // Empty input still yields a unit vector so the norm invariant holds.
        v[0] = 1.0;
    }
    v
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm = l2_norm(v);
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Dot product; equals cosine similarity for unit vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_is_deterministic() {
        let a = hash_embed("the same sentence", 384);
        let b = hash_embed("the same sentence", 384);
        assert_eq!(a, b);
    }

    #[test]
    fn vectors_are_unit_norm() {
        for text in ["hello world", "", "a", "many different words in here"] {
            let v = hash_embed(text, 384);
            assert!((l2_norm(&v) - 1.0).abs() < 1e-5, "norm off for {:?}", text);
        }
    }

    #[test]
    fn shared_tokens_raise_similarity() {
        let a = hash_embed("the red fox jumped over the fence", 384);
        let b = hash_embed("a red fox jumped over a wall", 384);
        let c = hash_embed("completely unrelated quantum physics lecture", 384);
        assert!(dot(&a, &b) > dot(&a, &c));
    }

    #[test]
    fn engine_without_model_uses_fallback_identity() {
        let engine = EmbeddingEngine::offline(64);
        let id = engine.identity();
        assert_eq!(id.provider, FALLBACK_PROVIDER);
        assert_eq!(id.model, FALLBACK_MODEL);
        assert_eq!(id.dim, 64);
        assert_eq!(engine.embed("text").unwrap().len(), 64);
    }

    #[test]
    fn model_dim_mismatch_is_an_error() {
        struct Broken;
        impl EmbeddingModel for Broken {
            fn identity(&self) -> ModelIdentity {
                ModelIdentity { provider: "p".into(), model: "m".into(), dim: 8 }
            }
            fn embed(&self, _: &str) -> Result<Vec<f32>> {
                Ok(vec![1.0; 4])
            }
        }
        let config = EmbeddingConfig { dim: 8, ..Default::default() };
        let engine = EmbeddingEngine::new(&config, Some(Arc::new(Broken)));
        assert!(engine.embed("x").is_err());
    }

    #[test]
    fn case_is_folded() {
        assert_eq!(hash_embed("Hello World", 128), hash_embed("hello world", 128));
    }
}
