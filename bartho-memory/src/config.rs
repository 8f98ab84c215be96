//! Configuration surface for the memory kernel.
//!
//! Everything is serde-deserializable (TOML is the on-disk form) and every
//! field has a default, so an empty config yields a working offline kernel.
//! Two environment switches override the file:
//!
//! - `BARTHO_EMBED_ENABLED` — master switch for the embedding hook.
//! - `BARTHO_EMBED_RELOAD` — set to `0`/`false` to disable the rule-set
//!   file watcher (tests/CI).

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{MemoryError, Result};
use crate::rules::RuleSetDef;

pub const ENV_EMBED_ENABLED: &str = "BARTHO_EMBED_ENABLED";
pub const ENV_EMBED_RELOAD: &str = "BARTHO_EMBED_RELOAD";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Hex key material for one strength, with its stable key-id.
#[derive(Clone, Debug, Deserialize)]
pub struct KeyEntry {
    pub kid: String,
    /// 64 hex chars (32 bytes).
    pub key: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EncryptionConfig {
    pub standard: Option<KeyEntry>,
    pub strong: Option<KeyEntry>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub dim: usize,
    pub remote_allowed: bool,
    /// Overridden by `BARTHO_EMBED_ENABLED`.
    pub enabled: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".into(),
            model: "hash-v1".into(),
            dim: 384,
            remote_allowed: false,
            enabled: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    #[default]
    Hybrid,
    Vector,
    Fts,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fusion {
    #[default]
    Weighted,
    Rrf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub mode: RetrievalMode,
    /// FTS5 tokenizer name, e.g. `porter` or `unicode61`.
    pub fts_tokenizer: String,
    /// Extra tokenizer arguments, e.g. `remove_diacritics 2 tokenchars '@._-'`.
    pub fts_tokenizer_args: Option<String>,
    pub fusion: Fusion,
    pub w_fts: f32,
    pub w_vec: f32,
    pub rrf_k: f32,
    pub recency_half_life_hours: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::Hybrid,
            fts_tokenizer: "porter".into(),
            fts_tokenizer_args: None,
            fusion: Fusion::Weighted,
            w_fts: 0.5,
            w_vec: 0.5,
            rrf_k: 60.0,
            recency_half_life_hours: 168.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Strict mode: records demanding `strong` encryption are kept out of
    /// both the FTS and vector indexes.
    pub disallow_strong_only: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct BrakeConfig {
    pub engaged: bool,
    pub scopes: Vec<String>,
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Record store file. `None` keeps everything in memory (tests).
    pub db_path: Option<PathBuf>,
    /// Ordered rule set. Empty sections fall back to the built-in set.
    pub memory_rules: Option<RuleSetDef>,
    /// Rules file to hot-reload when it changes (optional).
    pub rules_path: Option<PathBuf>,
    pub encryption: EncryptionConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub indexing: IndexingConfig,
    pub brake: BrakeConfig,
}

impl MemoryConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut config: MemoryConfig =
            toml::from_str(text).map_err(|e| MemoryError::Config(e.to_string()))?;
        config.apply_env();
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| MemoryError::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Fold environment switches into the loaded config.
    pub fn apply_env(&mut self) {
        if let Some(enabled) = env_flag(ENV_EMBED_ENABLED) {
            self.embedding.enabled = enabled;
        }
    }

    /// Whether the rule-set file watcher should run.
    pub fn watcher_enabled() -> bool {
        env_flag(ENV_EMBED_RELOAD).unwrap_or(true)
    }
}

fn env_flag(name: &str) -> Option<bool> {
    match std::env::var(name) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "0" | "false" | "off" | "no" => Some(false),
            "" => None,
            _ => Some(true),
        },
        Err(_) => None,
    }
}
