//! # Bartholomew Memory
//!
//! Privacy-first local memory kernel for a long-running personal companion.
//!
//! Heterogeneous memory records flow through a rule-driven governance
//! pipeline — classification → redaction → summarization → embedding →
//! encryption → persistence → indexing — and come back out through a hybrid
//! full-text + vector retriever that enforces consent and privacy below the
//! ranking layer. A scoped, persistent parking brake fail-closes the write
//! and retrieval paths.
//!
//! ## Quick start
//!
//! ```no_run
//! use bartho_memory::{MemoryConfig, MemoryStore, RetrieveFilters, UpsertRequest};
//!
//! # async fn demo() -> Result<(), bartho_memory::MemoryError> {
//! let store = MemoryStore::open(MemoryConfig::default()).await?;
//!
//! let outcome = store
//!     .upsert(UpsertRequest::new("chat", "turn-1", "we talked about sailing", chrono::Utc::now()))
//!     .await?;
//! assert!(outcome.stored);
//!
//! let hits = store.retrieve("sailing", 5, &RetrieveFilters::default(), None).await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod brake;
pub mod config;
pub mod db;
pub mod embed;
pub mod error;
pub mod fts;
pub mod gate;
pub mod memory;
pub mod policy;
pub mod redact;
pub mod retrieve;
pub mod rules;
pub mod summarize;
pub mod types;
pub mod vector;
pub mod watch;

pub use audit::{AuditAction, AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use brake::{BrakeState, ParkingBrake, KNOWN_SCOPES};
pub use config::{
    BrakeConfig, EmbeddingConfig, EncryptionConfig, Fusion, IndexingConfig, KeyEntry,
    MemoryConfig, RetrievalConfig, RetrievalMode, ENV_EMBED_ENABLED, ENV_EMBED_RELOAD,
};
pub use embed::{EmbeddingEngine, EmbeddingModel, ModelIdentity};
pub use error::MemoryError;
pub use gate::{ConsentGate, GateItem};
pub use memory::MemoryStore;
pub use policy::IndexingPolicy;
pub use redact::RedactStrategy;
pub use rules::{
    EmbedSelect, EncryptLevel, FtsIndexMode, MatchDef, RuleDecision, RuleDef, RuleHandle,
    RuleInput, RuleSet, RuleSetDef, SummaryMode,
};
pub use types::{
    Clock, EmbedSource, EphemeralEmbedding, RawRecord, RecallPolicy, RecordId, Retrieved,
    RetrieveFilters, StoredText, SystemClock, UpsertOutcome, UpsertRequest,
};
pub use watch::RuleWatcher;
