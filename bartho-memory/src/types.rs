//! Core types shared across the kernel: record identity, stored text,
//! operation requests and outcomes, the clock seam.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use bartho_envelope::Envelope;

/// Monotonic record identifier assigned by the record store on insert.
pub type RecordId = i64;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Wall-clock seam. The kernel never calls `Utc::now()` directly, so tests
/// can pin time for recency shaping and audit timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Canonical timestamp form as persisted and as bound into envelope AAD.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a persisted timestamp back. Rows are only ever written through
/// [`format_ts`], so failures indicate external tampering.
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Stored text: plaintext or envelope
// ---------------------------------------------------------------------------

/// A persisted text field. Envelopes are self-describing, so the store keeps
/// a single TEXT column and classifies on load.
#[derive(Clone, Debug, PartialEq)]
pub enum StoredText {
    Plain(String),
    Sealed(Envelope),
}

impl StoredText {
    pub fn from_stored(text: String) -> Self {
        if text.starts_with('{') {
            if let Ok(env) = Envelope::from_json(&text) {
                return StoredText::Sealed(env);
            }
        }
        StoredText::Plain(text)
    }

    pub fn to_stored(&self) -> String {
        match self {
            StoredText::Plain(s) => s.clone(),
            StoredText::Sealed(env) => env.to_json(),
        }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self, StoredText::Sealed(_))
    }

    pub fn as_plain(&self) -> Option<&str> {
        match self {
            StoredText::Plain(s) => Some(s),
            StoredText::Sealed(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw record row
// ---------------------------------------------------------------------------

/// A record row as loaded from the store, value fields still in their
/// persisted (possibly sealed) form.
#[derive(Clone, Debug)]
pub struct RawRecord {
    pub id: RecordId,
    pub kind: String,
    pub key: String,
    pub value: StoredText,
    pub summary: Option<StoredText>,
    pub ts: String,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
}

impl RawRecord {
    /// Speaker attribution, when the caller recorded one.
    pub fn speaker(&self) -> Option<&str> {
        self.metadata.get("speaker").and_then(|v| v.as_str())
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        parse_ts(&self.ts)
    }
}

// ---------------------------------------------------------------------------
// Upsert
// ---------------------------------------------------------------------------

/// Ingestion request for one logical record slot `(kind, key)`.
#[derive(Clone, Debug)]
pub struct UpsertRequest {
    pub kind: String,
    pub key: String,
    pub value: String,
    pub ts: DateTime<Utc>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
}

impl UpsertRequest {
    pub fn new(
        kind: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
        ts: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
            value: value.into(),
            ts,
            tags: Vec::new(),
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_speaker(mut self, speaker: impl Into<String>) -> Self {
        if !self.metadata.is_object() {
            self.metadata = serde_json::json!({});
        }
        self.metadata["speaker"] = serde_json::Value::String(speaker.into());
        self
    }

    pub fn speaker(&self) -> Option<&str> {
        self.metadata.get("speaker").and_then(|v| v.as_str())
    }
}

/// Which text an embedding was computed from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedSource {
    Summary,
    Full,
}

impl EmbedSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbedSource::Summary => "summary",
            EmbedSource::Full => "full",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "summary" => Some(EmbedSource::Summary),
            "full" => Some(EmbedSource::Full),
            _ => None,
        }
    }
}

/// A vector computed during ingestion but not (yet) persisted. Returned to
/// the caller so it can be promoted after consent lands.
#[derive(Clone, Debug)]
pub struct EphemeralEmbedding {
    pub source: EmbedSource,
    pub provider: String,
    pub model: String,
    pub dim: usize,
    pub vec: Vec<f32>,
}

/// Result of an `upsert` call.
#[derive(Clone, Debug, Default)]
pub struct UpsertOutcome {
    /// Assigned record id, when a row was written.
    pub id: Option<RecordId>,
    /// Whether the record is committed as recallable memory.
    pub stored: bool,
    /// Whether storage is pending explicit consent.
    pub needs_consent: bool,
    /// Vectors computed but not persisted (consent pending, or the rule kept
    /// them ephemeral).
    pub ephemeral_embeddings: Vec<EphemeralEmbedding>,
}

impl UpsertOutcome {
    pub fn skipped() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

/// How records may resurface after storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallPolicy {
    #[default]
    None,
    AlwaysKeep,
    ContextOnly,
    AutoExpire,
}

impl RecallPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(RecallPolicy::None),
            "always_keep" => Some(RecallPolicy::AlwaysKeep),
            "context_only" => Some(RecallPolicy::ContextOnly),
            "auto_expire" => Some(RecallPolicy::AutoExpire),
            _ => None,
        }
    }
}

/// Optional retrieval filters.
#[derive(Clone, Debug, Default)]
pub struct RetrieveFilters {
    pub kinds: Option<Vec<String>>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

/// One retrieval result.
#[derive(Clone, Debug)]
pub struct Retrieved {
    pub id: RecordId,
    /// Final score after fusion, recency shaping and per-kind boost.
    pub score: f32,
    /// Normalized per-channel scores, when the id appeared in that channel.
    pub fts_score: Option<f32>,
    pub vec_score: Option<f32>,
    /// Fused score before recency shaping and boost.
    pub fused_score: f32,
    pub snippet: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub context_only: bool,
    pub recall_policy: RecallPolicy,
}
