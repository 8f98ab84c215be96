//! Memory store: owns the record store and composes the governance
//! pipeline — classification, redaction, summarization, embedding,
//! encryption, persistence, indexing — plus consent and brake plumbing.
//!
//! Every component is an explicit dependency injected at construction; the
//! [`MemoryStore::open`] factory assembles the default graph for callers who
//! don't want to wire it by hand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use bartho_envelope::{aad, Envelope, KeyProvider, MemoryKey, Strength};
use rusqlite::OptionalExtension;

use crate::audit::{AuditAction, AuditEvent, AuditSink, TracingAuditSink};
use crate::brake::{BrakeState, ParkingBrake};
use crate::config::{MemoryConfig, RetrievalMode};
use crate::db::{self, Database};
use crate::embed::{EmbeddingEngine, EmbeddingModel, ModelIdentity};
use crate::error::{MemoryError, Result};
use crate::fts;
use crate::gate::{open_stored, ConsentGate};
use crate::policy::IndexingPolicy;
use crate::redact::redact;
use crate::retrieve::Retriever;
use crate::rules::{
    new_handle, snapshot, swap, EmbedSelect, EncryptLevel, FtsIndexMode, RuleDecision, RuleHandle,
    RuleInput, RuleSet, SummaryMode,
};
use crate::summarize::summarize;
use crate::types::{
    format_ts, Clock, EmbedSource, EphemeralEmbedding, RecordId, Retrieved, RetrieveFilters,
    SystemClock, UpsertOutcome, UpsertRequest,
};
use crate::vector::{self, EmbeddingRow};
use crate::watch::RuleWatcher;

const AUDIT_KIND: &str = "safety.audit";
const EMBED_IDENTITY_FLAG: &str = "embedding_identity";

pub struct MemoryStore {
    db: Arc<Database>,
    rules: RuleHandle,
    keys: Arc<KeyProvider>,
    engine: Arc<EmbeddingEngine>,
    gate: Arc<ConsentGate>,
    brake: Arc<ParkingBrake>,
    indexing: IndexingPolicy,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    retriever: Retriever,
    /// Vectors computed during ingestion but withheld from the store,
    /// awaiting consent-driven promotion.
    ephemeral: Mutex<HashMap<RecordId, Vec<EphemeralEmbedding>>>,
    audit_seq: AtomicU64,
    /// Keeps the rules file watcher alive for the store's lifetime.
    _rule_watcher: Option<RuleWatcher>,
}

impl MemoryStore {
    /// Assemble the default graph: system clock, tracing audit sink, no
    /// external embedding model.
    pub async fn open(config: MemoryConfig) -> Result<Self> {
        Self::open_with(config, None, Arc::new(SystemClock), Arc::new(TracingAuditSink)).await
    }

    /// Full dependency injection for embedders, clocks, and audit sinks.
    pub async fn open_with(
        config: MemoryConfig,
        model: Option<Arc<dyn EmbeddingModel>>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let tokenize = match &config.retrieval.fts_tokenizer_args {
            Some(args) => format!("{} {}", config.retrieval.fts_tokenizer, args),
            None => config.retrieval.fts_tokenizer.clone(),
        };
        let db = Arc::new(Database::open(config.db_path.as_deref(), &tokenize)?);

        let rule_set = match &config.memory_rules {
            Some(def) => RuleSet::compile(def),
            None => RuleSet::builtin(),
        };
        let rules = new_handle(rule_set);

        // Hot reload, when a rules file is configured: the file's contents
        // win over the inline set from the moment the watcher starts.
        let rule_watcher = match &config.rules_path {
            Some(path) => RuleWatcher::spawn(path.clone(), rules.clone())?,
            None => None,
        };

        let keys = Arc::new(resolve_keys(&config)?);
        let engine = Arc::new(EmbeddingEngine::new(&config.embedding, model));
        let brake = Arc::new(ParkingBrake::load(db.clone(), &config.brake)?);
        let indexing = IndexingPolicy::new(&config.indexing);
        let gate = Arc::new(ConsentGate::new(
            db.clone(),
            rules.clone(),
            keys.clone(),
            audit.clone(),
            clock.clone(),
        ));
        let retriever = Retriever::new(
            db.clone(),
            engine.clone(),
            gate.clone(),
            config.retrieval.clone(),
            clock.clone(),
            audit.clone(),
        );

        let store = Self {
            db,
            rules,
            keys,
            engine,
            gate,
            brake,
            indexing,
            audit,
            clock,
            retriever,
            ephemeral: Mutex::new(HashMap::new()),
            audit_seq: AtomicU64::new(0),
            _rule_watcher: rule_watcher,
        };

        // Startup migrations: FTS row identity, embedding producer identity.
        if store.db.verify_fts_identity()? {
            store.rebuild_fts().await?;
        }
        store.check_embedding_identity().await?;
        Ok(store)
    }

    pub fn gate(&self) -> &ConsentGate {
        &self.gate
    }

    pub fn rules(&self) -> RuleHandle {
        self.rules.clone()
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Run the governed ingestion pipeline for one record.
    pub async fn upsert(&self, req: UpsertRequest) -> Result<UpsertOutcome> {
        self.upsert_inner(req, true).await
    }

    async fn upsert_inner(&self, req: UpsertRequest, check_brake: bool) -> Result<UpsertOutcome> {
        // 1. Brake.
        if check_brake && self.brake.is_blocked("writes") {
            return Err(MemoryError::BrakeEngaged { scope: "writes" });
        }

        // 2. One rule snapshot for the whole ingestion.
        let rules = snapshot(&self.rules);
        let input = RuleInput {
            kind: &req.kind,
            value: &req.value,
            tags: &req.tags,
            speaker: req.speaker(),
        };
        let decision = rules.evaluate(&input);

        // 3. Refused outright: no side effects at all.
        if !decision.allow_store {
            return Ok(UpsertOutcome::skipped());
        }

        // 4. Consent standing for this logical slot.
        let needs_consent = if decision.requires_consent {
            match self.db.record_id_for_slot(&req.kind, &req.key)? {
                Some(id) => !self.has_consent(id)?,
                None => true,
            }
        } else {
            false
        };

        // 5. Redact. The raw value is out of scope from here on.
        let redacted = match &decision.redact_strategy {
            Some(strategy) => redact(&req.value, decision.redact_pattern.as_deref(), strategy),
            None => req.value.clone(),
        };

        // 6. Summarize the redacted text.
        let summary = summarize(&redacted, decision.summarize);

        // 7. FTS index text: summary or redacted value, never raw input.
        let ts_str = format_ts(&req.ts);
        let fts_text = match (&summary, decision.summary_mode, decision.fts_index_mode) {
            (_, SummaryMode::FullAlways, _) => redacted.clone(),
            (Some(s), _, FtsIndexMode::SummaryPreferred) => s.clone(),
            _ => redacted.clone(),
        };

        // 8. Embeddings over redacted/summary text only.
        let can_index = self.indexing.can_index(&decision);
        let computed = self.compute_embeddings(&decision, &redacted, summary.as_deref(), can_index)?;
        let persist_vectors = can_index && decision.embed_store && !needs_consent;

        // 9. Encrypt: summary under the same key-id, distinct AAD binding.
        let (store_value, store_summary) = match (decision.summary_mode, &summary) {
            (SummaryMode::SummaryOnly, Some(s)) => (s.clone(), None),
            _ => (redacted.clone(), summary.clone()),
        };
        let (value_text, summary_text) = match strength_for(decision.encrypt) {
            Some(strength) => {
                let key = self.keys.resolve(strength);
                let value_env =
                    Envelope::seal(key, store_value.as_bytes(), &aad::record_aad(&req.kind, &req.key, &ts_str))?;
                let summary_env = match &store_summary {
                    Some(s) => Some(Envelope::seal(
                        key,
                        s.as_bytes(),
                        &aad::summary_aad(&req.kind, &req.key, &ts_str),
                    )?),
                    None => None,
                };
                (value_env.to_json(), summary_env.map(|e| e.to_json()))
            }
            None => (store_value, store_summary),
        };

        // 10. One transaction: record row plus its index rows, atomically.
        let tags_json = serde_json::to_string(&req.tags).expect("tags serialization");
        let metadata_json = serde_json::to_string(&req.metadata).expect("metadata serialization");
        let id = {
            let mut conn = self.db.conn();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO records (kind, key, value, summary, ts, tags, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(kind, key) DO UPDATE SET
                     value = excluded.value,
                     summary = excluded.summary,
                     ts = excluded.ts,
                     tags = excluded.tags,
                     metadata = excluded.metadata",
                rusqlite::params![req.kind, req.key, value_text, summary_text, ts_str, tags_json, metadata_json],
            )?;
            let id = db::record_id_for_slot(&tx, &req.kind, &req.key)?
                .ok_or_else(|| MemoryError::Store("record row vanished mid-transaction".into()))?;

            if self.db.fts_enabled() {
                if can_index && decision.fts_index {
                    fts::replace_row(&tx, id, &fts_text, &req.kind)?;
                } else {
                    fts::delete_row(&tx, id)?;
                }
            }

            // Stale vectors from a previous version never outlive the upsert.
            vector::delete_rows(&tx, id)?;
            if persist_vectors && !computed.is_empty() {
                let rows: Vec<EmbeddingRow> = computed
                    .iter()
                    .map(|e| EmbeddingRow {
                        memory_id: id,
                        source: e.source,
                        provider: e.provider.clone(),
                        model: e.model.clone(),
                        dim: e.dim,
                        vec: e.vec.clone(),
                        norm: crate::embed::l2_norm(&e.vec),
                    })
                    .collect();
                vector::replace_rows(&tx, id, &rows)?;
            }
            tx.commit()?;
            id
        };

        // 11. Ephemeral bookkeeping and outcome.
        let ephemeral = if !persist_vectors && !computed.is_empty() {
            self.ephemeral.lock().await.insert(id, computed.clone());
            computed
        } else {
            self.ephemeral.lock().await.remove(&id);
            Vec::new()
        };

        Ok(UpsertOutcome {
            id: Some(id),
            stored: !needs_consent,
            needs_consent,
            ephemeral_embeddings: ephemeral,
        })
    }

    fn compute_embeddings(
        &self,
        decision: &RuleDecision,
        redacted: &str,
        summary: Option<&str>,
        can_index: bool,
    ) -> Result<Vec<EphemeralEmbedding>> {
        if !self.engine.enabled() || decision.embed == EmbedSelect::None {
            return Ok(Vec::new());
        }
        let mut sources: Vec<(EmbedSource, &str)> = Vec::new();
        match decision.embed {
            EmbedSelect::None => {}
            EmbedSelect::Summary => match summary {
                Some(s) => sources.push((EmbedSource::Summary, s)),
                None => sources.push((EmbedSource::Full, redacted)),
            },
            EmbedSelect::Full => sources.push((EmbedSource::Full, redacted)),
            EmbedSelect::Both => {
                if let Some(s) = summary {
                    sources.push((EmbedSource::Summary, s));
                }
                sources.push((EmbedSource::Full, redacted));
            }
        }

        let identity = self.engine.identity();
        let mut out = Vec::with_capacity(sources.len());
        for (source, text) in sources {
            match self.engine.embed(text) {
                Ok(vec) => out.push(EphemeralEmbedding {
                    source,
                    provider: identity.provider.clone(),
                    model: identity.model.clone(),
                    dim: identity.dim,
                    vec,
                }),
                Err(e) => {
                    // Only fatal when a rule demanded persisted vectors.
                    if decision.embed_store && can_index {
                        return Err(MemoryError::Embed(e.to_string()));
                    }
                    tracing::warn!(source = source.as_str(), "embedding failed; skipped");
                }
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Delete / consent
    // -----------------------------------------------------------------------

    /// Remove a logical record and every derived row in one transaction.
    pub async fn delete(&self, kind: &str, key: &str) -> Result<bool> {
        if self.brake.is_blocked("writes") {
            return Err(MemoryError::BrakeEngaged { scope: "writes" });
        }
        let removed = {
            let mut conn = self.db.conn();
            let tx = conn.transaction()?;
            let Some(id) = db::record_id_for_slot(&tx, kind, key)? else {
                return Ok(false);
            };
            if self.db.fts_enabled() {
                fts::delete_row(&tx, id)?;
            }
            vector::delete_rows(&tx, id)?;
            tx.execute("DELETE FROM consent WHERE memory_id = ?1", [id])?;
            tx.execute("DELETE FROM records WHERE id = ?1", [id])?;
            tx.commit()?;
            id
        };
        self.ephemeral.lock().await.remove(&removed);
        Ok(true)
    }

    /// Record explicit consent for an existing record. No-op when the slot
    /// does not exist yet.
    pub async fn grant_consent(&self, kind: &str, key: &str) -> Result<bool> {
        let Some(id) = self.db.record_id_for_slot(kind, key)? else {
            return Ok(false);
        };
        let granted_at = format_ts(&self.clock.now());
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO consent (memory_id, granted_at) VALUES (?1, ?2)
             ON CONFLICT(memory_id) DO NOTHING",
            rusqlite::params![id, granted_at],
        )?;
        Ok(true)
    }

    /// Promote previously-returned ephemeral embeddings to stored rows,
    /// applying the index guard. Returns how many rows landed.
    pub async fn persist_embeddings_for(&self, id: RecordId) -> Result<usize> {
        let Some(pending) = self.ephemeral.lock().await.remove(&id) else {
            return Ok(0);
        };
        let Some(decision) = self.decision_for_stored(id)? else {
            return Ok(0);
        };
        if !self.indexing.can_index(&decision) {
            return Ok(0);
        }
        let rows: Vec<EmbeddingRow> = pending
            .iter()
            .map(|e| EmbeddingRow {
                memory_id: id,
                source: e.source,
                provider: e.provider.clone(),
                model: e.model.clone(),
                dim: e.dim,
                vec: e.vec.clone(),
                norm: crate::embed::l2_norm(&e.vec),
            })
            .collect();
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        vector::replace_rows(&tx, id, &rows)?;
        tx.commit()?;
        Ok(rows.len())
    }

    fn has_consent(&self, id: RecordId) -> Result<bool> {
        let conn = self.db.conn();
        let row: Option<i64> = conn
            .query_row("SELECT memory_id FROM consent WHERE memory_id = ?1", [id], |r| r.get(0))
            .optional()?;
        Ok(row.is_some())
    }

    /// Re-derive the rule decision for a stored record (plaintext via the
    /// envelope layer; elided fields fail closed).
    fn decision_for_stored(&self, id: RecordId) -> Result<Option<RuleDecision>> {
        let Some(record) = self.db.record_by_id(id)? else {
            return Ok(None);
        };
        let Ok(value) = open_stored(&self.keys, &record, &record.value, false) else {
            return Ok(None);
        };
        let rules = snapshot(&self.rules);
        let input = RuleInput {
            kind: &record.kind,
            value: &value,
            tags: &record.tags,
            speaker: record.speaker(),
        };
        Ok(Some(rules.evaluate(&input)))
    }

    // -----------------------------------------------------------------------
    // Retrieval
    // -----------------------------------------------------------------------

    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filters: &RetrieveFilters,
        mode: Option<RetrievalMode>,
    ) -> Result<Vec<Retrieved>> {
        if self.brake.is_blocked("retrieval") {
            return Err(MemoryError::BrakeEngaged { scope: "retrieval" });
        }
        self.retriever.retrieve(query, top_k, filters, mode)
    }

    // -----------------------------------------------------------------------
    // Brake
    // -----------------------------------------------------------------------

    pub async fn brake_engage(&self, scopes: &[&str]) -> Result<BrakeState> {
        let state = self.brake.engage(scopes.iter().copied())?;
        self.audit.record(AuditEvent::new(
            self.clock.now(),
            AuditAction::BrakeEngaged { scopes: state.scopes.iter().cloned().collect() },
        ));
        self.write_brake_audit("engage", &state).await?;
        Ok(state)
    }

    pub async fn brake_disengage(&self) -> Result<BrakeState> {
        let state = self.brake.disengage()?;
        self.audit
            .record(AuditEvent::new(self.clock.now(), AuditAction::BrakeDisengaged));
        self.write_brake_audit("disengage", &state).await?;
        Ok(state)
    }

    pub fn brake_status(&self) -> BrakeState {
        self.brake.status()
    }

    /// Brake transitions are themselves memories (`safety.audit`), written
    /// through an ingestion path that skips the brake gate — engaging
    /// `writes` must still leave an audit trail.
    async fn write_brake_audit(&self, action: &str, state: &BrakeState) -> Result<()> {
        let now = self.clock.now();
        let seq = self.audit_seq.fetch_add(1, Ordering::Relaxed);
        let req = UpsertRequest::new(
            AUDIT_KIND,
            format!("brake-{}-{}", now.timestamp_micros(), seq),
            serde_json::json!({
                "action": action,
                "engaged": state.engaged,
                "scopes": state.scopes,
            })
            .to_string(),
            now,
        )
        .with_speaker("system");
        self.upsert_inner(req, false).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rules lifecycle
    // -----------------------------------------------------------------------

    /// Atomically replace the rule snapshot. In-flight operations keep the
    /// version they started with.
    pub fn reload_rules(&self, set: RuleSet) {
        swap(&self.rules, set);
    }

    // -----------------------------------------------------------------------
    // Maintenance / admin
    // -----------------------------------------------------------------------

    pub async fn maintenance(&self) -> Result<()> {
        self.db.maintenance()
    }

    /// Checkpoint-truncate the journal for a clean shutdown.
    pub async fn close(&self) -> Result<()> {
        self.db.close()
    }

    /// Recompute every stored embedding under the active producer tuple.
    pub async fn rebuild_embeddings(&self) -> Result<usize> {
        let ids = self.all_record_ids()?;
        let identity = self.engine.identity();
        let mut count = 0usize;
        for id in ids {
            let Some(record) = self.db.record_by_id(id)? else { continue };
            let Ok(value) = open_stored(&self.keys, &record, &record.value, false) else {
                tracing::warn!(id, "record skipped during embedding rebuild");
                continue;
            };
            let summary = match &record.summary {
                Some(field) => open_stored(&self.keys, &record, field, true).ok(),
                None => None,
            };
            let rules = snapshot(&self.rules);
            let input = RuleInput {
                kind: &record.kind,
                value: &value,
                tags: &record.tags,
                speaker: record.speaker(),
            };
            let decision = rules.evaluate(&input);

            let mut conn = self.db.conn();
            let tx = conn.transaction()?;
            vector::delete_rows(&tx, id)?;
            if decision.embed_store && self.indexing.can_index(&decision) {
                let computed =
                    self.compute_embeddings(&decision, &value, summary.as_deref(), true)?;
                let rows: Vec<EmbeddingRow> = computed
                    .iter()
                    .map(|e| {
                        EmbeddingRow::new(id, e.source, &identity, e.vec.clone())
                    })
                    .collect();
                if !rows.is_empty() {
                    vector::replace_rows(&tx, id, &rows)?;
                    count += rows.len();
                }
            }
            tx.commit()?;
        }
        self.db.set_flag(EMBED_IDENTITY_FLAG, &identity_tag(&identity))?;
        self.audit.record(AuditEvent::new(
            self.clock.now(),
            AuditAction::EmbeddingsRebuilt { count },
        ));
        Ok(count)
    }

    /// Rebuild the FTS index from decrypted record content (startup
    /// migration path after a row-identity mismatch).
    async fn rebuild_fts(&self) -> Result<()> {
        if !self.db.fts_enabled() {
            return Ok(());
        }
        let ids = self.all_record_ids()?;
        let mut rows: Vec<(RecordId, String, String)> = Vec::new();
        for id in ids {
            let Some(record) = self.db.record_by_id(id)? else { continue };
            let Ok(value) = open_stored(&self.keys, &record, &record.value, false) else {
                continue;
            };
            let summary = match &record.summary {
                Some(field) => open_stored(&self.keys, &record, field, true).ok(),
                None => None,
            };
            let rules = snapshot(&self.rules);
            let input = RuleInput {
                kind: &record.kind,
                value: &value,
                tags: &record.tags,
                speaker: record.speaker(),
            };
            let decision = rules.evaluate(&input);
            if !decision.fts_index || !self.indexing.can_index(&decision) {
                continue;
            }
            let text = match (&summary, decision.summary_mode, decision.fts_index_mode) {
                (_, SummaryMode::FullAlways, _) => value.clone(),
                (Some(s), _, FtsIndexMode::SummaryPreferred) => s.clone(),
                _ => value.clone(),
            };
            rows.push((id, text, record.kind.clone()));
        }
        let conn = self.db.conn();
        fts::rebuild(&conn, &rows)
    }

    /// On producer tuple change, stored vectors are invalid: rebuild.
    async fn check_embedding_identity(&self) -> Result<()> {
        let current = identity_tag(&self.engine.identity());
        match self.db.get_flag(EMBED_IDENTITY_FLAG)? {
            Some(stored) if stored != current => {
                tracing::info!("embedding producer changed; rebuilding vector store");
                self.rebuild_embeddings().await?;
            }
            None => self.db.set_flag(EMBED_IDENTITY_FLAG, &current)?,
            _ => {}
        }
        Ok(())
    }

    fn all_record_ids(&self) -> Result<Vec<RecordId>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT id FROM records ORDER BY id")?;
        let ids = stmt
            .query_map([], |r| r.get::<_, RecordId>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

fn strength_for(level: EncryptLevel) -> Option<Strength> {
    match level {
        EncryptLevel::None => None,
        EncryptLevel::Standard => Some(Strength::Standard),
        EncryptLevel::Strong => Some(Strength::Strong),
    }
}

fn identity_tag(identity: &ModelIdentity) -> String {
    format!("{}|{}|{}", identity.provider, identity.model, identity.dim)
}

/// Key resolution order per strength: explicit config hex, environment
/// secret, synthesized ephemeral.
fn resolve_keys(config: &MemoryConfig) -> Result<KeyProvider> {
    let standard = match &config.encryption.standard {
        Some(entry) => MemoryKey::from_hex(&entry.kid, &entry.key)?,
        None => env_or_synthesized(Strength::Standard)?,
    };
    let strong = match &config.encryption.strong {
        Some(entry) => MemoryKey::from_hex(&entry.kid, &entry.key)?,
        None => env_or_synthesized(Strength::Strong)?,
    };
    Ok(KeyProvider::from_material(standard, strong))
}

fn env_or_synthesized(strength: Strength) -> Result<MemoryKey> {
    let var = match strength {
        Strength::Standard => bartho_envelope::ENV_KEY_STANDARD,
        Strength::Strong => bartho_envelope::ENV_KEY_STRONG,
    };
    match std::env::var(var) {
        Ok(secret) if !secret.is_empty() => {
            Ok(MemoryKey::derive(strength.default_kid(), secret.as_bytes(), strength))
        }
        _ => {
            let key = MemoryKey::synthesize(strength)?;
            tracing::warn!(
                strength = strength.as_str(),
                "no persistent key material; synthesized an ephemeral key"
            );
            Ok(key)
        }
    }
}
