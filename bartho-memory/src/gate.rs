//! Consent gate: the single authority for privacy filtering on the read
//! path.
//!
//! Every retriever pre-filters its candidate ids here before ranking. The
//! gate re-evaluates the current rule snapshot against each record's
//! plaintext (decrypting inside the gate — plaintext never escapes except
//! as part of an included result), drops anything whose rule demands consent
//! that was never granted, and annotates survivors with their recall policy.
//!
//! A record that fails decryption is elided, audited, and never fails the
//! whole read. The `apply_gate=false` bypass exists for administrative paths
//! and emits an audit event on every use.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bartho_envelope::{aad, AuthFailure, KeyProvider};
use chrono::{DateTime, Utc};

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::db::Database;
use crate::error::Result;
use crate::rules::{snapshot, RuleHandle, RuleInput};
use crate::types::{parse_ts, Clock, RawRecord, RecallPolicy, RecordId, StoredText};

/// Decrypt a stored field against its record-identity AAD. Plaintext fields
/// pass through; sealed fields require a key the provider still holds.
pub(crate) fn open_stored(
    keys: &KeyProvider,
    record: &RawRecord,
    field: &StoredText,
    is_summary: bool,
) -> std::result::Result<String, AuthFailure> {
    match field {
        StoredText::Plain(s) => Ok(s.clone()),
        StoredText::Sealed(env) => {
            let key = keys.by_kid(&env.kid).ok_or(AuthFailure)?;
            let aad = if is_summary {
                aad::summary_aad(&record.kind, &record.key, &record.ts)
            } else {
                aad::record_aad(&record.kind, &record.key, &record.ts)
            };
            let plaintext = env.open_bound(key, &aad)?;
            String::from_utf8(plaintext).map_err(|_| AuthFailure)
        }
    }
}

/// A candidate that passed (or was inspected by) the gate, with the
/// decrypted text the retriever needs for snippets.
#[derive(Clone, Debug)]
pub struct GateItem {
    pub id: RecordId,
    pub include: bool,
    pub context_only: bool,
    pub recall_policy: RecallPolicy,
    pub boost: f32,
    pub kind: String,
    pub ts: Option<DateTime<Utc>>,
    pub value: String,
    pub summary: Option<String>,
}

/// The gate holds a narrow read-only view of the store: it never sees the
/// ingestion pipeline.
pub struct ConsentGate {
    db: Arc<Database>,
    rules: RuleHandle,
    keys: Arc<KeyProvider>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl ConsentGate {
    pub fn new(
        db: Arc<Database>,
        rules: RuleHandle,
        keys: Arc<KeyProvider>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { db, rules, keys, audit, clock }
    }

    /// All record ids with a consent row.
    pub fn consented_ids(&self) -> Result<HashSet<RecordId>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT memory_id FROM consent")?;
        let ids = stmt
            .query_map([], |r| r.get::<_, RecordId>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    /// Evaluate a set of candidate ids. With `enforce`, excluded records get
    /// `include = false`; without it every loadable record is included (the
    /// internal path for rebuilds — the audited bypass lives in [`apply`]).
    ///
    /// [`apply`]: ConsentGate::apply
    pub fn lookup(&self, ids: &[RecordId], enforce: bool) -> Result<HashMap<RecordId, GateItem>> {
        let rules = snapshot(&self.rules);
        let consented = if enforce { self.consented_ids()? } else { HashSet::new() };
        let mut out = HashMap::with_capacity(ids.len());

        for &id in ids {
            let Some(record) = self.db.record_by_id(id)? else {
                continue;
            };
            let value = match self.open_field(&record, &record.value, false) {
                Ok(v) => v,
                Err(AuthFailure) => {
                    self.elide(id);
                    continue;
                }
            };
            let summary = match &record.summary {
                Some(field) => match self.open_field(&record, field, true) {
                    Ok(s) => Some(s),
                    Err(AuthFailure) => {
                        self.elide(id);
                        continue;
                    }
                },
                None => None,
            };

            let input = RuleInput {
                kind: &record.kind,
                value: &value,
                tags: &record.tags,
                speaker: record.speaker(),
            };
            let decision = rules.evaluate(&input);

            let include = if enforce {
                // Defensive: never surface a record the rules refuse to
                // store, and hold consent-gated records until granted.
                decision.allow_store && (!decision.requires_consent || consented.contains(&id))
            } else {
                true
            };

            out.insert(
                id,
                GateItem {
                    id,
                    include,
                    context_only: decision.recall_policy == RecallPolicy::ContextOnly,
                    recall_policy: decision.recall_policy,
                    boost: decision.boost,
                    kind: record.kind.clone(),
                    ts: parse_ts(&record.ts),
                    value,
                    summary,
                },
            );
        }
        Ok(out)
    }

    /// Filter a candidate id set down to the included ones.
    pub fn filter(&self, ids: &[RecordId]) -> Result<HashMap<RecordId, GateItem>> {
        let mut items = self.lookup(ids, true)?;
        items.retain(|_, item| item.include);
        Ok(items)
    }

    /// Wrap a scored candidate sequence: drop excluded ids, preserve order,
    /// annotate survivors. `apply_gate = false` keeps everything and is
    /// explicitly audited.
    pub fn apply(
        &self,
        candidates: &[(RecordId, f32)],
        apply_gate: bool,
    ) -> Result<Vec<(f32, GateItem)>> {
        if !apply_gate {
            self.audit.record(
                AuditEvent::new(self.clock.now(), AuditAction::GateBypassed)
                    .with_detail(format!("{} candidates", candidates.len())),
            );
        }
        let ids: Vec<RecordId> = candidates.iter().map(|(id, _)| *id).collect();
        let items = self.lookup(&ids, apply_gate)?;
        Ok(candidates
            .iter()
            .filter_map(|(id, score)| {
                items.get(id).filter(|item| item.include).map(|item| (*score, item.clone()))
            })
            .collect())
    }

    fn open_field(
        &self,
        record: &RawRecord,
        field: &StoredText,
        is_summary: bool,
    ) -> std::result::Result<String, AuthFailure> {
        open_stored(&self.keys, record, field, is_summary)
    }

    /// One undecryptable record never fails the read: drop it, log once per
    /// occurrence, audit.
    fn elide(&self, id: RecordId) {
        tracing::warn!(id, "record failed envelope authentication; elided from results");
        self.audit.record(
            AuditEvent::new(self.clock.now(), AuditAction::DecryptFailed { id }).with_failure(),
        );
    }
}
