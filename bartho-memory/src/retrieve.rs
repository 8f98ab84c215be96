//! Hybrid retriever: fuse FTS and vector candidates with recency shaping
//! and per-kind boosts.
//!
//! Both channels over-fetch, pass through the consent gate, and are min-max
//! normalized before fusion. A degraded channel (FTS backend missing,
//! embedding failure) contributes an empty candidate set and is logged once
//! per process — retrieval itself never fails for channel trouble.

use std::collections::HashMap;
use std::sync::{Arc, Once};

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::config::{Fusion, RetrievalConfig, RetrievalMode};
use crate::db::Database;
use crate::embed::EmbeddingEngine;
use crate::error::Result;
use crate::fts;
use crate::gate::{ConsentGate, GateItem};
use crate::types::{Clock, RecordId, Retrieved, RetrieveFilters};
use crate::vector;

static FTS_CHANNEL_DEGRADED: Once = Once::new();
static VECTOR_CHANNEL_DEGRADED: Once = Once::new();

/// Fan-out factor: each channel pulls this many times the requested k
/// before gating, and the gate itself over-fetches by the same factor.
const OVERFETCH: usize = 3;

pub struct Retriever {
    db: Arc<Database>,
    engine: Arc<EmbeddingEngine>,
    gate: Arc<ConsentGate>,
    config: RetrievalConfig,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

struct Channel {
    /// id → normalized [0,1] score.
    scores: HashMap<RecordId, f32>,
    /// id → 1-based rank (for RRF).
    ranks: HashMap<RecordId, usize>,
}

impl Channel {
    fn empty() -> Self {
        Self { scores: HashMap::new(), ranks: HashMap::new() }
    }

    fn from_gated(gated: &[(f32, GateItem)]) -> Self {
        let mut scores = HashMap::new();
        let mut ranks = HashMap::new();
        let min = gated.iter().map(|(s, _)| *s).fold(f32::INFINITY, f32::min);
        let max = gated.iter().map(|(s, _)| *s).fold(f32::NEG_INFINITY, f32::max);
        for (rank, (score, item)) in gated.iter().enumerate() {
            let normalized = if max > min { (score - min) / (max - min) } else { 1.0 };
            scores.insert(item.id, normalized);
            ranks.insert(item.id, rank + 1);
        }
        Self { scores, ranks }
    }
}

impl Retriever {
    pub fn new(
        db: Arc<Database>,
        engine: Arc<EmbeddingEngine>,
        gate: Arc<ConsentGate>,
        config: RetrievalConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { db, engine, gate, config, clock, audit }
    }

    pub fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filters: &RetrieveFilters,
        mode: Option<RetrievalMode>,
    ) -> Result<Vec<Retrieved>> {
        let query = query.trim();
        if top_k == 0 || query.is_empty() {
            return Ok(Vec::new());
        }
        let mode = mode.unwrap_or(self.config.mode);
        let chan_k = top_k * OVERFETCH;

        let mut items: HashMap<RecordId, GateItem> = HashMap::new();

        let fts_chan = if mode != RetrievalMode::Vector {
            self.fts_channel(query, chan_k, filters, &mut items)?
        } else {
            Channel::empty()
        };
        let vec_chan = if mode != RetrievalMode::Fts {
            self.vector_channel(query, chan_k, filters, &mut items)?
        } else {
            Channel::empty()
        };

        let now = self.clock.now();
        let tau = self.config.recency_half_life_hours.max(f32::EPSILON);

        let mut results: Vec<Retrieved> = items
            .into_values()
            .map(|item| {
                let s_fts = fts_chan.scores.get(&item.id).copied();
                let s_vec = vec_chan.scores.get(&item.id).copied();
                let fused = self.fuse(item.id, s_fts, s_vec, &fts_chan, &vec_chan);

                let age_hours = item
                    .ts
                    .map(|ts| ((now - ts).num_seconds().max(0) as f32) / 3600.0)
                    .unwrap_or(0.0);
                let recency = (-age_hours / tau).exp();
                let score = fused * recency * item.boost;

                Retrieved {
                    id: item.id,
                    score,
                    fts_score: s_fts,
                    vec_score: s_vec,
                    fused_score: fused,
                    snippet: snippet(&item, query),
                    kind: item.kind,
                    timestamp: item.ts.unwrap_or(now),
                    context_only: item.context_only,
                    recall_policy: item.recall_policy,
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                // both channels beats single-channel
                .then_with(|| in_both(b).cmp(&in_both(a)))
                // more recent first
                .then_with(|| b.timestamp.cmp(&a.timestamp))
                // higher id is monotonic with insert time
                .then_with(|| b.id.cmp(&a.id))
        });
        results.truncate(top_k);
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    fn fts_channel(
        &self,
        query: &str,
        chan_k: usize,
        filters: &RetrieveFilters,
        items: &mut HashMap<RecordId, GateItem>,
    ) -> Result<Channel> {
        if !self.db.fts_enabled() {
            return Ok(Channel::empty());
        }
        let raw = {
            let conn = self.db.conn();
            match fts::search(&conn, query, chan_k * OVERFETCH, filters) {
                Ok(raw) => raw,
                Err(e) => {
                    self.degrade("fts", &FTS_CHANNEL_DEGRADED, &e.to_string());
                    return Ok(Channel::empty());
                }
            }
        };
        let mut gated = self.gate.apply(&raw, true)?;
        gated.truncate(chan_k);
        for (_, item) in &gated {
            items.entry(item.id).or_insert_with(|| item.clone());
        }
        Ok(Channel::from_gated(&gated))
    }

    fn vector_channel(
        &self,
        query: &str,
        chan_k: usize,
        filters: &RetrieveFilters,
        items: &mut HashMap<RecordId, GateItem>,
    ) -> Result<Channel> {
        if !self.engine.enabled() {
            return Ok(Channel::empty());
        }
        let qvec = match self.engine.embed(query) {
            Ok(v) => v,
            Err(e) => {
                self.degrade("vector", &VECTOR_CHANNEL_DEGRADED, &e.to_string());
                return Ok(Channel::empty());
            }
        };
        let identity = self.engine.identity();
        let raw = {
            let conn = self.db.conn();
            match vector::search(&conn, &qvec, chan_k * OVERFETCH, Some(&identity), false, filters)
            {
                Ok(raw) => raw,
                Err(e) => {
                    self.degrade("vector", &VECTOR_CHANNEL_DEGRADED, &e.to_string());
                    return Ok(Channel::empty());
                }
            }
        };
        let mut gated = self.gate.apply(&raw, true)?;
        gated.truncate(chan_k);
        for (_, item) in &gated {
            items.entry(item.id).or_insert_with(|| item.clone());
        }
        Ok(Channel::from_gated(&gated))
    }

    fn degrade(&self, channel: &str, once: &Once, detail: &str) {
        once.call_once(|| {
            tracing::warn!(channel, detail, "retrieval channel degraded");
        });
        self.audit.record(
            AuditEvent::new(
                self.clock.now(),
                AuditAction::ChannelDegraded { channel: channel.into() },
            )
            .with_failure(),
        );
    }

    // -----------------------------------------------------------------------
    // Fusion
    // -----------------------------------------------------------------------

    fn fuse(
        &self,
        id: RecordId,
        s_fts: Option<f32>,
        s_vec: Option<f32>,
        fts_chan: &Channel,
        vec_chan: &Channel,
    ) -> f32 {
        match self.config.fusion {
            Fusion::Weighted => {
                // A missing channel is imputed with the mean of the present
                // normalized scores: no cliff at the channel boundary.
                let present: Vec<f32> = [s_fts, s_vec].iter().flatten().copied().collect();
                if present.is_empty() {
                    return 0.0;
                }
                let imputed = present.iter().sum::<f32>() / present.len() as f32;
                let f = s_fts.unwrap_or(imputed);
                let v = s_vec.unwrap_or(imputed);
                self.config.w_fts * f + self.config.w_vec * v
            }
            Fusion::Rrf => {
                let k = self.config.rrf_k;
                let mut score = 0.0;
                if let Some(rank) = fts_chan.ranks.get(&id) {
                    score += 1.0 / (k + *rank as f32);
                }
                if let Some(rank) = vec_chan.ranks.get(&id) {
                    score += 1.0 / (k + *rank as f32);
                }
                score
            }
        }
    }
}

fn in_both(r: &Retrieved) -> u8 {
    u8::from(r.fts_score.is_some() && r.vec_score.is_some())
}

/// Snippet: the summary when present, otherwise a bounded window around the
/// first query-term hit in the (decrypted) redacted value.
fn snippet(item: &GateItem, query: &str) -> String {
    const WINDOW: usize = 160;
    if let Some(summary) = &item.summary {
        return clip(summary, WINDOW * 2);
    }
    let haystack = item.value.to_lowercase();
    let hit = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .filter_map(|t| haystack.find(t))
        .min();
    match hit {
        Some(pos) => {
            let chars: Vec<char> = item.value.chars().collect();
            // pos is a byte offset into the lowercased haystack; count chars
            // there (case folding preserves char positions closely enough
            // for a display window) and clamp into the original.
            let char_pos = haystack[..pos].chars().count().min(chars.len());
            let start = char_pos.saturating_sub(WINDOW / 2);
            let end = (char_pos + WINDOW / 2).min(chars.len());
            let mut out: String = chars[start..end].iter().collect();
            if start > 0 {
                out.insert(0, '…');
            }
            if end < chars.len() {
                out.push('…');
            }
            out
        }
        None => clip(&item.value, WINDOW),
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}
