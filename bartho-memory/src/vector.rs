//! Vector store: persistent embeddings keyed by record id, exact cosine
//! search over eligible rows.
//!
//! Vectors from different `(provider, model, dim)` tuples are never mixed at
//! query time unless the caller passes an explicit mismatch override. Exact
//! scan is the default backend — fine below ~10⁴ rows; an approximate index
//! could back the same interface without touching the gate.

use rusqlite::{types::Value as SqlValue, Connection};

use crate::embed::{dot, l2_norm, ModelIdentity};
use crate::error::{MemoryError, Result};
use crate::fts::push_filters;
use crate::types::{EmbedSource, RecordId, RetrieveFilters};

/// One embedding row as persisted.
#[derive(Clone, Debug)]
pub struct EmbeddingRow {
    pub memory_id: RecordId,
    pub source: EmbedSource,
    pub provider: String,
    pub model: String,
    pub dim: usize,
    pub vec: Vec<f32>,
    pub norm: f32,
}

impl EmbeddingRow {
    pub fn new(memory_id: RecordId, source: EmbedSource, identity: &ModelIdentity, vec: Vec<f32>) -> Self {
        let norm = l2_norm(&vec);
        Self {
            memory_id,
            source,
            provider: identity.provider.clone(),
            model: identity.model.clone(),
            dim: identity.dim,
            vec,
            norm,
        }
    }
}

/// Delete any prior rows for the record and insert the new set.
pub fn replace_rows(conn: &Connection, id: RecordId, rows: &[EmbeddingRow]) -> Result<()> {
    delete_rows(conn, id)?;
    for row in rows {
        conn.execute(
            "INSERT INTO embeddings (memory_id, source, provider, model, dim, vec, norm)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                row.memory_id,
                row.source.as_str(),
                row.provider,
                row.model,
                row.dim as i64,
                vec_to_blob(&row.vec),
                row.norm as f64,
            ],
        )
        .map_err(|e| MemoryError::Index(e.to_string()))?;
    }
    Ok(())
}

pub fn delete_rows(conn: &Connection, id: RecordId) -> Result<()> {
    conn.execute("DELETE FROM embeddings WHERE memory_id = ?1", [id])
        .map_err(|e| MemoryError::Index(e.to_string()))?;
    Ok(())
}

pub fn rows_for(conn: &Connection, id: RecordId) -> Result<Vec<EmbeddingRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT memory_id, source, provider, model, dim, vec, norm
             FROM embeddings WHERE memory_id = ?1",
        )
        .map_err(|e| MemoryError::Index(e.to_string()))?;
    let rows = stmt
        .query_map([id], map_row)
        .map_err(|e| MemoryError::Index(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| MemoryError::Index(e.to_string()))?;
    Ok(rows)
}

/// Cosine search over rows matching the producer tuple (unless explicitly
/// overridden). Multiple sources per record collapse to the best score.
/// Returns at most `limit` `(id, cosine)` pairs, descending.
pub fn search(
    conn: &Connection,
    qvec: &[f32],
    limit: usize,
    identity: Option<&ModelIdentity>,
    allow_mismatch: bool,
    filters: &RetrieveFilters,
) -> Result<Vec<(RecordId, f32)>> {
    if limit == 0 || qvec.is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = String::from(
        "SELECT e.memory_id, e.vec FROM embeddings e
         JOIN records r ON r.id = e.memory_id
         WHERE 1=1",
    );
    let mut params: Vec<SqlValue> = Vec::new();
    if !allow_mismatch {
        if let Some(id) = identity {
            sql.push_str(" AND e.provider = ? AND e.model = ? AND e.dim = ?");
            params.push(SqlValue::Text(id.provider.clone()));
            params.push(SqlValue::Text(id.model.clone()));
            params.push(SqlValue::Integer(id.dim as i64));
        }
    }
    push_filters(&mut sql, &mut params, filters);

    let mut stmt = conn.prepare(&sql).map_err(|e| MemoryError::Index(e.to_string()))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), |r| {
            let id: RecordId = r.get(0)?;
            let blob: Vec<u8> = r.get(1)?;
            Ok((id, blob))
        })
        .map_err(|e| MemoryError::Index(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| MemoryError::Index(e.to_string()))?;

    // Exact scan; best score per record across its sources.
    let mut best: std::collections::HashMap<RecordId, f32> = std::collections::HashMap::new();
    for (id, blob) in rows {
        let vec = blob_to_vec(&blob);
        if vec.len() != qvec.len() {
            continue;
        }
        let score = dot(qvec, &vec);
        let entry = best.entry(id).or_insert(f32::MIN);
        if score > *entry {
            *entry = score;
        }
    }

    let mut scored: Vec<(RecordId, f32)> = best.into_iter().collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    Ok(scored)
}

// ---------------------------------------------------------------------------
// Blob encoding: little-endian f32, audit-friendly fixed layout
// ---------------------------------------------------------------------------

pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vec.len() * 4);
    for x in vec {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn map_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<EmbeddingRow> {
    let source: String = r.get(1)?;
    let dim: i64 = r.get(4)?;
    let blob: Vec<u8> = r.get(5)?;
    let norm: f64 = r.get(6)?;
    Ok(EmbeddingRow {
        memory_id: r.get(0)?,
        source: EmbedSource::from_str(&source).unwrap_or(EmbedSource::Full),
        provider: r.get(2)?,
        model: r.get(3)?,
        dim: dim as usize,
        vec: blob_to_vec(&blob),
        norm: norm as f32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::embed::hash_embed;
    use crate::types::format_ts;
    use chrono::Utc;

    fn identity(dim: usize) -> ModelIdentity {
        ModelIdentity { provider: "local".into(), model: "hash-v1".into(), dim }
    }

    fn seed_record(conn: &Connection, id: RecordId, kind: &str, text: &str) {
        conn.execute(
            "INSERT INTO records (id, kind, key, value, ts) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![id, kind, format!("k{}", id), text, format_ts(&Utc::now())],
        )
        .unwrap();
    }

    #[test]
    fn blob_roundtrip() {
        let v = vec![0.25f32, -1.5, 3.75, 0.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn search_ranks_by_cosine() {
        let db = Database::open(None, "porter").unwrap();
        let conn = db.conn();
        let id64 = identity(64);
        for (id, text) in [(1i64, "red fox in the woods"), (2, "stock market crashed today")] {
            seed_record(&conn, id, "chat", text);
            let row = EmbeddingRow::new(id, EmbedSource::Full, &id64, hash_embed(text, 64));
            replace_rows(&conn, id, &[row]).unwrap();
        }
        let q = hash_embed("a fox in the woods", 64);
        let hits = search(&conn, &q, 10, Some(&id64), false, &RetrieveFilters::default()).unwrap();
        assert_eq!(hits[0].0, 1);
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn tuple_mismatch_is_excluded_without_override() {
        let db = Database::open(None, "porter").unwrap();
        let conn = db.conn();
        let old = ModelIdentity { provider: "local".into(), model: "hash-v0".into(), dim: 64 };
        seed_record(&conn, 1, "chat", "text");
        let row = EmbeddingRow::new(1, EmbedSource::Full, &old, hash_embed("text", 64));
        replace_rows(&conn, 1, &[row]).unwrap();

        let q = hash_embed("text", 64);
        let gated =
            search(&conn, &q, 10, Some(&identity(64)), false, &RetrieveFilters::default()).unwrap();
        assert!(gated.is_empty());

        let overridden =
            search(&conn, &q, 10, Some(&identity(64)), true, &RetrieveFilters::default()).unwrap();
        assert_eq!(overridden.len(), 1);
    }

    #[test]
    fn multiple_sources_collapse_to_best() {
        let db = Database::open(None, "porter").unwrap();
        let conn = db.conn();
        let id64 = identity(64);
        seed_record(&conn, 1, "chat", "text");
        let rows = vec![
            EmbeddingRow::new(1, EmbedSource::Summary, &id64, hash_embed("summary words", 64)),
            EmbeddingRow::new(1, EmbedSource::Full, &id64, hash_embed("full body words", 64)),
        ];
        replace_rows(&conn, 1, &rows).unwrap();
        let q = hash_embed("full body words", 64);
        let hits = search(&conn, &q, 10, Some(&id64), false, &RetrieveFilters::default()).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].1 > 0.9);
    }

    #[test]
    fn replace_rows_removes_stale_vectors() {
        let db = Database::open(None, "porter").unwrap();
        let conn = db.conn();
        let id64 = identity(64);
        seed_record(&conn, 1, "chat", "text");
        let row = EmbeddingRow::new(1, EmbedSource::Full, &id64, hash_embed("old", 64));
        replace_rows(&conn, 1, &[row]).unwrap();
        let row = EmbeddingRow::new(1, EmbedSource::Full, &id64, hash_embed("new", 64));
        replace_rows(&conn, 1, &[row]).unwrap();
        assert_eq!(rows_for(&conn, 1).unwrap().len(), 1);
    }

    #[test]
    fn stored_norm_is_unit() {
        let id64 = identity(32);
        let row = EmbeddingRow::new(1, EmbedSource::Full, &id64, hash_embed("anything", 32));
        assert!((row.norm - 1.0).abs() < 1e-5);
    }
}
