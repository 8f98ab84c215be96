//! Full-text index operations.
//!
//! The FTS row identity *is* the record id (`memory_fts.rowid = records.id`),
//! so cascade and rebuild logic never needs a mapping table. All content
//! written here is sanitized index text — summary or redacted value — never
//! raw input, never ciphertext.

use rusqlite::{types::Value as SqlValue, Connection};

use crate::error::{MemoryError, Result};
use crate::types::{format_ts, RecordId, RetrieveFilters};

/// Insert-or-replace the FTS row for a record.
pub fn replace_row(conn: &Connection, id: RecordId, content: &str, kind: &str) -> Result<()> {
    delete_row(conn, id)?;
    conn.execute(
        "INSERT INTO memory_fts (rowid, content, kind) VALUES (?1, ?2, ?3)",
        rusqlite::params![id, content, kind],
    )
    .map_err(|e| MemoryError::Index(e.to_string()))?;
    Ok(())
}

/// Remove the FTS row for a record, if any.
pub fn delete_row(conn: &Connection, id: RecordId) -> Result<()> {
    conn.execute("DELETE FROM memory_fts WHERE rowid = ?1", [id])
        .map_err(|e| MemoryError::Index(e.to_string()))?;
    Ok(())
}

/// Wipe and repopulate the index from `(id, content, kind)` rows.
pub fn rebuild(conn: &Connection, rows: &[(RecordId, String, String)]) -> Result<()> {
    conn.execute("DELETE FROM memory_fts", [])
        .map_err(|e| MemoryError::Index(e.to_string()))?;
    for (id, content, kind) in rows {
        conn.execute(
            "INSERT INTO memory_fts (rowid, content, kind) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, content, kind],
        )
        .map_err(|e| MemoryError::Index(e.to_string()))?;
    }
    Ok(())
}

/// Search, ordered by descending raw score (negated bm25). Returns at most
/// `limit` rows; the caller over-fetches and gates.
pub fn search(
    conn: &Connection,
    query: &str,
    limit: usize,
    filters: &RetrieveFilters,
) -> Result<Vec<(RecordId, f32)>> {
    let Some(match_expr) = sanitize_match_query(query) else {
        return Ok(Vec::new());
    };

    let mut sql = String::from(
        "SELECT memory_fts.rowid, bm25(memory_fts) FROM memory_fts
         JOIN records r ON r.id = memory_fts.rowid
         WHERE memory_fts MATCH ?",
    );
    let mut params: Vec<SqlValue> = vec![SqlValue::Text(match_expr)];
    push_filters(&mut sql, &mut params, filters);
    sql.push_str(" ORDER BY bm25(memory_fts) LIMIT ?");
    params.push(SqlValue::Integer(limit as i64));

    let mut stmt = conn.prepare(&sql).map_err(|e| MemoryError::Index(e.to_string()))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), |r| {
            let id: RecordId = r.get(0)?;
            let rank: f64 = r.get(1)?;
            Ok((id, -rank as f32))
        })
        .map_err(|e| MemoryError::Index(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| MemoryError::Index(e.to_string()))?;
    Ok(rows)
}

/// Quote each token so user text can never inject FTS5 query syntax.
/// Returns `None` for queries with no indexable tokens.
fn sanitize_match_query(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

/// Append kind/time filters shared by both retrieval channels.
pub(crate) fn push_filters(sql: &mut String, params: &mut Vec<SqlValue>, filters: &RetrieveFilters) {
    if let Some(kinds) = &filters.kinds {
        if !kinds.is_empty() {
            sql.push_str(" AND r.kind IN (");
            for (i, kind) in kinds.iter().enumerate() {
                if i > 0 {
                    sql.push(',');
                }
                sql.push('?');
                params.push(SqlValue::Text(kind.clone()));
            }
            sql.push(')');
        }
    }
    if let Some(after) = &filters.after {
        sql.push_str(" AND r.ts >= ?");
        params.push(SqlValue::Text(format_ts(after)));
    }
    if let Some(before) = &filters.before {
        sql.push_str(" AND r.ts <= ?");
        params.push(SqlValue::Text(format_ts(before)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::{Duration, Utc};

    fn seed(db: &Database) {
        let conn = db.conn();
        let now = Utc::now();
        for (id, kind, content, age_hours) in [
            (1i64, "chat", "the quick brown fox jumped", 1i64),
            (2, "chat", "a lazy dog sleeps all day", 2),
            (3, "note", "foxes are quick and clever", 50),
        ] {
            conn.execute(
                "INSERT INTO records (id, kind, key, value, ts) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    id,
                    kind,
                    format!("k{}", id),
                    content,
                    format_ts(&(now - Duration::hours(age_hours)))
                ],
            )
            .unwrap();
            replace_row(&conn, id, content, kind).unwrap();
        }
    }

    #[test]
    fn search_orders_by_relevance() {
        let db = Database::open(None, "porter").unwrap();
        seed(&db);
        let conn = db.conn();
        let hits = search(&conn, "quick fox", 10, &RetrieveFilters::default()).unwrap();
        assert!(hits.len() >= 2);
        // Both fox rows beat the dog row; scores descend.
        for pair in hits.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
        assert!(hits.iter().any(|(id, _)| *id == 1));
        assert!(hits.iter().any(|(id, _)| *id == 3));
    }

    #[test]
    fn kind_filter_restricts_results() {
        let db = Database::open(None, "porter").unwrap();
        seed(&db);
        let conn = db.conn();
        let filters = RetrieveFilters { kinds: Some(vec!["note".into()]), ..Default::default() };
        let hits = search(&conn, "quick", 10, &filters).unwrap();
        assert_eq!(hits.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn time_filter_restricts_results() {
        let db = Database::open(None, "porter").unwrap();
        seed(&db);
        let conn = db.conn();
        let filters = RetrieveFilters {
            after: Some(Utc::now() - Duration::hours(10)),
            ..Default::default()
        };
        let hits = search(&conn, "quick", 10, &filters).unwrap();
        assert_eq!(hits.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn empty_query_returns_nothing() {
        let db = Database::open(None, "porter").unwrap();
        seed(&db);
        let conn = db.conn();
        assert!(search(&conn, "", 10, &RetrieveFilters::default()).unwrap().is_empty());
        assert!(search(&conn, "  …—  ", 10, &RetrieveFilters::default()).unwrap().is_empty());
    }

    #[test]
    fn query_syntax_cannot_inject() {
        let db = Database::open(None, "porter").unwrap();
        seed(&db);
        let conn = db.conn();
        // Raw FTS5 operators in user text are neutralized by quoting.
        let hits = search(&conn, "quick AND) NEAR( fox*", 10, &RetrieveFilters::default());
        assert!(hits.is_ok());
    }

    #[test]
    fn replace_row_is_idempotent_per_id() {
        let db = Database::open(None, "porter").unwrap();
        seed(&db);
        let conn = db.conn();
        replace_row(&conn, 1, "replacement text entirely", "chat").unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_fts WHERE rowid = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let hits = search(&conn, "replacement", 10, &RetrieveFilters::default()).unwrap();
        assert_eq!(hits[0].0, 1);
        // Old tokens are gone.
        let old = search(&conn, "brown", 10, &RetrieveFilters::default()).unwrap();
        assert!(old.iter().all(|(id, _)| *id != 1));
    }

    #[test]
    fn rebuild_replaces_all_rows() {
        let db = Database::open(None, "porter").unwrap();
        seed(&db);
        let conn = db.conn();
        rebuild(&conn, &[(2, "only row left".into(), "chat".into())]).unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM memory_fts", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }
}
