//! End-to-end scenarios over a real on-disk store: the full pipeline from
//! rule evaluation through encryption, indexing, and gated hybrid retrieval.

use std::path::PathBuf;
use std::sync::Arc;

use bartho_memory::{
    AuditAction, InMemoryAuditSink, MemoryConfig, MemoryError, MemoryStore, RetrievalMode,
    RetrieveFilters, SystemClock, UpsertRequest,
};
use chrono::Utc;

fn config(db_path: Option<PathBuf>, rules: Option<serde_json::Value>) -> MemoryConfig {
    let toml = r#"
        [encryption.standard]
        kid = "std"
        key = "1111111111111111111111111111111111111111111111111111111111111111"

        [encryption.strong]
        kid = "str"
        key = "2222222222222222222222222222222222222222222222222222222222222222"
    "#;
    let mut parsed = MemoryConfig::from_toml_str(toml).unwrap();
    parsed.db_path = db_path;
    parsed.memory_rules = rules.map(|json| serde_json::from_value(json).unwrap());
    parsed
}

async fn open(config: MemoryConfig) -> (MemoryStore, Arc<InMemoryAuditSink>) {
    let sink = Arc::new(InMemoryAuditSink::new());
    let store = MemoryStore::open_with(config, None, Arc::new(SystemClock), sink.clone())
        .await
        .unwrap();
    (store, sink)
}

fn req(kind: &str, key: &str, value: &str) -> UpsertRequest {
    UpsertRequest::new(kind, key, value, Utc::now())
}

// === Scenario 1: redact-then-index ===

#[tokio::test]
async fn redact_then_index() {
    let rules = serde_json::json!({
        "redact": [{
            "match": { "content": "(?i)(password|hunter2)" },
            "metadata": { "redact_strategy": "mask", "encrypt": "strong" }
        }]
    });
    let (store, _) = open(config(None, Some(rules))).await;

    let outcome = store.upsert(req("chat", "k1", "my password is hunter2")).await.unwrap();
    assert!(outcome.stored);
    let id = outcome.id.unwrap();

    // Present in the store, sealed; the gate decrypts to the masked form.
    let items = store.gate().filter(&[id]).unwrap();
    assert_eq!(items.get(&id).unwrap().value, "my **** is ****");

    // The secret is unfindable through retrieval.
    let hits = store.retrieve("hunter2", 10, &RetrieveFilters::default(), None).await.unwrap();
    assert!(hits.is_empty());
}

// === Scenario 2: consent gate ===

#[tokio::test]
async fn consent_gate_holds_until_granted() {
    let rules = serde_json::json!({
        "ask_before_store": [{ "match": { "kind": "chat" } }]
    });
    let (store, _) = open(config(None, Some(rules))).await;

    let outcome = store.upsert(req("chat", "k1", "my password routine is boring")).await.unwrap();
    assert!(outcome.needs_consent);
    assert!(!outcome.stored);

    let hits = store.retrieve("password", 10, &RetrieveFilters::default(), None).await.unwrap();
    assert!(hits.is_empty());

    assert!(store.grant_consent("chat", "k1").await.unwrap());
    let hits = store.retrieve("password", 10, &RetrieveFilters::default(), None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert!(!hits[0].context_only);
}

// === Scenario 3: context-only ===

#[tokio::test]
async fn context_only_annotation_travels_to_results() {
    let rules = serde_json::json!({
        "context_only": [{ "match": { "kind": "sensitive_joke" } }]
    });
    let (store, _) = open(config(None, Some(rules))).await;

    store
        .upsert(req("sensitive_joke", "j1", "the one about the parrot and the thermostat"))
        .await
        .unwrap();
    let hits = store
        .retrieve("parrot thermostat", 10, &RetrieveFilters::default(), None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].context_only, "caller must know not to surface this");
}

// === Scenario 4: envelope tamper is elided, never fatal ===

#[tokio::test]
async fn tampered_envelope_is_elided_and_audited() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memories.db");
    let rules = serde_json::json!({
        "redact": [{
            "match": { "content": "(?i)vault" },
            "metadata": { "redact_strategy": "replace:[vault]", "encrypt": "standard" }
        }]
    });

    let id = {
        let (store, _) = open(config(Some(path.clone()), Some(rules.clone()))).await;
        let outcome = store.upsert(req("chat", "k1", "the vault combination story")).await.unwrap();
        store.upsert(req("chat", "k2", "an ordinary plaintext memory")).await.unwrap();
        store.close().await.unwrap();
        outcome.id.unwrap()
    };

    // Flip one character inside the stored ciphertext, out of band.
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        let value: String = conn
            .query_row("SELECT value FROM records WHERE id = ?1", [id], |r| r.get(0))
            .unwrap();
        let mut env: serde_json::Value = serde_json::from_str(&value).unwrap();
        let ct = env["ct"].as_str().unwrap().to_string();
        let mut chars: Vec<char> = ct.chars().collect();
        let mid = chars.len() / 2;
        chars[mid] = if chars[mid] == 'A' { 'B' } else { 'A' };
        env["ct"] = serde_json::Value::String(chars.into_iter().collect());
        conn.execute(
            "UPDATE records SET value = ?1 WHERE id = ?2",
            rusqlite::params![env.to_string(), id],
        )
        .unwrap();
    }

    let (store, sink) = open(config(Some(path), Some(rules))).await;
    // FTS still knows the sanitized tokens, but the record cannot
    // authenticate: it is dropped, the healthy record survives, no panic.
    let hits = store.retrieve("vault combination ordinary plaintext", 10, &RetrieveFilters::default(), None)
        .await
        .unwrap();
    assert!(hits.iter().all(|h| h.id != id));
    assert!(hits.iter().any(|h| h.id != id));
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e.action, AuditAction::DecryptFailed { .. })));
}

// === Scenario 5: hybrid dominates single channels ===

#[tokio::test]
async fn hybrid_hit_rate_dominates_single_channels() {
    let rules = serde_json::json!({
        "always_keep": [{
            "match": { "kind": "memo" },
            "metadata": { "embed": "full", "embed_store": true }
        }]
    });
    let (store, _) = open(config(None, Some(rules))).await;

    // Distractor population.
    for i in 0..40 {
        store
            .upsert(req(
                "memo",
                &format!("noise-{}", i),
                &format!("logistics note number {} about invoices and scheduling", i),
            ))
            .await
            .unwrap();
    }
    // Targets: each query shares tokens with exactly one target.
    let cases = [
        ("t1", "booked the ferry tickets to the island for august", "ferry tickets august island"),
        ("t2", "her favorite constellation is cassiopeia in winter", "constellation cassiopeia winter"),
        ("t3", "the sourdough starter needs feeding every morning", "sourdough starter feeding"),
        ("t4", "we replaced the bike chain after the mountain trail", "bike chain mountain trail"),
        ("t5", "grandmother's soup recipe uses smoked paprika", "soup recipe smoked paprika"),
    ];
    let mut target_ids = Vec::new();
    for (key, value, _) in &cases {
        let outcome = store.upsert(req("memo", key, value)).await.unwrap();
        target_ids.push(outcome.id.unwrap());
    }

    let mut hits_by_mode = std::collections::HashMap::from([
        (format!("{:?}", RetrievalMode::Hybrid), 0usize),
        (format!("{:?}", RetrievalMode::Fts), 0usize),
        (format!("{:?}", RetrievalMode::Vector), 0usize),
    ]);
    for mode in [RetrievalMode::Hybrid, RetrievalMode::Fts, RetrievalMode::Vector] {
        for ((_, _, query), target) in cases.iter().zip(&target_ids) {
            let results = store
                .retrieve(query, 5, &RetrieveFilters::default(), Some(mode))
                .await
                .unwrap();
            if results.iter().any(|r| r.id == *target) {
                *hits_by_mode.get_mut(&format!("{:?}", mode)).unwrap() += 1;
            }
        }
    }

    let hybrid = hits_by_mode[&format!("{:?}", RetrievalMode::Hybrid)];
    let fts = hits_by_mode[&format!("{:?}", RetrievalMode::Fts)];
    let vector = hits_by_mode[&format!("{:?}", RetrievalMode::Vector)];
    assert!(hybrid >= fts.max(vector), "hybrid {} vs fts {} / vector {}", hybrid, fts, vector);
    assert!(hybrid >= 4, "hybrid should place targets in top-5 nearly always");
}

// === Scenario 6: brake round-trip across restart ===

#[tokio::test]
async fn brake_round_trip_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memories.db");

    {
        let (store, _) = open(config(Some(path.clone()), None)).await;
        store.brake_engage(&["writes"]).await.unwrap();

        let err = store.upsert(req("chat", "x", "refused")).await.unwrap_err();
        assert!(matches!(err, MemoryError::BrakeEngaged { scope: "writes" }));

        let status = store.brake_status();
        assert!(status.engaged);
        assert_eq!(status.scopes.iter().collect::<Vec<_>>(), vec!["writes"]);
        store.close().await.unwrap();
    }

    // "Restart": reopen the same file.
    let (store, _) = open(config(Some(path), None)).await;
    let status = store.brake_status();
    assert!(status.engaged, "brake state must survive restart");
    assert_eq!(status.scopes.iter().collect::<Vec<_>>(), vec!["writes"]);

    store.brake_disengage().await.unwrap();
    let outcome = store.upsert(req("chat", "x", "accepted after release")).await.unwrap();
    assert!(outcome.stored);
}

// === Boundary: embedding switch off, FTS-only retrieval still works ===

#[tokio::test]
async fn disabled_embedding_hook_degrades_to_fts() {
    let mut cfg = config(None, None);
    cfg.embedding.enabled = false;
    let (store, _) = open(cfg).await;

    store.upsert(req("chat", "k", "a purely lexical memory about kites")).await.unwrap();
    let hits = store.retrieve("kites", 5, &RetrieveFilters::default(), None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].vec_score.is_none());
}
