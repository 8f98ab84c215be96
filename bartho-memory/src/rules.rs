//! Rule engine: deterministic classification of an incoming record to a
//! normalized policy decision.
//!
//! A rule set is an ordered list of `{match, metadata}` pairs grouped into
//! sections. Section membership defines defaults; the `metadata` block may
//! override any decision field. Sections compose by field overwrite in the
//! fixed order `never_store → ask_before_store → context_only → redact →
//! always_keep → auto_expire`, with the first matching rule per section
//! contributing.
//!
//! Failure posture: an invalid regex or unknown field value logs and skips —
//! rule evaluation never raises.

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::sync::{Arc, RwLock};

use crate::redact::RedactStrategy;
use crate::types::RecallPolicy;

// ---------------------------------------------------------------------------
// Decision fields
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EncryptLevel {
    #[default]
    None,
    Standard,
    Strong,
}

impl EncryptLevel {
    pub fn is_some(&self) -> bool {
        !matches!(self, EncryptLevel::None)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SummaryMode {
    SummaryOnly,
    #[default]
    SummaryAlso,
    FullAlways,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EmbedSelect {
    None,
    #[default]
    Summary,
    Full,
    Both,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FtsIndexMode {
    #[default]
    SummaryPreferred,
    ValuePreferred,
}

/// Normalized policy for one record, every field default-initialized.
///
/// This is the typed replacement for the ad-hoc evaluated map that would
/// otherwise flow through the pipeline; no dynamic values cross module
/// boundaries.
#[derive(Clone, Debug)]
pub struct RuleDecision {
    pub allow_store: bool,
    pub requires_consent: bool,
    pub recall_policy: RecallPolicy,
    pub redact_strategy: Option<RedactStrategy>,
    /// Content regex (source form) of the rule that contributed the
    /// redaction strategy; the redactor rewrites its matches.
    pub redact_pattern: Option<String>,
    pub encrypt: EncryptLevel,
    pub summarize: bool,
    pub summary_mode: SummaryMode,
    pub embed: EmbedSelect,
    pub embed_store: bool,
    pub embed_remote_ok: bool,
    pub fts_index: bool,
    pub fts_index_mode: FtsIndexMode,
    /// Multiplicative retrieval boost (`retrieval.boost`).
    pub boost: f32,
}

impl Default for RuleDecision {
    fn default() -> Self {
        Self {
            allow_store: true,
            requires_consent: false,
            recall_policy: RecallPolicy::None,
            redact_strategy: None,
            redact_pattern: None,
            encrypt: EncryptLevel::None,
            summarize: false,
            summary_mode: SummaryMode::SummaryAlso,
            embed: EmbedSelect::Summary,
            embed_store: false,
            embed_remote_ok: false,
            fts_index: true,
            fts_index_mode: FtsIndexMode::SummaryPreferred,
            boost: 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Rule set definition (serde form)
// ---------------------------------------------------------------------------

/// Match criteria. Every present key must match the record.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MatchDef {
    pub kind: Option<String>,
    pub speaker: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Case-insensitive regex over the record value.
    pub content: Option<String>,
}

/// One rule as it appears in configuration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RuleDef {
    #[serde(rename = "match", default)]
    pub match_: MatchDef,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// The six sections, in composition order.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RuleSetDef {
    #[serde(default)]
    pub never_store: Vec<RuleDef>,
    #[serde(default)]
    pub ask_before_store: Vec<RuleDef>,
    #[serde(default)]
    pub context_only: Vec<RuleDef>,
    #[serde(default)]
    pub redact: Vec<RuleDef>,
    #[serde(default)]
    pub always_keep: Vec<RuleDef>,
    #[serde(default)]
    pub auto_expire: Vec<RuleDef>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Section {
    NeverStore,
    AskBeforeStore,
    ContextOnly,
    Redact,
    AlwaysKeep,
    AutoExpire,
}

impl Section {
    pub fn name(&self) -> &'static str {
        match self {
            Section::NeverStore => "never_store",
            Section::AskBeforeStore => "ask_before_store",
            Section::ContextOnly => "context_only",
            Section::Redact => "redact",
            Section::AlwaysKeep => "always_keep",
            Section::AutoExpire => "auto_expire",
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled rules
// ---------------------------------------------------------------------------

/// What the engine matches against.
#[derive(Clone, Copy, Debug)]
pub struct RuleInput<'a> {
    pub kind: &'a str,
    pub value: &'a str,
    pub tags: &'a [String],
    pub speaker: Option<&'a str>,
}

struct Rule {
    kind: Option<String>,
    speaker: Option<String>,
    tags: Vec<String>,
    content: Option<Regex>,
    content_src: Option<String>,
    metadata: serde_json::Value,
}

impl Rule {
    fn compile(def: &RuleDef, section: Section) -> Option<Self> {
        let content = match &def.match_.content {
            Some(src) => match RegexBuilder::new(src).case_insensitive(true).build() {
                Ok(re) => Some(re),
                Err(_) => {
                    tracing::warn!(section = section.name(), "invalid content regex; rule skipped");
                    return None;
                }
            },
            None => None,
        };
        Some(Self {
            kind: def.match_.kind.clone(),
            speaker: def.match_.speaker.clone(),
            tags: def.match_.tags.clone(),
            content,
            content_src: def.match_.content.clone(),
            metadata: def.metadata.clone(),
        })
    }

    fn matches(&self, input: &RuleInput<'_>) -> bool {
        if let Some(kind) = &self.kind {
            if kind != input.kind {
                return false;
            }
        }
        if let Some(speaker) = &self.speaker {
            if input.speaker != Some(speaker.as_str()) {
                return false;
            }
        }
        for tag in &self.tags {
            if !input.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(re) = &self.content {
            if !re.is_match(input.value) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Rule set
// ---------------------------------------------------------------------------

/// Compiled, immutable rule set. Swapped atomically on reload.
pub struct RuleSet {
    sections: Vec<(Section, Vec<Rule>)>,
}

/// Shared snapshot handle: readers clone the inner `Arc` and evaluate
/// against an immutable set; a reload swaps the `Arc` so a single ingestion
/// never spans two rule versions.
pub type RuleHandle = Arc<RwLock<Arc<RuleSet>>>;

pub fn new_handle(set: RuleSet) -> RuleHandle {
    Arc::new(RwLock::new(Arc::new(set)))
}

pub fn snapshot(handle: &RuleHandle) -> Arc<RuleSet> {
    handle.read().expect("rule snapshot lock").clone()
}

pub fn swap(handle: &RuleHandle, set: RuleSet) {
    *handle.write().expect("rule snapshot lock") = Arc::new(set);
}

impl RuleSet {
    pub fn compile(def: &RuleSetDef) -> Self {
        let section = |s: Section, defs: &[RuleDef]| {
            (s, defs.iter().filter_map(|d| Rule::compile(d, s)).collect::<Vec<_>>())
        };
        Self {
            sections: vec![
                section(Section::NeverStore, &def.never_store),
                section(Section::AskBeforeStore, &def.ask_before_store),
                section(Section::ContextOnly, &def.context_only),
                section(Section::Redact, &def.redact),
                section(Section::AlwaysKeep, &def.always_keep),
                section(Section::AutoExpire, &def.auto_expire),
            ],
        }
    }

    /// Conservative built-in set: keep the safety audit trail out of the
    /// retrieval indexes but always storable, pin user profiles, and mask
    /// obvious credential spans.
    pub fn builtin() -> Self {
        let def = RuleSetDef {
            always_keep: vec![
                RuleDef {
                    match_: MatchDef { kind: Some("safety.audit".into()), ..Default::default() },
                    metadata: serde_json::json!({
                        "fts_index": false,
                        "embed": "none",
                    }),
                },
                RuleDef {
                    match_: MatchDef { kind: Some("user_profile".into()), ..Default::default() },
                    metadata: serde_json::Value::Null,
                },
            ],
            redact: vec![RuleDef {
                match_: MatchDef {
                    content: Some(r"(?i)\b(password|passphrase|api[_-]?key)\b\S*".into()),
                    ..Default::default()
                },
                metadata: serde_json::json!({ "redact_strategy": "mask" }),
            }],
            ..Default::default()
        };
        Self::compile(&def)
    }

    /// Evaluate a record against every section, composing the decision.
    pub fn evaluate(&self, input: &RuleInput<'_>) -> RuleDecision {
        let mut decision = RuleDecision::default();
        for (section, rules) in &self.sections {
            if let Some(rule) = rules.iter().find(|r| r.matches(input)) {
                apply_section_defaults(&mut decision, *section, rule);
                apply_overrides(&mut decision, rule);
            }
        }
        decision
    }
}

fn apply_section_defaults(d: &mut RuleDecision, section: Section, rule: &Rule) {
    match section {
        Section::NeverStore => d.allow_store = false,
        Section::AskBeforeStore => d.requires_consent = true,
        Section::ContextOnly => d.recall_policy = RecallPolicy::ContextOnly,
        Section::Redact => {
            d.redact_strategy = Some(RedactStrategy::Mask);
            d.redact_pattern = rule.content_src.clone();
        }
        Section::AlwaysKeep => d.recall_policy = RecallPolicy::AlwaysKeep,
        Section::AutoExpire => d.recall_policy = RecallPolicy::AutoExpire,
    }
}

fn apply_overrides(d: &mut RuleDecision, rule: &Rule) {
    let Some(meta) = rule.metadata.as_object() else {
        return;
    };
    for (key, value) in meta {
        match key.as_str() {
            "allow_store" => set_bool(&mut d.allow_store, value, key),
            "requires_consent" => set_bool(&mut d.requires_consent, value, key),
            "summarize" => set_bool(&mut d.summarize, value, key),
            "embed_store" => set_bool(&mut d.embed_store, value, key),
            "embed_remote_ok" => set_bool(&mut d.embed_remote_ok, value, key),
            "fts_index" => set_bool(&mut d.fts_index, value, key),
            "recall_policy" => match value.as_str().and_then(RecallPolicy::parse) {
                Some(p) => d.recall_policy = p,
                None => skip(key),
            },
            "redact_strategy" => match value {
                serde_json::Value::Null => {
                    d.redact_strategy = None;
                    d.redact_pattern = None;
                }
                _ => match value.as_str().and_then(RedactStrategy::parse) {
                    Some(s) => {
                        d.redact_strategy = Some(s);
                        if rule.content_src.is_some() {
                            d.redact_pattern = rule.content_src.clone();
                        }
                    }
                    None => skip(key),
                },
            },
            "encrypt" => match parse_encrypt(value) {
                Some(level) => d.encrypt = level,
                None => skip(key),
            },
            "summary_mode" => match value.as_str() {
                Some("summary_only") => d.summary_mode = SummaryMode::SummaryOnly,
                Some("summary_also") => d.summary_mode = SummaryMode::SummaryAlso,
                Some("full_always") => d.summary_mode = SummaryMode::FullAlways,
                _ => skip(key),
            },
            "embed" => match value.as_str() {
                Some("none") => d.embed = EmbedSelect::None,
                Some("summary") => d.embed = EmbedSelect::Summary,
                Some("full") => d.embed = EmbedSelect::Full,
                Some("both") => d.embed = EmbedSelect::Both,
                _ => skip(key),
            },
            "fts_index_mode" => match value.as_str() {
                Some("summary_preferred") => d.fts_index_mode = FtsIndexMode::SummaryPreferred,
                Some("value_preferred") => d.fts_index_mode = FtsIndexMode::ValuePreferred,
                _ => skip(key),
            },
            "retrieval.boost" => match value.as_f64() {
                Some(b) => d.boost = b as f32,
                None => skip(key),
            },
            "retrieval" => match value.get("boost").and_then(|b| b.as_f64()) {
                Some(b) => d.boost = b as f32,
                None => skip(key),
            },
            _ => skip(key),
        }
    }
}

/// `true → standard`, `false → none`, plus the explicit level names.
fn parse_encrypt(value: &serde_json::Value) -> Option<EncryptLevel> {
    match value {
        serde_json::Value::Bool(true) => Some(EncryptLevel::Standard),
        serde_json::Value::Bool(false) => Some(EncryptLevel::None),
        serde_json::Value::String(s) => match s.as_str() {
            "none" => Some(EncryptLevel::None),
            "standard" => Some(EncryptLevel::Standard),
            "strong" => Some(EncryptLevel::Strong),
            _ => None,
        },
        _ => None,
    }
}

fn set_bool(slot: &mut bool, value: &serde_json::Value, key: &str) {
    match value.as_bool() {
        Some(b) => *slot = b,
        None => skip(key),
    }
}

fn skip(key: &str) {
    tracing::warn!(field = key, "unknown or malformed rule metadata; field skipped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(kind: &'a str, value: &'a str) -> RuleInput<'a> {
        RuleInput { kind, value, tags: &[], speaker: None }
    }

    fn set_from_json(json: serde_json::Value) -> RuleSet {
        let def: RuleSetDef = serde_json::from_value(json).unwrap();
        RuleSet::compile(&def)
    }

    #[test]
    fn unmatched_records_receive_defaults() {
        let set = RuleSet::compile(&RuleSetDef::default());
        let d = set.evaluate(&input("chat", "hello"));
        assert!(d.allow_store);
        assert!(!d.requires_consent);
        assert_eq!(d.recall_policy, RecallPolicy::None);
        assert_eq!(d.encrypt, EncryptLevel::None);
        assert_eq!(d.embed, EmbedSelect::Summary);
        assert!(!d.embed_store);
        assert!(d.fts_index);
        assert_eq!(d.boost, 1.0);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let set = RuleSet::builtin();
        let rec = input("chat", "my password is hunter2");
        let a = set.evaluate(&rec);
        let b = set.evaluate(&rec);
        assert_eq!(format!("{:?}", a), format!("{:?}", b));
    }

    #[test]
    fn never_store_implies_allow_store_false() {
        let set = set_from_json(serde_json::json!({
            "never_store": [{ "match": { "content": "off the record" } }]
        }));
        assert!(!set.evaluate(&input("chat", "this is OFF THE RECORD")).allow_store);
        assert!(set.evaluate(&input("chat", "normal chatter")).allow_store);
    }

    #[test]
    fn ask_before_store_implies_requires_consent() {
        let set = set_from_json(serde_json::json!({
            "ask_before_store": [{ "match": { "kind": "user_profile" } }]
        }));
        assert!(set.evaluate(&input("user_profile", "x")).requires_consent);
        assert!(!set.evaluate(&input("chat", "x")).requires_consent);
    }

    #[test]
    fn sections_compose_by_overwrite_in_order() {
        // context_only sets recall_policy, then always_keep overwrites it.
        let set = set_from_json(serde_json::json!({
            "context_only": [{ "match": { "kind": "joke" } }],
            "always_keep": [{ "match": { "kind": "joke" } }]
        }));
        let d = set.evaluate(&input("joke", "x"));
        assert_eq!(d.recall_policy, RecallPolicy::AlwaysKeep);
    }

    #[test]
    fn first_matching_rule_per_section_wins() {
        let set = set_from_json(serde_json::json!({
            "redact": [
                { "match": { "content": "secret" }, "metadata": { "redact_strategy": "remove" } },
                { "match": { "content": "secret" }, "metadata": { "redact_strategy": "mask" } }
            ]
        }));
        let d = set.evaluate(&input("chat", "a secret thing"));
        assert_eq!(d.redact_strategy, Some(RedactStrategy::Remove));
    }

    #[test]
    fn redact_section_captures_pattern_and_defaults_to_mask() {
        let set = set_from_json(serde_json::json!({
            "redact": [{ "match": { "content": "(?i)password" } }]
        }));
        let d = set.evaluate(&input("chat", "My PASSWORD here"));
        assert_eq!(d.redact_strategy, Some(RedactStrategy::Mask));
        assert_eq!(d.redact_pattern.as_deref(), Some("(?i)password"));
    }

    #[test]
    fn encrypt_aliases() {
        let set = set_from_json(serde_json::json!({
            "redact": [
                { "match": { "content": "alpha" }, "metadata": { "encrypt": true } },
                { "match": { "content": "beta" }, "metadata": { "encrypt": "strong" } },
                { "match": { "content": "gamma" }, "metadata": { "encrypt": false } }
            ]
        }));
        assert_eq!(set.evaluate(&input("c", "alpha")).encrypt, EncryptLevel::Standard);
        assert_eq!(set.evaluate(&input("c", "beta")).encrypt, EncryptLevel::Strong);
        assert_eq!(set.evaluate(&input("c", "gamma")).encrypt, EncryptLevel::None);
    }

    #[test]
    fn invalid_regex_skips_rule_without_raising() {
        let set = set_from_json(serde_json::json!({
            "never_store": [
                { "match": { "content": "([unclosed" } },
                { "match": { "content": "valid" } }
            ]
        }));
        // Bad rule dropped; the valid one still applies.
        assert!(!set.evaluate(&input("chat", "valid text")).allow_store);
        assert!(set.evaluate(&input("chat", "other text")).allow_store);
    }

    #[test]
    fn unknown_strategy_is_skipped() {
        let set = set_from_json(serde_json::json!({
            "redact": [{ "match": { "content": "x" }, "metadata": { "redact_strategy": "explode" } }]
        }));
        // Section default (mask) survives; the bogus override is ignored.
        let d = set.evaluate(&input("chat", "x"));
        assert_eq!(d.redact_strategy, Some(RedactStrategy::Mask));
    }

    #[test]
    fn tag_and_speaker_matching() {
        let set = set_from_json(serde_json::json!({
            "context_only": [{ "match": { "speaker": "guest", "tags": ["private", "nsfw"] } }]
        }));
        let tags = vec!["nsfw".to_string(), "private".to_string(), "misc".to_string()];
        let hit = RuleInput { kind: "chat", value: "v", tags: &tags, speaker: Some("guest") };
        assert_eq!(set.evaluate(&hit).recall_policy, RecallPolicy::ContextOnly);

        let wrong_speaker = RuleInput { kind: "chat", value: "v", tags: &tags, speaker: Some("owner") };
        assert_eq!(set.evaluate(&wrong_speaker).recall_policy, RecallPolicy::None);

        let missing_tag = RuleInput { kind: "chat", value: "v", tags: &tags[..1], speaker: Some("guest") };
        assert_eq!(set.evaluate(&missing_tag).recall_policy, RecallPolicy::None);
    }

    #[test]
    fn retrieval_boost_both_spellings() {
        let set = set_from_json(serde_json::json!({
            "always_keep": [
                { "match": { "kind": "a" }, "metadata": { "retrieval.boost": 2.0 } },
                { "match": { "kind": "b" }, "metadata": { "retrieval": { "boost": 3.0 } } }
            ]
        }));
        assert_eq!(set.evaluate(&input("a", "v")).boost, 2.0);
        assert_eq!(set.evaluate(&input("b", "v")).boost, 3.0);
    }

    #[test]
    fn snapshot_swap_is_atomic_for_readers() {
        let handle = new_handle(RuleSet::compile(&RuleSetDef::default()));
        let before = snapshot(&handle);
        swap(&handle, RuleSet::builtin());
        let after = snapshot(&handle);
        // The old snapshot keeps working; the new one is independent.
        assert!(before.evaluate(&input("chat", "my password x")).redact_strategy.is_none());
        assert!(after.evaluate(&input("chat", "my password x")).redact_strategy.is_some());
    }
}
