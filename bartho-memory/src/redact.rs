//! Redactor: rewrite matched spans before anything downstream sees the value.
//!
//! Pure and idempotent for the same inputs. A malformed pattern returns the
//! input unchanged — redaction never raises.

use regex::{NoExpand, RegexBuilder};

pub const MASK: &str = "****";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedactStrategy {
    /// Replace each match with `"****"`.
    Mask,
    /// Replace each match with the empty string.
    Remove,
    /// Replace each match with a literal.
    Replace(String),
}

impl RedactStrategy {
    /// Parse the configuration spelling: `mask`, `remove`, `replace:<literal>`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mask" => Some(RedactStrategy::Mask),
            "remove" => Some(RedactStrategy::Remove),
            _ => s.strip_prefix("replace:").map(|lit| RedactStrategy::Replace(lit.to_string())),
        }
    }

    fn replacement(&self) -> &str {
        match self {
            RedactStrategy::Mask => MASK,
            RedactStrategy::Remove => "",
            RedactStrategy::Replace(lit) => lit,
        }
    }
}

/// Apply one strategy over every case-insensitive match of `pattern`.
///
/// With no pattern the whole value is the matched span (a kind-only redact
/// rule redacts everything).
pub fn redact(value: &str, pattern: Option<&str>, strategy: &RedactStrategy) -> String {
    let Some(pattern) = pattern else {
        return strategy.replacement().to_string();
    };
    let re = match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => re,
        Err(_) => {
            tracing::warn!("malformed redaction pattern; value left unchanged");
            return value.to_string();
        }
    };
    // NoExpand: the replacement is always literal, `$` has no meaning.
    re.replace_all(value, NoExpand(strategy.replacement())).into_owned()
}
