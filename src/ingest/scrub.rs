//! Field-name based PII scrubbing
//!
//! Matching is by key name, not by value shape: any object key matching a
//! scrub pattern has its value replaced with the sentinel, recursively
//! through nested objects and arrays. Built-in patterns cover the usual
//! credential and contact fields; deployments add their own via config.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde_json::Value;

/// Replacement written over any matched value
pub const FILTERED: &str = "[FILTERED]";

static BUILTIN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r"password|passwd|secret|token|api_?key|access_?key|authorization|auth|credit_?card|card_?number|cvv|ssn|email",
    )
    .case_insensitive(true)
    .build()
    .expect("builtin scrub pattern compiles")
});

/// Compiled scrub patterns: built-ins plus per-deployment extras
pub struct Scrubber {
    extra: Vec<Regex>,
}

impl Scrubber {
    /// Build a scrubber from extra field-name patterns. Patterns that fail to
    /// compile are skipped with a warning rather than rejecting the config.
    pub fn new(extra_patterns: &[String]) -> Self {
        let extra = extra_patterns
            .iter()
            .filter_map(|p| {
                match RegexBuilder::new(p).case_insensitive(true).build() {
                    Ok(re) => Some(re),
                    Err(e) => {
                        tracing::warn!(pattern = %p, error = %e, "invalid scrub pattern, skipping");
                        None
                    }
                }
            })
            .collect();
        Self { extra }
    }

    fn matches(&self, key: &str) -> bool {
        BUILTIN_PATTERN.is_match(key) || self.extra.iter().any(|re| re.is_match(key))
    }

    /// Scrub a JSON value in place
    pub fn scrub(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    if self.matches(key) {
                        *val = Value::String(FILTERED.to_string());
                    } else {
                        self.scrub(val);
                    }
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.scrub(item);
                }
            }
            _ => {}
        }
    }
}
