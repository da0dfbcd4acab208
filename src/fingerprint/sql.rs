//! SQL shape normalization and fingerprinting
//!
//! Two executions of `SELECT * FROM users WHERE id = 7` and `... id = 9` are
//! the same query shape. Literals, `IN (...)` lists and `LIMIT/OFFSET` values
//! are replaced with placeholders before hashing so the shape is what gets
//! counted, not the arguments.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

static STRING_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'(?:[^']|'')*'").expect("valid regex"));

static IN_LIST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bIN\s*\([^)]*\)").expect("valid regex"));

static LIMIT_OFFSET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(LIMIT|OFFSET)\s+\d+").expect("valid regex"));

static NUMERIC_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").expect("valid regex"));

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Broad classification of a SQL statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl QueryType {
    /// Classify a statement by its leading keyword
    pub fn of(query: &str) -> Self {
        let head = query.trim_start();
        if starts_with_ignore_case(head, "SELECT") {
            QueryType::Select
        } else if starts_with_ignore_case(head, "INSERT") {
            QueryType::Insert
        } else if starts_with_ignore_case(head, "UPDATE") {
            QueryType::Update
        } else if starts_with_ignore_case(head, "DELETE") {
            QueryType::Delete
        } else {
            QueryType::Other
        }
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryType::Select => write!(f, "select"),
            QueryType::Insert => write!(f, "insert"),
            QueryType::Update => write!(f, "update"),
            QueryType::Delete => write!(f, "delete"),
            QueryType::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for QueryType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "select" => Ok(QueryType::Select),
            "insert" => Ok(QueryType::Insert),
            "update" => Ok(QueryType::Update),
            "delete" => Ok(QueryType::Delete),
            _ => Ok(QueryType::Other),
        }
    }
}

fn starts_with_ignore_case(haystack: &str, prefix: &str) -> bool {
    haystack.len() >= prefix.len() && haystack[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Reduce a statement to its shape: literals and list/pagination values
/// become `?`, whitespace collapses to single spaces.
pub fn normalize_query(query: &str) -> String {
    let q = STRING_LITERAL.replace_all(query, "?");
    let q = IN_LIST.replace_all(&q, "IN (?)");
    let q = LIMIT_OFFSET.replace_all(&q, "$1 ?");
    let q = NUMERIC_LITERAL.replace_all(&q, "?");
    WHITESPACE.replace_all(&q, " ").trim().to_string()
}

/// Fingerprint of the normalized query shape
pub fn query_fingerprint(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_query(query).as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_normalization() {
        assert_eq!(
            normalize_query("SELECT * FROM users WHERE id = 42"),
            "SELECT * FROM users WHERE id = ?"
        );
        assert_eq!(
            normalize_query("SELECT * FROM users WHERE email = 'a@b.com'"),
            "SELECT * FROM users WHERE email = ?"
        );
    }

    #[test]
    fn test_in_list_normalization() {
        assert_eq!(
            normalize_query("SELECT * FROM users WHERE id IN (1, 2, 3)"),
            "SELECT * FROM users WHERE id IN (?)"
        );
        assert_eq!(
            normalize_query("SELECT * FROM users WHERE id in ('a', 'b')"),
            "SELECT * FROM users WHERE id IN (?)"
        );
    }

    #[test]
    fn test_limit_offset_normalization() {
        assert_eq!(
            normalize_query("SELECT * FROM posts LIMIT 10 OFFSET 20"),
            "SELECT * FROM posts LIMIT ? OFFSET ?"
        );
    }

    #[test]
    fn test_whitespace_collapse() {
        assert_eq!(
            normalize_query("SELECT *\n  FROM users\n  WHERE id = 1"),
            "SELECT * FROM users WHERE id = ?"
        );
    }

    #[test]
    fn test_same_shape_same_fingerprint() {
        let a = query_fingerprint("SELECT * FROM users WHERE id = 1");
        let b = query_fingerprint("SELECT  *  FROM users WHERE id = 999");
        assert_eq!(a, b);

        let c = query_fingerprint("SELECT * FROM orders WHERE id = 1");
        assert_ne!(a, c);
    }

    #[test]
    fn test_query_type_classification() {
        assert_eq!(QueryType::of("SELECT 1"), QueryType::Select);
        assert_eq!(QueryType::of("  insert into t values (1)"), QueryType::Insert);
        assert_eq!(QueryType::of("UPDATE t SET a = 1"), QueryType::Update);
        assert_eq!(QueryType::of("delete from t"), QueryType::Delete);
        assert_eq!(QueryType::of("BEGIN"), QueryType::Other);
    }
}
