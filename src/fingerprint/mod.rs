//! Stable grouping keys for errors, performance targets and SQL shapes
//!
//! Fingerprints are the dedup backbone: the same root cause must always map
//! to the same key, and cosmetic churn (line numbers moving, the same error
//! surfacing through different controllers) must not split an issue.

pub mod sql;

pub use sql::{normalize_query, query_fingerprint, QueryType};

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Exception classes grouped by origin file alone. These are raised from many
/// entry points but share one root cause (a base controller, a route table),
/// so controller/action is deliberately excluded from their fingerprint.
const ORIGIN_GROUPED_CLASSES: &[&str] = &[
    "ActiveRecord::RecordNotFound",
    "ActionController::RoutingError",
    "ActionController::InvalidAuthenticityToken",
    "ActionController::ParameterMissing",
    "ActionController::UnknownFormat",
    "ActionController::BadRequest",
];

static LINE_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":\d+(?::in .*)?$").expect("valid regex"));

static VENDOR_FRAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(/gems/|/ruby/|/vendor/|<internal:)").expect("valid regex"));

/// Whether an exception class groups by origin file alone
pub fn is_origin_grouped(exception_class: &str) -> bool {
    ORIGIN_GROUPED_CLASSES.contains(&exception_class)
}

/// Topmost in-app frame of a backtrace, skipping vendored/runtime frames.
/// Falls back to the first frame when everything looks vendored.
pub fn origin_frame<'a>(backtrace: &'a [String]) -> Option<&'a str> {
    backtrace
        .iter()
        .find(|frame| !VENDOR_FRAME.is_match(frame))
        .or_else(|| backtrace.first())
        .map(|s| s.as_str())
}

/// Strip the line-number suffix (and `:in ...` method tag) from a frame so
/// the fingerprint survives unrelated edits to the same file.
pub fn normalize_origin_file(frame: &str) -> String {
    LINE_SUFFIX.replace(frame, "").to_string()
}

/// Compute the grouping fingerprint for an error.
///
/// Origin-grouped classes hash `(class, origin_file)`; everything else also
/// mixes in the controller/action so distinct call sites stay distinct.
pub fn error_fingerprint(
    exception_class: &str,
    backtrace: &[String],
    controller_action: Option<&str>,
) -> String {
    let origin = origin_frame(backtrace)
        .map(normalize_origin_file)
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(exception_class.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(origin.as_bytes());

    if !is_origin_grouped(exception_class) {
        hasher.update(b"\x1f");
        hasher.update(controller_action.unwrap_or("").as_bytes());
    }

    hex::encode(&hasher.finalize()[..16])
}

/// Grouping key for performance data: the literal `controller#action` or job
/// class string. No hashing needed, it is already stable and human-readable.
pub fn performance_target(target: &str) -> String {
    target.trim().to_string()
}
