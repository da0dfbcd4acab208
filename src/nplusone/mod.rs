//! Per-request N+1 query detection
//!
//! Two layers: a per-request tally that flags any query shape repeated five
//! or more times within one request, and a persistent per-project aggregate
//! of every observed statement. Severity scores combine the in-request
//! occurrence count with the shape's historical average duration, so a cheap
//! repeated lookup scores lower than a slow one at the same count.

use crate::alert::{AlertDispatcher, AlertType};
use crate::fingerprint::{normalize_query, query_fingerprint, QueryType};
use crate::storage::Database;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Minimum repeats of one shape within a single request to flag it
pub const OCCURRENCE_THRESHOLD: u64 = 5;

/// One SQL call observed during a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlQuery {
    pub query: String,
    #[serde(default)]
    pub duration_ms: f64,
}

/// Persistent per-project aggregate for one query shape
#[derive(Debug, Clone)]
pub struct SqlFingerprintStat {
    pub fingerprint: String,
    pub normalized_query: String,
    pub query_type: QueryType,
    pub query_count: u64,
    pub total_duration_ms: f64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Severity band for a flagged candidate. The score is
/// `occurrences * historical avg_duration_ms` for the shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NPlusOneSeverity {
    Low,
    Medium,
    High,
}

impl NPlusOneSeverity {
    pub fn from_score(score: f64) -> Self {
        if score <= 100.0 {
            NPlusOneSeverity::Low
        } else if score <= 500.0 {
            NPlusOneSeverity::Medium
        } else {
            NPlusOneSeverity::High
        }
    }
}

impl std::fmt::Display for NPlusOneSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NPlusOneSeverity::Low => write!(f, "low"),
            NPlusOneSeverity::Medium => write!(f, "medium"),
            NPlusOneSeverity::High => write!(f, "high"),
        }
    }
}

/// A query shape flagged within one request
#[derive(Debug, Clone)]
pub struct NPlusOneCandidate {
    pub fingerprint: String,
    pub normalized_query: String,
    pub target: String,
    pub occurrences: u64,
    pub avg_duration_ms: f64,
    pub score: f64,
    pub severity: NPlusOneSeverity,
}

/// Analyzes the SQL call list of individual requests
pub struct NPlusOneDetector<'a> {
    db: &'a Database,
    dispatcher: &'a AlertDispatcher<'a>,
}

impl<'a> NPlusOneDetector<'a> {
    pub fn new(db: &'a Database, dispatcher: &'a AlertDispatcher<'a>) -> Self {
        Self { db, dispatcher }
    }

    /// Analyze one request's SQL calls. Every statement updates the
    /// persistent shape aggregate; shapes repeated at or above the threshold
    /// within this request become candidates, and high-severity candidates
    /// are forwarded to the dispatcher.
    pub async fn analyze_request(
        &self,
        project_id: i64,
        target: &str,
        queries: &[SqlQuery],
        now: DateTime<Utc>,
    ) -> Result<Vec<NPlusOneCandidate>> {
        let mut tallies: HashMap<String, (String, u64)> = HashMap::new();

        for query in queries {
            let normalized = normalize_query(&query.query);
            let fingerprint = query_fingerprint(&query.query);
            let query_type = QueryType::of(&normalized);

            self.db.record_sql_observation(
                project_id,
                &fingerprint,
                &normalized,
                &query_type.to_string(),
                query.duration_ms,
                now,
            )?;

            let entry = tallies.entry(fingerprint).or_insert_with(|| (normalized, 0));
            entry.1 += 1;
        }

        let mut candidates = Vec::new();
        for (fingerprint, (normalized_query, occurrences)) in tallies {
            if occurrences < OCCURRENCE_THRESHOLD {
                continue;
            }

            // Severity uses the shape's historical average, not just this
            // request's samples.
            let avg_duration_ms = self
                .db
                .get_sql_fingerprint(project_id, &fingerprint)?
                .map(|stat| stat.avg_duration_ms)
                .unwrap_or(0.0);

            let score = occurrences as f64 * avg_duration_ms;
            let severity = NPlusOneSeverity::from_score(score);
            debug!(
                project_id,
                target,
                %fingerprint,
                occurrences,
                score,
                %severity,
                "n+1 candidate"
            );

            candidates.push(NPlusOneCandidate {
                fingerprint,
                normalized_query,
                target: target.to_string(),
                occurrences,
                avg_duration_ms,
                score,
                severity,
            });
        }

        for candidate in &candidates {
            if candidate.severity != NPlusOneSeverity::High {
                continue;
            }

            info!(
                project_id,
                target = %candidate.target,
                occurrences = candidate.occurrences,
                "forwarding high-severity n+1 candidate"
            );
            let payload = serde_json::json!({
                "fingerprint": candidate.fingerprint,
                "normalized_query": candidate.normalized_query,
                "target": candidate.target,
                "occurrences": candidate.occurrences,
                "avg_duration_ms": candidate.avg_duration_ms,
                "score": candidate.score,
            });
            let subject = format!(
                "N+1 query detected in {} ({} repeats)",
                candidate.target, candidate.occurrences
            );
            self.dispatcher
                .dispatch_global(project_id, AlertType::NPlusOne, &subject, payload, false, now)
                .await?;
        }

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::LogTransport;
    use crate::config::AlertingConfig;
    use crate::counter::MemoryCounterStore;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap()
    }

    fn queries(statement: &str, n: usize, duration_ms: f64) -> Vec<SqlQuery> {
        (0..n)
            .map(|i| SqlQuery {
                query: statement.replace("{}", &i.to_string()),
                duration_ms,
            })
            .collect()
    }

    struct Fixture {
        db: Database,
        counters: MemoryCounterStore,
        project_id: i64,
    }

    impl Fixture {
        fn new() -> Self {
            let db = Database::open_in_memory().unwrap();
            let project_id = db.create_project("demo", now()).unwrap();
            Self {
                db,
                counters: MemoryCounterStore::new(),
                project_id,
            }
        }

        async fn analyze(&self, qs: &[SqlQuery]) -> Vec<NPlusOneCandidate> {
            let dispatcher = AlertDispatcher::new(
                &self.db,
                &self.counters,
                &LogTransport,
                AlertingConfig::default(),
            );
            let detector = NPlusOneDetector::new(&self.db, &dispatcher);
            detector
                .analyze_request(self.project_id, "UsersController#show", qs, now())
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_threshold_is_five() {
        let fx = Fixture::new();

        let four = queries("SELECT * FROM posts WHERE user_id = {}", 4, 2.0);
        assert!(fx.analyze(&four).await.is_empty());

        let five = queries("SELECT * FROM posts WHERE user_id = {}", 5, 2.0);
        let candidates = fx.analyze(&five).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].occurrences, 5);
    }

    #[tokio::test]
    async fn test_distinct_shapes_do_not_combine() {
        let fx = Fixture::new();

        let mut mixed = queries("SELECT * FROM posts WHERE user_id = {}", 3, 2.0);
        mixed.extend(queries("SELECT * FROM comments WHERE post_id = {}", 3, 2.0));
        assert!(fx.analyze(&mixed).await.is_empty());
    }

    #[tokio::test]
    async fn test_severity_bands() {
        assert_eq!(NPlusOneSeverity::from_score(50.0), NPlusOneSeverity::Low);
        assert_eq!(NPlusOneSeverity::from_score(100.0), NPlusOneSeverity::Low);
        assert_eq!(NPlusOneSeverity::from_score(101.0), NPlusOneSeverity::Medium);
        assert_eq!(NPlusOneSeverity::from_score(500.0), NPlusOneSeverity::Medium);
        assert_eq!(NPlusOneSeverity::from_score(501.0), NPlusOneSeverity::High);
    }

    #[tokio::test]
    async fn test_severity_uses_historical_average() {
        let fx = Fixture::new();

        // Seed history: the shape averages 200ms per execution.
        let slow = queries("SELECT * FROM posts WHERE user_id = {}", 5, 200.0);
        let candidates = fx.analyze(&slow).await;
        assert_eq!(candidates.len(), 1);
        // 5 occurrences * 200ms avg = 1000 > 500.
        assert_eq!(candidates[0].severity, NPlusOneSeverity::High);

        let stat = fx
            .db
            .get_sql_fingerprint(fx.project_id, &candidates[0].fingerprint)
            .unwrap()
            .unwrap();
        assert_eq!(stat.query_count, 5);
        assert!((stat.avg_duration_ms - 200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_aggregate_tracks_all_statements() {
        let fx = Fixture::new();

        // Below threshold: no candidates, but the aggregate still advances.
        let two = queries("SELECT * FROM posts WHERE user_id = {}", 2, 10.0);
        fx.analyze(&two).await;

        let fingerprint = query_fingerprint("SELECT * FROM posts WHERE user_id = 1");
        let stat = fx
            .db
            .get_sql_fingerprint(fx.project_id, &fingerprint)
            .unwrap()
            .unwrap();
        assert_eq!(stat.query_count, 2);
        assert!((stat.max_duration_ms - 10.0).abs() < f64::EPSILON);
    }
}
