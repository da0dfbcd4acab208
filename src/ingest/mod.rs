//! Ingestion pipeline for error and performance payloads
//!
//! Handlers are short-lived and share nothing in-process; all coordination
//! goes through the database's atomic upserts and the TTL counter store.
//! Error ingestion scrubs PII, fingerprints, upserts the issue and persists
//! the event; performance ingestion persists the raw sample and hands any
//! SQL call list to the N+1 detector. Batches deduplicate on an optional
//! batch id so a retried delivery is a no-op.

mod scrub;

pub use scrub::{Scrubber, FILTERED};

use crate::alert::{AlertDispatcher, AlertType};
use crate::counter::CounterStore;
use crate::fingerprint::{error_fingerprint, normalize_origin_file, origin_frame, performance_target};
use crate::nplusone::{NPlusOneDetector, SqlQuery};
use crate::storage::{Database, IssueUpsert};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// A processed batch id is remembered for this long
const BATCH_DEDUP_TTL: Duration = Duration::from_secs(300);

/// Project last-seen writes are debounced to once per this interval
const LAST_SEEN_DEBOUNCE: Duration = Duration::from_secs(60);

/// Events in the trailing hour at which an issue re-alerts on frequency
const FREQUENCY_ALERT_THRESHOLD: u64 = 10;

/// Issue lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueStatus {
    Open,
    Wip,
    Closed,
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueStatus::Open => write!(f, "open"),
            IssueStatus::Wip => write!(f, "wip"),
            IssueStatus::Closed => write!(f, "closed"),
        }
    }
}

/// A deduplicated error group
#[derive(Debug, Clone)]
pub struct Issue {
    pub id: i64,
    pub project_id: i64,
    pub fingerprint: String,
    pub exception_class: String,
    pub origin_file: String,
    pub sample_message: String,
    pub status: IssueStatus,
    pub occurrence_count: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// One stored occurrence of an issue
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub id: String,
    pub issue_id: i64,
    pub occurred_at: DateTime<Utc>,
    pub environment: String,
    pub controller_action: Option<String>,
    pub request_path: Option<String>,
    pub backtrace: Vec<String>,
    pub context: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// One raw request timing sample
#[derive(Debug, Clone)]
pub struct PerformanceEvent {
    pub id: String,
    pub project_id: i64,
    pub target: String,
    pub environment: String,
    pub duration_ms: f64,
    pub db_duration_ms: Option<f64>,
    pub view_duration_ms: Option<f64>,
    pub sql_query_count: Option<u64>,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

fn default_environment() -> String {
    "production".to_string()
}

/// Incoming error report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub exception_class: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub backtrace: Vec<String>,
    #[serde(default)]
    pub controller_action: Option<String>,
    #[serde(default)]
    pub request_path: Option<String>,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

/// Incoming performance sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformancePayload {
    pub target: String,
    pub duration_ms: f64,
    #[serde(default)]
    pub db_duration_ms: Option<f64>,
    #[serde(default)]
    pub view_duration_ms: Option<f64>,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sql_queries: Vec<SqlQuery>,
    /// Client-side statement count; set when the client tallies without
    /// shipping the statements themselves
    #[serde(default)]
    pub sql_queries_count: Option<u64>,
}

/// One item of a mixed ingestion batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestItem {
    Error(ErrorPayload),
    Performance(PerformancePayload),
}

/// Result of a batch ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The batch id was already processed; nothing was done
    Duplicate,
    Processed { accepted: usize, skipped: usize },
}

/// Ingestion failure. Validation errors are terminal; storage errors are
/// retryable by the caller's retry budget.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Invalid payload: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl IngestError {
    /// Terminal errors must not be retried
    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestError::Validation(_))
    }
}

/// Stateless ingestion front door
pub struct IngestPipeline<'a> {
    db: &'a Database,
    counters: &'a dyn CounterStore,
    dispatcher: &'a AlertDispatcher<'a>,
    scrubber: Scrubber,
}

impl<'a> IngestPipeline<'a> {
    pub fn new(
        db: &'a Database,
        counters: &'a dyn CounterStore,
        dispatcher: &'a AlertDispatcher<'a>,
        scrubber: Scrubber,
    ) -> Self {
        Self {
            db,
            counters,
            dispatcher,
            scrubber,
        }
    }

    /// Ingest one error report: scrub, fingerprint, upsert the issue,
    /// persist the event, then decide whether to alert.
    pub async fn ingest_error(
        &self,
        project_id: i64,
        mut payload: ErrorPayload,
        now: DateTime<Utc>,
    ) -> Result<ErrorEvent, IngestError> {
        if payload.exception_class.trim().is_empty() {
            return Err(IngestError::Validation(
                "exception_class is required".to_string(),
            ));
        }

        if let Some(context) = payload.context.as_mut() {
            self.scrubber.scrub(context);
        }

        let fingerprint = error_fingerprint(
            &payload.exception_class,
            &payload.backtrace,
            payload.controller_action.as_deref(),
        );
        let origin_file = origin_frame(&payload.backtrace)
            .map(normalize_origin_file)
            .unwrap_or_default();

        let upsert = self.db.upsert_issue(
            project_id,
            &fingerprint,
            &payload.exception_class,
            &origin_file,
            &payload.message,
            now,
        )?;

        let event = ErrorEvent {
            id: uuid::Uuid::new_v4().to_string(),
            issue_id: upsert.issue.id,
            occurred_at: payload.occurred_at.unwrap_or(now),
            environment: payload.environment,
            controller_action: payload.controller_action,
            request_path: payload.request_path,
            backtrace: payload.backtrace,
            context: payload.context,
            created_at: now,
        };
        self.db.insert_event(&event)?;

        self.touch_last_seen(project_id, now)?;

        // The event is already persisted; an alert-side failure is logged and
        // left to the next occurrence rather than failing the ingestion.
        if let Err(e) = self.maybe_alert(project_id, &upsert, now).await {
            warn!(project_id, issue_id = upsert.issue.id, error = %e, "alert dispatch failed");
        }

        Ok(event)
    }

    /// Ingest one performance sample; SQL calls go to the N+1 detector
    pub async fn ingest_performance(
        &self,
        project_id: i64,
        payload: PerformancePayload,
        now: DateTime<Utc>,
    ) -> Result<PerformanceEvent, IngestError> {
        if payload.target.trim().is_empty() {
            return Err(IngestError::Validation("target is required".to_string()));
        }
        if !payload.duration_ms.is_finite() || payload.duration_ms < 0.0 {
            return Err(IngestError::Validation(format!(
                "duration_ms must be a non-negative number, got {}",
                payload.duration_ms
            )));
        }

        let target = performance_target(&payload.target);
        // Prefer the client's own tally; fall back to the shipped statements.
        let sql_query_count = payload
            .sql_queries_count
            .or_else(|| (!payload.sql_queries.is_empty()).then(|| payload.sql_queries.len() as u64));
        let event = PerformanceEvent {
            id: uuid::Uuid::new_v4().to_string(),
            project_id,
            target: target.clone(),
            environment: payload.environment,
            duration_ms: payload.duration_ms,
            db_duration_ms: payload.db_duration_ms,
            view_duration_ms: payload.view_duration_ms,
            sql_query_count,
            occurred_at: payload.occurred_at.unwrap_or(now),
            created_at: now,
        };
        self.db.insert_performance_event(&event)?;

        self.touch_last_seen(project_id, now)?;

        if !payload.sql_queries.is_empty() {
            let detector = NPlusOneDetector::new(self.db, self.dispatcher);
            detector
                .analyze_request(project_id, &target, &payload.sql_queries, now)
                .await?;
        }

        Ok(event)
    }

    /// Ingest a batch. A known batch id short-circuits; individual item
    /// failures are logged and skipped, never fatal to the batch.
    pub async fn ingest_batch(
        &self,
        project_id: i64,
        batch_id: Option<&str>,
        items: Vec<IngestItem>,
        now: DateTime<Utc>,
    ) -> Result<BatchOutcome, IngestError> {
        if let Some(id) = batch_id {
            let key = format!("ingest:batch:{}", id);
            if !self.counters.acquire(&key, BATCH_DEDUP_TTL)? {
                debug!(batch_id = id, "duplicate batch, skipping");
                return Ok(BatchOutcome::Duplicate);
            }
        }

        let mut accepted = 0;
        let mut skipped = 0;
        for (i, item) in items.into_iter().enumerate() {
            let result = match item {
                IngestItem::Error(payload) => self
                    .ingest_error(project_id, payload, now)
                    .await
                    .map(|_| ()),
                IngestItem::Performance(payload) => self
                    .ingest_performance(project_id, payload, now)
                    .await
                    .map(|_| ()),
            };

            match result {
                Ok(()) => accepted += 1,
                Err(e) => {
                    warn!(project_id, item = i, error = %e, "batch item failed, skipping");
                    skipped += 1;
                }
            }
        }

        Ok(BatchOutcome::Processed { accepted, skipped })
    }

    /// Whether this occurrence warrants an alert: first occurrence, a recent
    /// reopen, or sustained frequency in the trailing hour.
    pub fn should_alert_for_issue(
        &self,
        upsert: &IssueUpsert,
        now: DateTime<Utc>,
    ) -> Result<bool, IngestError> {
        if upsert.created {
            return Ok(true);
        }

        if upsert.reopened {
            if let Some(closed_at) = upsert.previously_closed_at {
                if now - closed_at < ChronoDuration::days(1) {
                    return Ok(true);
                }
            }
        }

        let recent = self
            .db
            .count_events_since(upsert.issue.id, now - ChronoDuration::hours(1))?;
        Ok(recent >= FREQUENCY_ALERT_THRESHOLD)
    }

    async fn maybe_alert(
        &self,
        project_id: i64,
        upsert: &IssueUpsert,
        now: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        if !self.should_alert_for_issue(upsert, now)? {
            return Ok(());
        }

        let alert_type = if upsert.created || upsert.reopened {
            AlertType::NewIssue
        } else {
            AlertType::ErrorFrequency
        };

        let issue = &upsert.issue;
        let payload = serde_json::json!({
            "issue_id": issue.id,
            "fingerprint": issue.fingerprint,
            "exception_class": issue.exception_class,
            "origin_file": issue.origin_file,
            "occurrence_count": issue.occurrence_count,
            "reopened": upsert.reopened,
        });
        let subject = format!("{} in {}", issue.exception_class, issue.origin_file);

        self.dispatcher
            .dispatch_fingerprint(
                project_id,
                alert_type,
                &issue.fingerprint,
                &subject,
                payload,
                now,
            )
            .await?;

        Ok(())
    }

    fn touch_last_seen(&self, project_id: i64, now: DateTime<Utc>) -> Result<(), IngestError> {
        let key = format!("ingest:lastseen:{}", project_id);
        if self.counters.acquire(&key, LAST_SEEN_DEBOUNCE)? {
            self.db.touch_project_last_seen(project_id, now)?;
        }
        Ok(())
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

    fn error_payload() -> ErrorPayload {
        ErrorPayload {
            exception_class: "ActiveRecord::RecordNotFound".to_string(),
            message: "Couldn't find User with id=42".to_string(),
            backtrace: vec![
                "app/models/user.rb:10:in `find!'".to_string(),
                "app/controllers/users_controller.rb:5:in `show'".to_string(),
            ],
            controller_action: Some("UsersController#show".to_string()),
            request_path: Some("/users/42".to_string()),
            environment: "production".to_string(),
            occurred_at: None,
            context: None,
        }
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
    }

    macro_rules! pipeline {
        ($fx:expr, $dispatcher:ident, $pipeline:ident) => {
            let $dispatcher = AlertDispatcher::new(
                &$fx.db,
                &$fx.counters,
                &LogTransport,
                AlertingConfig::default(),
            );
            let $pipeline =
                IngestPipeline::new(&$fx.db, &$fx.counters, &$dispatcher, Scrubber::new(&[]));
        };
    }

    #[tokio::test]
    async fn test_repeated_errors_group_into_one_issue() {
        let fx = Fixture::new();
        pipeline!(fx, _d, pipeline);

        for _ in 0..3 {
            pipeline
                .ingest_error(fx.project_id, error_payload(), now())
                .await
                .unwrap();
        }

        let issues = fx.db.open_issues(fx.project_id, 10).unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].occurrence_count, 3);
        assert_eq!(issues[0].origin_file, "app/models/user.rb");
    }

    #[tokio::test]
    async fn test_missing_exception_class_is_terminal() {
        let fx = Fixture::new();
        pipeline!(fx, _d, pipeline);

        let mut payload = error_payload();
        payload.exception_class = String::new();

        let err = pipeline
            .ingest_error(fx.project_id, payload, now())
            .await
            .unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_context_is_scrubbed_before_persisting() {
        let fx = Fixture::new();
        pipeline!(fx, _d, pipeline);

        let mut payload = error_payload();
        payload.context = Some(serde_json::json!({
            "params": { "password": "hunter2", "page": 1 },
        }));

        let event = pipeline
            .ingest_error(fx.project_id, payload, now())
            .await
            .unwrap();

        let context = event.context.unwrap();
        assert_eq!(context["params"]["password"], FILTERED);
        assert_eq!(context["params"]["page"], 1);
    }

    #[tokio::test]
    async fn test_performance_rejects_negative_duration() {
        let fx = Fixture::new();
        pipeline!(fx, _d, pipeline);

        let payload = PerformancePayload {
            target: "UsersController#index".to_string(),
            duration_ms: -5.0,
            db_duration_ms: None,
            view_duration_ms: None,
            environment: "production".to_string(),
            occurred_at: None,
            sql_queries: vec![],
            sql_queries_count: None,
        };

        let err = pipeline
            .ingest_performance(fx.project_id, payload, now())
            .await
            .unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_client_reported_query_count_is_preferred() {
        let fx = Fixture::new();
        pipeline!(fx, _d, pipeline);

        // Count without statements: the client's tally survives.
        let counted = PerformancePayload {
            target: "UsersController#index".to_string(),
            duration_ms: 120.0,
            db_duration_ms: None,
            view_duration_ms: None,
            environment: "production".to_string(),
            occurred_at: None,
            sql_queries: vec![],
            sql_queries_count: Some(7),
        };
        let event = pipeline
            .ingest_performance(fx.project_id, counted, now())
            .await
            .unwrap();
        assert_eq!(event.sql_query_count, Some(7));

        // Statements without a count: fall back to the list length.
        let listed = PerformancePayload {
            target: "UsersController#index".to_string(),
            duration_ms: 120.0,
            db_duration_ms: None,
            view_duration_ms: None,
            environment: "production".to_string(),
            occurred_at: None,
            sql_queries: vec![crate::nplusone::SqlQuery {
                query: "SELECT * FROM users WHERE id = 1".to_string(),
                duration_ms: 2.0,
            }],
            sql_queries_count: None,
        };
        let event = pipeline
            .ingest_performance(fx.project_id, listed, now())
            .await
            .unwrap();
        assert_eq!(event.sql_query_count, Some(1));
    }

    #[tokio::test]
    async fn test_batch_dedup_and_partial_failure() {
        let fx = Fixture::new();
        pipeline!(fx, _d, pipeline);

        let mut bad = error_payload();
        bad.exception_class = String::new();
        let items = vec![
            IngestItem::Error(error_payload()),
            IngestItem::Error(bad),
            IngestItem::Performance(PerformancePayload {
                target: "UsersController#index".to_string(),
                duration_ms: 120.0,
                db_duration_ms: None,
                view_duration_ms: None,
                environment: "production".to_string(),
                occurred_at: None,
                sql_queries: vec![],
                sql_queries_count: None,
            }),
        ];

        let outcome = pipeline
            .ingest_batch(fx.project_id, Some("batch-1"), items.clone(), now())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            BatchOutcome::Processed {
                accepted: 2,
                skipped: 1
            }
        );

        // Same batch id again: nothing processed.
        let outcome = pipeline
            .ingest_batch(fx.project_id, Some("batch-1"), items, now())
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome::Duplicate);

        let issues = fx.db.open_issues(fx.project_id, 10).unwrap();
        assert_eq!(issues[0].occurrence_count, 1);
    }

    #[tokio::test]
    async fn test_should_alert_on_first_and_recent_reopen() {
        let fx = Fixture::new();
        pipeline!(fx, _d, pipeline);

        let t = now();
        let first = fx
            .db
            .upsert_issue(fx.project_id, "fp", "NoMethodError", "user.rb", "boom", t)
            .unwrap();
        assert!(pipeline.should_alert_for_issue(&first, t).unwrap());

        // Second occurrence of an open issue with low frequency: no alert.
        let second = fx
            .db
            .upsert_issue(fx.project_id, "fp", "NoMethodError", "user.rb", "boom", t)
            .unwrap();
        assert!(!pipeline.should_alert_for_issue(&second, t).unwrap());

        // Closed recently, then recurred: alert again.
        fx.db.close_issue(first.issue.id, t).unwrap();
        let reopened = fx
            .db
            .upsert_issue(fx.project_id, "fp", "NoMethodError", "user.rb", "boom", t)
            .unwrap();
        assert!(reopened.reopened);
        assert!(pipeline.should_alert_for_issue(&reopened, t).unwrap());
    }

    #[tokio::test]
    async fn test_last_seen_write_is_debounced() {
        let fx = Fixture::new();
        pipeline!(fx, _d, pipeline);

        pipeline
            .ingest_error(fx.project_id, error_payload(), now())
            .await
            .unwrap();
        let after_first = fx.db.get_project(fx.project_id).unwrap().unwrap().last_seen_at;
        assert_eq!(after_first, Some(now()));

        // A later event within the debounce window does not rewrite it.
        pipeline
            .ingest_error(
                fx.project_id,
                error_payload(),
                now() + ChronoDuration::seconds(10),
            )
            .await
            .unwrap();
        let after_second = fx.db.get_project(fx.project_id).unwrap().unwrap().last_seen_at;
        assert_eq!(after_second, Some(now()));
    }
}
