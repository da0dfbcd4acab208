//! SQLite storage layer for Faultline
//!
//! This module handles persistent storage of:
//! - Projects, issues and error events
//! - Raw performance samples and percentile rollups
//! - Performance incidents
//! - SQL fingerprints, alert rules, notifications and preferences

mod schema;

pub use schema::SCHEMA;

use crate::alert::{
    AlertNotification, AlertRule, AlertType, FrequencyPolicy, NotificationPreference,
    NotificationStatus,
};
use crate::incident::{Incident, IncidentSeverity, IncidentStatus};
use crate::ingest::{ErrorEvent, Issue, IssueStatus, PerformanceEvent};
use crate::nplusone::SqlFingerprintStat;
use crate::rollup::{PerfRollup, Timeframe};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// Format a timestamp for storage. One fixed format keeps lexicographic
/// comparison in SQL consistent with chronological order.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, false)
}

/// Parse a stored timestamp
pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid stored timestamp: {}", s))
}

/// A registered project sending telemetry
#[derive(Debug, Clone)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Outcome of an issue upsert, carrying the state needed for alert decisions
#[derive(Debug, Clone)]
pub struct IssueUpsert {
    pub issue: Issue,
    /// True when this ingestion created the issue
    pub created: bool,
    /// True when the issue was closed and this occurrence reopened it
    pub reopened: bool,
    /// When the issue was last closed, if it was
    pub previously_closed_at: Option<DateTime<Utc>>,
}

/// Database connection wrapper
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", path.as_ref()))?;

        let db = Self { conn };
        db.initialize()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let db = Self { conn };
        db.initialize()?;

        Ok(db)
    }

    /// Initialize the database schema
    fn initialize(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .context("Failed to initialize database schema")?;
        Ok(())
    }

    /// Run a closure inside an immediate transaction. Used where a check and
    /// a write must not interleave with another writer (global rate limits).
    pub fn immediate<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("Failed to begin transaction")?;

        match f(self) {
            Ok(value) => {
                self.conn
                    .execute_batch("COMMIT")
                    .context("Failed to commit transaction")?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    // ==================== Projects ====================

    /// Register a project, returning its id
    pub fn create_project(&self, name: &str, now: DateTime<Utc>) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO projects (name, created_at) VALUES (?1, ?2)",
                params![name, fmt_ts(now)],
            )
            .context("Failed to create project")?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Look up a project by id
    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let result = self
            .conn
            .query_row(
                "SELECT id, name, created_at, last_seen_at FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to get project")?;

        match result {
            Some((id, name, created_at, last_seen_at)) => Ok(Some(Project {
                id,
                name,
                created_at: parse_ts(&created_at)?,
                last_seen_at: last_seen_at.as_deref().map(parse_ts).transpose()?,
            })),
            None => Ok(None),
        }
    }

    /// Ids of all registered projects
    pub fn project_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare("SELECT id FROM projects ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }

        Ok(ids)
    }

    /// Bump a project's last-seen timestamp
    pub fn touch_project_last_seen(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE projects SET last_seen_at = ?1 WHERE id = ?2",
                params![fmt_ts(now), id],
            )
            .context("Failed to touch project last-seen")?;
        Ok(())
    }

    // ==================== Issues ====================

    /// Insert a new issue or bump an existing one. The conflict clause is the
    /// guard against concurrent first-creation: at most one row per
    /// (project, fingerprint) can ever exist.
    pub fn upsert_issue(
        &self,
        project_id: i64,
        fingerprint: &str,
        exception_class: &str,
        origin_file: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<IssueUpsert> {
        let prior: Option<(String, Option<String>)> = self
            .conn
            .query_row(
                "SELECT status, closed_at FROM issues WHERE project_id = ?1 AND fingerprint = ?2",
                params![project_id, fingerprint],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to read prior issue state")?;

        self.conn
            .execute(
                r#"
                INSERT INTO issues (
                    project_id, fingerprint, exception_class, origin_file,
                    sample_message, status, occurrence_count, first_seen_at, last_seen_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, 'open', 1, ?6, ?6)
                ON CONFLICT(project_id, fingerprint) DO UPDATE SET
                    occurrence_count = occurrence_count + 1,
                    last_seen_at = excluded.last_seen_at,
                    sample_message = excluded.sample_message,
                    status = 'open',
                    closed_at = NULL
                "#,
                params![
                    project_id,
                    fingerprint,
                    exception_class,
                    origin_file,
                    message,
                    fmt_ts(now),
                ],
            )
            .context("Failed to upsert issue")?;

        let issue = self
            .get_issue_by_fingerprint(project_id, fingerprint)?
            .context("Issue missing immediately after upsert")?;

        let created = prior.is_none();
        let reopened = prior
            .as_ref()
            .map(|(status, _)| status == "closed")
            .unwrap_or(false);
        let previously_closed_at = prior
            .and_then(|(_, closed_at)| closed_at)
            .as_deref()
            .map(parse_ts)
            .transpose()?;

        Ok(IssueUpsert {
            issue,
            created,
            reopened,
            previously_closed_at,
        })
    }

    /// Get an issue by id
    pub fn get_issue(&self, id: i64) -> Result<Option<Issue>> {
        let result = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", ISSUE_SELECT),
                params![id],
                issue_row,
            )
            .optional()
            .context("Failed to get issue")?;

        result.map(IssueRow::into_issue).transpose()
    }

    /// Get an issue by (project, fingerprint)
    pub fn get_issue_by_fingerprint(
        &self,
        project_id: i64,
        fingerprint: &str,
    ) -> Result<Option<Issue>> {
        let result = self
            .conn
            .query_row(
                &format!("{} WHERE project_id = ?1 AND fingerprint = ?2", ISSUE_SELECT),
                params![project_id, fingerprint],
                issue_row,
            )
            .optional()
            .context("Failed to get issue by fingerprint")?;

        result.map(IssueRow::into_issue).transpose()
    }

    /// Open issues for a project, most recently seen first
    pub fn open_issues(&self, project_id: i64, limit: usize) -> Result<Vec<Issue>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE project_id = ?1 AND status = 'open' ORDER BY last_seen_at DESC LIMIT ?2",
            ISSUE_SELECT
        ))?;

        let rows = stmt.query_map(params![project_id, limit as i64], issue_row)?;

        let mut issues = Vec::new();
        for row in rows {
            issues.push(row?.into_issue()?);
        }

        Ok(issues)
    }

    /// Close an issue (operator action; exercised by reopen tests)
    pub fn close_issue(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE issues SET status = 'closed', closed_at = ?1 WHERE id = ?2",
                params![fmt_ts(now), id],
            )
            .context("Failed to close issue")?;
        Ok(())
    }

    // ==================== Error Events ====================

    /// Persist an error event
    pub fn insert_event(&self, event: &ErrorEvent) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO events (
                    id, issue_id, occurred_at, environment, controller_action,
                    request_path, backtrace, context, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    event.id,
                    event.issue_id,
                    fmt_ts(event.occurred_at),
                    event.environment,
                    event.controller_action,
                    event.request_path,
                    serde_json::to_string(&event.backtrace)?,
                    event.context.as_ref().map(serde_json::to_string).transpose()?,
                    fmt_ts(event.created_at),
                ],
            )
            .context("Failed to insert event")?;
        Ok(())
    }

    /// Count events for an issue occurring at or after `since`
    pub fn count_events_since(&self, issue_id: i64, since: DateTime<Utc>) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE issue_id = ?1 AND occurred_at >= ?2",
            params![issue_id, fmt_ts(since)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Error counts per (project, target, environment) inside a window,
    /// for rollup `error_count` population
    pub fn error_counts_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<(i64, String, String, u64)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT i.project_id, COALESCE(e.controller_action, ''), e.environment, COUNT(*)
            FROM events e
            JOIN issues i ON i.id = e.issue_id
            WHERE e.occurred_at >= ?1 AND e.occurred_at < ?2
            GROUP BY i.project_id, e.controller_action, e.environment
            "#,
        )?;

        let rows = stmt.query_map(params![fmt_ts(start), fmt_ts(end)], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)? as u64,
            ))
        })?;

        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }

        Ok(counts)
    }

    // ==================== Performance Events ====================

    /// Persist a raw performance sample
    pub fn insert_performance_event(&self, event: &PerformanceEvent) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO performance_events (
                    id, project_id, target, environment, duration_ms,
                    db_duration_ms, view_duration_ms, sql_query_count,
                    occurred_at, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    event.id,
                    event.project_id,
                    event.target,
                    event.environment,
                    event.duration_ms,
                    event.db_duration_ms,
                    event.view_duration_ms,
                    event.sql_query_count.map(|c| c as i64),
                    fmt_ts(event.occurred_at),
                    fmt_ts(event.created_at),
                ],
            )
            .context("Failed to insert performance event")?;
        Ok(())
    }

    /// Raw samples occurring inside `[start, end)`
    pub fn performance_events_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PerformanceEvent>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, project_id, target, environment, duration_ms,
                   db_duration_ms, view_duration_ms, sql_query_count,
                   occurred_at, created_at
            FROM performance_events
            WHERE occurred_at >= ?1 AND occurred_at < ?2
            ORDER BY occurred_at
            "#,
        )?;

        let rows = stmt.query_map(params![fmt_ts(start), fmt_ts(end)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, Option<f64>>(5)?,
                row.get::<_, Option<f64>>(6)?,
                row.get::<_, Option<i64>>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, project_id, target, environment, duration_ms, db_ms, view_ms, sql_count, occurred, created) = row?;
            events.push(PerformanceEvent {
                id,
                project_id,
                target,
                environment,
                duration_ms,
                db_duration_ms: db_ms,
                view_duration_ms: view_ms,
                sql_query_count: sql_count.map(|c| c as u64),
                occurred_at: parse_ts(&occurred)?,
                created_at: parse_ts(&created)?,
            });
        }

        Ok(events)
    }

    // ==================== Rollups ====================

    /// Idempotent upsert keyed by (project, timeframe, window, target,
    /// environment); a rerun overwrites rather than double-counts
    pub fn upsert_rollup(&self, rollup: &PerfRollup) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO perf_rollups (
                    project_id, timeframe, window_start, target, environment,
                    request_count, avg_duration_ms, p50_ms, p95_ms, p99_ms,
                    min_ms, max_ms, error_count, histogram, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                ON CONFLICT(project_id, timeframe, window_start, target, environment) DO UPDATE SET
                    request_count = excluded.request_count,
                    avg_duration_ms = excluded.avg_duration_ms,
                    p50_ms = excluded.p50_ms,
                    p95_ms = excluded.p95_ms,
                    p99_ms = excluded.p99_ms,
                    min_ms = excluded.min_ms,
                    max_ms = excluded.max_ms,
                    error_count = excluded.error_count,
                    histogram = excluded.histogram,
                    updated_at = excluded.updated_at
                "#,
                params![
                    rollup.project_id,
                    rollup.timeframe.as_str(),
                    fmt_ts(rollup.window_start),
                    rollup.target,
                    rollup.environment,
                    rollup.request_count as i64,
                    rollup.avg_duration_ms,
                    rollup.p50_ms,
                    rollup.p95_ms,
                    rollup.p99_ms,
                    rollup.min_ms,
                    rollup.max_ms,
                    rollup.error_count as i64,
                    rollup.histogram,
                    fmt_ts(rollup.updated_at),
                ],
            )
            .context("Failed to upsert rollup")?;
        Ok(())
    }

    /// Fetch one rollup row by its unique key
    pub fn get_rollup(
        &self,
        project_id: i64,
        timeframe: Timeframe,
        window_start: DateTime<Utc>,
        target: &str,
        environment: &str,
    ) -> Result<Option<PerfRollup>> {
        let result = self
            .conn
            .query_row(
                &format!(
                    "{} WHERE project_id = ?1 AND timeframe = ?2 AND window_start = ?3 \
                     AND target = ?4 AND environment = ?5",
                    ROLLUP_SELECT
                ),
                params![
                    project_id,
                    timeframe.as_str(),
                    fmt_ts(window_start),
                    target,
                    environment
                ],
                rollup_row,
            )
            .optional()
            .context("Failed to get rollup")?;

        result.map(RollupRow::into_rollup).transpose()
    }

    /// Minute rollups with window start inside `[start, end)`
    pub fn minute_rollups_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PerfRollup>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE timeframe = 'minute' AND window_start >= ?1 AND window_start < ?2 \
             ORDER BY window_start",
            ROLLUP_SELECT
        ))?;

        let rows = stmt.query_map(params![fmt_ts(start), fmt_ts(end)], rollup_row)?;

        let mut rollups = Vec::new();
        for row in rows {
            rollups.push(row?.into_rollup()?);
        }

        Ok(rollups)
    }

    /// Minute rollups for one project with window start inside `[start, end)`
    pub fn minute_rollups_for_project(
        &self,
        project_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PerfRollup>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE project_id = ?1 AND timeframe = 'minute' \
             AND window_start >= ?2 AND window_start < ?3 ORDER BY window_start",
            ROLLUP_SELECT
        ))?;

        let rows = stmt.query_map(params![project_id, fmt_ts(start), fmt_ts(end)], rollup_row)?;

        let mut rollups = Vec::new();
        for row in rows {
            rollups.push(row?.into_rollup()?);
        }

        Ok(rollups)
    }

    /// Window start of the most recent minute rollup for a target
    pub fn last_rollup_window(&self, project_id: i64, target: &str) -> Result<Option<DateTime<Utc>>> {
        let result: Option<String> = self
            .conn
            .query_row(
                "SELECT MAX(window_start) FROM perf_rollups \
                 WHERE project_id = ?1 AND target = ?2 AND timeframe = 'minute'",
                params![project_id, target],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to get last rollup window")?
            .flatten();

        result.as_deref().map(parse_ts).transpose()
    }

    // ==================== Incidents ====================

    /// Currently open incident for a target, if any
    pub fn open_incident(&self, project_id: i64, target: &str) -> Result<Option<Incident>> {
        let result = self
            .conn
            .query_row(
                &format!(
                    "{} WHERE project_id = ?1 AND target = ?2 AND status = 'open'",
                    INCIDENT_SELECT
                ),
                params![project_id, target],
                incident_row,
            )
            .optional()
            .context("Failed to get open incident")?;

        result.map(IncidentRow::into_incident).transpose()
    }

    /// Open a new incident. Returns None when an open incident already exists
    /// for this target (the partial unique index makes the insert a no-op).
    pub fn insert_incident(
        &self,
        project_id: i64,
        target: &str,
        severity: IncidentSeverity,
        trigger_p95_ms: f64,
        threshold_ms: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let inserted = self
            .conn
            .execute(
                r#"
                INSERT OR IGNORE INTO performance_incidents (
                    project_id, target, status, severity, opened_at,
                    trigger_p95_ms, peak_p95_ms, threshold_ms, breach_count
                ) VALUES (?1, ?2, 'open', ?3, ?4, ?5, ?5, ?6, 1)
                "#,
                params![
                    project_id,
                    target,
                    severity.to_string(),
                    fmt_ts(now),
                    trigger_p95_ms,
                    threshold_ms,
                ],
            )
            .context("Failed to insert incident")?;

        if inserted == 0 {
            Ok(None)
        } else {
            Ok(Some(self.conn.last_insert_rowid()))
        }
    }

    /// Record another breach on an open incident
    pub fn update_incident_breach(
        &self,
        id: i64,
        peak_p95_ms: f64,
        severity: IncidentSeverity,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE performance_incidents \
                 SET peak_p95_ms = ?1, severity = ?2, breach_count = breach_count + 1 \
                 WHERE id = ?3",
                params![peak_p95_ms, severity.to_string(), id],
            )
            .context("Failed to update incident breach")?;
        Ok(())
    }

    /// Close an incident, recording the p95 it resolved at
    pub fn close_incident(&self, id: i64, resolve_p95_ms: f64, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE performance_incidents \
                 SET status = 'closed', closed_at = ?1, resolve_p95_ms = ?2 \
                 WHERE id = ?3",
                params![fmt_ts(now), resolve_p95_ms, id],
            )
            .context("Failed to close incident")?;
        Ok(())
    }

    /// When the most recent incident for this target closed, if ever
    pub fn last_incident_closed_at(
        &self,
        project_id: i64,
        target: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let result: Option<String> = self
            .conn
            .query_row(
                "SELECT MAX(closed_at) FROM performance_incidents \
                 WHERE project_id = ?1 AND target = ?2 AND status = 'closed'",
                params![project_id, target],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to get last incident close time")?
            .flatten();

        result.as_deref().map(parse_ts).transpose()
    }

    /// All open incidents, across projects
    pub fn open_incidents(&self) -> Result<Vec<Incident>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE status = 'open' ORDER BY opened_at",
            INCIDENT_SELECT
        ))?;

        let rows = stmt.query_map([], incident_row)?;

        let mut incidents = Vec::new();
        for row in rows {
            incidents.push(row?.into_incident()?);
        }

        Ok(incidents)
    }

    /// Get an incident by id
    pub fn get_incident(&self, id: i64) -> Result<Option<Incident>> {
        let result = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", INCIDENT_SELECT),
                params![id],
                incident_row,
            )
            .optional()
            .context("Failed to get incident")?;

        result.map(IncidentRow::into_incident).transpose()
    }

    /// Flag that the open/close notification for an incident went out
    pub fn mark_incident_notified(&self, id: i64, transition_open: bool) -> Result<()> {
        let column = if transition_open {
            "open_notified"
        } else {
            "close_notified"
        };
        self.conn
            .execute(
                &format!("UPDATE performance_incidents SET {} = 1 WHERE id = ?1", column),
                params![id],
            )
            .context("Failed to mark incident notified")?;
        Ok(())
    }

    // ==================== SQL Fingerprints ====================

    /// Fold one observed statement into the per-project shape aggregate
    pub fn record_sql_observation(
        &self,
        project_id: i64,
        fingerprint: &str,
        normalized_query: &str,
        query_type: &str,
        duration_ms: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO sql_fingerprints (
                    project_id, fingerprint, normalized_query, query_type,
                    query_count, total_duration_ms, avg_duration_ms, max_duration_ms,
                    first_seen_at, last_seen_at
                ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5, ?5, ?6, ?6)
                ON CONFLICT(project_id, fingerprint) DO UPDATE SET
                    query_count = query_count + 1,
                    total_duration_ms = total_duration_ms + excluded.total_duration_ms,
                    avg_duration_ms = (total_duration_ms + excluded.total_duration_ms) / (query_count + 1),
                    max_duration_ms = MAX(max_duration_ms, excluded.max_duration_ms),
                    last_seen_at = excluded.last_seen_at
                "#,
                params![
                    project_id,
                    fingerprint,
                    normalized_query,
                    query_type,
                    duration_ms,
                    fmt_ts(now),
                ],
            )
            .context("Failed to record SQL observation")?;
        Ok(())
    }

    /// Aggregate stats for one query shape
    pub fn get_sql_fingerprint(
        &self,
        project_id: i64,
        fingerprint: &str,
    ) -> Result<Option<SqlFingerprintStat>> {
        let result = self
            .conn
            .query_row(
                r#"
                SELECT fingerprint, normalized_query, query_type, query_count,
                       total_duration_ms, avg_duration_ms, max_duration_ms
                FROM sql_fingerprints
                WHERE project_id = ?1 AND fingerprint = ?2
                "#,
                params![project_id, fingerprint],
                |row| {
                    Ok(SqlFingerprintStat {
                        fingerprint: row.get(0)?,
                        normalized_query: row.get(1)?,
                        query_type: row
                            .get::<_, String>(2)?
                            .parse()
                            .unwrap_or(crate::fingerprint::QueryType::Other),
                        query_count: row.get::<_, i64>(3)? as u64,
                        total_duration_ms: row.get(4)?,
                        avg_duration_ms: row.get(5)?,
                        max_duration_ms: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to get SQL fingerprint")?;

        Ok(result)
    }

    // ==================== Alert Rules ====================

    /// Add a rule (seeding and tests; rules are otherwise configured externally)
    pub fn insert_alert_rule(
        &self,
        project_id: i64,
        rule_type: AlertType,
        threshold: u32,
        time_window_minutes: u32,
        cooldown_minutes: u32,
    ) -> Result<i64> {
        self.conn
            .execute(
                r#"
                INSERT INTO alert_rules (project_id, rule_type, threshold, time_window_minutes, cooldown_minutes, enabled)
                VALUES (?1, ?2, ?3, ?4, ?5, 1)
                "#,
                params![
                    project_id,
                    rule_type.to_string(),
                    threshold,
                    time_window_minutes,
                    cooldown_minutes
                ],
            )
            .context("Failed to insert alert rule")?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Enabled rules of one type for a project
    pub fn enabled_rules(&self, project_id: i64, rule_type: AlertType) -> Result<Vec<AlertRule>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, project_id, rule_type, threshold, time_window_minutes, cooldown_minutes, enabled
            FROM alert_rules
            WHERE project_id = ?1 AND rule_type = ?2 AND enabled = 1
            "#,
        )?;

        let rows = stmt.query_map(params![project_id, rule_type.to_string()], |row| {
            Ok(AlertRule {
                id: row.get(0)?,
                project_id: row.get(1)?,
                rule_type: row.get::<_, String>(2)?.parse().unwrap_or(rule_type),
                threshold: row.get::<_, i64>(3)? as u32,
                time_window_minutes: row.get::<_, i64>(4)? as u32,
                cooldown_minutes: row.get::<_, i64>(5)? as u32,
                enabled: row.get(6)?,
            })
        })?;

        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }

        Ok(rules)
    }

    // ==================== Notifications ====================

    /// Create a pending audit row for a dispatch attempt
    pub fn insert_notification(&self, notification: &AlertNotification) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO alert_notifications (id, rule_id, alert_type, payload, status, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    notification.id,
                    notification.rule_id,
                    notification.alert_type.to_string(),
                    notification.payload.to_string(),
                    notification.status.to_string(),
                    fmt_ts(notification.created_at),
                ],
            )
            .context("Failed to insert notification")?;
        Ok(())
    }

    /// Terminal status: delivered
    pub fn mark_notification_sent(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE alert_notifications SET status = 'sent', completed_at = ?1 WHERE id = ?2",
                params![fmt_ts(now), id],
            )
            .context("Failed to mark notification sent")?;
        Ok(())
    }

    /// Terminal status: failed, with the captured error
    pub fn mark_notification_failed(&self, id: &str, error: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE alert_notifications SET status = 'failed', error = ?1, completed_at = ?2 WHERE id = ?3",
                params![error, fmt_ts(now), id],
            )
            .context("Failed to mark notification failed")?;
        Ok(())
    }

    /// Most recent dispatch attempts, newest first
    pub fn recent_notifications(&self, limit: usize) -> Result<Vec<AlertNotification>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, rule_id, alert_type, payload, status, error, created_at, completed_at
            FROM alert_notifications
            ORDER BY created_at DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;

        let mut notifications = Vec::new();
        for row in rows {
            let (id, rule_id, alert_type, payload, status, error, created_at, completed_at) = row?;
            notifications.push(AlertNotification {
                id,
                rule_id,
                alert_type: alert_type.parse().unwrap_or(AlertType::NewIssue),
                payload: serde_json::from_str(&payload)?,
                status: status.parse().unwrap_or(NotificationStatus::Pending),
                error,
                created_at: parse_ts(&created_at)?,
                completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
            });
        }

        Ok(notifications)
    }

    // ==================== Notification Preferences ====================

    /// Preference row for a (project, alert type), created on first use
    pub fn get_or_create_preference(
        &self,
        project_id: i64,
        alert_type: AlertType,
    ) -> Result<NotificationPreference> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO notification_preferences (project_id, alert_type, frequency) \
                 VALUES (?1, ?2, 'immediate')",
                params![project_id, alert_type.to_string()],
            )
            .context("Failed to create notification preference")?;

        let pref = self.conn.query_row(
            "SELECT id, project_id, alert_type, frequency, last_sent_at \
             FROM notification_preferences WHERE project_id = ?1 AND alert_type = ?2",
            params![project_id, alert_type.to_string()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )?;

        let (id, project_id, alert_type_s, frequency, last_sent_at) = pref;
        Ok(NotificationPreference {
            id,
            project_id,
            alert_type: alert_type_s.parse().unwrap_or(alert_type),
            frequency: frequency.parse().unwrap_or(FrequencyPolicy::Immediate),
            last_sent_at: last_sent_at.as_deref().map(parse_ts).transpose()?,
        })
    }

    /// Change the frequency policy for a (project, alert type)
    pub fn set_preference_frequency(
        &self,
        project_id: i64,
        alert_type: AlertType,
        frequency: FrequencyPolicy,
    ) -> Result<()> {
        self.get_or_create_preference(project_id, alert_type)?;
        self.conn
            .execute(
                "UPDATE notification_preferences SET frequency = ?1 \
                 WHERE project_id = ?2 AND alert_type = ?3",
                params![frequency.to_string(), project_id, alert_type.to_string()],
            )
            .context("Failed to set preference frequency")?;
        Ok(())
    }

    /// Stamp `last_sent_at`; called under the dispatcher's claim transaction
    pub fn mark_preference_sent(
        &self,
        project_id: i64,
        alert_type: AlertType,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.set_preference_last_sent(project_id, alert_type, Some(now))
    }

    /// Overwrite `last_sent_at`, including back to its prior value when a
    /// claimed send fails to deliver
    pub fn set_preference_last_sent(
        &self,
        project_id: i64,
        alert_type: AlertType,
        last_sent_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE notification_preferences SET last_sent_at = ?1 \
                 WHERE project_id = ?2 AND alert_type = ?3",
                params![last_sent_at.map(fmt_ts), project_id, alert_type.to_string()],
            )
            .context("Failed to set preference last-sent")?;
        Ok(())
    }

    // ==================== Counters ====================

    /// Increment a counter, restarting at one when the prior value expired
    pub fn counter_increment(&self, key: &str, now: DateTime<Utc>) -> Result<u64> {
        let value: i64 = self
            .conn
            .query_row(
                r#"
                INSERT INTO counters (key, value, expires_at) VALUES (?1, 1, NULL)
                ON CONFLICT(key) DO UPDATE SET
                    value = CASE WHEN counters.expires_at IS NOT NULL AND counters.expires_at <= ?2
                                 THEN 1 ELSE counters.value + 1 END,
                    expires_at = CASE WHEN counters.expires_at IS NOT NULL AND counters.expires_at <= ?2
                                      THEN NULL ELSE counters.expires_at END
                RETURNING value
                "#,
                params![key, fmt_ts(now)],
                |row| row.get(0),
            )
            .context("Failed to increment counter")?;
        Ok(value as u64)
    }

    /// Set the expiry on a live counter; a no-op for absent or expired keys
    pub fn counter_expire(
        &self,
        key: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE counters SET expires_at = ?2 \
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?3)",
                params![key, fmt_ts(expires_at), fmt_ts(now)],
            )
            .context("Failed to set counter expiry")?;
        Ok(())
    }

    /// Current value of a counter, if present and unexpired
    pub fn counter_get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<u64>> {
        let value: Option<i64> = self
            .conn
            .query_row(
                "SELECT value FROM counters \
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, fmt_ts(now)],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to get counter")?;
        Ok(value.map(|v| v as u64))
    }

    /// Remove a counter
    pub fn counter_delete(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM counters WHERE key = ?1", params![key])
            .context("Failed to delete counter")?;
        Ok(())
    }

    /// Set-if-absent flag; true when this call created it
    pub fn counter_acquire(
        &self,
        key: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.conn
            .execute(
                "DELETE FROM counters WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                params![key, fmt_ts(now)],
            )
            .context("Failed to clear expired counter")?;

        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO counters (key, value, expires_at) VALUES (?1, 1, ?2)",
                params![key, fmt_ts(expires_at)],
            )
            .context("Failed to acquire counter flag")?;
        Ok(inserted > 0)
    }

    /// Drop every expired counter, returning how many were removed
    pub fn counter_purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM counters WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![fmt_ts(now)],
            )
            .context("Failed to purge expired counters")?;
        Ok(removed)
    }

    // ==================== Statistics ====================

    /// Get database statistics
    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let open_issues: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM issues WHERE status = 'open'",
            [],
            |row| row.get(0),
        )?;

        let total_events: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;

        let open_incidents: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM performance_incidents WHERE status = 'open'",
            [],
            |row| row.get(0),
        )?;

        let pending_notifications: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM alert_notifications WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;

        Ok(DatabaseStats {
            open_issues: open_issues as usize,
            total_events: total_events as usize,
            open_incidents: open_incidents as usize,
            pending_notifications: pending_notifications as usize,
        })
    }
}

/// Database statistics
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub open_issues: usize,
    pub total_events: usize,
    pub open_incidents: usize,
    pub pending_notifications: usize,
}

// Internal row types for database mapping

const ISSUE_SELECT: &str = "SELECT id, project_id, fingerprint, exception_class, origin_file, \
     sample_message, status, occurrence_count, first_seen_at, last_seen_at, closed_at FROM issues";

struct IssueRow {
    id: i64,
    project_id: i64,
    fingerprint: String,
    exception_class: String,
    origin_file: String,
    sample_message: String,
    status: String,
    occurrence_count: i64,
    first_seen_at: String,
    last_seen_at: String,
    closed_at: Option<String>,
}

fn issue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IssueRow> {
    Ok(IssueRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        fingerprint: row.get(2)?,
        exception_class: row.get(3)?,
        origin_file: row.get(4)?,
        sample_message: row.get(5)?,
        status: row.get(6)?,
        occurrence_count: row.get(7)?,
        first_seen_at: row.get(8)?,
        last_seen_at: row.get(9)?,
        closed_at: row.get(10)?,
    })
}

impl IssueRow {
    fn into_issue(self) -> Result<Issue> {
        let status = match self.status.as_str() {
            "open" => IssueStatus::Open,
            "wip" => IssueStatus::Wip,
            "closed" => IssueStatus::Closed,
            _ => IssueStatus::Open,
        };

        Ok(Issue {
            id: self.id,
            project_id: self.project_id,
            fingerprint: self.fingerprint,
            exception_class: self.exception_class,
            origin_file: self.origin_file,
            sample_message: self.sample_message,
            status,
            occurrence_count: self.occurrence_count as u64,
            first_seen_at: parse_ts(&self.first_seen_at)?,
            last_seen_at: parse_ts(&self.last_seen_at)?,
            closed_at: self.closed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

const ROLLUP_SELECT: &str = "SELECT id, project_id, timeframe, window_start, target, environment, \
     request_count, avg_duration_ms, p50_ms, p95_ms, p99_ms, min_ms, max_ms, error_count, \
     histogram, updated_at FROM perf_rollups";

struct RollupRow {
    id: i64,
    project_id: i64,
    timeframe: String,
    window_start: String,
    target: String,
    environment: String,
    request_count: i64,
    avg_duration_ms: f64,
    p50_ms: f64,
    p95_ms: f64,
    p99_ms: f64,
    min_ms: f64,
    max_ms: f64,
    error_count: i64,
    histogram: Option<Vec<u8>>,
    updated_at: String,
}

fn rollup_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RollupRow> {
    Ok(RollupRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        timeframe: row.get(2)?,
        window_start: row.get(3)?,
        target: row.get(4)?,
        environment: row.get(5)?,
        request_count: row.get(6)?,
        avg_duration_ms: row.get(7)?,
        p50_ms: row.get(8)?,
        p95_ms: row.get(9)?,
        p99_ms: row.get(10)?,
        min_ms: row.get(11)?,
        max_ms: row.get(12)?,
        error_count: row.get(13)?,
        histogram: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

impl RollupRow {
    fn into_rollup(self) -> Result<PerfRollup> {
        let timeframe = match self.timeframe.as_str() {
            "hour" => Timeframe::Hour,
            _ => Timeframe::Minute,
        };

        Ok(PerfRollup {
            id: Some(self.id),
            project_id: self.project_id,
            timeframe,
            window_start: parse_ts(&self.window_start)?,
            target: self.target,
            environment: self.environment,
            request_count: self.request_count as u64,
            avg_duration_ms: self.avg_duration_ms,
            p50_ms: self.p50_ms,
            p95_ms: self.p95_ms,
            p99_ms: self.p99_ms,
            min_ms: self.min_ms,
            max_ms: self.max_ms,
            error_count: self.error_count as u64,
            histogram: self.histogram,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

const INCIDENT_SELECT: &str = "SELECT id, project_id, target, status, severity, opened_at, \
     closed_at, trigger_p95_ms, peak_p95_ms, resolve_p95_ms, threshold_ms, breach_count, \
     open_notified, close_notified FROM performance_incidents";

struct IncidentRow {
    id: i64,
    project_id: i64,
    target: String,
    status: String,
    severity: String,
    opened_at: String,
    closed_at: Option<String>,
    trigger_p95_ms: f64,
    peak_p95_ms: f64,
    resolve_p95_ms: Option<f64>,
    threshold_ms: f64,
    breach_count: i64,
    open_notified: bool,
    close_notified: bool,
}

fn incident_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IncidentRow> {
    Ok(IncidentRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        target: row.get(2)?,
        status: row.get(3)?,
        severity: row.get(4)?,
        opened_at: row.get(5)?,
        closed_at: row.get(6)?,
        trigger_p95_ms: row.get(7)?,
        peak_p95_ms: row.get(8)?,
        resolve_p95_ms: row.get(9)?,
        threshold_ms: row.get(10)?,
        breach_count: row.get(11)?,
        open_notified: row.get(12)?,
        close_notified: row.get(13)?,
    })
}

impl IncidentRow {
    fn into_incident(self) -> Result<Incident> {
        let status = match self.status.as_str() {
            "closed" => IncidentStatus::Closed,
            _ => IncidentStatus::Open,
        };

        let severity = match self.severity.as_str() {
            "critical" => IncidentSeverity::Critical,
            _ => IncidentSeverity::Warning,
        };

        Ok(Incident {
            id: self.id,
            project_id: self.project_id,
            target: self.target,
            status,
            severity,
            opened_at: parse_ts(&self.opened_at)?,
            closed_at: self.closed_at.as_deref().map(parse_ts).transpose()?,
            trigger_p95_ms: self.trigger_p95_ms,
            peak_p95_ms: self.peak_p95_ms,
            resolve_p95_ms: self.resolve_p95_ms,
            threshold_ms: self.threshold_ms,
            breach_count: self.breach_count as u64,
            open_notified: self.open_notified,
            close_notified: self.close_notified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_database_creation() {
        let db = Database::open_in_memory().unwrap();
        let stats = db.get_stats().unwrap();
        assert_eq!(stats.open_issues, 0);
        assert_eq!(stats.total_events, 0);
    }

    #[test]
    fn test_issue_upsert_idempotence() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap();
        let project = db.create_project("demo", now).unwrap();

        for _ in 0..5 {
            db.upsert_issue(project, "fp1", "NoMethodError", "app/models/user.rb", "boom", now)
                .unwrap();
        }

        let issue = db.get_issue_by_fingerprint(project, "fp1").unwrap().unwrap();
        assert_eq!(issue.occurrence_count, 5);
        assert_eq!(db.get_stats().unwrap().open_issues, 1);
    }

    #[test]
    fn test_issue_reopen_tracks_prior_close() {
        let db = Database::open_in_memory().unwrap();
        let t0 = ts("2026-08-30T12:00:00Z");
        let t1 = ts("2026-08-30T13:00:00Z");
        let project = db.create_project("demo", t0).unwrap();

        let first = db
            .upsert_issue(project, "fp1", "NoMethodError", "user.rb", "boom", t0)
            .unwrap();
        assert!(first.created);
        assert!(!first.reopened);

        db.close_issue(first.issue.id, t0).unwrap();

        let second = db
            .upsert_issue(project, "fp1", "NoMethodError", "user.rb", "boom", t1)
            .unwrap();
        assert!(!second.created);
        assert!(second.reopened);
        assert_eq!(second.previously_closed_at, Some(t0));
        assert_eq!(second.issue.status, IssueStatus::Open);
        assert_eq!(second.issue.closed_at, None);
    }

    #[test]
    fn test_only_one_open_incident_per_target() {
        let db = Database::open_in_memory().unwrap();
        let now = ts("2026-08-30T12:00:00Z");
        let project = db.create_project("demo", now).unwrap();

        let first = db
            .insert_incident(project, "UsersController#index", IncidentSeverity::Warning, 800.0, 750.0, now)
            .unwrap();
        assert!(first.is_some());

        let second = db
            .insert_incident(project, "UsersController#index", IncidentSeverity::Warning, 900.0, 750.0, now)
            .unwrap();
        assert!(second.is_none());

        db.close_incident(first.unwrap(), 300.0, now).unwrap();

        let third = db
            .insert_incident(project, "UsersController#index", IncidentSeverity::Warning, 820.0, 750.0, now)
            .unwrap();
        assert!(third.is_some());
    }

    #[test]
    fn test_rollup_upsert_overwrites() {
        let db = Database::open_in_memory().unwrap();
        let now = ts("2026-08-30T12:00:00Z");
        let project = db.create_project("demo", now).unwrap();

        let mut rollup = PerfRollup {
            id: None,
            project_id: project,
            timeframe: Timeframe::Minute,
            window_start: now,
            target: "UsersController#index".to_string(),
            environment: "production".to_string(),
            request_count: 2,
            avg_duration_ms: 300.0,
            p50_ms: 200.0,
            p95_ms: 400.0,
            p99_ms: 400.0,
            min_ms: 200.0,
            max_ms: 400.0,
            error_count: 0,
            histogram: None,
            updated_at: now,
        };

        db.upsert_rollup(&rollup).unwrap();
        rollup.request_count = 3;
        rollup.error_count = 1;
        db.upsert_rollup(&rollup).unwrap();

        let stored = db
            .get_rollup(project, Timeframe::Minute, now, "UsersController#index", "production")
            .unwrap()
            .unwrap();
        assert_eq!(stored.request_count, 3);
        assert_eq!(stored.error_count, 1);
    }

    #[test]
    fn test_sql_observation_aggregation() {
        let db = Database::open_in_memory().unwrap();
        let now = ts("2026-08-30T12:00:00Z");
        let project = db.create_project("demo", now).unwrap();

        db.record_sql_observation(project, "q1", "SELECT ?", "select", 10.0, now)
            .unwrap();
        db.record_sql_observation(project, "q1", "SELECT ?", "select", 30.0, now)
            .unwrap();

        let stat = db.get_sql_fingerprint(project, "q1").unwrap().unwrap();
        assert_eq!(stat.query_count, 2);
        assert!((stat.total_duration_ms - 40.0).abs() < f64::EPSILON);
        assert!((stat.avg_duration_ms - 20.0).abs() < f64::EPSILON);
        assert!((stat.max_duration_ms - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_minute_rollups_scoped_to_project() {
        let db = Database::open_in_memory().unwrap();
        let now = ts("2026-08-30T12:00:00Z");
        let first = db.create_project("one", now).unwrap();
        let second = db.create_project("two", now).unwrap();

        let base = PerfRollup {
            id: None,
            project_id: first,
            timeframe: Timeframe::Minute,
            window_start: now,
            target: "UsersController#index".to_string(),
            environment: "production".to_string(),
            request_count: 1,
            avg_duration_ms: 100.0,
            p50_ms: 100.0,
            p95_ms: 100.0,
            p99_ms: 100.0,
            min_ms: 100.0,
            max_ms: 100.0,
            error_count: 0,
            histogram: None,
            updated_at: now,
        };
        db.upsert_rollup(&base).unwrap();
        db.upsert_rollup(&PerfRollup {
            project_id: second,
            p95_ms: 900.0,
            ..base.clone()
        })
        .unwrap();

        let window_end = ts("2026-08-30T12:01:00Z");
        let scoped = db.minute_rollups_for_project(first, now, window_end).unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].project_id, first);

        let all = db.minute_rollups_in_window(now, window_end).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_preference_last_sent_can_be_cleared() {
        let db = Database::open_in_memory().unwrap();
        let now = ts("2026-08-30T12:00:00Z");
        let project = db.create_project("demo", now).unwrap();

        db.get_or_create_preference(project, AlertType::NPlusOne).unwrap();
        db.mark_preference_sent(project, AlertType::NPlusOne, now).unwrap();
        db.set_preference_last_sent(project, AlertType::NPlusOne, None)
            .unwrap();

        let pref = db.get_or_create_preference(project, AlertType::NPlusOne).unwrap();
        assert_eq!(pref.last_sent_at, None);
    }

    #[test]
    fn test_preference_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let now = ts("2026-08-30T12:00:00Z");
        let project = db.create_project("demo", now).unwrap();

        let pref = db.get_or_create_preference(project, AlertType::NPlusOne).unwrap();
        assert_eq!(pref.frequency, FrequencyPolicy::Immediate);
        assert_eq!(pref.last_sent_at, None);

        db.set_preference_frequency(project, AlertType::NPlusOne, FrequencyPolicy::Every30Minutes)
            .unwrap();
        db.mark_preference_sent(project, AlertType::NPlusOne, now).unwrap();

        let pref = db.get_or_create_preference(project, AlertType::NPlusOne).unwrap();
        assert_eq!(pref.frequency, FrequencyPolicy::Every30Minutes);
        assert_eq!(pref.last_sent_at, Some(now));
    }
}
