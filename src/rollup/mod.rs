//! Scheduled percentile rollups over raw performance samples
//!
//! The minute pass reads raw samples from a window lagging one full minute
//! behind now (late arrivals land inside it), builds a histogram per
//! (project, target, environment) group and upserts one rollup row per group.
//! The hour pass cascades minute rollups into hourly rows. Both passes write
//! idempotent upserts keyed by window identity, so retries and overlapping
//! runs recompute rather than double-count.

mod histogram;

pub use histogram::{DurationHistogram, DIGEST_VERSION, MAX_DURATION_MS, MIN_DURATION_MS};

use crate::storage::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Timelike, Utc};
use std::collections::HashMap;
use tracing::{debug, info};

/// Rollup window granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    Minute,
    Hour,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Minute => "minute",
            Timeframe::Hour => "hour",
        }
    }
}

/// One precomputed aggregate row
#[derive(Debug, Clone)]
pub struct PerfRollup {
    pub id: Option<i64>,
    pub project_id: i64,
    pub timeframe: Timeframe,
    pub window_start: DateTime<Utc>,
    pub target: String,
    pub environment: String,
    pub request_count: u64,
    pub avg_duration_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub error_count: u64,
    /// Versioned histogram digest; only minute rollups carry one
    pub histogram: Option<Vec<u8>>,
    pub updated_at: DateTime<Utc>,
}

/// Truncate to the start of the containing minute
pub fn minute_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .expect("truncation stays in range")
}

/// Truncate to the start of the containing hour
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    minute_bucket(ts)
        .with_minute(0)
        .expect("truncation stays in range")
}

/// Batch job producing minute and hour rollups
pub struct RollupEngine<'a> {
    db: &'a Database,
}

impl<'a> RollupEngine<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Run the minute pass for the window `[now-2m, now-1m)`. Returns the
    /// number of rollup rows written.
    pub fn run_minute_pass(&self, now: DateTime<Utc>) -> Result<usize> {
        let window_end = minute_bucket(now) - Duration::minutes(1);
        let window_start = window_end - Duration::minutes(1);
        self.rollup_minute_window(window_start, window_end)
    }

    /// Roll up one explicit minute window (reruns and backfills)
    pub fn rollup_minute_window(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<usize> {
        let events = self
            .db
            .performance_events_in_window(window_start, window_end)
            .context("Failed to load performance events for minute pass")?;

        // Histogram per (project, target, environment, minute bucket)
        let mut groups: HashMap<(i64, String, String, DateTime<Utc>), DurationHistogram> =
            HashMap::new();
        for event in &events {
            let key = (
                event.project_id,
                event.target.clone(),
                event.environment.clone(),
                minute_bucket(event.occurred_at),
            );
            groups.entry(key).or_default().record(event.duration_ms);
        }

        let error_counts: HashMap<(i64, String, String), u64> = self
            .db
            .error_counts_in_window(window_start, window_end)?
            .into_iter()
            .map(|(project_id, target, environment, count)| {
                ((project_id, target, environment), count)
            })
            .collect();

        let written = groups.len();
        let updated_at = Utc::now();
        for ((project_id, target, environment, bucket), hist) in groups {
            let error_count = error_counts
                .get(&(project_id, target.clone(), environment.clone()))
                .copied()
                .unwrap_or(0);

            let rollup = PerfRollup {
                id: None,
                project_id,
                timeframe: Timeframe::Minute,
                window_start: bucket,
                target,
                environment,
                request_count: hist.count(),
                avg_duration_ms: hist.avg(),
                p50_ms: hist.p50(),
                p95_ms: hist.p95(),
                p99_ms: hist.p99(),
                min_ms: hist.min(),
                max_ms: hist.max(),
                error_count,
                histogram: Some(hist.to_digest()),
                updated_at,
            };
            self.db
                .upsert_rollup(&rollup)
                .context("Failed to upsert minute rollup")?;
        }

        info!(
            window_start = %window_start,
            samples = events.len(),
            rollups = written,
            "minute rollup pass complete"
        );
        Ok(written)
    }

    /// Run the hour pass for the last fully-elapsed hour. Minute-level
    /// percentiles are averaged, not re-derived from merged histograms; a
    /// documented approximation downstream consumers rely on.
    pub fn run_hour_pass(&self, now: DateTime<Utc>) -> Result<usize> {
        let hour_start = hour_bucket(now) - Duration::hours(1);
        let hour_end = hour_start + Duration::hours(1);

        let minutes = self
            .db
            .minute_rollups_in_window(hour_start, hour_end)
            .context("Failed to load minute rollups for hour pass")?;

        let mut groups: HashMap<(i64, String, String), Vec<PerfRollup>> = HashMap::new();
        for rollup in minutes {
            let key = (
                rollup.project_id,
                rollup.target.clone(),
                rollup.environment.clone(),
            );
            groups.entry(key).or_default().push(rollup);
        }

        let written = groups.len();
        let updated_at = Utc::now();
        for ((project_id, target, environment), members) in groups {
            let request_count: u64 = members.iter().map(|m| m.request_count).sum();
            let error_count: u64 = members.iter().map(|m| m.error_count).sum();
            let weighted_sum: f64 = members
                .iter()
                .map(|m| m.avg_duration_ms * m.request_count as f64)
                .sum();
            let avg_duration_ms = if request_count == 0 {
                0.0
            } else {
                weighted_sum / request_count as f64
            };

            let n = members.len() as f64;
            let p50_ms = members.iter().map(|m| m.p50_ms).sum::<f64>() / n;
            let p95_ms = members.iter().map(|m| m.p95_ms).sum::<f64>() / n;
            let p99_ms = members.iter().map(|m| m.p99_ms).sum::<f64>() / n;
            let min_ms = members.iter().map(|m| m.min_ms).fold(f64::INFINITY, f64::min);
            let max_ms = members.iter().map(|m| m.max_ms).fold(0.0, f64::max);

            let rollup = PerfRollup {
                id: None,
                project_id,
                timeframe: Timeframe::Hour,
                window_start: hour_start,
                target,
                environment,
                request_count,
                avg_duration_ms,
                p50_ms,
                p95_ms,
                p99_ms,
                min_ms,
                max_ms,
                error_count,
                histogram: None,
                updated_at,
            };
            self.db
                .upsert_rollup(&rollup)
                .context("Failed to upsert hour rollup")?;
        }

        debug!(hour_start = %hour_start, rollups = written, "hour rollup pass complete");
        Ok(written)
    }
}
