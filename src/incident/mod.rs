//! Incident detection over rollup percentiles
//!
//! A state machine per (project, target):
//! NONE -> WARMING_UP -> OPEN(warning|critical) -> RECOVERING -> CLOSED.
//! Warm-up requires a streak of consecutive breaching ticks before opening;
//! recovery requires the same streak length below threshold before closing;
//! a cooldown after close suppresses immediate reopening. Streak counters
//! live in the TTL counter store, so a stalled evaluation schedule quietly
//! resets partial streaks instead of acting on stale ones.

mod thresholds;

pub use thresholds::{resolve_thresholds, LatencyThresholds};

use crate::alert::{AlertDispatcher, AlertType, DispatchOutcome};
use crate::config::IncidentConfig;
use crate::counter::{increment_with_ttl, CounterStore};
use crate::rollup::minute_bucket;
use crate::storage::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

/// Streak counters expire after this long; a broken or stalled streak
/// self-resets rather than resuming
const STREAK_TTL: Duration = Duration::from_secs(600);

/// Mutual-exclusion flag for the evaluation pass; short enough that a
/// crashed run cannot block the schedule for long
const EVAL_LOCK_TTL: Duration = Duration::from_secs(55);

const EVAL_LOCK_KEY: &str = "incident:eval:lock";

/// An open incident with no rollup data for this long is treated as
/// recovered: absence of traffic is indistinguishable from recovery
const STALE_AFTER_MINUTES: i64 = 5;

/// Incident lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentStatus {
    Open,
    Closed,
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncidentStatus::Open => write!(f, "open"),
            IncidentStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Incident severity; escalation is one-way while open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentSeverity {
    Warning,
    Critical,
}

impl std::fmt::Display for IncidentSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncidentSeverity::Warning => write!(f, "warning"),
            IncidentSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// A tracked latency degradation for one target
#[derive(Debug, Clone)]
pub struct Incident {
    pub id: i64,
    pub project_id: i64,
    pub target: String,
    pub status: IncidentStatus,
    pub severity: IncidentSeverity,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub trigger_p95_ms: f64,
    pub peak_p95_ms: f64,
    pub resolve_p95_ms: Option<f64>,
    pub threshold_ms: f64,
    pub breach_count: u64,
    pub open_notified: bool,
    pub close_notified: bool,
}

/// What one evaluation tick did for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Below thresholds, no open incident
    Idle,
    /// Breaching, streak not yet long enough
    WarmingUp(u64),
    /// Breach recorded on an already-open incident
    Breaching,
    /// Breach ignored because the target closed within the cooldown window
    CooldownSuppressed,
    /// Incident opened this tick
    Opened(i64),
    /// Open incident, recovery streak building
    Recovering(u64),
    /// Incident closed this tick
    Closed(i64),
}

/// Result of a full evaluation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalOutcome {
    /// Another evaluation held the lock; this tick was skipped, not queued
    Skipped,
    Completed { evaluated: usize, opened: usize, closed: usize },
}

/// Stateful evaluator watching rollup percentiles per target
pub struct IncidentEngine<'a> {
    db: &'a Database,
    counters: &'a dyn CounterStore,
    dispatcher: &'a AlertDispatcher<'a>,
    config: &'a IncidentConfig,
}

impl<'a> IncidentEngine<'a> {
    pub fn new(
        db: &'a Database,
        counters: &'a dyn CounterStore,
        dispatcher: &'a AlertDispatcher<'a>,
        config: &'a IncidentConfig,
    ) -> Self {
        Self {
            db,
            counters,
            dispatcher,
            config,
        }
    }

    /// Evaluate every active project under the mutual-exclusion flag. The
    /// flag is released on every exit path; its TTL covers a crashed run.
    pub async fn evaluate_all(&self, now: DateTime<Utc>) -> Result<EvalOutcome> {
        if !self.counters.acquire(EVAL_LOCK_KEY, EVAL_LOCK_TTL)? {
            debug!("incident evaluation already running, skipping tick");
            return Ok(EvalOutcome::Skipped);
        }

        let result = self.evaluate_all_inner(now).await;
        if let Err(e) = self.counters.delete(EVAL_LOCK_KEY) {
            error!(error = %e, "failed to release evaluation lock");
        }
        result
    }

    async fn evaluate_all_inner(&self, now: DateTime<Utc>) -> Result<EvalOutcome> {
        let mut evaluated = 0;
        let mut opened = 0;
        let mut closed = 0;

        for project_id in self.db.project_ids()? {
            // One bad project must not block the others.
            match self.evaluate_project(project_id, now).await {
                Ok(outcomes) => {
                    evaluated += outcomes.len();
                    opened += outcomes
                        .iter()
                        .filter(|o| matches!(o, TickOutcome::Opened(_)))
                        .count();
                    closed += outcomes
                        .iter()
                        .filter(|o| matches!(o, TickOutcome::Closed(_)))
                        .count();
                }
                Err(e) => {
                    error!(project_id, error = %e, "incident evaluation failed for project");
                }
            }
        }

        closed += self.sweep_stale_incidents(now).await?;

        info!(evaluated, opened, closed, "incident evaluation pass complete");
        Ok(EvalOutcome::Completed {
            evaluated,
            opened,
            closed,
        })
    }

    /// Evaluate every target that produced a rollup in the most recent
    /// completed minute window
    async fn evaluate_project(
        &self,
        project_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<TickOutcome>> {
        let project = self
            .db
            .get_project(project_id)?
            .with_context(|| format!("Unknown project: {}", project_id))?;

        let window_start = minute_bucket(now) - ChronoDuration::minutes(2);
        let window_end = window_start + ChronoDuration::minutes(1);

        let rollups = self
            .db
            .minute_rollups_for_project(project_id, window_start, window_end)?;

        let mut outcomes = Vec::new();
        for rollup in rollups {
            let outcome = self
                .evaluate_endpoint(project_id, &project.name, &rollup.target, rollup.p95_ms, now)
                .await?;
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Run one tick of the state machine for a single target
    pub async fn evaluate_endpoint(
        &self,
        project_id: i64,
        project_name: &str,
        target: &str,
        current_p95: f64,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        let thresholds = resolve_thresholds(self.config, project_name, target);

        if current_p95 >= thresholds.warning_ms {
            self.handle_breach(project_id, target, current_p95, &thresholds, now)
                .await
        } else {
            self.handle_recovery(project_id, target, current_p95, &thresholds, now)
                .await
        }
    }

    async fn handle_breach(
        &self,
        project_id: i64,
        target: &str,
        current_p95: f64,
        thresholds: &LatencyThresholds,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        let breached_critical = current_p95 >= thresholds.critical_ms;
        let severity = if breached_critical {
            IncidentSeverity::Critical
        } else {
            IncidentSeverity::Warning
        };

        if let Some(open) = self.db.open_incident(project_id, target)? {
            // Escalate but never downgrade while open.
            let updated_severity = if breached_critical || open.severity == IncidentSeverity::Critical
            {
                IncidentSeverity::Critical
            } else {
                IncidentSeverity::Warning
            };
            let peak = open.peak_p95_ms.max(current_p95);
            self.db
                .update_incident_breach(open.id, peak, updated_severity)?;
            return Ok(TickOutcome::Breaching);
        }

        // Anti-flap: a target that closed within the cooldown window stays
        // quiet, the breach does not even count toward a new warm-up.
        if let Some(closed_at) = self.db.last_incident_closed_at(project_id, target)? {
            let cooldown = ChronoDuration::from_std(thresholds.cooldown).unwrap_or_default();
            if now - closed_at < cooldown {
                debug!(project_id, target, "breach suppressed by cooldown");
                return Ok(TickOutcome::CooldownSuppressed);
            }
        }

        let warmup_key = warmup_key(project_id, target);
        let streak = increment_with_ttl(self.counters, &warmup_key, STREAK_TTL)?;
        if streak < u64::from(thresholds.warmup_ticks) {
            return Ok(TickOutcome::WarmingUp(streak));
        }

        self.counters.delete(&warmup_key)?;

        let threshold_ms = if breached_critical {
            thresholds.critical_ms
        } else {
            thresholds.warning_ms
        };

        // The partial unique index makes this atomic: a concurrent open for
        // the same target leaves exactly one row.
        let Some(incident_id) =
            self.db
                .insert_incident(project_id, target, severity, current_p95, threshold_ms, now)?
        else {
            return Ok(TickOutcome::Breaching);
        };

        info!(project_id, target, incident_id, %severity, p95 = current_p95, "incident opened");
        self.notify_incident(incident_id, project_id, target, true, current_p95, now)
            .await?;

        Ok(TickOutcome::Opened(incident_id))
    }

    async fn handle_recovery(
        &self,
        project_id: i64,
        target: &str,
        current_p95: f64,
        thresholds: &LatencyThresholds,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        let warmup = warmup_key(project_id, target);
        self.counters.delete(&warmup)?;

        let Some(open) = self.db.open_incident(project_id, target)? else {
            return Ok(TickOutcome::Idle);
        };

        let recovery_key = recovery_key(project_id, target);
        let streak = increment_with_ttl(self.counters, &recovery_key, STREAK_TTL)?;
        if streak < u64::from(thresholds.warmup_ticks) {
            return Ok(TickOutcome::Recovering(streak));
        }

        self.counters.delete(&recovery_key)?;
        self.db.close_incident(open.id, current_p95, now)?;

        info!(project_id, target, incident_id = open.id, p95 = current_p95, "incident closed");
        self.notify_incident(open.id, project_id, target, false, current_p95, now)
            .await?;

        Ok(TickOutcome::Closed(open.id))
    }

    /// Close any open incident whose target went silent. No rollup data for
    /// five minutes is treated as recovery, in a single tick, with p95 = 0.
    async fn sweep_stale_incidents(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut swept = 0;

        for incident in self.db.open_incidents()? {
            let last_window = self
                .db
                .last_rollup_window(incident.project_id, &incident.target)?;

            let stale = match last_window {
                Some(window) => now - window > ChronoDuration::minutes(STALE_AFTER_MINUTES),
                None => true,
            };

            if stale {
                self.db.close_incident(incident.id, 0.0, now)?;
                self.counters
                    .delete(&recovery_key(incident.project_id, &incident.target))?;
                info!(
                    incident_id = incident.id,
                    target = %incident.target,
                    "incident closed by stale sweep"
                );
                self.notify_incident(incident.id, incident.project_id, &incident.target, false, 0.0, now)
                    .await?;
                swept += 1;
            }
        }

        Ok(swept)
    }

    /// Enqueue an open/close notification through the dispatcher
    async fn notify_incident(
        &self,
        incident_id: i64,
        project_id: i64,
        target: &str,
        transition_open: bool,
        p95: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let transition = if transition_open { "open" } else { "close" };
        let payload = serde_json::json!({
            "incident_id": incident_id,
            "transition": transition,
            "target": target,
            "p95_ms": p95,
        });
        let subject = format!("Performance incident {} for {}", transition, target);

        let outcome = self
            .dispatcher
            .dispatch_global(project_id, AlertType::PerformanceRegression, &subject, payload, false, now)
            .await?;

        if outcome == DispatchOutcome::Sent {
            self.db.mark_incident_notified(incident_id, transition_open)?;
        }

        Ok(())
    }
}

fn warmup_key(project_id: i64, target: &str) -> String {
    format!("incident:warmup:{}:{}", project_id, target)
}

fn recovery_key(project_id: i64, target: &str) -> String {
    format!("incident:recovery:{}:{}", project_id, target)
}
