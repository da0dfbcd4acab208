//! Alert dispatch: rate limiting, audit trail and fan-out
//!
//! The dispatcher decides *whether* and *what* to send; physical delivery is
//! an external collaborator behind the [`NotificationTransport`] trait. Two
//! rate-limit disciplines exist:
//! - per-fingerprint rule types use an atomic increment-with-TTL in the
//!   counter store, so distinct fingerprints never block each other
//! - globally-limited types hold one preference row per (project, alert
//!   type); check and claim run inside one immediate transaction so
//!   concurrent evaluators cannot both pass it
//!
//! Rate-limit state is released when delivery fails, so a retried dispatch
//! passes the same check again.

use crate::config::AlertingConfig;
use crate::counter::CounterStore;
use crate::storage::Database;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Alert rule types. Per-fingerprint types cool down per compound key;
/// global types share one preference record per project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertType {
    ErrorFrequency,
    NewIssue,
    PerformanceRegression,
    NPlusOne,
}

impl AlertType {
    /// Global types rate-limit per (project, alert type) rather than per
    /// fingerprint
    pub fn is_global(&self) -> bool {
        matches!(self, AlertType::PerformanceRegression | AlertType::NPlusOne)
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertType::ErrorFrequency => write!(f, "error_frequency"),
            AlertType::NewIssue => write!(f, "new_issue"),
            AlertType::PerformanceRegression => write!(f, "performance_regression"),
            AlertType::NPlusOne => write!(f, "n_plus_one"),
        }
    }
}

impl std::str::FromStr for AlertType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "error_frequency" => Ok(AlertType::ErrorFrequency),
            "new_issue" => Ok(AlertType::NewIssue),
            "performance_regression" => Ok(AlertType::PerformanceRegression),
            "n_plus_one" => Ok(AlertType::NPlusOne),
            other => anyhow::bail!("Unknown alert type: {}", other),
        }
    }
}

/// Frequency policy on a global notification preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrequencyPolicy {
    Immediate,
    Every30Minutes,
    Every2Hours,
    /// Send once, never again for the same preference record
    FirstInDeploy,
    /// Send only on a close-then-reopen transition
    AfterClose,
}

impl FrequencyPolicy {
    /// Whether a dispatch is permitted given the last send time
    pub fn permits(&self, last_sent_at: Option<DateTime<Utc>>, now: DateTime<Utc>, reopened: bool) -> bool {
        match self {
            FrequencyPolicy::Immediate => true,
            FrequencyPolicy::Every30Minutes => {
                quiet_for(last_sent_at, now, ChronoDuration::minutes(30))
            }
            FrequencyPolicy::Every2Hours => quiet_for(last_sent_at, now, ChronoDuration::hours(2)),
            FrequencyPolicy::FirstInDeploy => last_sent_at.is_none(),
            FrequencyPolicy::AfterClose => reopened,
        }
    }
}

fn quiet_for(last_sent_at: Option<DateTime<Utc>>, now: DateTime<Utc>, window: ChronoDuration) -> bool {
    match last_sent_at {
        Some(at) => now - at >= window,
        None => true,
    }
}

impl std::fmt::Display for FrequencyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrequencyPolicy::Immediate => write!(f, "immediate"),
            FrequencyPolicy::Every30Minutes => write!(f, "every_30_minutes"),
            FrequencyPolicy::Every2Hours => write!(f, "every_2_hours"),
            FrequencyPolicy::FirstInDeploy => write!(f, "first_in_deploy"),
            FrequencyPolicy::AfterClose => write!(f, "after_close"),
        }
    }
}

impl std::str::FromStr for FrequencyPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "immediate" => Ok(FrequencyPolicy::Immediate),
            "every_30_minutes" => Ok(FrequencyPolicy::Every30Minutes),
            "every_2_hours" => Ok(FrequencyPolicy::Every2Hours),
            "first_in_deploy" => Ok(FrequencyPolicy::FirstInDeploy),
            "after_close" => Ok(FrequencyPolicy::AfterClose),
            other => anyhow::bail!("Unknown frequency policy: {}", other),
        }
    }
}

/// A configured alert rule, consumed read-only
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub id: i64,
    pub project_id: i64,
    pub rule_type: AlertType,
    pub threshold: u32,
    pub time_window_minutes: u32,
    pub cooldown_minutes: u32,
    pub enabled: bool,
}

/// Terminal state of a dispatch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationStatus::Pending => write!(f, "pending"),
            NotificationStatus::Sent => write!(f, "sent"),
            NotificationStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for NotificationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "sent" => Ok(NotificationStatus::Sent),
            "failed" => Ok(NotificationStatus::Failed),
            other => anyhow::bail!("Unknown notification status: {}", other),
        }
    }
}

/// Audit record of one dispatch attempt
#[derive(Debug, Clone)]
pub struct AlertNotification {
    pub id: String,
    pub rule_id: Option<i64>,
    pub alert_type: AlertType,
    pub payload: serde_json::Value,
    pub status: NotificationStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Rate-limit state for a globally-limited (project, alert type)
#[derive(Debug, Clone)]
pub struct NotificationPreference {
    pub id: i64,
    pub project_id: i64,
    pub alert_type: AlertType,
    pub frequency: FrequencyPolicy,
    pub last_sent_at: Option<DateTime<Utc>>,
}

/// A message handed to the notification transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertMessage {
    pub alert_type: AlertType,
    pub project_id: i64,
    pub subject: String,
    pub body: serde_json::Value,
}

/// External delivery seam. The core only decides whether and what to send.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// Deliver one message to one recipient
    async fn deliver(&self, recipient: &str, message: &AlertMessage) -> Result<()>;
}

/// Default transport: logs the message instead of delivering it
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn deliver(&self, recipient: &str, message: &AlertMessage) -> Result<()> {
        info!(
            recipient,
            alert_type = %message.alert_type,
            project_id = message.project_id,
            subject = %message.subject,
            "alert delivered"
        );
        Ok(())
    }
}

/// Outcome of a dispatch request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    /// Suppressed by a per-fingerprint cooldown or frequency policy
    RateLimited,
    /// No enabled rule matched
    NoRule,
}

/// Routes alert events to the transport with rate limiting and auditing
pub struct AlertDispatcher<'a> {
    db: &'a Database,
    counters: &'a dyn CounterStore,
    transport: &'a dyn NotificationTransport,
    config: AlertingConfig,
}

impl<'a> AlertDispatcher<'a> {
    pub fn new(
        db: &'a Database,
        counters: &'a dyn CounterStore,
        transport: &'a dyn NotificationTransport,
        config: AlertingConfig,
    ) -> Self {
        Self {
            db,
            counters,
            transport,
            config,
        }
    }

    /// Dispatch an alert for a specific fingerprint or target under a
    /// per-fingerprint rule type. The compound cooldown key keeps
    /// fingerprints independent of each other.
    pub async fn dispatch_fingerprint(
        &self,
        project_id: i64,
        alert_type: AlertType,
        fingerprint: &str,
        subject: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let rules = self.db.enabled_rules(project_id, alert_type)?;
        let Some(rule) = rules.first() else {
            debug!(project_id, alert_type = %alert_type, "no enabled rule");
            return Ok(DispatchOutcome::NoRule);
        };

        // A rule without its own cooldown falls back to the configured one.
        let cooldown_minutes = if rule.cooldown_minutes > 0 {
            rule.cooldown_minutes
        } else {
            self.config.fingerprint_cooldown_minutes
        };
        let cooldown = Duration::from_secs(u64::from(cooldown_minutes) * 60);
        let key = format!("alert:{}:{}", rule.id, fingerprint);
        let hits = crate::counter::increment_with_ttl(self.counters, &key, cooldown)?;
        if hits > 1 {
            debug!(%key, hits, "alert suppressed by fingerprint cooldown");
            return Ok(DispatchOutcome::RateLimited);
        }

        if let Err(e) = self
            .deliver_with_audit(Some(rule.id), project_id, alert_type, subject, payload, now)
            .await
        {
            // Clear the cooldown so the caller's retry is not suppressed.
            if let Err(clear) = self.counters.delete(&key) {
                warn!(%key, error = %clear, "failed to clear fingerprint cooldown");
            }
            return Err(e);
        }
        Ok(DispatchOutcome::Sent)
    }

    /// Dispatch under a globally rate-limited type. The permission check and
    /// the `last_sent_at` stamp run inside one immediate transaction, so two
    /// processes sharing the database cannot both claim the same send. A
    /// delivery failure releases the claim, leaving a retry free to pass the
    /// check again.
    pub async fn dispatch_global(
        &self,
        project_id: i64,
        alert_type: AlertType,
        subject: &str,
        payload: serde_json::Value,
        reopened: bool,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let claim = self.db.immediate(|db| {
            let pref = db.get_or_create_preference(project_id, alert_type)?;
            if !pref.frequency.permits(pref.last_sent_at, now, reopened) {
                return Ok(None);
            }
            db.mark_preference_sent(project_id, alert_type, now)?;
            Ok(Some(pref.last_sent_at))
        })?;

        let Some(previous_sent_at) = claim else {
            debug!(project_id, alert_type = %alert_type, "alert suppressed by frequency policy");
            return Ok(DispatchOutcome::RateLimited);
        };

        if let Err(e) = self
            .deliver_with_audit(None, project_id, alert_type, subject, payload, now)
            .await
        {
            if let Err(release) =
                self.db
                    .set_preference_last_sent(project_id, alert_type, previous_sent_at)
            {
                warn!(project_id, alert_type = %alert_type, error = %release, "failed to release rate-limit claim");
            }
            return Err(e);
        }
        Ok(DispatchOutcome::Sent)
    }

    /// Create the audit row, fan out sequentially, record the terminal state.
    /// A delivery failure marks the row failed and re-raises for the job
    /// queue's retry budget.
    async fn deliver_with_audit(
        &self,
        rule_id: Option<i64>,
        project_id: i64,
        alert_type: AlertType,
        subject: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let notification = AlertNotification {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id,
            alert_type,
            payload: payload.clone(),
            status: NotificationStatus::Pending,
            error: None,
            created_at: now,
            completed_at: None,
        };
        self.db.insert_notification(&notification)?;

        let message = AlertMessage {
            alert_type,
            project_id,
            subject: subject.to_string(),
            body: payload,
        };

        // Sequential fan-out with pacing; a crash mid-way leaves a partial
        // delivery with no compensation.
        let pacing = Duration::from_millis(self.config.pacing_ms);
        for (i, recipient) in self.config.recipients.iter().enumerate() {
            if i > 0 && !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }

            if let Err(e) = self.transport.deliver(recipient, &message).await {
                warn!(recipient, error = %e, "alert delivery failed");
                self.db
                    .mark_notification_failed(&notification.id, &e.to_string(), Utc::now())?;
                return Err(e).context("Alert delivery failed");
            }
        }

        self.db.mark_notification_sent(&notification.id, Utc::now())?;
        Ok(())
    }
}
