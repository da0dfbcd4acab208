//! Layered latency threshold resolution
//!
//! Per-endpoint override, then per-project override, then compiled defaults.
//! Resolution is a pure function into a fully-typed struct so callers never
//! touch the override maps directly.

use crate::config::{IncidentConfig, ThresholdOverride};
use std::time::Duration;

/// Fully resolved thresholds for one (project, target)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyThresholds {
    pub warning_ms: f64,
    pub critical_ms: f64,
    /// Consecutive breaching ticks before an incident opens (and recovering
    /// ticks before it closes)
    pub warmup_ticks: u32,
    /// Quiet period after a close before the target may reopen
    pub cooldown: Duration,
}

fn layer(base: LatencyThresholds, over: &ThresholdOverride) -> LatencyThresholds {
    LatencyThresholds {
        warning_ms: over.warning_ms.unwrap_or(base.warning_ms),
        critical_ms: over.critical_ms.unwrap_or(base.critical_ms),
        warmup_ticks: over.warmup_ticks.unwrap_or(base.warmup_ticks),
        cooldown: over
            .cooldown_minutes
            .map(|m| Duration::from_secs(u64::from(m) * 60))
            .unwrap_or(base.cooldown),
    }
}

/// Resolve thresholds for a target: endpoint override beats project override
/// beats defaults, field by field.
pub fn resolve_thresholds(
    config: &IncidentConfig,
    project_name: &str,
    target: &str,
) -> LatencyThresholds {
    let mut resolved = LatencyThresholds {
        warning_ms: config.warning_ms,
        critical_ms: config.critical_ms,
        warmup_ticks: config.warmup_ticks,
        cooldown: Duration::from_secs(u64::from(config.cooldown_minutes) * 60),
    };

    if let Some(project_override) = config.projects.get(project_name) {
        resolved = layer(resolved, project_override);
    }

    let endpoint_key = format!("{}/{}", project_name, target);
    if let Some(endpoint_override) = config.endpoints.get(&endpoint_key) {
        resolved = layer(resolved, endpoint_override);
    }

    resolved
}
