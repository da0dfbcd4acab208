//! Runtime configuration for Faultline
//!
//! Loaded from a TOML file next to the database. Holds incident threshold
//! overrides, alert fan-out settings and extra scrub patterns; everything has
//! a compiled default so a missing file just means defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    /// Incident detection thresholds and overrides
    #[serde(default)]
    pub incident: IncidentConfig,

    /// Alert dispatch settings
    #[serde(default)]
    pub alerting: AlertingConfig,

    /// Extra field-name patterns to scrub, on top of the built-ins
    #[serde(default)]
    pub scrub_fields: Vec<String>,
}

/// Incident thresholds: compiled defaults plus per-project and per-endpoint
/// overrides. Resolution is per-endpoint, then per-project, then defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentConfig {
    #[serde(default = "default_warning_ms")]
    pub warning_ms: f64,

    #[serde(default = "default_critical_ms")]
    pub critical_ms: f64,

    /// Consecutive breaching evaluations required before an incident opens
    #[serde(default = "default_warmup_ticks")]
    pub warmup_ticks: u32,

    /// Quiet period after a close before the same target may reopen
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u32,

    /// Overrides keyed by project name
    #[serde(default)]
    pub projects: HashMap<String, ThresholdOverride>,

    /// Overrides keyed by "project/target"
    #[serde(default)]
    pub endpoints: HashMap<String, ThresholdOverride>,
}

/// Partial threshold override; unset fields fall through to the next layer
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ThresholdOverride {
    pub warning_ms: Option<f64>,
    pub critical_ms: Option<f64>,
    pub warmup_ticks: Option<u32>,
    pub cooldown_minutes: Option<u32>,
}

/// Alert dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingConfig {
    /// Recipients for sequential fan-out
    #[serde(default = "default_recipients")]
    pub recipients: Vec<String>,

    /// Inter-message pacing during fan-out, in milliseconds
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    /// Per-fingerprint cooldown for rate-limited rule types, in minutes
    #[serde(default = "default_fingerprint_cooldown_minutes")]
    pub fingerprint_cooldown_minutes: u32,
}

fn default_warning_ms() -> f64 {
    750.0
}

fn default_critical_ms() -> f64 {
    1500.0
}

fn default_warmup_ticks() -> u32 {
    3
}

fn default_cooldown_minutes() -> u32 {
    10
}

fn default_recipients() -> Vec<String> {
    vec!["ops".to_string()]
}

fn default_pacing_ms() -> u64 {
    250
}

fn default_fingerprint_cooldown_minutes() -> u32 {
    30
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            warning_ms: default_warning_ms(),
            critical_ms: default_critical_ms(),
            warmup_ticks: default_warmup_ticks(),
            cooldown_minutes: default_cooldown_minutes(),
            projects: HashMap::new(),
            endpoints: HashMap::new(),
        }
    }
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            recipients: default_recipients(),
            pacing_ms: default_pacing_ms(),
            fingerprint_cooldown_minutes: default_fingerprint_cooldown_minutes(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a file, or return defaults when absent
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            let config: CoreConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }
}
