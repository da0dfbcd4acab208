//! Command implementations
//!
//! Each handler opens the database under the data directory, wires up the
//! stores and engines it needs, and prints in the requested format. The
//! scheduler loop lives here too.

use crate::alert::{AlertDispatcher, AlertType, LogTransport};
use crate::cli::{IngestArgs, OutputFormat, StatusArgs};
use crate::config::CoreConfig;
use crate::counter::DbCounterStore;
use crate::incident::IncidentEngine;
use crate::ingest::{BatchOutcome, IngestItem, IngestPipeline, Scrubber};
use crate::rollup::{hour_bucket, RollupEngine};
use crate::storage::Database;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{error, info};

const DB_FILE: &str = "faultline.db";
const CONFIG_FILE: &str = "faultline.toml";

fn db_path(path: &Path) -> PathBuf {
    path.join(DB_FILE)
}

fn config_path(path: &Path) -> PathBuf {
    path.join(CONFIG_FILE)
}

fn open_database(path: &Path) -> Result<Database> {
    let db_path = db_path(path);
    if !db_path.exists() {
        bail!("No database at {:?}. Run 'faultline init' first.", db_path);
    }
    Database::open(&db_path)
}

/// Initialize the database and write a default config file
pub fn init(path: &Path, force: bool) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create data directory {:?}", path))?;

    Database::open(db_path(path))?;

    let config_path = config_path(path);
    if force || !config_path.exists() {
        CoreConfig::default().save(&config_path)?;
        println!("✓ Wrote default configuration to {:?}", config_path);
    } else {
        println!("Configuration already exists at {:?}, leaving it alone", config_path);
    }

    println!("✓ Initialized database at {:?}", db_path(path));
    Ok(())
}

/// Create a project with its default alert rules and print its id
pub fn create_project(path: &Path, name: &str, format: OutputFormat) -> Result<()> {
    let db = open_database(path)?;
    let id = db.create_project(name, Utc::now())?;

    // Every project starts with enabled new-issue and frequency rules. A
    // zero cooldown defers to the configured default.
    db.insert_alert_rule(id, AlertType::NewIssue, 1, 60, 0)?;
    db.insert_alert_rule(id, AlertType::ErrorFrequency, 10, 60, 0)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "id": id, "name": name }));
        }
        OutputFormat::Text => {
            println!("✓ Created project '{}' with id {}", name, id);
        }
    }
    Ok(())
}

/// Ingest payloads from a file or stdin
pub async fn ingest(path: &Path, args: &IngestArgs, format: OutputFormat) -> Result<()> {
    let db = open_database(path)?;
    let config = CoreConfig::load_or_default(&config_path(path))?;

    if db.get_project(args.project)?.is_none() {
        bail!("Unknown project id: {}", args.project);
    }

    let raw = match &args.file {
        Some(file) => std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read payload file: {}", file))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read payloads from stdin")?;
            buf
        }
    };

    // Either a JSON array of items or one bare item.
    let items: Vec<IngestItem> = match serde_json::from_str(&raw) {
        Ok(items) => items,
        Err(_) => vec![serde_json::from_str(&raw).context("Failed to parse payload JSON")?],
    };

    let counters = DbCounterStore::new(&db);
    let transport = LogTransport;
    let dispatcher = AlertDispatcher::new(&db, &counters, &transport, config.alerting.clone());
    let pipeline = IngestPipeline::new(
        &db,
        &counters,
        &dispatcher,
        Scrubber::new(&config.scrub_fields),
    );

    let outcome = pipeline
        .ingest_batch(args.project, args.batch_id.as_deref(), items, Utc::now())
        .await?;

    match (outcome, format) {
        (BatchOutcome::Duplicate, OutputFormat::Text) => {
            println!("Batch already processed, nothing to do");
        }
        (BatchOutcome::Processed { accepted, skipped }, OutputFormat::Text) => {
            println!("✓ Ingested {} payload(s), skipped {}", accepted, skipped);
        }
        (BatchOutcome::Duplicate, OutputFormat::Json) => {
            println!("{}", serde_json::json!({ "duplicate": true }));
        }
        (BatchOutcome::Processed { accepted, skipped }, OutputFormat::Json) => {
            println!(
                "{}",
                serde_json::json!({ "duplicate": false, "accepted": accepted, "skipped": skipped })
            );
        }
    }
    Ok(())
}

/// Run one rollup pass
pub fn rollup(path: &Path, hour: bool) -> Result<()> {
    let db = open_database(path)?;
    let engine = RollupEngine::new(&db);

    let written = if hour {
        engine.run_hour_pass(Utc::now())?
    } else {
        engine.run_minute_pass(Utc::now())?
    };

    let pass = if hour { "hour" } else { "minute" };
    println!("✓ {} pass wrote {} rollup(s)", pass, written);
    Ok(())
}

/// Run one incident evaluation pass
pub async fn evaluate(path: &Path) -> Result<()> {
    let db = open_database(path)?;
    let config = CoreConfig::load_or_default(&config_path(path))?;
    let counters = DbCounterStore::new(&db);
    let transport = LogTransport;
    let dispatcher = AlertDispatcher::new(&db, &counters, &transport, config.alerting.clone());
    let engine = IncidentEngine::new(&db, &counters, &dispatcher, &config.incident);

    let outcome = engine.evaluate_all(Utc::now()).await?;
    println!("✓ Evaluation finished: {:?}", outcome);
    Ok(())
}

/// Scheduler loop: a minute pass and an evaluation every tick, plus an hour
/// pass when the clock crosses an hour boundary. Runs until interrupted.
pub async fn run_loop(path: &Path, interval_secs: u64) -> Result<()> {
    let db = open_database(path)?;
    let config = CoreConfig::load_or_default(&config_path(path))?;
    let counters = DbCounterStore::new(&db);
    let transport = LogTransport;
    let dispatcher = AlertDispatcher::new(&db, &counters, &transport, config.alerting.clone());
    let rollups = RollupEngine::new(&db);
    let incidents = IncidentEngine::new(&db, &counters, &dispatcher, &config.incident);

    println!("Running scheduler every {}s. Press Ctrl+C to stop.", interval_secs);

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_hour = hour_bucket(Utc::now());

    loop {
        ticker.tick().await;
        let now = Utc::now();

        // One failing pass must not stop the schedule.
        if let Err(e) = rollups.run_minute_pass(now) {
            error!(error = %e, "minute rollup pass failed");
        }

        if hour_bucket(now) > last_hour {
            match rollups.run_hour_pass(now) {
                Ok(written) => {
                    last_hour = hour_bucket(now);
                    info!(written, "hour rollup pass finished");
                }
                Err(e) => error!(error = %e, "hour rollup pass failed"),
            }
        }

        if let Err(e) = incidents.evaluate_all(now).await {
            error!(error = %e, "incident evaluation failed");
        }

        if let Err(e) = counters.purge_expired() {
            error!(error = %e, "counter purge failed");
        }
    }
}

/// Show database and incident status
pub fn status(path: &Path, args: &StatusArgs, format: OutputFormat) -> Result<()> {
    let db = open_database(path)?;
    let stats = db.get_stats()?;
    let incidents = db.open_incidents()?;
    let notifications = db.recent_notifications(args.limit)?;

    match format {
        OutputFormat::Json => {
            let incidents: Vec<_> = incidents
                .iter()
                .map(|i| {
                    serde_json::json!({
                        "id": i.id,
                        "project_id": i.project_id,
                        "target": i.target,
                        "severity": i.severity.to_string(),
                        "opened_at": i.opened_at.to_rfc3339(),
                        "peak_p95_ms": i.peak_p95_ms,
                        "breach_count": i.breach_count,
                    })
                })
                .collect();
            let notifications: Vec<_> = notifications
                .iter()
                .map(|n| {
                    serde_json::json!({
                        "id": n.id,
                        "alert_type": n.alert_type.to_string(),
                        "status": n.status.to_string(),
                        "created_at": n.created_at.to_rfc3339(),
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "open_issues": stats.open_issues,
                    "total_events": stats.total_events,
                    "open_incidents": stats.open_incidents,
                    "pending_notifications": stats.pending_notifications,
                    "incidents": incidents,
                    "notifications": notifications,
                })
            );
        }
        OutputFormat::Text => {
            println!("Faultline Status");
            println!("================\n");
            println!("Open issues:           {}", stats.open_issues);
            println!("Total events:          {}", stats.total_events);
            println!("Open incidents:        {}", stats.open_incidents);
            println!("Pending notifications: {}", stats.pending_notifications);

            if !incidents.is_empty() {
                println!("\nOpen incidents:");
                for i in &incidents {
                    println!(
                        "  #{} [{}] {} (peak p95 {:.0}ms, {} breach ticks, opened {})",
                        i.id, i.severity, i.target, i.peak_p95_ms, i.breach_count, i.opened_at
                    );
                }
            }

            if !notifications.is_empty() {
                println!("\nRecent notifications:");
                for n in &notifications {
                    println!("  {} {} ({})", n.created_at, n.alert_type, n.status);
                }
            }
        }
    }
    Ok(())
}
