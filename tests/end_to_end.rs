//! End-to-end pipeline tests: ingestion through rollups to incidents

use chrono::{DateTime, Duration, Utc};
use faultline::alert::{AlertDispatcher, LogTransport};
use faultline::config::{AlertingConfig, IncidentConfig};
use faultline::counter::MemoryCounterStore;
use faultline::incident::{IncidentEngine, IncidentSeverity, IncidentStatus};
use faultline::ingest::{ErrorPayload, IngestPipeline, PerformancePayload, Scrubber};
use faultline::nplusone::SqlQuery;
use faultline::rollup::RollupEngine;
use faultline::storage::Database;

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn record_not_found(action: &str) -> ErrorPayload {
    ErrorPayload {
        exception_class: "ActiveRecord::RecordNotFound".to_string(),
        message: "Couldn't find User".to_string(),
        backtrace: vec![
            "/ruby/3.3.0/gems/activerecord/lib/finder.rb:200:in `find!'".to_string(),
            "app/models/user.rb:10:in `locate'".to_string(),
            format!("app/controllers/{}.rb:5", action),
        ],
        controller_action: Some(action.to_string()),
        request_path: None,
        environment: "production".to_string(),
        occurred_at: None,
        context: None,
    }
}

fn perf_sample(target: &str, duration_ms: f64, occurred_at: DateTime<Utc>) -> PerformancePayload {
    PerformancePayload {
        target: target.to_string(),
        duration_ms,
        db_duration_ms: None,
        view_duration_ms: None,
        environment: "production".to_string(),
        occurred_at: Some(occurred_at),
        sql_queries: vec![],
        sql_queries_count: None,
    }
}

/// Origin-grouped exception classes collapse across controller actions: the
/// same record-not-found raised from the same model via three different
/// controllers lands in one issue with three occurrences.
#[tokio::test]
async fn record_not_found_groups_by_origin_across_controllers() {
    let db = Database::open_in_memory().unwrap();
    let counters = MemoryCounterStore::new();
    let transport = LogTransport;
    let dispatcher = AlertDispatcher::new(&db, &counters, &transport, AlertingConfig::default());
    let pipeline = IngestPipeline::new(&db, &counters, &dispatcher, Scrubber::new(&[]));

    let now = ts("2026-08-30T12:00:00Z");
    let project = db.create_project("demo", now).unwrap();

    for action in ["users_controller", "orders_controller", "admin_controller"] {
        pipeline
            .ingest_error(project, record_not_found(action), now)
            .await
            .unwrap();
    }

    let issues = db.open_issues(project, 10).unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].occurrence_count, 3);
    assert_eq!(issues[0].exception_class, "ActiveRecord::RecordNotFound");
    // Vendor and stdlib frames are skipped; the app frame is the origin.
    assert_eq!(issues[0].origin_file, "app/models/user.rb");
}

/// Full lifecycle: sustained p95 above the warning threshold across three
/// rollup windows opens a warning incident recording the triggering p95;
/// three recovered windows close it recording the resolving p95.
#[tokio::test]
async fn sustained_breach_opens_then_recovery_closes_incident() {
    let db = Database::open_in_memory().unwrap();
    let counters = MemoryCounterStore::new();
    let transport = LogTransport;
    let dispatcher = AlertDispatcher::new(&db, &counters, &transport, AlertingConfig::default());
    let pipeline = IngestPipeline::new(&db, &counters, &dispatcher, Scrubber::new(&[]));
    let rollups = RollupEngine::new(&db);
    let incident_config = IncidentConfig::default();
    let engine = IncidentEngine::new(&db, &counters, &dispatcher, &incident_config);

    let base = ts("2026-08-30T12:00:00Z");
    let target = "UsersController#index";
    let project = db.create_project("demo", base).unwrap();

    // Six consecutive minute windows: three slow, three fast.
    for (i, duration) in [800.0, 800.0, 800.0, 400.0, 400.0, 400.0].iter().enumerate() {
        let window = base + Duration::minutes(i as i64);
        pipeline
            .ingest_performance(project, perf_sample(target, *duration, window), window)
            .await
            .unwrap();

        // The pass runs two minutes later, when the window has fully lapsed.
        let tick = window + Duration::minutes(2);
        rollups.run_minute_pass(tick).unwrap();
        engine.evaluate_all(tick).await.unwrap();

        match i {
            0 | 1 => assert!(db.open_incident(project, target).unwrap().is_none()),
            2..=4 => {
                let open = db.open_incident(project, target).unwrap().unwrap();
                assert_eq!(open.severity, IncidentSeverity::Warning);
                assert!((open.trigger_p95_ms - 800.0).abs() < f64::EPSILON);
            }
            _ => assert!(db.open_incident(project, target).unwrap().is_none()),
        }
    }

    let incidents = db.open_incidents().unwrap();
    assert!(incidents.is_empty());

    // The single closed incident carries both edge measurements.
    let incident = db.get_incident(1).unwrap().unwrap();
    assert_eq!(incident.status, IncidentStatus::Closed);
    assert!((incident.trigger_p95_ms - 800.0).abs() < f64::EPSILON);
    assert_eq!(incident.resolve_p95_ms, Some(400.0));
    assert!(incident.open_notified);
    assert!(incident.close_notified);
}

/// A request repeating the same query shape six times produces a persistent
/// per-project aggregate with six observations.
#[tokio::test]
async fn repeated_queries_feed_the_shape_aggregate() {
    let db = Database::open_in_memory().unwrap();
    let counters = MemoryCounterStore::new();
    let transport = LogTransport;
    let dispatcher = AlertDispatcher::new(&db, &counters, &transport, AlertingConfig::default());
    let pipeline = IngestPipeline::new(&db, &counters, &dispatcher, Scrubber::new(&[]));

    let now = ts("2026-08-30T12:00:00Z");
    let project = db.create_project("demo", now).unwrap();

    let mut payload = perf_sample("UsersController#show", 120.0, now);
    payload.sql_queries = (0..6)
        .map(|i| SqlQuery {
            query: format!("SELECT * FROM posts WHERE user_id = {}", i),
            duration_ms: 3.0,
        })
        .collect();

    pipeline
        .ingest_performance(project, payload, now)
        .await
        .unwrap();

    let fingerprint = faultline::fingerprint::query_fingerprint("SELECT * FROM posts WHERE user_id = 1");
    let stat = db.get_sql_fingerprint(project, &fingerprint).unwrap().unwrap();
    assert_eq!(stat.query_count, 6);
    assert!((stat.avg_duration_ms - 3.0).abs() < 1e-9);
}
