//! Database schema definition

/// SQL schema for the Faultline database
pub const SCHEMA: &str = r#"
-- Instrumented applications sending telemetry
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    last_seen_at TEXT
);

-- Deduplicated error groups
CREATE TABLE IF NOT EXISTS issues (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    fingerprint TEXT NOT NULL,
    exception_class TEXT NOT NULL,
    origin_file TEXT NOT NULL,
    sample_message TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    occurrence_count INTEGER NOT NULL DEFAULT 1,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    closed_at TEXT,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_issues_fingerprint ON issues(project_id, fingerprint);
CREATE INDEX IF NOT EXISTS idx_issues_status ON issues(status);
CREATE INDEX IF NOT EXISTS idx_issues_last_seen ON issues(last_seen_at);

-- Individual error occurrences
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    issue_id INTEGER NOT NULL,
    occurred_at TEXT NOT NULL,
    environment TEXT NOT NULL,
    controller_action TEXT,
    request_path TEXT,
    backtrace TEXT NOT NULL,
    context TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_events_issue ON events(issue_id, occurred_at);
CREATE INDEX IF NOT EXISTS idx_events_occurred ON events(occurred_at);

-- Raw latency samples consumed by the rollup engine
CREATE TABLE IF NOT EXISTS performance_events (
    id TEXT PRIMARY KEY,
    project_id INTEGER NOT NULL,
    target TEXT NOT NULL,
    environment TEXT NOT NULL,
    duration_ms REAL NOT NULL,
    db_duration_ms REAL,
    view_duration_ms REAL,
    sql_query_count INTEGER,
    occurred_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_perf_events_window ON performance_events(project_id, occurred_at);
CREATE INDEX IF NOT EXISTS idx_perf_events_target ON performance_events(target, occurred_at);

-- Per-minute and per-hour percentile aggregates
CREATE TABLE IF NOT EXISTS perf_rollups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    timeframe TEXT NOT NULL,
    window_start TEXT NOT NULL,
    target TEXT NOT NULL,
    environment TEXT NOT NULL,
    request_count INTEGER NOT NULL,
    avg_duration_ms REAL NOT NULL,
    p50_ms REAL NOT NULL,
    p95_ms REAL NOT NULL,
    p99_ms REAL NOT NULL,
    min_ms REAL NOT NULL,
    max_ms REAL NOT NULL,
    error_count INTEGER NOT NULL DEFAULT 0,
    histogram BLOB,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_rollups_key
    ON perf_rollups(project_id, timeframe, window_start, target, environment);
CREATE INDEX IF NOT EXISTS idx_rollups_target ON perf_rollups(target, timeframe, window_start);

-- Sustained latency degradations per target
CREATE TABLE IF NOT EXISTS performance_incidents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    target TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    severity TEXT NOT NULL,
    opened_at TEXT NOT NULL,
    closed_at TEXT,
    trigger_p95_ms REAL NOT NULL,
    peak_p95_ms REAL NOT NULL,
    resolve_p95_ms REAL,
    threshold_ms REAL NOT NULL,
    breach_count INTEGER NOT NULL DEFAULT 1,
    open_notified INTEGER NOT NULL DEFAULT 0,
    close_notified INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

-- At most one open incident per (project, target)
CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_open
    ON performance_incidents(project_id, target) WHERE status = 'open';
CREATE INDEX IF NOT EXISTS idx_incidents_target ON performance_incidents(project_id, target, closed_at);

-- Running per-project query-shape aggregates
CREATE TABLE IF NOT EXISTS sql_fingerprints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    fingerprint TEXT NOT NULL,
    normalized_query TEXT NOT NULL,
    query_type TEXT NOT NULL,
    query_count INTEGER NOT NULL DEFAULT 1,
    total_duration_ms REAL NOT NULL DEFAULT 0,
    avg_duration_ms REAL NOT NULL DEFAULT 0,
    max_duration_ms REAL NOT NULL DEFAULT 0,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_sql_fingerprints ON sql_fingerprints(project_id, fingerprint);

-- Alert rules, configured externally and consumed read-only
CREATE TABLE IF NOT EXISTS alert_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    rule_type TEXT NOT NULL,
    threshold INTEGER NOT NULL DEFAULT 10,
    time_window_minutes INTEGER NOT NULL DEFAULT 60,
    cooldown_minutes INTEGER NOT NULL DEFAULT 30,
    enabled INTEGER NOT NULL DEFAULT 1,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_alert_rules_project ON alert_rules(project_id, rule_type);

-- Audit trail of dispatch attempts
CREATE TABLE IF NOT EXISTS alert_notifications (
    id TEXT PRIMARY KEY,
    rule_id INTEGER,
    alert_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error TEXT,
    created_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_notifications_status ON alert_notifications(status);
CREATE INDEX IF NOT EXISTS idx_notifications_created ON alert_notifications(created_at);

-- Coordination counters with optional expiry (streaks, dedup flags, locks)
CREATE TABLE IF NOT EXISTS counters (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL DEFAULT 1,
    expires_at TEXT
);

-- Global rate-limit state for per-(project, alert type) dispatch
CREATE TABLE IF NOT EXISTS notification_preferences (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    alert_type TEXT NOT NULL,
    frequency TEXT NOT NULL DEFAULT 'immediate',
    last_sent_at TEXT,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_preferences_key ON notification_preferences(project_id, alert_type);
"#;
