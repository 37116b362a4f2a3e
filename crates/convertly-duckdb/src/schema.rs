/// DuckDB initialization SQL, run on every open.
///
/// All statements are `IF NOT EXISTS`, so re-running is a no-op. Timestamps
/// are epoch milliseconds (`BIGINT`); nested structures (funnel steps, goals,
/// attribution config, touchpoints) are stored as JSON text.
///
/// Always sets an explicit memory limit; the DuckDB default (80% of system
/// RAM) is not acceptable for a server process.
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

-- ===========================================
-- FUNNELS
-- ===========================================
CREATE TABLE IF NOT EXISTS funnels (
    id                  VARCHAR PRIMARY KEY,       -- 'fun_' + uuid
    user_id             VARCHAR NOT NULL,
    name                VARCHAR NOT NULL,
    description         VARCHAR,
    status              VARCHAR NOT NULL,          -- active | paused | archived
    steps_json          VARCHAR NOT NULL,
    goals_json          VARCHAR NOT NULL,
    attribution_json    VARCHAR NOT NULL,
    created_at_ms       BIGINT NOT NULL,
    updated_at_ms       BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_funnels_user ON funnels(user_id);

-- ===========================================
-- SESSIONS (the only mutable rows; guarded by version)
-- ===========================================
CREATE TABLE IF NOT EXISTS sessions (
    id                  VARCHAR PRIMARY KEY,
    funnel_id           VARCHAR NOT NULL,
    visitor_id          VARCHAR NOT NULL,
    device_id           VARCHAR NOT NULL,
    device_type         VARCHAR NOT NULL,
    user_id             VARCHAR,
    sync_id             VARCHAR,
    started_at_ms       BIGINT NOT NULL,
    last_activity_ms    BIGINT NOT NULL,
    ended_at_ms         BIGINT,                    -- NULL while open
    touchpoints_json    VARCHAR NOT NULL,
    page_views          BIGINT NOT NULL DEFAULT 0,
    event_count         BIGINT NOT NULL DEFAULT 0,
    converted           BOOLEAN NOT NULL DEFAULT FALSE,
    conversion_value    DOUBLE NOT NULL DEFAULT 0,
    version             BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_funnel   ON sessions(funnel_id);
CREATE INDEX IF NOT EXISTS idx_sessions_activity ON sessions(last_activity_ms);

-- ===========================================
-- EVENTS (append-only)
-- ===========================================
CREATE TABLE IF NOT EXISTS events (
    id                  VARCHAR PRIMARY KEY,       -- 'evt_' + uuid
    funnel_id           VARCHAR NOT NULL,
    session_id          VARCHAR NOT NULL,
    visitor_id          VARCHAR NOT NULL,
    event_type          VARCHAR NOT NULL,
    event_name          VARCHAR,
    value               DOUBLE NOT NULL DEFAULT 0,
    page_url            VARCHAR,
    timestamp_ms        BIGINT NOT NULL,
    properties_json     VARCHAR NOT NULL,
    device_type         VARCHAR NOT NULL,
    user_id             VARCHAR,
    touchpoint_id       VARCHAR NOT NULL,
    touchpoint_json     VARCHAR NOT NULL,
    is_conversion       BOOLEAN NOT NULL DEFAULT FALSE,
    goal_id             VARCHAR,
    attribution_json    VARCHAR
);
CREATE INDEX IF NOT EXISTS idx_events_funnel_ts ON events(funnel_id, timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_events_session   ON events(session_id);
"#
    )
}
