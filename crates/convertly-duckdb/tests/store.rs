use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::json;

use convertly_core::event::{ChannelType, ConversionEvent, Touchpoint};
use convertly_core::funnel::{build_funnel, ConversionFunnel, CreateFunnelRequest, FunnelStatus};
use convertly_core::session::VisitorSession;
use convertly_core::store::{ConversionStore, RecordOutcome, TimeRange};
use convertly_duckdb::DuckDbBackend;

fn at(minute: i64) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-10T12:00:00Z")
        .expect("valid ts")
        .with_timezone(&Utc)
        + Duration::minutes(minute)
}

fn funnel(user_id: &str) -> ConversionFunnel {
    let req: CreateFunnelRequest = serde_json::from_value(json!({
        "user_id": user_id,
        "name": "Checkout",
        "description": "main checkout flow",
        "steps": [
            {"name": "Visit", "order": 1, "conditions": [{"kind": "event_trigger", "operator": "equals", "value": "page_view"}]}
        ],
        "goals": [
            {"name": "Purchase", "goal_type": "revenue", "value": 25.0, "conditions": [
                {"kind": "event", "operator": "equals", "value": "purchase"}
            ], "attribution_model": {"model_type": "time_decay", "parameters": {"half_life_days": 3.0}}}
        ],
        "attribution": {"default_model": {"model_type": "linear"}, "alternates": {"first": {"model_type": "first_touch"}}}
    }))
    .expect("valid request");
    build_funnel(req, at(0)).expect("valid funnel")
}

fn touchpoint(id: &str, minute: i64) -> Touchpoint {
    Touchpoint {
        id: id.to_string(),
        channel: ChannelType::Email,
        source: "newsletter".to_string(),
        medium: "email".to_string(),
        campaign: Some("spring".to_string()),
        timestamp: at(minute),
        value: 0.0,
        position: 1,
    }
}

fn event(id: &str, funnel_id: &str, session_id: &str, minute: i64) -> ConversionEvent {
    let mut properties = serde_json::Map::new();
    properties.insert("plan".to_string(), json!("pro"));
    ConversionEvent {
        id: id.to_string(),
        funnel_id: funnel_id.to_string(),
        session_id: session_id.to_string(),
        visitor_id: "visitor_1".to_string(),
        event_type: "page_view".to_string(),
        event_name: None,
        value: 0.0,
        page_url: Some("https://example.com/pricing".to_string()),
        timestamp: at(minute),
        properties,
        device_type: "desktop".to_string(),
        user_id: None,
        touchpoint: touchpoint("tp_1", minute),
        is_conversion: false,
        goal_id: None,
        attribution: None,
    }
}

/// Record `event` against `session`, bumping the session version.
async fn record(db: &DuckDbBackend, session: &mut VisitorSession, event: &ConversionEvent) -> RecordOutcome {
    let expected = session.version;
    session.version += 1;
    db.record_event(session, expected, event).await.expect("record")
}

#[tokio::test]
async fn funnel_round_trips_through_json_columns() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    let funnel = funnel("user_1");
    db.insert_funnel(&funnel).await.expect("insert");

    let loaded = db
        .get_funnel(&funnel.id)
        .await
        .expect("get")
        .expect("funnel exists");
    assert_eq!(loaded, funnel);
    assert!(db.get_funnel("fun_missing").await.expect("get").is_none());

    let listed = db.list_funnels("user_1").await.expect("list");
    assert_eq!(listed.len(), 1);
    assert!(db.list_funnels("someone_else").await.expect("list").is_empty());
}

#[tokio::test]
async fn status_update_reports_missing_funnel() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    let funnel = funnel("user_1");
    db.insert_funnel(&funnel).await.expect("insert");

    assert!(db
        .update_funnel_status(&funnel.id, FunnelStatus::Paused, at(5))
        .await
        .expect("update"));
    assert!(!db
        .update_funnel_status("fun_missing", FunnelStatus::Paused, at(5))
        .await
        .expect("update"));

    let loaded = db.get_funnel(&funnel.id).await.expect("get").expect("exists");
    assert_eq!(loaded.status, FunnelStatus::Paused);
    assert_eq!(loaded.updated_at, at(5));
}

#[tokio::test]
async fn session_write_enforces_expected_version() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    let mut session = VisitorSession::start("sess_1", "fun_1", "visitor_1", None, "mobile", at(0));
    session.append_touchpoint(touchpoint("tp_1", 0));
    session.version = 1;

    let outcome = db
        .record_event(&session, 0, &event("evt_1", "fun_1", "sess_1", 0))
        .await
        .expect("insert");
    assert_eq!(outcome, RecordOutcome::Recorded);
    // A second creator racing on the same id loses and writes nothing.
    let outcome = db
        .record_event(&session, 0, &event("evt_2", "fun_1", "sess_1", 0))
        .await
        .expect("insert again");
    assert_eq!(outcome, RecordOutcome::VersionConflict);
    assert!(db.get_event("evt_2").await.expect("get").is_none());

    let mut updated = session.clone();
    updated.record_activity("page_view", at(3));
    updated.version = 2;
    let outcome = db
        .record_event(&updated, 1, &event("evt_3", "fun_1", "sess_1", 3))
        .await
        .expect("update");
    assert_eq!(outcome, RecordOutcome::Recorded);
    // A writer still holding version 1 conflicts.
    let outcome = db
        .record_event(&updated, 1, &event("evt_4", "fun_1", "sess_1", 3))
        .await
        .expect("stale update");
    assert_eq!(outcome, RecordOutcome::VersionConflict);

    let loaded = db.get_session("sess_1").await.expect("get").expect("exists");
    assert_eq!(loaded, updated);
    let ids: Vec<String> = db
        .list_events("fun_1", None)
        .await
        .expect("list")
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids, vec!["evt_1".to_string(), "evt_3".to_string()]);
}

#[tokio::test]
async fn known_event_id_leaves_the_session_untouched() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    let mut session = VisitorSession::start("sess_1", "fun_1", "visitor_1", None, "desktop", at(0));
    let first = event("evt_1", "fun_1", "sess_1", 0);
    session.record_activity("page_view", at(0));
    assert_eq!(record(&db, &mut session, &first).await, RecordOutcome::Recorded);

    let mut resent = session.clone();
    resent.record_activity("page_view", at(0));
    assert_eq!(record(&db, &mut resent, &first).await, RecordOutcome::DuplicateEvent);

    let stored = db.get_session("sess_1").await.expect("get").expect("exists");
    assert_eq!(stored.event_count, 1);
    assert_eq!(stored.version, 1);
    let loaded = db.get_event("evt_1").await.expect("get").expect("exists");
    assert_eq!(loaded.touchpoint.id, "tp_1");
    assert!(db.get_event("evt_missing").await.expect("get").is_none());
}

#[tokio::test]
async fn idle_sessions_are_closed_and_versioned() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    let mut idle = VisitorSession::start("sess_idle", "fun_1", "v1", None, "desktop", at(0));
    let mut busy = VisitorSession::start("sess_busy", "fun_1", "v2", None, "desktop", at(40));
    record(&db, &mut idle, &event("evt_idle", "fun_1", "sess_idle", 0)).await;
    record(&db, &mut busy, &event("evt_busy", "fun_1", "sess_busy", 40)).await;

    let closed = db
        .close_idle_sessions(at(45) - Duration::minutes(30), at(45))
        .await
        .expect("sweep");
    assert_eq!(closed, 1);

    let idle = db.get_session("sess_idle").await.expect("get").expect("exists");
    assert_eq!(idle.ended_at, Some(at(45)));
    assert_eq!(idle.version, 2);
    let busy = db.get_session("sess_busy").await.expect("get").expect("exists");
    assert!(busy.ended_at.is_none());

    let again = db
        .close_idle_sessions(at(45) - Duration::minutes(30), at(45))
        .await
        .expect("sweep");
    assert_eq!(again, 0);
}

#[tokio::test]
async fn events_are_ordered_filtered_and_deduplicated() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    let mut s1 = VisitorSession::start("s1", "fun_1", "visitor_1", None, "desktop", at(0));
    let mut s2 = VisitorSession::start("s2", "fun_2", "visitor_2", None, "desktop", at(0));
    record(&db, &mut s1, &event("evt_b", "fun_1", "s1", 10)).await;
    record(&db, &mut s1, &event("evt_a", "fun_1", "s1", 10)).await;
    record(&db, &mut s1, &event("evt_c", "fun_1", "s1", 2 * 24 * 60)).await;
    let duplicate = record(&db, &mut s1, &event("evt_a", "fun_1", "s1", 99)).await;
    assert_eq!(duplicate, RecordOutcome::DuplicateEvent);
    record(&db, &mut s2, &event("evt_x", "fun_2", "s2", 10)).await;

    let all = db.list_events("fun_1", None).await.expect("list");
    let ids: Vec<&str> = all.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["evt_a", "evt_b", "evt_c"]);
    assert_eq!(all[0].timestamp, at(10));
    assert_eq!(all[0].properties.get("plan"), Some(&json!("pro")));
    assert_eq!(all[0].touchpoint.campaign.as_deref(), Some("spring"));

    let day = NaiveDate::from_ymd_opt(2026, 3, 10).expect("valid date");
    let range = TimeRange::from_dates(day, day).expect("valid range");
    let first_day = db.list_events("fun_1", Some(&range)).await.expect("list");
    assert_eq!(first_day.len(), 2);
}

#[tokio::test]
async fn delete_funnel_cascades() {
    let db = Arc::new(DuckDbBackend::open_in_memory().expect("db"));
    let store: Arc<dyn ConversionStore> = db.clone();
    let funnel = funnel("user_1");
    store.insert_funnel(&funnel).await.expect("insert");

    let mut session = VisitorSession::start("sess_1", &funnel.id, "visitor_1", None, "desktop", at(0));
    session.version = 1;
    let outcome = store
        .record_event(&session, 0, &event("evt_1", &funnel.id, "sess_1", 1))
        .await
        .expect("record");
    assert_eq!(outcome, RecordOutcome::Recorded);

    assert!(store.delete_funnel(&funnel.id).await.expect("delete"));
    assert!(!store.delete_funnel(&funnel.id).await.expect("delete again"));
    assert!(store.get_funnel(&funnel.id).await.expect("get").is_none());
    assert!(store.get_session("sess_1").await.expect("get").is_none());
    assert!(store.list_events(&funnel.id, None).await.expect("list").is_empty());

    let conn = db.conn_for_test().await;
    let remaining: i64 = conn
        .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
        .expect("count");
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn ping_succeeds_on_open_database() {
    let db = DuckDbBackend::open_in_memory().expect("db");
    ConversionStore::ping(&db).await.expect("ping");
}
