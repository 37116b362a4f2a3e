use anyhow::Result;
use chrono::{DateTime, Utc};
use duckdb::{Connection, Error};

use convertly_core::event::{ConversionEvent, Touchpoint};
use convertly_core::session::VisitorSession;
use convertly_core::store::RecordOutcome;

use crate::backend::{from_millis, to_millis};
use crate::queries::events::{event_exists, write_event};
use crate::DuckDbBackend;

const SESSION_COLUMNS: &str = "id, funnel_id, visitor_id, device_id, device_type, user_id, sync_id, \
     started_at_ms, last_activity_ms, ended_at_ms, touchpoints_json, page_views, event_count, \
     converted, conversion_value, version";

/// Raw `sessions` row. JSON and timestamps are decoded outside the row closure
/// so that decode failures surface as `anyhow` errors with context.
struct SessionRow {
    id: String,
    funnel_id: String,
    visitor_id: String,
    device_id: String,
    device_type: String,
    user_id: Option<String>,
    sync_id: Option<String>,
    started_at_ms: i64,
    last_activity_ms: i64,
    ended_at_ms: Option<i64>,
    touchpoints_json: String,
    page_views: i64,
    event_count: i64,
    converted: bool,
    conversion_value: f64,
    version: i64,
}

fn read_row(row: &duckdb::Row<'_>) -> duckdb::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        funnel_id: row.get(1)?,
        visitor_id: row.get(2)?,
        device_id: row.get(3)?,
        device_type: row.get(4)?,
        user_id: row.get(5)?,
        sync_id: row.get(6)?,
        started_at_ms: row.get(7)?,
        last_activity_ms: row.get(8)?,
        ended_at_ms: row.get(9)?,
        touchpoints_json: row.get(10)?,
        page_views: row.get(11)?,
        event_count: row.get(12)?,
        converted: row.get(13)?,
        conversion_value: row.get(14)?,
        version: row.get(15)?,
    })
}

impl SessionRow {
    fn decode(self) -> Result<VisitorSession> {
        let touchpoints: Vec<Touchpoint> = serde_json::from_str(&self.touchpoints_json)?;
        Ok(VisitorSession {
            started_at: from_millis(self.started_at_ms)?,
            last_activity_at: from_millis(self.last_activity_ms)?,
            ended_at: self.ended_at_ms.map(from_millis).transpose()?,
            id: self.id,
            funnel_id: self.funnel_id,
            visitor_id: self.visitor_id,
            device_id: self.device_id,
            device_type: self.device_type,
            user_id: self.user_id,
            sync_id: self.sync_id,
            touchpoints,
            page_views: self.page_views as u32,
            event_count: self.event_count as u32,
            converted: self.converted,
            conversion_value: self.conversion_value,
            version: self.version as u64,
        })
    }
}

pub async fn get_session_inner(db: &DuckDbBackend, session_id: &str) -> Result<Option<VisitorSession>> {
    let conn = db.conn.lock().await;
    let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let row = match stmt.query_row(duckdb::params![session_id], read_row) {
        Ok(row) => row,
        Err(Error::QueryReturnedNoRows) => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    Ok(Some(row.decode()?))
}

/// Insert or update a session under an optimistic version check, on a
/// connection the caller holds inside a transaction.
///
/// `expected_version == 0` inserts and fails if the id already exists;
/// otherwise the stored version must equal `expected_version`.
fn write_session(conn: &Connection, session: &VisitorSession, expected_version: u64) -> Result<bool> {
    let touchpoints_json = serde_json::to_string(&session.touchpoints)?;

    let current: Option<i64> = match conn
        .prepare("SELECT version FROM sessions WHERE id = ?1")?
        .query_row(duckdb::params![&session.id], |row| row.get(0))
    {
        Ok(version) => Some(version),
        Err(Error::QueryReturnedNoRows) => None,
        Err(error) => return Err(error.into()),
    };

    match current {
        None if expected_version == 0 => {
            conn.execute(
                r#"INSERT INTO sessions (
                    id, funnel_id, visitor_id, device_id, device_type, user_id, sync_id,
                    started_at_ms, last_activity_ms, ended_at_ms, touchpoints_json,
                    page_views, event_count, converted, conversion_value, version
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"#,
                duckdb::params![
                    &session.id,
                    &session.funnel_id,
                    &session.visitor_id,
                    &session.device_id,
                    &session.device_type,
                    &session.user_id,
                    &session.sync_id,
                    to_millis(session.started_at),
                    to_millis(session.last_activity_at),
                    session.ended_at.map(to_millis),
                    touchpoints_json,
                    i64::from(session.page_views),
                    i64::from(session.event_count),
                    session.converted,
                    session.conversion_value,
                    session.version as i64,
                ],
            )?;
        }
        Some(stored) if expected_version != 0 && stored as u64 == expected_version => {
            conn.execute(
                r#"UPDATE sessions SET
                    device_type = ?2, user_id = ?3, sync_id = ?4,
                    started_at_ms = ?5, last_activity_ms = ?6, ended_at_ms = ?7,
                    touchpoints_json = ?8, page_views = ?9, event_count = ?10,
                    converted = ?11, conversion_value = ?12, version = ?13
                WHERE id = ?1"#,
                duckdb::params![
                    &session.id,
                    &session.device_type,
                    &session.user_id,
                    &session.sync_id,
                    to_millis(session.started_at),
                    to_millis(session.last_activity_at),
                    session.ended_at.map(to_millis),
                    touchpoints_json,
                    i64::from(session.page_views),
                    i64::from(session.event_count),
                    session.converted,
                    session.conversion_value,
                    session.version as i64,
                ],
            )?;
        }
        _ => {
            tracing::debug!(
                session_id = %session.id,
                expected_version,
                stored_version = ?current,
                "session version conflict"
            );
            return Ok(false);
        }
    }
    Ok(true)
}

/// Write the session and append its event atomically.
///
/// A known event id short-circuits before the session is touched, so a
/// resent beacon cannot count twice.
pub async fn record_event_inner(
    db: &DuckDbBackend,
    session: &VisitorSession,
    expected_version: u64,
    event: &ConversionEvent,
) -> Result<RecordOutcome> {
    let mut conn = db.conn.lock().await;
    let tx = conn.transaction()?;

    if event_exists(&tx, &event.id)? {
        return Ok(RecordOutcome::DuplicateEvent);
    }
    if !write_session(&tx, session, expected_version)? {
        return Ok(RecordOutcome::VersionConflict);
    }
    write_event(&tx, event)?;

    tx.commit()?;
    Ok(RecordOutcome::Recorded)
}

pub async fn list_sessions_inner(db: &DuckDbBackend, funnel_id: &str) -> Result<Vec<VisitorSession>> {
    let conn = db.conn.lock().await;
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE funnel_id = ?1 ORDER BY started_at_ms ASC, id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(duckdb::params![funnel_id], read_row)?;

    let mut sessions = Vec::new();
    for row in rows {
        sessions.push(row?.decode()?);
    }
    Ok(sessions)
}

pub async fn close_idle_sessions_inner(
    db: &DuckDbBackend,
    cutoff: DateTime<Utc>,
    closed_at: DateTime<Utc>,
) -> Result<u64> {
    let conn = db.conn.lock().await;
    let closed = conn.execute(
        "UPDATE sessions
         SET ended_at_ms = ?1, version = version + 1
         WHERE ended_at_ms IS NULL AND last_activity_ms < ?2",
        duckdb::params![to_millis(closed_at), to_millis(cutoff)],
    )?;
    Ok(closed as u64)
}
