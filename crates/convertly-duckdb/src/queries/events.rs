use anyhow::Result;
use duckdb::{Connection, Error};

use convertly_core::event::ConversionEvent;
use convertly_core::store::TimeRange;

use crate::backend::{from_millis, to_millis};
use crate::DuckDbBackend;

const EVENT_COLUMNS: &str = "id, funnel_id, session_id, visitor_id, event_type, event_name, value, \
     page_url, timestamp_ms, properties_json, device_type, user_id, touchpoint_json, \
     is_conversion, goal_id, attribution_json";

struct EventRow {
    id: String,
    funnel_id: String,
    session_id: String,
    visitor_id: String,
    event_type: String,
    event_name: Option<String>,
    value: f64,
    page_url: Option<String>,
    timestamp_ms: i64,
    properties_json: String,
    device_type: String,
    user_id: Option<String>,
    touchpoint_json: String,
    is_conversion: bool,
    goal_id: Option<String>,
    attribution_json: Option<String>,
}

fn read_row(row: &duckdb::Row<'_>) -> duckdb::Result<EventRow> {
    Ok(EventRow {
        id: row.get(0)?,
        funnel_id: row.get(1)?,
        session_id: row.get(2)?,
        visitor_id: row.get(3)?,
        event_type: row.get(4)?,
        event_name: row.get(5)?,
        value: row.get(6)?,
        page_url: row.get(7)?,
        timestamp_ms: row.get(8)?,
        properties_json: row.get(9)?,
        device_type: row.get(10)?,
        user_id: row.get(11)?,
        touchpoint_json: row.get(12)?,
        is_conversion: row.get(13)?,
        goal_id: row.get(14)?,
        attribution_json: row.get(15)?,
    })
}

impl EventRow {
    fn decode(self) -> Result<ConversionEvent> {
        Ok(ConversionEvent {
            timestamp: from_millis(self.timestamp_ms)?,
            properties: serde_json::from_str(&self.properties_json)?,
            touchpoint: serde_json::from_str(&self.touchpoint_json)?,
            attribution: self
                .attribution_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            id: self.id,
            funnel_id: self.funnel_id,
            session_id: self.session_id,
            visitor_id: self.visitor_id,
            event_type: self.event_type,
            event_name: self.event_name,
            value: self.value,
            page_url: self.page_url,
            device_type: self.device_type,
            user_id: self.user_id,
            is_conversion: self.is_conversion,
            goal_id: self.goal_id,
        })
    }
}

pub(crate) fn event_exists(conn: &Connection, event_id: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM events WHERE id = ?1",
        duckdb::params![event_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Append one event inside the caller's transaction.
pub(crate) fn write_event(conn: &Connection, event: &ConversionEvent) -> Result<()> {
    let properties_json = serde_json::to_string(&event.properties)?;
    let touchpoint_json = serde_json::to_string(&event.touchpoint)?;
    let attribution_json = event
        .attribution
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        r#"INSERT INTO events (
            id, funnel_id, session_id, visitor_id, event_type, event_name, value,
            page_url, timestamp_ms, properties_json, device_type, user_id,
            touchpoint_id, touchpoint_json, is_conversion, goal_id, attribution_json
        ) VALUES (
            ?1,  ?2,  ?3,  ?4,  ?5,  ?6,  ?7,
            ?8,  ?9,  ?10, ?11, ?12,
            ?13, ?14, ?15, ?16, ?17
        )"#,
        duckdb::params![
            &event.id,
            &event.funnel_id,
            &event.session_id,
            &event.visitor_id,
            &event.event_type,
            &event.event_name,
            event.value,
            &event.page_url,
            to_millis(event.timestamp),
            properties_json,
            &event.device_type,
            &event.user_id,
            &event.touchpoint.id,
            touchpoint_json,
            event.is_conversion,
            &event.goal_id,
            attribution_json,
        ],
    )?;
    Ok(())
}

pub async fn get_event_inner(db: &DuckDbBackend, event_id: &str) -> Result<Option<ConversionEvent>> {
    let conn = db.conn.lock().await;
    let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let row = match stmt.query_row(duckdb::params![event_id], read_row) {
        Ok(row) => row,
        Err(Error::QueryReturnedNoRows) => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    Ok(Some(row.decode()?))
}

pub async fn list_events_inner(
    db: &DuckDbBackend,
    funnel_id: &str,
    range: Option<&TimeRange>,
) -> Result<Vec<ConversionEvent>> {
    let conn = db.conn.lock().await;
    let mut rows_out = Vec::new();

    match range {
        Some(range) => {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events \
                 WHERE funnel_id = ?1 AND timestamp_ms >= ?2 AND timestamp_ms < ?3 \
                 ORDER BY timestamp_ms ASC, id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                duckdb::params![funnel_id, to_millis(range.start), to_millis(range.end)],
                read_row,
            )?;
            for row in rows {
                rows_out.push(row?);
            }
        }
        None => {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE funnel_id = ?1 ORDER BY timestamp_ms ASC, id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(duckdb::params![funnel_id], read_row)?;
            for row in rows {
                rows_out.push(row?);
            }
        }
    }
    drop(conn);

    rows_out.into_iter().map(EventRow::decode).collect()
}
