use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use duckdb::Error;

use convertly_core::funnel::{ConversionFunnel, FunnelStatus};

use crate::backend::{from_millis, to_millis};
use crate::DuckDbBackend;

const FUNNEL_COLUMNS: &str = "id, user_id, name, description, status, steps_json, goals_json, \
     attribution_json, created_at_ms, updated_at_ms";

struct FunnelRow {
    id: String,
    user_id: String,
    name: String,
    description: Option<String>,
    status: String,
    steps_json: String,
    goals_json: String,
    attribution_json: String,
    created_at_ms: i64,
    updated_at_ms: i64,
}

fn read_row(row: &duckdb::Row<'_>) -> duckdb::Result<FunnelRow> {
    Ok(FunnelRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        steps_json: row.get(5)?,
        goals_json: row.get(6)?,
        attribution_json: row.get(7)?,
        created_at_ms: row.get(8)?,
        updated_at_ms: row.get(9)?,
    })
}

impl FunnelRow {
    fn decode(self) -> Result<ConversionFunnel> {
        let status = FunnelStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("invalid funnel status '{}' on {}", self.status, self.id))?;
        Ok(ConversionFunnel {
            steps: serde_json::from_str(&self.steps_json)?,
            goals: serde_json::from_str(&self.goals_json)?,
            attribution: serde_json::from_str(&self.attribution_json)?,
            created_at: from_millis(self.created_at_ms)?,
            updated_at: from_millis(self.updated_at_ms)?,
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            description: self.description,
            status,
        })
    }
}

pub async fn insert_funnel_inner(db: &DuckDbBackend, funnel: &ConversionFunnel) -> Result<()> {
    let steps_json = serde_json::to_string(&funnel.steps)?;
    let goals_json = serde_json::to_string(&funnel.goals)?;
    let attribution_json = serde_json::to_string(&funnel.attribution)?;

    let conn = db.conn.lock().await;
    conn.execute(
        r#"
        INSERT INTO funnels (
            id, user_id, name, description, status,
            steps_json, goals_json, attribution_json,
            created_at_ms, updated_at_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        duckdb::params![
            &funnel.id,
            &funnel.user_id,
            &funnel.name,
            &funnel.description,
            funnel.status.as_str(),
            steps_json,
            goals_json,
            attribution_json,
            to_millis(funnel.created_at),
            to_millis(funnel.updated_at),
        ],
    )?;
    Ok(())
}

pub async fn get_funnel_inner(db: &DuckDbBackend, funnel_id: &str) -> Result<Option<ConversionFunnel>> {
    let conn = db.conn.lock().await;
    let sql = format!("SELECT {FUNNEL_COLUMNS} FROM funnels WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let row = match stmt.query_row(duckdb::params![funnel_id], read_row) {
        Ok(row) => row,
        Err(Error::QueryReturnedNoRows) => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    Ok(Some(row.decode()?))
}

pub async fn list_funnels_inner(db: &DuckDbBackend, user_id: &str) -> Result<Vec<ConversionFunnel>> {
    let conn = db.conn.lock().await;
    let sql = format!(
        "SELECT {FUNNEL_COLUMNS} FROM funnels WHERE user_id = ?1 ORDER BY created_at_ms DESC, id DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(duckdb::params![user_id], read_row)?;

    let mut funnels = Vec::new();
    for row in rows {
        funnels.push(row?.decode()?);
    }
    Ok(funnels)
}

pub async fn update_funnel_status_inner(
    db: &DuckDbBackend,
    funnel_id: &str,
    status: FunnelStatus,
    updated_at: DateTime<Utc>,
) -> Result<bool> {
    let conn = db.conn.lock().await;
    let changed = conn.execute(
        "UPDATE funnels SET status = ?1, updated_at_ms = ?2 WHERE id = ?3",
        duckdb::params![status.as_str(), to_millis(updated_at), funnel_id],
    )?;
    Ok(changed > 0)
}

/// Delete a funnel and everything recorded against it in one transaction,
/// children first.
pub async fn delete_funnel_inner(db: &DuckDbBackend, funnel_id: &str) -> Result<bool> {
    let mut conn = db.conn.lock().await;
    let tx = conn.transaction()?;

    let exists: i64 = tx
        .prepare("SELECT COUNT(*) FROM funnels WHERE id = ?1")?
        .query_row(duckdb::params![funnel_id], |row| row.get(0))?;
    if exists == 0 {
        return Ok(false);
    }

    let events = tx.execute("DELETE FROM events WHERE funnel_id = ?1", duckdb::params![funnel_id])?;
    let sessions = tx.execute("DELETE FROM sessions WHERE funnel_id = ?1", duckdb::params![funnel_id])?;
    tx.execute("DELETE FROM funnels WHERE id = ?1", duckdb::params![funnel_id])?;
    tx.commit()?;

    tracing::info!(funnel_id, events, sessions, "funnel deleted");
    Ok(true)
}
