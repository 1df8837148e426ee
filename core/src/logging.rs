//! Structured diagnostics persisted to the `event_log` table.
//!
//! Every record is also mirrored to the `log` facade so that the app's
//! log4rs appenders see the same stream.

use r2d2_sqlite::rusqlite::{self, params, Connection, Row};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

pub fn log_event(
    conn: &Connection,
    level: &str,
    code: Option<&str>,
    module: &str,
    message: &str,
    explain: Option<&str>,
    data: Option<Value>,
) -> rusqlite::Result<()> {
    let id = Uuid::new_v4().to_string();
    let ts = OffsetDateTime::now_utc().unix_timestamp();
    let data_str = data.map(|v| v.to_string());
    let lvl = match level {
        "error" => log::Level::Error,
        "warn" => log::Level::Warn,
        "debug" => log::Level::Debug,
        _ => log::Level::Info,
    };
    log::log!(target: module, lvl, "[{}] {}", code.unwrap_or("-"), message);
    conn.execute(
        "INSERT INTO event_log (id, ts, level, code, module, message, explain, data) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![id, ts, level, code, module, message, explain, data_str],
    )?;
    Ok(())
}

/// A row of the event log, as surfaced in the diagnostics view.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: String,
    pub ts: i64,
    pub level: String,
    pub code: Option<String>,
    pub message: String,
    pub explain: Option<String>,
    pub data: Option<Value>,
}

/// Most recent events for `module`, newest first.
pub fn list_events(
    conn: &Connection,
    module: &str,
    limit: Option<usize>,
) -> rusqlite::Result<Vec<EventRecord>> {
    let limit = limit.map(|l| l as i64).unwrap_or(-1);
    let mut stmt = conn.prepare(
        "SELECT id, ts, level, code, message, explain, data FROM event_log WHERE module = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![module, limit], map_event)?;
    rows.collect()
}

fn map_event(row: &Row) -> rusqlite::Result<EventRecord> {
    let data_str: Option<String> = row.get(6)?;
    let data = data_str.and_then(|raw| serde_json::from_str(&raw).ok());
    Ok(EventRecord {
        id: row.get(0)?,
        ts: row.get(1)?,
        level: row.get(2)?,
        code: row.get(3)?,
        message: row.get(4)?,
        explain: row.get(5)?,
        data,
    })
}

/// Short, non-reversible tag for a secret. Safe to log.
pub fn credential_fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
}
