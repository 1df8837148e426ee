use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::PathBuf;

use crate::agents::config as ai_config;

pub type DbPool = Pool<SqliteConnectionManager>;

pub fn init_db(workspace_dir: PathBuf) -> Result<DbPool> {
    std::fs::create_dir_all(&workspace_dir)?;
    let db_path = workspace_dir.join("trilogue.db");
    let mgr = SqliteConnectionManager::file(&db_path)
        .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;"));
    let pool = Pool::new(mgr)?;
    {
        let conn = pool.get()?;
        apply_migrations(&conn)?;
        ai_config::seed_defaults(&conn)?;
    }
    Ok(pool)
}

macro_rules! migration {
    ($name:literal) => {
        ($name, include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../migrations/", $name)))
    };
}

/// Applied in order; each name runs at most once per database.
const MIGRATIONS: &[(&str, &str)] = &[
    migration!("0001_init.sql"),
    migration!("0002_ai_settings.sql"),
    migration!("0003_transcript.sql"),
];

fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            name TEXT PRIMARY KEY,
            applied_at INTEGER NOT NULL
        );",
    )?;
    for (name, sql) in MIGRATIONS {
        let applied: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE name = ?1)",
            [name],
            |row| row.get(0),
        )?;
        if applied {
            continue;
        }
        conn.execute_batch(sql)
            .with_context(|| format!("failed to apply migration {name}"))?;
        conn.execute(
            "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, ?2)",
            rusqlite::params![name, time::OffsetDateTime::now_utc().unix_timestamp()],
        )?;
        log::info!("applied migration {name}");
    }
    Ok(())
}
