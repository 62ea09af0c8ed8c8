use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::core::types::DbInfo;
use crate::error::AppResult;

pub fn sqlite_version(conn: &Connection) -> AppResult<String> {
    Ok(conn.query_row("SELECT sqlite_version()", [], |r| r.get(0))?)
}

/// File metadata plus engine version. Platforms without a creation time
/// report the modification time instead.
pub fn get_db_info(conn: &Connection, path: &Path) -> AppResult<DbInfo> {
    let meta = std::fs::metadata(path)?;
    let modified: DateTime<Utc> = meta.modified()?.into();
    let created = meta.created().map(DateTime::<Utc>::from).unwrap_or(modified);
    Ok(DbInfo {
        path: path.display().to_string(),
        size: meta.len(),
        created_at: created,
        modified_at: modified,
        sqlite_version: sqlite_version(conn)?,
    })
}
