use rusqlite::Connection;

use crate::error::{AppError, AppResult};

/// Asks the engine whether the compiled statement can write to the database.
pub fn is_sql_readonly(conn: &Connection, sql: &str) -> AppResult<bool> {
    let stmt = conn.prepare(sql)?;
    Ok(stmt.readonly())
}

pub fn ensure_readonly(conn: &Connection, sql: &str) -> AppResult<()> {
    if is_sql_readonly(conn, sql)? {
        Ok(())
    } else {
        Err(AppError::NotReadonly)
    }
}
