use std::time::Instant;

use rusqlite::{params, Connection};
use serde_json::{Map, Value};

use crate::core::cancel::CancelToken;
use crate::core::ident::{ensure_identifier, quote};
use crate::core::schema;
use crate::core::sql::{self, PagedSql, SqlKind, DEFAULT_PAGE_SIZE, MAX_ROW_BOUND};
use crate::core::types::{ColumnDescriptor, QueryResult, StatementKind, TableRows};
use crate::core::value::{as_named_params, ColumnSet, NamedBinds, SqlValue};
use crate::error::{AppError, AppResult};

/// Run one caller-supplied statement.
///
/// SELECTs are paginated (see [`crate::core::sql`]); anything else is
/// executed directly. Never fails: engine errors end up in `error`, and
/// `duration` always covers the whole call.
pub fn execute_sql(
    conn: &Connection,
    sql: &str,
    page: Option<usize>,
    size: Option<usize>,
    cancel: &CancelToken,
) -> QueryResult {
    execute_sql_capped(conn, sql, page, size, MAX_ROW_BOUND, cancel)
}

/// [`execute_sql`] with the resolved page size held to `max_rows`, whether
/// the size came from the caller, the SQL text or the default.
pub fn execute_sql_capped(
    conn: &Connection,
    sql: &str,
    page: Option<usize>,
    size: Option<usize>,
    max_rows: usize,
    cancel: &CancelToken,
) -> QueryResult {
    let start = Instant::now();
    let mut result = QueryResult::new(page.unwrap_or(0), size.unwrap_or(0));

    let cleaned = sql::clean_sql(sql);
    let outcome = if cleaned.is_empty() {
        Err(AppError::Validation("SQL statement is empty".into()))
    } else {
        match sql::classify(&cleaned) {
            SqlKind::Select => {
                run_select(conn, &cleaned, (page, size), max_rows, cancel, &mut result)
            }
            kind => run_exec(conn, &cleaned, kind, &mut result),
        }
    };
    if let Err(e) = outcome {
        tracing::debug!(error = %e, "statement failed");
        result.error = Some(e.to_string());
    }

    result.duration = start.elapsed().as_secs_f64() * 1000.0;
    result
}

fn run_select(
    conn: &Connection,
    cleaned: &str,
    (page, size): (Option<usize>, Option<usize>),
    max_rows: usize,
    cancel: &CancelToken,
    result: &mut QueryResult,
) -> AppResult<()> {
    result.kind = Some(StatementKind::Query);

    let paged = PagedSql::parse(cleaned);
    let p = sql::resolve_pagination(page, size, paged.embedded(), DEFAULT_PAGE_SIZE)
        .capped(max_rows);
    tracing::debug!(page = p.page, size = p.size, embedded = ?paged.embedded(), "pagination");
    result.page = p.page;
    result.size = p.size;
    let page_sql = paged.lookahead_page(p)?;

    result.total = match count_rows(conn, &paged) {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(error = %e, "row count failed; reporting 0");
            0
        }
    };

    tracing::debug!(sql = %page_sql, "executing paginated query");
    let mut stmt = conn.prepare(&page_sql)?;
    let columns = ColumnSet::of(&stmt);

    let mut rows = Vec::with_capacity(p.size.min(1024) + 1);
    let mut cursor = stmt.query([])?;
    loop {
        cancel.check()?;
        let Some(row) = cursor.next()? else { break };
        rows.push(columns.read_row(row)?);
        if rows.len() > p.size {
            break;
        }
    }

    result.has_next = rows.len() > p.size;
    rows.truncate(p.size);
    result.message = format!("{} rows returned", rows.len());
    result.columns = columns.names;
    result.rows = rows;
    Ok(())
}

fn count_rows(conn: &Connection, paged: &PagedSql) -> AppResult<i64> {
    let count_sql = paged.count();
    tracing::debug!(sql = %count_sql, "counting rows");
    Ok(conn.query_row(&count_sql, [], |r| r.get(0))?)
}

fn run_exec(
    conn: &Connection,
    cleaned: &str,
    kind: SqlKind,
    result: &mut QueryResult,
) -> AppResult<()> {
    result.kind = Some(StatementKind::Exec);
    tracing::debug!(sql = %cleaned, kind = kind.as_str(), "executing statement");

    let mut stmt = conn.prepare(cleaned)?;
    // Step to completion; PRAGMAs and RETURNING clauses may yield rows.
    let mut cursor = stmt.query([])?;
    while cursor.next()?.is_some() {}
    drop(cursor);

    result.affected = conn.changes() as u64;
    if kind == SqlKind::Insert {
        let id = conn.last_insert_rowid();
        result.last_insert_id = Some(id);
        result.message = format!("inserted, ID={id}");
    } else {
        result.message = format!("executed successfully, {} rows affected", result.affected);
    }
    Ok(())
}

/// Output columns of `sql`, found by a zero-row dry run.
pub fn columns_from_query(conn: &Connection, sql: &str) -> AppResult<Vec<String>> {
    let dry = sql::dry_run_sql(&PagedSql::parse(&sql::clean_sql(sql)).body);
    let mut stmt = conn.prepare(&dry)?;
    let columns = ColumnSet::of(&stmt);
    let mut cursor = stmt.query([])?;
    while cursor.next()?.is_some() {}
    Ok(columns.names)
}

/// One window of a table's rows plus the table's total row count.
pub fn get_table_rows(
    conn: &Connection,
    table: &str,
    limit: usize,
    offset: usize,
) -> AppResult<TableRows> {
    ensure_identifier("table", table)?;
    if !schema::table_exists(conn, table)? {
        return Err(AppError::not_found("table", table));
    }

    let total: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", quote(table)), [], |r| {
        r.get(0)
    })?;

    let mut stmt = conn.prepare(&format!("SELECT * FROM {} LIMIT ?1 OFFSET ?2", quote(table)))?;
    let columns = ColumnSet::of(&stmt);
    let mut cursor = stmt.query(params![limit as i64, offset as i64])?;
    let mut rows = Vec::new();
    while let Some(row) = cursor.next()? {
        rows.push(columns.read_row(row)?);
    }
    Ok(TableRows { rows, total })
}

fn find_column<'a>(
    columns: &'a [ColumnDescriptor],
    table: &str,
    name: &str,
) -> AppResult<&'a ColumnDescriptor> {
    ensure_identifier("column", name)?;
    columns
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| AppError::not_found("column", format!("{table}.{name}")))
}

fn primary_keys(columns: &[ColumnDescriptor], table: &str) -> AppResult<Vec<String>> {
    let pks: Vec<String> = columns
        .iter()
        .filter(|c| c.primary)
        .map(|c| c.name.clone())
        .collect();
    if pks.is_empty() {
        return Err(AppError::Validation(format!("table {table} has no primary key")));
    }
    Ok(pks)
}

/// Insert one row from a JSON object; returns the new rowid.
pub fn insert_row(conn: &Connection, table: &str, data: &Map<String, Value>) -> AppResult<i64> {
    ensure_identifier("table", table)?;
    if data.is_empty() {
        return Err(AppError::Validation("no data provided for insertion".into()));
    }
    let columns = schema::get_columns(conn, table)?;

    let mut names = Vec::with_capacity(data.len());
    let mut binds: NamedBinds = Vec::with_capacity(data.len());
    for (key, value) in data {
        let col = find_column(&columns, table, key)?;
        if value.is_null() && col.not_null {
            return Err(AppError::Validation(format!("column {key} cannot be null")));
        }
        names.push(quote(key));
        binds.push((format!(":{key}"), SqlValue::from_json(value)));
    }

    let placeholders: Vec<&str> = binds.iter().map(|(p, _)| p.as_str()).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote(table),
        names.join(", "),
        placeholders.join(", ")
    );
    conn.prepare(&sql)?.execute(as_named_params(&binds).as_slice())?;
    Ok(conn.last_insert_rowid())
}

/// Update the row identified by its primary key values in `data`; every
/// other key becomes an assignment.
pub fn update_row(conn: &Connection, table: &str, data: &Map<String, Value>) -> AppResult<u64> {
    ensure_identifier("table", table)?;
    if data.is_empty() {
        return Err(AppError::Validation("no data provided for update".into()));
    }
    let columns = schema::get_columns(conn, table)?;
    let pks = primary_keys(&columns, table)?;
    for key in data.keys() {
        find_column(&columns, table, key)?;
    }

    let mut binds: NamedBinds = Vec::new();
    let mut sets = Vec::new();
    for (key, value) in data.iter().filter(|(k, _)| !pks.contains(k)) {
        sets.push(format!("{} = :set_{key}", quote(key)));
        binds.push((format!(":set_{key}"), SqlValue::from_json(value)));
    }
    if sets.is_empty() {
        return Err(AppError::Validation("no columns to update".into()));
    }
    let filter = pk_filter(&pks, data, "update", &mut binds)?;

    let sql = format!("UPDATE {} SET {} WHERE {}", quote(table), sets.join(", "), filter);
    let n = conn.prepare(&sql)?.execute(as_named_params(&binds).as_slice())?;
    Ok(n as u64)
}

/// Delete the row whose primary key values are given in `key`.
pub fn delete_row(conn: &Connection, table: &str, key: &Map<String, Value>) -> AppResult<u64> {
    ensure_identifier("table", table)?;
    if key.is_empty() {
        return Err(AppError::Validation("no data provided for deletion".into()));
    }
    let columns = schema::get_columns(conn, table)?;
    let pks = primary_keys(&columns, table)?;

    let mut binds: NamedBinds = Vec::new();
    let filter = pk_filter(&pks, key, "deletion", &mut binds)?;
    let sql = format!("DELETE FROM {} WHERE {}", quote(table), filter);
    let n = conn.prepare(&sql)?.execute(as_named_params(&binds).as_slice())?;
    Ok(n as u64)
}

fn pk_filter(
    pks: &[String],
    data: &Map<String, Value>,
    action: &str,
    binds: &mut NamedBinds,
) -> AppResult<String> {
    let mut clauses = Vec::with_capacity(pks.len());
    for pk in pks {
        let value = data.get(pk).ok_or_else(|| {
            AppError::Validation(format!("primary key column {pk} must be provided for {action}"))
        })?;
        clauses.push(format!("{} = :pk_{pk}", quote(pk)));
        binds.push((format!(":pk_{pk}"), SqlValue::from_json(value)));
    }
    Ok(clauses.join(" AND "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn db_with_rows(n: i64) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT UNIQUE, data BLOB)",
        )
        .unwrap();
        for i in 1..=n {
            conn.execute(
                "INSERT INTO t (name, data) VALUES (?1, ?2)",
                params![format!("n{i}"), b"raw".to_vec()],
            )
            .unwrap();
        }
        conn
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn first_page_signals_more() {
        let conn = db_with_rows(5);
        let r = execute_sql(&conn, "SELECT * FROM t", Some(1), Some(2), &CancelToken::new());
        assert_eq!(r.error, None);
        assert_eq!(r.kind, Some(StatementKind::Query));
        assert_eq!(r.rows.len(), 2);
        assert!(r.has_next);
        assert_eq!(r.total, 5);
        assert_eq!(r.columns, vec!["id", "name", "data"]);
        assert_eq!(r.rows[0].get("data"), Some(&SqlValue::Blob(b"raw".to_vec())));
    }

    #[test]
    fn last_page_has_no_next() {
        let conn = db_with_rows(5);
        let r = execute_sql(&conn, "SELECT * FROM t", Some(3), Some(2), &CancelToken::new());
        assert_eq!(r.rows.len(), 1);
        assert!(!r.has_next);
        assert_eq!(r.rows[0].get("id"), Some(&SqlValue::Integer(5)));
    }

    #[test]
    fn embedded_paging_applies_without_caller_params() {
        let conn = db_with_rows(10);
        let r = execute_sql(
            &conn,
            "SELECT id FROM t ORDER BY id LIMIT 3 OFFSET 3;",
            None,
            None,
            &CancelToken::new(),
        );
        assert_eq!((r.page, r.size), (2, 3));
        assert_eq!(r.total, 10);
        assert_eq!(r.rows[0].get("id"), Some(&SqlValue::Integer(4)));
        assert!(r.has_next);

        let r = execute_sql(
            &conn,
            "SELECT id FROM t ORDER BY id LIMIT 3 OFFSET 3",
            Some(1),
            Some(4),
            &CancelToken::new(),
        );
        assert_eq!((r.page, r.size), (1, 4));
        assert_eq!(r.rows.len(), 4);
    }

    #[test]
    fn default_page_size_applies() {
        let conn = db_with_rows(3);
        let r = execute_sql(&conn, "SELECT * FROM t", None, None, &CancelToken::new());
        assert_eq!((r.page, r.size), (1, DEFAULT_PAGE_SIZE));
        assert_eq!(r.rows.len(), 3);
    }

    #[test]
    fn out_of_range_pages_are_reported() {
        let conn = db_with_rows(3);
        let r = execute_sql(&conn, "SELECT * FROM t", Some(usize::MAX), Some(2), &CancelToken::new());
        assert_eq!(r.kind, Some(StatementKind::Query));
        assert!(r.error.as_deref().unwrap().contains("out of range"));
        assert!(r.rows.is_empty());

        let r = execute_sql(
            &conn,
            "SELECT * FROM t LIMIT 18446744073709551615",
            None,
            None,
            &CancelToken::new(),
        );
        assert!(r.error.as_deref().unwrap().contains("out of range"));

        // The connection is still usable afterwards.
        let r = execute_sql(&conn, "SELECT * FROM t", None, None, &CancelToken::new());
        assert_eq!(r.error, None);
        assert_eq!(r.rows.len(), 3);
    }

    #[test]
    fn row_cap_applies_to_embedded_limits() {
        let conn = db_with_rows(10);
        let r = execute_sql_capped(&conn, "SELECT id FROM t LIMIT 5", None, None, 2, &CancelToken::new());
        assert_eq!(r.error, None);
        assert_eq!((r.page, r.size), (1, 2));
        assert_eq!(r.rows.len(), 2);
        assert!(r.has_next);

        let r = execute_sql_capped(&conn, "SELECT id FROM t", Some(1), Some(5), 3, &CancelToken::new());
        assert_eq!((r.page, r.size), (1, 3));

        let r = execute_sql_capped(&conn, "SELECT id FROM t", None, None, 4, &CancelToken::new());
        assert_eq!(r.size, 4);

        let r = execute_sql_capped(
            &conn,
            "SELECT id FROM t LIMIT 18446744073709551615",
            None,
            None,
            1000,
            &CancelToken::new(),
        );
        assert_eq!(r.error, None);
        assert_eq!(r.rows.len(), 10);
    }

    #[test]
    fn duplicate_output_names_collapse() {
        let conn = db_with_rows(0);
        let r = execute_sql(&conn, "SELECT 1 AS id, 2 AS id", None, None, &CancelToken::new());
        assert_eq!(r.error, None);
        assert_eq!(serde_json::to_value(&r.rows[0]).unwrap(), json!({ "id": 2 }));
    }

    #[test]
    fn exec_reports_changes_and_insert_id() {
        let conn = db_with_rows(2);
        let r = execute_sql(&conn, "INSERT INTO t (name) VALUES ('z')", None, None, &CancelToken::new());
        assert_eq!(r.error, None);
        assert_eq!(r.kind, Some(StatementKind::Exec));
        assert_eq!(r.affected, 1);
        assert_eq!(r.last_insert_id, Some(3));

        let r = execute_sql(&conn, "UPDATE t SET name = name || '!'", None, None, &CancelToken::new());
        assert_eq!(r.affected, 3);
        assert_eq!(r.last_insert_id, None);

        let r = execute_sql(&conn, "PRAGMA table_info(t)", None, None, &CancelToken::new());
        assert_eq!(r.error, None);
    }

    #[test]
    fn failures_are_captured() {
        let conn = db_with_rows(1);
        let r = execute_sql(&conn, "SELEC nonsense", None, None, &CancelToken::new());
        assert!(r.error.is_some());
        let r = execute_sql(&conn, "SELECT * FROM missing", Some(1), Some(5), &CancelToken::new());
        assert!(r.error.as_deref().unwrap().contains("missing"));
        let r = execute_sql(&conn, "INSERT INTO t (name) VALUES ('n1')", None, None, &CancelToken::new());
        assert!(r.error.as_deref().unwrap().contains("UNIQUE"));
        let r = execute_sql(&conn, "-- nothing", None, None, &CancelToken::new());
        assert!(r.error.is_some());
        assert!(r.duration >= 0.0);
    }

    #[test]
    fn cancelled_select_stops() {
        let conn = db_with_rows(3);
        let token = CancelToken::new();
        token.cancel();
        let r = execute_sql(&conn, "SELECT * FROM t", Some(1), Some(10), &token);
        assert_eq!(r.error.as_deref(), Some("cancelled"));
    }

    #[test]
    fn dry_run_reports_columns() {
        let conn = db_with_rows(0);
        let cols = columns_from_query(&conn, "SELECT id, name AS label FROM t LIMIT 5").unwrap();
        assert_eq!(cols, vec!["id", "label"]);
    }

    #[test]
    fn table_rows_window() {
        let conn = db_with_rows(7);
        let page = get_table_rows(&conn, "t", 3, 6).unwrap();
        assert_eq!(page.total, 7);
        assert_eq!(page.rows.len(), 1);
        assert_eq!(get_table_rows(&conn, "nope", 1, 0).unwrap_err().code(), "NOT_FOUND");
    }

    #[test]
    fn row_crud_by_primary_key() {
        let conn = db_with_rows(0);
        let id = insert_row(&conn, "t", &obj(json!({"name": "ann"}))).unwrap();
        assert_eq!(id, 1);

        let n = update_row(&conn, "t", &obj(json!({"id": id, "name": "bob"}))).unwrap();
        assert_eq!(n, 1);
        let name: String = conn.query_row("SELECT name FROM t WHERE id = 1", [], |r| r.get(0)).unwrap();
        assert_eq!(name, "bob");

        assert_eq!(delete_row(&conn, "t", &obj(json!({"id": id}))).unwrap(), 1);
        assert_eq!(delete_row(&conn, "t", &obj(json!({"id": id}))).unwrap(), 0);
    }

    #[test]
    fn row_crud_validation() {
        let conn = db_with_rows(0);
        conn.execute_batch("CREATE TABLE nokey (a TEXT NOT NULL)").unwrap();

        let e = insert_row(&conn, "t", &obj(json!({"ghost": 1}))).unwrap_err();
        assert_eq!(e.code(), "NOT_FOUND");
        let e = insert_row(&conn, "nokey", &obj(json!({"a": null}))).unwrap_err();
        assert_eq!(e.code(), "VALIDATION_ERROR");
        let e = insert_row(&conn, "t", &Map::new()).unwrap_err();
        assert_eq!(e.code(), "VALIDATION_ERROR");

        let e = update_row(&conn, "nokey", &obj(json!({"a": "x"}))).unwrap_err();
        assert!(e.to_string().contains("no primary key"));
        let e = update_row(&conn, "t", &obj(json!({"name": "x"}))).unwrap_err();
        assert!(e.to_string().contains("must be provided"));
        let e = update_row(&conn, "t", &obj(json!({"id": 1}))).unwrap_err();
        assert!(e.to_string().contains("no columns to update"));
    }
}
