use std::{io::Write, path::Path, str::FromStr};

use rusqlite::{Connection, Rows};
use serde::{Deserialize, Serialize};

use crate::core::cancel::CancelToken;
use crate::core::ident::{ensure_identifier, ensure_identifiers, quote, quote_list};
use crate::core::query::columns_from_query;
use crate::core::readonly::ensure_readonly;
use crate::core::schema;
use crate::core::sql::{self, PagedSql, SqlKind, MAX_ROW_BOUND};
use crate::core::value::{ColumnSet, DbRow};
use crate::error::{AppError, AppResult};

pub const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Page size for query exports when neither the caller nor the SQL sets one.
pub const EXPORT_PAGE_SIZE: usize = 1000;

/// File format shared by export and import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Json,
    Csv,
}

impl DataFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            DataFormat::Json => "application/json; charset=utf-8",
            DataFormat::Csv => "text/csv; charset=utf-8",
        }
    }

    /// Pick the format from a file's extension.
    pub fn from_path(path: &Path) -> AppResult<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .parse()
    }

    pub fn extension(self) -> &'static str {
        match self {
            DataFormat::Json => "json",
            DataFormat::Csv => "csv",
        }
    }
}

impl FromStr for DataFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "json" => Ok(DataFormat::Json),
            "csv" => Ok(DataFormat::Csv),
            other => Err(AppError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Incremental writer for one export. Nothing beyond the current row is held.
pub enum RowEncoder<W: Write> {
    Json { out: W, first: bool },
    Csv { out: csv::Writer<W>, columns: Vec<String> },
}

impl<W: Write> RowEncoder<W> {
    /// Writes the preamble: `[` for JSON, BOM plus header for CSV.
    pub fn begin(format: DataFormat, mut out: W, columns: &[String]) -> AppResult<Self> {
        match format {
            DataFormat::Json => {
                out.write_all(b"[")?;
                Ok(RowEncoder::Json { out, first: true })
            }
            DataFormat::Csv => {
                out.write_all(UTF8_BOM)?;
                let mut out = csv::Writer::from_writer(out);
                out.write_record(columns)?;
                Ok(RowEncoder::Csv {
                    out,
                    columns: columns.to_vec(),
                })
            }
        }
    }

    pub fn write_row(&mut self, row: &DbRow) -> AppResult<()> {
        match self {
            RowEncoder::Json { out, first } => {
                if !*first {
                    out.write_all(b",")?;
                }
                *first = false;
                serde_json::to_writer(&mut *out, row)?;
            }
            RowEncoder::Csv { out, columns } => {
                let record = columns
                    .iter()
                    .map(|c| row.get(c).map(|v| v.to_text()).unwrap_or_default());
                out.write_record(record)?;
            }
        }
        Ok(())
    }

    pub fn finish(self) -> AppResult<W> {
        match self {
            RowEncoder::Json { mut out, .. } => {
                out.write_all(b"]")?;
                out.flush()?;
                Ok(out)
            }
            RowEncoder::Csv { out, .. } => out
                .into_inner()
                .map_err(|e| AppError::Io(e.into_error())),
        }
    }
}

/// Drain `cursor` into `sink`, projecting each row onto `columns`.
/// Cancellation is checked before every fetch. Returns the number of rows written.
pub fn stream_cursor<W: Write>(
    cursor: &mut Rows<'_>,
    source: &ColumnSet,
    columns: &[String],
    format: DataFormat,
    sink: W,
    cancel: &CancelToken,
) -> AppResult<u64> {
    let mut encoder = RowEncoder::begin(format, sink, columns)?;
    let mut written = 0u64;
    loop {
        cancel.check()?;
        let Some(row) = cursor.next()? else { break };
        let row = source.read_row(row)?.project(columns);
        encoder.write_row(&row)?;
        written += 1;
    }
    encoder.finish()?;
    Ok(written)
}

/// Export one page of a read-only SELECT.
pub fn export_query<W: Write>(
    conn: &Connection,
    sql: &str,
    page: Option<usize>,
    size: Option<usize>,
    format: DataFormat,
    sink: W,
    cancel: &CancelToken,
) -> AppResult<u64> {
    export_query_capped(conn, sql, (page, size), MAX_ROW_BOUND, format, sink, cancel)
}

/// [`export_query`] with the page size held to `max_rows`, including a size
/// taken from a LIMIT in the SQL.
pub fn export_query_capped<W: Write>(
    conn: &Connection,
    sql: &str,
    (page, size): (Option<usize>, Option<usize>),
    max_rows: usize,
    format: DataFormat,
    sink: W,
    cancel: &CancelToken,
) -> AppResult<u64> {
    let cleaned = sql::clean_sql(sql);
    if cleaned.is_empty() {
        return Err(AppError::Validation("SQL statement is empty".into()));
    }
    if sql::classify(&cleaned) != SqlKind::Select {
        return Err(AppError::Validation("only SELECT statements can be exported".into()));
    }
    ensure_readonly(conn, &cleaned)?;

    let columns = columns_from_query(conn, &cleaned)?;
    let paged = PagedSql::parse(&cleaned);
    let p = sql::resolve_pagination(page, size, paged.embedded(), EXPORT_PAGE_SIZE)
        .capped(max_rows);
    let page_sql = paged.page(p)?;
    tracing::debug!(sql = %page_sql, format = format.extension(), "exporting query");

    let mut stmt = conn.prepare(&page_sql)?;
    let source = ColumnSet::of(&stmt);
    let mut cursor = stmt.query([])?;
    stream_cursor(&mut cursor, &source, &columns, format, sink, cancel)
}

/// Stream selected columns of a whole table.
pub fn stream_export_table<W: Write>(
    conn: &Connection,
    table: &str,
    columns: &[String],
    format: DataFormat,
    sink: W,
    cancel: &CancelToken,
) -> AppResult<u64> {
    ensure_identifier("table", table)?;
    if columns.is_empty() {
        return Err(AppError::Validation("at least one column must be selected".into()));
    }
    ensure_identifiers("column", columns)?;
    if !schema::table_exists(conn, table)? {
        return Err(AppError::not_found("table", table));
    }

    let sql = format!("SELECT {} FROM {}", quote_list(columns), quote(table));
    let mut stmt = conn.prepare(&sql)?;
    let source = ColumnSet::of(&stmt);
    let mut cursor = stmt.query([])?;
    let written = stream_cursor(&mut cursor, &source, columns, format, sink, cancel)?;
    tracing::info!(table, rows = written, format = format.extension(), "table exported");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, score REAL, ok BOOLEAN, at DATETIME, raw BLOB);
            INSERT INTO t VALUES (1, 'a,b', 1.5, 1, '2024-05-06 07:08:09', x'6869');
            INSERT INTO t VALUES (2, NULL, 2.0, 0, NULL, NULL);
            INSERT INTO t VALUES (3, 'c', NULL, NULL, NULL, NULL);
            "#,
        )
        .unwrap();
        conn
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn json_is_a_top_level_array() {
        let conn = db();
        let mut out = Vec::new();
        let n = stream_export_table(
            &conn,
            "t",
            &cols(&["name", "id"]),
            DataFormat::Json,
            &mut out,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(n, 3);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with(r#"[{"name":"a,b","id":1}"#));
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 3);
        assert_eq!(parsed[1]["name"], serde_json::Value::Null);
    }

    #[test]
    fn csv_has_bom_header_and_canonical_values() {
        let conn = db();
        let mut out = Vec::new();
        stream_export_table(
            &conn,
            "t",
            &cols(&["id", "name", "score", "ok", "at", "raw"]),
            DataFormat::Csv,
            &mut out,
            &CancelToken::new(),
        )
        .unwrap();
        assert!(out.starts_with(UTF8_BOM));
        let text = String::from_utf8(out[UTF8_BOM.len()..].to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "id,name,score,ok,at,raw",
                "1,\"a,b\",1.5,true,2024-05-06 07:08:09,hi",
                "2,,2,false,,",
                "3,c,,,,",
            ]
        );
    }

    #[test]
    fn empty_result_still_has_frame() {
        let conn = db();
        let mut out = Vec::new();
        export_query(
            &conn,
            "SELECT id FROM t WHERE id > 99",
            None,
            None,
            DataFormat::Json,
            &mut out,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(out, b"[]");

        let mut out = Vec::new();
        export_query(
            &conn,
            "SELECT id, name FROM t WHERE id > 99",
            None,
            None,
            DataFormat::Csv,
            &mut out,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(&out[UTF8_BOM.len()..], b"id,name\n");
    }

    #[test]
    fn query_export_pages_exactly() {
        let conn = db();
        let mut out = Vec::new();
        let n = export_query(
            &conn,
            "SELECT id FROM t ORDER BY id LIMIT 100",
            Some(2),
            Some(2),
            DataFormat::Json,
            &mut out,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(n, 1);
        assert_eq!(String::from_utf8(out).unwrap(), r#"[{"id":3}]"#);
    }

    #[test]
    fn query_export_caps_and_bounds_pages() {
        let conn = db();
        let mut out = Vec::new();
        let n = export_query_capped(
            &conn,
            "SELECT id FROM t ORDER BY id LIMIT 100",
            (None, None),
            2,
            DataFormat::Json,
            &mut out,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(n, 2);
        assert_eq!(String::from_utf8(out).unwrap(), r#"[{"id":1},{"id":2}]"#);

        let err = export_query(
            &conn,
            "SELECT id FROM t",
            Some(usize::MAX),
            Some(10),
            DataFormat::Csv,
            Vec::new(),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn query_export_rejects_writes() {
        let conn = db();
        let err = export_query(
            &conn,
            "DELETE FROM t",
            None,
            None,
            DataFormat::Csv,
            Vec::new(),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn one_cursor_many_projections() {
        let conn = db();
        let mut stmt = conn.prepare("SELECT * FROM t ORDER BY id").unwrap();
        let source = ColumnSet::of(&stmt);
        let mut cursor = stmt.query([]).unwrap();
        let mut out = Vec::new();
        stream_cursor(
            &mut cursor,
            &source,
            &cols(&["score"]),
            DataFormat::Json,
            &mut out,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            r#"[{"score":1.5},{"score":2.0},{"score":null}]"#
        );
    }

    #[test]
    fn cancellation_aborts_stream() {
        let conn = db();
        let token = CancelToken::new();
        token.cancel();
        let err = stream_export_table(
            &conn,
            "t",
            &cols(&["id"]),
            DataFormat::Json,
            Vec::new(),
            &token,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
    }

    #[test]
    fn validates_names_and_formats() {
        let conn = db();
        let err = stream_export_table(
            &conn,
            "t",
            &cols(&["id; drop"]),
            DataFormat::Json,
            Vec::new(),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!("CSV".parse::<DataFormat>().unwrap(), DataFormat::Csv);
        assert_eq!(".json".parse::<DataFormat>().unwrap(), DataFormat::Json);
        assert_eq!(
            DataFormat::from_path(Path::new("/tmp/Upload.CSV")).unwrap(),
            DataFormat::Csv
        );
        assert!(DataFormat::from_path(Path::new("/tmp/noext")).is_err());
        assert_eq!("xml".parse::<DataFormat>().unwrap_err().code(), "UNSUPPORTED_FORMAT");
    }
}
