use std::collections::HashSet;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::core::ident::{ensure_identifier, ensure_identifiers, quote, quote_list};
use crate::core::sql::clean_sql;
use crate::core::types::{
    ColumnDescriptor, IndexDescriptor, NewColumn, NewIndex, TableSchema, TriggerDescriptor,
    TriggerEvent, TriggerTiming, ViewInfo,
};
use crate::error::{AppError, AppResult};

const DEFINITION_PREVIEW_CHARS: usize = 100;

pub fn list_tables(conn: &Connection) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let rows = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_views(conn: &Connection) -> AppResult<Vec<ViewInfo>> {
    let mut stmt = conn.prepare("SELECT name, sql FROM sqlite_master WHERE type='view' ORDER BY name")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(ViewInfo {
                name: r.get(0)?,
                sql: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn table_exists(conn: &Connection, table: &str) -> AppResult<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1)",
        [table],
        |r| r.get(0),
    )?;
    Ok(exists)
}

fn table_ddl(conn: &Connection, table: &str) -> AppResult<Option<String>> {
    let ddl = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type='table' AND name=?1",
            [table],
            |r| r.get::<_, Option<String>>(0),
        )
        .optional()?;
    Ok(ddl.map(Option::unwrap_or_default))
}

/// Columns from `table_xinfo`, plus the facts the pragma does not expose:
/// uniqueness (primary key or a single-column unique index) and AUTOINCREMENT
/// (found in the column's segment of the CREATE TABLE text).
pub fn get_columns(conn: &Connection, table: &str) -> AppResult<Vec<ColumnDescriptor>> {
    ensure_identifier("table", table)?;

    let ddl = table_ddl(conn, table)?.unwrap_or_default();
    let unique_cols = unique_columns(conn, table)?;

    let mut stmt = conn.prepare(
        "SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_xinfo(?1) ORDER BY cid",
    )?;
    let columns = stmt
        .query_map([table], |row: &Row<'_>| {
            let name: String = row.get::<_, Option<String>>(1)?.unwrap_or_default();
            let decl_type: String = row.get::<_, Option<String>>(2)?.unwrap_or_default();
            let pk: i64 = row.get(5)?;
            Ok(ColumnDescriptor {
                cid: row.get(0)?,
                not_null: row.get::<_, i64>(3)? != 0,
                default: row.get(4)?,
                primary: pk > 0,
                unique: pk > 0 || unique_cols.contains(&name),
                auto_increment: pk > 0
                    && decl_type.eq_ignore_ascii_case("INTEGER")
                    && is_auto_increment(&ddl, &name),
                decl_type,
                name,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if columns.is_empty() {
        return Err(AppError::not_found("table", table));
    }
    Ok(columns)
}

fn unique_columns(conn: &Connection, table: &str) -> AppResult<HashSet<String>> {
    let mut out = HashSet::new();
    for index in get_indexes(conn, table)? {
        if index.unique && index.columns.len() == 1 {
            out.extend(index.columns);
        }
    }
    Ok(out)
}

/// Indexes in `index_list` order, each with its CREATE text and key columns.
pub fn get_indexes(conn: &Connection, table: &str) -> AppResult<Vec<IndexDescriptor>> {
    ensure_identifier("table", table)?;

    let mut stmt = conn.prepare("SELECT name, \"unique\" FROM pragma_index_list(?1) ORDER BY seq")?;
    let listed = stmt
        .query_map([table], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? != 0)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut indexes = Vec::with_capacity(listed.len());
    for (name, unique) in listed {
        let sql = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type='index' AND name=?1",
                [&name],
                |r| r.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten()
            .unwrap_or_default();
        let columns = index_columns(conn, &name)?;
        indexes.push(IndexDescriptor {
            name,
            unique,
            sql,
            columns,
        });
    }
    Ok(indexes)
}

/// Key columns of an index in key order. Expression keys have no name and
/// come back as empty strings.
pub fn index_columns(conn: &Connection, index: &str) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
    let cols = stmt
        .query_map([index], |r| Ok(r.get::<_, Option<String>>(0)?.unwrap_or_default()))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cols)
}

pub fn get_triggers(conn: &Connection, table: &str) -> AppResult<Vec<TriggerDescriptor>> {
    ensure_identifier("table", table)?;
    let mut stmt = conn.prepare(
        "SELECT name, tbl_name, sql FROM sqlite_master WHERE type='trigger' AND tbl_name=?1 ORDER BY name",
    )?;
    let rows = stmt
        .query_map([table], trigger_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_triggers(conn: &Connection) -> AppResult<Vec<TriggerDescriptor>> {
    let mut stmt = conn.prepare(
        "SELECT name, tbl_name, sql FROM sqlite_master WHERE type='trigger' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let rows = stmt
        .query_map([], trigger_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_trigger(conn: &Connection, name: &str) -> AppResult<TriggerDescriptor> {
    ensure_identifier("trigger", name)?;
    conn.query_row(
        "SELECT name, tbl_name, sql FROM sqlite_master WHERE type='trigger' AND name=?1",
        [name],
        trigger_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("trigger", name))
}

fn trigger_from_row(r: &Row<'_>) -> rusqlite::Result<TriggerDescriptor> {
    let sql: String = r.get::<_, Option<String>>(2)?.unwrap_or_default();
    let (event, timing) = trigger_event_timing(&sql);
    Ok(TriggerDescriptor {
        name: r.get(0)?,
        table: r.get(1)?,
        event,
        timing,
        definition: preview(&sql),
        sql,
    })
}

/// Approximate event and timing by keyword search over the trigger header
/// (the text before `BEGIN`). Anything unrecognised is UNKNOWN / AFTER.
pub fn trigger_event_timing(sql: &str) -> (TriggerEvent, TriggerTiming) {
    let text = format!(" {} ", clean_sql(sql).to_ascii_uppercase());
    let header = match text.find(" BEGIN ") {
        Some(i) => &text[..=i],
        None => text.as_str(),
    };

    let timing = if header.contains(" INSTEAD OF ") {
        TriggerTiming::InsteadOf
    } else if header.contains(" BEFORE ") {
        TriggerTiming::Before
    } else {
        TriggerTiming::After
    };
    let event = if header.contains(" INSERT ") {
        TriggerEvent::Insert
    } else if header.contains(" UPDATE ") {
        TriggerEvent::Update
    } else if header.contains(" DELETE ") {
        TriggerEvent::Delete
    } else {
        TriggerEvent::Unknown
    };
    (event, timing)
}

fn preview(sql: &str) -> String {
    let mut chars = sql.chars();
    let head: String = chars.by_ref().take(DEFINITION_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn is_auto_increment(ddl: &str, column: &str) -> bool {
    column_definition(ddl, column)
        .map(|def| {
            let def = def.to_ascii_uppercase();
            def.contains("AUTOINCREMENT") || def.contains("AUTO_INCREMENT")
        })
        .unwrap_or(false)
}

/// The comma-separated segment of a CREATE TABLE body that defines `column`.
fn column_definition<'a>(ddl: &'a str, column: &str) -> Option<&'a str> {
    let open = ddl.find('(')?;
    let body = &ddl[open + 1..];

    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    let mut segments = Vec::new();
    for (i, c) in body.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(c),
            (None, '[') => quote = Some(']'),
            (None, '(') => depth += 1,
            (None, ')') if depth == 0 => {
                segments.push(&body[start..i]);
                break;
            }
            (None, ')') => depth -= 1,
            (None, ',') if depth == 0 => {
                segments.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    segments
        .into_iter()
        .map(str::trim)
        .find(|seg| leading_name(seg).eq_ignore_ascii_case(column))
}

fn leading_name(segment: &str) -> &str {
    let mut chars = segment.char_indices();
    match chars.next() {
        Some((_, open @ ('"' | '`' | '['))) => {
            let close = if open == '[' { ']' } else { open };
            let rest = &segment[1..];
            rest.find(close).map_or(rest, |end| &rest[..end])
        }
        Some(_) => segment
            .find(char::is_whitespace)
            .map_or(segment, |end| &segment[..end]),
        None => "",
    }
}

/// Columns, indexes and triggers of one table.
pub fn get_table_info(conn: &Connection, table: &str) -> AppResult<TableSchema> {
    let columns = get_columns(conn, table)?;
    let indexes = get_indexes(conn, table)?;
    let triggers = get_triggers(conn, table)?;
    Ok(TableSchema {
        columns,
        indexes,
        triggers,
    })
}

pub fn create_table(conn: &Connection, table: &str) -> AppResult<()> {
    ensure_identifier("table", table)?;
    if table_exists(conn, table)? {
        return Err(AppError::Validation(format!("table {table} already exists")));
    }
    conn.execute_batch(&format!(
        "CREATE TABLE {} (\"id\" INTEGER PRIMARY KEY AUTOINCREMENT)",
        quote(table)
    ))?;
    tracing::info!(table, "table created");
    Ok(())
}

pub fn drop_table(conn: &Connection, table: &str) -> AppResult<()> {
    ensure_identifier("table", table)?;
    if !table_exists(conn, table)? {
        return Err(AppError::not_found("table", table));
    }
    conn.execute_batch(&format!("DROP TABLE {}", quote(table)))?;
    tracing::info!(table, "table dropped");
    Ok(())
}

fn is_valid_type_name(decl_type: &str) -> bool {
    // e.g. TEXT, INTEGER, VARCHAR(255), DECIMAL(10, 2), DOUBLE PRECISION
    let (name, args) = match decl_type.find('(') {
        Some(i) => (&decl_type[..i], Some(&decl_type[i..])),
        None => (decl_type, None),
    };
    let name_ok = name
        .split_whitespace()
        .all(crate::core::ident::is_valid_identifier)
        && !name.trim().is_empty();
    let args_ok = args.map_or(true, |a| {
        a.ends_with(')')
            && a[1..a.len() - 1]
                .split(',')
                .all(|n| !n.trim().is_empty() && n.trim().chars().all(|c| c.is_ascii_digit()))
    });
    name_ok && args_ok
}

pub fn add_column(conn: &Connection, table: &str, column: &NewColumn) -> AppResult<()> {
    ensure_identifier("table", table)?;
    ensure_identifier("column", &column.name)?;
    if !is_valid_type_name(&column.decl_type) {
        return Err(AppError::Validation(format!(
            "invalid column type: {:?}",
            column.decl_type
        )));
    }

    let mut sql = format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote(table),
        quote(&column.name),
        column.decl_type.trim()
    );
    if column.not_null {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = column.default.as_deref().filter(|d| !d.is_empty()) {
        sql.push_str(&format!(" DEFAULT '{}'", default.replace('\'', "''")));
    }
    if column.primary {
        sql.push_str(" PRIMARY KEY");
        if column.auto_increment && column.decl_type.trim().eq_ignore_ascii_case("INTEGER") {
            sql.push_str(" AUTOINCREMENT");
        }
    }
    conn.execute_batch(&sql)?;
    tracing::info!(table, column = %column.name, decl_type = %column.decl_type, "column added");
    Ok(())
}

pub fn drop_column(conn: &Connection, table: &str, column: &str) -> AppResult<()> {
    ensure_identifier("table", table)?;
    ensure_identifier("column", column)?;
    conn.execute_batch(&format!(
        "ALTER TABLE {} DROP COLUMN {}",
        quote(table),
        quote(column)
    ))?;
    tracing::info!(table, column, "column dropped");
    Ok(())
}

pub fn rename_column(conn: &Connection, table: &str, old: &str, new: &str) -> AppResult<()> {
    ensure_identifier("table", table)?;
    ensure_identifier("column", old)?;
    ensure_identifier("column", new)?;
    conn.execute_batch(&format!(
        "ALTER TABLE {} RENAME COLUMN {} TO {}",
        quote(table),
        quote(old),
        quote(new)
    ))?;
    tracing::info!(table, old, new, "column renamed");
    Ok(())
}

pub fn create_index(conn: &Connection, table: &str, index: &NewIndex) -> AppResult<()> {
    ensure_identifier("table", table)?;
    ensure_identifier("index", &index.name)?;
    if index.columns.is_empty() {
        return Err(AppError::Validation("index needs at least one column".into()));
    }
    ensure_identifiers("column", &index.columns)?;

    let unique = if index.unique { "UNIQUE " } else { "" };
    conn.execute_batch(&format!(
        "CREATE {unique}INDEX {} ON {} ({})",
        quote(&index.name),
        quote(table),
        quote_list(&index.columns)
    ))?;
    tracing::info!(table, index = %index.name, unique = index.unique, "index created");
    Ok(())
}

pub fn drop_index(conn: &Connection, table: &str, index: &str) -> AppResult<()> {
    ensure_identifier("table", table)?;
    ensure_identifier("index", index)?;
    conn.execute(&format!("DROP INDEX IF EXISTS {}", quote(index)), params![])?;
    tracing::info!(table, index, "index dropped");
    Ok(())
}
