use std::{collections::HashSet, path::Path};

use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core::cancel::CancelToken;
use crate::core::export::{DataFormat, UTF8_BOM};
use crate::core::ident::{ensure_identifier, ensure_identifiers, quote, quote_list};
use crate::core::schema;
use crate::core::types::{ImportOutcome, ImportResult, NewColumn};
use crate::core::value::{as_named_params, NamedBinds, SqlValue};
use crate::error::{AppError, AppResult};

/// Row error messages kept per import; the count keeps going past this.
pub const MAX_IMPORT_ERRORS: usize = 5;

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOptions {
    /// Add input columns the table lacks, as nullable TEXT.
    #[serde(default)]
    pub create_new_columns: bool,
    /// Roll everything back if a single row fails.
    #[serde(default)]
    pub rollback_on_any_failure: bool,
}

/// Parsed input: column order from the first record, then one value per
/// column for every record.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

pub fn parse(content: &[u8], format: DataFormat) -> AppResult<ImportRows> {
    match format {
        DataFormat::Json => parse_json(content),
        DataFormat::Csv => parse_csv(content),
    }
}

fn parse_json(content: &[u8]) -> AppResult<ImportRows> {
    let content = content.strip_prefix(UTF8_BOM).unwrap_or(content);
    let records: Vec<Map<String, Value>> = serde_json::from_slice(content)?;
    let Some(first) = records.first() else {
        return Ok(ImportRows {
            columns: Vec::new(),
            rows: Vec::new(),
        });
    };
    let columns: Vec<String> = first.keys().cloned().collect();
    // Missing keys bind NULL; keys the first record lacked are ignored.
    let rows = records
        .iter()
        .map(|rec| {
            columns
                .iter()
                .map(|c| rec.get(c).map_or(SqlValue::Null, SqlValue::from_json))
                .collect()
        })
        .collect();
    Ok(ImportRows { columns, rows })
}

fn parse_csv(content: &[u8]) -> AppResult<ImportRows> {
    let content = content.strip_prefix(UTF8_BOM).unwrap_or(content);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(content);
    let columns: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = (0..columns.len())
            .map(|i| {
                record
                    .get(i)
                    .map_or(SqlValue::Null, |v| SqlValue::Text(v.to_string()))
            })
            .collect();
        rows.push(row);
    }
    if columns.iter().all(|c| c.is_empty()) || rows.is_empty() {
        return Err(AppError::Validation(
            "CSV input needs a header row and at least one data row".into(),
        ));
    }
    Ok(ImportRows { columns, rows })
}

/// Insert every parsed row into `table` inside one transaction.
///
/// A failing row is counted and skipped. Once all rows are processed the
/// transaction commits, unless a row failed and
/// [`ImportOptions::rollback_on_any_failure`] is set, in which case it is
/// rolled back and [`AppError::ImportRolledBack`] carries the tally.
pub fn import(
    conn: &mut Connection,
    content: &[u8],
    format: DataFormat,
    table: &str,
    opts: ImportOptions,
    cancel: &CancelToken,
) -> AppResult<ImportResult> {
    ensure_identifier("table", table)?;
    let input = parse(content, format)?;
    ensure_identifiers("column", &input.columns)?;

    let mut result = ImportResult {
        table_name: table.to_string(),
        success_count: 0,
        failed_count: 0,
        errors: Vec::new(),
        outcome: ImportOutcome::Committed,
    };
    if input.rows.is_empty() {
        return Ok(result);
    }

    let existing: HashSet<String> = schema::get_columns(conn, table)?
        .into_iter()
        .map(|c| c.name)
        .collect();
    if opts.create_new_columns {
        // DDL runs ahead of the insert transaction.
        for col in input.columns.iter().filter(|c| !existing.contains(*c)) {
            schema::add_column(conn, table, &NewColumn::text(col.as_str()))?;
        }
    }

    let placeholders: Vec<String> = input.columns.iter().map(|c| format!(":{c}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote(table),
        quote_list(&input.columns),
        placeholders.join(", ")
    );

    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(&sql)?;
        for (i, row) in input.rows.into_iter().enumerate() {
            cancel.check()?;
            let binds: NamedBinds = placeholders.iter().cloned().zip(row).collect();
            match stmt.execute(as_named_params(&binds).as_slice()) {
                Ok(_) => result.success_count += 1,
                Err(e) => {
                    result.failed_count += 1;
                    if result.errors.len() < MAX_IMPORT_ERRORS {
                        result.errors.push(format!("row {}: {e}", i + 1));
                    }
                }
            }
        }
    }

    if result.failed_count > 0 && opts.rollback_on_any_failure {
        tx.rollback()?;
        result.success_count = 0;
        result.outcome = ImportOutcome::RolledBack;
        tracing::warn!(table, failed = result.failed_count, "import rolled back");
        return Err(AppError::ImportRolledBack(Box::new(result)));
    }
    tx.commit()?;
    tracing::info!(
        table,
        inserted = result.success_count,
        failed = result.failed_count,
        "import committed"
    );
    Ok(result)
}

/// Import a file, choosing the format from its extension.
pub fn import_file(
    conn: &mut Connection,
    path: &Path,
    table: &str,
    opts: ImportOptions,
    cancel: &CancelToken,
) -> AppResult<ImportResult> {
    let format = DataFormat::from_path(path)?;
    let content = std::fs::read(path)?;
    import(conn, &content, format, table, opts, cancel)
}
