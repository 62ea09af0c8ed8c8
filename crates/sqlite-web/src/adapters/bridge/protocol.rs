use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{
    export::DataFormat,
    import::ImportOptions,
    types::{NewColumn, NewIndex},
    value::DbRow,
};
use crate::error::AppError;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BridgeRequest {
    pub v: u32,
    pub id: String,
    pub cmd: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct BridgeResponse<T> {
    pub v: u32,
    pub id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl<T> BridgeResponse<T> {
    pub fn ok(v: u32, id: String, data: T) -> Self {
        Self {
            v,
            id,
            status: "ok",
            data: Some(data),
            error: None,
            code: None,
            details: None,
        }
    }

    pub fn err(v: u32, id: String, e: &AppError) -> Self {
        Self {
            v,
            id,
            status: "error",
            data: None,
            error: Some(e.to_string()),
            code: Some(e.code()),
            details: e.details(),
        }
    }
}

// Payloads

#[derive(Debug, Deserialize)]
pub struct TablePayload {
    pub table: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelPayload {
    /// Id of the request to cancel.
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct TriggerPayload {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct AddColumnPayload {
    pub table: String,
    pub column: NewColumn,
}

#[derive(Debug, Deserialize)]
pub struct DropColumnPayload {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameColumnPayload {
    pub table: String,
    pub old_name: String,
    pub new_name: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateIndexPayload {
    pub table: String,
    pub index: NewIndex,
}

#[derive(Debug, Deserialize)]
pub struct DropIndexPayload {
    pub table: String,
    pub index: String,
}

#[derive(Debug, Deserialize)]
pub struct RowsPayload {
    pub table: String,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RowPayload {
    pub table: String,
    pub data: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct QueryPayload {
    pub sql: String,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ExportQueryPayload {
    pub sql: String,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub size: Option<usize>,
    pub format: DataFormat,
    /// File the export is written to.
    pub out: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct ExportTablePayload {
    pub table: String,
    pub columns: Vec<String>,
    pub format: DataFormat,
    pub out: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct ImportPayload {
    pub table: String,
    /// Source file; `.json` or `.csv`.
    pub file: PathBuf,
    #[serde(flatten)]
    pub options: ImportOptions,
}

// Response data

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowsPage {
    pub rows: Vec<DbRow>,
    pub total: i64,
    pub page: usize,
    pub total_pages: i64,
    pub limit: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub path: PathBuf,
    pub format: DataFormat,
    pub content_type: &'static str,
    pub rows: u64,
}
