use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::value::DbRow;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
    pub cid: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub decl_type: String,
    pub not_null: bool,
    #[serde(default)]
    pub default: Option<String>,
    pub primary: bool,
    pub unique: bool,
    pub auto_increment: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescriptor {
    pub name: String,
    pub unique: bool,
    /// Empty for indexes the engine created for a constraint.
    pub sql: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerEvent {
    Insert,
    Update,
    Delete,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerTiming {
    #[serde(rename = "BEFORE")]
    Before,
    #[serde(rename = "AFTER")]
    After,
    #[serde(rename = "INSTEAD OF")]
    InsteadOf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDescriptor {
    pub name: String,
    pub table: String,
    #[serde(rename = "type")]
    pub event: TriggerEvent,
    pub timing: TriggerTiming,
    pub definition: String,
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub columns: Vec<ColumnDescriptor>,
    pub indexes: Vec<IndexDescriptor>,
    pub triggers: Vec<TriggerDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewInfo {
    pub name: String,
    pub sql: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbInfo {
    pub path: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub sqlite_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    Query,
    Exec,
}

/// Outcome of one ad-hoc statement. Failures land in `error`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<StatementKind>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<DbRow>,
    pub total: i64,
    pub has_next: bool,
    pub page: usize,
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<i64>,
    pub affected: u64,
    pub duration: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResult {
    pub fn new(page: usize, size: usize) -> Self {
        Self {
            kind: None,
            columns: Vec::new(),
            rows: Vec::new(),
            total: 0,
            has_next: false,
            page,
            size,
            last_insert_id: None,
            affected: 0,
            duration: 0.0,
            message: String::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRows {
    pub rows: Vec<DbRow>,
    pub total: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportOutcome {
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub table_name: String,
    pub success_count: usize,
    pub failed_count: usize,
    pub errors: Vec<String>,
    pub outcome: ImportOutcome,
}

/// Definition used by `add_column`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub decl_type: String,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default, rename = "pk")]
    pub primary: bool,
    #[serde(default)]
    pub auto_increment: bool,
}

impl NewColumn {
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            decl_type: "TEXT".to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewIndex {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}
