use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use rusqlite::{
    types::{ToSqlOutput, Value, ValueRef},
    Row, Statement, ToSql,
};
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::AppResult;

/// Display format used for timestamps in CSV and when binding them back.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single cell. SQLite is typed per value, not per column.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Bool(bool),
    Text(String),
    Blob(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    /// Decode an engine value, using the column's declared type to recover
    /// booleans and timestamps the way the storage layer wrote them.
    pub fn from_value_ref(v: ValueRef<'_>, decl_type: Option<&str>) -> Self {
        let hint = decl_type.map(TypeHint::of).unwrap_or(TypeHint::None);
        match v {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(x) => match hint {
                TypeHint::Bool => SqlValue::Bool(x != 0),
                TypeHint::Timestamp => Utc
                    .timestamp_opt(x, 0)
                    .single()
                    .map(SqlValue::Timestamp)
                    .unwrap_or(SqlValue::Integer(x)),
                TypeHint::None => SqlValue::Integer(x),
            },
            ValueRef::Real(x) => SqlValue::Real(x),
            ValueRef::Text(t) => {
                let s = String::from_utf8_lossy(t).into_owned();
                match hint {
                    TypeHint::Timestamp => match parse_timestamp(&s) {
                        Some(ts) => SqlValue::Timestamp(ts),
                        None => SqlValue::Text(s),
                    },
                    _ => SqlValue::Text(s),
                }
            }
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }

    pub fn from_json(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => SqlValue::Null,
            serde_json::Value::Bool(b) => SqlValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Canonical text form used by CSV export.
    pub fn to_text(&self) -> String {
        match self {
            SqlValue::Null => String::new(),
            SqlValue::Integer(x) => x.to_string(),
            SqlValue::Real(x) => format_real(*x),
            SqlValue::Bool(b) => b.to_string(),
            SqlValue::Text(s) => s.clone(),
            SqlValue::Blob(b) => String::from_utf8_lossy(b).into_owned(),
            SqlValue::Timestamp(ts) => ts.format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

/// Shortest round-trip digits. Exponent form below 1e-4 and from 1e6 up,
/// with a signed two-digit exponent: `1e+06`, `2.5e-07`.
fn format_real(x: f64) -> String {
    if x.is_nan() {
        return "NaN".into();
    }
    if x.is_infinite() {
        return if x > 0.0 { "+Inf" } else { "-Inf" }.into();
    }
    let sci = format!("{x:e}");
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return x.to_string();
    };
    let exp: i32 = exp.parse().unwrap_or(0);
    if (-4..6).contains(&exp) {
        return x.to_string();
    }
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{mantissa}e{sign}{:02}", exp.unsigned_abs())
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SqlValue::Null => serializer.serialize_none(),
            SqlValue::Integer(x) => serializer.serialize_i64(*x),
            SqlValue::Real(x) => serializer.serialize_f64(*x),
            SqlValue::Bool(b) => serializer.serialize_bool(*b),
            SqlValue::Text(s) => serializer.serialize_str(s),
            SqlValue::Blob(b) => serializer.serialize_str(&String::from_utf8_lossy(b)),
            SqlValue::Timestamp(ts) => {
                serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(x) => ToSqlOutput::Owned(Value::Integer(*x)),
            SqlValue::Real(x) => ToSqlOutput::Owned(Value::Real(*x)),
            SqlValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            SqlValue::Timestamp(ts) => {
                ToSqlOutput::Owned(Value::Text(ts.format(TIMESTAMP_FORMAT).to_string()))
            }
        })
    }
}

#[derive(Clone, Copy)]
enum TypeHint {
    None,
    Bool,
    Timestamp,
}

impl TypeHint {
    fn of(decl_type: &str) -> Self {
        match decl_type.trim().to_ascii_uppercase().as_str() {
            "BOOLEAN" | "BOOL" => TypeHint::Bool,
            "DATE" | "DATETIME" | "TIMESTAMP" => TypeHint::Timestamp,
            _ => TypeHint::None,
        }
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Named parameters (`:name` to value), ready to hand to `Statement::execute`.
pub type NamedBinds = Vec<(String, SqlValue)>;

pub fn as_named_params(binds: &[(String, SqlValue)]) -> Vec<(&str, &dyn ToSql)> {
    binds
        .iter()
        .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
        .collect()
}

/// Output column names and declared types of a prepared statement.
#[derive(Debug, Clone, Default)]
pub struct ColumnSet {
    pub names: Vec<String>,
    decl_types: Vec<Option<String>>,
}

impl ColumnSet {
    pub fn of(stmt: &Statement<'_>) -> Self {
        let (names, decl_types) = stmt
            .columns()
            .iter()
            .map(|c| (c.name().to_string(), c.decl_type().map(str::to_string)))
            .unzip();
        Self { names, decl_types }
    }

    pub fn read_row(&self, row: &Row<'_>) -> AppResult<DbRow> {
        let mut out = DbRow::with_capacity(self.names.len());
        for (i, name) in self.names.iter().enumerate() {
            let value = SqlValue::from_value_ref(row.get_ref(i)?, self.decl_types[i].as_deref());
            out.push(name.clone(), value);
        }
        Ok(out)
    }
}

/// One result row: column name to value, in column order. A repeated
/// column name keeps its first position and its last value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbRow {
    entries: Vec<(String, SqlValue)>,
}

impl DbRow {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            entries: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, name: String, value: SqlValue) {
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Keep only `columns`, in that order. Columns the row lacks are skipped.
    pub fn project(&self, columns: &[String]) -> DbRow {
        let mut out = DbRow::with_capacity(columns.len());
        for col in columns {
            if let Some(v) = self.get(col) {
                out.push(col.clone(), v.clone());
            }
        }
        out
    }
}

impl Serialize for DbRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_formatting_is_canonical() {
        assert_eq!(SqlValue::Null.to_text(), "");
        assert_eq!(SqlValue::Integer(-42).to_text(), "-42");
        assert_eq!(SqlValue::Real(0.1).to_text(), "0.1");
        assert_eq!(SqlValue::Real(2.0).to_text(), "2");
        assert_eq!(SqlValue::Real(123456.0).to_text(), "123456");
        assert_eq!(SqlValue::Real(0.0001).to_text(), "0.0001");
        assert_eq!(SqlValue::Real(-0.0).to_text(), "-0");
        assert_eq!(SqlValue::Bool(true).to_text(), "true");
        assert_eq!(SqlValue::Blob(b"hi".to_vec()).to_text(), "hi");
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(SqlValue::Timestamp(ts).to_text(), "2024-03-09 07:05:01");
    }

    #[test]
    fn extreme_reals_use_exponents() {
        assert_eq!(SqlValue::Real(1e21).to_text(), "1e+21");
        assert_eq!(SqlValue::Real(1e300).to_text(), "1e+300");
        assert_eq!(SqlValue::Real(1e6).to_text(), "1e+06");
        assert_eq!(SqlValue::Real(-2.5e10).to_text(), "-2.5e+10");
        assert_eq!(SqlValue::Real(0.00001).to_text(), "1e-05");
        assert_eq!(SqlValue::Real(1.5e-7).to_text(), "1.5e-07");
        assert_eq!(SqlValue::Real(f64::INFINITY).to_text(), "+Inf");
        assert_eq!(SqlValue::Real(f64::NEG_INFINITY).to_text(), "-Inf");
        assert_eq!(SqlValue::Real(f64::NAN).to_text(), "NaN");
    }

    #[test]
    fn repeated_names_keep_the_last_value() {
        let mut row = DbRow::default();
        row.push("id".into(), SqlValue::Integer(1));
        row.push("name".into(), SqlValue::Text("a".into()));
        row.push("id".into(), SqlValue::Integer(2));
        assert_eq!(row.len(), 2);
        assert_eq!(row.get("id"), Some(&SqlValue::Integer(2)));
        assert_eq!(serde_json::to_string(&row).unwrap(), r#"{"id":2,"name":"a"}"#);
    }

    #[test]
    fn decl_type_hints_recover_bool_and_time() {
        assert_eq!(
            SqlValue::from_value_ref(ValueRef::Integer(1), Some("boolean")),
            SqlValue::Bool(true)
        );
        assert_eq!(
            SqlValue::from_value_ref(ValueRef::Text(b"2024-01-02 03:04:05"), Some("DATETIME")),
            SqlValue::Timestamp(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap())
        );
        assert_eq!(
            SqlValue::from_value_ref(ValueRef::Text(b"soon"), Some("DATETIME")),
            SqlValue::Text("soon".into())
        );
        assert_eq!(
            SqlValue::from_value_ref(ValueRef::Integer(7), Some("INTEGER")),
            SqlValue::Integer(7)
        );
    }

    #[test]
    fn row_serializes_in_column_order() {
        let mut row = DbRow::default();
        row.push("z".into(), SqlValue::Integer(1));
        row.push("a".into(), SqlValue::Blob(b"x".to_vec()));
        row.push("m".into(), SqlValue::Null);
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"z":1,"a":"x","m":null}"#);
    }

    #[test]
    fn projection_follows_requested_order() {
        let mut row = DbRow::default();
        row.push("a".into(), SqlValue::Integer(1));
        row.push("b".into(), SqlValue::Integer(2));
        let p = row.project(&["b".into(), "missing".into(), "a".into()]);
        let names: Vec<&str> = p.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn json_numbers_keep_integer_width() {
        assert_eq!(SqlValue::from_json(&serde_json::json!(3)), SqlValue::Integer(3));
        assert_eq!(SqlValue::from_json(&serde_json::json!(1.5)), SqlValue::Real(1.5));
        assert_eq!(
            SqlValue::from_json(&serde_json::json!({"k": 1})),
            SqlValue::Text(r#"{"k":1}"#.into())
        );
    }
}
