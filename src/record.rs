use std::collections::BTreeSet;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

use crate::{AppError, AppResult};

/// Contract every migrated row type satisfies.
///
/// `equivalent_to` compares values only and must ignore anything a store
/// assigns on its own (e.g. last-modified timestamps written independently
/// by each side).
pub trait Record: Clone + Send + Sync + 'static {
    fn identifier(&self) -> i64;
    fn equivalent_to(&self, other: &Self) -> bool;
}

/// Mapping between a record and a SQL table described by a [`TableSpec`].
pub trait SqlRecord: Record {
    fn from_row(row: &SqliteRow, spec: &TableSpec) -> Result<Self, sqlx::Error>;

    /// Column values in `spec.columns` order.
    fn column_values(&self, spec: &TableSpec) -> Vec<Value>;
}

fn default_id_column() -> String {
    "id".into()
}

fn default_modified_column() -> String {
    "utime".into()
}

/// Describes the migrated table. Names are interpolated into SQL, so every
/// one of them is checked by [`TableSpec::validate`] first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    /// Monotonic modification marker used by incremental scans.
    #[serde(default = "default_modified_column")]
    pub modified_column: String,
    /// Every column written by an upsert, including id and marker.
    pub columns: Vec<String>,
    /// Columns left out of equality checks for [`JsonRow`].
    #[serde(default)]
    pub ignored_columns: Vec<String>,
}

pub(crate) fn is_safe_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl TableSpec {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            id_column: default_id_column(),
            modified_column: default_modified_column(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            ignored_columns: Vec::new(),
        }
    }

    pub fn with_modified_column(mut self, column: impl Into<String>) -> Self {
        self.modified_column = column.into();
        self
    }

    pub fn with_ignored(mut self, columns: &[&str]) -> Self {
        self.ignored_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn validate(&self) -> AppResult<()> {
        let names = std::iter::once(&self.name)
            .chain(std::iter::once(&self.id_column))
            .chain(std::iter::once(&self.modified_column))
            .chain(self.columns.iter())
            .chain(self.ignored_columns.iter());
        for name in names {
            if !is_safe_identifier(name) {
                return Err(AppError::new(
                    AppError::INVALID_IDENTIFIER,
                    "identifier is not safe to use in SQL",
                )
                .with_context("identifier", name.clone())
                .with_context("table", self.name.clone()));
            }
        }
        for required in [&self.id_column, &self.modified_column] {
            if !self.columns.contains(required) {
                return Err(AppError::new(
                    "CONFIG/MISSING_COLUMN",
                    "column list must include the id and modification columns",
                )
                .with_context("column", required.clone())
                .with_context("table", self.name.clone()));
            }
        }
        Ok(())
    }

    pub(crate) fn column_list(&self) -> String {
        self.columns.join(", ")
    }
}

/// Schema-less record: any table row as a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRow {
    id: i64,
    values: Map<String, Value>,
    ignored: Arc<BTreeSet<String>>,
}

impl JsonRow {
    pub fn new(id: i64, values: Map<String, Value>, ignored: &[String]) -> Self {
        Self {
            id,
            values,
            ignored: Arc::new(ignored.iter().cloned().collect()),
        }
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    fn compared(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values
            .iter()
            .filter(move |(k, _)| !self.ignored.contains(k.as_str()))
    }
}

impl Record for JsonRow {
    fn identifier(&self) -> i64 {
        self.id
    }

    fn equivalent_to(&self, other: &Self) -> bool {
        self.id == other.id && self.compared().eq(other.compared())
    }
}

impl SqlRecord for JsonRow {
    fn from_row(row: &SqliteRow, spec: &TableSpec) -> Result<Self, sqlx::Error> {
        let id: i64 = row.try_get(spec.id_column.as_str())?;
        Ok(JsonRow::new(id, row_to_map(row)?, &spec.ignored_columns))
    }

    fn column_values(&self, spec: &TableSpec) -> Vec<Value> {
        spec.columns
            .iter()
            .map(|c| self.values.get(c).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// Key of the single-entry object a BLOB value maps to: `{"$blob": "<base64>"}`.
pub const BLOB_KEY: &str = "$blob";

/// JSON form of a BLOB column value. Two blobs compare equal exactly when
/// their bytes do.
pub fn blob_value(bytes: &[u8]) -> Value {
    let mut tagged = Map::new();
    tagged.insert(BLOB_KEY.to_string(), Value::String(STANDARD.encode(bytes)));
    Value::Object(tagged)
}

/// Bytes of a value built by [`blob_value`]; `None` for anything else.
pub fn blob_bytes(value: &Value) -> Option<Vec<u8>> {
    let tagged = value.as_object()?;
    if tagged.len() != 1 {
        return None;
    }
    let encoded = tagged.get(BLOB_KEY)?.as_str()?;
    STANDARD.decode(encoded).ok()
}

/// Convert a SQLite row into a JSON object keyed by column name. Every
/// storage class maps losslessly; a value that fails to decode fails the row.
pub fn row_to_map(row: &SqliteRow) -> Result<Map<String, Value>, sqlx::Error> {
    let mut map = Map::new();
    for col in row.columns() {
        let idx = col.ordinal();
        let raw = row.try_get_raw(idx)?;
        let val = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => Value::from(row.try_get::<i64, _>(idx)?),
                "REAL" => Value::from(row.try_get::<f64, _>(idx)?),
                "BLOB" => blob_value(&row.try_get::<Vec<u8>, _>(idx)?),
                _ => Value::from(row.try_get::<String, _>(idx)?),
            }
        };
        map.insert(col.name().to_string(), val);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: i64, value: Value) -> JsonRow {
        let ignored = vec!["utime".to_string()];
        JsonRow::new(id, value.as_object().cloned().unwrap(), &ignored)
    }

    #[test]
    fn equality_skips_ignored_columns() {
        let a = row(1, json!({"id": 1, "title": "a", "utime": 10}));
        let b = row(1, json!({"id": 1, "title": "a", "utime": 99}));
        assert!(a.equivalent_to(&b));
        assert!(a.equivalent_to(&a));
    }

    #[test]
    fn equality_sees_meaningful_changes() {
        let a = row(1, json!({"id": 1, "title": "a", "utime": 10}));
        let b = row(1, json!({"id": 1, "title": "b", "utime": 10}));
        assert!(!a.equivalent_to(&b));
    }

    #[test]
    fn column_values_follow_spec_order_and_fill_nulls() {
        let spec = TableSpec::new("articles", &["id", "utime", "title", "body"]);
        let r = row(3, json!({"id": 3, "title": "t", "utime": 5}));
        assert_eq!(
            r.column_values(&spec),
            vec![json!(3), json!(5), json!("t"), Value::Null]
        );
    }

    #[test]
    fn validate_rejects_injection_and_missing_columns() {
        let bad = TableSpec::new("articles; DROP TABLE x", &["id", "utime"]);
        assert_eq!(
            bad.validate().unwrap_err().code(),
            AppError::INVALID_IDENTIFIER
        );

        let missing = TableSpec::new("articles", &["id", "title"]);
        assert_eq!(
            missing.validate().unwrap_err().code(),
            "CONFIG/MISSING_COLUMN"
        );

        let ok = TableSpec::new("articles", &["id", "utime", "title"]).with_ignored(&["utime"]);
        ok.validate().unwrap();
    }

    #[test]
    fn identifier_rules() {
        assert!(is_safe_identifier("_col9"));
        assert!(!is_safe_identifier("9col"));
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("a-b"));
    }

    #[test]
    fn blob_values_keep_their_bytes() {
        let a = blob_value(&[1, 2, 3]);
        assert_eq!(a, json!({"$blob": "AQID"}));
        assert_eq!(blob_bytes(&a), Some(vec![1, 2, 3]));
        assert_ne!(a, blob_value(&[1, 2, 4]));
        assert_eq!(blob_bytes(&json!({"$blob": "AQID", "x": 1})), None);
        assert_eq!(blob_bytes(&json!("AQID")), None);
    }

    #[tokio::test]
    async fn row_to_map_covers_every_storage_class() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let row = sqlx::query("SELECT 7 AS i, 1.5 AS r, 'txt' AS t, x'00ff' AS b, NULL AS n")
            .fetch_one(&pool)
            .await
            .unwrap();
        let map = row_to_map(&row).unwrap();
        assert_eq!(
            Value::Object(map),
            json!({"i": 7, "r": 1.5, "t": "txt", "b": {"$blob": "AP8="}, "n": null})
        );
    }
}
