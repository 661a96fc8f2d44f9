//! Core record model for the bankflow pipeline: entities, schema descriptors, cell values.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub mod schema;

pub use schema::{
    Column, ColumnType, Entity, EntitySchema, ForeignKey, STAGING_ROW_KEY, SURROGATE_KEY,
};

pub const CRATE_NAME: &str = "bankflow-core";

/// Sentinel written for missing text and exported for every missing cell.
pub const NA: &str = "NA";

/// Tokens treated as null in source files, compared case-insensitively after trimming.
pub const NULL_TOKENS: &[&str] = &["", "none", "nan", "nat", "null", "n/a", "<na>"];

pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn is_null_like(raw: &str) -> bool {
    let trimmed = raw.trim();
    NULL_TOKENS
        .iter()
        .any(|token| trimmed.eq_ignore_ascii_case(token))
}

/// Trimmed text, or `None` for null-like input. No type casting happens here.
pub fn normalize_raw(raw: &str) -> Option<String> {
    if is_null_like(raw) {
        None
    } else {
        Some(raw.trim().to_string())
    }
}

/// Integer formed by every ASCII digit in `key`, in order. Keys without digits sort as 0.
///
/// `"C007"` and `"C7"` share a sort key, which makes insertion order independent of zero-padding.
pub fn numeric_sort_key(key: Option<&str>) -> u128 {
    let Some(key) = key else {
        return 0;
    };
    let digits: String = key
        .chars()
        .filter(|c| c.is_ascii_digit())
        .skip_while(|c| *c == '0')
        .collect();
    if digits.is_empty() {
        return 0;
    }
    digits.parse().unwrap_or(u128::MAX)
}

/// Typed cell of the transformed and production stores.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Decimal(f64),
    Date(NaiveDate),
    Boolean(bool),
}

impl Value {
    pub fn text(raw: impl Into<String>) -> Self {
        Value::Text(raw.into())
    }

    pub fn na() -> Self {
        Value::Text(NA.to_string())
    }

    pub fn is_missing(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Text(text) => text == NA,
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Decimal(v) => Some(*v),
            _ => None,
        }
    }

    /// Rendering used by exports; missing cells become `NA`.
    pub fn to_export_string(&self) -> String {
        match self {
            Value::Null => NA.to_string(),
            Value::Text(text) if is_null_like(text) => NA.to_string(),
            Value::Text(text) => text.clone(),
            Value::Integer(v) => v.to_string(),
            Value::Decimal(v) => v.to_string(),
            Value::Date(d) => d.format(DATE_FORMAT).to_string(),
            Value::Boolean(b) => b.to_string(),
        }
    }

    /// Converts a stored cell to the representation of `ty`.
    ///
    /// Booleans accept integer and truthy text, decimals accept integers, dates accept ISO text.
    /// Anything that cannot be represented becomes `Null`.
    pub fn coerce(self, ty: ColumnType) -> Value {
        match (ty, self) {
            (_, Value::Null) => Value::Null,
            (ColumnType::Text, Value::Text(t)) => Value::Text(t),
            (ColumnType::Text, other) => Value::Text(other.to_export_string()),
            (ColumnType::Boolean, Value::Boolean(b)) => Value::Boolean(b),
            (ColumnType::Boolean, Value::Integer(v)) => Value::Boolean(v != 0),
            (ColumnType::Boolean, Value::Decimal(v)) => Value::Boolean(v != 0.0),
            (ColumnType::Boolean, Value::Text(t)) => Value::Boolean(is_truthy(&t)),
            (ColumnType::Decimal, Value::Decimal(v)) => Value::Decimal(v),
            (ColumnType::Decimal, Value::Integer(v)) => Value::Decimal(v as f64),
            (ColumnType::Decimal, Value::Text(t)) => {
                t.trim().parse().map(Value::Decimal).unwrap_or(Value::Null)
            }
            (ColumnType::Integer, Value::Integer(v)) => Value::Integer(v),
            (ColumnType::Integer, Value::Boolean(b)) => Value::Integer(i64::from(b)),
            (ColumnType::Integer, Value::Decimal(v)) if v.fract() == 0.0 => {
                Value::Integer(v as i64)
            }
            (ColumnType::Integer, Value::Text(t)) => {
                t.trim().parse().map(Value::Integer).unwrap_or(Value::Null)
            }
            (ColumnType::Date, Value::Date(d)) => Value::Date(d),
            (ColumnType::Date, Value::Text(t)) => NaiveDate::parse_from_str(t.trim(), DATE_FORMAT)
                .map(Value::Date)
                .unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

/// `true`, `1`, `yes`, `y` in any case.
pub fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "y"
    )
}

/// One staging row: every source column as nullable text, in source-column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingRow {
    pub entity: Entity,
    pub values: Vec<Option<String>>,
}

impl StagingRow {
    pub fn new(entity: Entity, values: Vec<Option<String>>) -> Self {
        Self { entity, values }
    }

    pub fn key(&self) -> Option<&str> {
        self.values.first().and_then(|v| v.as_deref())
    }

    pub fn field(&self, column: &str) -> Option<&str> {
        self.entity
            .schema()
            .source_index(column)
            .and_then(|idx| self.values.get(idx))
            .and_then(|v| v.as_deref())
    }
}

/// One cleaned row in transformed-column order. `row_id` is set once the row has been stored.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRow {
    pub entity: Entity,
    pub row_id: Option<i64>,
    pub values: Vec<Value>,
}

impl TransformedRow {
    pub fn new(entity: Entity, values: Vec<Value>) -> Self {
        Self {
            entity,
            row_id: None,
            values,
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.values.first().and_then(Value::as_text)
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.entity
            .schema()
            .column_index(column)
            .and_then(|idx| self.values.get(idx))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTrackingEntry {
    pub file_name: String,
    pub content_hash: String,
    pub processed_at: DateTime<Utc>,
    pub row_count: u64,
    pub file_size: u64,
}

/// Per-entity comparison of transformed and production row counts. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub entity: Entity,
    pub transformed_count: u64,
    pub production_count: u64,
    pub synchronized: bool,
}

impl SyncStatus {
    pub fn new(entity: Entity, transformed_count: u64, production_count: u64) -> Self {
        Self {
            entity,
            transformed_count,
            production_count,
            synchronized: transformed_count == production_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_tokens_are_case_insensitive_and_trimmed() {
        for raw in ["", "  ", "None", "NaN", "NaT", "NULL", "n/a", "<NA>"] {
            assert!(is_null_like(raw), "{raw:?}");
        }
        assert!(!is_null_like("NA "));
        assert_eq!(normalize_raw("  Pune "), Some("Pune".to_string()));
        assert_eq!(normalize_raw("nan"), None);
    }

    #[test]
    fn numeric_sort_key_ignores_padding_and_letters() {
        assert_eq!(numeric_sort_key(Some("C007")), 7);
        assert_eq!(numeric_sort_key(Some("C7")), 7);
        assert_eq!(numeric_sort_key(Some("L-12-3")), 123);
        assert_eq!(numeric_sort_key(Some("ABC")), 0);
        assert_eq!(numeric_sort_key(None), 0);
    }

    #[test]
    fn coerce_applies_loader_conversions() {
        assert_eq!(
            Value::Integer(1).coerce(ColumnType::Boolean),
            Value::Boolean(true)
        );
        assert_eq!(
            Value::text("Yes").coerce(ColumnType::Boolean),
            Value::Boolean(true)
        );
        assert_eq!(
            Value::Integer(5).coerce(ColumnType::Decimal),
            Value::Decimal(5.0)
        );
        assert_eq!(
            Value::text("2020-03-15").coerce(ColumnType::Date),
            Value::Date(NaiveDate::from_ymd_opt(2020, 3, 15).unwrap())
        );
        assert_eq!(Value::text("x").coerce(ColumnType::Integer), Value::Null);
    }

    #[test]
    fn export_rendering_uses_na_for_missing() {
        assert_eq!(Value::Null.to_export_string(), "NA");
        assert_eq!(Value::text("nan").to_export_string(), "NA");
        assert_eq!(Value::Decimal(12.5).to_export_string(), "12.5");
        assert!(Value::na().is_missing());
    }

    #[test]
    fn staging_row_field_lookup_follows_source_order() {
        let row = StagingRow::new(
            Entity::Branch,
            vec![
                Some("BR01".into()),
                Some("Main".into()),
                Some("Pune".into()),
                None,
                None,
            ],
        );
        assert_eq!(row.key(), Some("BR01"));
        assert_eq!(row.field("city"), Some("Pune"));
        assert_eq!(row.field("state"), None);
    }

    #[test]
    fn sync_status_compares_counts() {
        assert!(SyncStatus::new(Entity::Loan, 3, 3).synchronized);
        assert!(!SyncStatus::new(Entity::Loan, 3, 2).synchronized);
    }
}
