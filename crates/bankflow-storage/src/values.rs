use bankflow_core::{ColumnType, Value, DATE_FORMAT};
use chrono::NaiveDate;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::Row;

use crate::{StoreError, StoreResult};

pub(crate) type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

pub(crate) fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Text(text) => query.bind(text.clone()),
        Value::Integer(v) => query.bind(*v),
        Value::Decimal(v) => query.bind(*v),
        Value::Date(d) => query.bind(d.format(DATE_FORMAT).to_string()),
        Value::Boolean(b) => query.bind(i64::from(*b)),
    }
}

pub(crate) fn decode_value(
    row: &SqliteRow,
    table: &str,
    column: &str,
    ty: ColumnType,
) -> StoreResult<Value> {
    let value = match ty {
        ColumnType::Text => row
            .try_get::<Option<String>, _>(column)?
            .map(Value::Text),
        ColumnType::Integer => row.try_get::<Option<i64>, _>(column)?.map(Value::Integer),
        ColumnType::Decimal => row.try_get::<Option<f64>, _>(column)?.map(Value::Decimal),
        ColumnType::Boolean => row
            .try_get::<Option<i64>, _>(column)?
            .map(|v| Value::Boolean(v != 0)),
        ColumnType::Date => match row.try_get::<Option<String>, _>(column)? {
            None => None,
            Some(text) => Some(Value::Date(
                NaiveDate::parse_from_str(&text, DATE_FORMAT).map_err(|err| {
                    StoreError::Decode {
                        table: table.to_string(),
                        column: column.to_string(),
                        message: format!("{text:?}: {err}"),
                    }
                })?,
            )),
        },
    };
    Ok(value.unwrap_or(Value::Null))
}

/// `?, ?, ?` with `n` placeholders.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_lists_match_arity() {
        assert_eq!(placeholders(3), "?, ?, ?");
        assert_eq!(placeholders(1), "?");
    }
}
