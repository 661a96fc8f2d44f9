//! Table definitions generated from the entity schema descriptors.

use bankflow_core::{Entity, EntitySchema, STAGING_ROW_KEY, SURROGATE_KEY};

pub const LEDGER_TABLE: &str = "etl_file_tracker";
pub const WATERMARK_TABLE: &str = "load_watermarks";

pub fn staging_tables() -> Vec<String> {
    let mut statements: Vec<String> = Entity::LOAD_ORDER
        .into_iter()
        .map(|entity| staging_table(entity.schema()))
        .collect();
    statements.push(format!(
        "CREATE TABLE IF NOT EXISTS {LEDGER_TABLE} (
            file_name TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            processed_at TEXT NOT NULL,
            row_count INTEGER NOT NULL,
            file_size INTEGER NOT NULL
        )"
    ));
    statements
}

fn staging_table(schema: &EntitySchema) -> String {
    let columns: Vec<String> = schema
        .source_columns
        .iter()
        .map(|column| {
            if *column == schema.primary_key {
                format!("{column} TEXT NOT NULL UNIQUE")
            } else {
                format!("{column} TEXT")
            }
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            {STAGING_ROW_KEY} INTEGER PRIMARY KEY AUTOINCREMENT,
            {columns},
            updated_at TEXT NOT NULL
        )",
        table = schema.entity.staging_table(),
        columns = columns.join(",\n            "),
    )
}

pub fn transformed_tables() -> Vec<String> {
    Entity::LOAD_ORDER
        .into_iter()
        .map(|entity| {
            let schema = entity.schema();
            let columns: Vec<String> = schema
                .columns
                .iter()
                .map(|column| {
                    if column.name == schema.primary_key {
                        format!("{} TEXT NOT NULL UNIQUE", column.name)
                    } else {
                        format!("{} {}", column.name, column.ty.sql_type())
                    }
                })
                .collect();
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
            {SURROGATE_KEY} INTEGER PRIMARY KEY AUTOINCREMENT,
            {columns}
        )",
                table = entity.transformed_table(),
                columns = columns.join(",\n            "),
            )
        })
        .collect()
}

pub fn production_tables() -> Vec<String> {
    let mut statements = Vec::new();
    for entity in Entity::LOAD_ORDER {
        let schema = entity.schema();
        let table = entity.production_table();
        let mut columns: Vec<String> = schema
            .columns
            .iter()
            .map(|column| {
                if column.name == schema.primary_key {
                    format!("{} TEXT PRIMARY KEY", column.name)
                } else {
                    format!("{} {}", column.name, column.ty.sql_type())
                }
            })
            .collect();
        if let Some(fk) = schema.foreign_key {
            columns.push(format!(
                "FOREIGN KEY ({}) REFERENCES {}({})",
                fk.column,
                fk.parent.production_table(),
                fk.parent.schema().primary_key
            ));
        }
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n            {}\n        )",
            columns.join(",\n            ")
        ));
        for column in schema.indexed_columns {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_{column} ON {table}({column})"
            ));
        }
    }
    statements.push(format!(
        "CREATE TABLE IF NOT EXISTS {WATERMARK_TABLE} (
            entity TEXT PRIMARY KEY,
            last_row_id INTEGER NOT NULL,
            rows_loaded INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        )"
    ));
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_tables_carry_foreign_keys_and_indexes() {
        let statements = production_tables();
        let loans = statements
            .iter()
            .find(|s| s.contains("EXISTS loans ("))
            .expect("loans table");
        assert!(loans.contains("loan_id TEXT PRIMARY KEY"));
        assert!(loans.contains("FOREIGN KEY (customer_id) REFERENCES customers(customer_id)"));
        assert!(statements
            .iter()
            .any(|s| s.contains("idx_transactions_transaction_date")));
        assert!(!statements.iter().any(|s| s.contains(SURROGATE_KEY)));
    }

    #[test]
    fn staging_tables_are_all_text() {
        let statements = staging_tables();
        let customers = &statements[1];
        assert!(customers.contains("staging_customers"));
        assert!(customers.contains("dob TEXT,"));
        assert!(statements.last().map(|s| s.contains(LEDGER_TABLE)).unwrap_or(false));
    }
}
