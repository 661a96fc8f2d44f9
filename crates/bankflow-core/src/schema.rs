//! Typed schema descriptors shared by every pipeline stage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Surrogate ordering key of the transformed store.
pub const SURROGATE_KEY: &str = "row_id";

/// Insertion-order key of the staging store.
pub const STAGING_ROW_KEY: &str = "staging_row_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Entity {
    #[serde(rename = "branches")]
    Branch,
    #[serde(rename = "customers")]
    Customer,
    #[serde(rename = "loans")]
    Loan,
    #[serde(rename = "transactions")]
    Transaction,
}

impl Entity {
    /// Parent-before-child order used by the normalizer and the loader.
    pub const LOAD_ORDER: [Entity; 4] = [
        Entity::Branch,
        Entity::Customer,
        Entity::Loan,
        Entity::Transaction,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Entity::Branch => "branches",
            Entity::Customer => "customers",
            Entity::Loan => "loans",
            Entity::Transaction => "transactions",
        }
    }

    pub fn schema(self) -> &'static EntitySchema {
        match self {
            Entity::Branch => &BRANCHES,
            Entity::Customer => &CUSTOMERS,
            Entity::Loan => &LOANS,
            Entity::Transaction => &TRANSACTIONS,
        }
    }

    pub fn staging_table(self) -> String {
        format!("staging_{}", self.name())
    }

    pub fn transformed_table(self) -> String {
        format!("transformed_{}", self.name())
    }

    pub fn production_table(self) -> &'static str {
        self.name()
    }

    /// Entities whose foreign key points at `self`.
    pub fn children(self) -> Vec<Entity> {
        Self::LOAD_ORDER
            .into_iter()
            .filter(|e| e.schema().foreign_key.map(|fk| fk.parent) == Some(self))
            .collect()
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Entity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::LOAD_ORDER
            .into_iter()
            .find(|e| e.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown entity '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Text,
    Integer,
    Decimal,
    Date,
    Boolean,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Date => "TEXT",
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Decimal => "REAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn text(name: &'static str) -> Column {
    Column {
        name,
        ty: ColumnType::Text,
    }
}

const fn typed(name: &'static str, ty: ColumnType) -> Column {
    Column { name, ty }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: &'static str,
    pub parent: Entity,
}

/// One descriptor per entity: source layout, typed target layout, keys and indexes.
#[derive(Debug)]
pub struct EntitySchema {
    pub entity: Entity,
    pub primary_key: &'static str,
    /// Column order of source files and staging tables. The primary key is first.
    pub source_columns: &'static [&'static str],
    pub date_columns: &'static [&'static str],
    /// Business and derived columns of the transformed and production tables. The primary key is first.
    pub columns: &'static [Column],
    /// Enforced during normalization; rows with an unknown parent are dropped.
    pub foreign_key: Option<ForeignKey>,
    pub indexed_columns: &'static [&'static str],
    pub outlier_column: Option<&'static str>,
}

impl EntitySchema {
    pub fn source_index(&self, column: &str) -> Option<usize> {
        self.source_columns.iter().position(|c| *c == column)
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }

    pub fn column(&self, column: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == column)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }
}

pub static BRANCHES: EntitySchema = EntitySchema {
    entity: Entity::Branch,
    primary_key: "branch_id",
    source_columns: &["branch_id", "branch_name", "city", "state", "manager_name"],
    date_columns: &[],
    columns: &[
        text("branch_id"),
        text("branch_name"),
        text("city"),
        text("state"),
        text("manager_name"),
        text("region"),
    ],
    foreign_key: None,
    indexed_columns: &[],
    outlier_column: None,
};

pub static CUSTOMERS: EntitySchema = EntitySchema {
    entity: Entity::Customer,
    primary_key: "customer_id",
    source_columns: &[
        "customer_id",
        "branch_id",
        "first_name",
        "last_name",
        "dob",
        "gender",
        "email",
        "phone",
        "address",
        "account_open_date",
    ],
    date_columns: &["dob", "account_open_date"],
    columns: &[
        text("customer_id"),
        text("branch_id"),
        text("first_name"),
        text("last_name"),
        typed("dob", ColumnType::Date),
        typed("age", ColumnType::Integer),
        text("gender"),
        text("email"),
        text("phone"),
        text("address"),
        typed("account_open_date", ColumnType::Date),
        typed("customer_tenure_days", ColumnType::Integer),
        text("customer_segment"),
        typed("outlier_flag", ColumnType::Boolean),
    ],
    foreign_key: None,
    indexed_columns: &["branch_id", "email"],
    outlier_column: Some("age"),
};

pub static LOANS: EntitySchema = EntitySchema {
    entity: Entity::Loan,
    primary_key: "loan_id",
    source_columns: &[
        "loan_id",
        "customer_id",
        "loan_type",
        "loan_amount",
        "interest_rate",
        "start_date",
        "end_date",
        "loan_status",
    ],
    date_columns: &["start_date", "end_date"],
    columns: &[
        text("loan_id"),
        text("customer_id"),
        text("loan_type"),
        typed("loan_amount", ColumnType::Decimal),
        typed("interest_rate", ColumnType::Decimal),
        typed("start_date", ColumnType::Date),
        typed("end_date", ColumnType::Date),
        text("loan_status"),
        typed("loan_duration_months", ColumnType::Integer),
        text("risk_category"),
        typed("outlier_flag", ColumnType::Boolean),
    ],
    foreign_key: Some(ForeignKey {
        column: "customer_id",
        parent: Entity::Customer,
    }),
    indexed_columns: &["customer_id", "loan_status"],
    outlier_column: Some("loan_amount"),
};

pub static TRANSACTIONS: EntitySchema = EntitySchema {
    entity: Entity::Transaction,
    primary_key: "transaction_id",
    source_columns: &[
        "transaction_id",
        "customer_id",
        "transaction_date",
        "transaction_type",
        "amount",
        "balance_after",
        "fraud_flag",
    ],
    date_columns: &["transaction_date"],
    columns: &[
        text("transaction_id"),
        text("customer_id"),
        typed("transaction_date", ColumnType::Date),
        text("transaction_type"),
        typed("amount", ColumnType::Decimal),
        typed("balance_after", ColumnType::Decimal),
        typed("fraud_flag", ColumnType::Boolean),
        text("transaction_category"),
        typed("outlier_flag", ColumnType::Boolean),
    ],
    foreign_key: Some(ForeignKey {
        column: "customer_id",
        parent: Entity::Customer,
    }),
    indexed_columns: &["customer_id", "transaction_date"],
    outlier_column: Some("amount"),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_key_leads_every_layout() {
        for entity in Entity::LOAD_ORDER {
            let schema = entity.schema();
            assert_eq!(schema.entity, entity);
            assert_eq!(schema.source_columns[0], schema.primary_key);
            assert_eq!(schema.columns[0].name, schema.primary_key);
            for date in schema.date_columns {
                assert_eq!(schema.column(date).map(|c| c.ty), Some(ColumnType::Date));
            }
        }
    }

    #[test]
    fn parents_precede_children_in_load_order() {
        for (idx, entity) in Entity::LOAD_ORDER.iter().enumerate() {
            if let Some(fk) = entity.schema().foreign_key {
                let parent_idx = Entity::LOAD_ORDER
                    .iter()
                    .position(|e| *e == fk.parent)
                    .expect("parent listed");
                assert!(parent_idx < idx);
                assert!(fk.parent.schema().column(fk.column).is_some());
            }
        }
        assert_eq!(Entity::Customer.children(), vec![Entity::Loan, Entity::Transaction]);
        assert!(Entity::Branch.children().is_empty());
    }

    #[test]
    fn entity_names_round_trip_through_from_str() {
        assert_eq!("Loans".parse::<Entity>(), Ok(Entity::Loan));
        assert_eq!(Entity::Transaction.transformed_table(), "transformed_transactions");
        assert!("accounts".parse::<Entity>().is_err());
    }
}
