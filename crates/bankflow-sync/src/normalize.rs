//! Normalizer: staging rows to cleaned, typed, referentially valid transformed rows.

use std::collections::{BTreeMap, HashSet};

use anyhow::{Context, Result};
use bankflow_core::{Entity, StagingRow, TransformedRow, Value};
use bankflow_storage::{StagingStore, TransformedStore};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, error, info, info_span, Instrument};

use crate::config::{PipelineConfig, RegionRules};
use crate::rules::{self, clean_text, text_case};

/// Outcome of normalizing one staging row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowVerdict {
    Keep(TransformedRow),
    /// Foreign key not present among the parent's transformed keys.
    Orphan,
    /// Fails a business-validity rule.
    Invalid(&'static str),
}

/// Pure per-row rules. Holds no store handles.
pub struct RowNormalizer<'a> {
    today: NaiveDate,
    regions: &'a RegionRules,
}

impl<'a> RowNormalizer<'a> {
    pub fn new(today: NaiveDate, regions: &'a RegionRules) -> Self {
        Self { today, regions }
    }

    pub fn normalize(&self, row: &StagingRow, parents: Option<&HashSet<String>>) -> RowVerdict {
        if let (Some(fk), Some(parents)) = (row.entity.schema().foreign_key, parents) {
            let parent_key = clean_text(row.field(fk.column), text_case(fk.column));
            if !parents.contains(&parent_key) {
                return RowVerdict::Orphan;
            }
        }
        match row.entity {
            Entity::Branch => self.branch(row),
            Entity::Customer => self.customer(row),
            Entity::Loan => self.loan(row),
            Entity::Transaction => self.transaction(row),
        }
    }

    fn text(&self, row: &StagingRow, column: &str) -> Value {
        Value::Text(clean_text(row.field(column), text_case(column)))
    }

    fn date(&self, row: &StagingRow, column: &str) -> Option<NaiveDate> {
        rules::parse_date(row.field(column), self.today)
    }

    fn branch(&self, row: &StagingRow) -> RowVerdict {
        let state = clean_text(row.field("state"), text_case("state"));
        let region = self.regions.infer(&state);
        RowVerdict::Keep(TransformedRow::new(
            Entity::Branch,
            vec![
                self.text(row, "branch_id"),
                self.text(row, "branch_name"),
                self.text(row, "city"),
                Value::Text(state),
                self.text(row, "manager_name"),
                Value::Text(region),
            ],
        ))
    }

    fn customer(&self, row: &StagingRow) -> RowVerdict {
        let dob = self.date(row, "dob");
        let opened = self.date(row, "account_open_date");
        let tenure = rules::tenure_days(opened, self.today);
        RowVerdict::Keep(TransformedRow::new(
            Entity::Customer,
            vec![
                self.text(row, "customer_id"),
                self.text(row, "branch_id"),
                self.text(row, "first_name"),
                self.text(row, "last_name"),
                dob.map(Value::Date).unwrap_or(Value::Null),
                Value::Integer(rules::age_on(dob, self.today)),
                Value::text(rules::normalize_gender(row.field("gender"))),
                self.text(row, "email"),
                self.text(row, "phone"),
                self.text(row, "address"),
                opened.map(Value::Date).unwrap_or(Value::Null),
                Value::Integer(tenure),
                Value::text(rules::customer_segment(tenure)),
                Value::Boolean(false),
            ],
        ))
    }

    fn loan(&self, row: &StagingRow) -> RowVerdict {
        let amount = rules::clean_number(row.field("loan_amount"), 0.0);
        if amount <= 0.0 {
            return RowVerdict::Invalid("non-positive loan_amount");
        }
        let Some(start) = self.date(row, "start_date") else {
            return RowVerdict::Invalid("unparsable start_date");
        };
        let end = self.date(row, "end_date");
        RowVerdict::Keep(TransformedRow::new(
            Entity::Loan,
            vec![
                self.text(row, "loan_id"),
                self.text(row, "customer_id"),
                self.text(row, "loan_type"),
                Value::Decimal(amount),
                Value::Decimal(rules::clean_number(row.field("interest_rate"), 0.0)),
                Value::Date(start),
                end.map(Value::Date).unwrap_or(Value::Null),
                self.text(row, "loan_status"),
                Value::Integer(rules::loan_duration_months(start, end)),
                Value::text(rules::loan_risk_category(amount)),
                Value::Boolean(false),
            ],
        ))
    }

    fn transaction(&self, row: &StagingRow) -> RowVerdict {
        let amount = rules::clean_number(row.field("amount"), 0.0);
        if amount <= 0.0 {
            return RowVerdict::Invalid("non-positive amount");
        }
        let Some(date) = self.date(row, "transaction_date") else {
            return RowVerdict::Invalid("unparsable transaction_date");
        };
        RowVerdict::Keep(TransformedRow::new(
            Entity::Transaction,
            vec![
                self.text(row, "transaction_id"),
                self.text(row, "customer_id"),
                Value::Date(date),
                self.text(row, "transaction_type"),
                Value::Decimal(amount),
                Value::Decimal(rules::clean_number(row.field("balance_after"), 0.0)),
                Value::Boolean(rules::fraud_flag(row.field("fraud_flag"))),
                Value::text(rules::transaction_category(amount)),
                Value::Boolean(false),
            ],
        ))
    }
}

/// Per-entity counts and quality metrics of one normalization pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityQuality {
    pub processed: u64,
    pub transformed: u64,
    pub duplicates: u64,
    pub orphaned: u64,
    pub invalid: u64,
    pub failed_rows: u64,
    pub outliers: u64,
    /// Rows in the transformed table after the pass.
    pub table_rows: u64,
    pub completeness_pct: f64,
    pub duplicate_rate_pct: f64,
    pub outlier_rate_pct: f64,
    pub acceptance_pct: f64,
}

fn pct(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransformReport {
    pub entities: BTreeMap<Entity, EntityQuality>,
}

impl TransformReport {
    pub fn transformed(&self, entity: Entity) -> u64 {
        self.entities.get(&entity).map(|q| q.transformed).unwrap_or(0)
    }

    pub fn total_transformed(&self) -> u64 {
        self.entities.values().map(|q| q.transformed).sum()
    }
}

pub struct Normalizer<'a> {
    config: &'a PipelineConfig,
    staging: &'a StagingStore,
    transformed: &'a TransformedStore,
    rows: RowNormalizer<'a>,
}

impl<'a> Normalizer<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        staging: &'a StagingStore,
        transformed: &'a TransformedStore,
        regions: &'a RegionRules,
        today: NaiveDate,
    ) -> Self {
        Self {
            config,
            staging,
            transformed,
            rows: RowNormalizer::new(today, regions),
        }
    }

    /// Normalizes every entity, parents before children.
    pub async fn transform_all(&self, report: &mut TransformReport) -> Result<()> {
        for entity in Entity::LOAD_ORDER {
            let quality = self
                .transform_entity(entity)
                .instrument(info_span!("transform", entity = %entity))
                .await
                .with_context(|| format!("transforming {entity}"))?;
            report.entities.insert(entity, quality);
        }
        Ok(())
    }

    /// Deletes all transformed rows, children first. Surrogate keys keep increasing afterwards.
    pub async fn clear_all(&self) -> Result<u64> {
        let mut removed = 0;
        for entity in Entity::LOAD_ORDER.into_iter().rev() {
            let rows = self
                .transformed
                .clear(entity)
                .await
                .with_context(|| format!("clearing transformed {entity}"))?;
            info!(entity = %entity, rows, "transformed table cleared");
            removed += rows;
        }
        Ok(removed)
    }

    pub async fn transform_entity(&self, entity: Entity) -> Result<EntityQuality> {
        let schema = entity.schema();
        let parents = match schema.foreign_key {
            Some(fk) => Some(self.transformed.primary_keys(fk.parent).await?),
            None => None,
        };

        let mut quality = EntityQuality::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut pending: Vec<TransformedRow> = Vec::new();
        let mut after_key: Option<String> = None;

        loop {
            let page = self
                .staging
                .fetch_batch(entity, after_key.as_deref(), self.config.read_batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after_key = last.key().map(str::to_string);

            for row in &page {
                quality.processed += 1;
                let Some(key) = row.key() else {
                    quality.invalid += 1;
                    continue;
                };
                if !seen.insert(key.to_string()) {
                    quality.duplicates += 1;
                    continue;
                }
                match self.rows.normalize(row, parents.as_ref()) {
                    RowVerdict::Keep(transformed) => pending.push(transformed),
                    RowVerdict::Orphan => quality.orphaned += 1,
                    RowVerdict::Invalid(reason) => {
                        debug!(key, reason, "row rejected");
                        quality.invalid += 1;
                    }
                }
                if pending.len() >= self.config.batch_size {
                    self.write_batch(entity, &mut pending, &mut quality).await?;
                }
            }
            if after_key.is_none() {
                break;
            }
        }
        self.write_batch(entity, &mut pending, &mut quality).await?;

        if let Some(column) = schema.outlier_column {
            let values = self.transformed.numeric_values(entity, column).await?;
            let bounds = rules::iqr_bounds(&values);
            quality.outliers = self
                .transformed
                .refresh_outlier_flags(entity, column, bounds)
                .await?;
        }

        let (missing, cells) = self.transformed.missing_cells(entity).await?;
        quality.table_rows = self.transformed.count(entity).await?;
        quality.completeness_pct = pct(cells.saturating_sub(missing), cells);
        quality.duplicate_rate_pct = pct(quality.duplicates, quality.processed);
        quality.outlier_rate_pct = pct(quality.outliers, quality.table_rows);
        quality.acceptance_pct = pct(quality.transformed, quality.processed);

        info!(
            processed = quality.processed,
            transformed = quality.transformed,
            orphaned = quality.orphaned,
            invalid = quality.invalid,
            completeness_pct = quality.completeness_pct,
            "entity transformed"
        );
        Ok(quality)
    }

    async fn write_batch(
        &self,
        entity: Entity,
        pending: &mut Vec<TransformedRow>,
        quality: &mut EntityQuality,
    ) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(pending);
        match self.transformed.upsert_batch(entity, &batch).await {
            Ok(()) => quality.transformed += batch.len() as u64,
            Err(err) if err.is_connectivity() => return Err(err.into()),
            Err(err) => {
                error!(rows = batch.len(), error = %err, "transform batch rolled back");
                quality.failed_rows += batch.len() as u64;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).expect("date")
    }

    fn row(entity: Entity, values: &[Option<&str>]) -> StagingRow {
        StagingRow::new(entity, values.iter().map(|v| v.map(str::to_string)).collect())
    }

    #[test]
    fn branch_rows_get_cased_fields_and_region() {
        let regions = RegionRules::default();
        let rules = RowNormalizer::new(today(), &regions);
        let verdict = rules.normalize(
            &row(
                Entity::Branch,
                &[Some("BR01"), Some("main branch"), Some("pune"), Some("Maharashtra"), None],
            ),
            None,
        );
        let RowVerdict::Keep(out) = verdict else {
            panic!("branch kept");
        };
        assert_eq!(out.get("branch_name"), Some(&Value::text("Main Branch")));
        assert_eq!(out.get("state"), Some(&Value::text("MAHARASHTRA")));
        assert_eq!(out.get("manager_name"), Some(&Value::text("NA")));
        assert_eq!(out.get("region"), Some(&Value::text("West")));
    }

    #[test]
    fn customer_rows_derive_age_tenure_and_segment() {
        let regions = RegionRules::default();
        let rules = RowNormalizer::new(today(), &regions);
        let verdict = rules.normalize(
            &row(
                Entity::Customer,
                &[
                    Some("C1"),
                    Some("BR01"),
                    Some("asha"),
                    Some("rao"),
                    Some("15/06/1990"),
                    Some("F"),
                    Some("Asha@Example.COM"),
                    Some("98450 00000"),
                    None,
                    Some("2021-01-01"),
                ],
            ),
            None,
        );
        let RowVerdict::Keep(out) = verdict else {
            panic!("customer kept");
        };
        assert_eq!(out.get("age"), Some(&Value::Integer(33)));
        assert_eq!(out.get("gender"), Some(&Value::text("Female")));
        assert_eq!(out.get("email"), Some(&Value::text("asha@example.com")));
        assert_eq!(out.get("address"), Some(&Value::text("NA")));
        assert_eq!(out.get("customer_segment"), Some(&Value::text("VIP")));
        assert_eq!(out.get("outlier_flag"), Some(&Value::Boolean(false)));
    }

    #[test]
    fn child_rows_need_a_known_parent_and_valid_amounts() {
        let regions = RegionRules::default();
        let rules = RowNormalizer::new(today(), &regions);
        let parents: HashSet<String> = ["A".to_string(), "B".to_string()].into_iter().collect();
        let loan = |id: &str, customer: &str, amount: &str, start: &str| {
            row(
                Entity::Loan,
                &[
                    Some(id),
                    Some(customer),
                    Some("home"),
                    Some(amount),
                    Some("8.5"),
                    Some(start),
                    Some("2025-01-01"),
                    Some("active"),
                ],
            )
        };

        assert_eq!(
            rules.normalize(&loan("L1", "C", "1000", "2020-01-01"), Some(&parents)),
            RowVerdict::Orphan
        );
        assert!(matches!(
            rules.normalize(&loan("L2", "A", "-5", "2020-01-01"), Some(&parents)),
            RowVerdict::Invalid(_)
        ));
        assert!(matches!(
            rules.normalize(&loan("L3", "A", "1000", "someday"), Some(&parents)),
            RowVerdict::Invalid(_)
        ));
        let RowVerdict::Keep(out) =
            rules.normalize(&loan("L4", "B", "₹2,50,000", "2020-01-01"), Some(&parents))
        else {
            panic!("loan kept");
        };
        assert_eq!(out.get("risk_category"), Some(&Value::text("Medium")));
        assert_eq!(out.get("loan_duration_months"), Some(&Value::Integer(60)));
        assert_eq!(out.get("loan_status"), Some(&Value::text("Active")));
    }
}
