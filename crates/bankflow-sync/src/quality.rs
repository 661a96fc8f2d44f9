//! End-to-end run quality: how much of what was extracted reached production.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use bankflow_core::Entity;
use serde::Serialize;
use tracing::{info, warn};

use crate::extract::ExtractReport;
use crate::load::LoadReport;
use crate::normalize::TransformReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Excellent,
    Good,
    Fair,
    Poor,
    /// Nothing new was extracted.
    UpToDate,
}

impl Grade {
    pub fn for_accuracy(accuracy_pct: f64) -> Self {
        if accuracy_pct >= 99.0 {
            Grade::Excellent
        } else if accuracy_pct >= 95.0 {
            Grade::Good
        } else if accuracy_pct >= 80.0 {
            Grade::Fair
        } else {
            Grade::Poor
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Grade::Excellent => "Excellent",
            Grade::Good => "Good",
            Grade::Fair => "Fair",
            Grade::Poor => "Poor",
            Grade::UpToDate => "Up to date, no new data",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityFlow {
    pub read: u64,
    pub extracted: u64,
    pub transformed: u64,
    pub loaded: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunQuality {
    /// Rows read from source files.
    pub read: u64,
    /// Rows newly staged this run.
    pub extracted: u64,
    pub transformed: u64,
    pub loaded: u64,
    /// `loaded / extracted`; absent when nothing was extracted. May exceed 100 when a backlog drains.
    pub accuracy_pct: Option<f64>,
    pub grade: Grade,
    pub data_loss_rows: u64,
    pub data_loss_pct: f64,
    pub entities: BTreeMap<Entity, EntityFlow>,
}

impl Default for RunQuality {
    fn default() -> Self {
        QualityTracker::default().finish()
    }
}

/// Accumulates stage counts as they become available; a failed run still reports what it reached.
#[derive(Debug, Clone, Default)]
pub struct QualityTracker {
    entities: BTreeMap<Entity, EntityFlow>,
}

impl QualityTracker {
    pub fn record_extract(&mut self, report: &ExtractReport) {
        for (entity, extract) in &report.entities {
            let flow = self.entities.entry(*entity).or_default();
            flow.read = extract.source_rows;
            flow.extracted = extract.new_rows;
        }
    }

    pub fn record_transform(&mut self, report: &TransformReport) {
        for (entity, quality) in &report.entities {
            self.entities.entry(*entity).or_default().transformed = quality.transformed;
        }
    }

    pub fn record_load(&mut self, report: &LoadReport) {
        for (entity, load) in &report.entities {
            self.entities.entry(*entity).or_default().loaded = load.inserted;
        }
    }

    pub fn finish(self) -> RunQuality {
        let sum = |f: fn(&EntityFlow) -> u64| self.entities.values().map(f).sum::<u64>();
        let read = sum(|e| e.read);
        let extracted = sum(|e| e.extracted);
        let transformed = sum(|e| e.transformed);
        let loaded = sum(|e| e.loaded);

        let (accuracy_pct, grade) = if extracted == 0 {
            (None, Grade::UpToDate)
        } else {
            let accuracy = loaded as f64 / extracted as f64 * 100.0;
            (Some(accuracy), Grade::for_accuracy(accuracy))
        };
        let data_loss_rows = extracted.saturating_sub(loaded);
        let data_loss_pct = if extracted == 0 {
            0.0
        } else {
            data_loss_rows as f64 / extracted as f64 * 100.0
        };

        RunQuality {
            read,
            extracted,
            transformed,
            loaded,
            accuracy_pct,
            grade,
            data_loss_rows,
            data_loss_pct,
            entities: self.entities,
        }
    }
}

impl RunQuality {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Rows read from source: {}", self.read);
        let _ = writeln!(out, "Rows newly staged:     {}", self.extracted);
        let _ = writeln!(out, "Rows transformed:      {}", self.transformed);
        let _ = writeln!(out, "Rows loaded:           {}", self.loaded);
        match self.accuracy_pct {
            Some(accuracy) => {
                let _ = writeln!(out, "Accuracy: {accuracy:.2}% ({})", self.grade.label());
                let _ = writeln!(
                    out,
                    "Data loss: {} rows ({:.2}%)",
                    self.data_loss_rows, self.data_loss_pct
                );
            }
            None => {
                let _ = writeln!(out, "Status: {}", self.grade.label());
            }
        }
        for (entity, flow) in &self.entities {
            let _ = writeln!(
                out,
                "  {entity}: read={} staged={} transformed={} loaded={}",
                flow.read, flow.extracted, flow.transformed, flow.loaded
            );
        }
        out
    }

    /// One machine-parseable line on the `bankflow::quality` target.
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(json) => info!(target: "bankflow::quality", report = %json, "run quality"),
            Err(err) => warn!(error = %err, "serializing quality report"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::EntityExtract;
    use crate::load::EntityLoad;

    fn tracker(read: u64, extracted: u64, loaded: u64) -> QualityTracker {
        let mut extract = ExtractReport::default();
        extract.entities.insert(
            Entity::Customer,
            EntityExtract {
                source_rows: read,
                new_rows: extracted,
                ..EntityExtract::default()
            },
        );
        let mut load = LoadReport::default();
        load.entities.insert(
            Entity::Customer,
            EntityLoad {
                inserted: loaded,
                ..EntityLoad::default()
            },
        );
        let mut tracker = QualityTracker::default();
        tracker.record_extract(&extract);
        tracker.record_load(&load);
        tracker
    }

    #[test]
    fn grades_follow_accuracy_thresholds() {
        assert_eq!(Grade::for_accuracy(100.0), Grade::Excellent);
        assert_eq!(Grade::for_accuracy(99.0), Grade::Excellent);
        assert_eq!(Grade::for_accuracy(97.5), Grade::Good);
        assert_eq!(Grade::for_accuracy(80.0), Grade::Fair);
        assert_eq!(Grade::for_accuracy(79.9), Grade::Poor);
    }

    #[test]
    fn data_loss_is_measured_against_newly_staged_rows() {
        let quality = tracker(120, 100, 90).finish();
        assert_eq!(quality.accuracy_pct, Some(90.0));
        assert_eq!(quality.grade, Grade::Fair);
        assert_eq!(quality.data_loss_rows, 10);
        assert!((quality.data_loss_pct - 10.0).abs() < 1e-9);
        assert!(quality.render().contains("Accuracy: 90.00% (Fair)"));
    }

    #[test]
    fn nothing_extracted_is_up_to_date() {
        let quality = tracker(50, 0, 0).finish();
        assert_eq!(quality.accuracy_pct, None);
        assert_eq!(quality.grade, Grade::UpToDate);
        assert_eq!(quality.data_loss_rows, 0);
        assert!(quality.render().contains("Up to date"));
    }

    #[test]
    fn backlog_can_push_accuracy_above_one_hundred() {
        let quality = tracker(10, 10, 15).finish();
        assert_eq!(quality.accuracy_pct, Some(150.0));
        assert_eq!(quality.grade, Grade::Excellent);
        assert_eq!(quality.data_loss_rows, 0);
    }
}
