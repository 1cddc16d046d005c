//! Summary statistics over a merged revision dataset.
//!
//! Produces the `summary_report.json` the dashboard reads alongside
//! the dataset itself.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::dataset::RevisionDataset;

#[derive(Debug, Clone, Serialize)]
pub struct RevisionStats {
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub positive_count: usize,
    pub negative_count: usize,
    pub zero_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryReport {
    pub generated_at: String,
    pub total_records: usize,
    pub date_range_start: String,
    pub date_range_end: String,
    pub missing_by_column: BTreeMap<String, usize>,
    pub final_revision: RevisionStats,
    pub outlier_count: usize,
    pub outlier_percentage: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SummaryReport {
    /// Build the report from an in-memory dataset.
    pub fn build(dataset: &RevisionDataset) -> Self {
        let rows = &dataset.rows;
        let total = rows.len();

        let mut missing_by_column = BTreeMap::new();
        for column in dataset.column_names() {
            let Some(first) = rows.first() else { break };
            if first.f64_column(column).is_none() {
                continue;
            }
            let missing = rows
                .iter()
                .filter(|r| r.f64_column(column).flatten().is_none())
                .count();
            missing_by_column.insert(column.to_string(), missing);
        }

        let rev_final: Vec<f64> = rows.iter().filter_map(|r| r.rev_final).collect();
        let outlier_count = rows.iter().filter(|r| r.is_outlier).count();
        let outlier_percentage = if total == 0 {
            0.0
        } else {
            outlier_count as f64 * 100.0 / total as f64
        };

        SummaryReport {
            generated_at: chrono::Utc::now().to_rfc3339(),
            total_records: total,
            date_range_start: rows
                .first()
                .map(|r| r.date.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            date_range_end: rows
                .last()
                .map(|r| r.date.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            missing_by_column,
            final_revision: revision_stats(&rev_final),
            outlier_count,
            outlier_percentage,
        }
    }

    /// Write the report as JSON, via temp file and rename.
    pub fn save(&self, path: &Path) -> Result<(), SummaryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, path)?;
        info!(path = %path.display(), "Saved summary report");
        Ok(())
    }
}

fn revision_stats(values: &[f64]) -> RevisionStats {
    if values.is_empty() {
        return RevisionStats {
            mean: None,
            median: None,
            std: None,
            min: None,
            max: None,
            positive_count: 0,
            negative_count: 0,
            zero_count: 0,
        };
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let median = if sorted.len() % 2 == 1 {
        sorted[sorted.len() / 2]
    } else {
        (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) / 2.0
    };

    // Sample standard deviation; undefined for a single observation.
    let std = if values.len() > 1 {
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        Some(var.sqrt())
    } else {
        None
    };

    RevisionStats {
        mean: Some(mean),
        median: Some(median),
        std,
        min: sorted.first().copied(),
        max: sorted.last().copied(),
        positive_count: values.iter().filter(|v| **v > 0.0).count(),
        negative_count: values.iter().filter(|v| **v < 0.0).count(),
        zero_count: values.iter().filter(|v| **v == 0.0).count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ObservationRow;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn row(year: i32, month: u32, rev_final: Option<f64>, outlier: bool) -> ObservationRow {
        let mut row = ObservationRow::empty(NaiveDate::from_ymd_opt(year, month, 1).unwrap());
        row.rev_final = rev_final;
        row.is_outlier = outlier;
        row
    }

    fn dataset(rows: Vec<ObservationRow>) -> RevisionDataset {
        RevisionDataset {
            rows,
            has_release2: false,
            has_release3: false,
            release1_is_proxy: true,
        }
    }

    #[test]
    fn stats_over_final_revisions() {
        let ds = dataset(vec![
            row(2020, 1, Some(100.0), false),
            row(2020, 2, Some(-50.0), false),
            row(2020, 3, Some(0.0), true),
            row(2020, 4, None, false),
        ]);
        let report = SummaryReport::build(&ds);

        assert_eq!(report.total_records, 4);
        assert_eq!(report.date_range_start, "2020-01-01");
        assert_eq!(report.date_range_end, "2020-04-01");

        let stats = &report.final_revision;
        assert_eq!(stats.positive_count, 1);
        assert_eq!(stats.negative_count, 1);
        assert_eq!(stats.zero_count, 1);
        assert_eq!(stats.median, Some(0.0));
        assert_eq!(stats.min, Some(-50.0));
        assert_eq!(stats.max, Some(100.0));
        assert!((stats.mean.unwrap() - 50.0 / 3.0).abs() < 1e-9);

        assert_eq!(report.outlier_count, 1);
        assert!((report.outlier_percentage - 25.0).abs() < 1e-9);
        assert_eq!(report.missing_by_column["rev_final"], 1);
    }

    #[test]
    fn empty_dataset_yields_null_stats() {
        let report = SummaryReport::build(&dataset(vec![]));
        assert_eq!(report.total_records, 0);
        assert_eq!(report.final_revision.mean, None);
        assert_eq!(report.outlier_percentage, 0.0);
        assert_eq!(report.date_range_start, "");
    }

    #[test]
    fn single_observation_has_no_std() {
        let ds = dataset(vec![row(2020, 1, Some(42.0), false)]);
        let report = SummaryReport::build(&ds);
        assert_eq!(report.final_revision.std, None);
        assert_eq!(report.final_revision.mean, Some(42.0));
        assert_eq!(report.final_revision.median, Some(42.0));
    }

    #[test]
    fn saves_to_json() {
        let tmp = TempDir::new().unwrap();
        let ds = dataset(vec![row(2020, 1, Some(100.0), false)]);
        let report = SummaryReport::build(&ds);

        let path = tmp.path().join("summary_report.json");
        report.save(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"total_records\": 1"));
    }
}
