//! Data-quality validation over the persisted revision dataset.
//!
//! An independent pass, separate from the merge engine: it reloads
//! the persisted file and re-derives what it can. Findings are scored
//! 0-100 with fixed deductions; a mismatch is a listed issue and a
//! deduction, never an abort, so a degraded dataset still flows to
//! the dashboard.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use tracing::info;

use crate::dataset::{DatasetError, Magnitude, ObservationRow, RevisionDataset, StoredDataset};

/// Columns every persisted dataset must carry.
pub const REQUIRED_COLUMNS: &[&str] =
    &["date", "release1", "final", "se", "ci90_lower", "ci90_upper"];

/// Floating tolerance when re-deriving stored revision columns.
const RECOMPUTE_TOLERANCE: f64 = 0.01;

/// A column with more missing data than this percentage is flagged.
const HIGH_MISSING_PCT: f64 = 50.0;

/// Employment levels outside this band (thousands of persons) are
/// implausible for the US nonfarm series.
const REASONABLE_LEVEL_MIN: f64 = 100_000.0;
const REASONABLE_LEVEL_MAX: f64 = 200_000.0;

/// A revision larger than this (thousands, so one million persons) is
/// counted as extreme in the value profile.
const EXTREME_REVISION: f64 = 1_000.0;

/// Cap on the total deduction for high-missing columns.
const MAX_MISSING_DEDUCTION: i32 = 30;

/// Quality check errors
#[derive(Debug, thiserror::Error)]
pub enum QualityError {
    #[error("data file not found: {0}")]
    FileNotFound(PathBuf),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct StructureCheck {
    pub total_records: usize,
    pub total_columns: usize,
    pub column_names: Vec<String>,
    pub missing_required_columns: Vec<String>,
    pub has_all_required_columns: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnMissing {
    pub missing_count: usize,
    pub missing_percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MissingDataCheck {
    pub by_column: BTreeMap<String, ColumnMissing>,
    pub high_missing_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DateCheck {
    pub start: String,
    pub end: String,
    pub unique_dates: usize,
    pub duplicate_dates: usize,
    /// Gaps between consecutive periods outside 28-31 days.
    pub irregular_gaps: usize,
}

/// Value profile for one numeric column. Employment-level columns get
/// the sign counts and the plausibility flag; revision columns get the
/// extreme-revision count instead.
#[derive(Debug, Clone, Serialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: Option<f64>,
    pub outliers_iqr: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_values: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zero_values: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasonable_range: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extreme_revisions: Option<usize>,
}

/// Per-calendar-month statistics for an employment series.
#[derive(Debug, Clone, Serialize)]
pub struct SeasonalPattern {
    pub monthly_means: BTreeMap<u32, f64>,
    pub monthly_stds: BTreeMap<u32, Option<f64>>,
    pub monthly_counts: BTreeMap<u32, usize>,
    /// Std of the monthly means over their mean; null with fewer than
    /// two months of data.
    pub seasonal_variation_coeff: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevisionConsistency {
    pub column: String,
    pub inconsistent_count: usize,
    pub max_difference: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverallScore {
    pub score: i32,
    pub grade: String,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub checked_at: String,
    pub data_file: String,
    pub structure: StructureCheck,
    pub missing_data: MissingDataCheck,
    pub dates: DateCheck,
    pub value_ranges: BTreeMap<String, ValueRange>,
    pub revision_consistency: Vec<RevisionConsistency>,
    pub seasonal_patterns: BTreeMap<String, SeasonalPattern>,
    pub overall: OverallScore,
}

/// Validates a persisted dataset file and produces a scored report.
pub struct QualityChecker {
    data_file: PathBuf,
}

impl QualityChecker {
    pub fn new(data_file: impl Into<PathBuf>) -> Self {
        Self {
            data_file: data_file.into(),
        }
    }

    /// Run every check and compile the report.
    pub fn run(&self) -> Result<QualityReport, QualityError> {
        if !self.data_file.exists() {
            return Err(QualityError::FileNotFound(self.data_file.clone()));
        }
        let stored = RevisionDataset::load(&self.data_file)?;
        info!(
            path = %self.data_file.display(),
            records = stored.dataset.rows.len(),
            "Loaded dataset for quality check"
        );

        let structure = check_structure(&stored);
        let missing_data = check_missing_data(&stored);
        let dates = check_dates(&stored.dataset.rows);
        let value_ranges = check_value_ranges(&stored);
        let revision_consistency = check_revision_consistency(&stored);
        let seasonal_patterns = check_seasonal_patterns(&stored);
        let overall = score(&structure, &missing_data, &dates, &revision_consistency);

        Ok(QualityReport {
            checked_at: chrono::Utc::now().to_rfc3339(),
            data_file: self.data_file.display().to_string(),
            structure,
            missing_data,
            dates,
            value_ranges,
            revision_consistency,
            seasonal_patterns,
            overall,
        })
    }

    /// Write the report as JSON, via temp file and rename.
    pub fn save_report(report: &QualityReport, path: &Path) -> Result<(), QualityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, path)?;
        info!(path = %path.display(), "Saved quality report");
        Ok(())
    }
}

fn check_structure(stored: &StoredDataset) -> StructureCheck {
    let missing_required: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|required| !stored.columns.iter().any(|c| c == *required))
        .map(|c| c.to_string())
        .collect();

    StructureCheck {
        total_records: stored.dataset.rows.len(),
        total_columns: stored.columns.len(),
        column_names: stored.columns.clone(),
        has_all_required_columns: missing_required.is_empty(),
        missing_required_columns: missing_required,
    }
}

fn check_missing_data(stored: &StoredDataset) -> MissingDataCheck {
    let rows = &stored.dataset.rows;
    let total = rows.len();
    let mut by_column = BTreeMap::new();

    for column in &stored.columns {
        let missing = match column.as_str() {
            // Never null by construction.
            "date" | "is_outlier" => 0,
            // Non-nullable in self-produced files, but a foreign CSV
            // with empty cells loads them as zero; the published
            // standard error is never zero.
            "se" => rows.iter().filter(|r| r.se == 0.0).count(),
            "revision_direction_consistent" => rows
                .iter()
                .filter(|r| r.revision_direction_consistent.is_none())
                .count(),
            "revision_magnitude" => rows
                .iter()
                .filter(|r| r.revision_magnitude == Magnitude::Unknown)
                .count(),
            name => rows
                .iter()
                .filter(|r| r.f64_column(name).flatten().is_none())
                .count(),
        };
        let pct = if total == 0 {
            0.0
        } else {
            missing as f64 * 100.0 / total as f64
        };
        by_column.insert(
            column.clone(),
            ColumnMissing {
                missing_count: missing,
                missing_percentage: pct,
            },
        );
    }

    let high_missing_columns: Vec<String> = by_column
        .iter()
        .filter(|(_, m)| m.missing_percentage > HIGH_MISSING_PCT)
        .map(|(c, _)| c.clone())
        .collect();

    MissingDataCheck {
        by_column,
        high_missing_columns,
    }
}

fn check_dates(rows: &[ObservationRow]) -> DateCheck {
    let mut dates: Vec<NaiveDate> = rows.iter().map(|r| r.date).collect();
    dates.sort();

    let unique = {
        let mut deduped = dates.clone();
        deduped.dedup();
        deduped.len()
    };
    let duplicates = dates.len() - unique;

    let mut irregular_gaps = 0;
    for pair in dates.windows(2) {
        let gap = (pair[1] - pair[0]).num_days();
        if gap != 0 && !(28..=31).contains(&gap) {
            irregular_gaps += 1;
        }
    }

    DateCheck {
        start: dates
            .first()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        end: dates
            .last()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        unique_dates: unique,
        duplicate_dates: duplicates,
        irregular_gaps,
    }
}

/// Profile each numeric column: spread, IQR outliers, and either
/// level-plausibility (employment columns) or extreme-revision counts
/// (revision columns, rolling statistics included).
fn check_value_ranges(stored: &StoredDataset) -> BTreeMap<String, ValueRange> {
    let rows = &stored.dataset.rows;
    let mut ranges = BTreeMap::new();

    for column in &stored.columns {
        let is_level = matches!(
            column.as_str(),
            "release1" | "release2" | "release3" | "final"
        );
        let is_revision = column.starts_with("rev_");
        if !is_level && !is_revision {
            continue;
        }

        let mut values: Vec<f64> = rows
            .iter()
            .filter_map(|r| r.f64_column(column).flatten())
            .collect();
        if values.is_empty() {
            continue;
        }
        values.sort_by(|a, b| a.total_cmp(b));

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let std = (values.len() > 1).then(|| {
            (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        });

        ranges.insert(
            column.clone(),
            ValueRange {
                min: values[0],
                max: values[values.len() - 1],
                mean,
                std,
                outliers_iqr: count_iqr_outliers(&values),
                negative_values: is_level
                    .then(|| values.iter().filter(|v| **v < 0.0).count()),
                zero_values: is_level.then(|| values.iter().filter(|v| **v == 0.0).count()),
                reasonable_range: is_level.then(|| {
                    values[0] >= REASONABLE_LEVEL_MIN
                        && values[values.len() - 1] <= REASONABLE_LEVEL_MAX
                }),
                extreme_revisions: is_revision
                    .then(|| values.iter().filter(|v| v.abs() > EXTREME_REVISION).count()),
            },
        );
    }
    ranges
}

/// Group the employment levels by calendar month and measure how much
/// the monthly means spread; a near-zero coefficient suggests the
/// series is already seasonally adjusted.
fn check_seasonal_patterns(stored: &StoredDataset) -> BTreeMap<String, SeasonalPattern> {
    let rows = &stored.dataset.rows;
    let mut patterns = BTreeMap::new();

    for column in ["release1", "final"] {
        if !stored.columns.iter().any(|c| c == column) {
            continue;
        }

        let mut by_month: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
        for row in rows {
            if let Some(value) = row.f64_column(column).flatten() {
                by_month.entry(row.date.month()).or_default().push(value);
            }
        }
        if by_month.is_empty() {
            continue;
        }

        let mut monthly_means = BTreeMap::new();
        let mut monthly_stds = BTreeMap::new();
        let mut monthly_counts = BTreeMap::new();
        for (month, values) in &by_month {
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let std = (values.len() > 1).then(|| {
                (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
            });
            monthly_means.insert(*month, mean);
            monthly_stds.insert(*month, std);
            monthly_counts.insert(*month, values.len());
        }

        let means: Vec<f64> = monthly_means.values().copied().collect();
        let seasonal_variation_coeff = (means.len() > 1).then(|| {
            let grand = means.iter().sum::<f64>() / means.len() as f64;
            let var = means.iter().map(|m| (m - grand).powi(2)).sum::<f64>()
                / (means.len() - 1) as f64;
            var.sqrt() / grand
        });

        patterns.insert(
            column.to_string(),
            SeasonalPattern {
                monthly_means,
                monthly_stds,
                monthly_counts,
                seasonal_variation_coeff,
            },
        );
    }
    patterns
}

/// Linear-interpolated quantile over a sorted slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let idx = q * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (idx - lo as f64)
}

/// Tukey's rule: values beyond 1.5 IQR of the quartiles.
fn count_iqr_outliers(sorted: &[f64]) -> usize {
    let q1 = quantile(sorted, 0.25);
    let q3 = quantile(sorted, 0.75);
    let iqr = q3 - q1;
    let lower = q1 - 1.5 * iqr;
    let upper = q3 + 1.5 * iqr;
    sorted.iter().filter(|v| **v < lower || **v > upper).count()
}

/// Re-derive each stored revision column from its operand releases
/// and compare, within tolerance. Rows where either side is null are
/// skipped; null-propagation is the merge engine's contract, not a
/// recomputation mismatch.
fn check_revision_consistency(stored: &StoredDataset) -> Vec<RevisionConsistency> {
    type Recompute = fn(&ObservationRow) -> Option<f64>;
    let checks: &[(&str, Recompute)] = &[
        ("rev_2to1", |r| diff(r.release2, r.release1)),
        ("rev_3to2", |r| diff(r.release3, r.release2)),
        ("rev_3to1", |r| diff(r.release3, r.release1)),
        ("rev_final", |r| diff(r.final_value, r.release1)),
        ("rev_final_to3", |r| diff(r.final_value, r.release3)),
    ];

    let mut results = Vec::new();
    for (column, recompute) in checks {
        if !stored.columns.iter().any(|c| c == column) {
            continue;
        }
        let mut inconsistent = 0;
        let mut max_difference = 0.0f64;
        for row in &stored.dataset.rows {
            let stored_value = row.f64_column(column).flatten();
            let (Some(stored_value), Some(expected)) = (stored_value, recompute(row)) else {
                continue;
            };
            let difference = (stored_value - expected).abs();
            max_difference = max_difference.max(difference);
            if difference > RECOMPUTE_TOLERANCE {
                inconsistent += 1;
            }
        }
        results.push(RevisionConsistency {
            column: column.to_string(),
            inconsistent_count: inconsistent,
            max_difference,
        });
    }
    results
}

fn diff(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a - b),
        _ => None,
    }
}

fn score(
    structure: &StructureCheck,
    missing: &MissingDataCheck,
    dates: &DateCheck,
    consistency: &[RevisionConsistency],
) -> OverallScore {
    let mut score = 100;
    let mut issues = Vec::new();

    if !structure.has_all_required_columns {
        score -= 20;
        issues.push(format!(
            "Missing required columns: {}",
            structure.missing_required_columns.join(", ")
        ));
    }

    let high_missing = missing.high_missing_columns.len() as i32;
    if high_missing > 0 {
        score -= (high_missing * 10).min(MAX_MISSING_DEDUCTION);
        issues.push(format!(
            "{high_missing} columns with >{HIGH_MISSING_PCT}% missing data"
        ));
    }

    if dates.duplicate_dates > 0 {
        score -= 10;
        issues.push(format!("{} duplicate period keys", dates.duplicate_dates));
    }

    for check in consistency {
        if check.inconsistent_count > 0 {
            score -= 5;
            issues.push(format!(
                "Revision recomputation mismatch in {} ({} rows, max diff {:.3})",
                check.column, check.inconsistent_count, check.max_difference
            ));
        }
    }

    let score = score.max(0);
    let grade = match score {
        90..=100 => "A",
        80..=89 => "B",
        70..=79 => "C",
        60..=69 => "D",
        _ => "F",
    };
    OverallScore {
        score,
        grade: grade.to_string(),
        issues,
    }
}

/// Print a human-oriented summary of the report to stdout.
pub fn print_summary(report: &QualityReport) {
    println!("\n=== Data Quality Check Summary ===");
    println!(
        "Overall score: {}/100 (grade {})",
        report.overall.score, report.overall.grade
    );
    println!("Records: {}", report.structure.total_records);
    println!("Columns: {}", report.structure.total_columns);
    println!("Date range: {} to {}", report.dates.start, report.dates.end);
    println!("Duplicate periods: {}", report.dates.duplicate_dates);
    println!(
        "High-missing columns: {}",
        report.missing_data.high_missing_columns.len()
    );

    if report.overall.issues.is_empty() {
        println!("\nNo significant issues found.");
    } else {
        println!("\nIssues found:");
        for issue in &report.overall.issues {
            println!("  - {issue}");
        }
    }
}
