//! Revision merge engine.
//!
//! Joins the final (most revised) series with the point-in-time
//! release table and derives every computed column: revision deltas,
//! the published confidence band, outlier flags, direction
//! consistency, magnitude buckets, and trailing rolling statistics.
//!
//! The engine is a pure function of its inputs plus fixed published
//! constants. It performs no I/O and retains no state between runs;
//! every invocation recomputes the full table.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use tracing::{info, warn};

use crate::dataset::{Magnitude, ObservationRow, RevisionDataset};
use crate::releases::ReleaseTable;
use crate::snapshot::SeriesPoint;

/// BLS published standard error for the monthly employment estimate.
pub const STANDARD_ERROR: f64 = 85_000.0;

/// Half-width of the published 90% confidence interval.
pub const CI90_HALF_WIDTH: f64 = 136_000.0;

/// Trailing window length for rolling revision statistics.
pub const ROLLING_WINDOW: usize = 12;

/// Minimum non-null values in the window before a rolling statistic
/// is emitted; earlier periods get null, not zero.
pub const ROLLING_MIN_PERIODS: usize = 6;

/// Merge stage errors
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("final series is empty; at least one observation is required")]
    EmptyFinalSeries,
}

/// The revision merge engine. Constants are injectable for tests but
/// default to the published values.
pub struct MergeEngine {
    standard_error: f64,
    ci90_half_width: f64,
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self {
            standard_error: STANDARD_ERROR,
            ci90_half_width: CI90_HALF_WIDTH,
        }
    }
}

impl MergeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outer-join the final series with the release table on period
    /// and derive all computed columns.
    ///
    /// Rows present on only one side are retained. A missing release
    /// table degrades to `release1 := final` so downstream consumers
    /// never see an entirely empty release set; an empty final series
    /// is a fatal precondition failure.
    pub fn merge(
        &self,
        final_series: &[SeriesPoint],
        releases: Option<&ReleaseTable>,
    ) -> Result<RevisionDataset, MergeError> {
        if final_series.is_empty() {
            return Err(MergeError::EmptyFinalSeries);
        }

        // BTreeMap keys give the period-sorted canonical row order;
        // nothing may re-sort after this point.
        let mut by_date: BTreeMap<NaiveDate, ObservationRow> = BTreeMap::new();
        for point in final_series {
            let row = by_date
                .entry(point.date)
                .or_insert_with(|| ObservationRow::empty(point.date));
            // First-write-wins on duplicate periods.
            if row.final_value.is_none() {
                row.final_value = Some(point.value);
            }
        }

        let has_release2;
        let has_release3;
        let release1_is_proxy;
        match releases {
            Some(table) => {
                has_release2 = table.has_release2;
                has_release3 = table.has_release3;
                release1_is_proxy = false;
                for release in &table.rows {
                    let row = by_date
                        .entry(release.date)
                        .or_insert_with(|| ObservationRow::empty(release.date));
                    row.release1 = release.release1;
                    row.release2 = release.release2;
                    row.release3 = release.release3;
                }
            }
            None => {
                warn!("No release table available; using final values as release1 proxy");
                has_release2 = false;
                has_release3 = false;
                release1_is_proxy = true;
                for row in by_date.values_mut() {
                    row.release1 = row.final_value;
                }
            }
        }

        let mut rows: Vec<ObservationRow> = by_date.into_values().collect();
        for row in &mut rows {
            self.derive_row(row);
        }
        apply_rolling_stats(&mut rows);

        let outliers = rows.iter().filter(|r| r.is_outlier).count();
        info!(records = rows.len(), outliers, "Merged dataset");

        Ok(RevisionDataset {
            rows,
            has_release2,
            has_release3,
            release1_is_proxy,
        })
    }

    /// Derive the per-row columns (everything except rolling stats).
    fn derive_row(&self, row: &mut ObservationRow) {
        row.se = self.standard_error;

        // Revision deltas: null whenever either operand is null.
        row.rev_2to1 = diff(row.release2, row.release1);
        row.rev_3to2 = diff(row.release3, row.release2);
        // Per-period fallback: release3 against release1 only where
        // release2 is missing for that period.
        row.rev_3to1 = if row.release2.is_none() {
            diff(row.release3, row.release1)
        } else {
            None
        };
        row.rev_final = diff(row.final_value, row.release1);
        row.rev_final_to3 = diff(row.final_value, row.release3);

        // Confidence band: symmetric around release1, independent of final.
        row.ci90_lower = row.release1.map(|r| r - self.ci90_half_width);
        row.ci90_upper = row.release1.map(|r| r + self.ci90_half_width);

        // Outlier: window membership OR extreme revision. A null
        // rev_final cannot trigger the threshold predicate.
        let extreme = row
            .rev_final
            .map(|r| r.abs() > 3.0 * self.standard_error)
            .unwrap_or(false);
        row.is_outlier =
            in_crisis_window(row.date) || in_pandemic_window(row.date) || extreme;

        row.revision_direction_consistent = match (row.rev_2to1, row.rev_final) {
            (Some(a), Some(b)) => Some(sign(a) == sign(b)),
            _ => None,
        };
        row.revision_magnitude = Magnitude::from_abs_revision(row.rev_final);
    }
}

/// Financial-crisis outlier window, September 2008 through March 2009.
fn in_crisis_window(date: NaiveDate) -> bool {
    let ym = (date.year(), date.month());
    ((2008, 9)..=(2009, 3)).contains(&ym)
}

/// Pandemic-shock outlier window, March 2020 through June 2020.
fn in_pandemic_window(date: NaiveDate) -> bool {
    let ym = (date.year(), date.month());
    ((2020, 3)..=(2020, 6)).contains(&ym)
}

fn diff(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a - b),
        _ => None,
    }
}

fn sign(v: f64) -> i8 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}

/// Trailing rolling mean/std over each revision column, in row order.
fn apply_rolling_stats(rows: &mut [ObservationRow]) {
    let rev_2to1: Vec<Option<f64>> = rows.iter().map(|r| r.rev_2to1).collect();
    let (mean, std) = rolling_stats(&rev_2to1);
    for (i, row) in rows.iter_mut().enumerate() {
        row.rev_2to1_rolling_mean = mean[i];
        row.rev_2to1_rolling_std = std[i];
    }

    let rev_3to2: Vec<Option<f64>> = rows.iter().map(|r| r.rev_3to2).collect();
    let (mean, std) = rolling_stats(&rev_3to2);
    for (i, row) in rows.iter_mut().enumerate() {
        row.rev_3to2_rolling_mean = mean[i];
        row.rev_3to2_rolling_std = std[i];
    }

    let rev_final: Vec<Option<f64>> = rows.iter().map(|r| r.rev_final).collect();
    let (mean, std) = rolling_stats(&rev_final);
    for (i, row) in rows.iter_mut().enumerate() {
        row.rev_final_rolling_mean = mean[i];
        row.rev_final_rolling_std = std[i];
    }
}

/// Rolling mean and sample standard deviation over a trailing window
/// of `ROLLING_WINDOW` values ending at each index. Indexes with
/// fewer than `ROLLING_MIN_PERIODS` non-null values get null.
fn rolling_stats(values: &[Option<f64>]) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let mut means = Vec::with_capacity(values.len());
    let mut stds = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        let window_start = (i + 1).saturating_sub(ROLLING_WINDOW);
        let window: Vec<f64> = values[window_start..=i].iter().flatten().copied().collect();

        if window.len() < ROLLING_MIN_PERIODS {
            means.push(None);
            stds.push(None);
            continue;
        }

        let n = window.len() as f64;
        let mean = window.iter().sum::<f64>() / n;
        let var = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        means.push(Some(mean));
        stds.push(Some(var.sqrt()));
    }

    (means, stds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::releases::ReleaseRow;

    const TOL: f64 = 0.01;

    fn date(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn point(y: i32, m: u32, value: f64) -> SeriesPoint {
        SeriesPoint { date: date(y, m), value }
    }

    fn release_row(
        y: i32,
        m: u32,
        r1: Option<f64>,
        r2: Option<f64>,
        r3: Option<f64>,
    ) -> ReleaseRow {
        ReleaseRow {
            date: date(y, m),
            release1: r1,
            release2: r2,
            release3: r3,
        }
    }

    fn table(rows: Vec<ReleaseRow>) -> ReleaseTable {
        let has_release2 = rows.iter().any(|r| r.release2.is_some());
        let has_release3 = rows.iter().any(|r| r.release3.is_some());
        ReleaseTable { rows, has_release2, has_release3 }
    }

    fn approx(actual: Option<f64>, expected: f64) -> bool {
        actual.is_some_and(|v| (v - expected).abs() < TOL)
    }

    #[test]
    fn revision_deltas_match_operands() {
        let finals = vec![point(2021, 1, 150100.0)];
        let releases = table(vec![release_row(
            2021,
            1,
            Some(150000.0),
            Some(150040.0),
            Some(150070.0),
        )]);

        let dataset = MergeEngine::new().merge(&finals, Some(&releases)).unwrap();
        let row = &dataset.rows[0];
        assert!(approx(row.rev_2to1, 40.0));
        assert!(approx(row.rev_3to2, 30.0));
        assert_eq!(row.rev_3to1, None);
        assert!(approx(row.rev_final, 100.0));
        assert!(approx(row.rev_final_to3, 30.0));
    }

    #[test]
    fn null_operand_means_null_revision_never_zero() {
        let finals = vec![point(2021, 1, 150100.0)];
        let releases = table(vec![release_row(2021, 1, Some(150000.0), None, None)]);

        let dataset = MergeEngine::new().merge(&finals, Some(&releases)).unwrap();
        let row = &dataset.rows[0];
        assert_eq!(row.rev_2to1, None);
        assert_eq!(row.rev_3to2, None);
        assert_eq!(row.rev_final_to3, None);
        assert!(approx(row.rev_final, 100.0));
    }

    #[test]
    fn rev_3to1_fallback_only_where_release2_missing() {
        let finals = vec![point(2021, 1, 150100.0), point(2021, 2, 150200.0)];
        let releases = table(vec![
            release_row(2021, 1, Some(150000.0), None, Some(150070.0)),
            release_row(2021, 2, Some(150100.0), Some(150150.0), Some(150170.0)),
        ]);

        let dataset = MergeEngine::new().merge(&finals, Some(&releases)).unwrap();
        assert!(approx(dataset.rows[0].rev_3to1, 70.0));
        assert_eq!(dataset.rows[0].rev_3to2, None);
        assert_eq!(dataset.rows[1].rev_3to1, None);
        assert!(approx(dataset.rows[1].rev_3to2, 20.0));
    }

    #[test]
    fn confidence_band_is_symmetric_around_release1() {
        let finals = vec![point(2021, 1, 150100.0)];
        let releases = table(vec![release_row(2021, 1, Some(150000.0), None, None)]);

        let dataset = MergeEngine::new().merge(&finals, Some(&releases)).unwrap();
        let row = &dataset.rows[0];
        assert!(approx(row.ci90_lower, 150000.0 - CI90_HALF_WIDTH));
        assert!(approx(row.ci90_upper, 150000.0 + CI90_HALF_WIDTH));
        assert_eq!(row.se, STANDARD_ERROR);
    }

    #[test]
    fn confidence_band_null_when_release1_null() {
        let finals = vec![point(2021, 1, 150100.0)];
        let releases = table(vec![release_row(2021, 1, None, Some(150040.0), None)]);

        let dataset = MergeEngine::new().merge(&finals, Some(&releases)).unwrap();
        assert_eq!(dataset.rows[0].ci90_lower, None);
        assert_eq!(dataset.rows[0].ci90_upper, None);
    }

    #[test]
    fn outlier_windows_flag_regardless_of_revision_size() {
        let finals = vec![
            point(2008, 8, 1.0),
            point(2008, 9, 1.0),
            point(2009, 3, 1.0),
            point(2009, 4, 1.0),
            point(2020, 2, 1.0),
            point(2020, 3, 1.0),
            point(2020, 6, 1.0),
            point(2020, 7, 1.0),
        ];
        let dataset = MergeEngine::new().merge(&finals, None).unwrap();
        let flags: Vec<bool> = dataset.rows.iter().map(|r| r.is_outlier).collect();
        assert_eq!(flags, vec![false, true, true, false, false, true, true, false]);
    }

    #[test]
    fn extreme_revision_flags_outlier() {
        let finals = vec![point(2021, 1, 400000.0)];
        let releases = table(vec![release_row(2021, 1, Some(100000.0), None, None)]);

        // rev_final = 300000 > 3 * 85000
        let dataset = MergeEngine::new().merge(&finals, Some(&releases)).unwrap();
        assert!(dataset.rows[0].is_outlier);
    }

    #[test]
    fn null_rev_final_cannot_trigger_threshold() {
        let finals = vec![point(2021, 1, 400000.0)];
        let releases = table(vec![release_row(2021, 1, None, Some(100000.0), None)]);

        let dataset = MergeEngine::new().merge(&finals, Some(&releases)).unwrap();
        assert!(!dataset.rows[0].is_outlier);
    }

    #[test]
    fn rolling_stats_respect_min_periods() {
        // 12 consecutive periods with rev_final = 10, 20, ..., 120.
        let finals: Vec<SeriesPoint> = (0..12)
            .map(|i| point(2021, i + 1, 150000.0 + 10.0 * (i + 1) as f64))
            .collect();
        let releases = table(
            (0..12)
                .map(|i| release_row(2021, i + 1, Some(150000.0), None, None))
                .collect(),
        );

        let dataset = MergeEngine::new().merge(&finals, Some(&releases)).unwrap();

        // Fewer than 6 values in the trailing window: null, not zero.
        for i in 0..5 {
            assert_eq!(dataset.rows[i].rev_final_rolling_mean, None, "index {i}");
            assert_eq!(dataset.rows[i].rev_final_rolling_std, None, "index {i}");
        }

        // Index 5 has exactly 6 values: 10..=60, mean 35.
        assert!(approx(dataset.rows[5].rev_final_rolling_mean, 35.0));
        // Sample std of 10,20,...,60.
        let mean = 35.0;
        let var: f64 = (1..=6).map(|v| (10.0 * v as f64 - mean).powi(2)).sum::<f64>() / 5.0;
        assert!(approx(dataset.rows[5].rev_final_rolling_std, var.sqrt()));

        // Index 11 has the full window 10..=120, mean 65.
        assert!(approx(dataset.rows[11].rev_final_rolling_mean, 65.0));
    }

    #[test]
    fn rolling_window_is_trailing_twelve() {
        // 13 periods; at the last index the window must drop the first value.
        let finals: Vec<SeriesPoint> = (0..13)
            .map(|i| {
                let d = date(2021, 1) + chrono::Months::new(i);
                SeriesPoint { date: d, value: 150000.0 + 10.0 * (i + 1) as f64 }
            })
            .collect();
        let releases = table(
            finals
                .iter()
                .map(|p| ReleaseRow {
                    date: p.date,
                    release1: Some(150000.0),
                    release2: None,
                    release3: None,
                })
                .collect(),
        );

        let dataset = MergeEngine::new().merge(&finals, Some(&releases)).unwrap();
        // Window at index 12 covers rev_final 20..=130, mean 75.
        assert!(approx(dataset.rows[12].rev_final_rolling_mean, 75.0));
    }

    #[test]
    fn rolling_counts_only_non_null_values() {
        // 12 periods but only 5 have a computable rev_final.
        let finals: Vec<SeriesPoint> =
            (0..12).map(|i| point(2021, i + 1, 150000.0)).collect();
        let releases = table(
            (0..12)
                .map(|i| {
                    let r1 = if i < 5 { Some(149000.0) } else { None };
                    release_row(2021, i + 1, r1, None, None)
                })
                .collect(),
        );

        let dataset = MergeEngine::new().merge(&finals, Some(&releases)).unwrap();
        assert_eq!(dataset.rows[11].rev_final_rolling_mean, None);
    }

    #[test]
    fn outer_join_retains_one_sided_periods() {
        let finals = vec![point(2021, 1, 150100.0), point(2021, 3, 150300.0)];
        let releases = table(vec![
            release_row(2021, 2, Some(150150.0), None, None),
            release_row(2021, 3, Some(150250.0), None, None),
        ]);

        let dataset = MergeEngine::new().merge(&finals, Some(&releases)).unwrap();
        let dates: Vec<NaiveDate> = dataset.rows.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![date(2021, 1), date(2021, 2), date(2021, 3)]);

        // Final-only period: releases null.
        assert_eq!(dataset.rows[0].release1, None);
        assert!(approx(dataset.rows[0].final_value, 150100.0));
        // Release-only period: final null, no rev_final.
        assert_eq!(dataset.rows[1].final_value, None);
        assert_eq!(dataset.rows[1].rev_final, None);
        assert!(approx(dataset.rows[1].ci90_lower, 150150.0 - CI90_HALF_WIDTH));
    }

    #[test]
    fn duplicate_final_periods_first_write_wins() {
        let finals = vec![point(2021, 1, 150100.0), point(2021, 1, 999.0)];
        let dataset = MergeEngine::new().merge(&finals, None).unwrap();
        assert_eq!(dataset.rows.len(), 1);
        assert!(approx(dataset.rows[0].final_value, 150100.0));
    }

    #[test]
    fn direction_consistency_null_when_operand_null() {
        let finals = vec![point(2021, 1, 150100.0), point(2021, 2, 150100.0)];
        let releases = table(vec![
            release_row(2021, 1, Some(150000.0), Some(150050.0), None),
            release_row(2021, 2, Some(150000.0), None, None),
        ]);

        let dataset = MergeEngine::new().merge(&finals, Some(&releases)).unwrap();
        assert_eq!(dataset.rows[0].revision_direction_consistent, Some(true));
        assert_eq!(dataset.rows[1].revision_direction_consistent, None);
    }

    #[test]
    fn pandemic_scenario() {
        // Scenario from the analysis plan: final and first-release
        // values around the 2020 shock.
        let finals = vec![
            point(2020, 2, 152000.0),
            point(2020, 3, 130000.0),
            point(2020, 4, 128000.0),
        ];
        let releases = table(vec![
            release_row(2020, 2, Some(151900.0), None, None),
            release_row(2020, 3, Some(131000.0), None, None),
            release_row(2020, 4, Some(127500.0), None, None),
        ]);

        let dataset = MergeEngine::new().merge(&finals, Some(&releases)).unwrap();
        let march = &dataset.rows[1];
        assert!(approx(march.rev_final, -1000.0));
        assert!(march.is_outlier);
        assert!(approx(march.ci90_lower, -5000.0));
        assert!(approx(march.ci90_upper, 267000.0));
        assert!(!dataset.rows[0].is_outlier);
        assert!(dataset.rows[2].is_outlier);
    }

    #[test]
    fn absent_release_table_uses_final_as_proxy() {
        let finals = vec![point(2021, 1, 150100.0), point(2021, 2, 150200.0)];
        let dataset = MergeEngine::new().merge(&finals, None).unwrap();

        assert!(dataset.release1_is_proxy);
        assert!(!dataset.has_release2);
        assert!(!dataset.has_release3);
        for row in &dataset.rows {
            assert_eq!(row.release1, row.final_value);
            assert_eq!(row.release2, None);
            assert_eq!(row.release3, None);
            // Proxy release1 equals final, so rev_final is exactly zero.
            assert!(approx(row.rev_final, 0.0));
        }
        let columns = dataset.column_names();
        assert!(!columns.contains(&"release2"));
        assert!(!columns.contains(&"release3"));
    }

    #[test]
    fn merge_is_idempotent_on_identical_inputs() {
        let finals = vec![
            point(2020, 2, 152000.0),
            point(2020, 3, 130000.0),
            point(2020, 4, 128000.0),
        ];
        let releases = table(vec![
            release_row(2020, 2, Some(151900.0), Some(151950.0), None),
            release_row(2020, 3, Some(131000.0), None, None),
        ]);

        let engine = MergeEngine::new();
        let first = engine.merge(&finals, Some(&releases)).unwrap();
        let second = engine.merge(&finals, Some(&releases)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_final_series_is_fatal() {
        assert!(matches!(
            MergeEngine::new().merge(&[], None),
            Err(MergeError::EmptyFinalSeries)
        ));
    }
}
