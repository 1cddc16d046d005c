//! Dated CSV snapshot store for the raw employment series.
//!
//! The store is append-only: each download lands as
//! `PAYEMS_YYYYMMDD.csv` and prior snapshots are never rewritten.
//! The most recent snapshot is the pipeline's "final" series input.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use glob::glob;
use tracing::info;

/// One monthly observation of the raw series, value in thousands of persons.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub value: f64,
}

/// Snapshot store errors
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("glob error: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("bad record in {path}: {context}")]
    BadRecord { path: PathBuf, context: String },

    #[error("no snapshots found in {0}")]
    NoSnapshots(PathBuf),
}

/// Result of diffing a fresh download against the previous snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotDiff {
    /// Store is empty, nothing to compare against.
    NoPrevious,
    /// The two series share no periods.
    NoOverlap,
    Compared(DiffStats),
}

/// Per-period deltas between a download and the previous snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffStats {
    /// Periods present in both series.
    pub common_records: usize,
    /// Periods whose value changed, with the signed delta.
    pub revised: Vec<(NaiveDate, f64)>,
    pub max_abs_change: f64,
}

/// Append-only collection of dated series snapshots on local storage.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a new snapshot as `PAYEMS_<suffix>.csv`.
    ///
    /// Goes through a temp file and rename so a crash mid-write never
    /// leaves a partial snapshot behind.
    pub fn save(&self, series: &[SeriesPoint], suffix: &str) -> Result<PathBuf, SnapshotError> {
        let path = self.dir.join(format!("PAYEMS_{suffix}.csv"));
        let tmp_path = path.with_extension("csv.tmp");

        let mut writer = csv::Writer::from_path(&tmp_path)?;
        writer.write_record(["DATE", "PAYEMS"])?;
        for point in series {
            writer.write_record([
                point.date.format("%Y-%m-%d").to_string(),
                format!("{}", point.value),
            ])?;
        }
        writer.flush()?;
        drop(writer);
        std::fs::rename(&tmp_path, &path)?;

        info!(path = %path.display(), records = series.len(), "Saved snapshot");
        Ok(path)
    }

    /// All snapshot files, sorted by filename (and therefore by date).
    pub fn list(&self) -> Result<Vec<PathBuf>, SnapshotError> {
        let pattern = format!("{}/PAYEMS_*.csv", self.dir.display());
        let mut files = Vec::new();
        for entry in glob(&pattern)? {
            match entry {
                Ok(path) => files.push(path),
                Err(e) => {
                    return Err(SnapshotError::Io(e.into_error()));
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Path of the most recent snapshot, if any.
    pub fn latest(&self) -> Result<Option<PathBuf>, SnapshotError> {
        Ok(self.list()?.into_iter().next_back())
    }

    /// Load the most recent snapshot.
    ///
    /// The merge stage treats an empty store as a fatal precondition
    /// failure, so this surfaces `NoSnapshots` rather than an empty vec.
    pub fn load_latest(&self) -> Result<Vec<SeriesPoint>, SnapshotError> {
        let path = self
            .latest()?
            .ok_or_else(|| SnapshotError::NoSnapshots(self.dir.clone()))?;
        info!(path = %path.display(), "Loading latest snapshot");
        load_series_csv(&path)
    }

    /// Diff a fresh download against the most recent stored snapshot.
    pub fn compare_with_previous(
        &self,
        current: &[SeriesPoint],
    ) -> Result<SnapshotDiff, SnapshotError> {
        let Some(previous_path) = self.latest()? else {
            return Ok(SnapshotDiff::NoPrevious);
        };
        let previous = load_series_csv(&previous_path)?;

        let previous_by_date: std::collections::BTreeMap<NaiveDate, f64> =
            previous.iter().map(|p| (p.date, p.value)).collect();

        let mut common = 0usize;
        let mut revised = Vec::new();
        let mut max_abs_change = 0.0f64;
        for point in current {
            let Some(&prev_value) = previous_by_date.get(&point.date) else {
                continue;
            };
            common += 1;
            let delta = point.value - prev_value;
            if delta != 0.0 {
                revised.push((point.date, delta));
                max_abs_change = max_abs_change.max(delta.abs());
            }
        }

        if common == 0 {
            return Ok(SnapshotDiff::NoOverlap);
        }
        Ok(SnapshotDiff::Compared(DiffStats {
            common_records: common,
            revised,
            max_abs_change,
        }))
    }
}

/// Load a `DATE,PAYEMS` CSV into memory.
pub fn load_series_csv(path: &Path) -> Result<Vec<SeriesPoint>, SnapshotError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut series = Vec::new();
    for record in reader.records() {
        let record = record?;
        let date_field = record.get(0).unwrap_or_default();
        let value_field = record.get(1).unwrap_or_default();
        let date = NaiveDate::parse_from_str(date_field, "%Y-%m-%d").map_err(|e| {
            SnapshotError::BadRecord {
                path: path.to_path_buf(),
                context: format!("unparseable date {date_field:?}: {e}"),
            }
        })?;
        let value: f64 = value_field
            .parse()
            .map_err(|e| SnapshotError::BadRecord {
                path: path.to_path_buf(),
                context: format!("unparseable value {value_field:?}: {e}"),
            })?;
        series.push(SeriesPoint { date, value });
    }
    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn point(y: i32, m: u32, value: f64) -> SeriesPoint {
        SeriesPoint {
            date: NaiveDate::from_ymd_opt(y, m, 1).unwrap(),
            value,
        }
    }

    #[test]
    fn save_and_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::open(tmp.path()).unwrap();

        let series = vec![point(2020, 2, 152000.0), point(2020, 3, 130000.0)];
        let path = store.save(&series, "20200401").unwrap();
        assert!(path.ends_with("PAYEMS_20200401.csv"));

        let loaded = store.load_latest().unwrap();
        assert_eq!(loaded, series);
    }

    #[test]
    fn latest_picks_newest_suffix() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::open(tmp.path()).unwrap();

        store.save(&[point(2020, 2, 1.0)], "20200301").unwrap();
        store.save(&[point(2020, 2, 2.0)], "20200401").unwrap();

        let latest = store.latest().unwrap().unwrap();
        assert!(latest.ends_with("PAYEMS_20200401.csv"));
        assert_eq!(store.load_latest().unwrap()[0].value, 2.0);
    }

    #[test]
    fn empty_store_is_a_precondition_failure() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::open(tmp.path()).unwrap();
        assert!(matches!(
            store.load_latest(),
            Err(SnapshotError::NoSnapshots(_))
        ));
    }

    #[test]
    fn compare_reports_revised_periods() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::open(tmp.path()).unwrap();

        store
            .save(&[point(2020, 2, 152000.0), point(2020, 3, 131000.0)], "20200401")
            .unwrap();

        let current = vec![point(2020, 2, 152000.0), point(2020, 3, 130000.0)];
        let diff = store.compare_with_previous(&current).unwrap();
        let SnapshotDiff::Compared(stats) = diff else {
            panic!("expected Compared, got {diff:?}");
        };
        assert_eq!(stats.common_records, 2);
        assert_eq!(stats.revised, vec![(current[1].date, -1000.0)]);
        assert_eq!(stats.max_abs_change, 1000.0);
    }

    #[test]
    fn compare_with_empty_store() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::open(tmp.path()).unwrap();
        let diff = store
            .compare_with_previous(&[point(2020, 2, 1.0)])
            .unwrap();
        assert_eq!(diff, SnapshotDiff::NoPrevious);
    }
}
