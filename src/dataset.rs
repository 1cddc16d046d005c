//! Wide revision dataset: the merge engine's output table.
//!
//! The dataset is an explicit fixed-field record per period rather
//! than a dynamically-keyed mapping; column presence is decided once
//! at the dataset level, not per access. Serialization targets one
//! columnar format (Parquet) and one delimited format (CSV), both
//! written through a temp file and rename so a failed write never
//! leaves a partial output behind.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Date32Array, Date32Builder, Float64Array,
    Float64Builder, StringArray, StringBuilder,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{Datelike, NaiveDate};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

/// Days from 0001-01-01 (chrono's epoch) to 1970-01-01 (Arrow's Date32 epoch).
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Dataset persistence errors
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("{path}: missing mandatory column {column:?}")]
    MissingColumn { path: PathBuf, column: &'static str },

    #[error("{path}: bad cell in column {column:?}: {context}")]
    BadCell {
        path: PathBuf,
        column: String,
        context: String,
    },

    #[error("unsupported file format: {0}")]
    UnsupportedFormat(PathBuf),
}

/// Absolute-revision size bucket, boundaries at 50/100/200 thousand.
///
/// Null revisions bucket to `Unknown`, never to a numeric bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magnitude {
    Small,
    Medium,
    Large,
    Extreme,
    Unknown,
}

impl Magnitude {
    pub fn from_abs_revision(rev: Option<f64>) -> Self {
        match rev {
            None => Magnitude::Unknown,
            Some(r) => {
                let abs = r.abs();
                if abs <= 50.0 {
                    Magnitude::Small
                } else if abs <= 100.0 {
                    Magnitude::Medium
                } else if abs <= 200.0 {
                    Magnitude::Large
                } else {
                    Magnitude::Extreme
                }
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Magnitude::Small => "Small",
            Magnitude::Medium => "Medium",
            Magnitude::Large => "Large",
            Magnitude::Extreme => "Extreme",
            Magnitude::Unknown => "Unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Small" => Magnitude::Small,
            "Medium" => Magnitude::Medium,
            "Large" => Magnitude::Large,
            "Extreme" => Magnitude::Extreme,
            _ => Magnitude::Unknown,
        }
    }
}

impl std::fmt::Display for Magnitude {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One calendar period of the merged dataset.
///
/// A revision field is present only when both of its operand releases
/// are present; it is never zero-filled.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationRow {
    /// Period key, always the first of the month.
    pub date: NaiveDate,
    pub release1: Option<f64>,
    pub release2: Option<f64>,
    pub release3: Option<f64>,
    /// Latest known value for this period.
    pub final_value: Option<f64>,
    /// Published standard error, constant across periods.
    pub se: f64,
    pub ci90_lower: Option<f64>,
    pub ci90_upper: Option<f64>,
    pub rev_2to1: Option<f64>,
    pub rev_3to2: Option<f64>,
    /// Fallback delta for periods where release2 is missing.
    pub rev_3to1: Option<f64>,
    pub rev_final: Option<f64>,
    pub rev_final_to3: Option<f64>,
    pub rev_2to1_rolling_mean: Option<f64>,
    pub rev_2to1_rolling_std: Option<f64>,
    pub rev_3to2_rolling_mean: Option<f64>,
    pub rev_3to2_rolling_std: Option<f64>,
    pub rev_final_rolling_mean: Option<f64>,
    pub rev_final_rolling_std: Option<f64>,
    pub revision_direction_consistent: Option<bool>,
    pub revision_magnitude: Magnitude,
    pub is_outlier: bool,
}

impl ObservationRow {
    /// A row with every derived and source field empty.
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            release1: None,
            release2: None,
            release3: None,
            final_value: None,
            se: 0.0,
            ci90_lower: None,
            ci90_upper: None,
            rev_2to1: None,
            rev_3to2: None,
            rev_3to1: None,
            rev_final: None,
            rev_final_to3: None,
            rev_2to1_rolling_mean: None,
            rev_2to1_rolling_std: None,
            rev_3to2_rolling_mean: None,
            rev_3to2_rolling_std: None,
            rev_final_rolling_mean: None,
            rev_final_rolling_std: None,
            revision_direction_consistent: None,
            revision_magnitude: Magnitude::Unknown,
            is_outlier: false,
        }
    }

    /// Nullable numeric column accessor by name. Returns `None` for
    /// names that are not f64 columns.
    pub fn f64_column(&self, name: &str) -> Option<Option<f64>> {
        let value = match name {
            "release1" => self.release1,
            "release2" => self.release2,
            "release3" => self.release3,
            "final" => self.final_value,
            "ci90_lower" => self.ci90_lower,
            "ci90_upper" => self.ci90_upper,
            "rev_2to1" => self.rev_2to1,
            "rev_3to2" => self.rev_3to2,
            "rev_3to1" => self.rev_3to1,
            "rev_final" => self.rev_final,
            "rev_final_to3" => self.rev_final_to3,
            "rev_2to1_rolling_mean" => self.rev_2to1_rolling_mean,
            "rev_2to1_rolling_std" => self.rev_2to1_rolling_std,
            "rev_3to2_rolling_mean" => self.rev_3to2_rolling_mean,
            "rev_3to2_rolling_std" => self.rev_3to2_rolling_std,
            "rev_final_rolling_mean" => self.rev_final_rolling_mean,
            "rev_final_rolling_std" => self.rev_final_rolling_std,
            _ => return None,
        };
        Some(value)
    }

    fn set_f64_column(&mut self, name: &str, value: Option<f64>) {
        match name {
            "release1" => self.release1 = value,
            "release2" => self.release2 = value,
            "release3" => self.release3 = value,
            "final" => self.final_value = value,
            "ci90_lower" => self.ci90_lower = value,
            "ci90_upper" => self.ci90_upper = value,
            "rev_2to1" => self.rev_2to1 = value,
            "rev_3to2" => self.rev_3to2 = value,
            "rev_3to1" => self.rev_3to1 = value,
            "rev_final" => self.rev_final = value,
            "rev_final_to3" => self.rev_final_to3 = value,
            "rev_2to1_rolling_mean" => self.rev_2to1_rolling_mean = value,
            "rev_2to1_rolling_std" => self.rev_2to1_rolling_std = value,
            "rev_3to2_rolling_mean" => self.rev_3to2_rolling_mean = value,
            "rev_3to2_rolling_std" => self.rev_3to2_rolling_std = value,
            "rev_final_rolling_mean" => self.rev_final_rolling_mean = value,
            "rev_final_rolling_std" => self.rev_final_rolling_std = value,
            _ => {}
        }
    }
}

/// The merge engine's output table, period-sorted (canonical order).
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionDataset {
    pub rows: Vec<ObservationRow>,
    /// The release table carried a release2 column.
    pub has_release2: bool,
    /// The release table carried a release3 column.
    pub has_release3: bool,
    /// release1 was substituted from the final series because no
    /// release table existed. Not persisted; indicated in output by
    /// the absence of release2/release3 columns.
    pub release1_is_proxy: bool,
}

/// A dataset loaded back from disk, with the column names the file
/// actually carried (the quality checker scores against these).
#[derive(Debug, Clone)]
pub struct StoredDataset {
    pub dataset: RevisionDataset,
    pub columns: Vec<String>,
}

impl RevisionDataset {
    /// Serialized column set, in canonical order. release2/release3
    /// and their deltas appear only when the release table had them;
    /// rev_3to1 appears only when some period actually needed the
    /// fallback.
    pub fn column_names(&self) -> Vec<&'static str> {
        let mut cols = vec!["date", "release1"];
        if self.has_release2 {
            cols.push("release2");
        }
        if self.has_release3 {
            cols.push("release3");
        }
        cols.extend(["final", "se", "ci90_lower", "ci90_upper", "rev_2to1", "rev_3to2"]);
        if self.rows.iter().any(|r| r.rev_3to1.is_some()) {
            cols.push("rev_3to1");
        }
        cols.extend([
            "rev_final",
            "rev_final_to3",
            "rev_2to1_rolling_mean",
            "rev_2to1_rolling_std",
            "rev_3to2_rolling_mean",
            "rev_3to2_rolling_std",
            "rev_final_rolling_mean",
            "rev_final_rolling_std",
            "revision_direction_consistent",
            "revision_magnitude",
            "is_outlier",
        ]);
        cols
    }

    /// Write the dataset as CSV.
    pub fn write_csv(&self, path: &Path) -> Result<(), DatasetError> {
        let tmp_path = path.with_extension("csv.tmp");
        let columns = self.column_names();

        let mut writer = csv::Writer::from_path(&tmp_path)?;
        writer.write_record(&columns)?;
        for row in &self.rows {
            let record: Vec<String> = columns.iter().map(|c| csv_cell(row, c)).collect();
            writer.write_record(&record)?;
        }
        writer.flush()?;
        drop(writer);
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Write the dataset as Parquet.
    pub fn write_parquet(&self, path: &Path) -> Result<(), DatasetError> {
        let tmp_path = path.with_extension("parquet.tmp");
        let columns = self.column_names();

        let mut fields = Vec::with_capacity(columns.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
        for column in &columns {
            match *column {
                "date" => {
                    fields.push(Field::new("date", DataType::Date32, false));
                    let mut builder = Date32Builder::with_capacity(self.rows.len());
                    for row in &self.rows {
                        builder.append_value(date_to_days(row.date));
                    }
                    arrays.push(Arc::new(builder.finish()));
                }
                "se" => {
                    fields.push(Field::new("se", DataType::Float64, false));
                    let mut builder = Float64Builder::with_capacity(self.rows.len());
                    for row in &self.rows {
                        builder.append_value(row.se);
                    }
                    arrays.push(Arc::new(builder.finish()));
                }
                "revision_direction_consistent" => {
                    fields.push(Field::new(column.to_string(), DataType::Boolean, true));
                    let mut builder = BooleanBuilder::with_capacity(self.rows.len());
                    for row in &self.rows {
                        builder.append_option(row.revision_direction_consistent);
                    }
                    arrays.push(Arc::new(builder.finish()));
                }
                "revision_magnitude" => {
                    fields.push(Field::new(column.to_string(), DataType::Utf8, false));
                    let mut builder = StringBuilder::new();
                    for row in &self.rows {
                        builder.append_value(row.revision_magnitude.as_str());
                    }
                    arrays.push(Arc::new(builder.finish()));
                }
                "is_outlier" => {
                    fields.push(Field::new(column.to_string(), DataType::Boolean, false));
                    let mut builder = BooleanBuilder::with_capacity(self.rows.len());
                    for row in &self.rows {
                        builder.append_value(row.is_outlier);
                    }
                    arrays.push(Arc::new(builder.finish()));
                }
                name => {
                    fields.push(Field::new(name.to_string(), DataType::Float64, true));
                    let mut builder = Float64Builder::with_capacity(self.rows.len());
                    for row in &self.rows {
                        builder.append_option(row.f64_column(name).flatten());
                    }
                    arrays.push(Arc::new(builder.finish()));
                }
            }
        }

        let schema = Arc::new(Schema::new(fields));
        let batch = RecordBatch::try_new(schema.clone(), arrays)?;

        let file = File::create(&tmp_path)?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Load a persisted dataset, dispatching on file extension.
    pub fn load(path: &Path) -> Result<StoredDataset, DatasetError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("parquet") => Self::read_parquet(path),
            Some("csv") => Self::read_csv(path),
            _ => Err(DatasetError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    /// Load from CSV. Lenient about column presence: every column but
    /// `date` may be absent and loads as all-null so the quality
    /// checker can score the gap instead of refusing the file.
    pub fn read_csv(path: &Path) -> Result<StoredDataset, DatasetError> {
        let mut reader = csv::Reader::from_path(path)?;
        let columns: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
        let date_idx = columns
            .iter()
            .position(|c| c == "date")
            .ok_or(DatasetError::MissingColumn {
                path: path.to_path_buf(),
                column: "date",
            })?;

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let date_field = record.get(date_idx).unwrap_or_default();
            let date = NaiveDate::parse_from_str(date_field, "%Y-%m-%d").map_err(|e| {
                DatasetError::BadCell {
                    path: path.to_path_buf(),
                    column: "date".to_string(),
                    context: format!("{date_field:?}: {e}"),
                }
            })?;
            let mut row = ObservationRow::empty(date);

            for (idx, column) in columns.iter().enumerate() {
                if idx == date_idx {
                    continue;
                }
                let cell = record.get(idx).unwrap_or_default();
                parse_cell(&mut row, column, cell).map_err(|context| DatasetError::BadCell {
                    path: path.to_path_buf(),
                    column: column.clone(),
                    context,
                })?;
            }
            rows.push(row);
        }

        Ok(stored(rows, columns))
    }

    /// Load from Parquet, same leniency as `read_csv`.
    pub fn read_parquet(path: &Path) -> Result<StoredDataset, DatasetError> {
        let file = File::open(path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let columns: Vec<String> = builder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        if !columns.iter().any(|c| c == "date") {
            return Err(DatasetError::MissingColumn {
                path: path.to_path_buf(),
                column: "date",
            });
        }

        let reader = builder.build()?;
        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch?;
            read_batch(&batch, path, &mut rows)?;
        }

        Ok(stored(rows, columns))
    }
}

fn stored(rows: Vec<ObservationRow>, columns: Vec<String>) -> StoredDataset {
    let has_release2 = columns.iter().any(|c| c == "release2");
    let has_release3 = columns.iter().any(|c| c == "release3");
    StoredDataset {
        dataset: RevisionDataset {
            rows,
            has_release2,
            has_release3,
            release1_is_proxy: false,
        },
        columns,
    }
}

fn read_batch(
    batch: &RecordBatch,
    path: &Path,
    rows: &mut Vec<ObservationRow>,
) -> Result<(), DatasetError> {
    let bad_cell = |column: &str, context: String| DatasetError::BadCell {
        path: path.to_path_buf(),
        column: column.to_string(),
        context,
    };

    let dates = batch
        .column_by_name("date")
        .and_then(|c| c.as_any().downcast_ref::<Date32Array>())
        .ok_or_else(|| bad_cell("date", "not a Date32 column".to_string()))?;

    let start = rows.len();
    for i in 0..batch.num_rows() {
        let date = date_from_days(dates.value(i))
            .ok_or_else(|| bad_cell("date", format!("day offset {} out of range", dates.value(i))))?;
        rows.push(ObservationRow::empty(date));
    }

    for (field, column) in batch.schema().fields().iter().zip(batch.columns()) {
        let name = field.name().as_str();
        match name {
            "date" => {}
            "se" => {
                let values = column
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or_else(|| bad_cell(name, "not a Float64 column".to_string()))?;
                for i in 0..batch.num_rows() {
                    if !values.is_null(i) {
                        rows[start + i].se = values.value(i);
                    }
                }
            }
            "revision_direction_consistent" => {
                let values = column
                    .as_any()
                    .downcast_ref::<BooleanArray>()
                    .ok_or_else(|| bad_cell(name, "not a Boolean column".to_string()))?;
                for i in 0..batch.num_rows() {
                    rows[start + i].revision_direction_consistent =
                        (!values.is_null(i)).then(|| values.value(i));
                }
            }
            "is_outlier" => {
                let values = column
                    .as_any()
                    .downcast_ref::<BooleanArray>()
                    .ok_or_else(|| bad_cell(name, "not a Boolean column".to_string()))?;
                for i in 0..batch.num_rows() {
                    rows[start + i].is_outlier = !values.is_null(i) && values.value(i);
                }
            }
            "revision_magnitude" => {
                let values = column
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or_else(|| bad_cell(name, "not a Utf8 column".to_string()))?;
                for i in 0..batch.num_rows() {
                    if !values.is_null(i) {
                        rows[start + i].revision_magnitude = Magnitude::parse(values.value(i));
                    }
                }
            }
            _ => {
                let values = column
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or_else(|| bad_cell(name, "not a Float64 column".to_string()))?;
                for i in 0..batch.num_rows() {
                    let value = (!values.is_null(i)).then(|| values.value(i));
                    rows[start + i].set_f64_column(name, value);
                }
            }
        }
    }
    Ok(())
}

fn csv_cell(row: &ObservationRow, column: &str) -> String {
    match column {
        "date" => row.date.format("%Y-%m-%d").to_string(),
        "se" => format!("{}", row.se),
        "revision_direction_consistent" => row
            .revision_direction_consistent
            .map(|b| b.to_string())
            .unwrap_or_default(),
        "revision_magnitude" => row.revision_magnitude.as_str().to_string(),
        "is_outlier" => row.is_outlier.to_string(),
        name => row
            .f64_column(name)
            .flatten()
            .map(|v| format!("{v}"))
            .unwrap_or_default(),
    }
}

fn parse_cell(row: &mut ObservationRow, column: &str, cell: &str) -> Result<(), String> {
    let cell = cell.trim();
    match column {
        "se" => {
            if !cell.is_empty() {
                row.se = cell.parse().map_err(|e| format!("{cell:?}: {e}"))?;
            }
        }
        "revision_direction_consistent" => {
            row.revision_direction_consistent = match cell {
                "" => None,
                "true" | "True" => Some(true),
                "false" | "False" => Some(false),
                other => return Err(format!("{other:?}: expected boolean")),
            };
        }
        "revision_magnitude" => {
            row.revision_magnitude = Magnitude::parse(cell);
        }
        "is_outlier" => {
            row.is_outlier = matches!(cell, "true" | "True");
        }
        name => {
            let value = if cell.is_empty() {
                None
            } else {
                Some(cell.parse::<f64>().map_err(|e| format!("{cell:?}: {e}"))?)
            };
            row.set_f64_column(name, value);
        }
    }
    Ok(())
}

/// Convert a date to Arrow's Date32 representation (days since 1970-01-01).
pub(crate) fn date_to_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

pub(crate) fn date_from_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
}
