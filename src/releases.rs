//! Point-in-time release table.
//!
//! Release values are keyed by (period, release version) upstream and
//! consumed here pivoted to one column per version. The table lives
//! next to the processed dataset as `bls_releases.parquet` with a CSV
//! twin for inspection; the loader prefers Parquet.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Date32Array, Date32Builder, Float64Array, Float64Builder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::info;

use crate::dataset::{date_from_days, date_to_days};

/// Release values whose magnitude indicates raw persons rather than
/// thousands are rescaled on load. The series itself sits near
/// 150 000 (thousands), so anything above ten million can only be a
/// raw level.
const RAW_LEVEL_THRESHOLD: f64 = 10_000_000.0;

pub const RELEASES_PARQUET: &str = "bls_releases.parquet";
pub const RELEASES_CSV: &str = "bls_releases.csv";

/// Release table errors
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("{path}: {context}")]
    BadTable { path: PathBuf, context: String },
}

/// One extracted (period, version, value) record, pre-pivot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReleaseRecord {
    pub date: NaiveDate,
    /// 1 = first published, increasing = later revisions.
    pub version: u8,
    pub value: f64,
}

/// One period of the pivoted release table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReleaseRow {
    pub date: NaiveDate,
    pub release1: Option<f64>,
    pub release2: Option<f64>,
    pub release3: Option<f64>,
}

/// Release table pivoted to one column per version, period-sorted.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseTable {
    pub rows: Vec<ReleaseRow>,
    pub has_release2: bool,
    pub has_release3: bool,
}

impl ReleaseTable {
    /// Pivot raw records into one row per period. The first record
    /// wins for a duplicated (period, version) pair.
    pub fn from_records(records: &[ReleaseRecord]) -> Self {
        let mut by_date: std::collections::BTreeMap<NaiveDate, ReleaseRow> =
            std::collections::BTreeMap::new();
        for record in records {
            let row = by_date.entry(record.date).or_insert(ReleaseRow {
                date: record.date,
                release1: None,
                release2: None,
                release3: None,
            });
            let slot = match record.version {
                1 => &mut row.release1,
                2 => &mut row.release2,
                3 => &mut row.release3,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(normalize_value(record.value));
            }
        }

        let rows: Vec<ReleaseRow> = by_date.into_values().collect();
        let has_release2 = rows.iter().any(|r| r.release2.is_some());
        let has_release3 = rows.iter().any(|r| r.release3.is_some());
        Self {
            rows,
            has_release2,
            has_release3,
        }
    }

    /// Load the release table from `dir`, Parquet first, CSV second.
    ///
    /// Returns `Ok(None)` when neither file exists: an absent release
    /// table is a degraded mode downstream, not an error.
    pub fn load(dir: &Path) -> Result<Option<Self>, ReleaseError> {
        let parquet_path = dir.join(RELEASES_PARQUET);
        if parquet_path.exists() {
            info!(path = %parquet_path.display(), "Loading release table");
            return Ok(Some(Self::read_parquet(&parquet_path)?));
        }
        let csv_path = dir.join(RELEASES_CSV);
        if csv_path.exists() {
            info!(path = %csv_path.display(), "Loading release table");
            return Ok(Some(Self::read_csv(&csv_path)?));
        }
        Ok(None)
    }

    /// Persist as Parquet plus a CSV twin, both via temp-and-rename.
    pub fn write(&self, dir: &Path) -> Result<PathBuf, ReleaseError> {
        std::fs::create_dir_all(dir)?;
        let parquet_path = dir.join(RELEASES_PARQUET);
        self.write_parquet(&parquet_path)?;
        self.write_csv(&dir.join(RELEASES_CSV))?;
        Ok(parquet_path)
    }

    fn columns(&self) -> Vec<&'static str> {
        let mut cols = vec!["date", "release1"];
        if self.has_release2 {
            cols.push("release2");
        }
        if self.has_release3 {
            cols.push("release3");
        }
        cols
    }

    fn write_csv(&self, path: &Path) -> Result<(), ReleaseError> {
        let tmp_path = path.with_extension("csv.tmp");
        let columns = self.columns();
        let mut writer = csv::Writer::from_path(&tmp_path)?;
        writer.write_record(&columns)?;
        for row in &self.rows {
            let mut record = vec![row.date.format("%Y-%m-%d").to_string()];
            record.push(fmt_opt(row.release1));
            if self.has_release2 {
                record.push(fmt_opt(row.release2));
            }
            if self.has_release3 {
                record.push(fmt_opt(row.release3));
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        drop(writer);
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn write_parquet(&self, path: &Path) -> Result<(), ReleaseError> {
        let tmp_path = path.with_extension("parquet.tmp");
        let columns = self.columns();

        let mut fields = vec![Field::new("date", DataType::Date32, false)];
        let mut date_builder = Date32Builder::with_capacity(self.rows.len());
        for row in &self.rows {
            date_builder.append_value(date_to_days(row.date));
        }
        let mut arrays: Vec<ArrayRef> = vec![Arc::new(date_builder.finish())];

        for column in columns.iter().skip(1) {
            fields.push(Field::new(column.to_string(), DataType::Float64, true));
            let mut builder = Float64Builder::with_capacity(self.rows.len());
            for row in &self.rows {
                builder.append_option(release_by_name(row, column));
            }
            arrays.push(Arc::new(builder.finish()));
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

    fn read_csv(path: &Path) -> Result<Self, ReleaseError> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
        let date_idx =
            headers
                .iter()
                .position(|h| h == "date")
                .ok_or_else(|| ReleaseError::BadTable {
                    path: path.to_path_buf(),
                    context: "missing date column".to_string(),
                })?;

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let date_field = record.get(date_idx).unwrap_or_default();
            let date = NaiveDate::parse_from_str(date_field, "%Y-%m-%d").map_err(|e| {
                ReleaseError::BadTable {
                    path: path.to_path_buf(),
                    context: format!("unparseable date {date_field:?}: {e}"),
                }
            })?;
            let mut row = ReleaseRow {
                date,
                release1: None,
                release2: None,
                release3: None,
            };
            for (idx, header) in headers.iter().enumerate() {
                if idx == date_idx {
                    continue;
                }
                let cell = record.get(idx).unwrap_or_default().trim();
                if cell.is_empty() {
                    continue;
                }
                let value: f64 = cell.parse().map_err(|e| ReleaseError::BadTable {
                    path: path.to_path_buf(),
                    context: format!("unparseable {header} value {cell:?}: {e}"),
                })?;
                set_release_by_name(&mut row, header, Some(normalize_value(value)));
            }
            rows.push(row);
        }

        let has_release2 = headers.iter().any(|h| h == "release2");
        let has_release3 = headers.iter().any(|h| h == "release3");
        Ok(Self {
            rows,
            has_release2,
            has_release3,
        })
    }

    fn read_parquet(path: &Path) -> Result<Self, ReleaseError> {
        let file = File::open(path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let headers: Vec<String> = builder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        let reader = builder.build()?;

        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch?;
            let dates = batch
                .column_by_name("date")
                .and_then(|c| c.as_any().downcast_ref::<Date32Array>())
                .ok_or_else(|| ReleaseError::BadTable {
                    path: path.to_path_buf(),
                    context: "missing or mistyped date column".to_string(),
                })?;
            let start = rows.len();
            for i in 0..batch.num_rows() {
                let date =
                    date_from_days(dates.value(i)).ok_or_else(|| ReleaseError::BadTable {
                        path: path.to_path_buf(),
                        context: format!("day offset {} out of range", dates.value(i)),
                    })?;
                rows.push(ReleaseRow {
                    date,
                    release1: None,
                    release2: None,
                    release3: None,
                });
            }
            for (field, column) in batch.schema().fields().iter().zip(batch.columns()) {
                let name = field.name().as_str();
                if name == "date" {
                    continue;
                }
                let values = column
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .ok_or_else(|| ReleaseError::BadTable {
                        path: path.to_path_buf(),
                        context: format!("column {name} is not Float64"),
                    })?;
                for i in 0..batch.num_rows() {
                    let value =
                        (!values.is_null(i)).then(|| normalize_value(values.value(i)));
                    set_release_by_name(&mut rows[start + i], name, value);
                }
            }
        }

        let has_release2 = headers.iter().any(|h| h == "release2");
        let has_release3 = headers.iter().any(|h| h == "release3");
        Ok(Self {
            rows,
            has_release2,
            has_release3,
        })
    }
}

/// Rescale a raw-persons value to thousands; pass thousands through.
pub fn normalize_value(value: f64) -> f64 {
    if value > RAW_LEVEL_THRESHOLD {
        value / 1000.0
    } else {
        value
    }
}

fn release_by_name(row: &ReleaseRow, name: &str) -> Option<f64> {
    match name {
        "release1" => row.release1,
        "release2" => row.release2,
        "release3" => row.release3,
        _ => None,
    }
}

fn set_release_by_name(row: &mut ReleaseRow, name: &str, value: Option<f64>) {
    match name {
        "release1" => row.release1 = value,
        "release2" => row.release2 = value,
        "release3" => row.release3 = value,
        _ => {}
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| format!("{v}")).unwrap_or_default()
}
