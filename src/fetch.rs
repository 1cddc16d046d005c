//! FRED series download.
//!
//! Fetches the PAYEMS (total nonfarm payroll employment) CSV from the
//! FRED graph endpoint and parses it into memory. Persistence and
//! diffing against prior downloads live in the `snapshot` module.

use std::time::Duration;

use chrono::NaiveDate;
use tracing::info;

use crate::snapshot::SeriesPoint;

/// FRED graph CSV endpoint for the PAYEMS series.
pub const FRED_PAYEMS_URL: &str = "https://fred.stlouisfed.org/graph/fredgraph.csv?id=PAYEMS";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Download stage errors
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("downloaded series is empty")]
    EmptyDownload,

    #[error("bad record at line {line}: {context}")]
    BadRecord { line: u64, context: String },
}

/// Download and parse the series from `url`.
pub async fn download_series(url: &str) -> Result<Vec<SeriesPoint>, FetchError> {
    info!(url, "Downloading series from FRED");
    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()?;
    let body = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    let series = parse_fred_csv(&body)?;
    info!(
        records = series.len(),
        start = %series[0].date,
        end = %series[series.len() - 1].date,
        "Downloaded series"
    );
    Ok(series)
}

/// Parse a FRED `DATE,VALUE` CSV body.
///
/// FRED marks missing observations with a bare `.`; those rows are
/// dropped rather than surfaced as nulls. An empty result is an error:
/// downstream stages need at least one observation.
pub fn parse_fred_csv(text: &str) -> Result<Vec<SeriesPoint>, FetchError> {
    let mut reader = csv::Reader::from_reader(text.as_bytes());
    let mut series = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        let date_field = record.get(0).unwrap_or_default();
        let value_field = record.get(1).unwrap_or_default().trim();

        // FRED missing-value marker
        if value_field.is_empty() || value_field == "." {
            continue;
        }

        let date = NaiveDate::parse_from_str(date_field, "%Y-%m-%d").map_err(|e| {
            FetchError::BadRecord {
                line,
                context: format!("unparseable date {date_field:?}: {e}"),
            }
        })?;
        let value: f64 = value_field.parse().map_err(|e| FetchError::BadRecord {
            line,
            context: format!("unparseable value {value_field:?}: {e}"),
        })?;
        series.push(SeriesPoint { date, value });
    }

    if series.is_empty() {
        return Err(FetchError::EmptyDownload);
    }
    Ok(series)
}
