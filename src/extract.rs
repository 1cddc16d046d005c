//! Release extraction from archived report text.
//!
//! BLS Employment Situation reports are archived as pre-extracted
//! text files named `empsit_YYYY_MM_vN.txt` (alternate form
//! `YYYY_MM_employment_vN.txt`), where N is the release version for
//! that period. Extraction is a best-effort chain of strategies tried
//! in order: a table-row scan over Table B-1 style layouts, then a
//! narrative-sentence regex fallback. Which strategy produced a value
//! is logged; a report where every strategy fails is skipped with a
//! warning rather than failing the stage.

use std::path::Path;
use std::sync::OnceLock;

use chrono::NaiveDate;
use glob::glob;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::releases::ReleaseRecord;

/// Plausible range for an extracted employment value (thousands of
/// persons or a monthly change in raw persons). Anything outside is a
/// stray number, not the series.
const VALUE_MIN: f64 = 10_000.0;
const VALUE_MAX: f64 = 1_000_000.0;

/// Extraction stage errors
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("glob error: {0}")]
    Pattern(#[from] glob::PatternError),
}

/// Period and release version recovered from a report filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportMeta {
    pub date: NaiveDate,
    pub version: u8,
}

fn filename_patterns() -> &'static [Regex; 2] {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"^empsit_(\d{4})_(\d{2})_v(\d)$").expect("static pattern"),
            Regex::new(r"^(\d{4})_(\d{2})_employment_v(\d)$").expect("static pattern"),
        ]
    })
}

/// Parse `empsit_YYYY_MM_vN` or `YYYY_MM_employment_vN` filenames.
pub fn parse_report_filename(name: &str) -> Option<ReportMeta> {
    let stem = name.strip_suffix(".txt").unwrap_or(name);

    filename_patterns().iter().find_map(|pattern| {
        pattern.captures(stem).and_then(|c| {
            let year: i32 = c.get(1)?.as_str().parse().ok()?;
            let month: u32 = c.get(2)?.as_str().parse().ok()?;
            let version: u8 = c.get(3)?.as_str().parse().ok()?;
            let date = NaiveDate::from_ymd_opt(year, month, 1)?;
            Some(ReportMeta { date, version })
        })
    })
}

/// One attempt at pulling the headline employment value out of report
/// text. Strategies are independent and ordered by reliability.
pub trait ExtractStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Return the extracted value, or `None` when this strategy finds
    /// nothing it trusts.
    fn extract(&self, text: &str) -> Option<f64>;
}

/// Scans table-layout lines for the "Total nonfarm" row and takes the
/// last plausible numeric token (the most recent column).
pub struct TableRowScan;

impl ExtractStrategy for TableRowScan {
    fn name(&self) -> &'static str {
        "table-row-scan"
    }

    fn extract(&self, text: &str) -> Option<f64> {
        for line in text.lines() {
            if !line.to_ascii_lowercase().contains("total nonfarm") {
                continue;
            }
            let mut last = None;
            for token in line.split_whitespace() {
                // Strip thousands separators and the preliminary /
                // revised markers BLS appends to table cells.
                let cleaned: String = token
                    .trim_end_matches(['r', 'p', ')'])
                    .trim_start_matches('(')
                    .chars()
                    .filter(|c| *c != ',')
                    .collect();
                if let Ok(value) = cleaned.parse::<f64>() {
                    if (VALUE_MIN..=VALUE_MAX).contains(&value) {
                        last = Some(value);
                    }
                }
            }
            if last.is_some() {
                return last;
            }
        }
        None
    }
}

/// Matches narrative sentences like "Total nonfarm payroll employment
/// rose by 256,000". Patterns are tried most-specific first.
pub struct NarrativePattern {
    patterns: Vec<Regex>,
}

impl NarrativePattern {
    pub fn new() -> Self {
        let patterns = [
            r"(?i)total nonfarm payroll employment (?:rose|increased|fell|decreased) by ([\d,]+)",
            r"(?i)nonfarm payroll employment (?:rose|increased|fell|decreased) by ([\d,]+)",
            r"(?i)total nonfarm.*?(\d{1,3}(?:,\d{3})*)",
            r"(?i)payroll employment.*?(\d{1,3}(?:,\d{3})*)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect();
        Self { patterns }
    }
}

impl Default for NarrativePattern {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractStrategy for NarrativePattern {
    fn name(&self) -> &'static str {
        "narrative-pattern"
    }

    fn extract(&self, text: &str) -> Option<f64> {
        for pattern in &self.patterns {
            for captures in pattern.captures_iter(text) {
                let Some(group) = captures.get(1) else { continue };
                let cleaned: String = group.as_str().chars().filter(|c| *c != ',').collect();
                let Ok(value) = cleaned.parse::<f64>() else { continue };
                if (VALUE_MIN..=VALUE_MAX).contains(&value) {
                    return Some(value);
                }
            }
        }
        None
    }
}

/// Ordered strategy chain over a directory of report text files.
pub struct ReportExtractor {
    strategies: Vec<Box<dyn ExtractStrategy>>,
}

impl ReportExtractor {
    pub fn new() -> Self {
        Self {
            strategies: vec![Box::new(TableRowScan), Box::new(NarrativePattern::new())],
        }
    }

    /// Try each strategy in order; first success wins.
    pub fn extract_value(&self, text: &str) -> Option<(f64, &'static str)> {
        for strategy in &self.strategies {
            if let Some(value) = strategy.extract(text) {
                return Some((value, strategy.name()));
            }
        }
        None
    }

    /// Scan `dir` for report text files and extract a release record
    /// from each. Unparseable filenames and unreadable or unyielding
    /// reports are skipped with a warning.
    pub fn scan_dir(&self, dir: &Path) -> Result<Vec<ReleaseRecord>, ExtractError> {
        let pattern = format!("{}/*.txt", dir.display());
        let mut records = Vec::new();

        for entry in glob(&pattern)? {
            let path = match entry {
                Ok(path) => path,
                Err(e) => return Err(ExtractError::Io(e.into_error())),
            };
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(meta) = parse_report_filename(name) else {
                warn!(file = name, "Could not parse report filename");
                continue;
            };

            let text = std::fs::read_to_string(&path)?;
            match self.extract_value(&text) {
                Some((value, strategy)) => {
                    debug!(
                        file = name,
                        strategy,
                        value,
                        date = %meta.date,
                        version = meta.version,
                        "Extracted release value"
                    );
                    records.push(ReleaseRecord {
                        date: meta.date,
                        version: meta.version,
                        value,
                    });
                }
                None => {
                    warn!(file = name, "No strategy extracted a value");
                }
            }
        }

        info!(dir = %dir.display(), records = records.len(), "Scanned report directory");
        Ok(records)
    }
}

impl Default for ReportExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn filename_primary_form() {
        let meta = parse_report_filename("empsit_2020_03_v1.txt").unwrap();
        assert_eq!(meta.date, NaiveDate::from_ymd_opt(2020, 3, 1).unwrap());
        assert_eq!(meta.version, 1);
    }

    #[test]
    fn filename_alternate_form() {
        let meta = parse_report_filename("2019_11_employment_v3.txt").unwrap();
        assert_eq!(meta.date, NaiveDate::from_ymd_opt(2019, 11, 1).unwrap());
        assert_eq!(meta.version, 3);
    }

    #[test]
    fn filename_rejects_noise() {
        assert_eq!(parse_report_filename("notes.txt"), None);
        assert_eq!(parse_report_filename("empsit_2020_13_v1.txt"), None);
    }

    #[test]
    fn table_row_scan_takes_last_column() {
        let text = "Industry          Jan     Feb     Mar\n\
                    Total nonfarm..  150,606 150,907 151,074r\n\
                    Goods-producing    1,100   1,105   1,110\n";
        let value = TableRowScan.extract(text).unwrap();
        assert_eq!(value, 151_074.0);
    }

    #[test]
    fn narrative_fallback_matches_headline_sentence() {
        let text = "Total nonfarm payroll employment rose by 256,000 in December.";
        let value = NarrativePattern::new().extract(text).unwrap();
        assert_eq!(value, 256_000.0);
    }

    #[test]
    fn narrative_ignores_out_of_range_numbers() {
        let text = "Total nonfarm payroll employment rose by 2,000 in December.";
        assert_eq!(NarrativePattern::new().extract(text), None);
    }

    #[test]
    fn chain_prefers_table_scan() {
        let text = "Total nonfarm..  150,606\n\
                    Total nonfarm payroll employment rose by 256,000 in December.";
        let (value, strategy) = ReportExtractor::new().extract_value(text).unwrap();
        assert_eq!(value, 150_606.0);
        assert_eq!(strategy, "table-row-scan");
    }

    #[test]
    fn chain_falls_back_to_narrative() {
        let text = "Payroll employment rose by 256,000 over the month.";
        let (_, strategy) = ReportExtractor::new().extract_value(text).unwrap();
        assert_eq!(strategy, "narrative-pattern");
    }

    #[test]
    fn scan_dir_skips_unparseable_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("empsit_2020_02_v1.txt"),
            "Total nonfarm..  151,900\n",
        )
        .unwrap();
        std::fs::write(tmp.path().join("README.txt"), "nothing here").unwrap();

        let records = ReportExtractor::new().scan_dir(tmp.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, 151_900.0);
        assert_eq!(records[0].version, 1);
    }
}
