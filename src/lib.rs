//! Nonfarm-payroll revision pipeline.
//!
//! This crate downloads the PAYEMS employment series, extracts
//! point-in-time release values from archived BLS report text, merges
//! the two into a wide revision dataset, validates the result, and
//! serves it to a browser dashboard.
//!
//! ## Architecture
//!
//! The pipeline is a linear sequence of batch stages:
//!
//! 1. **Fetch** (`fetch`, `snapshot` modules) - Downloads the FRED
//!    PAYEMS CSV and appends a dated snapshot to the local store.
//!
//! 2. **Extract** (`extract`, `releases` modules) - Scans archived
//!    report text for first/second/third release values and pivots
//!    them into one column per release version.
//!
//! 3. **Merge** (`merge`, `dataset` modules) - Joins the final series
//!    with the release table and derives revisions, confidence bands,
//!    outlier flags, and rolling statistics. This is the central
//!    computation; it performs no I/O.
//!
//! 4. **Check** (`quality` module) - Independent validation pass over
//!    the persisted dataset with a 0-100 score.
//!
//! 5. **Serve** (`server` module) - Static dashboard server over the
//!    processed data directory.
//!
//! ## Usage
//!
//! ```bash
//! nfp-pipeline run                # fetch -> extract -> merge -> check
//! nfp-pipeline merge              # merge stage alone
//! nfp-pipeline serve --port 8080  # dashboard server
//! ```

pub mod dataset;
pub mod extract;
pub mod fetch;
pub mod merge;
pub mod quality;
pub mod releases;
pub mod server;
pub mod snapshot;
pub mod summary;
