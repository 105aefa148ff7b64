//! Offline gain analysis.
//!
//! Replays archived raw rows through per-sensor temperature scaling, pairs
//! each row with the backend's processed output with and without the same
//! coefficient, and reports how the relative input change propagates to the
//! output (`gain = outputChangePct / inputChangePct`).
//!
//! This module contains:
//! - CSV reading/writing and archive discovery
//! - Output providers (pre-processed files, HTTP backend)
//! - Row computation, aggregation and report writing
//! - The sweep runner with its worker pool

pub mod archive;
pub mod backend;
pub mod compute;
pub mod report;
pub mod runner;
pub mod summary;
pub mod table;

use std::path::{Path, PathBuf};

// Re-export commonly used types
pub use archive::{discover_archives, load_archive, normalize_phase, Archive, ArchiveMeta, ArchivedRow};
pub use backend::{coef_key, is_populated, ArchivedOutputs, BackendCache, OutputProvider, ProcessedSample};
#[cfg(feature = "http-backend")]
pub use backend::HttpBackend;
pub use compute::{align_outputs, compute_rows, GainRow, RowFlag};
pub use report::{write_reports, ReportPaths, ROWS_FILE_NAME, SUMMARY_FILE_NAME};
pub use runner::{CoefSweep, GainRun, GainRunConfig, GainRunner};
pub use summary::{summarize, temp_bucket, GainSummary};

/// Gain analysis errors.
#[derive(Debug)]
pub enum GainError {
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, message: String },
    InvalidSweep(String),
    Backend(String),
    NoFiles(PathBuf),
}

impl GainError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        GainError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl std::fmt::Display for GainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GainError::Io { path, source } => write!(f, "IO error at {}: {}", path.display(), source),
            GainError::Parse { path, message } => {
                write!(f, "Parse error in {}: {}", path.display(), message)
            }
            GainError::InvalidSweep(e) => write!(f, "Invalid coefficient sweep: {e}"),
            GainError::Backend(e) => write!(f, "Backend error: {e}"),
            GainError::NoFiles(root) => {
                write!(f, "No archived sessions found under {}", root.display())
            }
        }
    }
}

impl std::error::Error for GainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GainError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
