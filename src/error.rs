//! Error types for document analysis
//!
//! Only [`AnalysisError`] aborts a run. Per-chunk failures are recorded on the
//! partial result ([`crate::doc::ChunkFailure`]) and surface as warnings.

use crate::doc::types::ChunkFailure;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort an analysis run
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The document has no analyzable content; no call was attempted
    #[error("document '{source_name}' has no analyzable content")]
    EmptyInput { source_name: String },

    /// Every chunk call failed; `failures` holds each call's cause in chunk order
    #[error("all {failed} of {total} chunk calls failed{}", cause_suffix(.failures))]
    TotalReductionFailure {
        failed: usize,
        total: usize,
        failures: Vec<ChunkFailure>,
    },

    /// The task itself is malformed (e.g. `ask` without a question)
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// Budgets or limits are inconsistent
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The caller cancelled the run; partial results were discarded
    #[error("analysis cancelled after {completed}/{total} chunks")]
    Cancelled { completed: usize, total: usize },

    /// The document could not be loaded
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Distinct causes, so one bad API key reads as one error rather than N
fn cause_suffix(failures: &[ChunkFailure]) -> String {
    let mut causes: Vec<String> = Vec::new();
    for failure in failures {
        let cause = failure.to_string();
        if !causes.contains(&cause) {
            causes.push(cause);
        }
    }
    if causes.is_empty() {
        String::new()
    } else {
        format!(": {}", causes.join("; "))
    }
}

/// Load-time document errors
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("not a file: {}", .0.display())]
    NotAFile(PathBuf),

    #[error("unsupported file type '{extension}' (supported: {supported})")]
    UnsupportedType { extension: String, supported: String },

    #[error("cannot read binary file: {}", .0.display())]
    Binary(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors reported by a [`crate::client::ModelClient`]
///
/// The split matters to callers: transient errors may succeed on retry,
/// fatal ones never will.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// Network failure, rate limit, overload or server error
    #[error("transient model error: {0}")]
    Transient(String),

    /// Authentication, invalid request or undecodable response
    #[error("fatal model error: {0}")]
    Fatal(String),
}

impl ClientError {
    /// Whether a retry could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient(_))
    }
}

/// Settings file errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config already exists at {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("unknown config key '{0}' (expected one of: {})", crate::config::SETTING_KEYS.join(", "))]
    UnknownKey(String),

    #[error("invalid value for '{key}': {value}")]
    InvalidValue { key: String, value: String },

    #[error("invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("config I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T, E = AnalysisError> = std::result::Result<T, E>;
