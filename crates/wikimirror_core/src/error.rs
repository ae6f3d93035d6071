use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Page-level failure buckets reported in the end-of-run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    TransientNetwork,
    UpstreamThrottled,
    PermanentFetch,
    Cancelled,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::UpstreamThrottled => "upstream_throttled",
            Self::PermanentFetch => "permanent_fetch",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "transient_network" => Some(Self::TransientNetwork),
            "upstream_throttled" => Some(Self::UpstreamThrottled),
            "permanent_fetch" => Some(Self::PermanentFetch),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the API client once its own retry handling is exhausted.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient network failure after {attempts} attempt(s): {message}")]
    Transient { attempts: usize, message: String },

    #[error("upstream kept throttling after {retries} backoff(s)")]
    Throttled { retries: usize },

    #[error("not found: {target}")]
    NotFound { target: String },

    #[error("permanent fetch failure: {message}")]
    Permanent { message: String },

    #[error("request cancelled by shutdown")]
    Cancelled,
}

impl FetchError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Transient { .. } => FailureCategory::TransientNetwork,
            Self::Throttled { .. } => FailureCategory::UpstreamThrottled,
            Self::NotFound { .. } | Self::Permanent { .. } => FailureCategory::PermanentFetch,
            Self::Cancelled => FailureCategory::Cancelled,
        }
    }
}

/// Run-level failures. Any of these aborts the run and leaves crawl state at its
/// last durable value.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("policy data missing at {}: {reason}", path.display())]
    PolicyDataMissing { path: PathBuf, reason: String },

    #[error("page listing failed: {0}")]
    Listing(#[source] FetchError),

    #[error("batch persistence failed: {0:#}")]
    Persistence(#[source] anyhow::Error),

    #[error("crawl state access failed: {0:#}")]
    State(#[source] anyhow::Error),

    #[error("invalid run configuration: {0}")]
    Config(String),

    #[error("run cancelled by shutdown signal")]
    Cancelled,
}

impl From<FetchError> for RunError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::Cancelled => Self::Cancelled,
            other => Self::Listing(other),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("filename is missing the `{expected}` extension: {filename}")]
    MissingExtension {
        filename: String,
        expected: &'static str,
    },

    #[error("truncated escape sequence at byte {offset}")]
    TruncatedEscape { offset: usize },

    #[error("invalid escape sequence `%{sequence}` at byte {offset}")]
    InvalidEscape { offset: usize, sequence: String },

    #[error("escape `%{sequence}` encodes a character that is never escaped")]
    NonCanonicalEscape { sequence: String },
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("destination wiki is busy or read-only: {0}")]
    Busy(String),

    #[error("import failed: {0}")]
    Failed(String),
}
