use std::fmt;

use camino::Utf8PathBuf;
use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

use crate::audit::ChangeCounts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Retryable,
    Fatal,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Retryable => write!(f, "retryable"),
            FetchErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Failure of one upstream request after the retry policy gave up.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("{kind} fetch failure for {url}{}: {message}", status_suffix(.status))]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub url: String,
    pub status: Option<u16>,
    pub attempts: u32,
    pub message: String,
}

impl FetchError {
    pub fn fatal(url: &str, message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Fatal,
            url: url.to_string(),
            status: None,
            attempts: 1,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FetchErrorKind::Retryable
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|code| format!(" (status {code})"))
        .unwrap_or_default()
}

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("invalid resource kind: {0}")]
    InvalidResource(String),

    #[error("invalid record key: {0:?}")]
    InvalidKey(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid conversion table: {0}")]
    ConversionTable(String),

    #[error("invalid time bound {0:?} (expected RFC 3339 or YYYY-MM-DD)")]
    InvalidTime(String),

    #[error("sync run {0} not found")]
    RunNotFound(i64),

    #[error(transparent)]
    #[diagnostic(code(isodb::fetch))]
    Fetch(#[from] FetchError),

    #[error(
        "plan flagged: {candidate_deletes} of {previous_total} records ({ratio:.1}%) would be deleted, above the {threshold_pct:.0}% threshold; {counts}",
        ratio = .deletion_ratio * 100.0,
        threshold_pct = .threshold * 100.0
    )]
    #[diagnostic(
        code(isodb::flagged),
        help("re-run with --confirm-deletions after checking the upstream data")
    )]
    ReconciliationFlagged {
        candidate_deletes: usize,
        previous_total: usize,
        deletion_ratio: f64,
        threshold: f64,
        counts: ChangeCounts,
    },

    #[error(
        "campaign {campaign} aborted: batch {batch} had {failed} failures out of {attempted} (limit {max_rate:.2}); {succeeded} succeeded before abort"
    )]
    #[diagnostic(code(isodb::campaign_aborted))]
    CampaignAborted {
        campaign: String,
        batch: usize,
        attempted: usize,
        failed: usize,
        succeeded: u64,
        max_rate: f64,
    },

    #[error("commit rolled back, nothing was applied: {0}")]
    #[diagnostic(code(isodb::commit))]
    CommitFailure(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("malformed upstream payload: {0}")]
    Payload(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Store(err.to_string())
    }
}
