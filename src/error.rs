//! Error taxonomy for scrape runs.
//!
//! Every remote failure is mapped onto [`ScrapeError`] so that retry policy
//! can be decided by [`ScrapeError::class`] alone.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the engine.
pub type ScrapeResult<T> = Result<T, ScrapeError>;

/// How the retry executor treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; rotate identity, back off and try again.
    Retryable,
    /// Propagate immediately without consuming an attempt.
    Fatal,
}

/// Errors raised by the scraping engine.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// Gateway unreachable or credentials rejected.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("Timed out after {0:?}: {1}")]
    Timeout(Duration, String),

    #[error("Navigation failed for {url}: {reason}")]
    Navigation { url: String, reason: String },

    /// Expected content absent or malformed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Archive or listing store write failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl ScrapeError {
    /// Classify an error for retry purposes.
    ///
    /// HTTP 403, any 5xx, timeouts and navigation failures are retryable.
    /// Everything else is fatal.
    pub fn class(&self) -> ErrorClass {
        match self {
            ScrapeError::Http { status, .. } if *status == 403 || (500..600).contains(status) => {
                ErrorClass::Retryable
            }
            ScrapeError::Timeout(..) | ScrapeError::Navigation { .. } => ErrorClass::Retryable,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    pub fn http(status: u16, url: impl Into<String>) -> Self {
        ScrapeError::Http {
            status,
            url: url.into(),
        }
    }

    pub fn navigation(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        ScrapeError::Navigation {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for ScrapeError {
    fn from(e: serde_json::Error) -> Self {
        ScrapeError::Parse(e.to_string())
    }
}

impl From<reqwest::Error> for ScrapeError {
    fn from(e: reqwest::Error) -> Self {
        let url = e.url().map(|u| u.to_string()).unwrap_or_default();
        if e.is_timeout() {
            ScrapeError::Timeout(Duration::ZERO, url)
        } else if let Some(status) = e.status() {
            ScrapeError::http(status.as_u16(), url)
        } else if e.is_connect() {
            ScrapeError::Connectivity(e.to_string())
        } else {
            ScrapeError::Other(e.to_string())
        }
    }
}
