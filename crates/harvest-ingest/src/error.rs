//! Error taxonomy for the acquisition and ingestion engine.
//!
//! Every operation returns a tagged error kind instead of mixing sentinel
//! values with panics. Entry-lifecycle errors ([`SourceError`]) abort the
//! operation they belong to and surface to the immediate caller; read-level
//! transient errors are retried inside the pipeline and only escalate as
//! [`ReadError::RetryExhausted`]; write-level per-record errors never abort a
//! batch and are aggregated into the outcome tally instead.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the source connector's entry lifecycle.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Transport session could not be established or authenticated.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The remote working directory did not match the configured path after
    /// changing into it.
    #[error("remote path mismatch: expected {expected:?}, got {actual:?}")]
    PathMismatch { expected: String, actual: String },

    /// A single entry's retrieval failed.
    #[error("fetch failed for {name:?}: {reason}")]
    Fetch { name: String, reason: String },

    /// Gzip or archive-member extraction failed.
    #[error("decompress failed for {name:?}: {reason}")]
    Decompress { name: String, reason: String },

    /// A local artifact could not be removed.
    #[error("cleanup failed for {path:?}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Entries were not listed before a fetch/decompress was attempted.
    #[error("no entries listed; call list() first")]
    NotListed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SourceError {
    pub(crate) fn fetch(name: &str, err: impl std::fmt::Display) -> Self {
        SourceError::Fetch {
            name: name.to_string(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn decompress(name: &str, err: impl std::fmt::Display) -> Self {
        SourceError::Decompress {
            name: name.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Terminal failure of one logical read. Transient overload (503) responses
/// are retried before this is produced; not-found responses are skips, not
/// errors, and never appear here.
#[derive(Debug, Clone, Error)]
pub enum ReadError {
    /// The server kept signalling overload until the attempt cap.
    #[error("read_failed: too_many_retries (after {attempts} attempts, last status {last_status})")]
    RetryExhausted { attempts: u32, last_status: u16 },

    /// The read exceeded its caller-supplied timeout.
    #[error("read_failed: timeout for {url}")]
    Timeout { url: String },

    /// Any other network or server failure.
    #[error("read_failed: {reason}")]
    Other { reason: String },
}

impl ReadError {
    /// Short machine-readable reason code, used for failure tallies.
    pub fn reason(&self) -> &'static str {
        match self {
            ReadError::RetryExhausted { .. } => "too_many_retries",
            ReadError::Timeout { .. } => "timeout",
            ReadError::Other { .. } => "read_error",
        }
    }
}

/// A bulk write request failed at the transport level. Per-record rejections
/// (conflicts, validation) are not errors; they live in the outcome tally.
#[derive(Debug, Error)]
#[error("bulk request failed: {reason}")]
pub struct WriteError {
    pub reason: String,

    /// Tally of the chunks that did complete before/alongside the failure.
    pub partial: crate::bulk::WriteOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_error_reasons() {
        let e = ReadError::RetryExhausted {
            attempts: 10,
            last_status: 503,
        };
        assert_eq!(e.reason(), "too_many_retries");
        assert!(e.to_string().contains("too_many_retries"));

        let e = ReadError::Other {
            reason: "status 500".into(),
        };
        assert_eq!(e.reason(), "read_error");
    }

    #[test]
    fn test_path_mismatch_display() {
        let e = SourceError::PathMismatch {
            expected: "pubmed/baseline".into(),
            actual: "pub".into(),
        };
        assert!(e.to_string().contains("pubmed/baseline"));
    }
}
