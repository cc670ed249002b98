//! Error types for archive access.
//!
//! Application code uses `anyhow::Result` throughout; this enum exists so the
//! ingest driver and query layer can distinguish failure classes that change
//! control flow: a malformed member is swallowed per chain, while an
//! unreachable upstream aborts the whole operation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The trailing-window scan found no End-of-Central-Directory signature.
    #[error("end of central directory not found")]
    EocdNotFound,

    /// A range (or HEAD/list) request returned a non-success status.
    #[error("range request failed with HTTP status {status}")]
    RangeFailed { status: u16 },

    /// A member uses a compression method other than STORED or DEFLATE.
    #[error("unsupported compression method {method}")]
    UnsupportedCompression { method: u16 },

    /// Fewer bytes arrived than requested for a header or payload.
    #[error("truncated archive: wanted {wanted} bytes, got {got}")]
    TruncatedArchive { wanted: u64, got: u64 },

    /// Network-level failure talking to the upstream.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Decompression of a DEFLATE member failed.
    #[error("failed to inflate member: {0}")]
    Inflate(#[from] std::io::Error),
}

impl From<reqwest::Error> for ArchiveError {
    fn from(err: reqwest::Error) -> Self {
        ArchiveError::UpstreamUnavailable(err.to_string())
    }
}
