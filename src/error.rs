//! Error kinds for the public core surface.
//!
//! Each public operation gets its own enum rather than one crate-wide error,
//! so callers match on the narrow set of failures that operation can
//! actually produce.

use std::path::PathBuf;

use thiserror::Error;

/// Failures from [`crate::catalog::fetch_builds`].
#[derive(Debug, Error)]
pub enum CatalogError {
    /// `version_filter` did not parse as a version.
    #[error("invalid version filter {0:?}")]
    Config(String),
    /// Transport-level failure: DNS, TLS, connect, timeout.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    /// The server responded, but not usefully.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The response body was not a parseable catalog.
    #[error("failed to decode catalog response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Failures from [`crate::scanner::scan_local`].
#[derive(Debug, Error)]
pub enum ScanError {
    /// The top-level install root could not be enumerated.
    #[error("failed to read install root {path}: {source}")]
    Io {
        /// The directory that failed to read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Failures from the streaming archive extractor.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The archive's filename extension is not `.tar.xz` or `.zip`.
    #[error("unsupported archive format for {0:?}")]
    UnsupportedFormat(PathBuf),
    /// The archive could not be read or its structure was invalid.
    #[error("malformed archive: {0}")]
    Malformed(String),
    /// An I/O failure while reading the archive or writing an entry.
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The zip crate reported a structural error.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    /// Extraction was cancelled before completing.
    #[error("extraction cancelled")]
    Cancelled,
}

/// Failures from [`crate::install::install`].
#[derive(Debug, Error)]
pub enum InstallError {
    /// Malformed caller input, e.g. an install root that is not a directory.
    #[error("invalid install configuration: {0}")]
    Config(String),
    /// Transport-level failure while downloading the archive.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    /// The server responded, but not usefully (missing `Content-Length`, bad status).
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A filesystem operation (write, rename, remove) failed.
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    /// The downloaded archive could not be unpacked.
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    /// The install was cancelled. Distinguished from other errors so the UI
    /// can restore the entry's prior status instead of displaying an error.
    #[error("install cancelled")]
    Cancelled,
}
