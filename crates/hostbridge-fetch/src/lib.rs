//! Archive transfer for bundle provisioning.
//!
//! An [`ArchiveSource`] opens a byte stream for a download reference, optionally
//! starting at an offset. [`HttpSource`] speaks `http(s)://` with range requests,
//! [`FileSource`] reads `file://` references, and [`AnySource`] dispatches by
//! scheme. [`download`] drives a source into a partial file in fixed-size
//! chunks, resumes interrupted transfers, honours a [`CancelToken`] between
//! chunks and verifies the archive checksum once the transfer is complete.

pub mod cancel;
pub mod config;
pub mod download;
pub mod file;
pub mod http;
pub mod mock;

pub use cancel::CancelToken;
pub use config::FetchConfig;
pub use download::{download, hash_file, DownloadOutcome, DownloadRequest, CHUNK_SIZE};
pub use file::FileSource;
pub use http::HttpSource;
pub use mock::MemorySource;

use std::io::Read;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("network error: {0}")]
    Network(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported reference '{0}': expected http://, https:// or file://")]
    UnsupportedScheme(String),
    #[error("fetch config error: {0}")]
    Config(String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("download cancelled")]
    Cancelled,
}

/// An open transfer.
pub struct SourceStream {
    pub reader: Box<dyn Read>,
    /// Total archive length in bytes, when the source knows it.
    pub total_len: Option<u64>,
    /// Whether the stream starts at the requested offset. `false` means the
    /// source restarted from byte zero and any partial data must be discarded.
    pub resumed: bool,
}

/// A place archives can be read from.
pub trait ArchiveSource: Send + Sync {
    fn name(&self) -> &str;

    /// Open `reference` starting at byte `offset`.
    fn open(&self, reference: &str, offset: u64) -> Result<SourceStream, FetchError>;
}

/// Pick the source for a reference by its scheme.
pub fn select_source(
    reference: &str,
    config: &FetchConfig,
) -> Result<Box<dyn ArchiveSource>, FetchError> {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        Ok(Box::new(HttpSource::new(config.clone())))
    } else if reference.starts_with("file://") {
        Ok(Box::new(FileSource))
    } else {
        Err(FetchError::UnsupportedScheme(reference.to_owned()))
    }
}

/// Dispatches every `open` to the source matching the reference scheme.
pub struct AnySource {
    http: HttpSource,
}

impl AnySource {
    pub fn new(config: FetchConfig) -> Self {
        Self {
            http: HttpSource::new(config),
        }
    }
}

impl ArchiveSource for AnySource {
    fn name(&self) -> &'static str {
        "any"
    }

    fn open(&self, reference: &str, offset: u64) -> Result<SourceStream, FetchError> {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            self.http.open(reference, offset)
        } else if reference.starts_with("file://") {
            FileSource.open(reference, offset)
        } else {
            Err(FetchError::UnsupportedScheme(reference.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_by_scheme() {
        let config = FetchConfig::default();
        assert_eq!(
            select_source("https://x/y.tar", &config).unwrap().name(),
            "http"
        );
        assert_eq!(
            select_source("file:///tmp/y.tar", &config).unwrap().name(),
            "file"
        );
        assert!(matches!(
            select_source("ftp://x/y", &config),
            Err(FetchError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn any_source_rejects_unknown_scheme() {
        let source = AnySource::new(FetchConfig::default());
        assert!(matches!(
            source.open("gopher://x", 0),
            Err(FetchError::UnsupportedScheme(_))
        ));
    }
}
