//! Versioned bundle storage for hostbridge.
//!
//! This crate owns everything that touches the storage root on disk: the directory
//! layout (`StoreLayout`), per-identifier bundle records with embedded checksums
//! (`RecordStore`), deterministic tree digests and archive extraction into staging
//! (`tree`), the write-ahead log used to roll back interrupted provisioning
//! (`WriteAheadLog`), integrity verification, and garbage collection.

pub mod gc;
pub mod integrity;
pub mod layout;
pub mod records;
pub mod tree;
pub mod wal;

pub use gc::{GarbageCollector, GcReport};
pub use integrity::{verify_bundle_tree, verify_store_integrity, IntegrityFailure, IntegrityReport};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use records::{BundleIndex, BundleRecord, BundleStatus, RecordStore};
pub use tree::{
    detect_format, extract_archive, pack_tree, tree_digest, ExtractLimits, ExtractStats, TreeStats,
};
pub use wal::{RollbackStep, WalEntry, WalOpKind, WriteAheadLog};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so a preceding `rename()` inside it is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `content` to `dest` through a temp file in the same directory, then fsync the directory.
pub(crate) fn atomic_write(dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    use std::io::Write;

    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for '{what}': expected {expected}, got {actual}")]
    IntegrityFailure {
        what: String,
        expected: String,
        actual: String,
    },
    #[error("no record for bundle '{0}'")]
    RecordNotFound(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("bundle record invariant violated: {0}")]
    InvariantViolation(String),
    #[error("archive error: {0}")]
    Archive(String),
    #[error("archive expands beyond the declared size of {limit} bytes")]
    ArchiveTooLarge { limit: u64 },
    #[error("archive entry escapes the extraction root: {0}")]
    UnsafeEntry(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl StoreError {
    /// Whether this error came from a malformed or hostile archive rather than the store itself.
    pub fn is_archive_failure(&self) -> bool {
        matches!(
            self,
            StoreError::Archive(_) | StoreError::ArchiveTooLarge { .. } | StoreError::UnsafeEntry(_)
        )
    }
}
