use crate::StoreError;
use hostbridge_schema::Version;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of a bundle storage root.
///
/// ```text
/// <root>/bundles/<id>/<version>/        installed and superseded trees
/// <root>/staging/<id>/<version>.<nonce>/ extraction in progress
/// <root>/downloads/<id>/<version>.part  partial archive (+ .part.json sidecar)
/// <root>/store/records/<id>.json        every recorded version of <id>
/// <root>/store/locks/<id>.lock          per-identifier installation lock
/// <root>/store/wal/                     write-ahead log
/// ```
///
/// Staging and final trees live under different top-level directories, so a
/// partially extracted bundle can never share a path with an installed one.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    #[inline]
    pub fn records_dir(&self) -> PathBuf {
        self.store_dir().join("records")
    }

    #[inline]
    pub fn record_path(&self, id: &str) -> PathBuf {
        self.records_dir().join(format!("{id}.json"))
    }

    #[inline]
    pub fn locks_dir(&self) -> PathBuf {
        self.store_dir().join("locks")
    }

    #[inline]
    pub fn bundle_lock_file(&self, id: &str) -> PathBuf {
        self.locks_dir().join(format!("{id}.lock"))
    }

    /// Store-wide lock: shared by provisioning, exclusive for GC.
    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.store_dir().join(".lock")
    }

    #[inline]
    pub fn wal_dir(&self) -> PathBuf {
        self.store_dir().join("wal")
    }

    #[inline]
    pub fn bundles_dir(&self) -> PathBuf {
        self.root.join("bundles")
    }

    #[inline]
    pub fn bundle_dir(&self, id: &str) -> PathBuf {
        self.bundles_dir().join(id)
    }

    #[inline]
    pub fn install_path(&self, id: &str, version: &Version) -> PathBuf {
        self.bundle_dir(id).join(version.to_string())
    }

    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    /// A fresh staging directory for one extraction attempt.
    pub fn staging_path(&self, id: &str, version: &Version) -> PathBuf {
        let nonce = format!(
            "{}{:x}",
            chrono::Utc::now().format("%Y%m%d%H%M%S%f"),
            std::process::id()
        );
        self.staging_dir().join(id).join(format!("{version}.{nonce}"))
    }

    #[inline]
    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("downloads")
    }

    #[inline]
    pub fn partial_download(&self, id: &str, version: &Version) -> PathBuf {
        self.downloads_dir().join(id).join(format!("{version}.part"))
    }

    /// Sidecar binding a partial download to its source reference and checksum.
    #[inline]
    pub fn partial_sidecar(&self, id: &str, version: &Version) -> PathBuf {
        self.downloads_dir()
            .join(id)
            .join(format!("{version}.part.json"))
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.records_dir())?;
        fs::create_dir_all(self.locks_dir())?;
        fs::create_dir_all(self.wal_dir())?;
        fs::create_dir_all(self.bundles_dir())?;
        fs::create_dir_all(self.staging_dir())?;
        fs::create_dir_all(self.downloads_dir())?;

        let version_path = self.store_dir().join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            crate::atomic_write(&version_path, content.as_bytes())?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.store_dir().join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
