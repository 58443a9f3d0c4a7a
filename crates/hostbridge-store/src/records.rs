use crate::layout::StoreLayout;
use crate::StoreError;
use hostbridge_schema::{BundleId, Checksum, ManifestEntry, TreeDigest, Version};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    Absent,
    Downloading,
    Verifying,
    Installed,
    Corrupt,
    /// Previous installed version kept on disk for rollback. Never launchable.
    Superseded,
}

impl std::fmt::Display for BundleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BundleStatus::Absent => write!(f, "absent"),
            BundleStatus::Downloading => write!(f, "downloading"),
            BundleStatus::Verifying => write!(f, "verifying"),
            BundleStatus::Installed => write!(f, "installed"),
            BundleStatus::Corrupt => write!(f, "corrupt"),
            BundleStatus::Superseded => write!(f, "superseded"),
        }
    }
}

/// One version of one runtime bundle as recorded in the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleRecord {
    pub id: BundleId,
    pub version: Version,
    pub url: String,
    pub checksum: Checksum,
    pub size: u64,
    pub status: BundleStatus,
    #[serde(default)]
    pub install_path: Option<PathBuf>,
    #[serde(default)]
    pub tree_digest: Option<TreeDigest>,
    #[serde(default)]
    pub libraries: Vec<String>,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Why the bundle was last marked corrupt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl BundleRecord {
    pub fn from_entry(entry: &ManifestEntry, status: BundleStatus) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: entry.id.clone(),
            version: entry.version.clone(),
            url: entry.url.clone(),
            checksum: entry.checksum.clone(),
            size: entry.size,
            status,
            install_path: None,
            tree_digest: None,
            libraries: entry.libraries.clone(),
            entry_point: entry.entry_point.clone(),
            args: entry.args.clone(),
            failure: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Whether this record describes the same archive as the manifest entry.
    pub fn matches_entry(&self, entry: &ManifestEntry) -> bool {
        self.version == entry.version && self.checksum == entry.checksum && self.size == entry.size
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }
}

/// Every recorded version of one bundle identifier, persisted as a single file.
///
/// Keeping all versions in one file makes the installed/superseded swap a single
/// atomic write: readers see either the old installed version or the new one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleIndex {
    pub id: BundleId,
    pub versions: Vec<BundleRecord>,
    /// blake3 checksum over the index content. `None` only before the first write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl BundleIndex {
    pub fn new(id: BundleId) -> Self {
        Self {
            id,
            versions: Vec::new(),
            checksum: None,
        }
    }

    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }

    pub fn installed(&self) -> Option<&BundleRecord> {
        self.versions
            .iter()
            .find(|r| r.status == BundleStatus::Installed)
    }

    pub fn get(&self, version: &Version) -> Option<&BundleRecord> {
        self.versions.iter().find(|r| r.version == *version)
    }

    pub fn get_mut(&mut self, version: &Version) -> Option<&mut BundleRecord> {
        self.versions.iter_mut().find(|r| r.version == *version)
    }

    /// Superseded versions, newest first.
    pub fn superseded(&self) -> Vec<&BundleRecord> {
        let mut out: Vec<_> = self
            .versions
            .iter()
            .filter(|r| r.status == BundleStatus::Superseded)
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.version.cmp(&a.version)));
        out
    }

    /// Insert or replace the record for `record.version`.
    pub fn upsert(&mut self, record: BundleRecord) {
        if let Some(existing) = self.get_mut(&record.version) {
            *existing = record;
        } else {
            self.versions.push(record);
            self.versions.sort_by(|a, b| a.version.cmp(&b.version));
        }
    }

    pub fn set_status(&mut self, version: &Version, status: BundleStatus) -> bool {
        match self.get_mut(version) {
            Some(r) => {
                r.status = status;
                r.touch();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, version: &Version) -> Option<BundleRecord> {
        let pos = self.versions.iter().position(|r| r.version == *version)?;
        Some(self.versions.remove(pos))
    }

    /// Make `version` the installed one and demote the previous installed version
    /// to superseded. Returns the demoted version, if any.
    pub fn promote(&mut self, version: &Version) -> Result<Option<Version>, StoreError> {
        if self.get(version).is_none() {
            return Err(StoreError::RecordNotFound(format!("{}@{version}", self.id)));
        }
        let mut demoted = None;
        for r in &mut self.versions {
            if r.status == BundleStatus::Installed && r.version != *version {
                r.status = BundleStatus::Superseded;
                r.touch();
                demoted = Some(r.version.clone());
            }
        }
        if let Some(r) = self.get_mut(version) {
            r.status = BundleStatus::Installed;
            r.failure = None;
            r.touch();
        }
        Ok(demoted)
    }

    fn validate(&self) -> Result<(), StoreError> {
        let installed = self
            .versions
            .iter()
            .filter(|r| r.status == BundleStatus::Installed)
            .count();
        if installed > 1 {
            return Err(StoreError::InvariantViolation(format!(
                "{installed} installed versions of '{}'",
                self.id
            )));
        }
        for r in &self.versions {
            if r.id != self.id {
                return Err(StoreError::InvariantViolation(format!(
                    "record for '{}' stored under '{}'",
                    r.id, self.id
                )));
            }
            if r.status == BundleStatus::Installed && r.install_path.is_none() {
                return Err(StoreError::InvariantViolation(format!(
                    "installed {}@{} has no install path",
                    r.id, r.version
                )));
            }
        }
        Ok(())
    }
}

pub struct RecordStore {
    layout: StoreLayout,
}

impl RecordStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn put(&self, index: &BundleIndex) -> Result<(), StoreError> {
        index.validate()?;
        let mut with_checksum = index.clone();
        with_checksum.checksum = Some(with_checksum.compute_checksum()?);
        let content = serde_json::to_string_pretty(&with_checksum)?;
        crate::atomic_write(&self.layout.record_path(&index.id), content.as_bytes())
    }

    /// Read and verify the index for `id`. `Ok(None)` when nothing is recorded.
    pub fn get(&self, id: &str) -> Result<Option<BundleIndex>, StoreError> {
        let path = self.layout.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let index: BundleIndex = serde_json::from_str(&content)?;

        let actual = index.compute_checksum()?;
        match index.checksum {
            Some(ref expected) if *expected == actual => Ok(Some(index)),
            Some(ref expected) => Err(StoreError::IntegrityFailure {
                what: format!("record {id}"),
                expected: expected.clone(),
                actual,
            }),
            None => Err(StoreError::IntegrityFailure {
                what: format!("record {id}"),
                expected: "embedded checksum".to_owned(),
                actual,
            }),
        }
    }

    /// Like [`get`](Self::get), but an absent index yields an empty one.
    pub fn get_or_new(&self, id: &BundleId) -> Result<BundleIndex, StoreError> {
        Ok(self
            .get(id)?
            .unwrap_or_else(|| BundleIndex::new(id.clone())))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.layout.record_path(id).exists()
    }

    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        let path = self.layout.record_path(id);
        if path.exists() {
            fs::remove_file(path)?;
            crate::fsync_dir(&self.layout.records_dir())?;
        }
        Ok(())
    }

    fn ids(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.layout.records_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// All readable indexes sorted by identifier. Corrupt records are skipped with a warning.
    pub fn list(&self) -> Result<Vec<BundleIndex>, StoreError> {
        let mut results = Vec::new();
        for id in self.ids()? {
            match self.get(&id) {
                Ok(Some(index)) => results.push(index),
                Ok(None) => {}
                Err(e) => tracing::warn!("skipping corrupted record '{id}': {e}"),
            }
        }
        Ok(results)
    }

    /// Like `list()`, but returns per-record `Result`s so integrity checks can
    /// surface individual corruption errors.
    #[allow(clippy::type_complexity)]
    pub fn list_with_errors(
        &self,
    ) -> Result<Vec<Result<BundleIndex, (String, StoreError)>>, StoreError> {
        let mut results = Vec::new();
        for id in self.ids()? {
            match self.get(&id) {
                Ok(Some(index)) => results.push(Ok(index)),
                Ok(None) => {}
                Err(e) => results.push(Err((id, e))),
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_record_store() -> (tempfile::TempDir, RecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, RecordStore::new(layout))
    }

    fn sample_record(version: &str, status: BundleStatus) -> BundleRecord {
        BundleRecord {
            id: BundleId::new("jre"),
            version: version.parse().unwrap(),
            url: "https://mirror.example/jre.tar.gz".to_owned(),
            checksum: "a".repeat(64).parse().unwrap(),
            size: 10,
            status,
            install_path: Some(PathBuf::from(format!("/store/bundles/jre/{version}"))),
            tree_digest: None,
            libraries: vec![],
            entry_point: None,
            args: vec![],
            failure: None,
            created_at: "2025-01-01T00:00:00Z".to_owned(),
            updated_at: "2025-01-01T00:00:00Z".to_owned(),
        }
    }

    #[test]
    fn index_roundtrip_embeds_checksum() {
        let (_dir, store) = test_record_store();
        let mut index = BundleIndex::new(BundleId::new("jre"));
        index.upsert(sample_record("17.0.8", BundleStatus::Installed));
        store.put(&index).unwrap();

        let loaded = store.get("jre").unwrap().unwrap();
        assert!(loaded.checksum.is_some(), "put() must embed a checksum");
        assert_eq!(loaded.versions, index.versions);
    }

    #[test]
    fn missing_index_is_none() {
        let (_dir, store) = test_record_store();
        assert!(store.get("nothing").unwrap().is_none());
        let index = store.get_or_new(&BundleId::new("nothing")).unwrap();
        assert!(index.versions.is_empty());
    }

    #[test]
    fn tampered_index_is_rejected() {
        let (dir, store) = test_record_store();
        let mut index = BundleIndex::new(BundleId::new("jre"));
        index.upsert(sample_record("17.0.8", BundleStatus::Corrupt));
        store.put(&index).unwrap();

        let path = StoreLayout::new(dir.path()).record_path("jre");
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("corrupt", "installed")).unwrap();

        assert!(matches!(
            store.get("jre"),
            Err(StoreError::IntegrityFailure { .. })
        ));
        assert!(store.list().unwrap().is_empty());
        assert_eq!(store.list_with_errors().unwrap().len(), 1);
    }

    #[test]
    fn put_rejects_two_installed_versions() {
        let (_dir, store) = test_record_store();
        let mut index = BundleIndex::new(BundleId::new("jre"));
        index.upsert(sample_record("17.0.8", BundleStatus::Installed));
        index.upsert(sample_record("17.0.9", BundleStatus::Installed));
        assert!(matches!(
            store.put(&index),
            Err(StoreError::InvariantViolation(_))
        ));
    }

    #[test]
    fn promote_demotes_previous_installed() {
        let mut index = BundleIndex::new(BundleId::new("jre"));
        index.upsert(sample_record("17.0.8", BundleStatus::Installed));
        index.upsert(sample_record("17.0.9", BundleStatus::Verifying));

        let demoted = index.promote(&"17.0.9".parse().unwrap()).unwrap();
        assert_eq!(demoted.unwrap().to_string(), "17.0.8");
        assert_eq!(index.installed().unwrap().version.to_string(), "17.0.9");
        assert_eq!(index.superseded().len(), 1);
    }

    #[test]
    fn promote_unknown_version_fails() {
        let mut index = BundleIndex::new(BundleId::new("jre"));
        assert!(index.promote(&Version::new(1, 0, 0)).is_err());
    }

    #[test]
    fn upsert_keeps_versions_sorted() {
        let mut index = BundleIndex::new(BundleId::new("jre"));
        index.upsert(sample_record("2.0.0", BundleStatus::Corrupt));
        index.upsert(sample_record("1.0.0", BundleStatus::Corrupt));
        index.upsert(sample_record("1.0.0", BundleStatus::Downloading));
        let versions: Vec<String> = index.versions.iter().map(|r| r.version.to_string()).collect();
        assert_eq!(versions, vec!["1.0.0", "2.0.0"]);
        assert_eq!(index.versions[0].status, BundleStatus::Downloading);
    }

    #[test]
    fn list_is_sorted_and_remove_works() {
        let (_dir, store) = test_record_store();
        for id in ["zeta", "alpha"] {
            let mut index = BundleIndex::new(BundleId::new(id));
            let mut record = sample_record("1.0.0", BundleStatus::Corrupt);
            record.id = BundleId::new(id);
            index.upsert(record);
            store.put(&index).unwrap();
        }
        let ids: Vec<String> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|i| i.id.into_inner())
            .collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);

        store.remove("alpha").unwrap();
        assert!(!store.exists("alpha"));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn status_display() {
        assert_eq!(BundleStatus::Installed.to_string(), "installed");
        assert_eq!(BundleStatus::Superseded.to_string(), "superseded");
    }
}
