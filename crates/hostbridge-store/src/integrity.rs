use crate::layout::StoreLayout;
use crate::records::{BundleRecord, BundleStatus, RecordStore};
use crate::tree::tree_digest;
use crate::StoreError;

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub records_checked: usize,
    pub records_passed: usize,
    pub trees_checked: usize,
    pub trees_passed: usize,
    pub failed: Vec<IntegrityFailure>,
}

#[derive(Debug)]
pub struct IntegrityFailure {
    pub bundle: String,
    pub version: Option<String>,
    pub reason: String,
}

/// Re-check an installed or superseded tree against its record.
///
/// Returns the failure reason on mismatch. The tree must exist, its digest must
/// equal the recorded one and its size must equal the declared size.
pub fn verify_bundle_tree(record: &BundleRecord) -> Result<(), String> {
    let Some(ref path) = record.install_path else {
        return Err("no install path recorded".to_owned());
    };
    if !path.is_dir() {
        return Err(format!("install tree missing at {}", path.display()));
    }
    let stats = tree_digest(path).map_err(|e| format!("failed to read tree: {e}"))?;
    if let Some(ref expected) = record.tree_digest {
        if *expected != stats.digest {
            return Err(format!(
                "tree digest mismatch: expected {expected}, got {}",
                stats.digest
            ));
        }
    }
    if stats.total_bytes != record.size {
        return Err(format!(
            "tree size mismatch: expected {} bytes, got {}",
            record.size, stats.total_bytes
        ));
    }
    Ok(())
}

/// Verify every record checksum and every installed or superseded tree. Read-only.
pub fn verify_store_integrity(layout: &StoreLayout) -> Result<IntegrityReport, StoreError> {
    let records = RecordStore::new(layout.clone());
    let mut report = IntegrityReport::default();

    for result in records.list_with_errors()? {
        report.records_checked += 1;
        let index = match result {
            Ok(index) => {
                report.records_passed += 1;
                index
            }
            Err((id, e)) => {
                report.failed.push(IntegrityFailure {
                    bundle: id,
                    version: None,
                    reason: format!("record unreadable: {e}"),
                });
                continue;
            }
        };

        for record in &index.versions {
            if !matches!(
                record.status,
                BundleStatus::Installed | BundleStatus::Superseded
            ) {
                continue;
            }
            report.trees_checked += 1;
            match verify_bundle_tree(record) {
                Ok(()) => report.trees_passed += 1,
                Err(reason) => report.failed.push(IntegrityFailure {
                    bundle: index.id.to_string(),
                    version: Some(record.version.to_string()),
                    reason,
                }),
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::BundleIndex;
    use hostbridge_schema::{BundleId, Version};
    use std::fs;

    fn install(layout: &StoreLayout, version: &str, status: BundleStatus) -> BundleRecord {
        let v: Version = version.parse().unwrap();
        let path = layout.install_path("jre", &v);
        fs::create_dir_all(path.join("lib")).unwrap();
        fs::write(path.join("lib/libjvm.so"), b"0123456789").unwrap();
        let stats = tree_digest(&path).unwrap();
        BundleRecord {
            id: BundleId::new("jre"),
            version: v,
            url: "file:///jre.tar".to_owned(),
            checksum: "c".repeat(64).parse().unwrap(),
            size: stats.total_bytes,
            status,
            install_path: Some(path),
            tree_digest: Some(stats.digest),
            libraries: vec!["lib/libjvm.so".to_owned()],
            entry_point: None,
            args: vec![],
            failure: None,
            created_at: "2025-01-01T00:00:00Z".to_owned(),
            updated_at: "2025-01-01T00:00:00Z".to_owned(),
        }
    }

    fn setup() -> (tempfile::TempDir, StoreLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, layout)
    }

    #[test]
    fn clean_store_passes() {
        let (_dir, layout) = setup();
        let mut index = BundleIndex::new(BundleId::new("jre"));
        index.upsert(install(&layout, "1.0.0", BundleStatus::Superseded));
        index.upsert(install(&layout, "1.1.0", BundleStatus::Installed));
        RecordStore::new(layout.clone()).put(&index).unwrap();

        let report = verify_store_integrity(&layout).unwrap();
        assert_eq!(report.records_checked, 1);
        assert_eq!(report.trees_checked, 2);
        assert_eq!(report.trees_passed, 2);
        assert!(report.failed.is_empty());
    }

    #[test]
    fn modified_tree_is_detected() {
        let (_dir, layout) = setup();
        let record = install(&layout, "1.0.0", BundleStatus::Installed);
        let path = record.install_path.clone().unwrap();
        let mut index = BundleIndex::new(BundleId::new("jre"));
        index.upsert(record);
        RecordStore::new(layout.clone()).put(&index).unwrap();

        fs::write(path.join("lib/libjvm.so"), b"9876543210").unwrap();
        let report = verify_store_integrity(&layout).unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].reason.contains("digest mismatch"));
        assert_eq!(report.failed[0].version.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn missing_tree_is_detected() {
        let (_dir, layout) = setup();
        let record = install(&layout, "1.0.0", BundleStatus::Installed);
        fs::remove_dir_all(record.install_path.as_ref().unwrap()).unwrap();
        let err = verify_bundle_tree(&record).unwrap_err();
        assert!(err.contains("missing"));
    }

    #[test]
    fn corrupt_record_is_reported() {
        let (_dir, layout) = setup();
        fs::write(layout.record_path("jre"), "{ not json").unwrap();
        let report = verify_store_integrity(&layout).unwrap();
        assert_eq!(report.records_checked, 1);
        assert_eq!(report.records_passed, 0);
        assert_eq!(report.failed[0].bundle, "jre");
    }

    #[test]
    fn corrupt_versions_are_not_tree_checked() {
        let (_dir, layout) = setup();
        let mut record = install(&layout, "1.0.0", BundleStatus::Corrupt);
        record.install_path = None;
        let mut index = BundleIndex::new(BundleId::new("jre"));
        index.upsert(record);
        RecordStore::new(layout.clone()).put(&index).unwrap();

        let report = verify_store_integrity(&layout).unwrap();
        assert_eq!(report.trees_checked, 0);
        assert!(report.failed.is_empty());
    }
}
