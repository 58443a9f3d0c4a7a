//! Provisioning through the public API: concurrent requests, interrupted and
//! corrupted transfers, and recovery after a crash mid-install.

use hostbridge_core::{ProvisioningError, ProvisioningManager};
use hostbridge_fetch::{ArchiveSource, CancelToken, FetchError, MemorySource, SourceStream};
use hostbridge_schema::{ArchiveFormat, BundleId, ManifestEntry};
use hostbridge_store::{
    pack_tree, BundleStatus, RecordStore, RollbackStep, StoreLayout, WalOpKind, WriteAheadLog,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const URL: &str = "mem://jre.tar";

/// Lets a test keep a handle on the source the manager owns.
struct Shared(Arc<MemorySource>);

impl ArchiveSource for Shared {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn open(&self, reference: &str, offset: u64) -> Result<SourceStream, FetchError> {
        self.0.open(reference, offset)
    }
}

fn bundle(version: &str) -> (Vec<u8>, ManifestEntry) {
    let src = tempfile::tempdir().unwrap();
    fs::create_dir_all(src.path().join("lib")).unwrap();
    // Large enough that a transfer can be cut in the middle.
    let payload = vec![0x5a_u8; 64 * 1024];
    fs::write(src.path().join("lib/libjvm.so"), &payload).unwrap();
    fs::write(src.path().join("release"), b"JAVA_VERSION=17").unwrap();
    let archive = pack_tree(src.path(), ArchiveFormat::Tar).unwrap();
    let entry = ManifestEntry {
        id: BundleId::new("jre"),
        version: version.parse().unwrap(),
        url: URL.to_owned(),
        checksum: blake3::hash(&archive).to_hex().to_string().parse().unwrap(),
        size: payload.len() as u64 + 15,
        format: None,
        tree_checksum: None,
        libraries: vec!["lib/libjvm.so".to_owned()],
        entry_point: None,
        args: vec![],
    };
    (archive, entry)
}

fn status_of(store: &Path, version: &str) -> BundleStatus {
    let index = RecordStore::new(StoreLayout::new(store))
        .get("jre")
        .unwrap()
        .unwrap();
    index.get(&version.parse().unwrap()).unwrap().status
}

#[test]
fn concurrent_requests_share_one_install() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, entry) = bundle("17.0.8");
    let source = Arc::new(
        MemorySource::new()
            .with_blob(URL, archive)
            .with_delay(Duration::from_millis(200)),
    );
    let mgr = Arc::new(ProvisioningManager::new(
        dir.path(),
        Box::new(Shared(Arc::clone(&source))),
    ));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let mgr = Arc::clone(&mgr);
            let entry = entry.clone();
            thread::spawn(move || mgr.provision(&entry, &CancelToken::new()).unwrap())
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(source.open_count(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.extracted && !o.joined).count(), 1);
    let first = &outcomes[0].bundle;
    assert!(outcomes.iter().all(|o| o.bundle.install_path == first.install_path));
    assert_eq!(first.status, BundleStatus::Installed);
}

#[test]
fn interrupted_transfer_resumes_on_retry() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, entry) = bundle("17.0.8");
    let source = Arc::new(MemorySource::new().with_blob(URL, archive.clone()));
    source.fail_next_after(20_000);
    let mgr = ProvisioningManager::new(dir.path(), Box::new(Shared(Arc::clone(&source))));

    let err = mgr.provision(&entry, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, ProvisioningError::Network(_)));
    assert!(err.is_retryable());
    assert_eq!(status_of(dir.path(), "17.0.8"), BundleStatus::Absent);
    assert!(mgr.installed("jre").unwrap().is_none());

    let outcome = mgr.provision(&entry, &CancelToken::new()).unwrap();
    assert!(outcome.resumed);
    assert!(outcome.downloaded_bytes < archive.len() as u64);
    assert_eq!(outcome.bundle.status, BundleStatus::Installed);
}

#[test]
fn corrupted_transfer_then_clean_retry() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, entry) = bundle("17.0.8");
    let mut damaged = archive.clone();
    let mid = damaged.len() / 2;
    damaged[mid] ^= 0xff;
    let source = Arc::new(MemorySource::new().with_blob(URL, damaged));
    let mgr = ProvisioningManager::new(dir.path(), Box::new(Shared(Arc::clone(&source))));

    let err = mgr.provision(&entry, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, ProvisioningError::ChecksumMismatch { .. }));
    assert_eq!(status_of(dir.path(), "17.0.8"), BundleStatus::Corrupt);
    assert!(mgr.require_installed("jre", None).is_err());
    let layout = StoreLayout::new(dir.path());
    assert!(!layout.partial_download("jre", &entry.version).exists());

    source.insert(URL, archive.clone());
    let outcome = mgr.provision(&entry, &CancelToken::new()).unwrap();
    assert!(!outcome.resumed);
    assert_eq!(outcome.downloaded_bytes, archive.len() as u64);
    let record = mgr.require_installed("jre", Some(&entry.version)).unwrap();
    assert!(record.failure.is_none());
}

#[test]
fn failed_upgrade_keeps_previous_version_launchable() {
    let dir = tempfile::tempdir().unwrap();
    let (old_archive, old) = bundle("17.0.8");
    let (_, mut new) = bundle("17.0.9");
    new.url = "mem://jre-17.0.9.tar".to_owned();
    let source = Arc::new(
        MemorySource::new()
            .with_blob(URL, old_archive)
            .with_blob(&new.url, b"not a tar archive".to_vec()),
    );
    let mgr = ProvisioningManager::new(dir.path(), Box::new(Shared(source)));

    mgr.provision(&old, &CancelToken::new()).unwrap();
    assert!(mgr.provision(&new, &CancelToken::new()).is_err());

    let installed = mgr.require_installed("jre", None).unwrap();
    assert_eq!(installed.version, old.version);
    assert_eq!(status_of(dir.path(), "17.0.9"), BundleStatus::Corrupt);
}

#[test]
fn recovery_marks_half_installed_bundle_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let (_, entry) = bundle("17.0.8");
    let layout = StoreLayout::new(dir.path());
    layout.initialize().unwrap();

    // State left by a process that died while extracting.
    let records = RecordStore::new(layout.clone());
    let mut index = records.get_or_new(&entry.id).unwrap();
    index.upsert(hostbridge_store::BundleRecord::from_entry(
        &entry,
        BundleStatus::Verifying,
    ));
    records.put(&index).unwrap();
    let staging = layout.staging_path("jre", &entry.version);
    fs::create_dir_all(staging.join("lib")).unwrap();
    fs::write(staging.join("lib/libjvm.so"), b"half").unwrap();
    let wal = WriteAheadLog::new(&layout);
    let op = wal.begin(WalOpKind::Provision, "jre").unwrap();
    wal.add_rollback_step(
        &op,
        RollbackStep::MarkCorrupt {
            bundle_id: "jre".to_owned(),
            version: "17.0.8".to_owned(),
        },
    )
    .unwrap();
    wal.add_rollback_step(&op, RollbackStep::RemoveDir(staging.clone()))
        .unwrap();

    let mgr = ProvisioningManager::new(dir.path(), Box::new(MemorySource::new()));
    assert!(!staging.exists());
    assert!(wal.list_incomplete().unwrap().is_empty());
    assert_eq!(status_of(dir.path(), "17.0.8"), BundleStatus::Corrupt);
    assert!(mgr.installed("jre").unwrap().is_none());
}

#[test]
fn cancelled_waiter_does_not_cancel_the_install() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, entry) = bundle("17.0.8");
    let source = MemorySource::new()
        .with_blob(URL, archive)
        .with_delay(Duration::from_millis(500));
    let mgr = Arc::new(ProvisioningManager::new(dir.path(), Box::new(source)));

    let leader = {
        let mgr = Arc::clone(&mgr);
        let entry = entry.clone();
        thread::spawn(move || mgr.provision(&entry, &CancelToken::new()))
    };
    thread::sleep(Duration::from_millis(100));
    let cancelled = CancelToken::new();
    cancelled.cancel();
    let joined = mgr.provision(&entry, &cancelled);

    let led = leader.join().unwrap().unwrap();
    assert!(led.extracted);
    let joined = joined.unwrap();
    assert_eq!(joined.bundle.install_path, led.bundle.install_path);
}
