//! Turning manifest entries into installed runtime bundles.
//!
//! A provisioning run downloads the archive into a resumable partial file,
//! extracts it into a private staging directory, verifies the extracted tree
//! against the declared size and optional tree checksum, renames the tree into
//! its install path and only then promotes the record to `installed`. The
//! previous installed version is demoted to `superseded` in the same record
//! write, so it stays available for rollback.
//!
//! Every side effect is preceded by a write-ahead log step, and runs for the same
//! identifier are serialized both in-process (single flight) and across
//! processes (advisory install lock).

use crate::concurrency::{shutdown_requested, SingleFlight, StoreLock};
use crate::{CoreError, ProvisioningError};
use hostbridge_fetch::{download, AnySource, ArchiveSource, CancelToken, DownloadRequest, FetchConfig};
use hostbridge_schema::{validate_bundle_id, ManifestEntry, ProvisioningManifest, Version};
use hostbridge_store::{
    extract_archive, tree_digest, verify_bundle_tree, BundleIndex, BundleRecord, BundleStatus,
    ExtractLimits, GarbageCollector, GcReport, RecordStore, RollbackStep, StoreLayout, WalOpKind,
    WriteAheadLog,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Observer for long-running provisioning steps, called with the bundle identifier.
pub type ProgressFn = Arc<dyn Fn(&str, ProvisionPhase) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionPhase {
    Downloading { received: u64, total: Option<u64> },
    Extracting,
    Verifying,
    Installed,
}

/// Result of a provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub bundle: BundleRecord,
    /// Bytes received from the source by this run.
    pub downloaded_bytes: u64,
    pub resumed: bool,
    pub extracted: bool,
    /// Produced by a concurrent caller provisioning the same entry.
    pub joined: bool,
}

impl ProvisionOutcome {
    fn existing(bundle: BundleRecord) -> Self {
        Self {
            bundle,
            downloaded_bytes: 0,
            resumed: false,
            extracted: false,
            joined: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyFailure {
    pub bundle: String,
    pub version: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub checked: usize,
    pub passed: usize,
    pub failures: Vec<VerifyFailure>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub versions_removed: Vec<String>,
    pub paths_removed: usize,
}

type FlightResult = Result<ProvisionOutcome, ProvisioningError>;

pub struct ProvisioningManager {
    layout: StoreLayout,
    records: RecordStore,
    wal: WriteAheadLog,
    source: Box<dyn ArchiveSource>,
    flights: SingleFlight<FlightResult>,
    progress: Option<ProgressFn>,
}

fn lock_failed(e: CoreError) -> ProvisioningError {
    ProvisioningError::Store(format!("failed to lock store: {e}"))
}

fn recorded(index: &BundleIndex, version: &Version) -> Result<BundleRecord, ProvisioningError> {
    index.get(version).cloned().ok_or_else(|| {
        ProvisioningError::Store(format!("record for {}@{version} vanished", index.id))
    })
}

fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    fs::File::open(dir)?.sync_all()
}

impl ProvisioningManager {
    /// Create a manager for the storage root at `store_root`.
    ///
    /// Incomplete operations left in the write-ahead log by an earlier run are
    /// rolled back here, unless another process currently holds the store.
    pub fn new(store_root: impl Into<PathBuf>, source: Box<dyn ArchiveSource>) -> Self {
        let root: PathBuf = store_root.into();
        let layout = StoreLayout::new(&root);
        let records = RecordStore::new(layout.clone());
        let wal = WriteAheadLog::new(&layout);

        match StoreLock::try_acquire(&layout.lock_file()) {
            Ok(Some(_lock)) => {
                if let Err(e) = wal.recover() {
                    warn!("WAL recovery failed: {e}");
                }
            }
            Ok(None) => {
                debug!("store lock held; skipping WAL recovery");
            }
            Err(e) => {
                warn!("store lock check failed; skipping WAL recovery: {e}");
            }
        }

        Self {
            layout,
            records,
            wal,
            source,
            flights: SingleFlight::new(),
            progress: None,
        }
    }

    /// A manager fetching `http(s)://` and `file://` references.
    pub fn with_fetch_config(store_root: impl Into<PathBuf>, config: FetchConfig) -> Self {
        Self::new(store_root, Box::new(AnySource::new(config)))
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn report(&self, id: &str, phase: ProvisionPhase) {
        if let Some(ref progress) = self.progress {
            progress(id, phase);
        }
    }

    /// Produce an installed bundle for `entry`.
    ///
    /// A concurrent call for the same entry waits for the running one and
    /// returns its result with `joined` set.
    pub fn provision(
        &self,
        entry: &ManifestEntry,
        cancel: &CancelToken,
    ) -> Result<ProvisionOutcome, ProvisioningError> {
        let tag = format!("{}:{}", entry.version, entry.checksum.as_hex());
        let abandoned = Err(ProvisioningError::Store(format!(
            "provisioning of '{}' was abandoned",
            entry.id
        )));
        let (result, joined) = self.flights.run(entry.id.as_str(), &tag, abandoned, || {
            self.provision_locked(entry, cancel)
        });
        if joined {
            debug!("joined in-flight provisioning of {}@{}", entry.id, entry.version);
        }
        result.map(|mut outcome| {
            outcome.joined = joined;
            outcome
        })
    }

    /// Provision every entry in identifier order, stopping at the first failure.
    pub fn provision_manifest(
        &self,
        manifest: &ProvisioningManifest,
        cancel: &CancelToken,
    ) -> Result<Vec<ProvisionOutcome>, ProvisioningError> {
        let mut outcomes = Vec::new();
        for entry in manifest.entries()? {
            if cancel.is_cancelled() {
                return Err(ProvisioningError::Cancelled);
            }
            outcomes.push(self.provision(&entry, cancel)?);
        }
        Ok(outcomes)
    }

    fn provision_locked(
        &self,
        entry: &ManifestEntry,
        cancel: &CancelToken,
    ) -> Result<ProvisionOutcome, ProvisioningError> {
        let id = entry.id.as_str();
        self.layout.initialize()?;
        let _store_lock = StoreLock::acquire_shared(&self.layout.lock_file()).map_err(lock_failed)?;
        let _install_lock =
            StoreLock::acquire(&self.layout.bundle_lock_file(id)).map_err(lock_failed)?;

        let mut index = self.records.get_or_new(&entry.id)?;
        if let Some(installed) = index.installed() {
            if installed.version == entry.version {
                if !installed.matches_entry(entry) {
                    return Err(ProvisioningError::VersionConflict {
                        bundle: id.to_owned(),
                        version: entry.version.to_string(),
                    });
                }
                if installed.install_path.as_ref().is_some_and(|p| p.is_dir()) {
                    debug!("{id}@{} already installed", entry.version);
                    return Ok(ProvisionOutcome::existing(installed.clone()));
                }
                warn!(
                    "{id}@{} is recorded as installed but its tree is missing, reinstalling",
                    entry.version
                );
            }
        }

        if let Some(previous) = index.get(&entry.version) {
            if previous.status == BundleStatus::Superseded
                && previous.matches_entry(entry)
                && verify_bundle_tree(previous).is_ok()
            {
                info!("reinstating superseded {id}@{}", entry.version);
                index.promote(&entry.version)?;
                self.records.put(&index)?;
                let bundle = recorded(&index, &entry.version)?;
                self.report(id, ProvisionPhase::Installed);
                return Ok(ProvisionOutcome::existing(bundle));
            }
        }

        self.install(entry, index, cancel)
    }

    fn install(
        &self,
        entry: &ManifestEntry,
        mut index: BundleIndex,
        cancel: &CancelToken,
    ) -> Result<ProvisionOutcome, ProvisioningError> {
        let id = entry.id.as_str();
        info!("provisioning {id}@{} from {}", entry.version, entry.url);
        let op_id = self.wal.begin(WalOpKind::Provision, id)?;

        match self.install_steps(entry, &mut index, &op_id, cancel) {
            Ok(outcome) => {
                self.wal.commit(&op_id)?;
                info!("installed {id}@{}", entry.version);
                Ok(outcome)
            }
            Err(e) => {
                self.record_failure(entry, &e);
                if let Err(abort_err) = self.wal.abort(&op_id) {
                    warn!("failed to roll back provisioning of {id}: {abort_err}");
                }
                warn!("provisioning {id}@{} failed: {e}", entry.version);
                Err(e)
            }
        }
    }

    fn install_steps(
        &self,
        entry: &ManifestEntry,
        index: &mut BundleIndex,
        op_id: &str,
        cancel: &CancelToken,
    ) -> Result<ProvisionOutcome, ProvisioningError> {
        let id = entry.id.as_str();
        let version = &entry.version;

        index.upsert(BundleRecord::from_entry(entry, BundleStatus::Downloading));
        self.records.put(index)?;
        self.wal.add_rollback_step(
            op_id,
            RollbackStep::MarkCorrupt {
                bundle_id: id.to_owned(),
                version: version.to_string(),
            },
        )?;

        let part = self.layout.partial_download(id, version);
        let sidecar = self.layout.partial_sidecar(id, version);
        let mut on_progress =
            |received, total| self.report(id, ProvisionPhase::Downloading { received, total });
        let fetched = download(
            self.source.as_ref(),
            &DownloadRequest {
                reference: &entry.url,
                checksum: &entry.checksum,
                part_path: &part,
                sidecar_path: &sidecar,
            },
            cancel,
            &mut on_progress,
        )?;
        debug!(
            "{id}@{version}: archive complete ({} bytes, {} transferred, resumed={})",
            fetched.total_bytes, fetched.bytes_transferred, fetched.resumed
        );

        index.set_status(version, BundleStatus::Verifying);
        self.records.put(index)?;

        self.report(id, ProvisionPhase::Extracting);
        let staging = self.layout.staging_path(id, version);
        self.wal
            .add_rollback_step(op_id, RollbackStep::RemoveDir(staging.clone()))?;
        extract_archive(
            &part,
            entry.format,
            &staging,
            ExtractLimits {
                max_bytes: entry.size,
            },
            || cancel.is_cancelled(),
        )?;

        self.report(id, ProvisionPhase::Verifying);
        let stats = tree_digest(&staging)?;
        if stats.total_bytes != entry.size {
            return Err(ProvisioningError::Decompression(format!(
                "extracted {} bytes, manifest declares {}",
                stats.total_bytes, entry.size
            )));
        }
        if let Some(ref expected) = entry.tree_checksum {
            if stats.digest.as_str() != expected.as_str() {
                return Err(ProvisioningError::ChecksumMismatch {
                    what: "extracted tree".to_owned(),
                    expected: expected.clone(),
                    actual: stats.digest.to_string(),
                });
            }
        }

        let final_path = self.layout.install_path(id, version);
        if final_path.exists() {
            warn!("replacing unrecorded tree at {}", final_path.display());
            fs::remove_dir_all(&final_path)?;
        }
        let bundle_dir = self.layout.bundle_dir(id);
        fs::create_dir_all(&bundle_dir)?;
        self.wal.add_rollback_step(
            op_id,
            RollbackStep::RemoveUnpromoted {
                bundle_id: id.to_owned(),
                version: version.to_string(),
                path: final_path.clone(),
            },
        )?;
        fs::rename(&staging, &final_path)?;
        fsync_dir(&bundle_dir)?;

        if let Some(record) = index.get_mut(version) {
            record.install_path = Some(final_path);
            record.tree_digest = Some(stats.digest);
        }
        let demoted = index.promote(version)?;
        self.records.put(index)?;
        if let Some(previous) = demoted {
            info!("{id}@{previous} superseded by {version}");
        }

        for leftover in [&part, &sidecar] {
            if let Err(e) = fs::remove_file(leftover) {
                debug!("could not remove {}: {e}", leftover.display());
            }
        }
        if let Some(parent) = staging.parent() {
            let _ = fs::remove_dir(parent);
        }

        self.report(id, ProvisionPhase::Installed);
        Ok(ProvisionOutcome {
            bundle: recorded(index, version)?,
            downloaded_bytes: fetched.bytes_transferred,
            resumed: fetched.resumed,
            extracted: true,
            joined: false,
        })
    }

    /// Persist the failed attempt on a fresh read of the record, so the previous
    /// installed version is never touched.
    fn record_failure(&self, entry: &ManifestEntry, error: &ProvisioningError) {
        let status = if matches!(
            error,
            ProvisioningError::ChecksumMismatch { .. } | ProvisioningError::Decompression(_)
        ) {
            BundleStatus::Corrupt
        } else {
            BundleStatus::Absent
        };
        let mut index = match self.records.get(&entry.id) {
            Ok(Some(index)) => index,
            Ok(None) => return,
            Err(e) => {
                warn!("cannot record failure for {}: {e}", entry.id);
                return;
            }
        };
        let Some(record) = index.get_mut(&entry.version) else {
            return;
        };
        if record.status == BundleStatus::Installed {
            return;
        }
        record.status = status;
        record.failure = Some(error.to_string());
        record.touch();
        if let Err(e) = self.records.put(&index) {
            warn!("cannot record failure for {}: {e}", entry.id);
        }
    }

    /// The single installed bundle for `id`, if any.
    pub fn installed(&self, id: &str) -> Result<Option<BundleRecord>, ProvisioningError> {
        validate_bundle_id(id)?;
        Ok(self
            .records
            .get(id)?
            .and_then(|index| index.installed().cloned()))
    }

    /// The installed bundle a launch may use. Fails when nothing is installed,
    /// a different version is installed, or the installed tree is gone.
    pub fn require_installed(
        &self,
        id: &str,
        version: Option<&Version>,
    ) -> Result<BundleRecord, ProvisioningError> {
        let not_installed = || ProvisioningError::NotInstalled {
            bundle: id.to_owned(),
            version: version.map(ToString::to_string),
        };
        let bundle = self.installed(id)?.ok_or_else(not_installed)?;
        if version.is_some_and(|v| *v != bundle.version) {
            return Err(not_installed());
        }
        if !bundle.install_path.as_ref().is_some_and(|p| p.is_dir()) {
            warn!("{id}@{} is recorded as installed but its tree is missing", bundle.version);
            return Err(not_installed());
        }
        Ok(bundle)
    }

    /// Every recorded version of every bundle, by identifier then version.
    pub fn list(&self) -> Result<Vec<BundleRecord>, ProvisioningError> {
        Ok(self
            .records
            .list()?
            .into_iter()
            .flat_map(|index| index.versions)
            .collect())
    }

    /// Reinstate the newest intact superseded version and demote the current one.
    pub fn rollback(&self, id: &str) -> Result<BundleRecord, ProvisioningError> {
        validate_bundle_id(id)?;
        let _store_lock = StoreLock::acquire_shared(&self.layout.lock_file()).map_err(lock_failed)?;
        let _install_lock =
            StoreLock::acquire(&self.layout.bundle_lock_file(id)).map_err(lock_failed)?;

        let no_target = || ProvisioningError::NoRollbackTarget(id.to_owned());
        let mut index = self.records.get(id)?.ok_or_else(no_target)?;

        let mut target = None;
        let mut damaged = Vec::new();
        for candidate in index.superseded() {
            match verify_bundle_tree(candidate) {
                Ok(()) => {
                    target = Some(candidate.version.clone());
                    break;
                }
                Err(reason) => damaged.push((candidate.version.clone(), reason)),
            }
        }
        for (version, reason) in damaged {
            warn!("superseded {id}@{version} is damaged: {reason}");
            if let Some(record) = index.get_mut(&version) {
                record.status = BundleStatus::Corrupt;
                record.failure = Some(reason);
                record.touch();
            }
        }

        let Some(target) = target else {
            self.records.put(&index)?;
            return Err(no_target());
        };
        let demoted = index.promote(&target)?;
        self.records.put(&index)?;
        match demoted {
            Some(previous) => info!("rolled back {id} from {previous} to {target}"),
            None => info!("rolled back {id} to {target}"),
        }
        recorded(&index, &target)
    }

    /// Delete every version, the record, partial downloads and staging leftovers of `id`.
    pub fn reset(&self, id: &str) -> Result<ResetReport, ProvisioningError> {
        validate_bundle_id(id)?;
        let _store_lock = StoreLock::acquire_shared(&self.layout.lock_file()).map_err(lock_failed)?;
        let _install_lock =
            StoreLock::acquire(&self.layout.bundle_lock_file(id)).map_err(lock_failed)?;

        let mut report = ResetReport::default();
        if let Some(index) = self.records.get(id)? {
            report.versions_removed = index.versions.iter().map(|r| r.version.to_string()).collect();
        }
        // Once the record is gone the trees are orphans; gc removes them if we crash here.
        self.records.remove(id)?;

        let op_id = self.wal.begin(WalOpKind::Reset, id)?;
        let dirs = [
            self.layout.bundle_dir(id),
            self.layout.downloads_dir().join(id),
            self.layout.staging_dir().join(id),
        ];
        for dir in dirs {
            if dir.exists() {
                self.wal
                    .add_rollback_step(&op_id, RollbackStep::RemoveDir(dir.clone()))?;
                fs::remove_dir_all(&dir)?;
                report.paths_removed += 1;
            }
        }
        self.wal.commit(&op_id)?;
        info!(
            "reset {id}: {} versions, {} directories removed",
            report.versions_removed.len(),
            report.paths_removed
        );
        Ok(report)
    }

    /// Re-check every installed tree. Failures are marked corrupt and reported.
    pub fn verify(&self) -> Result<VerifyReport, ProvisioningError> {
        let _store_lock = StoreLock::acquire_shared(&self.layout.lock_file()).map_err(lock_failed)?;
        let mut report = VerifyReport::default();

        for result in self.records.list_with_errors()? {
            let id = match result {
                Ok(index) => index.id,
                Err((id, e)) => {
                    report.failures.push(VerifyFailure {
                        bundle: id,
                        version: None,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let _install_lock =
                StoreLock::acquire(&self.layout.bundle_lock_file(&id)).map_err(lock_failed)?;
            let Some(mut index) = self.records.get(&id)? else {
                continue;
            };
            let Some(installed) = index.installed().cloned() else {
                continue;
            };

            report.checked += 1;
            match verify_bundle_tree(&installed) {
                Ok(()) => report.passed += 1,
                Err(reason) => {
                    warn!("{id}@{} failed verification: {reason}", installed.version);
                    if let Some(record) = index.get_mut(&installed.version) {
                        record.status = BundleStatus::Corrupt;
                        record.failure = Some(reason.clone());
                        record.touch();
                    }
                    self.records.put(&index)?;
                    report.failures.push(VerifyFailure {
                        bundle: id.to_string(),
                        version: Some(installed.version.to_string()),
                        reason,
                    });
                }
            }
        }
        Ok(report)
    }

    /// Remove staging leftovers, stale partial downloads, unrecorded trees and
    /// superseded versions beyond the one kept for rollback.
    pub fn gc(&self, dry_run: bool) -> Result<GcReport, ProvisioningError> {
        self.layout.initialize()?;
        let _lock = StoreLock::acquire(&self.layout.lock_file()).map_err(lock_failed)?;
        let gc = GarbageCollector::new(self.layout.clone());
        Ok(gc.collect_with_cancel(dry_run, shutdown_requested)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostbridge_fetch::MemorySource;
    use hostbridge_schema::{ArchiveFormat, BundleId};
    use hostbridge_store::pack_tree;
    use std::sync::Mutex;

    const URL: &str = "mem://jre.tar";

    /// A packed tar archive and the manifest entry describing it.
    fn bundle(version: &str, payload: &[u8]) -> (Vec<u8>, ManifestEntry) {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("lib")).unwrap();
        fs::write(src.path().join("lib/libjvm.so"), payload).unwrap();
        fs::write(src.path().join("release"), b"JAVA_VERSION=17").unwrap();
        let archive = pack_tree(src.path(), ArchiveFormat::Tar).unwrap();
        let size = payload.len() as u64 + 15;
        let entry = ManifestEntry {
            id: BundleId::new("jre"),
            version: version.parse().unwrap(),
            url: URL.to_owned(),
            checksum: blake3::hash(&archive).to_hex().to_string().parse().unwrap(),
            size,
            format: None,
            tree_checksum: None,
            libraries: vec!["lib/libjvm.so".to_owned()],
            entry_point: None,
            args: vec![],
        };
        (archive, entry)
    }

    fn manager(dir: &Path, source: MemorySource) -> ProvisioningManager {
        ProvisioningManager::new(dir, Box::new(source))
    }

    #[test]
    fn provision_installs_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let (archive, entry) = bundle("17.0.8", b"jvm");
        let mgr = manager(dir.path(), MemorySource::new().with_blob(URL, archive.clone()));

        let outcome = mgr.provision(&entry, &CancelToken::new()).unwrap();
        assert!(outcome.extracted);
        assert_eq!(outcome.downloaded_bytes, archive.len() as u64);
        assert_eq!(outcome.bundle.status, BundleStatus::Installed);
        let path = outcome.bundle.install_path.clone().unwrap();
        assert_eq!(fs::read(path.join("lib/libjvm.so")).unwrap(), b"jvm");

        let layout = mgr.layout();
        assert!(!layout.partial_download("jre", &entry.version).exists());
        assert!(fs::read_dir(layout.staging_dir()).unwrap().next().is_none());
        assert!(WriteAheadLog::new(layout).list_incomplete().unwrap().is_empty());
    }

    #[test]
    fn second_provision_does_no_work() {
        let dir = tempfile::tempdir().unwrap();
        let (archive, entry) = bundle("17.0.8", b"jvm");
        let source = MemorySource::new().with_blob(URL, archive);
        let mgr = manager(dir.path(), source);
        let first = mgr.provision(&entry, &CancelToken::new()).unwrap();
        let second = mgr.provision(&entry, &CancelToken::new()).unwrap();
        assert!(!second.extracted);
        assert_eq!(second.downloaded_bytes, 0);
        assert_eq!(second.bundle, first.bundle);
    }

    #[test]
    fn size_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let (archive, mut entry) = bundle("17.0.8", b"jvm");
        entry.size += 1;
        let mgr = manager(dir.path(), MemorySource::new().with_blob(URL, archive));
        let err = mgr.provision(&entry, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ProvisioningError::Decompression(_)));
        assert!(err.is_retryable());

        let index = RecordStore::new(mgr.layout().clone())
            .get("jre")
            .unwrap()
            .unwrap();
        assert!(index.installed().is_none());
        assert_eq!(index.versions[0].status, BundleStatus::Corrupt);
        assert!(!mgr.layout().install_path("jre", &entry.version).exists());
        assert!(fs::read_dir(mgr.layout().staging_dir().join("jre"))
            .map(|mut d| d.next().is_none())
            .unwrap_or(true));
    }

    #[test]
    fn tree_checksum_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let (archive, mut entry) = bundle("17.0.8", b"jvm");
        entry.tree_checksum = Some("0".repeat(64));
        let mgr = manager(dir.path(), MemorySource::new().with_blob(URL, archive));
        let err = mgr.provision(&entry, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ProvisioningError::ChecksumMismatch { ref what, .. } if what == "extracted tree"));
    }

    #[test]
    fn cancelled_download_leaves_absent_record() {
        let dir = tempfile::tempdir().unwrap();
        let (archive, entry) = bundle("17.0.8", b"jvm");
        let mgr = manager(dir.path(), MemorySource::new().with_blob(URL, archive));
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = mgr.provision(&entry, &cancel).unwrap_err();
        assert_eq!(err, ProvisioningError::Cancelled);
        assert_eq!(
            mgr.list().unwrap()[0].status,
            BundleStatus::Absent
        );
        assert!(mgr.installed("jre").unwrap().is_none());
    }

    #[test]
    fn upgrade_and_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let (v1, e1) = bundle("17.0.8", b"jvm-1");
        let (v2, e2) = bundle("17.0.9", b"jvm-22");
        let source = MemorySource::new();
        source.insert(URL, v1);
        let mgr = manager(dir.path(), source);
        mgr.provision(&e1, &CancelToken::new()).unwrap();

        let mgr = manager(dir.path(), MemorySource::new().with_blob(URL, v2));
        mgr.provision(&e2, &CancelToken::new()).unwrap();
        assert_eq!(mgr.installed("jre").unwrap().unwrap().version, e2.version);

        let back = mgr.rollback("jre").unwrap();
        assert_eq!(back.version, e1.version);
        assert_eq!(mgr.installed("jre").unwrap().unwrap().version, e1.version);
        let statuses: Vec<_> = mgr.list().unwrap().iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![BundleStatus::Installed, BundleStatus::Superseded]);

        // Provisioning the superseded entry again reinstates it without a download.
        let again = mgr.provision(&e2, &CancelToken::new()).unwrap();
        assert!(!again.extracted);
        assert_eq!(mgr.installed("jre").unwrap().unwrap().version, e2.version);
    }

    #[test]
    fn rollback_without_target_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (archive, entry) = bundle("17.0.8", b"jvm");
        let mgr = manager(dir.path(), MemorySource::new().with_blob(URL, archive));
        mgr.provision(&entry, &CancelToken::new()).unwrap();
        assert_eq!(
            mgr.rollback("jre").unwrap_err(),
            ProvisioningError::NoRollbackTarget("jre".to_owned())
        );
    }

    #[test]
    fn same_version_different_archive_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let (archive, entry) = bundle("17.0.8", b"jvm");
        let mgr = manager(dir.path(), MemorySource::new().with_blob(URL, archive));
        mgr.provision(&entry, &CancelToken::new()).unwrap();
        let mut changed = entry.clone();
        changed.checksum = "f".repeat(64).parse().unwrap();
        assert!(matches!(
            mgr.provision(&changed, &CancelToken::new()),
            Err(ProvisioningError::VersionConflict { .. })
        ));
    }

    #[test]
    fn require_installed_checks_version_and_tree() {
        let dir = tempfile::tempdir().unwrap();
        let (archive, entry) = bundle("17.0.8", b"jvm");
        let mgr = manager(dir.path(), MemorySource::new().with_blob(URL, archive));
        assert!(matches!(
            mgr.require_installed("jre", None),
            Err(ProvisioningError::NotInstalled { .. })
        ));
        let outcome = mgr.provision(&entry, &CancelToken::new()).unwrap();
        assert!(mgr.require_installed("jre", Some(&entry.version)).is_ok());
        let other: Version = "21.0.0".parse().unwrap();
        assert!(mgr.require_installed("jre", Some(&other)).is_err());

        fs::remove_dir_all(outcome.bundle.install_path.unwrap()).unwrap();
        assert!(mgr.require_installed("jre", None).is_err());
    }

    #[test]
    fn verify_marks_tampered_tree_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let (archive, entry) = bundle("17.0.8", b"jvm");
        let mgr = manager(dir.path(), MemorySource::new().with_blob(URL, archive));
        let outcome = mgr.provision(&entry, &CancelToken::new()).unwrap();
        assert!(mgr.verify().unwrap().is_clean());

        let lib = outcome.bundle.install_path.unwrap().join("lib/libjvm.so");
        fs::write(&lib, b"JVM").unwrap();
        let report = mgr.verify().unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(mgr.installed("jre").unwrap().is_none());
        assert_eq!(mgr.list().unwrap()[0].status, BundleStatus::Corrupt);
    }

    #[test]
    fn reset_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (archive, entry) = bundle("17.0.8", b"jvm");
        let mgr = manager(dir.path(), MemorySource::new().with_blob(URL, archive));
        mgr.provision(&entry, &CancelToken::new()).unwrap();
        let report = mgr.reset("jre").unwrap();
        assert_eq!(report.versions_removed, vec!["17.0.8"]);
        assert!(report.paths_removed >= 1);
        assert!(mgr.list().unwrap().is_empty());
        assert!(!mgr.layout().bundle_dir("jre").exists());
        assert!(mgr.reset("../etc").is_err());
    }

    #[test]
    fn progress_reports_phases_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (archive, entry) = bundle("17.0.8", b"jvm");
        let phases = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&phases);
        let mgr = manager(dir.path(), MemorySource::new().with_blob(URL, archive)).with_progress(
            Arc::new(move |_, phase| {
                if !matches!(phase, ProvisionPhase::Downloading { .. }) {
                    seen.lock().unwrap().push(phase);
                }
            }),
        );
        mgr.provision(&entry, &CancelToken::new()).unwrap();
        assert_eq!(
            *phases.lock().unwrap(),
            vec![
                ProvisionPhase::Extracting,
                ProvisionPhase::Verifying,
                ProvisionPhase::Installed
            ]
        );
    }
}
