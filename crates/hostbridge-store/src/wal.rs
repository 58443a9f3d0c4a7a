use crate::layout::StoreLayout;
use crate::records::{BundleStatus, RecordStore};
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// One undo action recorded while a store operation is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RollbackStep {
    /// Remove a directory tree (staging area, half-removed bundle).
    RemoveDir(PathBuf),
    /// Remove a single file.
    RemoveFile(PathBuf),
    /// Remove a tree moved into the bundles namespace, unless the record already
    /// lists that version as installed or superseded.
    RemoveUnpromoted {
        bundle_id: String,
        version: String,
        path: PathBuf,
    },
    /// Reset a version stuck in `downloading`/`verifying` to `corrupt`.
    MarkCorrupt { bundle_id: String, version: String },
}

/// Which store mutation an entry belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalOpKind {
    Provision,
    Reset,
    Gc,
}

impl std::fmt::Display for WalOpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalOpKind::Provision => write!(f, "provision"),
            WalOpKind::Reset => write!(f, "reset"),
            WalOpKind::Gc => write!(f, "gc"),
        }
    }
}

/// An operation that has started but not yet reached its final record state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub op_id: String,
    pub kind: WalOpKind,
    pub bundle_id: String,
    pub timestamp: String,
    pub rollback_steps: Vec<RollbackStep>,
}

/// Journal of in-flight store mutations, replayed after an interrupted run.
///
/// Provisioning creates an entry before touching the disk, appends rollback
/// steps as side effects occur, and removes the entry once the bundle record
/// reflects the outcome. On startup, incomplete entries are rolled back.
pub struct WriteAheadLog {
    layout: StoreLayout,
}

impl WriteAheadLog {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            layout: layout.clone(),
        }
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.layout.wal_dir())?;
        Ok(())
    }

    /// Journal a new operation on `bundle_id` and return its op id.
    pub fn begin(&self, kind: WalOpKind, bundle_id: &str) -> Result<String, StoreError> {
        let op_id = format!(
            "{}-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S%6f"),
            &blake3::hash(format!("{bundle_id}:{}", std::process::id()).as_bytes()).to_hex()[..8]
        );
        let entry = WalEntry {
            op_id: op_id.clone(),
            kind,
            bundle_id: bundle_id.to_owned(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            rollback_steps: Vec::new(),
        };
        self.write_entry(&entry)?;
        debug!("WAL begin: {} for {bundle_id} (op_id={op_id})", entry.kind);
        Ok(op_id)
    }

    pub fn add_rollback_step(&self, op_id: &str, step: RollbackStep) -> Result<(), StoreError> {
        let mut entry = self.read_entry(op_id)?;
        entry.rollback_steps.push(step);
        self.write_entry(&entry)
    }

    /// Drop the entry once the operation has landed.
    pub fn commit(&self, op_id: &str) -> Result<(), StoreError> {
        let path = self.entry_path(op_id);
        if path.exists() {
            fs::remove_file(&path)?;
            debug!("WAL commit: {op_id}");
        }
        Ok(())
    }

    /// Roll back one entry now and drop it, for operations that fail in-process.
    pub fn abort(&self, op_id: &str) -> Result<(), StoreError> {
        let entry = self.read_entry(op_id)?;
        self.rollback_entry(&entry);
        self.commit(op_id)
    }

    pub fn list_incomplete(&self) -> Result<Vec<WalEntry>, StoreError> {
        let wal_dir = self.layout.wal_dir();
        if !wal_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&wal_dir)? {
            let path = dir_entry?.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            match fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<WalEntry>(&content) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        warn!("corrupt WAL entry {}: {e}", path.display());
                        let _ = fs::remove_file(&path);
                    }
                },
                Err(e) => {
                    warn!("unreadable WAL entry {}: {e}", path.display());
                    let _ = fs::remove_file(&path);
                }
            }
        }
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }

    /// Roll back all incomplete WAL entries. Returns the number rolled back.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let entries = self.list_incomplete()?;
        let count = entries.len();
        for entry in &entries {
            info!(
                "WAL recovery: rolling back {} on {} (op_id={})",
                entry.kind, entry.bundle_id, entry.op_id
            );
            self.rollback_entry(entry);
            let _ = fs::remove_file(self.entry_path(&entry.op_id));
        }
        if count > 0 {
            info!("WAL recovery complete: {count} entries rolled back");
        }
        Ok(count)
    }

    fn rollback_entry(&self, entry: &WalEntry) {
        for step in entry.rollback_steps.iter().rev() {
            match step {
                RollbackStep::RemoveDir(path) => remove_dir_logged(path),
                RollbackStep::RemoveFile(path) => {
                    if path.exists() {
                        if let Err(e) = fs::remove_file(path) {
                            warn!(
                                "WAL rollback: failed to remove file {}: {e}",
                                path.display()
                            );
                        } else {
                            debug!("WAL rollback: removed file {}", path.display());
                        }
                    }
                }
                RollbackStep::RemoveUnpromoted {
                    bundle_id,
                    version,
                    path,
                } => {
                    if self.is_promoted(bundle_id, version) {
                        debug!("WAL rollback: {bundle_id}@{version} was promoted, keeping tree");
                    } else {
                        remove_dir_logged(path);
                    }
                }
                RollbackStep::MarkCorrupt { bundle_id, version } => {
                    self.mark_corrupt(bundle_id, version);
                }
            }
        }
    }

    fn is_promoted(&self, bundle_id: &str, version: &str) -> bool {
        let records = RecordStore::new(self.layout.clone());
        let Ok(Some(index)) = records.get(bundle_id) else {
            return false;
        };
        index.versions.iter().any(|r| {
            r.version.to_string() == version
                && matches!(r.status, BundleStatus::Installed | BundleStatus::Superseded)
        })
    }

    fn mark_corrupt(&self, bundle_id: &str, version: &str) {
        let records = RecordStore::new(self.layout.clone());
        let mut index = match records.get(bundle_id) {
            Ok(Some(index)) => index,
            Ok(None) => return,
            Err(e) => {
                warn!("WAL rollback: failed to read record for {bundle_id}: {e}");
                return;
            }
        };
        let Some(record) = index
            .versions
            .iter_mut()
            .find(|r| r.version.to_string() == version)
        else {
            return;
        };
        if !matches!(
            record.status,
            BundleStatus::Downloading | BundleStatus::Verifying
        ) {
            return;
        }
        record.status = BundleStatus::Corrupt;
        record.failure = Some("interrupted before verification completed".to_owned());
        record.touch();
        if let Err(e) = records.put(&index) {
            warn!("WAL rollback: failed to persist record for {bundle_id}: {e}");
        } else {
            debug!("WAL rollback: marked {bundle_id}@{version} corrupt");
        }
    }

    fn entry_path(&self, op_id: &str) -> PathBuf {
        self.layout.wal_dir().join(format!("{op_id}.json"))
    }

    fn write_entry(&self, entry: &WalEntry) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(entry)?;
        crate::atomic_write(&self.entry_path(&entry.op_id), content.as_bytes())
    }

    fn read_entry(&self, op_id: &str) -> Result<WalEntry, StoreError> {
        let content = fs::read_to_string(self.entry_path(op_id))?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn remove_dir_logged(path: &std::path::Path) {
    if path.exists() {
        if let Err(e) = fs::remove_dir_all(path) {
            warn!("WAL rollback: failed to remove dir {}: {e}", path.display());
        } else {
            debug!("WAL rollback: removed dir {}", path.display());
        }
    }
}
