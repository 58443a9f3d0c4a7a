use crate::layout::StoreLayout;
use crate::records::{BundleStatus, RecordStore};
use crate::StoreError;
use hostbridge_schema::Version;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Removes storage that no record needs.
///
/// Callers must hold the store-wide lock exclusively: GC treats every staging
/// directory as abandoned.
pub struct GarbageCollector {
    layout: StoreLayout,
}

#[derive(Debug, Default)]
pub struct GcReport {
    pub stale_staging: Vec<PathBuf>,
    pub stale_downloads: Vec<PathBuf>,
    pub orphaned_trees: Vec<PathBuf>,
    /// `id@version` of superseded versions older than the one kept for rollback.
    pub expired_versions: Vec<String>,
    pub removed: usize,
}

impl GcReport {
    pub fn is_empty(&self) -> bool {
        self.stale_staging.is_empty()
            && self.stale_downloads.is_empty()
            && self.orphaned_trees.is_empty()
            && self.expired_versions.is_empty()
    }
}

impl GarbageCollector {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn collect(&self, dry_run: bool) -> Result<GcReport, StoreError> {
        self.collect_with_cancel(dry_run, || false)
    }

    pub fn collect_with_cancel(
        &self,
        dry_run: bool,
        should_stop: impl Fn() -> bool,
    ) -> Result<GcReport, StoreError> {
        let records = RecordStore::new(self.layout.clone());
        let mut report = GcReport::default();

        // Identifiers whose record cannot be read are left alone entirely.
        let mut untouchable: HashSet<String> = HashSet::new();
        let mut live_trees: HashSet<PathBuf> = HashSet::new();
        let mut live_downloads: HashSet<(String, String)> = HashSet::new();
        let mut expired: Vec<(String, Version)> = Vec::new();

        for result in records.list_with_errors()? {
            let index = match result {
                Ok(index) => index,
                Err((id, e)) => {
                    warn!("gc: leaving '{id}' untouched, record unreadable: {e}");
                    untouchable.insert(id);
                    continue;
                }
            };
            let id = index.id.to_string();
            if let Some(installed) = index.installed() {
                live_trees.insert(self.layout.install_path(&id, &installed.version));
            }
            for (i, superseded) in index.superseded().into_iter().enumerate() {
                if i == 0 {
                    live_trees.insert(self.layout.install_path(&id, &superseded.version));
                } else {
                    expired.push((id.clone(), superseded.version.clone()));
                }
            }
            for record in &index.versions {
                if matches!(
                    record.status,
                    BundleStatus::Downloading | BundleStatus::Verifying
                ) {
                    live_downloads.insert((id.clone(), record.version.to_string()));
                }
            }
        }

        for (id_dir, id) in subdirs(&self.layout.staging_dir())? {
            if untouchable.contains(&id) {
                continue;
            }
            report.stale_staging.push(id_dir);
        }

        for (id_dir, id) in subdirs(&self.layout.downloads_dir())? {
            if untouchable.contains(&id) {
                continue;
            }
            for entry in fs::read_dir(&id_dir)? {
                let path = entry?.path();
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let version = name
                    .strip_suffix(".part.json")
                    .or_else(|| name.strip_suffix(".part"))
                    .unwrap_or(&name)
                    .to_owned();
                if !live_downloads.contains(&(id.clone(), version)) {
                    report.stale_downloads.push(path);
                }
            }
        }

        for (id_dir, id) in subdirs(&self.layout.bundles_dir())? {
            if untouchable.contains(&id) {
                continue;
            }
            let expired_paths: HashSet<PathBuf> = expired
                .iter()
                .filter(|(eid, _)| *eid == id)
                .map(|(eid, v)| self.layout.install_path(eid, v))
                .collect();
            for (tree, _) in subdirs(&id_dir)? {
                if !live_trees.contains(&tree) && !expired_paths.contains(&tree) {
                    report.orphaned_trees.push(tree);
                }
            }
        }

        report.expired_versions = expired
            .iter()
            .map(|(id, v)| format!("{id}@{v}"))
            .collect();

        if dry_run {
            return Ok(report);
        }

        for (id, version) in &expired {
            if should_stop() {
                return Ok(report);
            }
            // Record first so no record ever points at a deleted tree.
            if let Some(mut index) = records.get(id)? {
                index.remove(version);
                records.put(&index)?;
            }
            remove_path(&self.layout.install_path(id, version))?;
            report.removed += 1;
        }

        let paths: Vec<PathBuf> = report
            .stale_staging
            .iter()
            .chain(&report.stale_downloads)
            .chain(&report.orphaned_trees)
            .cloned()
            .collect();
        for path in paths {
            if should_stop() {
                break;
            }
            remove_path(&path)?;
            report.removed += 1;
        }

        Ok(report)
    }
}

/// Immediate subdirectories as (path, name) pairs. Missing parent yields nothing.
fn subdirs(dir: &Path) -> Result<Vec<(PathBuf, String)>, StoreError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push((entry.path(), entry.file_name().to_string_lossy().to_string()));
        }
    }
    out.sort();
    Ok(out)
}

fn remove_path(path: &Path) -> Result<(), StoreError> {
    let meta = match path.symlink_metadata() {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    debug!("gc: removed {}", path.display());
    Ok(())
}
