use crate::StoreError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use hostbridge_schema::{ArchiveFormat, TreeDigest};
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Digest and size of an extracted bundle tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeStats {
    pub digest: TreeDigest,
    pub files: u64,
    /// Sum of regular file sizes: the bundle's uncompressed size.
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractLimits {
    /// Extraction aborts as soon as regular file content exceeds this many bytes.
    pub max_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub entries: u64,
    pub bytes: u64,
}

/// Compute a deterministic blake3 digest over a directory tree.
///
/// Entries are visited in lexicographic order of their relative path. Each entry
/// contributes its kind, relative path, and for regular files the executable bit,
/// length and content; for symlinks the link target. Timestamps and ownership are
/// ignored so the same archive always yields the same digest.
pub fn tree_digest(root: &Path) -> Result<TreeStats, StoreError> {
    let mut entries = collect_entries(root, root)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = blake3::Hasher::new();
    let mut files = 0u64;
    let mut total_bytes = 0u64;
    let mut buf = vec![0u8; 64 * 1024];

    for (rel, full) in &entries {
        let meta = full.symlink_metadata()?;
        let ft = meta.file_type();
        if ft.is_dir() {
            hasher.update(b"d");
            hasher.update(rel.as_bytes());
            hasher.update(&[0]);
        } else if ft.is_symlink() {
            let target = fs::read_link(full)?;
            hasher.update(b"l");
            hasher.update(rel.as_bytes());
            hasher.update(&[0]);
            hasher.update(target.to_string_lossy().as_bytes());
            hasher.update(&[0]);
        } else if ft.is_file() {
            let exec = meta.permissions().mode() & 0o111 != 0;
            hasher.update(b"f");
            hasher.update(rel.as_bytes());
            hasher.update(&[0, u8::from(exec)]);
            hasher.update(&meta.len().to_le_bytes());
            let mut f = File::open(full)?;
            loop {
                let n = f.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            files += 1;
            total_bytes += meta.len();
        } else {
            warn!("tree digest: skipping special file {rel}");
        }
    }

    Ok(TreeStats {
        digest: TreeDigest::new(hasher.finalize().to_hex().to_string()),
        files,
        total_bytes,
    })
}

/// Recursively collect (relative_path, full_path) pairs from a directory tree.
fn collect_entries(root: &Path, current: &Path) -> Result<Vec<(String, PathBuf)>, StoreError> {
    let mut result = Vec::new();
    if !current.exists() {
        return Ok(result);
    }
    for entry in fs::read_dir(current)? {
        let entry = entry?;
        let full = entry.path();
        let rel = full
            .strip_prefix(root)
            .map_err(|e| StoreError::Io(std::io::Error::other(format!("path strip: {e}"))))?
            .to_string_lossy()
            .to_string();

        let meta = full.symlink_metadata()?;
        if meta.is_dir() {
            result.push((rel, full.clone()));
            result.extend(collect_entries(root, &full)?);
        } else {
            result.push((rel, full));
        }
    }
    Ok(result)
}

/// Sniff the container format from the gzip magic bytes.
pub fn detect_format(archive: &Path) -> Result<ArchiveFormat, StoreError> {
    let mut f = File::open(archive)?;
    let mut magic = [0u8; 2];
    let mut read = 0;
    while read < magic.len() {
        let n = f.read(&mut magic[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    if read == 2 && magic == GZIP_MAGIC {
        Ok(ArchiveFormat::TarGz)
    } else {
        Ok(ArchiveFormat::Tar)
    }
}

fn archive_err(e: &std::io::Error) -> StoreError {
    StoreError::Archive(e.to_string())
}

/// Content errors are archive failures; everything else (disk full, permissions) stays I/O.
fn unpack_err(e: std::io::Error) -> StoreError {
    match e.kind() {
        ErrorKind::InvalidData | ErrorKind::InvalidInput | ErrorKind::UnexpectedEof => {
            StoreError::Archive(e.to_string())
        }
        _ => StoreError::Io(e),
    }
}

/// Reduce an archive path to a relative path of normal components, or reject it.
fn sanitize_entry_path(path: &Path) -> Result<PathBuf, StoreError> {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StoreError::UnsafeEntry(path.display().to_string()));
            }
        }
    }
    Ok(out)
}

/// A symlink at `rel` pointing at `target` must resolve inside the extraction root.
fn symlink_stays_inside(rel: &Path, target: &Path) -> bool {
    if target.is_absolute() {
        return false;
    }
    let mut depth: usize = rel.parent().map_or(0, |p| p.components().count());
    for c in target.components() {
        match c {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

/// Extract a tar or tar.gz archive into `target`.
///
/// Entries that would land outside `target` are rejected, special files are
/// skipped, and extraction stops with [`StoreError::ArchiveTooLarge`] as soon as
/// regular file content exceeds `limits.max_bytes`. `should_stop` is polled
/// between entries.
pub fn extract_archive(
    archive: &Path,
    format: Option<ArchiveFormat>,
    target: &Path,
    limits: ExtractLimits,
    should_stop: impl Fn() -> bool,
) -> Result<ExtractStats, StoreError> {
    let format = match format {
        Some(f) => f,
        None => detect_format(archive)?,
    };
    fs::create_dir_all(target)?;

    let file = BufReader::new(File::open(archive)?);
    let reader: Box<dyn Read> = match format {
        ArchiveFormat::Tar => Box::new(file),
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(file)),
    };
    let mut ar = tar::Archive::new(reader);
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(false);
    ar.set_unpack_xattrs(false);
    ar.set_overwrite(true);

    let mut stats = ExtractStats::default();
    for entry in ar.entries().map_err(|e| archive_err(&e))? {
        if should_stop() {
            return Err(StoreError::Cancelled);
        }
        let mut entry = entry.map_err(|e| archive_err(&e))?;
        let raw_path = entry.path().map_err(|e| archive_err(&e))?.into_owned();
        let rel = sanitize_entry_path(&raw_path)?;
        if rel.as_os_str().is_empty() {
            continue;
        }

        let kind = entry.header().entry_type();
        match kind {
            tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::GNUSparse => {
                stats.bytes += entry.size();
                if stats.bytes > limits.max_bytes {
                    return Err(StoreError::ArchiveTooLarge {
                        limit: limits.max_bytes,
                    });
                }
            }
            tar::EntryType::Directory => {}
            tar::EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .map_err(|e| archive_err(&e))?
                    .ok_or_else(|| StoreError::Archive(format!("symlink {} has no target", rel.display())))?;
                if !symlink_stays_inside(&rel, &link) {
                    return Err(StoreError::UnsafeEntry(format!(
                        "{} -> {}",
                        rel.display(),
                        link.display()
                    )));
                }
            }
            tar::EntryType::Link => {
                let link = entry
                    .link_name()
                    .map_err(|e| archive_err(&e))?
                    .ok_or_else(|| StoreError::Archive(format!("hard link {} has no target", rel.display())))?;
                sanitize_entry_path(&link)?;
            }
            tar::EntryType::XGlobalHeader | tar::EntryType::XHeader => continue,
            other => {
                warn!("skipping unsupported archive entry {} ({other:?})", rel.display());
                continue;
            }
        }

        let unpacked = entry.unpack_in(target).map_err(unpack_err)?;
        if !unpacked {
            return Err(StoreError::UnsafeEntry(raw_path.display().to_string()));
        }
        stats.entries += 1;
    }

    debug!(
        "extracted {} entries ({} bytes) into {}",
        stats.entries,
        stats.bytes,
        target.display()
    );
    Ok(stats)
}

/// Pack a directory into a deterministic archive of the given format.
///
/// Entries are sorted by relative path, timestamps and ownership are zeroed,
/// permissions are preserved. Used to publish bundles and to build fixtures.
pub fn pack_tree(source_dir: &Path, format: ArchiveFormat) -> Result<Vec<u8>, StoreError> {
    let mut entries = collect_entries(source_dir, source_dir)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut ar = tar::Builder::new(Vec::new());
    ar.follow_symlinks(false);

    for (rel_path, full_path) in &entries {
        let meta = full_path.symlink_metadata()?;
        let ft = meta.file_type();
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(meta.permissions().mode());

        if ft.is_file() {
            let data = fs::read(full_path)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(data.len() as u64);
            header.set_cksum();
            ar.append_data(&mut header, rel_path, data.as_slice())?;
        } else if ft.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            ar.append_data(&mut header, format!("{rel_path}/"), &[] as &[u8])?;
        } else if ft.is_symlink() {
            let target = fs::read_link(full_path)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_cksum();
            ar.append_link(&mut header, rel_path, &target)?;
        } else {
            warn!("skipping unsupported file type: {rel_path}");
        }
    }

    let tar_data = ar.into_inner()?;
    match format {
        ArchiveFormat::Tar => Ok(tar_data),
        ArchiveFormat::TarGz => {
            let mut gz = GzEncoder::new(Vec::new(), flate2::Compression::default());
            gz.write_all(&tar_data)?;
            Ok(gz.finish()?)
        }
    }
}
