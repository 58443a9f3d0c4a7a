//! Resumable archive download into a partial file.
//!
//! The partial file is bound to the reference and checksum it was started for
//! by a JSON sidecar. A partial whose sidecar does not match the current request
//! is discarded and the transfer starts from byte zero. The archive checksum is
//! only checked once the whole file is present.

use crate::{ArchiveSource, CancelToken, FetchError};
use hostbridge_schema::Checksum;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info, warn};

pub const CHUNK_SIZE: usize = 64 * 1024;

pub struct DownloadRequest<'a> {
    pub reference: &'a str,
    pub checksum: &'a Checksum,
    pub part_path: &'a Path,
    pub sidecar_path: &'a Path,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Bytes received over the source during this call.
    pub bytes_transferred: u64,
    /// Size of the complete archive on disk.
    pub total_bytes: u64,
    /// Whether existing partial data was reused.
    pub resumed: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct PartialState {
    reference: String,
    checksum: String,
}

fn read_sidecar(path: &Path) -> Option<PartialState> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn write_sidecar(path: &Path, state: &PartialState) -> Result<(), FetchError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let content = serde_json::to_vec(state).map_err(|e| FetchError::Config(e.to_string()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| FetchError::Io(e.error))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), FetchError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// blake3 hex digest of a file's content.
pub fn hash_file(path: &Path) -> Result<String, FetchError> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Download `request.reference` into `request.part_path`, resuming existing
/// partial data when possible, and verify the archive checksum.
///
/// On cancellation or a network error the partial file and its sidecar are kept
/// for the next attempt. On checksum mismatch both are removed.
pub fn download(
    source: &dyn ArchiveSource,
    request: &DownloadRequest<'_>,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(u64, Option<u64>),
) -> Result<DownloadOutcome, FetchError> {
    if let Some(dir) = request.part_path.parent() {
        fs::create_dir_all(dir)?;
    }

    let state = PartialState {
        reference: request.reference.to_owned(),
        checksum: request.checksum.as_hex().to_owned(),
    };
    let mut offset = match read_sidecar(request.sidecar_path) {
        Some(ref existing) if *existing == state => fs::metadata(request.part_path)
            .map(|m| m.len())
            .unwrap_or(0),
        Some(_) => {
            info!(
                "partial download for {} belongs to a different entry, restarting",
                request.reference
            );
            0
        }
        None => 0,
    };
    if offset == 0 {
        remove_if_exists(request.part_path)?;
    }
    write_sidecar(request.sidecar_path, &state)?;

    // A complete partial left behind by an interrupted verification.
    if offset > 0 && request.checksum.matches(&hash_file(request.part_path)?) {
        debug!("partial download for {} already complete", request.reference);
        return Ok(DownloadOutcome {
            bytes_transferred: 0,
            total_bytes: offset,
            resumed: true,
        });
    }

    if cancel.is_cancelled() {
        return Err(FetchError::Cancelled);
    }

    let stream = source.open(request.reference, offset)?;
    if offset > 0 && !stream.resumed {
        debug!(
            "source {} restarted {} from byte 0",
            source.name(),
            request.reference
        );
        offset = 0;
    }
    let resumed = offset > 0;
    let total = stream.total_len;

    let mut file = if resumed {
        OpenOptions::new().append(true).open(request.part_path)?
    } else {
        File::create(request.part_path)?
    };

    let mut reader = stream.reader;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut transferred: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            file.sync_all()?;
            debug!(
                "download of {} cancelled at byte {}",
                request.reference,
                offset + transferred
            );
            return Err(FetchError::Cancelled);
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                file.sync_all()?;
                return Err(FetchError::Network(format!(
                    "transfer of {} interrupted at byte {}: {e}",
                    request.reference,
                    offset + transferred
                )));
            }
        };
        file.write_all(&buf[..n])?;
        transferred += n as u64;
        progress(offset + transferred, total);
    }
    file.sync_all()?;
    drop(file);

    let on_disk = offset + transferred;
    if let Some(expected) = total {
        if on_disk < expected {
            return Err(FetchError::Network(format!(
                "transfer of {} ended early: {on_disk} of {expected} bytes",
                request.reference
            )));
        }
    }

    let actual = hash_file(request.part_path)?;
    if !request.checksum.matches(&actual) {
        warn!(
            "checksum mismatch for {}: expected {}, got {actual}",
            request.reference,
            request.checksum.as_hex()
        );
        remove_if_exists(request.part_path)?;
        remove_if_exists(request.sidecar_path)?;
        return Err(FetchError::ChecksumMismatch {
            expected: request.checksum.as_hex().to_owned(),
            actual,
        });
    }

    Ok(DownloadOutcome {
        bytes_transferred: transferred,
        total_bytes: on_disk,
        resumed,
    })
}
