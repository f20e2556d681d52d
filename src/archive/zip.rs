//! `.zip` extraction.
//!
//! Unlike `.tar.xz`, a zip's central directory lets any entry be opened
//! independently, so small entries are fanned out across a bounded worker
//! pool while large ones stream on the caller's thread with fine-grained
//! progress and cancellation checks.

use std::{
    fs::File,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tokio_util::sync::CancellationToken;
use zip::{read::ZipFile, ZipArchive};

use super::{
    sanitize_entry_path, ProgressFn, ThrottledProgress, MAX_EXTRACT_WORKERS, SMALL_ENTRY_THRESHOLD,
};
use crate::error::ArchiveError;

#[cfg(unix)]
use super::DEFAULT_DIR_MODE;

pub(super) fn extract(
    archive_path: &Path,
    dest: &Path,
    cancel: &CancellationToken,
    on_progress: &mut ProgressFn<'_>,
) -> Result<(), ArchiveError> {
    let (small, large, total) = partition_entries(archive_path, dest)?;

    let processed = Arc::new(AtomicU64::new(0));
    let failure: Arc<Mutex<Option<ArchiveError>>> = Arc::new(Mutex::new(None));
    let worker_count = MAX_EXTRACT_WORKERS.max(1);
    let chunk_size = small.len().div_ceil(worker_count).max(1);

    std::thread::scope(|scope| {
        for chunk in small.chunks(chunk_size) {
            let processed = processed.clone();
            let failure = failure.clone();
            let cancel = cancel.clone();
            scope.spawn(move || {
                for &index in chunk {
                    if cancel.is_cancelled() {
                        record_failure(&failure, ArchiveError::Cancelled);
                        return;
                    }
                    if failure.lock().unwrap().is_some() {
                        return;
                    }
                    match extract_entry_by_index(archive_path, dest, index) {
                        Ok(size) => {
                            processed.fetch_add(size, Ordering::Relaxed);
                        }
                        Err(e) => {
                            record_failure(&failure, e);
                            return;
                        }
                    }
                }
            });
        }
    });

    if let Some(err) = Arc::try_unwrap(failure)
        .ok()
        .and_then(|m| m.into_inner().ok())
        .flatten()
    {
        return Err(err);
    }

    let mut progress = ThrottledProgress::new(on_progress);
    progress.tick(processed.load(Ordering::Relaxed), Some(total));

    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    for index in large {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        extract_large_entry(&mut archive, dest, index, cancel, &processed, &mut progress, total)?;
    }

    progress.finish(processed.load(Ordering::Relaxed), Some(total));
    Ok(())
}

pub(super) fn probe_root_dir(archive_path: &Path) -> Result<Option<String>, ArchiveError> {
    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    let mut common: Option<String> = None;
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        let Some(name) = entry.enclosed_name() else {
            continue;
        };
        let Some(top) = name.components().next() else {
            continue;
        };
        let top = top.as_os_str().to_string_lossy().into_owned();
        match &common {
            None => common = Some(top),
            Some(c) if *c == top => {}
            Some(_) => return Ok(None),
        }
    }
    Ok(common)
}

fn record_failure(failure: &Mutex<Option<ArchiveError>>, err: ArchiveError) {
    let mut guard = failure.lock().unwrap();
    if guard.is_none() {
        *guard = Some(err);
    }
}

fn partition_entries(
    archive_path: &Path,
    dest: &Path,
) -> Result<(Vec<usize>, Vec<usize>, u64), ArchiveError> {
    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    let mut small = Vec::new();
    let mut large = Vec::new();
    let mut total = 0u64;

    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        let out_path = entry_out_path(dest, &entry)?;
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            apply_unix_mode(&out_path, Some(entry.unix_mode().unwrap_or(default_dir_mode())))?;
            continue;
        }
        total += entry.size();
        if entry.size() <= SMALL_ENTRY_THRESHOLD {
            small.push(i);
        } else {
            large.push(i);
        }
    }

    Ok((small, large, total))
}

fn entry_out_path(dest: &Path, entry: &ZipFile) -> Result<PathBuf, ArchiveError> {
    let name = entry
        .enclosed_name()
        .ok_or_else(|| ArchiveError::Malformed(format!["zip entry {:?} has an unsafe path", entry.name()]))?;
    sanitize_entry_path(dest, &name)
}

fn extract_entry_by_index(archive_path: &Path, dest: &Path, index: usize) -> Result<u64, ArchiveError> {
    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    let mut entry = archive.by_index(index)?;
    let out_path = entry_out_path(dest, &entry)?;

    if entry.is_dir() {
        std::fs::create_dir_all(&out_path)?;
        apply_unix_mode(&out_path, Some(entry.unix_mode().unwrap_or(default_dir_mode())))?;
        return Ok(0);
    }
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let size = entry.size();
    let mut out = File::create(&out_path)?;
    io::copy(&mut entry, &mut out)?;
    drop(out);
    apply_unix_mode(&out_path, entry.unix_mode())?;
    Ok(size)
}

fn extract_large_entry(
    archive: &mut ZipArchive<File>,
    dest: &Path,
    index: usize,
    cancel: &CancellationToken,
    processed: &AtomicU64,
    progress: &mut ThrottledProgress<'_>,
    total: u64,
) -> Result<(), ArchiveError> {
    let mut entry = archive.by_index(index)?;
    let out_path = entry_out_path(dest, &entry)?;

    if entry.is_dir() {
        std::fs::create_dir_all(&out_path)?;
        apply_unix_mode(&out_path, Some(entry.unix_mode().unwrap_or(default_dir_mode())))?;
        return Ok(());
    }
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mode = entry.unix_mode();
    let mut out = File::create(&out_path)?;
    let mut buf = [0u8; 256 * 1024];
    loop {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let n = entry.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        let now = processed.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
        progress.tick(now, Some(total));
    }
    drop(out);
    apply_unix_mode(&out_path, mode)?;
    Ok(())
}

#[cfg(unix)]
fn default_dir_mode() -> u32 {
    DEFAULT_DIR_MODE
}

#[cfg(not(unix))]
fn default_dir_mode() -> u32 {
    0
}

#[cfg(unix)]
fn apply_unix_mode(out_path: &Path, mode: Option<u32>) -> Result<(), ArchiveError> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        if mode != 0 {
            std::fs::set_permissions(out_path, std::fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_unix_mode(_out_path: &Path, _mode: Option<u32>) -> Result<(), ArchiveError> {
    Ok(())
}
