//! Streaming archive extraction for the two formats the builder service
//! serves: `.tar.xz` and `.zip`.
//!
//! `.tar.xz` is a compressed stream with no central directory, so its
//! entries are unpacked one at a time in archive order (see [`tar_xz`]).
//! `.zip` carries a central directory, so small entries can be handed to a
//! bounded worker pool while large ones stream on the caller's thread (see
//! [`zip`]).

mod tar_xz;
mod zip;

use std::{
    path::{Component, Path, PathBuf},
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;

use crate::error::ArchiveError;

/// Entries at or under this size are small enough to extract off the calling
/// thread without meaningfully delaying progress reporting for the rest of
/// the archive.
pub const SMALL_ENTRY_THRESHOLD: u64 = 4 * 1024 * 1024;

/// The bounded worker pool size used when extracting small zip entries.
pub const MAX_EXTRACT_WORKERS: usize = 4;

/// The permission bits applied to a directory entry whose header carries no
/// mode of its own.
#[cfg(unix)]
const DEFAULT_DIR_MODE: u32 = 0o750;

/// A progress call is let through once at least this many bytes have
/// advanced since the last one.
const PROGRESS_BYTE_THRESHOLD: u64 = 256 * 1024;
/// ...or once this much time has passed, whichever comes first.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Called periodically during extraction with `(processed_bytes, total_bytes)`.
/// `total_bytes` is `None` when the archive's uncompressed size isn't known
/// up front (always true for `.tar.xz`; known for `.zip`).
pub type ProgressFn<'a> = dyn FnMut(u64, Option<u64>) + Send + 'a;

/// Throttles calls to a [`ProgressFn`] to at most once per
/// [`PROGRESS_INTERVAL`] or [`PROGRESS_BYTE_THRESHOLD`] bytes, whichever
/// comes first; the first and final calls always go through.
pub(super) struct ThrottledProgress<'cb> {
    inner: &'cb mut ProgressFn<'cb>,
    last_call: Instant,
    last_bytes: u64,
    started: bool,
}

impl<'cb> ThrottledProgress<'cb> {
    pub(super) fn new(inner: &'cb mut ProgressFn<'cb>) -> Self {
        Self {
            inner,
            last_call: Instant::now() - PROGRESS_INTERVAL,
            last_bytes: 0,
            started: false,
        }
    }

    /// Reports `processed`/`total`, subject to throttling. Always lets the
    /// very first call through, matching the "always at 0.0 at start"
    /// contract.
    pub(super) fn tick(&mut self, processed: u64, total: Option<u64>) {
        let now = Instant::now();
        let advanced = processed.saturating_sub(self.last_bytes);
        if !self.started || advanced >= PROGRESS_BYTE_THRESHOLD || now.duration_since(self.last_call) >= PROGRESS_INTERVAL {
            (self.inner)(processed, total);
            self.last_call = now;
            self.last_bytes = processed;
            self.started = true;
        }
    }

    /// Unconditionally reports the final sample, matching the "always at
    /// 1.0 at end" contract.
    pub(super) fn finish(&mut self, processed: u64, total: Option<u64>) {
        (self.inner)(processed, total);
    }
}

/// Unpacks `archive_path` into `dest`, dispatching on its filename extension.
///
/// `dest` must already exist. Extraction polls `cancel` between entries (and,
/// for large entries, between copy chunks) and returns
/// [`ArchiveError::Cancelled`] as soon as it observes cancellation; partially
/// written entries are left in place for the caller to clean up along with
/// the rest of the staging directory.
pub fn extract(
    archive_path: &Path,
    dest: &Path,
    cancel: &CancellationToken,
    on_progress: &mut ProgressFn<'_>,
) -> Result<(), ArchiveError> {
    let name = archive_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if name.ends_with(".tar.xz") {
        tar_xz::extract(archive_path, dest, cancel, on_progress)
    } else if name.ends_with(".zip") {
        zip::extract(archive_path, dest, cancel, on_progress)
    } else {
        Err(ArchiveError::UnsupportedFormat(archive_path.to_path_buf()))
    }
}

/// Determines the single top-level directory every entry in the archive
/// shares, if there is one, so the installer can strip it when staging a
/// build whose archive wraps everything in `blender-4.2.1-linux-x86_64/`.
///
/// Returns `Ok(None)` when entries don't share a common top-level component.
pub fn probe_root_dir(archive_path: &Path) -> Result<Option<String>, ArchiveError> {
    let name = archive_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if name.ends_with(".tar.xz") {
        tar_xz::probe_root_dir(archive_path)
    } else if name.ends_with(".zip") {
        zip::probe_root_dir(archive_path)
    } else {
        Err(ArchiveError::UnsupportedFormat(archive_path.to_path_buf()))
    }
}

/// Rejects archive entry paths that would escape `dest` (absolute paths,
/// `..` components), returning the sanitized relative path on success.
fn sanitize_entry_path(dest: &Path, entry_path: &Path) -> Result<PathBuf, ArchiveError> {
    for component in entry_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            other => {
                return Err(ArchiveError::Malformed(format![
                    "archive entry {entry_path:?} contains disallowed path component {other:?}"
                ]))
            }
        }
    }
    Ok(dest.join(entry_path))
}
