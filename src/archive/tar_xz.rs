//! `.tar.xz` extraction.
//!
//! xz carries no index, so entries are read in a single forward pass; unlike
//! [`super::zip`] there's no random access into the compressed stream to fan
//! the *reads* out across threads. Small entries are buffered off that pass
//! and handed to [`SmallWritePool`] so their disk writes don't stall the
//! decompressor; large entries still stream straight to disk. Progress is
//! reported in compressed bytes read, which is the only figure available
//! without buffering the whole stream first.

use std::{
    collections::VecDeque,
    fs::File,
    io::{self, BufReader, Read, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use tar::EntryType;
use tokio_util::sync::CancellationToken;
use xz2::bufread::XzDecoder;

use super::{sanitize_entry_path, ProgressFn, ThrottledProgress, MAX_EXTRACT_WORKERS, SMALL_ENTRY_THRESHOLD};
use crate::error::ArchiveError;

#[cfg(unix)]
use super::DEFAULT_DIR_MODE;

/// Bounded pool of writer threads for entries small enough to have been read
/// entirely into memory, so the (strictly sequential) decompression loop
/// doesn't stall on disk I/O for every small file.
struct SmallWritePool {
    handles: VecDeque<JoinHandle<Result<(), ArchiveError>>>,
    failure: Option<ArchiveError>,
}

impl SmallWritePool {
    fn new() -> Self {
        Self {
            handles: VecDeque::new(),
            failure: None,
        }
    }

    fn spawn(&mut self, out_path: PathBuf, data: Vec<u8>, mode: Option<u32>) {
        if self.handles.len() >= MAX_EXTRACT_WORKERS {
            self.join_oldest();
        }
        let handle = std::thread::spawn(move || write_small_entry(&out_path, &data, mode));
        self.handles.push_back(handle);
    }

    fn join_oldest(&mut self) {
        if let Some(handle) = self.handles.pop_front() {
            self.record(handle.join().unwrap());
        }
    }

    fn record(&mut self, result: Result<(), ArchiveError>) {
        if let Err(e) = result {
            if self.failure.is_none() {
                self.failure = Some(e);
            }
        }
    }

    fn has_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Waits for every outstanding worker, returning the first error any of
    /// them (or an earlier joined-out-of-band one) produced.
    fn finish(mut self) -> Option<ArchiveError> {
        while let Some(handle) = self.handles.pop_front() {
            self.record(handle.join().unwrap());
        }
        self.failure
    }
}

fn write_small_entry(out_path: &Path, data: &[u8], mode: Option<u32>) -> Result<(), ArchiveError> {
    std::fs::write(out_path, data)?;
    apply_mode(out_path, mode)?;
    Ok(())
}

struct CountingReader<R> {
    inner: R,
    counter: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.counter.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

pub(super) fn extract(
    archive_path: &Path,
    dest: &Path,
    cancel: &CancellationToken,
    on_progress: &mut ProgressFn<'_>,
) -> Result<(), ArchiveError> {
    let counter = Arc::new(AtomicU64::new(0));
    let counting = CountingReader {
        inner: BufReader::new(File::open(archive_path)?),
        counter: counter.clone(),
    };
    let decoder = XzDecoder::new(counting);
    let mut archive = tar::Archive::new(decoder);

    let mut progress = ThrottledProgress::new(on_progress);
    progress.tick(0, None);

    let mut pool = SmallWritePool::new();

    for entry in archive.entries()? {
        if cancel.is_cancelled() {
            pool.finish();
            return Err(ArchiveError::Cancelled);
        }
        if pool.has_failed() {
            break;
        }

        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let out_path = sanitize_entry_path(dest, &entry_path)?;
        let entry_type = entry.header().entry_type();
        let mode = entry.header().mode().ok();
        let size = entry.size();

        match entry_type {
            EntryType::Directory => {
                std::fs::create_dir_all(&out_path)?;
                apply_mode(&out_path, Some(mode.unwrap_or(default_dir_mode())))?;
            }
            EntryType::Symlink => {
                if let Some(parent) = out_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let target = entry
                    .link_name()?
                    .ok_or_else(|| ArchiveError::Malformed(format!["symlink {entry_path:?} has no target"]))?;
                write_symlink(&target, &out_path)?;
            }
            EntryType::Regular => {
                if let Some(parent) = out_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                if size <= SMALL_ENTRY_THRESHOLD {
                    let mut buf = Vec::with_capacity(size as usize);
                    entry.read_to_end(&mut buf)?;
                    pool.spawn(out_path, buf, mode);
                } else {
                    copy_with_cancellation(&mut entry, &out_path, cancel)?;
                    apply_mode(&out_path, mode)?;
                }
            }
            _ => {}
        }

        progress.tick(counter.load(Ordering::Relaxed), None);
    }

    if let Some(err) = pool.finish() {
        return Err(err);
    }

    progress.finish(counter.load(Ordering::Relaxed), None);
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

pub(super) fn probe_root_dir(archive_path: &Path) -> Result<Option<String>, ArchiveError> {
    let decoder = XzDecoder::new(BufReader::new(File::open(archive_path)?));
    let mut archive = tar::Archive::new(decoder);

    let mut common: Option<String> = None;
    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(top) = path.components().next() else {
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

fn copy_with_cancellation<R: Read>(
    src: &mut R,
    out_path: &Path,
    cancel: &CancellationToken,
) -> Result<(), ArchiveError> {
    let mut out = File::create(out_path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
    }
    Ok(())
}

#[cfg(unix)]
fn write_symlink(target: &Path, out_path: &Path) -> Result<(), ArchiveError> {
    let _ = std::fs::remove_file(out_path);
    std::os::unix::fs::symlink(target, out_path)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_symlink(_target: &Path, _out_path: &Path) -> Result<(), ArchiveError> {
    Ok(())
}

#[cfg(unix)]
fn apply_mode(out_path: &Path, mode: Option<u32>) -> Result<(), ArchiveError> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        std::fs::set_permissions(out_path, std::fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_mode(_out_path: &Path, _mode: Option<u32>) -> Result<(), ArchiveError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use xz2::write::XzEncoder;

    fn make_archive(dir: &Path) -> PathBuf {
        let archive_path = dir.join("blender-4.2.1-linux-x86_64.tar.xz");
        let file = File::create(&archive_path).unwrap();
        let encoder = XzEncoder::new(file, 1);
        let mut builder = tar::Builder::new(encoder);

        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(
                &mut header,
                "blender-4.2.1-linux-x86_64/blender",
                &b"stub!"[..],
            )
            .unwrap();

        let mut dir_header = tar::Header::new_gnu();
        dir_header.set_entry_type(EntryType::Directory);
        dir_header.set_size(0);
        dir_header.set_cksum();
        builder
            .append_data(
                &mut dir_header,
                "blender-4.2.1-linux-x86_64/2.93/",
                &b""[..],
            )
            .unwrap();

        builder.into_inner().unwrap().finish().unwrap();
        archive_path
    }

    use std::path::PathBuf;

    #[test]
    fn extracts_regular_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = make_archive(dir.path());
        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();

        let mut calls = 0u32;
        extract(&archive_path, &dest, &CancellationToken::new(), &mut |_, _| {
            calls += 1;
        })
        .unwrap();

        assert!(calls > 0);
        assert_eq!(
            std::fs::read(dest.join("blender-4.2.1-linux-x86_64/blender")).unwrap(),
            b"stub!"
        );
        assert!(dest.join("blender-4.2.1-linux-x86_64/2.93").is_dir());
    }

    #[test]
    fn probe_root_dir_finds_common_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = make_archive(dir.path());
        assert_eq!(
            probe_root_dir(&archive_path).unwrap(),
            Some("blender-4.2.1-linux-x86_64".to_string())
        );
    }

    #[test]
    fn cancellation_is_observed_before_any_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = make_archive(dir.path());
        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = extract(&archive_path, &dest, &cancel, &mut |_, _| {}).unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));
    }
}
