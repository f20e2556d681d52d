//! Orchestrates one archive download, extraction, and atomic install.
//!
//! The state machine carries several phases: preparing a staging area,
//! downloading (see [`crate::http`]), probing the archive's root and backing
//! up any displaced install, extracting, and finalizing into the library.
//! Every phase reports through a shared [`ProgressMap`] so a caller polling
//! from another task sees live updates without needing a channel per
//! install.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use log::{info, warn};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{
    archive,
    build::{Build, BuildStatus},
    config::BlrsConfig,
    error::InstallError,
    http,
    paths::{DOWNLOADING_DIR, OLDBUILDS_DIR, SIDECAR_NAME},
    progress::{Phase, ProgressMap, ProgressState},
};

/// How often a download/extraction progress sample is allowed to update the
/// speed estimate and the shared progress map.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(200);
/// Speed is reported as the mean of this many most recent samples.
const SPEED_WINDOW: usize = 3;

/// Tracks the [`CancellationToken`] for every install currently in flight, so
/// a caller elsewhere in the process can cancel an install it didn't start
/// (a UI cancel button, say) as long as it knows the build's identity key.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    inner: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, key: &str, token: CancellationToken) {
        self.inner.write().insert(key.to_string(), token);
    }

    fn unregister(&self, key: &str) {
        self.inner.write().remove(key);
    }

    /// Requests cancellation of the install tracked under `key`. Returns
    /// `false` if no install is currently tracked under that key.
    pub fn cancel_install(&self, key: &str) -> bool {
        match self.inner.read().get(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

struct SpeedEstimator {
    samples: Vec<(Instant, u64)>,
    last_sample_at: Instant,
}

impl SpeedEstimator {
    fn new() -> Self {
        Self {
            samples: Vec::with_capacity(SPEED_WINDOW),
            last_sample_at: Instant::now() - SAMPLE_INTERVAL,
        }
    }

    /// Records `processed` if enough time has elapsed since the last sample,
    /// returning the smoothed bytes/second estimate when it does.
    fn sample(&mut self, processed: u64) -> Option<f64> {
        let now = Instant::now();
        if now.duration_since(self.last_sample_at) < SAMPLE_INTERVAL {
            return None;
        }
        self.last_sample_at = now;
        self.samples.push((now, processed));
        if self.samples.len() > SPEED_WINDOW {
            self.samples.remove(0);
        }
        if self.samples.len() < 2 {
            return None;
        }
        let (t0, b0) = self.samples.first().copied().unwrap();
        let (t1, b1) = self.samples.last().copied().unwrap();
        let elapsed = t1.duration_since(t0).as_secs_f64();
        if elapsed <= 0.0 || b1 < b0 {
            return None;
        }
        Some((b1 - b0) as f64 / elapsed)
    }
}

/// Fallback install directory name when the archive's entries don't share a
/// single root folder to name the install after.
fn install_dir_name(build: &Build) -> String {
    format![
        "blender-{}-{}-{}",
        build.version, build.platform, build.architecture
    ]
}

/// Downloads and installs `build` into `config.paths.library`, reporting
/// progress through `progress` under `build.identity_key()`, and registering
/// a cancellation handle under the same key in `cancellations` for the
/// duration of the call.
///
/// On success, returns the installed [`Build`] with `status` set to
/// [`BuildStatus::Local`]. On cancellation or error, the staging directory is
/// cleaned up and any pre-existing install at the destination is left
/// untouched.
pub async fn install(
    config: &BlrsConfig,
    build: &Build,
    progress: &ProgressMap,
    cancellations: &CancellationRegistry,
) -> Result<Build, InstallError> {
    if build.url.is_empty() {
        return Err(InstallError::Config(format![
            "build {} has no download URL",
            build
        ]));
    }

    let key = build.identity_key();
    let cancel = CancellationToken::new();
    cancellations.register(&key, cancel.clone());

    let result = run_install(config, build, progress, &key, &cancel).await;

    cancellations.unregister(&key);

    let terminal_phase = match &result {
        Ok(_) => Phase::Finished,
        Err(InstallError::Cancelled) => Phase::Cancelled,
        Err(_) => Phase::Failed,
    };
    progress.set(
        &key,
        ProgressState {
            phase: terminal_phase,
            processed: 0,
            total: None,
            bytes_per_sec: None,
            last_updated: Utc::now(),
        },
    );

    result
}

async fn run_install(
    config: &BlrsConfig,
    build: &Build,
    progress: &ProgressMap,
    key: &str,
    cancel: &CancellationToken,
) -> Result<Build, InstallError> {
    progress.set(
        key,
        ProgressState {
            phase: Phase::Preparing,
            processed: 0,
            total: None,
            bytes_per_sec: None,
            last_updated: Utc::now(),
        },
    );

    let staging_root = config.paths.downloading_dir();
    tokio::fs::create_dir_all(&staging_root).await?;

    let fallback_slug = install_dir_name(build);
    let archive_name = if build.file_name.is_empty() {
        format!["{fallback_slug}.{}", build.file_extension]
    } else {
        build.file_name.clone()
    };
    let archive_path = staging_root.join(&archive_name);
    let extraction_dir = staging_root.join(format!["{fallback_slug}-extract"]);

    if cancel.is_cancelled() {
        cleanup_staging(&archive_path, &extraction_dir).await;
        return Err(InstallError::Cancelled);
    }

    download_archive(config, build, &archive_path, progress, key, cancel).await?;

    if cancel.is_cancelled() {
        cleanup_staging(&archive_path, &extraction_dir).await;
        return Err(InstallError::Cancelled);
    }

    progress.set(
        key,
        ProgressState {
            phase: Phase::Staging,
            processed: 0,
            total: None,
            bytes_per_sec: None,
            last_updated: Utc::now(),
        },
    );

    let slug = archive::probe_root_dir(&archive_path)?.unwrap_or(fallback_slug);
    let install_dest = config.paths.library.join(&slug);

    let version_tag = build.version.to_string();
    if let Some(existing) = find_existing_install(&config.paths.library, &version_tag).await? {
        backup_existing(&existing, &config.paths.oldbuilds_dir()).await?;
    }

    if tokio::fs::metadata(&extraction_dir).await.is_ok() {
        tokio::fs::remove_dir_all(&extraction_dir).await?;
    }
    tokio::fs::create_dir_all(&extraction_dir).await?;

    let extraction_result = extract_archive(build, &archive_path, &extraction_dir, progress, key, cancel).await;
    if let Err(e) = extraction_result {
        cleanup_staging(&archive_path, &extraction_dir).await;
        return Err(e);
    }

    let payload_root = resolve_payload_root(&archive_path, &extraction_dir)?;
    tokio::fs::rename(&payload_root, &install_dest).await?;
    if payload_root != extraction_dir {
        let _ = tokio::fs::remove_dir_all(&extraction_dir).await;
    }
    let _ = tokio::fs::remove_file(&archive_path).await;

    progress.set(
        key,
        ProgressState {
            phase: Phase::Finalizing,
            processed: 0,
            total: None,
            bytes_per_sec: None,
            last_updated: Utc::now(),
        },
    );

    let mut installed = build.clone();
    installed.status = BuildStatus::Local;
    let sidecar_bytes = serde_json::to_vec_pretty(&installed)
        .map_err(|e| InstallError::Config(format!["failed to serialize sidecar: {e}"]))?;
    tokio::fs::write(install_dest.join(SIDECAR_NAME), sidecar_bytes).await?;

    info!("installed {installed} at {}", install_dest.display());
    Ok(installed)
}

async fn download_archive(
    config: &BlrsConfig,
    build: &Build,
    archive_path: &Path,
    progress: &ProgressMap,
    key: &str,
    cancel: &CancellationToken,
) -> Result<(), InstallError> {
    let client = config
        .client_builder()
        .build()
        .map_err(|e| InstallError::Config(format!["failed to build HTTP client: {e}"]))?;
    let mut speed = SpeedEstimator::new();

    http::download(&client, &build.url, archive_path, cancel, &mut |processed, total| {
        let bytes_per_sec = speed.sample(processed);
        progress.set(
            key,
            ProgressState {
                phase: Phase::Downloading,
                processed,
                total: total.or((build.file_size > 0).then_some(build.file_size)),
                bytes_per_sec,
                last_updated: Utc::now(),
            },
        );
    })
    .await
}

async fn extract_archive(
    build: &Build,
    archive_path: &Path,
    extraction_dir: &Path,
    progress: &ProgressMap,
    key: &str,
    cancel: &CancellationToken,
) -> Result<(), InstallError> {
    let progress = progress.clone();
    let key = key.to_string();
    let archive_path = archive_path.to_path_buf();
    let extraction_dir = extraction_dir.to_path_buf();
    let cancel = cancel.clone();
    let declared_size = build.file_size;

    let mut speed = SpeedEstimator::new();

    let result = tokio::task::spawn_blocking(move || {
        archive::extract(&archive_path, &extraction_dir, &cancel, &mut |processed, total| {
            let bytes_per_sec = speed.sample(processed);
            progress.set(
                &key,
                ProgressState {
                    phase: Phase::Extracting,
                    processed,
                    total: total.or((declared_size > 0).then_some(declared_size)),
                    bytes_per_sec,
                    last_updated: Utc::now(),
                },
            );
        })
    })
    .await
    .map_err(|e| InstallError::Config(format!["extraction task panicked: {e}"]))?;

    match result {
        Ok(()) => Ok(()),
        Err(crate::error::ArchiveError::Cancelled) => Err(InstallError::Cancelled),
        Err(e) => Err(InstallError::Archive(e)),
    }
}

fn resolve_payload_root(archive_path: &Path, extraction_dir: &Path) -> Result<PathBuf, InstallError> {
    match archive::probe_root_dir(archive_path)? {
        Some(top) => Ok(extraction_dir.join(top)),
        None => Ok(extraction_dir.to_path_buf()),
    }
}

/// Scans `library` (skipping `.downloading`/`.oldbuilds`) for the first
/// directory whose name contains `version_tag`, so a build installed under
/// a different naming convention (or renamed by hand) is still found and
/// backed up before the fresh extraction lands under its archive-rooted name.
async fn find_existing_install(library: &Path, version_tag: &str) -> Result<Option<PathBuf>, InstallError> {
    let mut entries = match tokio::fs::read_dir(library).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name == DOWNLOADING_DIR || name == OLDBUILDS_DIR {
            continue;
        }
        if name.contains(version_tag) {
            return Ok(Some(entry.path()));
        }
    }

    Ok(None)
}

async fn backup_existing(install_dest: &Path, oldbuilds_dir: &Path) -> Result<(), InstallError> {
    tokio::fs::create_dir_all(oldbuilds_dir).await?;
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let name = install_dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "build".to_string());
    let backup_path = oldbuilds_dir.join(format!["{name}-{stamp}"]);

    match tokio::fs::rename(install_dest, &backup_path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(
                "could not move {} to {} ({e}); deleting it instead",
                install_dest.display(),
                backup_path.display()
            );
            tokio::fs::remove_dir_all(install_dest).await?;
            Ok(())
        }
    }
}

async fn cleanup_staging(archive_path: &Path, extraction_dir: &Path) {
    let _ = tokio::fs::remove_file(archive_path).await;
    let _ = tokio::fs::remove_dir_all(extraction_dir).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_dir_name_matches_builder_naming_convention() {
        let build = Build {
            version: semver::Version::parse("4.2.1").unwrap(),
            branch: "main".into(),
            hash: "abcdef12".into(),
            build_date: None,
            url: String::new(),
            platform: "linux".into(),
            architecture: "x86_64".into(),
            file_size: 0,
            file_name: String::new(),
            file_extension: "tar.xz".into(),
            release_cycle: "daily".into(),
            status: BuildStatus::Online,
        };
        assert_eq!(install_dir_name(&build), "blender-4.2.1-linux-x86_64");
    }

    #[test]
    fn speed_estimator_needs_two_samples_past_the_interval() {
        let mut speed = SpeedEstimator::new();
        assert!(speed.sample(0).is_none());
        std::thread::sleep(Duration::from_millis(210));
        assert!(speed.sample(1024).is_some() || speed.sample(2048).is_some());
    }

    #[tokio::test]
    async fn cancellation_registry_cancels_a_registered_token() {
        let registry = CancellationRegistry::new();
        let token = CancellationToken::new();
        registry.register("k", token.clone());
        assert!(registry.cancel_install("k"));
        assert!(token.is_cancelled());
        assert!(!registry.cancel_install("missing"));
    }
}
