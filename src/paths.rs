//! Where on disk this crate's data lives.

use std::{path::PathBuf, sync::LazyLock, time::Duration};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// This static variable holds the project's directory structure.
pub static PROJECT_DIRS: LazyLock<ProjectDirs> =
    LazyLock::new(|| ProjectDirs::from("", "zeptofine", "blendvault").unwrap());

/// Ensures that the config folder exists for this crate's configuration files.
pub fn ensure_config_folder_exists() -> Result<(), std::io::Error> {
    std::fs::create_dir_all(PROJECT_DIRS.config_local_dir())
}

/// The default install root, where every build directory, `.downloading/`,
/// and `.oldbuilds/` live side by side.
///```txt
/// builds
/// |
/// +-blender-4.2.1-linux-x86_64/
/// | +-version.json
/// | +-blender
/// | + ...
/// +-.downloading/
/// +-.oldbuilds/
/// + ...
///```
pub static DEFAULT_LIBRARY_FOLDER: LazyLock<PathBuf> =
    LazyLock::new(|| PROJECT_DIRS.data_dir().to_path_buf().join("builds"));

/// The default folder for cached remote catalog responses.
pub static DEFAULT_REPOS_FOLDER: LazyLock<PathBuf> =
    LazyLock::new(|| PROJECT_DIRS.data_dir().to_path_buf().join("remote-repos"));

/// The reserved name of the staging subdirectory for in-flight downloads.
pub const DOWNLOADING_DIR: &str = ".downloading";
/// The reserved name of the backup subdirectory for displaced prior installs.
pub const OLDBUILDS_DIR: &str = ".oldbuilds";
/// The sidecar file name written into every installed build directory.
pub const SIDECAR_NAME: &str = "version.json";

/// The interval at which the UI should consider the catalog stale and refetch
/// (6 hours). Staleness/stall detection itself is a UI concern; the core
/// only exposes the constant.
pub static FETCH_INTERVAL: Duration = Duration::from_secs(60 * 60 * 6);

/// Defines the paths where this crate's data is stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlrsPaths {
    /// The install root: holds all downloaded builds plus `.downloading/` and `.oldbuilds/`.
    pub library: PathBuf,
    /// The path that holds cached remote-catalog `.json` files.
    pub remote_repos: PathBuf,
}

impl Default for BlrsPaths {
    fn default() -> Self {
        Self {
            library: DEFAULT_LIBRARY_FOLDER.clone(),
            remote_repos: DEFAULT_REPOS_FOLDER.clone(),
        }
    }
}

impl BlrsPaths {
    /// The reserved staging directory under the install root.
    pub fn downloading_dir(&self) -> PathBuf {
        self.library.join(DOWNLOADING_DIR)
    }

    /// The reserved backup directory under the install root.
    pub fn oldbuilds_dir(&self) -> PathBuf {
        self.library.join(OLDBUILDS_DIR)
    }
}
