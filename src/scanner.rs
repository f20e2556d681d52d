//! Discovers installed builds under the library root.

use std::path::Path;

use log::warn;

use crate::{
    build::{parse_blender_ver, Build, BuildStatus, BARE_VERSION_RE},
    error::ScanError,
    paths::{DOWNLOADING_DIR, OLDBUILDS_DIR, SIDECAR_NAME},
};

/// Walks `root`, one level deep, looking for installed build directories.
///
/// Each entry is first read via its `version.json` sidecar; when that sidecar
/// is missing or fails to parse, the directory name is matched against
/// [`BARE_VERSION_RE`] as a fallback so a build that was dropped in by hand
/// still shows up. `.downloading` and `.oldbuilds` are reserved names and are
/// always skipped. A missing `root` is not an error: it just means nothing is
/// installed yet.
///
/// The returned list is sorted by version, newest first.
pub fn scan_local(root: &Path) -> Result<Vec<Build>, ScanError> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ScanError::Io {
                path: root.to_path_buf(),
                source,
            })
        }
    };

    let mut builds = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };

        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == DOWNLOADING_DIR || name == OLDBUILDS_DIR {
            continue;
        }

        if let Some(build) = read_sidecar(&path, name) {
            builds.push(build);
            continue;
        }

        if let Some(build) = build_from_name(name) {
            builds.push(build);
        }
    }

    builds.sort_by(|a, b| b.version.cmp(&a.version));
    Ok(builds)
}

fn read_sidecar(dir: &Path, dir_name: &str) -> Option<Build> {
    let sidecar = dir.join(SIDECAR_NAME);
    let bytes = std::fs::read(&sidecar).ok()?;
    match serde_json::from_slice::<Build>(&bytes) {
        Ok(mut build) => {
            build.file_name = dir_name.to_string();
            build.status = BuildStatus::Local;
            Some(build)
        }
        Err(e) => {
            warn!("ignoring malformed sidecar at {}: {e}", sidecar.display());
            None
        }
    }
}

fn build_from_name(name: &str) -> Option<Build> {
    let captures = BARE_VERSION_RE.captures(name)?;
    let version = parse_blender_ver(&captures[0])?;

    Some(Build {
        version,
        branch: String::new(),
        hash: String::new(),
        build_date: None,
        url: String::new(),
        platform: String::new(),
        architecture: String::new(),
        file_size: 0,
        file_name: name.to_string(),
        file_extension: String::new(),
        release_cycle: String::new(),
        status: BuildStatus::Local,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_root_returns_empty() {
        let root = Path::new("/nonexistent/blendvault-test-root");
        assert_eq!(scan_local(root).unwrap(), Vec::new());
    }

    #[test]
    fn reads_sidecar_and_falls_back_to_filename() {
        let dir = tempfile::tempdir().unwrap();

        let with_sidecar = dir.path().join("blender-4.2.1-linux-x86_64");
        std::fs::create_dir(&with_sidecar).unwrap();
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
        std::fs::write(
            with_sidecar.join(SIDECAR_NAME),
            serde_json::to_vec(&build).unwrap(),
        )
        .unwrap();

        let no_sidecar = dir.path().join("blender-4.1.0-linux-x86_64");
        std::fs::create_dir(&no_sidecar).unwrap();

        let reserved = dir.path().join(DOWNLOADING_DIR);
        std::fs::create_dir(&reserved).unwrap();

        let found = scan_local(dir.path()).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].version, semver::Version::parse("4.2.1").unwrap());
        assert_eq!(found[0].status, BuildStatus::Local);
        assert_eq!(found[0].branch, "main");
        assert_eq!(found[1].version, semver::Version::parse("4.1.0").unwrap());
        assert_eq!(found[1].status, BuildStatus::Local);
    }

    #[test]
    fn malformed_sidecar_is_recovered_via_filename() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("blender-3.6.14-linux-x86_64");
        std::fs::create_dir(&broken).unwrap();
        std::fs::write(broken.join(SIDECAR_NAME), b"not json").unwrap();

        let found = scan_local(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].version, semver::Version::parse("3.6.14").unwrap());
    }
}
