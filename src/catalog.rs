//! Fetches the remote build catalog and filters it for the current host.

use std::env::consts::{ARCH, OS};

use chrono::DateTime;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    build::{parse_blender_ver, Build, BuildStatus},
    config::BlrsConfig,
    error::CatalogError,
};

/// A release channel offered by `builder.blender.org`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseCycle {
    /// Nightly builds off the main branch and active feature branches.
    Daily,
    /// Point-release candidates for an already-released major version.
    Patch,
    /// Experimental/feature builds not destined for a stable release.
    Experimental,
}

impl ReleaseCycle {
    /// The path segment this cycle occupies in the builder URL.
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseCycle::Daily => "daily",
            ReleaseCycle::Patch => "patch",
            ReleaseCycle::Experimental => "experimental",
        }
    }

    /// The well-known endpoint URL for this cycle.
    pub fn endpoint(self) -> String {
        format![
            "https://builder.blender.org/download/{}/?format=json&v=1",
            self.as_str()
        ]
    }
}

/// Extensions the builder is allowed to advertise. Broader than what the
/// extractor can actually install (see [`crate::archive`]) for historical
/// reasons; narrowing this would silently drop catalog entries the operator
/// might want to see even if this client can't unpack them yet.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "zip", "tar.gz", "tar.xz", "tar.bz2", "xz", "dmg", "pkg", "msi", "msix",
];

/// The wire shape of one catalog entry, as returned by the builder service.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct RemoteBuildSchema {
    #[serde(default)]
    version: String,
    #[serde(default)]
    branch: String,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    file_mtime: i64,
    #[serde(default)]
    url: String,
    #[serde(default)]
    platform: String,
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    file_size: u64,
    #[serde(default)]
    file_name: String,
    #[serde(default)]
    file_extension: String,
    #[serde(default)]
    release_cycle: String,
}

impl RemoteBuildSchema {
    fn into_build(self) -> Option<Build> {
        let version = parse_blender_ver(&self.version)?;
        let build_date = (self.file_mtime > 0)
            .then(|| DateTime::from_timestamp(self.file_mtime, 0))
            .flatten();

        Some(Build {
            version,
            branch: self.branch,
            hash: self.hash,
            build_date,
            url: self.url,
            platform: self.platform,
            architecture: self.architecture,
            file_size: self.file_size,
            file_name: self.file_name,
            file_extension: self.file_extension,
            release_cycle: self.release_cycle,
            status: BuildStatus::Online,
        })
    }
}

/// Maps the host's architecture into the builder service's naming.
///
/// Returns `None` for architectures the service has no known name for;
/// callers should refuse to filter rather than pass the host arch through
/// unmapped (see spec open question (i)).
pub fn host_arch_tag(os: &str, arch: &str) -> Option<&'static str> {
    match (arch, os) {
        ("x86_64", "windows") => Some("amd64"),
        ("x86_64", _) => Some("x86_64"),
        ("aarch64", _) => Some("arm64"),
        _ => None,
    }
}

/// The host's platform tag as the builder service names it.
pub fn host_platform_tag(os: &str) -> Option<&'static str> {
    match os {
        "linux" => Some("linux"),
        "windows" => Some("windows"),
        "macos" => Some("darwin"),
        _ => None,
    }
}

/// Fetches the current remote build list for every configured release cycle
/// and filters it down to what this host can install.
///
/// `version_filter`, when non-empty, is parsed as a version floor: builds
/// strictly older than it, and builds whose version does not parse, are
/// discarded.
pub async fn fetch_builds(
    config: &BlrsConfig,
    version_filter: &str,
) -> Result<Vec<Build>, CatalogError> {
    let floor = if version_filter.is_empty() {
        None
    } else {
        Some(
            parse_blender_ver(version_filter)
                .ok_or_else(|| CatalogError::Config(version_filter.to_string()))?,
        )
    };

    let platform =
        host_platform_tag(OS).ok_or_else(|| CatalogError::Protocol(format!["unsupported host platform {OS}"]))?;
    let arch = host_arch_tag(OS, ARCH)
        .ok_or_else(|| CatalogError::Protocol(format!["unsupported host architecture {ARCH}"]))?;

    let client = config.client_builder().build()?;

    let mut out = Vec::new();
    for cycle in &config.release_cycles {
        let url = cycle.endpoint();
        debug!("fetching catalog from {url}");
        let response = client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(CatalogError::Protocol(format![
                "{} returned {}",
                url,
                response.status()
            ]));
        }
        let schemas: Vec<RemoteBuildSchema> = response.json().await.map_err(|e| {
            if e.is_decode() {
                CatalogError::Decode(serde_json::Error::io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    e.to_string(),
                )))
            } else {
                CatalogError::Network(e)
            }
        })?;

        out.extend(filter_builds(schemas, platform, arch, floor.as_ref()));
    }

    Ok(out)
}

fn filter_builds(
    schemas: Vec<RemoteBuildSchema>,
    platform: &str,
    arch: &str,
    floor: Option<&semver::Version>,
) -> Vec<Build> {
    schemas
        .into_iter()
        .filter(|s| s.platform == platform)
        .filter(|s| s.architecture == arch)
        .filter(|s| {
            ALLOWED_EXTENSIONS
                .iter()
                .any(|ext| ext.eq_ignore_ascii_case(&s.file_extension))
        })
        .filter_map(RemoteBuildSchema::into_build)
        .filter(|b| floor.is_none_or(|floor| &b.version >= floor))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(platform: &str, arch: &str, ext: &str, version: &str) -> RemoteBuildSchema {
        RemoteBuildSchema {
            version: version.to_string(),
            branch: "main".to_string(),
            hash: "abcdef12".to_string(),
            file_mtime: 1_700_000_000,
            url: "https://example.invalid/build".to_string(),
            platform: platform.to_string(),
            architecture: arch.to_string(),
            file_size: 1024,
            file_name: format!["blender-{version}-{platform}-{arch}.{ext}"],
            file_extension: ext.to_string(),
            release_cycle: "daily".to_string(),
        }
    }

    #[test]
    fn host_arch_mapping_matches_spec_examples() {
        assert_eq!(host_arch_tag("linux", "x86_64"), Some("x86_64"));
        assert_eq!(host_arch_tag("windows", "x86_64"), Some("amd64"));
        assert_eq!(host_arch_tag("macos", "aarch64"), Some("arm64"));
        assert_eq!(host_arch_tag("linux", "riscv64"), None);
    }

    #[test]
    fn filters_by_platform_arch_extension_and_version_floor() {
        let schemas = vec![
            schema("linux", "x86_64", "tar.xz", "4.2.0"),
            schema("linux", "x86_64", "sha256", "4.2.0"),
            schema("windows", "amd64", "zip", "4.2.0"),
            schema("linux", "x86_64", "tar.xz", "3.0.0"),
            schema("linux", "arm64", "tar.xz", "4.2.0"),
            schema("linux", "x86_64", "tar.xz", "4.2-bad"),
        ];

        let floor = parse_blender_ver("4.0").unwrap();
        let out = filter_builds(schemas, "linux", "x86_64", Some(&floor));

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].version, parse_blender_ver("4.2.0").unwrap());
    }

    #[test]
    fn missing_version_floor_keeps_everything_that_parses() {
        let schemas = vec![schema("linux", "x86_64", "tar.xz", "4.2.0")];
        let out = filter_builds(schemas, "linux", "x86_64", None);
        assert_eq!(out.len(), 1);
    }
}
