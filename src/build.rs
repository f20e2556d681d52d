//! The canonical in-memory record describing one Blender build.
//!
//! A [`Build`] is used interchangeably for entries that came from the remote
//! catalog ([`crate::catalog`]) and entries recovered from disk
//! ([`crate::scanner`]); the [`crate::reconcile`] module is what tells the two
//! apart and decides which [`BuildStatus`] applies.

use std::{fmt, str::FromStr, sync::LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};

/// Where a [`Build`] currently stands relative to the operator's local library.
///
/// The first three variants are produced by [`crate::reconcile::reconcile`];
/// the remaining four are owned and transitioned by
/// [`crate::install::install`] while an installation is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Known remotely, not present in the local library.
    Online,
    /// Present in the local library; no newer matching remote build is known.
    Local,
    /// Present in the local library, but a newer remote build shares its identity.
    Update,
    /// An install is streaming the archive from the network.
    Downloading,
    /// An install is unpacking the archive on disk.
    Extracting,
    /// The most recent install attempt for this identity ended in an error.
    Failed,
    /// The most recent install attempt for this identity was cancelled.
    Cancelled,
}

/// One Blender build, remote or local.
///
/// `identity_key()` (`version|branch|release_cycle`) is what the reconciler
/// and the coordinator use to decide whether two `Build`s describe "the same"
/// build; `hash`, when non-empty, is a stronger secondary identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    /// Dotted numeric version, e.g. `4.2.1`.
    pub version: Version,
    /// Build branch, e.g. `main`, `v42`, `stable`.
    pub branch: String,
    /// Short commit hash. Empty when unknown.
    #[serde(default)]
    pub hash: String,
    /// When the build was committed, in Unix seconds on the wire.
    #[serde(
        default,
        with = "chrono::serde::ts_seconds_option",
        rename = "file_mtime"
    )]
    pub build_date: Option<DateTime<Utc>>,
    /// Download URL for the archive.
    #[serde(default)]
    pub url: String,
    /// Host platform tag: `linux`, `windows`, or `darwin`.
    #[serde(default)]
    pub platform: String,
    /// Host architecture tag: `x86_64`, `arm64`, or `amd64`.
    #[serde(default)]
    pub architecture: String,
    /// Declared archive size in bytes.
    #[serde(default)]
    pub file_size: u64,
    /// Archive file name as reported by the builder.
    #[serde(default)]
    pub file_name: String,
    /// Archive file extension, e.g. `tar.xz`.
    #[serde(default)]
    pub file_extension: String,
    /// Release channel: `daily`, `patch`, or `experimental`.
    #[serde(default)]
    pub release_cycle: String,
    /// Where this build currently stands.
    pub status: BuildStatus,
}

impl Build {
    /// The tuple used to decide whether two builds describe "the same" build
    /// across local and remote catalogs.
    pub fn identity_key(&self) -> String {
        format!["{}|{}|{}", self.version, self.branch, self.release_cycle]
    }

    /// The short commit hash, or `None` if it was never recorded.
    pub fn short_hash(&self) -> Option<&str> {
        (!self.hash.is_empty()).then_some(self.hash.as_str())
    }
}

impl fmt::Display for Build {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write![f, "{} ({}/{})", self.version, self.branch, self.release_cycle]
    }
}

/// Matches a bare dotted-numeric version of two or three components, used by
/// [`crate::scanner`] as the filename fallback when no sidecar is present.
pub static BARE_VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?P<ma>\d+)\.(?P<mi>\d+)(?:\.(?P<pa>\d+))?").unwrap());

/// Regexes used by [`parse_blender_ver`] to recover a [`Version`] from the
/// many non-SemVer-compatible strings the Blender project has used over the
/// years (directory names, archive file names, `blender -v` output).
/// The vocabulary of recognized prerelease tags (plus a trailing digit run,
/// e.g. `rc1`, `candidate2`). Anchoring the fallback patterns' `pre` group to
/// this list, rather than accepting any trailing text, keeps an arbitrary
/// garbage suffix (`4.2-bad`) from being accepted as a version.
const KNOWN_PRERELEASE_TAGS: &str =
    "alpha|beta|rc|milestone|candidate|exp|experimental|daily|test|dev";

static MATCHERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // <major>.<minor> (sub <patch>): 2.80 (sub 75) -> 2.80.75
        r"(?P<ma>\d+)\.(?P<mi>\d+) \(sub (?P<pa>\d+)\)".to_string(),
        // <major>.<minor>.<patch>-<pre>: 2.80.0-alpha -> 2.80.0-alpha
        format![r"(?P<ma>\d+)\.(?P<mi>\d+)\.(?P<pa>\d+)[ \-](?P<pre>(?i:{KNOWN_PRERELEASE_TAGS})[0-9]*)$"],
        format![r"(?P<ma>\d+)\.(?P<mi>\d+)[ \-](?P<pre>(?i:{KNOWN_PRERELEASE_TAGS})[0-9]*)$"],
        // <major>.<minor>: 2.79 -> 2.79.0
        r"(?P<ma>\d+)\.(?P<mi>\d+)$".to_string(),
        // <major>.<minor><patch?>: 2.79rc1 -> 2.79.0-rc1 | 2.79b -> 2.79.0-b
        format![r"(?P<ma>\d+)\.(?P<mi>\d+)(?P<pre>(?i:{KNOWN_PRERELEASE_TAGS})[0-9]*|[a-zA-Z])?$"],
    ]
    .into_iter()
    .map(|re| Regex::new(&re).unwrap())
    .collect()
});

static INITIAL_CLEANER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:blender-?|Blender|BLENDER|v)-?(\d.*)").unwrap());

fn simple_clean(s: &str) -> &str {
    let mut s = s;
    if let Some(c) = INITIAL_CLEANER.captures(s) {
        s = c.get(1).unwrap().as_str();
    }
    if let Some(i) = s.find("-windows") {
        s = &s[..i];
    }
    if let Some(i) = s.find("-linux") {
        s = &s[..i];
    }
    s
}

/// Parses a Blender version string into a [`Version`].
///
/// Handles plain SemVer (`4.2.1`), archive file names
/// (`blender-4.1.0-linux-x64.tar.xz`), and the older pre-SemVer scheme
/// (`2.80 (sub 75)`, `2.79rc1`).
pub fn parse_blender_ver(s: &str) -> Option<Version> {
    let mut s = s.trim();
    if let Ok(v) = Version::parse(s) {
        return Some(v);
    }

    s = simple_clean(s);
    if let Ok(v) = Version::parse(s) {
        return Some(v);
    }

    let g = MATCHERS.iter().find_map(|re| re.captures(s))?;
    let major = g.name("ma")?.as_str().parse::<u64>().ok()?;
    let minor = g.name("mi")?.as_str().parse::<u64>().ok()?;
    let patch = g
        .name("pa")
        .map(|m| m.as_str())
        .unwrap_or("0")
        .parse::<u64>()
        .ok()?;

    let mut v = Version::new(major, minor, patch);
    v.pre = match g.name("pre") {
        None => semver::Prerelease::EMPTY,
        Some(m) => semver::Prerelease::from_str(&m.as_str().to_lowercase()).ok()?,
    };

    Some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_semver() {
        assert_eq!(parse_blender_ver("3.6.14"), Version::parse("3.6.14").ok());
    }

    #[test]
    fn parses_archive_file_names() {
        assert_eq!(
            parse_blender_ver("blender-4.1.0-linux-x64.tar.xz"),
            Version::parse("4.1.0").ok()
        );
    }

    #[test]
    fn parses_old_style_versions() {
        assert_eq!(
            parse_blender_ver("2.80 (sub 75)"),
            Version::parse("2.80.75").ok()
        );
        assert_eq!(parse_blender_ver("2.79"), Version::parse("2.79.0").ok());
        assert_eq!(
            parse_blender_ver("2.79rc1"),
            Version::parse("2.79.0-rc1").ok()
        );
    }

    #[test]
    fn identity_key_combines_version_branch_cycle() {
        let b = Build {
            version: Version::parse("4.2.1").unwrap(),
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
        assert_eq!(b.identity_key(), "4.2.1|main|daily");
        assert_eq!(b.short_hash(), Some("abcdef12"));
    }

    #[test]
    fn bare_version_regex_matches_two_and_three_components() {
        assert!(BARE_VERSION_RE.is_match("blender-4.2-linux-x86_64"));
        assert!(BARE_VERSION_RE.is_match("blender-4.2.1-linux-x86_64"));
        assert!(!BARE_VERSION_RE.is_match(".downloading"));
    }
}
