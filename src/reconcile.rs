//! Merges a remote catalog and a local scan into one status-annotated list.

use std::collections::{HashMap, HashSet};

use crate::build::{Build, BuildStatus};

/// Merges `remote` and `local` build lists into a single list, one entry per
/// identity, with [`BuildStatus`] reflecting what the operator should see.
///
/// For each remote record, a local match is sought first by short hash, then
/// by version string. A hash match is always [`BuildStatus::Local`]
/// regardless of timestamps. A version-only match that turns out to have a
/// different branch or release cycle is treated as no match at all
/// ([`BuildStatus::Online`]) — the identity key `version|branch|release_cycle`
/// is what ultimately decides sameness, not the version alone. Among full
/// identity matches: a missing local timestamp means the remote is presumed
/// newer ([`BuildStatus::Update`]); a missing remote timestamp means the
/// installed copy is presumed current ([`BuildStatus::Local`]); otherwise the
/// newer timestamp wins.
///
/// Local records with no remote match at all are kept with
/// [`BuildStatus::Local`]. When the same identity key would otherwise appear
/// twice, an `Update` entry is kept over a `Local` one.
pub fn reconcile(remote: Vec<Build>, local: Vec<Build>) -> Vec<Build> {
    let by_hash: HashMap<&str, &Build> = local.iter().filter_map(|b| b.short_hash().map(|h| (h, b))).collect();
    let by_version: HashMap<String, &Build> =
        local.iter().map(|b| (b.version.to_string(), b)).collect();

    let mut claimed_identities: HashSet<String> = HashSet::new();
    let mut merged: Vec<Build> = Vec::new();

    for mut candidate in remote {
        let local_match = candidate
            .short_hash()
            .and_then(|h| by_hash.get(h))
            .or_else(|| by_version.get(&candidate.version.to_string()))
            .copied();

        candidate.status = match local_match {
            None => BuildStatus::Online,
            Some(existing) => {
                let same_hash = candidate
                    .short_hash()
                    .is_some_and(|h| existing.short_hash() == Some(h));
                if same_hash {
                    BuildStatus::Local
                } else if existing.version != candidate.version
                    || existing.branch != candidate.branch
                    || existing.release_cycle != candidate.release_cycle
                {
                    BuildStatus::Online
                } else {
                    match (existing.build_date, candidate.build_date) {
                        (None, _) => BuildStatus::Update,
                        (Some(_), None) => BuildStatus::Local,
                        (Some(local_ts), Some(remote_ts)) if remote_ts > local_ts => BuildStatus::Update,
                        (Some(_), Some(_)) => BuildStatus::Local,
                    }
                }
            }
        };

        if matches!(candidate.status, BuildStatus::Local | BuildStatus::Update) {
            claimed_identities.insert(candidate.identity_key());
        }

        merged.push(candidate);
    }

    for build in local {
        if !claimed_identities.contains(&build.identity_key()) {
            merged.push(build);
        }
    }

    dedup_by_identity(merged)
}

/// Collapses `builds` to one entry per [`Build::identity_key`], preferring
/// (in order) [`BuildStatus::Update`], then [`BuildStatus::Local`], then
/// [`BuildStatus::Online`] when more than one entry shares a key. First-seen
/// order is otherwise preserved.
fn dedup_by_identity(builds: Vec<Build>) -> Vec<Build> {
    fn status_rank(status: &BuildStatus) -> u8 {
        match status {
            BuildStatus::Online => 0,
            BuildStatus::Local => 1,
            BuildStatus::Update => 2,
            _ => 0,
        }
    }

    let mut index_of: HashMap<String, usize> = HashMap::new();
    let mut deduped: Vec<Build> = Vec::new();

    for build in builds {
        let key = build.identity_key();
        match index_of.get(&key) {
            Some(&i) => {
                if status_rank(&build.status) > status_rank(&deduped[i].status) {
                    deduped[i] = build;
                }
            }
            None => {
                index_of.insert(key, deduped.len());
                deduped.push(build);
            }
        }
    }

    deduped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use semver::Version;

    fn build(
        version: &str,
        branch: &str,
        cycle: &str,
        hash: &str,
        build_date: Option<DateTime<Utc>>,
        status: BuildStatus,
    ) -> Build {
        Build {
            version: Version::parse(version).unwrap(),
            branch: branch.into(),
            hash: hash.into(),
            build_date,
            url: String::new(),
            platform: "linux".into(),
            architecture: "x86_64".into(),
            file_size: 0,
            file_name: String::new(),
            file_extension: "tar.xz".into(),
            release_cycle: cycle.into(),
            status,
        }
    }

    fn ts(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    #[test]
    fn remote_with_no_local_match_is_online() {
        let remote = vec![build("4.2.1", "main", "daily", "aaaa1111", None, BuildStatus::Online)];
        let merged = reconcile(remote, Vec::new());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, BuildStatus::Online);
    }

    #[test]
    fn matching_hash_is_local_regardless_of_timestamps() {
        let remote = vec![build(
            "4.2.1", "main", "daily", "aaaa1111", Some(ts(200)), BuildStatus::Online,
        )];
        let local = vec![build(
            "4.2.1", "main", "daily", "aaaa1111", Some(ts(100)), BuildStatus::Local,
        )];
        let merged = reconcile(remote, local);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, BuildStatus::Local);
    }

    #[test]
    fn newer_remote_timestamp_with_same_identity_is_update() {
        let remote = vec![build(
            "4.2.1", "main", "daily", "bbbb2222", Some(ts(200)), BuildStatus::Online,
        )];
        let local = vec![build(
            "4.2.1", "main", "daily", "aaaa1111", Some(ts(100)), BuildStatus::Local,
        )];
        let merged = reconcile(remote, local);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, BuildStatus::Update);
    }

    #[test]
    fn missing_local_timestamp_is_presumed_stale() {
        let remote = vec![build(
            "4.2.1", "main", "daily", "bbbb2222", Some(ts(200)), BuildStatus::Online,
        )];
        let local = vec![build("4.2.1", "main", "daily", "aaaa1111", None, BuildStatus::Local)];
        let merged = reconcile(remote, local);
        assert_eq!(merged[0].status, BuildStatus::Update);
    }

    #[test]
    fn missing_remote_timestamp_is_presumed_current() {
        let remote = vec![build("4.2.1", "main", "daily", "bbbb2222", None, BuildStatus::Online)];
        let local = vec![build(
            "4.2.1", "main", "daily", "aaaa1111", Some(ts(100)), BuildStatus::Local,
        )];
        let merged = reconcile(remote, local);
        assert_eq!(merged[0].status, BuildStatus::Local);
    }

    #[test]
    fn version_only_match_with_different_branch_is_online() {
        let remote = vec![build(
            "4.2.1", "experimental-branch", "daily", "bbbb2222", Some(ts(200)), BuildStatus::Online,
        )];
        let local = vec![build(
            "4.2.1", "main", "daily", "aaaa1111", Some(ts(100)), BuildStatus::Local,
        )];
        let merged = reconcile(remote, local);
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().any(|b| b.branch == "experimental-branch" && b.status == BuildStatus::Online));
        assert!(merged.iter().any(|b| b.branch == "main" && b.status == BuildStatus::Local));
    }

    #[test]
    fn duplicate_remote_identity_keeps_the_update_over_local() {
        let remote = vec![
            build("4.2.1", "main", "daily", "bbbb2222", Some(ts(200)), BuildStatus::Online),
            build("4.2.1", "main", "daily", "cccc3333", Some(ts(50)), BuildStatus::Online),
        ];
        let local = vec![build(
            "4.2.1", "main", "daily", "aaaa1111", Some(ts(100)), BuildStatus::Local,
        )];
        let merged = reconcile(remote, local);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, BuildStatus::Update);
    }

    #[test]
    fn unrelated_local_build_survives_untouched() {
        let remote = vec![build(
            "4.3.0", "main", "daily", "bbbb2222", Some(ts(200)), BuildStatus::Online,
        )];
        let local = vec![build(
            "3.6.14", "stable", "patch", "cccc3333", Some(ts(50)), BuildStatus::Local,
        )];
        let merged = reconcile(remote, local);
        assert_eq!(merged.len(), 2);
        assert!(merged
            .iter()
            .any(|b| b.version == Version::parse("3.6.14").unwrap() && b.status == BuildStatus::Local));
    }
}
