//! Crate-level configuration.
//!
//! This module owns the *type* the core is configured with: a
//! [`figment::Figment`] layering serialized defaults under an optional
//! `config.toml`. Actually reading that file from the operator's config
//! directory on every launch, and persisting edits back to it, is the
//! front-end's job — the core only needs a concrete [`BlrsConfig`] value to
//! construct [`crate::catalog`] and [`crate::install`] calls with.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{catalog::ReleaseCycle, paths::BlrsPaths, paths::PROJECT_DIRS};

use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};

/// Stores information about the last build launched and when the catalog was
/// last checked.
#[derive(Default, Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct History {
    /// The last build directory that was launched.
    pub last_launched_build: Option<PathBuf>,
    /// The last time the remote catalog was checked for updates.
    pub last_time_checked: Option<DateTime<Utc>>,
}

/// Generates a random user-agent string identifying this client to the
/// builder service.
pub fn random_ua() -> String {
    format![
        "{}/{}/{}-{}-{}",
        env!["CARGO_PKG_NAME"],
        env!["CARGO_PKG_VERSION"],
        std::env::consts::ARCH,
        std::env::consts::OS,
        uuid::Uuid::new_v4()
    ]
}

/// The main configuration struct for this crate.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BlrsConfig {
    /// The user agent string used when making network requests.
    pub user_agent: String,
    /// Defines paths for build storage and catalog caching.
    pub paths: BlrsPaths,
    /// Which release cycles to fetch from the builder service.
    pub release_cycles: Vec<ReleaseCycle>,
    /// Contains information about the last launched build and catalog checks.
    pub history: History,
}

impl Default for BlrsConfig {
    fn default() -> Self {
        Self {
            user_agent: random_ua(),
            paths: Default::default(),
            release_cycles: vec![ReleaseCycle::Daily, ReleaseCycle::Patch],
            history: Default::default(),
        }
    }
}

impl BlrsConfig {
    /// Returns the default [`Figment`] used to configure this crate.
    /// If no config folder is specified, uses this crate's default config directory.
    pub fn default_figment(config_folder: Option<&Path>) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(BlrsConfig::default()))
            .merge(Toml::file(
                config_folder
                    .unwrap_or_else(|| PROJECT_DIRS.config_local_dir())
                    .join("config.toml"),
            ))
    }

    /// Creates a `ClientBuilder` with the configured user agent and the
    /// overall request (5 min) and idle-connection (2 min) timeouts every
    /// download and catalog fetch should honor.
    pub fn client_builder(&self) -> reqwest::ClientBuilder {
        reqwest::ClientBuilder::new()
            .user_agent(self.user_agent.as_str())
            .timeout(Duration::from_secs(5 * 60))
            .pool_idle_timeout(Duration::from_secs(2 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_enables_daily_and_patch() {
        let cfg = BlrsConfig::default();
        assert!(cfg.release_cycles.contains(&ReleaseCycle::Daily));
        assert!(cfg.release_cycles.contains(&ReleaseCycle::Patch));
    }

    #[test]
    fn figment_merges_defaults_with_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let figment = BlrsConfig::default_figment(Some(dir.path()));
        let cfg: BlrsConfig = figment.extract().unwrap();
        assert_eq!(cfg.release_cycles, BlrsConfig::default().release_cycles);
    }
}
