//! Shared, keyed progress state for in-flight installs.
//!
//! One [`ProgressMap`] is shared between [`crate::install::install`] and
//! whatever front end is polling it; [`parking_lot::RwLock`] is used instead
//! of the std lock since readers vastly outnumber writers and never block
//! each other.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Which part of the install pipeline a [`ProgressState`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Preparing the staging directory.
    Preparing,
    /// Streaming the archive from the network.
    Downloading,
    /// Probing the archive's root folder and backing up any displaced install.
    Staging,
    /// Unpacking the staged archive.
    Extracting,
    /// Moving the finished install into place.
    Finalizing,
    /// The install finished successfully.
    Finished,
    /// The install failed.
    Failed,
    /// The install was cancelled.
    Cancelled,
}

/// A single progress sample for one identity key.
#[derive(Debug, Clone)]
pub struct ProgressState {
    /// Which phase this sample was taken in.
    pub phase: Phase,
    /// Bytes processed so far (downloaded, or extracted uncompressed size).
    pub processed: u64,
    /// Total bytes expected, when known.
    pub total: Option<u64>,
    /// Smoothed instantaneous transfer rate in bytes/second, when known.
    pub bytes_per_sec: Option<f64>,
    /// When this sample was recorded.
    pub last_updated: DateTime<Utc>,
}

impl ProgressState {
    /// Fraction complete in `[0.0, 1.0]`, or `None` when `total` is unknown.
    pub fn fraction(&self) -> Option<f64> {
        self.total
            .filter(|&t| t > 0)
            .map(|t| (self.processed as f64 / t as f64).clamp(0.0, 1.0))
    }
}

/// A keyed map of in-flight install progress, shared between the installer
/// and any number of readers.
///
/// Entries are keyed by [`crate::build::Build::identity_key`]. A terminal
/// entry (`Finished`, `Failed`, `Cancelled`) is left in the map for the
/// caller to observe and discard; nothing in this crate removes it on their
/// behalf.
#[derive(Debug, Clone, Default)]
pub struct ProgressMap {
    inner: Arc<RwLock<HashMap<String, ProgressState>>>,
}

impl ProgressMap {
    /// Creates an empty progress map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new sample for `key`, overwriting any previous one.
    pub fn set(&self, key: &str, state: ProgressState) {
        self.inner.write().insert(key.to_string(), state);
    }

    /// Returns the current sample for `key`, if one has been recorded.
    pub fn get(&self, key: &str) -> Option<ProgressState> {
        self.inner.read().get(key).cloned()
    }

    /// Removes the entry for `key`. Callers use this to discard a terminal
    /// entry once they've observed it.
    pub fn clear(&self, key: &str) {
        self.inner.write().remove(key);
    }

    /// Snapshots every entry currently tracked.
    pub fn snapshot(&self) -> HashMap<String, ProgressState> {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(phase: Phase, processed: u64, total: Option<u64>) -> ProgressState {
        ProgressState {
            phase,
            processed,
            total,
            bytes_per_sec: None,
            last_updated: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
        }
    }

    #[test]
    fn set_then_get_round_trips() {
        let map = ProgressMap::new();
        map.set("4.2.1|main|daily", sample(Phase::Downloading, 50, Some(100)));
        let state = map.get("4.2.1|main|daily").unwrap();
        assert_eq!(state.fraction(), Some(0.5));
    }

    #[test]
    fn missing_total_has_no_fraction() {
        let map = ProgressMap::new();
        map.set("k", sample(Phase::Extracting, 50, None));
        assert_eq!(map.get("k").unwrap().fraction(), None);
    }

    #[test]
    fn clear_removes_terminal_entry() {
        let map = ProgressMap::new();
        map.set("k", sample(Phase::Finished, 100, Some(100)));
        assert!(map.get("k").is_some());
        map.clear("k");
        assert!(map.get("k").is_none());
    }
}
