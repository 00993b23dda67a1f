//
// cache/staleness.rs
//
// Advisory modification-time bookkeeping for cached units
//

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::CacheEntry;

/// Result of comparing a cache entry against the file system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Primary file timestamp matches the one recorded at ingestion
    Fresh,
    /// Primary file changed or disappeared since ingestion
    Stale,
    /// Nothing was recorded at ingestion, so no verdict is possible
    Unknown,
}

/// Reads the modification time of `path`, if it exists and the platform reports one.
pub fn observe_mod_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Modification time of a unit's primary (first) file.
pub(crate) fn primary_mod_time(files: &[PathBuf]) -> Option<SystemTime> {
    files.first().and_then(|f| observe_mod_time(f))
}

/// Compares a recorded timestamp against a freshly observed one.
pub fn compare(recorded: Option<SystemTime>, current: Option<SystemTime>) -> Freshness {
    match (recorded, current) {
        (Some(recorded), Some(current)) if recorded == current => Freshness::Fresh,
        (Some(_), _) => Freshness::Stale,
        (None, _) => Freshness::Unknown,
    }
}

impl CacheEntry {
    /// Checks the primary file on disk against the timestamp recorded at
    /// ingestion. The cache never calls this itself; loaders and the
    /// workspace decide what to do with the verdict.
    pub fn freshness(&self) -> Freshness {
        let current = self.unit.primary_file().and_then(observe_mod_time);
        compare(self.mod_time, current)
    }
}
