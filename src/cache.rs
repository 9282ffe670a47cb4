//! Per-file cache: a `.jhm-cache` file under OUT recording a file's
//! requires list plus job-kind-opaque extra sections, and the
//! staleness check gating whether a build can be skipped.
//!
//! Grounded on `jhm.py`'s `JHMOutFile`/`File.Build`'s `CheckCache`
//! closure. Reuses [`crate::config::format::RawFile`] for the on-disk
//! grammar; unlike [`crate::config::JhmFile`] a cache file never chains
//! a `parent=`.

use crate::config::{RawFile, Section};
use crate::error::Result;
use crate::file::fs_mtime;
use std::path::{Path, PathBuf};

pub const REQUIRES_SECTION: &str = "requires";

#[derive(Debug, Clone, Default)]
pub struct CacheFile {
    raw: RawFile,
}

impl CacheFile {
    pub fn empty() -> Self {
        Self { raw: RawFile::new() }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self {
            raw: RawFile::parse(path)?,
        })
    }

    pub fn requires_paths(&self) -> Vec<PathBuf> {
        self.raw
            .section(REQUIRES_SECTION)
            .keys()
            .map(PathBuf::from)
            .collect()
    }

    pub fn add_require(&mut self, abs_path: &Path) {
        self.raw
            .set(REQUIRES_SECTION, &abs_path.to_string_lossy(), None);
    }

    pub fn get(&self, key: &str, section: &str) -> Option<&Option<String>> {
        self.raw.get(key, section)
    }

    pub fn set(&mut self, section: &str, key: &str, value: Option<String>) {
        self.raw.set(section, key, value);
    }

    pub fn section(&self, section: &str) -> Section {
        self.raw.section(section)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.raw.save(path)
    }
}

/// Result of the staleness check: either the cache is usable and
/// `requires_paths()` should be hydrated and marked cache-finished, or
/// it must be ignored and a real build performed.
pub enum Staleness {
    Fresh(CacheFile),
    Stale,
}

/// Runs the first three steps of the staleness check (the fourth step,
/// re-hydrating requires into the file store, is the caller's job since
/// it needs the `FileStore`). Skip entirely (treat as stale) when
/// `force` is set.
///
/// - `jhm_config_mtime`: mtime of the file's static `<rel_path>.jhm`, if
///   one exists.
/// - `file_stamp`: the file's current `stamp` (must be `> 0`).
/// - `out_path`: the absolute on-disk path of the file itself (must
///   exist).
/// - `cache_path`: the absolute path of the `.jhm-cache` file.
pub fn check_staleness(
    jhm_config_mtime: Option<i64>,
    file_stamp: i64,
    out_path: &Path,
    cache_path: &Path,
    force: bool,
) -> Result<Staleness> {
    if force {
        return Ok(Staleness::Stale);
    }

    if let Some(cfg_mtime) = jhm_config_mtime {
        if cfg_mtime > file_stamp {
            return Ok(Staleness::Stale);
        }
    }

    if file_stamp <= 0 || !out_path.is_file() {
        return Ok(Staleness::Stale);
    }
    if !cache_path.is_file() {
        return Ok(Staleness::Stale);
    }
    let cache_mtime = fs_mtime(cache_path);
    if cache_mtime < file_stamp {
        return Ok(Staleness::Stale);
    }

    let cache = CacheFile::load(cache_path)?;
    for req in cache.requires_paths() {
        if !req.is_file() {
            return Ok(Staleness::Stale);
        }
        if fs_mtime(&req) >= cache_mtime {
            return Ok(Staleness::Stale);
        }
    }

    Ok(Staleness::Fresh(cache))
}
