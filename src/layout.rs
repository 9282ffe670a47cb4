//! Project root discovery and source/include/output tree layout.
//!
//! Grounded on `jhm.py`'s `TryFindRoot`/`Env.__init__`: walk upward from
//! the current directory looking for a `.jhm/` marker, then resolve
//! `src`/`out` (and config) roots relative to it, with CLI overrides
//! always winning.

use crate::error::{BuildError, Result};
use std::path::{Path, PathBuf};

/// Walks `start` and its ancestors looking for a child directory named
/// `marker` (`.jhm` in practice). Returns the first ancestor that has
/// one, or `None` if the search reaches the filesystem root.
pub fn find_root(start: &Path, marker: &str) -> Option<PathBuf> {
    let mut path = start.to_path_buf();
    loop {
        if path.join(marker).is_dir() {
            return Some(path);
        }
        match path.parent() {
            Some(parent) => path = parent.to_path_buf(),
            None => return None,
        }
    }
}

/// Resolves the project root: `--root-dir` if given, else a `.jhm/`
/// walk-up from `cwd`.
pub fn resolve_root(cwd: &Path, root_dir_override: Option<&Path>) -> Result<PathBuf> {
    if let Some(r) = root_dir_override {
        return std::path::absolute(r).map_err(|e| BuildError::Io {
            path: r.to_path_buf(),
            source: e,
        });
    }
    find_root(cwd, ".jhm").ok_or_else(|| {
        BuildError::Environment(
            "unable to find build root; indicate it by creating a '.jhm' directory or passing --root-dir"
                .to_string(),
        )
    })
}

/// Makes `path` absolute and normalized relative to `root` if it isn't
/// already absolute (`jhm.py`'s `ProjectAbs`).
pub fn project_abs(root: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    normalize(&joined)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        use std::path::Component::*;
        match component {
            CurDir => {}
            ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// The `out/<config>[-<os>][-<arch>]` suffix rule: the os/arch
/// components are appended only when they differ from the host's
/// defaults, so a default build's out-dir stays just `out/debug`.
pub fn out_sub_dir(config: &str, os: &str, arch: &str, host_os: &str, host_arch: &str) -> String {
    let mut dir = config.to_string();
    if os != host_os {
        dir.push('-');
        dir.push_str(os);
    }
    if arch != host_arch {
        dir.push('-');
        dir.push_str(arch);
    }
    dir
}

pub fn host_os() -> &'static str {
    std::env::consts::OS
}

pub fn host_arch() -> &'static str {
    std::env::consts::ARCH
}
