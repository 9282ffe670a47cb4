//! Layered key/value configuration.
//!
//! A [`JhmFile`] is one `.jhm` file plus its `parent=` chain. A
//! [`LayeredConfig`] is the project/user/system triple, searched and
//! merged with the precedence project > user > system, and within a
//! layer, parent-chained files defer to their parent only on absence —
//! directly grounded in `jhm.py`'s `JHMFile`/`Config`/`Env.GetConfig`.

mod format;

pub use format::{RawFile, Section, ROOT_SECTION};

use crate::error::{BuildError, Result};
use std::path::{Path, PathBuf};

/// A single `.jhm` file together with the chain of files reached through
/// its `parent=` directive (root-section only, one level read per file,
/// chained transitively).
#[derive(Debug, Clone)]
pub struct JhmFile {
    raw: RawFile,
    parent: Option<Box<JhmFile>>,
}

impl JhmFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = RawFile::parse(path)?;
        let parent = match raw.get("parent", ROOT_SECTION) {
            Some(Some(rel)) => {
                let parent_path = if Path::new(rel).is_absolute() {
                    PathBuf::from(rel)
                } else {
                    path.parent().unwrap_or(Path::new(".")).join(rel)
                };
                Some(Box::new(JhmFile::load(&parent_path)?))
            }
            Some(None) => {
                return Err(BuildError::Configuration(format!(
                    "{}: 'parent' directive must have a value",
                    path.display()
                )));
            }
            None => None,
        };
        Ok(Self { raw, parent })
    }

    pub fn empty() -> Self {
        Self {
            raw: RawFile::new(),
            parent: None,
        }
    }

    /// Looks up `key` in `section`, falling back to the parent chain only
    /// when the key is absent from this file's own section.
    pub fn get(&self, key: &str, section: &str) -> Option<String> {
        match self.raw.get(key, section) {
            Some(v) => v.clone(),
            None => self.parent.as_ref().and_then(|p| p.get(key, section)),
        }
    }

    /// Merges this file's section with its parent chain's, this file's
    /// own entries winning on key collision.
    pub fn yield_section(&self, section: &str) -> Section {
        let mut merged = match &self.parent {
            Some(p) => p.yield_section(section),
            None => Section::new(),
        };
        for (k, v) in self.raw.section(section) {
            merged.insert(k, v);
        }
        merged
    }

    /// Right-fold merge of a precedence-ordered list of files (index 0 =
    /// highest precedence): later entries in the *reversed* iteration
    /// order are overwritten by earlier (higher-precedence) ones, so the
    /// final map reflects the highest-precedence file that defines each
    /// key.
    pub fn merge_and_yield<'a>(files: impl Iterator<Item = &'a JhmFile>, section: &str) -> Section {
        let mut merged = Section::new();
        let mut in_precedence_order: Vec<&JhmFile> = files.collect();
        in_precedence_order.reverse();
        for f in in_precedence_order {
            for (k, v) in f.yield_section(section) {
                merged.insert(k, v);
            }
        }
        merged
    }
}

/// One configuration layer (project, user, or system), resolved against a
/// `(config, os, arch)` triple per the search order: `C_O_A.jhm`,
/// `C_O.jhm`, `C_A.jhm`, `C.jhm`, then the same with `C` =
/// `"jhm"`. First match wins.
pub struct ConfigLayer {
    pub root: PathBuf,
    file: JhmFile,
}

impl ConfigLayer {
    pub fn load(root: &Path, config: &str, os: &str, arch: &str) -> Result<Self> {
        let candidates = Self::candidate_names(config, os, arch);
        for name in &candidates {
            let path = root.join(name);
            if path.is_file() {
                return Ok(Self {
                    root: root.to_path_buf(),
                    file: JhmFile::load(&path)?,
                });
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
            file: JhmFile::empty(),
        })
    }

    fn candidate_names(config: &str, os: &str, arch: &str) -> Vec<String> {
        let mut names = Vec::new();
        for base in [config, "jhm"] {
            names.push(format!("{base}_{os}_{arch}.jhm"));
            names.push(format!("{base}_{os}.jhm"));
            names.push(format!("{base}_{arch}.jhm"));
            names.push(format!("{base}.jhm"));
        }
        names
    }

    pub fn get(&self, key: &str, section: &str) -> Option<String> {
        self.file.get(key, section)
    }

    pub fn yield_section(&self, section: &str) -> Section {
        self.file.yield_section(section)
    }

    /// Resolves an explicit override directive (`file_kinds=<path>` /
    /// `job_kinds=<path>`), relative to this layer's root if not absolute.
    /// Concrete file-kind/job-kind registration is out of this crate's
    /// scope; callers use this only to locate a manifest of
    /// some kind if their embedding wants one.
    pub fn explicit_override(&self, directive: &str) -> Option<PathBuf> {
        self.get(directive, ROOT_SECTION).map(|v| {
            let p = PathBuf::from(&v);
            if p.is_absolute() { p } else { self.root.join(p) }
        })
    }
}

/// The project/user/system triple, precedence project > user > system.
pub struct LayeredConfig {
    pub project: ConfigLayer,
    pub user: ConfigLayer,
    pub sys: ConfigLayer,
}

impl LayeredConfig {
    pub fn load(
        project_root: &Path,
        user_root: &Path,
        sys_root: &Path,
        config: &str,
        os: &str,
        arch: &str,
    ) -> Result<Self> {
        Ok(Self {
            project: ConfigLayer::load(project_root, config, os, arch)?,
            user: ConfigLayer::load(user_root, config, os, arch)?,
            sys: ConfigLayer::load(sys_root, config, os, arch)?,
        })
    }

    /// `get(key, section)`: project's own value wins, else user's, else
    /// system's, else `None`.
    pub fn get(&self, key: &str, section: &str) -> Option<String> {
        self.project
            .get(key, section)
            .or_else(|| self.user.get(key, section))
            .or_else(|| self.sys.get(key, section))
    }

    /// Like [`Self::get`] but skips the project layer — used for settings
    /// that should not be overridable per-project (e.g. the Python
    /// original restricts `num_cores` lookups this way).
    pub fn get_sys(&self, key: &str, section: &str) -> Option<String> {
        self.user
            .get(key, section)
            .or_else(|| self.sys.get(key, section))
    }

    /// Merges a section across all three layers, project taking
    /// precedence, per spec's "Config precedence" testable property.
    pub fn yield_section(&self, section: &str) -> Section {
        let mut merged = self.sys.yield_section(section);
        for (k, v) in self.user.yield_section(section) {
            merged.insert(k, v);
        }
        for (k, v) in self.project.yield_section(section) {
            merged.insert(k, v);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn parent_chain_defers_only_on_absence() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("base.jhm"), "+gcc-args\nk=v\nshared=base\n").unwrap();
        std::fs::write(
            dir.path().join("debug.jhm"),
            "parent=base.jhm\n+gcc-args\nshared=debug\n",
        )
        .unwrap();

        let f = JhmFile::load(&dir.path().join("debug.jhm")).unwrap();
        assert_eq!(f.get("k", "gcc-args"), Some("v".to_string()));
        assert_eq!(f.get("shared", "gcc-args"), Some("debug".to_string()));
    }

    #[test]
    fn yield_section_merges_parent_chain_under_debug_overrides() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("base.jhm"), "+gcc-args\nk=v\nshared=base\n").unwrap();
        std::fs::write(
            dir.path().join("debug.jhm"),
            "parent=base.jhm\n+gcc-args\nshared=debug\n",
        )
        .unwrap();

        let f = JhmFile::load(&dir.path().join("debug.jhm")).unwrap();
        let merged = f.yield_section("gcc-args");
        assert_eq!(merged.get("k").cloned().flatten(), Some("v".to_string()));
        assert_eq!(merged.get("shared").cloned().flatten(), Some("debug".to_string()));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn duplicate_parent_directive_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.jhm"), "").unwrap();
        std::fs::write(dir.path().join("b.jhm"), "").unwrap();
        let mut f = std::fs::File::create(dir.path().join("child.jhm")).unwrap();
        writeln!(f, "parent=a.jhm").unwrap();
        writeln!(f, "parent=b.jhm").unwrap();
        drop(f);

        let err = JhmFile::load(&dir.path().join("child.jhm")).unwrap_err();
        assert!(matches!(err, BuildError::Configuration(_)));
    }

    #[test]
    fn search_order_picks_most_specific_first() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("debug.jhm"), "generic=1\n").unwrap();
        std::fs::write(dir.path().join("debug_linux.jhm"), "specific=1\n").unwrap();
        let layer = ConfigLayer::load(dir.path(), "debug", "linux", "x86_64").unwrap();
        assert_eq!(layer.get("specific", ROOT_SECTION), Some("1".to_string()));
        assert_eq!(layer.get("generic", ROOT_SECTION), None);
    }

    #[test]
    fn layered_precedence_project_over_user_over_sys() {
        let proj = tempdir().unwrap();
        let user = tempdir().unwrap();
        let sys = tempdir().unwrap();
        std::fs::write(proj.path().join("jhm.jhm"), "k=project\n").unwrap();
        std::fs::write(user.path().join("jhm.jhm"), "k=user\nu=1\n").unwrap();
        std::fs::write(sys.path().join("jhm.jhm"), "k=sys\nu=2\ns=1\n").unwrap();

        let cfg =
            LayeredConfig::load(proj.path(), user.path(), sys.path(), "debug", "linux", "x86_64")
                .unwrap();
        assert_eq!(cfg.get("k", ROOT_SECTION), Some("project".to_string()));
        assert_eq!(cfg.get("u", ROOT_SECTION), Some("1".to_string()));
        assert_eq!(cfg.get("s", ROOT_SECTION), Some("1".to_string()));
    }
}
