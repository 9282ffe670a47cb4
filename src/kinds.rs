//! File-kind / job-kind registries and the narrow traits external
//! collaborators implement. Concrete kinds (the C/C++/Haskell/yacc/swig/
//! graphviz plugins, the compiler-invoking scanners) are out of scope
//! for this crate; this module only defines the interface and the
//! lookup tables that the availability search and scheduler consult.

use crate::error::{BuildError, Result};
use crate::file::FileId;
use crate::job::JobId;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Arc;

/// The three outcomes a job-kind's `get_input` can return: a concrete
/// File to recurse on, an explicit "this job needs nothing", or "I
/// don't handle this" (modeled as `Option<Input>` at the call site
/// rather than folding "nothing" and "no input needed" into one case).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    File(FileId),
    NoInputNeeded,
}

/// Declared input extension for a job-kind: either a specific extension
/// or "no input" (a job-kind that only ever produces output-only jobs).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InExt {
    Ext(String),
    None,
}

pub trait FileKind: Send + Sync {
    fn name(&self) -> &str;

    /// The extension this file-kind claims (without the leading dot).
    fn ext(&self) -> &str;

    /// Fixed prefix this kind expects on `base` (e.g. `"lib"` for
    /// archive members), or `""` if none.
    fn prefix(&self) -> &str {
        ""
    }

    /// Scans the on-disk contents of `file` and returns the set of files
    /// it directly requires. Must be deterministic and idempotent for a
    /// given on-disk state.
    fn scan(&self, file: FileId, ctx: &dyn ScanContext) -> Result<HashSet<FileId>>;
}

/// The narrow slice of engine state a scanner needs, so `FileKind` impls
/// don't depend on the whole engine module.
pub trait ScanContext {
    fn abs_path(&self, file: FileId) -> std::path::PathBuf;
    fn get_file_from_path(&self, path: &std::path::Path) -> Result<FileId>;

    /// Stages an opaque key/value pair into `file`'s not-yet-persisted
    /// cache, for job-kinds that discover extra build arguments while
    /// running (e.g. compiler flags emitted during codegen). Persisted
    /// verbatim the next time the file's cache is saved. Default is a
    /// no-op so narrow test fixtures don't need to implement it.
    fn stage_cache_entry(&self, file: FileId, section: &str, key: &str, value: Option<String>) {
        let _ = (file, section, key, value);
    }

    /// The bound input of `job`, if any — lets a `get_runner` closure
    /// recover what it's building without the engine exposing its whole
    /// `JobStore`. Default is `None`; fixtures that never call a runner
    /// needing this don't have to implement it.
    fn job_input(&self, job: JobId) -> Option<FileId> {
        let _ = job;
        None
    }

    /// The frozen output set of `job`.
    fn job_outputs(&self, job: JobId) -> Vec<FileId> {
        let _ = job;
        Vec::new()
    }
}

pub trait JobKind: Send + Sync {
    fn name(&self) -> &str;

    fn in_ext(&self) -> InExt;

    /// Declared output extensions; empty for an "any output" magic
    /// job-kind.
    fn out_exts(&self) -> &[String];

    fn get_input(&self, out_file: FileId, ctx: &dyn ScanContext) -> Option<Input>;

    fn get_output(&self, in_file: FileId, ctx: &dyn ScanContext) -> HashSet<FileId>;

    fn get_base_depends(&self, job: JobId, ctx: &dyn ScanContext) -> HashSet<FileId> {
        let _ = (job, ctx);
        HashSet::new()
    }

    fn get_depends(&self, req_set: &HashSet<FileId>, ctx: &dyn ScanContext) -> HashSet<FileId> {
        let _ = ctx;
        req_set.clone()
    }

    /// Builds a zero-argument runner that, invoked, produces every output
    /// in `job`'s `output_set` (typically by spawning a command via
    /// [`crate::cmd::run_command`]).
    fn get_runner(&self, job: JobId, ctx: &dyn ScanContext) -> Box<dyn FnOnce() -> Result<()> + Send>;
}

/// Extension-indexed lookup table, preserving registration order for
/// magic-kind and tie-break consultation ("longest matching prefix" /
/// "registration order" rules).
pub struct FileKindRegistry {
    kinds: Vec<Arc<dyn FileKind>>,
}

impl FileKindRegistry {
    pub fn new() -> Self {
        Self { kinds: Vec::new() }
    }

    pub fn register(&mut self, kind: Arc<dyn FileKind>) {
        self.kinds.push(kind);
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Best-matching registered file-kind for `ext`, tie-broken by
    /// longest matching prefix on `base`.
    pub fn best_match(&self, ext: &str, base: &str) -> Option<Arc<dyn FileKind>> {
        self.kinds
            .iter()
            .filter(|k| k.ext() == ext)
            .filter(|k| base.starts_with(k.prefix()))
            .max_by_key(|k| k.prefix().len())
            .cloned()
    }
}

impl Default for FileKindRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct JobKindRegistry {
    kinds: Vec<Arc<dyn JobKind>>,
}

impl JobKindRegistry {
    pub fn new() -> Self {
        Self { kinds: Vec::new() }
    }

    pub fn register(&mut self, kind: Arc<dyn JobKind>) {
        self.kinds.push(kind);
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Job-kinds declaring `ext` among their `out_exts`, in registration
    /// order, followed by the "magic" kinds (`in_ext = None` and empty
    /// `out_exts`) as a last resort.
    pub fn producers_for(&self, ext: &str) -> Vec<Arc<dyn JobKind>> {
        let mut specific: Vec<Arc<dyn JobKind>> = self
            .kinds
            .iter()
            .filter(|k| k.out_exts().iter().any(|e| e == ext))
            .cloned()
            .collect();
        let magic = self
            .kinds
            .iter()
            .filter(|k| matches!(k.in_ext(), InExt::None) && k.out_exts().is_empty())
            .cloned();
        specific.extend(magic);
        specific
    }

    /// Validates that `ext` is declared in `kind`'s `out_exts`, unless
    /// `out_exts` is empty (the magic "any output" exception), raised as
    /// `BuildError::Internal` when it fails.
    pub fn check_declared_output(kind: &dyn JobKind, ext: &str) -> Result<()> {
        if kind.out_exts().is_empty() || kind.out_exts().iter().any(|e| e == ext) {
            Ok(())
        } else {
            Err(BuildError::internal_mismatched_output(kind.name(), ext))
        }
    }
}

impl Default for JobKindRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered manifest entries as discovered from `file_kinds*.ext` /
/// `job_kinds*.ext` plugin files. Loading the referenced definitions is
/// left to the embedder: this crate has no dynamic module loader, only
/// the name table a caller populates at startup.
pub type KindManifest = IndexMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub {
        ext: String,
        prefix: String,
    }
    impl FileKind for Stub {
        fn name(&self) -> &str {
            "stub"
        }
        fn ext(&self) -> &str {
            &self.ext
        }
        fn prefix(&self) -> &str {
            &self.prefix
        }
        fn scan(&self, _file: FileId, _ctx: &dyn ScanContext) -> Result<HashSet<FileId>> {
            Ok(HashSet::new())
        }
    }

    #[test]
    fn best_match_prefers_longest_prefix() {
        let mut reg = FileKindRegistry::new();
        reg.register(Arc::new(Stub {
            ext: "a".into(),
            prefix: "".into(),
        }));
        reg.register(Arc::new(Stub {
            ext: "a".into(),
            prefix: "lib".into(),
        }));
        let m = reg.best_match("a", "libfoo").unwrap();
        assert_eq!(m.prefix(), "lib");
    }
}
