//! Synthetic file-kind / job-kind implementations used only by
//! [`super::scenarios`], standing in for the real compiler-invoking
//! collaborators this crate never ships: a "compile" job turns a `.c`
//! into a `.o` by writing a marker byte, a "link" job turns a `.o` into
//! an executable (empty extension) the same way, and the `.c`
//! file-kind discovers requires by reading `// requires: <path>` marker
//! comments instead of running a real preprocessor.

use crate::error::{BuildError, Result};
use crate::file::FileId;
use crate::job::JobId;
use crate::kinds::{FileKind, Input, InExt, JobKind, ScanContext};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Reads `// requires: <path>` marker lines out of a `.c` file, resolving
/// each path relative to the source tree root.
pub struct CScanner {
    pub src_root: PathBuf,
}

impl FileKind for CScanner {
    fn name(&self) -> &str {
        "c-scanner"
    }
    fn ext(&self) -> &str {
        "c"
    }
    fn scan(&self, file: FileId, ctx: &dyn ScanContext) -> Result<HashSet<FileId>> {
        let path = ctx.abs_path(file);
        let text = std::fs::read_to_string(&path).map_err(|e| BuildError::Io { path: path.clone(), source: e })?;
        let mut reqs = HashSet::new();
        for line in text.lines() {
            if let Some(rel) = line.trim().strip_prefix("// requires:") {
                let rel = rel.trim();
                let abs = self.src_root.join(rel);
                reqs.insert(ctx.get_file_from_path(&abs)?);
            }
        }
        Ok(reqs)
    }
}

/// `.c` -> `.o`, writing a one-byte placeholder object file. Counts
/// invocations in `calls` so tests can assert cache hits skip the
/// runner entirely.
pub struct CompileKind {
    pub src_root: PathBuf,
    pub out_root: PathBuf,
    pub calls: Arc<AtomicUsize>,
    out_exts: Vec<String>,
}

impl CompileKind {
    pub fn new(src_root: PathBuf, out_root: PathBuf, calls: Arc<AtomicUsize>) -> Self {
        Self {
            src_root,
            out_root,
            calls,
            out_exts: vec!["o".to_string()],
        }
    }
}

impl JobKind for CompileKind {
    fn name(&self) -> &str {
        "compile"
    }
    fn in_ext(&self) -> InExt {
        InExt::Ext("c".to_string())
    }
    fn out_exts(&self) -> &[String] {
        &self.out_exts
    }
    fn get_input(&self, out_file: FileId, ctx: &dyn ScanContext) -> Option<Input> {
        let out_abs = ctx.abs_path(out_file);
        let rel = out_abs.strip_prefix(&self.out_root).ok()?;
        let c_abs = self.src_root.join(rel.with_extension("c"));
        ctx.get_file_from_path(&c_abs).ok().map(Input::File)
    }
    fn get_output(&self, in_file: FileId, ctx: &dyn ScanContext) -> HashSet<FileId> {
        let in_abs = ctx.abs_path(in_file);
        let rel = in_abs.strip_prefix(&self.src_root).expect("compile input must be under src");
        let o_abs = self.out_root.join(rel.with_extension("o"));
        HashSet::from([ctx.get_file_from_path(&o_abs).expect("interning an out-tree path cannot fail")])
    }
    fn get_runner(&self, job: JobId, ctx: &dyn ScanContext) -> Box<dyn FnOnce() -> Result<()> + Send> {
        let calls = self.calls.clone();
        let outputs: Vec<PathBuf> = ctx.job_outputs(job).iter().map(|f| ctx.abs_path(*f)).collect();
        Box::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            for path in outputs {
                std::fs::write(&path, b"o").map_err(|e| BuildError::Io { path, source: e })?;
            }
            Ok(())
        })
    }
}

/// `.o` -> executable (empty final extension), same placeholder-write
/// shape as [`CompileKind`].
pub struct LinkKind {
    pub calls: Arc<AtomicUsize>,
    out_exts: Vec<String>,
}

impl LinkKind {
    pub fn new(calls: Arc<AtomicUsize>) -> Self {
        Self {
            calls,
            out_exts: vec![String::new()],
        }
    }
}

impl JobKind for LinkKind {
    fn name(&self) -> &str {
        "link"
    }
    fn in_ext(&self) -> InExt {
        InExt::Ext("o".to_string())
    }
    fn out_exts(&self) -> &[String] {
        &self.out_exts
    }
    fn get_input(&self, out_file: FileId, ctx: &dyn ScanContext) -> Option<Input> {
        let out_abs = ctx.abs_path(out_file);
        let o_abs = out_abs.with_extension("o");
        ctx.get_file_from_path(&o_abs).ok().map(Input::File)
    }
    fn get_output(&self, in_file: FileId, ctx: &dyn ScanContext) -> HashSet<FileId> {
        let in_abs = ctx.abs_path(in_file);
        let exe_abs = in_abs.with_extension("");
        HashSet::from([ctx.get_file_from_path(&exe_abs).expect("interning an out-tree path cannot fail")])
    }
    fn get_runner(&self, job: JobId, ctx: &dyn ScanContext) -> Box<dyn FnOnce() -> Result<()> + Send> {
        let calls = self.calls.clone();
        let outputs: Vec<PathBuf> = ctx.job_outputs(job).iter().map(|f| ctx.abs_path(*f)).collect();
        Box::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            for path in outputs {
                std::fs::write(&path, b"exe").map_err(|e| BuildError::Io { path, source: e })?;
            }
            Ok(())
        })
    }
}

/// A job-kind that claims to produce `txt` with no input of its own;
/// registering two of these under different labels exercises producer
/// precedence, since registration order decides which one's runner
/// actually fires.
pub struct TxtGenKind {
    pub label: &'static str,
    pub calls: Arc<AtomicUsize>,
    out_exts: Vec<String>,
}

impl TxtGenKind {
    pub fn new(label: &'static str, calls: Arc<AtomicUsize>) -> Self {
        Self {
            label,
            calls,
            out_exts: vec!["txt".to_string()],
        }
    }
}

impl JobKind for TxtGenKind {
    fn name(&self) -> &str {
        self.label
    }
    fn in_ext(&self) -> InExt {
        InExt::None
    }
    fn out_exts(&self) -> &[String] {
        &self.out_exts
    }
    fn get_input(&self, _out_file: FileId, _ctx: &dyn ScanContext) -> Option<Input> {
        Some(Input::NoInputNeeded)
    }
    fn get_output(&self, _in_file: FileId, _ctx: &dyn ScanContext) -> HashSet<FileId> {
        HashSet::new()
    }
    fn get_runner(&self, job: JobId, ctx: &dyn ScanContext) -> Box<dyn FnOnce() -> Result<()> + Send> {
        let calls = self.calls.clone();
        let outputs: Vec<PathBuf> = ctx.job_outputs(job).iter().map(|f| ctx.abs_path(*f)).collect();
        Box::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            for path in outputs {
                std::fs::write(&path, b"generated").map_err(|e| BuildError::Io { path, source: e })?;
            }
            Ok(())
        })
    }
}

pub fn write(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}
