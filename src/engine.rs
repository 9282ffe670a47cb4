//! The top-level driver: owns every interning store and registry,
//! implements [`AvailabilityEngine`] and [`ScanContext`], and drives
//! `File`/`Job` completion through the scheduler as a [`Buildable`].

use crate::availability::{ensure_availability, AvailabilityEngine};
use crate::cache::{check_staleness, CacheFile, Staleness};
use crate::config::{LayeredConfig, Section};
use crate::error::{BuildError, Result};
use crate::file::{fs_mtime, File, FileId, FileStore, NameParts};
use crate::job::{Job, JobId, JobStore};
use crate::kinds::{FileKindRegistry, JobKindRegistry, ScanContext};
use crate::scheduler::{Buildable, Scheduler, Tag};
use crate::tree::{TreeKind, TreeRegistry};
use dashmap::DashMap;
use itertools::Itertools;
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything a running build needs, wired together once at startup and
/// shared (via `Arc`) across every worker thread.
pub struct Engine {
    pub trees: TreeRegistry,
    pub files: FileStore,
    pub jobs: JobStore,
    pub file_kinds: FileKindRegistry,
    pub job_kinds: JobKindRegistry,
    pub config: LayeredConfig,
    pub scheduler: Arc<Scheduler>,
    pub force: bool,

    targets: Mutex<Vec<FileId>>,
    pending_cache: DashMap<FileId, Mutex<CacheFile>>,
    jhm_file_cache: DashMap<FileId, Option<Arc<crate::config::JhmFile>>>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trees: TreeRegistry,
        config: LayeredConfig,
        file_kinds: FileKindRegistry,
        job_kinds: JobKindRegistry,
        force: bool,
        jhm_debug: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            trees,
            files: FileStore::new(),
            jobs: JobStore::new(),
            file_kinds,
            job_kinds,
            config,
            scheduler: Scheduler::new(jhm_debug),
            force,
            targets: Mutex::new(Vec::new()),
            pending_cache: DashMap::new(),
            jhm_file_cache: DashMap::new(),
        })
    }

    // ---- path / tree resolution -----------------------------------

    /// Absolute on-disk path for an interned file. INC has no single
    /// tree object on `File` (only its `TreeKind`), so this searches the
    /// declared INC trees in order for the first one where the path
    /// actually exists, falling back to the first INC tree (or OUT, if
    /// there are none) for a file that doesn't exist anywhere yet.
    pub fn abs_path(&self, id: FileId) -> PathBuf {
        let file = self.files.get(id);
        match file.tree_kind {
            TreeKind::Src => self.trees.src.abs_path(&file.rel_path),
            TreeKind::Out => self.trees.out.abs_path(&file.rel_path),
            TreeKind::Inc => self
                .trees
                .inc
                .iter()
                .map(|t| t.abs_path(&file.rel_path))
                .find(|p| p.is_file())
                .unwrap_or_else(|| {
                    self.trees
                        .inc
                        .first()
                        .map(|t| t.abs_path(&file.rel_path))
                        .unwrap_or_else(|| self.trees.out.abs_path(&file.rel_path))
                }),
        }
    }

    fn cache_path(&self, file: &File) -> PathBuf {
        self.trees.out.abs_path(&with_suffix(&file.rel_path, "jhm-cache"))
    }

    fn jhm_static_config_path(&self, file: &File) -> Option<PathBuf> {
        let jhm_rel = with_suffix(&file.rel_path, "jhm");
        std::iter::once(&self.trees.src)
            .chain(self.trees.inc.iter())
            .map(|t| t.abs_path(&jhm_rel))
            .find(|p| p.is_file())
    }

    /// Resolves a path (as given on the command line, discovered by a
    /// scanner, or read out of a cache's `requires` section) to a
    /// `FileId`, running the availability search exactly once as a
    /// construction side effect.
    pub fn get_file_from_path(&self, path: &Path) -> Result<FileId> {
        let (tree_kind, rel_path) = self.resolve_tree_and_rel(path);
        let parts = NameParts::split(&rel_path);
        let id = self.intern_file_parts(tree_kind, parts.clone())?;
        if self.files.get(id).is_available() {
            return Ok(id);
        }

        // Speculative executable-form probe: if the plain form isn't
        // available, and it doesn't already end in the executable-form
        // marker, try again with a trailing empty `ext_list` element and
        // adopt it only if *that* identity turns out to be available.
        let already_exe = parts.ext_list.last().is_some_and(|e| e.is_empty());
        if !already_exe {
            let mut exe_ext_list = parts.ext_list.clone();
            exe_ext_list.push(String::new());
            let exe_parts = NameParts {
                branch: parts.branch,
                base: parts.base,
                ext_list: exe_ext_list,
            };
            let exe_id = self.intern_file_parts(tree_kind, exe_parts)?;
            if self.files.get(exe_id).is_available() {
                return Ok(exe_id);
            }
        }

        Ok(id)
    }

    /// Absolute paths resolve against whichever tree contains them (or
    /// OUT, with the leading separator stripped, if none do). Relative
    /// paths resolve against the first tree in which they exist, or OUT
    /// if none do — unlike target resolution, this never errors on an
    /// unfound relative path, since OUT is always a valid destination
    /// for something still to be produced.
    fn resolve_tree_and_rel(&self, path: &Path) -> (TreeKind, PathBuf) {
        if path.is_absolute() {
            if let Some(tree) = self.trees.find_containing_abs(path) {
                return (tree.kind, tree.rel_path(path));
            }
            let stripped = path.to_string_lossy();
            let stripped = stripped.trim_start_matches(['/', '\\']);
            return (TreeKind::Out, PathBuf::from(stripped));
        }
        let tree = self.trees.try_find_tree(path);
        (tree.kind, path.to_path_buf())
    }

    fn intern_file_parts(&self, tree_kind: TreeKind, parts: NameParts) -> Result<FileId> {
        let file = self.files.get_file_parts(tree_kind, parts);
        ensure_availability(self, file.id)?;
        Ok(file.id)
    }

    fn file_kind_for(&self, file: &File) -> Option<Arc<dyn crate::kinds::FileKind>> {
        self.file_kinds.best_match(&file.file_kind_ext, &file.parts.base)
    }

    // ---- targets ----------------------------------------------------

    /// Resolves and registers a CLI-given target path: an absolute path
    /// resolves directly; a relative one is first made absolute against
    /// `cwd` and, if that
    /// lands inside a declared tree, re-resolved as a path relative to
    /// that tree (so e.g. `../src/foo.c` and `foo.c` run from inside
    /// `src/` land on the same File); otherwise it's resolved as given.
    pub fn add_target_by_path(&self, path_str: &str, cwd: &Path) -> Result<()> {
        let p = Path::new(path_str);
        let id = if p.is_absolute() {
            self.get_file_from_path(p)?
        } else {
            let abs = crate::layout::project_abs(cwd, p);
            match self.trees.find_containing_abs(&abs) {
                Some(tree) => self.get_file_from_path(&tree.rel_path(&abs))?,
                None => self.get_file_from_path(p)?,
            }
        };
        self.targets.lock().push(id);
        self.scheduler.add_required(&[Tag::File(id)], self);
        Ok(())
    }

    pub fn target_ids(&self) -> Vec<FileId> {
        self.targets.lock().clone()
    }

    // ---- cache plumbing ----------------------------------------------

    fn ensure_cache_file_ready(&self, file_id: FileId) {
        self.pending_cache.entry(file_id).or_insert_with(|| Mutex::new(CacheFile::empty()));
    }

    fn check_file_cache(&self, file: &File) -> Result<Staleness> {
        let abs_path = self.abs_path(file.id);
        let stamp = file.stamp(&abs_path);
        let jhm_mtime = self.jhm_static_config_path(file).as_deref().map(fs_mtime);
        let cache_path = self.cache_path(file);
        check_staleness(jhm_mtime, stamp, &abs_path, &cache_path, self.force)
    }

    fn persist_file_cache(&self, file: &File) -> Result<()> {
        let cache_path = self.cache_path(file);
        let mut cache = self
            .pending_cache
            .remove(&file.id)
            .map(|(_, m)| m.into_inner())
            .unwrap_or_else(CacheFile::empty);
        for req_id in file.requires() {
            cache.add_require(&self.abs_path(req_id));
        }
        cache.save(&cache_path)
    }

    /// Loads (once, caching the result) the file's static `<rel_path>.jhm`,
    /// if any — the `jhm_file` property in the original.
    fn jhm_file_for(&self, file: &Arc<File>) -> Option<Arc<crate::config::JhmFile>> {
        self.jhm_file_cache
            .entry(file.id)
            .or_insert_with(|| {
                self.jhm_static_config_path(file)
                    .and_then(|p| crate::config::JhmFile::load(&p).ok())
                    .map(Arc::new)
            })
            .clone()
    }

    /// Loads the file's static `<rel_path>.jhm`, if any, and folds its
    /// `requires` section into the file's own req_set — mirroring the
    /// `jhm_file` property's side effect in the original. Safe to call
    /// repeatedly: re-propagating an already-merged requires set is a
    /// no-op (safe to call on every retry of this step).
    fn ensure_jhm_file_loaded(&self, file: &Arc<File>) {
        let Some(jhm_file) = self.jhm_file_for(file) else { return };
        let reqs: HashSet<FileId> = jhm_file
            .yield_section(crate::cache::REQUIRES_SECTION)
            .keys()
            .filter_map(|k| self.get_file_from_path(Path::new(k)).ok())
            .collect();
        if !reqs.is_empty() {
            self.propagate_reqs(file, &reqs);
        }
    }

    // ---- per-file config query ----------------------------------------
    //
    // `File.GetConfig`/`HasInConfig`/`YieldReqSection`/`YieldParentSection`/
    // `YieldSection` in the original: a file's own `.jhm`/`.jhm-cache`
    // config, falling back through its requires' configs and finally the
    // layered project/user/sys config, per spec's stated precedence
    // ("within a layer, a file's own config > its requires' configs > its
    // sys/parent configs"). `jhm.py`'s own `GetConfig` and
    // `HasInConfig`/`YieldSection` disagree with each other on this
    // ordering (`GetConfig` has the cache file override the jhm file;
    // `HasInConfig`'s merge list puts `self` *last*, i.e. lowest
    // precedence, behind its own requires) — this crate follows the
    // precedence spec.md states rather than either contradictory original
    // ordering; see DESIGN.md's "Open questions resolved".

    /// `File.GetConfig`: the effective value for `key` in `section`.
    pub fn file_get_config(&self, file_id: FileId, section: &str, key: &str) -> Option<String> {
        self.file_yield_section(file_id, section, true).get(key).cloned().flatten()
    }

    /// `File.HasInConfig`: whether `key` is defined in the combined
    /// own/requires/sys config, optionally requiring a specific value.
    pub fn file_has_in_config(&self, file_id: FileId, section: &str, key: &str, needed_value: Option<&str>) -> bool {
        match self.file_yield_section(file_id, section, true).get(key) {
            Some(v) => needed_value.is_none() || v.as_deref() == needed_value,
            None => false,
        }
    }

    /// `File.YieldReqSection`: `section` merged across this file's direct
    /// requires only (their own config, not recursed into their own
    /// requires), in ascending `FileId` order for determinism (the
    /// original iterates a Python `set`, whose order is unspecified).
    pub fn file_yield_req_section(&self, file_id: FileId, section: &str) -> Section {
        let file = self.files.get(file_id);
        let mut req_ids: Vec<FileId> = file.requires().into_iter().collect();
        req_ids.sort_unstable();
        let mut merged = Section::new();
        for req_id in req_ids {
            for (k, v) in self.file_own_section(req_id, section) {
                merged.insert(k, v);
            }
        }
        merged
    }

    /// `File.YieldParentSection`: the layered project/user/sys config's
    /// merged section — the "sys/parent" tier spec.md's precedence names,
    /// unrelated to any particular file.
    pub fn file_yield_parent_section(&self, section: &str) -> Section {
        self.config.yield_section(section)
    }

    /// `File.YieldSection`: this file's own config, then (when `parent`)
    /// falling back through its requires' configs and finally the layered
    /// project/user/sys config.
    pub fn file_yield_section(&self, file_id: FileId, section: &str, parent: bool) -> Section {
        let mut merged = if parent {
            self.file_yield_parent_section(section)
        } else {
            Section::new()
        };
        if parent {
            for (k, v) in self.file_yield_req_section(file_id, section) {
                merged.insert(k, v);
            }
        }
        for (k, v) in self.file_own_section(file_id, section) {
            merged.insert(k, v);
        }
        merged
    }

    /// This file's own static `.jhm` config (if any) overridden by its
    /// persisted `.jhm-cache` extras (if any) — `jhm_file`/`jhm_cache_file`
    /// in the original, jhm_file taking precedence on overlap.
    fn file_own_section(&self, file_id: FileId, section: &str) -> Section {
        let file = self.files.get(file_id);
        let mut merged = Section::new();
        let cache_path = self.cache_path(&file);
        if let Ok(cache) = CacheFile::load(&cache_path) {
            for (k, v) in cache.section(section) {
                merged.insert(k, v);
            }
        }
        if let Some(jhm_file) = self.jhm_file_for(&file) {
            for (k, v) in jhm_file.yield_section(section) {
                merged.insert(k, v);
            }
        }
        merged
    }

    /// Marks `id` cache-finished (the `__CacheFinish` step): skips if
    /// already done or already marked, then loads the file's
    /// *own* persisted cache (it must have one, since it was listed in
    /// some other file's fresh cache) and folds its requires in too, so
    /// the transitive requires chain is visible even though `id` itself
    /// is never actually rebuilt this run.
    fn mark_requirement_cache_finished(&self, id: FileId) {
        let file = self.files.get(id);
        if file.is_done() || file.cache_finished() {
            return;
        }
        file.mark_cache_finished();
        let cache_path = self.cache_path(&file);
        if let Ok(cache) = CacheFile::load(&cache_path) {
            let reqs: HashSet<FileId> = cache
                .requires_paths()
                .iter()
                .filter_map(|p| self.get_file_from_path(p).ok())
                .collect();
            self.propagate_reqs(&file, &reqs);
        }
    }

    // ---- requires propagation -----------------------------------------

    /// `File.AddReqs`: merges `new` into `file`'s req_set, promotes a
    /// SRC file's stamp to the max of its new requires' stamps, then
    /// (outside any per-file lock) fans the delta out to consumers'
    /// depend sets and recursively to users, finally registering `file`
    /// as a user of each newly-added require.
    fn propagate_reqs(&self, file: &Arc<File>, new: &HashSet<FileId>) {
        let delta = file.merge_reqs(new);

        if file.tree_kind.is_src() {
            if let Some(max_stamp) = delta
                .iter()
                .map(|id| {
                    let req = self.files.get(*id);
                    req.stamp(&self.abs_path(*id))
                })
                .max()
            {
                file.promote_stamp(max_stamp);
            }
        }

        if delta.is_empty() {
            return;
        }

        for job_id in file.consumers() {
            let job = self.jobs.get(job_id);
            self.job_add_depends(&job, &delta);
        }
        for user_id in file.users() {
            let user = self.files.get(user_id);
            self.propagate_reqs(&user, &delta);
        }
        for &req_id in &delta {
            self.files.get(req_id).add_user(file.id);
        }
    }

    /// `Job.AddDepends`: runs the job-kind's `get_depends` over the
    /// file-side delta, then merges the result into the job's own
    /// depend_set.
    fn job_add_depends(&self, job: &Arc<Job>, req_delta: &HashSet<FileId>) {
        let dep_set = job.kind.get_depends(req_delta, self);
        self.do_add_depends(job, &dep_set);
    }

    /// `Job.__DoAddDepends`: merges `dep_set` into depend_set, then for
    /// each newly added dependency registers this job as its consumer
    /// and, for each of the job's outputs, registers that output as a
    /// user of the dependency (so a later requires-update on the
    /// dependency also reaches the job's outputs).
    fn do_add_depends(&self, job: &Arc<Job>, dep_set: &HashSet<FileId>) {
        let new_deps = job.merge_depends(dep_set);
        if new_deps.is_empty() {
            return;
        }
        for &dep_id in &new_deps {
            self.file_add_consumer(dep_id, job.id);
            for &out_id in job.output_set() {
                self.files.get(dep_id).add_user(out_id);
            }
        }
    }

    /// `File.AddConsumer`: registers `job` as a consumer of `file_id`,
    /// and if `file_id` already has known requires, immediately pushes
    /// them into the job (it may have registered as a consumer after the
    /// file was already partially scanned).
    fn file_add_consumer(&self, file_id: FileId, job_id: JobId) {
        let file = self.files.get(file_id);
        file.add_consumer(job_id);
        let reqs = file.requires();
        if !reqs.is_empty() {
            let job = self.jobs.get(job_id);
            self.job_add_depends(&job, &reqs);
        }
    }

    fn complete_file(&self, file: &Arc<File>) {
        if !file.mark_done() {
            return;
        }
        let mut tags: Vec<Tag> = file.users().into_iter().map(Tag::File).collect();
        tags.extend(file.consumers().into_iter().map(Tag::Job));
        self.scheduler.add_if_needed(&tags, self);
    }

    fn complete_job(&self, job: &Arc<Job>) {
        if !job.mark_done() {
            return;
        }
        let tags: Vec<Tag> = job.output_set().iter().copied().map(Tag::File).collect();
        self.scheduler.add_if_needed(&tags, self);
    }

    // ---- build orchestration --------------------------------------------

    fn build_file(&self, file_id: FileId) -> Result<()> {
        let file = self.files.get(file_id);
        if file.is_done() {
            return Ok(());
        }

        self.ensure_jhm_file_loaded(&file);

        if file.cache_finished() {
            self.complete_file(&file);
            return Ok(());
        }

        if let Staleness::Fresh(cache) = self.check_file_cache(&file)? {
            trace!("cache hit for {}", file.rel_path.display());
            let mut req_ids = HashSet::new();
            for p in cache.requires_paths() {
                let id = self.get_file_from_path(&p)?;
                req_ids.insert(id);
                self.mark_requirement_cache_finished(id);
            }
            self.propagate_reqs(&file, &req_ids);
            self.complete_file(&file);
            return Ok(());
        }

        self.ensure_cache_file_ready(file_id);

        if file.tree_kind.is_out() && file.producer().is_none() {
            return Err(BuildError::Producer(file.rel_path.display().to_string()));
        }

        if let Some(producer_id) = file.producer() {
            if !self.jobs.get(producer_id).is_done() {
                self.scheduler.add_required(&[Tag::Job(producer_id)], self);
                return Ok(());
            }
        }

        if let Some(kind) = self.file_kind_for(&file) {
            debug!("scanning {} with file kind {}", file.rel_path.display(), kind.name());
            let discovered = kind.scan(file_id, self)?;
            self.propagate_reqs(&file, &discovered);
        }

        let req_tags: Vec<Tag> = file.requires().into_iter().map(Tag::File).collect();
        if self.scheduler.add_required(&req_tags, self) {
            return Ok(());
        }

        self.persist_file_cache(&file)?;
        self.complete_file(&file);
        Ok(())
    }

    fn build_job(&self, job_id: JobId) -> Result<()> {
        let job = self.jobs.get(job_id);
        if job.is_done() {
            return Ok(());
        }

        if job.start_base_depends() {
            let base_deps = job.kind.get_base_depends(job_id, self);
            self.do_add_depends(&job, &base_deps);
        }

        let dep_tags: Vec<Tag> = job.depend_set().into_iter().map(Tag::File).collect();
        if self.scheduler.add_required(&dep_tags, self) {
            return Ok(());
        }

        for &out_id in job.output_set() {
            let abs = self.abs_path(out_id);
            if let Some(parent) = abs.parent() {
                std::fs::create_dir_all(parent).map_err(|e| BuildError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
            self.ensure_cache_file_ready(out_id);
        }

        debug!("running job {} ({})", job_id, job.kind.name());
        let runner = job.kind.get_runner(job_id, self);
        runner()?;

        self.complete_job(&job);
        Ok(())
    }

    /// Runs every queued target to completion and reports any targets
    /// left unfinished as `BuildError::Incomplete` (the leftover check,
    /// reached only when a worker died on a fatal error without
    /// that error itself getting recorded — e.g. a panic recovered by a
    /// caller).
    pub fn build(self: &Arc<Self>, num_workers: usize) -> Result<()> {
        let targets = self.targets.lock().clone();
        if targets.is_empty() {
            return Err(BuildError::Configuration("no targets were specified to build".to_string()));
        }
        debug!("building {} target(s) with {num_workers} worker(s)", targets.len());
        self.scheduler
            .run_to_completion(num_workers, self.clone() as Arc<dyn Buildable>)?;

        let leftovers: Vec<String> = targets
            .iter()
            .filter(|id| !self.files.get(**id).is_done())
            .map(|id| self.files.get(*id).rel_path.display().to_string())
            .sorted()
            .collect();
        if !leftovers.is_empty() {
            return Err(BuildError::Incomplete(leftovers));
        }
        Ok(())
    }

    /// Runs every target that's executable after a successful build
    /// (the `-x`/`--exec` flag and restored `Exec` step), aborting on
    /// the first non-zero exit.
    pub fn exec_targets(&self) -> Result<()> {
        for id in self.target_ids() {
            let abs = self.abs_path(id);
            if !is_executable(&abs) {
                continue;
            }
            let status = std::process::Command::new(&abs).status().map_err(|e| BuildError::Io {
                path: abs.clone(),
                source: e,
            })?;
            if !status.success() {
                return Err(BuildError::ExternalCommand {
                    argv: vec![abs.display().to_string()],
                    status: status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
        }
        Ok(())
    }
}

fn with_suffix(rel_path: &Path, suffix: &str) -> PathBuf {
    let mut name = rel_path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

impl AvailabilityEngine for Engine {
    fn files(&self) -> &FileStore {
        &self.files
    }
    fn jobs(&self) -> &JobStore {
        &self.jobs
    }
    fn job_kinds(&self) -> &JobKindRegistry {
        &self.job_kinds
    }
    fn scan_ctx(&self) -> &dyn ScanContext {
        self
    }

    fn register_consumer(&self, file: FileId, job: JobId) {
        self.file_add_consumer(file, job);
    }

    fn propagate_output_requires_input(&self, output: FileId, input: FileId) {
        let output_file = self.files.get(output);
        self.propagate_reqs(&output_file, &HashSet::from([input]));
    }
}

impl ScanContext for Engine {
    fn abs_path(&self, file: FileId) -> PathBuf {
        Engine::abs_path(self, file)
    }

    fn get_file_from_path(&self, path: &Path) -> Result<FileId> {
        Engine::get_file_from_path(self, path)
    }

    fn stage_cache_entry(&self, file: FileId, section: &str, key: &str, value: Option<String>) {
        self.ensure_cache_file_ready(file);
        if let Some(entry) = self.pending_cache.get(&file) {
            entry.lock().set(section, key, value);
        }
    }

    fn job_input(&self, job: JobId) -> Option<FileId> {
        self.jobs.get(job).input
    }

    fn job_outputs(&self, job: JobId) -> Vec<FileId> {
        self.jobs.get(job).output_set().iter().copied().collect()
    }
}

impl Buildable for Engine {
    fn is_done(&self, tag: Tag) -> bool {
        match tag {
            Tag::File(id) => self.files.get(id).is_done(),
            Tag::Job(id) => self.jobs.get(id).is_done(),
        }
    }

    fn build(&self, tag: Tag) -> Result<()> {
        match tag {
            Tag::File(id) => self.build_file(id),
            Tag::Job(id) => self.build_job(id),
        }
    }
}
