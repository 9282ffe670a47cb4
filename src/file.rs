//! File interning store and per-File mutable state.

use crate::tree::TreeKind;
use dashmap::DashMap;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

pub type FileId = u64;
pub type JobId = crate::job::JobId;

/// `rel_path = branch + "/" + base + "." + join(ext_list, ".")`.
/// `ext_list` is never empty; a trailing empty element encodes the
/// executable form (no suffix after the last dot).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NameParts {
    pub branch: PathBuf,
    pub base: String,
    pub ext_list: Vec<String>,
}

impl NameParts {
    /// `branch = dirname`; of the remainder, if it starts with '.' then
    /// `base = ""`, else `base` is everything up to the first '.';
    /// `ext_list` is the remainder after that dot, split by '.', or
    /// `[""]` if absent.
    pub fn split(rel_path: &Path) -> Self {
        let branch = rel_path.parent().unwrap_or(Path::new("")).to_path_buf();
        let file_name = rel_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (base, rest) = if file_name.starts_with('.') {
            (String::new(), Some(file_name[1..].to_string()))
        } else {
            match file_name.find('.') {
                Some(idx) => (file_name[..idx].to_string(), Some(file_name[idx + 1..].to_string())),
                None => (file_name.clone(), None),
            }
        };

        let ext_list = match rest {
            Some(r) => r.split('.').map(|s| s.to_string()).collect(),
            None => vec![String::new()],
        };

        Self {
            branch,
            base,
            ext_list,
        }
    }

    /// Inverse of [`Self::split`]. A trailing empty `ext_list` element
    /// (the executable-form marker) is dropped before joining, so it
    /// never reintroduces a trailing dot that wasn't in the original
    /// path — matching the original's `ToRelPath`.
    pub fn join(&self) -> PathBuf {
        let tail_list: &[String] = match self.ext_list.last() {
            Some(last) if last.is_empty() => &self.ext_list[..self.ext_list.len() - 1],
            _ => &self.ext_list[..],
        };
        let mut segments = vec![self.base.clone()];
        segments.extend(tail_list.iter().cloned());
        let name = segments.join(".");
        if self.branch.as_os_str().is_empty() {
            PathBuf::from(name)
        } else {
            self.branch.join(name)
        }
    }

    pub fn final_ext(&self) -> &str {
        self.ext_list.last().map(|s| s.as_str()).unwrap_or("")
    }
}

#[derive(Debug)]
pub struct FileState {
    pub req_set: HashSet<FileId>,
    pub consumer_set: HashSet<JobId>,
    pub user_set: HashSet<FileId>,
    pub producer: Option<JobId>,
    pub cache_finished: bool,
}

impl Default for FileState {
    fn default() -> Self {
        Self {
            req_set: HashSet::new(),
            consumer_set: HashSet::new(),
            user_set: HashSet::new(),
            producer: None,
            cache_finished: false,
        }
    }
}

pub struct File {
    pub id: FileId,
    pub tree_kind: TreeKind,
    pub rel_path: PathBuf,
    pub parts: NameParts,
    pub file_kind_ext: String,

    state: ReentrantMutex<RefCell<FileState>>,
    stamp: AtomicI64,
    stamp_computed: AtomicBool,
    is_available: AtomicBool,
    availability_searched: AtomicBool,
    done: AtomicBool,
}

impl File {
    fn new(id: FileId, tree_kind: TreeKind, parts: NameParts) -> Self {
        let rel_path = parts.join();
        let file_kind_ext = parts.final_ext().to_string();
        Self {
            id,
            tree_kind,
            rel_path,
            parts,
            file_kind_ext,
            state: ReentrantMutex::new(RefCell::new(FileState::default())),
            stamp: AtomicI64::new(0),
            stamp_computed: AtomicBool::new(false),
            is_available: AtomicBool::new(false),
            availability_searched: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }

    /// Display name: the basename of `rel_path`, i.e. the reconstructed
    /// name after the executable-form marker (if any) has been folded
    /// away by [`NameParts::join`].
    pub fn name(&self) -> String {
        self.rel_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Transitions false->true exactly once; callers must publish all
    /// other state (requires, cache file) before calling this, since no
    /// mutation is permitted to originate from a done File afterward.
    pub fn mark_done(&self) -> bool {
        self.done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_available(&self) -> bool {
        self.is_available.load(Ordering::Acquire)
    }

    pub fn mark_available(&self) {
        self.is_available.store(true, Ordering::Release);
    }

    pub fn availability_searched(&self) -> bool {
        self.availability_searched.load(Ordering::Acquire)
    }

    /// Returns `true` the first time it's called for this File (the
    /// caller should then run the availability search exactly once).
    pub fn start_availability_search(&self) -> bool {
        self.availability_searched
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn cache_finished(&self) -> bool {
        let guard = self.state.lock();
        guard.borrow().cache_finished
    }

    pub fn mark_cache_finished(&self) {
        let guard = self.state.lock();
        guard.borrow_mut().cache_finished = true;
    }

    pub fn producer(&self) -> Option<JobId> {
        let guard = self.state.lock();
        guard.borrow().producer
    }

    /// Sets the producer, returning an error (not a panic) if one is
    /// already bound — the "at most one producer" invariant, observable
    /// as `BuildError::Internal` at the call site (this module has no
    /// dependency on crate::error, the engine wraps it).
    pub fn try_set_producer(&self, job: JobId) -> Result<(), JobId> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        match state.producer {
            Some(existing) if existing != job => Err(existing),
            _ => {
                state.producer = Some(job);
                Ok(())
            }
        }
    }

    pub fn requires(&self) -> HashSet<FileId> {
        let guard = self.state.lock();
        guard.borrow().req_set.clone()
    }

    pub fn consumers(&self) -> HashSet<JobId> {
        let guard = self.state.lock();
        guard.borrow().consumer_set.clone()
    }

    pub fn users(&self) -> HashSet<FileId> {
        let guard = self.state.lock();
        guard.borrow().user_set.clone()
    }

    pub fn add_consumer(&self, job: JobId) {
        let guard = self.state.lock();
        guard.borrow_mut().consumer_set.insert(job);
    }

    /// Computes `delta = new - req_set - {self}` and unions it in,
    /// returning the delta so the caller (the engine, which owns the
    /// global file store) can perform the consumer/user fan-out outside
    /// this lock — notifications always recurse outside any per-file
    /// lock, to avoid deadlocking against another file's lock up the
    /// requires chain.
    pub fn merge_reqs(&self, new: &HashSet<FileId>) -> HashSet<FileId> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let delta: HashSet<FileId> = new
            .iter()
            .copied()
            .filter(|f| *f != self.id && !state.req_set.contains(f))
            .collect();
        if delta.is_empty() {
            return delta;
        }
        state.req_set.extend(delta.iter().copied());
        delta
    }

    pub fn add_user(&self, f: FileId) {
        let guard = self.state.lock();
        guard.borrow_mut().user_set.insert(f);
    }

    /// Lazily computed, memoized filesystem mtime (0 if absent) for non
    /// SRC files. SRC files use [`Self::promote_stamp`] instead, since
    /// their stamp is the max of fs mtime and their requires' stamps.
    pub fn stamp(&self, abs_path: &Path) -> i64 {
        if self.stamp_computed.swap(true, Ordering::AcqRel) {
            return self.stamp.load(Ordering::Acquire);
        }
        let mtime = fs_mtime(abs_path);
        self.stamp.store(mtime, Ordering::Release);
        mtime
    }

    pub fn current_stamp(&self) -> i64 {
        self.stamp.load(Ordering::Acquire)
    }

    /// SRC-only: `stamp = max(stamp, max(candidate))`. Monotone by
    /// construction (never decreases).
    pub fn promote_stamp(&self, candidate: i64) {
        self.stamp.fetch_max(candidate, Ordering::AcqRel);
        self.stamp_computed.store(true, Ordering::Release);
    }
}

pub fn fs_mtime(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

type FileIdentity = (TreeKind, PathBuf, String, Vec<String>);

/// Interns `(tree_kind, branch, base, ext_list)` identities, creating the
/// File atomically on first request via dashmap's entry API
/// (create-if-absent under lock, double-checked by design).
///
/// Keying on the full `(branch, base, ext_list)` tuple rather than the
/// reconstructed `rel_path` string matters: the speculative
/// "executable form" probe in `get_file_from_path` adds a trailing `""`
/// to `ext_list`, which [`NameParts::join`] folds away, so two distinct
/// identities can share the same display path.
pub struct FileStore {
    by_identity: DashMap<FileIdentity, FileId>,
    files: DashMap<FileId, std::sync::Arc<File>>,
    next_id: AtomicU64,
}

impl FileStore {
    pub fn new() -> Self {
        Self {
            by_identity: DashMap::new(),
            files: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn get(&self, id: FileId) -> std::sync::Arc<File> {
        self.files
            .get(&id)
            .expect("FileId must have been interned through this store")
            .clone()
    }

    /// `get_file(tree, branch, base, ext_list)`: returns the unique File
    /// for that identity, creating it atomically on first request.
    pub fn get_file_parts(&self, tree_kind: TreeKind, parts: NameParts) -> std::sync::Arc<File> {
        let key = (
            tree_kind,
            parts.branch.clone(),
            parts.base.clone(),
            parts.ext_list.clone(),
        );
        if let Some(id) = self.by_identity.get(&key) {
            return self.get(*id);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let file = std::sync::Arc::new(File::new(id, tree_kind, parts));
        // `entry().or_insert` guards the create-if-absent window; if a
        // racing caller already inserted, keep their id and let ours
        // (and its File) be dropped.
        let existing = self.by_identity.entry(key).or_insert(id);
        if *existing != id {
            return self.get(*existing);
        }
        self.files.insert(id, file.clone());
        file
    }

    /// Convenience for the common case of interning a file by its plain
    /// relative path (no executable-form speculation).
    pub fn get_file(&self, tree_kind: TreeKind, rel_path: &Path) -> std::sync::Arc<File> {
        self.get_file_parts(tree_kind, NameParts::split(rel_path))
    }
}

impl Default for FileStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_join_round_trips() {
        for p in ["a/b/foo.c", "foo.tar.gz", ".hidden", "noext"] {
            let parts = NameParts::split(Path::new(p));
            assert_eq!(parts.join(), PathBuf::from(p), "round trip failed for {p}");
        }
    }

    #[test]
    fn executable_form_ext_list_folds_away_trailing_marker() {
        // The speculative `ext_list + [""]` executable-form probe used
        // by `get_file_from_path` must reconstruct the *same* rel_path
        // as the non-executable form, since the marker is metadata about
        // file-kind matching, not a literal path suffix.
        let plain = NameParts {
            branch: PathBuf::new(),
            base: "prog".to_string(),
            ext_list: vec!["o".to_string()],
        };
        let exe = NameParts {
            branch: PathBuf::new(),
            base: "prog".to_string(),
            ext_list: vec!["o".to_string(), "".to_string()],
        };
        assert_eq!(plain.join(), exe.join());
    }

    #[test]
    fn hidden_file_has_empty_base() {
        let parts = NameParts::split(Path::new(".gitignore"));
        assert_eq!(parts.base, "");
        assert_eq!(parts.ext_list, vec!["gitignore".to_string()]);
    }

    #[test]
    fn trailing_dot_encodes_executable_form() {
        let parts = NameParts::split(Path::new("prog."));
        assert_eq!(parts.ext_list, vec!["".to_string()]);
        assert_eq!(parts.final_ext(), "");
    }

    #[test]
    fn no_dot_gives_single_empty_ext() {
        let parts = NameParts::split(Path::new("README"));
        assert_eq!(parts.base, "README");
        assert_eq!(parts.ext_list, vec!["".to_string()]);
    }

    #[test]
    fn interning_is_stable_across_calls() {
        let store = FileStore::new();
        let a = store.get_file(TreeKind::Src, Path::new("a/b.c"));
        let b = store.get_file(TreeKind::Src, Path::new("a/b.c"));
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn merge_reqs_excludes_self_and_is_idempotent() {
        let store = FileStore::new();
        let f = store.get_file(TreeKind::Src, Path::new("a.c"));
        let g = store.get_file(TreeKind::Src, Path::new("b.h"));
        let mut new = HashSet::new();
        new.insert(g.id);
        new.insert(f.id);
        let delta = f.merge_reqs(&new);
        assert_eq!(delta, HashSet::from([g.id]));
        let delta2 = f.merge_reqs(&new);
        assert!(delta2.is_empty());
    }
}
