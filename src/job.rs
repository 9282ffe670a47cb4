//! Job interning store and per-Job mutable state.

use crate::file::FileId;
use crate::kinds::JobKind;
use dashmap::DashMap;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub type JobId = u64;

/// A (job-kind, input) pair, or (job-kind, output) for output-only jobs.
/// `output_set` is frozen at [`Job::finish_init`].
pub struct Job {
    pub id: JobId,
    pub kind: Arc<dyn JobKind>,
    pub input: Option<FileId>,

    output_set: std::sync::OnceLock<HashSet<FileId>>,
    depend_set: ReentrantMutex<RefCell<HashSet<FileId>>>,
    base_deps_fetched: AtomicBool,
    done: AtomicBool,
}

impl Job {
    pub(crate) fn new(id: JobId, kind: Arc<dyn JobKind>, input: Option<FileId>) -> Self {
        let depend_set = match input {
            Some(f) => HashSet::from([f]),
            None => HashSet::new(),
        };
        Self {
            id,
            kind,
            input,
            output_set: std::sync::OnceLock::new(),
            depend_set: ReentrantMutex::new(RefCell::new(depend_set)),
            base_deps_fetched: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }

    /// Freezes `output_set`; for an output-only job this is the single
    /// bound output file, otherwise the job-kind's `get_output`.
    pub fn finish_init(&self, outputs: HashSet<FileId>) {
        self.output_set
            .set(outputs)
            .unwrap_or_else(|_| panic!("finish_init called twice on job {}", self.id));
    }

    pub fn output_set(&self) -> &HashSet<FileId> {
        self.output_set
            .get()
            .expect("finish_init must run before output_set is read")
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn mark_done(&self) -> bool {
        self.done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn depend_set(&self) -> HashSet<FileId> {
        let guard = self.depend_set.lock();
        guard.borrow().clone()
    }

    /// Double-checked "base depends fetched" flag: returns
    /// `true` the first time it's called for this job, so the caller
    /// knows to fetch and merge `get_base_depends` exactly once.
    pub fn start_base_depends(&self) -> bool {
        let guard = self.depend_set.lock();
        if self.base_deps_fetched.load(Ordering::Acquire) {
            return false;
        }
        self.base_deps_fetched.store(true, Ordering::Release);
        drop(guard);
        true
    }

    /// Merges `new` into `depend_set`, returning the delta so the caller
    /// can register this job as a consumer of each new dependency and as
    /// a user for each output, outside this lock.
    pub fn merge_depends(&self, new: &HashSet<FileId>) -> HashSet<FileId> {
        let guard = self.depend_set.lock();
        let mut set = guard.borrow_mut();
        let delta: HashSet<FileId> = new.difference(&set).copied().collect();
        if delta.is_empty() {
            return delta;
        }
        set.extend(delta.iter().copied());
        delta
    }
}

pub struct JobStore {
    by_identity: DashMap<(usize, Option<FileId>), JobId>,
    jobs: DashMap<JobId, Arc<Job>>,
    next_id: AtomicU64,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            by_identity: DashMap::new(),
            jobs: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn get(&self, id: JobId) -> Arc<Job> {
        self.jobs
            .get(&id)
            .expect("JobId must have been interned through this store")
            .clone()
    }

    /// Interns `(kind, input)` (input is `None` for output-only jobs,
    /// keyed additionally by the Arc's pointer identity since job-kinds
    /// aren't `Eq`). Returns `(job, freshly_created)` so the caller can
    /// run `finish_init` exactly once.
    pub fn get_or_create(&self, kind: Arc<dyn JobKind>, input: Option<FileId>) -> (Arc<Job>, bool) {
        let key = (Arc::as_ptr(&kind) as *const () as usize, input);
        if let Some(id) = self.by_identity.get(&key) {
            return (self.get(*id), false);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = Arc::new(Job::new(id, kind, input));
        let existing = self.by_identity.entry(key).or_insert(id);
        if *existing != id {
            return (self.get(*existing), false);
        }
        self.jobs.insert(id, job.clone());
        (job, true)
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}
