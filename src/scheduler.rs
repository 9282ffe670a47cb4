//! The FIFO work queue and worker pool.
//!
//! Grounded on `jhm.py`'s `MultithreadProcessingQueue`: a shared
//! `queue`/`queue_set`/`task_set` behind one lock, OS threads blocking on
//! a "go" condition when idle, and a cooperative stop flag for fatal
//! errors. Translated `threading.Lock`/`threading.Event` to
//! `parking_lot::{Mutex, Condvar}` — the direct idiomatic equivalent for
//! blocking OS-thread coordination (this crate does not use async).

use crate::error::{BuildError, Result};
use crate::file::FileId;
use crate::job::JobId;
use log::trace;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    File(FileId),
    Job(JobId),
}

/// The engine-side callback the scheduler drives. Implementations are
/// expected to call back into [`Scheduler::add_required`] /
/// [`Scheduler::add_if_needed`] from inside `build` for their own
/// prerequisites and successors.
pub trait Buildable: Send + Sync {
    fn is_done(&self, tag: Tag) -> bool;
    fn build(&self, tag: Tag) -> Result<()>;
}

#[derive(Default)]
struct Shared {
    queue: VecDeque<Tag>,
    queue_set: HashSet<Tag>,
    task_set: HashSet<Tag>,
}

pub struct Scheduler {
    shared: Mutex<Shared>,
    go: Condvar,
    progress: Condvar,
    stop: AtomicBool,
    worker_dead: AtomicBool,
    error: Mutex<Option<BuildError>>,
    print_lock: Mutex<()>,
    jhm_debug: bool,
}

impl Scheduler {
    pub fn new(jhm_debug: bool) -> Arc<Self> {
        Arc::new(Self {
            shared: Mutex::new(Shared::default()),
            go: Condvar::new(),
            progress: Condvar::new(),
            stop: AtomicBool::new(false),
            worker_dead: AtomicBool::new(false),
            error: Mutex::new(None),
            print_lock: Mutex::new(()),
            jhm_debug,
        })
    }

    /// Used when walking up the graph, demanding work. Unions `items`
    /// into `task_set`; returns whether any of them are not yet done
    /// (regardless of whether they were freshly enqueued or already
    /// in-flight).
    pub fn add_required(&self, items: &[Tag], buildable: &dyn Buildable) -> bool {
        let mut shared = self.shared.lock();
        shared.task_set.extend(items.iter().copied());
        let unfinished: Vec<Tag> = items
            .iter()
            .copied()
            .filter(|t| !buildable.is_done(*t))
            .collect();
        if unfinished.is_empty() {
            return false;
        }
        let fresh: Vec<Tag> = unfinished
            .into_iter()
            .filter(|t| !shared.queue_set.contains(t))
            .collect();
        shared.queue_set.extend(fresh.iter().copied());
        shared.queue.extend(fresh.iter().copied());
        drop(shared);
        self.go.notify_all();
        true
    }

    /// Used when walking down after completion, waking waiters. Only
    /// admits items already in `task_set` — this bounds completion
    /// cascades from re-exploring the whole graph.
    pub fn add_if_needed(&self, items: &[Tag], buildable: &dyn Buildable) -> bool {
        let mut shared = self.shared.lock();
        let candidates: Vec<Tag> = items
            .iter()
            .copied()
            .filter(|t| !buildable.is_done(*t) && shared.task_set.contains(t))
            .collect();
        if candidates.is_empty() {
            return false;
        }
        let fresh: Vec<Tag> = candidates
            .into_iter()
            .filter(|t| !shared.queue_set.contains(t))
            .collect();
        shared.queue_set.extend(fresh.iter().copied());
        shared.queue.extend(fresh.iter().copied());
        drop(shared);
        self.go.notify_all();
        true
    }

    fn worker_dead(&self) -> bool {
        self.worker_dead.load(Ordering::Acquire)
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn record_error(&self, err: BuildError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn worker_loop(self: &Arc<Self>, buildable: &Arc<dyn Buildable>) {
        loop {
            let item = {
                let mut shared = self.shared.lock();
                loop {
                    if self.stop_requested() {
                        return;
                    }
                    if let Some(item) = shared.queue.pop_front() {
                        break Some(item);
                    }
                    self.go.wait(&mut shared);
                    if self.stop_requested() {
                        return;
                    }
                }
            };
            let Some(item) = item else { continue };

            match buildable.build(item) {
                Ok(()) => {
                    let mut shared = self.shared.lock();
                    shared.queue_set.remove(&item);
                    let empty = shared.queue_set.is_empty();
                    drop(shared);
                    if empty {
                        self.progress.notify_all();
                    }
                }
                Err(e) => {
                    self.stop.store(true, Ordering::Release);
                    self.worker_dead.store(true, Ordering::Release);
                    {
                        let _guard = self.print_lock.lock();
                        eprintln!("{e}");
                        if self.jhm_debug {
                            eprintln!("{e:?}");
                        }
                    }
                    self.record_error(e);
                    self.go.notify_all();
                    self.progress.notify_all();
                    return;
                }
            }
        }
    }

    /// Spawns `num_workers` threads and blocks until the queue drains or
    /// a fatal error aborts everyone, mirroring
    /// `MultithreadProcessingQueue.__enter__`/`__exit__`.
    pub fn run_to_completion(
        self: &Arc<Self>,
        num_workers: usize,
        buildable: Arc<dyn Buildable>,
    ) -> Result<()> {
        let num_workers = num_workers.max(1);
        let handles: Vec<_> = (0..num_workers)
            .map(|i| {
                let sched = Arc::clone(self);
                let buildable = Arc::clone(&buildable);
                std::thread::Builder::new()
                    .name(format!("jhm-worker-{i}"))
                    .spawn(move || {
                        trace!("worker {i} starting");
                        sched.worker_loop(&buildable);
                        trace!("worker {i} exiting");
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        // Wait until there's nothing left scheduled or a worker died,
        // mirroring the original's `worker_event` wait loop.
        {
            let mut shared = self.shared.lock();
            while !shared.queue_set.is_empty() && !self.worker_dead() {
                self.progress.wait(&mut shared);
            }
        }

        self.stop.store(true, Ordering::Release);
        self.go.notify_all();
        for h in handles {
            let _ = h.join();
        }

        let mut slot = self.error.lock();
        match slot.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingBuildable {
        done: std::sync::Mutex<HashSet<Tag>>,
        builds: AtomicUsize,
    }

    impl Buildable for CountingBuildable {
        fn is_done(&self, tag: Tag) -> bool {
            self.done.lock().unwrap().contains(&tag)
        }
        fn build(&self, tag: Tag) -> Result<()> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            self.done.lock().unwrap().insert(tag);
            Ok(())
        }
    }

    #[test]
    fn drains_a_flat_set_of_required_items() {
        let sched = Scheduler::new(false);
        let work = Arc::new(CountingBuildable {
            done: std::sync::Mutex::new(HashSet::new()),
            builds: AtomicUsize::new(0),
        });
        let items: Vec<Tag> = (1..=5).map(Tag::File).collect();
        assert!(sched.add_required(&items, work.as_ref()));
        sched
            .run_to_completion(2, work.clone() as Arc<dyn Buildable>)
            .unwrap();
        assert_eq!(work.builds.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn propagates_first_error() {
        struct Failing;
        impl Buildable for Failing {
            fn is_done(&self, _tag: Tag) -> bool {
                false
            }
            fn build(&self, _tag: Tag) -> Result<()> {
                Err(BuildError::Internal("boom".into()))
            }
        }
        let sched = Scheduler::new(false);
        sched.add_required(&[Tag::File(1)], &Failing);
        let err = sched
            .run_to_completion(2, Arc::new(Failing))
            .unwrap_err();
        assert!(matches!(err, BuildError::Internal(_)));
    }
}
