//! Availability search: depth-first chain discovery with
//! registration-order tie-breaking. Grounded on `jhm.py`'s
//! `File.FindAvailability`.

use crate::error::{BuildError, Result};
use crate::file::{FileId, FileStore};
use crate::job::JobStore;
use crate::kinds::{Input, JobKindRegistry, ScanContext};
use log::trace;
use std::collections::HashSet;
use std::sync::Arc;

/// The narrow slice of engine state the availability search needs: the
/// two interning stores, the job-kind registry, and a scan context for
/// the job-kind callbacks that need to resolve paths to files.
pub trait AvailabilityEngine {
    fn files(&self) -> &FileStore;
    fn jobs(&self) -> &JobStore;
    fn job_kinds(&self) -> &JobKindRegistry;
    fn scan_ctx(&self) -> &dyn ScanContext;

    /// Registers `job` as a consumer of `file`. Engines that track the
    /// requires-propagation cascade should override this to also push
    /// `file`'s already-known requires into `job`'s depend set,
    /// matching `File.AddConsumer`'s side effect in the original; the
    /// default just records the edge, which is all a narrow test fixture
    /// needs.
    fn register_consumer(&self, file: FileId, job: crate::job::JobId) {
        self.files().get(file).add_consumer(job);
    }

    /// Folds a producer job's input into its output's own requires
    /// (`SetProducer`'s step: a non-output-only producer's output
    /// requires its input, which is how a `.o`'s requires end up listing
    /// its `.c` and the `.c`'s own requires transitively). Default just
    /// records the user edge; engines running the full requires cascade
    /// should override this to do the complete fan-out.
    fn propagate_output_requires_input(&self, output: FileId, input: FileId) {
        self.files().get(input).add_user(output);
    }
}

/// Runs the availability search for `file_id` exactly once (gated by
/// `availability_searched`); idempotent for repeat callers, who simply
/// observe the memoized result.
pub fn ensure_availability(engine: &dyn AvailabilityEngine, file_id: FileId) -> Result<bool> {
    let file = engine.files().get(file_id);
    if !file.start_availability_search() {
        return Ok(file.is_available());
    }

    if file.tree_kind.is_src() || file.tree_kind.is_inc() {
        file.mark_available();
        return Ok(true);
    }

    let ext = file.file_kind_ext.clone();
    for kind in engine.job_kinds().producers_for(&ext) {
        match kind.get_input(file_id, engine.scan_ctx()) {
            Some(Input::File(input_id)) => {
                if ensure_availability(engine, input_id)? {
                    bind_producer(engine, kind, Some(input_id), file_id)?;
                    file.mark_available();
                    return Ok(true);
                }
            }
            Some(Input::NoInputNeeded) => {
                bind_producer(engine, kind, None, file_id)?;
                file.mark_available();
                return Ok(true);
            }
            None => continue,
        }
    }

    Ok(false)
}

fn bind_producer(
    engine: &dyn AvailabilityEngine,
    kind: Arc<dyn crate::kinds::JobKind>,
    input: Option<FileId>,
    out_file: FileId,
) -> Result<()> {
    let (job, fresh) = engine.jobs().get_or_create(kind.clone(), input);
    if !fresh {
        return Ok(());
    }

    let outputs: HashSet<FileId> = match input {
        Some(input_id) => kind.get_output(input_id, engine.scan_ctx()),
        None => HashSet::from([out_file]),
    };
    job.finish_init(outputs);
    trace!("bound producer job-kind {} for {out_file}", kind.name());

    if let Some(input_id) = input {
        engine.register_consumer(input_id, job.id);
    }

    for &f in job.output_set() {
        let produced = engine.files().get(f);
        JobKindRegistry::check_declared_output(kind.as_ref(), &produced.file_kind_ext)?;
        produced.try_set_producer(job.id).map_err(|_existing| {
            BuildError::Internal(format!(
                "file {} was claimed by two different producer jobs",
                produced.rel_path.display()
            ))
        })?;
        if let Some(input_id) = input {
            engine.propagate_output_requires_input(f, input_id);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::{InExt, JobKind};
    use crate::tree::TreeKind;
    use std::path::{Path, PathBuf};

    /// A job-kind producing `.o` from a same-named `.c`, used to exercise
    /// one level of the recursive chain.
    struct CompileJobKind {
        out_exts: Vec<String>,
    }
    impl JobKind for CompileJobKind {
        fn name(&self) -> &str {
            "compile"
        }
        fn in_ext(&self) -> InExt {
            InExt::Ext("c".into())
        }
        fn out_exts(&self) -> &[String] {
            &self.out_exts
        }
        fn get_input(&self, out_file: FileId, ctx: &dyn ScanContext) -> Option<Input> {
            let src = ctx.abs_path(out_file).with_extension("c");
            ctx.get_file_from_path(&src).ok().map(Input::File)
        }
        fn get_output(&self, in_file: FileId, ctx: &dyn ScanContext) -> HashSet<FileId> {
            let out = ctx.abs_path(in_file).with_extension("o");
            HashSet::from([ctx.get_file_from_path(&out).unwrap()])
        }
        fn get_runner(
            &self,
            _job: crate::job::JobId,
            _ctx: &dyn ScanContext,
        ) -> Box<dyn FnOnce() -> Result<()> + Send> {
            Box::new(|| Ok(()))
        }
    }

    struct Fixture {
        files: FileStore,
        jobs: JobStore,
        job_kinds: JobKindRegistry,
    }

    impl ScanContext for Fixture {
        fn abs_path(&self, file: FileId) -> PathBuf {
            self.files.get(file).rel_path.clone()
        }
        fn get_file_from_path(&self, path: &Path) -> Result<FileId> {
            // Only the `.c` source actually exists on the fixture's (non)
            // disk; everything else is routed to OUT, matching
            // `TryFindTree`'s "must be produced" fallback.
            let tree = if path.extension().is_some_and(|e| e == "c") {
                TreeKind::Src
            } else {
                TreeKind::Out
            };
            Ok(self.files.get_file(tree, path).id)
        }
    }

    impl AvailabilityEngine for Fixture {
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
    }

    #[test]
    fn grounds_through_one_producer_chain_link() {
        let mut job_kinds = JobKindRegistry::new();
        job_kinds.register(Arc::new(CompileJobKind {
            out_exts: vec!["o".to_string()],
        }));
        let fixture = Fixture {
            files: FileStore::new(),
            jobs: JobStore::new(),
            job_kinds,
        };
        let out_file = fixture.files.get_file(TreeKind::Out, Path::new("a.o")).id;

        let available = ensure_availability(&fixture, out_file).unwrap();
        assert!(available);
        assert!(fixture.files.get(out_file).producer().is_some());
    }

    #[test]
    fn ungrounded_extension_is_unavailable() {
        let job_kinds = JobKindRegistry::new();
        let fixture = Fixture {
            files: FileStore::new(),
            jobs: JobStore::new(),
            job_kinds,
        };
        let out_file = fixture.files.get_file(TreeKind::Out, Path::new("a.o")).id;
        assert!(!ensure_availability(&fixture, out_file).unwrap());
    }
}
