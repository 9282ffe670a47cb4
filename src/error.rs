//! The engine's single error type.
//!
//! Every way a build can fail collapses into one of these variants; all
//! of them are fatal to a build (see the scheduler's fatal-error
//! propagation in [`crate::scheduler`]).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("config error: {0}")]
    Configuration(String),

    #[error("environment error: {0}")]
    Environment(String),

    #[error("{0} cannot be found: no tree contains it and no producer can be inferred")]
    Resolution(String),

    #[error("{0} must be produced, but no producer was found")]
    Producer(String),

    #[error(
        "ERROR RUNNING COMMAND: {argv:?}, exit status {status}\nSTDOUT:\n{stdout}\nSTDERR:\n{stderr}"
    )]
    ExternalCommand {
        argv: Vec<String>,
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("program {0:?} is not in PATH")]
    ProgramNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(
        "LEFTOVERS: {0:?}\ncritical build failure, exited without finishing everything"
    )]
    Incomplete(Vec<String>),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    pub fn internal_mismatched_output(job_kind: &str, ext: &str) -> Self {
        BuildError::Internal(format!(
            "a job kind ({job_kind}) produced an output (.{ext}) that it said it would never produce"
        ))
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
