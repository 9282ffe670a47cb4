//! Process environment helpers: a thin wrapper around `std::env` plus a
//! few lazily-computed statics for settings that can be given either on
//! the command line or ambiently through the environment.

pub use std::env::*;
use std::sync::LazyLock;

/// Enables internal-error stack traces even when `--jhm-debug` wasn't
/// passed on the command line.
pub static JHM_DEBUG: LazyLock<bool> =
    LazyLock::new(|| var("JHM_DEBUG").is_ok_and(|v| v != "0" && !v.is_empty()));

/// Overrides the `tracing`/`log` filter directive; `-v` still wins if both
/// are given a value more verbose than the other.
pub static JHM_LOG: LazyLock<Option<String>> = LazyLock::new(|| var("JHM_LOG").ok());
