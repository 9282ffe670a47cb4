//! The external-process primitive job-kinds run their commands through.
//!
//! Grounded on `jhm.py`'s module-level `RunCmd`: a single blocking call
//! that spawns `argv[0]` with the rest as arguments, waits for it, and
//! either returns captured output or raises a [`BuildError`]. Concrete
//! job-kinds (out of scope for this crate) are expected to build an
//! argv and call this.

use crate::error::{BuildError, Result};
use std::path::Path;
use std::process::Command;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

/// Runs `argv`, optionally inside `dir`, with the given extra environment
/// variables layered on top of the inherited one.
///
/// `print_command` echoes the argv to stderr before running, matching the
/// `--print-commands`/`--print-build-commands` CLI flags.
pub fn run_command(
    argv: &[String],
    dir: Option<&Path>,
    env: &[(String, String)],
    print_command: bool,
) -> Result<CommandOutput> {
    assert!(!argv.is_empty(), "argv must have at least a program name");

    if print_command {
        eprintln!("{}", argv.join(" "));
    }

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    for (k, v) in env {
        cmd.env(k, v);
    }

    let output = cmd.output().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            BuildError::ProgramNotFound(argv[0].clone())
        } else {
            BuildError::Io {
                path: Path::new(&argv[0]).to_path_buf(),
                source: e,
            }
        }
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let status = output.status.code().unwrap_or(-1);

    if !output.status.success() {
        if !print_command {
            eprintln!("{}", argv.join(" "));
        }
        return Err(BuildError::ExternalCommand {
            argv: argv.to_vec(),
            status: status.to_string(),
            stdout,
            stderr,
        });
    }

    Ok(CommandOutput {
        stdout,
        stderr,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        let out = run_command(
            &["echo".to_string(), "hi".to_string()],
            None,
            &[],
            false,
        )
        .unwrap();
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.status, 0);
    }

    #[test]
    fn nonzero_exit_is_an_error() {
        let err = run_command(&["false".to_string()], None, &[], false).unwrap_err();
        assert!(matches!(err, BuildError::ExternalCommand { .. }));
    }

    #[test]
    fn missing_program_is_an_error() {
        let err = run_command(
            &["definitely-not-a-real-program-xyz".to_string()],
            None,
            &[],
            false,
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::ProgramNotFound(_)));
    }
}
