//! Supervised execution of external tools.
//!
//! A child is polled until it exits, the optional time limit expires, or the
//! shared cancel flag is raised. In the latter two cases it is killed and
//! reaped before returning.

use std::io::{Read, Seek, SeekFrom};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::ToolError;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Keep only this much of a failing tool's stderr.
const STDERR_TAIL: usize = 4096;

/// Run `command` to completion.
///
/// Stdin is closed and stderr is captured for the error message. Stdout is left
/// as configured by the caller.
pub fn run_tool(
    mut command: Command,
    limit: Option<Duration>,
    cancel: &AtomicBool,
) -> Result<(), ToolError> {
    let program = command.get_program().to_string_lossy().into_owned();

    // A file instead of a pipe, so a chatty tool can never block on a full pipe.
    let mut stderr_log = tempfile::tempfile()?;
    command
        .stdin(Stdio::null())
        .stderr(Stdio::from(stderr_log.try_clone()?));

    debug!("Running {:?}", command);
    let started = Instant::now();
    let mut child = command.spawn().map_err(|source| ToolError::Spawn {
        program: program.clone(),
        source,
    })?;

    loop {
        if let Some(status) = child.try_wait()? {
            debug!(
                "{} finished with {} after {}ms",
                program,
                status,
                started.elapsed().as_millis()
            );
            if status.success() {
                return Ok(());
            }
            return Err(ToolError::Exit {
                program,
                code: status.code(),
                stderr: read_tail(&mut stderr_log),
            });
        }

        if cancel.load(Ordering::SeqCst) {
            terminate(&mut child, &program);
            return Err(ToolError::Cancelled { program });
        }

        if let Some(limit) = limit {
            if started.elapsed() >= limit {
                warn!("{} exceeded its {:?} time limit, killing it", program, limit);
                terminate(&mut child, &program);
                return Err(ToolError::TimedOut { program, limit });
            }
        }

        thread::sleep(POLL_INTERVAL);
    }
}

fn terminate(child: &mut Child, program: &str) {
    if let Err(e) = child.kill() {
        warn!("Failed to kill {} (pid {}): {}", program, child.id(), e);
    }
    if let Err(e) = child.wait() {
        warn!("Failed to reap {} (pid {}): {}", program, child.id(), e);
    }
}

fn read_tail(log: &mut std::fs::File) -> String {
    let mut captured = Vec::new();
    if log.seek(SeekFrom::Start(0)).is_err() || log.read_to_end(&mut captured).is_err() {
        return String::new();
    }

    let start = captured.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&captured[start..]).trim().to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script).stdout(Stdio::null());
        command
    }

    #[test]
    fn test_success() {
        let cancel = AtomicBool::new(false);
        run_tool(sh("exit 0"), None, &cancel).unwrap();
    }

    #[test]
    fn test_exit_status_and_stderr_are_reported() {
        let cancel = AtomicBool::new(false);
        let err = run_tool(sh("echo 'disk full' >&2; exit 3"), None, &cancel).unwrap_err();
        match err {
            ToolError::Exit { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "disk full");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_time_limit_kills_child() {
        let cancel = AtomicBool::new(false);
        let started = Instant::now();
        let err = run_tool(
            sh("exec sleep 30"),
            Some(Duration::from_millis(200)),
            &cancel,
        )
        .unwrap_err();

        assert!(matches!(err, ToolError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_raised_cancel_flag_kills_child() {
        let cancel = AtomicBool::new(true);
        let err = run_tool(sh("exec sleep 30"), None, &cancel).unwrap_err();
        assert!(matches!(err, ToolError::Cancelled { .. }));
    }

    #[test]
    fn test_missing_program_is_a_spawn_error() {
        let cancel = AtomicBool::new(false);
        let command = Command::new("/nonexistent/definitely-not-here");
        let err = run_tool(command, None, &cancel).unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }
}
