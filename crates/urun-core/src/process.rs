//! Bounded subprocess execution for probes and batch rewrites.
//!
//! Every external tool invoked while preparing a container (patchelf,
//! ldconfig, `--help` probes) runs through here so that a hung tool cannot
//! hang the whole operation.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use urun_common::error::{Result, UrunError};

const POLL_START: Duration = Duration::from_millis(1);
const POLL_MAX: Duration = Duration::from_millis(50);

/// Completed subprocess with its captured streams.
#[derive(Debug)]
pub struct Captured {
    /// Exit status of the process.
    pub status: ExitStatus,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Runs `argv` and returns its trimmed standard output if it exits
/// successfully within `timeout`.
///
/// # Errors
///
/// Returns [`UrunError::NotFound`] if the program does not exist,
/// [`UrunError::ToolFailed`] on a non-zero exit, and
/// [`UrunError::Timeout`] if the deadline expires (the child is killed).
pub fn capture_output(argv: &[String], timeout: Duration) -> Result<String> {
    let captured = run_captured(argv, timeout)?;
    if captured.status.success() {
        Ok(captured.stdout.trim().to_string())
    } else {
        Err(UrunError::ToolFailed {
            tool: argv[0].clone(),
            message: format!("{}: {}", captured.status, captured.stderr.trim()),
        })
    }
}

/// Runs `argv` and returns everything it printed on both streams,
/// regardless of its exit status.
///
/// # Errors
///
/// Returns an error if the program cannot be spawned or times out.
pub fn capture_combined(argv: &[String], timeout: Duration) -> Result<String> {
    let captured = run_captured(argv, timeout)?;
    Ok(format!("{}{}", captured.stdout, captured.stderr))
}

/// Spawns `argv` with piped output and waits at most `timeout`.
///
/// # Errors
///
/// Returns an error if the command is empty, cannot be spawned, or
/// exceeds the deadline.
pub fn run_captured(argv: &[String], timeout: Duration) -> Result<Captured> {
    let (program, args) = argv.split_first().ok_or_else(|| UrunError::Config {
        message: "empty command line".into(),
    })?;

    tracing::trace!(cmd = ?argv, "spawning");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UrunError::NotFound {
                    kind: "program",
                    id: program.clone(),
                }
            } else {
                UrunError::io(program, e)
            }
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_reader = thread::spawn(move || drain(stdout));
    let err_reader = thread::spawn(move || drain(stderr));

    let status = wait_with_deadline(&mut child, timeout).map_err(|e| UrunError::io(program, e))?;
    let stdout = out_reader.join().unwrap_or_default();
    let stderr = err_reader.join().unwrap_or_default();

    let Some(status) = status else {
        tracing::warn!(program = %program, secs = timeout.as_secs(), "subprocess timed out");
        return Err(UrunError::Timeout {
            tool: program.clone(),
            seconds: timeout.as_secs(),
        });
    };
    Ok(Captured {
        status,
        stdout,
        stderr,
    })
}

/// Polls the child until it exits or the deadline passes; on expiry the
/// child is killed and `None` is returned.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    let mut interval = POLL_START;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            kill_group(child);
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(interval);
        interval = (interval * 2).min(POLL_MAX);
    }
}

/// Kills the whole process group so grandchildren holding our pipes die too.
fn kill_group(child: &Child) {
    if let Ok(pid) = i32::try_from(child.id()) {
        let _ = nix::sys::signal::killpg(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGKILL,
        );
    }
}

fn drain<R: Read>(stream: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}
