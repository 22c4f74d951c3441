//! Hand-off of the final container process.

use std::fmt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex};

use urun_common::config::LaunchMode;
use urun_common::error::Result;

/// Status returned when the final process cannot be started.
pub const SPAWN_FAILED: i32 = 5;

/// A fully assembled external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Program and arguments; `argv[0]` is resolved on the host.
    pub argv: Vec<String>,
    /// Complete environment; nothing is inherited.
    pub env: Vec<(String, String)>,
    /// Host working directory, if the engine needs one.
    pub cwd: Option<PathBuf>,
    /// Name of the contained command, for the banner.
    pub command_name: String,
    /// Execution id of this run.
    pub execid: String,
}

impl Invocation {
    /// Looks up a variable of the assembled environment.
    #[must_use]
    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn command(&self) -> Option<Command> {
        let (program, args) = self.argv.split_first()?;
        let mut cmd = Command::new(program);
        let _ = cmd.args(args).env_clear().envs(self.env.iter().map(|(k, v)| (k, v)));
        if let Some(cwd) = &self.cwd {
            let _ = cmd.current_dir(cwd);
        }
        Some(cmd)
    }
}

/// Starts an [`Invocation`] and reports its exit status.
pub trait Launcher: Send + Sync + fmt::Debug {
    /// Runs the invocation.
    ///
    /// # Errors
    ///
    /// Implementations report start failures as [`SPAWN_FAILED`] rather
    /// than as errors; errors are reserved for unrecoverable conditions.
    fn launch(&self, invocation: &Invocation) -> Result<i32>;
}

/// Replaces the current process image.
#[derive(Debug, Default)]
pub struct ExecLauncher;

impl Launcher for ExecLauncher {
    fn launch(&self, invocation: &Invocation) -> Result<i32> {
        let Some(mut cmd) = invocation.command() else {
            tracing::error!("empty command line");
            return Ok(SPAWN_FAILED);
        };
        tracing::debug!(argv = ?invocation.argv, "exec");
        let err = cmd.exec();
        tracing::error!(program = %invocation.argv[0], error = %err, "exec failed");
        Ok(SPAWN_FAILED)
    }
}

/// Spawns a child and waits for it.
#[derive(Debug, Default)]
pub struct SpawnLauncher;

impl Launcher for SpawnLauncher {
    fn launch(&self, invocation: &Invocation) -> Result<i32> {
        let Some(mut cmd) = invocation.command() else {
            tracing::error!("empty command line");
            return Ok(SPAWN_FAILED);
        };
        tracing::debug!(argv = ?invocation.argv, "spawn");
        match cmd.status() {
            Ok(status) => Ok(status
                .code()
                .or_else(|| status.signal().map(|s| 128 + s))
                .unwrap_or(1)),
            Err(err) => {
                tracing::error!(program = %invocation.argv[0], error = %err, "spawn failed");
                Ok(SPAWN_FAILED)
            }
        }
    }
}

/// Records invocations instead of running them.
#[derive(Debug, Default)]
pub struct RecordingLauncher {
    calls: Mutex<Vec<Invocation>>,
    status: i32,
}

impl RecordingLauncher {
    /// Creates a recorder that reports `status` for every launch.
    #[must_use]
    pub fn with_status(status: i32) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            status,
        }
    }

    /// Invocations seen so far.
    #[must_use]
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Launcher for RecordingLauncher {
    fn launch(&self, invocation: &Invocation) -> Result<i32> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(invocation.clone());
        }
        Ok(self.status)
    }
}

/// Launcher for the configured hand-off strategy.
#[must_use]
pub fn launcher_for(mode: LaunchMode) -> Arc<dyn Launcher> {
    match mode {
        LaunchMode::Exec => Arc::new(ExecLauncher),
        LaunchMode::Spawn => Arc::new(SpawnLauncher),
    }
}
