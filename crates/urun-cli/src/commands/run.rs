//! `urun run`: Run a command inside a container.

use clap::Args;
use urun_runtime::context::RunContext;
use urun_runtime::options::{EnvList, RunOptions};

/// Arguments for the `run` command.
#[allow(clippy::struct_excessive_bools)]
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Volume to bind, as `host[:container[:ro|rw]]`. Repeatable.
    #[arg(short = 'v', long = "volume")]
    pub volumes: Vec<String>,

    /// Environment variable as `NAME=VALUE`. Repeatable.
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,

    /// User inside the container, as `name|uid[:group|gid]`.
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Working directory inside the container.
    #[arg(short = 'w', long)]
    pub workdir: Option<String>,

    /// Override the image entrypoint (an empty string clears it).
    #[arg(long)]
    pub entrypoint: Option<String>,

    /// Use the host passwd and group files.
    #[arg(long)]
    pub hostauth: bool,

    /// Pass the whole host environment.
    #[arg(long)]
    pub hostenv: bool,

    /// CPUs the command is pinned to.
    #[arg(long = "cpuset-cpus")]
    pub cpuset: Option<String>,

    /// Port mapping as `host:container`. Repeatable.
    #[arg(short = 'p', long = "publish")]
    pub ports: Vec<String>,

    /// Share the host network cooperatively (PRoot only).
    #[arg(long)]
    pub netcoop: bool,

    /// Hostname seen by the container.
    #[arg(long)]
    pub hostname: Option<String>,

    /// Container ID.
    pub container: String,

    /// Command and arguments; defaults to the image command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub cmd: Vec<String>,
}

impl RunArgs {
    fn into_options(self) -> RunOptions {
        RunOptions {
            vol: self.volumes,
            env: self.env.into_iter().collect::<EnvList>(),
            user: self.user.unwrap_or_default(),
            cwd: self.workdir.unwrap_or_default(),
            cmd: self.cmd,
            entryp: self
                .entrypoint
                .map(|e| e.split_whitespace().map(str::to_string).collect()),
            hostauth: self.hostauth,
            hostenv: self.hostenv,
            portsmap: self.ports,
            netcoop: self.netcoop,
            cpuset: self.cpuset,
            hostname: self.hostname,
        }
    }
}

/// Executes the `run` command and returns the engine status.
///
/// # Errors
///
/// Returns an error if the container does not exist, its mode has no
/// engine, or the engine binary is missing.
pub fn execute(ctx: &RunContext, args: RunArgs) -> anyhow::Result<i32> {
    let (id, mode) = super::open_container(ctx, &args.container)?;
    let engine = mode.get_engine()?;
    tracing::debug!(container = %id, engine = %engine.kind(), mode = %engine.mode(), "starting container");
    Ok(engine.run(&id, args.into_options())?)
}
