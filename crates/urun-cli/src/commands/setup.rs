//! `urun setup`: Change the execution mode of a container.

use clap::Args;
use urun_common::types::ExecMode;
use urun_runtime::context::RunContext;

/// Arguments for the `setup` command.
#[derive(Args, Debug)]
pub struct SetupArgs {
    /// Target execution mode (P1, P2, F1, F2, F3, F4, R1, S1).
    #[arg(long, value_parser = clap::value_parser!(ExecMode))]
    pub execmode: ExecMode,

    /// Redo the mode setup even if the container is already in it.
    #[arg(long)]
    pub force: bool,

    /// Container ID.
    pub container: String,
}

/// Executes the `setup` command.
///
/// # Errors
///
/// Returns an error if the container does not exist, the transition
/// fails, or a required tool is missing.
pub fn execute(ctx: &RunContext, args: &SetupArgs) -> anyhow::Result<i32> {
    let (_, mode) = super::open_container(ctx, &args.container)?;
    let target = args.execmode.as_str();
    let changed = if args.force {
        mode.set_mode_forced(target)?
    } else {
        mode.set_mode(target)?
    };
    if !changed {
        anyhow::bail!(
            "cannot set execution mode {target} on container {}",
            args.container
        );
    }
    tracing::info!(container = %args.container, mode = target, "container set up");
    Ok(0)
}
