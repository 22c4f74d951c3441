//! `urun mode`: Print the execution mode of a container.

use clap::Args;
use urun_runtime::context::RunContext;

/// Arguments for the `mode` command.
#[derive(Args, Debug)]
pub struct ModeArgs {
    /// Container ID.
    pub container: String,
}

/// Executes the `mode` command.
///
/// # Errors
///
/// Returns an error if the container does not exist.
#[allow(clippy::print_stdout)]
pub fn execute(ctx: &RunContext, args: &ModeArgs) -> anyhow::Result<i32> {
    let (_, mode) = super::open_container(ctx, &args.container)?;
    if mode.is_inconsistent() {
        tracing::warn!(container = %args.container, "last mode change left the container between modes");
    }
    println!("{}", mode.get_mode());
    Ok(0)
}
