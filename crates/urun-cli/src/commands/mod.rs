//! CLI command definitions and dispatch.

pub mod mode;
pub mod run;
pub mod setup;

use anyhow::Context;
use clap::{Parser, Subcommand};
use urun_common::config::UrunConfig;
use urun_common::types::ContainerId;
use urun_runtime::context::RunContext;
use urun_runtime::execmode::ExecutionMode;

/// urun: run containers without root privileges.
#[derive(Parser, Debug)]
#[command(name = "urun", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Change the execution mode of a container.
    Setup(setup::SetupArgs),
    /// Print the execution mode of a container.
    Mode(mode::ModeArgs),
    /// Run a command inside a container.
    Run(Box<run::RunArgs>),
}

/// Dispatches the parsed CLI command and returns the process status.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the command
/// fails without a status of its own.
pub fn execute(cli: Cli) -> anyhow::Result<i32> {
    let config = UrunConfig::load().context("cannot load configuration")?;
    let ctx = RunContext::new(config);
    match cli.command {
        Command::Setup(args) => setup::execute(&ctx, &args),
        Command::Mode(args) => mode::execute(&ctx, &args),
        Command::Run(args) => run::execute(&ctx, *args),
    }
}

fn open_container(ctx: &RunContext, container: &str) -> anyhow::Result<(ContainerId, ExecutionMode)> {
    let id = ContainerId::new(container);
    let mode = ExecutionMode::new(ctx.clone(), &id)
        .with_context(|| format!("cannot open container {container}"))?;
    Ok((id, mode))
}
