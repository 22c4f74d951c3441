//! # urun: unprivileged container runner
//!
//! Runs containers from an already extracted root filesystem using PRoot,
//! Fakechroot or runc, without root privileges.

mod commands;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::commands::Cli;

fn init_tracing() {
    let filter = std::env::var("URUN_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[allow(clippy::print_stderr)]
fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match commands::execute(cli) {
        Ok(status) => ExitCode::from(u8::try_from(status).unwrap_or(1)),
        Err(err) => {
            eprintln!("urun: {err:#}");
            ExitCode::FAILURE
        }
    }
}
