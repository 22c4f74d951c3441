//! Execution engines.
//!
//! Each engine turns a container id and [`RunOptions`] into one external
//! command line. Common initialization lives in [`crate::base`]; engines
//! only add their isolation mechanism on top of it.

mod common;
pub mod fakechroot;
pub mod proot;
pub mod runc;

use thiserror::Error;
use urun_common::error::{Result, UrunError};
use urun_common::types::{ContainerId, EngineKind, ExecMode};

use crate::context::RunContext;
use crate::launch::Invocation;
use crate::options::RunOptions;

pub use fakechroot::FakechrootEngine;
pub use proot::PRootEngine;
pub use runc::RuncEngine;

/// Status returned when common initialization fails.
pub const STATUS_SETUP_FAILED: i32 = 2;

/// Status returned when the OCI spec or its environment is unusable.
pub const STATUS_SPEC_FAILED: i32 = 4;

/// Why an engine could not assemble its command.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Setup failed; the run ends with `status` and nothing is spawned.
    #[error("{reason} (status {status})")]
    Setup {
        /// Exit status reported to the caller.
        status: i32,
        /// Human-readable cause.
        reason: String,
    },

    /// No fallback exists; the process should terminate.
    #[error(transparent)]
    Fatal(UrunError),
}

impl EngineError {
    /// Setup failure with the common init status.
    pub fn setup(reason: impl Into<String>) -> Self {
        Self::Setup {
            status: STATUS_SETUP_FAILED,
            reason: reason.into(),
        }
    }

    /// Setup failure with the OCI spec status.
    pub fn spec(reason: impl Into<String>) -> Self {
        Self::Setup {
            status: STATUS_SPEC_FAILED,
            reason: reason.into(),
        }
    }
}

impl From<UrunError> for EngineError {
    fn from(err: UrunError) -> Self {
        if err.is_fatal() {
            Self::Fatal(err)
        } else {
            Self::setup(err.to_string())
        }
    }
}

/// A way of launching a container process.
pub trait ExecutionEngine: Send + Sync {
    /// Engine variant.
    fn kind(&self) -> EngineKind;

    /// Mode the engine was created for.
    fn mode(&self) -> ExecMode;

    /// Shared run context.
    fn context(&self) -> &RunContext;

    /// Runs common initialization and assembles the final command.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Setup`] with the status to report, or
    /// [`EngineError::Fatal`] when a required tool is missing.
    fn prepare(&self, id: &ContainerId, opts: RunOptions) -> std::result::Result<Invocation, EngineError>;

    /// Prepares and launches the container process, returning its status.
    ///
    /// Setup failures are logged and turned into their status; nothing is
    /// spawned in that case.
    ///
    /// # Errors
    ///
    /// Returns an error only for conditions with no fallback, such as a
    /// missing engine binary.
    fn run(&self, id: &ContainerId, opts: RunOptions) -> Result<i32> {
        match self.prepare(id, opts) {
            Ok(invocation) => {
                common::banner(&invocation);
                self.context().launcher.launch(&invocation)
            }
            Err(EngineError::Setup { status, reason }) => {
                tracing::error!(container = %id, engine = %self.kind(), status, "{reason}");
                Ok(status)
            }
            Err(EngineError::Fatal(err)) => {
                tracing::error!(container = %id, engine = %self.kind(), error = %err, "cannot run container");
                Err(err)
            }
        }
    }
}

/// Builds the engine of `kind` for `mode`.
#[must_use]
pub fn create_engine(kind: EngineKind, ctx: RunContext, mode: ExecMode) -> Box<dyn ExecutionEngine> {
    tracing::debug!(engine = %kind, mode = %mode, "engine selected");
    match kind {
        EngineKind::PRoot => Box::new(PRootEngine::new(ctx, mode)),
        EngineKind::Fakechroot => Box::new(FakechrootEngine::new(ctx, mode)),
        EngineKind::Runc => Box::new(RuncEngine::new(ctx, mode)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tool_stays_fatal() {
        let err: EngineError = UrunError::ToolMissing {
            tool: "proot",
            searched: "proot".into(),
        }
        .into();
        assert!(matches!(err, EngineError::Fatal(_)));
    }

    #[test]
    fn other_errors_become_setup_failures() {
        let err: EngineError = UrunError::Config {
            message: "bad volume".into(),
        }
        .into();
        assert!(matches!(
            &err,
            EngineError::Setup { status: STATUS_SETUP_FAILED, reason } if reason.contains("bad volume")
        ));
    }
}
