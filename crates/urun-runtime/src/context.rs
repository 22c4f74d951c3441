//! Everything an engine needs from its surroundings.

use std::sync::Arc;

use urun_common::config::UrunConfig;
use urun_common::types::HostIdentity;

use crate::launch::{Launcher, launcher_for};
use crate::repo::LocalRepository;

/// Configuration, caller identity, repository and launcher of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Effective configuration.
    pub config: Arc<UrunConfig>,
    /// Identity of the calling user.
    pub identity: HostIdentity,
    /// Container store.
    pub repo: LocalRepository,
    /// Final process hand-off.
    pub launcher: Arc<dyn Launcher>,
}

impl RunContext {
    /// Builds a context for the calling user with the configured launcher.
    #[must_use]
    pub fn new(config: UrunConfig) -> Self {
        let repo = LocalRepository::new(&config);
        let launcher = launcher_for(config.launch);
        Self {
            config: Arc::new(config),
            identity: HostIdentity::current(),
            repo,
            launcher,
        }
    }

    /// Replaces the launcher.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }
}
