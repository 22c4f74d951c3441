//! Per-container execution mode and its transitions.
//!
//! The mode is persisted in `container_dir/execmode`. Changing it first
//! undoes whatever the previous mode did to the container tree, then
//! prepares the tree for the new one. The file is only rewritten once
//! every step has succeeded.

use std::fs;
use std::path::{Path, PathBuf};

use urun_common::constants::{EXECMODE_FILE, EXECMODE_INCONSISTENT_FILE, ROOT_DIR, ROOT_PATH_FILE};
use urun_common::error::{Result, UrunError};
use urun_common::types::{ContainerId, EngineKind, ExecMode};
use urun_core::filebind::FileBind;
use urun_core::links::{LinkConverter, LinkDirection};
use urun_core::lock::ContainerLock;
use urun_core::patcher::ElfPatcher;

use crate::context::RunContext;
use crate::engine::{ExecutionEngine, create_engine};

/// Execution mode state of one container.
#[derive(Debug, Clone)]
pub struct ExecutionMode {
    ctx: RunContext,
    id: ContainerId,
    container_dir: PathBuf,
    container_root: PathBuf,
}

impl ExecutionMode {
    /// Opens the mode state of container `id`.
    ///
    /// # Errors
    ///
    /// Returns [`UrunError::NotFound`] if the container does not exist.
    pub fn new(ctx: RunContext, id: &ContainerId) -> Result<Self> {
        let container_dir = ctx.repo.cd_container(id).ok_or_else(|| UrunError::NotFound {
            kind: "container",
            id: id.to_string(),
        })?;
        let container_dir =
            fs::canonicalize(&container_dir).map_err(|e| UrunError::io(&container_dir, e))?;
        let container_root = container_dir.join(ROOT_DIR);
        Ok(Self {
            ctx,
            id: id.clone(),
            container_dir,
            container_root,
        })
    }

    /// Container directory.
    #[must_use]
    pub fn container_dir(&self) -> &Path {
        &self.container_dir
    }

    /// Effective mode: the configured override, else the persisted one,
    /// else the configured default.
    #[must_use]
    pub fn get_mode(&self) -> ExecMode {
        self.ctx
            .config
            .override_execmode
            .unwrap_or_else(|| self.persisted_mode())
    }

    fn persisted_mode(&self) -> ExecMode {
        let path = self.container_dir.join(EXECMODE_FILE);
        match fs::read_to_string(&path).map(|s| s.parse::<ExecMode>()) {
            Ok(Ok(mode)) => mode,
            Ok(Err(err)) => {
                tracing::warn!(container = %self.id, error = %err, "unreadable execution mode, using default");
                self.ctx.config.default_execmode
            }
            Err(_) => self.ctx.config.default_execmode,
        }
    }

    /// Switches to `mode`. Returns `Ok(false)` without touching anything
    /// if the string is not a valid mode, and `Ok(false)` if a teardown
    /// or setup step fails. Setting the current mode again succeeds
    /// without doing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be locked or a required
    /// tool is missing.
    pub fn set_mode(&self, mode: &str) -> Result<bool> {
        self.transition(mode, false)
    }

    /// Like [`Self::set_mode`], but re-runs the setup steps even when the
    /// mode does not change, which repairs a container that was moved.
    ///
    /// # Errors
    ///
    /// As for [`Self::set_mode`].
    pub fn set_mode_forced(&self, mode: &str) -> Result<bool> {
        self.transition(mode, true)
    }

    fn transition(&self, mode: &str, force: bool) -> Result<bool> {
        let new = match mode.parse::<ExecMode>() {
            Ok(new) => new,
            Err(err) => {
                tracing::error!(container = %self.id, error = %err, "mode not changed");
                return Ok(false);
            }
        };
        let _lock = ContainerLock::acquire(&self.container_dir)?;
        let prev = self.persisted_mode();
        if prev == new && !force {
            tracing::debug!(container = %self.id, mode = %new, "mode unchanged");
            return Ok(true);
        }

        let done = match self.switch(prev, new, force) {
            Ok(done) => done,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::error!(container = %self.id, error = %err, "mode transition failed");
                false
            }
        };
        if !done {
            tracing::error!(container = %self.id, from = %prev, to = %new, "mode not changed");
            return Ok(false);
        }
        write_file(&self.container_dir.join(EXECMODE_FILE), new.as_str())?;
        write_file(
            &self.container_dir.join(ROOT_PATH_FILE),
            &self.container_root.display().to_string(),
        )?;
        self.clear_inconsistent()?;
        tracing::info!(container = %self.id, from = %prev, to = %new, "execution mode changed");
        Ok(true)
    }

    /// Tears `prev` down and sets `new` up. When a step fails the tree is
    /// brought back to `prev` before returning.
    fn switch(&self, prev: ExecMode, new: ExecMode, force: bool) -> Result<bool> {
        let steps = self.steps()?;

        if !(prev == new && force) {
            let undone = steps.teardown(prev);
            if !matches!(undone, Ok(true)) {
                tracing::error!(container = %self.id, mode = %prev, "cannot undo previous mode");
                self.recover(&steps, prev, new, false);
                return undone.map(|_| false);
            }
        }

        let ready = steps.setup(new);
        if !matches!(ready, Ok(true)) {
            tracing::error!(container = %self.id, mode = %new, "cannot set up mode");
            self.recover(&steps, prev, new, true);
            return ready.map(|_| false);
        }
        Ok(true)
    }

    /// Undoes whatever part of `new` was set up when `undo_new` is set,
    /// then sets `prev` up again. Leaves the inconsistency marker behind
    /// if that fails.
    fn recover(&self, steps: &Steps, prev: ExecMode, new: ExecMode, undo_new: bool) {
        if undo_new {
            match steps.teardown(new) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(container = %self.id, mode = %new, "partial setup not fully undone");
                }
                Err(err) => {
                    tracing::warn!(container = %self.id, mode = %new, error = %err, "partial setup not fully undone");
                }
            }
        }
        let restored = match steps.setup(prev) {
            Ok(restored) => restored,
            Err(err) => {
                tracing::error!(container = %self.id, mode = %prev, error = %err, "cannot set up previous mode again");
                false
            }
        };
        if restored {
            tracing::info!(container = %self.id, mode = %prev, "previous mode restored");
            return;
        }
        let marker = self.container_dir.join(EXECMODE_INCONSISTENT_FILE);
        if let Err(err) = write_file(&marker, &format!("{prev}->{new}")) {
            tracing::error!(container = %self.id, error = %err, "cannot record inconsistent mode");
        }
        tracing::error!(
            container = %self.id,
            mode = %prev,
            "container left between modes, run setup again with --force"
        );
    }

    fn steps(&self) -> Result<Steps> {
        let orig_root = fs::read_to_string(self.container_dir.join(ROOT_PATH_FILE)).unwrap_or_default();
        Ok(Steps {
            patcher: ElfPatcher::new(&self.container_dir, &self.ctx.identity, &self.ctx.config)?,
            links: LinkConverter::new(
                &self.container_root,
                self.ctx.config.containers_dir(),
                self.ctx.identity.uid,
            ),
            filebind: FileBind::new(&self.container_dir),
            orig_root: orig_root.trim().to_string(),
        })
    }

    /// Whether a failed transition left the tree between two modes.
    #[must_use]
    pub fn is_inconsistent(&self) -> bool {
        self.container_dir.join(EXECMODE_INCONSISTENT_FILE).exists()
    }

    fn clear_inconsistent(&self) -> Result<()> {
        let marker = self.container_dir.join(EXECMODE_INCONSISTENT_FILE);
        match fs::remove_file(&marker) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(UrunError::io(&marker, e)),
            _ => Ok(()),
        }
    }

    /// Engine for the effective mode.
    ///
    /// # Errors
    ///
    /// Returns [`UrunError::NoEngine`] for modes without an engine.
    pub fn get_engine(&self) -> Result<Box<dyn ExecutionEngine>> {
        let mode = self.get_mode();
        let kind = EngineKind::for_mode(mode).ok_or_else(|| UrunError::NoEngine {
            mode: mode.to_string(),
        })?;
        Ok(create_engine(kind, self.ctx.clone(), mode))
    }
}

/// Per-mode setup and teardown actions on one container tree.
struct Steps {
    patcher: ElfPatcher,
    links: LinkConverter,
    filebind: FileBind,
    orig_root: String,
}

impl Steps {
    fn orig_root(&self) -> Option<&str> {
        Some(self.orig_root.as_str()).filter(|r| !r.is_empty())
    }

    /// Every action runs even when an earlier one failed, so a partial
    /// setup is undone as far as possible.
    fn teardown(&self, mode: ExecMode) -> Result<bool> {
        Ok(match mode {
            ExecMode::P1 | ExecMode::P2 => true,
            ExecMode::R1 | ExecMode::S1 => {
                self.filebind.restore()?;
                true
            }
            ExecMode::F1 | ExecMode::F2 => {
                let _ = self.links.convert(LinkDirection::ToImage, true, self.orig_root())?;
                self.patcher.restore_ld()?
            }
            ExecMode::F3 => self.patcher.restore_ld()?,
            ExecMode::F4 => {
                let loader = self.patcher.restore_ld()?;
                let binaries = self.patcher.restore_binaries()?;
                loader && binaries
            }
        })
    }

    fn setup(&self, mode: ExecMode) -> Result<bool> {
        Ok(match mode {
            ExecMode::P1 | ExecMode::P2 => true,
            ExecMode::R1 | ExecMode::S1 => self.filebind.setup()?,
            ExecMode::F1 | ExecMode::F2 => {
                let _ = self.links.convert(LinkDirection::ToContainer, false, self.orig_root())?;
                self.patcher.patch_ld(None)?
            }
            ExecMode::F3 => self.patcher.patch_ld(None)?,
            ExecMode::F4 => self.patcher.patch_ld(None)? && self.patcher.patch_binaries()?,
        })
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).map_err(|e| UrunError::io(path, e))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use urun_common::config::UrunConfig;

    use super::*;
    use crate::launch::RecordingLauncher;

    fn fixture() -> (tempfile::TempDir, ExecutionMode) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = RunContext::new(UrunConfig::with_top_dir(dir.path()))
            .with_launcher(Arc::new(RecordingLauncher::default()));
        let id = ContainerId::new("abc");
        let _ = ctx.repo.create_container(&id).expect("create");
        let mode = ExecutionMode::new(ctx, &id).expect("mode");
        (dir, mode)
    }

    #[test]
    fn unknown_container_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = RunContext::new(UrunConfig::with_top_dir(dir.path()));
        let err = ExecutionMode::new(ctx, &ContainerId::new("nope")).unwrap_err();
        assert!(matches!(err, UrunError::NotFound { .. }));
    }

    #[test]
    fn default_mode_until_set() {
        let (_dir, mode) = fixture();
        assert_eq!(mode.get_mode(), ExecMode::P1);
        assert!(mode.set_mode("P2").expect("set"));
        assert_eq!(mode.get_mode(), ExecMode::P2);
        let recorded = fs::read_to_string(mode.container_dir().join(ROOT_PATH_FILE)).expect("root.path");
        assert!(recorded.ends_with("/ROOT"));
    }

    #[test]
    fn invalid_mode_is_a_noop() {
        let (_dir, mode) = fixture();
        assert!(mode.set_mode("R1").expect("set"));
        assert!(!mode.set_mode("X9").expect("set"));
        assert!(!mode.set_mode("").expect("set"));
        assert_eq!(mode.get_mode(), ExecMode::R1);
    }

    #[test]
    fn garbage_file_falls_back_to_default() {
        let (_dir, mode) = fixture();
        fs::write(mode.container_dir().join(EXECMODE_FILE), "garbage").expect("write");
        assert_eq!(mode.get_mode(), ExecMode::P1);
    }

    #[test]
    fn reserved_mode_has_no_engine() {
        let (_dir, mode) = fixture();
        assert!(mode.set_mode("S1").expect("set"));
        assert!(matches!(mode.get_engine(), Err(UrunError::NoEngine { .. })));
        assert!(mode.set_mode("P1").expect("set"));
        assert_eq!(mode.get_engine().expect("engine").kind(), EngineKind::PRoot);
    }
}
