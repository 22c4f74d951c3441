//! ptrace engine: runs the container under a `proot` compatible binary.

use std::path::PathBuf;

use urun_common::error::Result;
use urun_common::types::{ContainerId, EngineKind, ExecMode};
use urun_core::host;

use super::common::cpu_affinity_prefix;
use super::{EngineError, ExecutionEngine};
use crate::base::{self, PreparedContainer};
use crate::context::RunContext;
use crate::launch::Invocation;
use crate::options::RunOptions;
use crate::volumes::parse_portsmap;

/// Offset added to privileged host ports requested by unprivileged users.
const PORT_SHIFT: u16 = 2000;

/// Engine for the `P1` and `P2` modes.
#[derive(Debug)]
pub struct PRootEngine {
    ctx: RunContext,
    mode: ExecMode,
}

impl PRootEngine {
    /// Creates the engine.
    #[must_use]
    pub const fn new(ctx: RunContext, mode: ExecMode) -> Self {
        Self { ctx, mode }
    }

    /// Locates the proot binary: the configured one, else the most
    /// specific bundled name for this architecture and kernel, else `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`urun_common::error::UrunError::ToolMissing`] if none exists.
    pub fn select_proot(&self) -> Result<PathBuf> {
        let config = &self.ctx.config;
        let suffix = host::tool_arch_suffix();
        let mut names = Vec::new();
        if host::kernel_at_least(&[4, 8, 0]) {
            names.push(format!("proot-{suffix}-4_8_0"));
        }
        names.push(format!("proot-{suffix}"));
        names.push("proot".to_string());
        host::locate_tool("proot", config.proot_path.as_deref(), &config.bin_dir(), &names)
    }

    /// Whether seccomp acceleration is turned off.
    #[must_use]
    pub fn seccomp_disabled(&self) -> bool {
        self.ctx
            .config
            .proot_noseccomp
            .unwrap_or(self.mode == ExecMode::P2)
    }

    fn supports(&self, proot: &std::path::Path, flag: &str) -> bool {
        host::command_supports_flag(proot, flag, self.ctx.config.tool_timeout())
    }

    fn uid_map(prepared: &PreparedContainer) -> Vec<String> {
        if prepared.user.uid == 0 {
            vec!["-0".into()]
        } else {
            vec![
                "-i".into(),
                format!("{}:{}", prepared.user.uid, prepared.user.gid),
            ]
        }
    }

    fn net_map(&self, proot: &std::path::Path, prepared: &PreparedContainer) -> Result<Vec<String>> {
        let mut args = Vec::new();
        let ports = parse_portsmap(&prepared.opts.portsmap)?;
        if !ports.is_empty() {
            if self.supports(proot, "--port") {
                for port in ports {
                    let host_port = shift_port(port.host, self.ctx.identity.is_root());
                    args.push("-p".into());
                    args.push(format!("{}:{host_port}", port.container));
                }
            } else {
                tracing::warn!("this proot does not support port mapping, ignoring -p");
            }
        }
        if prepared.opts.netcoop {
            if self.supports(proot, "--netcoop") {
                args.push("-n".into());
            } else {
                tracing::warn!("this proot does not support --netcoop, ignoring it");
            }
        }
        Ok(args)
    }
}

/// Host port actually requested: privileged ports are shifted for
/// unprivileged users.
fn shift_port(port: u16, is_root: bool) -> u16 {
    if is_root || port >= 1024 {
        return port;
    }
    let shifted = port + PORT_SHIFT;
    tracing::warn!(port, shifted, "privileged port remapped");
    shifted
}

impl ExecutionEngine for PRootEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::PRoot
    }

    fn mode(&self) -> ExecMode {
        self.mode
    }

    fn context(&self) -> &RunContext {
        &self.ctx
    }

    fn prepare(&self, id: &ContainerId, opts: RunOptions) -> std::result::Result<Invocation, EngineError> {
        let prepared = base::prepare(&self.ctx, id, opts)?;
        let proot = self.select_proot()?;
        let config = &self.ctx.config;

        let mut env = prepared.env.clone();
        if self.seccomp_disabled() {
            env.set("PROOT_NO_SECCOMP", "1");
        } else {
            env.remove("PROOT_NO_SECCOMP");
        }
        env.set("PROOT_TMP_DIR", &config.tmp_dir.display().to_string());

        let mut argv = cpu_affinity_prefix(config, prepared.opts.cpuset.as_deref());
        argv.push(proot.display().to_string());
        if config.proot_kill_on_exit && self.supports(&proot, "--kill-on-exit") {
            argv.push("--kill-on-exit".into());
        }
        for volume in &prepared.volumes {
            argv.push("-b".into());
            argv.push(format!("{}:{}", volume.host, volume.container));
        }
        argv.extend(Self::uid_map(&prepared));
        argv.extend(self.net_map(&proot, &prepared)?);
        argv.push("-r".into());
        argv.push(prepared.root_str());
        argv.push("-w".into());
        argv.push(prepared.cwd.clone());
        argv.extend(prepared.argv.iter().cloned());

        tracing::info!(container = %id, mode = %self.mode, "running under proot");
        Ok(Invocation {
            argv,
            env: env.pairs(),
            cwd: None,
            command_name: prepared.command_name(),
            execid: prepared.execid.clone(),
        })
    }
}
