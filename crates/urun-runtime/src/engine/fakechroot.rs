//! `LD_PRELOAD` engine: path virtualisation through a fakechroot shim.
//!
//! `F1`/`F2` start every program through the container's own loader,
//! with the library path passed as `LD_LIBRARY_PATH` (F1) or through the
//! renamed variable understood by the patched loader (F2). `F3`/`F4`
//! execute host-pathed binaries directly and rely on the patched loader,
//! plus patched interpreters in `F4`.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use urun_common::constants::LD_LIBRARY_REAL;
use urun_common::error::Result;
use urun_common::types::{ContainerId, EngineKind, ExecMode, Volume};
use urun_core::host;
use urun_core::patcher::ElfPatcher;

use super::common::cpu_affinity_prefix;
use super::{EngineError, ExecutionEngine};
use crate::base::{self, PreparedContainer};
use crate::context::RunContext;
use crate::launch::Invocation;
use crate::options::{EnvList, RunOptions};
use crate::volumes::{is_volume, resolve};

static SHEBANG: OnceLock<Regex> = OnceLock::new();

fn shebang() -> &'static Regex {
    #[allow(clippy::expect_used)]
    SHEBANG.get_or_init(|| Regex::new(r"^#! *([^ \t]+)(.*)$").expect("valid shebang pattern"))
}

const ELF_MAGIC: &[u8] = b"\x7fELF";

/// Volume translation for the shim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeBindings {
    /// Colon-joined paths whose host and container paths coincide.
    pub excluded: String,
    /// Colon-joined `realhost!container` remaps, deepest container path first.
    pub mapped: String,
    /// Whether symlink expansion is advisable for these volumes.
    pub expand_symlinks: bool,
}

/// Splits volumes into the shim's exclude and remap lists.
///
/// Both lists are sorted so that the result depends only on the set of
/// volumes, not on their order.
#[must_use]
pub fn volume_bindings(volumes: &[Volume], container_root: &Path) -> VolumeBindings {
    let mut excluded: Vec<&str> = Vec::new();
    let mut mapped: Vec<(String, &str)> = Vec::new();
    let mut expand_symlinks = false;
    for volume in volumes {
        let real = fs::canonicalize(&volume.host)
            .map_or_else(|_| volume.host.clone(), |p| p.display().to_string());
        if real != volume.host {
            expand_symlinks = true;
        }
        let cont_path = container_root.join(volume.container.trim_start_matches('/'));
        if cont_path.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink()) && cont_path.is_dir() {
            expand_symlinks = true;
        }
        if volume.is_identity() {
            excluded.push(volume.container.as_str());
        } else {
            mapped.push((real, volume.container.as_str()));
        }
    }
    excluded.sort_unstable();
    excluded.dedup();
    mapped.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(&b.0)));
    mapped.dedup_by(|a, b| a.1 == b.1);
    VolumeBindings {
        excluded: excluded.join(":"),
        mapped: mapped
            .iter()
            .map(|(host, cont)| format!("{host}!{cont}"))
            .collect::<Vec<_>>()
            .join(":"),
        expand_symlinks,
    }
}

/// Distribution name and release from `<root>/etc/os-release`.
fn os_release(container_root: &Path) -> Option<(String, String)> {
    let text = fs::read_to_string(container_root.join("etc/os-release")).ok()?;
    let field = |key: &str| {
        text.lines()
            .find_map(|l| l.strip_prefix(key)?.strip_prefix('='))
            .map(|v| v.trim().trim_matches('"').to_string())
            .filter(|v| !v.is_empty())
    };
    let id = field("ID")?;
    let version = field("VERSION_ID").unwrap_or_default();
    let distro = match id.as_str() {
        "centos" => "CentOS".to_string(),
        "rhel" => "RHEL".to_string(),
        "almalinux" => "AlmaLinux".to_string(),
        id if id.starts_with("opensuse") => "openSUSE".to_string(),
        id => {
            let mut chars = id.chars();
            chars
                .next()
                .map(|c| c.to_ascii_uppercase().to_string() + chars.as_str())
                .unwrap_or_default()
        }
    };
    let release = if distro == "Alpine" {
        version.split('.').take(2).collect::<Vec<_>>().join(".")
    } else {
        version.split('.').next().unwrap_or_default().to_string()
    };
    Some((distro, release))
}

/// Engine for the `F1` to `F4` modes.
#[derive(Debug)]
pub struct FakechrootEngine {
    ctx: RunContext,
    mode: ExecMode,
}

impl FakechrootEngine {
    /// Creates the engine.
    #[must_use]
    pub const fn new(ctx: RunContext, mode: ExecMode) -> Self {
        Self { ctx, mode }
    }

    /// Locates the shim matching the container's distribution.
    ///
    /// # Errors
    ///
    /// Returns [`urun_common::error::UrunError::ToolMissing`] when no shim
    /// fits this container and architecture.
    pub fn select_fakechroot_so(&self, container_root: &Path) -> Result<PathBuf> {
        let config = &self.ctx.config;
        let arch = host::tool_arch_suffix();
        let mut names = Vec::new();
        if let Some((distro, release)) = os_release(container_root) {
            if !release.is_empty() {
                names.push(format!("libfakechroot-{distro}-{release}-{arch}.so"));
            }
            names.push(format!("libfakechroot-{distro}-{arch}.so"));
        }
        names.push(format!("libfakechroot-{arch}.so"));
        names.push("libfakechroot.so".to_string());
        host::locate_tool("fakechroot", config.fakechroot_so.as_deref(), &config.lib_dir(), &names)
    }

    /// Interpreter prefix for the command: empty for ELF binaries, the
    /// shebang interpreter for scripts, the container shell otherwise.
    fn script_support(prepared: &PreparedContainer) -> std::result::Result<Vec<String>, EngineError> {
        let mut head = [0_u8; 512];
        let len = fs::File::open(&prepared.exec_path)
            .and_then(|mut f| f.read(&mut head))
            .unwrap_or(0);
        let head = &head[..len];
        if head.starts_with(ELF_MAGIC) {
            return Ok(Vec::new());
        }
        let root = prepared.root_str();
        let first_line = head.split(|b| *b == b'\n').next().unwrap_or_default();
        let first_line = String::from_utf8_lossy(first_line);
        let Some(caps) = shebang().captures(first_line.trim_end()) else {
            return Ok(vec![format!("{root}/bin/sh")]);
        };
        let interpreter = &caps[1];
        if !interpreter.starts_with('/') {
            return Err(EngineError::setup(format!(
                "script interpreter is not an absolute path: {interpreter}"
            )));
        }
        let mut prefix = vec![format!("{root}{interpreter}")];
        prefix.extend(caps[2].split_whitespace().map(str::to_string));
        Ok(prefix)
    }

    fn shim_env(
        &self,
        prepared: &PreparedContainer,
        patcher: &ElfPatcher,
        shim: &Path,
    ) -> std::result::Result<EnvList, EngineError> {
        let config = &self.ctx.config;
        let mut env = prepared.env.clone();
        let bindings = volume_bindings(&prepared.volumes, &prepared.container_root);

        env.set("PWD", &prepared.cwd);
        env.set("FAKECHROOT_BASE", &prepared.root_str());
        env.set("LD_PRELOAD", &shim.display().to_string());
        let expand = config
            .fakechroot_expand_symlinks
            .unwrap_or(bindings.expand_symlinks);
        env.set("FAKECHROOT_EXPAND_SYMLINKS", if expand { "true" } else { "false" });
        if !is_volume("/tmp", &prepared.volumes) {
            env.set("FAKECHROOT_AF_UNIX_PATH", &config.tmp_dir.display().to_string());
        }
        if !bindings.excluded.is_empty() {
            env.set("FAKECHROOT_EXCLUDE_PATH", &bindings.excluded);
        }
        if !bindings.mapped.is_empty() {
            env.set("FAKECHROOT_DIR_MAP", &bindings.mapped);
        }
        let access_ok: Vec<&str> = config
            .access_files
            .iter()
            .filter(|f| resolve(f, &prepared.volumes, &prepared.container_root).exists())
            .map(String::as_str)
            .collect();
        if !access_ok.is_empty() {
            env.set("FAKECHROOT_ACCESS_FILESOK", &access_ok.join(":"));
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            env.set("FAKECHROOT_DEBUG", "true");
            env.set("LD_DEBUG", "libs:files");
        }

        let ld_library_path = patcher.get_ld_library_path()?;
        match self.mode {
            ExecMode::F1 => {
                env.set("FAKECHROOT_ELFLOADER", &container_loader(patcher)?);
                env.set("LD_LIBRARY_PATH", &ld_library_path);
            }
            ExecMode::F2 => {
                env.set("FAKECHROOT_ELFLOADER", &container_loader(patcher)?);
                env.set(LD_LIBRARY_REAL, &ld_library_path);
            }
            ExecMode::F3 => env.set(LD_LIBRARY_REAL, &ld_library_path),
            _ => {
                env.set(LD_LIBRARY_REAL, &ld_library_path);
                env.set(
                    "FAKECHROOT_PATCH_PATCHELF",
                    &patcher.select_patchelf()?.display().to_string(),
                );
                env.set("FAKECHROOT_PATCH_ELFLOADER", &container_loader(patcher)?);
                env.set("FAKECHROOT_PATCH_LAST_TIME", &patcher.get_patch_last_time());
            }
        }
        Ok(env)
    }
}

fn container_loader(patcher: &ElfPatcher) -> std::result::Result<String, EngineError> {
    patcher
        .get_container_loader()?
        .map(|p| p.display().to_string())
        .ok_or_else(|| EngineError::setup("container loader not found"))
}

impl ExecutionEngine for FakechrootEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Fakechroot
    }

    fn mode(&self) -> ExecMode {
        self.mode
    }

    fn context(&self) -> &RunContext {
        &self.ctx
    }

    fn prepare(&self, id: &ContainerId, opts: RunOptions) -> std::result::Result<Invocation, EngineError> {
        let prepared = base::prepare(&self.ctx, id, opts)?;
        let shim = self.select_fakechroot_so(&prepared.container_root)?;
        let patcher = ElfPatcher::new(&prepared.container_dir, &self.ctx.identity, &self.ctx.config)?;
        if !patcher.check_container_path() {
            tracing::warn!(
                container = %id,
                patched_at = %patcher.get_patch_last_path(),
                "container was moved since it was set up, run setup again"
            );
        }
        let env = self.shim_env(&prepared, &patcher, &shim)?;

        let mut argv = cpu_affinity_prefix(&self.ctx.config, prepared.opts.cpuset.as_deref());
        if self.mode.uses_container_loader() {
            argv.push(container_loader(&patcher)?);
        }
        let interpreter = Self::script_support(&prepared)?;
        let is_elf = interpreter.is_empty();
        argv.extend(interpreter);
        let mut cmd = prepared.argv.clone();
        if is_elf {
            cmd[0] = prepared.exec_path.display().to_string();
        }
        argv.extend(cmd);

        let cwd = resolve(&prepared.cwd, &prepared.volumes, &prepared.container_root);
        let cwd = fs::canonicalize(&cwd).unwrap_or(cwd);

        tracing::info!(container = %id, mode = %self.mode, "running under fakechroot");
        Ok(Invocation {
            argv,
            env: env.pairs(),
            cwd: Some(cwd),
            command_name: prepared.command_name(),
            execid: prepared.execid.clone(),
        })
    }
}
