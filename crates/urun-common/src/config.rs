//! Global configuration model for the urun runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UrunError};
use crate::types::ExecMode;

/// How the final container process is started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Replace the current process image.
    #[default]
    Exec,
    /// Spawn a child, wait for it and return its exit status.
    Spawn,
}

/// Root configuration for the urun runtime.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UrunConfig {
    /// Base directory holding `containers/`, `bin/` and `lib/`.
    pub top_dir: PathBuf,
    /// Mode used when a container has no readable `execmode` file.
    pub default_execmode: ExecMode,
    /// Mode forced for every container, ignoring the persisted one.
    pub override_execmode: Option<ExecMode>,
    /// Upper bound for any probe or walker subprocess.
    pub tool_timeout_secs: u64,
    /// Explicit patchelf binary.
    pub patchelf_path: Option<PathBuf>,
    /// Explicit proot binary.
    pub proot_path: Option<PathBuf>,
    /// Explicit runc binary.
    pub runc_path: Option<PathBuf>,
    /// Explicit fakechroot shim library.
    pub fakechroot_so: Option<PathBuf>,
    /// Forces seccomp off (or on) for the ptrace engine.
    pub proot_noseccomp: Option<bool>,
    /// Pass `--kill-on-exit` when the proot binary supports it.
    pub proot_kill_on_exit: bool,
    /// Value of `FAKECHROOT_EXPAND_SYMLINKS`; unset uses the recommendation.
    pub fakechroot_expand_symlinks: Option<bool>,
    /// Dynamic linker cache inside the container.
    pub ld_so_cache: String,
    /// Library directories always placed first on the library path.
    pub lib_dirs_essential: Vec<String>,
    /// Library directories appended after the discovered ones.
    pub lib_dirs_append: Vec<String>,
    /// Container paths reported to the shim as known to exist.
    pub access_files: Vec<String>,
    /// Files that may be bound individually.
    pub sysdirs: Vec<String>,
    /// Host variables kept when the host environment is stripped.
    pub valid_host_env: Vec<String>,
    /// `PATH` for uid 0 inside the container.
    pub root_path: String,
    /// `PATH` for other users inside the container.
    pub user_path: String,
    /// CPU affinity wrappers tried in order; `%s` is the CPU set.
    pub cpu_affinity_tools: Vec<Vec<String>>,
    /// Process hand-off strategy.
    pub launch: LaunchMode,
    /// Command run when neither options nor metadata provide one.
    pub default_cmd: Vec<String>,
    /// Directory for unix sockets of fakechroot processes.
    pub tmp_dir: PathBuf,
}

impl Default for UrunConfig {
    fn default() -> Self {
        Self {
            top_dir: crate::constants::default_top_dir(),
            default_execmode: ExecMode::P1,
            override_execmode: None,
            tool_timeout_secs: 600,
            patchelf_path: None,
            proot_path: None,
            runc_path: None,
            fakechroot_so: None,
            proot_noseccomp: None,
            proot_kill_on_exit: true,
            fakechroot_expand_symlinks: None,
            ld_so_cache: "/etc/ld.so.cache".into(),
            lib_dirs_essential: strings(&[
                "/lib/x86_64-linux-gnu",
                "/usr/lib/x86_64-linux-gnu",
                "/lib64",
                "/usr/lib64",
                "/lib",
                "/usr/lib",
            ]),
            lib_dirs_append: Vec::new(),
            access_files: strings(&["/sys/class/infiniband", "/etc/hosts", "/etc/resolv.conf"]),
            sysdirs: strings(&[
                "/etc/resolv.conf",
                "/etc/host.conf",
                "/etc/hosts",
                "/etc/passwd",
                "/etc/group",
            ]),
            valid_host_env: strings(&["TERM"]),
            root_path: "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into(),
            user_path: "/usr/local/bin:/usr/bin:/bin:/usr/local/games:/usr/games".into(),
            cpu_affinity_tools: vec![
                strings(&["numactl", "-C", "%s", "--"]),
                strings(&["taskset", "-c", "%s"]),
            ],
            launch: LaunchMode::Exec,
            default_cmd: strings(&["/bin/bash", "-i"]),
            tmp_dir: std::env::temp_dir(),
        }
    }
}

impl UrunConfig {
    /// Creates the default configuration rooted at `top_dir`.
    #[must_use]
    pub fn with_top_dir(top_dir: impl Into<PathBuf>) -> Self {
        Self {
            top_dir: top_dir.into(),
            ..Self::default()
        }
    }

    /// Loads the configuration: `$URUN_CONFIG` if set, else
    /// `<default top dir>/urun.json` if present, else the defaults; then
    /// applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file exists but cannot be read
    /// or parsed, or if an override has an invalid value.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var_os("URUN_CONFIG").map(PathBuf::from);
        let candidate = explicit
            .clone()
            .unwrap_or_else(|| crate::constants::default_top_dir().join("urun.json"));
        let mut config = if explicit.is_some() || candidate.is_file() {
            Self::from_file(&candidate)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Reads a JSON configuration file; missing keys take default values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| UrunError::io(path, e))?;
        let config = serde_json::from_str(&data)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Applies `URUN_*` overrides looked up through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if an override value cannot be parsed.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup("URUN_DIR") {
            self.top_dir = PathBuf::from(dir);
        }
        if let Some(mode) = lookup("URUN_DEFAULT_EXECMODE") {
            self.default_execmode = mode.parse()?;
        }
        if let Some(secs) = lookup("URUN_TOOL_TIMEOUT") {
            self.tool_timeout_secs = secs.trim().parse().map_err(|_| UrunError::Config {
                message: format!("URUN_TOOL_TIMEOUT is not a number of seconds: {secs:?}"),
            })?;
        }
        Ok(())
    }

    /// Directory holding one subdirectory per container.
    #[must_use]
    pub fn containers_dir(&self) -> PathBuf {
        self.top_dir.join("containers")
    }

    /// Directory searched for bundled executables (proot, patchelf, runc).
    #[must_use]
    pub fn bin_dir(&self) -> PathBuf {
        self.top_dir.join("bin")
    }

    /// Directory searched for bundled shared objects (fakechroot shims).
    #[must_use]
    pub fn lib_dir(&self) -> PathBuf {
        self.top_dir.join("lib")
    }

    /// Subprocess time bound.
    #[must_use]
    pub const fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = UrunConfig::with_top_dir("/opt/urun");
        assert_eq!(c.containers_dir(), PathBuf::from("/opt/urun/containers"));
        assert_eq!(c.bin_dir(), PathBuf::from("/opt/urun/bin"));
        assert_eq!(c.default_execmode, ExecMode::P1);
        assert_eq!(c.launch, LaunchMode::Exec);
        assert_eq!(c.tool_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("urun.json");
        std::fs::write(&path, r#"{"default_execmode":"F3","launch":"spawn"}"#).expect("write");
        let c = UrunConfig::from_file(&path).expect("load");
        assert_eq!(c.default_execmode, ExecMode::F3);
        assert_eq!(c.launch, LaunchMode::Spawn);
        assert_eq!(c.ld_so_cache, "/etc/ld.so.cache");
    }

    #[test]
    fn env_overrides_apply() {
        let mut c = UrunConfig::with_top_dir("/opt/urun");
        c.apply_env_overrides(|k| match k {
            "URUN_DEFAULT_EXECMODE" => Some("R1".into()),
            "URUN_TOOL_TIMEOUT" => Some("5".into()),
            _ => None,
        })
        .expect("overrides");
        assert_eq!(c.default_execmode, ExecMode::R1);
        assert_eq!(c.tool_timeout_secs, 5);
    }

    #[test]
    fn env_override_rejects_bad_mode() {
        let mut c = UrunConfig::default();
        let err = c.apply_env_overrides(|k| (k == "URUN_DEFAULT_EXECMODE").then(|| "Z9".into()));
        assert!(err.is_err());
    }
}
