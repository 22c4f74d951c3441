//! ELF loader patching for containers run without a real chroot.
//!
//! Two complementary techniques make binaries inside `container_dir/ROOT`
//! find their dynamic loader and libraries under the container root:
//!
//! - **Interpreter prefixing** ([`ElfPatcher::patch_binaries`]): every
//!   executable and shared library gets its `PT_INTERP` rebased onto the
//!   container root by an external `patchelf` with root-prefix support.
//! - **Loader blinding** ([`ElfPatcher::patch_ld`]): the container's own
//!   loader is rewritten so it ignores host library locations and reads its
//!   search path from `LD_LIBRARY_REAL`.
//!
//! Patch state lives in small marker files inside `container_dir`
//! (`ld.so.path`, `ld.so.orig`, `patch.time`, `patch.path`, `ld.lib.dirs`).

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use urun_common::config::UrunConfig;
use urun_common::constants::{
    LD_LIB_DIRS_FILE, LD_SO_ORIG_FILE, LD_SO_PATH_FILE, PATCH_PATH_FILE, PATCH_TIME_FILE,
    PATH_PLACEHOLDER, ROOT_DIR,
};
use urun_common::error::{Result, UrunError};
use urun_common::types::HostIdentity;
use walkdir::WalkDir;

use crate::walker::{BatchWalker, Selection, WalkAction, WalkPolicy};
use crate::{host, loader, process};

/// Directories probed, in order, for a binary whose interpreter is printed.
const LOADER_PROBE_DIRS: [&str; 3] = ["/bin", "/usr/bin", "/lib64"];

/// Maximum symlink hops followed when resolving a path inside the root.
const MAX_LINK_HOPS: usize = 16;

static LDCONFIG_LINE: OnceLock<Regex> = OnceLock::new();

/// Patches and restores the ELF loader references of one container.
#[derive(Debug)]
pub struct ElfPatcher {
    container_dir: PathBuf,
    container_root: PathBuf,
    walker: BatchWalker,
    timeout: Duration,
    patchelf_override: Option<PathBuf>,
    bin_dir: PathBuf,
    ld_so_cache: String,
    lib_dirs_essential: Vec<String>,
    lib_dirs_append: Vec<String>,
}

impl ElfPatcher {
    /// Creates a patcher for `container_dir`, acting for `identity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the container directory cannot be resolved.
    pub fn new(container_dir: &Path, identity: &HostIdentity, config: &UrunConfig) -> Result<Self> {
        let container_dir =
            fs::canonicalize(container_dir).map_err(|e| UrunError::io(container_dir, e))?;
        let container_root = container_dir.join(ROOT_DIR);
        Ok(Self {
            container_dir,
            container_root,
            walker: BatchWalker::new(identity.uid, config.tool_timeout()),
            timeout: config.tool_timeout(),
            patchelf_override: config.patchelf_path.clone(),
            bin_dir: config.bin_dir(),
            ld_so_cache: config.ld_so_cache.clone(),
            lib_dirs_essential: config.lib_dirs_essential.clone(),
            lib_dirs_append: config.lib_dirs_append.clone(),
        })
    }

    /// Absolute, resolved container directory.
    #[must_use]
    pub fn container_dir(&self) -> &Path {
        &self.container_dir
    }

    /// Absolute container root (`container_dir/ROOT`).
    #[must_use]
    pub fn container_root(&self) -> &Path {
        &self.container_root
    }

    fn marker(&self, name: &str) -> PathBuf {
        self.container_dir.join(name)
    }

    /// Locates the architecture-matched patchelf binary.
    ///
    /// # Errors
    ///
    /// Returns [`UrunError::ToolMissing`] if none is found.
    pub fn select_patchelf(&self) -> Result<PathBuf> {
        let names = vec![
            format!("patchelf-{}", host::tool_arch_suffix()),
            "patchelf".to_string(),
        ];
        host::locate_tool(
            "patchelf",
            self.patchelf_override.as_deref(),
            &self.bin_dir,
            &names,
        )
    }

    /// Asks patchelf for the interpreter of the first binary found in the
    /// usual binary directories. Returns `""` when none is found.
    ///
    /// # Errors
    ///
    /// Returns [`UrunError::ToolMissing`] if patchelf is unavailable.
    pub fn guess_elf_loader(&self) -> Result<String> {
        let patchelf = self.select_patchelf()?;
        let template = vec![
            patchelf.display().to_string(),
            "-q".to_string(),
            "--print-interpreter".to_string(),
            PATH_PLACEHOLDER.to_string(),
        ];
        let action = WalkAction::new(Selection::Binaries, WalkPolicy::FirstNonEmptyOutput);
        for dir in LOADER_PROBE_DIRS {
            let output = self.walker.run(&template, &self.in_root(dir), action);
            if output.contains(".so") {
                tracing::debug!(dir, loader = %output, "elf loader found");
                return Ok(output);
            }
        }
        Ok(String::new())
    }

    /// Returns the loader pathname the image was built with, as recorded in
    /// `ld.so.path` or, on first use, guessed and then recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if patchelf is missing or the marker cannot be
    /// written.
    pub fn get_original_loader(&self) -> Result<String> {
        let cache = self.marker(LD_SO_PATH_FILE);
        if let Some(recorded) = read_trimmed(&cache).filter(|s| !s.is_empty()) {
            return Ok(recorded);
        }
        let guessed = self.guess_elf_loader()?;
        // A tree that is already prefixed reports the rebased path.
        let root = self.container_root.display().to_string();
        let original = guessed
            .strip_prefix(root.as_str())
            .map_or_else(|| guessed.clone(), str::to_string);
        if !original.is_empty() {
            write_text(&cache, &original)?;
        }
        Ok(original)
    }

    /// Returns the host path of the container's loader, if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the original loader cannot be determined.
    pub fn get_container_loader(&self) -> Result<Option<PathBuf>> {
        let original = self.get_original_loader()?;
        if original.is_empty() {
            return Ok(None);
        }
        let path = self.in_root(&original);
        Ok(path.exists().then_some(path))
    }

    /// Host path of `container_dir` recorded at the last binary patch, or
    /// `""` if the tree was never patched.
    #[must_use]
    pub fn get_patch_last_path(&self) -> String {
        read_trimmed(&self.marker(PATCH_PATH_FILE)).unwrap_or_default()
    }

    /// Whether the recorded patch path, if any, is the current location.
    #[must_use]
    pub fn check_container_path(&self) -> bool {
        let last = self.get_patch_last_path();
        last.is_empty() || Path::new(&last) == self.container_dir
    }

    /// Unix time of the last verified patch, `"0"` if unknown or garbled.
    #[must_use]
    pub fn get_patch_last_time(&self) -> String {
        read_trimmed(&self.marker(PATCH_TIME_FILE))
            .filter(|s| s.parse::<i64>().is_ok())
            .unwrap_or_else(|| "0".to_string())
    }

    /// Rebases the interpreter of every binary and library onto the
    /// container root. Returns `Ok(false)` if the result cannot be verified.
    ///
    /// # Errors
    ///
    /// Returns an error if patchelf is missing or a marker cannot be
    /// written.
    pub fn patch_binaries(&self) -> Result<bool> {
        if !self.check_container_path() {
            tracing::info!(
                last = %self.get_patch_last_path(),
                current = %self.container_dir.display(),
                "container moved, restoring stale interpreter prefix"
            );
            if !self.restore_binaries()? {
                tracing::warn!("restore of stale prefix could not be verified");
            }
        }
        let patchelf = self.select_patchelf()?;
        let Some(expected) = self.get_container_loader()? else {
            tracing::error!(root = %self.container_root.display(), "container loader not found");
            return Ok(false);
        };
        let expected = expected.display().to_string();

        if self.get_patch_last_path() == self.container_dir.display().to_string()
            && self.guess_elf_loader()? == expected
        {
            tracing::debug!("binaries already patched for this location");
            return Ok(true);
        }

        let template = vec![
            patchelf.display().to_string(),
            "--set-root-prefix".to_string(),
            self.container_root.display().to_string(),
            PATH_PLACEHOLDER.to_string(),
        ];
        let _ = self.walker.run(
            &template,
            &self.container_root,
            WalkAction::new(Selection::Both, WalkPolicy::Exhaustive),
        );

        let probed = self.guess_elf_loader()?;
        if probed != expected {
            tracing::error!(expected = %expected, found = %probed, "binary patch verification failed");
            return Ok(false);
        }
        write_text(
            &self.marker(PATCH_PATH_FILE),
            &self.container_dir.display().to_string(),
        )?;
        write_text(
            &self.marker(PATCH_TIME_FILE),
            &chrono::Utc::now().timestamp().to_string(),
        )?;
        tracing::info!(loader = %expected, "binaries patched");
        Ok(true)
    }

    /// Removes the interpreter prefix written by [`Self::patch_binaries`],
    /// using the recorded patch location if the container has moved.
    ///
    /// # Errors
    ///
    /// Returns an error if patchelf is missing or a marker cannot be
    /// removed.
    pub fn restore_binaries(&self) -> Result<bool> {
        let patchelf = self.select_patchelf()?;
        let original = self.get_original_loader()?;
        let last = self.get_patch_last_path();
        let prefix = if last.is_empty() {
            self.container_root.clone()
        } else {
            Path::new(&last).join(ROOT_DIR)
        };
        let template = vec![
            patchelf.display().to_string(),
            "--restore-root-prefix".to_string(),
            prefix.display().to_string(),
            PATH_PLACEHOLDER.to_string(),
        ];
        let _ = self.walker.run(
            &template,
            &self.container_root,
            WalkAction::new(Selection::Both, WalkPolicy::Exhaustive),
        );

        let probed = self.guess_elf_loader()?;
        if probed != original {
            tracing::error!(expected = %original, found = %probed, "binary restore verification failed");
            return Ok(false);
        }
        remove_if_exists(&self.marker(PATCH_PATH_FILE))?;
        remove_if_exists(&self.marker(PATCH_TIME_FILE))?;
        tracing::info!(loader = %original, "binaries restored");
        Ok(true)
    }

    /// Writes a blinded copy of the container loader to `output`, or over
    /// the loader itself. The pristine loader is backed up once.
    ///
    /// # Errors
    ///
    /// Returns an error if the loader or its backup cannot be read or
    /// written.
    pub fn patch_ld(&self, output: Option<&Path>) -> Result<bool> {
        let Some(loader_path) = self.get_container_loader()? else {
            tracing::error!("cannot patch loader: container loader not found");
            return Ok(false);
        };
        let loader_path = self.resolve_in_root(&loader_path);
        let backup = self.marker(LD_SO_ORIG_FILE);
        if file_len(&backup) == 0 {
            let _ = fs::copy(&loader_path, &backup).map_err(|e| UrunError::io(&loader_path, e))?;
            tracing::debug!(backup = %backup.display(), "loader backed up");
        }
        let pristine = fs::read(&backup).map_err(|e| UrunError::io(&backup, e))?;
        if pristine.is_empty() {
            tracing::error!(backup = %backup.display(), "loader backup is empty");
            return Ok(false);
        }
        let target = output.map_or(loader_path, Path::to_path_buf);
        write_keeping_mode(&target, &loader::blind_loader(&pristine))?;
        tracing::info!(loader = %target.display(), "loader patched");
        Ok(true)
    }

    /// Copies the loader backup over the live loader.
    ///
    /// Returns `Ok(false)` when the loader cannot be located or the backup
    /// is missing or empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy fails.
    pub fn restore_ld(&self) -> Result<bool> {
        let Some(loader_path) = self.get_container_loader()? else {
            tracing::error!("cannot restore loader: container loader not found");
            return Ok(false);
        };
        let backup = self.marker(LD_SO_ORIG_FILE);
        if file_len(&backup) == 0 {
            tracing::error!(backup = %backup.display(), "original loader backup is missing or empty");
            return Ok(false);
        }
        let loader_path = self.resolve_in_root(&loader_path);
        let pristine = fs::read(&backup).map_err(|e| UrunError::io(&backup, e))?;
        write_keeping_mode(&loader_path, &pristine)?;
        tracing::info!(loader = %loader_path.display(), "loader restored");
        Ok(true)
    }

    /// Library directories listed in the container's linker cache, as host
    /// paths. Empty if `ldconfig` is unavailable or the cache is missing.
    #[must_use]
    pub fn ld_config_dirs(&self) -> Vec<String> {
        let Some(ldconfig) = host::find_exec("ldconfig").or_else(|| {
            let sbin = PathBuf::from("/sbin/ldconfig");
            sbin.is_file().then_some(sbin)
        }) else {
            tracing::debug!("ldconfig not available");
            return Vec::new();
        };
        let cache = self.in_root(&self.ld_so_cache);
        let argv = vec![
            ldconfig.display().to_string(),
            "-p".to_string(),
            "-C".to_string(),
            cache.display().to_string(),
        ];
        let output = match process::capture_output(&argv, self.timeout) {
            Ok(out) => out,
            Err(err) => {
                tracing::debug!(error = %err, "ldconfig cache listing failed");
                return Vec::new();
            }
        };
        parse_ldconfig(&output)
            .into_iter()
            .map(|dir| self.in_root(&dir).display().to_string())
            .collect()
    }

    /// Scans `root` (default: the container root) for directories holding
    /// shared libraries, returned relative to `root`, sorted.
    #[must_use]
    pub fn find_ld_libdirs(&self, root: Option<&Path>) -> Vec<String> {
        let root = root.unwrap_or(&self.container_root);
        let mut dirs = BTreeSet::new();
        for entry in WalkDir::new(root).follow_links(false).into_iter().flatten() {
            if !entry.file_type().is_file()
                || !entry
                    .file_name()
                    .to_str()
                    .is_some_and(crate::walker::is_shared_library_name)
            {
                continue;
            }
            if let Some(parent) = entry.path().parent().and_then(|p| p.strip_prefix(root).ok()) {
                let _ = dirs.insert(format!("/{}", parent.display()));
            }
        }
        dirs.into_iter()
            .map(|d| if d == "/" { d } else { d.trim_end_matches('/').to_string() })
            .collect()
    }

    /// Cached library directories, rescanned when `force` is set or no
    /// cache exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache file cannot be written.
    pub fn get_ld_libdirs(&self, force: bool) -> Result<Vec<String>> {
        let cache = self.marker(LD_LIB_DIRS_FILE);
        if !force {
            if let Some(cached) = read_trimmed(&cache) {
                return Ok(split_colon(&cached));
            }
        }
        let dirs = self.find_ld_libdirs(None);
        write_text(&cache, &dirs.join(":"))?;
        tracing::debug!(count = dirs.len(), "library directories cached");
        Ok(dirs)
    }

    /// Builds the library search path handed to a blinded loader: essential
    /// directories, linker-cache directories, scanned directories, extra
    /// directories, then `.`.
    ///
    /// # Errors
    ///
    /// Returns an error if the library directory cache cannot be written.
    pub fn get_ld_library_path(&self) -> Result<String> {
        let mut entries: Vec<String> = self
            .lib_dirs_essential
            .iter()
            .map(|d| self.in_root(d).display().to_string())
            .collect();
        entries.extend(self.ld_config_dirs());
        entries.extend(
            self.get_ld_libdirs(false)?
                .iter()
                .map(|d| self.in_root(d).display().to_string()),
        );
        entries.extend(
            self.lib_dirs_append
                .iter()
                .map(|d| self.in_root(d).display().to_string()),
        );
        let mut seen = BTreeSet::new();
        entries.retain(|e| seen.insert(e.clone()));
        entries.push(".".to_string());
        Ok(entries.join(":"))
    }

    /// Maps a container path onto the host path under the container root.
    #[must_use]
    pub fn in_root(&self, container_path: &str) -> PathBuf {
        self.container_root
            .join(container_path.trim_start_matches('/'))
    }

    /// Follows symlinks of `path`, re-rooting absolute targets under the
    /// container root so the host filesystem is never touched.
    fn resolve_in_root(&self, path: &Path) -> PathBuf {
        let mut current = path.to_path_buf();
        for _ in 0..MAX_LINK_HOPS {
            let Ok(target) = fs::read_link(&current) else {
                break;
            };
            current = if target.is_absolute() {
                if target.starts_with(&self.container_root) {
                    target
                } else {
                    self.in_root(&target.display().to_string())
                }
            } else {
                current
                    .parent()
                    .map_or_else(|| target.clone(), |p| p.join(&target))
            };
        }
        current
    }
}

/// Extracts the directories of `name => path` lines of `ldconfig -p`.
fn parse_ldconfig(output: &str) -> Vec<String> {
    #[allow(clippy::expect_used)]
    let re = LDCONFIG_LINE
        .get_or_init(|| Regex::new(r"([^ ]+) => ([^ ]+)").expect("valid ldconfig pattern"));
    let mut dirs = Vec::new();
    for caps in output.lines().filter_map(|line| re.captures(line)) {
        if let Some(dir) = Path::new(&caps[2]).parent() {
            let dir = dir.display().to_string();
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
    }
    dirs
}

fn split_colon(s: &str) -> Vec<String> {
    s.split(':')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    fs::write(path, text).map_err(|e| UrunError::io(path, e))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(UrunError::io(path, e)),
        _ => Ok(()),
    }
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map_or(0, |m| m.len())
}

/// Overwrites `path` with `data`, temporarily granting the owner write
/// permission if needed and restoring the original mode afterwards.
fn write_keeping_mode(path: &Path, data: &[u8]) -> Result<()> {
    let original = fs::metadata(path).map(|m| m.permissions()).ok();
    if let Some(perms) = original.as_ref().filter(|p| p.mode() & 0o200 == 0) {
        let writable = fs::Permissions::from_mode(perms.mode() | 0o200);
        fs::set_permissions(path, writable).map_err(|e| UrunError::io(path, e))?;
    }
    let written = fs::write(path, data).map_err(|e| UrunError::io(path, e));
    if let Some(perms) = original {
        fs::set_permissions(path, perms).map_err(|e| UrunError::io(path, e))?;
    }
    written
}
