//! System-wide constants, on-disk file names and default paths.

use std::path::PathBuf;

/// Application name used in output and state files.
pub const APP_NAME: &str = "urun";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "urun";

/// Directory under `container_dir` holding the container filesystem.
pub const ROOT_DIR: &str = "ROOT";

/// Persisted execution mode token.
pub const EXECMODE_FILE: &str = "execmode";

/// Original interpreter pathname recorded before any patching.
pub const LD_SO_PATH_FILE: &str = "ld.so.path";

/// Byte-exact backup of the container loader.
pub const LD_SO_ORIG_FILE: &str = "ld.so.orig";

/// Unix time of the last verified binary patch.
pub const PATCH_TIME_FILE: &str = "patch.time";

/// Host path of `container_dir` at the time of the last binary patch.
pub const PATCH_PATH_FILE: &str = "patch.path";

/// Cached colon-separated list of library directories.
pub const LD_LIB_DIRS_FILE: &str = "ld.lib.dirs";

/// Absolute container root recorded at the last mode transition.
pub const ROOT_PATH_FILE: &str = "root.path";

/// Present while a failed transition could not restore the previous mode;
/// holds `<previous>-><requested>`.
pub const EXECMODE_INCONSISTENT_FILE: &str = "execmode.inconsistent";

/// Image configuration (`Env`, `Cmd`, `Entrypoint`, ...) of the container.
pub const CONTAINER_JSON_FILE: &str = "container.json";

/// OCI runtime spec consumed by the namespace engine.
pub const OCI_SPEC_FILE: &str = "config.json";

/// Advisory lock serialising mode changes and runs per container.
pub const LOCK_FILE: &str = ".urun.lock";

/// Container path under which host files are exposed by bind emulation.
pub const BIND_HOST_DIR: &str = "/.bind_host_files";

/// Directory under `container_dir` keeping container files moved aside.
pub const BIND_ORIG_DIR: &str = ".bind_orig_files";

/// Placeholder substituted with each visited path by the batch walker.
pub const PATH_PLACEHOLDER: &str = "#f";

/// Interpreter replacement for the library path variable inside a patched loader.
pub const LD_LIBRARY_REAL: &str = "LD_LIBRARY_REAL";

/// Returns the default top directory, `$HOME/.urun`, or `/tmp/.urun`
/// when no home directory is known.
#[must_use]
pub fn default_top_dir() -> PathBuf {
    std::env::var_os("HOME").map_or_else(
        || PathBuf::from("/tmp").join(format!(".{APP_NAME}")),
        |home| PathBuf::from(home).join(format!(".{APP_NAME}")),
    )
}
