//! Host facts and external tool discovery.

use std::path::{Path, PathBuf};
use std::time::Duration;

use urun_common::error::{Result, UrunError};

/// Returns the host architecture in container-image naming
/// (`amd64`, `i386`, `arm64`, `arm`, `ppc64le`, ...).
#[must_use]
pub fn arch() -> &'static str {
    normalize_arch(std::env::consts::ARCH)
}

fn normalize_arch(rust_arch: &'static str) -> &'static str {
    match rust_arch {
        "x86_64" => "amd64",
        "x86" => "i386",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// Suffix used by bundled tool binaries for the host architecture.
#[must_use]
pub fn tool_arch_suffix() -> &'static str {
    match arch() {
        "amd64" => "x86_64",
        "i386" => "x86",
        other => other,
    }
}

/// Returns the running kernel release string (`uname -r`).
#[must_use]
pub fn kernel_release() -> String {
    nix::sys::utsname::uname()
        .map(|u| u.release().to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Parses the leading numeric components of a kernel release,
/// e.g. `5.15.0-91-generic` → `[5, 15, 0]`.
#[must_use]
pub fn parse_kernel_version(release: &str) -> Vec<u32> {
    let numeric = release
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .next()
        .unwrap_or_default();
    numeric
        .split('.')
        .take(3)
        .map_while(|part| part.parse().ok())
        .collect()
}

/// Whether the running kernel is at least `min` (component-wise, missing
/// components count as zero).
#[must_use]
pub fn kernel_at_least(min: &[u32]) -> bool {
    version_at_least(&parse_kernel_version(&kernel_release()), min)
}

fn version_at_least(have: &[u32], min: &[u32]) -> bool {
    let len = have.len().max(min.len());
    for i in 0..len {
        let a = have.get(i).copied().unwrap_or(0);
        let b = min.get(i).copied().unwrap_or(0);
        if a != b {
            return a > b;
        }
    }
    true
}

/// Returns the host name.
#[must_use]
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".into())
}

/// Whether `program --help` mentions `flag`.
#[must_use]
pub fn command_supports_flag(program: &Path, flag: &str, timeout: Duration) -> bool {
    let argv = vec![program.display().to_string(), "--help".to_string()];
    crate::process::capture_combined(&argv, timeout).is_ok_and(|out| out.contains(flag))
}

/// Returns the first of `names` that exists as a file inside `dir`.
#[must_use]
pub fn find_in_dir(dir: &Path, names: &[String]) -> Option<PathBuf> {
    names
        .iter()
        .map(|n| dir.join(n))
        .find(|p| p.is_file())
}

/// Resolves an executable on the host `PATH`.
#[must_use]
pub fn find_exec(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}

/// Locates a required tool: the explicit override if given, else the
/// first candidate present in `dir`, else the first candidate on `PATH`.
///
/// # Errors
///
/// Returns [`UrunError::ToolMissing`] when nothing matches. There is no
/// fallback strategy for a missing tool, so callers treat this as fatal.
pub fn locate_tool(
    tool: &'static str,
    explicit: Option<&Path>,
    dir: &Path,
    names: &[String],
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        if let Some(found) = path.to_str().and_then(find_exec) {
            return Ok(found);
        }
        tracing::error!(tool, path = %path.display(), "configured tool does not exist");
        return Err(UrunError::ToolMissing {
            tool,
            searched: path.display().to_string(),
        });
    }
    if let Some(found) = find_in_dir(dir, names) {
        tracing::debug!(tool, path = %found.display(), "tool found in bundle directory");
        return Ok(found);
    }
    if let Some(found) = names.iter().find_map(|n| find_exec(n)) {
        tracing::debug!(tool, path = %found.display(), "tool found on PATH");
        return Ok(found);
    }
    tracing::error!(tool, dir = %dir.display(), "tool executable not found");
    Err(UrunError::ToolMissing {
        tool,
        searched: names.join(", "),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_names_are_normalised() {
        assert_eq!(normalize_arch("x86_64"), "amd64");
        assert_eq!(normalize_arch("aarch64"), "arm64");
        assert_eq!(normalize_arch("riscv64"), "riscv64");
        assert!(!arch().is_empty());
    }

    #[test]
    fn kernel_version_parsing() {
        assert_eq!(parse_kernel_version("5.15.0-91-generic"), vec![5, 15, 0]);
        assert_eq!(parse_kernel_version("4.8"), vec![4, 8]);
        assert_eq!(parse_kernel_version("6.1.55+"), vec![6, 1, 55]);
        assert!(parse_kernel_version("weird").is_empty());
    }

    #[test]
    fn version_comparison() {
        assert!(version_at_least(&[4, 8, 0], &[4, 8, 0]));
        assert!(version_at_least(&[5, 0], &[4, 8, 0]));
        assert!(!version_at_least(&[4, 4, 200], &[4, 8, 0]));
        assert!(version_at_least(&[4, 8], &[4, 8, 0]));
    }

    #[test]
    fn find_in_dir_returns_first_existing_candidate() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("tool"), b"").expect("write");
        let names = vec!["tool-x86_64".to_string(), "tool".to_string()];
        assert_eq!(find_in_dir(dir.path(), &names), Some(dir.path().join("tool")));
    }

    #[test]
    fn locate_tool_reports_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = locate_tool(
            "patchelf",
            None,
            dir.path(),
            &["definitely-not-a-real-tool-xyz".to_string()],
        )
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn locate_tool_prefers_explicit_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let explicit = dir.path().join("my-proot");
        std::fs::write(&explicit, b"").expect("write");
        let found = locate_tool("proot", Some(&explicit), dir.path(), &[]).expect("found");
        assert_eq!(found, explicit);
    }

    #[cfg(unix)]
    #[test]
    fn flag_probe_reads_help_output() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = dir.path().join("fake");
        std::fs::write(&tool, "#!/bin/sh\necho '  --kill-on-exit   kill all'\n").expect("write");
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        assert!(command_supports_flag(&tool, "--kill-on-exit", Duration::from_secs(5)));
        assert!(!command_supports_flag(&tool, "--netcoop", Duration::from_secs(5)));
    }
}
