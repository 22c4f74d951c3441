//! Volume and port-map helpers shared by the engines.

use std::fs;
use std::path::{Path, PathBuf};

use urun_common::error::{Result, UrunError};
use urun_common::types::Volume;

/// Parses every volume spec, failing on the first invalid one.
///
/// # Errors
///
/// Returns [`UrunError::Config`] naming the offending spec.
pub fn parse_volumes(specs: &[String]) -> Result<Vec<Volume>> {
    specs.iter().map(|s| s.parse()).collect()
}

/// Whether `cont_path` is exactly the container side of a volume.
#[must_use]
pub fn is_volume(cont_path: &str, volumes: &[Volume]) -> bool {
    let cont_path = cont_path.trim_end_matches('/');
    volumes.iter().any(|v| v.container == cont_path)
}

/// Maps a container path to the host path that backs it: through the
/// deepest volume containing it, else under `container_root`.
#[must_use]
pub fn cont2host(cont_path: &str, volumes: &[Volume], container_root: &Path) -> PathBuf {
    let best = volumes
        .iter()
        .filter_map(|v| {
            let rest = if v.container == "/" {
                Some(cont_path)
            } else {
                cont_path
                    .strip_prefix(v.container.as_str())
                    .filter(|r| r.is_empty() || r.starts_with('/'))
            }?;
            Some((v, rest))
        })
        .max_by_key(|(v, _)| v.container.len());
    match best {
        Some((v, rest)) => PathBuf::from(format!("{}{}", v.host, rest)),
        None => container_root.join(cont_path.trim_start_matches('/')),
    }
}

const MAX_LINK_HOPS: usize = 32;

/// Like [`cont2host`], but follows symbolic links component by component
/// with container semantics: absolute targets restart at the container
/// root instead of escaping to the host.
#[must_use]
pub fn resolve(cont_path: &str, volumes: &[Volume], container_root: &Path) -> PathBuf {
    let mut pending: Vec<String> = cont_path.split('/').rev().map(str::to_string).collect();
    let mut current = String::new();
    let mut hops = 0;
    while let Some(component) = pending.pop() {
        match component.as_str() {
            "" | "." => continue,
            ".." => {
                let cut = current.rfind('/').unwrap_or(0);
                current.truncate(cut);
                continue;
            }
            _ => {}
        }
        let candidate = format!("{current}/{component}");
        let host = cont2host(&candidate, volumes, container_root);
        match fs::read_link(&host) {
            Ok(target) if hops < MAX_LINK_HOPS => {
                hops += 1;
                let target = target.to_string_lossy();
                if target.starts_with('/') {
                    current.clear();
                }
                pending.extend(target.split('/').rev().map(str::to_string));
            }
            _ => current = candidate,
        }
    }
    if current.is_empty() {
        current.push('/');
    }
    cont2host(&current, volumes, container_root)
}

/// One `-p host:container` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMap {
    /// Port on the host side.
    pub host: u16,
    /// Port the contained process listens on.
    pub container: u16,
}

/// Parses `host:container` or bare `port` entries (same port both sides).
///
/// # Errors
///
/// Returns [`UrunError::Config`] on a non-numeric or zero port.
pub fn parse_portsmap(entries: &[String]) -> Result<Vec<PortMap>> {
    entries
        .iter()
        .map(|entry| {
            let invalid = || UrunError::Config {
                message: format!("invalid port mapping: {entry:?}"),
            };
            let port = |s: &str| s.trim().parse::<u16>().ok().filter(|p| *p > 0);
            let (host, container) = match entry.split_once(':') {
                Some((h, c)) => (port(h), port(c)),
                None => (port(entry), port(entry)),
            };
            Ok(PortMap {
                host: host.ok_or_else(invalid)?,
                container: container.ok_or_else(invalid)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vols(specs: &[&str]) -> Vec<Volume> {
        parse_volumes(&specs.iter().map(|s| (*s).to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn cont2host_prefers_deepest_volume() {
        let v = vols(&["/srv/data:/data", "/mnt/fast:/data/cache"]);
        let root = Path::new("/c/ROOT");
        assert_eq!(cont2host("/data/x", &v, root), PathBuf::from("/srv/data/x"));
        assert_eq!(cont2host("/data/cache/y", &v, root), PathBuf::from("/mnt/fast/y"));
        assert_eq!(cont2host("/data", &v, root), PathBuf::from("/srv/data"));
        assert_eq!(cont2host("/database", &v, root), PathBuf::from("/c/ROOT/database"));
        assert_eq!(cont2host("/etc/hosts", &v, root), PathBuf::from("/c/ROOT/etc/hosts"));
    }

    #[test]
    fn volume_membership() {
        let v = vols(&["/tmp", "/a:/b"]);
        assert!(is_volume("/tmp", &v));
        assert!(is_volume("/b/", &v));
        assert!(!is_volume("/a", &v));
    }

    #[test]
    fn invalid_volume_is_rejected() {
        assert!(parse_volumes(&["relative:/x".to_string()]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn absolute_links_stay_inside_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        fs::create_dir_all(root.join("usr/bin")).expect("mkdir");
        fs::write(root.join("usr/bin/sh"), "").expect("write");
        std::os::unix::fs::symlink("/usr/bin", root.join("bin")).expect("symlink");
        std::os::unix::fs::symlink("../bin/sh", root.join("usr/bin/dash")).expect("symlink");
        assert_eq!(resolve("/bin/sh", &[], root), root.join("usr/bin/sh"));
        assert_eq!(resolve("/bin/dash", &[], root), root.join("usr/bin/sh"));
        assert_eq!(resolve("/", &[], root), root.to_path_buf());
    }

    #[test]
    fn port_maps() {
        let maps = parse_portsmap(&["8080:80".into(), "443".into()]).unwrap();
        assert_eq!(maps[0], PortMap { host: 8080, container: 80 });
        assert_eq!(maps[1], PortMap { host: 443, container: 443 });
        assert!(parse_portsmap(&["x:80".into()]).is_err());
        assert!(parse_portsmap(&["0:80".into()]).is_err());
    }
}
