//! Absolute symlink conversion between image and container form.
//!
//! Images ship absolute links (`/usr/lib/libz.so -> /lib/libz.so.1`). With
//! a preload shim these would escape to the host, so entering a preload
//! mode rewrites them to point under the container root; leaving it strips
//! the prefix again.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use urun_common::error::{Result, UrunError};
use walkdir::WalkDir;

static FOREIGN_ROOT: OnceLock<Regex> = OnceLock::new();

fn foreign_root() -> &'static Regex {
    #[allow(clippy::expect_used)]
    FOREIGN_ROOT.get_or_init(|| {
        Regex::new(r"^(/.*/containers/[^/]+/ROOT)/").expect("valid container root pattern")
    })
}

/// Direction of a link conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    /// `/x` becomes `<root>/x`.
    ToContainer,
    /// `<root>/x` becomes `/x`.
    ToImage,
}

/// Rewrites absolute symlinks owned by one user under a container root.
#[derive(Debug, Clone)]
pub struct LinkConverter {
    root: PathBuf,
    safe_prefix: PathBuf,
    uid: u32,
}

impl LinkConverter {
    /// Creates a converter for `root`. Conversion is refused unless
    /// `root` lies under `safe_prefix`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, safe_prefix: impl Into<PathBuf>, uid: u32) -> Self {
        Self {
            root: root.into(),
            safe_prefix: safe_prefix.into(),
            uid,
        }
    }

    /// Converts every eligible link and returns the rewritten link paths.
    ///
    /// `orig_root` is the container root recorded at an earlier location;
    /// links still pointing there are rebased too. With `force`, read-only
    /// parent directories are temporarily made writable, and on the way
    /// back links into any `.../containers/<id>/ROOT` are recognised.
    ///
    /// # Errors
    ///
    /// Returns [`UrunError::PermissionDenied`] when the root is outside the
    /// safe prefix, or an I/O error if a link cannot be replaced.
    pub fn convert(
        &self,
        direction: LinkDirection,
        force: bool,
        orig_root: Option<&str>,
    ) -> Result<Vec<PathBuf>> {
        let root = fs::canonicalize(&self.root).map_err(|e| UrunError::io(&self.root, e))?;
        let safe = fs::canonicalize(&self.safe_prefix).unwrap_or_else(|_| self.safe_prefix.clone());
        if root == safe || !root.starts_with(&safe) {
            tracing::error!(
                root = %root.display(),
                prefix = %safe.display(),
                "refusing link conversion outside the container tree"
            );
            return Err(UrunError::PermissionDenied {
                message: format!("link conversion outside of {}", safe.display()),
            });
        }
        let root_str = root.display().to_string();
        let orig_root = orig_root.filter(|o| !o.is_empty());

        let links: Vec<PathBuf> = WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .flatten()
            .filter(|e| e.path_is_symlink())
            .filter(|e| e.path().symlink_metadata().is_ok_and(|m| m.uid() == self.uid))
            .map(walkdir::DirEntry::into_path)
            .collect();

        let mut changed = Vec::new();
        for link in links {
            let Ok(target) = fs::read_link(&link) else {
                continue;
            };
            let Some(target) = target.to_str() else {
                continue;
            };
            let new_target = match direction {
                LinkDirection::ToContainer => to_container(target, &root_str, orig_root),
                LinkDirection::ToImage => to_image(target, &root_str, orig_root, force),
            };
            if let Some(new_target) = new_target {
                replace_link(&link, &new_target, force)?;
                changed.push(link);
            }
        }
        tracing::info!(
            root = %root.display(),
            ?direction,
            count = changed.len(),
            "symbolic links converted"
        );
        Ok(changed)
    }
}

fn to_container(target: &str, root: &str, orig_root: Option<&str>) -> Option<String> {
    if !target.starts_with('/') {
        return None;
    }
    if let Some(orig) = orig_root.filter(|o| *o != root) {
        if let Some(rest) = target
            .strip_prefix(orig)
            .filter(|r| r.is_empty() || r.starts_with('/'))
        {
            return Some(format!("{root}{rest}"));
        }
    }
    if target.starts_with(root) {
        return None;
    }
    Some(format!("{root}{target}"))
}

fn to_image(target: &str, root: &str, orig_root: Option<&str>, force: bool) -> Option<String> {
    if !target.starts_with('/') {
        return None;
    }
    let stripped = orig_root
        .and_then(|orig| target.strip_prefix(orig))
        .or_else(|| target.strip_prefix(root))
        .map(str::to_string)
        .or_else(|| {
            if !force {
                return None;
            }
            foreign_root()
                .captures(target)
                .and_then(|caps| caps.get(1))
                .map(|m| target[m.end()..].to_string())
        })?;
    if stripped.is_empty() {
        Some("/".to_string())
    } else if stripped.starts_with('/') {
        Some(stripped)
    } else {
        // Prefix matched in the middle of a path component.
        None
    }
}

fn replace_link(link: &Path, target: &str, force: bool) -> Result<()> {
    let parent = link.parent().unwrap_or_else(|| Path::new("/"));
    let mut restore_mode = None;
    if force {
        if let Ok(meta) = fs::metadata(parent) {
            let mode = meta.permissions().mode();
            if mode & 0o200 == 0 {
                fs::set_permissions(parent, fs::Permissions::from_mode(mode | 0o200))
                    .map_err(|e| UrunError::io(parent, e))?;
                restore_mode = Some(mode);
            }
        }
    }
    let result = fs::remove_file(link)
        .and_then(|()| std::os::unix::fs::symlink(target, link))
        .map_err(|e| UrunError::io(link, e));
    if let Some(mode) = restore_mode {
        fs::set_permissions(parent, fs::Permissions::from_mode(mode))
            .map_err(|e| UrunError::io(parent, e))?;
    }
    result
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use super::*;

    fn uid() -> u32 {
        nix::unistd::getuid().as_raw()
    }

    /// `<tmp>/containers/c1/ROOT` with one absolute and one relative link.
    fn tree() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("containers/c1/ROOT");
        fs::create_dir_all(root.join("usr/lib")).expect("mkdir");
        symlink("/lib/libz.so.1", root.join("usr/lib/libz.so")).expect("ln");
        symlink("libz.so", root.join("usr/lib/libz.so.rel")).expect("ln");
        (dir, root)
    }

    fn target(path: &Path) -> String {
        fs::read_link(path).expect("readlink").display().to_string()
    }

    #[test]
    fn round_trip_rewrites_only_absolute_links() {
        let (dir, root) = tree();
        let conv = LinkConverter::new(&root, dir.path().join("containers"), uid());
        let real = fs::canonicalize(&root).expect("realpath").display().to_string();

        let changed = conv.convert(LinkDirection::ToContainer, false, None).expect("convert");
        assert_eq!(changed.len(), 1);
        assert_eq!(target(&root.join("usr/lib/libz.so")), format!("{real}/lib/libz.so.1"));
        assert_eq!(target(&root.join("usr/lib/libz.so.rel")), "libz.so");

        // Already converted links are left alone.
        assert!(conv.convert(LinkDirection::ToContainer, false, None).expect("convert").is_empty());

        let changed = conv.convert(LinkDirection::ToImage, false, None).expect("convert");
        assert_eq!(changed.len(), 1);
        assert_eq!(target(&root.join("usr/lib/libz.so")), "/lib/libz.so.1");
    }

    #[test]
    fn links_from_a_previous_location_are_rebased() {
        let (dir, root) = tree();
        let real = fs::canonicalize(&root).expect("realpath").display().to_string();
        let old = "/old/place/containers/c1/ROOT";
        fs::remove_file(root.join("usr/lib/libz.so")).expect("rm");
        symlink(format!("{old}/lib/libz.so.1"), root.join("usr/lib/libz.so")).expect("ln");

        let conv = LinkConverter::new(&root, dir.path().join("containers"), uid());
        let _ = conv.convert(LinkDirection::ToContainer, false, Some(old)).expect("convert");
        assert_eq!(target(&root.join("usr/lib/libz.so")), format!("{real}/lib/libz.so.1"));
    }

    #[test]
    fn forced_restore_recognises_foreign_container_roots() {
        let (dir, root) = tree();
        fs::remove_file(root.join("usr/lib/libz.so")).expect("rm");
        symlink("/elsewhere/containers/zz/ROOT/lib/libz.so.1", root.join("usr/lib/libz.so"))
            .expect("ln");
        let conv = LinkConverter::new(&root, dir.path().join("containers"), uid());

        assert!(conv.convert(LinkDirection::ToImage, false, None).expect("convert").is_empty());
        let changed = conv.convert(LinkDirection::ToImage, true, None).expect("convert");
        assert_eq!(changed.len(), 1);
        assert_eq!(target(&root.join("usr/lib/libz.so")), "/lib/libz.so.1");
    }

    #[test]
    fn outside_safe_prefix_is_refused() {
        let (dir, root) = tree();
        let conv = LinkConverter::new(&root, dir.path().join("somewhere-else"), uid());
        assert!(conv.convert(LinkDirection::ToContainer, false, None).is_err());
        assert_eq!(target(&root.join("usr/lib/libz.so")), "/lib/libz.so.1");
    }

    #[test]
    fn links_of_other_users_are_skipped() {
        let (dir, root) = tree();
        let conv = LinkConverter::new(&root, dir.path().join("containers"), uid().wrapping_add(1));
        assert!(conv.convert(LinkDirection::ToContainer, false, None).expect("convert").is_empty());
    }

    #[test]
    fn prefix_must_end_on_component_boundary() {
        assert_eq!(to_image("/data/ROOTX/lib", "/data/ROOT", None, false), None);
        assert_eq!(to_image("/data/ROOT", "/data/ROOT", None, false), Some("/".into()));
        assert_eq!(to_container("lib/x", "/r", None), None);
    }

    #[test]
    fn forced_conversion_in_read_only_directory() {
        let (dir, root) = tree();
        let lib = root.join("usr/lib");
        fs::set_permissions(&lib, fs::Permissions::from_mode(0o555)).expect("chmod");
        let conv = LinkConverter::new(&root, dir.path().join("containers"), uid());
        let changed = conv.convert(LinkDirection::ToContainer, true, None).expect("convert");
        assert_eq!(changed.len(), 1);
        assert_eq!(
            fs::metadata(&lib).expect("stat").permissions().mode() & 0o777,
            0o555
        );
        fs::set_permissions(&lib, fs::Permissions::from_mode(0o755)).expect("chmod");
    }
}
