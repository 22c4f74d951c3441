//! Bind-mount emulation for single files.
//!
//! An OCI runtime can only bind directories that exist on both sides. To
//! expose an individual host file (e.g. `/etc/hosts`) the container file is
//! moved aside into `container_dir/.bind_orig_files`, replaced by a symlink
//! into `/.bind_host_files`, and the host staging directory
//! `container_dir/.bind_host_files` is mounted there.
//!
//! Staged names are the container path with every `/` replaced by `#`.

use std::fs;
use std::path::{Path, PathBuf};

use urun_common::constants::{BIND_HOST_DIR, BIND_ORIG_DIR, ROOT_DIR};
use urun_common::error::{Result, UrunError};

const ABSENT_SUFFIX: &str = ".absent";

/// File-bind staging state of one container.
#[derive(Debug, Clone)]
pub struct FileBind {
    container_root: PathBuf,
    orig_dir: PathBuf,
    host_dir: PathBuf,
    mount_point: PathBuf,
}

/// Encodes a container path as a flat file name.
#[must_use]
pub fn mangle(cont_path: &str) -> String {
    cont_path.replace('/', "#")
}

/// Decodes a name produced by [`mangle`].
#[must_use]
pub fn unmangle(name: &str) -> String {
    name.replace('#', "/")
}

impl FileBind {
    /// Creates the staging handle for `container_dir`.
    #[must_use]
    pub fn new(container_dir: &Path) -> Self {
        let container_root = container_dir.join(ROOT_DIR);
        let bind_name = BIND_HOST_DIR.trim_start_matches('/');
        Self {
            mount_point: container_root.join(bind_name),
            container_root,
            orig_dir: container_dir.join(BIND_ORIG_DIR),
            host_dir: container_dir.join(bind_name),
        }
    }

    /// Host directory whose content appears at `/.bind_host_files`.
    #[must_use]
    pub fn host_dir(&self) -> &Path {
        &self.host_dir
    }

    /// Creates the staging directories. Returns `Ok(false)` if the
    /// container root does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn setup(&self) -> Result<bool> {
        if !self.container_root.is_dir() {
            tracing::error!(root = %self.container_root.display(), "container root missing");
            return Ok(false);
        }
        for dir in [&self.orig_dir, &self.host_dir, &self.mount_point] {
            fs::create_dir_all(dir).map_err(|e| UrunError::io(dir, e))?;
        }
        Ok(true)
    }

    /// Whether any container file is currently redirected.
    #[must_use]
    pub fn has_staged_files(&self) -> bool {
        fs::read_dir(&self.orig_dir).is_ok_and(|mut d| d.next().is_some())
    }

    /// Redirects each listed container file into the staging area, seeding
    /// the staged copy with the container's own content. Files absent from
    /// the container are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be moved, linked or copied.
    pub fn start(&self, cont_files: &[String]) -> Result<()> {
        let _ = self.setup()?;
        for cont_file in cont_files {
            let cont_path = self.in_root(cont_file);
            let orig = self.orig_dir.join(mangle(cont_file));
            if orig.exists() || cont_path.symlink_metadata().is_ok_and(|m| m.is_file()) {
                self.redirect(cont_file)?;
                let staged = self.host_dir.join(mangle(cont_file));
                if orig.is_file() && !staged.exists() {
                    let _ = fs::copy(&orig, &staged).map_err(|e| UrunError::io(&orig, e))?;
                }
            }
        }
        Ok(())
    }

    /// Exposes `host_file` at `cont_file` inside the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the host file cannot be copied or the container
    /// file cannot be redirected.
    pub fn add(&self, host_file: &Path, cont_file: &str) -> Result<()> {
        let _ = self.setup()?;
        self.redirect(cont_file)?;
        let staged = self.host_dir.join(mangle(cont_file));
        if staged.exists() {
            fs::remove_file(&staged).map_err(|e| UrunError::io(&staged, e))?;
        }
        let _ = fs::copy(host_file, &staged).map_err(|e| UrunError::io(host_file, e))?;
        tracing::debug!(host = %host_file.display(), container = cont_file, "file bound");
        Ok(())
    }

    /// Host path of the staged copy for `cont_file`, if any.
    #[must_use]
    pub fn get_path(&self, cont_file: &str) -> Option<PathBuf> {
        let staged = self.host_dir.join(mangle(cont_file));
        staged.exists().then_some(staged)
    }

    /// Moves the container file aside once and replaces it with a symlink
    /// into the bind mount point.
    fn redirect(&self, cont_file: &str) -> Result<()> {
        let name = mangle(cont_file);
        let cont_path = self.in_root(cont_file);
        let orig = self.orig_dir.join(&name);
        let absent = self.orig_dir.join(format!("{name}{ABSENT_SUFFIX}"));
        let link_target = format!("{BIND_HOST_DIR}/{name}");

        if fs::read_link(&cont_path).is_ok_and(|t| t == Path::new(&link_target)) {
            return Ok(());
        }
        if !orig.exists() && !absent.exists() {
            if cont_path.symlink_metadata().is_ok() {
                fs::rename(&cont_path, &orig).map_err(|e| UrunError::io(&cont_path, e))?;
            } else {
                fs::write(&absent, b"").map_err(|e| UrunError::io(&absent, e))?;
            }
        } else if cont_path.symlink_metadata().is_ok() {
            fs::remove_file(&cont_path).map_err(|e| UrunError::io(&cont_path, e))?;
        }
        if let Some(parent) = cont_path.parent() {
            fs::create_dir_all(parent).map_err(|e| UrunError::io(parent, e))?;
        }
        std::os::unix::fs::symlink(&link_target, &cont_path)
            .map_err(|e| UrunError::io(&cont_path, e))
    }

    /// Puts every moved-aside file back and removes the staging
    /// directories.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be restored.
    pub fn restore(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.orig_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return self.remove_dirs(),
            Err(e) => return Err(UrunError::io(&self.orig_dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| UrunError::io(&self.orig_dir, e))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let (cont_file, was_absent) = match file_name.strip_suffix(ABSENT_SUFFIX) {
                Some(stem) => (unmangle(stem), true),
                None => (unmangle(&file_name), false),
            };
            let cont_path = self.in_root(&cont_file);
            let is_link = cont_path.symlink_metadata().is_ok_and(|m| m.is_symlink());
            if is_link {
                fs::remove_file(&cont_path).map_err(|e| UrunError::io(&cont_path, e))?;
            } else if cont_path.exists() {
                tracing::warn!(file = %cont_path.display(), "container file replaced, keeping it");
                fs::remove_file(entry.path()).map_err(|e| UrunError::io(entry.path(), e))?;
                continue;
            }
            if was_absent {
                fs::remove_file(entry.path()).map_err(|e| UrunError::io(entry.path(), e))?;
            } else {
                fs::rename(entry.path(), &cont_path).map_err(|e| UrunError::io(&cont_path, e))?;
            }
        }
        self.remove_dirs()?;
        tracing::debug!(root = %self.container_root.display(), "file binds restored");
        Ok(())
    }

    fn remove_dirs(&self) -> Result<()> {
        for dir in [&self.orig_dir, &self.host_dir, &self.mount_point] {
            match fs::remove_dir_all(dir) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    return Err(UrunError::io(dir, e));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn in_root(&self, cont_file: &str) -> PathBuf {
        self.container_root.join(cont_file.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container() -> (tempfile::TempDir, FileBind) {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("ROOT/etc")).expect("mkdir");
        fs::write(dir.path().join("ROOT/etc/hosts"), "container hosts").expect("write");
        let fb = FileBind::new(dir.path());
        (dir, fb)
    }

    #[test]
    fn mangling_round_trips() {
        assert_eq!(mangle("/etc/hosts"), "#etc#hosts");
        assert_eq!(unmangle("#etc#hosts"), "/etc/hosts");
    }

    #[test]
    fn setup_requires_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(!FileBind::new(dir.path()).setup().expect("setup"));
    }

    #[test]
    fn add_then_restore() {
        let (dir, fb) = container();
        let host = dir.path().join("host-hosts");
        fs::write(&host, "host hosts").expect("write");

        fb.add(&host, "/etc/hosts").expect("add");
        let cont = dir.path().join("ROOT/etc/hosts");
        assert_eq!(
            fs::read_link(&cont).expect("readlink"),
            PathBuf::from("/.bind_host_files/#etc#hosts")
        );
        assert_eq!(
            fs::read_to_string(fb.host_dir().join("#etc#hosts")).expect("read"),
            "host hosts"
        );
        assert!(fb.has_staged_files());
        assert_eq!(fb.get_path("/etc/hosts"), Some(fb.host_dir().join("#etc#hosts")));

        // A second add replaces the staged copy but keeps the original aside.
        fs::write(&host, "newer").expect("write");
        fb.add(&host, "/etc/hosts").expect("add");
        assert_eq!(fs::read_to_string(fb.host_dir().join("#etc#hosts")).expect("read"), "newer");

        fb.restore().expect("restore");
        assert_eq!(fs::read_to_string(&cont).expect("read"), "container hosts");
        assert!(!fb.host_dir().exists());
        assert!(!dir.path().join(BIND_ORIG_DIR).exists());
        assert!(!dir.path().join("ROOT/.bind_host_files").exists());
    }

    #[test]
    fn binding_a_file_the_image_lacks() {
        let (dir, fb) = container();
        let host = dir.path().join("resolv");
        fs::write(&host, "nameserver 1.1.1.1").expect("write");
        fb.add(&host, "/etc/resolv.conf").expect("add");
        assert!(fs::read_link(dir.path().join("ROOT/etc/resolv.conf")).is_ok());

        fb.restore().expect("restore");
        assert!(dir.path().join("ROOT/etc/resolv.conf").symlink_metadata().is_err());
    }

    #[test]
    fn start_seeds_staging_with_container_content() {
        let (dir, fb) = container();
        fb.start(&["/etc/hosts".into(), "/etc/host.conf".into()]).expect("start");
        assert_eq!(
            fs::read_to_string(fb.host_dir().join("#etc#hosts")).expect("read"),
            "container hosts"
        );
        assert!(fb.get_path("/etc/host.conf").is_none());
        assert!(dir.path().join("ROOT/etc/host.conf").symlink_metadata().is_err());
        fb.restore().expect("restore");
        assert_eq!(
            fs::read_to_string(dir.path().join("ROOT/etc/hosts")).expect("read"),
            "container hosts"
        );
    }

    #[test]
    fn restore_without_setup_is_noop() {
        let (_dir, fb) = container();
        fb.restore().expect("restore");
        assert!(!fb.has_staged_files());
    }
}
