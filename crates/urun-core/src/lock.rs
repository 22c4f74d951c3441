//! Per-container advisory lock.
//!
//! Mode transitions and run setup both rewrite files under `container_dir`,
//! so they hold an exclusive `flock` on `container_dir/.urun.lock`. The
//! descriptor is close-on-exec; the lock ends when the guard drops or the
//! process image is replaced.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use urun_common::constants::LOCK_FILE;
use urun_common::error::{Result, UrunError};

/// Exclusive lock on one container directory.
#[derive(Debug)]
pub struct ContainerLock {
    path: PathBuf,
    _flock: Flock<File>,
}

impl ContainerLock {
    /// Blocks until the lock on `container_dir` is acquired.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened or locked.
    pub fn acquire(container_dir: &Path) -> Result<Self> {
        Self::lock(container_dir, FlockArg::LockExclusive)?.ok_or_else(|| {
            UrunError::PermissionDenied {
                message: format!("could not lock {}", container_dir.display()),
            }
        })
    }

    /// Acquires the lock if no other process holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened.
    pub fn try_acquire(container_dir: &Path) -> Result<Option<Self>> {
        Self::lock(container_dir, FlockArg::LockExclusiveNonblock)
    }

    fn lock(container_dir: &Path, arg: FlockArg) -> Result<Option<Self>> {
        let path = container_dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| UrunError::io(&path, e))?;
        loop {
            match Flock::lock(file, arg) {
                Ok(flock) => {
                    tracing::trace!(path = %path.display(), "container lock acquired");
                    return Ok(Some(Self {
                        path,
                        _flock: flock,
                    }));
                }
                // A signal interrupted the wait.
                Err((retry, Errno::EINTR)) => file = retry,
                Err((_, Errno::EAGAIN)) => return Ok(None),
                Err((_, errno)) => return Err(UrunError::io(&path, std::io::Error::from(errno))),
            }
        }
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ContainerLock {
    fn drop(&mut self) {
        tracing::trace!(path = %self.path.display(), "container lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_is_refused_until_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = ContainerLock::acquire(dir.path()).expect("lock");
        assert!(first.path().ends_with(LOCK_FILE));
        assert!(ContainerLock::try_acquire(dir.path()).expect("try").is_none());
        drop(first);
        assert!(ContainerLock::try_acquire(dir.path()).expect("try").is_some());
    }

    #[test]
    fn blocking_acquire_waits_for_the_holder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = ContainerLock::acquire(dir.path()).expect("lock");
        let path = dir.path().to_path_buf();
        let waiter = std::thread::spawn(move || ContainerLock::acquire(&path).map(|l| l.path().to_path_buf()));
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!waiter.is_finished());
        drop(first);
        let acquired = waiter.join().expect("join").expect("lock after release");
        assert!(acquired.ends_with(LOCK_FILE));
    }

    #[test]
    fn missing_directory_is_an_error() {
        assert!(ContainerLock::acquire(Path::new("/nonexistent/urun/c")).is_err());
    }
}
