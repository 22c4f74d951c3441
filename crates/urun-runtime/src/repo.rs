//! Minimal view of the local container repository.
//!
//! Containers live in `<top_dir>/containers/<id>/` with the filesystem
//! under `ROOT/`. Image pulling and layer extraction happen elsewhere; this
//! module only locates containers and reads or writes JSON documents kept
//! next to them.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use urun_common::config::UrunConfig;
use urun_common::constants::ROOT_DIR;
use urun_common::error::{Result, UrunError};
use urun_common::types::ContainerId;

/// Local container store.
#[derive(Debug, Clone)]
pub struct LocalRepository {
    containers_dir: PathBuf,
}

impl LocalRepository {
    /// Opens the repository described by `config`.
    #[must_use]
    pub fn new(config: &UrunConfig) -> Self {
        Self {
            containers_dir: config.containers_dir(),
        }
    }

    /// Directory holding every container.
    #[must_use]
    pub fn containers_dir(&self) -> &Path {
        &self.containers_dir
    }

    /// Returns the directory of container `id` if it exists.
    #[must_use]
    pub fn cd_container(&self, id: &ContainerId) -> Option<PathBuf> {
        if id.as_str().is_empty() || id.as_str().contains('/') || id.as_str().starts_with('.') {
            return None;
        }
        let dir = self.containers_dir.join(id.as_str());
        dir.is_dir().then_some(dir)
    }

    /// Creates an empty container directory with its `ROOT`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn create_container(&self, id: &ContainerId) -> Result<PathBuf> {
        let dir = self.containers_dir.join(id.as_str());
        let root = dir.join(ROOT_DIR);
        fs::create_dir_all(&root).map_err(|e| UrunError::io(&root, e))?;
        tracing::debug!(container = %id, dir = %dir.display(), "container directory created");
        Ok(dir)
    }

    /// Reads `<container_dir>/<name>` as JSON; `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_json<T: DeserializeOwned>(&self, container_dir: &Path, name: &str) -> Result<Option<T>> {
        let path = container_dir.join(name);
        match fs::read_to_string(&path) {
            Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(UrunError::io(&path, e)),
        }
    }

    /// Writes `value` as pretty JSON to `<container_dir>/<name>`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_json<T: Serialize>(&self, container_dir: &Path, name: &str, value: &T) -> Result<()> {
        let path = container_dir.join(name);
        let data = serde_json::to_string_pretty(value)?;
        fs::write(&path, data).map_err(|e| UrunError::io(&path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_locate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = LocalRepository::new(&UrunConfig::with_top_dir(dir.path()));
        let id = ContainerId::new("c0ffee");
        assert!(repo.cd_container(&id).is_none());
        let created = repo.create_container(&id).expect("create");
        assert_eq!(repo.cd_container(&id), Some(created.clone()));
        assert!(created.join(ROOT_DIR).is_dir());
    }

    #[test]
    fn path_like_ids_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = LocalRepository::new(&UrunConfig::with_top_dir(dir.path()));
        fs::create_dir_all(dir.path().join("containers")).expect("mkdir");
        assert!(repo.cd_container(&ContainerId::new("..")).is_none());
        assert!(repo.cd_container(&ContainerId::new("a/b")).is_none());
        assert!(repo.cd_container(&ContainerId::new("")).is_none());
    }

    #[test]
    fn json_round_trip_and_absence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = LocalRepository::new(&UrunConfig::with_top_dir(dir.path()));
        let missing: Option<serde_json::Value> = repo.load_json(dir.path(), "x.json").expect("load");
        assert!(missing.is_none());
        repo.save_json(dir.path(), "x.json", &serde_json::json!({"a": 1})).expect("save");
        let v: serde_json::Value = repo.load_json(dir.path(), "x.json").expect("load").expect("some");
        assert_eq!(v["a"], 1);
    }
}
