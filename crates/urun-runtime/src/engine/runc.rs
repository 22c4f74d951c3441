//! OCI runtime engine: user namespaces through a `runc` compatible binary.
//!
//! The bundle is the container directory itself, with `config.json` kept
//! next to `ROOT`. Every run rewrites the process section, the uid/gid
//! mappings when none exist yet, and the mounts this engine added before.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value, json};
use urun_common::constants::{BIND_HOST_DIR, OCI_SPEC_FILE};
use urun_common::error::{Result, UrunError};
use urun_common::types::{ContainerId, EngineKind, ExecMode};
use urun_core::filebind::FileBind;
use urun_core::{host, process};

use super::common::cpu_affinity_prefix;
use super::{EngineError, ExecutionEngine};
use crate::base::{self, PreparedContainer};
use crate::context::RunContext;
use crate::launch::Invocation;
use crate::options::RunOptions;

/// Annotation listing the mount destinations added by this engine.
pub const VOLUMES_ANNOTATION: &str = "urun.volumes";

const MOUNT_OPTIONS: [&str; 4] = ["rbind", "nosuid", "noexec", "nodev"];

static ENV_NAME: OnceLock<Regex> = OnceLock::new();

fn env_name() -> &'static Regex {
    #[allow(clippy::expect_used)]
    ENV_NAME.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").expect("valid env name pattern"))
}

type EngineResult<T> = std::result::Result<T, EngineError>;

/// Checks every `NAME=VALUE` entry and returns them for the OCI process section.
///
/// # Errors
///
/// Fails with the OCI spec status on the first entry with an invalid name.
pub fn validate_env(entries: &[String]) -> EngineResult<Vec<String>> {
    for entry in entries {
        if !env_name().is_match(entry) {
            return Err(EngineError::spec(format!("invalid environment variable: {entry:?}")));
        }
    }
    Ok(entries.to_vec())
}

fn object_mut<'a>(parent: &'a mut Map<String, Value>, key: &str) -> EngineResult<&'a mut Map<String, Value>> {
    let entry = parent.entry(key).or_insert_with(|| json!({}));
    if !entry.is_object() {
        *entry = json!({});
    }
    entry
        .as_object_mut()
        .ok_or_else(|| EngineError::spec(format!("OCI spec field {key} is not an object")))
}

/// Whether `id` falls inside one of the `{containerID, hostID, size}`
/// ranges of `mappings`.
fn is_mapped(mappings: Option<&Value>, id: u32) -> bool {
    let id = u64::from(id);
    mappings.and_then(Value::as_array).is_some_and(|ranges| {
        ranges.iter().any(|r| {
            let start = r["containerID"].as_u64().unwrap_or(u64::MAX);
            let size = r["size"].as_u64().unwrap_or(0);
            id >= start && id - start < size
        })
    })
}

fn mapping_absent(mappings: Option<&Value>) -> bool {
    mappings.and_then(Value::as_array).is_none_or(Vec::is_empty)
}

/// Engine for the `R1` mode.
#[derive(Debug)]
pub struct RuncEngine {
    ctx: RunContext,
    mode: ExecMode,
}

impl RuncEngine {
    /// Creates the engine.
    #[must_use]
    pub const fn new(ctx: RunContext, mode: ExecMode) -> Self {
        Self { ctx, mode }
    }

    /// Locates the runc binary.
    ///
    /// # Errors
    ///
    /// Returns [`urun_common::error::UrunError::ToolMissing`] if none exists.
    pub fn select_runc(&self) -> Result<PathBuf> {
        let config = &self.ctx.config;
        let names = vec![
            format!("runc-{}", host::tool_arch_suffix()),
            "runc".to_string(),
        ];
        host::locate_tool("runc", config.runc_path.as_deref(), &config.bin_dir(), &names)
    }

    /// Loads the bundle spec, generating a rootless one first if needed.
    fn load_spec(&self, runc: &Path, container_dir: &Path) -> EngineResult<Value> {
        if !container_dir.join(OCI_SPEC_FILE).exists() {
            let argv = vec![
                runc.display().to_string(),
                "spec".into(),
                "--rootless".into(),
                "--bundle".into(),
                container_dir.display().to_string(),
            ];
            process::capture_output(&argv, self.ctx.config.tool_timeout())
                .map_err(|e| EngineError::spec(format!("cannot create OCI spec: {e}")))?;
            tracing::info!(dir = %container_dir.display(), "OCI spec created");
        }
        self.ctx
            .repo
            .load_json::<Value>(container_dir, OCI_SPEC_FILE)
            .map_err(|e| EngineError::spec(format!("cannot load OCI spec: {e}")))?
            .filter(Value::is_object)
            .ok_or_else(|| EngineError::spec("OCI spec is missing or not an object"))
    }

    fn set_process(&self, spec: &mut Map<String, Value>, prepared: &PreparedContainer) -> EngineResult<()> {
        let env = validate_env(prepared.env.entries())?;
        let root = object_mut(spec, "root")?;
        let _ = root.insert("path".into(), json!(prepared.root_str()));
        let _ = root.insert("readonly".into(), json!(false));
        if let Some(hostname) = &prepared.hostname {
            let _ = spec.insert("hostname".into(), json!(hostname));
        }

        let identity = &self.ctx.identity;
        let linux = object_mut(spec, "linux")?;
        for (key, host_id) in [("uidMappings", identity.uid), ("gidMappings", identity.gid)] {
            if mapping_absent(linux.get(key)) {
                let _ = linux.insert(
                    key.into(),
                    json!([{"containerID": 0, "hostID": host_id, "size": 1}]),
                );
            }
        }
        let (mut uid, mut gid) = (prepared.user.uid, prepared.user.gid);
        if !is_mapped(linux.get("uidMappings"), uid) || !is_mapped(linux.get("gidMappings"), gid) {
            tracing::warn!(uid, gid, "user is not mapped in the namespace, running as root");
            (uid, gid) = (0, 0);
        }

        let process = object_mut(spec, "process")?;
        let _ = process.insert("cwd".into(), json!(prepared.cwd));
        let _ = process.insert("env".into(), json!(env));
        let _ = process.insert("args".into(), json!(prepared.argv));
        let _ = process.insert("terminal".into(), json!(std::io::stdin().is_terminal()));
        let _ = process.insert("user".into(), json!({"uid": uid, "gid": gid}));
        Ok(())
    }

    fn set_mounts(&self, spec: &mut Map<String, Value>, prepared: &PreparedContainer) -> EngineResult<()> {
        let previous: Vec<String> = spec
            .get("annotations")
            .and_then(|a| a.get(VOLUMES_ANNOTATION))
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();
        let mut mounts: Vec<Value> = spec
            .get("mounts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        mounts.retain(|m| {
            m["destination"]
                .as_str()
                .is_none_or(|d| !previous.iter().any(|p| p == d))
        });

        let filebind = FileBind::new(&prepared.container_dir);
        filebind.start(&self.ctx.config.sysdirs)?;
        let mut added = vec![BIND_HOST_DIR.to_string()];
        mounts.push(mount_entry(&filebind.host_dir().display().to_string(), BIND_HOST_DIR, false));

        for volume in &prepared.volumes {
            if volume.container == "/dev" {
                tracing::warn!("/dev cannot be bound as a volume, skipping it");
                continue;
            }
            let host_path = Path::new(&volume.host);
            if host_path.is_dir() {
                let mount_point = prepared
                    .container_root
                    .join(volume.container.trim_start_matches('/'));
                if !mount_point.exists() {
                    std::fs::create_dir_all(&mount_point).map_err(|e| {
                        EngineError::spec(format!("cannot create {}: {e}", mount_point.display()))
                    })?;
                }
                mounts.push(mount_entry(&volume.host, &volume.container, volume.read_only()));
                added.push(volume.container.clone());
            } else if host_path.is_file() {
                if !self.ctx.config.sysdirs.contains(&volume.container) {
                    return Err(EngineError::spec(format!(
                        "file volumes are limited to system files: {volume}"
                    )));
                }
                filebind.add(host_path, &volume.container)?;
            } else {
                return Err(EngineError::spec(format!("volume host path does not exist: {volume}")));
            }
        }

        let added = serde_json::to_string(&added).map_err(UrunError::from)?;
        let _ = spec.insert("mounts".into(), Value::Array(mounts));
        let annotations = object_mut(spec, "annotations")?;
        let _ = annotations.insert(VOLUMES_ANNOTATION.into(), json!(added));
        Ok(())
    }
}

fn mount_entry(source: &str, destination: &str, read_only: bool) -> Value {
    let mut options: Vec<&str> = MOUNT_OPTIONS.to_vec();
    options.push(if read_only { "ro" } else { "rw" });
    json!({
        "destination": destination,
        "type": "none",
        "source": source,
        "options": options,
    })
}

impl ExecutionEngine for RuncEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Runc
    }

    fn mode(&self) -> ExecMode {
        self.mode
    }

    fn context(&self) -> &RunContext {
        &self.ctx
    }

    fn prepare(&self, id: &ContainerId, opts: RunOptions) -> EngineResult<Invocation> {
        let prepared = base::prepare(&self.ctx, id, opts)?;
        let runc = self.select_runc()?;
        let mut spec = self.load_spec(&runc, &prepared.container_dir)?;
        let Some(map) = spec.as_object_mut() else {
            return Err(EngineError::spec("OCI spec is not an object"));
        };
        self.set_process(map, &prepared)?;
        self.set_mounts(map, &prepared)?;
        self.ctx
            .repo
            .save_json(&prepared.container_dir, OCI_SPEC_FILE, &spec)
            .map_err(|e| EngineError::spec(format!("cannot save OCI spec: {e}")))?;

        let dir = prepared.container_dir.display().to_string();
        let mut argv = cpu_affinity_prefix(&self.ctx.config, prepared.opts.cpuset.as_deref());
        argv.extend([
            runc.display().to_string(),
            "--root".into(),
            dir.clone(),
            "run".into(),
            "--bundle".into(),
            dir,
            prepared.execid.clone(),
        ]);

        tracing::info!(container = %id, mode = %self.mode, "running under runc");
        Ok(Invocation {
            argv,
            env: prepared.env.pairs(),
            cwd: Some(prepared.container_dir.clone()),
            command_name: prepared.command_name(),
            execid: prepared.execid.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::STATUS_SPEC_FAILED;

    #[test]
    fn env_names_are_checked() {
        let ok = vec!["PATH=/bin".to_string(), "_X1=".to_string()];
        assert_eq!(validate_env(&ok).unwrap(), ok);
        for bad in ["1X=a", "A-B=c", "NOVALUE", "=x"] {
            let result = validate_env(&[bad.to_string()]);
            assert!(
                matches!(result, Err(EngineError::Setup { status: STATUS_SPEC_FAILED, .. })),
                "{bad} accepted"
            );
        }
    }

    #[test]
    fn mapping_ranges() {
        let m = json!([{"containerID": 0, "hostID": 1000, "size": 1}]);
        assert!(is_mapped(Some(&m), 0));
        assert!(!is_mapped(Some(&m), 1000));
        assert!(!is_mapped(None, 0));
        assert!(mapping_absent(None));
        assert!(mapping_absent(Some(&json!([]))));
        assert!(!mapping_absent(Some(&m)));
    }

    #[test]
    fn mount_options() {
        let m = mount_entry("/srv", "/data", true);
        assert_eq!(m["options"], json!(["rbind", "nosuid", "noexec", "nodev", "ro"]));
        assert_eq!(m["type"], "none");
    }
}
