//! Common initialization shared by every engine.
//!
//! Resolves the container, its user, working directory, command and
//! environment. Engines build their command line from the
//! [`PreparedContainer`] this produces.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use urun_common::constants::{CONTAINER_JSON_FILE, ROOT_DIR};
use urun_common::error::UrunError;
use urun_common::types::{ContainerId, UserSpec, Volume};
use urun_core::filebind::FileBind;
use urun_core::lock::ContainerLock;
use urun_core::nixauth::{GroupEntry, NixAuthentication, PasswdEntry};

use crate::context::RunContext;
use crate::engine::EngineError;
use crate::metadata::{ContainerMetadata, ImageConfig};
use crate::options::{EnvList, RunOptions};
use crate::volumes::{is_volume, parse_volumes, resolve};

type Result<T> = std::result::Result<T, EngineError>;

/// A container ready to be launched by an engine.
///
/// Holds the container lock until dropped.
#[derive(Debug)]
pub struct PreparedContainer {
    /// Container id.
    pub id: ContainerId,
    /// Canonical container directory.
    pub container_dir: PathBuf,
    /// Canonical container root.
    pub container_root: PathBuf,
    /// Fresh id of this run.
    pub execid: String,
    /// User the process runs as.
    pub user: PasswdEntry,
    /// Working directory, as a container path.
    pub cwd: String,
    /// Command line; `argv[0]` is the container path of the executable.
    pub argv: Vec<String>,
    /// Host path of `argv[0]`.
    pub exec_path: PathBuf,
    /// Assembled environment.
    pub env: EnvList,
    /// Volumes, including any added for user setup.
    pub volumes: Vec<Volume>,
    /// Requested hostname.
    pub hostname: Option<String>,
    /// Options as given, for engine-specific settings.
    pub opts: RunOptions,
    _lock: ContainerLock,
}

impl PreparedContainer {
    /// Container root as a string.
    #[must_use]
    pub fn root_str(&self) -> String {
        self.container_root.display().to_string()
    }

    /// Name of the command being run.
    #[must_use]
    pub fn command_name(&self) -> String {
        self.argv.join(" ")
    }
}

/// Runs common initialization for container `id`.
///
/// # Errors
///
/// Every failure is reported as [`EngineError::Setup`] with status 2,
/// before anything is spawned.
pub fn prepare(ctx: &RunContext, id: &ContainerId, opts: RunOptions) -> Result<PreparedContainer> {
    let Some(container_dir) = ctx.repo.cd_container(id) else {
        return Err(EngineError::setup(format!("container not found: {id}")));
    };
    let lock = ContainerLock::acquire(&container_dir)?;
    let container_dir = canonical(container_dir)?;
    let root_dir = container_dir.join(ROOT_DIR);
    if !root_dir.is_dir() {
        return Err(EngineError::setup(format!("container {id} has no root filesystem")));
    }
    let container_root = canonical(root_dir)?;

    let metadata: ContainerMetadata = ctx
        .repo
        .load_json(&container_dir, CONTAINER_JSON_FILE)?
        .unwrap_or_default();
    let image = metadata.image_config();
    let execid = uuid::Uuid::new_v4().to_string();
    let mut volumes = parse_volumes(&opts.vol)?;

    let requested_user = if opts.user.is_empty() {
        image.user.clone().unwrap_or_default()
    } else {
        opts.user.clone()
    };
    let user = setup_user(
        ctx,
        &container_dir,
        &container_root,
        &requested_user,
        opts.hostauth,
        &execid,
        &mut volumes,
    )?;

    let mut env = base_env(ctx, &opts, &image);
    for (name, value) in [
        ("HOME", user.home.as_str()),
        ("USER", user.name.as_str()),
        ("LOGNAME", user.name.as_str()),
        ("USERNAME", user.name.as_str()),
    ] {
        env.set(name, value);
    }
    for entry in opts.env.entries() {
        match entry.split_once('=') {
            Some((name, value)) if !name.is_empty() => env.set(name, value),
            _ => env.push(entry.clone()),
        }
    }
    let path = if user.uid == 0 {
        &ctx.config.root_path
    } else {
        &ctx.config.user_path
    };
    env.set_if_absent("PATH", path);
    env.set("PS1", &format!("{}@{}:\\w$ ", user.name, id.short()));
    env.set("SHLVL", "0");
    env.set("container_ruser", &ctx.identity.username);
    env.set("container_root", &container_root.display().to_string());
    env.set("container_uuid", id.as_str());
    env.set("container_execid", &execid);

    let cwd = select_cwd(&opts, &image, &user, &volumes, &container_root)?;
    let mut argv = select_argv(&opts, &image, &ctx.config.default_cmd);
    let Some(name) = argv.first().cloned() else {
        return Err(EngineError::setup("no command to execute"));
    };
    let search_path = env.get("PATH").unwrap_or_default().to_string();
    let Some((cont_exec, exec_path)) =
        find_executable(&name, &cwd, &search_path, &volumes, &container_root)
    else {
        return Err(EngineError::setup(format!(
            "command not found or not executable in container: {name}"
        )));
    };
    argv[0] = cont_exec;

    let hostname = opts
        .hostname
        .clone()
        .or_else(|| image.hostname.clone())
        .filter(|h| !h.is_empty());

    tracing::debug!(container = %id, user = %user.name, cwd = %cwd, ?argv, "container prepared");
    Ok(PreparedContainer {
        id: id.clone(),
        container_dir,
        container_root,
        execid,
        user,
        cwd,
        argv,
        exec_path,
        env,
        volumes,
        hostname,
        opts,
        _lock: lock,
    })
}

fn canonical(path: PathBuf) -> Result<PathBuf> {
    fs::canonicalize(&path).map_err(|e| UrunError::io(&path, e).into())
}

/// Host environment reduced to the allow-list, then the image `Env`.
fn base_env(ctx: &RunContext, opts: &RunOptions, image: &ImageConfig) -> EnvList {
    let mut env = EnvList::new();
    for (name, value) in std::env::vars() {
        if opts.hostenv || ctx.config.valid_host_env.contains(&name) {
            env.set(&name, &value);
        }
    }
    for entry in image.env.iter().flatten() {
        if let Some((name, value)) = entry.split_once('=') {
            env.set(name, value);
        }
    }
    env
}

/// Account databases of the container. Files redirected by a previous
/// runc run are read from their staged copies.
fn container_auth(container_dir: &Path, container_root: &Path) -> NixAuthentication {
    let filebind = FileBind::new(container_dir);
    let pick = |file: &str| {
        filebind
            .get_path(file)
            .unwrap_or_else(|| container_root.join(file.trim_start_matches('/')))
    };
    NixAuthentication::with_files(pick("/etc/passwd"), pick("/etc/group"))
}

/// Resolves the container user, creating synthetic passwd/group entries
/// when the container does not know it.
fn setup_user(
    ctx: &RunContext,
    container_dir: &Path,
    container_root: &Path,
    requested: &str,
    hostauth: bool,
    execid: &str,
    volumes: &mut Vec<Volume>,
) -> Result<PasswdEntry> {
    let spec = UserSpec::parse(requested);
    let identity = &ctx.identity;
    let container_auth = container_auth(container_dir, container_root);
    let auth = if hostauth {
        NixAuthentication::host()
    } else {
        container_auth.clone()
    };
    let wanted = if spec.is_empty() {
        identity.uid.to_string()
    } else {
        spec.user.clone()
    };

    let mut synthetic = false;
    let mut user = match auth.get_user(&wanted)? {
        Some(entry) => entry,
        None => {
            synthetic = !hostauth;
            let from_host = if hostauth {
                None
            } else {
                NixAuthentication::host().get_user(&wanted)?
            };
            match (from_host, wanted.parse::<u32>()) {
                (Some(entry), _) => entry,
                (None, Ok(uid)) => {
                    let (name, gid) = if uid == identity.uid {
                        (identity.username.clone(), identity.gid)
                    } else {
                        (wanted.clone(), uid)
                    };
                    PasswdEntry {
                        name,
                        uid,
                        gid,
                        gecos: String::new(),
                        home: "/".into(),
                        shell: "/bin/sh".into(),
                    }
                }
                (None, Err(_)) => return Err(EngineError::setup(format!("invalid user: {wanted}"))),
            }
        }
    };

    if let Some(group) = &spec.group {
        user.gid = match group.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => auth
                .get_group(group)?
                .map(|g| g.gid)
                .ok_or_else(|| EngineError::setup(format!("invalid group: {group}")))?,
        };
    }

    if hostauth {
        for file in ["/etc/passwd", "/etc/group"] {
            if !is_volume(file, volumes) {
                volumes.push(Volume {
                    host: file.into(),
                    container: file.into(),
                    mode: None,
                });
            }
        }
        return Ok(user);
    }

    let missing_group = auth.get_group(&user.gid.to_string())?.is_none();
    if synthetic || missing_group {
        let tmp = &ctx.config.tmp_dir;
        fs::create_dir_all(tmp).map_err(|e| UrunError::io(tmp, e))?;
        let passwd = tmp.join(format!("urun-{execid}.passwd"));
        let group = tmp.join(format!("urun-{execid}.group"));
        let copy = container_auth.copy_to(&passwd, &group)?;
        if synthetic {
            copy.add_user(&user)?;
        }
        if missing_group {
            copy.add_group(&GroupEntry {
                name: user.name.clone(),
                gid: user.gid,
                members: Vec::new(),
            })?;
        }
        tracing::info!(user = %user.name, uid = user.uid, gid = user.gid, "synthetic user entry created");
        for (host, cont) in [(passwd, "/etc/passwd"), (group, "/etc/group")] {
            volumes.retain(|v| v.container != cont);
            volumes.push(Volume {
                host: host.display().to_string(),
                container: cont.into(),
                mode: None,
            });
        }
    }
    Ok(user)
}

fn select_cwd(
    opts: &RunOptions,
    image: &ImageConfig,
    user: &PasswdEntry,
    volumes: &[Volume],
    container_root: &Path,
) -> Result<String> {
    let explicit = if opts.cwd.is_empty() {
        image.working_dir.clone().filter(|w| !w.is_empty())
    } else {
        Some(opts.cwd.clone())
    };
    match explicit {
        Some(cwd) => {
            if !cwd.starts_with('/') || !resolve(&cwd, volumes, container_root).is_dir() {
                return Err(EngineError::setup(format!("invalid working directory: {cwd}")));
            }
            Ok(cwd)
        }
        None if resolve(&user.home, volumes, container_root).is_dir() => Ok(user.home.clone()),
        None => Ok("/".into()),
    }
}

/// Entrypoint followed by command; image values apply unless overridden.
fn select_argv(opts: &RunOptions, image: &ImageConfig, default_cmd: &[String]) -> Vec<String> {
    let mut argv = opts
        .entryp
        .clone()
        .unwrap_or_else(|| image.entrypoint.clone().unwrap_or_default());
    if !opts.cmd.is_empty() {
        argv.extend(opts.cmd.iter().cloned());
    } else if opts.entryp.is_none() {
        argv.extend(image.cmd.iter().flatten().cloned());
    }
    if argv.is_empty() {
        argv = default_cmd.to_vec();
    }
    argv
}

/// Finds `name` inside the container: directly when it has a `/`, else
/// through `search_path`. Returns the container and host paths.
fn find_executable(
    name: &str,
    cwd: &str,
    search_path: &str,
    volumes: &[Volume],
    container_root: &Path,
) -> Option<(String, PathBuf)> {
    let candidates: Vec<String> = if name.starts_with('/') {
        vec![name.to_string()]
    } else if name.contains('/') {
        vec![format!("{}/{name}", cwd.trim_end_matches('/'))]
    } else {
        search_path
            .split(':')
            .filter(|d| d.starts_with('/'))
            .map(|d| format!("{}/{name}", d.trim_end_matches('/')))
            .collect()
    };
    candidates.into_iter().find_map(|cont| {
        let host = resolve(&cont, volumes, container_root);
        let executable = host
            .metadata()
            .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0);
        executable.then_some((cont, host))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(entry: Option<&[&str]>, cmd: Option<&[&str]>) -> ImageConfig {
        let owned = |v: &[&str]| v.iter().map(|s| (*s).to_string()).collect::<Vec<_>>();
        ImageConfig {
            entrypoint: entry.map(owned),
            cmd: cmd.map(owned),
            ..ImageConfig::default()
        }
    }

    #[test]
    fn argv_prefers_options_over_image() {
        let default_cmd = vec!["/bin/bash".to_string()];
        let img = image(Some(&["/entry"]), Some(&["serve"]));
        let opts = RunOptions::default();
        assert_eq!(select_argv(&opts, &img, &default_cmd), ["/entry", "serve"]);

        let opts = RunOptions {
            cmd: vec!["shell".into()],
            ..RunOptions::default()
        };
        assert_eq!(select_argv(&opts, &img, &default_cmd), ["/entry", "shell"]);

        let opts = RunOptions {
            entryp: Some(Vec::new()),
            ..RunOptions::default()
        };
        assert_eq!(select_argv(&opts, &img, &default_cmd), ["/bin/bash"]);
    }

    #[test]
    fn executable_found_through_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        fs::create_dir_all(root.join("usr/bin")).expect("mkdir");
        fs::write(root.join("usr/bin/tool"), "#!/bin/sh\n").expect("write");
        fs::set_permissions(root.join("usr/bin/tool"), fs::Permissions::from_mode(0o755)).expect("chmod");
        fs::write(root.join("usr/bin/data"), "x").expect("write");

        let (cont, host) = find_executable("tool", "/", "/bin:/usr/bin", &[], root).expect("found");
        assert_eq!(cont, "/usr/bin/tool");
        assert_eq!(host, root.join("usr/bin/tool"));
        assert!(find_executable("data", "/", "/usr/bin", &[], root).is_none());
        assert!(find_executable("missing", "/", "/usr/bin", &[], root).is_none());
    }

    #[test]
    fn cwd_falls_back_to_root_when_home_is_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let user = PasswdEntry {
            name: "u".into(),
            uid: 1000,
            gid: 1000,
            gecos: String::new(),
            home: "/home/u".into(),
            shell: "/bin/sh".into(),
        };
        let cwd = select_cwd(&RunOptions::default(), &ImageConfig::default(), &user, &[], dir.path());
        assert_eq!(cwd.expect("cwd"), "/");

        let opts = RunOptions {
            cwd: "/nope".into(),
            ..RunOptions::default()
        };
        assert!(select_cwd(&opts, &ImageConfig::default(), &user, &[], dir.path()).is_err());
    }
}
