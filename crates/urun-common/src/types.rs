//! Domain primitive types used across the urun workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UrunError};

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the first eight characters, used in prompts and banners.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Isolation strategy persisted per container in `container_dir/execmode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecMode {
    /// ptrace interposition with seccomp acceleration.
    P1,
    /// ptrace interposition without seccomp.
    P2,
    /// `LD_PRELOAD` shim, container loader, `LD_LIBRARY_PATH` honoured.
    F1,
    /// `LD_PRELOAD` shim, container loader, private library path.
    F2,
    /// `LD_PRELOAD` shim, host-pathed binaries, patched loader.
    F3,
    /// `LD_PRELOAD` shim, patched loader and patched binary interpreters.
    F4,
    /// OCI runtime with user namespaces.
    R1,
    /// Reserved alternate engine.
    S1,
}

/// Coarse grouping of execution modes by isolation mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModeFamily {
    /// `P*` modes.
    Ptrace,
    /// `F*` modes.
    Preload,
    /// `R*` modes.
    Namespace,
    /// `S*` modes.
    Reserved,
}

impl ExecMode {
    /// Every mode, in display order.
    pub const ALL: [Self; 8] = [
        Self::P1,
        Self::P2,
        Self::F1,
        Self::F2,
        Self::F3,
        Self::F4,
        Self::R1,
        Self::S1,
    ];

    /// Returns the token written to the `execmode` file.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::F1 => "F1",
            Self::F2 => "F2",
            Self::F3 => "F3",
            Self::F4 => "F4",
            Self::R1 => "R1",
            Self::S1 => "S1",
        }
    }

    /// Returns the isolation family of this mode.
    #[must_use]
    pub const fn family(self) -> ModeFamily {
        match self {
            Self::P1 | Self::P2 => ModeFamily::Ptrace,
            Self::F1 | Self::F2 | Self::F3 | Self::F4 => ModeFamily::Preload,
            Self::R1 => ModeFamily::Namespace,
            Self::S1 => ModeFamily::Reserved,
        }
    }

    /// Whether the container's own loader is executed explicitly.
    #[must_use]
    pub const fn uses_container_loader(self) -> bool {
        matches!(self, Self::F1 | Self::F2)
    }
}

/// Concrete execution engine bound to a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// ptrace interposition through a `proot` binary.
    PRoot,
    /// `LD_PRELOAD` path virtualisation through a fakechroot shim.
    Fakechroot,
    /// OCI runtime through a `runc` binary.
    Runc,
}

impl EngineKind {
    /// Returns the engine for `mode`, or `None` for modes with no engine.
    #[must_use]
    pub const fn for_mode(mode: ExecMode) -> Option<Self> {
        match mode.family() {
            ModeFamily::Ptrace => Some(Self::PRoot),
            ModeFamily::Preload => Some(Self::Fakechroot),
            ModeFamily::Namespace => Some(Self::Runc),
            ModeFamily::Reserved => None,
        }
    }

    /// Short lowercase name used in logs and the banner.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PRoot => "proot",
            Self::Fakechroot => "fakechroot",
            Self::Runc => "runc",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecMode {
    type Err = UrunError;

    fn from_str(s: &str) -> Result<Self> {
        let token = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == token)
            .ok_or_else(|| UrunError::InvalidMode { mode: s.to_string() })
    }
}

/// Host user identity, captured once at process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    /// Real user id.
    pub uid: u32,
    /// Real group id.
    pub gid: u32,
    /// Login name, or the numeric uid if the passwd lookup fails.
    pub username: String,
}

impl HostIdentity {
    /// Captures the identity of the calling process.
    #[must_use]
    pub fn current() -> Self {
        let uid = nix::unistd::getuid();
        let gid = nix::unistd::getgid();
        let username = nix::unistd::User::from_uid(uid)
            .ok()
            .flatten()
            .map_or_else(|| uid.to_string(), |u| u.name);
        Self {
            uid: uid.as_raw(),
            gid: gid.as_raw(),
            username,
        }
    }

    /// Whether the process runs as uid 0.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// A `host:container[:mode]` volume specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Path on the host.
    pub host: String,
    /// Path as seen inside the container.
    pub container: String,
    /// Optional mode suffix, `ro` or `rw`.
    pub mode: Option<String>,
}

impl Volume {
    /// Whether the volume was requested read-only.
    #[must_use]
    pub fn read_only(&self) -> bool {
        self.mode.as_deref() == Some("ro")
    }

    /// Whether host and container paths are identical.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.host == self.container
    }
}

impl FromStr for Volume {
    type Err = UrunError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || UrunError::Config {
            message: format!("invalid volume specification: {s:?}"),
        };
        let parts: Vec<&str> = s.split(':').collect();
        let (host, container, mode) = match parts.as_slice() {
            [host] => (*host, *host, None),
            [host, m] if matches!(*m, "ro" | "rw") => (*host, *host, Some(*m)),
            [host, cont] => (*host, *cont, None),
            [host, cont, m] if matches!(*m, "ro" | "rw") => (*host, *cont, Some(*m)),
            _ => return Err(invalid()),
        };
        if !host.starts_with('/') || !container.starts_with('/') {
            return Err(invalid());
        }
        Ok(Self {
            host: normalize_slashes(host),
            container: normalize_slashes(container),
            mode: mode.map(str::to_string),
        })
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)?;
        if let Some(mode) = &self.mode {
            write!(f, ":{mode}")?;
        }
        Ok(())
    }
}

/// Collapses repeated slashes and strips a trailing slash.
fn normalize_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// A `--user` request: `name`, `uid`, `uid:gid` or `name:group`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSpec {
    /// User name or numeric uid.
    pub user: String,
    /// Optional group name or numeric gid.
    pub group: Option<String>,
}

impl UserSpec {
    /// Parses a user request. An empty string yields an empty spec.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.split_once(':') {
            Some((user, group)) => Self {
                user: user.to_string(),
                group: (!group.is_empty()).then(|| group.to_string()),
            },
            None => Self {
                user: s.to_string(),
                group: None,
            },
        }
    }

    /// Whether no user was requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.user.is_empty()
    }

    /// Returns the uid when the user part is numeric.
    #[must_use]
    pub fn numeric_uid(&self) -> Option<u32> {
        self.user.parse().ok()
    }

    /// Returns the gid when the group part is numeric.
    #[must_use]
    pub fn numeric_gid(&self) -> Option<u32> {
        self.group.as_deref().and_then(|g| g.parse().ok())
    }
}
