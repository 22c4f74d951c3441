//! Engine-independent run options.

/// Ordered list of `NAME=VALUE` environment entries.
///
/// Entries are kept verbatim so that malformed ones can be reported by the
/// engines that reject them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvList(Vec<String>);

impl EnvList {
    /// Creates an empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends a raw entry.
    pub fn push(&mut self, entry: impl Into<String>) {
        self.0.push(entry.into());
    }

    /// Sets `name`, replacing any existing entry for it.
    pub fn set(&mut self, name: &str, value: &str) {
        self.0.retain(|e| entry_name(e) != Some(name));
        self.0.push(format!("{name}={value}"));
    }

    /// Sets `name` only if it is not present yet.
    pub fn set_if_absent(&mut self, name: &str, value: &str) {
        if self.get(name).is_none() {
            self.0.push(format!("{name}={value}"));
        }
    }

    /// Value of the last entry for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|e| entry_name(e) == Some(name))
            .and_then(|e| e.split_once('=').map(|(_, v)| v))
    }

    /// Removes every entry for `name`.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|e| entry_name(e) != Some(name));
    }

    /// Raw entries in order.
    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.0
    }

    /// `(name, value)` pairs, last entry winning; entries without `=` or
    /// with an empty name are dropped.
    #[must_use]
    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Vec::new();
        for entry in &self.0 {
            let Some((name, value)) = entry.split_once('=').filter(|(n, _)| !n.is_empty()) else {
                tracing::warn!(entry = %entry, "ignoring malformed environment entry");
                continue;
            };
            out.retain(|(n, _)| n != name);
            out.push((name.to_string(), value.to_string()));
        }
        out
    }
}

impl<S: Into<String>> FromIterator<S> for EnvList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<String>> Extend<S> for EnvList {
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        self.0.extend(iter.into_iter().map(Into::into));
    }
}

fn entry_name(entry: &str) -> Option<&str> {
    entry.split_once('=').map(|(n, _)| n)
}

/// Options of one container run, as given by the caller.
///
/// Empty strings and lists mean "not requested"; image defaults from
/// `container.json` fill them in during common initialization.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// `host:container[:ro|rw]` volume specs, in order.
    pub vol: Vec<String>,
    /// Extra `NAME=VALUE` environment entries.
    pub env: EnvList,
    /// Requested user (`name`, `uid`, `uid:gid`, `name:group`).
    pub user: String,
    /// Working directory inside the container.
    pub cwd: String,
    /// Command and arguments.
    pub cmd: Vec<String>,
    /// Entrypoint override; `Some(vec![])` clears the image entrypoint.
    pub entryp: Option<Vec<String>>,
    /// Resolve users against the host's passwd/group and bind them.
    pub hostauth: bool,
    /// Keep the whole host environment.
    pub hostenv: bool,
    /// `host:container` port mappings.
    pub portsmap: Vec<String>,
    /// Ask the engine to share the host network cooperatively.
    pub netcoop: bool,
    /// CPU set for the affinity wrapper.
    pub cpuset: Option<String>,
    /// Hostname inside the container.
    pub hostname: Option<String>,
}
