//! Batch walker: run an external command on every matching file of a tree.
//!
//! Candidates are regular files (symlinks are never followed nor visited)
//! owned by a given uid that are either executable or named like a shared
//! library. The command template carries a placeholder that is replaced by
//! each candidate path. How the walk ends is decided by a [`WalkPolicy`].

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use urun_common::constants::PATH_PLACEHOLDER;
use walkdir::WalkDir;

use crate::process;

static SHARED_LIB: OnceLock<Regex> = OnceLock::new();

/// Which files of the tree are candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Files with any execute bit set.
    Binaries,
    /// Files named `lib*.so` or `lib*.so.N[.M...]`.
    Libraries,
    /// Either of the above.
    Both,
}

/// When the walk stops and what it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkPolicy {
    /// Visit everything; return the output of the last invocation.
    Exhaustive,
    /// Return `""` as soon as an invocation fails or prints nothing.
    AbortOnError,
    /// Return the output of the first invocation that succeeds.
    FirstSuccess,
    /// Return the first non-empty output.
    FirstNonEmptyOutput,
}

/// A selection plus a stopping policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkAction {
    /// Candidate filter.
    pub selection: Selection,
    /// Early-exit policy.
    pub policy: WalkPolicy,
}

impl WalkAction {
    /// Builds an action.
    #[must_use]
    pub const fn new(selection: Selection, policy: WalkPolicy) -> Self {
        Self { selection, policy }
    }
}

/// Returns whether `name` looks like a versioned or plain shared library.
#[must_use]
pub fn is_shared_library_name(name: &str) -> bool {
    #[allow(clippy::expect_used)]
    SHARED_LIB
        .get_or_init(|| Regex::new(r"^lib\S+\.so(\.\d+)*$").expect("valid library pattern"))
        .is_match(name)
}

/// Walks trees on behalf of one host user.
#[derive(Debug, Clone)]
pub struct BatchWalker {
    uid: u32,
    timeout: Duration,
}

impl BatchWalker {
    /// Creates a walker for files owned by `uid`; each invocation is
    /// bounded by `timeout`.
    #[must_use]
    pub const fn new(uid: u32, timeout: Duration) -> Self {
        Self { uid, timeout }
    }

    /// Lists candidate files under `root` in traversal order.
    ///
    /// Unreadable directories are skipped; a missing root yields nothing.
    #[must_use]
    pub fn candidates(&self, root: &Path, selection: Selection) -> Vec<PathBuf> {
        WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(err) => {
                    tracing::debug!(error = %err, "skipping unreadable entry");
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.metadata().is_ok_and(|m| {
                    m.uid() == self.uid && selected(e.file_name().to_str(), m.mode(), selection)
                })
            })
            .map(walkdir::DirEntry::into_path)
            .collect()
    }

    /// Runs `template` once per candidate under `root`, substituting the
    /// placeholder with the candidate path, and applies the action policy.
    ///
    /// A failed, timed-out or unspawnable invocation counts as "no output".
    #[must_use]
    pub fn run(&self, template: &[String], root: &Path, action: WalkAction) -> String {
        let mut last = String::new();
        for file in self.candidates(root, action.selection) {
            let argv = substitute(template, &file);
            let output = match process::capture_output(&argv, self.timeout) {
                Ok(out) => Some(out),
                Err(err) => {
                    tracing::debug!(file = %file.display(), error = %err, "walker invocation failed");
                    None
                }
            };
            match action.policy {
                WalkPolicy::AbortOnError => match output {
                    Some(out) if !out.is_empty() => last = out,
                    _ => {
                        tracing::debug!(file = %file.display(), "walk aborted");
                        return String::new();
                    }
                },
                WalkPolicy::FirstSuccess => {
                    if let Some(out) = output {
                        return out;
                    }
                }
                WalkPolicy::FirstNonEmptyOutput => match output {
                    Some(out) if !out.is_empty() => return out,
                    _ => {}
                },
                WalkPolicy::Exhaustive => last = output.unwrap_or_default(),
            }
        }
        last
    }
}

fn selected(name: Option<&str>, mode: u32, selection: Selection) -> bool {
    let exec = mode & 0o111 != 0;
    let lib = name.is_some_and(is_shared_library_name);
    match selection {
        Selection::Binaries => exec,
        Selection::Libraries => lib,
        Selection::Both => exec || lib,
    }
}

fn substitute(template: &[String], file: &Path) -> Vec<String> {
    let path = file.display().to_string();
    template
        .iter()
        .map(|arg| arg.replace(PATH_PLACEHOLDER, &path))
        .collect()
}
