//! `/etc/passwd` and `/etc/group` lookups and synthetic entries.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use urun_common::error::{Result, UrunError};

/// One `/etc/passwd` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    /// Login name.
    pub name: String,
    /// Numeric user id.
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
    /// Comment field.
    pub gecos: String,
    /// Home directory.
    pub home: String,
    /// Login shell.
    pub shell: String,
}

impl PasswdEntry {
    fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 7 {
            return None;
        }
        Some(Self {
            name: fields[0].to_string(),
            uid: fields[2].parse().ok()?,
            gid: fields[3].parse().ok()?,
            gecos: fields[4].to_string(),
            home: fields[5].to_string(),
            shell: fields[6].to_string(),
        })
    }
}

impl fmt::Display for PasswdEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:x:{}:{}:{}:{}:{}",
            self.name, self.uid, self.gid, self.gecos, self.home, self.shell
        )
    }
}

/// One `/etc/group` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    /// Group name.
    pub name: String,
    /// Numeric group id.
    pub gid: u32,
    /// Supplementary members.
    pub members: Vec<String>,
}

impl GroupEntry {
    fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 4 {
            return None;
        }
        Some(Self {
            name: fields[0].to_string(),
            gid: fields[2].parse().ok()?,
            members: fields[3]
                .split(',')
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }
}

impl fmt::Display for GroupEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:x:{}:{}", self.name, self.gid, self.members.join(","))
    }
}

/// A pair of passwd/group files to query and extend.
#[derive(Debug, Clone)]
pub struct NixAuthentication {
    passwd_file: PathBuf,
    group_file: PathBuf,
}

impl NixAuthentication {
    /// Uses explicit files.
    #[must_use]
    pub fn with_files(passwd_file: impl Into<PathBuf>, group_file: impl Into<PathBuf>) -> Self {
        Self {
            passwd_file: passwd_file.into(),
            group_file: group_file.into(),
        }
    }

    /// Uses `<root>/etc/passwd` and `<root>/etc/group`.
    #[must_use]
    pub fn for_root(root: &Path) -> Self {
        Self::with_files(root.join("etc/passwd"), root.join("etc/group"))
    }

    /// Uses the host's own files.
    #[must_use]
    pub fn host() -> Self {
        Self::with_files("/etc/passwd", "/etc/group")
    }

    /// Passwd file in use.
    #[must_use]
    pub fn passwd_file(&self) -> &Path {
        &self.passwd_file
    }

    /// Group file in use.
    #[must_use]
    pub fn group_file(&self) -> &Path {
        &self.group_file
    }

    /// Finds a user by name, or by uid when `wanted` is numeric. A missing
    /// file reads as empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn get_user(&self, wanted: &str) -> Result<Option<PasswdEntry>> {
        let uid: Option<u32> = wanted.parse().ok();
        Ok(read_lines(&self.passwd_file)?
            .iter()
            .filter_map(|l| PasswdEntry::parse(l))
            .find(|e| e.name == wanted || Some(e.uid) == uid))
    }

    /// Finds a group by name, or by gid when `wanted` is numeric.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn get_group(&self, wanted: &str) -> Result<Option<GroupEntry>> {
        let gid: Option<u32> = wanted.parse().ok();
        Ok(read_lines(&self.group_file)?
            .iter()
            .filter_map(|l| GroupEntry::parse(l))
            .find(|e| e.name == wanted || Some(e.gid) == gid))
    }

    /// Appends a user record.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn add_user(&self, entry: &PasswdEntry) -> Result<()> {
        append_line(&self.passwd_file, &entry.to_string())
    }

    /// Appends a group record.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn add_group(&self, entry: &GroupEntry) -> Result<()> {
        append_line(&self.group_file, &entry.to_string())
    }

    /// Copies both files to `passwd_dst`/`group_dst` (missing sources
    /// produce empty files) and returns a handle on the copies.
    ///
    /// # Errors
    ///
    /// Returns an error if a copy cannot be written.
    pub fn copy_to(&self, passwd_dst: &Path, group_dst: &Path) -> Result<Self> {
        for (src, dst) in [(&self.passwd_file, passwd_dst), (&self.group_file, group_dst)] {
            let data = match fs::read(src) {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(UrunError::io(src, e)),
            };
            fs::write(dst, data).map_err(|e| UrunError::io(dst, e))?;
        }
        Ok(Self::with_files(passwd_dst, group_dst))
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(UrunError::io(path, e)),
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let needs_newline = fs::read(path).is_ok_and(|d| d.last().is_some_and(|b| *b != b'\n'));
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| UrunError::io(path, e))?;
    let prefix = if needs_newline { "\n" } else { "" };
    writeln!(file, "{prefix}{line}").map_err(|e| UrunError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD: &str = "root:x:0:0:root:/root:/bin/bash\n\
        # comment\n\
        daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
        broken-line\n";
    const GROUP: &str = "root:x:0:\nusers:x:100:alice,bob\n";

    fn auth() -> (tempfile::TempDir, NixAuthentication) {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("etc")).expect("mkdir");
        fs::write(dir.path().join("etc/passwd"), PASSWD).expect("write");
        fs::write(dir.path().join("etc/group"), GROUP).expect("write");
        let auth = NixAuthentication::for_root(dir.path());
        (dir, auth)
    }

    #[test]
    fn lookup_by_name_and_id() {
        let (_dir, auth) = auth();
        let daemon = auth.get_user("daemon").expect("read").expect("found");
        assert_eq!(daemon.uid, 1);
        assert_eq!(daemon.home, "/usr/sbin");
        assert_eq!(auth.get_user("0").expect("read").expect("found").name, "root");
        assert!(auth.get_user("nobody").expect("read").is_none());

        let users = auth.get_group("100").expect("read").expect("found");
        assert_eq!(users.name, "users");
        assert_eq!(users.members, vec!["alice", "bob"]);
        assert!(auth.get_group("root").expect("read").expect("found").members.is_empty());
    }

    #[test]
    fn added_entries_are_found() {
        let (dir, auth) = auth();
        let copy = auth
            .copy_to(&dir.path().join("passwd.tmp"), &dir.path().join("group.tmp"))
            .expect("copy");
        copy.add_user(&PasswdEntry {
            name: "alice".into(),
            uid: 1000,
            gid: 1000,
            gecos: "Alice".into(),
            home: "/home/alice".into(),
            shell: "/bin/sh".into(),
        })
        .expect("add");
        copy.add_group(&GroupEntry {
            name: "alice".into(),
            gid: 1000,
            members: Vec::new(),
        })
        .expect("add");

        assert_eq!(copy.get_user("1000").expect("read").expect("found").name, "alice");
        assert_eq!(copy.get_group("alice").expect("read").expect("found").gid, 1000);
        assert!(auth.get_user("alice").expect("read").is_none());
    }

    #[test]
    fn append_adds_missing_newline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let passwd = dir.path().join("passwd");
        fs::write(&passwd, "root:x:0:0::/root:/bin/sh").expect("write");
        let auth = NixAuthentication::with_files(&passwd, dir.path().join("group"));
        auth.add_group(&GroupEntry { name: "g".into(), gid: 5, members: vec![] })
            .expect("add");
        auth.add_user(&PasswdEntry {
            name: "u".into(),
            uid: 5,
            gid: 5,
            gecos: String::new(),
            home: "/".into(),
            shell: "/bin/sh".into(),
        })
        .expect("add");
        let text = fs::read_to_string(&passwd).expect("read");
        assert_eq!(text, "root:x:0:0::/root:/bin/sh\nu:x:5:5::/:/bin/sh\n");
        assert!(auth.get_group("g").expect("read").is_some());
    }

    #[test]
    fn missing_files_read_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let auth = NixAuthentication::for_root(dir.path());
        assert!(auth.get_user("root").expect("read").is_none());
    }
}
