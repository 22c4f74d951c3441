//! Shared fixture: a fake container tree plus stub tools.
//!
//! The stub `patchelf` reads and rewrites a `# INTERP=` line instead of a
//! real ELF header, which is enough to drive the batch walker, the loader
//! probe and the patch verification.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use urun_common::config::UrunConfig;
use urun_common::constants::ROOT_DIR;
use urun_common::types::ContainerId;
use urun_runtime::context::RunContext;
use urun_runtime::launch::RecordingLauncher;

pub const LOADER: &str = "/lib/ld-linux.so.2";

pub const PATCHELF: &str = r##"#!/bin/sh
case "$1" in
  -q)
    line=$(grep '^# INTERP=' "$3") || exit 1
    echo "${line#"# INTERP="}"
    ;;
  --set-root-prefix)
    grep -q "^# INTERP=$2/" "$3" && exit 0
    sed -i "s|^# INTERP=|# INTERP=$2|" "$3"
    ;;
  --restore-root-prefix)
    sed -i "s|^# INTERP=$2/|# INTERP=/|" "$3"
    ;;
  *)
    exit 2
    ;;
esac
"##;

const PROOT: &str = r#"#!/bin/sh
if [ "$1" = --help ]; then
  echo "  --kill-on-exit   kill all processes on exit"
  echo "  -p, --port       map ports"
  echo "  -n, --netcoop    cooperative networking"
fi
exit 0
"#;

const RUNC: &str = r#"#!/bin/sh
if [ "$1" = spec ]; then
  printf '%s' '{"ociVersion":"1.0.2","process":{"args":["sh"],"cwd":"/"},"root":{"path":"rootfs","readonly":true},"linux":{"uidMappings":[],"gidMappings":[]},"mounts":[{"destination":"/proc","type":"proc","source":"proc"}]}' > "$4/config.json"
fi
exit 0
"#;

pub struct Fixture {
    pub top: TempDir,
    pub ctx: RunContext,
    pub recorder: Arc<RecordingLauncher>,
    pub id: ContainerId,
    pub dir: PathBuf,
}

impl Fixture {
    pub fn root(&self) -> PathBuf {
        self.dir.join(ROOT_DIR)
    }

    pub fn canonical_root(&self) -> PathBuf {
        fs::canonicalize(self.root()).expect("canonical root")
    }

    pub fn interp(&self, rel: &str) -> String {
        let text = fs::read_to_string(self.root().join(rel)).expect("read binary");
        text.lines()
            .find_map(|l| l.strip_prefix("# INTERP="))
            .expect("interp line")
            .to_string()
    }
}

pub fn write_exec(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, content).expect("write");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod");
}

fn write_file(path: &Path, content: &[u8]) {
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, content).expect("write");
}

pub fn fixture() -> Fixture {
    let top = tempfile::tempdir().expect("tempdir");
    let mut config = UrunConfig::with_top_dir(top.path());
    config.tmp_dir = top.path().join("tmp");
    config.cpu_affinity_tools = Vec::new();

    write_exec(&config.bin_dir().join("patchelf"), PATCHELF);
    write_exec(&config.bin_dir().join("proot"), PROOT);
    write_exec(&config.bin_dir().join("runc"), RUNC);
    write_file(&config.lib_dir().join("libfakechroot.so"), b"\x7fELF shim");

    let recorder = Arc::new(RecordingLauncher::default());
    let ctx = RunContext::new(config).with_launcher(recorder.clone());
    let id = ContainerId::new("0123456789ab");
    let dir = ctx.repo.create_container(&id).expect("create container");
    let root = dir.join(ROOT_DIR);

    let binary = format!("#!/bin/sh\n# INTERP={LOADER}\n");
    write_exec(&root.join("bin/sh"), &binary);
    write_exec(&root.join("bin/ls"), &binary);
    write_exec(&root.join("usr/bin/env"), &binary);
    write_file(
        &root.join("lib/ld-linux.so.2"),
        b"\x7fELF\0/etc/ld.so.cache\0/lib/\0/usr/lib/\0LD_LIBRARY_PATH\0",
    );
    write_file(&root.join("lib/libz.so.1"), b"\x7fELF lib");
    fs::create_dir_all(root.join("usr/lib")).expect("mkdir");
    std::os::unix::fs::symlink("/lib/libz.so.1", root.join("usr/lib/libz.so")).expect("symlink");
    write_file(
        &root.join("etc/passwd"),
        b"root:x:0:0:root:/root:/bin/sh\nalice:x:1000:1000::/home/alice:/bin/sh\n",
    );
    write_file(&root.join("etc/group"), b"root:x:0:\nalice:x:1000:\n");
    fs::create_dir_all(root.join("home/alice")).expect("mkdir");
    fs::create_dir_all(root.join("root")).expect("mkdir");

    Fixture {
        top,
        ctx,
        recorder,
        id,
        dir,
    }
}
