//! Steps every engine applies right before the final command.

use urun_common::config::UrunConfig;
use urun_core::host;

use crate::launch::Invocation;

/// Prints the one-line execution banner.
#[allow(clippy::print_stderr)]
pub(crate) fn banner(invocation: &Invocation) {
    eprintln!(
        " *  executing: {}  [{}]",
        invocation.command_name,
        short_execid(&invocation.execid)
    );
}

fn short_execid(execid: &str) -> &str {
    execid.get(..8).unwrap_or(execid)
}

/// Affinity wrapper for `cpuset`: the first configured tool found on the
/// host, with `%s` replaced by the set. Empty when no set was requested.
pub(crate) fn cpu_affinity_prefix(config: &UrunConfig, cpuset: Option<&str>) -> Vec<String> {
    let Some(cpuset) = cpuset.map(str::trim).filter(|s| !s.is_empty()) else {
        return Vec::new();
    };
    for template in &config.cpu_affinity_tools {
        let Some(tool) = template.first() else {
            continue;
        };
        let Some(path) = host::find_exec(tool) else {
            continue;
        };
        let mut prefix = vec![path.display().to_string()];
        prefix.extend(template[1..].iter().map(|a| a.replace("%s", cpuset)));
        tracing::debug!(?prefix, "cpu affinity wrapper");
        return prefix;
    }
    tracing::warn!(cpuset, "no cpu affinity tool found, ignoring cpu set");
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_cpuset_no_prefix() {
        let config = UrunConfig::default();
        assert!(cpu_affinity_prefix(&config, None).is_empty());
        assert!(cpu_affinity_prefix(&config, Some("  ")).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn first_available_tool_wins() {
        let config = UrunConfig {
            cpu_affinity_tools: vec![
                vec!["urun-no-such-affinity-tool".into(), "%s".into()],
                vec!["sh".into(), "-c".into(), "%s".into()],
            ],
            ..UrunConfig::default()
        };
        let prefix = cpu_affinity_prefix(&config, Some("0-3"));
        assert!(prefix[0].ends_with("/sh"));
        assert_eq!(&prefix[1..], ["-c", "0-3"]);
    }

    #[test]
    fn unknown_tools_are_skipped() {
        let config = UrunConfig {
            cpu_affinity_tools: vec![vec!["urun-no-such-affinity-tool".into()], Vec::new()],
            ..UrunConfig::default()
        };
        assert!(cpu_affinity_prefix(&config, Some("1")).is_empty());
    }
}
