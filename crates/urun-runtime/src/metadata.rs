//! Image configuration stored as `container.json`.

use serde::Deserialize;

/// The `config` object of a Docker image configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImageConfig {
    /// `NAME=VALUE` entries.
    pub env: Option<Vec<String>>,
    /// Default arguments.
    pub cmd: Option<Vec<String>>,
    /// Fixed command prefix.
    pub entrypoint: Option<Vec<String>>,
    /// Default working directory.
    pub working_dir: Option<String>,
    /// Default user spec.
    pub user: Option<String>,
    /// Default hostname.
    pub hostname: Option<String>,
}

/// Top-level `container.json`. Older images only carry
/// `container_config`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerMetadata {
    config: Option<ImageConfig>,
    container_config: Option<ImageConfig>,
}

impl ContainerMetadata {
    /// Returns the effective image configuration.
    #[must_use]
    pub fn image_config(&self) -> ImageConfig {
        self.config
            .clone()
            .or_else(|| self.container_config.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_config_is_read() {
        let json = r#"{
            "architecture": "amd64",
            "config": {
                "Env": ["PATH=/usr/bin:/bin", "LANG=C.UTF-8"],
                "Cmd": ["python3"],
                "Entrypoint": null,
                "WorkingDir": "/app",
                "User": ""
            }
        }"#;
        let meta: ContainerMetadata = serde_json::from_str(json).unwrap();
        let cfg = meta.image_config();
        assert_eq!(cfg.cmd.as_deref(), Some(&["python3".to_string()][..]));
        assert!(cfg.entrypoint.is_none());
        assert_eq!(cfg.working_dir.as_deref(), Some("/app"));
        assert_eq!(cfg.env.map(|e| e.len()), Some(2));
    }

    #[test]
    fn falls_back_to_container_config() {
        let json = r#"{"container_config": {"Cmd": ["sh"]}}"#;
        let meta: ContainerMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.image_config().cmd, Some(vec!["sh".to_string()]));
        assert!(ContainerMetadata::default().image_config().cmd.is_none());
    }
}
