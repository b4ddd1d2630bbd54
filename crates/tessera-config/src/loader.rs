//! Configuration loader with multi-source merging

use crate::{Paths, TesseraConfig};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    deployment_dir: PathBuf,
    env_prefix: String,
    include_user_config: bool,
}

impl ConfigLoader {
    /// Loader that looks for deployment files in the current directory
    pub fn new() -> Self {
        Self {
            deployment_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "TESSERA".to_string(),
            include_user_config: true,
        }
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.deployment_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "TESSERA")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skip ~/.config/tessera/config.toml, so results do not depend on the host.
    pub fn without_user_config(mut self) -> Self {
        self.include_user_config = false;
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<TesseraConfig> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults
        let defaults = TesseraConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);
        let mut loaded = Vec::new();

        // 2. Config files, lowest precedence first
        for (layer, path) in Paths::new().layers(&self.deployment_dir, self.include_user_config) {
            if path.is_file() {
                builder = builder.add_source(
                    config::File::from(path.clone())
                        .required(true)
                        .format(config::FileFormat::Toml),
                );
                loaded.push(format!("{layer} ({})", path.display()));
            }
        }

        // 3. Environment variables (TESSERA_REPLICATION__WORKER_COUNT=4)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .with_context(|| format!("failed to merge configuration from {loaded:?}"))?;

        let tessera_config: TesseraConfig = config
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        tessera_config
            .validate()
            .context("configuration failed validation")?;

        Ok(tessera_config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NamedQuorum, NodeRole, QuorumSetting};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = ConfigLoader::new()
            .with_project_dir(temp_dir.path())
            .without_user_config()
            .load()
            .expect("Failed to load config");

        assert_eq!(config, TesseraConfig::default());
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[node]
name = "europe-1"
id = 1

[replication]
worker_count = 4
write_quorum = "all"

[repair]
resolver_chain = ["version"]

[layout]
nodes = ["europe-0", "europe-1", "europe-2"]

[layout.clusters.12]
servers = ["europe-2", "*"]

[layout.roles]
europe-2 = "replica"
"#;
        fs::write(project_dir.join("tessera.toml"), config_content)
            .expect("Failed to write config");

        let config = ConfigLoader::new()
            .with_project_dir(project_dir)
            .without_user_config()
            .load()
            .expect("Failed to load config");

        assert_eq!(config.node.name, "europe-1");
        assert_eq!(config.replication.worker_count, 4);
        assert_eq!(
            config.replication.write_quorum,
            QuorumSetting::Named(NamedQuorum::All)
        );
        assert_eq!(config.repair.resolver_chain, ["version"]);
        assert_eq!(
            config.layout.servers_for(12),
            ["europe-2", "europe-0", "europe-1"]
        );
        assert_eq!(config.layout.role_of("europe-2"), NodeRole::Replica);
        // Untouched sections keep their defaults
        assert_eq!(config.locks.max_attempts, 3);
    }

    #[test]
    fn test_local_overrides() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("tessera.toml"),
            "[replication]\nsynchronous_timeout_ms = 2000\n",
        )
        .expect("Failed to write project config");
        fs::write(
            project_dir.join("tessera.local.toml"),
            "[replication]\nsynchronous_timeout_ms = 250\n",
        )
        .expect("Failed to write local config");

        let config = ConfigLoader::new()
            .with_project_dir(project_dir)
            .without_user_config()
            .load()
            .expect("Failed to load config");

        assert_eq!(config.replication.synchronous_timeout_ms, 250);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        fs::write(
            temp_dir.path().join("tessera.toml"),
            "[repair]\nresolver_chain = [\"dice\"]\n",
        )
        .expect("Failed to write config");

        let result = ConfigLoader::new()
            .with_project_dir(temp_dir.path())
            .without_user_config()
            .load();
        assert!(result.is_err());
    }
}
