//! Where a node looks for its configuration files.

use crate::ConfigError;
use directories::ProjectDirs;
use std::fmt;
use std::path::{Path, PathBuf};

const DEPLOYMENT_FILE: &str = "tessera.toml";
const HOST_OVERRIDE_FILE: &str = "tessera.local.toml";

/// One configuration file layer. Later layers override earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Layer {
    /// Operator defaults shared by every node on the host (~/.config/tessera/config.toml).
    User,
    /// Cluster layout and tuning shipped with the deployment.
    Deployment,
    /// Per-host overrides, never checked in.
    HostOverride,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Layer::User => "user",
            Layer::Deployment => "deployment",
            Layer::HostOverride => "host override",
        })
    }
}

/// Config file discovery for one node.
pub struct Paths {
    project_dirs: Option<ProjectDirs>,
}

impl Paths {
    pub fn new() -> Self {
        Self {
            project_dirs: ProjectDirs::from("org", "Tessera", "tessera"),
        }
    }

    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        self.project_dirs
            .as_ref()
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or_else(|| {
                ConfigError::XdgError("no home directory to look for user config".to_string())
            })
    }

    pub fn deployment_file(deployment_dir: impl AsRef<Path>) -> PathBuf {
        deployment_dir.as_ref().join(DEPLOYMENT_FILE)
    }

    pub fn host_override_file(deployment_dir: impl AsRef<Path>) -> PathBuf {
        deployment_dir.as_ref().join(HOST_OVERRIDE_FILE)
    }

    /// Candidate files in precedence order, lowest first. Files need not exist.
    ///
    /// The user layer is left out when `include_user` is false or the
    /// platform has no home directory.
    pub fn layers(&self, deployment_dir: &Path, include_user: bool) -> Vec<(Layer, PathBuf)> {
        let mut layers = Vec::with_capacity(3);
        if include_user && let Ok(path) = self.user_config_file() {
            layers.push((Layer::User, path));
        }
        layers.push((Layer::Deployment, Self::deployment_file(deployment_dir)));
        layers.push((Layer::HostOverride, Self::host_override_file(deployment_dir)));
        layers
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn user_file_lives_under_tessera() {
        // Platform dependent, but must never panic
        if let Ok(path) = Paths::new().user_config_file() {
            assert!(path.to_string_lossy().contains("tessera"));
            assert!(path.ends_with("config.toml"));
        }
    }

    #[test]
    fn layers_are_ordered_by_precedence() {
        let dir = tempdir().expect("Failed to create temp dir");
        let layers = Paths::new().layers(dir.path(), false);

        assert_eq!(
            layers,
            [
                (Layer::Deployment, dir.path().join("tessera.toml")),
                (Layer::HostOverride, dir.path().join("tessera.local.toml")),
            ]
        );
    }

    #[test]
    fn user_layer_comes_first() {
        let dir = tempdir().expect("Failed to create temp dir");
        let layers = Paths::new().layers(dir.path(), true);

        if let Some((first, _)) = layers.first() {
            assert!(layers.windows(2).all(|pair| pair[0].0 < pair[1].0));
            assert!(*first == Layer::User || layers.len() == 2);
        }
    }
}
