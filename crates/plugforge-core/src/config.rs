use crate::error::{ForgeError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Pinned defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_PROXY_REPO: &str = "https://github.com/envoyproxy/envoy.git";
pub const DEFAULT_PROXY_REVISION: &str = "29989a38c017d3be5aa3c735a797fcf58b754fe5";
pub const DEFAULT_PROXY_BUILDER_IMAGE: &str = "envoyproxy/envoy-build-ubuntu:latest";
pub const DEFAULT_CONTROL_PLANE_REPO: &str = "https://github.com/solo-io/gloo.git";
pub const DEFAULT_CONTROL_PLANE_REVISION: &str = "cef37326d4be6107583c915c965e43040bd3c473";
pub const DEFAULT_CONTROL_PLANE_BUILDER_IMAGE: &str = "golang:1.10";
pub const DEFAULT_DOCKER_USER: &str = "plugforge";

// ---------------------------------------------------------------------------
// ToolConfig
// ---------------------------------------------------------------------------

/// Project-wide settings stored in `plugforge.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    #[serde(default = "default_proxy_repo")]
    pub proxy_repo: String,
    #[serde(default = "default_proxy_revision")]
    pub proxy_revision: String,
    #[serde(default = "default_proxy_builder_image")]
    pub proxy_builder_image: String,
    #[serde(default = "default_control_plane_repo")]
    pub control_plane_repo: String,
    #[serde(default = "default_control_plane_revision")]
    pub control_plane_revision: String,
    #[serde(default = "default_control_plane_builder_image")]
    pub control_plane_builder_image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_user: Option<String>,
}

fn default_work_dir() -> String {
    paths::DEFAULT_WORK_DIR.to_string()
}

fn default_proxy_repo() -> String {
    DEFAULT_PROXY_REPO.to_string()
}

fn default_proxy_revision() -> String {
    DEFAULT_PROXY_REVISION.to_string()
}

fn default_proxy_builder_image() -> String {
    DEFAULT_PROXY_BUILDER_IMAGE.to_string()
}

fn default_control_plane_repo() -> String {
    DEFAULT_CONTROL_PLANE_REPO.to_string()
}

fn default_control_plane_revision() -> String {
    DEFAULT_CONTROL_PLANE_REVISION.to_string()
}

fn default_control_plane_builder_image() -> String {
    DEFAULT_CONTROL_PLANE_BUILDER_IMAGE.to_string()
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            proxy_repo: default_proxy_repo(),
            proxy_revision: default_proxy_revision(),
            proxy_builder_image: default_proxy_builder_image(),
            control_plane_repo: default_control_plane_repo(),
            control_plane_revision: default_control_plane_revision(),
            control_plane_builder_image: default_control_plane_builder_image(),
            docker_user: Some(DEFAULT_DOCKER_USER.to_string()),
        }
    }
}

/// Field overrides accepted by `init` and `configure`. `None` keeps the
/// current value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub proxy_repo: Option<String>,
    pub proxy_revision: Option<String>,
    pub proxy_builder_image: Option<String>,
    pub control_plane_repo: Option<String>,
    pub control_plane_revision: Option<String>,
    pub control_plane_builder_image: Option<String>,
    pub docker_user: Option<String>,
}

impl ToolConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(ForgeError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path).map_err(|e| ForgeError::ConfigLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&data).map_err(|e| ForgeError::ConfigLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        crate::io::atomic_write(&paths::config_path(root), data.as_bytes())
    }

    /// Apply non-empty overrides. Returns true when any field changed.
    pub fn apply(&mut self, overrides: ConfigOverrides) -> bool {
        let before = self.clone();
        let set = |target: &mut String, value: Option<String>| {
            if let Some(v) = value.filter(|v| !v.is_empty()) {
                *target = v;
            }
        };
        set(&mut self.proxy_repo, overrides.proxy_repo);
        set(&mut self.proxy_revision, overrides.proxy_revision);
        set(&mut self.proxy_builder_image, overrides.proxy_builder_image);
        set(&mut self.control_plane_repo, overrides.control_plane_repo);
        set(&mut self.control_plane_revision, overrides.control_plane_revision);
        set(
            &mut self.control_plane_builder_image,
            overrides.control_plane_builder_image,
        );
        if let Some(user) = overrides.docker_user.filter(|u| !u.is_empty()) {
            self.docker_user = Some(user);
        }
        *self != before
    }

    /// Work directory holding downloaded repositories, resolved against `root`.
    pub fn work_dir(&self, root: &Path) -> std::path::PathBuf {
        root.join(&self.work_dir)
    }

    /// Docker user for image references: explicit flag first, then config.
    pub fn resolve_docker_user(&self, flag: Option<&str>) -> Result<String> {
        flag.filter(|u| !u.is_empty())
            .map(str::to_string)
            .or_else(|| self.docker_user.clone().filter(|u| !u.is_empty()))
            .ok_or(ForgeError::MissingDockerUser)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
