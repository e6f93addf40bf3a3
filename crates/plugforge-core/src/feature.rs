use crate::error::{ForgeError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Feature
// ---------------------------------------------------------------------------

/// A pluggable unit of functionality provided by a registered repository.
///
/// A feature contributes to the control plane when `control_plane_subdir` is
/// set and to the proxy when `proxy_subdir` is set. A feature with neither
/// is accepted but never built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_subdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_subdir: Option<String>,
    pub source_repo: String,
    pub source_revision: String,
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Feature {
    pub fn new(
        name: impl Into<String>,
        source_repo: impl Into<String>,
        source_revision: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            control_plane_subdir: None,
            proxy_subdir: None,
            source_repo: source_repo.into(),
            source_revision: source_revision.into(),
            enabled: true,
            tags: Vec::new(),
        }
    }

    pub fn with_control_plane_subdir(mut self, dir: impl Into<String>) -> Self {
        self.control_plane_subdir = Some(dir.into());
        self
    }

    pub fn with_proxy_subdir(mut self, dir: impl Into<String>) -> Self {
        self.proxy_subdir = Some(dir.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn builds_control_plane(&self) -> bool {
        self.control_plane_subdir.as_deref().is_some_and(|d| !d.is_empty())
    }

    pub fn builds_proxy(&self) -> bool {
        self.proxy_subdir.as_deref().is_some_and(|d| !d.is_empty())
    }

    /// A feature that feeds neither core binary.
    pub fn is_inert(&self) -> bool {
        !self.builds_control_plane() && !self.builds_proxy()
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// One entry of a repository's feature manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub name: String,
    #[serde(default, alias = "controlPlaneDir")]
    pub control_plane_subdir: Option<String>,
    #[serde(default, alias = "proxyDir")]
    pub proxy_subdir: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub features: Vec<ManifestEntry>,
}

impl Manifest {
    /// Load the manifest of a checked-out repository. `manifest` overrides
    /// the default manifest location, relative to `repo_dir`.
    pub fn load(repo_dir: &Path, manifest: Option<&str>) -> Result<Self> {
        let path = repo_dir.join(manifest.unwrap_or(paths::MANIFEST_FILE));
        if !path.exists() {
            return Err(ForgeError::ManifestMissing(path.display().to_string()));
        }
        let data = std::fs::read_to_string(&path)?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(data)?;
        for entry in &manifest.features {
            paths::validate_name(&entry.name)?;
        }
        Ok(manifest)
    }

    /// Bind every entry to the repository it was read from.
    pub fn into_features(self, repo_url: &str, revision: &str) -> Vec<Feature> {
        self.features
            .into_iter()
            .map(|entry| {
                let mut tags: Vec<String> = Vec::with_capacity(entry.tags.len());
                for tag in entry.tags {
                    if !tags.contains(&tag) {
                        tags.push(tag);
                    }
                }
                Feature {
                    name: entry.name,
                    control_plane_subdir: entry.control_plane_subdir.filter(|d| !d.is_empty()),
                    proxy_subdir: entry.proxy_subdir.filter(|d| !d.is_empty()),
                    source_repo: repo_url.to_string(),
                    source_revision: revision.to_string(),
                    enabled: entry.enabled,
                    tags,
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"{
        "features": [
            {"name": "aws", "controlPlaneDir": "pkg/plugins/aws"},
            {"name": "squash", "proxySubdir": "envoy", "enabled": false,
             "tags": ["debug", "debug"]}
        ]
    }"#;

    #[test]
    fn manifest_to_features() {
        let features = Manifest::parse(MANIFEST)
            .unwrap()
            .into_features("https://github.com/acme/plugins.git", "abc123");
        assert_eq!(features.len(), 2);

        assert!(features[0].enabled);
        assert_eq!(
            features[0].control_plane_subdir.as_deref(),
            Some("pkg/plugins/aws")
        );
        assert!(features[0].builds_control_plane());
        assert!(!features[0].builds_proxy());

        assert!(!features[1].enabled);
        assert_eq!(features[1].tags, vec!["debug".to_string()]);
        assert_eq!(features[1].source_repo, "https://github.com/acme/plugins.git");
        assert_eq!(features[1].source_revision, "abc123");
    }

    #[test]
    fn manifest_rejects_bad_names() {
        let bad = r#"{"features": [{"name": "has space"}]}"#;
        assert!(matches!(
            Manifest::parse(bad),
            Err(ForgeError::InvalidName(_))
        ));
    }

    #[test]
    fn manifest_load_reports_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Manifest::load(dir.path(), None),
            Err(ForgeError::ManifestMissing(_))
        ));
        std::fs::create_dir_all(dir.path().join("pkg")).unwrap();
        std::fs::write(dir.path().join("pkg/features.json"), MANIFEST).unwrap();
        let manifest = Manifest::load(dir.path(), Some("pkg/features.json")).unwrap();
        assert_eq!(manifest.features.len(), 2);
    }

    #[test]
    fn inert_feature() {
        let f = Feature::new("noop", "https://example.com/r.git", "1");
        assert!(f.is_inert());
        assert!(!f.with_proxy_subdir("envoy").is_inert());
    }

    #[test]
    fn feature_json_field_names() {
        let f = Feature::new("aws", "https://example.com/r.git", "1")
            .with_control_plane_subdir("pkg/aws");
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json["sourceRepo"], "https://example.com/r.git");
        assert_eq!(json["sourceRevision"], "1");
        assert_eq!(json["controlPlaneSubdir"], "pkg/aws");
        assert!(json.get("proxySubdir").is_none());
    }
}
