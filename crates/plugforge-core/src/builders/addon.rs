use super::control_plane::{go_recipe, publish_go_output};
use super::{BuildConfig, ComponentBuilder};
use crate::addon::Addon;
use crate::error::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

/// Builds an add-on binary from a subdirectory of the control-plane tree.
///
/// Each add-on fetches its own copy of the tree so it can run alongside the
/// control-plane build, which rewrites files in the shared checkout.
pub struct AddonBuilder {
    name: String,
    subdir: String,
    repo: Option<String>,
    revision: Option<String>,
}

impl AddonBuilder {
    /// `None` for add-ons that are not built from source.
    pub fn for_addon(addon: &Addon) -> Option<Self> {
        if !addon.is_buildable() {
            return None;
        }
        Some(Self {
            name: addon.name.clone(),
            subdir: addon.control_plane_subdir.clone()?,
            repo: addon.source_repo.clone(),
            revision: addon.source_revision.clone(),
        })
    }

    fn source<'a>(&'a self, config: &'a BuildConfig) -> (&'a str, &'a str) {
        (
            self.repo.as_deref().unwrap_or(&config.tool.control_plane_repo),
            self.revision
                .as_deref()
                .unwrap_or(&config.tool.control_plane_revision),
        )
    }

    fn src_dir(&self, config: &BuildConfig) -> PathBuf {
        config.work_dir().join("addons").join(&self.name)
    }
}

#[async_trait]
impl ComponentBuilder for AddonBuilder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn build(&self, config: &BuildConfig) -> Result<()> {
        info!(addon = %self.name, "building add-on");
        let (repo, revision) = self.source(config);
        let checkout = config
            .downloader()
            .fetch(repo, revision, &self.src_dir(config))
            .await?;

        let recipe = go_recipe(
            config,
            &self.name,
            repo,
            &checkout,
            Some(&self.subdir),
            &self.name,
        )?;
        crate::io::ensure_dir(&config.output_dir(&self.name))?;
        recipe.save(&config.root)?;
        recipe
            .execute(&config.runner)
            .await
            .map_err(|e| config.build_error(&self.name, e))
    }

    async fn publish(&self, config: &BuildConfig) -> Result<()> {
        let (repo, _) = self.source(config);
        let checkout = self
            .src_dir(config)
            .join(crate::downloader::repo_dir(repo));
        publish_go_output(config, &self.name, &checkout).await
    }
}
