use crate::output::print_json;
use anyhow::{bail, Context};
use clap::Args;
use plugforge_core::{
    addon,
    config::{ConfigOverrides, ToolConfig},
    io, paths,
    registry::RegistryStore,
};
use std::path::Path;

#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    /// Proxy source repository
    #[arg(long)]
    proxy_repo: Option<String>,
    /// Proxy revision to build
    #[arg(long)]
    proxy_revision: Option<String>,
    /// Image the proxy is built in
    #[arg(long)]
    proxy_builder_image: Option<String>,
    /// Control-plane source repository
    #[arg(long)]
    control_plane_repo: Option<String>,
    /// Control-plane revision to build
    #[arg(long)]
    control_plane_revision: Option<String>,
    /// Image the control plane and add-ons are built in
    #[arg(long)]
    control_plane_builder_image: Option<String>,
    /// Docker user (registry namespace) for published images
    #[arg(short = 'u', long)]
    docker_user: Option<String>,
}

impl From<ConfigArgs> for ConfigOverrides {
    fn from(a: ConfigArgs) -> Self {
        ConfigOverrides {
            proxy_repo: a.proxy_repo,
            proxy_revision: a.proxy_revision,
            proxy_builder_image: a.proxy_builder_image,
            control_plane_repo: a.control_plane_repo,
            control_plane_revision: a.control_plane_revision,
            control_plane_builder_image: a.control_plane_builder_image,
            docker_user: a.docker_user,
        }
    }
}

pub fn init(root: &Path, args: ConfigArgs, json: bool) -> anyhow::Result<()> {
    let config_path = paths::config_path(root);
    if config_path.exists() {
        bail!("already initialized: {} exists", config_path.display());
    }

    let mut config = ToolConfig::default();
    config.apply(args.into());
    io::ensure_dir(root).with_context(|| format!("failed to create {}", root.display()))?;
    config.save(root).context("failed to write plugforge.json")?;
    RegistryStore::new(root)
        .init()
        .context("failed to create the feature registry")?;
    addon::init(root).context("failed to write addons.json")?;
    let work_dir = config.work_dir(root);
    io::ensure_dir(&work_dir)
        .with_context(|| format!("failed to create {}", work_dir.display()))?;

    if json {
        print_json(&serde_json::json!({ "root": root, "config": config }))?;
    } else {
        println!("Initialized plugforge in {}", root.display());
        println!("  proxy:         {} @ {}", config.proxy_repo, config.proxy_revision);
        println!(
            "  control plane: {} @ {}",
            config.control_plane_repo, config.control_plane_revision
        );
    }
    Ok(())
}

pub fn configure(root: &Path, args: ConfigArgs, json: bool) -> anyhow::Result<()> {
    let mut config = ToolConfig::load(root).context("unable to load configuration")?;
    let changed = config.apply(args.into());
    if changed {
        config.save(root).context("failed to write plugforge.json")?;
    }

    if json {
        print_json(&serde_json::json!({ "changed": changed, "config": config }))?;
    } else if changed {
        println!("Configuration updated");
    } else {
        println!("Configuration unchanged");
    }
    Ok(())
}
