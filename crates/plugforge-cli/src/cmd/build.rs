use crate::output::{print_json, print_table};
use anyhow::{bail, Context};
use clap::Args;
use plugforge_core::{
    addon,
    builders::{BuildConfig, BuilderRegistry, ALL},
    config::ToolConfig,
    registry::RegistryStore,
    runner::Runner,
    scheduler::{JobStatus, Scheduler},
};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Component to build, or `all`
    #[arg(default_value = ALL)]
    component: String,
    /// Stream the output of every external command
    #[arg(short, long)]
    verbose: bool,
    /// Print commands instead of running them
    #[arg(short, long)]
    dry_run: bool,
    /// Keep build caches under cache/<component>
    #[arg(long)]
    cache: bool,
    /// Push images after building them
    #[arg(long)]
    publish: bool,
    /// Image tag (default: derived from the enabled features)
    #[arg(short = 't', long)]
    image_tag: Option<String>,
    /// Docker user for image names (default: from plugforge.json)
    #[arg(short = 'u', long)]
    docker_user: Option<String>,
    /// SSH key made available to builds that fetch private repositories
    #[arg(long)]
    ssh_key: Option<PathBuf>,
    /// Maximum number of components built at once
    #[arg(long, default_value_t = 1)]
    jobs: usize,
}

pub fn run(root: &Path, args: BuildArgs, json: bool) -> anyhow::Result<()> {
    let tool = ToolConfig::load(root).context("unable to load configuration")?;
    let enabled = RegistryStore::new(root)
        .enabled_features()
        .context("unable to get enabled features")?;
    let addons = addon::load_optional(root).context("unable to load add-ons")?;
    let docker_user = tool.resolve_docker_user(args.docker_user.as_deref())?;
    if let Some(key) = &args.ssh_key {
        if !key.is_file() {
            bail!("ssh key {} not found", key.display());
        }
    }

    let registry = BuilderRegistry::standard(addons.as_deref())
        .context("unable to register builders")?;
    let scheduler = Scheduler::new(registry, args.jobs);

    let token = CancellationToken::new();
    let config = BuildConfig {
        root: root.to_path_buf(),
        tool,
        enabled,
        use_cache: args.cache,
        publish: args.publish,
        image_tag: args.image_tag.unwrap_or_default(),
        docker_user,
        ssh_key: args.ssh_key,
        runner: Runner::new(args.verbose, args.dry_run, token.clone()),
    };
    if !json {
        println!("Building with {} features", config.enabled.len());
    }

    let target = args.component;
    let report = super::block_on(token, async {
        scheduler
            .run(&target, config)
            .await
            .with_context(|| format!("unable to build {target}"))
    })?;

    if json {
        print_json(&report)?;
    } else {
        let rows: Vec<Vec<String>> = report
            .jobs
            .iter()
            .map(|j| vec![j.component.clone(), j.status.to_string()])
            .collect();
        print_table(&["COMPONENT", "STATUS"], &rows);
        println!("Image tag: {}", report.image_tag);
    }

    if !report.success() {
        let unsuccessful = report
            .jobs
            .iter()
            .filter(|j| j.status != JobStatus::Completed)
            .count();
        bail!(
            "{unsuccessful} of {} components did not build",
            report.jobs.len()
        );
    }
    Ok(())
}
