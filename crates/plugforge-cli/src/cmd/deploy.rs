use crate::output::print_json;
use anyhow::Context;
use clap::{Args, Subcommand};
use plugforge_core::{
    addon,
    config::ToolConfig,
    deploy::{Deployer, K8sOptions, K8sOutcome, DEFAULT_NAMESPACE},
    registry::RegistryStore,
    runner::Runner,
    tag::compute_tag,
};
use std::path::Path;
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Stream the output of every external command
    #[arg(short, long)]
    verbose: bool,
    /// Print commands instead of running them
    #[arg(short, long)]
    dry_run: bool,
    /// Docker user for image names (default: from plugforge.json)
    #[arg(short = 'u', long)]
    docker_user: Option<String>,
    /// Image tag (default: derived from the enabled features)
    #[arg(short = 't', long)]
    image_tag: Option<String>,
}

#[derive(Subcommand)]
pub enum DeploySubcommand {
    /// Install into Kubernetes with Helm, or render a single install.yaml
    K8s {
        #[command(flatten)]
        common: DeployArgs,
        /// Namespace to deploy into
        #[arg(short, long, default_value = DEFAULT_NAMESPACE)]
        namespace: String,
        /// Reuse the existing chart-values.yaml instead of regenerating it
        #[arg(short, long)]
        resume: bool,
        /// Write install.yaml instead of installing
        #[arg(short, long, conflicts_with = "resume")]
        generate_install: bool,
        /// Helm release name
        #[arg(long)]
        release_name: Option<String>,
    },
    /// Run the images on the local Docker daemon
    Local {
        #[command(flatten)]
        common: DeployArgs,
    },
}

pub fn run(root: &Path, subcmd: DeploySubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        DeploySubcommand::K8s {
            common,
            namespace,
            resume,
            generate_install,
            release_name,
        } => {
            let options = K8sOptions {
                namespace,
                resume,
                generate_install,
                release_name,
            };
            k8s(root, common, options, json)
        }
        DeploySubcommand::Local { common } => local(root, common, json),
    }
}

fn deployer(root: &Path, args: DeployArgs, token: CancellationToken) -> anyhow::Result<Deployer> {
    let tool = ToolConfig::load(root).context("unable to load configuration")?;
    let docker_user = tool.resolve_docker_user(args.docker_user.as_deref())?;
    let image_tag = match args.image_tag.filter(|t| !t.is_empty()) {
        Some(tag) => tag,
        None => {
            let enabled = RegistryStore::new(root)
                .enabled_features()
                .context("unable to get enabled features")?;
            compute_tag(&enabled)
        }
    };
    Ok(Deployer {
        root: root.to_path_buf(),
        tool,
        docker_user,
        image_tag,
        runner: Runner::new(args.verbose, args.dry_run, token),
    })
}

fn k8s(root: &Path, args: DeployArgs, options: K8sOptions, json: bool) -> anyhow::Result<()> {
    let token = CancellationToken::new();
    let deployer = deployer(root, args, token.clone())?;
    let addons = addon::load(root).context("unable to load add-ons")?;

    let outcome = super::block_on(token, async {
        deployer
            .k8s(&addons, &options)
            .await
            .context("unable to deploy to Kubernetes")
    })?;

    match outcome {
        K8sOutcome::InstallGenerated(path) => {
            if json {
                print_json(&serde_json::json!({ "install": path }))?;
            } else {
                println!("Wrote {}", path.display());
            }
        }
        K8sOutcome::Installed => {
            if json {
                print_json(&serde_json::json!({
                    "namespace": options.namespace,
                    "tag": deployer.image_tag,
                }))?;
            } else {
                println!(
                    "Deployed images tagged {} to namespace {}",
                    deployer.image_tag, options.namespace
                );
            }
        }
    }
    Ok(())
}

fn local(root: &Path, args: DeployArgs, json: bool) -> anyhow::Result<()> {
    let token = CancellationToken::new();
    let deployer = deployer(root, args, token.clone())?;
    let addons = addon::load(root).context("unable to load add-ons")?;

    let started = super::block_on(token, async {
        deployer
            .local(&addons)
            .await
            .context("unable to deploy locally")
    })?;

    if json {
        print_json(&started)?;
    } else {
        for name in &started {
            println!("started {name}");
        }
    }
    Ok(())
}
