use crate::output::{print_json, print_table, yes_no};
use anyhow::{bail, Context};
use clap::Args;
use plugforge_core::{
    config::ToolConfig,
    downloader::{self, Downloader},
    feature::Manifest,
    registry::{RegisterOutcome, Repository, RegistryStore},
    runner::Runner,
    ForgeError,
};
use std::path::Path;
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Repository URL (ending in .git, or an HTTP/HTTPS archive location)
    #[arg(short, long)]
    repository: String,
    /// Commit (or tag) to pin the repository to
    #[arg(short, long)]
    commit: String,
    /// Manifest path inside the repository
    #[arg(long)]
    manifest: Option<String>,
    /// Stream git output
    #[arg(short, long)]
    verbose: bool,
}

pub fn add(root: &Path, args: AddArgs, json: bool) -> anyhow::Result<()> {
    let url = args.repository.as_str();
    if !downloader::supported_url(url) {
        return Err(ForgeError::UnsupportedScheme(url.to_string()).into());
    }
    let config = ToolConfig::load(root).context("unable to load configuration")?;
    let store = RegistryStore::new(root);

    let token = CancellationToken::new();
    let runner = Runner::new(args.verbose, false, token.clone());
    let work_dir = config.work_dir(root);
    let checkout = super::block_on(token, async {
        Downloader::new(runner)
            .fetch(url, &args.commit, &work_dir)
            .await
            .with_context(|| format!("unable to download repository {url}"))
    })?;

    let manifest = Manifest::load(&checkout, args.manifest.as_deref())
        .with_context(|| format!("unable to load features manifest for repository {url}"))?;
    let features = manifest.into_features(url, &args.commit);
    if features.is_empty() {
        bail!("not adding repository {url}: it does not contain any features");
    }
    let names: Vec<String> = features.iter().map(|f| f.name.clone()).collect();

    let outcome = store
        .register_repository(Repository::new(url, &args.commit), features)
        .with_context(|| format!("unable to register repository {url}"))?;

    if json {
        print_json(&serde_json::json!({
            "repository": url,
            "commit": args.commit,
            "outcome": outcome,
            "features": names,
        }))?;
    } else {
        match outcome {
            RegisterOutcome::Added => {
                println!("Added repository {url} with commit {}", args.commit)
            }
            RegisterOutcome::Updated => {
                println!("Updated repository {url} to commit {}", args.commit)
            }
        }
        println!("Features: {}", names.join(", "));
    }
    Ok(())
}

pub fn delete(root: &Path, url: &str, json: bool) -> anyhow::Result<()> {
    let removed = RegistryStore::new(root)
        .remove_repository(url)
        .with_context(|| format!("unable to delete repository {url}"))?;

    if json {
        print_json(&serde_json::json!({ "repository": url, "removed_features": removed }))?;
    } else {
        println!("Deleted repository {url}");
        if !removed.is_empty() {
            println!("Removed features: {}", removed.join(", "));
        }
    }
    Ok(())
}

pub fn set_enabled(root: &Path, name: &str, enabled: bool, json: bool) -> anyhow::Result<()> {
    let changed = RegistryStore::new(root)
        .set_enabled(name, enabled)
        .with_context(|| format!("unable to update feature '{name}'"))?;
    let state = if enabled { "enabled" } else { "disabled" };

    if json {
        print_json(&serde_json::json!({ "name": name, "enabled": enabled, "changed": changed }))?;
    } else if changed {
        println!("Feature {name} {state}");
    } else {
        println!("Feature {name} already {state}");
    }
    Ok(())
}

pub fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let registry = RegistryStore::new(root)
        .load()
        .context("unable to load feature list")?;

    if json {
        return print_json(&registry.features);
    }
    if registry.features.is_empty() {
        println!("No features added yet");
        return Ok(());
    }
    let rows: Vec<Vec<String>> = registry
        .features
        .iter()
        .map(|f| {
            vec![
                f.name.clone(),
                f.source_repo.clone(),
                f.source_revision.clone(),
                yes_no(f.enabled),
            ]
        })
        .collect();
    print_table(&["NAME", "REPOSITORY", "COMMIT", "ENABLED"], &rows);
    Ok(())
}

pub fn list_repo(root: &Path, json: bool) -> anyhow::Result<()> {
    let registry = RegistryStore::new(root)
        .load()
        .context("unable to load the registry")?;

    if json {
        let repos: Vec<_> = registry
            .repositories
            .iter()
            .map(|r| {
                let features: Vec<_> = registry
                    .features
                    .iter()
                    .filter(|f| f.source_repo == r.url)
                    .collect();
                serde_json::json!({ "url": r.url, "commit": r.commit, "features": features })
            })
            .collect();
        return print_json(&repos);
    }
    if registry.repositories.is_empty() {
        println!("No repositories added yet");
        return Ok(());
    }
    for repo in &registry.repositories {
        println!("{} @ {}", repo.url, repo.commit);
        for f in registry.features.iter().filter(|f| f.source_repo == repo.url) {
            println!("  {} ({})", f.name, if f.enabled { "enabled" } else { "disabled" });
            if let Some(dir) = &f.control_plane_subdir {
                println!("    control plane: {dir}");
            }
            if let Some(dir) = &f.proxy_subdir {
                println!("    proxy:         {dir}");
            }
            if !f.tags.is_empty() {
                println!("    tags:          {}", f.tags.join(", "));
            }
        }
    }
    Ok(())
}
