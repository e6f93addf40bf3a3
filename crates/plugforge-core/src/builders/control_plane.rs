use super::publish::publish_image;
use super::{BuildConfig, ComponentBuilder, CONTROL_PLANE};
use crate::downloader::{package_path, repo_dir};
use crate::error::{ForgeError, Result};
use crate::feature::Feature;
use crate::paths;
use crate::recipe::{Mount, Recipe, Step, StepKind};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

/// Plugin registration file inside the control-plane tree.
pub(super) const INSTALL_FILE: &str = "internal/install/install_plugins.go";
/// Dependency manifest the revision constraints are appended to.
pub(super) const DEPENDENCY_FILE: &str = "Gopkg.toml";

const GOPATH_SRC: &str = "/go/src";
const DEP_CACHE: &str = "/go/pkg/dep/sources";

/// Builds the control-plane binary with every enabled plugin compiled in.
pub struct ControlPlaneBuilder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Plugin {
    package: String,
    repository: String,
    revision: String,
}

#[async_trait]
impl ComponentBuilder for ControlPlaneBuilder {
    fn name(&self) -> &str {
        CONTROL_PLANE
    }

    async fn build(&self, config: &BuildConfig) -> Result<()> {
        info!("building control plane");
        let checkout = config
            .downloader()
            .fetch(
                &config.tool.control_plane_repo,
                &config.tool.control_plane_revision,
                &config.work_dir(),
            )
            .await?;

        let plugins = plugins(&config.enabled);
        if config.runner.is_dry_run() {
            info!(plugins = plugins.len(), "[dry-run] skipping plugin registration");
        } else {
            info!(plugins = plugins.len(), "adding plugins to the control plane");
            crate::io::atomic_write(
                &checkout.join(INSTALL_FILE),
                install_file(&plugins).as_bytes(),
            )?;
            let deps = checkout.join(DEPENDENCY_FILE);
            crate::io::append_text(&deps, &constraints(&plugins)).map_err(|e| {
                ForgeError::BuildProcess {
                    component: CONTROL_PLANE.to_string(),
                    reason: format!("unable to update {}: {e}", deps.display()),
                }
            })?;
        }

        let binary = repo_dir(&config.tool.control_plane_repo);
        let recipe = go_recipe(
            config,
            CONTROL_PLANE,
            &config.tool.control_plane_repo,
            &checkout,
            None,
            &binary,
        )?;
        crate::io::ensure_dir(&config.output_dir(CONTROL_PLANE))?;
        recipe.save(&config.root)?;
        recipe
            .execute(&config.runner)
            .await
            .map_err(|e| config.build_error(CONTROL_PLANE, e))
    }

    async fn publish(&self, config: &BuildConfig) -> Result<()> {
        let checkout = config
            .work_dir()
            .join(repo_dir(&config.tool.control_plane_repo));
        publish_go_output(config, CONTROL_PLANE, &checkout).await
    }
}

/// Copy the source tree's Dockerfile next to the binary and build the image.
pub(super) async fn publish_go_output(
    config: &BuildConfig,
    component: &str,
    checkout: &Path,
) -> Result<()> {
    let out_dir = config.output_dir(component);
    let dockerfile = checkout.join("Dockerfile");
    if dockerfile.exists() {
        crate::io::ensure_dir(&out_dir)?;
        std::fs::copy(&dockerfile, out_dir.join("Dockerfile")).map_err(|e| {
            ForgeError::Publish {
                component: component.to_string(),
                reason: format!("unable to copy {}: {e}", dockerfile.display()),
            }
        })?;
    } else if !config.runner.is_dry_run() {
        return Err(ForgeError::Publish {
            component: component.to_string(),
            reason: format!("{} not found", dockerfile.display()),
        });
    }
    publish_image(config, component, &out_dir).await?;
    Ok(())
}

/// Recipe compiling a Go package from `checkout` (optionally a subdirectory
/// of it) into `<component>-out/<binary>`.
pub(super) fn go_recipe(
    config: &BuildConfig,
    component: &str,
    repo_url: &str,
    checkout: &Path,
    subdir: Option<&str>,
    binary: &str,
) -> Result<Recipe> {
    let package = package_path(repo_url);
    let gopath_dir = format!("{GOPATH_SRC}/{package}");
    let parent = match package.rsplit_once('/') {
        Some((parent, _)) => format!("{GOPATH_SRC}/{parent}"),
        None => GOPATH_SRC.to_string(),
    };
    let source = paths::in_container(&config.root, checkout);
    let out = paths::in_container(&config.root, &config.output_dir(component));
    let target = match subdir {
        Some(dir) => format!("./{}", dir.trim_start_matches("./")),
        None => ".".to_string(),
    };

    let mut recipe = Recipe::new(component, &config.tool.control_plane_builder_image, &config.root)
        .ssh_key(config.ssh_key());
    if let Some(cache) = config.cache_dir(component)? {
        recipe = recipe.mount(Mount::new(cache, DEP_CACHE));
    }
    Ok(recipe
        .step(Step::shell(
            StepKind::Link,
            GOPATH_SRC,
            format!("mkdir -p {parent} && ln -sfn {source} {gopath_dir}"),
        ))
        .step(Step::shell(
            StepKind::FetchDependencies,
            gopath_dir.as_str(),
            "go get -u github.com/golang/dep/cmd/dep && dep ensure -vendor-only",
        ))
        .step(
            Step::new(
                StepKind::Compile,
                gopath_dir.as_str(),
                ["go", "build", "-o", binary, target.as_str()],
            )
            .with_env("GOOS", "linux")
            .with_env("CGO_ENABLED", "0"),
        )
        .step(Step::new(
            StepKind::CopyOutput,
            gopath_dir.as_str(),
            ["cp".to_string(), "-f".to_string(), binary.to_string(), format!("{out}/")],
        )))
}

pub(super) fn plugins(enabled: &[Feature]) -> Vec<Plugin> {
    enabled
        .iter()
        .filter(|f| f.builds_control_plane())
        .map(|f| Plugin {
            package: format!(
                "{}/{}",
                package_path(&f.source_repo),
                f.control_plane_subdir
                    .as_deref()
                    .unwrap_or_default()
                    .trim_matches('/')
            ),
            repository: f.source_repo.clone(),
            revision: f.source_revision.clone(),
        })
        .collect()
}

pub(super) fn install_file(plugins: &[Plugin]) -> String {
    let mut out = String::from("package install\n\nimport (\n");
    for p in plugins {
        let _ = writeln!(out, "\t_ \"{}\"", p.package);
    }
    out.push_str(")\n");
    out
}

/// One revision constraint per plugin repository.
fn constraints(plugins: &[Plugin]) -> String {
    let repos: BTreeMap<String, &str> = plugins
        .iter()
        .map(|p| (package_path(&p.repository), p.revision.as_str()))
        .collect();
    let mut out = String::new();
    for (name, revision) in repos {
        let _ = write!(
            out,
            "\n[[constraint]]\n  name = \"{name}\"\n  revision = \"{revision}\"\n"
        );
    }
    out
}
