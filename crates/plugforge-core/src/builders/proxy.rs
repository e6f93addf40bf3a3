use super::publish::publish_image;
use super::{BuildConfig, ComponentBuilder, PROXY};
use crate::error::Result;
use crate::feature::Feature;
use crate::paths;
use crate::recipe::{Mount, Recipe, Step, StepKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::info;

const BINARY: &str = "envoy";
const BAZEL_CACHE: &str = "/root/.cache/bazel";

const DOCKERFILE: &str = "FROM ubuntu:16.04

ADD envoy /usr/local/bin/envoy

CMD /usr/local/bin/envoy -c /etc/envoy.yaml --service-cluster $CLUSTER --service-node $NODE
";

/// Builds the proxy binary with every enabled proxy filter linked in.
pub struct ProxyBuilder;

/// A filter repository as seen from inside the builder container.
struct Filter {
    name: String,
    path: String,
}

#[async_trait]
impl ComponentBuilder for ProxyBuilder {
    fn name(&self) -> &str {
        PROXY
    }

    async fn build(&self, config: &BuildConfig) -> Result<()> {
        let features: Vec<&Feature> = config.enabled.iter().filter(|f| f.builds_proxy()).collect();
        info!(filters = features.len(), "building proxy");

        let work_dir = config.work_dir();
        let downloader = config.downloader();
        let proxy_src = downloader
            .fetch(&config.tool.proxy_repo, &config.tool.proxy_revision, &work_dir)
            .await?;

        let mut checkouts: HashMap<&str, PathBuf> = HashMap::new();
        let mut filters = Vec::with_capacity(features.len());
        for feature in features {
            let checkout = match checkouts.get(feature.source_repo.as_str()) {
                Some(dir) => dir.clone(),
                None => {
                    let dir = downloader
                        .fetch(&feature.source_repo, &feature.source_revision, &work_dir)
                        .await?;
                    checkouts.insert(&feature.source_repo, dir.clone());
                    dir
                }
            };
            let subdir = feature.proxy_subdir.as_deref().unwrap_or_default();
            filters.push(Filter {
                name: bazel_name(&feature.name),
                path: paths::in_container(&config.root, &checkout.join(subdir)),
            });
        }

        let src_dir = config.root.join(paths::PROXY_SOURCE_DIR);
        crate::io::ensure_dir(&src_dir)?;
        crate::io::atomic_write(&src_dir.join("BUILD"), build_file(&filters).as_bytes())?;
        crate::io::atomic_write(
            &src_dir.join("WORKSPACE"),
            workspace_file(&paths::in_container(&config.root, &proxy_src), &filters).as_bytes(),
        )?;

        let out_dir = config.output_dir(PROXY);
        crate::io::ensure_dir(&out_dir)?;
        let recipe = recipe(config)?;
        let path = recipe.save(&config.root)?;
        info!(recipe = %path.display(), "wrote build recipe");

        recipe
            .execute(&config.runner)
            .await
            .map_err(|e| config.build_error(PROXY, e))
    }

    async fn publish(&self, config: &BuildConfig) -> Result<()> {
        let out_dir = config.output_dir(PROXY);
        crate::io::atomic_write(&out_dir.join("Dockerfile"), DOCKERFILE.as_bytes())?;
        publish_image(config, PROXY, &out_dir).await?;
        Ok(())
    }
}

fn recipe(config: &BuildConfig) -> Result<Recipe> {
    let src = paths::in_container(&config.root, &config.root.join(paths::PROXY_SOURCE_DIR));
    let out = paths::in_container(&config.root, &config.output_dir(PROXY));

    let mut recipe = Recipe::new(PROXY, &config.tool.proxy_builder_image, &config.root)
        .ssh_key(config.ssh_key());
    if let Some(cache) = config.cache_dir(PROXY)? {
        recipe = recipe.mount(Mount::new(cache, BAZEL_CACHE));
    }
    Ok(recipe
        .step(Step::new(
            StepKind::FetchDependencies,
            src.as_str(),
            ["bazel", "fetch", "//:envoy"],
        ))
        .step(Step::new(
            StepKind::Compile,
            src.as_str(),
            ["bazel", "build", "-c", "opt", "//:envoy"],
        ))
        .step(Step::new(
            StepKind::CopyOutput,
            src.as_str(),
            [
                "cp".to_string(),
                "-f".to_string(),
                format!("bazel-bin/{BINARY}"),
                format!("{out}/{BINARY}"),
            ],
        )))
}

/// Bazel repository names allow neither `-` nor `.` in every version.
fn bazel_name(name: &str) -> String {
    name.replace(['-', '.'], "_")
}

fn build_file(filters: &[Filter]) -> String {
    let mut deps = String::new();
    for f in filters {
        let _ = writeln!(deps, "        \"@{}//:filter_lib\",", f.name);
    }
    format!(
        r#"package(default_visibility = ["//visibility:public"])

load("@envoy//bazel:envoy_build_system.bzl", "envoy_cc_binary")

envoy_cc_binary(
    name = "{BINARY}",
    repository = "@envoy",
    deps = [
{deps}        "@envoy//source/exe:envoy_main_entry_lib",
    ],
)
"#
    )
}

fn workspace_file(proxy_src: &str, filters: &[Filter]) -> String {
    let mut out = String::from("workspace(name = \"plugforge\")\n\n");
    let _ = writeln!(
        out,
        "local_repository(\n    name = \"envoy\",\n    path = \"{proxy_src}\",\n)\n"
    );
    for f in filters {
        let _ = writeln!(
            out,
            "local_repository(\n    name = \"{}\",\n    path = \"{}\",\n)\n",
            f.name, f.path
        );
    }
    out.push_str(
        r#"load("@envoy//bazel:repositories.bzl", "envoy_dependencies")
envoy_dependencies()

load("@envoy//bazel:cc_configure.bzl", "cc_configure")
cc_configure()

load("@envoy_api//bazel:repositories.bzl", "api_dependencies")
api_dependencies()
"#,
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::testing;
    use tempfile::TempDir;

    #[tokio::test]
    async fn dry_run_writes_sources_and_recipe() {
        let dir = TempDir::new().unwrap();
        let mut config = testing::config(dir.path(), true);
        config.use_cache = true;
        config.enabled = vec![
            Feature::new("squash", "https://github.com/acme/squash.git", "r1")
                .with_proxy_subdir("envoy"),
            Feature::new("aws", "https://github.com/acme/aws.git", "r2")
                .with_control_plane_subdir("pkg/aws"),
        ];

        ProxyBuilder.build_and_publish(&config).await.unwrap();

        let build = std::fs::read_to_string(dir.path().join("proxy/BUILD")).unwrap();
        assert!(build.contains("\"@squash//:filter_lib\""));
        assert!(!build.contains("@aws"));

        let workspace = std::fs::read_to_string(dir.path().join("proxy/WORKSPACE")).unwrap();
        assert!(workspace.contains("/plugforge/repositories/squash/envoy"));
        assert!(workspace.contains("/plugforge/repositories/envoy\""));

        let recipe = Recipe::load(&dir.path().join("build-proxy.json")).unwrap();
        assert_eq!(recipe.container, "plugforge-build-proxy");
        assert!(recipe.mounts.iter().any(|m| m.container == BAZEL_CACHE));
        assert_eq!(recipe.steps.last().unwrap().kind, StepKind::CopyOutput);

        assert!(dir.path().join("proxy-out/Dockerfile").exists());
        // Dry runs create no cache directory and clone nothing.
        assert!(!dir.path().join("cache").exists());
        assert!(!dir.path().join("repositories").exists());
    }

    #[test]
    fn bazel_names_are_sanitised() {
        assert_eq!(bazel_name("aws-lambda.v2"), "aws_lambda_v2");
    }
}
