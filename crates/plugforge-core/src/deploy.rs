//! Deployment of built images to Kubernetes (through the control plane's Helm
//! chart) or to the local Docker daemon.

use crate::addon::{Addon, AddonKind};
use crate::config::ToolConfig;
use crate::downloader::{repo_dir, Downloader};
use crate::error::{ForgeError, Result};
use crate::paths;
use crate::runner::{CommandSpec, Runner};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::info;

pub const DEFAULT_NAMESPACE: &str = "gloo-system";
pub const LOCAL_NETWORK: &str = "plugforge";

const DEFAULT_RELEASE_PREFIX: &str = "RELEASE-NAME-";
const PROMETHEUS_REPO_NAME: &str = "coreos";
const PROMETHEUS_REPO_URL: &str = "https://s3-eu-west-1.amazonaws.com/coreos-charts/stable/";
const PROMETHEUS_CHART: &str = "coreos/prometheus-operator";

fn release_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+release: RELEASE-NAME").expect("valid regex"))
}

// ---------------------------------------------------------------------------
// Generated documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageValues {
    pub image: String,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonValues {
    pub enabled: bool,
    pub config_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(flatten)]
    pub configuration: BTreeMap<String, String>,
}

/// Values handed to the control-plane chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartValues {
    pub namespace: String,
    pub proxy: ImageValues,
    pub control_plane: ImageValues,
    /// Keyed by [`Addon::safe_name`].
    pub addons: BTreeMap<String, AddonValues>,
}

impl ChartValues {
    pub fn new(namespace: &str, docker_user: &str, tag: &str, addons: &[Addon]) -> Self {
        let image = |component: &str| ImageValues {
            image: format!("{docker_user}/{component}"),
            tag: tag.to_string(),
        };
        Self {
            namespace: namespace.to_string(),
            proxy: image(crate::builders::PROXY),
            control_plane: image(crate::builders::CONTROL_PLANE),
            addons: addons
                .iter()
                .map(|a| {
                    (
                        a.safe_name(),
                        AddonValues {
                            enabled: a.enabled,
                            config_only: a.config_only,
                            image: a.image_ref(docker_user, tag),
                            configuration: a.configuration.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Manifest<'a> {
    api_version: &'a str,
    kind: &'a str,
    metadata: Metadata<'a>,
}

#[derive(Serialize)]
struct Metadata<'a> {
    name: &'a str,
}

/// Namespace manifest applied before the chart is installed.
pub fn bootstrap(namespace: &str) -> Result<String> {
    Ok(serde_yaml::to_string(&Manifest {
        api_version: "v1",
        kind: "Namespace",
        metadata: Metadata { name: namespace },
    })?)
}

/// Drop the placeholder release name Helm renders when none was given.
pub fn strip_default_release(rendered: &str) -> String {
    let text = rendered.replace(DEFAULT_RELEASE_PREFIX, "");
    release_label_re().replace_all(&text, "").into_owned()
}

// ---------------------------------------------------------------------------
// Deployer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct K8sOptions {
    pub namespace: String,
    pub resume: bool,
    pub generate_install: bool,
    pub release_name: Option<String>,
}

impl Default for K8sOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            resume: false,
            generate_install: false,
            release_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum K8sOutcome {
    /// `install.yaml` was written; nothing was applied.
    InstallGenerated(PathBuf),
    Installed,
}

pub struct Deployer {
    pub root: PathBuf,
    pub tool: ToolConfig,
    pub docker_user: String,
    pub image_tag: String,
    pub runner: Runner,
}

impl Deployer {
    fn chart_dir(&self, checkout: &Path) -> PathBuf {
        checkout
            .join("install")
            .join("helm")
            .join(repo_dir(&self.tool.control_plane_repo))
    }

    async fn control_plane_checkout(&self) -> Result<PathBuf> {
        let work_dir = self.tool.work_dir(&self.root);
        let checkout = work_dir.join(repo_dir(&self.tool.control_plane_repo));
        if checkout.exists() {
            return Ok(checkout);
        }
        info!(repo = %self.tool.control_plane_repo, "downloading control plane");
        Downloader::new(self.runner.clone())
            .fetch(
                &self.tool.control_plane_repo,
                &self.tool.control_plane_revision,
                &work_dir,
            )
            .await
    }

    /// Write the chart values and bootstrap manifest into the project root.
    pub fn write_values(&self, namespace: &str, addons: &[Addon]) -> Result<()> {
        let values = ChartValues::new(namespace, &self.docker_user, &self.image_tag, addons);
        let values_path = self.root.join(paths::CHART_VALUES_FILE);
        crate::io::atomic_write(&values_path, serde_yaml::to_string(&values)?.as_bytes())?;
        crate::io::atomic_write(
            &self.root.join(paths::BOOTSTRAP_FILE),
            bootstrap(namespace)?.as_bytes(),
        )?;
        info!(path = %values_path.display(), "generated chart values");
        Ok(())
    }

    pub async fn k8s(&self, addons: &[Addon], options: &K8sOptions) -> Result<K8sOutcome> {
        if options.resume && options.generate_install {
            return Err(ForgeError::Deploy(
                "--resume and --generate-install cannot be used together".into(),
            ));
        }
        let namespace = if options.namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            options.namespace.as_str()
        };

        let checkout = self.control_plane_checkout().await?;
        let chart = self.chart_dir(&checkout);
        let values = self.root.join(paths::CHART_VALUES_FILE);
        let bootstrap_path = self.root.join(paths::BOOTSTRAP_FILE);

        if options.resume {
            if !values.exists() {
                return Err(ForgeError::Deploy(format!(
                    "{} not found; run without --resume first",
                    values.display()
                )));
            }
        } else {
            self.write_values(namespace, addons)?;
        }

        let mut helm_args = vec![
            chart.to_string_lossy().into_owned(),
            "-f".to_string(),
            values.to_string_lossy().into_owned(),
            "--namespace".to_string(),
            namespace.to_string(),
        ];
        if let Some(name) = &options.release_name {
            helm_args.extend(["--name".to_string(), name.clone()]);
        }

        if options.generate_install {
            let rendered = self
                .runner
                .capture(&CommandSpec::new("helm").arg("template").args(&helm_args))
                .await
                .map_err(|e| deploy_error("unable to render chart", e))?;
            let rendered = match options.release_name {
                Some(_) => rendered,
                None => strip_default_release(&rendered),
            };
            let install = format!("{}\n{rendered}", bootstrap(namespace)?);
            let path = self.root.join(paths::INSTALL_FILE);
            crate::io::atomic_write(&path, install.as_bytes())?;
            info!(path = %path.display(), "generated install manifest");
            return Ok(K8sOutcome::InstallGenerated(path));
        }

        if installs_metrics(addons) {
            info!("installing prometheus operator");
            self.runner
                .run(&CommandSpec::new("helm").args([
                    "repo",
                    "add",
                    PROMETHEUS_REPO_NAME,
                    PROMETHEUS_REPO_URL,
                ]))
                .await
                .map_err(|e| deploy_error("unable to add prometheus operator repository", e))?;
            self.runner
                .run(&CommandSpec::new("helm").args([
                    "install",
                    PROMETHEUS_CHART,
                    "--name",
                    "prometheus-operator",
                    "--namespace",
                    namespace,
                ]))
                .await
                .map_err(|e| deploy_error("unable to install prometheus operator", e))?;
        }

        self.runner
            .run(&CommandSpec::new("kubectl").arg("apply").arg("-f").arg(bootstrap_path.to_string_lossy()))
            .await
            .map_err(|e| deploy_error("unable to apply bootstrap", e))?;
        self.runner
            .run(&CommandSpec::new("helm").arg("install").args(&helm_args))
            .await
            .map_err(|e| deploy_error("helm install failed", e))?;
        Ok(K8sOutcome::Installed)
    }

    /// Start the control plane, the proxy and every installable add-on on a
    /// dedicated Docker network. Returns the started container names.
    pub async fn local(&self, addons: &[Addon]) -> Result<Vec<String>> {
        self.ensure_network().await?;

        let mut images = vec![
            (
                crate::builders::CONTROL_PLANE.to_string(),
                format!("{}/{}:{}", self.docker_user, crate::builders::CONTROL_PLANE, self.image_tag),
            ),
            (
                crate::builders::PROXY.to_string(),
                format!("{}/{}:{}", self.docker_user, crate::builders::PROXY, self.image_tag),
            ),
        ];
        images.extend(addons.iter().filter(|a| a.installs_container()).filter_map(|a| {
            a.image_ref(&self.docker_user, &self.image_tag)
                .map(|image| (a.name.clone(), image))
        }));

        let mut started = Vec::with_capacity(images.len());
        for (component, image) in images {
            let name = container_name(&component);
            info!(container = %name, image = %image, "starting container");
            self.runner
                .run(&CommandSpec::new("docker").args([
                    "run",
                    "-d",
                    "--name",
                    name.as_str(),
                    "--network",
                    LOCAL_NETWORK,
                    image.as_str(),
                ]))
                .await
                .map_err(|e| deploy_error(&format!("unable to start {component}"), e))?;
            started.push(name);
        }
        Ok(started)
    }

    async fn ensure_network(&self) -> Result<()> {
        let inspect = CommandSpec::new("docker").args(["network", "inspect", LOCAL_NETWORK]);
        let exists = !self.runner.is_dry_run()
            && match self.runner.capture(&inspect).await {
                Ok(_) => true,
                Err(ForgeError::ProcessFailed { .. }) => false,
                Err(e) => return Err(e),
            };
        if exists {
            return Ok(());
        }
        self.runner
            .run(&CommandSpec::new("docker").args(["network", "create", LOCAL_NETWORK]))
            .await
            .map_err(|e| deploy_error("unable to create docker network", e))
    }
}

/// True when the metrics add-on asks for a managed installation.
/// Name of the container `deploy local` runs for `component`.
pub fn container_name(component: &str) -> String {
    format!("{}-{component}", paths::TOOL_NAME)
}

fn installs_metrics(addons: &[Addon]) -> bool {
    addons
        .iter()
        .any(|a| a.kind == AddonKind::Metrics && a.installs_container())
}

fn deploy_error(context: &str, err: ForgeError) -> ForgeError {
    match err {
        ForgeError::Cancelled { .. } | ForgeError::BinaryNotFound { .. } => err,
        other => ForgeError::Deploy(format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addon::{default_addons, AddonSettings};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn deployed_containers_do_not_share_build_names() {
        for component in ["proxy", "control-plane", "metrics"] {
            assert_ne!(
                container_name(component),
                crate::recipe::container_name(component)
            );
        }
        assert_eq!(container_name("proxy"), "plugforge-proxy");
        assert_eq!(crate::recipe::container_name("proxy"), "plugforge-build-proxy");
    }

    fn deployer(root: &Path) -> Deployer {
        Deployer {
            root: root.to_path_buf(),
            tool: ToolConfig::default(),
            docker_user: "me".into(),
            image_tag: "abcd1234".into(),
            runner: Runner::new(false, true, CancellationToken::new()),
        }
    }

    fn with_metrics_installed() -> Vec<Addon> {
        let mut addons = default_addons();
        for addon in addons.iter_mut().filter(|a| a.name == "metrics") {
            addon.configure(AddonSettings::InstallManaged {
                options: BTreeMap::new(),
            });
        }
        addons
    }

    #[test]
    fn chart_values_reference_project_images() {
        let values = ChartValues::new("ns", "me", "t1", &default_addons());
        assert_eq!(values.proxy.image, "me/proxy");
        assert_eq!(values.control_plane.tag, "t1");
        let discovery = &values.addons["function_discovery"];
        assert_eq!(discovery.image.as_deref(), Some("me/function-discovery:t1"));
        let metrics = &values.addons["metrics"];
        assert!(!metrics.enabled);
        assert_eq!(metrics.configuration["status"], "disable");
    }

    #[test]
    fn bootstrap_is_a_namespace() {
        let yaml = bootstrap("team-a").unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(doc["kind"].as_str(), Some("Namespace"));
        assert_eq!(doc["apiVersion"].as_str(), Some("v1"));
        assert_eq!(doc["metadata"]["name"].as_str(), Some("team-a"));
    }

    #[test]
    fn default_release_markers_removed() {
        let rendered = "name: RELEASE-NAME-gloo\nlabels:\n  app: gloo\n  release: RELEASE-NAME\n";
        let out = strip_default_release(rendered);
        assert!(!out.contains("RELEASE-NAME"));
        assert!(out.contains("name: gloo"));
        assert!(out.contains("app: gloo"));
    }

    #[test]
    fn metrics_install_detection() {
        assert!(!installs_metrics(&default_addons()));
        assert!(installs_metrics(&with_metrics_installed()));
    }

    #[tokio::test]
    async fn resume_conflicts_with_generate_install() {
        let dir = TempDir::new().unwrap();
        let options = K8sOptions {
            resume: true,
            generate_install: true,
            ..K8sOptions::default()
        };
        let err = deployer(dir.path()).k8s(&[], &options).await.unwrap_err();
        assert!(matches!(err, ForgeError::Deploy(_)));
        assert!(!dir.path().join(paths::CHART_VALUES_FILE).exists());
    }

    #[tokio::test]
    async fn resume_requires_existing_values() {
        let dir = TempDir::new().unwrap();
        let options = K8sOptions {
            resume: true,
            ..K8sOptions::default()
        };
        let err = deployer(dir.path()).k8s(&[], &options).await.unwrap_err();
        assert!(err.to_string().contains("--resume"));
    }

    #[tokio::test]
    async fn dry_run_install_writes_values_and_bootstrap() {
        let dir = TempDir::new().unwrap();
        let outcome = deployer(dir.path())
            .k8s(&with_metrics_installed(), &K8sOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, K8sOutcome::Installed);

        let values = std::fs::read_to_string(dir.path().join(paths::CHART_VALUES_FILE)).unwrap();
        let values: ChartValues = serde_yaml::from_str(&values).unwrap();
        assert_eq!(values.namespace, DEFAULT_NAMESPACE);
        assert!(values.addons["metrics"].enabled);
        assert!(dir.path().join(paths::BOOTSTRAP_FILE).exists());
    }

    #[tokio::test]
    async fn generate_install_prepends_bootstrap() {
        let dir = TempDir::new().unwrap();
        let options = K8sOptions {
            namespace: "team-a".into(),
            generate_install: true,
            ..K8sOptions::default()
        };
        let outcome = deployer(dir.path()).k8s(&default_addons(), &options).await.unwrap();
        let path = dir.path().join(paths::INSTALL_FILE);
        assert_eq!(outcome, K8sOutcome::InstallGenerated(path.clone()));
        let install = std::fs::read_to_string(path).unwrap();
        assert!(install.starts_with(&bootstrap("team-a").unwrap()));
    }

    #[tokio::test]
    async fn local_starts_core_and_installable_addons() {
        let dir = TempDir::new().unwrap();
        let started = deployer(dir.path())
            .local(&with_metrics_installed())
            .await
            .unwrap();
        assert_eq!(
            started,
            vec![
                "plugforge-control-plane",
                "plugforge-proxy",
                "plugforge-function-discovery",
                "plugforge-ingress-controller",
                "plugforge-upstream-discovery",
                "plugforge-metrics",
            ]
        );
    }
}
