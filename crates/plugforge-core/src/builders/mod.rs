//! Component builders and the registry that names them.

mod addon;
mod control_plane;
mod proxy;
mod publish;

pub use addon::AddonBuilder;
pub use control_plane::ControlPlaneBuilder;
pub use proxy::ProxyBuilder;

use crate::config::ToolConfig;
use crate::downloader::Downloader;
use crate::error::{ForgeError, Result};
use crate::feature::Feature;
use crate::paths;
use crate::runner::Runner;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Target name that selects every registered builder.
pub const ALL: &str = "all";

pub const PROXY: &str = "proxy";
pub const CONTROL_PLANE: &str = "control-plane";

// ---------------------------------------------------------------------------
// BuildConfig
// ---------------------------------------------------------------------------

/// Everything a builder needs for one build invocation.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub root: PathBuf,
    pub tool: ToolConfig,
    pub enabled: Vec<Feature>,
    pub use_cache: bool,
    pub publish: bool,
    /// Empty until the scheduler derives it from `enabled`.
    pub image_tag: String,
    pub docker_user: String,
    pub ssh_key: Option<PathBuf>,
    pub runner: Runner,
}

impl BuildConfig {
    pub fn work_dir(&self) -> PathBuf {
        self.tool.work_dir(&self.root)
    }

    pub fn downloader(&self) -> Downloader {
        Downloader::new(self.runner.clone())
    }

    pub fn image(&self, component: &str) -> String {
        format!("{}/{component}:{}", self.docker_user, self.image_tag)
    }

    pub fn output_dir(&self, component: &str) -> PathBuf {
        paths::output_dir(&self.root, component)
    }

    /// Create the persistent cache directory for `component` when caching is
    /// on. Returns its path.
    pub fn cache_dir(&self, component: &str) -> Result<Option<PathBuf>> {
        if !self.use_cache {
            return Ok(None);
        }
        let dir = paths::cache_dir(&self.root, component);
        if !self.runner.is_dry_run() {
            crate::io::ensure_dir(&dir)?;
        }
        Ok(Some(dir))
    }

    pub fn ssh_key(&self) -> Option<&Path> {
        self.ssh_key.as_deref()
    }

    /// Wrap a failed build step with a pointer to where more detail lives.
    pub fn build_error(&self, component: &str, err: ForgeError) -> ForgeError {
        match err {
            ForgeError::Cancelled { .. } => err,
            other => {
                let mut hint = if self.runner.is_verbose() {
                    "the build output is above".to_string()
                } else {
                    "rerun with --verbose to see the build output".to_string()
                };
                if self.use_cache {
                    let _ = write!(
                        hint,
                        "; cached build state is kept in {} and reused on the next run",
                        paths::cache_dir(&self.root, component).display()
                    );
                }
                ForgeError::BuildProcess {
                    component: component.to_string(),
                    reason: format!("{other}; {hint}"),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentBuilder
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ComponentBuilder: Send + Sync {
    fn name(&self) -> &str;

    /// Produce the component's artifacts in its output directory.
    async fn build(&self, config: &BuildConfig) -> Result<()>;

    /// Package the output directory as an image, pushing it when requested.
    async fn publish(&self, config: &BuildConfig) -> Result<()>;

    async fn build_and_publish(&self, config: &BuildConfig) -> Result<()> {
        self.build(config).await?;
        self.publish(config).await
    }
}

// ---------------------------------------------------------------------------
// BuilderRegistry
// ---------------------------------------------------------------------------

/// Builders by name, in registration order.
#[derive(Default, Clone)]
pub struct BuilderRegistry {
    builders: Vec<Arc<dyn ComponentBuilder>>,
}

impl std::fmt::Debug for BuilderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.builders.iter().map(|b| b.name()))
            .finish()
    }
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The proxy and control-plane builders plus one builder per add-on
    /// that is built from the control-plane tree. `None` means add-ons were
    /// never initialised and only the core builders are registered.
    pub fn standard(addons: Option<&[crate::addon::Addon]>) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(ProxyBuilder))?;
        registry.register(Arc::new(ControlPlaneBuilder))?;
        for addon in addons.unwrap_or_default() {
            if let Some(builder) = AddonBuilder::for_addon(addon) {
                registry.register(Arc::new(builder))?;
            }
        }
        Ok(registry)
    }

    pub fn register(&mut self, builder: Arc<dyn ComponentBuilder>) -> Result<()> {
        let name = builder.name();
        paths::validate_name(name)?;
        if name == ALL || self.builders.iter().any(|b| b.name() == name) {
            return Err(ForgeError::DuplicateName(name.to_string()));
        }
        self.builders.push(builder);
        Ok(())
    }

    /// Registered names followed by `all`.
    pub fn list(&self) -> Vec<String> {
        self.builders
            .iter()
            .map(|b| b.name().to_string())
            .chain(std::iter::once(ALL.to_string()))
            .collect()
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ComponentBuilder>> {
        self.builders
            .iter()
            .find(|b| b.name() == name)
            .cloned()
            .ok_or_else(|| ForgeError::ComponentNotFound(name.to_string()))
    }

    /// Builders selected by `target`: one by name, or every builder for
    /// `all`.
    pub fn resolve(&self, target: &str) -> Result<Vec<Arc<dyn ComponentBuilder>>> {
        if target == ALL {
            Ok(self.builders.clone())
        } else {
            Ok(vec![self.get(target)?])
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryStore, Repository};
    use crate::scheduler::{JobStatus, Scheduler};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Named(&'static str);

    #[async_trait]
    impl ComponentBuilder for Named {
        fn name(&self) -> &str {
            self.0
        }
        async fn build(&self, _config: &BuildConfig) -> Result<()> {
            Ok(())
        }
        async fn publish(&self, _config: &BuildConfig) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn standard_registry_without_addons() {
        let registry = BuilderRegistry::standard(None).unwrap();
        assert_eq!(registry.list(), vec!["proxy", "control-plane", "all"]);
    }

    #[test]
    fn standard_registry_with_default_addons() {
        let addons = crate::addon::default_addons();
        let registry = BuilderRegistry::standard(Some(&addons)).unwrap();
        assert_eq!(
            registry.list(),
            vec![
                "proxy",
                "control-plane",
                "function-discovery",
                "ingress-controller",
                "upstream-discovery",
                "all"
            ]
        );
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut registry = BuilderRegistry::new();
        registry.register(Arc::new(Named("x"))).unwrap();
        assert!(matches!(
            registry.register(Arc::new(Named("x"))),
            Err(ForgeError::DuplicateName(_))
        ));
        assert!(registry.register(Arc::new(Named("all"))).is_err());
    }

    #[test]
    fn resolve_targets() {
        let registry = BuilderRegistry::standard(None).unwrap();
        assert_eq!(registry.resolve("all").unwrap().len(), 2);
        assert_eq!(registry.resolve("proxy").unwrap()[0].name(), "proxy");
        assert!(matches!(
            registry.resolve("nope"),
            Err(ForgeError::ComponentNotFound(_))
        ));
    }

    #[test]
    fn build_errors_point_at_build_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = testing::config(dir.path(), true);
        let err = config.build_error("control-plane", ForgeError::NotInitialized);
        assert!(err.to_string().contains("rerun with --verbose"));
        assert!(!err.to_string().contains("logs"));

        config.use_cache = true;
        let err = config.build_error("control-plane", ForgeError::NotInitialized).to_string();
        assert!(err.contains("rerun with --verbose"));
        assert!(err.contains("cached build state is kept in"));
        assert!(err.contains("cache/control-plane"));
        assert!(!err.contains("logs"));

        config.runner = Runner::new(true, true, tokio_util::sync::CancellationToken::new());
        let err = config.build_error("proxy", ForgeError::NotInitialized).to_string();
        assert!(err.contains("the build output is above"));

        assert!(matches!(
            config.build_error("proxy", ForgeError::Cancelled { binary: "docker".into() }),
            ForgeError::Cancelled { .. }
        ));
    }

    /// Delegates to a real builder and counts how often it is started.
    struct Counted {
        inner: Arc<dyn ComponentBuilder>,
        starts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ComponentBuilder for Counted {
        fn name(&self) -> &str {
            self.inner.name()
        }
        async fn build(&self, config: &BuildConfig) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.inner.build(config).await
        }
        async fn publish(&self, config: &BuildConfig) -> Result<()> {
            self.inner.publish(config).await
        }
    }

    #[tokio::test]
    async fn build_all_leaves_out_disabled_features() {
        const REPO: &str = "https://github.com/acme/filters.git";
        let dir = tempfile::TempDir::new().unwrap();
        let store = RegistryStore::new(dir.path());
        store.init().unwrap();
        let features = ["alpha", "bravo", "charlie"]
            .into_iter()
            .map(|name| {
                Feature::new(name, REPO, "r1")
                    .with_proxy_subdir(format!("{name}/envoy"))
                    .with_control_plane_subdir(format!("{name}/plugin"))
            })
            .collect();
        store
            .register_repository(Repository::new(REPO, "r1"), features)
            .unwrap();
        store.set_enabled("bravo", false).unwrap();

        let enabled = store.enabled_features().unwrap();
        let names: Vec<_> = enabled.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["alpha", "charlie"]);

        let proxy_starts = Arc::new(AtomicUsize::new(0));
        let control_plane_starts = Arc::new(AtomicUsize::new(0));
        let mut registry = BuilderRegistry::new();
        registry
            .register(Arc::new(Counted {
                inner: Arc::new(ProxyBuilder),
                starts: proxy_starts.clone(),
            }))
            .unwrap();
        registry
            .register(Arc::new(Counted {
                inner: Arc::new(ControlPlaneBuilder),
                starts: control_plane_starts.clone(),
            }))
            .unwrap();

        let mut config = testing::config(dir.path(), true);
        config.enabled = enabled.clone();
        let report = Scheduler::new(registry, 2).run(ALL, config).await.unwrap();

        assert!(report.success());
        assert!(report.jobs.iter().all(|j| j.status == JobStatus::Completed));
        assert_eq!(proxy_starts.load(Ordering::SeqCst), 1);
        assert_eq!(control_plane_starts.load(Ordering::SeqCst), 1);

        let build = std::fs::read_to_string(dir.path().join("proxy/BUILD")).unwrap();
        let workspace = std::fs::read_to_string(dir.path().join("proxy/WORKSPACE")).unwrap();
        let install = super::control_plane::install_file(&super::control_plane::plugins(&enabled));
        for generated in [&build, &workspace, &install] {
            assert!(generated.contains("alpha"));
            assert!(generated.contains("charlie"));
            assert!(!generated.contains("bravo"));
        }
    }
}
