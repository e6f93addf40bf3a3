//! Build recipes: the typed list of steps a component build runs inside its
//! builder container.
//!
//! A recipe is persisted as `build-<component>.json` before it runs, so a
//! dry run leaves behind exactly what a real build would execute.

use crate::error::{ForgeError, Result};
use crate::paths;
use crate::runner::{CommandSpec, Runner};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Where a user's SSH key is mounted inside the builder container.
pub const CONTAINER_SSH_KEY: &str = "/etc/plugforge/ssh/id_rsa";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    Link,
    FetchDependencies,
    Compile,
    CopyOutput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub kind: StepKind,
    pub workdir: String,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl Step {
    pub fn new<I, S>(kind: StepKind, workdir: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            workdir: workdir.into(),
            command: command.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
        }
    }

    /// A step that runs `script` through `sh -c`.
    pub fn shell(kind: StepKind, workdir: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(kind, workdir, ["sh".to_string(), "-c".to_string(), script.into()])
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    fn volume_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host.display(), self.container);
        if self.read_only {
            arg.push_str(":ro");
        } else if cfg!(target_os = "macos") {
            arg.push_str(":delegated");
        }
        arg
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub component: String,
    pub image: String,
    pub container: String,
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    pub steps: Vec<Step>,
}

impl Recipe {
    /// A recipe for `component` with the project root mounted at
    /// [`paths::CONTAINER_ROOT`].
    pub fn new(component: &str, image: impl Into<String>, root: &Path) -> Self {
        Self {
            component: component.to_string(),
            image: image.into(),
            container: container_name(component),
            mounts: vec![Mount::new(root, paths::CONTAINER_ROOT)],
            env: BTreeMap::new(),
            steps: Vec::new(),
        }
    }

    pub fn mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Mount `key` read-only and point git at it.
    pub fn ssh_key(self, key: Option<&Path>) -> Self {
        match key {
            Some(key) => self
                .mount(Mount::new(key, CONTAINER_SSH_KEY).read_only())
                .env(
                    "GIT_SSH_COMMAND",
                    format!("ssh -i {CONTAINER_SSH_KEY} -o StrictHostKeyChecking=no"),
                ),
            None => self,
        }
    }

    pub fn path(&self, root: &Path) -> PathBuf {
        paths::recipe_path(root, &self.component)
    }

    pub fn save(&self, root: &Path) -> Result<PathBuf> {
        let path = self.path(root);
        let data = serde_json::to_string_pretty(self)?;
        crate::io::atomic_write(&path, data.as_bytes())?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// `docker run` invocation that starts the long-lived builder container.
    pub fn start_spec(&self) -> CommandSpec {
        let mut spec = CommandSpec::new("docker").args(["run", "-d", "--name", self.container.as_str()]);
        for mount in &self.mounts {
            spec = spec.args(["-v".to_string(), mount.volume_arg()]);
        }
        for (key, value) in &self.env {
            spec = spec.args(["-e".to_string(), format!("{key}={value}")]);
        }
        spec.args([self.image.as_str(), "sleep", "infinity"])
    }

    pub fn exec_spec(&self, step: &Step) -> CommandSpec {
        let mut spec = CommandSpec::new("docker").args(["exec", "-w", step.workdir.as_str()]);
        for (key, value) in &step.env {
            spec = spec.args(["-e".to_string(), format!("{key}={value}")]);
        }
        spec.arg(&self.container).args(step.command.iter().cloned())
    }

    pub fn remove_spec(&self) -> CommandSpec {
        CommandSpec::new("docker").args(["rm", "-f", self.container.as_str()])
    }

    /// Run every step in order inside a fresh builder container. The container
    /// is removed afterwards whether or not the steps succeeded.
    pub async fn execute(&self, runner: &Runner) -> Result<()> {
        info!(component = %self.component, image = %self.image, "starting builder container");
        // A leftover container from an interrupted run would block the name.
        let cleanup = Runner::new(
            runner.is_verbose(),
            runner.is_dry_run(),
            CancellationToken::new(),
        );
        let _ = cleanup.run(&self.remove_spec()).await;

        let result = self.run_steps(runner).await;
        if let Err(e) = cleanup.run(&self.remove_spec()).await {
            tracing::warn!(container = %self.container, "unable to remove builder container: {e}");
        }
        result
    }

    async fn run_steps(&self, runner: &Runner) -> Result<()> {
        runner.run_container(&self.container, &self.start_spec()).await?;
        for step in &self.steps {
            info!(component = %self.component, step = ?step.kind, "running build step");
            runner
                .run_container(&self.container, &self.exec_spec(step))
                .await
                .map_err(|e| match e {
                    ForgeError::Cancelled { .. } => e,
                    other => ForgeError::BuildProcess {
                        component: self.component.clone(),
                        reason: format!("{:?} step failed: {other}", step.kind),
                    },
                })?;
        }
        Ok(())
    }
}

/// Name of the builder container for `component`. Kept apart from the
/// names `deploy local` gives running components.
pub fn container_name(component: &str) -> String {
    format!("{}-build-{component}", paths::TOOL_NAME)
}
