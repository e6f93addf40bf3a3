//! External process execution.
//!
//! Every git, docker, helm and kubectl invocation goes through [`Runner`], so
//! dry-run, verbose streaming and interrupt handling behave the same for all
//! of them.

use crate::error::{ForgeError, Result};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines of stderr kept for the failure report of a quiet run.
const STDERR_TAIL: usize = 20;

// ---------------------------------------------------------------------------
// CommandSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub binary: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Short program name used to prefix streamed output.
    pub fn program(&self) -> &str {
        Path::new(&self.binary)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.binary)
    }

    fn joined_args(&self) -> String {
        self.args
            .iter()
            .map(|a| quote(a))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote(&self.binary))?;
        if !self.args.is_empty() {
            write!(f, " {}", self.joined_args())?;
        }
        Ok(())
    }
}

fn quote(s: &str) -> String {
    if !s.is_empty() && !s.contains(|c: char| c.is_whitespace() || c == '"' || c == '\'') {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Executes [`CommandSpec`]s.
///
/// Cloning is cheap; clones share the cancellation token.
#[derive(Debug, Clone)]
pub struct Runner {
    verbose: bool,
    dry_run: bool,
    cancel: CancellationToken,
}

impl Runner {
    pub fn new(verbose: bool, dry_run: bool, cancel: CancellationToken) -> Self {
        Self {
            verbose,
            dry_run,
            cancel,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run a command to completion.
    pub async fn run(&self, spec: &CommandSpec) -> Result<()> {
        self.execute(spec, None, false).await.map(|_| ())
    }

    /// Run a command that starts the named container. On cancellation the
    /// child is killed and the container is stopped.
    pub async fn run_container(&self, container: &str, spec: &CommandSpec) -> Result<()> {
        self.execute(spec, Some(container), false).await.map(|_| ())
    }

    /// Run a command and return its stdout. A dry run returns an empty string.
    pub async fn capture(&self, spec: &CommandSpec) -> Result<String> {
        self.execute(spec, None, true).await
    }

    async fn execute(
        &self,
        spec: &CommandSpec,
        container: Option<&str>,
        capture: bool,
    ) -> Result<String> {
        if self.dry_run {
            info!("[dry-run] {spec}");
            return Ok(String::new());
        }
        if self.cancel.is_cancelled() {
            return Err(ForgeError::Cancelled {
                binary: spec.program().to_string(),
            });
        }
        if self.verbose {
            info!("{spec}");
        } else {
            debug!("{spec}");
        }

        which::which(&spec.binary).map_err(|_| ForgeError::BinaryNotFound {
            binary: spec.binary.clone(),
        })?;

        let mut cmd = Command::new(&spec.binary);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| ForgeError::ProcessStart {
            binary: spec.binary.clone(),
            reason: e.to_string(),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| ForgeError::ProcessStart {
            binary: spec.binary.clone(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ForgeError::ProcessStart {
            binary: spec.binary.clone(),
            reason: "failed to capture stderr".into(),
        })?;

        let prefix = spec.program().to_string();
        let echo = self.verbose;
        let stdout_task = tokio::spawn(drain(stdout, prefix.clone(), echo, capture.then_some(usize::MAX)));
        let stderr_task = tokio::spawn(drain(stderr, prefix, echo, Some(STDERR_TAIL)));

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = self.cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                if let Some(name) = container {
                    stop_container(name).await;
                }
                return Err(ForgeError::Cancelled { binary: spec.program().to_string() });
            }
        };

        let (out, err) = tokio::join!(stdout_task, stderr_task);
        let out = out.unwrap_or_default();
        let err = err.unwrap_or_default();

        if !status.success() {
            if !echo {
                for line in &err {
                    warn!("{}: {line}", spec.program());
                }
            }
            return Err(ForgeError::ProcessFailed {
                binary: spec.binary.clone(),
                args: spec.joined_args(),
                status: status
                    .code()
                    .map(|c| format!("exit code {c}"))
                    .unwrap_or_else(|| "a signal".to_string()),
            });
        }

        let mut text = out.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        Ok(text)
    }
}

/// Read a child stream line by line. Echoes each line when `echo` is set and
/// keeps at most `keep` trailing lines.
async fn drain<R>(reader: R, prefix: String, echo: bool, keep: Option<usize>) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut kept = VecDeque::new();
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if echo {
            println!("{prefix}: {line}");
        }
        if let Some(max) = keep {
            if kept.len() == max {
                kept.pop_front();
            }
            kept.push_back(line);
        }
    }
    kept.into()
}

async fn stop_container(name: &str) {
    info!(container = name, "stopping container");
    let result = Command::new("docker")
        .args(["stop", name])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if status.success() => {}
        _ => warn!(container = name, "error stopping docker container"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn runner() -> Runner {
        Runner::new(false, false, CancellationToken::new())
    }

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let spec = CommandSpec::new("docker").args(["run", "-e", "A=b c"]);
        assert_eq!(spec.to_string(), "docker run -e 'A=b c'");
        assert_eq!(CommandSpec::new("/usr/bin/git").program(), "git");
    }

    #[tokio::test]
    async fn capture_collects_stdout() {
        let out = runner()
            .capture(&CommandSpec::new("echo").arg("hello"))
            .await
            .unwrap();
        assert_eq!(out, "hello\n");
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let err = runner().run(&CommandSpec::new("false")).await.unwrap_err();
        match err {
            ForgeError::ProcessFailed { binary, status, .. } => {
                assert_eq!(binary, "false");
                assert_eq!(status, "exit code 1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_reported_before_spawn() {
        let err = runner()
            .run(&CommandSpec::new("plugforge-no-such-binary"))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::BinaryNotFound { .. }));
    }

    #[tokio::test]
    async fn dry_run_executes_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("marker");
        let runner = Runner::new(false, true, CancellationToken::new());
        runner
            .run(&CommandSpec::new("touch").arg(marker.to_string_lossy()))
            .await
            .unwrap();
        assert!(!marker.exists());
        assert_eq!(
            runner.capture(&CommandSpec::new("echo").arg("x")).await.unwrap(),
            ""
        );
    }

    #[tokio::test]
    async fn working_directory_and_env_are_applied() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = runner()
            .capture(
                &CommandSpec::new("sh")
                    .args(["-c", "pwd; echo $PLUGFORGE_TEST"])
                    .current_dir(dir.path())
                    .env("PLUGFORGE_TEST", "value"),
            )
            .await
            .unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(out.contains(canonical.to_str().unwrap()));
        assert!(out.contains("value"));
    }

    #[tokio::test]
    async fn cancellation_kills_running_child() {
        let token = CancellationToken::new();
        let runner = Runner::new(false, false, token.clone());
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            runner.run(&CommandSpec::new("sleep").arg("30")),
        )
        .await
        .expect("cancelled run returns promptly");
        assert!(matches!(result, Err(ForgeError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn cancelled_token_prevents_spawn() {
        let token = CancellationToken::new();
        token.cancel();
        let runner = Runner::new(false, false, token);
        assert!(matches!(
            runner.run(&CommandSpec::new("true")).await,
            Err(ForgeError::Cancelled { .. })
        ));
    }
}
