//! Concurrent execution of component builds.

use crate::builders::{BuildConfig, BuilderRegistry};
use crate::error::{ForgeError, Result};
use crate::tag::compute_tag;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "reason")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed(String),
    Cancelled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => f.write_str("queued"),
            JobStatus::Running => f.write_str("running"),
            JobStatus::Completed => f.write_str("completed"),
            JobStatus::Failed(reason) => write!(f, "failed: {reason}"),
            JobStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub component: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
    pub image_tag: String,
    pub jobs: Vec<JobReport>,
}

impl BuildReport {
    /// True when every job completed.
    pub fn success(&self) -> bool {
        self.jobs.iter().all(|j| j.status == JobStatus::Completed)
    }
}

/// Runs the builders selected by a target on a bounded pool.
pub struct Scheduler {
    registry: BuilderRegistry,
    concurrency: usize,
}

impl Scheduler {
    pub fn new(registry: BuilderRegistry, concurrency: usize) -> Self {
        Self {
            registry,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Build and publish every component `target` selects. A failed job does
    /// not stop its siblings; the call returns once every job has settled.
    pub async fn run(&self, target: &str, mut config: BuildConfig) -> Result<BuildReport> {
        let builders = self.registry.resolve(target)?;
        if config.image_tag.is_empty() {
            config.image_tag = compute_tag(&config.enabled);
        }
        info!(
            target,
            jobs = builders.len(),
            concurrency = self.concurrency,
            tag = %config.image_tag,
            "starting build"
        );

        let config = Arc::new(config);
        let cancel = config.runner.cancel_token().clone();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        let closer = {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                semaphore.close();
            })
        };

        let mut handles = Vec::with_capacity(builders.len());
        for builder in builders {
            let sem = semaphore.clone();
            let config = config.clone();
            let cancel = cancel.clone();
            let component = builder.name().to_string();
            info!(component = %component, status = %JobStatus::Queued, "job queued");
            let handle = tokio::spawn(async move {
                let _permit = match sem.acquire().await {
                    Ok(p) => p,
                    // semaphore closed
                    Err(_) => return JobStatus::Cancelled,
                };
                if cancel.is_cancelled() {
                    return JobStatus::Cancelled;
                }
                info!(component = builder.name(), status = %JobStatus::Running, "job started");
                match builder.build_and_publish(&config).await {
                    Ok(()) => JobStatus::Completed,
                    Err(ForgeError::Cancelled { .. }) => JobStatus::Cancelled,
                    Err(e) => {
                        error!(component = builder.name(), "build failed: {e}");
                        JobStatus::Failed(e.to_string())
                    }
                }
            });
            handles.push((component, handle));
        }

        let mut jobs = Vec::with_capacity(handles.len());
        for (component, handle) in handles {
            let status = match handle.await {
                Ok(status) => status,
                Err(e) => JobStatus::Failed(format!("task join error: {e}")),
            };
            match &status {
                JobStatus::Completed => info!(component, "job completed"),
                JobStatus::Cancelled => warn!(component, "job cancelled"),
                _ => {}
            }
            jobs.push(JobReport { component, status });
        }
        closer.abort();

        Ok(BuildReport {
            image_tag: config.image_tag.clone(),
            jobs,
        })
    }
}
