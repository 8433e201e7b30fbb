//! Target-style scheduling wiring.
//!
//! Translates build-tool names into scheduled jobs. A name is either a
//! plain job name, a `package:builder` pair, or a target reference in
//! bracket syntax (`{project:target}` or `{project:target:configuration}`).
//! Target references are resolved through a [`TargetRegistry`] composed
//! into the scheduler's fallback chain; the runner wires each job's `log`
//! channel into tracing and its `progress` channel into an external
//! reporter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use serde_json::Value;

use crate::handler::JobHandler;
use crate::registry::Registry;
use crate::scheduler::{Job, Scheduler};

static TARGET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\{([^:{}]+):([^:{}]+)(?::([^:{}]+))?\}$").expect("target pattern is valid")
});

/// Reference to a project target, written `{project:target}` or
/// `{project:target:configuration}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetRef {
    pub project: String,
    pub target: String,
    pub configuration: Option<String>,
}

impl TargetRef {
    /// Create a reference without a configuration.
    pub fn new(project: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            target: target.into(),
            configuration: None,
        }
    }

    /// Set the configuration segment.
    pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.configuration = Some(configuration.into());
        self
    }

    /// Parse a bracketed target name. Returns `None` for anything else,
    /// including plain job names and `package:builder` pairs.
    pub fn parse(name: &str) -> Option<Self> {
        let captures = TARGET_PATTERN.captures(name)?;
        Some(Self {
            project: captures[1].to_string(),
            target: captures[2].to_string(),
            configuration: captures.get(3).map(|m| m.as_str().to_string()),
        })
    }
}

impl std::fmt::Display for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.configuration {
            Some(configuration) => {
                write!(f, "{{{}:{}:{}}}", self.project, self.target, configuration)
            }
            None => write!(f, "{{{}:{}}}", self.project, self.target),
        }
    }
}

/// Whether a name uses the bracketed target syntax.
pub fn is_target_name(name: &str) -> bool {
    TARGET_PATTERN.is_match(name)
}

/// Resolves a target reference to a handler, typically by consulting
/// workspace configuration. Injected; the engine never reads projects.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self, target: &TargetRef) -> Option<Arc<dyn JobHandler>>;
}

/// A registry that only answers bracketed target names, delegating to a
/// [`TargetResolver`]. Compose it with plain registries through
/// [`crate::registry::FallbackRegistry`].
pub struct TargetRegistry {
    resolver: Arc<dyn TargetResolver>,
}

impl TargetRegistry {
    pub fn new(resolver: Arc<dyn TargetResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Registry for TargetRegistry {
    async fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        let target = TargetRef::parse(name)?;
        self.resolver.resolve(&target).await
    }
}

/// External consumer for a job's `progress` channel.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, run: u64, job: &str, progress: Value);
}

/// Default reporter: progress entries go to tracing.
pub struct TracingProgress;

#[async_trait]
impl ProgressReporter for TracingProgress {
    async fn report(&self, run: u64, job: &str, progress: Value) {
        tracing::info!(run, job, progress = %progress, "target progress");
    }
}

/// Schedules target runs and wires their log/progress channels.
pub struct TargetRunner {
    scheduler: Scheduler,
    reporter: Arc<dyn ProgressReporter>,
    /// Per-runner counter for target-run numbering.
    next_run: AtomicU64,
}

impl TargetRunner {
    pub fn new(scheduler: Scheduler, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            scheduler,
            reporter,
            next_run: AtomicU64::new(1),
        }
    }

    /// Schedule a job by plain name, `package:builder` pair, or bracketed
    /// target reference, attaching a unique numeric run id and forwarding
    /// its `log` and `progress` channels.
    pub fn run(&self, name: &str, argument: Value) -> TargetRun {
        let id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let job = self.scheduler.schedule(name, argument);
        forward_log(id, &job);
        forward_progress(id, &job, Arc::clone(&self.reporter));
        tracing::debug!(run = id, job = %name, "target run scheduled");
        TargetRun { id, job }
    }

    /// Schedule a target reference directly.
    pub fn run_target(&self, target: &TargetRef, argument: Value) -> TargetRun {
        self.run(&target.to_string(), argument)
    }
}

fn forward_log(run: u64, job: &Job) {
    let mut log = job.get_channel("log");
    let name = job.name().to_string();
    tokio::spawn(async move {
        while let Some(item) = log.next().await {
            match item {
                Ok(entry) => emit_log(run, &name, &entry),
                Err(error) => {
                    tracing::warn!(run, job = %name, error = %error, "log channel errored");
                }
            }
        }
    });
}

fn forward_progress(run: u64, job: &Job, reporter: Arc<dyn ProgressReporter>) {
    let mut progress = job.get_channel("progress");
    let name = job.name().to_string();
    tokio::spawn(async move {
        while let Some(item) = progress.next().await {
            match item {
                Ok(entry) => reporter.report(run, &name, entry).await,
                Err(error) => {
                    tracing::warn!(run, job = %name, error = %error, "progress channel errored");
                }
            }
        }
    });
}

/// Map a structured log entry onto tracing. Entries are plain strings or
/// objects with optional `level` and `message` fields.
fn emit_log(run: u64, job: &str, entry: &Value) {
    let (level, message) = match entry {
        Value::String(text) => ("info", text.clone()),
        Value::Object(map) => {
            let level = map.get("level").and_then(Value::as_str).unwrap_or("info");
            let message = match map.get("message") {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => entry.to_string(),
            };
            (level, message)
        }
        other => ("info", other.to_string()),
    };
    match level {
        "debug" => tracing::debug!(run, job, "{message}"),
        "warn" => tracing::warn!(run, job, "{message}"),
        "error" => tracing::error!(run, job, "{message}"),
        _ => tracing::info!(run, job, "{message}"),
    }
}

/// One numbered target run.
pub struct TargetRun {
    id: u64,
    job: Job,
}

impl TargetRun {
    /// The unique run number attached by the runner.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The underlying job handle.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Request the underlying job to stop and wait for its outbound
    /// stream to drain.
    pub async fn stop(&self) {
        self.job.stop();
        self.job.join().await;
    }
}
