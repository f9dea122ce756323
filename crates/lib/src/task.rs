//! External task runner: one invocation per prompt, raced against a timeout.
//!
//! The executor behind it is pluggable; [`crate::exec::ProcessExecutor`] runs a
//! local CLI, tests use scripted executors.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("failed to start task: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("task io failed: {0}")]
    Io(#[from] std::io::Error),
}

/// What a finished invocation reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskCompletion {
    pub succeeded: bool,
    /// Exit status description (e.g. "exit status: 1").
    pub exit_reason: String,
    pub stdout: String,
    pub stderr: String,
}

/// A started invocation.
#[async_trait]
pub trait RunningTask: Send {
    /// Wait for the task to finish and collect its output.
    async fn wait(&mut self) -> Result<TaskCompletion, TaskError>;

    /// Ask the task to stop. Must not wait for it to exit.
    fn terminate(&mut self);
}

/// Starts external task invocations.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn start(&self, prompt: &str) -> Result<Box<dyn RunningTask>, TaskError>;
}

/// Why a task did not produce a usable answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    NotFound,
    Permission,
    Network,
    RateLimited,
    EmptyResponse,
    Generic,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NotFound => "not-found",
            FailureReason::Permission => "permission",
            FailureReason::Network => "network",
            FailureReason::RateLimited => "rate-limited",
            FailureReason::EmptyResponse => "empty-response",
            FailureReason::Generic => "generic",
        }
    }

    /// Classify diagnostic output by known substrings; first match wins.
    pub fn classify(diagnostic: &str) -> Self {
        let d = diagnostic.to_ascii_lowercase();
        if d.contains("not found") || d.contains("no such file") || d.contains("enoent") {
            FailureReason::NotFound
        } else if d.contains("permission denied") || d.contains("eacces") || d.contains("eperm") {
            FailureReason::Permission
        } else if d.contains("network")
            || d.contains("econnrefused")
            || d.contains("econnreset")
            || d.contains("enotfound")
            || d.contains("etimedout")
            || d.contains("connection")
        {
            FailureReason::Network
        } else if d.contains("rate limit")
            || d.contains("rate_limit")
            || d.contains("quota")
            || d.contains("usage limit")
            || d.contains("429")
        {
            FailureReason::RateLimited
        } else {
            FailureReason::Generic
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized result of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success(String),
    Failure { reason: FailureReason, detail: String },
    Timeout,
}

impl TaskOutcome {
    fn from_completion(completion: TaskCompletion) -> Self {
        if !completion.succeeded {
            let diagnostic = if completion.stderr.trim().is_empty() {
                &completion.stdout
            } else {
                &completion.stderr
            };
            let detail = if diagnostic.trim().is_empty() {
                completion.exit_reason.clone()
            } else {
                format!("{}: {}", completion.exit_reason, diagnostic.trim())
            };
            return TaskOutcome::Failure {
                reason: FailureReason::classify(diagnostic),
                detail,
            };
        }
        if completion.stdout.trim().is_empty() {
            return TaskOutcome::Failure {
                reason: FailureReason::EmptyResponse,
                detail: String::new(),
            };
        }
        TaskOutcome::Success(completion.stdout)
    }
}

/// Runs the external task under a timeout.
#[derive(Clone)]
pub struct ExternalTaskRunner {
    executor: Arc<dyn TaskExecutor>,
}

impl ExternalTaskRunner {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self { executor }
    }

    /// Start one invocation and wait for it or the timer, whichever comes first.
    /// On timeout the task is told to stop and `Timeout` is returned immediately.
    pub async fn run(&self, prompt: &str, timeout: Duration) -> TaskOutcome {
        let mut task = match self.executor.start(prompt).await {
            Ok(task) => task,
            Err(TaskError::Spawn(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return TaskOutcome::Failure {
                    reason: FailureReason::NotFound,
                    detail: e.to_string(),
                };
            }
            Err(TaskError::Spawn(e)) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return TaskOutcome::Failure {
                    reason: FailureReason::Permission,
                    detail: e.to_string(),
                };
            }
            Err(e) => {
                return TaskOutcome::Failure {
                    reason: FailureReason::Generic,
                    detail: e.to_string(),
                };
            }
        };

        match tokio::time::timeout(timeout, task.wait()).await {
            Ok(Ok(completion)) => TaskOutcome::from_completion(completion),
            Ok(Err(e)) => TaskOutcome::Failure {
                reason: FailureReason::Generic,
                detail: e.to_string(),
            },
            Err(_) => {
                log::warn!("task: timed out after {}s, terminating", timeout.as_secs());
                task.terminate();
                TaskOutcome::Timeout
            }
        }
    }
}
