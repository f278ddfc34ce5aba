pub mod classify;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod governor;
pub mod probe;
pub mod runner;
pub mod sandbox;
pub mod slot;
pub mod state;
pub mod submission;
pub mod worker;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Error as CrateError;

/// Normalized outcome of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Accepted,
    CompileError,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    SandboxError,
}

impl Verdict {
    /// Verdicts that are a deterministic consequence of the submitted program.
    pub fn is_user_outcome(&self) -> bool {
        !matches!(self, Verdict::SandboxError)
    }

    /// Short human label, as printed by the front ends.
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Accepted => "Accepted",
            Verdict::CompileError => "Compile error",
            Verdict::RuntimeError => "Runtime error",
            Verdict::TimeLimitExceeded => "Time limit exceeded",
            Verdict::MemoryLimitExceeded => "Memory limit exceeded",
            Verdict::SandboxError => "Sandbox error",
        }
    }
}

/// Why the infrastructure, not the program, failed to produce an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum SandboxFailure {
    #[error("queue full")]
    QueueFull,
    #[error("cancelled")]
    Cancelled,
    #[error("dispatcher is shutting down")]
    ShuttingDown,
    #[error("unsupported language `{0}`")]
    UnsupportedLanguage(String),
    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("launch failed: {0}")]
    Launch(String),
    #[error("io failure: {0}")]
    Io(String),
}

impl SandboxFailure {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SandboxFailure::QueueFull
                | SandboxFailure::Cancelled
                | SandboxFailure::ShuttingDown
                | SandboxFailure::UnsupportedLanguage(_)
        )
    }
}

impl From<&CrateError> for SandboxFailure {
    fn from(err: &CrateError) -> Self {
        match err {
            CrateError::Environment(msg) => SandboxFailure::RuntimeUnavailable(msg.clone()),
            CrateError::Launch { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                SandboxFailure::RuntimeUnavailable(err.to_string())
            }
            CrateError::IO(_) => SandboxFailure::Io(err.to_string()),
            _ => SandboxFailure::Launch(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub id: String,
    pub verdict: Verdict,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Wall time of the run step. Zero when the run step was never entered.
    pub time_ms: u64,
    pub compile_time_ms: u64,
    pub memory_bytes: u64,
    pub attempts: u32,
    pub sandbox_failure: Option<SandboxFailure>,
}

impl ExecutionResult {
    pub fn sandbox_error(id: &str, failure: SandboxFailure) -> Self {
        Self {
            id: id.to_string(),
            verdict: Verdict::SandboxError,
            stdout: String::new(),
            stderr: classify::scrub_paths(&failure.to_string(), None),
            exit_code: None,
            signal: None,
            time_ms: 0,
            compile_time_ms: 0,
            memory_bytes: 0,
            attempts: 0,
            sandbox_failure: Some(failure),
        }
    }
}
