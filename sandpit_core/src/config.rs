use std::{collections::BTreeMap, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    submission::Limits,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandpitConfig {
    pub pool: PoolConfig,
    pub sandbox: SandboxConfig,
    pub compile: CompileConfig,
    pub retry: RetryConfig,
    /// Limits applied to submissions that do not carry their own.
    pub defaults: Limits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
    pub slots: usize,
    pub queue_depth: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slots: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            queue_depth: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Local,
    Docker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxConfig {
    pub backend: Backend,
    pub workspace_root: Option<PathBuf>,
    /// Local backend: run each phase in fresh user, network and mount namespaces.
    pub isolate: bool,
    /// Local backend: RLIMIT_NPROC for the sandboxed program. Counted per user.
    pub max_processes: Option<u64>,
    pub grace_ms: u64,
    pub poll_interval_ms: u64,
    pub docker: DockerConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Local,
            workspace_root: None,
            isolate: true,
            max_processes: None,
            grace_ms: 250,
            poll_interval_ms: 10,
            docker: DockerConfig::default(),
        }
    }
}

impl SandboxConfig {
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("sandpit"))
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DockerConfig {
    pub binary: String,
    /// Worker image per language tag.
    pub images: BTreeMap<String, String>,
    pub cpus: Option<f64>,
    pub pids_limit: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        let mut images = BTreeMap::new();
        images.insert("java".to_string(), "sandpit/java:11".to_string());
        Self {
            binary: "docker".into(),
            images,
            cpus: Some(1.0),
            pids_limit: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompileConfig {
    pub time_ms: u64,
    pub memory_bytes: u64,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            time_ms: 10_000,
            memory_bytes: 512 << 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 200,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff before attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

impl SandpitConfig {
    pub fn from_string(content: &str) -> Result<Self> {
        let v: Self = serde_yaml::from_str(content)?;
        v.validate()?;
        Ok(v)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read `{}`: {}", path, e)))?;
        Self::from_string(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.slots == 0 {
            return Err(Error::Config("pool.slots must be at least 1".into()));
        }
        if self.pool.queue_depth == 0 {
            return Err(Error::Config("pool.queueDepth must be at least 1".into()));
        }
        if self.sandbox.poll_interval_ms == 0 {
            return Err(Error::Config("sandbox.pollIntervalMs must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.maxAttempts must be at least 1".into()));
        }
        if self.compile.time_ms == 0 || self.compile.memory_bytes == 0 {
            return Err(Error::Config("compile limits must be positive".into()));
        }
        if self.sandbox.backend == Backend::Docker && self.sandbox.docker.binary.is_empty() {
            return Err(Error::Config("sandbox.docker.binary is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_all_defaults() -> Result<()> {
        let config = SandpitConfig::from_string("{}")?;
        assert_eq!(config.pool.queue_depth, 64);
        assert_eq!(config.sandbox.backend, Backend::Local);
        assert!(config.sandbox.isolate);
        assert_eq!(config.defaults, Limits::default());
        assert_eq!(config.sandbox.docker.images["java"], "sandpit/java:11");
        Ok(())
    }

    #[test]
    fn camel_case_keys() -> Result<()> {
        let config = SandpitConfig::from_string(
            r#"
pool:
  slots: 3
  queueDepth: 5
sandbox:
  backend: docker
  workspaceRoot: /var/lib/sandpit
  graceMs: 400
  docker:
    images:
      python: sandpit/python:3
    pidsLimit: 32
retry:
  maxAttempts: 1
defaults:
  timeMs: 2000
"#,
        )?;
        assert_eq!(config.pool.slots, 3);
        assert_eq!(config.pool.queue_depth, 5);
        assert_eq!(config.sandbox.backend, Backend::Docker);
        assert_eq!(config.sandbox.workspace_root(), PathBuf::from("/var/lib/sandpit"));
        assert_eq!(config.sandbox.grace(), Duration::from_millis(400));
        assert_eq!(config.sandbox.docker.pids_limit, 32);
        assert!(!config.sandbox.docker.images.contains_key("java"));
        assert_eq!(config.defaults.time_ms, 2000);
        assert_eq!(config.defaults.memory_bytes, Limits::default().memory_bytes);
        Ok(())
    }

    #[test]
    fn rejects_empty_pool() {
        assert!(matches!(
            SandpitConfig::from_string("pool:\n  slots: 0\n"),
            Err(Error::Config(_))
        ));
        assert!(SandpitConfig::from_string("retry:\n  maxAttempts: 0\n").is_err());
    }

    #[test]
    fn backoff_doubles() {
        let retry = RetryConfig {
            max_attempts: 4,
            backoff_ms: 100,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
    }
}
