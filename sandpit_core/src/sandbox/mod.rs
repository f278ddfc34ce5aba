//! Sandbox backends. A backend knows how to start one phase of a submission
//! inside a slot and hands supervision to the [`Governor`](crate::governor::Governor).

pub mod docker;
pub mod local;

use std::{path::PathBuf, sync::Arc};

use crate::{
    config::{Backend, SandpitConfig},
    error::Result,
    governor::{CancelToken, PhaseLimits, ProcessOutcome},
    slot::WorkerSlot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Compile,
    Run,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Compile => "compile",
            Phase::Run => "run",
        }
    }
}

/// Everything a backend needs to start one phase.
#[derive(Debug, Clone)]
pub struct Launch<'a> {
    pub language: &'a str,
    pub phase: Phase,
    /// Entry handed to a worker image (`runner <phase> <entry>`).
    pub entry: &'a str,
    /// Command line for backends that run the toolchain directly.
    pub argv: &'a [String],
    pub stdin: &'a [u8],
    pub limits: PhaseLimits,
    /// The runner tolerates an address-space rlimit.
    pub address_space: bool,
}

pub trait Sandbox: Send + Sync {
    fn name(&self) -> &'static str;

    /// Checks that `language` can be launched by this backend at all.
    fn probe(&self, language: &str) -> Result<()>;

    /// Path under which the program sees its workspace, for scrubbing output.
    fn workspace_view(&self, slot: &WorkerSlot) -> PathBuf {
        slot.path().to_path_buf()
    }

    fn execute(
        &self,
        slot: &WorkerSlot,
        launch: &Launch,
        cancel: &CancelToken,
    ) -> Result<ProcessOutcome>;
}

pub fn from_config(config: &SandpitConfig) -> Arc<dyn Sandbox> {
    match config.sandbox.backend {
        Backend::Local => Arc::new(local::LocalSandbox::new(&config.sandbox)),
        Backend::Docker => Arc::new(docker::DockerSandbox::new(&config.sandbox)),
    }
}
