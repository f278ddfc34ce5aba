//! One short-lived container per phase. The container runtime enforces the
//! memory ceiling and the network policy; the governor keeps the clock on
//! the `docker run` client and asks the runtime to kill the container when
//! it has to stop early.

use std::{
    collections::BTreeMap,
    process::{Command, Stdio},
};

use log::{debug, warn};

use super::{Launch, Sandbox};
use crate::{
    classify::SANDBOX_MOUNT,
    config::SandboxConfig,
    error::{Error, Result},
    governor::{CancelToken, Governor, MemoryWatch, ProcessOutcome, Termination},
    slot::WorkerSlot,
};

/// `docker run` itself failed (daemon, image, flags).
const EXIT_RUNTIME: i32 = 125;
/// The entrypoint could not be invoked / was not found.
const EXIT_NOT_EXECUTABLE: i32 = 126;
const EXIT_NOT_FOUND: i32 = 127;
const EXIT_SIGNALLED: i32 = 128;

/// Tells the worker image how much memory the container may use.
pub const MEMORY_ENV: &str = "SANDPIT_MEMORY_BYTES";

pub struct DockerSandbox {
    governor: Governor,
    binary: String,
    images: BTreeMap<String, String>,
    cpus: Option<f64>,
    pids_limit: u64,
}

impl DockerSandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            governor: Governor::new(config.poll_interval(), config.grace(), MemoryWatch::Runtime),
            binary: config.docker.binary.clone(),
            images: config.docker.images.clone(),
            cpus: config.docker.cpus,
            pids_limit: config.docker.pids_limit,
        }
    }

    fn image(&self, language: &str) -> Result<&str> {
        self.images
            .get(language)
            .map(String::as_str)
            .ok_or_else(|| {
                Error::Environment(format!("no worker image configured for `{}`", language))
            })
    }

    pub fn arguments(
        &self,
        slot: &WorkerSlot,
        container: &str,
        launch: &Launch,
    ) -> Result<Vec<String>> {
        let image = self.image(launch.language)?;
        let memory = launch.limits.memory_bytes.to_string();
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };

        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "-i".into(),
            // The entrypoint is not PID 1, so the program can be signalled.
            "--init".into(),
            "--name".into(),
            container.into(),
            "--network".into(),
            "none".into(),
            "--memory".into(),
            memory.clone(),
            "--memory-swap".into(),
            memory.clone(),
            "-e".into(),
            format!("{}={}", MEMORY_ENV, memory),
            "--pids-limit".into(),
            self.pids_limit.to_string(),
            "--user".into(),
            format!("{}:{}", uid, gid),
            "--read-only".into(),
            "--tmpfs".into(),
            "/tmp".into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
        ];
        if let Some(cpus) = self.cpus {
            args.push("--cpus".into());
            args.push(cpus.to_string());
        }
        args.extend([
            "-v".into(),
            format!("{}:{}", slot.path().display(), SANDBOX_MOUNT),
            "-w".into(),
            SANDBOX_MOUNT.into(),
            image.into(),
            launch.phase.as_str().into(),
            launch.entry.into(),
        ]);
        Ok(args)
    }

    fn kill(&self, container: &str) {
        let status = Command::new(&self.binary)
            .args(["kill", container])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => debug!("killed container {}", container),
            Ok(_) => debug!("container {} already gone", container),
            Err(e) => warn!("failed to run `{} kill {}`: {}", self.binary, container, e),
        }
    }
}

/// Separates container runtime failures from the program's own exit status
/// and turns shell-style `128 + n` codes back into signals.
pub fn interpret(mut outcome: ProcessOutcome, memory_bytes: u64) -> Result<ProcessOutcome> {
    if outcome.termination != Termination::Exited {
        return Ok(outcome);
    }
    let code = match outcome.exit_code {
        Some(code) => code,
        None => return Ok(outcome),
    };

    let stderr = String::from_utf8_lossy(&outcome.stderr.bytes);
    let from_runtime = stderr.trim_start().starts_with("docker:");
    if matches!(code, EXIT_RUNTIME | EXIT_NOT_EXECUTABLE | EXIT_NOT_FOUND) && from_runtime {
        let first = stderr.lines().next().unwrap_or_default().trim().to_string();
        return Err(Error::Sandbox(first));
    }

    if code > EXIT_SIGNALLED && code <= EXIT_SIGNALLED + 64 {
        let signal = code - EXIT_SIGNALLED;
        outcome.exit_code = None;
        outcome.signal = Some(signal);
        // A SIGKILL the governor did not send is the cgroup OOM killer or the
        // image's heap backstop.
        if signal == libc::SIGKILL {
            outcome.peak_memory = memory_bytes;
        }
    }
    Ok(outcome)
}

impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn probe(&self, language: &str) -> Result<()> {
        let image = self.image(language)?;
        let output = Command::new(&self.binary)
            .args(["image", "inspect", "--format", "{{.Id}}", image])
            .stdin(Stdio::null())
            .output()
            .map_err(|source| Error::Launch {
                program: self.binary.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(Error::Environment(format!(
                "image `{}` is not available: {}",
                image,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn execute(
        &self,
        slot: &WorkerSlot,
        launch: &Launch,
        cancel: &CancelToken,
    ) -> Result<ProcessOutcome> {
        let container = format!("{}-{}", slot.name(), launch.phase.as_str());
        let mut command = Command::new(&self.binary);
        command.args(self.arguments(slot, &container, launch)?);
        debug!("starting container {}", container);

        let outcome = self.governor.spawn(
            &mut command,
            launch.stdin.to_vec(),
            &launch.limits,
            cancel,
            &|reason| {
                debug!("stopping container {} ({:?})", container, reason);
                self.kill(&container);
            },
        )?;
        interpret(outcome, launch.limits.memory_bytes)
    }
}
