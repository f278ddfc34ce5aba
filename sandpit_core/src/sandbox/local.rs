//! Runs toolchains installed on the host, one process group per phase,
//! under rlimits and (when enabled) private user, network and mount
//! namespaces.

use std::{
    ffi::CString,
    io,
    os::unix::{ffi::OsStrExt, process::CommandExt},
    path::{Path, PathBuf},
    process::Command,
    ptr,
};

use log::debug;

use super::{Launch, Phase, Sandbox};
use crate::{
    config::SandboxConfig,
    error::{Error, Result},
    governor::{CancelToken, Governor, MemoryWatch, ProcessOutcome, Termination},
    slot::WorkerSlot,
};

const FILE_SIZE_LIMIT: u64 = 64 << 20;

pub struct LocalSandbox {
    governor: Governor,
    isolate: bool,
    max_processes: Option<u64>,
    path: Option<std::ffi::OsString>,
}

impl LocalSandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            governor: Governor::new(config.poll_interval(), config.grace(), MemoryWatch::Poll),
            isolate: config.isolate,
            max_processes: config.max_processes,
            path: std::env::var_os("PATH"),
        }
    }

    fn command(&self, slot: &WorkerSlot, launch: &Launch) -> Result<Command> {
        let (program, args) = launch
            .argv
            .split_first()
            .ok_or_else(|| Error::Argument(format!("empty {} command", launch.phase.as_str())))?;

        let view = self.workspace_view(slot);
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(slot.path())
            .env_clear()
            .env("HOME", &view)
            .env("TMPDIR", view.join(".tmp"))
            .env("LANG", "C.UTF-8");
        if let Some(path) = &self.path {
            command.env("PATH", path);
        }

        let limits = ChildLimits {
            cpu_seconds: cpu_seconds(launch),
            address_space: (launch.phase == Phase::Run && launch.address_space)
                .then(|| launch.limits.memory_bytes.saturating_mul(2)),
            processes: self.max_processes,
        };
        let mounts = if self.isolate {
            Some(BindMount::new(slot.path(), slot.root())?)
        } else {
            None
        };
        unsafe {
            command.pre_exec(move || {
                if let Some(mounts) = &mounts {
                    mounts.enter()?;
                }
                limits.apply()
            });
        }
        Ok(command)
    }
}

impl Sandbox for LocalSandbox {
    fn name(&self) -> &'static str {
        "local"
    }

    fn probe(&self, _language: &str) -> Result<()> {
        Ok(())
    }

    /// With isolation the slot is mounted over the pool root, which hides
    /// sibling slots.
    fn workspace_view(&self, slot: &WorkerSlot) -> PathBuf {
        if self.isolate {
            slot.root().to_path_buf()
        } else {
            slot.path().to_path_buf()
        }
    }

    fn execute(
        &self,
        slot: &WorkerSlot,
        launch: &Launch,
        cancel: &CancelToken,
    ) -> Result<ProcessOutcome> {
        let mut command = self.command(slot, launch)?;
        debug!(
            "{} `{}` in {}",
            launch.phase.as_str(),
            launch.argv.join(" "),
            slot.path().display()
        );
        let outcome = self
            .governor
            .spawn(&mut command, launch.stdin.to_vec(), &launch.limits, cancel, &|_| {})?;
        Ok(cpu_limit_kill(outcome, cpu_seconds(launch)))
    }
}

/// Hard `RLIMIT_CPU`; the soft limit sits one second below it.
fn cpu_seconds(launch: &Launch) -> u64 {
    launch.limits.wall.as_secs() + 2
}

/// A program that ignores SIGXCPU is SIGKILLed by the kernel at the hard
/// CPU limit. That kill is reported as SIGXCPU so it reads as a time limit.
fn cpu_limit_kill(mut outcome: ProcessOutcome, cpu_seconds: u64) -> ProcessOutcome {
    if outcome.termination == Termination::Exited
        && outcome.signal == Some(libc::SIGKILL)
        && outcome.cpu_time_ms >= cpu_seconds * 1000
    {
        debug!("cpu limit of {}s reached", cpu_seconds);
        outcome.signal = Some(libc::SIGXCPU);
    }
    outcome
}

#[derive(Debug, Clone, Copy)]
struct ChildLimits {
    cpu_seconds: u64,
    address_space: Option<u64>,
    processes: Option<u64>,
}

impl ChildLimits {
    fn apply(&self) -> io::Result<()> {
        set_limit(libc::RLIMIT_CORE, 0, 0)?;
        set_limit(libc::RLIMIT_CPU, self.cpu_seconds.saturating_sub(1), self.cpu_seconds)?;
        set_limit(libc::RLIMIT_FSIZE, FILE_SIZE_LIMIT, FILE_SIZE_LIMIT)?;
        if let Some(bytes) = self.address_space {
            set_limit(libc::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(n) = self.processes {
            set_limit(libc::RLIMIT_NPROC, n, n)?;
        }
        Ok(())
    }
}

fn set_limit(resource: libc::__rlimit_resource_t, soft: u64, hard: u64) -> io::Result<()> {
    let lim = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &lim) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Namespaces plus a bind of the slot over the pool root. Paths are turned
/// into C strings before fork; only syscalls run in the child.
struct BindMount {
    source: CString,
    target: CString,
}

impl BindMount {
    fn new(source: &Path, target: &Path) -> Result<Self> {
        let cstr = |p: &Path| {
            CString::new(p.as_os_str().as_bytes())
                .map_err(|_| Error::Argument(format!("path `{}` contains NUL", p.display())))
        };
        Ok(Self {
            source: cstr(source)?,
            target: cstr(target)?,
        })
    }

    fn enter(&self) -> io::Result<()> {
        let root = b"/\0".as_ptr() as *const libc::c_char;
        unsafe {
            if libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET | libc::CLONE_NEWNS) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::mount(
                ptr::null(),
                root,
                ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                ptr::null(),
            ) != 0
            {
                return Err(io::Error::last_os_error());
            }
            if libc::mount(
                self.source.as_ptr(),
                self.target.as_ptr(),
                ptr::null(),
                libc::MS_BIND | libc::MS_REC,
                ptr::null(),
            ) != 0
            {
                return Err(io::Error::last_os_error());
            }
            if libc::chdir(self.target.as_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}
