//! Supervision of one sandboxed phase.
//!
//! The governor owns the child's process group from spawn to reap. It
//! polls the root process, enforces the wall-clock deadline and the memory
//! ceiling, honours cancellation, and always sweeps the group with SIGKILL
//! before returning so no descendant outlives the phase.

use std::{
    io::{ErrorKind, Read, Write},
    os::unix::process::CommandExt,
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{
    classify::Evidence,
    error::{Error, Result},
    probe::{self, GroupProbe},
};

/// Shared flag a dispatcher flips to ask a running phase to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    Timeout,
    Memory,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    Killed(KillReason),
}

#[derive(Debug, Clone, Copy)]
pub struct PhaseLimits {
    pub wall: Duration,
    pub memory_bytes: u64,
    pub output_cap: usize,
}

/// How the memory ceiling is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryWatch {
    /// Poll the resident size of the process group.
    Poll,
    /// The container runtime enforces it; the governor only keeps time.
    Runtime,
}

/// Up to `cap` bytes of a stream plus the number of bytes actually produced.
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub total: u64,
}

impl Captured {
    pub fn overflowed(&self) -> bool {
        self.total > self.bytes.len() as u64
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub elapsed: Duration,
    pub peak_memory: u64,
    pub cpu_time_ms: u64,
    pub stdout: Captured,
    pub stderr: Captured,
    pub termination: Termination,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }

    pub fn evidence(&self) -> Evidence {
        Evidence {
            exit_code: self.exit_code,
            signal: self.signal,
            elapsed: self.elapsed,
            peak_memory: self.peak_memory,
        }
    }
}

pub struct Governor {
    poll_interval: Duration,
    drain_timeout: Duration,
    memory: MemoryWatch,
}

impl Governor {
    pub fn new(poll_interval: Duration, drain_timeout: Duration, memory: MemoryWatch) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            drain_timeout,
            memory,
        }
    }

    /// Spawns `command` in its own process group and supervises it to completion.
    ///
    /// `on_kill` runs after the group has been signalled, for backends whose
    /// real workload lives outside the group (a container, for instance).
    pub fn spawn(
        &self,
        command: &mut Command,
        stdin: Vec<u8>,
        limits: &PhaseLimits,
        cancel: &CancelToken,
        on_kill: &dyn Fn(KillReason),
    ) -> Result<ProcessOutcome> {
        let program = command.get_program().to_string_lossy().to_string();
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| Error::Launch {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();
        let group = GroupProbe::new(pid);
        debug!("spawned `{}` as pid {}", program, pid);

        if let Some(mut cin) = child.stdin.take() {
            thread::spawn(move || {
                if let Err(e) = cin.write_all(&stdin) {
                    if e.kind() != ErrorKind::BrokenPipe {
                        debug!("stdin writer stopped: {}", e);
                    }
                }
            });
        }
        let stdout = child.stdout.take().map(|out| capture(out, limits.output_cap));
        let stderr = child.stderr.take().map(|err| capture(err, limits.output_cap));

        let mut termination = Termination::Exited;
        let mut peak_polled = 0u64;
        let bio = loop {
            if let Some(bio) = probe::try_reap(pid)? {
                break bio;
            }

            let elapsed = started.elapsed();
            let breach = if cancel.is_cancelled() {
                Some(KillReason::Cancelled)
            } else if elapsed >= limits.wall {
                Some(KillReason::Timeout)
            } else if self.memory == MemoryWatch::Poll {
                let resident = group.resident_bytes();
                peak_polled = peak_polled.max(resident);
                if resident >= limits.memory_bytes {
                    Some(KillReason::Memory)
                } else {
                    None
                }
            } else {
                None
            };

            if let Some(reason) = breach {
                debug!("killing group {} ({:?}) after {:?}", pid, reason, elapsed);
                if let Err(e) = group.kill() {
                    warn!("failed to kill group {}: {}", pid, e);
                }
                on_kill(reason);
                termination = Termination::Killed(reason);
                break probe::reap(pid)?;
            }

            let remaining = limits.wall.saturating_sub(elapsed);
            thread::sleep(self.poll_interval.min(remaining).max(Duration::from_millis(1)));
        };
        let elapsed = started.elapsed();

        // The root is gone; anything it left behind in the group goes too.
        if let Err(e) = group.kill() {
            warn!("failed to sweep group {}: {}", pid, e);
        }

        let peak_memory = match self.memory {
            MemoryWatch::Poll => peak_polled.max(bio.get_peak_memory()),
            MemoryWatch::Runtime => 0,
        };

        // Both streams share one drain deadline.
        let drained_by = Instant::now() + self.drain_timeout;
        Ok(ProcessOutcome {
            exit_code: bio.exit_code(),
            signal: bio.signal(),
            elapsed,
            peak_memory,
            cpu_time_ms: bio.get_time_usage(),
            stdout: collect(stdout, drained_by),
            stderr: collect(stderr, drained_by),
            termination,
        })
    }
}

fn collect(rx: Option<mpsc::Receiver<Captured>>, deadline: Instant) -> Captured {
    match rx {
        Some(rx) => rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .unwrap_or_else(|_| {
                warn!("output stream still open after the group was killed");
                Captured::default()
            }),
        None => Captured::default(),
    }
}

/// Drains `reader` on a helper thread, keeping at most `cap` bytes.
fn capture<R: Read + Send + 'static>(mut reader: R, cap: usize) -> mpsc::Receiver<Captured> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut captured = Captured::default();
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let room = cap.saturating_sub(captured.bytes.len());
                    captured.bytes.extend_from_slice(&buf[..n.min(room)]);
                    captured.total += n as u64;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = tx.send(captured);
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor() -> Governor {
        Governor::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
            MemoryWatch::Poll,
        )
    }

    fn limits(wall_ms: u64) -> PhaseLimits {
        PhaseLimits {
            wall: Duration::from_millis(wall_ms),
            memory_bytes: 256 << 20,
            output_cap: 1 << 16,
        }
    }

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        command
    }

    #[test]
    fn exit_code_and_output() -> Result<()> {
        let outcome = governor().spawn(
            &mut sh("echo hi; echo oops >&2; exit 3"),
            Vec::new(),
            &limits(5000),
            &CancelToken::new(),
            &|_| {},
        )?;
        assert_eq!(outcome.termination, Termination::Exited);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stdout.bytes, b"hi\n");
        assert_eq!(outcome.stderr.bytes, b"oops\n");
        assert!(!outcome.success());
        Ok(())
    }

    #[test]
    fn stdin_is_delivered() -> Result<()> {
        let outcome = governor().spawn(
            &mut sh("read a; read b; echo $((a + b))"),
            b"3\n4\n".to_vec(),
            &limits(5000),
            &CancelToken::new(),
            &|_| {},
        )?;
        assert!(outcome.success());
        assert_eq!(outcome.stdout.bytes, b"7\n");
        Ok(())
    }

    #[test]
    fn deadline_kills_whole_group() -> Result<()> {
        let killed = std::cell::Cell::new(None);
        let outcome = governor().spawn(
            &mut sh("sleep 30 & echo $!; wait"),
            Vec::new(),
            &limits(300),
            &CancelToken::new(),
            &|reason| killed.set(Some(reason)),
        )?;
        assert_eq!(outcome.termination, Termination::Killed(KillReason::Timeout));
        assert_eq!(killed.get(), Some(KillReason::Timeout));
        assert_eq!(outcome.signal, Some(libc::SIGKILL));
        assert!(outcome.elapsed >= Duration::from_millis(300));
        assert!(outcome.elapsed < Duration::from_millis(1300));

        let orphan: u32 = String::from_utf8_lossy(&outcome.stdout.bytes)
            .trim()
            .parse()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match probe::read_stat(orphan) {
                None => break,
                Some(stat) if stat.state == 'Z' => break,
                Some(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
                Some(stat) => panic!("background child survived: {:?}", stat),
            }
        }
        Ok(())
    }

    #[test]
    fn memory_ceiling() -> Result<()> {
        let outcome = governor().spawn(
            &mut sh("x=a; while :; do x=\"$x$x\"; done"),
            Vec::new(),
            &PhaseLimits {
                wall: Duration::from_secs(20),
                memory_bytes: 32 << 20,
                output_cap: 1024,
            },
            &CancelToken::new(),
            &|_| {},
        )?;
        assert_eq!(outcome.termination, Termination::Killed(KillReason::Memory));
        assert!(outcome.peak_memory >= 32 << 20);
        Ok(())
    }

    #[test]
    fn cancellation() -> Result<()> {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let outcome = governor().spawn(
            &mut sh("sleep 30"),
            Vec::new(),
            &limits(10_000),
            &cancel,
            &|_| {},
        )?;
        handle.join().unwrap();
        assert_eq!(outcome.termination, Termination::Killed(KillReason::Cancelled));
        assert!(outcome.elapsed < Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn output_is_capped_but_counted() -> Result<()> {
        let outcome = governor().spawn(
            &mut sh("yes | head -c 10000"),
            Vec::new(),
            &PhaseLimits {
                output_cap: 100,
                ..limits(5000)
            },
            &CancelToken::new(),
            &|_| {},
        )?;
        assert_eq!(outcome.stdout.bytes.len(), 100);
        assert_eq!(outcome.stdout.total, 10000);
        assert!(outcome.stdout.overflowed());
        Ok(())
    }

    #[test]
    fn escaped_writer_costs_one_grace_period() -> Result<()> {
        let governor = Governor::new(
            Duration::from_millis(10),
            Duration::from_millis(300),
            MemoryWatch::Poll,
        );
        // The new session leaves the group but keeps both pipes open.
        let started = Instant::now();
        let outcome = governor.spawn(
            &mut sh("setsid sleep 2 & exit 0"),
            Vec::new(),
            &limits(5000),
            &CancelToken::new(),
            &|_| {},
        )?;
        assert_eq!(outcome.exit_code, Some(0));
        assert!(started.elapsed() < Duration::from_millis(550), "{:?}", started.elapsed());
        Ok(())
    }

    #[test]
    fn missing_program_is_launch_error() {
        let result = governor().spawn(
            &mut Command::new("/nonexistent/sandpit-binary"),
            Vec::new(),
            &limits(1000),
            &CancelToken::new(),
            &|_| {},
        );
        assert!(matches!(result, Err(Error::Launch { .. })));
    }
}
