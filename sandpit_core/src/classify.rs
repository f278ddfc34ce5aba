use std::{path::Path, sync::OnceLock, time::Duration};

use regex::{Captures, Regex};

use crate::{governor::Captured, submission::Limits, Verdict};

/// Appended once to a stream that exceeded its byte cap.
pub const TRUNCATION_MARKER: &str = "\n[sandpit: output truncated]\n";

/// Where scrubbed workspace paths point to in reported text.
pub const SANDBOX_MOUNT: &str = "/sandbox";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileStatus {
    /// Interpreted language; nothing to compile.
    Skipped,
    Succeeded,
    Failed,
}

/// Raw facts about one finished run step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evidence {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub elapsed: Duration,
    pub peak_memory: u64,
}

pub fn classify(compile: CompileStatus, run: Option<&Evidence>, limits: &Limits) -> Verdict {
    if compile == CompileStatus::Failed {
        return Verdict::CompileError;
    }
    let run = match run {
        Some(run) => run,
        None => return Verdict::SandboxError,
    };

    // SIGXCPU is the kernel enforcing the CPU-time rlimit.
    if run.elapsed >= limits.time_limit() || run.signal == Some(libc::SIGXCPU) {
        Verdict::TimeLimitExceeded
    } else if run.peak_memory >= limits.memory_bytes {
        Verdict::MemoryLimitExceeded
    } else if run.signal.is_some() || run.exit_code != Some(0) {
        Verdict::RuntimeError
    } else {
        Verdict::Accepted
    }
}

/// Drops a multi-byte character left incomplete by a cut at the end of `bytes`.
fn complete_chars(bytes: &[u8]) -> &[u8] {
    let tail = bytes.len().saturating_sub(4);
    for start in (tail..bytes.len()).rev() {
        let lead = bytes[start];
        if lead & 0xC0 == 0x80 {
            continue;
        }
        let width = match lead {
            0xF0..=0xF7 => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if bytes.len() - start < width {
            &bytes[..start]
        } else {
            bytes
        };
    }
    bytes
}

/// Keeps the first `cap` bytes of a stream and marks the cut.
pub fn truncate(bytes: &[u8], total: u64, cap: usize) -> String {
    let overflowed = total > cap as u64;
    let kept = &bytes[..bytes.len().min(cap)];
    let kept = if overflowed || kept.len() < bytes.len() {
        complete_chars(kept)
    } else {
        kept
    };
    let mut text = String::from_utf8_lossy(kept).into_owned();
    if overflowed {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

/// Renders a captured stream for the caller: capped, marked, and with host
/// paths scrubbed when `workspace` is given.
pub fn render(captured: &Captured, cap: usize, workspace: Option<&Path>) -> String {
    let overflowed = captured.total > cap as u64;
    let kept = &captured.bytes[..captured.bytes.len().min(cap)];
    let kept = if overflowed { complete_chars(kept) } else { kept };
    let text = String::from_utf8_lossy(kept).into_owned();
    let mut text = match workspace {
        Some(workspace) => scrub_paths(&text, Some(workspace)),
        None => text,
    };
    if overflowed {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

fn host_path() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(^|[^A-Za-z0-9._/~-])((?:/[A-Za-z0-9._+@-]+){2,})")
            .expect("host path pattern is valid")
    })
}

/// Rewrites the slot workspace to [`SANDBOX_MOUNT`] and any other absolute
/// path of two or more components to `<host>/<file name>`.
pub fn scrub_paths(text: &str, workspace: Option<&Path>) -> String {
    let mut text = text.to_string();
    if let Some(workspace) = workspace.and_then(|w| w.to_str()).filter(|w| w.len() > 1) {
        text = text.replace(workspace.trim_end_matches('/'), SANDBOX_MOUNT);
    }

    host_path()
        .replace_all(&text, |caps: &Captures| {
            let path = &caps[2];
            if path == SANDBOX_MOUNT || path.starts_with("/sandbox/") {
                return format!("{}{}", &caps[1], path);
            }
            let name = path.rsplit('/').next().unwrap_or_default();
            format!("{}<host>/{}", &caps[1], name)
        })
        .into_owned()
}
