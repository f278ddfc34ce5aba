//! Compile-then-run pipeline for one submission, retried on infrastructure
//! failures.

use std::{sync::Arc, thread, time::Duration};

use log::{debug, info, warn};

use crate::{
    classify::{self, classify, CompileStatus},
    config::SandpitConfig,
    error::Result,
    governor::{Captured, CancelToken, KillReason, PhaseLimits, ProcessOutcome, Termination},
    runner::{Runner, RunnerRegistry},
    sandbox::{Launch, Phase, Sandbox},
    slot::WorkerSlot,
    state::SubmissionState,
    submission::Submission,
    ExecutionResult, SandboxFailure,
};

pub struct Worker {
    registry: RunnerRegistry,
    sandbox: Arc<dyn Sandbox>,
    config: SandpitConfig,
}

impl Worker {
    pub fn new(registry: RunnerRegistry, sandbox: Arc<dyn Sandbox>, config: SandpitConfig) -> Self {
        Self {
            registry,
            sandbox,
            config,
        }
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    /// Produces the terminal result of `submission`. `report` is told about
    /// every state the submission passes through before that.
    pub fn execute(
        &self,
        submission: &Submission,
        cancel: &CancelToken,
        report: &dyn Fn(SubmissionState),
    ) -> ExecutionResult {
        let runner = match self.registry.get(&submission.language) {
            Some(runner) => runner,
            None => {
                return ExecutionResult::sandbox_error(
                    &submission.id,
                    SandboxFailure::UnsupportedLanguage(submission.language.clone()),
                )
            }
        };

        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = self.attempt(runner.as_ref(), submission, attempt, cancel, report);
            let mut result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    warn!("submission {} attempt {} failed: {}", submission.id, attempt, e);
                    ExecutionResult::sandbox_error(&submission.id, SandboxFailure::from(&e))
                }
            };
            result.attempts = attempt;

            let retryable = result
                .sandbox_failure
                .as_ref()
                .map_or(false, SandboxFailure::is_retryable);
            if !retryable || attempt >= max_attempts || cancel.is_cancelled() {
                return result;
            }

            let backoff = self.config.retry.backoff(attempt);
            info!(
                "retrying submission {} in {:?} (attempt {} of {})",
                submission.id,
                backoff,
                attempt + 1,
                max_attempts
            );
            if sleep_unless_cancelled(backoff, cancel) {
                let mut cancelled =
                    ExecutionResult::sandbox_error(&submission.id, SandboxFailure::Cancelled);
                cancelled.attempts = attempt;
                return cancelled;
            }
            attempt += 1;
            report(SubmissionState::Dispatched);
        }
    }

    fn attempt(
        &self,
        runner: &dyn Runner,
        submission: &Submission,
        attempt: u32,
        cancel: &CancelToken,
        report: &dyn Fn(SubmissionState),
    ) -> Result<ExecutionResult> {
        let limits = submission.limits;
        self.sandbox.probe(runner.language())?;
        let staged = runner.stage(&submission.sources)?;
        let root = self.config.sandbox.workspace_root();
        let slot = WorkerSlot::create(&root, &submission.id, attempt)?;
        slot.write(&staged)?;
        let view = self.sandbox.workspace_view(&slot);

        let mut compile_status = CompileStatus::Skipped;
        let mut compile_time_ms = 0;
        if let Some(argv) = runner.compile_argv(&staged) {
            report(SubmissionState::Compiling);
            let launch = Launch {
                language: runner.language(),
                phase: Phase::Compile,
                entry: &staged.entry,
                argv: &argv,
                stdin: &[],
                limits: PhaseLimits {
                    wall: Duration::from_millis(self.config.compile.time_ms),
                    memory_bytes: self.config.compile.memory_bytes,
                    output_cap: limits.output_byte_cap,
                },
                address_space: false,
            };
            let outcome = self.sandbox.execute(&slot, &launch, cancel)?;
            compile_time_ms = outcome.elapsed.as_millis() as u64;
            if outcome.termination == Termination::Killed(KillReason::Cancelled) {
                return Ok(cancelled(submission));
            }
            if !outcome.success() {
                debug!("submission {} failed to compile", submission.id);
                let mut diagnostics = diagnostics(&outcome, limits.output_byte_cap, &view);
                if let Termination::Killed(reason) = outcome.termination {
                    diagnostics.push_str(match reason {
                        KillReason::Memory => "\ncompilation exceeded its memory limit\n",
                        _ => "\ncompilation timed out\n",
                    });
                }
                return Ok(ExecutionResult {
                    id: submission.id.clone(),
                    verdict: classify(CompileStatus::Failed, None, &limits),
                    stdout: String::new(),
                    stderr: diagnostics,
                    exit_code: outcome.exit_code,
                    signal: outcome.signal,
                    time_ms: 0,
                    compile_time_ms,
                    memory_bytes: 0,
                    attempts: attempt,
                    sandbox_failure: None,
                });
            }
            compile_status = CompileStatus::Succeeded;
        }

        report(SubmissionState::Running);
        let argv = runner.run_argv(&staged);
        let launch = Launch {
            language: runner.language(),
            phase: Phase::Run,
            entry: &staged.entry,
            argv: &argv,
            stdin: submission.stdin.as_bytes(),
            limits: PhaseLimits {
                wall: limits.time_limit(),
                memory_bytes: limits.memory_bytes,
                output_cap: limits.output_byte_cap,
            },
            address_space: runner.limits_address_space(),
        };
        let outcome = self.sandbox.execute(&slot, &launch, cancel)?;
        if outcome.termination == Termination::Killed(KillReason::Cancelled) {
            return Ok(cancelled(submission));
        }

        let verdict = classify(compile_status, Some(&outcome.evidence()), &limits);
        debug!(
            "submission {}: {:?} in {:?} ({} ms cpu), {} bytes peak",
            submission.id, verdict, outcome.elapsed, outcome.cpu_time_ms, outcome.peak_memory
        );
        Ok(ExecutionResult {
            id: submission.id.clone(),
            verdict,
            stdout: classify::render(&outcome.stdout, limits.output_byte_cap, None),
            stderr: classify::render(&outcome.stderr, limits.output_byte_cap, Some(view.as_path())),
            exit_code: outcome.exit_code,
            signal: outcome.signal,
            time_ms: outcome.elapsed.as_millis() as u64,
            compile_time_ms,
            memory_bytes: outcome.peak_memory,
            attempts: attempt,
            sandbox_failure: None,
        })
    }
}

fn cancelled(submission: &Submission) -> ExecutionResult {
    ExecutionResult::sandbox_error(&submission.id, SandboxFailure::Cancelled)
}

/// Compiler output, stdout first, as one capped and scrubbed block.
fn diagnostics(outcome: &ProcessOutcome, cap: usize, workspace: &std::path::Path) -> String {
    let mut merged = Captured {
        bytes: outcome.stdout.bytes.clone(),
        total: outcome.stdout.total + outcome.stderr.total,
    };
    merged.bytes.extend_from_slice(&outcome.stderr.bytes);
    classify::render(&merged, cap, Some(workspace))
}

/// Returns true when cancelled before `duration` elapsed.
fn sleep_unless_cancelled(duration: Duration, cancel: &CancelToken) -> bool {
    let step = Duration::from_millis(20);
    let mut left = duration;
    while !left.is_zero() {
        if cancel.is_cancelled() {
            return true;
        }
        let nap = left.min(step);
        thread::sleep(nap);
        left -= nap;
    }
    cancel.is_cancelled()
}
