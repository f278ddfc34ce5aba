use std::{
    fs,
    path::PathBuf,
    process::Command,
    sync::Arc,
    time::Duration,
};

use sandpit_core::{
    config::{SandboxConfig, SandpitConfig},
    dispatch::Dispatcher,
    error::Result,
    governor::{CancelToken, Governor, MemoryWatch, PhaseLimits, Termination},
    runner::{EnvironmentStatus, RunnerRegistry},
    sandbox::local::LocalSandbox,
    submission::{Limits, Submission},
    worker::Worker,
    ExecutionResult, Verdict,
};

const GRACE_MS: u64 = 250;

fn repo_path(parts: &[&str]) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("..");
    path.extend(parts);
    path
}

fn fixture(name: &str) -> String {
    fs::read_to_string(repo_path(&["test_dep", "java", name])).unwrap()
}

fn jdk_missing() -> bool {
    let registry = RunnerRegistry::with_defaults();
    let java = registry.get("java").unwrap();
    let missing = !matches!(java.check_environment(), EnvironmentStatus::OK { .. })
        || which::which("java").is_err();
    if missing {
        eprintln!("no JDK on PATH, skipping");
    }
    missing
}

async fn run(submission: Submission) -> Result<ExecutionResult> {
    let root = tempfile::tempdir()?;
    let mut config = SandpitConfig::default();
    config.sandbox = SandboxConfig {
        workspace_root: Some(root.path().to_path_buf()),
        isolate: false,
        grace_ms: GRACE_MS,
        ..SandboxConfig::default()
    };
    config.compile.time_ms = 60_000;
    let pool = config.pool.clone();
    let sandbox = Arc::new(LocalSandbox::new(&config.sandbox));
    let worker = Worker::new(RunnerRegistry::with_defaults(), sandbox, config);
    let dispatcher = Dispatcher::new(worker, &pool);
    let result = dispatcher.submit(submission)?.wait().await.unwrap();
    assert_eq!(fs::read_dir(root.path())?.count(), 0);
    Ok(result)
}

fn generous() -> Limits {
    Limits {
        time_ms: 10_000,
        memory_bytes: 512 << 20,
        ..Limits::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn java_hello_world() -> Result<()> {
    if jdk_missing() {
        return Ok(());
    }
    let submission = Submission::new("j-hello", "java", fixture("Hello.java"));
    let result = run(submission.with_limits(generous())).await?;
    assert_eq!(result.verdict, Verdict::Accepted, "{:#?}", result);
    assert_eq!(result.stdout, "Hello, World!\n");
    assert!(result.compile_time_ms > 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn java_syntax_error() -> Result<()> {
    if jdk_missing() {
        return Ok(());
    }
    let submission = Submission::new("j-broken", "java", fixture("Broken.java"));
    let result = run(submission.with_limits(generous())).await?;
    assert_eq!(result.verdict, Verdict::CompileError);
    assert_eq!(result.time_ms, 0);
    assert!(result.stdout.is_empty());
    assert!(result.stderr.contains("Broken.java"));
    assert!(result.stderr.contains("';' expected"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn java_reads_stdin() -> Result<()> {
    if jdk_missing() {
        return Ok(());
    }
    let submission = Submission::new("j-sum", "java", fixture("Sum.java"))
        .with_stdin("3\n4\n")
        .with_limits(generous());
    let result = run(submission).await?;
    assert_eq!(result.verdict, Verdict::Accepted);
    assert_eq!(result.stdout.trim(), "7");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn java_exception_is_runtime_error() -> Result<()> {
    if jdk_missing() {
        return Ok(());
    }
    let submission = Submission::new("j-crash", "java", fixture("Crash.java"));
    let result = run(submission.with_limits(generous())).await?;
    assert_eq!(result.verdict, Verdict::RuntimeError);
    assert_eq!(result.exit_code, Some(1));
    assert!(result.stderr.contains("ArrayIndexOutOfBoundsException"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn java_infinite_loop() -> Result<()> {
    if jdk_missing() {
        return Ok(());
    }
    let submission = Submission::new("j-spin", "java", fixture("Spin.java")).with_limits(Limits {
        time_ms: 2000,
        ..generous()
    });
    let result = run(submission).await?;
    assert_eq!(result.verdict, Verdict::TimeLimitExceeded);
    assert!(result.time_ms >= 2000);
    assert!(result.time_ms <= 2000 + GRACE_MS, "took {} ms", result.time_ms);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn java_unbounded_allocation() -> Result<()> {
    if jdk_missing() {
        return Ok(());
    }
    let submission = Submission::new("j-hog", "java", fixture("Hog.java")).with_limits(Limits {
        memory_bytes: 64 << 20,
        ..generous()
    });
    let result = run(submission).await?;
    assert_eq!(result.verdict, Verdict::MemoryLimitExceeded, "{:#?}", result);
    assert!(result.memory_bytes >= 64 << 20);
    Ok(())
}

/// The image entrypoint lets the heap grow to the ceiling it is given and
/// SIGKILLs the JVM when the heap runs out first, so the container exits 137.
#[test]
fn image_entrypoint_kills_jvm_on_heap_exhaustion() -> Result<()> {
    if jdk_missing() {
        return Ok(());
    }
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("Hog.java"), fixture("Hog.java"))?;
    let status = Command::new("javac")
        .args(["-d", ".", "Hog.java"])
        .current_dir(dir.path())
        .status()?;
    assert!(status.success());

    let mut command = Command::new("sh");
    command
        .arg(repo_path(&["images", "java", "runner.sh"]))
        .args(["run", "Hog"])
        .current_dir(dir.path())
        .env("SANDPIT_MEMORY_BYTES", (64u64 << 20).to_string());
    let governor = Governor::new(
        Duration::from_millis(10),
        Duration::from_millis(GRACE_MS),
        MemoryWatch::Runtime,
    );
    let outcome = governor.spawn(
        &mut command,
        Vec::new(),
        &PhaseLimits {
            wall: Duration::from_secs(30),
            memory_bytes: 64 << 20,
            output_cap: 1 << 16,
        },
        &CancelToken::new(),
        &|_| {},
    )?;
    assert_eq!(outcome.termination, Termination::Exited);
    assert_eq!(outcome.signal, Some(libc::SIGKILL), "{:?}", outcome);
    Ok(())
}
