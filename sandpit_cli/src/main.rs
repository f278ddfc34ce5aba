use std::{
    fs,
    path::{Path, PathBuf},
    process,
};

use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use sandpit_core::{
    config::SandpitConfig,
    dispatch::Dispatcher,
    error::{Error, Result},
    runner::{EnvironmentStatus, RunnerRegistry},
    sandbox,
    submission::{Limits, SourceFile, Submission},
    ExecutionResult, Verdict,
};
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(
    version,
    name = "sandpit",
    author = "Kanari",
    about = "Runs untrusted programs in isolated, resource-limited sandboxes."
)]
struct Opts {
    /// sandpit.yaml; built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    subcmd: SubCommand,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Compile and run a single source file
    Run(RunArgs),
    /// Run every case of a YAML manifest and compare verdicts
    Batch(BatchArgs),
    /// Report which toolchains and worker images are usable
    Check,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// path of source
    src_path: PathBuf,
    /// language tag; inferred from the file extension when omitted
    #[arg(short, long)]
    language: Option<String>,
    /// file fed to the program's stdin
    #[arg(short, long)]
    input_file: Option<PathBuf>,
    /// time limit (ms)
    #[arg(short, long)]
    time_limit: Option<u64>,
    /// memory limit (MiB)
    #[arg(short, long)]
    memory_limit: Option<u64>,
}

#[derive(Args, Debug)]
struct BatchArgs {
    /// manifest listing the cases
    manifest: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    limits: Option<Limits>,
    cases: Vec<Case>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Case {
    id: String,
    #[serde(default)]
    language: Option<String>,
    source: PathBuf,
    #[serde(default)]
    stdin: Option<String>,
    #[serde(default)]
    stdin_file: Option<PathBuf>,
    #[serde(default)]
    limits: Option<Limits>,
    #[serde(default)]
    expected_verdict: Option<Verdict>,
    #[serde(default)]
    expected_stdout: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CaseReport<'a> {
    #[serde(flatten)]
    result: &'a ExecutionResult,
    passed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunnerReport {
    language: String,
    toolchain: String,
    compiled: bool,
    available: bool,
    version: Option<String>,
    path: Option<String>,
    backend: String,
    backend_ready: bool,
    backend_error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let opts: Opts = Opts::parse();

    let config = match &opts.config {
        Some(path) => SandpitConfig::from_file(&path.to_string_lossy())?,
        None => SandpitConfig::default(),
    };

    match opts.subcmd {
        SubCommand::Run(args) => {
            let registry = RunnerRegistry::with_defaults();
            let language = match args.language {
                Some(language) => language,
                None => infer_language(&registry, &args.src_path)?,
            };
            let mut limits = config.defaults;
            if let Some(ms) = args.time_limit {
                limits.time_ms = ms;
            }
            if let Some(mib) = args.memory_limit {
                limits.memory_bytes = mib << 20;
            }
            let stdin = match &args.input_file {
                Some(path) => fs::read_to_string(path)?,
                None => String::new(),
            };
            let submission = Submission {
                id: file_stem(&args.src_path),
                language,
                sources: vec![SourceFile::unnamed(fs::read_to_string(&args.src_path)?)],
                stdin,
                limits,
            };

            let dispatcher = Dispatcher::from_config(config);
            let result = dispatcher
                .submit(submission)?
                .wait()
                .await
                .ok_or_else(|| Error::Sandbox("submission was revoked".into()))?;
            print_json(&result)?;
            if result.verdict == Verdict::SandboxError {
                process::exit(2);
            }
        }
        SubCommand::Batch(args) => {
            let failed = batch(config, &args.manifest).await?;
            if failed > 0 {
                warn!("{} case(s) did not match", failed);
                process::exit(1);
            }
        }
        SubCommand::Check => {
            let backend = sandbox::from_config(&config);
            let registry = RunnerRegistry::with_defaults();
            for runner in registry.runners() {
                let (available, version, path) = match runner.check_environment() {
                    EnvironmentStatus::OK { version, path } => (true, Some(version), Some(path)),
                    EnvironmentStatus::Missing => (false, None, None),
                };
                let probe = backend.probe(runner.language());
                print_json(&RunnerReport {
                    language: runner.language().into(),
                    toolchain: runner.toolchain().into(),
                    compiled: runner.compiles(),
                    available,
                    version,
                    path,
                    backend: backend.name().into(),
                    backend_ready: probe.is_ok(),
                    backend_error: probe.err().map(|e| e.to_string()),
                })?;
            }
        }
    }

    Ok(())
}

/// Submits every case at once and prints one report per line in manifest
/// order. Returns the number of cases that did not match.
async fn batch(config: SandpitConfig, manifest_path: &Path) -> Result<usize> {
    let manifest: Manifest = serde_yaml::from_str(&fs::read_to_string(manifest_path)?)?;
    let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let registry = RunnerRegistry::with_defaults();
    let default_limits = manifest.limits.unwrap_or(config.defaults);

    let dispatcher = Dispatcher::from_config(config);
    let mut pending = Vec::with_capacity(manifest.cases.len());
    for case in &manifest.cases {
        let source = base.join(&case.source);
        let language = match &case.language {
            Some(language) => language.clone(),
            None => infer_language(&registry, &source)?,
        };
        let stdin = match (&case.stdin, &case.stdin_file) {
            (Some(stdin), _) => stdin.clone(),
            (None, Some(file)) => fs::read_to_string(base.join(file))?,
            (None, None) => String::new(),
        };
        let submission = Submission {
            id: case.id.clone(),
            language,
            sources: vec![SourceFile::unnamed(fs::read_to_string(&source)?)],
            stdin,
            limits: case.limits.unwrap_or(default_limits),
        };
        pending.push((case, dispatcher.submit(submission)?));
    }

    let mut failed = 0;
    for (case, ticket) in pending {
        let result = match ticket.wait().await {
            Some(result) => result,
            None => {
                failed += 1;
                continue;
            }
        };
        let passed = case_passed(case, &result);
        if !passed {
            failed += 1;
        }
        info!("{}: {}", case.id, result.verdict.label());
        print_json(&CaseReport {
            result: &result,
            passed,
        })?;
    }
    Ok(failed)
}

fn case_passed(case: &Case, result: &ExecutionResult) -> bool {
    let verdict_ok = match case.expected_verdict {
        Some(expected) => expected == result.verdict,
        None => result.verdict.is_user_outcome(),
    };
    let stdout_ok = case
        .expected_stdout
        .as_ref()
        .map_or(true, |expected| expected.trim_end() == result.stdout.trim_end());
    verdict_ok && stdout_ok
}

fn infer_language(registry: &RunnerRegistry, path: &Path) -> Result<String> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| Error::Argument(format!("cannot infer language of `{}`", path.display())))?;
    registry
        .for_extension(extension)
        .map(|runner| runner.language().to_string())
        .ok_or_else(|| Error::Argument(format!("no runner handles `.{}` files", extension)))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "submission".into())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let line = serde_json::to_string(value).map_err(std::io::Error::from)?;
    println!("{}", line);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_shape() {
        let manifest: Manifest = serde_yaml::from_str(
            r#"
limits:
  timeMs: 2000
cases:
  - id: hello
    source: sh/hello.sh
    expectedVerdict: Accepted
    expectedStdout: "Hello, World!"
  - id: sum
    language: sh
    source: sh/sum.sh
    stdinFile: sh/sum.in
"#,
        )
        .unwrap();
        assert_eq!(manifest.limits.unwrap().time_ms, 2000);
        assert_eq!(manifest.cases.len(), 2);
        assert_eq!(manifest.cases[0].expected_verdict, Some(Verdict::Accepted));
        assert_eq!(manifest.cases[1].stdin_file.as_deref(), Some(Path::new("sh/sum.in")));
    }

    #[test]
    fn language_from_extension() {
        let registry = RunnerRegistry::with_defaults();
        assert_eq!(infer_language(&registry, Path::new("a/Main.java")).unwrap(), "java");
        assert_eq!(infer_language(&registry, Path::new("x.cpp")).unwrap(), "cpp");
        assert!(infer_language(&registry, Path::new("Makefile")).is_err());
    }

    #[test]
    fn expectations() {
        let case = Case {
            id: "c".into(),
            language: None,
            source: "c.sh".into(),
            stdin: None,
            stdin_file: None,
            limits: None,
            expected_verdict: Some(Verdict::RuntimeError),
            expected_stdout: None,
        };
        let mut result =
            ExecutionResult::sandbox_error("c", sandpit_core::SandboxFailure::QueueFull);
        assert!(!case_passed(&case, &result));
        result.verdict = Verdict::RuntimeError;
        assert!(case_passed(&case, &result));
    }
}
