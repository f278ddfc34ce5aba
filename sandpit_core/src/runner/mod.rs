pub mod gpp;
pub mod golang;
pub mod interpreter;
pub mod java;

use std::{
    collections::{BTreeMap, HashSet},
    process::{Command, Stdio},
    sync::Arc,
};

use crate::{
    error::{Error, Result},
    submission::SourceFile,
};

/// A language runner: how sources are laid out in the slot, how they are
/// compiled (if at all) and how the program is started.
///
/// Argument vectors are relative to the slot workspace, which is the
/// working directory of every phase.
pub trait Runner: Send + Sync {
    fn language(&self) -> &'static str;

    /// Primary source extension, used to infer the language of a file.
    fn extension(&self) -> &'static str;

    /// Binary whose presence decides whether the runner is usable on this host.
    fn toolchain(&self) -> &'static str;

    fn compiles(&self) -> bool;

    fn stage(&self, sources: &[SourceFile]) -> Result<Staged> {
        stage_with_default(sources, &format!("main.{}", self.extension()))
    }

    fn compile_argv(&self, staged: &Staged) -> Option<Vec<String>>;

    fn run_argv(&self, staged: &Staged) -> Vec<String>;

    /// Whether an address-space rlimit is safe for the running program.
    /// Runtimes that reserve large virtual ranges up front must say no.
    fn limits_address_space(&self) -> bool {
        false
    }

    fn check_environment(&self) -> EnvironmentStatus {
        probe_toolchain(self.toolchain(), "--version")
    }
}

/// Sources as they will be written into the slot, plus the entry point
/// handed to the worker (a file name or, for Java, a class name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Staged {
    pub files: Vec<SourceFile>,
    pub entry: String,
}

impl Staged {
    pub fn names_with_extension(&self, extensions: &[&str]) -> Vec<String> {
        self.files
            .iter()
            .filter(|f| {
                f.name
                    .rsplit_once('.')
                    .map_or(false, |(_, ext)| extensions.contains(&ext))
            })
            .map(|f| f.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentStatus {
    OK { version: String, path: String },
    Missing,
}

/// Names an unnamed first source `default_name`; every other source must be named.
pub fn stage_with_default(sources: &[SourceFile], default_name: &str) -> Result<Staged> {
    let mut files = Vec::with_capacity(sources.len());
    let mut seen = HashSet::new();
    for (i, source) in sources.iter().enumerate() {
        let name = match (source.name.is_empty(), i) {
            (false, _) => source.name.clone(),
            (true, 0) => default_name.to_string(),
            (true, _) => {
                return Err(Error::Argument(
                    "only the first source file may be unnamed".into(),
                ))
            }
        };
        if !seen.insert(name.clone()) {
            return Err(Error::Argument(format!("duplicate source file `{}`", name)));
        }
        files.push(SourceFile::new(name, source.content.clone()));
    }
    let entry = files
        .first()
        .map(|f| f.name.clone())
        .ok_or_else(|| Error::Argument("no source files".into()))?;
    Ok(Staged { files, entry })
}

/// Locates `binary` on PATH and asks it for its version.
pub fn probe_toolchain(binary: &str, version_arg: &str) -> EnvironmentStatus {
    let path = match which::which(binary) {
        Ok(path) => path,
        Err(_) => return EnvironmentStatus::Missing,
    };
    let version = Command::new(&path)
        .arg(version_arg)
        .stdin(Stdio::null())
        .output()
        .ok()
        .and_then(|output| {
            let stdout = String::from_utf8(output.stdout).ok()?;
            let stderr = String::from_utf8(output.stderr).ok()?;
            stdout
                .lines()
                .chain(stderr.lines())
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "unknown".into());

    EnvironmentStatus::OK {
        version,
        path: path.to_string_lossy().into(),
    }
}

/// Language tag → runner.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: BTreeMap<String, Arc<dyn Runner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(java::CompilerJava::new()));
        registry.register(Arc::new(gpp::CompilerGPP::new(gpp::Dialect::C11)));
        registry.register(Arc::new(gpp::CompilerGPP::new(gpp::Dialect::CPP17)));
        registry.register(Arc::new(golang::CompilerGo::new()));
        for interpreter in interpreter::Interpreter::all() {
            registry.register(Arc::new(interpreter));
        }
        registry
    }

    pub fn register(&mut self, runner: Arc<dyn Runner>) {
        self.runners.insert(runner.language().to_string(), runner);
    }

    pub fn get(&self, language: &str) -> Option<Arc<dyn Runner>> {
        let language = language.trim().to_ascii_lowercase();
        let language = match language.as_str() {
            "c++" | "cc" | "cxx" => "cpp",
            "python3" | "py" => "python",
            "js" | "node" => "javascript",
            "bash" | "shell" => "sh",
            "golang" => "go",
            other => other,
        };
        self.runners.get(language).cloned()
    }

    pub fn for_extension(&self, extension: &str) -> Option<Arc<dyn Runner>> {
        self.runners
            .values()
            .find(|runner| runner.extension().eq_ignore_ascii_case(extension))
            .cloned()
    }

    pub fn runners(&self) -> impl Iterator<Item = &Arc<dyn Runner>> {
        self.runners.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalogue() {
        let registry = RunnerRegistry::with_defaults();
        for language in [
            "java", "c", "cpp", "go", "python", "javascript", "ruby", "perl", "php", "r", "sh",
        ] {
            assert!(registry.get(language).is_some(), "{} missing", language);
        }
        assert_eq!(registry.get("C++").unwrap().language(), "cpp");
        assert_eq!(registry.get("python3").unwrap().language(), "python");
        assert!(registry.get("cobol").is_none());
        assert_eq!(registry.for_extension("java").unwrap().language(), "java");
        assert_eq!(registry.for_extension("py").unwrap().language(), "python");
    }

    #[test]
    fn unnamed_first_file_gets_default() -> Result<()> {
        let staged = stage_with_default(
            &[SourceFile::unnamed("x"), SourceFile::new("util.h", "y")],
            "main.c",
        )?;
        assert_eq!(staged.entry, "main.c");
        assert_eq!(staged.files[1].name, "util.h");
        assert_eq!(staged.names_with_extension(&["c"]), vec!["main.c".to_string()]);
        Ok(())
    }

    #[test]
    fn only_first_file_may_be_unnamed() {
        let result = stage_with_default(
            &[SourceFile::new("a.c", ""), SourceFile::unnamed("")],
            "main.c",
        );
        assert!(result.is_err());
        let clash = stage_with_default(
            &[SourceFile::unnamed(""), SourceFile::new("main.c", "")],
            "main.c",
        );
        assert!(clash.is_err());
    }

    #[test]
    fn shell_is_always_available() {
        let registry = RunnerRegistry::with_defaults();
        let status = registry.get("sh").unwrap().check_environment();
        assert!(matches!(status, EnvironmentStatus::OK { .. }));
    }
}
