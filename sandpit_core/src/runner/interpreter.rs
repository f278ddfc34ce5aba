use super::{probe_toolchain, EnvironmentStatus, Runner, Staged};

/// A language run straight from source by an interpreter binary.
#[derive(Debug, Clone)]
pub struct Interpreter {
    language: &'static str,
    binary: &'static str,
    extension: &'static str,
    /// `None` when the binary has no version flag.
    version_arg: Option<&'static str>,
}

impl Interpreter {
    pub const fn new(
        language: &'static str,
        binary: &'static str,
        extension: &'static str,
        version_arg: Option<&'static str>,
    ) -> Self {
        Self {
            language,
            binary,
            extension,
            version_arg,
        }
    }

    pub fn all() -> Vec<Interpreter> {
        vec![
            Interpreter::new("python", "python3", "py", Some("--version")),
            Interpreter::new("javascript", "node", "js", Some("--version")),
            Interpreter::new("ruby", "ruby", "rb", Some("--version")),
            Interpreter::new("perl", "perl", "pl", Some("-v")),
            Interpreter::new("php", "php", "php", Some("--version")),
            Interpreter::new("r", "Rscript", "r", Some("--version")),
            Interpreter::new("sh", "sh", "sh", None),
        ]
    }
}

impl Runner for Interpreter {
    fn language(&self) -> &'static str {
        self.language
    }

    fn extension(&self) -> &'static str {
        self.extension
    }

    fn toolchain(&self) -> &'static str {
        self.binary
    }

    fn compiles(&self) -> bool {
        false
    }

    fn compile_argv(&self, _staged: &Staged) -> Option<Vec<String>> {
        None
    }

    fn run_argv(&self, staged: &Staged) -> Vec<String> {
        vec![self.binary.to_string(), staged.entry.clone()]
    }

    fn check_environment(&self) -> EnvironmentStatus {
        match self.version_arg {
            Some(arg) => probe_toolchain(self.binary, arg),
            None => match which::which(self.binary) {
                Ok(path) => EnvironmentStatus::OK {
                    version: "posix".into(),
                    path: path.to_string_lossy().into(),
                },
                Err(_) => EnvironmentStatus::Missing,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::SourceFile;

    #[test]
    fn runs_entry_file() {
        let python = Interpreter::all()
            .into_iter()
            .find(|i| i.language() == "python")
            .unwrap();
        let staged = python.stage(&[SourceFile::unnamed("print(1)")]).unwrap();
        assert_eq!(staged.entry, "main.py");
        assert!(python.compile_argv(&staged).is_none());
        assert_eq!(python.run_argv(&staged), vec!["python3", "main.py"]);
    }

    #[test]
    fn languages_are_unique() {
        let all = Interpreter::all();
        let mut names: Vec<_> = all.iter().map(|i| i.language()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), all.len());
    }
}
