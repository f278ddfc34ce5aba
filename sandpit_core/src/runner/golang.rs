use super::{probe_toolchain, EnvironmentStatus, Runner, Staged};

pub struct CompilerGo;

impl CompilerGo {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CompilerGo {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner for CompilerGo {
    fn language(&self) -> &'static str {
        "go"
    }

    fn extension(&self) -> &'static str {
        "go"
    }

    fn toolchain(&self) -> &'static str {
        "go"
    }

    fn compiles(&self) -> bool {
        true
    }

    fn compile_argv(&self, staged: &Staged) -> Option<Vec<String>> {
        let mut argv = vec!["go".into(), "build".into(), "-o".into(), "main".into()];
        argv.extend(staged.names_with_extension(&["go"]));
        Some(argv)
    }

    fn run_argv(&self, _staged: &Staged) -> Vec<String> {
        vec!["./main".into()]
    }

    fn check_environment(&self) -> EnvironmentStatus {
        probe_toolchain(self.toolchain(), "version")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::SourceFile;

    #[test]
    fn go_build_line() {
        let runner = CompilerGo::new();
        let staged = runner
            .stage(&[
                SourceFile::unnamed("package main\nfunc main() {}"),
                SourceFile::new("util.go", "package main"),
            ])
            .unwrap();
        assert_eq!(
            runner.compile_argv(&staged).unwrap(),
            vec!["go", "build", "-o", "main", "main.go", "util.go"]
        );
        assert!(!runner.limits_address_space());
    }
}
