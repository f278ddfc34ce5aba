use super::{Runner, Staged};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    C11,
    CPP17,
}

impl From<Dialect> for String {
    fn from(v: Dialect) -> Self {
        match v {
            Dialect::C11 => "-std=c11".into(),
            Dialect::CPP17 => "-std=c++17".into(),
        }
    }
}

/// gcc / g++ producing `./main`.
pub struct CompilerGPP {
    dialect: Dialect,
}

impl CompilerGPP {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    fn sources(&self) -> &'static [&'static str] {
        match self.dialect {
            Dialect::C11 => &["c"],
            Dialect::CPP17 => &["cpp", "cc", "cxx"],
        }
    }
}

impl Runner for CompilerGPP {
    fn language(&self) -> &'static str {
        match self.dialect {
            Dialect::C11 => "c",
            Dialect::CPP17 => "cpp",
        }
    }

    fn extension(&self) -> &'static str {
        self.sources()[0]
    }

    fn toolchain(&self) -> &'static str {
        match self.dialect {
            Dialect::C11 => "gcc",
            Dialect::CPP17 => "g++",
        }
    }

    fn compiles(&self) -> bool {
        true
    }

    fn compile_argv(&self, staged: &Staged) -> Option<Vec<String>> {
        let mut argv = vec![
            self.toolchain().to_string(),
            String::from(self.dialect),
            "-O2".into(),
            "-pipe".into(),
            "-o".into(),
            "main".into(),
        ];
        argv.extend(staged.names_with_extension(self.sources()));
        if self.dialect == Dialect::C11 {
            argv.push("-lm".into());
        }
        Some(argv)
    }

    fn run_argv(&self, _staged: &Staged) -> Vec<String> {
        vec!["./main".into()]
    }

    fn limits_address_space(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::SourceFile;

    #[test]
    fn cpp_command_line() {
        let runner = CompilerGPP::new(Dialect::CPP17);
        let staged = runner
            .stage(&[SourceFile::unnamed("int main(){}"), SourceFile::new("lib.h", "")])
            .unwrap();
        assert_eq!(staged.entry, "main.cpp");
        assert_eq!(
            runner.compile_argv(&staged).unwrap(),
            vec!["g++", "-std=c++17", "-O2", "-pipe", "-o", "main", "main.cpp"]
        );
        assert_eq!(runner.run_argv(&staged), vec!["./main"]);
    }

    #[test]
    fn c_links_libm() {
        let runner = CompilerGPP::new(Dialect::C11);
        let staged = runner.stage(&[SourceFile::unnamed("int main(){}")]).unwrap();
        let argv = runner.compile_argv(&staged).unwrap();
        assert_eq!(argv[0], "gcc");
        assert_eq!(argv.last().unwrap(), "-lm");
        assert!(argv.contains(&"main.c".to_string()));
    }

    #[test]
    #[ignore = "needs g++ on PATH"]
    fn gpp_environment() {
        let result = CompilerGPP::new(Dialect::CPP17).check_environment();
        match result {
            super::super::EnvironmentStatus::OK { version: _, path: _ } => {
                assert!(which::which("g++").is_ok());
            }
            super::super::EnvironmentStatus::Missing => {
                assert!(which::which("g++").is_err());
            }
        }
    }
}
