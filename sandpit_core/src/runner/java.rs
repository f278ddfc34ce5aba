use std::sync::OnceLock;

use regex::Regex;

use super::{probe_toolchain, stage_with_default, EnvironmentStatus, Runner, Staged};
use crate::{error::Result, submission::SourceFile};

pub const DEFAULT_CLASS: &str = "Main";

pub struct CompilerJava;

impl CompilerJava {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CompilerJava {
    fn default() -> Self {
        Self::new()
    }
}

fn public_class() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"public\s+(?:(?:final|abstract|strictfp)\s+)*class\s+([A-Za-z_$][A-Za-z0-9_$]*)",
        )
        .expect("public class pattern is valid")
    })
}

fn any_class() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\bclass\s+([A-Za-z_$][A-Za-z0-9_$]*)").expect("class pattern is valid")
    })
}

/// Name of the class a single-file submission must live in: the public
/// class when there is one, otherwise the first declared class.
pub fn detect_class(src: &str) -> String {
    public_class()
        .captures(src)
        .or_else(|| any_class().captures(src))
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| DEFAULT_CLASS.to_string())
}

impl Runner for CompilerJava {
    fn language(&self) -> &'static str {
        "java"
    }

    fn extension(&self) -> &'static str {
        "java"
    }

    fn toolchain(&self) -> &'static str {
        "javac"
    }

    fn compiles(&self) -> bool {
        true
    }

    fn stage(&self, sources: &[SourceFile]) -> Result<Staged> {
        let default_name = match sources.first() {
            Some(first) if first.name.is_empty() => {
                format!("{}.java", detect_class(&first.content))
            }
            _ => format!("{}.java", DEFAULT_CLASS),
        };
        let mut staged = stage_with_default(sources, &default_name)?;
        staged.entry = staged
            .entry
            .strip_suffix(".java")
            .unwrap_or(&staged.entry)
            .to_string();
        Ok(staged)
    }

    fn compile_argv(&self, staged: &Staged) -> Option<Vec<String>> {
        let mut argv: Vec<String> = ["javac", "-encoding", "UTF-8", "-d", "."]
            .iter()
            .map(|s| s.to_string())
            .collect();
        argv.extend(staged.names_with_extension(&["java"]));
        Some(argv)
    }

    fn run_argv(&self, staged: &Staged) -> Vec<String> {
        vec![
            "java".into(),
            "-XX:+UseSerialGC".into(),
            "-XX:-UsePerfData".into(),
            "-Xss64m".into(),
            "-cp".into(),
            ".".into(),
            staged.entry.clone(),
        ]
    }

    fn check_environment(&self) -> EnvironmentStatus {
        probe_toolchain(self.toolchain(), "-version")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_public_class() {
        let src = "import java.util.*;\nclass Helper {}\npublic final class Solution {\n public static void main(String[] a) {}\n}";
        assert_eq!(detect_class(src), "Solution");
        assert_eq!(detect_class("class Foo { }"), "Foo");
        assert_eq!(detect_class("interface Nothing {}"), "Main");
    }

    #[test]
    fn stages_under_class_name() -> Result<()> {
        let runner = CompilerJava::new();
        let staged = runner.stage(&[SourceFile::unnamed(
            "public class Hello { public static void main(String[] a) { System.out.println(1); } }",
        )])?;
        assert_eq!(staged.files[0].name, "Hello.java");
        assert_eq!(staged.entry, "Hello");
        assert_eq!(
            runner.compile_argv(&staged).unwrap(),
            vec!["javac", "-encoding", "UTF-8", "-d", ".", "Hello.java"]
        );
        assert_eq!(runner.run_argv(&staged).last().unwrap(), "Hello");
        Ok(())
    }

    #[test]
    fn named_files_keep_their_names() -> Result<()> {
        let staged = CompilerJava::new().stage(&[
            SourceFile::new("App.java", "public class App {}"),
            SourceFile::new("Util.java", "class Util {}"),
        ])?;
        assert_eq!(staged.entry, "App");
        assert_eq!(staged.files.len(), 2);
        Ok(())
    }
}
