use std::{
    collections::HashSet,
    path::{Component, Path},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_TIME_MS: u64 = 15_000;
pub const DEFAULT_MEMORY_BYTES: u64 = 128 << 20;
pub const DEFAULT_OUTPUT_BYTE_CAP: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Limits {
    pub time_ms: u64,
    pub memory_bytes: u64,
    pub output_byte_cap: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            time_ms: DEFAULT_TIME_MS,
            memory_bytes: DEFAULT_MEMORY_BYTES,
            output_byte_cap: DEFAULT_OUTPUT_BYTE_CAP,
        }
    }
}

impl Limits {
    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.time_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Empty when the runner should pick the name.
    #[serde(default)]
    pub name: String,
    pub content: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn unnamed(content: impl Into<String>) -> Self {
        Self::new(String::new(), content)
    }
}

/// One request to compile and run untrusted source. Immutable once queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub language: String,
    pub sources: Vec<SourceFile>,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub limits: Limits,
}

impl Submission {
    pub fn new(
        id: impl Into<String>,
        language: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            language: language.into(),
            sources: vec![SourceFile::unnamed(source)],
            stdin: String::new(),
            limits: Limits::default(),
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = stdin.into();
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Argument("submission id is empty".into()));
        }
        if self.sources.is_empty() {
            return Err(Error::Argument(format!("submission `{}` has no sources", self.id)));
        }
        if self.limits.time_ms == 0 || self.limits.memory_bytes == 0 {
            return Err(Error::Argument(format!(
                "submission `{}` has a zero time or memory limit",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for file in self.sources.iter().filter(|f| !f.name.is_empty()) {
            check_file_name(&file.name)?;
            if !seen.insert(file.name.as_str()) {
                return Err(Error::Argument(format!("duplicate source file `{}`", file.name)));
            }
        }
        Ok(())
    }
}

/// Accepts a bare file name that stays inside the slot workspace.
pub fn check_file_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains('\\') => Ok(()),
        _ => Err(Error::Argument(format!("illegal source file name `{}`", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_service_limits() {
        let limits = Limits::default();
        assert_eq!(limits.time_limit(), Duration::from_secs(15));
        assert_eq!(limits.memory_bytes, 128 * 1024 * 1024);
        assert_eq!(limits.output_byte_cap, 1024 * 1024);
    }

    #[test]
    fn rejects_escaping_file_names() {
        for name in ["../x.java", "/etc/passwd", "a/b.py", ".", "..", "a\\b.c"] {
            assert!(check_file_name(name).is_err(), "{} should be rejected", name);
        }
        assert!(check_file_name("Main.java").is_ok());
    }

    #[test]
    fn validate_submission() {
        assert!(Submission::new("a", "sh", "echo hi").validate().is_ok());
        assert!(Submission::new(" ", "sh", "echo hi").validate().is_err());

        let mut dup = Submission::new("b", "c", "");
        dup.sources = vec![SourceFile::new("x.c", ""), SourceFile::new("x.c", "")];
        assert!(dup.validate().is_err());

        let zero = Submission::new("c", "sh", "").with_limits(Limits {
            time_ms: 0,
            ..Limits::default()
        });
        assert!(zero.validate().is_err());
    }

    #[test]
    fn deserialize_with_default_limits() {
        let submission: Submission = serde_yaml::from_str(
            "id: x\nlanguage: python\nsources:\n  - content: print(1)\n",
        )
        .unwrap();
        assert_eq!(submission.limits, Limits::default());
        assert_eq!(submission.sources[0].name, "");
        assert_eq!(submission.stdin, "");
    }
}
