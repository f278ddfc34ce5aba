use std::string;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed in IO: {0}")]
    IO(#[from] std::io::Error),
    #[error("argument provided is invalid: {0}")]
    Argument(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("failed to parse yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("bytes is not in UTF8")]
    FromUtf8(#[from] string::FromUtf8Error),
    #[error("environment error: {0}")]
    Environment(String),
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sandbox runtime error: {0}")]
    Sandbox(String),
    #[error("illegal state transition from {from} to {to}")]
    Transition { from: String, to: String },
}
