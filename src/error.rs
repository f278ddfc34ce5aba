pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Core(sandpit_core::error::Error),
    IO(std::io::Error),
    Json(serde_json::Error),
    Task(tokio::task::JoinError),
}

impl From<sandpit_core::error::Error> for Error {
    fn from(err: sandpit_core::error::Error) -> Self {
        Self::Core(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::IO(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err)
    }
}
