use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    Verdict,
};

/// Lifecycle of one submission inside the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "verdict", rename_all = "camelCase")]
pub enum SubmissionState {
    Queued,
    Dispatched,
    Compiling,
    Running,
    Finished(Verdict),
}

impl SubmissionState {
    fn rank(&self) -> u8 {
        match self {
            SubmissionState::Queued => 0,
            SubmissionState::Dispatched => 1,
            SubmissionState::Compiling => 2,
            SubmissionState::Running => 3,
            SubmissionState::Finished(_) => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubmissionState::Finished(_))
    }

    /// Moves forward. Compiling may be skipped; a retried attempt re-enters
    /// `Dispatched`; nothing leaves `Finished`.
    pub fn advance(self, next: SubmissionState) -> Result<SubmissionState> {
        let retry = next == SubmissionState::Dispatched
            && matches!(self, SubmissionState::Compiling | SubmissionState::Running);
        if self.is_terminal() || !(next.rank() > self.rank() || retry) {
            return Err(Error::Transition {
                from: format!("{:?}", self),
                to: format!("{:?}", next),
            });
        }
        Ok(next)
    }
}
