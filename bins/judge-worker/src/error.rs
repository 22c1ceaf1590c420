use judge_common::{ProblemId, StoreError, SubmissionId, SubmissionStatus};

/// Failures of the judging pipeline.
///
/// Program-level outcomes (timeout, nonzero exit, wrong output) are not
/// errors; they travel as `RawOutcome` / `Verdict` values.
#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("submission {0} not found")]
    NotFound(SubmissionId),

    #[error("illegal status transition {from} -> {to} for submission {id}")]
    IllegalTransition {
        id: SubmissionId,
        from: SubmissionStatus,
        to: SubmissionStatus,
    },

    #[error("submission {0} was taken over by another judge")]
    ClaimLost(SubmissionId),

    #[error("problem {id} is not judgeable: {reason}")]
    InvalidProblem { id: ProblemId, reason: String },

    #[error("sandbox failure: {0:#}")]
    Infrastructure(anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JudgeError {
    pub fn infrastructure(err: impl Into<anyhow::Error>) -> Self {
        JudgeError::Infrastructure(err.into())
    }
}

impl From<std::io::Error> for JudgeError {
    fn from(err: std::io::Error) -> Self {
        JudgeError::Infrastructure(err.into())
    }
}

pub type JudgeResult<T> = Result<T, JudgeError>;
