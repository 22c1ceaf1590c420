use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type SubmissionId = Uuid;
pub type ProblemId = u64;
pub type ContestId = u64;
pub type TestCaseId = u64;

/// Judging status of a submission
///
/// `Pending -> Running -> {terminal}`. Every status other than `Pending` and
/// `Running` is terminal and has no outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Pending,
    Running,
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    CompilationError,
}

impl SubmissionStatus {
    pub const ALL: [SubmissionStatus; 8] = [
        SubmissionStatus::Pending,
        SubmissionStatus::Running,
        SubmissionStatus::Accepted,
        SubmissionStatus::WrongAnswer,
        SubmissionStatus::TimeLimitExceeded,
        SubmissionStatus::MemoryLimitExceeded,
        SubmissionStatus::RuntimeError,
        SubmissionStatus::CompilationError,
    ];

    pub fn is_terminal(self) -> bool {
        !matches!(self, SubmissionStatus::Pending | SubmissionStatus::Running)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph
    pub fn can_transition_to(self, next: SubmissionStatus) -> bool {
        match self {
            SubmissionStatus::Pending => next == SubmissionStatus::Running,
            SubmissionStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "PENDING",
            SubmissionStatus::Running => "RUNNING",
            SubmissionStatus::Accepted => "ACCEPTED",
            SubmissionStatus::WrongAnswer => "WRONG_ANSWER",
            SubmissionStatus::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            SubmissionStatus::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            SubmissionStatus::RuntimeError => "RUNTIME_ERROR",
            SubmissionStatus::CompilationError => "COMPILATION_ERROR",
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of languages the judge can build and run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Cpp,
    Java,
    Python,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::Cpp, Language::Java, Language::Python];

    pub fn name(self) -> &'static str {
        match self {
            Language::Cpp => "cpp",
            Language::Java => "java",
            Language::Python => "python",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported language: {0}")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    /// Case-insensitive; surrounding whitespace is ignored
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpp" | "c++" => Ok(Language::Cpp),
            "java" => Ok(Language::Java),
            "python" | "python3" => Ok(Language::Python),
            _ => Err(UnknownLanguage(s.to_string())),
        }
    }
}

/// One code-execution request and its judging state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub code: String,
    /// Language as declared at intake, parsed only when judged
    pub language: String,
    pub status: SubmissionStatus,
    pub result: Option<String>,
    pub execution_time_ms: Option<u64>,
    /// Never measured; kept for record compatibility
    pub memory_used_mb: Option<u32>,
    pub error_message: Option<String>,
    pub submitted_at: DateTime<Utc>,
    /// When a judge took the submission into RUNNING; its claim stamp
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    pub problem_id: ProblemId,
    pub contest_id: ContestId,
    pub username: String,
}

impl Submission {
    /// Fresh `Pending` submission stamped with the current time
    pub fn new(
        code: impl Into<String>,
        language: impl Into<String>,
        problem_id: ProblemId,
        contest_id: ContestId,
        username: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.into(),
            language: language.into(),
            status: SubmissionStatus::Pending,
            result: None,
            execution_time_ms: None,
            memory_used_mb: None,
            error_message: None,
            submitted_at: Utc::now(),
            claimed_at: None,
            problem_id,
            contest_id,
            username: username.into(),
        }
    }
}

/// A contest submissions are made under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contest {
    pub id: ContestId,
    pub title: String,
}

/// Judging parameters of a contest problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub id: ProblemId,
    pub title: String,
    pub time_limit_seconds: u32,
    pub memory_limit_mb: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: TestCaseId,
    pub problem_id: ProblemId,
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub hidden: bool,
}
