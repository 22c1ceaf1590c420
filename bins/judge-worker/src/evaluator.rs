/// Verdict Evaluator - Language-Agnostic Judging Logic
///
/// **Core Responsibility:**
/// Turn a raw sandbox outcome plus a test case's expected output into a verdict.
///
/// **Critical Properties:**
/// - Knows nothing about Docker
/// - Knows nothing about language runtimes
/// - Pure function: (raw outcome, expected output) → verdict
///
/// **Normalization Rules (Applied to All Languages):**
/// - Trim leading and trailing whitespace: YES
/// - Internal whitespace and newlines: exact match
/// - Case sensitivity: YES
///
/// Process-level failures (timeout, crash, memory, output size, compile) decide the verdict
/// on their own; output is only compared for runs that finished cleanly.
use crate::engine::RawOutcome;
use judge_common::SubmissionStatus;

pub const ACCEPTED_MESSAGE: &str = "Accepted";
pub const WRONG_ANSWER_MESSAGE: &str = "Wrong Answer";
pub const TIME_LIMIT_MESSAGE: &str = "Time limit exceeded";
pub const MEMORY_LIMIT_MESSAGE: &str = "Memory limit exceeded";
pub const COMPILATION_ERROR_MESSAGE: &str = "Compilation error";
pub const OUTPUT_LIMIT_MESSAGE: &str = "Output limit exceeded";

/// Outcome of one test case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: SubmissionStatus,
    pub message: String,
    pub passed: bool,
    /// Diagnostic text worth keeping (compiler errors, stderr of a crash)
    pub detail: Option<String>,
}

impl Verdict {
    fn new(status: SubmissionStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            passed: status == SubmissionStatus::Accepted,
            detail: None,
        }
    }

    fn with_detail(mut self, detail: &str) -> Self {
        let detail = detail.trim();
        if !detail.is_empty() {
            self.detail = Some(detail.to_string());
        }
        self
    }
}

/// Normalize output string for comparison
///
/// Strips surrounding whitespace only; internal whitespace is preserved.
pub fn normalize_output(output: &str) -> &str {
    output.trim()
}

/// Compare captured output against the expected output
pub fn compare_output(actual: &str, expected: &str) -> Verdict {
    if normalize_output(actual) == normalize_output(expected) {
        Verdict::new(SubmissionStatus::Accepted, ACCEPTED_MESSAGE)
    } else {
        Verdict::new(SubmissionStatus::WrongAnswer, WRONG_ANSWER_MESSAGE)
    }
}

/// Judge one sandbox run against the test case's expected output
pub fn evaluate(outcome: &RawOutcome, expected_output: &str) -> Verdict {
    match outcome {
        RawOutcome::Finished { stdout, .. } => compare_output(stdout, expected_output),
        RawOutcome::TimedOut { .. } => {
            Verdict::new(SubmissionStatus::TimeLimitExceeded, TIME_LIMIT_MESSAGE)
        }
        RawOutcome::MemoryExceeded { .. } => {
            Verdict::new(SubmissionStatus::MemoryLimitExceeded, MEMORY_LIMIT_MESSAGE)
        }
        RawOutcome::OutputLimitExceeded { .. } => {
            Verdict::new(SubmissionStatus::RuntimeError, OUTPUT_LIMIT_MESSAGE)
        }
        RawOutcome::Crashed {
            exit_code, stderr, ..
        } => Verdict::new(
            SubmissionStatus::RuntimeError,
            format!("Runtime error (exit code: {})", exit_code),
        )
        .with_detail(stderr),
        RawOutcome::CompileFailed { stderr } => {
            Verdict::new(SubmissionStatus::CompilationError, COMPILATION_ERROR_MESSAGE)
                .with_detail(stderr)
        }
    }
}
