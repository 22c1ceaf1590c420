// Test case orchestration: run test cases in stored order, stop at the first failure

use crate::engine::{InvocationRequest, SandboxInvoker};
use crate::error::{JudgeError, JudgeResult};
use crate::evaluator::{self, ACCEPTED_MESSAGE};
use judge_common::{Problem, Submission, SubmissionStatus, TestCase};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Final result of judging one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeOutcome {
    pub status: SubmissionStatus,
    pub message: String,
    pub error_detail: Option<String>,
    /// Longest wall time among the executed test cases
    pub execution_time_ms: Option<u64>,
    pub tests_run: usize,
}

impl JudgeOutcome {
    /// Terminal outcome for a pipeline error
    pub fn from_error(err: &JudgeError) -> Self {
        let message = match err {
            JudgeError::UnsupportedLanguage(_) => err.to_string(),
            JudgeError::Infrastructure(_) => format!("Execution error: {}", err),
            _ => format!("Judge error: {}", err),
        };
        Self {
            status: SubmissionStatus::RuntimeError,
            message,
            error_detail: Some(format!("{:#}", err)),
            execution_time_ms: None,
            tests_run: 0,
        }
    }
}

pub struct TestRunner {
    invoker: Arc<SandboxInvoker>,
}

impl TestRunner {
    pub fn new(invoker: Arc<SandboxInvoker>) -> Self {
        Self { invoker }
    }

    /// Judge `submission` against `test_cases`, in the given order.
    ///
    /// The first non-accepted verdict ends the run; later test cases are never
    /// executed. No test cases at all counts as accepted.
    #[instrument(
        skip_all,
        fields(submission_id = %submission.id, problem_id = problem.id, test_cases = test_cases.len())
    )]
    pub async fn run(
        &self,
        submission: &Submission,
        problem: &Problem,
        test_cases: &[TestCase],
    ) -> JudgeResult<JudgeOutcome> {
        let language = self.invoker.resolve(&submission.language)?;
        validate_limits(problem)?;

        if test_cases.is_empty() {
            warn!("Problem has no test cases; accepting vacuously");
        }

        let mut slowest: Option<Duration> = None;

        for (idx, test_case) in test_cases.iter().enumerate() {
            let request = InvocationRequest {
                submission_id: submission.id,
                test_case_id: test_case.id,
                language,
                source_code: &submission.code,
                input: &test_case.input,
                time_limit: Duration::from_secs(u64::from(problem.time_limit_seconds)),
                memory_limit_mb: problem.memory_limit_mb,
            };

            let outcome = self.invoker.execute(&request).await?;
            if let Some(elapsed) = outcome.elapsed() {
                slowest = Some(slowest.map_or(elapsed, |s| s.max(elapsed)));
            }

            let verdict = evaluator::evaluate(&outcome, &test_case.expected_output);
            debug!(
                test_num = idx + 1,
                test_case = test_case.id,
                status = %verdict.status,
                "Test case judged"
            );

            if !verdict.passed {
                info!(
                    test_num = idx + 1,
                    test_case = test_case.id,
                    status = %verdict.status,
                    skipped = test_cases.len() - idx - 1,
                    "Stopping at first failing test case"
                );
                return Ok(JudgeOutcome {
                    status: verdict.status,
                    message: verdict.message,
                    error_detail: verdict.detail,
                    execution_time_ms: slowest.map(as_millis),
                    tests_run: idx + 1,
                });
            }
        }

        Ok(JudgeOutcome {
            status: SubmissionStatus::Accepted,
            message: ACCEPTED_MESSAGE.to_string(),
            error_detail: None,
            execution_time_ms: slowest.map(as_millis),
            tests_run: test_cases.len(),
        })
    }
}

fn validate_limits(problem: &Problem) -> JudgeResult<()> {
    if problem.time_limit_seconds == 0 {
        return Err(JudgeError::InvalidProblem {
            id: problem.id,
            reason: "time limit must be positive".to_string(),
        });
    }
    if problem.memory_limit_mb == 0 {
        return Err(JudgeError::InvalidProblem {
            id: problem.id,
            reason: "memory limit must be positive".to_string(),
        });
    }
    Ok(())
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
