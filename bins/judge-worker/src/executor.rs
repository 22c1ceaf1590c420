/// Judge Pipeline - High-Level Orchestration
///
/// **Responsibility:**
/// Take one submission id from PENDING to a terminal status.
///
/// **Architecture:**
/// 1. Claim the submission: PENDING -> RUNNING (state.rs)
/// 2. Load the problem limits and ordered test cases by id (store traits)
/// 3. Run the test cases (runner.rs → engine.rs + evaluator.rs)
/// 4. Write the terminal status back (state.rs)
///
/// Pipeline errors after step 1 become a RUNTIME_ERROR outcome here; only
/// failures to read or write the submission itself escape to the dispatcher.
use crate::error::JudgeResult;
use crate::runner::{JudgeOutcome, TestRunner};
use crate::state::{Begin, SubmissionStateMachine};
use judge_common::{ProblemStore, Submission, SubmissionId, SubmissionStatus, TestCaseStore};
use std::sync::Arc;
use tracing::{error, info, instrument};

pub struct JudgePipeline {
    states: SubmissionStateMachine,
    problems: Arc<dyn ProblemStore>,
    test_cases: Arc<dyn TestCaseStore>,
    runner: TestRunner,
}

impl JudgePipeline {
    pub fn new(
        states: SubmissionStateMachine,
        problems: Arc<dyn ProblemStore>,
        test_cases: Arc<dyn TestCaseStore>,
        runner: TestRunner,
    ) -> Self {
        Self {
            states,
            problems,
            test_cases,
            runner,
        }
    }

    /// Claim `submission_id` for this judge.
    ///
    /// `None` when there is nothing to do: already terminal or held by a
    /// live claim elsewhere.
    pub async fn claim(&self, submission_id: SubmissionId) -> JudgeResult<Option<Submission>> {
        match self.states.begin(submission_id).await? {
            Begin::Started(submission) => Ok(Some(submission)),
            Begin::AlreadyFinished(status) => {
                info!(submission_id = %submission_id, status = %status, "Submission already judged; leaving result untouched");
                Ok(None)
            }
            Begin::ClaimedElsewhere => {
                info!(submission_id = %submission_id, "Submission is being judged elsewhere");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn judge(&self, submission_id: SubmissionId) -> JudgeResult<()> {
        match self.claim(submission_id).await? {
            Some(claimed) => self.judge_claimed(claimed).await,
            None => Ok(()),
        }
    }

    /// Run a claimed submission to its terminal status
    #[instrument(skip_all, fields(submission_id = %claimed.id))]
    pub async fn judge_claimed(&self, claimed: Submission) -> JudgeResult<()> {
        let started = std::time::Instant::now();
        let outcome = match self.run_tests(&claimed).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Judging failed");
                JudgeOutcome::from_error(&e)
            }
        };

        info!(
            status = %outcome.status,
            tests_run = outcome.tests_run,
            judge_ms = started.elapsed().as_millis() as u64,
            "Judging completed"
        );

        self.states.complete(&claimed, &outcome).await?;
        Ok(())
    }

    async fn run_tests(&self, submission: &Submission) -> JudgeResult<JudgeOutcome> {
        let problem = self.problems.get(submission.problem_id).await?;
        let test_cases = self.test_cases.list_by_problem(problem.id).await?;
        self.runner.run(submission, &problem, &test_cases).await
    }

    /// Last-resort terminal write used by the dispatcher
    pub async fn fail(&self, claimed: &Submission, message: String) -> JudgeResult<()> {
        let outcome = JudgeOutcome {
            status: SubmissionStatus::RuntimeError,
            error_detail: Some(message.clone()),
            message,
            execution_time_ms: None,
            tests_run: 0,
        };
        self.states.complete(claimed, &outcome).await?;
        Ok(())
    }
}
