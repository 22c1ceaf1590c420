// Submission lifecycle: PENDING -> RUNNING -> terminal, persisted through the store

use crate::error::{JudgeError, JudgeResult};
use crate::runner::JudgeOutcome;
use chrono::{DateTime, Utc};
use judge_common::{StoreError, Submission, SubmissionId, SubmissionStatus, SubmissionStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How long a RUNNING claim is honoured before another judge may take it over
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(15 * 60);

/// Result of trying to start judging a submission
#[derive(Debug, Clone, PartialEq)]
pub enum Begin {
    /// Claimed by this judge and now RUNNING; judge it
    Started(Submission),
    /// Already terminal; its stored result must stay as is
    AlreadyFinished(SubmissionStatus),
    /// Another judge holds a live claim on it
    ClaimedElsewhere,
}

/// Sole writer of submission status.
///
/// Every write is a compare-and-set against the status and claim stamp the
/// caller last saw, so two judges can never both move the same submission.
pub struct SubmissionStateMachine {
    store: Arc<dyn SubmissionStore>,
    lease: Duration,
}

impl SubmissionStateMachine {
    pub fn new(store: Arc<dyn SubmissionStore>) -> Self {
        Self {
            store,
            lease: DEFAULT_CLAIM_LEASE,
        }
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    async fn load(&self, id: SubmissionId) -> JudgeResult<Submission> {
        self.store.get(id).await.map_err(|e| not_found_as_judge(id, e))
    }

    /// Write `current` moved to `to`, provided nobody changed it since it was read
    async fn transition<F>(&self, current: &Submission, to: SubmissionStatus, apply: F) -> JudgeResult<Submission>
    where
        F: FnOnce(&mut Submission),
    {
        let id = current.id;
        let from = current.status;
        if !from.can_transition_to(to) {
            return Err(JudgeError::IllegalTransition { id, from, to });
        }

        let mut next = current.clone();
        next.status = to;
        apply(&mut next);

        let written = self
            .store
            .save_if_unchanged(current, &next)
            .await
            .map_err(|e| not_found_as_judge(id, e))?;
        if !written {
            return Err(JudgeError::ClaimLost(id));
        }

        info!(submission_id = %id, from = %from, to = %to, "Submission status advanced");
        Ok(next)
    }

    /// Move a submission to `status` with `message` as its result text
    pub async fn advance(
        &self,
        id: SubmissionId,
        status: SubmissionStatus,
        message: Option<String>,
    ) -> JudgeResult<Submission> {
        let current = self.load(id).await?;
        self.transition(&current, status, |submission| submission.result = message)
            .await
    }

    /// Claim a submission for judging: PENDING -> RUNNING.
    ///
    /// A terminal submission is left untouched. A RUNNING one is taken over
    /// only once its claim is older than the lease, i.e. its judge died.
    pub async fn begin(&self, id: SubmissionId) -> JudgeResult<Begin> {
        let current = self.load(id).await?;
        let now = Utc::now();

        match current.status {
            SubmissionStatus::Pending => {}
            SubmissionStatus::Running if self.is_stale(current.claimed_at, now) => {
                warn!(
                    submission_id = %id,
                    claimed_at = ?current.claimed_at,
                    "Taking over RUNNING submission with expired claim"
                );
            }
            SubmissionStatus::Running => return Ok(Begin::ClaimedElsewhere),
            terminal => return Ok(Begin::AlreadyFinished(terminal)),
        }

        let mut claimed = current.clone();
        claimed.status = SubmissionStatus::Running;
        claimed.claimed_at = Some(now);

        match self.store.save_if_unchanged(&current, &claimed).await {
            Ok(true) => {
                info!(submission_id = %id, from = %current.status, "Submission claimed");
                Ok(Begin::Started(claimed))
            }
            Ok(false) => Ok(Begin::ClaimedElsewhere),
            Err(e) => Err(not_found_as_judge(id, e)),
        }
    }

    /// RUNNING -> terminal for a submission this judge claimed
    pub async fn complete(&self, claimed: &Submission, outcome: &JudgeOutcome) -> JudgeResult<Submission> {
        self.transition(claimed, outcome.status, |submission| {
            submission.result = Some(outcome.message.clone());
            submission.error_message = outcome.error_detail.clone();
            submission.execution_time_ms = outcome.execution_time_ms;
        })
        .await
    }

    fn is_stale(&self, claimed_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match claimed_at {
            // RUNNING records written before claims were stamped
            None => true,
            Some(at) => (now - at).to_std().map_or(false, |age| age >= self.lease),
        }
    }
}

fn not_found_as_judge(id: SubmissionId, err: StoreError) -> JudgeError {
    match err {
        StoreError::NotFound { .. } => JudgeError::NotFound(id),
        other => JudgeError::Store(other),
    }
}
