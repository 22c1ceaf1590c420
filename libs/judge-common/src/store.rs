/// Store interfaces consumed by the judging core
///
/// The judge only ever needs identifier-based lookups: a submission by id,
/// a problem's limits by id, and the ordered test cases of a problem.
/// Intake additionally checks that the contest exists.
/// Implementations: `RedisStore` (production) and `MemoryStore` (tests and
/// local runs).
use crate::types::{Contest, ContestId, Problem, ProblemId, Submission, SubmissionId, TestCase};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("malformed record: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn get(&self, id: SubmissionId) -> StoreResult<Submission>;
    async fn save(&self, submission: &Submission) -> StoreResult<Submission>;

    /// Atomically replace the record with `next`, but only while the stored
    /// status and claim stamp still equal those of `current`.
    ///
    /// Returns `false` without writing when another writer got there first,
    /// `NotFound` when the record is gone.
    async fn save_if_unchanged(&self, current: &Submission, next: &Submission) -> StoreResult<bool>;
}

#[async_trait]
pub trait ProblemStore: Send + Sync {
    async fn get(&self, id: ProblemId) -> StoreResult<Problem>;
}

#[async_trait]
pub trait ContestStore: Send + Sync {
    async fn get(&self, id: ContestId) -> StoreResult<Contest>;
}

#[async_trait]
pub trait TestCaseStore: Send + Sync {
    /// Test cases in the order they were stored
    async fn list_by_problem(&self, problem_id: ProblemId) -> StoreResult<Vec<TestCase>>;
}

/// Hand-off point between submission intake and the judge
#[async_trait]
pub trait SubmissionQueue: Send + Sync {
    async fn enqueue(&self, id: SubmissionId) -> StoreResult<()>;
}

#[derive(Default)]
struct MemoryTables {
    submissions: HashMap<SubmissionId, Submission>,
    contests: HashMap<ContestId, Contest>,
    problems: HashMap<ProblemId, Problem>,
    test_cases: HashMap<ProblemId, Vec<TestCase>>,
    queued: Vec<SubmissionId>,
}

/// In-process store backed by hash maps
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, MemoryTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a problem together with its test cases (replacing any previous ones)
    pub fn insert_problem(&self, problem: Problem, test_cases: Vec<TestCase>) {
        let mut tables = self.tables();
        tables.test_cases.insert(problem.id, test_cases);
        tables.problems.insert(problem.id, problem);
    }

    pub fn insert_contest(&self, contest: Contest) {
        self.tables().contests.insert(contest.id, contest);
    }

    pub fn insert_submission(&self, submission: Submission) {
        self.tables().submissions.insert(submission.id, submission);
    }

    /// Ids handed to `enqueue`, oldest first
    pub fn queued(&self) -> Vec<SubmissionId> {
        self.tables().queued.clone()
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn get(&self, id: SubmissionId) -> StoreResult<Submission> {
        self.tables()
            .submissions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("submission", id))
    }

    async fn save(&self, submission: &Submission) -> StoreResult<Submission> {
        self.tables()
            .submissions
            .insert(submission.id, submission.clone());
        Ok(submission.clone())
    }

    async fn save_if_unchanged(&self, current: &Submission, next: &Submission) -> StoreResult<bool> {
        let mut tables = self.tables();
        let stored = tables
            .submissions
            .get_mut(&current.id)
            .ok_or_else(|| StoreError::not_found("submission", current.id))?;
        if stored.status != current.status || stored.claimed_at != current.claimed_at {
            return Ok(false);
        }
        *stored = next.clone();
        Ok(true)
    }
}

#[async_trait]
impl ProblemStore for MemoryStore {
    async fn get(&self, id: ProblemId) -> StoreResult<Problem> {
        self.tables()
            .problems
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("problem", id))
    }
}

#[async_trait]
impl ContestStore for MemoryStore {
    async fn get(&self, id: ContestId) -> StoreResult<Contest> {
        self.tables()
            .contests
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("contest", id))
    }
}

#[async_trait]
impl TestCaseStore for MemoryStore {
    async fn list_by_problem(&self, problem_id: ProblemId) -> StoreResult<Vec<TestCase>> {
        Ok(self
            .tables()
            .test_cases
            .get(&problem_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl SubmissionQueue for MemoryStore {
    async fn enqueue(&self, id: SubmissionId) -> StoreResult<()> {
        self.tables().queued.push(id);
        Ok(())
    }
}
