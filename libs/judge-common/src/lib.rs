pub mod config;
pub mod redis;
pub mod store;
pub mod types;

pub use store::{
    ContestStore, MemoryStore, ProblemStore, StoreError, StoreResult, SubmissionQueue, SubmissionStore,
    TestCaseStore,
};
pub use types::{
    Contest, ContestId, Language, Problem, ProblemId, Submission, SubmissionId, SubmissionStatus,
    TestCase, TestCaseId, UnknownLanguage,
};
