use crate::store::{
    ContestStore, ProblemStore, StoreError, StoreResult, SubmissionQueue, SubmissionStore, TestCaseStore,
};
use crate::types::{Contest, ContestId, Problem, ProblemId, Submission, SubmissionId, TestCase};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;

// Redis key layout shared by the intake API and the worker

pub const QUEUE_KEY: &str = "judge:queue";
pub const SUBMISSION_PREFIX: &str = "judge:submission";
pub const CONTEST_PREFIX: &str = "judge:contest";
pub const PROBLEM_PREFIX: &str = "judge:problem";
pub const TEST_CASES_PREFIX: &str = "judge:testcases";

pub fn submission_key(id: &SubmissionId) -> String {
    format!("{}:{}", SUBMISSION_PREFIX, id)
}

pub fn contest_key(id: ContestId) -> String {
    format!("{}:{}", CONTEST_PREFIX, id)
}

pub fn problem_key(id: ProblemId) -> String {
    format!("{}:{}", PROBLEM_PREFIX, id)
}

/// List of JSON-encoded test cases, in insertion order
pub fn test_cases_key(problem_id: ProblemId) -> String {
    format!("{}:{}", TEST_CASES_PREFIX, problem_id)
}

/// Compare-and-set on a submission record.
///
/// KEYS[1] = submission key, ARGV[1] = expected status, ARGV[2] = expected
/// claim stamp ("" for none), ARGV[3] = replacement JSON.
/// Returns -1 when the key is missing, 0 on mismatch, 1 after writing.
const SAVE_IF_UNCHANGED_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return -1
end
local record = cjson.decode(raw)
local claimed = record.claimed_at
if claimed == nil or claimed == cjson.null then
    claimed = ''
end
if record.status ~= ARGV[1] or claimed ~= ARGV[2] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#;

/// Render a serialized scalar the way `cjson` hands it to the script
fn script_arg(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Push a submission id onto the dispatch queue
/// Uses RPUSH for FIFO semantics
pub async fn push_submission(conn: &mut ConnectionManager, id: &SubmissionId) -> StoreResult<()> {
    let _: () = conn.rpush(QUEUE_KEY, id.to_string()).await?;
    Ok(())
}

/// Pop the next submission id from the dispatch queue
/// Uses BLPOP with timeout so the caller can notice shutdown
pub async fn pop_submission(
    conn: &mut ConnectionManager,
    timeout_seconds: f64,
) -> StoreResult<Option<SubmissionId>> {
    let popped: Option<(String, String)> = conn.blpop(QUEUE_KEY, timeout_seconds).await?;

    match popped {
        Some((_key, payload)) => {
            let id = payload
                .parse::<SubmissionId>()
                .map_err(|e| StoreError::Malformed(format!("queue entry {:?}: {}", payload, e)))?;
            Ok(Some(id))
        }
        None => Ok(None),
    }
}

/// Store adapter over a Redis connection manager
///
/// Records are JSON strings; each call clones the (cheap) manager handle.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub async fn put_contest(&self, contest: &Contest) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(contest_key(contest.id), serde_json::to_string(contest)?)
            .await?;
        Ok(())
    }

    /// Write a problem and replace its test case list
    pub async fn put_problem(&self, problem: &Problem, test_cases: &[TestCase]) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let list_key = test_cases_key(problem.id);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(problem_key(problem.id), serde_json::to_string(problem)?)
            .ignore()
            .del(&list_key)
            .ignore();
        for test_case in test_cases {
            pipe.rpush(&list_key, serde_json::to_string(test_case)?).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for RedisStore {
    async fn get(&self, id: SubmissionId) -> StoreResult<Submission> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(submission_key(&id)).await?;
        match payload {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Err(StoreError::not_found("submission", id)),
        }
    }

    async fn save(&self, submission: &Submission) -> StoreResult<Submission> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(submission)?;
        let _: () = conn.set(submission_key(&submission.id), payload).await?;
        Ok(submission.clone())
    }

    async fn save_if_unchanged(&self, current: &Submission, next: &Submission) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let written: i64 = redis::Script::new(SAVE_IF_UNCHANGED_SCRIPT)
            .key(submission_key(&current.id))
            .arg(script_arg(serde_json::to_value(current.status)?))
            .arg(script_arg(serde_json::to_value(current.claimed_at)?))
            .arg(serde_json::to_string(next)?)
            .invoke_async(&mut conn)
            .await?;
        match written {
            -1 => Err(StoreError::not_found("submission", current.id)),
            0 => Ok(false),
            _ => Ok(true),
        }
    }
}

#[async_trait]
impl ProblemStore for RedisStore {
    async fn get(&self, id: ProblemId) -> StoreResult<Problem> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(problem_key(id)).await?;
        match payload {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Err(StoreError::not_found("problem", id)),
        }
    }
}

#[async_trait]
impl ContestStore for RedisStore {
    async fn get(&self, id: ContestId) -> StoreResult<Contest> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(contest_key(id)).await?;
        match payload {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Err(StoreError::not_found("contest", id)),
        }
    }
}

#[async_trait]
impl TestCaseStore for RedisStore {
    async fn list_by_problem(&self, problem_id: ProblemId) -> StoreResult<Vec<TestCase>> {
        let mut conn = self.conn.clone();
        let payloads: Vec<String> = conn.lrange(test_cases_key(problem_id), 0, -1).await?;
        payloads
            .iter()
            .map(|data| serde_json::from_str(data).map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl SubmissionQueue for RedisStore {
    async fn enqueue(&self, id: SubmissionId) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        push_submission(&mut conn, &id).await
    }
}
