// Dispatch layer: bounded queue + fixed worker pool, single-flight per submission id

use crate::error::JudgeError;
use crate::executor::JudgePipeline;
use judge_common::SubmissionId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// What happened to a dispatch request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchReceipt {
    Queued,
    /// Already queued or being judged; this request was dropped
    AlreadyInFlight,
}

#[derive(Debug, thiserror::Error)]
#[error("dispatcher is shut down")]
pub struct DispatchClosed;

#[derive(Default)]
struct InFlight {
    ids: Mutex<HashSet<SubmissionId>>,
}

impl InFlight {
    fn ids(&self) -> MutexGuard<'_, HashSet<SubmissionId>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases a submission id from the in-flight set when judging ends
struct InFlightGuard {
    in_flight: Arc<InFlight>,
    id: SubmissionId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.ids().remove(&self.id);
    }
}

/// Handle used by intake to hand submissions to the judge
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<SubmissionId>,
    in_flight: Arc<InFlight>,
}

/// The judging workers behind a `Dispatcher`
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Start `workers` judging tasks fed by a queue of `capacity` ids
    pub fn spawn(pipeline: Arc<JudgePipeline>, workers: usize, capacity: usize) -> (Dispatcher, WorkerPool) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let in_flight = Arc::new(InFlight::default());

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let pipeline = pipeline.clone();
                let in_flight = in_flight.clone();
                tokio::spawn(
                    worker_loop(rx, pipeline, in_flight)
                        .instrument(tracing::info_span!("judge_worker", worker)),
                )
            })
            .collect();

        info!(workers, capacity, "Judge worker pool started");
        (Dispatcher { tx, in_flight }, WorkerPool { handles })
    }

    /// Queue a submission for judging.
    ///
    /// Returns as soon as the id is queued; waits only while the queue is
    /// full. Results are observed through the submission store.
    ///
    /// Cancel-safe: a queue slot is reserved before the id is marked in
    /// flight, so dropping the future while it waits leaves no trace.
    pub async fn dispatch(&self, id: SubmissionId) -> Result<DispatchReceipt, DispatchClosed> {
        let permit = self.tx.reserve().await.map_err(|_| DispatchClosed)?;

        if !self.in_flight.ids().insert(id) {
            debug!(submission_id = %id, "Duplicate dispatch ignored");
            return Ok(DispatchReceipt::AlreadyInFlight);
        }
        permit.send(id);

        debug!(submission_id = %id, "Submission queued");
        Ok(DispatchReceipt::Queued)
    }

    pub fn is_in_flight(&self, id: SubmissionId) -> bool {
        self.in_flight.ids().contains(&id)
    }
}

impl WorkerPool {
    /// Wait for the workers to drain the queue and exit.
    /// Workers stop once every `Dispatcher` clone has been dropped.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Judge worker terminated abnormally");
            }
        }
    }
}

async fn worker_loop(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<SubmissionId>>>,
    pipeline: Arc<JudgePipeline>,
    in_flight: Arc<InFlight>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(id) = next else {
            break;
        };
        let _guard = InFlightGuard {
            in_flight: in_flight.clone(),
            id,
        };
        judge_isolated(&pipeline, id).await;
    }
    debug!("Judge worker exiting");
}

/// Judge one submission; whatever goes wrong after the claim ends in a terminal status
async fn judge_isolated(pipeline: &Arc<JudgePipeline>, id: SubmissionId) {
    let claimed = match pipeline.claim(id).await {
        Ok(Some(claimed)) => claimed,
        Ok(None) => return,
        Err(JudgeError::NotFound(missing)) => {
            warn!(submission_id = %missing, "Submission vanished; nothing to mark");
            return;
        }
        Err(e) => {
            error!(submission_id = %id, error = %e, "Failed to claim submission");
            return;
        }
    };

    let task = {
        let pipeline = pipeline.clone();
        let claimed = claimed.clone();
        tokio::spawn(async move { pipeline.judge_claimed(claimed).await })
    };

    let failure = match task.await {
        Ok(Ok(())) => return,
        Ok(Err(JudgeError::NotFound(missing))) => {
            warn!(submission_id = %missing, "Submission vanished; nothing to mark");
            return;
        }
        Ok(Err(JudgeError::ClaimLost(lost))) => {
            warn!(submission_id = %lost, "Claim taken over by another judge; dropping result");
            return;
        }
        Ok(Err(e)) => format!("Judge error: {}", e),
        Err(join_error) if join_error.is_panic() => "Judge error: judging panicked".to_string(),
        Err(join_error) => format!("Judge error: {}", join_error),
    };

    error!(submission_id = %id, error = %failure, "Judging aborted");
    if let Err(e) = pipeline.fail(&claimed, failure).await {
        error!(submission_id = %id, error = %e, "Failed to record judge failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanguageConfigManager;
    use crate::engine::{SandboxInvoker, SandboxLimits};
    use crate::runner::TestRunner;
    use crate::state::SubmissionStateMachine;
    use crate::testing::{Behavior, ScriptedBackend};
    use judge_common::{MemoryStore, Problem, Submission, SubmissionStatus, SubmissionStore, TestCase};
    use std::path::Path;
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        backend: Arc<ScriptedBackend>,
        dispatcher: Dispatcher,
        pool: WorkerPool,
        _root: tempfile::TempDir,
    }

    impl Harness {
        fn new(backend: ScriptedBackend, workers: usize) -> Self {
            Self::with_capacity(backend, workers, 8)
        }

        fn with_capacity(backend: ScriptedBackend, workers: usize, capacity: usize) -> Self {
            let root = tempfile::tempdir().unwrap();
            let store = Arc::new(MemoryStore::new());
            store.insert_problem(
                Problem {
                    id: 1,
                    title: "Hello World".to_string(),
                    time_limit_seconds: 2,
                    memory_limit_mb: 128,
                },
                vec![TestCase {
                    id: 1,
                    problem_id: 1,
                    input: String::new(),
                    expected_output: "Hello World".to_string(),
                    hidden: false,
                }],
            );
            store.insert_problem(
                Problem {
                    id: 2,
                    title: "Sum of Two Numbers".to_string(),
                    time_limit_seconds: 2,
                    memory_limit_mb: 128,
                },
                vec![
                    TestCase {
                        id: 2,
                        problem_id: 2,
                        input: "5 3".to_string(),
                        expected_output: "8".to_string(),
                        hidden: false,
                    },
                    TestCase {
                        id: 3,
                        problem_id: 2,
                        input: "10 20".to_string(),
                        expected_output: "30".to_string(),
                        hidden: false,
                    },
                ],
            );

            let backend = Arc::new(backend);
            let pipeline = Arc::new(pipeline(store.clone(), backend.clone(), root.path()));
            let (dispatcher, pool) = Dispatcher::spawn(pipeline, workers, capacity);
            Self {
                store,
                backend,
                dispatcher,
                pool,
                _root: root,
            }
        }

        fn submit(&self, language: &str, problem_id: u64) -> SubmissionId {
            let submission = Submission::new("source", language, problem_id, 1, "tester");
            let id = submission.id;
            self.store.insert_submission(submission);
            id
        }

        /// Drain the queue and stop the workers
        async fn finish(self) -> (Arc<MemoryStore>, Arc<ScriptedBackend>) {
            drop(self.dispatcher);
            self.pool.join().await;
            (self.store, self.backend)
        }
    }

    fn pipeline(store: Arc<MemoryStore>, backend: Arc<ScriptedBackend>, root: &Path) -> JudgePipeline {
        let invoker = SandboxInvoker::new(
            backend,
            LanguageConfigManager::builtin(),
            SandboxLimits {
                work_root: root.to_path_buf(),
                cpu_limit: 1.0,
                pids_limit: 64,
            },
        );
        JudgePipeline::new(
            SubmissionStateMachine::new(store.clone()),
            store.clone(),
            store,
            TestRunner::new(Arc::new(invoker)),
        )
    }

    async fn stored(store: &MemoryStore, id: SubmissionId) -> Submission {
        SubmissionStore::get(store, id).await.unwrap()
    }

    fn add(input: &str) -> String {
        let total: i64 = input
            .split_whitespace()
            .map(|n| n.parse::<i64>().unwrap())
            .sum();
        total.to_string()
    }

    #[tokio::test]
    async fn test_dispatch_reaches_accepted() {
        let harness = Harness::new(ScriptedBackend::repeating(Behavior::stdout("Hello World\n")), 2);
        let id = harness.submit("python", 1);

        let receipt = harness.dispatcher.dispatch(id).await.unwrap();
        assert_eq!(receipt, DispatchReceipt::Queued);

        let (store, _) = harness.finish().await;
        let submission = stored(&store, id).await;
        assert_eq!(submission.status, SubmissionStatus::Accepted);
        assert_eq!(submission.result.as_deref(), Some("Accepted"));
    }

    #[tokio::test]
    async fn test_many_submissions_all_terminal() {
        let harness = Harness::new(ScriptedBackend::repeating(Behavior::Compute(add)), 3);
        let correct: Vec<_> = (0..5).map(|_| harness.submit("python", 2)).collect();
        let unsupported = harness.submit("cobol", 2);
        let missing_problem = harness.submit("python", 99);

        for id in correct.iter().chain([&unsupported, &missing_problem]) {
            harness.dispatcher.dispatch(*id).await.unwrap();
        }

        let (store, _) = harness.finish().await;
        for id in &correct {
            assert_eq!(stored(&store, *id).await.status, SubmissionStatus::Accepted);
        }

        let unsupported = stored(&store, unsupported).await;
        assert_eq!(unsupported.status, SubmissionStatus::RuntimeError);
        assert_eq!(unsupported.result.as_deref(), Some("Unsupported language: cobol"));

        let missing_problem = stored(&store, missing_problem).await;
        assert_eq!(missing_problem.status, SubmissionStatus::RuntimeError);
        assert!(missing_problem.result.unwrap().starts_with("Judge error:"));
    }

    #[tokio::test]
    async fn test_wrong_answer_skips_second_case() {
        let harness = Harness::new(ScriptedBackend::repeating(Behavior::stdout("0")), 1);
        let id = harness.submit("python", 2);

        harness.dispatcher.dispatch(id).await.unwrap();

        let (store, backend) = harness.finish().await;
        assert_eq!(stored(&store, id).await.status, SubmissionStatus::WrongAnswer);
        assert_eq!(backend.launches().len(), 1);
    }

    #[tokio::test]
    async fn test_infrastructure_failure_becomes_runtime_error() {
        let harness = Harness::new(
            ScriptedBackend::repeating(Behavior::LaunchError("isolation backend unavailable")),
            1,
        );
        let id = harness.submit("python", 1);

        harness.dispatcher.dispatch(id).await.unwrap();

        let (store, _) = harness.finish().await;
        let submission = stored(&store, id).await;
        assert_eq!(submission.status, SubmissionStatus::RuntimeError);
        assert!(submission.result.unwrap().starts_with("Execution error:"));
        assert!(submission
            .error_message
            .unwrap()
            .contains("isolation backend unavailable"));
    }

    #[tokio::test]
    async fn test_panic_in_pipeline_becomes_runtime_error() {
        let harness = Harness::new(ScriptedBackend::repeating(Behavior::Panic), 1);
        let id = harness.submit("python", 1);

        harness.dispatcher.dispatch(id).await.unwrap();

        let (store, _) = harness.finish().await;
        let submission = stored(&store, id).await;
        assert_eq!(submission.status, SubmissionStatus::RuntimeError);
        assert_eq!(submission.result.as_deref(), Some("Judge error: judging panicked"));
    }

    #[tokio::test]
    async fn test_unknown_submission_is_dropped_quietly() {
        let harness = Harness::new(ScriptedBackend::new(vec![]), 1);
        let ghost = uuid::Uuid::new_v4();

        harness.dispatcher.dispatch(ghost).await.unwrap();

        let (store, backend) = harness.finish().await;
        assert!(SubmissionStore::get(store.as_ref(), ghost).await.is_err());
        assert!(backend.launches().is_empty());
    }

    #[tokio::test]
    async fn test_redispatch_after_terminal_keeps_result() {
        let harness = Harness::new(
            ScriptedBackend::new(vec![Behavior::stdout("0"), Behavior::stdout("Hello World")]),
            1,
        );
        let id = harness.submit("python", 1);
        harness.dispatcher.dispatch(id).await.unwrap();
        let (store, backend) = harness.finish().await;
        let first = stored(&store, id).await;
        assert_eq!(first.status, SubmissionStatus::WrongAnswer);

        // Second pipeline over the same store and backend
        let root = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(pipeline(store.clone(), backend.clone(), root.path()));
        let (dispatcher, pool) = Dispatcher::spawn(pipeline, 1, 8);
        assert_eq!(dispatcher.dispatch(id).await.unwrap(), DispatchReceipt::Queued);
        drop(dispatcher);
        pool.join().await;

        let second = stored(&store, id).await;
        assert_eq!(second, first);
        assert_eq!(backend.launches().len(), 1, "terminal submission must not be re-run");
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_dispatch_while_in_flight_is_deduplicated() {
        let harness = Harness::new(ScriptedBackend::repeating(Behavior::Hang), 1);
        let id = harness.submit("python", 1);

        assert_eq!(harness.dispatcher.dispatch(id).await.unwrap(), DispatchReceipt::Queued);
        assert!(harness.dispatcher.is_in_flight(id));
        assert_eq!(
            harness.dispatcher.dispatch(id).await.unwrap(),
            DispatchReceipt::AlreadyInFlight
        );

        let in_flight = harness.dispatcher.in_flight.clone();
        let (store, backend) = harness.finish().await;
        assert_eq!(stored(&store, id).await.status, SubmissionStatus::TimeLimitExceeded);
        assert_eq!(backend.launches().len(), 1);
        assert_eq!(backend.running(), 0);
        assert!(!in_flight.ids().contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_dispatch_leaves_no_trace() {
        let harness = Harness::with_capacity(ScriptedBackend::repeating(Behavior::Hang), 1, 1);
        let (a, b, c) = (
            harness.submit("python", 1),
            harness.submit("python", 1),
            harness.submit("python", 1),
        );

        // One id judging, one waiting in the single queue slot
        harness.dispatcher.dispatch(a).await.unwrap();
        harness.dispatcher.dispatch(b).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(10), harness.dispatcher.dispatch(c)).await;
        assert!(blocked.is_err(), "queue is full, dispatch must still be waiting");
        assert!(!harness.dispatcher.is_in_flight(c));

        assert_eq!(harness.dispatcher.dispatch(c).await.unwrap(), DispatchReceipt::Queued);

        let (store, backend) = harness.finish().await;
        for id in [a, b, c] {
            assert_eq!(stored(&store, id).await.status, SubmissionStatus::TimeLimitExceeded);
        }
        assert_eq!(backend.launches().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_worker_processes_judge_once() {
        let harness = Harness::new(ScriptedBackend::repeating(Behavior::Hang), 1);
        let id = harness.submit("python", 1);

        // A second pool over the same store stands in for another worker process
        let root = tempfile::tempdir().unwrap();
        let other = Arc::new(pipeline(harness.store.clone(), harness.backend.clone(), root.path()));
        let (other_dispatcher, other_pool) = Dispatcher::spawn(other, 1, 8);

        harness.dispatcher.dispatch(id).await.unwrap();
        other_dispatcher.dispatch(id).await.unwrap();

        drop(other_dispatcher);
        other_pool.join().await;
        let (store, backend) = harness.finish().await;

        assert_eq!(stored(&store, id).await.status, SubmissionStatus::TimeLimitExceeded);
        assert_eq!(backend.launches().len(), 1, "one submission, one judge");
        assert_eq!(backend.running(), 0);
    }
}
