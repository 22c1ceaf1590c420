/// Sandbox Invoker - runs one program against one test case input
///
/// **Core Responsibility:**
/// Materialize the source and input into a fresh working directory, launch a
/// single sandboxed compile-and-run command, enforce the wall-clock limit and
/// report the raw outcome.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (through a `SandboxBackend`)
/// - Engine does NOT compare outputs
/// - Engine returns raw outcomes for the Evaluator to judge
///
/// **Cleanup guarantees:**
/// - The working directory is a `WorkDir`: closed explicitly after a run,
///   removed on drop on every other path
/// - Program output is read back only up to `MAX_OUTPUT_BYTES`
/// - On timeout the sandbox is killed before the call returns
/// - The sandbox instance is destroyed after every invocation
use crate::config::{
    LanguageConfig, LanguageConfigManager, COMPILE_MARKER, INPUT_FILE, MAX_OUTPUT_BYTES, OUTPUT_FILE,
};
use crate::error::{JudgeError, JudgeResult};
use anyhow::Context;
use async_trait::async_trait;
use judge_common::{Language, SubmissionId, TestCaseId};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

/// Safety limits to prevent pathological inputs from reaching the sandbox
const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
const MAX_TEST_INPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Compiler diagnostics kept for the submission record
const MAX_DIAGNOSTIC_BYTES: usize = 4096;

/// Everything a backend needs to start one sandbox instance
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    /// Shell command, run with the working directory as cwd
    pub command: String,
    /// Host directory mounted read/write as the sandbox's working directory
    pub workdir: PathBuf,
    pub memory_limit_mb: u32,
    pub cpu_limit: f64,
    pub pids_limit: i64,
}

/// How a sandboxed process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub exit_code: i64,
    pub oom_killed: bool,
    pub stderr: String,
}

/// Isolation backend: knows how to start a sandbox instance
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<Box<dyn SandboxProcess>>;
}

/// A running sandbox instance
#[async_trait]
pub trait SandboxProcess: Send {
    /// Wait for the sandboxed command to exit
    async fn wait(&mut self) -> anyhow::Result<ProcessExit>;

    /// Forcibly terminate everything running in the sandbox
    async fn kill(&mut self) -> anyhow::Result<()>;

    /// Tear the sandbox instance down; it is never reused
    async fn destroy(&mut self) -> anyhow::Result<()>;
}

/// Raw result of one sandboxed run, before output comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawOutcome {
    Finished { stdout: String, elapsed: Duration },
    TimedOut { elapsed: Duration },
    Crashed { exit_code: i64, stderr: String, elapsed: Duration },
    CompileFailed { stderr: String },
    MemoryExceeded { elapsed: Duration },
    OutputLimitExceeded { elapsed: Duration },
}

impl RawOutcome {
    /// Wall time of the run; compile failures never reached the program
    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            RawOutcome::Finished { elapsed, .. }
            | RawOutcome::TimedOut { elapsed }
            | RawOutcome::Crashed { elapsed, .. }
            | RawOutcome::MemoryExceeded { elapsed }
            | RawOutcome::OutputLimitExceeded { elapsed } => Some(*elapsed),
            RawOutcome::CompileFailed { .. } => None,
        }
    }
}

/// Submission-scoped scratch directory, removed by `close` or when dropped
#[derive(Debug)]
pub struct WorkDir {
    dir: TempDir,
}

/// Mode of a fresh working directory; the sandbox user need not be ours
#[cfg(unix)]
const WORKDIR_MODE: u32 = 0o777;

impl WorkDir {
    pub fn create(root: &Path, submission_id: SubmissionId) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("judge_{}_", submission_id))
            .tempdir_in(root)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir.path(), fs::Permissions::from_mode(WORKDIR_MODE))?;
        }

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, name: &str, contents: &str) -> io::Result<PathBuf> {
        let path = self.dir.path().join(name);
        fs::write(&path, contents)?;
        Ok(path)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dir.path().join(name).exists()
    }

    /// Read `name` as lossy UTF-8, or `None` if it holds more than `limit` bytes
    pub fn read_capped(&self, name: &str, limit: u64) -> io::Result<Option<String>> {
        let file = fs::File::open(self.dir.path().join(name))?;
        let mut bytes = Vec::new();
        file.take(limit + 1).read_to_end(&mut bytes)?;
        if bytes.len() as u64 > limit {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Whether `name` exists and is larger than `limit` bytes
    pub fn exceeds(&self, name: &str, limit: u64) -> bool {
        fs::metadata(self.dir.path().join(name)).map_or(false, |meta| meta.len() > limit)
    }

    /// Remove the directory now, logging a failed removal
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(workdir = %path.display(), error = %e, "Failed to remove working directory");
        }
    }
}

/// Host-side limits applied to every sandbox instance
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub work_root: PathBuf,
    pub cpu_limit: f64,
    pub pids_limit: i64,
}

/// One program run against one test case
#[derive(Debug, Clone)]
pub struct InvocationRequest<'a> {
    pub submission_id: SubmissionId,
    pub test_case_id: TestCaseId,
    pub language: Language,
    pub source_code: &'a str,
    pub input: &'a str,
    pub time_limit: Duration,
    pub memory_limit_mb: u32,
}

pub struct SandboxInvoker {
    backend: Arc<dyn SandboxBackend>,
    languages: LanguageConfigManager,
    limits: SandboxLimits,
}

impl SandboxInvoker {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        languages: LanguageConfigManager,
        limits: SandboxLimits,
    ) -> Self {
        Self {
            backend,
            languages,
            limits,
        }
    }

    /// Map a declared language onto a configured toolchain.
    ///
    /// Fails with `UnsupportedLanguage` for anything outside the supported
    /// set or without a configuration entry.
    pub fn resolve(&self, declared: &str) -> JudgeResult<Language> {
        let language: Language = declared
            .parse()
            .map_err(|_| JudgeError::UnsupportedLanguage(declared.to_string()))?;
        if self.languages.get_config(language).is_none() {
            return Err(JudgeError::UnsupportedLanguage(declared.to_string()));
        }
        Ok(language)
    }

    #[instrument(
        skip(self, request),
        fields(
            submission_id = %request.submission_id,
            test_case = request.test_case_id,
            language = %request.language,
        )
    )]
    pub async fn execute(&self, request: &InvocationRequest<'_>) -> JudgeResult<RawOutcome> {
        let config = self
            .languages
            .get_config(request.language)
            .ok_or_else(|| JudgeError::UnsupportedLanguage(request.language.to_string()))?;

        // GUARDRAIL: reject oversized payloads before touching the filesystem
        if request.source_code.len() > MAX_SOURCE_CODE_BYTES {
            return Err(JudgeError::infrastructure(anyhow::anyhow!(
                "Source code exceeds maximum size of {} bytes",
                MAX_SOURCE_CODE_BYTES
            )));
        }
        if request.input.len() > MAX_TEST_INPUT_BYTES {
            return Err(JudgeError::infrastructure(anyhow::anyhow!(
                "Test input exceeds maximum size of {} bytes",
                MAX_TEST_INPUT_BYTES
            )));
        }

        let workdir = WorkDir::create(&self.limits.work_root, request.submission_id)?;
        workdir.write(&config.source_file, request.source_code)?;
        workdir.write(INPUT_FILE, request.input)?;

        let spec = LaunchSpec {
            name: format!(
                "judge-{}-{}-{}",
                request.submission_id,
                request.test_case_id,
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
            image: config.image.clone(),
            command: config.shell_command(),
            workdir: workdir.path().to_path_buf(),
            memory_limit_mb: request.memory_limit_mb,
            cpu_limit: self.limits.cpu_limit,
            pids_limit: self.limits.pids_limit,
        };
        debug!(sandbox = %spec.name, command = %spec.command, "Launching sandbox");

        let mut process = self
            .backend
            .launch(&spec)
            .await
            .map_err(JudgeError::Infrastructure)?;

        let started = Instant::now();
        let waited = tokio::time::timeout(request.time_limit, process.wait()).await;
        let elapsed = started.elapsed();

        let outcome = match waited {
            Err(_) => {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    time_limit_ms = request.time_limit.as_millis() as u64,
                    "Time limit exceeded - killing sandbox"
                );
                if let Err(e) = process.kill().await {
                    error!(sandbox = %spec.name, error = %e, "Failed to kill timed-out sandbox");
                }
                Ok(RawOutcome::TimedOut { elapsed })
            }
            Ok(Err(e)) => Err(JudgeError::Infrastructure(
                e.context(format!("waiting for sandbox {}", spec.name)),
            )),
            Ok(Ok(exit)) => classify_exit(config, &workdir, exit, elapsed),
        };

        if let Err(e) = process.destroy().await {
            warn!(sandbox = %spec.name, error = %e, "Failed to destroy sandbox");
        }

        workdir.close();

        if let Ok(outcome) = &outcome {
            debug!(outcome = ?outcome_kind(outcome), elapsed_ms = elapsed.as_millis() as u64, "Sandbox run finished");
        }
        outcome
    }
}

fn classify_exit(
    config: &LanguageConfig,
    workdir: &WorkDir,
    exit: ProcessExit,
    elapsed: Duration,
) -> JudgeResult<RawOutcome> {
    if exit.oom_killed {
        return Ok(RawOutcome::MemoryExceeded { elapsed });
    }

    if exit.exit_code != 0 {
        if config.is_compiled() && !workdir.contains(COMPILE_MARKER) {
            return Ok(RawOutcome::CompileFailed {
                stderr: truncate(&exit.stderr, MAX_DIAGNOSTIC_BYTES),
            });
        }
        // SIGXFSZ from the file size cap
        if workdir.exceeds(OUTPUT_FILE, MAX_OUTPUT_BYTES) {
            return Ok(RawOutcome::OutputLimitExceeded { elapsed });
        }
        return Ok(RawOutcome::Crashed {
            exit_code: exit.exit_code,
            stderr: truncate(&exit.stderr, MAX_DIAGNOSTIC_BYTES),
            elapsed,
        });
    }

    let stdout = workdir
        .read_capped(OUTPUT_FILE, MAX_OUTPUT_BYTES)
        .context("reading program output")
        .map_err(JudgeError::Infrastructure)?;
    match stdout {
        Some(stdout) => Ok(RawOutcome::Finished { stdout, elapsed }),
        None => Ok(RawOutcome::OutputLimitExceeded { elapsed }),
    }
}

fn outcome_kind(outcome: &RawOutcome) -> &'static str {
    match outcome {
        RawOutcome::Finished { .. } => "finished",
        RawOutcome::TimedOut { .. } => "timed_out",
        RawOutcome::Crashed { .. } => "crashed",
        RawOutcome::CompileFailed { .. } => "compile_failed",
        RawOutcome::MemoryExceeded { .. } => "memory_exceeded",
        RawOutcome::OutputLimitExceeded { .. } => "output_limit_exceeded",
    }
}

/// Cut `text` to at most `max` bytes on a char boundary
fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[truncated]", &text[..end])
}
