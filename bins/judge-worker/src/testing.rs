// Scripted sandbox backend for unit tests
use crate::config::{COMPILE_MARKER, INPUT_FILE, OUTPUT_FILE};
use crate::engine::{LaunchSpec, ProcessExit, SandboxBackend, SandboxProcess};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// What the "program" does when a sandbox is launched
#[derive(Clone)]
pub enum Behavior {
    Exit {
        code: i64,
        stdout: String,
        stderr: String,
        compiled: bool,
    },
    /// Reads the test input and prints the returned text
    Compute(fn(&str) -> String),
    Hang,
    OutOfMemory,
    LaunchError(&'static str),
    Panic,
}

impl Behavior {
    pub fn stdout(text: &str) -> Self {
        Behavior::Exit {
            code: 0,
            stdout: text.to_string(),
            stderr: String::new(),
            compiled: true,
        }
    }

    pub fn exit(code: i64, stderr: &str) -> Self {
        Behavior::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
            compiled: true,
        }
    }

    pub fn compile_error(stderr: &str) -> Self {
        Behavior::Exit {
            code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
            compiled: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Launch {
    pub spec: LaunchSpec,
    /// Working directory listing at launch time, sorted
    pub files: Vec<String>,
    pub input: String,
}

#[derive(Default)]
struct Counters {
    kills: AtomicUsize,
    destroyed: AtomicUsize,
    running: AtomicUsize,
}

pub struct ScriptedBackend {
    script: Mutex<VecDeque<Behavior>>,
    repeat: Option<Behavior>,
    launches: Mutex<Vec<Launch>>,
    counters: Arc<Counters>,
}

impl ScriptedBackend {
    /// Plays `script` in order, one behavior per launch
    pub fn new(script: Vec<Behavior>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat: None,
            launches: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Same behavior for every launch
    pub fn repeating(behavior: Behavior) -> Self {
        Self {
            repeat: Some(behavior),
            ..Self::new(Vec::new())
        }
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().unwrap().clone()
    }

    pub fn kills(&self) -> usize {
        self.counters.kills.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.counters.destroyed.load(Ordering::SeqCst)
    }

    /// Sandboxes launched but not yet destroyed
    pub fn running(&self) -> usize {
        self.counters.running.load(Ordering::SeqCst)
    }

    fn next_behavior(&self) -> Option<Behavior> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.repeat.clone())
    }
}

#[async_trait]
impl SandboxBackend for ScriptedBackend {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<Box<dyn SandboxProcess>> {
        let mut files: Vec<String> = fs::read_dir(&spec.workdir)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<Result<_, _>>()?;
        files.sort();
        let input = fs::read_to_string(spec.workdir.join(INPUT_FILE))?;
        self.launches.lock().unwrap().push(Launch {
            spec: spec.clone(),
            files,
            input: input.clone(),
        });

        let behavior = self
            .next_behavior()
            .ok_or_else(|| anyhow::anyhow!("scripted backend exhausted"))?;

        let exit = match behavior {
            Behavior::LaunchError(message) => anyhow::bail!("{}", message),
            Behavior::Panic => panic!("sandbox backend panicked"),
            Behavior::Hang => None,
            Behavior::OutOfMemory => Some(ProcessExit {
                exit_code: 137,
                oom_killed: true,
                stderr: String::new(),
            }),
            Behavior::Compute(program) => {
                fs::write(spec.workdir.join(COMPILE_MARKER), "")?;
                fs::write(spec.workdir.join(OUTPUT_FILE), program(&input))?;
                Some(ProcessExit {
                    exit_code: 0,
                    oom_killed: false,
                    stderr: String::new(),
                })
            }
            Behavior::Exit {
                code,
                stdout,
                stderr,
                compiled,
            } => {
                if compiled {
                    fs::write(spec.workdir.join(COMPILE_MARKER), "")?;
                    fs::write(spec.workdir.join(OUTPUT_FILE), stdout)?;
                }
                Some(ProcessExit {
                    exit_code: code,
                    oom_killed: false,
                    stderr,
                })
            }
        };

        self.counters.running.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedProcess {
            exit,
            alive: true,
            counters: self.counters.clone(),
        }))
    }
}

struct ScriptedProcess {
    exit: Option<ProcessExit>,
    alive: bool,
    counters: Arc<Counters>,
}

#[async_trait]
impl SandboxProcess for ScriptedProcess {
    async fn wait(&mut self) -> anyhow::Result<ProcessExit> {
        match &self.exit {
            Some(exit) => Ok(exit.clone()),
            None => std::future::pending().await,
        }
    }

    async fn kill(&mut self) -> anyhow::Result<()> {
        self.counters.kills.fetch_add(1, Ordering::SeqCst);
        self.exit = Some(ProcessExit {
            exit_code: 137,
            oom_killed: false,
            stderr: String::new(),
        });
        Ok(())
    }

    async fn destroy(&mut self) -> anyhow::Result<()> {
        if self.alive {
            self.alive = false;
            self.counters.running.fetch_sub(1, Ordering::SeqCst);
        }
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
