// Worker configuration: language toolchains and runtime settings
use crate::state::DEFAULT_CLAIM_LEASE;
use anyhow::{bail, Context, Result};
use judge_common::config::CommonConfig;
use judge_common::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Marker the compile step leaves behind once it succeeded.
/// A nonzero exit without it means the program never got to run.
pub const COMPILE_MARKER: &str = ".compiled";
pub const INPUT_FILE: &str = "input.txt";
pub const OUTPUT_FILE: &str = "output.txt";

/// Largest program output the judge reads back
pub const MAX_OUTPUT_BYTES: u64 = 8 * 1024 * 1024;

/// `ulimit -f` for the run step. Shells disagree on 512 or 1024 byte blocks,
/// so the cap is sized in 512 byte blocks and always lands above MAX_OUTPUT_BYTES.
const OUTPUT_FILE_BLOCKS: u64 = MAX_OUTPUT_BYTES / 512 + 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub image: String,
    /// Canonical file name the source is written to
    pub source_file: String,
    /// Build step; `None` for interpreted languages
    #[serde(default)]
    pub compile: Option<String>,
    pub run: String,
}

impl LanguageConfig {
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// Single shell command run inside the sandbox's working directory.
    ///
    /// Compiled languages: `<compile> && touch .compiled && (<capped run>)`
    /// Interpreted languages: `(<capped run>)`, where the run step is
    /// `ulimit -f <blocks> && <run> < input > output`
    pub fn shell_command(&self) -> String {
        let run = format!(
            "(ulimit -f {} && {} < {} > {})",
            OUTPUT_FILE_BLOCKS, self.run, INPUT_FILE, OUTPUT_FILE
        );
        match &self.compile {
            Some(compile) => format!("{} && touch {} && {}", compile, COMPILE_MARKER, run),
            None => run,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

fn builtin_config(language: Language) -> LanguageConfig {
    match language {
        Language::Cpp => LanguageConfig {
            name: "cpp".to_string(),
            image: "gcc:13".to_string(),
            source_file: "solution.cpp".to_string(),
            compile: Some("g++ -O2 -o main solution.cpp".to_string()),
            run: "./main".to_string(),
        },
        Language::Java => LanguageConfig {
            name: "java".to_string(),
            image: "eclipse-temurin:17-jdk".to_string(),
            source_file: "Solution.java".to_string(),
            compile: Some("javac Solution.java".to_string()),
            run: "java -cp . Solution".to_string(),
        },
        Language::Python => LanguageConfig {
            name: "python".to_string(),
            image: "python:3.12-slim".to_string(),
            source_file: "solution.py".to_string(),
            compile: None,
            run: "python3 solution.py".to_string(),
        },
    }
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from a languages.json file
    ///
    /// Every entry must name a language of the supported set; the file may
    /// cover only a subset of it.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let languages_json: LanguagesJson = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let mut configs = HashMap::new();
        for lang in languages_json.languages {
            let language: Language = lang
                .name
                .parse()
                .with_context(|| format!("Unknown language '{}' in languages.json", lang.name))?;
            configs.insert(language, lang);
        }

        if configs.is_empty() {
            bail!("No languages configured in {}", config_path.display());
        }

        Ok(Self { configs })
    }

    /// Built-in toolchains for the whole supported set
    pub fn builtin() -> Self {
        Self {
            configs: Language::ALL
                .into_iter()
                .map(|language| (language, builtin_config(language)))
                .collect(),
        }
    }

    /// Load from `path` if it exists, otherwise fall back to the built-in table
    pub fn load_or_builtin(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::builtin())
        }
    }

    pub fn get_config(&self, language: Language) -> Option<&LanguageConfig> {
        self.configs.get(&language)
    }

    /// List all configured languages
    pub fn list_languages(&self) -> Vec<Language> {
        let mut languages: Vec<_> = self.configs.keys().copied().collect();
        languages.sort_by_key(|l| l.name());
        languages
    }
}

/// Runtime settings of the worker process
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub common: CommonConfig,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Parent directory of the per-invocation working directories.
    /// Must be a path the Docker daemon can bind-mount.
    pub work_root: PathBuf,
    /// CPU share of one sandbox, in cores
    pub cpu_limit: f64,
    pub pids_limit: i64,
    pub languages_config: PathBuf,
    /// Age after which a RUNNING claim counts as abandoned.
    /// Must exceed the longest judging run of any problem.
    pub claim_lease: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);

        let config = Self {
            common: CommonConfig::from_env(),
            workers: env_or("JUDGE_WORKERS", default_workers)?,
            queue_capacity: env_or("JUDGE_QUEUE_CAPACITY", 64)?,
            work_root: std::env::var("JUDGE_WORK_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir()),
            cpu_limit: env_or("JUDGE_CPU_LIMIT", 1.0)?,
            pids_limit: env_or("JUDGE_PIDS_LIMIT", 64)?,
            languages_config: std::env::var("JUDGE_LANGUAGES_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config/languages.json")),
            claim_lease: Duration::from_secs(env_or(
                "JUDGE_CLAIM_LEASE_SECS",
                DEFAULT_CLAIM_LEASE.as_secs(),
            )?),
        };

        if config.workers == 0 {
            bail!("JUDGE_WORKERS must be at least 1");
        }
        if config.queue_capacity == 0 {
            bail!("JUDGE_QUEUE_CAPACITY must be at least 1");
        }
        if config.claim_lease.is_zero() {
            bail!("JUDGE_CLAIM_LEASE_SECS must be at least 1");
        }
        if config.cpu_limit <= 0.0 {
            bail!("JUDGE_CPU_LIMIT must be positive");
        }
        Ok(config)
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {:?} ({})", name, raw, e)),
        Err(_) => Ok(default),
    }
}
