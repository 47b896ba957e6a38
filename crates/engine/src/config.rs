//! Engine configuration, read from an optional `drover.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::EngineError;

/// Default name of the configuration file in the project root.
pub const CONFIG_FILE: &str = "drover.toml";

/// How ready targets are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// One target at a time.
    Sequential,
    /// Up to `jobs` targets at a time.
    Parallel { jobs: usize },
}

impl Backend {
    pub fn jobs(self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Parallel { jobs } => jobs.max(1),
        }
    }
}

/// Tuning knobs for the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Project root: commands run here and relative paths resolve here.
    pub root: PathBuf,
    /// Cache location, relative to `root` unless absolute.
    pub cache_dir: PathBuf,
    /// Maximum number of concurrent builds.
    pub jobs: usize,
    /// Keep building independent targets after a failure.
    pub keep_going: bool,
    /// Retries for a build failing with a retryable error.
    pub retries: u32,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay_ms: u64,
    /// Per-build timeout; `None` waits forever.
    pub timeout_secs: Option<u64>,
    /// Shell used by the built-in shell worker.
    pub shell: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            cache_dir: PathBuf::from(".drover"),
            jobs: 1,
            keep_going: false,
            retries: 0,
            retry_base_delay_ms: 100,
            timeout_secs: None,
            shell: "sh".into(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, EngineError> {
        toml::from_str(s).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Read `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(EngineError::io(path, e)),
        }
    }

    pub fn backend(&self) -> Backend {
        if self.jobs <= 1 {
            Backend::Sequential
        } else {
            Backend::Parallel { jobs: self.jobs }
        }
    }

    pub fn cache_path(&self) -> PathBuf {
        self.root.join(&self.cache_dir)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}
