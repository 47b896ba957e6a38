//! Engine-level error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the build engine (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Plan errors ------

    /// The plan file could not be parsed.
    #[error("invalid plan: {0}")]
    PlanParse(String),

    /// A target or import name is not a valid identifier.
    #[error("invalid name '{0}' (expected [A-Za-z_][A-Za-z0-9_.]*)")]
    InvalidName(String),

    /// Two targets/imports share the same name.
    #[error("duplicate name: '{0}'")]
    DuplicateName(String),

    /// An import must set exactly one of `path` and `value`.
    #[error("import '{0}' must set exactly one of `path` or `value`")]
    InvalidImport(String),

    /// The configuration file could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A command could not be scanned for dependencies.
    #[error("malformed command for '{target}': {message}")]
    MalformedCommand { target: String, message: String },

    // ------ Graph errors ------

    /// A command or explicit dependency names neither a target nor an import.
    #[error("target '{target}' references unknown name '{name}'")]
    UnknownReference { target: String, name: String },

    /// Two targets declare the same output file.
    #[error("file '{path}' is produced by both '{first}' and '{second}'")]
    ConflictingFileOut {
        path: String,
        first: String,
        second: String,
    },

    /// Topological sort detected a cycle.
    #[error("dependency graph contains a cycle through: {}", .0.join(", "))]
    CycleDetected(Vec<String>),

    /// A name passed by the caller is not a target of the plan.
    #[error("no such target: '{0}'")]
    UnknownTarget(String),

    // ------ Execution errors ------

    /// An import points at a file that does not exist.
    #[error("import '{name}' points at missing file '{}'", path.display())]
    MissingImport { name: String, path: PathBuf },

    /// A target has no built value in the cache.
    #[error("target '{0}' has not been built")]
    NotBuilt(String),

    /// A target failed; the build was stopped.
    #[error("target '{target}' failed: {message}")]
    TargetFailed { target: String, message: String },

    /// A build task panicked or was aborted.
    #[error("build task aborted: {0}")]
    TaskAborted(String),

    /// A file or directory the engine needs could not be read or written.
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Persistence error from the cache crate.
    #[error("cache error: {0}")]
    Cache(#[from] cache::CacheError),
}

impl EngineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
