//! Core domain models for the build engine.
//!
//! These types are the source of truth for what a workflow plan looks like
//! in memory. They are read from a TOML (or JSON) plan file:
//!
//! ```toml
//! [[import]]
//! name = "clean_script"
//! path = "R/clean.py"
//!
//! [[target]]
//! name = "raw"
//! command = 'cat file_in("data/raw.csv")'
//!
//! [[target]]
//! name = "cleaned"
//! command = "python3 {{clean_script}} < {{raw}}"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::EngineError;

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// How a trigger condition combines with the other triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// A true condition forces a build; otherwise the other triggers decide.
    #[default]
    Whitelist,
    /// A false condition prevents a build; otherwise the other triggers decide.
    Blacklist,
    /// Only the condition decides.
    Condition,
}

/// Which changes make a target outdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Trigger {
    /// Rebuild when the (normalized) command changes.
    pub command: bool,
    /// Rebuild when an upstream target, import or input file changes.
    pub depend: bool,
    /// Rebuild when a declared output file is missing or modified.
    pub file: bool,
    /// Shell command; exit status 0 means "true".
    pub condition: Option<String>,
    /// Shell command whose stdout is fingerprinted; a new value rebuilds.
    pub change: Option<String>,
    pub mode: TriggerMode,
}

impl Default for Trigger {
    fn default() -> Self {
        Self {
            command: true,
            depend: true,
            file: true,
            condition: None,
            change: None,
            mode: TriggerMode::Whitelist,
        }
    }
}

impl Trigger {
    /// Build every time `make` runs.
    pub fn always() -> Self {
        Self {
            condition: Some("true".into()),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// TargetSpec / ImportSpec
// ---------------------------------------------------------------------------

/// One row of the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Unique name (referenced from other commands as `{{name}}`).
    pub name: String,
    /// Shell command whose stdout becomes the target's value.
    pub command: String,
    /// Extra dependencies that do not appear in the command text.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<String>,
    #[serde(default)]
    pub trigger: Trigger,
    /// Overrides the configured retry budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Overrides the configured build timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl TargetSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            deps: Vec::new(),
            trigger: Trigger::default(),
            retries: None,
            timeout_secs: None,
        }
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// A non-target input referenced by commands: a script/function source file
/// or a literal constant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ImportSpec {
    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), path: Some(path.into()), value: None }
    }

    pub fn value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), path: None, value: Some(value.into()) }
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// A complete workflow plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(rename = "target", alias = "targets", default)]
    pub targets: Vec<TargetSpec>,
    #[serde(rename = "import", alias = "imports", default)]
    pub imports: Vec<ImportSpec>,
}

impl Plan {
    pub fn new(targets: Vec<TargetSpec>, imports: Vec<ImportSpec>) -> Self {
        Self { targets, imports }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, EngineError> {
        toml::from_str(s).map_err(|e| EngineError::PlanParse(e.to_string()))
    }

    pub fn from_json_str(s: &str) -> Result<Self, EngineError> {
        serde_json::from_str(s).map_err(|e| EngineError::PlanParse(e.to_string()))
    }

    /// Read a plan file; `.json` files are parsed as JSON, everything else as TOML.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    pub fn target(&self, name: &str) -> Option<&TargetSpec> {
        self.targets.iter().find(|t| t.name == name)
    }

    pub fn import(&self, name: &str) -> Option<&ImportSpec> {
        self.imports.iter().find(|i| i.name == name)
    }

    /// Check names and import definitions.
    ///
    /// # Errors
    /// - [`EngineError::InvalidName`] for names outside `[A-Za-z_][A-Za-z0-9_.]*`.
    /// - [`EngineError::DuplicateName`] when a name is used twice.
    /// - [`EngineError::InvalidImport`] when an import sets both or neither of
    ///   `path` / `value`.
    pub fn validate_names(&self) -> Result<(), EngineError> {
        let mut seen: HashSet<&str> = HashSet::new();
        let names = self
            .targets
            .iter()
            .map(|t| t.name.as_str())
            .chain(self.imports.iter().map(|i| i.name.as_str()));

        for name in names {
            if !is_valid_name(name) {
                return Err(EngineError::InvalidName(name.to_owned()));
            }
            if !seen.insert(name) {
                return Err(EngineError::DuplicateName(name.to_owned()));
            }
        }

        for import in &self.imports {
            if import.path.is_some() == import.value.is_some() {
                return Err(EngineError::InvalidImport(import.name.clone()));
            }
        }

        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_.]*`
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}
