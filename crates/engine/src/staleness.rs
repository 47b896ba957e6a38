//! Change detection: decide whether a target must be rebuilt.
//!
//! The decision itself ([`decide`]) is a pure function of the trigger, the
//! cached record and the current fingerprints. Gathering those fingerprints
//! (hashing files, running condition/change commands) is the caller's job.

use std::collections::HashMap;

use cache::models::TargetRecord;
use serde::Serialize;

use crate::dag::TargetDeps;
use crate::hash::combine;
use crate::models::{Trigger, TriggerMode};

/// Why a target is outdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum Reason {
    /// Never built.
    Missing,
    /// The last build failed.
    PreviouslyFailed,
    CommandChanged,
    DependencyChanged,
    /// A declared output file is missing or was modified.
    FileOutChanged,
    /// The trigger condition evaluated to true.
    ConditionMet,
    /// The change-trigger command produced a new value.
    ChangeValueChanged,
    /// An upstream target is outdated (static `outdated` query only).
    UpstreamOutdated(String),
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "never built"),
            Self::PreviouslyFailed => write!(f, "last build failed"),
            Self::CommandChanged => write!(f, "command changed"),
            Self::DependencyChanged => write!(f, "dependencies changed"),
            Self::FileOutChanged => write!(f, "output file missing or modified"),
            Self::ConditionMet => write!(f, "trigger condition is true"),
            Self::ChangeValueChanged => write!(f, "change trigger produced a new value"),
            Self::UpstreamOutdated(name) => write!(f, "upstream target '{name}' is outdated"),
        }
    }
}

/// Fingerprints of a target as it would be built now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fingerprints {
    /// Hash of the normalized command.
    pub command: String,
    pub depend: String,
    /// Combined hash of the declared output files; `None` without outputs.
    pub file_out: Option<String>,
    /// Result of the condition command, when the trigger has one.
    pub condition: Option<bool>,
    /// Hash of the change command's stdout, when the trigger has one.
    pub change: Option<String>,
}

/// Compare the current fingerprints with the cached record.
///
/// Returns an empty list when the target is up to date.
pub fn decide(trigger: &Trigger, record: Option<&TargetRecord>, current: &Fingerprints) -> Vec<Reason> {
    let record = match record {
        None => return vec![Reason::Missing],
        Some(r) if !r.is_built() => return vec![Reason::PreviouslyFailed],
        Some(r) => r,
    };

    match (trigger.mode, current.condition) {
        (TriggerMode::Condition, Some(true)) => return vec![Reason::ConditionMet],
        (TriggerMode::Condition, _) => return Vec::new(),
        (TriggerMode::Blacklist, Some(false)) => return Vec::new(),
        _ => {}
    }

    let mut reasons = Vec::new();
    if trigger.mode == TriggerMode::Whitelist && current.condition == Some(true) {
        reasons.push(Reason::ConditionMet);
    }
    if trigger.command && record.command_hash != current.command {
        reasons.push(Reason::CommandChanged);
    }
    if trigger.depend && record.depend_hash != current.depend {
        reasons.push(Reason::DependencyChanged);
    }
    if trigger.file && record.file_out_hash != current.file_out {
        reasons.push(Reason::FileOutChanged);
    }
    if let Some(change) = &current.change {
        if record.change_hash.as_ref() != Some(change) {
            reasons.push(Reason::ChangeValueChanged);
        }
    }
    reasons
}

/// Whether an outdated upstream target can make this one outdated: the
/// trigger watches dependencies and its condition does not veto the build.
pub fn follows_upstream(trigger: &Trigger, current: &Fingerprints) -> bool {
    match (trigger.mode, current.condition) {
        (TriggerMode::Condition, _) => false,
        (TriggerMode::Blacklist, Some(false)) => false,
        _ => trigger.depend,
    }
}

/// Fingerprint of everything a target reads.
///
/// `values`, `imports` and `files` map names/paths to their current
/// fingerprints; anything absent counts as `missing`.
pub fn depend_fingerprint(
    deps: &TargetDeps,
    values: &HashMap<String, String>,
    imports: &HashMap<String, String>,
    files: &HashMap<String, Option<String>>,
) -> String {
    const MISSING: &str = "missing";
    let targets = deps
        .targets
        .iter()
        .map(|n| ("target", n.as_str(), values.get(n).map_or(MISSING, String::as_str)));
    let imported = deps
        .imports
        .iter()
        .map(|n| ("import", n.as_str(), imports.get(n).map_or(MISSING, String::as_str)));
    let read = deps.files_in.iter().map(|p| {
        let fp = files.get(p).and_then(Option::as_deref).unwrap_or(MISSING);
        ("file", p.as_str(), fp)
    });
    combine(targets.chain(imported).chain(read))
}
