//! Row structs that map 1-to-1 onto cache tables.
//!
//! These are *persistence* models: they carry no staleness logic.
//! Domain types live in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::CacheError;

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CacheError::Corrupt(format!("invalid datetime '{s}': {e}")))
}

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// ---------------------------------------------------------------------------
// targets
// ---------------------------------------------------------------------------

/// Outcome stored with a target record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    Built,
    Failed,
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Built => write!(f, "built"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "built"  => Ok(Self::Built),
            "failed" => Ok(Self::Failed),
            other    => Err(format!("unknown record status: {other}")),
        }
    }
}

/// A cached target: its value and the fingerprints it was built from.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TargetRecord {
    pub name: String,
    pub value: Vec<u8>,
    pub value_hash: String,
    pub command_hash: String,
    pub depend_hash: String,
    /// Combined fingerprint of every declared output file.
    pub file_out_hash: Option<String>,
    /// Fingerprint of the change-trigger output at build time.
    pub change_hash: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub elapsed_ms: i64,
    pub built_at: String,
}

impl TargetRecord {
    pub fn status(&self) -> Result<RecordStatus, CacheError> {
        self.status.parse().map_err(CacheError::Corrupt)
    }

    pub fn is_built(&self) -> bool {
        matches!(self.status(), Ok(RecordStatus::Built))
    }

    pub fn built_at(&self) -> Result<DateTime<Utc>, CacheError> {
        parse_datetime(&self.built_at)
    }
}

/// Fields written by a successful build.
#[derive(Debug, Clone)]
pub struct NewTargetRecord<'a> {
    pub name: &'a str,
    pub value: &'a [u8],
    pub value_hash: &'a str,
    pub command_hash: &'a str,
    pub depend_hash: &'a str,
    pub file_out_hash: Option<&'a str>,
    pub change_hash: Option<&'a str>,
    pub elapsed_ms: i64,
}

// ---------------------------------------------------------------------------
// files
// ---------------------------------------------------------------------------

/// A memoized file fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct FileRecord {
    pub path: String,
    pub hash: String,
    pub size: i64,
    pub mtime_ns: i64,
    pub checked_at: String,
}

// ---------------------------------------------------------------------------
// runs
// ---------------------------------------------------------------------------

/// Possible statuses for a build run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running"   => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed"    => Ok(Self::Failed),
            other       => Err(format!("unknown run status: {other}")),
        }
    }
}

/// A persisted build run row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunRow {
    pub id: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
}

// ---------------------------------------------------------------------------
// build_events
// ---------------------------------------------------------------------------

/// Status transitions recorded in the build log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildStatus {
    Started,
    Retrying,
    Built,
    Skipped,
    Failed,
    Cancelled,
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started   => write!(f, "started"),
            Self::Retrying  => write!(f, "retrying"),
            Self::Built     => write!(f, "built"),
            Self::Skipped   => write!(f, "skipped"),
            Self::Failed    => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started"   => Ok(Self::Started),
            "retrying"  => Ok(Self::Retrying),
            "built"     => Ok(Self::Built),
            "skipped"   => Ok(Self::Skipped),
            "failed"    => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other       => Err(format!("unknown build status: {other}")),
        }
    }
}

/// One line of the build log.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BuildEventRow {
    pub id: i64,
    pub run_id: String,
    pub target: String,
    pub status: String,
    pub message: Option<String>,
    pub elapsed_ms: Option<i64>,
    pub at: String,
}

impl BuildEventRow {
    pub fn status(&self) -> Result<BuildStatus, CacheError> {
        self.status.parse().map_err(CacheError::Corrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_round_trip_through_text() {
        for s in [BuildStatus::Started, BuildStatus::Skipped, BuildStatus::Cancelled] {
            assert_eq!(s.to_string().parse::<BuildStatus>().unwrap(), s);
        }
        assert_eq!("failed".parse::<RecordStatus>().unwrap(), RecordStatus::Failed);
        assert!("exploded".parse::<RunStatus>().is_err());
    }

    #[test]
    fn bad_timestamp_is_reported_as_corrupt() {
        assert!(matches!(parse_datetime("yesterday"), Err(CacheError::Corrupt(_))));
        let now = Utc::now();
        assert_eq!(parse_datetime(&format_datetime(&now)).unwrap(), now);
    }
}
