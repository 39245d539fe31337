//! Persistent record of the most recent aggregation attempt.
//!
//! The record is stored as a small JSON object:
//!
//! ```json
//! {"time":"2026-10-19T02:00:00Z","success":true}
//! ```
//!
//! Exactly one of `failed` / `success` must be `true`. In memory the pair is
//! a single [`Outcome`], so the invalid combinations only exist on disk and
//! are rejected on decode.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StateError;

/// Outcome of an aggregation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Failed,
}

impl Outcome {
    /// Get the outcome name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failed => "failed",
        }
    }
}

/// Outcome of the most recent aggregation attempt and when it was produced.
///
/// Records are immutable; a new attempt replaces the stored record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RecordRepr", into = "RecordRepr")]
pub struct AttemptRecord {
    timestamp: DateTime<Utc>,
    outcome: Outcome,
}

impl AttemptRecord {
    pub fn new(timestamp: DateTime<Utc>, outcome: Outcome) -> Self {
        Self { timestamp, outcome }
    }

    /// Record stamped with the current time.
    pub fn now(outcome: Outcome) -> Self {
        Self::new(Utc::now(), outcome)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn is_failed(&self) -> bool {
        self.outcome == Outcome::Failed
    }

    /// Encode to the on-disk JSON form.
    pub fn encode(&self) -> Result<String, StateError> {
        serde_json::to_string(self).map_err(|e| StateError::Invalid(e.to_string()))
    }

    /// Decode from the on-disk JSON form.
    pub fn decode(raw: &str) -> Result<Self, StateError> {
        serde_json::from_str(raw).map_err(|e| StateError::Invalid(e.to_string()))
    }
}

/// Wire form with the legacy flag pair.
#[derive(Debug, Serialize, Deserialize)]
struct RecordRepr {
    time: String,

    #[serde(default, skip_serializing_if = "is_false")]
    failed: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    success: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl TryFrom<RecordRepr> for AttemptRecord {
    type Error = String;

    fn try_from(repr: RecordRepr) -> Result<Self, Self::Error> {
        let outcome = match (repr.failed, repr.success) {
            (true, false) => Outcome::Failed,
            (false, true) => Outcome::Success,
            (true, true) => return Err("failed and success cannot both be true".to_string()),
            (false, false) => {
                return Err("exactly one of failed or success must be true".to_string())
            }
        };
        let timestamp = parse_timestamp(&repr.time)?;
        Ok(Self { timestamp, outcome })
    }
}

impl From<AttemptRecord> for RecordRepr {
    fn from(record: AttemptRecord) -> Self {
        Self {
            time: record.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            failed: record.outcome == Outcome::Failed,
            success: record.outcome == Outcome::Success,
        }
    }
}

/// Parse RFC 3339, falling back to naive ISO-8601 local time as written by
/// older versions of the tool.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|e| format!("invalid timestamp {raw:?}: {e}"))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|ts| ts.with_timezone(&Utc))
        .ok_or_else(|| format!("timestamp {raw:?} does not exist in local time"))
}

/// File-backed store for the single [`AttemptRecord`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the previous record.
    ///
    /// A missing or empty file means there was no previous attempt. Any
    /// other content that does not decode is an error.
    pub fn load(&self) -> Result<Option<AttemptRecord>, StateError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file");
                return Ok(None);
            }
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if raw.trim().is_empty() {
            debug!(path = %self.path.display(), "State file is empty");
            return Ok(None);
        }

        AttemptRecord::decode(&raw)
            .map(Some)
            .map_err(|e| StateError::Parse {
                path: self.path.clone(),
                reason: match e {
                    StateError::Invalid(reason) => reason,
                    other => other.to_string(),
                },
            })
    }

    /// Replace the stored record.
    ///
    /// Writes a sibling temp file, syncs it and renames it over the target,
    /// so a crash leaves either the old or the new record.
    pub fn save(&self, record: &AttemptRecord) -> Result<(), StateError> {
        let encoded = record.encode()?;
        let write_err = |source| StateError::Write {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(encoded.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;

        debug!(path = %self.path.display(), outcome = record.outcome().name(), "Saved attempt record");
        Ok(())
    }

    /// Remove the stored record. Returns whether a file was removed.
    pub fn clear(&self) -> Result<bool, StateError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StateError::Write {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
