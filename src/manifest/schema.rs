//! Manifest document and its schema migrations
//!
//! | version | adds |
//! |---|---|
//! | 1 | state, cycle count, history, inventory |
//! | 2 | error records, pending routing outcome |
//! | 3 | destination, dominant type, trace id |
//! | 4 | cycle and subject on error records |
//!
//! Older documents are migrated in memory on read; every commit writes the
//! current version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use super::errors::{ManifestError, ManifestResult};
use crate::constants::CURRENT_SCHEMA_VERSION;
use crate::error::ErrorKind;
use crate::routing::RouteOutcome;
use crate::state_machine::{Stage, UnitEvent, UnitSnapshot, UnitState};

/// Stable identity of a unit across cycles and restarts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub state: UnitState,
    pub timestamp: DateTime<Utc>,
    pub cycle: u32,
    pub event: UnitEvent,
}

/// One file of a unit, path relative to the unit directory with `/` separators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub path: String,
    pub detected_type: Option<String>,
    /// Hex SHA-256 of the file contents
    pub content_hash: String,
    pub size: u64,
    pub last_modified_stage: Option<Stage>,
}

impl InventoryEntry {
    pub fn new(path: impl Into<String>, content_hash: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            detected_type: None,
            content_hash: content_hash.into(),
            size,
            last_modified_stage: None,
        }
    }

    pub fn with_type(mut self, detected_type: impl Into<String>) -> Self {
        self.detected_type = Some(detected_type.into());
        self
    }

    /// Same file on disk: path, hash and size agree
    pub fn same_content(&self, other: &InventoryEntry) -> bool {
        self.path == other.path && self.content_hash == other.content_hash && self.size == other.size
    }

    pub fn extension(&self) -> Option<&str> {
        let name = self.path.rsplit('/').next().unwrap_or(&self.path);
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
    /// Cycle of the commit that recorded the failure
    pub cycle: u32,
    /// Unit file the failure concerns, when the stage could tell
    pub subject: Option<String>,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, stage: Stage, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
            timestamp: Utc::now(),
            attempt,
            cycle: 0,
            subject: None,
        }
    }

    pub fn concerning(mut self, subject: Option<String>) -> Self {
        self.subject = subject;
        self
    }
}

/// Durable per-unit processing record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub unit_id: UnitId,
    pub schema_version: u32,
    pub state: UnitState,
    pub cycle_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<HistoryEntry>,
    pub inventory: Vec<InventoryEntry>,
    pub errors: Vec<ErrorRecord>,
    /// Outcome a stage or recovery left for the next routing decision
    pub pending_outcome: Option<RouteOutcome>,
    /// Area the unit was placed in, once terminal
    pub destination: Option<String>,
    pub dominant_type: Option<String>,
    pub trace_id: String,
}

impl Manifest {
    pub fn new(unit_id: UnitId, inventory: Vec<InventoryEntry>) -> Self {
        let now = Utc::now();
        Self {
            trace_id: unit_id.to_string(),
            unit_id,
            schema_version: CURRENT_SCHEMA_VERSION,
            state: UnitState::Input,
            cycle_count: 0,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
            inventory,
            errors: Vec::new(),
            pending_outcome: None,
            destination: None,
            dominant_type: None,
        }
    }

    /// The slice of the manifest the state machine reasons about
    pub fn snapshot(&self) -> UnitSnapshot {
        let snapshot = UnitSnapshot::new(self.state, self.cycle_count);
        match self.errors.last() {
            Some(record) => snapshot.with_last_error(record.kind),
            None => snapshot,
        }
    }

    pub fn last_event(&self) -> Option<UnitEvent> {
        self.history.last().map(|entry| entry.event)
    }

    /// Error records of `stage` from the current cycle
    pub fn failures_in_cycle(&self, stage: Stage) -> impl Iterator<Item = &ErrorRecord> + '_ {
        let cycle = self.cycle_count;
        self.errors
            .iter()
            .filter(move |record| record.stage == stage && record.cycle == cycle)
    }

    /// Attempt number the next failure of `stage` on `subject` carries
    ///
    /// Counted from persisted records, so retries on different files do not
    /// share a budget and a restart does not reset it.
    pub fn next_attempt(&self, stage: Stage, subject: Option<&str>) -> u32 {
        let prior = self
            .failures_in_cycle(stage)
            .filter(|record| record.subject.as_deref() == subject)
            .count();
        u32::try_from(prior).unwrap_or(u32::MAX).saturating_add(1)
    }

    /// Stage whose start was recorded without a matching completion or failure
    pub fn interrupted_stage(&self) -> Option<Stage> {
        match self.last_event() {
            Some(UnitEvent::StageStarted(stage)) => Some(stage),
            _ => None,
        }
    }

    /// Parse a stored document, migrating older schema versions
    pub fn from_json(bytes: &[u8]) -> ManifestResult<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        let migrated = migrate(value)?;
        Ok(serde_json::from_value(migrated)?)
    }

    /// Serialize at the current schema version
    pub fn to_json(&self) -> ManifestResult<Vec<u8>> {
        let mut current = self.clone();
        current.schema_version = CURRENT_SCHEMA_VERSION;
        Ok(serde_json::to_vec_pretty(&current)?)
    }
}

/// Bring a stored document up to [`CURRENT_SCHEMA_VERSION`]
pub fn migrate(mut value: Value) -> ManifestResult<Value> {
    let object = value
        .as_object_mut()
        .ok_or_else(|| ManifestError::InvalidDocument("manifest is not a JSON object".to_string()))?;

    let version = match object.get("schema_version") {
        None => 1,
        Some(raw) => raw
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| {
                ManifestError::InvalidDocument(format!("schema_version is not a version: {raw}"))
            })?,
    };

    if version > CURRENT_SCHEMA_VERSION {
        return Err(ManifestError::UnsupportedSchemaVersion {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    if version < 2 {
        object.entry("errors").or_insert_with(|| json!([]));
        object.entry("pending_outcome").or_insert(Value::Null);
    }

    if version < 3 {
        let unit_id = object.get("unit_id").cloned().unwrap_or(Value::Null);
        object.entry("destination").or_insert(Value::Null);
        object.entry("dominant_type").or_insert(Value::Null);
        object.entry("trace_id").or_insert(unit_id);
    }

    if version < 4 {
        let cycle = object.get("cycle_count").cloned().unwrap_or_else(|| json!(0));
        if let Some(Value::Array(errors)) = object.get_mut("errors") {
            for record in errors.iter_mut().filter_map(Value::as_object_mut) {
                record.entry("cycle").or_insert_with(|| cycle.clone());
                record.entry("subject").or_insert(Value::Null);
            }
        }
    }

    object.insert("schema_version".to_string(), json!(CURRENT_SCHEMA_VERSION));
    Ok(value)
}
