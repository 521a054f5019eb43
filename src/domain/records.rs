//! Record envelope for the transport log.
//!
//! Every message exchanged between pipeline components is a [`Record`]:
//! an immutable, sequence-numbered line in the append-only log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::intent::Intent;
use super::outcome::{Action, ActionResult, Suggestion};
use super::utterance::Utterance;

/// A single record in the transport log.
///
/// The sequence number is assigned by the transport at append time and
/// equals the record's line number in the log (1-based).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Position in the log, assigned by the transport
    pub seq: u64,

    /// Unique identifier for this record
    pub id: Uuid,

    /// When the record was created (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// Record this one answers (Intent -> Utterance, Action -> Intent, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,

    /// Kind tag and payload
    pub body: RecordBody,
}

impl Record {
    /// Kind of this record
    pub fn kind(&self) -> RecordKind {
        self.body.kind()
    }
}

/// A record that has not been appended yet.
///
/// Producers build one of these and hand it to the transport, which seals
/// it into a [`Record`] by assigning the next sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<Uuid>,
    pub body: RecordBody,
}

impl PendingRecord {
    /// Create a new pending record with the current timestamp
    pub fn new(body: RecordBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: None,
            body,
        }
    }

    /// Link this record back to the record it answers
    pub fn correlated_with(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Seal with a sequence number (transport only)
    pub(crate) fn seal(self, seq: u64) -> Record {
        Record {
            seq,
            id: self.id,
            timestamp: self.timestamp,
            correlation_id: self.correlation_id,
            body: self.body,
        }
    }
}

/// Kind-tagged payload of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum RecordBody {
    Utterance(Utterance),
    Intent(Intent),
    Suggestion(Suggestion),
    Action(Action),
    ActionResult(ActionResult),
}

impl RecordBody {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Utterance(_) => RecordKind::Utterance,
            Self::Intent(_) => RecordKind::Intent,
            Self::Suggestion(_) => RecordKind::Suggestion,
            Self::Action(_) => RecordKind::Action,
            Self::ActionResult(_) => RecordKind::ActionResult,
        }
    }
}

/// Types of records that travel over the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Recognized speech from the capture collaborator
    Utterance,

    /// Structured interpretation of an utterance
    Intent,

    /// Proposed action awaiting a human
    Suggestion,

    /// Approved action, cleared for execution
    Action,

    /// Outcome of executing (or dead-lettering) something
    ActionResult,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Utterance => "utterance",
            Self::Intent => "intent",
            Self::Suggestion => "suggestion",
            Self::Action => "action",
            Self::ActionResult => "action_result",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "utterance" => Ok(Self::Utterance),
            "intent" => Ok(Self::Intent),
            "suggestion" => Ok(Self::Suggestion),
            "action" => Ok(Self::Action),
            "action_result" => Ok(Self::ActionResult),
            other => Err(format!("unknown record kind: {}", other)),
        }
    }
}
