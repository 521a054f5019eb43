//! Gate decisions and execution outcomes.

use serde::{Deserialize, Serialize};

use super::intent::Intent;

/// Payload of a `suggestion` record. Never causes side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    /// The proposed intent, unchanged
    pub intent: Intent,

    /// Why the gate withheld execution
    pub reason: SuggestReason,

    /// Human-readable explanation for the UI
    pub rationale: String,
}

/// Why an intent became a suggestion instead of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestReason {
    /// Global mode only allows suggestions
    PocMode,

    /// Action type is configured to always require confirmation
    AlwaysConfirm,

    /// Confidence below the configured threshold
    LowConfidence,

    /// Override did not reference a known suggestion
    OverrideRejected,
}

impl SuggestReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PocMode => "poc_mode",
            Self::AlwaysConfirm => "always_confirm",
            Self::LowConfidence => "low_confidence",
            Self::OverrideRejected => "override_rejected",
        }
    }
}

/// Payload of an `action` record.
///
/// Actions can only be constructed inside this crate (by the approval gate);
/// the private field prevents struct-literal construction elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// The approved intent
    pub intent: Intent,

    /// What cleared it for execution
    pub approval: ApprovalSource,

    #[serde(skip)]
    _sealed: (),
}

impl Action {
    pub(crate) fn approved(intent: Intent, approval: ApprovalSource) -> Self {
        Self {
            intent,
            approval,
            _sealed: (),
        }
    }
}

/// What cleared an action for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalSource {
    /// Live mode, confident, not in the always-confirm set
    Policy,

    /// A human approved the originating suggestion
    HumanOverride,
}

/// Payload of an `action_result` record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub status: ActionStatus,

    /// Error detail for failed results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Script output, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Time taken in milliseconds
    pub duration_ms: u64,

    /// Consumer that produced this result
    pub consumer: String,

    /// Present when this result records a dead-lettered delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<DeadLetter>,
}

impl ActionResult {
    pub fn new(status: ActionStatus, consumer: impl Into<String>) -> Self {
        Self {
            status,
            error: None,
            output: None,
            duration_ms: 0,
            consumer: consumer.into(),
            dead_letter: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Outcome status of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Reference to a record whose processing exhausted its retry budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub consumer: String,
    pub seq: u64,
    pub attempts: u32,
}
