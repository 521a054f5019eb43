//! Approval gate: the single place an intent can become an action.
//!
//! The decision is a pure function of the policy (mode, always-confirm set,
//! confidence threshold) and the intent itself (action type, confidence,
//! human override flag). Nothing else feeds into it.
//!
//! Rules, in order:
//! 1. Confidence below the threshold always suggests, even with an override.
//! 2. PoC mode always suggests, even with an override.
//! 3. Always-confirm action types suggest unless a human overrode.
//! 4. Everything else is approved.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    Action, ApprovalSource, Intent, PendingRecord, Record, RecordBody, RecordKind,
    SuggestReason, Suggestion,
};

use super::dispatch::{Handler, HandlerError};
use super::transport::{RecordLog, TransportError};

/// Global operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Suggestion-only: nothing is ever executed
    Poc,

    /// Confident, non-sensitive intents are executed
    Live,
}

impl Default for Mode {
    fn default() -> Self {
        Self::Poc
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Poc => f.write_str("poc"),
            Self::Live => f.write_str("live"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poc" => Ok(Self::Poc),
            "live" => Ok(Self::Live),
            other => Err(format!("unknown mode {:?} (expected poc or live)", other)),
        }
    }
}

/// Policy inputs to the gate decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatePolicy {
    #[serde(default)]
    pub mode: Mode,

    /// Intents below this confidence never become actions (default: 0.6)
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Action types (or glob patterns like `script.*`) that always need a human
    #[serde(default = "default_always_confirm")]
    pub always_confirm_action_types: Vec<String>,
}

fn default_confidence_threshold() -> f64 {
    0.6
}

fn default_always_confirm() -> Vec<String> {
    vec!["script.run".to_string()]
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            confidence_threshold: default_confidence_threshold(),
            always_confirm_action_types: default_always_confirm(),
        }
    }
}

impl GatePolicy {
    /// Check if an action type is in the always-confirm set
    pub fn requires_confirmation(&self, action_type: &str) -> bool {
        self.always_confirm_action_types.iter().any(|entry| {
            entry == action_type
                || Pattern::new(entry)
                    .map(|pattern| pattern.matches(action_type))
                    .unwrap_or(false)
        })
    }

    /// Decide the fate of an intent. Pure: same inputs, same decision.
    pub fn decide(&self, intent: &Intent) -> Decision {
        if !(intent.confidence >= self.confidence_threshold) {
            return Decision::Suggest(SuggestReason::LowConfidence);
        }

        if self.mode == Mode::Poc {
            return Decision::Suggest(SuggestReason::PocMode);
        }

        if intent.human_override {
            return Decision::Approve(ApprovalSource::HumanOverride);
        }

        if self.requires_confirmation(intent.action_type.as_str()) {
            return Decision::Suggest(SuggestReason::AlwaysConfirm);
        }

        Decision::Approve(ApprovalSource::Policy)
    }

    /// Guard for executors: an action must never reach execution while the
    /// mode forbids it. A violation means the gate was bypassed.
    pub fn ensure_executable(&self, action: &Action) -> Result<(), PolicyViolation> {
        if self.mode == Mode::Poc {
            return Err(PolicyViolation::ActionInPocMode {
                action_type: action.intent.action_type.to_string(),
            });
        }
        if !(action.intent.confidence >= self.confidence_threshold) {
            return Err(PolicyViolation::ActionBelowThreshold {
                action_type: action.intent.action_type.to_string(),
                confidence: action.intent.confidence,
                threshold: self.confidence_threshold,
            });
        }
        Ok(())
    }
}

/// Terminal gate state for an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Suggest(SuggestReason),
    Approve(ApprovalSource),
}

impl Decision {
    pub fn is_action(&self) -> bool {
        matches!(self, Self::Approve(_))
    }
}

/// A safety invariant was breached. Always fatal.
#[derive(Debug, Clone, Error)]
pub enum PolicyViolation {
    #[error("action {action_type} reached execution while mode is poc")]
    ActionInPocMode { action_type: String },

    #[error("action {action_type} reached execution with confidence {confidence} below threshold {threshold}")]
    ActionBelowThreshold {
        action_type: String,
        confidence: f64,
        threshold: f64,
    },
}

/// Build the record the gate emits for a decision
pub fn gate_record(intent_record_id: Uuid, intent: &Intent, decision: Decision) -> PendingRecord {
    let body = match decision {
        Decision::Approve(source) => RecordBody::Action(Action::approved(intent.clone(), source)),
        Decision::Suggest(reason) => RecordBody::Suggestion(Suggestion {
            intent: intent.clone(),
            reason,
            rationale: rationale(reason, intent),
        }),
    };
    PendingRecord::new(body).correlated_with(intent_record_id)
}

fn rationale(reason: SuggestReason, intent: &Intent) -> String {
    match reason {
        SuggestReason::PocMode => format!(
            "Suggestion only: running in PoC mode. Proposed {}",
            intent.describe()
        ),
        SuggestReason::AlwaysConfirm => format!(
            "{} always requires confirmation. Approve to run {}",
            intent.action_type,
            intent.describe()
        ),
        SuggestReason::LowConfidence => format!(
            "Not sure I understood (confidence {:.2}). Did you mean {}?",
            intent.confidence,
            intent.describe()
        ),
        SuggestReason::OverrideRejected => format!(
            "Approval ignored: it does not match a pending suggestion for {}",
            intent.describe()
        ),
    }
}

/// Build the synthetic human-override intent approving a suggestion record.
/// The resolver's confidence is carried over, so the threshold still applies.
pub fn override_intent(suggestion_record: &Record) -> Option<PendingRecord> {
    let RecordBody::Suggestion(suggestion) = &suggestion_record.body else {
        return None;
    };

    let mut intent = suggestion.intent.clone();
    intent.human_override = true;

    Some(PendingRecord::new(RecordBody::Intent(intent)).correlated_with(suggestion_record.id))
}

/// Consumer stage that routes every intent through the gate exactly once
pub struct GateStage {
    log: RecordLog,
    policy: GatePolicy,
    /// Intent record ids already answered with a suggestion or action
    answered: HashSet<Uuid>,
    /// Intent record ids answered with an action
    approved: HashSet<Uuid>,
    /// Suggestion record ids that an override may reference
    suggestions: HashSet<Uuid>,
    /// Suggestions already turned into an action by an override
    overridden: HashSet<Uuid>,
}

impl GateStage {
    pub fn new(log: RecordLog, policy: GatePolicy) -> Self {
        Self {
            log,
            policy,
            answered: HashSet::new(),
            approved: HashSet::new(),
            suggestions: HashSet::new(),
            overridden: HashSet::new(),
        }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    fn remember(&mut self, record: &Record) {
        match &record.body {
            RecordBody::Suggestion(suggestion) => {
                // A rejected override cannot itself be overridden
                if suggestion.reason != SuggestReason::OverrideRejected {
                    self.suggestions.insert(record.id);
                }
                if let Some(intent_id) = record.correlation_id {
                    self.answered.insert(intent_id);
                }
            }
            RecordBody::Action(_) => {
                if let Some(intent_id) = record.correlation_id {
                    self.answered.insert(intent_id);
                    self.approved.insert(intent_id);
                }
            }
            _ => {}
        }
    }

    /// Route one intent record; returns the appended decision's sequence
    #[instrument(skip(self, record, intent), fields(seq = record.seq, action_type = %intent.action_type))]
    async fn route(&mut self, record: &Record, intent: &Intent) -> Result<Option<u64>, TransportError> {
        if self.answered.contains(&record.id) {
            info!("Intent already answered, skipping redelivery");
            return Ok(None);
        }

        let decision = if intent.human_override && !self.override_is_valid(record) {
            warn!(correlation = ?record.correlation_id, "Override does not reference a known suggestion");
            Decision::Suggest(SuggestReason::OverrideRejected)
        } else {
            self.policy.decide(intent)
        };

        let pending = gate_record(record.id, intent, decision);
        let seq = self.log.append(pending).await?;
        self.answered.insert(record.id);

        if let Decision::Approve(ApprovalSource::HumanOverride) = decision {
            self.approved.insert(record.id);
            if let Some(target) = record.correlation_id {
                self.overridden.insert(target);
            }
        }

        match decision {
            Decision::Approve(source) => info!(decision_seq = seq, ?source, "Intent approved"),
            Decision::Suggest(reason) => info!(decision_seq = seq, ?reason, "Intent suggested"),
        }

        Ok(Some(seq))
    }

    /// An override must reference a known suggestion that no earlier
    /// override has already turned into an action
    fn override_is_valid(&self, record: &Record) -> bool {
        record
            .correlation_id
            .map(|id| self.suggestions.contains(&id) && !self.overridden.contains(&id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Handler for GateStage {
    fn accepts(&self, kind: RecordKind) -> bool {
        matches!(kind, RecordKind::Intent | RecordKind::Suggestion | RecordKind::Action)
    }

    async fn prepare(&mut self) -> Result<(), HandlerError> {
        let mut override_targets = Vec::new();

        for record in self.log.snapshot().await? {
            self.remember(&record);
            if let RecordBody::Intent(intent) = &record.body {
                if let (true, Some(target)) = (intent.human_override, record.correlation_id) {
                    override_targets.push((record.id, target));
                }
            }
        }

        for (intent_id, target) in override_targets {
            if self.approved.contains(&intent_id) {
                self.overridden.insert(target);
            }
        }
        Ok(())
    }

    async fn handle(&mut self, record: &Record) -> Result<(), HandlerError> {
        match &record.body {
            RecordBody::Intent(intent) => {
                self.route(record, intent).await?;
            }
            _ => self.remember(record),
        }
        Ok(())
    }
}
