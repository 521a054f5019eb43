//! Domain types for the wodehouse dispatch pipeline.
//!
//! This module contains the core data structures:
//! - Records: Immutable, sequence-numbered transport entries
//! - Utterance: Recognized speech
//! - Intent: Structured interpretation of an utterance
//! - Outcome: Suggestions, actions and their results

pub mod intent;
pub mod outcome;
pub mod records;
pub mod utterance;

// Re-export commonly used types
pub use intent::{ActionType, Intent, ParamValue, Params};
pub use outcome::{Action, ActionResult, ActionStatus, ApprovalSource, DeadLetter, SuggestReason, Suggestion};
pub use records::{PendingRecord, Record, RecordBody, RecordKind};
pub use utterance::{derive_utterance_id, Utterance};
