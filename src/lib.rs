//! wodehouse - Durable intent dispatch for a voice-driven assistant
//!
//! Turns recognized speech into structured intents, decides whether each
//! intent may act or only suggest, and fans approved actions out to
//! consumers that run the user's scripts.
//!
//! # Architecture
//!
//! Every stage talks through one append-only, sequence-numbered record log:
//! - Records are immutable once appended; sequence numbers are gapless
//! - Each consumer keeps its own durable offset and resumes from it
//! - Delivery is at-least-once, so handlers are idempotent
//! - Only the approval gate creates actions, and never in PoC mode
//!
//! # Modules
//!
//! - `core`: Transport, offsets, dispatch, resolver, gate, supervisor
//! - `consumers`: Script runner, UI feed, audit logger
//! - `adapters`: Subprocess execution and the Ollama resolver backend
//! - `domain`: Data structures (Record, Utterance, Intent, Action, ...)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Record an utterance
//! wodehouse ingest "add meeting with Joanna Friday 3pm" --confidence 0.95
//!
//! # Process it
//! wodehouse run --once
//!
//! # See what the gate decided, then approve a suggestion
//! wodehouse feed
//! wodehouse approve 3
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod consumers;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{Dispatcher, GatePolicy, Mode, RecordLog, Supervisor};
pub use domain::{Action, ActionResult, Intent, Record, RecordBody, RecordKind, Suggestion, Utterance};
