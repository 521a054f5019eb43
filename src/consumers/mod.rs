//! Downstream consumers of gate decisions.
//!
//! Each consumer is a [`Handler`](crate::core::Handler) run by the
//! dispatcher under its own consumer id, so each keeps an independent offset:
//! - ScriptRunner: executes approved actions
//! - UiFeed: streams suggestions, actions and results as JSON lines
//! - AuditLogger: durable audit trail and a human-readable daily log

pub mod audit;
pub mod script_runner;
pub mod ui_feed;

pub use audit::AuditLogger;
pub use script_runner::ScriptRunner;
pub use ui_feed::UiFeed;

/// Consumer id of the resolver stage
pub const RESOLVER: &str = "resolver";

/// Consumer id of the approval gate stage
pub const GATE: &str = "gate";

/// Consumer id of the script runner
pub const SCRIPT_RUNNER: &str = "script-runner";

/// Consumer id of the UI feed
pub const UI_FEED: &str = "ui-feed";

/// Consumer id of the audit logger
pub const AUDIT: &str = "audit";
