//! Core pipeline logic.
//!
//! This module contains:
//! - Transport: Append-only, sequence-numbered record log
//! - Offsets: Durable per-consumer cursors
//! - Dispatch: Generic consumer framework (delivery, retry, dead-letter)
//! - Resolver: Utterance to intent resolution
//! - Gate: Approval policy deciding suggestion vs action
//! - Supervisor: Runs every stage against one log

pub mod dispatch;
pub mod gate;
pub mod offsets;
pub mod resolver;
pub mod supervisor;
pub mod transport;

// Re-export commonly used types
pub use dispatch::{
    stop_channel, DispatchError, Dispatcher, Handler, HandlerError, RetryPolicy, RunSummary,
    StopHandle, StopSignal,
};
pub use gate::{Decision, GatePolicy, GateStage, Mode, PolicyViolation};
pub use offsets::{ConsumerOffset, OffsetError, OffsetStore};
pub use resolver::{Resolution, Resolver, ResolverBackend, ResolverSettings, ResolverStage, RuleResolver};
pub use supervisor::{Stage, Supervisor};
pub use transport::{ReadMode, RecordLog, RecordReader, TransportError, TransportSettings};
