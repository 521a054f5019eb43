//! Adapter interfaces for external systems.
//!
//! Adapters wrap the things Wodehouse talks to but does not own: the
//! user's scripts (run as subprocesses) and a local Ollama model used as an
//! alternative intent resolver.

pub mod ollama;
pub mod process;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Params;

pub use ollama::OllamaResolver;
pub use process::ProcessExecutor;

/// Environment variable carrying the action record id
pub const ACTION_ID_ENV: &str = "WODEHOUSE_ACTION_ID";

/// Environment variable carrying the action type
pub const ACTION_TYPE_ENV: &str = "WODEHOUSE_ACTION_TYPE";

/// A configured script: what to run for one action type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSpec {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,
}

impl ScriptSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Action type to script mapping
pub type ScriptTable = BTreeMap<String, ScriptSpec>;

/// JSON document written to a script's stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptInput {
    pub action_type: String,
    pub params: Params,

    /// Stable across redeliveries of the same action record
    pub idempotency_key: String,
}

/// What a script produced
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub duration: Duration,
}

/// Errors from running a script
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error talking to script: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode script input: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("exit code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },
}

/// Trait for script execution backends
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Human-readable executor name
    fn name(&self) -> &str;

    /// Run a script to completion, killing it if it outlives `timeout`
    async fn execute(
        &self,
        script: &ScriptSpec,
        input: &ScriptInput,
        timeout: Duration,
    ) -> Result<ExecutionOutput, ExecutionError>;
}
