//! Subprocess script executor.
//!
//! The action is written to the child's stdin as one JSON document and the
//! action id and type are exported as environment variables. A child that
//! outlives its timeout is killed.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{
    ExecutionError, ExecutionOutput, ScriptExecutor, ScriptInput, ScriptSpec, ACTION_ID_ENV,
    ACTION_TYPE_ENV,
};

/// Cap on captured stdout kept in action results
const MAX_CAPTURED_OUTPUT: usize = 4096;

/// Executor that spawns each script as a child process
#[derive(Debug, Default, Clone)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ScriptExecutor for ProcessExecutor {
    fn name(&self) -> &str {
        "process"
    }

    async fn execute(
        &self,
        script: &ScriptSpec,
        input: &ScriptInput,
        timeout: Duration,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let payload = serde_json::to_vec(input)?;
        let started = Instant::now();

        let mut child = Command::new(&script.command)
            .args(&script.args)
            .env(ACTION_ID_ENV, &input.idempotency_key)
            .env(ACTION_TYPE_ENV, &input.action_type)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutionError::Spawn {
                command: script.command.clone(),
                source,
            })?;

        debug!(command = %script.command, pid = ?child.id(), "Script started");

        let run = async move {
            if let Some(mut stdin) = child.stdin.take() {
                // Scripts that ignore stdin may exit before reading it
                match stdin.write_all(&payload).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                    Err(e) => return Err(ExecutionError::Io(e)),
                }
            }
            child.wait_with_output().await.map_err(ExecutionError::Io)
        };

        // Dropping `run` on timeout drops the child, which kills it
        let output = tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| ExecutionError::Timeout(timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutionError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        let mut stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        if stdout.len() > MAX_CAPTURED_OUTPUT {
            let mut cut = MAX_CAPTURED_OUTPUT;
            while !stdout.is_char_boundary(cut) {
                cut -= 1;
            }
            stdout.truncate(cut);
        }

        Ok(ExecutionOutput {
            stdout,
            duration: started.elapsed(),
        })
    }
}
