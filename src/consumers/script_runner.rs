//! Script runner: turns approved actions into external script executions.
//!
//! Scripts have side effects, so a script is never retried here: every
//! execution problem becomes a `failed` result. Each run carries the action
//! record id as its idempotency key, and a redelivered action reuses it.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::adapters::{ExecutionError, ScriptExecutor, ScriptInput, ScriptTable};
use crate::core::dispatch::{Handler, HandlerError};
use crate::core::gate::GatePolicy;
use crate::core::transport::RecordLog;
use crate::domain::{Action, ActionResult, ActionStatus, PendingRecord, Record, RecordBody, RecordKind};

use super::SCRIPT_RUNNER;

/// Consumer executing mapped scripts for `action` records
pub struct ScriptRunner {
    log: RecordLog,
    policy: GatePolicy,
    scripts: ScriptTable,
    executor: Box<dyn ScriptExecutor>,
    timeout: Duration,
}

impl ScriptRunner {
    pub fn new(
        log: RecordLog,
        policy: GatePolicy,
        scripts: ScriptTable,
        executor: Box<dyn ScriptExecutor>,
        timeout: Duration,
    ) -> Self {
        Self {
            log,
            policy,
            scripts,
            executor,
            timeout,
        }
    }

    /// Run the script for one action and describe the outcome
    pub async fn execute(&self, record: &Record, action: &Action) -> ActionResult {
        let action_type = action.intent.action_type.as_str();

        let Some(script) = self.scripts.get(action_type) else {
            info!(action_type, "No script mapped, skipping");
            return ActionResult::new(ActionStatus::Skipped, SCRIPT_RUNNER)
                .with_error(format!("no script mapped for {}", action_type));
        };

        let input = ScriptInput {
            action_type: action_type.to_string(),
            params: action.intent.params.clone(),
            idempotency_key: record.id.to_string(),
        };

        match self.executor.execute(script, &input, self.timeout).await {
            Ok(output) => {
                let mut result = ActionResult::new(ActionStatus::Succeeded, SCRIPT_RUNNER)
                    .with_duration(output.duration.as_millis() as u64);
                if !output.stdout.is_empty() {
                    result = result.with_output(output.stdout);
                }
                result
            }
            Err(ExecutionError::Timeout(limit)) => {
                warn!(action_type, timeout_secs = limit.as_secs(), "Script timed out and was killed");
                ActionResult::new(ActionStatus::Failed, SCRIPT_RUNNER)
                    .with_error("timeout")
                    .with_duration(limit.as_millis() as u64)
            }
            Err(e) => {
                warn!(action_type, error = %e, "Script failed");
                ActionResult::new(ActionStatus::Failed, SCRIPT_RUNNER).with_error(e.to_string())
            }
        }
    }
}

#[async_trait]
impl Handler for ScriptRunner {
    fn accepts(&self, kind: RecordKind) -> bool {
        kind == RecordKind::Action
    }

    #[instrument(skip(self, record), fields(seq = record.seq))]
    async fn handle(&mut self, record: &Record) -> Result<(), HandlerError> {
        let RecordBody::Action(action) = &record.body else {
            return Ok(());
        };

        self.policy.ensure_executable(action)?;

        let result = self.execute(record, action).await;
        let status = result.status;
        let pending = PendingRecord::new(RecordBody::ActionResult(result)).correlated_with(record.id);
        let result_seq = self.log.append(pending).await?;

        info!(
            action_type = %action.intent.action_type,
            ?status,
            result_seq,
            "Action executed"
        );
        Ok(())
    }
}
