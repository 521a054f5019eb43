//! Pipeline supervisor: wires every stage to one record log.
//!
//! Stages run as independent consumers with their own offsets:
//! resolver, gate, script runner and audit logger. `run` follows the log
//! until stopped; `drain` processes everything already appended (and what
//! that produces) and returns.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::adapters::{OllamaResolver, ProcessExecutor};
use crate::config::ResolvedConfig;
use crate::consumers::{self, AuditLogger, ScriptRunner};
use crate::domain::{PendingRecord, RecordBody, Utterance};

use super::dispatch::{stop_channel, Dispatcher, Handler, RunSummary, StopSignal};
use super::gate::{override_intent, GateStage};
use super::offsets::OffsetStore;
use super::resolver::{Resolver, ResolverBackend, ResolverStage, RuleResolver};
use super::transport::RecordLog;

/// A consumer id paired with its handler
pub struct Stage {
    pub consumer_id: &'static str,
    pub handler: Box<dyn Handler>,
}

/// Owns the log, offsets and configuration for one wodehouse home
pub struct Supervisor {
    config: ResolvedConfig,
    dispatcher: Dispatcher,
}

impl Supervisor {
    /// Open the log and offset store under the configured home
    pub async fn open(config: ResolvedConfig) -> Result<Self> {
        let log = RecordLog::open(config.records_path(), config.transport.clone())
            .await
            .with_context(|| format!("Failed to open record log in {}", config.home.display()))?;
        let offsets = OffsetStore::open(config.offsets_dir())
            .await
            .context("Failed to open offset store")?;

        let dispatcher = Dispatcher::new(log, offsets, config.pipeline.retry_policy());
        Ok(Self { config, dispatcher })
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn log(&self) -> &RecordLog {
        self.dispatcher.log()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn resolver(&self) -> Box<dyn Resolver> {
        let settings = &self.config.resolver;
        match settings.backend {
            ResolverBackend::Rules => Box::new(RuleResolver::new()),
            ResolverBackend::Ollama => Box::new(OllamaResolver::new(
                settings.ollama_url.clone(),
                settings.ollama_model.clone(),
            )),
        }
    }

    /// Fresh handlers for every pipeline stage, in pipeline order
    pub fn stages(&self) -> Vec<Stage> {
        let log = self.log().clone();
        let policy = self.config.pipeline.gate.clone();

        vec![
            Stage {
                consumer_id: consumers::RESOLVER,
                handler: Box::new(ResolverStage::new(
                    log.clone(),
                    self.resolver(),
                    self.config.resolver.clone(),
                )),
            },
            Stage {
                consumer_id: consumers::GATE,
                handler: Box::new(GateStage::new(log.clone(), policy.clone())),
            },
            Stage {
                consumer_id: consumers::SCRIPT_RUNNER,
                handler: Box::new(ScriptRunner::new(
                    log,
                    policy,
                    self.config.scripts.clone(),
                    Box::new(ProcessExecutor::new()),
                    self.config.pipeline.script_timeout(),
                )),
            },
            Stage {
                consumer_id: consumers::AUDIT,
                handler: Box::new(AuditLogger::new(self.config.audit_dir())),
            },
        ]
    }

    /// Append a recognized utterance
    pub async fn ingest(&self, utterance: Utterance) -> Result<u64> {
        let seq = self
            .log()
            .append(PendingRecord::new(RecordBody::Utterance(utterance)))
            .await
            .context("Failed to record utterance")?;
        info!(seq, "Utterance ingested");
        Ok(seq)
    }

    /// Append a human-override intent approving the suggestion at `seq`
    pub async fn approve(&self, seq: u64) -> Result<u64> {
        let record = self
            .log()
            .get(seq)
            .await?
            .with_context(|| format!("No record at sequence {}", seq))?;

        let pending = override_intent(&record)
            .with_context(|| format!("Record {} is a {}, not a suggestion", seq, record.kind()))?;

        let override_seq = self.log().append(pending).await?;
        info!(suggestion_seq = seq, override_seq, "Override recorded");
        Ok(override_seq)
    }

    /// Follow the log with every stage until `stop` fires.
    ///
    /// A stage that stops with an error stops the others too; the first
    /// error is returned.
    pub async fn run(&self, mut stop: StopSignal) -> Result<Vec<RunSummary>> {
        if let Err(e) = self.log().watch_filesystem() {
            warn!(error = %e, "Filesystem notifications unavailable, polling only");
        }

        let (halt, signal) = stop_channel();
        let forward = {
            let halt = halt.clone();
            tokio::spawn(async move {
                stop.stopped().await;
                halt.stop();
            })
        };

        let mut tasks = Vec::new();
        for Stage {
            consumer_id,
            mut handler,
        } in self.stages()
        {
            let dispatcher = self.dispatcher.clone();
            let signal = signal.clone();
            let halt = halt.clone();
            tasks.push(tokio::spawn(async move {
                let result = dispatcher.run(consumer_id, handler.as_mut(), signal).await;
                if let Err(e) = &result {
                    error!(consumer = consumer_id, error = %e, "Consumer failed, stopping pipeline");
                    halt.stop();
                }
                result
            }));
        }

        info!(mode = %self.config.pipeline.gate.mode, stages = tasks.len(), "Pipeline running");

        let mut summaries = Vec::new();
        let mut first_error = None;
        for task in tasks {
            match task.await.context("Consumer task panicked")? {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        forward.abort();

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(summaries),
        }
    }

    /// Drain every stage until a full round appends nothing new
    pub async fn drain(&self) -> Result<Vec<RunSummary>> {
        let mut totals: BTreeMap<&'static str, RunSummary> = BTreeMap::new();

        loop {
            let head_before = self.log().head().await?;

            for Stage {
                consumer_id,
                mut handler,
            } in self.stages()
            {
                let summary = self.dispatcher.drain(consumer_id, handler.as_mut()).await?;
                merge(totals.entry(consumer_id).or_default(), summary);
            }

            if self.log().head().await? == head_before {
                break;
            }
        }

        Ok(totals.into_values().collect())
    }
}

fn merge(total: &mut RunSummary, summary: RunSummary) {
    if total.consumer_id.is_empty() {
        total.consumer_id = summary.consumer_id;
        total.start_offset = summary.start_offset;
    }
    total.end_offset = summary.end_offset;
    total.delivered += summary.delivered;
    total.handled += summary.handled;
    total.dead_lettered += summary.dead_lettered;
    total.filtered += summary.filtered;
    total.corrupt += summary.corrupt;
}
