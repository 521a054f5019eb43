//! Generic consumer framework over the record log.
//!
//! Each consumer reads the log from its own durable offset, delivers records
//! to a [`Handler`] in sequence order, retries failures with exponential
//! backoff and dead-letters records that exhaust the retry budget.
//! Delivery is at-least-once: a crash between handling and the offset commit
//! redelivers the record, so handlers must be idempotent.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{ActionResult, ActionStatus, DeadLetter, PendingRecord, Record, RecordBody, RecordKind};

use super::gate::PolicyViolation;
use super::offsets::{OffsetError, OffsetStore};
use super::transport::{ReadMode, RecordLog, TransportError};

/// Errors a handler can report for a single delivery
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Processing failed; retried with backoff, then dead-lettered
    #[error(transparent)]
    Failed(#[from] anyhow::Error),

    /// The transport could not be written; stops the consumer
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A safety invariant was breached; stops the consumer
    #[error(transparent)]
    PolicyViolation(#[from] PolicyViolation),
}

impl HandlerError {
    /// Fatal errors stop the consumer without advancing its offset
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Errors that stop a consumer
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Offset(#[from] OffsetError),

    #[error("consumer {consumer} stopped at sequence {seq}: {source}")]
    Handler {
        consumer: String,
        seq: u64,
        #[source]
        source: HandlerError,
    },
}

/// A concrete consumer's processing logic
#[async_trait]
pub trait Handler: Send {
    /// Record kinds this handler wants; other records advance the offset
    /// without being delivered
    fn accepts(&self, kind: RecordKind) -> bool;

    /// Called once before the first delivery of a run
    async fn prepare(&mut self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Process one record. Must be idempotent.
    async fn handle(&mut self, record: &Record) -> Result<(), HandlerError>;
}

/// Retry policy for failed deliveries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    10_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay after a failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Sender half used to stop consumers between deliveries
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn stop(&self) {
        // No receivers left simply means nothing is running
        let _ = self.tx.send(true);
    }
}

/// Receiver half observed by consumers
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once stop has been requested
    pub async fn stopped(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                // Sender gone without stopping: never fires
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a connected stop handle and signal
pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}

/// What a consumer run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub consumer_id: String,

    /// Offset the run resumed from
    pub start_offset: u64,

    /// Offset durably committed when the run ended
    pub end_offset: u64,

    /// Records handed to the handler
    pub delivered: u64,

    /// Deliveries that eventually succeeded
    pub handled: u64,

    /// Deliveries that exhausted the retry budget
    pub dead_lettered: u64,

    /// Records of kinds the handler does not accept
    pub filtered: u64,

    /// Corrupt records skipped
    pub corrupt: u64,
}

enum Delivery {
    Handled,
    DeadLettered,
    Interrupted,
}

/// Runs handlers against the log with durable offsets
#[derive(Clone)]
pub struct Dispatcher {
    log: RecordLog,
    offsets: OffsetStore,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(log: RecordLog, offsets: OffsetStore, retry: RetryPolicy) -> Self {
        Self { log, offsets, retry }
    }

    pub fn log(&self) -> &RecordLog {
        &self.log
    }

    pub fn offsets(&self) -> &OffsetStore {
        &self.offsets
    }

    /// Follow the log until stopped
    pub async fn run(
        &self,
        consumer_id: &str,
        handler: &mut dyn Handler,
        stop: StopSignal,
    ) -> Result<RunSummary, DispatchError> {
        self.consume(consumer_id, handler, ReadMode::Follow, stop).await
    }

    /// Process everything up to the current head, then return
    pub async fn drain(&self, consumer_id: &str, handler: &mut dyn Handler) -> Result<RunSummary, DispatchError> {
        self.consume(consumer_id, handler, ReadMode::Snapshot, StopSignal::never())
            .await
    }

    #[instrument(skip(self, handler, stop), fields(consumer = consumer_id))]
    async fn consume(
        &self,
        consumer_id: &str,
        handler: &mut dyn Handler,
        mode: ReadMode,
        mut stop: StopSignal,
    ) -> Result<RunSummary, DispatchError> {
        let start = self.offsets.register(consumer_id).await?;
        let mut summary = RunSummary {
            consumer_id: consumer_id.to_string(),
            start_offset: start,
            end_offset: start,
            ..Default::default()
        };

        handler.prepare().await.map_err(|source| DispatchError::Handler {
            consumer: consumer_id.to_string(),
            seq: start,
            source,
        })?;

        let mut reader = self.log.read_from(consumer_id, start, mode).await?;
        // Highest sequence passed over without delivery, not yet committed
        let mut uncommitted: Option<u64> = None;

        info!(offset = start, ?mode, "Consumer started");

        loop {
            if stop.is_stopped() {
                break;
            }

            match reader.try_next().await {
                Ok(Some(record)) => {
                    let seq = record.seq;

                    if !handler.accepts(record.kind()) {
                        summary.filtered += 1;
                        uncommitted = Some(seq);
                        continue;
                    }

                    summary.delivered += 1;
                    let delivery = match self.deliver(consumer_id, handler, &record, &mut stop).await {
                        Ok(delivery) => delivery,
                        Err(e) => {
                            self.flush(consumer_id, &mut uncommitted, &mut summary).await?;
                            return Err(e);
                        }
                    };

                    match delivery {
                        Delivery::Handled => summary.handled += 1,
                        Delivery::DeadLettered => summary.dead_lettered += 1,
                        Delivery::Interrupted => break,
                    }

                    self.offsets.commit(consumer_id, seq).await?;
                    uncommitted = None;
                    summary.end_offset = seq;
                }
                Ok(None) => {
                    self.flush(consumer_id, &mut uncommitted, &mut summary).await?;
                    if mode == ReadMode::Snapshot {
                        break;
                    }
                    tokio::select! {
                        _ = reader.wait() => {}
                        _ = stop.stopped() => {}
                    }
                }
                Err(TransportError::CorruptRecord { seq, .. }) => {
                    summary.corrupt += 1;
                    uncommitted = Some(seq);
                }
                Err(e) => {
                    self.flush(consumer_id, &mut uncommitted, &mut summary).await?;
                    error!(error = %e, "Transport failure, stopping consumer");
                    return Err(e.into());
                }
            }
        }

        self.flush(consumer_id, &mut uncommitted, &mut summary).await?;
        info!(
            offset = summary.end_offset,
            delivered = summary.delivered,
            dead_lettered = summary.dead_lettered,
            "Consumer stopped"
        );
        Ok(summary)
    }

    async fn flush(
        &self,
        consumer_id: &str,
        uncommitted: &mut Option<u64>,
        summary: &mut RunSummary,
    ) -> Result<(), DispatchError> {
        if let Some(seq) = uncommitted.take() {
            self.offsets.commit(consumer_id, seq).await?;
            summary.end_offset = seq;
        }
        Ok(())
    }

    /// Deliver one record with retries; dead-letter on exhaustion
    async fn deliver(
        &self,
        consumer_id: &str,
        handler: &mut dyn Handler,
        record: &Record,
        stop: &mut StopSignal,
    ) -> Result<Delivery, DispatchError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let error = match handler.handle(record).await {
                Ok(()) => {
                    debug!(seq = record.seq, attempt, "Record handled");
                    return Ok(Delivery::Handled);
                }
                Err(e) if e.is_fatal() => {
                    error!(seq = record.seq, error = %e, "Fatal handler error");
                    return Err(DispatchError::Handler {
                        consumer: consumer_id.to_string(),
                        seq: record.seq,
                        source: e,
                    });
                }
                Err(e) => e,
            };

            if self.retry.should_retry(attempt) {
                let delay = self.retry.delay_for_attempt(attempt);
                warn!(
                    seq = record.seq,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Handler failed, retrying"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = stop.stopped() => return Ok(Delivery::Interrupted),
                }
            }

            error!(seq = record.seq, attempt, error = %error, "Handler failed permanently");
            self.dead_letter(consumer_id, record, attempt, &error).await?;
            return Ok(Delivery::DeadLettered);
        }
    }

    async fn dead_letter(
        &self,
        consumer_id: &str,
        record: &Record,
        attempts: u32,
        error: &HandlerError,
    ) -> Result<(), DispatchError> {
        // Never dead-letter a dead-letter: a consumer that chokes on these
        // would otherwise feed itself forever
        if let RecordBody::ActionResult(ActionResult { dead_letter: Some(_), .. }) = &record.body {
            warn!(seq = record.seq, "Dropping failed dead-letter record without re-recording it");
            return Ok(());
        }

        let mut result = ActionResult::new(ActionStatus::Failed, consumer_id).with_error(format!("{:#}", error));
        result.dead_letter = Some(DeadLetter {
            consumer: consumer_id.to_string(),
            seq: record.seq,
            attempts,
        });

        let pending = PendingRecord::new(RecordBody::ActionResult(result)).correlated_with(record.id);
        let seq = self.log.append(pending).await?;
        warn!(seq = record.seq, dead_letter_seq = seq, "Record dead-lettered");
        Ok(())
    }

    /// Dead-letter records written for a consumer (or all consumers)
    pub async fn dead_letters(&self, consumer_id: Option<&str>) -> Result<Vec<Record>, TransportError> {
        let records = self.log.snapshot().await?;
        Ok(records
            .into_iter()
            .filter(|r| match &r.body {
                RecordBody::ActionResult(ActionResult { dead_letter: Some(dl), .. }) => {
                    consumer_id.map(|c| c == dl.consumer).unwrap_or(true)
                }
                _ => false,
            })
            .collect())
    }
}
