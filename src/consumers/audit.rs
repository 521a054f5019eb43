//! Audit logger: a durable copy of every record plus human-readable views.
//!
//! `audit.jsonl` mirrors the transport one record per line. Its last line
//! tells the logger where it stopped, so a redelivered record is not written
//! twice. Two views are derived from it: the daily log
//! (`<YYYY-MM-DD>_daily_log.md`) and the `task_log.csv` ledger.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{Local, SecondsFormat};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::core::dispatch::{Handler, HandlerError};
use crate::domain::{ApprovalSource, Record, RecordBody, RecordKind};

/// Columns of `task_log.csv`
pub const TASK_LOG_HEADER: [&str; 6] = ["timestamp", "type", "title", "details", "tags", "elapsed_sec"];

/// Consumer writing the audit trail
pub struct AuditLogger {
    dir: PathBuf,
    /// Highest sequence already present in `audit.jsonl`
    last_written: u64,
}

impl AuditLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            last_written: 0,
        }
    }

    pub fn audit_path(&self) -> PathBuf {
        self.dir.join("audit.jsonl")
    }

    pub fn task_log_path(&self) -> PathBuf {
        self.dir.join("task_log.csv")
    }

    /// Daily log file for the local date of a record
    pub fn daily_log_path(&self, record: &Record) -> PathBuf {
        let date = record.timestamp.with_timezone(&Local).format("%Y-%m-%d");
        self.dir.join(format!("{}_daily_log.md", date))
    }

    async fn append(path: &Path, bytes: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;

        file.write_all(bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        file.sync_data()
            .await
            .with_context(|| format!("Failed to sync {}", path.display()))?;
        Ok(())
    }

    async fn write(&mut self, record: &Record) -> Result<()> {
        let mut json = serde_json::to_vec(record).context("Failed to serialize record")?;
        json.push(b'\n');
        Self::append(&self.audit_path(), &json).await?;
        self.last_written = record.seq;

        // Views follow the mirror, so a retry never writes them twice
        if let Err(e) = self.write_views(record).await {
            warn!(seq = record.seq, error = %e, "Failed to update audit views");
        }
        Ok(())
    }

    async fn write_views(&self, record: &Record) -> Result<()> {
        Self::append(&self.daily_log_path(record), daily_entry(record).as_bytes()).await?;

        let path = self.task_log_path();
        let created = fs::metadata(&path).await.is_err();
        Self::append(&path, &task_log_row(record, created)?).await
    }
}

/// Markdown bullet for the daily log
pub fn daily_entry(record: &Record) -> String {
    let time = record.timestamp.with_timezone(&Local).format("%H:%M:%S");

    let body = match &record.body {
        RecordBody::Utterance(u) => format!("**heard** \"{}\" ({:.2})", u.text, u.confidence),
        RecordBody::Intent(i) if i.human_override => format!("**override** {}", i.describe()),
        RecordBody::Intent(i) => format!("**intent** {} ({:.2})", i.describe(), i.confidence),
        RecordBody::Suggestion(s) => format!("**suggested** {}: {}", s.intent.describe(), s.rationale),
        RecordBody::Action(a) => format!("**approved** {}", a.intent.describe()),
        RecordBody::ActionResult(r) => {
            let mut line = format!("**{}** by {} in {} ms", r.status.as_str(), r.consumer, r.duration_ms);
            if let Some(dl) = &r.dead_letter {
                line.push_str(&format!(", dead letter for #{} after {} attempts", dl.seq, dl.attempts));
            }
            if let Some(error) = &r.error {
                line.push_str(&format!("\n  {}", error));
            }
            line
        }
    };

    format!("- {} #{} {}\n", time, record.seq, body)
}

/// One `task_log.csv` row, preceded by the header for a new file
pub fn task_log_row(record: &Record, with_header: bool) -> Result<Vec<u8>> {
    let (title, details, tags, elapsed) = match &record.body {
        RecordBody::Utterance(u) => (
            u.text.clone(),
            format!("confidence {:.2}", u.confidence),
            vec!["heard"],
            String::new(),
        ),
        RecordBody::Intent(i) => (
            i.action_type.to_string(),
            i.describe(),
            if i.human_override { vec!["override"] } else { vec![] },
            String::new(),
        ),
        RecordBody::Suggestion(s) => (
            s.intent.action_type.to_string(),
            s.rationale.clone(),
            vec![s.reason.as_str()],
            String::new(),
        ),
        RecordBody::Action(a) => (
            a.intent.action_type.to_string(),
            a.intent.describe(),
            vec![match a.approval {
                ApprovalSource::Policy => "policy",
                ApprovalSource::HumanOverride => "human_override",
            }],
            String::new(),
        ),
        RecordBody::ActionResult(r) => {
            let mut tags = vec![r.status.as_str()];
            if r.dead_letter.is_some() {
                tags.push("dead_letter");
            }
            let details = r.error.clone().or_else(|| r.output.clone()).unwrap_or_default();
            (
                r.consumer.clone(),
                details,
                tags,
                format!("{:.3}", r.duration_ms as f64 / 1000.0),
            )
        }
    };

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    if with_header {
        writer.write_record(TASK_LOG_HEADER).context("Failed to encode task log header")?;
    }
    writer
        .write_record([
            record.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            record.kind().as_str().to_string(),
            title,
            details,
            tags.join("|"),
            elapsed,
        ])
        .context("Failed to encode task log row")?;
    writer
        .into_inner()
        .map_err(|e| anyhow!("Failed to encode task log row: {}", e.error()))
}

#[async_trait]
impl Handler for AuditLogger {
    fn accepts(&self, _kind: RecordKind) -> bool {
        true
    }

    async fn prepare(&mut self) -> Result<(), HandlerError> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create audit directory: {}", self.dir.display()))?;

        let content = match fs::read_to_string(self.audit_path()).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(anyhow::Error::from(e).context("Failed to read audit log").into()),
        };

        self.last_written = content
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str::<Record>(line).ok())
            .map(|r| r.seq)
            .unwrap_or(0);

        debug!(last_written = self.last_written, "Audit logger resumed");
        Ok(())
    }

    async fn handle(&mut self, record: &Record) -> Result<(), HandlerError> {
        if record.seq <= self.last_written {
            warn!(seq = record.seq, "Record already audited, skipping");
            return Ok(());
        }
        self.write(record).await?;
        Ok(())
    }
}
