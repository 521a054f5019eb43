//! Command-line interface for wodehouse.
//!
//! Provides commands for ingesting utterances, running the pipeline,
//! watching the UI feed, approving suggestions and inspecting the log.

use std::io::{self, BufRead, IsTerminal};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::{self, paths};
use crate::consumers::{UiFeed, UI_FEED};
use crate::core::{stop_channel, Mode, RunSummary, Supervisor};
use crate::domain::{RecordBody, RecordKind, Utterance};

/// wodehouse - Durable intent dispatch for a voice-driven assistant
#[derive(Parser, Debug)]
#[command(name = "wodehouse")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Record an utterance (argument, or JSON lines on stdin)
    Ingest {
        /// Recognized text (reads JSON lines from stdin if not provided)
        text: Option<String>,

        /// Recognizer confidence in [0, 1]
        #[arg(short, long, default_value = "1.0")]
        confidence: f64,

        /// Utterance id (derived from text and capture time if not provided)
        #[arg(long)]
        id: Option<String>,
    },

    /// Run every pipeline stage until Ctrl-C
    Run {
        /// Process what is already in the log, then exit
        #[arg(long)]
        once: bool,
    },

    /// Print suggestions, actions and results as JSON lines
    Feed {
        /// Keep waiting for new records
        #[arg(short, long)]
        follow: bool,
    },

    /// Approve a suggestion by sequence number
    Approve {
        /// Sequence number of the suggestion record
        seq: u64,
    },

    /// List records in the log
    Log {
        /// Only show records of this kind (utterance, intent, suggestion, action, action_result)
        #[arg(short, long)]
        kind: Option<RecordKind>,

        /// Maximum number of records to show (most recent)
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show log head, consumer offsets and dead letters
    Status,

    /// Show resolved configuration (debug)
    Config,
}

/// One utterance as a JSON line on stdin
#[derive(Debug, Deserialize)]
struct IngestLine {
    #[serde(default)]
    utterance_id: Option<String>,
    text: String,
    #[serde(default = "full_confidence")]
    confidence: f64,
    #[serde(default)]
    captured_at: Option<DateTime<Utc>>,
}

fn full_confidence() -> f64 {
    1.0
}

impl IngestLine {
    fn into_utterance(self) -> Utterance {
        let mut utterance = Utterance::new(self.text, self.confidence);
        if let Some(captured_at) = self.captured_at {
            utterance.captured_at = captured_at;
            utterance.utterance_id = crate::domain::derive_utterance_id(&utterance.text, captured_at);
        }
        match self.utterance_id {
            Some(id) => utterance.with_id(id),
            None => utterance,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Ingest {
                text,
                confidence,
                id,
            } => ingest(text, confidence, id).await,
            Commands::Run { once } => run(once).await,
            Commands::Feed { follow } => feed(follow).await,
            Commands::Approve { seq } => approve(seq).await,
            Commands::Log { kind, limit } => show_log(kind, limit).await,
            Commands::Status => show_status().await,
            Commands::Config => show_config().await,
        }
    }
}

async fn open_supervisor() -> Result<Supervisor> {
    let cfg = config::config()?;
    Supervisor::open(cfg.clone()).await
}

/// Record one utterance from the arguments, or many from stdin
async fn ingest(text: Option<String>, confidence: f64, id: Option<String>) -> Result<()> {
    if !(0.0..=1.0).contains(&confidence) {
        anyhow::bail!("Confidence must be within [0, 1], got {}", confidence);
    }

    let supervisor = open_supervisor().await?;

    if let Some(text) = text {
        let mut utterance = Utterance::new(text, confidence);
        if let Some(id) = id {
            utterance = utterance.with_id(id);
        }
        let seq = supervisor.ingest(utterance).await?;
        println!("{}", seq);
        return Ok(());
    }

    if io::stdin().is_terminal() {
        anyhow::bail!("No utterance provided. Pass text as an argument or pipe JSON lines to stdin");
    }

    for (line_no, line) in io::stdin().lock().lines().enumerate() {
        let line = line.context("Failed to read from stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: IngestLine = serde_json::from_str(&line)
            .with_context(|| format!("Invalid utterance on line {}", line_no + 1))?;
        let seq = supervisor.ingest(parsed.into_utterance()).await?;
        println!("{}", seq);
    }

    Ok(())
}

/// Run the pipeline until Ctrl-C (or once over the current log)
async fn run(once: bool) -> Result<()> {
    let supervisor = open_supervisor().await?;

    let summaries = if once {
        supervisor.drain().await?
    } else {
        let (handle, signal) = stop_channel();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, stopping after current deliveries");
                handle.stop();
            }
        });
        supervisor.run(signal).await?
    };

    print_summaries(&summaries);
    Ok(())
}

fn print_summaries(summaries: &[RunSummary]) {
    println!(
        "{:<16} {:>8} {:>10} {:>8} {:>8} {:>8}",
        "CONSUMER", "OFFSET", "DELIVERED", "HANDLED", "DEAD", "CORRUPT"
    );
    println!("{}", "-".repeat(64));
    for s in summaries {
        println!(
            "{:<16} {:>8} {:>10} {:>8} {:>8} {:>8}",
            s.consumer_id, s.end_offset, s.delivered, s.handled, s.dead_lettered, s.corrupt
        );
    }
}

/// Stream the UI feed to stdout
async fn feed(follow: bool) -> Result<()> {
    let supervisor = open_supervisor().await?;
    let mut ui = UiFeed::new(tokio::io::stdout());

    if follow {
        if let Err(e) = supervisor.log().watch_filesystem() {
            warn!(error = %e, "Filesystem notifications unavailable, polling only");
        }
        let (handle, signal) = stop_channel();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                handle.stop();
            }
        });
        supervisor.dispatcher().run(UI_FEED, &mut ui, signal).await?;
    } else {
        supervisor.dispatcher().drain(UI_FEED, &mut ui).await?;
    }

    Ok(())
}

/// Approve a suggestion with a human override
async fn approve(seq: u64) -> Result<()> {
    let supervisor = open_supervisor().await?;
    let override_seq = supervisor.approve(seq).await?;

    println!("Override recorded at sequence {}", override_seq);
    if supervisor.config().pipeline.gate.mode == Mode::Poc {
        eprintln!("Note: mode is poc, so the gate will answer with another suggestion");
    }
    Ok(())
}

/// List recent records
async fn show_log(kind: Option<RecordKind>, limit: usize) -> Result<()> {
    let supervisor = open_supervisor().await?;
    let records = supervisor.log().snapshot().await?;

    let selected: Vec<_> = records
        .iter()
        .filter(|r| kind.map(|k| r.kind() == k).unwrap_or(true))
        .collect();
    let skip = selected.len().saturating_sub(limit);

    if selected.is_empty() {
        println!("No records found");
        return Ok(());
    }

    println!("{:>6}  {:<20} {:<14} {}", "SEQ", "TIME", "KIND", "SUMMARY");
    println!("{}", "-".repeat(80));

    for record in selected.into_iter().skip(skip) {
        let summary = match &record.body {
            RecordBody::Utterance(u) => format!("\"{}\" ({:.2})", u.text, u.confidence),
            RecordBody::Intent(i) => format!("{} ({:.2})", i.describe(), i.confidence),
            RecordBody::Suggestion(s) => s.rationale.clone(),
            RecordBody::Action(a) => format!("{} [{:?}]", a.intent.describe(), a.approval),
            RecordBody::ActionResult(r) => match &r.error {
                Some(error) => format!("{:?}: {}", r.status, error),
                None => format!("{:?} in {} ms", r.status, r.duration_ms),
            },
        };
        println!(
            "{:>6}  {:<20} {:<14} {}",
            record.seq,
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.kind(),
            summary
        );
    }

    Ok(())
}

/// Show head, consumer offsets and dead letters
async fn show_status() -> Result<()> {
    let supervisor = open_supervisor().await?;
    let head = supervisor.log().head().await?;

    println!("Log:   {}", supervisor.log().path().display());
    println!("Head:  {}", head);
    println!("Mode:  {}", supervisor.config().pipeline.gate.mode);
    println!();

    let offsets = supervisor.dispatcher().offsets().list().await?;
    if offsets.is_empty() {
        println!("No consumers registered");
    } else {
        println!("{:<16} {:>8} {:>8}  {}", "CONSUMER", "OFFSET", "LAG", "UPDATED");
        for offset in offsets {
            println!(
                "{:<16} {:>8} {:>8}  {}",
                offset.consumer_id,
                offset.offset,
                head.saturating_sub(offset.offset),
                offset.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    let dead = supervisor.dispatcher().dead_letters(None).await?;
    if !dead.is_empty() {
        println!();
        println!("Dead letters:");
        for record in dead {
            if let RecordBody::ActionResult(result) = &record.body {
                if let Some(dl) = &result.dead_letter {
                    println!(
                        "  #{} {} gave up on #{} after {} attempts: {}",
                        record.seq,
                        dl.consumer,
                        dl.seq,
                        dl.attempts,
                        result.error.as_deref().unwrap_or("")
                    );
                }
            }
        }
    }

    Ok(())
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Wodehouse Configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:    {}", paths::wodehouse_home()?.display());
    println!("  Records: {}", paths::records_log()?.display());
    println!("  Offsets: {}", paths::offsets_dir()?.display());
    println!("  Audit:   {}", paths::audit_dir()?.display());
    println!();
    println!("Pipeline:");
    println!("  Mode:                 {}", cfg.pipeline.gate.mode);
    println!("  Confidence threshold: {}", cfg.pipeline.gate.confidence_threshold);
    println!(
        "  Always confirm:       {}",
        cfg.pipeline.gate.always_confirm_action_types.join(", ")
    );
    println!("  Script timeout:       {}s", cfg.pipeline.script_timeout_seconds);
    println!("  Max retry attempts:   {}", cfg.pipeline.max_retry_attempts);
    println!();
    println!("Resolver:");
    println!("  Backend:        {:?}", cfg.resolver.backend);
    println!("  Min confidence: {}", cfg.resolver.min_utterance_confidence);
    println!();
    println!("Scripts:");
    if cfg.scripts.is_empty() {
        println!("  (none mapped - every action will be skipped)");
    } else {
        for (action_type, script) in &cfg.scripts {
            println!("  {}: {} {}", action_type, script.command, script.args.join(" "));
        }
    }

    Ok(())
}
