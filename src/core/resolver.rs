//! Intent resolution: recognized text in, zero or one structured intent out.
//!
//! Resolution is pluggable through the [`Resolver`] trait. The built-in
//! [`RuleResolver`] matches a handful of phrase shapes; a model-backed
//! resolver lives in `adapters::ollama`. Either way the result must be
//! deterministic for identical input, so the pipeline stays testable.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::domain::{Intent, PendingRecord, Record, RecordBody, RecordKind, Utterance};

use super::dispatch::{Handler, HandlerError};
use super::transport::RecordLog;

/// Outcome of resolving one utterance
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(Intent),

    /// Nothing sensible to do; acknowledged without producing an intent
    Unresolved { reason: String },
}

impl Resolution {
    pub fn unresolved(reason: impl Into<String>) -> Self {
        Self::Unresolved {
            reason: reason.into(),
        }
    }
}

/// Trait for resolution backends
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Interpret an utterance. Errors are transient (retried); an
    /// uninterpretable utterance is `Ok(Resolution::Unresolved)`.
    async fn resolve(&self, utterance: &Utterance) -> Result<Resolution>;
}

/// Which resolver backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverBackend {
    Rules,
    Ollama,
}

/// Resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverSettings {
    #[serde(default = "default_backend")]
    pub backend: ResolverBackend,

    /// Utterances the recognizer itself doubts are dropped (default: 0.2)
    #[serde(default = "default_min_utterance_confidence")]
    pub min_utterance_confidence: f64,

    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    #[serde(default = "default_ollama_model")]
    pub ollama_model: String,
}

fn default_backend() -> ResolverBackend {
    ResolverBackend::Rules
}
fn default_min_utterance_confidence() -> f64 {
    0.2
}
fn default_ollama_url() -> String {
    "http://localhost:11434/api/generate".to_string()
}
fn default_ollama_model() -> String {
    "phi3".to_string()
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            min_utterance_confidence: default_min_utterance_confidence(),
            ollama_url: default_ollama_url(),
            ollama_model: default_ollama_model(),
        }
    }
}

// ============================================================================
// Rule-based resolver
// ============================================================================

/// Phrase-shape resolver. No state, fully deterministic.
#[derive(Debug, Default, Clone)]
pub struct RuleResolver;

impl RuleResolver {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous core of [`Resolver::resolve`]
    pub fn interpret(&self, utterance: &Utterance) -> Resolution {
        let words = Words::new(&utterance.text);
        if words.is_empty() {
            return Resolution::unresolved("empty utterance");
        }

        let confidence = utterance.confidence.clamp(0.0, 1.0);
        let intent = |action_type: &str| Intent::new(action_type, confidence, utterance.utterance_id.clone());

        if let Some(rest) = words.after_prefix(&["remind", "me", "to"]) {
            let (task, time) = split_time(rest);
            if task.is_empty() {
                return Resolution::unresolved("reminder without a task");
            }
            let mut resolved = intent("reminder.create").with_param("task", join(task));
            if !time.is_empty() {
                resolved = resolved.with_param("time", join(time));
            }
            return Resolution::Resolved(resolved);
        }

        for verb in ["add", "schedule", "book"] {
            if let Some(rest) = words.after_prefix(&[verb]) {
                let (title, time) = split_time(rest);
                let title = strip_article(title);
                if !title.is_empty() && !time.is_empty() {
                    return Resolution::Resolved(
                        intent("calendar.add")
                            .with_param("title", join(title))
                            .with_param("time", join(time)),
                    );
                }
            }
        }

        let note_prefixes: [&[&str]; 4] = [&["take", "a", "note"], &["write", "down"], &["note"], &["journal"]];
        for prefix in note_prefixes {
            if let Some(rest) = words.after_prefix(prefix) {
                let rest = strip_leading(rest, &["that", "to"]);
                if rest.is_empty() {
                    return Resolution::unresolved("note without text");
                }
                return Resolution::Resolved(intent("note.create").with_param("text", join(rest)));
            }
        }

        for verb in ["log", "track"] {
            if let Some(rest) = words.after_prefix(&[verb]) {
                if rest.is_empty() {
                    return Resolution::unresolved("habit without an activity");
                }
                return Resolution::Resolved(intent("habit.log").with_param("activity", join(rest)));
            }
        }

        if let Some(rest) = words.after_prefix(&["run"]) {
            let rest = strip_leading(rest, &["the", "my"]);
            let name = match rest.split_last() {
                Some((last, init)) if last.lower == "script" => init,
                _ => rest,
            };
            if name.is_empty() {
                return Resolution::unresolved("run without a script name");
            }
            return Resolution::Resolved(intent("script.run").with_param("script", join(name)));
        }

        Resolution::unresolved("no rule matched")
    }
}

#[async_trait]
impl Resolver for RuleResolver {
    fn name(&self) -> &str {
        "rules"
    }

    async fn resolve(&self, utterance: &Utterance) -> Result<Resolution> {
        Ok(self.interpret(utterance))
    }
}

/// A token with its original spelling and a normalized form for matching
#[derive(Debug, Clone)]
struct Word {
    original: String,
    lower: String,
}

struct Words(Vec<Word>);

impl Words {
    fn new(text: &str) -> Self {
        let words = text
            .split_whitespace()
            .map(|raw| raw.trim_matches(|c: char| matches!(c, ',' | '.' | '!' | '?' | ';' | ':' | '"')))
            .filter(|w| !w.is_empty())
            .map(|w| Word {
                original: w.to_string(),
                lower: w.to_lowercase(),
            })
            .collect();
        Self(words)
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn after_prefix(&self, prefix: &[&str]) -> Option<&[Word]> {
        if self.0.len() < prefix.len() {
            return None;
        }
        let matches = self.0.iter().zip(prefix).all(|(w, p)| w.lower == *p);
        matches.then(|| &self.0[prefix.len()..])
    }
}

fn join(words: &[Word]) -> String {
    words
        .iter()
        .map(|w| w.original.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_leading<'a>(words: &'a [Word], fillers: &[&str]) -> &'a [Word] {
    match words.first() {
        Some(first) if fillers.contains(&first.lower.as_str()) => &words[1..],
        _ => words,
    }
}

fn strip_article(words: &[Word]) -> &[Word] {
    strip_leading(words, &["a", "an", "the"])
}

const WEEKDAYS: &[&str] = &[
    "monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday", "mon", "tue",
    "tues", "wed", "thu", "thur", "thurs", "fri", "sat", "sun",
];
const RELATIVE_DAYS: &[&str] = &["today", "tomorrow", "tonight", "noon", "midnight"];
const TIME_FILLERS: &[&str] = &[
    "at", "on", "next", "this", "am", "pm", "a.m", "p.m", "morning", "afternoon", "evening",
    "o'clock",
];

/// Split a trailing time expression off the end of a phrase.
///
/// Returns `(body, time)`; `time` is empty unless the trailing run of
/// time-like words contains an anchor (weekday, relative day, or a clock
/// reading). Leading `at`/`on` connectors are dropped from the time.
fn split_time(words: &[Word]) -> (&[Word], &[Word]) {
    let mut start = words.len();
    while start > 0 && is_time_word(words, start - 1) {
        start -= 1;
    }

    let span = &words[start..];
    if !span.iter().any(|w| is_time_anchor(&w.lower)) {
        return (words, &[]);
    }

    let mut time_start = start;
    while time_start < words.len() && matches!(words[time_start].lower.as_str(), "at" | "on") {
        time_start += 1;
    }

    (&words[..start], &words[time_start..])
}

fn is_time_anchor(word: &str) -> bool {
    WEEKDAYS.contains(&word) || RELATIVE_DAYS.contains(&word) || is_clock(word, true)
}

/// A bare number like `9` is only a clock reading next to `at`, `am`/`pm`
/// or `o'clock`; elsewhere it is part of the body (`a table for 4`).
fn is_time_word(words: &[Word], i: usize) -> bool {
    let word = words[i].lower.as_str();
    if is_time_anchor(word) || TIME_FILLERS.contains(&word) {
        return true;
    }
    if !is_clock(word, false) {
        return false;
    }
    let after_at = i > 0 && words[i - 1].lower == "at";
    let before_meridiem = words
        .get(i + 1)
        .is_some_and(|next| matches!(next.lower.as_str(), "am" | "pm" | "a.m" | "p.m" | "o'clock"));
    after_at || before_meridiem
}

/// `3pm`, `10:30`, `9:15am`; bare numbers only when `strict` is false
fn is_clock(word: &str, strict: bool) -> bool {
    let (digits, has_meridiem) = match word.strip_suffix("am").or_else(|| word.strip_suffix("pm")) {
        Some(rest) => (rest, true),
        None => (word, false),
    };

    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (h, Some(m)),
        None => (digits, None),
    };

    let hours_ok = !hours.is_empty() && hours.len() <= 2 && hours.chars().all(|c| c.is_ascii_digit());
    let minutes_ok = minutes
        .map(|m| m.len() == 2 && m.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(true);

    if !(hours_ok && minutes_ok) {
        return false;
    }
    !strict || has_meridiem || minutes.is_some()
}

// ============================================================================
// Resolver stage
// ============================================================================

/// Consumer stage turning utterance records into intent records
pub struct ResolverStage {
    log: RecordLog,
    resolver: Box<dyn Resolver>,
    settings: ResolverSettings,
    /// Utterance ids already answered by an intent in the log
    resolved: HashSet<String>,
}

impl ResolverStage {
    pub fn new(log: RecordLog, resolver: Box<dyn Resolver>, settings: ResolverSettings) -> Self {
        Self {
            log,
            resolver,
            settings,
            resolved: HashSet::new(),
        }
    }

    /// Resolve one utterance record into at most one pending intent record.
    ///
    /// Does not touch the log.
    pub async fn resolve(&self, record: &Record) -> Result<Option<PendingRecord>> {
        let RecordBody::Utterance(utterance) = &record.body else {
            return Ok(None);
        };

        if !(utterance.confidence >= self.settings.min_utterance_confidence) {
            info!(
                utterance_id = %utterance.utterance_id,
                confidence = utterance.confidence,
                "Dropping low-confidence utterance"
            );
            return Ok(None);
        }

        match self.resolver.resolve(utterance).await? {
            Resolution::Resolved(intent) => {
                debug!(action_type = %intent.action_type, "Utterance resolved");
                Ok(Some(
                    PendingRecord::new(RecordBody::Intent(intent)).correlated_with(record.id),
                ))
            }
            Resolution::Unresolved { reason } => {
                info!(utterance_id = %utterance.utterance_id, %reason, "No intent for utterance");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, record), fields(seq = record.seq, resolver = self.resolver.name()))]
    async fn process(&mut self, record: &Record, utterance_id: &str) -> Result<(), HandlerError> {
        if self.resolved.contains(utterance_id) {
            info!(utterance_id, "Utterance already resolved, skipping");
            return Ok(());
        }

        if let Some(pending) = self.resolve(record).await? {
            let seq = self.log.append(pending).await?;
            self.resolved.insert(utterance_id.to_string());
            info!(utterance_id, intent_seq = seq, "Intent recorded");
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for ResolverStage {
    fn accepts(&self, kind: RecordKind) -> bool {
        kind == RecordKind::Utterance
    }

    async fn prepare(&mut self) -> Result<(), HandlerError> {
        for record in self.log.snapshot().await? {
            if let RecordBody::Intent(intent) = &record.body {
                self.resolved.insert(intent.utterance_id.clone());
            }
        }
        Ok(())
    }

    async fn handle(&mut self, record: &Record) -> Result<(), HandlerError> {
        if let RecordBody::Utterance(utterance) = &record.body {
            let utterance_id = utterance.utterance_id.clone();
            self.process(record, &utterance_id).await?;
        }
        Ok(())
    }
}
