//! Ollama-backed intent resolver.
//!
//! Endpoint: POST /api/generate (non-streaming)
//!
//! Sampling is pinned (temperature 0, fixed seed) so the same utterance
//! resolves the same way on every replay.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::resolver::{Resolution, Resolver};
use crate::domain::{Intent, ParamValue, Utterance};

const SEED: u64 = 42;

const PROMPT: &str = r#"You are Wodehouse, a polite and helpful personal assistant.

Given a transcript of something the user said, decide which single action they want:
- "calendar.add": create an appointment. params: "title", "time"
- "reminder.create": set a reminder. params: "task", optional "time"
- "note.create": log a journal entry or personal note. params: "text"
- "habit.log": track a habit or daily activity. params: "activity"
- "script.run": run one of the user's scripts. params: "script"
- "none": none of the above

Respond with only a JSON object of the form:
{"action_type": "calendar.add", "params": {"title": "short summary", "time": "Friday 3pm"}}
"#;

/// Resolver that asks a local Ollama model
pub struct OllamaResolver {
    endpoint: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f64,
    seed: u64,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl OllamaResolver {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    fn build_prompt(text: &str) -> String {
        format!(
            "{}\nTranscript: \"{}\"\nRespond with only the JSON output.",
            PROMPT, text
        )
    }
}

#[async_trait]
impl Resolver for OllamaResolver {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn resolve(&self, utterance: &Utterance) -> Result<Resolution> {
        if utterance.text.trim().is_empty() {
            return Ok(Resolution::unresolved("empty utterance"));
        }

        let request = GenerateRequest {
            model: &self.model,
            prompt: Self::build_prompt(&utterance.text),
            stream: false,
            options: GenerateOptions {
                temperature: 0.0,
                seed: SEED,
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to reach Ollama at {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama error ({}): {}", status, text);
        }

        let body: GenerateResponse = response
            .json()
            .await
            .context("Ollama returned an unexpected body")?;
        debug!(model = %self.model, raw = %body.response, "Model replied");

        Ok(interpret_reply(&body.response, utterance))
    }
}

/// Turn a model reply into a resolution
pub fn interpret_reply(reply: &str, utterance: &Utterance) -> Resolution {
    let Some(block) = extract_json_block(reply) else {
        warn!("No JSON object in model reply");
        return Resolution::unresolved("model reply had no JSON object");
    };

    let value: Value = match serde_json::from_str(block) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Model reply was not valid JSON");
            return Resolution::unresolved("model reply was not valid JSON");
        }
    };

    let action_type = value
        .get("action_type")
        .or_else(|| value.get("type"))
        .and_then(Value::as_str)
        .map(normalize_action_type);

    let Some(action_type) = action_type else {
        return Resolution::unresolved("model reply had no action type");
    };
    if action_type == "none" {
        return Resolution::unresolved("model found no action");
    }

    let mut intent = Intent::new(
        action_type,
        utterance.confidence.clamp(0.0, 1.0),
        utterance.utterance_id.clone(),
    );

    if let Some(params) = value.get("params").and_then(Value::as_object) {
        for (key, raw) in params {
            if let Some(param) = to_param(raw) {
                intent = intent.with_param(key.clone(), param);
            }
        }
    }

    Resolution::Resolved(intent)
}

/// Legacy short names some models still answer with
fn normalize_action_type(raw: &str) -> &str {
    match raw {
        "appointment" | "calendar" => "calendar.add",
        "reminder" | "task" => "reminder.create",
        "journal" | "note" => "note.create",
        "habit" => "habit.log",
        other => other,
    }
}

fn to_param(value: &Value) -> Option<ParamValue> {
    match value {
        Value::Bool(b) => Some(ParamValue::Bool(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(ParamValue::Integer)
            .or_else(|| n.as_f64().map(ParamValue::Float)),
        Value::String(s) => Some(ParamValue::Text(s.clone())),
        Value::Null => None,
        other => Some(ParamValue::Text(other.to_string())),
    }
}

/// Outermost `{ ... }` span of a reply, ignoring any chatter around it
pub fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_block() {
        assert_eq!(
            extract_json_block("Sure! {\"a\": {\"b\": 1}} hope that helps"),
            Some("{\"a\": {\"b\": 1}}")
        );
        assert_eq!(extract_json_block("no json here"), None);
        assert_eq!(extract_json_block("} backwards {"), None);
    }

    #[test]
    fn test_interpret_reply() {
        let utterance = Utterance::new("add meeting with Joanna Friday 3pm", 0.9);
        let reply = r#"Here you go:
{"action_type": "calendar.add", "params": {"title": "meeting with Joanna", "time": "Friday 3pm"}}"#;

        match interpret_reply(reply, &utterance) {
            Resolution::Resolved(intent) => {
                assert_eq!(intent.action_type.as_str(), "calendar.add");
                assert_eq!(intent.params["title"], ParamValue::from("meeting with Joanna"));
                assert_eq!(intent.confidence, 0.9);
                assert_eq!(intent.utterance_id, utterance.utterance_id);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_legacy_type_and_none() {
        let utterance = Utterance::new("x", 0.9);

        match interpret_reply(r#"{"type": "journal", "params": {"text": "hi"}}"#, &utterance) {
            Resolution::Resolved(intent) => assert_eq!(intent.action_type.as_str(), "note.create"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            interpret_reply(r#"{"action_type": "none"}"#, &utterance),
            Resolution::Unresolved { .. }
        ));
        assert!(matches!(
            interpret_reply("I could not parse that", &utterance),
            Resolution::Unresolved { .. }
        ));
    }

    #[test]
    fn test_prompt_is_stable() {
        assert_eq!(
            OllamaResolver::build_prompt("hello"),
            OllamaResolver::build_prompt("hello")
        );
    }
}
