//! Structured intents produced by the resolver.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Dotted, open-vocabulary action tag (e.g. `calendar.add`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionType(String);

impl ActionType {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionType {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// A single intent parameter value.
///
/// Variant order matters for untagged deserialization: booleans and
/// integers must be tried before floats and strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for ParamValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

/// Parameters keyed by name, ordered so serialization is deterministic
pub type Params = BTreeMap<String, ParamValue>;

/// Payload of an `intent` record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub action_type: ActionType,

    #[serde(default)]
    pub params: Params,

    /// Resolver confidence in [0, 1]
    pub confidence: f64,

    /// Utterance this intent was resolved from
    pub utterance_id: String,

    /// Set when a human explicitly approved a prior suggestion
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub human_override: bool,
}

impl Intent {
    pub fn new(action_type: impl Into<ActionType>, confidence: f64, utterance_id: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            params: Params::new(),
            confidence,
            utterance_id: utterance_id.into(),
            human_override: false,
        }
    }

    /// Add a parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Short human-readable rendering: `calendar.add(time=Friday 3pm, title=...)`
    pub fn describe(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("{}({})", self.action_type, params.join(", "))
    }
}
