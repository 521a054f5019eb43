//! Recognized speech handed over by the capture collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Payload of an `utterance` record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    /// Identifier from the recognizer (dedup key)
    pub utterance_id: String,

    /// Recognized text
    pub text: String,

    /// Recognizer confidence in [0, 1]
    pub confidence: f64,

    /// When the speech was captured
    pub captured_at: DateTime<Utc>,
}

impl Utterance {
    /// Create an utterance captured now, with a derived id
    pub fn new(text: impl Into<String>, confidence: f64) -> Self {
        let text = text.into();
        let captured_at = Utc::now();
        Self {
            utterance_id: derive_utterance_id(&text, captured_at),
            text,
            confidence,
            captured_at,
        }
    }

    /// Override the derived id with the recognizer's own
    pub fn with_id(mut self, utterance_id: impl Into<String>) -> Self {
        self.utterance_id = utterance_id.into();
        self
    }
}

/// Derive a stable utterance id from text and capture time (16 hex chars)
pub fn derive_utterance_id(text: &str, captured_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(captured_at.to_rfc3339().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_id_is_stable() {
        let at = Utc::now();
        let a = derive_utterance_id("note buy milk", at);
        let b = derive_utterance_id("note buy milk", at);
        let c = derive_utterance_id("note buy eggs", at);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_recognizer_id_wins() {
        let utterance = Utterance::new("hello", 0.5).with_id("clip_20250101_120000");
        assert_eq!(utterance.utterance_id, "clip_20250101_120000");
    }
}
