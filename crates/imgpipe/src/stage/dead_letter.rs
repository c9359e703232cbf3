use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::error::EnvelopeError;

/// What a stage parks on the dead-letter queue instead of silently dropping
/// a rejected message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub stage: String,
    pub reason: String,
    pub rejected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
    /// Raw body, kept only when it could not be parsed as an envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl DeadLetter {
    pub fn new(stage: &str, reason: impl Into<String>, envelope: Option<Envelope>, raw: &[u8]) -> Self {
        let body = match envelope {
            Some(_) => None,
            None => Some(String::from_utf8_lossy(raw).into_owned()),
        };
        Self {
            stage: stage.to_string(),
            reason: reason.into(),
            rejected_at: Utc::now(),
            envelope,
            body,
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unparseable_body_is_kept_raw() {
        let letter = DeadLetter::new("resize", "bad json", None, b"{oops");
        assert_eq!(letter.body.as_deref(), Some("{oops"));
        assert!(letter.envelope.is_none());
    }

    #[test]
    fn test_parsed_envelope_replaces_body() {
        let envelope = Envelope::new("a.png", "uploads/a.png");
        let letter = DeadLetter::new("blur", "decode failed", Some(envelope.clone()), b"ignored");

        let parsed = DeadLetter::from_slice(&letter.to_vec().unwrap()).unwrap();
        assert_eq!(parsed.envelope, Some(envelope));
        assert!(parsed.body.is_none());
        assert_eq!(parsed.stage, "blur");
    }
}
