//! Typed shapes exchanged between the orchestrator and its workers.
//!
//! Every contract rejects unknown fields on decode and is validated both
//! before it is encoded and after it is decoded, so a value that crosses a
//! transport boundary is always well-formed.

pub mod artifacts;
pub mod envelope;
pub mod outcome;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use artifacts::*;
pub use envelope::*;
pub use outcome::*;

/// Upper bound for `max_issues`, independent of configured guardrails.
pub const MAX_ISSUES_LIMIT: u32 = 100;
pub const DEFAULT_MAX_ISSUES: u32 = 5;
pub const MAX_TITLE_LEN: usize = 256;

/// A required field is missing or holds an invalid value.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("invalid field `{field}`: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Prefix the field path, e.g. `title` -> `issues[3].title`.
    pub fn within(self, parent: impl std::fmt::Display) -> Self {
        Self {
            field: format!("{parent}.{}", self.field),
            reason: self.reason,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed contract: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// A validated, serializable contract shape.
pub trait Contract: Serialize + DeserializeOwned {
    fn validate(&self) -> Result<(), ValidationError>;
}

/// Validate and serialize a contract to its on-wire JSON form.
pub fn encode<T: Contract>(value: &T) -> Result<Vec<u8>, CodecError> {
    value.validate()?;
    Ok(serde_json::to_vec(value)?)
}

/// Deserialize a contract from its on-wire form and validate it.
pub fn decode<T: Contract>(bytes: &[u8]) -> Result<T, CodecError> {
    let value: T = serde_json::from_slice(bytes)?;
    value.validate()?;
    Ok(value)
}

pub(crate) fn require_text(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    Ok(())
}

pub(crate) fn validate_each<T>(
    field: &str,
    items: &[T],
    check: impl Fn(&T) -> Result<(), ValidationError>,
) -> Result<(), ValidationError> {
    for (index, item) in items.iter().enumerate() {
        check(item).map_err(|e| e.within(format!("{field}[{index}]")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_unknown_fields() {
        let raw = br#"{"severity":"high","message":"x","extra":true}"#;
        let result = decode::<Finding>(raw);
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_decode_runs_validation() {
        let raw = br#"{"title":"  ","body":"b","labels":[],"severity":"low"}"#;
        let err = decode::<IssueSpec>(raw).unwrap_err();
        match err {
            CodecError::Invalid(e) => assert_eq!(e.field, "title"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_encode_refuses_invalid_value() {
        let verdict = QaVerdict {
            passed: true,
            findings: vec![],
            confidence: 1.5,
        };
        assert!(matches!(encode(&verdict), Err(CodecError::Invalid(_))));
    }

    #[test]
    fn test_nested_field_path() {
        let batch = IssueBatch {
            issues: vec![
                IssueSpec::new("ok", "body", vec![], Severity::Low).unwrap(),
                IssueSpec {
                    title: String::new(),
                    body: "body".into(),
                    labels: vec![],
                    severity: Severity::Low,
                },
            ],
        };
        let err = batch.validate().unwrap_err();
        assert_eq!(err.field, "issues[1].title");
    }

    #[test]
    fn test_payload_round_trip_preserves_variant() {
        let payload = Payload::FixPlan(FixPlan {
            steps: vec![FixStep::new("src/lib.rs:10-20", "guard against empty input").unwrap()],
        });
        let bytes = encode(&payload).unwrap();
        let back: Payload = decode(&bytes).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.kind(), PayloadKind::FixPlan);
    }

    #[test]
    fn test_payload_rejects_unknown_kind() {
        let raw = br#"{"kind":"poem","body":{}}"#;
        assert!(decode::<Payload>(raw).is_err());
    }
}
