use std::sync::Arc;

use async_trait::async_trait;

use crate::adapter::{CallError, TransportFailure, WorkerHandler};
use crate::agent::claude::LanguageModel;
use crate::agent::prompt::{system_prompt, user_prompt};
use crate::contract::{decode, Payload, WorkerCallRequest, WorkerReply};
use crate::error::AppError;

/// Worker handler that asks a language model for the stage's contract.
pub struct ModelHandler {
    model: Arc<dyn LanguageModel>,
}

impl ModelHandler {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl WorkerHandler for ModelHandler {
    async fn handle(&self, request: WorkerCallRequest) -> Result<WorkerReply, CallError> {
        let system = system_prompt(request.stage);
        let user = user_prompt(&request).map_err(model_error)?;

        let text = self
            .model
            .complete(&system, &user)
            .await
            .map_err(model_error)?;

        let payload = parse_payload(&request, &text)?;
        Ok(WorkerReply::ok(payload))
    }
}

fn model_error(e: AppError) -> CallError {
    match e {
        AppError::ClaudeRateLimited(message) => {
            CallError::transport(TransportFailure::Unavailable(429), message)
        }
        AppError::ClaudeTransient(message) => {
            CallError::transport(TransportFailure::Unavailable(503), message)
        }
        AppError::Http(e) => CallError::transport(TransportFailure::Network, e.to_string()),
        other => CallError::transport(TransportFailure::Rejected(0), other.to_string()),
    }
}

/// Pull the first JSON object out of model output, tolerating code fences
/// and surrounding prose.
fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_payload(request: &WorkerCallRequest, text: &str) -> Result<Payload, CallError> {
    let expected = request.stage.expected_kind();
    let mismatch = |found: String| CallError::ContractMismatch {
        expected: expected.to_string(),
        found,
    };

    let object = extract_object(text).ok_or_else(|| mismatch("no JSON object in model output".to_string()))?;
    let body: serde_json::Value =
        serde_json::from_str(object).map_err(|e| mismatch(format!("invalid JSON: {e}")))?;

    let envelope = serde_json::json!({ "kind": expected, "body": body });
    let bytes = serde_json::to_vec(&envelope).map_err(|e| mismatch(e.to_string()))?;
    decode::<Payload>(&bytes).map_err(|e| mismatch(e.to_string()))
}
