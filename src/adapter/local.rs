use std::sync::Arc;

use async_trait::async_trait;

use crate::adapter::{CallError, Worker, WorkerHandler};
use crate::contract::{
    decode, encode, CodecError, TransportMode, ValidationError, WorkerCallRequest, WorkerReply,
};

/// Invokes an in-process handler. The request and reply still go through
/// the wire codec so local and remote workers see and return identical data.
pub struct LocalWorker {
    handler: Arc<dyn WorkerHandler>,
}

impl LocalWorker {
    pub fn new(handler: Arc<dyn WorkerHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl Worker for LocalWorker {
    fn transport(&self) -> TransportMode {
        TransportMode::Local
    }

    async fn call(&self, request: &WorkerCallRequest) -> Result<WorkerReply, CallError> {
        let wire = encode(request).map_err(request_error)?;
        let request: WorkerCallRequest = decode(&wire).map_err(request_error)?;

        let reply = self.handler.handle(request).await?;

        let wire = encode(&reply).map_err(reply_error)?;
        decode(&wire).map_err(reply_error)
    }
}

pub(crate) fn request_error(e: CodecError) -> CallError {
    match e {
        CodecError::Invalid(v) => CallError::Validation(v),
        CodecError::Malformed(e) => CallError::Validation(ValidationError::new("request", e.to_string())),
    }
}

pub(crate) fn reply_error(e: CodecError) -> CallError {
    CallError::ContractMismatch {
        expected: "worker reply".to_string(),
        found: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::handler_fn;
    use crate::contract::{CallStatus, Payload, QaVerdict, StageName};
    use crate::testing;

    #[tokio::test]
    async fn test_handler_sees_decoded_copy_of_request() {
        let handler = handler_fn(|req: WorkerCallRequest| async move {
            assert_eq!(req.worker_role, "qa");
            assert_eq!(req.stage, StageName::Qa);
            Ok(WorkerReply::ok(testing::qa_verdict(true)))
        });
        let worker = LocalWorker::new(handler);

        let reply = worker
            .call(&testing::call_request("qa", StageName::Qa))
            .await
            .unwrap();

        assert_eq!(reply.status, CallStatus::Ok);
        assert_eq!(worker.transport(), TransportMode::Local);
    }

    #[tokio::test]
    async fn test_invalid_reply_is_a_contract_mismatch() {
        let handler = handler_fn(|_req| async {
            Ok(WorkerReply::ok(Payload::QaVerdict(QaVerdict {
                passed: true,
                findings: vec![],
                confidence: 7.0,
            })))
        });
        let worker = LocalWorker::new(handler);

        let err = worker
            .call(&testing::call_request("qa", StageName::Qa))
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::ContractMismatch { .. }));
    }

    #[tokio::test]
    async fn test_handler_errors_propagate() {
        let handler = handler_fn(|_req| async {
            Err(CallError::transport(
                crate::adapter::TransportFailure::Network,
                "model backend unreachable",
            ))
        });
        let worker = LocalWorker::new(handler);

        let err = worker
            .call(&testing::call_request("qa", StageName::Qa))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::contract::ErrorKind::Transport);
    }
}
