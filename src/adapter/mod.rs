pub mod local;
pub mod remote;
pub mod retry;
pub mod signature;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::clock::{elapsed_ms, Clock};
use crate::contract::{
    CallStatus, Contract, ErrorKind, TransportMode, ValidationError, WorkerCallRequest,
    WorkerCallResult, WorkerReply,
};
use crate::registry::{RegisteredWorker, UnknownWorkerError};

pub use local::LocalWorker;
pub use remote::{RemoteEndpoint, RemoteWorker};
pub use retry::{Jitter, NoJitter, RandomJitter, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// Connection refused, reset, DNS and similar.
    Network,
    /// 401/403 from the remote runtime.
    Auth(u16),
    /// 429 or 5xx: the runtime is up but cannot serve right now.
    Unavailable(u16),
    /// Any other non-success status.
    Rejected(u16),
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportFailure::Network => f.write_str("network"),
            TransportFailure::Auth(code) => write!(f, "auth {code}"),
            TransportFailure::Unavailable(code) => write!(f, "unavailable {code}"),
            TransportFailure::Rejected(code) => write!(f, "rejected {code}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    #[error("transport error ({kind}): {message}")]
    Transport {
        kind: TransportFailure,
        message: String,
    },

    #[error("worker call exceeded its {}ms deadline", deadline.as_millis())]
    Timeout { deadline: Duration },

    #[error("contract mismatch: expected {expected}, got {found}")]
    ContractMismatch { expected: String, found: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    UnknownWorker(#[from] UnknownWorkerError),
}

impl CallError {
    pub fn transport(kind: TransportFailure, message: impl Into<String>) -> Self {
        CallError::Transport {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::Transport { .. } => ErrorKind::Transport,
            CallError::Timeout { .. } => ErrorKind::Timeout,
            CallError::ContractMismatch { .. } => ErrorKind::ContractMismatch,
            CallError::Validation(_) => ErrorKind::Validation,
            CallError::UnknownWorker(_) => ErrorKind::UnknownWorker,
        }
    }
}

/// A worker reachable through some transport. Implemented by the local
/// in-process adapter and the remote HTTP adapter.
#[async_trait]
pub trait Worker: Send + Sync {
    fn transport(&self) -> TransportMode;
    async fn call(&self, request: &WorkerCallRequest) -> Result<WorkerReply, CallError>;
}

/// In-process worker logic, registered under a handler reference.
#[async_trait]
pub trait WorkerHandler: Send + Sync {
    async fn handle(&self, request: WorkerCallRequest) -> Result<WorkerReply, CallError>;
}

pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> WorkerHandler for FnHandler<F>
where
    F: Fn(WorkerCallRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<WorkerReply, CallError>> + Send,
{
    async fn handle(&self, request: WorkerCallRequest) -> Result<WorkerReply, CallError> {
        (self.0)(request).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn WorkerHandler>
where
    F: Fn(WorkerCallRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<WorkerReply, CallError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A dispatch that failed after the retry policy gave up.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFailure {
    pub error: CallError,
    pub attempts: u32,
    pub latency_ms: u64,
}

/// Moves a request to a resolved worker and normalizes what comes back.
pub struct CallAdapter {
    policy: RetryPolicy,
    call_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl CallAdapter {
    pub fn new(policy: RetryPolicy, call_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            call_timeout,
            clock,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Dispatch `request` to `worker`, retrying transient failures.
    pub async fn dispatch(
        &self,
        worker: &RegisteredWorker,
        request: &WorkerCallRequest,
    ) -> Result<WorkerCallResult, CallFailure> {
        let transport = worker.descriptor.mode;
        let started = self.clock.now();

        if let Err(e) = request.validate() {
            return Err(CallFailure {
                error: CallError::Validation(e),
                attempts: 0,
                latency_ms: 0,
            });
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let attempt_started = self.clock.now();

            let outcome =
                match tokio::time::timeout(self.call_timeout, worker.worker.call(request)).await {
                    Ok(result) => result.and_then(|reply| check_reply(request, reply)),
                    Err(_) => Err(CallError::Timeout {
                        deadline: self.call_timeout,
                    }),
                };

            let latency_ms = elapsed_ms(attempt_started, self.clock.now());

            match outcome {
                Ok(reply) => {
                    tracing::info!(
                        correlation_id = %request.correlation_id,
                        worker_role = %request.worker_role,
                        mode = %transport,
                        status = %reply.status,
                        latency_ms,
                        attempt,
                        "Worker call completed"
                    );
                    return Ok(WorkerCallResult {
                        worker_role: request.worker_role.clone(),
                        correlation_id: request.correlation_id,
                        transport,
                        status: reply.status,
                        payload: reply.payload,
                        detail: reply.detail,
                        latency_ms: elapsed_ms(started, self.clock.now()),
                        attempts: attempt,
                    });
                }
                Err(error) => {
                    let retry = self.policy.should_retry(&error, attempt);
                    tracing::warn!(
                        correlation_id = %request.correlation_id,
                        worker_role = %request.worker_role,
                        mode = %transport,
                        status = "error",
                        latency_ms,
                        attempt,
                        retry,
                        error = %error,
                        "Worker call failed"
                    );

                    if retry {
                        self.clock.sleep(self.policy.delay_for(attempt)).await;
                        continue;
                    }

                    return Err(CallFailure {
                        error,
                        attempts: attempt,
                        latency_ms: elapsed_ms(started, self.clock.now()),
                    });
                }
            }
        }
    }
}

/// A reply must carry the one contract shape fixed for the request's stage.
fn check_reply(request: &WorkerCallRequest, reply: WorkerReply) -> Result<WorkerReply, CallError> {
    let expected = request.stage.expected_kind();

    reply.validate().map_err(|e| CallError::ContractMismatch {
        expected: expected.to_string(),
        found: e.to_string(),
    })?;

    if let Some(payload) = &reply.payload {
        if payload.kind() != expected {
            return Err(CallError::ContractMismatch {
                expected: expected.to_string(),
                found: payload.kind().to_string(),
            });
        }
    }

    if reply.status == CallStatus::Ok && reply.payload.is_none() {
        return Err(CallError::ContractMismatch {
            expected: expected.to_string(),
            found: "no payload".to_string(),
        });
    }

    Ok(reply)
}
