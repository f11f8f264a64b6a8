use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use crate::adapter::local::{reply_error, request_error};
use crate::adapter::signature::{sign_payload, SIGNATURE_HEADER};
use crate::adapter::{CallError, TransportFailure, Worker};
use crate::contract::{decode, encode, TransportMode, WorkerCallRequest, WorkerReply};

pub const CORRELATION_HEADER: &str = "x-correlation-id";
pub const ROLE_HEADER: &str = "x-foreman-role";

const MAX_ERROR_BODY: usize = 512;

/// A named remote runtime that accepts worker requests over HTTP.
#[derive(Clone)]
pub struct RemoteEndpoint {
    pub id: String,
    pub url: String,
    pub token: Option<String>,
    pub signing_secret: Option<String>,
}

// Manual Debug impl to avoid leaking credentials
impl std::fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field(
                "signing_secret",
                &self.signing_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

pub struct RemoteWorker {
    client: Client,
    endpoint: RemoteEndpoint,
}

impl RemoteWorker {
    pub fn new(client: Client, endpoint: RemoteEndpoint) -> Self {
        Self { client, endpoint }
    }

    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl Worker for RemoteWorker {
    fn transport(&self) -> TransportMode {
        TransportMode::Remote
    }

    async fn call(&self, request: &WorkerCallRequest) -> Result<WorkerReply, CallError> {
        let body = encode(request).map_err(request_error)?;

        let mut builder = self
            .client
            .post(&self.endpoint.url)
            .header("content-type", "application/json")
            .header(CORRELATION_HEADER, request.correlation_id.to_string())
            .header(ROLE_HEADER, &request.worker_role);

        if let Some(token) = &self.endpoint.token {
            builder = builder.bearer_auth(token);
        }

        if let Some(secret) = &self.endpoint.signing_secret {
            let signature = sign_payload(secret, &body)
                .map_err(|e| CallError::transport(TransportFailure::Auth(0), e.to_string()))?;
            builder = builder.header(SIGNATURE_HEADER, signature);
        }

        let response = builder
            .body(body)
            .send()
            .await
            .map_err(|e| CallError::transport(TransportFailure::Network, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CallError::transport(TransportFailure::Network, e.to_string()))?;

        decode(&bytes).map_err(reply_error)
    }
}

fn classify_status(status: StatusCode, body: &str) -> CallError {
    let code = status.as_u16();
    let kind = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportFailure::Auth(code),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            TransportFailure::Unavailable(code)
        }
        s if s.is_server_error() => TransportFailure::Unavailable(code),
        _ => TransportFailure::Rejected(code),
    };
    let body: String = body.chars().take(MAX_ERROR_BODY).collect();
    CallError::transport(kind, format!("remote worker returned {status}: {body}"))
}
