//! Serves this process's local workers to remote orchestrators, so another
//! deployment can register them with `mode = "remote"`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;

use crate::adapter::remote::CORRELATION_HEADER;
use crate::adapter::signature::{verify_signature, SIGNATURE_HEADER};
use crate::adapter::{CallError, TransportFailure};
use crate::config::HostConfig;
use crate::contract::{decode, encode, TransportMode, WorkerCallRequest};
use crate::registry::WorkerRegistry;

pub struct WorkerHost {
    registry: Arc<WorkerRegistry>,
    token: Option<String>,
    signing_secret: Option<String>,
}

impl WorkerHost {
    pub fn new(registry: Arc<WorkerRegistry>, config: &HostConfig) -> Self {
        Self {
            registry,
            token: config.token.clone().filter(|t| !t.is_empty()),
            signing_secret: config.signing_secret.clone().filter(|s| !s.is_empty()),
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.token else {
            return true;
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|presented| presented == expected)
    }
}

pub fn router(host: Arc<WorkerHost>) -> Router {
    Router::new()
        .route("/workers/:role", post(serve_worker))
        .with_state(host)
}

fn reject(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}

pub async fn serve_worker(
    State(host): State<Arc<WorkerHost>>,
    Path(role): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !host.authorized(&headers) {
        tracing::warn!(role = %role, "Worker call with missing or wrong bearer token");
        return reject(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    if let Some(secret) = &host.signing_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if let Err(e) = verify_signature(secret, &body, signature) {
            tracing::warn!(role = %role, error = %e, "Worker call signature verification failed");
            return reject(StatusCode::UNAUTHORIZED, "bad signature");
        }
    }

    let worker = match host.registry.resolve(&role) {
        Ok(worker) if worker.descriptor.mode == TransportMode::Local => worker,
        _ => return reject(StatusCode::NOT_FOUND, format!("no local worker for role `{role}`")),
    };

    let request: WorkerCallRequest = match decode(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(role = %role, error = %e, "Rejected malformed worker request");
            return reject(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    if request.worker_role != role {
        return reject(
            StatusCode::BAD_REQUEST,
            format!(
                "request addressed to `{}` but posted to `{role}`",
                request.worker_role
            ),
        );
    }

    tracing::info!(
        correlation_id = %request.correlation_id,
        header_correlation_id = headers
            .get(CORRELATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-"),
        worker_role = %role,
        stage = %request.stage,
        "Serving worker call"
    );

    let reply = match worker.worker.call(&request).await {
        Ok(reply) => reply,
        Err(e) => return reject(error_status(&e), e.to_string()),
    };

    match encode(&reply) {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            bytes,
        )
            .into_response(),
        Err(e) => reject(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Transient handler failures map to 503 so the caller's retry policy sees
/// them as retryable; everything else is a non-retryable 422.
fn error_status(error: &CallError) -> StatusCode {
    match error {
        CallError::Timeout { .. }
        | CallError::Transport {
            kind: TransportFailure::Network | TransportFailure::Unavailable(_),
            ..
        } => StatusCode::SERVICE_UNAVAILABLE,
        CallError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::adapter::{handler_fn, CallAdapter, NoJitter, RemoteEndpoint, RetryPolicy};
    use crate::contract::{CallStatus, StageName, WorkerReply};
    use crate::registry::RegistryBuilder;
    use crate::testing::{self, ManualClock};

    async fn spawn_host(registry: WorkerRegistry, config: HostConfig) -> String {
        let host = Arc::new(WorkerHost::new(Arc::new(registry), &config));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(host)).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn host_config() -> HostConfig {
        HostConfig {
            enabled: true,
            token: Some("t0ken".into()),
            signing_secret: Some("s3cret".into()),
        }
    }

    fn endpoint(base: &str, role: &str) -> RemoteEndpoint {
        RemoteEndpoint {
            id: "runtime-b".into(),
            url: format!("{base}/workers/{role}"),
            token: Some("t0ken".into()),
            signing_secret: Some("s3cret".into()),
        }
    }

    fn adapter() -> CallAdapter {
        CallAdapter::new(
            RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(10))
                .with_jitter(Arc::new(NoJitter)),
            Duration::from_secs(5),
            Arc::new(ManualClock::default()),
        )
    }

    #[tokio::test]
    async fn test_local_and_remote_dispatch_agree() {
        let base = spawn_host(testing::full_registry(), host_config()).await;
        let local = testing::full_registry();
        let remote = RegistryBuilder::new()
            .register_remote("qa", reqwest::Client::new(), endpoint(&base, "qa"))
            .unwrap()
            .build();
        let request = testing::call_request("qa", StageName::Qa);
        let adapter = adapter();

        let via_local = adapter
            .dispatch(local.resolve("qa").unwrap(), &request)
            .await
            .unwrap();
        let via_remote = adapter
            .dispatch(remote.resolve("qa").unwrap(), &request)
            .await
            .unwrap();

        assert_eq!(via_local.transport, TransportMode::Local);
        assert_eq!(via_remote.transport, TransportMode::Remote);
        assert_eq!(via_local.status, via_remote.status);
        assert_eq!(via_local.payload, via_remote.payload);
        assert_eq!(via_local.correlation_id, via_remote.correlation_id);
        assert_eq!(via_local.attempts, via_remote.attempts);
    }

    #[tokio::test]
    async fn test_wrong_token_is_an_auth_failure() {
        let base = spawn_host(testing::full_registry(), host_config()).await;
        let mut wrong = endpoint(&base, "qa");
        wrong.token = Some("nope".into());
        let remote = RegistryBuilder::new()
            .register_remote("qa", reqwest::Client::new(), wrong)
            .unwrap()
            .build();

        let failure = adapter()
            .dispatch(
                remote.resolve("qa").unwrap(),
                &testing::call_request("qa", StageName::Qa),
            )
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 1);
        assert!(matches!(
            failure.error,
            CallError::Transport {
                kind: TransportFailure::Auth(401),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unsigned_request_is_refused() {
        let base = spawn_host(testing::full_registry(), host_config()).await;
        let body = encode(&testing::call_request("qa", StageName::Qa)).unwrap();

        let response = reqwest::Client::new()
            .post(format!("{base}/workers/qa"))
            .bearer_auth("t0ken")
            .body(body)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_role_is_not_found() {
        let base = spawn_host(testing::full_registry(), HostConfig::default()).await;
        let body = encode(&testing::call_request("translator", StageName::Qa)).unwrap();

        let response = reqwest::Client::new()
            .post(format!("{base}/workers/translator"))
            .body(body)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_fields_are_a_bad_request() {
        let base = spawn_host(testing::full_registry(), HostConfig::default()).await;
        let mut body: serde_json::Value =
            serde_json::to_value(testing::call_request("qa", StageName::Qa)).unwrap();
        body["surprise"] = serde_json::json!(true);

        let response = reqwest::Client::new()
            .post(format!("{base}/workers/qa"))
            .json(&body)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_busy_handler_is_retried_by_the_caller() {
        let registry = RegistryBuilder::new()
            .register_local(
                "qa",
                "busy",
                handler_fn(|_req| async {
                    Err(CallError::transport(TransportFailure::Unavailable(429), "slow down"))
                }),
            )
            .unwrap()
            .build();
        let base = spawn_host(registry, HostConfig::default()).await;
        let mut open = endpoint(&base, "qa");
        open.token = None;
        open.signing_secret = None;
        let remote = RegistryBuilder::new()
            .register_remote("qa", reqwest::Client::new(), open)
            .unwrap()
            .build();

        let failure = adapter()
            .dispatch(
                remote.resolve("qa").unwrap(),
                &testing::call_request("qa", StageName::Qa),
            )
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 2);
        assert!(matches!(
            failure.error,
            CallError::Transport {
                kind: TransportFailure::Unavailable(503),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_skipped_reply_crosses_the_wire() {
        let registry = RegistryBuilder::new()
            .register_local(
                "documentation",
                "stub",
                handler_fn(|_req| async { Ok(WorkerReply::skipped("nothing changed")) }),
            )
            .unwrap()
            .build();
        let base = spawn_host(registry, HostConfig::default()).await;
        let mut open = endpoint(&base, "documentation");
        open.token = None;
        open.signing_secret = None;
        let remote = RegistryBuilder::new()
            .register_remote("documentation", reqwest::Client::new(), open)
            .unwrap()
            .build();

        let result = adapter()
            .dispatch(
                remote.resolve("documentation").unwrap(),
                &testing::call_request("documentation", StageName::Documentation),
            )
            .await
            .unwrap();

        assert_eq!(result.status, CallStatus::Skipped);
        assert_eq!(result.detail.as_deref(), Some("nothing changed"));
    }
}
