use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::{Notify, RwLock};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::contract::{decode, Environment, PipelineRequest, PipelineResult, RunMode};
use crate::foreman::Foreman;
use crate::host::{self, WorkerHost};
use crate::registry::HandlerTable;

pub struct AppState {
    pub config: AppConfig,
    pub foreman: Foreman,
    runs: RwLock<RunStore>,
    in_flight: AtomicUsize,
    drained: Notify,
}

/// Finished results, evicted oldest first once `capacity` is reached.
struct RunStore {
    capacity: usize,
    results: HashMap<Uuid, PipelineResult>,
    order: VecDeque<Uuid>,
}

impl RunStore {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            results: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, result: PipelineResult) {
        let run_id = result.run_id;
        if self.results.insert(run_id, result).is_none() {
            self.order.push_back(run_id);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.results.remove(&evicted);
            }
        }
    }

    fn get(&self, run_id: &Uuid) -> Option<&PipelineResult> {
        self.results.get(run_id)
    }

    fn len(&self) -> usize {
        self.results.len()
    }
}

/// Counts a run as in flight until dropped.
pub struct RunGuard {
    state: Arc<AppState>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.state.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.drained.notify_waiters();
        }
    }
}

impl AppState {
    pub fn new(config: AppConfig, handlers: HandlerTable) -> crate::error::Result<Self> {
        let foreman = Foreman::from_config(&config, handlers)?;
        let runs = RunStore::new(config.server.retained_runs);
        Ok(Self {
            config,
            foreman,
            runs: RwLock::new(runs),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    pub fn begin_run(self: &Arc<Self>) -> RunGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        RunGuard {
            state: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Resolves once no run is in flight.
    pub async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub async fn record(&self, result: PipelineResult) {
        let mut runs = self.runs.write().await;
        runs.insert(result);
        tracing::debug!(retained = runs.len(), "Recorded run result");
    }

    pub async fn run(&self, run_id: Uuid) -> Option<PipelineResult> {
        self.runs.read().await.get(&run_id).cloned()
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/runs", post(submit_run))
        .route("/runs/:run_id", get(get_run))
        .route("/readiness", get(readiness))
        .route("/health", get(health_check))
        .with_state(Arc::clone(&state));

    if state.config.host.enabled {
        let worker_host = WorkerHost::new(Arc::clone(state.foreman.registry()), &state.config.host);
        router = router.merge(host::router(Arc::new(worker_host)));
    }

    router.layer(TraceLayer::new_for_http())
}

async fn submit_run(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: PipelineRequest = match decode(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected malformed pipeline request");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let cleared = match state.foreman.check(request) {
        Ok(cleared) => cleared,
        Err(failure) => return (StatusCode::PRECONDITION_FAILED, Json(failure)).into_response(),
    };

    // The run owns its task, so a dropped connection does not cancel it.
    let guard = state.begin_run();
    let task_state = Arc::clone(&state);
    let run = tokio::spawn(async move {
        let _guard = guard;
        let result = task_state.foreman.run(cleared).await;
        task_state.record(result.clone()).await;
        result
    });

    match run.await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Pipeline run task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_run(State(state): State<Arc<AppState>>, Path(run_id): Path<Uuid>) -> Response {
    match state.run(run_id).await {
        Some(result) => Json(result).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ReadinessQuery {
    environment: Environment,
    mode: RunMode,
}

async fn readiness(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReadinessQuery>,
) -> Response {
    match state.foreman.probe(query.environment, query.mode) {
        Ok(()) => Json(serde_json::json!({ "ready": true })).into_response(),
        Err(failure) => (
            StatusCode::PRECONDITION_FAILED,
            Json(serde_json::json!({ "ready": false, "violations": failure.violations })),
        )
            .into_response(),
    }
}

async fn health_check() -> &'static str {
    "ok"
}
