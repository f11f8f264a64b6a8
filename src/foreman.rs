use std::sync::Arc;
use std::time::Duration;

use crate::adapter::{CallAdapter, RetryPolicy};
use crate::agent::{ClaudeClient, ModelHandler, CLAUDE_HANDLER};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::contract::{Environment, PipelineRequest, PipelineResult, RunMode};
use crate::error::Result;
use crate::pipeline::hooks::JournalHook;
use crate::pipeline::stage::plans_from_config;
use crate::pipeline::Orchestrator;
use crate::readiness::{ClearedRequest, ReadinessFailure, ReadinessGate};
use crate::registry::{HandlerTable, WorkerRegistry};
use crate::tracker::github::GitHubTracker;
use crate::tracker::IssueTracker;

/// Entry point for callers: every submitted request passes the readiness
/// gate before the orchestrator sees it.
pub struct Foreman {
    registry: Arc<WorkerRegistry>,
    gate: ReadinessGate,
    orchestrator: Orchestrator,
}

impl Foreman {
    pub fn new(gate: ReadinessGate, orchestrator: Orchestrator) -> Self {
        Self {
            registry: Arc::clone(orchestrator.registry()),
            gate,
            orchestrator,
        }
    }

    /// Wire up the registry, gate, tracker and hooks from configuration.
    /// `handlers` supplies in-process worker logic; a `claude` handler is
    /// added when the `[claude]` section is present.
    pub fn from_config(config: &AppConfig, mut handlers: HandlerTable) -> Result<Self> {
        let client = reqwest::Client::new();

        if let Some(claude) = &config.claude {
            if handlers.get(CLAUDE_HANDLER).is_none() {
                let model = Arc::new(ClaudeClient::new(client.clone(), claude));
                handlers.insert(CLAUDE_HANDLER, Arc::new(ModelHandler::new(model)));
            }
        }

        let registry = Arc::new(WorkerRegistry::from_config(
            &config.workers,
            &config.endpoints,
            &handlers,
            client,
        )?);

        let tracker: Option<Arc<dyn IssueTracker>> = match &config.github {
            Some(github) => Some(Arc::new(GitHubTracker::new(github)?)),
            None => None,
        };

        let plans = plans_from_config(&config.pipeline);
        let gate = ReadinessGate::new(
            plans.clone(),
            config.guardrails.clone(),
            config.readiness.required_settings.clone(),
            tracker.is_some(),
        );

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let adapter = CallAdapter::new(
            RetryPolicy::from_config(&config.retry),
            Duration::from_secs(config.pipeline.call_timeout_secs),
            Arc::clone(&clock),
        );

        let mut orchestrator = Orchestrator::new(
            Arc::clone(&registry),
            adapter,
            plans,
            clock,
            Duration::from_secs(config.pipeline.run_deadline_secs),
        );
        if let Some(tracker) = tracker {
            orchestrator = orchestrator.with_tracker(tracker);
        }
        if let Some(path) = &config.hooks.journal_path {
            orchestrator = orchestrator.with_hook(Arc::new(JournalHook::new(path)));
        }

        Ok(Self {
            registry,
            gate,
            orchestrator,
        })
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn check(&self, request: PipelineRequest) -> std::result::Result<ClearedRequest, ReadinessFailure> {
        self.gate.check(&self.registry, request)
    }

    /// Would a run in `environment`/`mode` be admitted right now?
    pub fn probe(&self, environment: Environment, mode: RunMode) -> std::result::Result<(), ReadinessFailure> {
        // The probe's own fields are valid, so only topology and guardrails are checked.
        let request = PipelineRequest {
            repository_reference: "readiness-probe".to_string(),
            task_description: "readiness probe".to_string(),
            environment,
            mode,
            max_issues: 1,
            deadline_secs: None,
            correlation_id: uuid::Uuid::new_v4(),
        };
        self.check(request).map(|_| ())
    }

    pub async fn run(&self, cleared: ClearedRequest) -> PipelineResult {
        self.orchestrator.run(cleared).await
    }

    pub async fn submit(&self, request: PipelineRequest) -> std::result::Result<PipelineResult, ReadinessFailure> {
        let cleared = self.check(request)?;
        Ok(self.run(cleared).await)
    }
}
