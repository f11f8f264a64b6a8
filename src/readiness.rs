use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::config::{GuardrailConfig, RequiredSettings, WritePermission};
use crate::contract::{Contract, Environment, PipelineRequest, RunMode, StageName, TransportMode};
use crate::pipeline::stage::StagePlan;
use crate::registry::WorkerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessCheck {
    RequestValid,
    WorkerRegistered,
    RequiredSetting,
    RemoteCredentials,
    WritePermission,
    IssueTracker,
    MaxIssues,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessViolation {
    pub check: ReadinessCheck,
    pub message: String,
}

/// Every pre-flight check that failed, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub struct ReadinessFailure {
    pub violations: Vec<ReadinessViolation>,
}

impl ReadinessFailure {
    pub fn has(&self, check: ReadinessCheck) -> bool {
        self.violations.iter().any(|v| v.check == check)
    }
}

impl std::fmt::Display for ReadinessFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} check(s) failed", self.violations.len())?;
        for violation in &self.violations {
            write!(f, "; {}", violation.message)?;
        }
        Ok(())
    }
}

/// A request that passed the gate. Only the gate can construct one, so the
/// orchestrator cannot be started on an unchecked request.
#[derive(Debug, Clone)]
pub struct ClearedRequest {
    request: PipelineRequest,
    write_permitted: bool,
}

impl ClearedRequest {
    pub fn request(&self) -> &PipelineRequest {
        &self.request
    }

    /// External writes may reach collaborators in this run.
    pub fn write_permitted(&self) -> bool {
        self.write_permitted
    }
}

type EnvSource = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct ReadinessGate {
    plans: Vec<StagePlan>,
    guardrails: GuardrailConfig,
    required_settings: RequiredSettings,
    tracker_configured: bool,
    env: EnvSource,
}

impl ReadinessGate {
    pub fn new(
        plans: Vec<StagePlan>,
        guardrails: GuardrailConfig,
        required_settings: RequiredSettings,
        tracker_configured: bool,
    ) -> Self {
        Self {
            plans,
            guardrails,
            required_settings,
            tracker_configured,
            env: Arc::new(|name| std::env::var(name).ok()),
        }
    }

    /// Replace the process environment lookup.
    pub fn with_env_source(
        mut self,
        source: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env = Arc::new(source);
        self
    }

    pub fn check(
        &self,
        registry: &WorkerRegistry,
        request: PipelineRequest,
    ) -> Result<ClearedRequest, ReadinessFailure> {
        let mut violations = Vec::new();
        let mut violate = |check: ReadinessCheck, message: String| {
            violations.push(ReadinessViolation { check, message });
        };

        if let Err(e) = request.validate() {
            violate(ReadinessCheck::RequestValid, e.to_string());
        }

        if request.max_issues > self.guardrails.max_issues_ceiling {
            violate(
                ReadinessCheck::MaxIssues,
                format!(
                    "max_issues {} exceeds the configured ceiling of {}",
                    request.max_issues, self.guardrails.max_issues_ceiling
                ),
            );
        }

        for plan in &self.plans {
            let registered = match plan.stage {
                StageName::Audit => !registry.family(plan.role()).is_empty(),
                _ => registry.contains(plan.role()),
            };
            if plan.is_required() && !registered {
                violate(
                    ReadinessCheck::WorkerRegistered,
                    format!(
                        "required stage {} has no worker registered for role `{}`",
                        plan.stage,
                        plan.role()
                    ),
                );
            }
            if let Some(fallback) = &plan.fallback {
                if !registry.contains(fallback) {
                    violate(
                        ReadinessCheck::WorkerRegistered,
                        format!(
                            "stage {} falls back to unregistered role `{fallback}`",
                            plan.stage
                        ),
                    );
                }
            }
        }

        for name in self.required_settings.for_environment(request.environment) {
            let present = (self.env)(name).is_some_and(|v| !v.trim().is_empty());
            if !present {
                violate(
                    ReadinessCheck::RequiredSetting,
                    format!("setting `{name}` is required in {}", request.environment),
                );
            }
        }

        if request.environment != Environment::Dev {
            for worker in registry.iter() {
                let has_token = worker
                    .endpoint
                    .as_ref()
                    .is_some_and(|e| e.token.as_deref().is_some_and(|t| !t.is_empty()));
                if worker.descriptor.mode == TransportMode::Remote && !has_token {
                    violate(
                        ReadinessCheck::RemoteCredentials,
                        format!(
                            "remote worker `{}` has no token for endpoint `{}`",
                            worker.role, worker.descriptor.target
                        ),
                    );
                }
            }
        }

        let mut write_permitted = false;
        if request.mode == RunMode::Create {
            let needed = match request.environment {
                Environment::Dev => WritePermission::None,
                Environment::Staging => WritePermission::Standard,
                Environment::Prod => WritePermission::Elevated,
            };
            if self.guardrails.write_permission < needed {
                violate(
                    ReadinessCheck::WritePermission,
                    format!(
                        "create mode in {} needs write_permission = {:?}, configured {:?}",
                        request.environment, needed, self.guardrails.write_permission
                    ),
                );
            } else {
                write_permitted = true;
            }

            if !self.tracker_configured {
                violate(
                    ReadinessCheck::IssueTracker,
                    "create mode needs an issue tracker to be configured".to_string(),
                );
            }
        }

        if !violations.is_empty() {
            tracing::warn!(
                correlation_id = %request.correlation_id,
                violations = violations.len(),
                "Readiness gate refused run"
            );
            return Err(ReadinessFailure { violations });
        }

        Ok(ClearedRequest {
            request,
            write_permitted,
        })
    }
}
