use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifacts::{Payload, PayloadKind, RepositoryContext};
use super::{require_text, validate_each, Contract, ValidationError, DEFAULT_MAX_ISSUES, MAX_ISSUES_LIMIT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        })
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(Environment::Dev),
            "staging" => Ok(Environment::Staging),
            "prod" => Ok(Environment::Prod),
            other => Err(format!("unknown environment `{other}` (expected dev|staging|prod)")),
        }
    }
}

/// How far a run may go towards external side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Read-only: every stage runs, nothing is written and no effect plan is kept.
    Preview,
    /// Every stage runs; writes are rendered as simulated effects.
    DryRun,
    /// Writes reach external collaborators, subject to write permission.
    Create,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunMode::Preview => "preview",
            RunMode::DryRun => "dry_run",
            RunMode::Create => "create",
        })
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preview" => Ok(RunMode::Preview),
            "dry_run" | "dry-run" => Ok(RunMode::DryRun),
            "create" => Ok(RunMode::Create),
            other => Err(format!("unknown mode `{other}` (expected preview|dry_run|create)")),
        }
    }
}

/// Pipeline stages in their fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Audit,
    IssueDrafting,
    FixPlanning,
    FixImplementation,
    Qa,
    Documentation,
}

impl StageName {
    pub const ORDER: [StageName; 6] = [
        StageName::Audit,
        StageName::IssueDrafting,
        StageName::FixPlanning,
        StageName::FixImplementation,
        StageName::Qa,
        StageName::Documentation,
    ];

    /// Logical worker role that serves this stage.
    pub fn base_role(self) -> &'static str {
        match self {
            StageName::Audit => "audit",
            StageName::IssueDrafting => "issue-spec",
            StageName::FixPlanning => "fix-plan",
            StageName::FixImplementation => "fix-implementation",
            StageName::Qa => "qa",
            StageName::Documentation => "documentation",
        }
    }

    /// The only contract shape this stage may return.
    pub fn expected_kind(self) -> PayloadKind {
        match self {
            StageName::Audit => PayloadKind::Audit,
            StageName::IssueDrafting => PayloadKind::Issues,
            StageName::FixPlanning => PayloadKind::FixPlan,
            StageName::FixImplementation => PayloadKind::Patch,
            StageName::Qa => PayloadKind::QaVerdict,
            StageName::Documentation => PayloadKind::Documentation,
        }
    }

    /// Whether a successful result implies an external write
    /// (issue creation, code commit).
    pub fn writes_externally(self) -> bool {
        matches!(self, StageName::IssueDrafting | StageName::FixImplementation)
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StageName::Audit => "audit",
            StageName::IssueDrafting => "issue_drafting",
            StageName::FixPlanning => "fix_planning",
            StageName::FixImplementation => "fix_implementation",
            StageName::Qa => "qa",
            StageName::Documentation => "documentation",
        })
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::ORDER
            .into_iter()
            .find(|stage| stage.to_string() == s)
            .ok_or_else(|| format!("unknown stage `{s}`"))
    }
}

fn default_max_issues() -> u32 {
    DEFAULT_MAX_ISSUES
}

/// A caller's request for one pipeline run. Immutable once submitted; the
/// correlation id is generated at construction so resubmitting the same
/// request is recognisable downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineRequest {
    pub repository_reference: String,
    pub task_description: String,
    pub environment: Environment,
    pub mode: RunMode,
    #[serde(default = "default_max_issues")]
    pub max_issues: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
    #[serde(default = "Uuid::new_v4")]
    pub correlation_id: Uuid,
}

impl PipelineRequest {
    pub fn new(
        repository_reference: impl Into<String>,
        task_description: impl Into<String>,
        environment: Environment,
        mode: RunMode,
    ) -> Result<Self, ValidationError> {
        let request = Self {
            repository_reference: repository_reference.into(),
            task_description: task_description.into(),
            environment,
            mode,
            max_issues: DEFAULT_MAX_ISSUES,
            deadline_secs: None,
            correlation_id: Uuid::new_v4(),
        };
        request.validate()?;
        Ok(request)
    }

    pub fn with_max_issues(mut self, max_issues: u32) -> Result<Self, ValidationError> {
        self.max_issues = max_issues;
        self.validate()?;
        Ok(self)
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_secs = Some(deadline.as_secs().max(1));
        self
    }

    pub fn context(&self) -> RepositoryContext {
        RepositoryContext {
            repository_reference: self.repository_reference.clone(),
            task_description: self.task_description.clone(),
            environment: self.environment,
            mode: self.mode,
        }
    }
}

impl Contract for PipelineRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        require_text("repository_reference", &self.repository_reference)?;
        require_text("task_description", &self.task_description)?;
        if self.max_issues == 0 || self.max_issues > MAX_ISSUES_LIMIT {
            return Err(ValidationError::new(
                "max_issues",
                format!("must be between 1 and {MAX_ISSUES_LIMIT}"),
            ));
        }
        if self.deadline_secs == Some(0) {
            return Err(ValidationError::new("deadline_secs", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Local,
    Remote,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransportMode::Local => "local",
            TransportMode::Remote => "remote",
        })
    }
}

/// Envelope the call adapter moves to a worker. `inputs` holds every
/// contract produced by earlier stages of the run, in stage order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerCallRequest {
    pub worker_role: String,
    pub correlation_id: Uuid,
    pub stage: StageName,
    pub context: RepositoryContext,
    #[serde(default)]
    pub inputs: Vec<Payload>,
}

impl WorkerCallRequest {
    /// The most recent input of the given kind, if any.
    pub fn input(&self, kind: PayloadKind) -> Option<&Payload> {
        self.inputs.iter().rev().find(|p| p.kind() == kind)
    }
}

impl Contract for WorkerCallRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        require_text("worker_role", &self.worker_role)?;
        self.context.validate().map_err(|e| e.within("context"))?;
        validate_each("inputs", &self.inputs, Payload::validate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ok,
    Skipped,
    Failed,
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CallStatus::Ok => "ok",
            CallStatus::Skipped => "skipped",
            CallStatus::Failed => "failed",
        })
    }
}

/// What a worker sends back, before the adapter adds transport metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerReply {
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl WorkerReply {
    pub fn ok(payload: Payload) -> Self {
        Self {
            status: CallStatus::Ok,
            payload: Some(payload),
            detail: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: CallStatus::Skipped,
            payload: None,
            detail: Some(reason.into()),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: CallStatus::Failed,
            payload: None,
            detail: Some(reason.into()),
        }
    }
}

impl Contract for WorkerReply {
    fn validate(&self) -> Result<(), ValidationError> {
        match (&self.status, &self.payload) {
            (CallStatus::Ok, None) => Err(ValidationError::new(
                "payload",
                "required when status is ok",
            )),
            (_, Some(payload)) => payload.validate().map_err(|e| e.within("payload")),
            _ => Ok(()),
        }
    }
}

/// Normalized result of one adapter dispatch, identical in shape for local
/// and remote transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerCallResult {
    pub worker_role: String,
    pub correlation_id: Uuid,
    pub transport: TransportMode,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub latency_ms: u64,
    pub attempts: u32,
}

impl Contract for WorkerCallResult {
    fn validate(&self) -> Result<(), ValidationError> {
        require_text("worker_role", &self.worker_role)?;
        if self.attempts == 0 {
            return Err(ValidationError::new("attempts", "must be at least 1"));
        }
        match &self.payload {
            Some(payload) => payload.validate().map_err(|e| e.within("payload")),
            None => Ok(()),
        }
    }
}
