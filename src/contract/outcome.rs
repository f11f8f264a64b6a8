use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifacts::Payload;
use super::envelope::{Environment, RunMode, StageName};
use super::{require_text, Contract, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Partial,
    Failed,
    Aborted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    UnknownWorker,
    Transport,
    Timeout,
    ContractMismatch,
    WorkerFailed,
    QaRejected,
    GuardrailViolation,
    TrackerWrite,
    DeadlineExceeded,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::UnknownWorker => "unknown_worker",
            ErrorKind::Transport => "transport_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ContractMismatch => "contract_mismatch",
            ErrorKind::WorkerFailed => "worker_failed",
            ErrorKind::QaRejected => "qa_rejected",
            ErrorKind::GuardrailViolation => "guardrail_violation",
            ErrorKind::TrackerWrite => "tracker_write",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
        })
    }
}

/// Enough to diagnose a failed or skipped stage without reading logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailureDetail {
    pub kind: ErrorKind,
    pub message: String,
    pub worker_role: String,
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    IssueCreation,
    CodeCommit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectState {
    /// Rendered in `dry_run`, never sent.
    Simulated,
    /// Written to the external collaborator.
    Applied,
    /// The external write was attempted and failed.
    Failed,
    /// Handed back to the caller for an external collaborator to apply.
    Deferred,
    /// Never attempted because the run stopped first.
    Skipped,
}

/// An external write implied by a stage result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlannedEffect {
    pub kind: EffectKind,
    /// Issue title or file path.
    pub target: String,
    pub state: EffectState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageOutcome {
    pub stage_name: StageName,
    pub worker_role: String,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_result: Option<Payload>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_detail: Option<FailureDetail>,
    /// The external side effect was suppressed because of the run mode.
    #[serde(default)]
    pub simulated: bool,
    /// The issue list was cut down to `max_issues`.
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub fallback_used: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effects: Vec<PlannedEffect>,
}

impl StageOutcome {
    pub fn skipped(stage: StageName, worker_role: impl Into<String>, detail: Option<FailureDetail>) -> Self {
        Self {
            stage_name: stage,
            worker_role: worker_role.into(),
            status: StageStatus::Skipped,
            contract_result: None,
            duration_ms: 0,
            failure_detail: detail,
            simulated: false,
            truncated: false,
            fallback_used: false,
            effects: Vec::new(),
        }
    }
}

impl Contract for StageOutcome {
    fn validate(&self) -> Result<(), ValidationError> {
        require_text("worker_role", &self.worker_role)?;
        if let Some(payload) = &self.contract_result {
            if payload.kind() != self.stage_name.expected_kind() {
                return Err(ValidationError::new(
                    "contract_result",
                    format!(
                        "stage {} must carry {}, found {}",
                        self.stage_name,
                        self.stage_name.expected_kind(),
                        payload.kind()
                    ),
                ));
            }
            payload
                .validate()
                .map_err(|e| e.within("contract_result"))?;
        }
        if self.status == StageStatus::Failed && self.failure_detail.is_none() {
            return Err(ValidationError::new(
                "failure_detail",
                "required when status is failed",
            ));
        }
        Ok(())
    }
}

/// Final, immutable record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub correlation_id: Uuid,
    pub repository_reference: String,
    pub environment: Environment,
    pub mode: RunMode,
    pub status: RunStatus,
    pub stages: Vec<StageOutcome>,
    pub issues_created: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub created_issue_refs: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
}

impl PipelineResult {
    pub fn stage(&self, stage: StageName) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.stage_name == stage)
    }
}

impl Contract for PipelineResult {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.mode != RunMode::Create && self.issues_created != 0 {
            return Err(ValidationError::new(
                "issues_created",
                format!("must be 0 in {} mode", self.mode),
            ));
        }
        if self.issues_created as usize != self.created_issue_refs.len() {
            return Err(ValidationError::new(
                "issues_created",
                "does not match the recorded issue references",
            ));
        }
        match (self.status, &self.error_summary) {
            (RunStatus::Succeeded, Some(_)) => {
                return Err(ValidationError::new(
                    "error_summary",
                    "must be absent when the run succeeded",
                ))
            }
            (RunStatus::Partial | RunStatus::Failed | RunStatus::Aborted, None) => {
                return Err(ValidationError::new(
                    "error_summary",
                    "required when the run did not succeed",
                ))
            }
            _ => {}
        }
        if self.completed_at < self.started_at {
            return Err(ValidationError::new("completed_at", "precedes started_at"));
        }
        let in_order = self
            .stages
            .windows(2)
            .all(|pair| pair[0].stage_name < pair[1].stage_name);
        if !in_order {
            return Err(ValidationError::new("stages", "not in pipeline order"));
        }
        for (index, stage) in self.stages.iter().enumerate() {
            stage.validate().map_err(|e| e.within(format!("stages[{index}]")))?;
        }
        Ok(())
    }
}
