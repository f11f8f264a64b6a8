use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::contract::{
    Contract, Environment, PipelineRequest, PipelineResult, RunMode, RunStatus, StageOutcome,
    StageStatus,
};
use crate::pipeline::GuardrailViolation;

/// Builds a [`PipelineResult`] as stages complete. The result only exists
/// once [`RunRecorder::finish`] is called.
pub struct RunRecorder {
    run_id: Uuid,
    correlation_id: Uuid,
    repository_reference: String,
    environment: Environment,
    mode: RunMode,
    started_at: DateTime<Utc>,
    stages: Vec<(StageOutcome, bool)>,
    created_issue_refs: Vec<String>,
    abort_reason: Option<String>,
}

impl RunRecorder {
    pub fn start(request: &PipelineRequest, now: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            correlation_id: request.correlation_id,
            repository_reference: request.repository_reference.clone(),
            environment: request.environment,
            mode: request.mode,
            started_at: now,
            stages: Vec::new(),
            created_issue_refs: Vec::new(),
            abort_reason: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn push(&mut self, outcome: StageOutcome, required: bool) {
        self.stages.push((outcome, required));
    }

    /// Count an issue the tracker accepted. Refused outside `create` mode.
    pub fn record_created(&mut self, reference: String) -> Result<(), GuardrailViolation> {
        if self.mode != RunMode::Create {
            return Err(GuardrailViolation(format!(
                "issue write recorded in {} mode",
                self.mode
            )));
        }
        self.created_issue_refs.push(reference);
        Ok(())
    }

    pub fn abort(&mut self, reason: String) {
        if self.abort_reason.is_none() {
            self.abort_reason = Some(reason);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_reason.is_some()
    }

    fn status(&self) -> RunStatus {
        if self.abort_reason.is_some() {
            return RunStatus::Aborted;
        }

        let required_failed = self
            .stages
            .iter()
            .any(|(o, required)| *required && o.status == StageStatus::Failed);
        if required_failed {
            let required_ok = self
                .stages
                .iter()
                .any(|(o, required)| *required && o.status == StageStatus::Ok);
            return if required_ok {
                RunStatus::Partial
            } else {
                RunStatus::Failed
            };
        }

        if self.stages.iter().any(|(o, _)| o.status == StageStatus::Failed) {
            return RunStatus::Partial;
        }

        RunStatus::Succeeded
    }

    fn error_summary(&self, status: RunStatus) -> Option<String> {
        if status == RunStatus::Succeeded {
            return None;
        }

        let mut parts = Vec::new();
        if let Some(reason) = &self.abort_reason {
            parts.push(format!("run aborted: {reason}"));
        }
        for (outcome, _) in &self.stages {
            if let Some(detail) = &outcome.failure_detail {
                if outcome.status == StageStatus::Failed {
                    parts.push(format!(
                        "stage {} (worker {}) failed: {}: {}",
                        outcome.stage_name, detail.worker_role, detail.kind, detail.message
                    ));
                }
            }
        }
        if parts.is_empty() {
            parts.push(format!("run finished with status {status}"));
        }
        Some(parts.join("; "))
    }

    pub fn finish(self, now: DateTime<Utc>) -> PipelineResult {
        let status = self.status();
        let error_summary = self.error_summary(status);

        let mut result = PipelineResult {
            run_id: self.run_id,
            correlation_id: self.correlation_id,
            repository_reference: self.repository_reference,
            environment: self.environment,
            mode: self.mode,
            status,
            issues_created: self.created_issue_refs.len() as u32,
            created_issue_refs: self.created_issue_refs,
            stages: self.stages.into_iter().map(|(o, _)| o).collect(),
            started_at: self.started_at,
            completed_at: now.max(self.started_at),
            error_summary,
        };

        if let Err(e) = result.validate() {
            tracing::error!(
                run_id = %result.run_id,
                error = %e,
                "Pipeline result failed its invariants"
            );
            result.status = RunStatus::Failed;
            let summary = format!("result invariant violated: {e}");
            result.error_summary = Some(match result.error_summary.take() {
                Some(existing) => format!("{existing}; {summary}"),
                None => summary,
            });
        }

        result
    }
}
