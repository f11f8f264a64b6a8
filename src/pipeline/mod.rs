//! The pipeline state machine: audit, issue drafting, fix planning, fix
//! implementation, QA and documentation, run in that fixed order against a
//! request that already passed the readiness gate.

pub mod hooks;
pub mod recorder;
pub mod stage;


use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::time::Instant;

use crate::adapter::{CallAdapter, CallError, CallFailure};
use crate::clock::{elapsed_ms, Clock};
use crate::contract::{
    AuditReport, CallStatus, EffectKind, EffectState, ErrorKind, FailureDetail, IssueBatch,
    IssueSpec, Payload, PipelineRequest, PipelineResult, PlannedEffect, RunMode, StageName,
    StageOutcome, StageStatus, WorkerCallRequest, WorkerCallResult,
};
use crate::readiness::ClearedRequest;
use crate::registry::WorkerRegistry;
use crate::tracker::IssueTracker;

use hooks::{run_hooks, HookContext, StageHook};
use recorder::RunRecorder;
use stage::StagePlan;

/// An external write was attempted without authorization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("guardrail violation: {0}")]
pub struct GuardrailViolation(pub String);

/// What the worker side produced for one stage, before interpretation.
enum Dispatch {
    Unregistered {
        role: String,
    },
    Replied {
        result: WorkerCallResult,
        fallback_used: bool,
    },
    Failed {
        role: String,
        failure: CallFailure,
        fallback_used: bool,
    },
}

impl Dispatch {
    fn failed(&self) -> bool {
        match self {
            Dispatch::Failed { failure, .. } => {
                !matches!(failure.error, CallError::UnknownWorker(_))
            }
            Dispatch::Replied { result, .. } => result.status == CallStatus::Failed,
            Dispatch::Unregistered { .. } => false,
        }
    }

    fn mark_fallback(self) -> Self {
        match self {
            Dispatch::Replied { result, .. } => Dispatch::Replied {
                result,
                fallback_used: true,
            },
            Dispatch::Failed { role, failure, .. } => Dispatch::Failed {
                role,
                failure,
                fallback_used: true,
            },
            other => other,
        }
    }
}

/// Wall-clock budget for one run, shared by worker calls and external writes.
#[derive(Debug, Clone, Copy)]
struct RunDeadline {
    expires: Instant,
    budget: Duration,
}

impl RunDeadline {
    fn start(budget: Duration) -> Self {
        Self {
            expires: Instant::now() + budget,
            budget,
        }
    }

    fn remaining(&self) -> Duration {
        self.expires.saturating_duration_since(Instant::now())
    }

    fn exceeded(&self, during: impl std::fmt::Display) -> String {
        format!("run deadline of {}s exceeded {during}", self.budget.as_secs())
    }
}

/// Why the remaining stages will not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    RequiredFailure,
    Aborted,
}

pub struct Orchestrator {
    registry: Arc<WorkerRegistry>,
    adapter: CallAdapter,
    plans: Vec<StagePlan>,
    clock: Arc<dyn Clock>,
    run_deadline: Duration,
    tracker: Option<Arc<dyn IssueTracker>>,
    hooks: Vec<Arc<dyn StageHook>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        adapter: CallAdapter,
        plans: Vec<StagePlan>,
        clock: Arc<dyn Clock>,
        run_deadline: Duration,
    ) -> Self {
        Self {
            registry,
            adapter,
            plans,
            clock,
            run_deadline,
            tracker: None,
            hooks: Vec::new(),
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn IssueTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn StageHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Run every stage for a cleared request. Failures are folded into the
    /// returned result; this never errors.
    pub async fn run(&self, cleared: ClearedRequest) -> PipelineResult {
        let request = cleared.request();
        let mut run = RunRecorder::start(request, self.clock.now());
        let context = HookContext {
            run_id: run.run_id(),
            correlation_id: run.correlation_id(),
            environment: run.environment(),
            mode: run.mode(),
        };

        let deadline = RunDeadline::start(
            request
                .deadline_secs
                .map(Duration::from_secs)
                .unwrap_or(self.run_deadline),
        );

        tracing::info!(
            run_id = %context.run_id,
            correlation_id = %context.correlation_id,
            repository = %request.repository_reference,
            environment = %request.environment,
            mode = %request.mode,
            deadline_secs = deadline.budget.as_secs(),
            "Pipeline run started"
        );

        let mut inputs: Vec<Payload> = Vec::new();
        let mut halt: Option<Halt> = None;

        for plan in &self.plans {
            let outcome = match halt {
                Some(_) => StageOutcome::skipped(plan.stage, plan.role(), None),
                None => {
                    let (outcome, stop) = self
                        .execute_stage(plan, &cleared, &inputs, deadline, &mut run)
                        .await;
                    halt = stop;
                    outcome
                }
            };

            tracing::info!(
                run_id = %context.run_id,
                correlation_id = %context.correlation_id,
                stage = %outcome.stage_name,
                worker_role = %outcome.worker_role,
                status = ?outcome.status,
                duration_ms = outcome.duration_ms,
                simulated = outcome.simulated,
                "Stage finished"
            );

            if outcome.status == StageStatus::Ok {
                if let Some(payload) = &outcome.contract_result {
                    inputs.push(payload.clone());
                }
            }

            run_hooks(&self.hooks, &context, &outcome);
            run.push(outcome, plan.is_required());
        }

        let result = run.finish(self.clock.now());
        tracing::info!(
            run_id = %result.run_id,
            correlation_id = %result.correlation_id,
            status = %result.status,
            issues_created = result.issues_created,
            "Pipeline run finished"
        );
        result
    }

    async fn execute_stage(
        &self,
        plan: &StagePlan,
        cleared: &ClearedRequest,
        inputs: &[Payload],
        deadline: RunDeadline,
        run: &mut RunRecorder,
    ) -> (StageOutcome, Option<Halt>) {
        let request = cleared.request();
        let started = self.clock.now();
        let remaining = deadline.remaining();

        let dispatched = if remaining.is_zero() {
            None
        } else {
            tokio::time::timeout(remaining, self.dispatch_stage(plan, request, inputs))
                .await
                .ok()
        };

        let Some(dispatch) = dispatched else {
            let reason = deadline.exceeded(format_args!("at stage {}", plan.stage));
            tracing::warn!(
                correlation_id = %request.correlation_id,
                stage = %plan.stage,
                "Run deadline exceeded"
            );
            let detail = FailureDetail {
                kind: ErrorKind::DeadlineExceeded,
                message: reason.clone(),
                worker_role: plan.role().to_string(),
                attempts: 0,
            };
            run.abort(reason);
            return (
                StageOutcome::skipped(plan.stage, plan.role(), Some(detail)),
                Some(Halt::Aborted),
            );
        };

        let (mut outcome, mut abort) = interpret(plan, request, dispatch);

        if outcome.status == StageStatus::Ok && plan.stage.writes_externally() {
            match request.mode {
                RunMode::Preview => outcome.simulated = true,
                RunMode::DryRun => {
                    outcome.simulated = true;
                    outcome.effects = planned_effects(&outcome, EffectState::Simulated);
                }
                RunMode::Create => {
                    if let Some(reason) =
                        self.apply_effects(cleared, &mut outcome, deadline, run).await
                    {
                        abort = Some(reason);
                    }
                }
            }
        }

        outcome.duration_ms = elapsed_ms(started, self.clock.now());

        let halt = match abort {
            Some(reason) => {
                run.abort(reason);
                Some(Halt::Aborted)
            }
            None if plan.is_required() && outcome.status == StageStatus::Failed => {
                Some(Halt::RequiredFailure)
            }
            None => None,
        };
        (outcome, halt)
    }

    async fn dispatch_stage(
        &self,
        plan: &StagePlan,
        request: &PipelineRequest,
        inputs: &[Payload],
    ) -> Dispatch {
        let primary = match plan.stage {
            StageName::Audit => self.fan_out_audit(plan, request, inputs).await,
            stage => self.call_role(stage, plan.role(), request, inputs).await,
        };

        match &plan.fallback {
            Some(fallback) if primary.failed() => {
                tracing::warn!(
                    correlation_id = %request.correlation_id,
                    stage = %plan.stage,
                    fallback = %fallback,
                    "Primary worker failed, calling fallback"
                );
                self.call_role(plan.stage, fallback, request, inputs)
                    .await
                    .mark_fallback()
            }
            _ => primary,
        }
    }

    async fn call_role(
        &self,
        stage: StageName,
        role: &str,
        request: &PipelineRequest,
        inputs: &[Payload],
    ) -> Dispatch {
        let worker = match self.registry.resolve(role) {
            Ok(worker) => worker,
            Err(_) => {
                return Dispatch::Unregistered {
                    role: role.to_string(),
                }
            }
        };

        match self
            .adapter
            .dispatch(worker, &call_request(stage, role, request, inputs))
            .await
        {
            Ok(result) => Dispatch::Replied {
                result,
                fallback_used: false,
            },
            Err(failure) => Dispatch::Failed {
                role: role.to_string(),
                failure,
                fallback_used: false,
            },
        }
    }

    /// Call every `audit` and `audit.<check>` worker concurrently and merge
    /// their reports in registration order. The stage's fallback role is
    /// left out; it only runs when the fan-out fails.
    async fn fan_out_audit(
        &self,
        plan: &StagePlan,
        request: &PipelineRequest,
        inputs: &[Payload],
    ) -> Dispatch {
        let base = StageName::Audit.base_role();
        let workers: Vec<_> = self
            .registry
            .family(base)
            .into_iter()
            .filter(|worker| plan.fallback.as_deref() != Some(worker.role.as_str()))
            .collect();
        if workers.is_empty() {
            return Dispatch::Unregistered {
                role: base.to_string(),
            };
        }

        let calls = workers.iter().map(|worker| {
            let call = call_request(StageName::Audit, &worker.role, request, inputs);
            async move { (worker.role.clone(), self.adapter.dispatch(worker, &call).await) }
        });
        let results = join_all(calls).await;

        let mut reports = Vec::new();
        for (role, result) in results {
            match result {
                Err(failure) => {
                    return Dispatch::Failed {
                        role,
                        failure,
                        fallback_used: false,
                    }
                }
                Ok(result) => match result.status {
                    CallStatus::Failed => {
                        return Dispatch::Replied {
                            result,
                            fallback_used: false,
                        }
                    }
                    CallStatus::Skipped => {}
                    CallStatus::Ok => reports.push(result),
                },
            }
        }

        Dispatch::Replied {
            result: merge_audit(base, request, reports),
            fallback_used: false,
        }
    }

    /// Only reachable in `create` mode on a request the gate cleared for writes.
    fn authorize_write(&self, cleared: &ClearedRequest) -> Result<(), GuardrailViolation> {
        let request = cleared.request();
        if request.mode != RunMode::Create {
            return Err(GuardrailViolation(format!(
                "external write attempted in {} mode",
                request.mode
            )));
        }
        if !cleared.write_permitted() {
            return Err(GuardrailViolation(format!(
                "write permission not granted for {}",
                request.environment
            )));
        }
        Ok(())
    }

    /// Apply a successful stage's external writes. Returns an abort reason on
    /// a guardrail violation or when the run deadline runs out mid-write.
    async fn apply_effects(
        &self,
        cleared: &ClearedRequest,
        outcome: &mut StageOutcome,
        deadline: RunDeadline,
        run: &mut RunRecorder,
    ) -> Option<String> {
        if let Err(violation) = self.authorize_write(cleared) {
            fail(outcome, ErrorKind::GuardrailViolation, violation.to_string(), 0);
            return Some(violation.to_string());
        }

        match outcome.contract_result.clone() {
            Some(Payload::Issues(batch)) => {
                self.file_issues(cleared.request(), &batch, outcome, deadline, run)
                    .await
            }
            Some(Payload::Patch(_)) => {
                outcome.effects = planned_effects(outcome, EffectState::Deferred);
                None
            }
            _ => None,
        }
    }

    /// File each issue while the run deadline allows. Once it runs out, the
    /// rest are recorded as skipped and the run aborts.
    async fn file_issues(
        &self,
        request: &PipelineRequest,
        batch: &IssueBatch,
        outcome: &mut StageOutcome,
        deadline: RunDeadline,
        run: &mut RunRecorder,
    ) -> Option<String> {
        let Some(tracker) = &self.tracker else {
            fail(
                outcome,
                ErrorKind::TrackerWrite,
                "no issue tracker configured".to_string(),
                0,
            );
            return None;
        };

        let mut failed = 0usize;
        let mut expired: Option<String> = None;
        for issue in &batch.issues {
            let mut effect = PlannedEffect {
                kind: EffectKind::IssueCreation,
                target: issue.title.clone(),
                state: EffectState::Applied,
                reference: None,
                error: None,
            };

            let remaining = deadline.remaining();
            if expired.is_some() || remaining.is_zero() {
                expired.get_or_insert_with(|| deadline.exceeded("while filing issues"));
                effect.state = EffectState::Skipped;
                outcome.effects.push(effect);
                continue;
            }

            let write = tracker.create_issue(&request.repository_reference, issue);
            match tokio::time::timeout(remaining, write).await {
                Ok(Ok(reference)) => {
                    if let Err(violation) = run.record_created(reference.clone()) {
                        fail(outcome, ErrorKind::GuardrailViolation, violation.to_string(), 0);
                        return Some(violation.to_string());
                    }
                    effect.reference = Some(reference);
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        correlation_id = %request.correlation_id,
                        tracker = tracker.name(),
                        title = %issue.title,
                        error = %e,
                        "Issue creation failed"
                    );
                    failed += 1;
                    effect.state = EffectState::Failed;
                    effect.error = Some(e.to_string());
                }
                Err(_) => {
                    tracing::warn!(
                        correlation_id = %request.correlation_id,
                        tracker = tracker.name(),
                        title = %issue.title,
                        "Run deadline exceeded during issue creation"
                    );
                    effect.state = EffectState::Failed;
                    effect.error =
                        Some("run deadline exceeded before the tracker answered".to_string());
                    expired = Some(deadline.exceeded("while filing issues"));
                }
            }
            outcome.effects.push(effect);
        }

        if let Some(reason) = expired {
            fail(outcome, ErrorKind::DeadlineExceeded, reason.clone(), 1);
            return Some(reason);
        }
        if failed > 0 {
            let message = format!(
                "{failed} of {} issue writes failed on {}",
                batch.issues.len(),
                tracker.name()
            );
            fail(outcome, ErrorKind::TrackerWrite, message, 1);
        }
        None
    }
}

fn call_request(
    stage: StageName,
    role: &str,
    request: &PipelineRequest,
    inputs: &[Payload],
) -> WorkerCallRequest {
    WorkerCallRequest {
        worker_role: role.to_string(),
        correlation_id: request.correlation_id,
        stage,
        context: request.context(),
        inputs: inputs.to_vec(),
    }
}

fn merge_audit(
    base: &str,
    request: &PipelineRequest,
    results: Vec<WorkerCallResult>,
) -> WorkerCallResult {
    let Some(first) = results.first() else {
        return WorkerCallResult {
            worker_role: base.to_string(),
            correlation_id: request.correlation_id,
            transport: crate::contract::TransportMode::Local,
            status: CallStatus::Skipped,
            payload: None,
            detail: Some("every audit check skipped".to_string()),
            latency_ms: 0,
            attempts: 1,
        };
    };
    let transport = first.transport;

    let mut summaries = Vec::new();
    let mut merged = AuditReport {
        summary: String::new(),
        findings: Vec::new(),
        checks: Vec::new(),
    };
    let mut latency_ms = 0;
    let mut attempts = 0;

    for result in &results {
        latency_ms = latency_ms.max(result.latency_ms);
        attempts += result.attempts;
        if let Some(Payload::Audit(report)) = &result.payload {
            summaries.push(if results.len() == 1 {
                report.summary.clone()
            } else {
                format!("[{}] {}", result.worker_role, report.summary)
            });
            merged.findings.extend(report.findings.iter().cloned());
            merged.checks.push(result.worker_role.clone());
        }
    }
    merged.summary = summaries.join("\n");

    WorkerCallResult {
        worker_role: base.to_string(),
        correlation_id: request.correlation_id,
        transport,
        status: CallStatus::Ok,
        payload: Some(Payload::Audit(merged)),
        detail: None,
        latency_ms,
        attempts,
    }
}

/// Turn what the worker side produced into a stage outcome. The second value
/// is an abort reason for failures that end the whole run.
fn interpret(
    plan: &StagePlan,
    request: &PipelineRequest,
    dispatch: Dispatch,
) -> (StageOutcome, Option<String>) {
    let mut outcome = StageOutcome::skipped(plan.stage, plan.role(), None);

    match dispatch {
        Dispatch::Unregistered { role } => {
            outcome.worker_role = role.clone();
            if plan.is_required() {
                let message = format!("no worker registered for role `{role}`");
                fail(&mut outcome, ErrorKind::UnknownWorker, message.clone(), 0);
                return (outcome, Some(message));
            }
        }
        Dispatch::Failed {
            role,
            failure,
            fallback_used,
        } => {
            outcome.worker_role = role;
            outcome.fallback_used = fallback_used;
            let kind = failure.error.kind();
            fail(&mut outcome, kind, failure.error.to_string(), failure.attempts);
            if kind == ErrorKind::UnknownWorker {
                return (outcome, Some(failure.error.to_string()));
            }
        }
        Dispatch::Replied {
            result,
            fallback_used,
        } => {
            outcome.worker_role = result.worker_role.clone();
            outcome.fallback_used = fallback_used;
            let detail = result.detail.clone();
            match result.status {
                CallStatus::Failed => fail(
                    &mut outcome,
                    ErrorKind::WorkerFailed,
                    detail.unwrap_or_else(|| "worker reported failure".to_string()),
                    result.attempts,
                ),
                CallStatus::Skipped if plan.is_required() => fail(
                    &mut outcome,
                    ErrorKind::WorkerFailed,
                    format!(
                        "worker skipped a required stage: {}",
                        detail.as_deref().unwrap_or("no reason given")
                    ),
                    result.attempts,
                ),
                CallStatus::Skipped => {}
                CallStatus::Ok => {
                    outcome.status = StageStatus::Ok;
                    outcome.contract_result = result.payload;
                    accept(&mut outcome, request, result.attempts);
                }
            }
        }
    }

    (outcome, None)
}

/// Stage-specific handling of a successful reply.
fn accept(outcome: &mut StageOutcome, request: &PipelineRequest, attempts: u32) {
    match outcome.contract_result.take() {
        Some(Payload::Issues(batch)) => {
            let total = batch.issues.len();
            let (issues, truncated) = truncate_issues(batch.issues, request.max_issues as usize);
            if truncated {
                tracing::warn!(
                    correlation_id = %request.correlation_id,
                    drafted = total,
                    kept = issues.len(),
                    "Issue batch truncated to max_issues"
                );
            }
            outcome.truncated = truncated;
            outcome.contract_result = Some(Payload::Issues(IssueBatch { issues }));
        }
        Some(Payload::QaVerdict(verdict)) => {
            let rejected = !verdict.passed;
            let message = format!(
                "QA rejected the change with confidence {:.2}{}",
                verdict.confidence,
                verdict
                    .findings
                    .first()
                    .map(|f| format!(": {}", f.message))
                    .unwrap_or_default()
            );
            outcome.contract_result = Some(Payload::QaVerdict(verdict));
            if rejected {
                fail(outcome, ErrorKind::QaRejected, message, attempts);
            }
        }
        other => outcome.contract_result = other,
    }
}

/// Keep the `max` most severe issues. The sort is stable, so equal
/// severities keep the order the worker drafted them in.
pub(crate) fn truncate_issues(mut issues: Vec<IssueSpec>, max: usize) -> (Vec<IssueSpec>, bool) {
    if issues.len() <= max {
        return (issues, false);
    }
    issues.sort_by(|a, b| b.severity.cmp(&a.severity));
    issues.truncate(max);
    (issues, true)
}

fn planned_effects(outcome: &StageOutcome, state: EffectState) -> Vec<PlannedEffect> {
    let effect = |kind, target: &str| PlannedEffect {
        kind,
        target: target.to_string(),
        state,
        reference: None,
        error: None,
    };
    match &outcome.contract_result {
        Some(Payload::Issues(batch)) => batch
            .issues
            .iter()
            .map(|i| effect(EffectKind::IssueCreation, &i.title))
            .collect(),
        Some(Payload::Patch(patch)) => patch
            .diffs
            .iter()
            .map(|d| effect(EffectKind::CodeCommit, &d.path))
            .collect(),
        _ => Vec::new(),
    }
}

fn fail(outcome: &mut StageOutcome, kind: ErrorKind, message: String, attempts: u32) {
    outcome.status = StageStatus::Failed;
    outcome.failure_detail = Some(FailureDetail {
        kind,
        message,
        worker_role: outcome.worker_role.clone(),
        attempts,
    });
}
