//! Fixtures shared by unit tests across the crate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::adapter::{handler_fn, WorkerHandler};
use crate::clock::Clock;
use crate::contract::{
    AuditReport, DocumentationReport, Environment, FileDiff, Finding, FixPlan, FixStep,
    IssueBatch, IssueSpec, PatchSet, Payload, PipelineRequest, QaVerdict, RunMode, Severity,
    StageName, WorkerCallRequest, WorkerReply,
};
use crate::registry::{RegistryBuilder, WorkerRegistry};

/// Clock frozen at a fixed instant. `sleep` returns at once, records the
/// requested duration and moves the clock forward by it.
pub struct ManualClock {
    state: Mutex<(DateTime<Utc>, Vec<Duration>)>,
}

impl Default for ManualClock {
    fn default() -> Self {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Self {
            state: Mutex::new((start, Vec::new())),
        }
    }
}

impl ManualClock {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().unwrap().1.clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().0
    }

    async fn sleep(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap();
        state.0 += chrono::Duration::from_std(duration).unwrap();
        state.1.push(duration);
    }
}

pub fn request(mode: RunMode) -> PipelineRequest {
    PipelineRequest::new("acme/widgets", "audit the readme", Environment::Dev, mode).unwrap()
}

pub fn call_request(role: &str, stage: StageName) -> WorkerCallRequest {
    WorkerCallRequest {
        worker_role: role.to_string(),
        correlation_id: Uuid::new_v4(),
        stage,
        context: request(RunMode::Preview).context(),
        inputs: Vec::new(),
    }
}

pub fn audit_report(findings: usize) -> Payload {
    Payload::Audit(AuditReport {
        summary: "readme is out of date".to_string(),
        findings: (0..findings)
            .map(|i| {
                Finding::new(Severity::Medium, format!("stale section {i}"))
                    .unwrap()
                    .at("README.md")
            })
            .collect(),
        checks: Vec::new(),
    })
}

pub fn issue(title: &str, severity: Severity) -> IssueSpec {
    IssueSpec::new(title, "details", vec!["docs".to_string()], severity).unwrap()
}

pub fn issue_batch(n: usize) -> Payload {
    Payload::Issues(IssueBatch {
        issues: (0..n)
            .map(|i| issue(&format!("Fix stale section {i}"), Severity::Medium))
            .collect(),
    })
}

pub fn fix_plan(steps: usize) -> Payload {
    Payload::FixPlan(FixPlan {
        steps: (0..steps)
            .map(|i| FixStep::new(format!("README.md:{i}"), "rewrite section").unwrap())
            .collect(),
    })
}

pub fn patch_set() -> Payload {
    Payload::Patch(PatchSet {
        summary: "refresh readme".to_string(),
        diffs: vec![FileDiff {
            path: "README.md".to_string(),
            diff: "@@ -1 +1 @@\n-old\n+new\n".to_string(),
        }],
    })
}

pub fn qa_verdict(passed: bool) -> Payload {
    Payload::QaVerdict(QaVerdict::new(passed, Vec::new(), 0.9).unwrap())
}

pub fn documentation() -> Payload {
    Payload::Documentation(DocumentationReport {
        summary: "readme refreshed".to_string(),
        files: vec!["README.md".to_string()],
    })
}

/// The payload a well-behaved worker returns for `stage`.
pub fn stage_payload(stage: StageName) -> Payload {
    match stage {
        StageName::Audit => audit_report(2),
        StageName::IssueDrafting => issue_batch(2),
        StageName::FixPlanning => fix_plan(2),
        StageName::FixImplementation => patch_set(),
        StageName::Qa => qa_verdict(true),
        StageName::Documentation => documentation(),
    }
}

/// Handler that always replies ok with `payload`.
pub fn reply_with(payload: Payload) -> Arc<dyn WorkerHandler> {
    handler_fn(move |_req| {
        let payload = payload.clone();
        async move { Ok(WorkerReply::ok(payload)) }
    })
}

/// One well-behaved local worker per base role.
pub fn full_registry_builder() -> RegistryBuilder {
    StageName::ORDER
        .into_iter()
        .fold(RegistryBuilder::new(), |builder, stage| {
            builder
                .register_local(stage.base_role(), "stub", reply_with(stage_payload(stage)))
                .unwrap()
        })
}

pub fn full_registry() -> WorkerRegistry {
    full_registry_builder().build()
}

/// Full registry builder with `stage`'s worker replaced by `handler`.
pub fn registry_builder_with(stage: StageName, handler: Arc<dyn WorkerHandler>) -> RegistryBuilder {
    StageName::ORDER
        .into_iter()
        .fold(RegistryBuilder::new(), |builder, s| {
            let h = if s == stage {
                Arc::clone(&handler)
            } else {
                reply_with(stage_payload(s))
            };
            builder.register_local(s.base_role(), "stub", h).unwrap()
        })
}

pub fn registry_with(stage: StageName, handler: Arc<dyn WorkerHandler>) -> WorkerRegistry {
    registry_builder_with(stage, handler).build()
}
