use serde::{Deserialize, Serialize};

use super::envelope::{Environment, RunMode};
use super::{require_text, validate_each, Contract, ValidationError, MAX_TITLE_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// A single observation made by an audit or QA worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Finding {
    pub fn new(severity: Severity, message: impl Into<String>) -> Result<Self, ValidationError> {
        let finding = Self {
            severity,
            message: message.into(),
            location: None,
        };
        finding.validate()?;
        Ok(finding)
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl Contract for Finding {
    fn validate(&self) -> Result<(), ValidationError> {
        require_text("message", &self.message)
    }
}

/// What the workers are told about the target codebase and the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryContext {
    pub repository_reference: String,
    pub task_description: String,
    pub environment: Environment,
    pub mode: RunMode,
}

impl Contract for RepositoryContext {
    fn validate(&self) -> Result<(), ValidationError> {
        require_text("repository_reference", &self.repository_reference)?;
        require_text("task_description", &self.task_description)
    }
}

/// Report produced by the audit stage. When several audit checks run, the
/// orchestrator merges their reports and lists the contributing roles in
/// `checks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditReport {
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<String>,
}

impl Contract for AuditReport {
    fn validate(&self) -> Result<(), ValidationError> {
        require_text("summary", &self.summary)?;
        validate_each("findings", &self.findings, Finding::validate)
    }
}

/// A candidate issue. Only reaches an external tracker in `create` mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IssueSpec {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub severity: Severity,
}

impl IssueSpec {
    pub fn new(
        title: impl Into<String>,
        body: impl Into<String>,
        labels: Vec<String>,
        severity: Severity,
    ) -> Result<Self, ValidationError> {
        let spec = Self {
            title: title.into(),
            body: body.into(),
            labels,
            severity,
        };
        spec.validate()?;
        Ok(spec)
    }
}

impl Contract for IssueSpec {
    fn validate(&self) -> Result<(), ValidationError> {
        require_text("title", &self.title)?;
        if self.title.chars().count() > MAX_TITLE_LEN {
            return Err(ValidationError::new(
                "title",
                format!("longer than {MAX_TITLE_LEN} characters"),
            ));
        }
        for (index, label) in self.labels.iter().enumerate() {
            require_text(&format!("labels[{index}]"), label)?;
            if self.labels[..index].contains(label) {
                return Err(ValidationError::new(
                    format!("labels[{index}]"),
                    format!("duplicate label `{label}`"),
                ));
            }
        }
        Ok(())
    }
}

/// Issue-drafting stage result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IssueBatch {
    pub issues: Vec<IssueSpec>,
}

impl Contract for IssueBatch {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_each("issues", &self.issues, IssueSpec::validate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixStep {
    /// File or region identifier, e.g. `src/parser.rs:120-140`.
    pub target: String,
    pub rationale: String,
}

impl FixStep {
    pub fn new(
        target: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let step = Self {
            target: target.into(),
            rationale: rationale.into(),
        };
        step.validate()?;
        Ok(step)
    }
}

impl Contract for FixStep {
    fn validate(&self) -> Result<(), ValidationError> {
        require_text("target", &self.target)?;
        require_text("rationale", &self.rationale)
    }
}

/// Ordered change steps. Carries no patch; see [`PatchSet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixPlan {
    pub steps: Vec<FixStep>,
}

impl Contract for FixPlan {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_each("steps", &self.steps, FixStep::validate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileDiff {
    pub path: String,
    /// Unified diff for this file.
    pub diff: String,
}

/// Fix-implementation stage result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchSet {
    pub summary: String,
    pub diffs: Vec<FileDiff>,
}

impl Contract for PatchSet {
    fn validate(&self) -> Result<(), ValidationError> {
        require_text("summary", &self.summary)?;
        validate_each("diffs", &self.diffs, |d| {
            require_text("path", &d.path)?;
            require_text("diff", &d.diff)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QaVerdict {
    pub passed: bool,
    #[serde(default)]
    pub findings: Vec<Finding>,
    /// In `[0.0, 1.0]`.
    pub confidence: f64,
}

impl QaVerdict {
    pub fn new(
        passed: bool,
        findings: Vec<Finding>,
        confidence: f64,
    ) -> Result<Self, ValidationError> {
        let verdict = Self {
            passed,
            findings,
            confidence,
        };
        verdict.validate()?;
        Ok(verdict)
    }
}

impl Contract for QaVerdict {
    fn validate(&self) -> Result<(), ValidationError> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(ValidationError::new(
                "confidence",
                "must be a number between 0 and 1",
            ));
        }
        validate_each("findings", &self.findings, Finding::validate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentationReport {
    pub summary: String,
    #[serde(default)]
    pub files: Vec<String>,
}

impl Contract for DocumentationReport {
    fn validate(&self) -> Result<(), ValidationError> {
        require_text("summary", &self.summary)?;
        validate_each("files", &self.files, |f| require_text("path", f))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Audit,
    Issues,
    FixPlan,
    Patch,
    QaVerdict,
    Documentation,
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PayloadKind::Audit => "audit",
            PayloadKind::Issues => "issues",
            PayloadKind::FixPlan => "fix_plan",
            PayloadKind::Patch => "patch",
            PayloadKind::QaVerdict => "qa_verdict",
            PayloadKind::Documentation => "documentation",
        };
        f.write_str(name)
    }
}

/// Closed union of stage results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case", deny_unknown_fields)]
pub enum Payload {
    Audit(AuditReport),
    Issues(IssueBatch),
    FixPlan(FixPlan),
    Patch(PatchSet),
    QaVerdict(QaVerdict),
    Documentation(DocumentationReport),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Audit(_) => PayloadKind::Audit,
            Payload::Issues(_) => PayloadKind::Issues,
            Payload::FixPlan(_) => PayloadKind::FixPlan,
            Payload::Patch(_) => PayloadKind::Patch,
            Payload::QaVerdict(_) => PayloadKind::QaVerdict,
            Payload::Documentation(_) => PayloadKind::Documentation,
        }
    }
}

impl Contract for Payload {
    fn validate(&self) -> Result<(), ValidationError> {
        let result = match self {
            Payload::Audit(p) => p.validate(),
            Payload::Issues(p) => p.validate(),
            Payload::FixPlan(p) => p.validate(),
            Payload::Patch(p) => p.validate(),
            Payload::QaVerdict(p) => p.validate(),
            Payload::Documentation(p) => p.validate(),
        };
        result.map_err(|e| e.within("body"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_spec_rejects_duplicate_labels() {
        let err = IssueSpec::new(
            "Broken link",
            "README links to a missing page",
            vec!["docs".into(), "docs".into()],
            Severity::Low,
        )
        .unwrap_err();
        assert_eq!(err.field, "labels[1]");
    }

    #[test]
    fn test_issue_spec_rejects_long_title() {
        let title = "x".repeat(MAX_TITLE_LEN + 1);
        let err = IssueSpec::new(title, "", vec![], Severity::Info).unwrap_err();
        assert_eq!(err.field, "title");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Low > Severity::Info);
    }

    #[test]
    fn test_qa_verdict_confidence_bounds() {
        assert!(QaVerdict::new(true, vec![], 0.0).is_ok());
        assert!(QaVerdict::new(true, vec![], 1.0).is_ok());
        assert!(QaVerdict::new(true, vec![], -0.1).is_err());
        assert!(QaVerdict::new(true, vec![], f64::NAN).is_err());
    }

    #[test]
    fn test_fix_step_requires_rationale() {
        let err = FixStep::new("src/main.rs", " ").unwrap_err();
        assert_eq!(err.field, "rationale");
    }

    #[test]
    fn test_payload_validation_points_into_body() {
        let payload = Payload::Documentation(DocumentationReport {
            summary: String::new(),
            files: vec![],
        });
        assert_eq!(payload.validate().unwrap_err().field, "body.summary");
    }

    #[test]
    fn test_finding_location_omitted_when_absent() {
        let finding = Finding::new(Severity::Medium, "unused import").unwrap();
        let json = serde_json::to_value(&finding).unwrap();
        assert!(json.get("location").is_none());
        let located = finding.at("src/lib.rs:4");
        assert_eq!(located.location.as_deref(), Some("src/lib.rs:4"));
    }
}
