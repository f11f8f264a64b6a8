use crate::config::{PipelineConfig, Requirement};
use crate::contract::StageName;

/// How one stage participates in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    pub stage: StageName,
    pub requirement: Requirement,
    /// Role called once when the primary worker's call fails.
    pub fallback: Option<String>,
}

impl StagePlan {
    pub fn required(stage: StageName) -> Self {
        Self {
            stage,
            requirement: Requirement::Required,
            fallback: None,
        }
    }

    pub fn optional(stage: StageName) -> Self {
        Self {
            stage,
            requirement: Requirement::Optional,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, role: impl Into<String>) -> Self {
        self.fallback = Some(role.into());
        self
    }

    pub fn is_required(&self) -> bool {
        self.requirement == Requirement::Required
    }

    pub fn role(&self) -> &'static str {
        self.stage.base_role()
    }
}

/// Every stage in pipeline order; documentation is the only optional one.
pub fn default_plans() -> Vec<StagePlan> {
    StageName::ORDER
        .into_iter()
        .map(|stage| match stage {
            StageName::Documentation => StagePlan::optional(stage),
            _ => StagePlan::required(stage),
        })
        .collect()
}

/// Default plans with configured overrides applied. Order is never configurable.
pub fn plans_from_config(config: &PipelineConfig) -> Vec<StagePlan> {
    let mut plans = default_plans();
    for plan in &mut plans {
        if let Some(over) = config.stages.iter().find(|s| s.stage == plan.stage) {
            if let Some(requirement) = over.requirement {
                plan.requirement = requirement;
            }
            if over.fallback.is_some() {
                plan.fallback = over.fallback.clone();
            }
        }
    }
    plans
}
