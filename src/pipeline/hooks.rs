use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use uuid::Uuid;

use crate::contract::{Environment, RunMode, StageOutcome};
use crate::error::{AppError, Result};

/// Run-level facts handed to every hook.
#[derive(Debug, Clone, Serialize)]
pub struct HookContext {
    pub run_id: Uuid,
    pub correlation_id: Uuid,
    pub environment: Environment,
    pub mode: RunMode,
}

/// Invoked synchronously after each stage outcome is finalized. A hook can
/// never affect the run: errors and panics are logged and dropped.
pub trait StageHook: Send + Sync {
    fn name(&self) -> &str;
    fn after_stage(&self, context: &HookContext, outcome: &StageOutcome) -> Result<()>;
}

pub(crate) fn run_hooks(hooks: &[Arc<dyn StageHook>], context: &HookContext, outcome: &StageOutcome) {
    for hook in hooks {
        let result = catch_unwind(AssertUnwindSafe(|| hook.after_stage(context, outcome)));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    hook = hook.name(),
                    run_id = %context.run_id,
                    stage = %outcome.stage_name,
                    error = %e,
                    "Stage hook failed"
                );
            }
            Err(_) => {
                tracing::error!(
                    hook = hook.name(),
                    run_id = %context.run_id,
                    stage = %outcome.stage_name,
                    "Stage hook panicked"
                );
            }
        }
    }
}

#[derive(Serialize)]
struct JournalEntry<'a> {
    #[serde(flatten)]
    context: &'a HookContext,
    outcome: &'a StageOutcome,
}

/// Appends every stage outcome as one JSON line.
pub struct JournalHook {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JournalHook {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl StageHook for JournalHook {
    fn name(&self) -> &str {
        "journal"
    }

    fn after_stage(&self, context: &HookContext, outcome: &StageOutcome) -> Result<()> {
        let mut line = serde_json::to_vec(&JournalEntry { context, outcome })?;
        line.push(b'\n');

        // Concurrent runs share the file.
        let _guard = self
            .lock
            .lock()
            .map_err(|_| AppError::Internal("journal lock poisoned".to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::StageName;

    fn context() -> HookContext {
        HookContext {
            run_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            environment: Environment::Dev,
            mode: RunMode::DryRun,
        }
    }

    struct Failing;

    impl StageHook for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn after_stage(&self, _: &HookContext, _: &StageOutcome) -> Result<()> {
            Err(AppError::Internal("disk full".into()))
        }
    }

    struct Panicking;

    impl StageHook for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn after_stage(&self, _: &HookContext, _: &StageOutcome) -> Result<()> {
            panic!("hook bug");
        }
    }

    #[test]
    fn test_journal_appends_one_line_per_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let hook = JournalHook::new(&path);
        let ctx = context();

        for stage in [StageName::Audit, StageName::IssueDrafting] {
            let outcome = StageOutcome::skipped(stage, stage.base_role(), None);
            hook.after_stage(&ctx, &outcome).unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["run_id"], ctx.run_id.to_string());
        assert_eq!(lines[1]["outcome"]["stage_name"], "issue_drafting");
    }

    #[test]
    fn test_failing_and_panicking_hooks_are_contained() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let hooks: Vec<Arc<dyn StageHook>> = vec![
            Arc::new(Failing),
            Arc::new(Panicking),
            Arc::new(JournalHook::new(&path)),
        ];
        let outcome = StageOutcome::skipped(StageName::Qa, "qa", None);

        run_hooks(&hooks, &context(), &outcome);

        // The journal still ran after the two broken hooks.
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
    }
}
