use crate::contract::{StageName, WorkerCallRequest};
use crate::error::Result;

fn output_shape(stage: StageName) -> &'static str {
    match stage {
        StageName::Audit => {
            r#"{"summary": string, "findings": [{"severity": "info"|"low"|"medium"|"high"|"critical", "message": string, "location": string?}]}"#
        }
        StageName::IssueDrafting => {
            r#"{"issues": [{"title": string (at most 256 characters), "body": string, "labels": [string], "severity": "info"|"low"|"medium"|"high"|"critical"}]}"#
        }
        StageName::FixPlanning => r#"{"steps": [{"target": string, "rationale": string}]}"#,
        StageName::FixImplementation => {
            r#"{"summary": string, "diffs": [{"path": string, "diff": string (unified diff)}]}"#
        }
        StageName::Qa => {
            r#"{"passed": boolean, "findings": [{"severity": ..., "message": string, "location": string?}], "confidence": number between 0 and 1}"#
        }
        StageName::Documentation => r#"{"summary": string, "files": [string]}"#,
    }
}

fn task(stage: StageName) -> &'static str {
    match stage {
        StageName::Audit => {
            "Audit the repository for problems related to the task. Report concrete findings with a severity and, where possible, a file location."
        }
        StageName::IssueDrafting => {
            "Turn the audit findings into issues a maintainer could file. One issue per distinct problem; put the most severe first."
        }
        StageName::FixPlanning => {
            "Plan the changes that resolve the drafted issues as an ordered list of steps, each naming the file or region it touches."
        }
        StageName::FixImplementation => {
            "Implement the fix plan as unified diffs, one entry per file."
        }
        StageName::Qa => {
            "Review the patch against the fix plan and the issues. Set passed to false if the patch is incorrect or incomplete."
        }
        StageName::Documentation => {
            "List the documentation that must change because of the patch and summarise the update."
        }
    }
}

pub fn system_prompt(stage: StageName) -> String {
    format!(
        r#"You are one worker in an automated code maintenance pipeline, handling the `{stage}` stage.

## Task
{task}

## Output
Reply with a single JSON object and nothing else, shaped as:
{shape}

Do not wrap the object in prose. Unknown fields are rejected."#,
        task = task(stage),
        shape = output_shape(stage),
    )
}

/// The run context and every earlier stage result, as JSON.
pub fn user_prompt(request: &WorkerCallRequest) -> Result<String> {
    let context = serde_json::to_string_pretty(&request.context)?;
    let inputs = serde_json::to_string_pretty(&request.inputs)?;
    Ok(format!(
        "## Context\n{context}\n\n## Earlier stage results\n{inputs}\n"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_system_prompt_names_stage_and_shape() {
        let prompt = system_prompt(StageName::Qa);
        assert!(prompt.contains("`qa` stage"));
        assert!(prompt.contains("\"confidence\""));
    }

    #[test]
    fn test_user_prompt_carries_inputs() {
        let mut request = testing::call_request("fix-plan", StageName::FixPlanning);
        request.inputs.push(testing::issue_batch(1));
        let prompt = user_prompt(&request).unwrap();
        assert!(prompt.contains("acme/widgets"));
        assert!(prompt.contains("Fix stale section 0"));
    }
}
