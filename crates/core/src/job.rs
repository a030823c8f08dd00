//! Job shapes: loose input specification and validated queue arguments.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{ValidationError, ValidationResult};
use crate::schema::SchemaRegistry;

/// Kind recorded on every queued job; workers only claim this kind.
pub const JOB_KIND: &str = "dprompts-worker";

/// A job as written by an operator (CLI `--args` or one bulk item).
///
/// Every field is optional here; [`JobSpec::into_args`] decides which shape the
/// job has and rejects anything incomplete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_tasks: Option<Vec<SubTaskSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

/// One sub-task as written by an operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubTaskSpec {
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

/// Validated job arguments, stored by the queue engine as the job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    pub task: JobTask,
}

/// The two execution shapes.
///
/// A single prompt is one external call. A sub-task list is N sequential calls
/// sharing the job's base prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum JobTask {
    SinglePrompt {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<JsonValue>,
    },
    SubTaskList { sub_tasks: Vec<SubTask> },
}

/// A validated sub-task with its schema already expanded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

impl JobSpec {
    pub fn single(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    pub fn with_group(mut self, group_name: impl Into<String>) -> Self {
        self.group_name = Some(group_name.into());
        self
    }

    /// Validate the specification and expand schema shortcuts.
    ///
    /// Returns the queue arguments plus the metadata to attach to the queue
    /// row: the job-level `metadata` if present, otherwise the first
    /// sub-task's.
    pub fn into_args(
        self,
        schemas: &SchemaRegistry,
    ) -> ValidationResult<(JobArgs, Option<JsonValue>)> {
        let job_schema = schemas.resolve(self.schema, self.schema_name.as_deref(), None)?;
        let sub_tasks = self.sub_tasks.filter(|s| !s.is_empty());

        let (task, fallback_metadata) = match (self.prompt, sub_tasks) {
            (Some(_), Some(_)) => return Err(ValidationError::AmbiguousShape),
            (None, None) => return Err(ValidationError::MissingPrompt),
            (Some(prompt), None) => {
                if prompt.trim().is_empty() {
                    return Err(ValidationError::MissingPrompt);
                }
                (
                    JobTask::SinglePrompt {
                        prompt,
                        schema: job_schema,
                    },
                    None,
                )
            }
            (None, Some(specs)) => {
                let first_metadata = specs.first().and_then(|s| s.metadata.clone());
                let mut sub_tasks = Vec::with_capacity(specs.len());
                for (index, spec) in specs.into_iter().enumerate() {
                    if spec.prompt.trim().is_empty() {
                        return Err(ValidationError::EmptySubTaskPrompt { index });
                    }
                    let schema = schemas
                        .resolve(
                            spec.schema,
                            spec.schema_name.as_deref(),
                            Some(format!("sub_task[{index}]")),
                        )?
                        .or_else(|| job_schema.clone());
                    sub_tasks.push(SubTask {
                        prompt: spec.prompt,
                        schema,
                        metadata: spec.metadata,
                    });
                }
                (JobTask::SubTaskList { sub_tasks }, first_metadata)
            }
        };

        let args = JobArgs {
            base_prompt: non_blank(self.base_prompt),
            group_name: non_blank(self.group_name).map(|g| g.trim().to_string()),
            task,
        };

        Ok((args, self.metadata.or(fallback_metadata)))
    }
}

impl JobArgs {
    /// Number of external calls this job performs.
    pub fn call_count(&self) -> usize {
        match &self.task {
            JobTask::SinglePrompt { .. } => 1,
            JobTask::SubTaskList { sub_tasks } => sub_tasks.len(),
        }
    }

    /// Prompts in execution order, each with its structured-output schema.
    pub fn prompts(&self) -> Vec<(&str, Option<&JsonValue>)> {
        match &self.task {
            JobTask::SinglePrompt { prompt, schema } => vec![(prompt.as_str(), schema.as_ref())],
            JobTask::SubTaskList { sub_tasks } => sub_tasks
                .iter()
                .map(|s| (s.prompt.as_str(), s.schema.as_ref()))
                .collect(),
        }
    }

    pub fn is_single(&self) -> bool {
        matches!(self.task, JobTask::SinglePrompt { .. })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schemas() -> SchemaRegistry {
        [("answer".to_string(), json!({"type": "object", "required": ["answer"]}))]
            .into_iter()
            .collect()
    }

    fn spec(value: JsonValue) -> JobSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn single_prompt_with_group() {
        let (args, metadata) = spec(json!({"prompt": "hi", "group_name": " g1 "}))
            .into_args(&schemas())
            .unwrap();

        assert_eq!(args.group_name.as_deref(), Some("g1"));
        assert!(args.is_single());
        assert_eq!(args.call_count(), 1);
        assert_eq!(metadata, None);
    }

    #[test]
    fn schema_name_is_expanded() {
        let (args, _) = spec(json!({"prompt": "hi", "schema_name": "answer"}))
            .into_args(&schemas())
            .unwrap();

        let prompts = args.prompts();
        assert_eq!(prompts[0].1, Some(&json!({"type": "object", "required": ["answer"]})));
    }

    #[test]
    fn unknown_schema_name_fails() {
        let err = spec(json!({"prompt": "hi", "schema_name": "missing"}))
            .into_args(&schemas())
            .unwrap_err();
        assert_eq!(err, ValidationError::UnknownSchema("missing".into()));
    }

    #[test]
    fn empty_prompt_fails() {
        let err = spec(json!({"prompt": "   "})).into_args(&schemas()).unwrap_err();
        assert_eq!(err, ValidationError::MissingPrompt);

        let err = spec(json!({})).into_args(&schemas()).unwrap_err();
        assert_eq!(err, ValidationError::MissingPrompt);

        let err = spec(json!({"sub_tasks": []})).into_args(&schemas()).unwrap_err();
        assert_eq!(err, ValidationError::MissingPrompt);
    }

    #[test]
    fn empty_sub_task_prompt_reports_index() {
        let err = spec(json!({"sub_tasks": [{"prompt": "a"}, {"prompt": ""}]}))
            .into_args(&schemas())
            .unwrap_err();
        assert_eq!(err, ValidationError::EmptySubTaskPrompt { index: 1 });
    }

    #[test]
    fn both_shapes_are_ambiguous() {
        let err = spec(json!({"prompt": "a", "sub_tasks": [{"prompt": "b"}]}))
            .into_args(&schemas())
            .unwrap_err();
        assert_eq!(err, ValidationError::AmbiguousShape);
    }

    #[test]
    fn sub_tasks_inherit_job_schema_and_first_metadata() {
        let (args, metadata) = spec(json!({
            "base_prompt": "be brief",
            "schema_name": "answer",
            "sub_tasks": [
                {"prompt": "one", "metadata": {"row": 1}},
                {"prompt": "two", "schema": {"type": "string"}}
            ]
        }))
        .into_args(&schemas())
        .unwrap();

        assert_eq!(metadata, Some(json!({"row": 1})));
        assert_eq!(args.base_prompt.as_deref(), Some("be brief"));
        let prompts = args.prompts();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0].1.unwrap()["required"], json!(["answer"]));
        assert_eq!(prompts[1].1, Some(&json!({"type": "string"})));
    }

    #[test]
    fn job_metadata_wins_over_sub_task_metadata() {
        let (_, metadata) = spec(json!({
            "metadata": {"source": "cli"},
            "sub_tasks": [{"prompt": "one", "metadata": {"row": 1}}]
        }))
        .into_args(&schemas())
        .unwrap();
        assert_eq!(metadata, Some(json!({"source": "cli"})));
    }

    #[test]
    fn args_carry_shape_tag() {
        let (args, _) = JobSpec::single("hi").into_args(&SchemaRegistry::empty()).unwrap();
        let value = serde_json::to_value(&args).unwrap();
        assert_eq!(value["task"]["shape"], "single_prompt");

        let back: JobArgs = serde_json::from_value(value).unwrap();
        assert_eq!(back, args);
    }
}
