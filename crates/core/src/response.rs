//! Assembly of per-call responses into the stored result payload.

use serde_json::{Map, Value as JsonValue};

use crate::job::JobArgs;

/// Key used for the single answer of a single-prompt job.
pub const SINGLE_RESPONSE_KEY: &str = "response";

/// Raw response texts of one job attempt, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePayload {
    Single(String),
    /// Sub-task index → raw response text.
    SubTasks(Vec<String>),
}

impl ResponsePayload {
    /// Pair collected responses with the job shape that produced them.
    pub fn for_job(args: &JobArgs, mut responses: Vec<String>) -> Self {
        if args.is_single() && responses.len() == 1 {
            Self::Single(responses.remove(0))
        } else {
            Self::SubTasks(responses)
        }
    }

    /// Serialized form stored in the results table.
    ///
    /// `{"response": "<text>"}` for a single prompt, `{"0": "<text>", ...}` for
    /// sub-tasks. Response texts are stored raw; normalization happens on read.
    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::new();
        match self {
            Self::Single(text) => {
                map.insert(SINGLE_RESPONSE_KEY.to_string(), JsonValue::String(text.clone()));
            }
            Self::SubTasks(texts) => {
                for (index, text) in texts.iter().enumerate() {
                    map.insert(index.to_string(), JsonValue::String(text.clone()));
                }
            }
        }
        JsonValue::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;
    use crate::schema::SchemaRegistry;
    use serde_json::json;

    #[test]
    fn single_prompt_payload() {
        let (args, _) = JobSpec::single("hi").into_args(&SchemaRegistry::empty()).unwrap();
        let payload = ResponsePayload::for_job(&args, vec!["ok".into()]);
        assert_eq!(payload.to_json(), json!({"response": "ok"}));
    }

    #[test]
    fn sub_task_payload_is_indexed() {
        let spec: JobSpec =
            serde_json::from_value(json!({"sub_tasks": [{"prompt": "a"}, {"prompt": "b"}]}))
                .unwrap();
        let (args, _) = spec.into_args(&SchemaRegistry::empty()).unwrap();
        let payload = ResponsePayload::for_job(&args, vec!["A".into(), "{\"x\":1}".into()]);
        assert_eq!(payload.to_json(), json!({"0": "A", "1": "{\"x\":1}"}));
    }
}
