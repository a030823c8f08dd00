//! Read-only views over stored results.
//!
//! Responses are stored as raw model text; every view normalizes them so
//! JSON answers nested in strings come out as structured JSON.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value as JsonValue};

use dprompts_core::{normalize, GroupId, JobId};

use crate::error::StoreResult;
use crate::store::{GroupSummary, ResultQuery, ResultRecord};

/// A result ready for display or export.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultView {
    pub job_id: JobId,
    pub group_name: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Normalized response payload.
    pub result: JsonValue,
}

impl From<ResultRecord> for ResultView {
    fn from(record: ResultRecord) -> Self {
        Self {
            job_id: record.job_id,
            group_name: record.group_name,
            created_at: record.created_at,
            result: normalize(record.response),
        }
    }
}

impl ResultView {
    /// JSON export artifact.
    pub fn artifact(&self) -> JsonValue {
        json!({
            "job_id": self.job_id,
            "created_at": self.created_at,
            "result": self.result,
            "metadata": { "group_name": self.group_name },
        })
    }

    /// One `(label, body)` pair per response: `response` for a single prompt,
    /// the sub-task index otherwise, in sub-task order.
    pub fn sections(&self) -> Vec<(String, String)> {
        match &self.result {
            JsonValue::Object(map) => {
                let mut sections: Vec<_> = map
                    .iter()
                    .map(|(key, value)| (key.clone(), render_body(value)))
                    .collect();
                sections.sort_by_key(|(key, _)| (key.parse::<usize>().ok(), key.clone()));
                sections
            }
            other => vec![("response".to_string(), render_body(other))],
        }
    }
}

fn render_body(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Plain-text transcript, also used for text exports.
impl fmt::Display for ResultView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "job_id: {}", self.job_id)?;
        writeln!(
            f,
            "created_at: {}",
            self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        )?;
        writeln!(f, "group: {}", self.group_name.as_deref().unwrap_or("-"))?;
        for (label, body) in self.sections() {
            writeln!(f)?;
            writeln!(f, "[{label}]")?;
            writeln!(f, "{body}")?;
        }
        Ok(())
    }
}

/// Query-only service behind the `view` commands.
pub struct ResultViewer<Q> {
    store: Q,
}

impl<Q: ResultQuery> ResultViewer<Q> {
    pub fn new(store: Q) -> Self {
        Self { store }
    }

    /// The `limit` most recent results.
    pub async fn latest(&self, limit: usize) -> StoreResult<Vec<ResultView>> {
        let records = self.store.latest_results(limit).await?;
        Ok(records.into_iter().map(ResultView::from).collect())
    }

    pub async fn group(&self, group: GroupId) -> StoreResult<Vec<ResultView>> {
        let records = self.store.group_results(group).await?;
        Ok(records.into_iter().map(ResultView::from).collect())
    }

    pub async fn groups(&self) -> StoreResult<Vec<GroupSummary>> {
        self.store.group_summaries().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    use crate::error::StoreError;
    use crate::store::{GroupResolver, InMemoryStore, ResultStore, Store};

    fn view(response: JsonValue, group: Option<&str>) -> ResultView {
        ResultView::from(ResultRecord {
            job_id: JobId::new(7),
            response,
            group_id: group.map(|_| GroupId::new(1)),
            group_name: group.map(str::to_string),
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        })
    }

    async fn seed(store: &InMemoryStore, job: i64, text: &str, group: Option<&str>) {
        let mut tx = store.begin().await.unwrap();
        let group_id = store.resolve_group(&mut tx, group).await.unwrap();
        store
            .upsert_result(&mut tx, JobId::new(job), &json!({"response": text}), group_id)
            .await
            .unwrap();
        store.commit(tx).await.unwrap();
    }

    #[test]
    fn nested_json_answers_are_normalized() {
        let view = view(json!({"response": "{\"total\": 12, \"lines\": \"[1,2]\"}"}), None);
        assert_eq!(view.result, json!({"response": {"total": 12, "lines": [1, 2]}}));
    }

    #[test]
    fn artifact_carries_group_metadata() {
        let artifact = view(json!({"response": "plain"}), Some("g1")).artifact();
        assert_eq!(artifact["job_id"], json!(7));
        assert_eq!(artifact["result"], json!({"response": "plain"}));
        assert_eq!(artifact["metadata"], json!({"group_name": "g1"}));
        assert_eq!(artifact["created_at"], json!("2026-03-01T12:00:00Z"));

        let ungrouped = view(json!({"response": "plain"}), None).artifact();
        assert_eq!(ungrouped["metadata"], json!({"group_name": null}));
    }

    #[test]
    fn transcript_lists_each_section() {
        let text = view(json!({"0": "first", "1": "{\"a\":1}"}), Some("batch")).to_string();
        assert!(text.starts_with("job_id: 7\ncreated_at: 2026-03-01T12:00:00Z\ngroup: batch\n"));
        assert!(text.contains("[0]\nfirst\n"));
        assert!(text.contains("[1]\n{\n  \"a\": 1\n}\n"));
    }

    #[tokio::test]
    async fn viewer_reads_latest_and_groups() {
        let store = InMemoryStore::new();
        seed(&store, 1, "one", Some("g1")).await;
        seed(&store, 2, "two", Some("g1")).await;
        seed(&store, 3, "three", None).await;

        let viewer = ResultViewer::new(store.clone());
        let latest = viewer.latest(2).await.unwrap();
        assert_eq!(latest.len(), 2);

        let groups = viewer.groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].result_count, 2);

        let members = viewer.group(groups[0].id).await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|v| v.group_name.as_deref() == Some("g1")));

        let missing = viewer.group(GroupId::new(99)).await.unwrap_err();
        assert!(matches!(missing, StoreError::GroupNotFound(_)));
    }
}
