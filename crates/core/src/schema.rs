//! Named structured-output schemas.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::error::{ValidationError, ValidationResult};

/// Immutable name → JSON schema table.
///
/// Built once during startup (see the infra config loader) and handed to the
/// enqueuer explicitly. Cloning is cheap; the table itself is shared.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: Arc<BTreeMap<String, JsonValue>>,
}

impl SchemaRegistry {
    pub fn new(schemas: BTreeMap<String, JsonValue>) -> Self {
        Self {
            schemas: Arc::new(schemas),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.schemas.get(name)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Pick the effective schema from an inline value and an optional shortcut.
    ///
    /// `location` is only used to make the conflict error point at the right
    /// sub-task.
    pub fn resolve(
        &self,
        inline: Option<JsonValue>,
        name: Option<&str>,
        location: Option<String>,
    ) -> ValidationResult<Option<JsonValue>> {
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        match (inline, name) {
            (Some(_), Some(_)) => Err(ValidationError::conflicting_schema(location)),
            (Some(schema), None) => Ok(Some(schema)),
            (None, Some(name)) => self
                .get(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| ValidationError::unknown_schema(name)),
            (None, None) => Ok(None),
        }
    }
}

impl FromIterator<(String, JsonValue)> for SchemaRegistry {
    fn from_iter<I: IntoIterator<Item = (String, JsonValue)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        [("person".to_string(), json!({"type": "object"}))]
            .into_iter()
            .collect()
    }

    #[test]
    fn resolves_known_name() {
        let schema = registry().resolve(None, Some("person"), None).unwrap();
        assert_eq!(schema, Some(json!({"type": "object"})));
    }

    #[test]
    fn unknown_name_is_rejected() {
        let err = registry().resolve(None, Some("nope"), None).unwrap_err();
        assert_eq!(err, ValidationError::UnknownSchema("nope".to_string()));
    }

    #[test]
    fn inline_and_name_conflict() {
        let err = registry()
            .resolve(Some(json!({})), Some("person"), Some("sub_task[0]".into()))
            .unwrap_err();
        assert!(matches!(err, ValidationError::ConflictingSchema { .. }));
    }

    #[test]
    fn blank_name_is_ignored() {
        assert_eq!(registry().resolve(None, Some("  "), None).unwrap(), None);
    }
}
