use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Constraint on a single metadata key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterValue {
    /// Metadata value must equal this exactly.
    Exact(Value),
    /// Metadata value must equal one of these.
    AnyOf(Vec<Value>),
    /// Key is ignored.
    Any,
}

impl FilterValue {
    fn accepts(&self, actual: Option<&Value>) -> bool {
        match self {
            FilterValue::Any => true,
            FilterValue::Exact(expected) => actual == Some(expected),
            FilterValue::AnyOf(options) => actual.is_some_and(|a| options.contains(a)),
        }
    }
}

impl From<Value> for FilterValue {
    /// `null` ignores the key, an array means membership, anything else equality.
    fn from(value: Value) -> Self {
        match value {
            Value::Null => FilterValue::Any,
            Value::Array(options) => FilterValue::AnyOf(options),
            other => FilterValue::Exact(other),
        }
    }
}

/// Conjunction of per-key constraints on document metadata.
///
/// An empty filter accepts every document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataFilter {
    rules: BTreeMap<String, FilterValue>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.rules
            .insert(key.into(), FilterValue::Exact(value.into()));
        self
    }

    pub fn any_of<V: Into<Value>>(
        mut self,
        key: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let options = values.into_iter().map(Into::into).collect();
        self.rules.insert(key.into(), FilterValue::AnyOf(options));
        self
    }

    pub fn rule(mut self, key: impl Into<String>, value: FilterValue) -> Self {
        self.rules.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
        self.rules
            .iter()
            .all(|(key, rule)| rule.accepts(metadata.get(key)))
    }
}

impl From<Map<String, Value>> for MetadataFilter {
    fn from(map: Map<String, Value>) -> Self {
        Self {
            rules: map.into_iter().map(|(k, v)| (k, v.into())).collect(),
        }
    }
}

pub(crate) fn passes(filter: Option<&MetadataFilter>, metadata: &Map<String, Value>) -> bool {
    filter.map_or(true, |f| f.matches(metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn exact_match() {
        let f = MetadataFilter::new().equals("formula", "F1");
        assert!(f.matches(&meta(json!({"formula": "F1", "x": 1}))));
        assert!(!f.matches(&meta(json!({"formula": "F2"}))));
    }

    #[test]
    fn missing_key_is_rejected() {
        let f = MetadataFilter::new().equals("formula", "F1");
        assert!(!f.matches(&meta(json!({}))));

        let f = MetadataFilter::new().any_of("formula", ["F1"]);
        assert!(!f.matches(&meta(json!({}))));
    }

    #[test]
    fn any_of_is_membership() {
        let f = MetadataFilter::new().any_of("chunk_index", [0, 2]);
        assert!(f.matches(&meta(json!({"chunk_index": 2}))));
        assert!(!f.matches(&meta(json!({"chunk_index": 1}))));
    }

    #[test]
    fn any_ignores_key() {
        let f = MetadataFilter::new().rule("topic", FilterValue::Any);
        assert!(f.matches(&meta(json!({}))));
    }

    #[test]
    fn all_rules_must_hold() {
        let f = MetadataFilter::new().equals("a", 1).equals("b", true);
        assert!(f.matches(&meta(json!({"a": 1, "b": true}))));
        assert!(!f.matches(&meta(json!({"a": 1, "b": false}))));
    }

    #[test]
    fn from_json_map_follows_value_shape() {
        let f: MetadataFilter = meta(json!({
            "type": "pdf",
            "chunk_index": [0, 1],
            "ignored": null
        }))
        .into();
        assert!(f.matches(&meta(json!({"type": "pdf", "chunk_index": 1}))));
        assert!(!f.matches(&meta(json!({"type": "web", "chunk_index": 1}))));
        assert!(!f.matches(&meta(json!({"type": "pdf", "chunk_index": 5}))));
    }

    #[test]
    fn empty_filter_accepts_everything() {
        assert!(MetadataFilter::new().is_empty());
        assert!(passes(None, &meta(json!({}))));
        assert!(passes(Some(&MetadataFilter::new()), &meta(json!({"k": 1}))));
    }
}
