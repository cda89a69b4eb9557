//! Per-rule state of a pipeline run.

use std::collections::{BTreeMap, BTreeSet};

/// State carried through the application of a pipeline to one rule.
///
/// A fresh state is created for every rule, so nothing leaks between rules of
/// a collection.
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    applied: BTreeSet<String>,
    values: BTreeMap<String, serde_json::Value>,
    vars: BTreeMap<String, Vec<String>>,
}

impl PipelineState {
    pub fn new(vars: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            vars,
            ..Default::default()
        }
    }

    /// Record that the processing item with `id` changed the rule.
    pub fn mark_applied(&mut self, id: &str) {
        self.applied.insert(id.to_string());
    }

    pub fn was_applied(&self, id: &str) -> bool {
        self.applied.contains(id)
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: String, value: serde_json::Value) {
        self.values.insert(key, value);
    }

    /// Values of a placeholder variable, if defined.
    pub fn var(&self, name: &str) -> Option<&[String]> {
        self.vars.get(name).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_applied_tracking() {
        let mut state = PipelineState::default();
        assert!(!state.was_applied("map"));
        state.mark_applied("map");
        assert!(state.was_applied("map"));
    }

    #[test]
    fn test_values_and_vars() {
        let mut vars = BTreeMap::new();
        vars.insert("admins".to_string(), vec!["root".to_string()]);
        let mut state = PipelineState::new(vars);

        state.set("index".to_string(), serde_json::json!("winlogbeat-*"));
        assert_eq!(state.get("index"), Some(&serde_json::json!("winlogbeat-*")));
        assert_eq!(state.var("admins"), Some(&["root".to_string()][..]));
        assert_eq!(state.var("missing"), None);
    }
}
