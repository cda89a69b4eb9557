//! Processing pipelines.
//!
//! A processing pipeline is an ordered list of processing items. Each item
//! wraps one [`Transformation`] with the conditions deciding which rules and
//! which detection items it touches. Pipelines adapt rules to the field names
//! and conventions of a target environment before a backend lowers them.
//!
//! Pipelines are never modified in place: [`ProcessingPipeline::concat`] and
//! `+` build a new pipeline whose items run in the order of the operands.
//!
//! # Examples
//!
//! ```rust
//! use sigma_convert::pipeline::ProcessingPipeline;
//! use sigma_convert::rule::SigmaCollection;
//!
//! let pipeline = ProcessingPipeline::from_yaml(r#"
//! name: ECS process fields
//! transformations:
//!   - id: ecs_process
//!     type: field_name_mapping
//!     mapping:
//!       Image: process.executable
//!     rule_conditions:
//!       - type: logsource
//!         category: process_creation
//! "#)?;
//!
//! let collection = SigmaCollection::from_yaml(r#"
//! title: Whoami
//! logsource:
//!     category: process_creation
//! detection:
//!     selection:
//!         Image|endswith: '\whoami.exe'
//!     condition: selection
//! "#)?;
//!
//! let processed = pipeline.apply(&collection.rules[0]);
//! assert!(processed.failure.is_none());
//! assert!(processed.state.was_applied("ecs_process"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod builtin;
pub mod conditions;
pub mod registry;
pub mod state;
pub mod transformations;

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Add;

use serde_yaml::{Mapping, Value};

use crate::error::PipelineError;
use crate::rule::{DetectionItem, SigmaRule};

pub use conditions::{DetectionItemCondition, FieldMatcher, FieldNameCondition, RuleCondition};
pub use registry::{DirectoryCatalog, PipelineCatalog, PipelineInfo, PipelineRegistry};
pub use state::PipelineState;
pub use transformations::Transformation;

type Result<T> = std::result::Result<T, PipelineError>;

/// How the rule conditions of an item are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConditionLogic {
    #[default]
    And,
    Or,
}

/// One transformation with its gating conditions.
#[derive(Debug, Clone)]
pub struct ProcessingItem {
    /// Id recorded in the pipeline state when the item changes a rule.
    pub id: Option<String>,
    pub transformation: Transformation,
    pub rule_conditions: Vec<RuleCondition>,
    pub rule_cond_op: ConditionLogic,
    pub rule_cond_not: bool,
    pub detection_item_conditions: Vec<DetectionItemCondition>,
    pub field_name_conditions: Vec<FieldNameCondition>,
    pub field_name_cond_not: bool,
}

impl ProcessingItem {
    /// Create an unconditional item.
    pub fn new(transformation: Transformation) -> Self {
        Self {
            id: None,
            transformation,
            rule_conditions: Vec::new(),
            rule_cond_op: ConditionLogic::And,
            rule_cond_not: false,
            detection_item_conditions: Vec::new(),
            field_name_conditions: Vec::new(),
            field_name_cond_not: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_rule_condition(mut self, condition: RuleCondition) -> Self {
        self.rule_conditions.push(condition);
        self
    }

    fn from_yaml(value: &Value) -> Result<Self> {
        let map = value
            .as_mapping()
            .ok_or_else(|| PipelineError::Invalid("transformation must be a mapping".to_string()))?;
        let fields = YamlFields::new(map);

        let rule_cond_op = match fields.optional("rule_cond_op").as_deref() {
            None | Some("and") => ConditionLogic::And,
            Some("or") => ConditionLogic::Or,
            Some(other) => {
                return Err(PipelineError::Invalid(format!(
                    "unknown rule_cond_op '{other}'"
                )))
            }
        };

        Ok(Self {
            id: fields.optional("id"),
            transformation: Transformation::from_yaml(map)?,
            rule_conditions: fields.mappings("rule_conditions", RuleCondition::from_yaml)?,
            rule_cond_op,
            rule_cond_not: fields.flag("rule_cond_not"),
            detection_item_conditions: fields
                .mappings("detection_item_conditions", DetectionItemCondition::from_yaml)?,
            field_name_conditions: fields
                .mappings("field_name_conditions", FieldNameCondition::from_yaml)?,
            field_name_cond_not: fields.flag("field_name_cond_not"),
        })
    }

    fn matches_rule(&self, rule: &SigmaRule, state: &PipelineState) -> bool {
        if self.rule_conditions.is_empty() {
            return true;
        }
        let matched = match self.rule_cond_op {
            ConditionLogic::And => self.rule_conditions.iter().all(|c| c.matches(rule, state)),
            ConditionLogic::Or => self.rule_conditions.iter().any(|c| c.matches(rule, state)),
        };
        matched != self.rule_cond_not
    }

    /// Check whether an item-level transformation applies to `item`.
    pub(crate) fn selects(&self, item: &DetectionItem) -> bool {
        if !self.detection_item_conditions.iter().all(|c| c.matches(item)) {
            return false;
        }
        if self.field_name_conditions.is_empty() {
            return true;
        }
        let field = item.field.name.as_deref();
        let matched = self.field_name_conditions.iter().all(|c| c.matches(field));
        matched != self.field_name_cond_not
    }
}

/// A rule after pipeline processing.
#[derive(Debug, Clone)]
pub struct ProcessedRule {
    pub rule: SigmaRule,
    /// Final pipeline state, read by backends for values such as index names.
    pub state: PipelineState,
    /// Set when a `rule_failure` or `detection_item_failure` item fired.
    pub failure: Option<String>,
}

impl ProcessedRule {
    /// Wrap a rule that no pipeline touched.
    pub fn unprocessed(rule: &SigmaRule) -> Self {
        Self {
            rule: rule.clone(),
            state: PipelineState::default(),
            failure: None,
        }
    }
}

/// An ordered, composable list of processing items.
#[derive(Debug, Clone, Default)]
pub struct ProcessingPipeline {
    /// Display name.
    pub name: Option<String>,
    /// Informational only; composition order alone decides execution order.
    pub priority: i64,
    /// Backends this pipeline is meant for; `None` means any backend. An
    /// empty set, left by composing disjoint restrictions, allows none.
    pub allowed_backends: Option<BTreeSet<String>>,
    /// Values of `%name%` placeholders.
    pub vars: BTreeMap<String, Vec<String>>,
    pub items: Vec<ProcessingItem>,
}

impl ProcessingPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a pipeline definition.
    ///
    /// # Errors
    /// Returns an error if the YAML is malformed, a transformation or
    /// condition type is unknown, or a regular expression does not compile.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(text)?;
        let map = value
            .as_mapping()
            .ok_or_else(|| PipelineError::Invalid("pipeline must be a mapping".to_string()))?;
        let fields = YamlFields::new(map);

        let items = match fields.get("transformations") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Sequence(seq)) => seq
                .iter()
                .map(ProcessingItem::from_yaml)
                .collect::<Result<Vec<_>>>()?,
            Some(_) => {
                return Err(PipelineError::Invalid(
                    "transformations must be a list".to_string(),
                ))
            }
        };

        let mut vars = BTreeMap::new();
        if let Some(Value::Mapping(entries)) = fields.get("vars") {
            for (key, value) in entries {
                let Some(key) = key.as_str() else {
                    continue;
                };
                vars.insert(key.to_string(), yaml_strings(value));
            }
        }

        Ok(Self {
            name: fields.optional("name"),
            priority: fields.get("priority").and_then(Value::as_i64).unwrap_or(0),
            allowed_backends: Some(fields.list("allowed_backends"))
                .filter(|backends| !backends.is_empty())
                .map(|backends| backends.into_iter().collect()),
            vars,
            items,
        })
    }

    pub fn with_item(mut self, item: ProcessingItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Check whether this pipeline may be used with `backend`.
    pub fn allows_backend(&self, backend: &str) -> bool {
        self.allowed_backends
            .as_ref()
            .map_or(true, |allowed| allowed.contains(backend))
    }

    /// Compose two pipelines: `self`'s items run before `other`'s.
    ///
    /// Variables are merged with `other` winning on conflicts. Allowed backend
    /// sets are intersected when both are restricted, so disjoint
    /// restrictions compose into a pipeline usable with no backend.
    pub fn concat(&self, other: &ProcessingPipeline) -> ProcessingPipeline {
        let name = match (&self.name, &other.name) {
            (Some(a), Some(b)) => Some(format!("{a} + {b}")),
            (a, b) => a.clone().or_else(|| b.clone()),
        };

        let allowed_backends = match (&self.allowed_backends, &other.allowed_backends) {
            (Some(a), Some(b)) => Some(a.intersection(b).cloned().collect()),
            (a, b) => a.clone().or_else(|| b.clone()),
        };

        let mut vars = self.vars.clone();
        vars.extend(other.vars.clone());

        let mut items = self.items.clone();
        items.extend(other.items.iter().cloned());

        ProcessingPipeline {
            name,
            priority: self.priority.min(other.priority),
            allowed_backends,
            vars,
            items,
        }
    }

    /// Apply the pipeline to a copy of `rule`.
    ///
    /// Processing stops at the first failure item that fires.
    pub fn apply(&self, rule: &SigmaRule) -> ProcessedRule {
        let mut processed = rule.clone();
        let mut state = PipelineState::new(self.vars.clone());
        let mut failure = None;

        for item in &self.items {
            if !item.matches_rule(&processed, &state) {
                continue;
            }

            let outcome = item.transformation.apply(&mut processed, &mut state, item);
            if outcome.applied {
                if let Some(id) = &item.id {
                    tracing::trace!(item = %id, rule = %processed.title, "processing item applied");
                    state.mark_applied(id);
                }
            }
            if outcome.failure.is_some() {
                failure = outcome.failure;
                break;
            }
        }

        ProcessedRule {
            rule: processed,
            state,
            failure,
        }
    }

}

impl Add for ProcessingPipeline {
    type Output = ProcessingPipeline;

    fn add(self, other: ProcessingPipeline) -> ProcessingPipeline {
        self.concat(&other)
    }
}

impl<'a> Add<&'a ProcessingPipeline> for &'a ProcessingPipeline {
    type Output = ProcessingPipeline;

    fn add(self, other: &'a ProcessingPipeline) -> ProcessingPipeline {
        self.concat(other)
    }
}

/// Typed access to the keys of a YAML mapping in pipeline definitions.
pub(crate) struct YamlFields<'a> {
    map: &'a Mapping,
}

impl<'a> YamlFields<'a> {
    pub(crate) fn new(map: &'a Mapping) -> Self {
        Self { map }
    }

    pub(crate) fn get(&self, key: &str) -> Option<&'a Value> {
        self.map.get(key)
    }

    pub(crate) fn required(&self, key: &str) -> Result<&'a str> {
        self.get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::Invalid(format!("missing string field '{key}'")))
    }

    pub(crate) fn optional(&self, key: &str) -> Option<String> {
        self.get(key).and_then(Value::as_str).map(str::to_string)
    }

    pub(crate) fn flag(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub(crate) fn list(&self, key: &str) -> Vec<String> {
        self.get(key).map(yaml_strings).unwrap_or_default()
    }

    /// Convert a YAML value to JSON; a missing key yields `null`.
    pub(crate) fn json(&self, key: &str) -> Result<serde_json::Value> {
        match self.get(key) {
            None => Ok(serde_json::Value::Null),
            Some(value) => serde_json::to_value(value)
                .map_err(|e| PipelineError::Invalid(format!("value of '{key}': {e}"))),
        }
    }

    /// Parse a list of mappings with `parse`.
    pub(crate) fn mappings<T>(
        &self,
        key: &str,
        parse: impl Fn(&Mapping) -> Result<T>,
    ) -> Result<Vec<T>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Sequence(seq)) => seq
                .iter()
                .map(|entry| {
                    entry
                        .as_mapping()
                        .ok_or_else(|| {
                            PipelineError::Invalid(format!("entries of '{key}' must be mappings"))
                        })
                        .and_then(&parse)
                })
                .collect(),
            Some(_) => Err(PipelineError::Invalid(format!("'{key}' must be a list"))),
        }
    }
}

/// Strings of a scalar or a list of scalars.
fn yaml_strings(value: &Value) -> Vec<String> {
    let scalar = |v: &Value| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    };
    match value {
        Value::Sequence(seq) => seq.iter().filter_map(scalar).collect(),
        other => scalar(other).into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Detection, SigmaCollection};

    const RULE: &str = r#"
title: Test
logsource:
    category: process_creation
    product: windows
detection:
    selection:
        Image: 'C:\x.exe'
        CommandLine|contains: 'evil'
    condition: selection
"#;

    fn rule() -> SigmaRule {
        SigmaCollection::from_yaml(RULE).unwrap().rules.remove(0)
    }

    fn field_names(rule: &SigmaRule) -> Vec<String> {
        let mut names = Vec::new();
        for (_, detection) in &rule.detection.named {
            detection.for_each_item(&mut |item| {
                names.push(item.field.name.clone().unwrap_or_default());
            });
        }
        names
    }

    fn mapping_pipeline(from: &str, to: &str) -> ProcessingPipeline {
        ProcessingPipeline::from_yaml(&format!(
            "transformations:\n  - type: field_name_mapping\n    mapping:\n      {from}: {to}\n"
        ))
        .unwrap()
    }

    #[test]
    fn test_parse_pipeline() {
        let pipeline = ProcessingPipeline::from_yaml(
            r#"
name: Test pipeline
priority: 20
allowed_backends: [splunk]
vars:
    admins: [root, admin]
transformations:
  - id: map
    type: field_name_prefix
    prefix: "event."
    rule_cond_op: or
    rule_conditions:
      - type: logsource
        product: windows
      - type: logsource
        product: linux
"#,
        )
        .unwrap();
        assert_eq!(pipeline.name.as_deref(), Some("Test pipeline"));
        assert_eq!(pipeline.priority, 20);
        assert!(pipeline.allows_backend("splunk"));
        assert!(!pipeline.allows_backend("kusto"));
        assert_eq!(pipeline.vars["admins"].len(), 2);
        assert_eq!(pipeline.items.len(), 1);
        assert_eq!(pipeline.items[0].rule_cond_op, ConditionLogic::Or);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ProcessingPipeline::from_yaml("transformations: [ {type: teleport} ]"),
            Err(PipelineError::UnknownTransformation(_))
        ));
        assert!(matches!(
            ProcessingPipeline::from_yaml("- not a mapping"),
            Err(PipelineError::Invalid(_))
        ));
        assert!(matches!(
            ProcessingPipeline::from_yaml("transformations: [ {type: x"),
            Err(PipelineError::Yaml(_))
        ));
    }

    #[test]
    fn test_apply_leaves_input_untouched() {
        let rule = rule();
        let processed = mapping_pipeline("Image", "process.executable").apply(&rule);
        assert_eq!(field_names(&processed.rule), vec!["process.executable", "CommandLine"]);
        assert_eq!(field_names(&rule), vec!["Image", "CommandLine"]);
    }

    #[test]
    fn test_concat_order_matters() {
        let a = mapping_pipeline("Image", "ProcessPath");
        let b = mapping_pipeline("ProcessPath", "FolderPath");

        let ab = a.concat(&b).apply(&rule());
        let ba = (&b + &a).apply(&rule());
        assert_eq!(field_names(&ab.rule)[0], "FolderPath");
        assert_eq!(field_names(&ba.rule)[0], "ProcessPath");
    }

    #[test]
    fn test_concat_merges_metadata() {
        let mut a = ProcessingPipeline::new();
        a.allowed_backends = Some(["splunk", "lucene"].iter().map(|s| s.to_string()).collect());
        a.vars.insert("x".to_string(), vec!["1".to_string()]);
        let mut b = ProcessingPipeline::new();
        b.allowed_backends = Some(["lucene"].iter().map(|s| s.to_string()).collect());
        b.vars.insert("x".to_string(), vec!["2".to_string()]);

        let combined = a.clone() + b;
        assert_eq!(combined.allowed_backends.as_ref().map(BTreeSet::len), Some(1));
        assert!(combined.allows_backend("lucene"));
        assert_eq!(combined.vars["x"], vec!["2".to_string()]);
        assert_eq!(a.vars["x"], vec!["1".to_string()]);

        let unrestricted = ProcessingPipeline::new().concat(&a);
        assert_eq!(unrestricted.allowed_backends, a.allowed_backends);
    }

    #[test]
    fn test_concat_of_disjoint_restrictions_allows_nothing() {
        let mut splunk = ProcessingPipeline::new();
        splunk.allowed_backends = Some(BTreeSet::from(["splunk".to_string()]));
        let mut lucene = ProcessingPipeline::new();
        lucene.allowed_backends = Some(BTreeSet::from(["lucene".to_string()]));

        let combined = splunk.concat(&lucene);
        assert_eq!(combined.allowed_backends, Some(BTreeSet::new()));
        for backend in ["splunk", "lucene", "kusto"] {
            assert!(!combined.allows_backend(backend), "{backend}");
        }
        assert!(ProcessingPipeline::new().allows_backend("kusto"));
    }

    #[test]
    fn test_empty_allowed_backends_list_is_unrestricted() {
        let pipeline =
            ProcessingPipeline::from_yaml("allowed_backends: []
transformations: []
").unwrap();
        assert_eq!(pipeline.allowed_backends, None);
        assert!(pipeline.allows_backend("kusto"));
    }

    #[test]
    fn test_rule_conditions_gate_items() {
        let pipeline = ProcessingPipeline::from_yaml(
            r#"
transformations:
  - id: linux_only
    type: field_name_prefix
    prefix: "linux."
    rule_conditions:
      - type: logsource
        product: linux
  - id: not_linux
    type: field_name_suffix
    suffix: ".win"
    rule_cond_not: true
    rule_conditions:
      - type: logsource
        product: linux
"#,
        )
        .unwrap();
        let processed = pipeline.apply(&rule());
        assert!(!processed.state.was_applied("linux_only"));
        assert!(processed.state.was_applied("not_linux"));
        assert_eq!(field_names(&processed.rule), vec!["Image.win", "CommandLine.win"]);
    }

    #[test]
    fn test_field_name_conditions_select_items() {
        let pipeline = ProcessingPipeline::from_yaml(
            r#"
transformations:
  - type: field_name_prefix
    prefix: "proc."
    field_name_conditions:
      - type: include_fields
        fields: [Image]
"#,
        )
        .unwrap();
        let processed = pipeline.apply(&rule());
        assert_eq!(field_names(&processed.rule), vec!["proc.Image", "CommandLine"]);
    }

    #[test]
    fn test_failure_stops_processing() {
        let pipeline = ProcessingPipeline::from_yaml(
            r#"
transformations:
  - type: rule_failure
    message: "process creation is not supported"
  - id: later
    type: field_name_prefix
    prefix: "x."
"#,
        )
        .unwrap();
        let processed = pipeline.apply(&rule());
        assert_eq!(
            processed.failure.as_deref(),
            Some("process creation is not supported")
        );
        assert!(!processed.state.was_applied("later"));
        assert!(matches!(
            processed.rule.detection.get("selection"),
            Some(Detection::AllOf(_))
        ));
    }
}
