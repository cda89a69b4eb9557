//! Transformations applied by processing items.
//!
//! Item-level transformations walk the detection items of a rule and only
//! touch those selected by the item's detection item and field name
//! conditions. Rule-level transformations change the rule as a whole.

use std::collections::BTreeMap;

use regex::Regex;
use serde_yaml::{Mapping, Value};

use crate::error::PipelineError;
use crate::rule::parser::parse_item;
use crate::rule::{
    ConditionExpr, Detection, DetectionItem, LogSource, SigmaRule, SigmaString, SigmaValue,
    SpecialChar, StringPart,
};

use super::state::PipelineState;
use super::{ProcessingItem, YamlFields};

type Result<T> = std::result::Result<T, PipelineError>;

/// A rewrite step of a processing pipeline.
#[derive(Debug, Clone)]
pub enum Transformation {
    /// Rename fields; a field mapped to several names becomes an OR of them.
    FieldNameMapping {
        mapping: BTreeMap<String, Vec<String>>,
    },
    /// Replace the longest matching field name prefix.
    FieldNamePrefixMapping { mapping: BTreeMap<String, String> },
    FieldNamePrefix { prefix: String },
    FieldNameSuffix { suffix: String },
    DropDetectionItem,
    /// AND a generated detection onto every condition of the rule.
    AddCondition {
        conditions: Vec<DetectionItem>,
        negated: bool,
    },
    ChangeLogsource {
        category: Option<String>,
        product: Option<String>,
        service: Option<String>,
    },
    ReplaceString { regex: Regex, replacement: String },
    /// Substitute `%name%` placeholders with the pipeline variable values.
    ValuePlaceholders,
    /// Substitute `%name%` placeholders with a wildcard.
    WildcardPlaceholders,
    SetState {
        key: String,
        value: serde_json::Value,
    },
    RuleFailure { message: String },
    DetectionItemFailure { message: String },
}

/// Result of applying one transformation to one rule.
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    pub(crate) applied: bool,
    pub(crate) failure: Option<String>,
}

impl Outcome {
    fn applied(applied: bool) -> Self {
        Self {
            applied,
            failure: None,
        }
    }
}

/// What an item-level transformation did to a detection item.
enum ItemEdit {
    Unchanged,
    Changed,
    Replace(Detection),
    Drop,
}

impl Transformation {
    pub(crate) fn from_yaml(map: &Mapping) -> Result<Self> {
        let fields = YamlFields::new(map);
        let transformation = match fields.required("type")? {
            "field_name_mapping" => Transformation::FieldNameMapping {
                mapping: name_mapping(fields.get("mapping"))?,
            },
            "field_name_prefix_mapping" => {
                let mapping = name_mapping(fields.get("mapping"))?
                    .into_iter()
                    .map(|(from, mut to)| match to.len() {
                        1 => Ok((from, to.remove(0))),
                        _ => Err(PipelineError::Invalid(format!(
                            "prefix '{from}' must map to exactly one prefix"
                        ))),
                    })
                    .collect::<Result<BTreeMap<_, _>>>()?;
                Transformation::FieldNamePrefixMapping { mapping }
            }
            "field_name_prefix" => Transformation::FieldNamePrefix {
                prefix: fields.required("prefix")?.to_string(),
            },
            "field_name_suffix" => Transformation::FieldNameSuffix {
                suffix: fields.required("suffix")?.to_string(),
            },
            "drop_detection_item" => Transformation::DropDetectionItem,
            "add_condition" => {
                let Some(Value::Mapping(conditions)) = fields.get("conditions") else {
                    return Err(PipelineError::Invalid(
                        "add_condition requires a 'conditions' mapping".to_string(),
                    ));
                };
                let conditions = conditions
                    .iter()
                    .map(|(key, value)| {
                        let key = key.as_str().ok_or_else(|| {
                            PipelineError::Invalid("condition fields must be strings".to_string())
                        })?;
                        parse_item(key, value).map_err(|e| PipelineError::Invalid(e.to_string()))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Transformation::AddCondition {
                    conditions,
                    negated: fields.flag("negated"),
                }
            }
            "change_logsource" => Transformation::ChangeLogsource {
                category: fields.optional("category"),
                product: fields.optional("product"),
                service: fields.optional("service"),
            },
            "replace_string" => Transformation::ReplaceString {
                regex: Regex::new(fields.required("regex")?)?,
                replacement: fields.optional("replacement").unwrap_or_default(),
            },
            "value_placeholders" => Transformation::ValuePlaceholders,
            "wildcard_placeholders" => Transformation::WildcardPlaceholders,
            "set_state" => Transformation::SetState {
                key: fields.required("key")?.to_string(),
                value: fields.json("val")?,
            },
            "rule_failure" => Transformation::RuleFailure {
                message: fields.required("message")?.to_string(),
            },
            "detection_item_failure" => Transformation::DetectionItemFailure {
                message: fields.required("message")?.to_string(),
            },
            other => return Err(PipelineError::UnknownTransformation(other.to_string())),
        };
        Ok(transformation)
    }

    pub(crate) fn apply(
        &self,
        rule: &mut SigmaRule,
        state: &mut PipelineState,
        item: &ProcessingItem,
    ) -> Outcome {
        match self {
            Transformation::FieldNameMapping { mapping } => {
                Outcome::applied(edit_items(rule, item, |di| {
                    let Some(targets) = di.field.name.as_deref().and_then(|n| mapping.get(n))
                    else {
                        return ItemEdit::Unchanged;
                    };
                    match targets.as_slice() {
                        [] => ItemEdit::Unchanged,
                        [single] => {
                            di.field.name = Some(single.clone());
                            ItemEdit::Changed
                        }
                        many => ItemEdit::Replace(Detection::AnyOf(
                            many.iter()
                                .map(|target| {
                                    let mut alternative = di.clone();
                                    alternative.field.name = Some(target.clone());
                                    Detection::Item(alternative)
                                })
                                .collect(),
                        )),
                    }
                }))
            }
            Transformation::FieldNamePrefixMapping { mapping } => {
                Outcome::applied(edit_items(rule, item, |di| {
                    let Some(name) = di.field.name.as_deref() else {
                        return ItemEdit::Unchanged;
                    };
                    let longest = mapping
                        .iter()
                        .filter(|(prefix, _)| name.starts_with(prefix.as_str()))
                        .max_by_key(|(prefix, _)| prefix.len());
                    match longest {
                        Some((prefix, replacement)) => {
                            let renamed = format!("{replacement}{}", &name[prefix.len()..]);
                            di.field.name = Some(renamed);
                            ItemEdit::Changed
                        }
                        None => ItemEdit::Unchanged,
                    }
                }))
            }
            Transformation::FieldNamePrefix { prefix } => {
                Outcome::applied(rename_fields(rule, item, |name| format!("{prefix}{name}")))
            }
            Transformation::FieldNameSuffix { suffix } => {
                Outcome::applied(rename_fields(rule, item, |name| format!("{name}{suffix}")))
            }
            Transformation::DropDetectionItem => {
                Outcome::applied(edit_items(rule, item, |_| ItemEdit::Drop))
            }
            Transformation::AddCondition {
                conditions,
                negated,
            } => {
                let mut n = 1;
                while rule.detection.contains(&format!("_cond{n}")) {
                    n += 1;
                }
                let name = format!("_cond{n}");
                rule.detection.insert(
                    name.clone(),
                    Detection::AllOf(conditions.iter().cloned().map(Detection::Item).collect()),
                );

                let mut reference = ConditionExpr::Identifier(name);
                if *negated {
                    reference = ConditionExpr::Not(Box::new(reference));
                }
                for condition in rule.detection.conditions.iter_mut() {
                    *condition = ConditionExpr::and(reference.clone(), condition.clone());
                }
                Outcome::applied(true)
            }
            Transformation::ChangeLogsource {
                category,
                product,
                service,
            } => {
                rule.logsource = LogSource {
                    category: category.clone(),
                    product: product.clone(),
                    service: service.clone(),
                    definition: rule.logsource.definition.take(),
                };
                Outcome::applied(true)
            }
            Transformation::ReplaceString { regex, replacement } => {
                Outcome::applied(edit_items(rule, item, |di| {
                    let mut changed = false;
                    for value in di.values.iter_mut() {
                        if let SigmaValue::String(s) = value {
                            let before = s.clone();
                            s.map_plain(|plain| {
                                regex.replace_all(plain, replacement.as_str()).into_owned()
                            });
                            changed |= *s != before;
                        }
                    }
                    if changed {
                        ItemEdit::Changed
                    } else {
                        ItemEdit::Unchanged
                    }
                }))
            }
            Transformation::ValuePlaceholders => {
                let vars = &*state;
                Outcome::applied(edit_items(rule, item, |di| {
                    let mut changed = false;
                    let mut values = Vec::with_capacity(di.values.len());
                    for value in di.values.drain(..) {
                        let expanded = match &value {
                            SigmaValue::String(s) if s.has_placeholders() => {
                                expand_placeholders(s, vars)
                            }
                            _ => None,
                        };
                        match expanded {
                            Some(expanded) => {
                                changed = true;
                                values.extend(expanded.into_iter().map(SigmaValue::String));
                            }
                            None => values.push(value),
                        }
                    }
                    di.values = values;
                    if changed {
                        ItemEdit::Changed
                    } else {
                        ItemEdit::Unchanged
                    }
                }))
            }
            Transformation::WildcardPlaceholders => {
                Outcome::applied(edit_items(rule, item, |di| {
                    let mut changed = false;
                    for value in di.values.iter_mut() {
                        if let SigmaValue::String(s) = value {
                            for part in s.parts.iter_mut() {
                                if matches!(part, StringPart::Placeholder(_)) {
                                    *part = StringPart::Special(SpecialChar::WildcardMulti);
                                    changed = true;
                                }
                            }
                        }
                    }
                    if changed {
                        ItemEdit::Changed
                    } else {
                        ItemEdit::Unchanged
                    }
                }))
            }
            Transformation::SetState { key, value } => {
                state.set(key.clone(), value.clone());
                Outcome::applied(true)
            }
            Transformation::RuleFailure { message } => Outcome {
                applied: true,
                failure: Some(message.clone()),
            },
            Transformation::DetectionItemFailure { message } => {
                let applied = edit_items(rule, item, |_| ItemEdit::Changed);
                Outcome {
                    applied,
                    failure: applied.then(|| message.clone()),
                }
            }
        }
    }
}

fn name_mapping(value: Option<&Value>) -> Result<BTreeMap<String, Vec<String>>> {
    let Some(Value::Mapping(map)) = value else {
        return Err(PipelineError::Invalid(
            "transformation requires a 'mapping' mapping".to_string(),
        ));
    };
    let mut mapping = BTreeMap::new();
    for (from, to) in map {
        let from = from
            .as_str()
            .ok_or_else(|| PipelineError::Invalid("mapping keys must be strings".to_string()))?;
        let targets = super::yaml_strings(to);
        if targets.is_empty() {
            return Err(PipelineError::Invalid(format!(
                "mapping of '{from}' has no target"
            )));
        }
        mapping.insert(from.to_string(), targets);
    }
    Ok(mapping)
}

fn rename_fields(
    rule: &mut SigmaRule,
    item: &ProcessingItem,
    rename: impl Fn(&str) -> String,
) -> bool {
    edit_items(rule, item, |di| match di.field.name.as_deref() {
        Some(name) => {
            di.field.name = Some(rename(name));
            ItemEdit::Changed
        }
        None => ItemEdit::Unchanged,
    })
}

/// Run `f` on every detection item selected by `item`, recording the item id
/// on the detection items it changed. Returns whether anything changed.
fn edit_items(
    rule: &mut SigmaRule,
    item: &ProcessingItem,
    mut f: impl FnMut(&mut DetectionItem) -> ItemEdit,
) -> bool {
    let mut applied = false;
    let mut visit = |di: &mut DetectionItem| {
        if !item.selects(di) {
            return ItemEdit::Unchanged;
        }
        // Marked before the edit so replacement items inherit the id.
        if let Some(id) = &item.id {
            di.applied_items.push(id.clone());
        }
        let edit = f(di);
        match edit {
            ItemEdit::Unchanged => {
                if item.id.is_some() {
                    di.applied_items.pop();
                }
            }
            _ => applied = true,
        }
        edit
    };

    for (_, detection) in rule.detection.named.iter_mut() {
        walk(detection, &mut visit);
    }
    applied
}

fn walk(detection: &mut Detection, visit: &mut impl FnMut(&mut DetectionItem) -> ItemEdit) {
    let edit = match detection {
        Detection::Item(di) => visit(di),
        Detection::AllOf(children) | Detection::AnyOf(children) => {
            let mut kept = Vec::with_capacity(children.len());
            for mut child in std::mem::take(children) {
                let edit = match &mut child {
                    Detection::Item(di) => Some(visit(di)),
                    _ => None,
                };
                match edit {
                    Some(ItemEdit::Replace(replacement)) => kept.push(replacement),
                    Some(ItemEdit::Drop) => {}
                    Some(_) => kept.push(child),
                    None => {
                        walk(&mut child, visit);
                        kept.push(child);
                    }
                }
            }
            *children = kept;
            ItemEdit::Unchanged
        }
    };

    match edit {
        ItemEdit::Replace(replacement) => *detection = replacement,
        ItemEdit::Drop => *detection = Detection::AllOf(Vec::new()),
        ItemEdit::Unchanged | ItemEdit::Changed => {}
    }
}

/// Expand the placeholders of `s` into one string per combination of variable
/// values. Returns `None` when no placeholder has a defined variable.
fn expand_placeholders(s: &SigmaString, state: &PipelineState) -> Option<Vec<SigmaString>> {
    let mut variants: Vec<Vec<StringPart>> = vec![Vec::new()];
    let mut resolved = false;

    for part in &s.parts {
        let values = match part {
            StringPart::Placeholder(name) => state.var(name).filter(|v| !v.is_empty()),
            _ => None,
        };
        match values {
            Some(values) => {
                resolved = true;
                variants = variants
                    .iter()
                    .flat_map(|prefix| {
                        values.iter().map(move |value| {
                            let mut parts = prefix.clone();
                            parts.extend(SigmaString::new(value).parts);
                            parts
                        })
                    })
                    .collect();
            }
            None => {
                for variant in variants.iter_mut() {
                    variant.push(part.clone());
                }
            }
        }
    }

    resolved.then(|| {
        variants
            .into_iter()
            .map(|parts| SigmaString {
                parts: merge_plain(parts),
            })
            .collect()
    })
}

fn merge_plain(parts: Vec<StringPart>) -> Vec<StringPart> {
    let mut merged: Vec<StringPart> = Vec::with_capacity(parts.len());
    for part in parts {
        match (merged.last_mut(), part) {
            (Some(StringPart::Plain(last)), StringPart::Plain(text)) => last.push_str(&text),
            (_, part) => merged.push(part),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ProcessingPipeline;
    use crate::rule::SigmaCollection;

    const RULE: &str = r#"
title: Test
logsource:
    category: process_creation
    product: windows
detection:
    selection:
        EventID: 1
        Image|endswith: '\cmd.exe'
        User|expand: '%admins%'
    condition: selection
"#;

    fn rule() -> SigmaRule {
        SigmaCollection::from_yaml(RULE).unwrap().rules.remove(0)
    }

    fn apply(pipeline: &str) -> crate::pipeline::ProcessedRule {
        ProcessingPipeline::from_yaml(pipeline).unwrap().apply(&rule())
    }

    fn selection(rule: &SigmaRule) -> &Vec<Detection> {
        match rule.detection.get("selection") {
            Some(Detection::AllOf(children)) => children,
            other => panic!("Expected AllOf, got {other:?}"),
        }
    }

    fn item(detection: &Detection) -> &DetectionItem {
        match detection {
            Detection::Item(item) => item,
            other => panic!("Expected item, got {other:?}"),
        }
    }

    #[test]
    fn test_one_to_many_mapping_becomes_alternatives() {
        let processed = apply(
            r#"
transformations:
  - id: map
    type: field_name_mapping
    mapping:
      Image: [process.executable, process.name]
"#,
        );
        let children = selection(&processed.rule);
        match &children[1] {
            Detection::AnyOf(alternatives) => {
                assert_eq!(alternatives.len(), 2);
                let second = item(&alternatives[1]);
                assert_eq!(second.field.name.as_deref(), Some("process.name"));
                assert_eq!(second.applied_items, vec!["map".to_string()]);
            }
            other => panic!("Expected AnyOf, got {other:?}"),
        }
        assert!(item(&children[0]).applied_items.is_empty());
    }

    #[test]
    fn test_prefix_mapping_uses_longest_prefix() {
        let processed = apply(
            r#"
transformations:
  - type: field_name_prefix_mapping
    mapping:
      I: x.
      Ima: image.
"#,
        );
        assert_eq!(
            item(&selection(&processed.rule)[1]).field.name.as_deref(),
            Some("image.ge")
        );
    }

    #[test]
    fn test_drop_detection_item() {
        let processed = apply(
            r#"
transformations:
  - type: drop_detection_item
    field_name_conditions:
      - type: include_fields
        fields: [EventID]
"#,
        );
        let children = selection(&processed.rule);
        assert_eq!(children.len(), 2);
        assert_eq!(item(&children[0]).field.name.as_deref(), Some("Image"));
    }

    #[test]
    fn test_add_condition() {
        let processed = apply(
            r#"
transformations:
  - type: add_condition
    conditions:
      source: 'WinEventLog:Security'
  - type: add_condition
    negated: true
    conditions:
      Hidden: true
"#,
        );
        assert!(processed.rule.detection.contains("_cond1"));
        assert!(processed.rule.detection.contains("_cond2"));
        assert_eq!(
            processed.rule.detection.conditions[0].to_string(),
            "(not _cond2 and (_cond1 and selection))"
        );
    }

    #[test]
    fn test_change_logsource_and_state() {
        let processed = apply(
            r#"
transformations:
  - type: change_logsource
    product: windows
    service: sysmon
  - type: set_state
    key: index
    val: sysmon-*
"#,
        );
        assert_eq!(processed.rule.logsource.service.as_deref(), Some("sysmon"));
        assert_eq!(processed.rule.logsource.category, None);
        assert_eq!(
            processed.state.get("index"),
            Some(&serde_json::json!("sysmon-*"))
        );
    }

    #[test]
    fn test_replace_string() {
        let processed = apply(
            r#"
transformations:
  - type: replace_string
    regex: '^\\'
    replacement: '/'
"#,
        );
        let image = item(&selection(&processed.rule)[1]);
        assert_eq!(image.values[0].to_string(), "/cmd.exe");
    }

    #[test]
    fn test_value_placeholders_expand_to_alternatives() {
        let processed = apply(
            r#"
vars:
  admins: [root, 'adm*']
transformations:
  - type: value_placeholders
"#,
        );
        let user = item(&selection(&processed.rule)[2]);
        assert_eq!(user.values.len(), 2);
        assert_eq!(user.values[0].to_string(), "root");
        assert!(user.values[1].as_sigma_string().unwrap().contains_wildcards());
    }

    #[test]
    fn test_unknown_placeholder_is_kept() {
        let processed = apply("transformations:\n  - type: value_placeholders\n");
        let user = item(&selection(&processed.rule)[2]);
        assert!(user.values[0].as_sigma_string().unwrap().has_placeholders());
    }

    #[test]
    fn test_wildcard_placeholders() {
        let processed = apply("transformations:\n  - type: wildcard_placeholders\n");
        let user = item(&selection(&processed.rule)[2]);
        assert_eq!(user.values[0].to_string(), "*");
    }

    #[test]
    fn test_detection_item_failure_only_fires_on_selected_items() {
        let failing = apply(
            r#"
transformations:
  - type: detection_item_failure
    message: "User is not available"
    field_name_conditions:
      - type: include_fields
        fields: [User]
"#,
        );
        assert_eq!(failing.failure.as_deref(), Some("User is not available"));

        let passing = apply(
            r#"
transformations:
  - type: detection_item_failure
    message: "Hashes are not available"
    field_name_conditions:
      - type: include_fields
        fields: [Hashes]
"#,
        );
        assert!(passing.failure.is_none());
    }

    #[test]
    fn test_processing_item_applied_detection_condition() {
        let processed = apply(
            r#"
transformations:
  - id: ecs
    type: field_name_mapping
    mapping:
      Image: process.executable
  - type: field_name_suffix
    suffix: ".keyword"
    detection_item_conditions:
      - type: processing_item_applied
        processing_item_id: ecs
"#,
        );
        let children = selection(&processed.rule);
        assert_eq!(
            item(&children[1]).field.name.as_deref(),
            Some("process.executable.keyword")
        );
        assert_eq!(item(&children[0]).field.name.as_deref(), Some("EventID"));
    }
}
