//! Parsing of multi-document SIGMA YAML streams.
//!
//! A stream is split at `---` separator lines. Every document is parsed on its
//! own so that a failure can be reported with the text of the document that
//! caused it. Collection actions (`global`, `reset`, `repeat`) are applied
//! before a document is classified as rule, correlation or filter. Filters are
//! merged into the rules they reference once the whole stream has been read.

use serde_yaml::{Mapping, Value};

use crate::config::LimitsConfig;
use crate::error::RuleError;

use super::condition::{parse_condition, ConditionExpr};
use super::value::{SigmaString, SigmaValue, Timespan};
use super::{
    ConditionOperator, CorrelationCondition, CorrelationRule, CorrelationType, Detection,
    DetectionItem, Detections, FieldSpec, FilterRule, Level, LogSource, Modifier, RuleSource,
    SigmaCollection, SigmaRule,
};

type Result<T> = std::result::Result<T, RuleError>;

/// Separator inserted between a filter document and a rule document.
pub const DOCUMENT_SEPARATOR: &str = "\n---\n";

/// Prepend a filter document to a rule document so both parse as one stream.
///
/// # Examples
///
/// ```rust
/// use sigma_convert::rule::merge_filter;
///
/// assert_eq!(merge_filter("a: 1", "b: 2"), "a: 1\n---\nb: 2");
/// ```
pub fn merge_filter(filter: &str, rule: &str) -> String {
    format!("{filter}{DOCUMENT_SEPARATOR}{rule}")
}

impl SigmaCollection {
    /// Parse a YAML stream with the default input limits.
    ///
    /// # Errors
    /// Returns an error if:
    /// - A document is not valid YAML or not a mapping
    /// - A required field is missing or a detection is malformed
    /// - The stream contains neither rules nor correlation rules
    pub fn from_yaml(text: &str) -> Result<Self> {
        Self::from_yaml_with_limits(text, &LimitsConfig::default())
    }

    /// Parse a YAML stream, rejecting inputs beyond the given limits.
    pub fn from_yaml_with_limits(text: &str, limits: &LimitsConfig) -> Result<Self> {
        if text.len() > limits.max_input_bytes {
            return Err(RuleError::TooLarge {
                size: text.len(),
                limit: limits.max_input_bytes,
            });
        }

        let documents = split_documents(text);
        if documents.len() > limits.max_documents {
            return Err(RuleError::TooManyDocuments {
                count: documents.len(),
                limit: limits.max_documents,
            });
        }

        let mut collection = SigmaCollection::new();
        let mut global: Option<Value> = None;
        let mut previous: Option<Value> = None;

        for (position, fragment) in documents.iter().enumerate() {
            let index = position + 1;
            let wrap = |e: RuleError| e.in_document(index, fragment);

            let value: Value = serde_yaml::from_str(fragment).map_err(|e| wrap(e.into()))?;
            let map = match value {
                Value::Null => continue,
                Value::Mapping(map) => map,
                _ => return Err(wrap(RuleError::NotAMapping)),
            };

            let Some(document) = apply_action(map, &mut global, &previous).map_err(wrap)? else {
                continue;
            };

            classify(&document, index, fragment, &mut collection).map_err(wrap)?;
            previous = Some(document);
        }

        if collection.is_empty() {
            return Err(RuleError::EmptyCollection);
        }

        apply_filters(&mut collection);
        Ok(collection)
    }
}

/// Split a stream into the texts of its non-blank documents.
///
/// A line consisting of `---` starts a new document; text following `--- ` on
/// the same line belongs to the new document.
pub(crate) fn split_documents(text: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        let trimmed = line.trim_end();
        if trimmed == "---" {
            documents.push(std::mem::take(&mut current));
        } else if let Some(rest) = trimmed.strip_prefix("--- ") {
            documents.push(std::mem::take(&mut current));
            current.push_str(rest);
            current.push('\n');
        } else if trimmed == "..." {
            continue;
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    documents.push(current);

    documents
        .into_iter()
        .filter(|doc| doc.lines().any(|l| !l.trim().is_empty()))
        .collect()
}

/// Resolve the collection action of a document.
///
/// Returns the effective document, or `None` when the document only changes
/// the global template.
fn apply_action(
    mut map: Mapping,
    global: &mut Option<Value>,
    previous: &Option<Value>,
) -> Result<Option<Value>> {
    let action = map.remove("action");
    let body = Value::Mapping(map);

    match action.as_ref().map(|a| a.as_str()) {
        None => Ok(Some(match global {
            Some(template) => deep_merge(template, &body),
            None => body,
        })),
        Some(Some("global")) => {
            *global = Some(body);
            Ok(None)
        }
        Some(Some("reset")) => {
            *global = None;
            Ok(None)
        }
        Some(Some("repeat")) => match previous {
            Some(base) => Ok(Some(deep_merge(base, &body))),
            None => Err(RuleError::InvalidAction(
                "repeat without a preceding document".to_string(),
            )),
        },
        Some(Some(other)) => Err(RuleError::InvalidAction(other.to_string())),
        Some(None) => Err(RuleError::InvalidAction("<non-string>".to_string())),
    }
}

/// Merge `overlay` into `base`; nested mappings merge recursively and any other
/// overlay value replaces the base value.
pub(crate) fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                let next = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Mapping(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

fn classify(
    document: &Value,
    index: usize,
    fragment: &str,
    collection: &mut SigmaCollection,
) -> Result<()> {
    let title = required_str(document, "title")?;
    let source = RuleSource::new(
        index,
        title.to_string(),
        optional_str(document, "id"),
        fragment.to_string(),
    );

    if document.get("correlation").is_some() {
        collection.correlations.push(parse_correlation(document, source)?);
    } else if document.get("filter").is_some() {
        collection.filters.push(parse_filter(document, source)?);
    } else {
        collection.rules.push(parse_rule(document, source)?);
    }
    Ok(())
}

fn parse_rule(doc: &Value, source: RuleSource) -> Result<SigmaRule> {
    let logsource = doc
        .get("logsource")
        .ok_or_else(|| RuleError::MissingField("logsource".to_string()))?;
    let detection = doc
        .get("detection")
        .ok_or_else(|| RuleError::MissingField("detection".to_string()))?;

    Ok(SigmaRule {
        title: source.title.clone(),
        id: source.id.clone(),
        name: optional_str(doc, "name"),
        status: optional_str(doc, "status"),
        level: optional_str(doc, "level").and_then(|l| Level::from_name(&l)),
        description: optional_str(doc, "description"),
        author: optional_str(doc, "author"),
        date: optional_str(doc, "date"),
        modified: optional_str(doc, "modified"),
        tags: string_list(doc, "tags"),
        references: string_list(doc, "references"),
        falsepositives: string_list(doc, "falsepositives"),
        fields: string_list(doc, "fields"),
        logsource: parse_logsource(logsource)?,
        detection: parse_detections(detection, "detection")?,
        source,
    })
}

fn parse_logsource(value: &Value) -> Result<LogSource> {
    if !value.is_mapping() {
        return Err(RuleError::InvalidDetection(
            "logsource must be a mapping".to_string(),
        ));
    }
    Ok(LogSource {
        category: optional_str(value, "category"),
        product: optional_str(value, "product"),
        service: optional_str(value, "service"),
        definition: optional_str(value, "definition"),
    })
}

/// Parse a detection section: named detections plus `condition` and
/// `timeframe`.
fn parse_detections(value: &Value, section: &str) -> Result<Detections> {
    let Value::Mapping(map) = value else {
        return Err(RuleError::InvalidDetection(format!(
            "{section} must be a mapping"
        )));
    };

    let mut detections = Detections::default();
    let mut raw_conditions = Vec::new();

    for (key, value) in map {
        let Some(name) = key.as_str() else {
            return Err(RuleError::InvalidDetection(format!(
                "non-string key in {section}"
            )));
        };
        match name {
            "condition" => match value {
                Value::String(s) => raw_conditions.push(s.clone()),
                Value::Sequence(seq) => {
                    for item in seq {
                        let s = item.as_str().ok_or_else(|| {
                            RuleError::Condition("condition must be a string".to_string())
                        })?;
                        raw_conditions.push(s.to_string());
                    }
                }
                _ => return Err(RuleError::Condition("condition must be a string".to_string())),
            },
            "timeframe" => detections.timeframe = value.as_str().map(str::to_string),
            // Filter documents list their targets next to the detections.
            "rules" if section == "filter" => {}
            _ => {
                let detection = parse_detection(value)
                    .map_err(|e| prefix_detection_error(e, name))?;
                detections.insert(name.to_string(), detection);
            }
        }
    }

    if raw_conditions.is_empty() {
        return Err(RuleError::MissingField(format!("{section}.condition")));
    }

    for raw in &raw_conditions {
        let condition = parse_condition(raw)?;
        for identifier in condition.identifiers() {
            if !detections.contains(identifier) {
                return Err(RuleError::Condition(format!(
                    "condition references unknown detection '{identifier}'"
                )));
            }
        }
        detections.conditions.push(condition);
    }

    Ok(detections)
}

fn prefix_detection_error(err: RuleError, name: &str) -> RuleError {
    match err {
        RuleError::InvalidDetection(msg) => {
            RuleError::InvalidDetection(format!("'{name}': {msg}"))
        }
        other => other,
    }
}

fn parse_detection(value: &Value) -> Result<Detection> {
    match value {
        Value::Mapping(map) => {
            let mut items = Vec::with_capacity(map.len());
            for (key, values) in map {
                let key = key.as_str().ok_or_else(|| {
                    RuleError::InvalidDetection("field names must be strings".to_string())
                })?;
                items.push(Detection::Item(parse_item(key, values)?));
            }
            Ok(Detection::AllOf(items))
        }
        Value::Sequence(seq) if seq.is_empty() => Err(RuleError::InvalidDetection(
            "empty detection list".to_string(),
        )),
        Value::Sequence(seq) if seq.iter().all(Value::is_mapping) => seq
            .iter()
            .map(parse_detection)
            .collect::<Result<Vec<_>>>()
            .map(Detection::AnyOf),
        Value::Sequence(seq) if seq.iter().any(|v| v.is_mapping() || v.is_sequence()) => Err(
            RuleError::InvalidDetection("mixed keyword and field lists".to_string()),
        ),
        Value::Sequence(_) | Value::String(_) | Value::Number(_) | Value::Bool(_) => {
            Ok(Detection::Item(parse_item("", value)?))
        }
        _ => Err(RuleError::InvalidDetection(
            "unsupported detection value".to_string(),
        )),
    }
}

/// Parse `Field|mod1|mod2: values` into a detection item. An empty field name
/// denotes a keyword item.
pub(crate) fn parse_item(key: &str, value: &Value) -> Result<DetectionItem> {
    let mut parts = key.split('|');
    let name = parts
        .next()
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    let modifiers = parts
        .map(|m| Modifier::from_name(m).ok_or_else(|| RuleError::UnknownModifier(m.to_string())))
        .collect::<Result<Vec<_>>>()?;
    let field = FieldSpec::new(name, modifiers);

    let raw_values: Vec<&Value> = match value {
        Value::Sequence(seq) if seq.is_empty() => {
            return Err(RuleError::InvalidDetection(format!(
                "empty value list for '{key}'"
            )))
        }
        Value::Sequence(seq) => seq.iter().collect(),
        other => vec![other],
    };

    let values = raw_values
        .into_iter()
        .map(|v| parse_value(&field, v))
        .collect::<Result<Vec<_>>>()?;

    if field.has_modifier(Modifier::Exists)
        && !values.iter().all(|v| matches!(v, SigmaValue::Bool(_)))
    {
        return Err(RuleError::InvalidDetection(format!(
            "'exists' expects a boolean value for '{key}'"
        )));
    }

    Ok(DetectionItem::new(field, values))
}

fn parse_value(field: &FieldSpec, value: &Value) -> Result<SigmaValue> {
    match value {
        Value::Mapping(_) | Value::Sequence(_) => Err(RuleError::InvalidDetection(
            "nested values are not allowed".to_string(),
        )),
        Value::String(s) if field.has_modifier(Modifier::Re) => {
            Ok(SigmaValue::String(SigmaString::from_raw(s)))
        }
        Value::String(s) if field.has_modifier(Modifier::Expand) => {
            Ok(SigmaValue::String(SigmaString::with_placeholders(s)))
        }
        other => Ok(SigmaValue::from_yaml(other)),
    }
}

fn parse_correlation(doc: &Value, source: RuleSource) -> Result<CorrelationRule> {
    let correlation = doc
        .get("correlation")
        .filter(|c| c.is_mapping())
        .ok_or_else(|| RuleError::InvalidCorrelation("correlation must be a mapping".to_string()))?;

    let type_name = required_str(correlation, "type")?;
    let correlation_type = CorrelationType::from_name(type_name).ok_or_else(|| {
        RuleError::InvalidCorrelation(format!("unknown correlation type '{type_name}'"))
    })?;

    let rules = string_list(correlation, "rules");
    if rules.is_empty() {
        return Err(RuleError::InvalidCorrelation(
            "no referenced rules".to_string(),
        ));
    }

    let timespan = optional_str(correlation, "timespan")
        .or_else(|| optional_str(correlation, "timeframe"))
        .ok_or_else(|| RuleError::MissingField("correlation.timespan".to_string()))?;
    let timespan = Timespan::parse(&timespan)?;

    let condition = match correlation.get("condition") {
        Some(value) => parse_correlation_condition(value)?,
        None if correlation_type == CorrelationType::Temporal => CorrelationCondition {
            op: ConditionOperator::Gte,
            count: rules.len() as u64,
            field: None,
        },
        None => return Err(RuleError::MissingField("correlation.condition".to_string())),
    };

    if correlation_type == CorrelationType::ValueCount && condition.field.is_none() {
        return Err(RuleError::InvalidCorrelation(
            "value_count requires a condition field".to_string(),
        ));
    }

    Ok(CorrelationRule {
        title: source.title.clone(),
        id: source.id.clone(),
        name: optional_str(doc, "name"),
        level: optional_str(doc, "level").and_then(|l| Level::from_name(&l)),
        tags: string_list(doc, "tags"),
        correlation_type,
        rules,
        group_by: string_list(correlation, "group-by"),
        timespan,
        condition,
        generate: correlation
            .get("generate")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        source,
    })
}

fn parse_correlation_condition(value: &Value) -> Result<CorrelationCondition> {
    let Value::Mapping(map) = value else {
        return Err(RuleError::InvalidCorrelation(
            "condition must be a mapping".to_string(),
        ));
    };

    let mut threshold = None;
    let mut field = None;
    for (key, value) in map {
        let key = key.as_str().unwrap_or_default();
        if key == "field" {
            field = value.as_str().map(str::to_string);
            continue;
        }
        let op = ConditionOperator::from_name(key).ok_or_else(|| {
            RuleError::InvalidCorrelation(format!("unknown condition operator '{key}'"))
        })?;
        let count = value.as_u64().ok_or_else(|| {
            RuleError::InvalidCorrelation(format!("'{key}' expects a non-negative integer"))
        })?;
        if threshold.replace((op, count)).is_some() {
            return Err(RuleError::InvalidCorrelation(
                "condition has more than one operator".to_string(),
            ));
        }
    }

    let (op, count) = threshold.ok_or_else(|| {
        RuleError::InvalidCorrelation("condition has no operator".to_string())
    })?;
    Ok(CorrelationCondition { op, count, field })
}

fn parse_filter(doc: &Value, source: RuleSource) -> Result<FilterRule> {
    let filter = doc
        .get("filter")
        .ok_or_else(|| RuleError::MissingField("filter".to_string()))?;

    let rules = string_list(filter, "rules");
    if rules.is_empty() {
        return Err(RuleError::MissingField("filter.rules".to_string()));
    }

    let logsource = doc.get("logsource").map(parse_logsource).transpose()?;

    Ok(FilterRule {
        title: source.title.clone(),
        id: source.id.clone(),
        logsource,
        rules,
        detection: parse_detections(filter, "filter")?,
        source,
    })
}

/// Merge every filter into the rules it references.
///
/// The detections of the n-th filter are renamed with the prefix `_filter{n}_`
/// and every condition `c` of a matched rule becomes `c and <filter condition>`.
pub(crate) fn apply_filters(collection: &mut SigmaCollection) {
    for (position, filter) in collection.filters.iter().enumerate() {
        let prefix = format!("_filter{}_", position + 1);
        let rename = |name: &str| format!("{prefix}{name}");

        let Some(filter_condition) = combined_condition(&filter.detection.conditions, &rename)
        else {
            continue;
        };

        for rule in collection.rules.iter_mut() {
            let referenced = filter.rules.iter().any(|r| rule.is_referenced_by(r));
            let logsource_matches = filter
                .logsource
                .as_ref()
                .map_or(true, |ls| logsource_covers(ls, &rule.logsource));
            if !referenced || !logsource_matches {
                continue;
            }

            for (name, detection) in &filter.detection.named {
                rule.detection.insert(rename(name), detection.clone());
            }
            for condition in rule.detection.conditions.iter_mut() {
                *condition = ConditionExpr::and(condition.clone(), filter_condition.clone());
            }
        }
    }
}

fn combined_condition(
    conditions: &[ConditionExpr],
    rename: &impl Fn(&str) -> String,
) -> Option<ConditionExpr> {
    conditions
        .iter()
        .cloned()
        .map(|mut c| {
            c.rename(rename);
            c
        })
        .reduce(|acc, c| ConditionExpr::Or(Box::new(acc), Box::new(c)))
}

/// Check that every log source attribute set on the filter is equal on the rule.
fn logsource_covers(filter: &LogSource, rule: &LogSource) -> bool {
    let same = |f: &Option<String>, r: &Option<String>| f.is_none() || f == r;
    same(&filter.category, &rule.category)
        && same(&filter.product, &rule.product)
        && same(&filter.service, &rule.service)
}

fn required_str<'a>(doc: &'a Value, key: &str) -> Result<&'a str> {
    doc.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RuleError::MissingField(key.to_string()))
}

fn optional_str(doc: &Value, key: &str) -> Option<String> {
    match doc.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_list(doc: &Value, key: &str) -> Vec<String> {
    match doc.get(key) {
        Some(Value::Sequence(seq)) => seq
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}
