//! Conditions gating processing items.
//!
//! Rule conditions decide whether an item runs for a rule at all. Detection
//! item conditions and field name conditions then select the detection items
//! an item-level transformation touches.

use regex::Regex;
use serde_yaml::Mapping;

use crate::error::PipelineError;
use crate::rule::{DetectionItem, SigmaRule};

use super::state::PipelineState;
use super::YamlFields;

type Result<T> = std::result::Result<T, PipelineError>;

/// Condition evaluated against a whole rule.
#[derive(Debug, Clone)]
pub enum RuleCondition {
    Logsource {
        category: Option<String>,
        product: Option<String>,
        service: Option<String>,
    },
    ContainsDetectionItem {
        field: String,
        value: Option<String>,
    },
    ProcessingItemApplied {
        id: String,
    },
    ProcessingState {
        key: String,
        value: serde_json::Value,
    },
    Tag {
        tag: String,
    },
}

impl RuleCondition {
    pub(crate) fn from_yaml(map: &Mapping) -> Result<Self> {
        let fields = YamlFields::new(map);
        match fields.required("type")? {
            "logsource" => Ok(RuleCondition::Logsource {
                category: fields.optional("category"),
                product: fields.optional("product"),
                service: fields.optional("service"),
            }),
            "contains_detection_item" => Ok(RuleCondition::ContainsDetectionItem {
                field: fields.required("field")?.to_string(),
                value: fields.optional("value"),
            }),
            "processing_item_applied" => Ok(RuleCondition::ProcessingItemApplied {
                id: fields.required("processing_item_id")?.to_string(),
            }),
            "processing_state" => Ok(RuleCondition::ProcessingState {
                key: fields.required("key")?.to_string(),
                value: fields.json("val")?,
            }),
            "tag" => Ok(RuleCondition::Tag {
                tag: fields.required("tag")?.to_string(),
            }),
            other => Err(PipelineError::UnknownCondition(other.to_string())),
        }
    }

    pub fn matches(&self, rule: &SigmaRule, state: &PipelineState) -> bool {
        match self {
            RuleCondition::Logsource {
                category,
                product,
                service,
            } => {
                let same = |want: &Option<String>, have: &Option<String>| {
                    want.is_none() || want == have
                };
                same(category, &rule.logsource.category)
                    && same(product, &rule.logsource.product)
                    && same(service, &rule.logsource.service)
            }
            RuleCondition::ContainsDetectionItem { field, value } => {
                let mut found = false;
                for (_, detection) in &rule.detection.named {
                    detection.for_each_item(&mut |item| {
                        if item.field.name.as_deref() != Some(field.as_str()) {
                            return;
                        }
                        found |= match value {
                            None => true,
                            Some(want) => item.values.iter().any(|v| v.to_plain_string() == *want),
                        };
                    });
                }
                found
            }
            RuleCondition::ProcessingItemApplied { id } => state.was_applied(id),
            RuleCondition::ProcessingState { key, value } => state.get(key) == Some(value),
            RuleCondition::Tag { tag } => rule.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)),
        }
    }
}

/// Condition evaluated against one detection item.
#[derive(Debug, Clone)]
pub enum DetectionItemCondition {
    /// Some string value matches the pattern.
    MatchString { pattern: Regex, negate: bool },
    /// Every value is null.
    IsNull { negate: bool },
    ProcessingItemApplied { id: String },
}

impl DetectionItemCondition {
    pub(crate) fn from_yaml(map: &Mapping) -> Result<Self> {
        let fields = YamlFields::new(map);
        match fields.required("type")? {
            "match_string" => Ok(DetectionItemCondition::MatchString {
                pattern: Regex::new(fields.required("pattern")?)?,
                negate: fields.flag("negate"),
            }),
            "is_null" => Ok(DetectionItemCondition::IsNull {
                negate: fields.flag("negate"),
            }),
            "processing_item_applied" => Ok(DetectionItemCondition::ProcessingItemApplied {
                id: fields.required("processing_item_id")?.to_string(),
            }),
            other => Err(PipelineError::UnknownCondition(other.to_string())),
        }
    }

    pub fn matches(&self, item: &DetectionItem) -> bool {
        match self {
            DetectionItemCondition::MatchString { pattern, negate } => {
                let found = item.values.iter().any(|v| {
                    v.as_sigma_string()
                        .is_some_and(|s| pattern.is_match(&s.to_string()))
                });
                found != *negate
            }
            DetectionItemCondition::IsNull { negate } => {
                let null = item.values.iter().all(|v| v.is_null());
                null != *negate
            }
            DetectionItemCondition::ProcessingItemApplied { id } => {
                item.applied_items.iter().any(|applied| applied == id)
            }
        }
    }
}

/// How field names of a field name condition are compared.
#[derive(Debug, Clone)]
pub enum FieldMatcher {
    Plain(Vec<String>),
    Regex(Vec<Regex>),
}

impl FieldMatcher {
    pub fn is_match(&self, field: &str) -> bool {
        match self {
            FieldMatcher::Plain(names) => names.iter().any(|n| n == field),
            FieldMatcher::Regex(patterns) => patterns.iter().any(|p| p.is_match(field)),
        }
    }
}

/// Condition on the field name of a detection item.
#[derive(Debug, Clone)]
pub enum FieldNameCondition {
    IncludeFields(FieldMatcher),
    ExcludeFields(FieldMatcher),
}

impl FieldNameCondition {
    pub(crate) fn from_yaml(map: &Mapping) -> Result<Self> {
        let fields = YamlFields::new(map);
        let names = fields.list("fields");
        let matcher = match fields.optional("match_type").as_deref() {
            None | Some("plain") => FieldMatcher::Plain(names),
            Some("re") | Some("regex") => FieldMatcher::Regex(
                names
                    .iter()
                    .map(|n| Regex::new(n))
                    .collect::<std::result::Result<Vec<_>, _>>()?,
            ),
            Some(other) => {
                return Err(PipelineError::Invalid(format!(
                    "unknown field match type '{other}'"
                )))
            }
        };

        match fields.required("type")? {
            "include_fields" => Ok(FieldNameCondition::IncludeFields(matcher)),
            "exclude_fields" => Ok(FieldNameCondition::ExcludeFields(matcher)),
            other => Err(PipelineError::UnknownCondition(other.to_string())),
        }
    }

    /// Keyword items have no field name; they are never included and always
    /// pass an exclusion.
    pub fn matches(&self, field: Option<&str>) -> bool {
        match self {
            FieldNameCondition::IncludeFields(matcher) => field.is_some_and(|f| matcher.is_match(f)),
            FieldNameCondition::ExcludeFields(matcher) => !field.is_some_and(|f| matcher.is_match(f)),
        }
    }
}
